//! Both ends of a three-party handoff.
//!
//! The gifter holds a reference imported from the exporter and passes it to
//! a receiver on another session. It deposits the object at the exporter
//! under a random gift ID and sends the receiver a signed handoff-give in
//! place of the reference. The receiver dials the exporter, countersigns
//! the give with a fresh handoff count, and withdraws the gift.

use crate::captp::{RemoteObject, SessionContext};
use crate::descriptors::{HandoffGive, HandoffReceive, SignedGive};
use crate::error::{WireError, WireResult};
use crate::eventual;
use crate::passable::{ObjectRef, Passable};
use crate::promise::Promise;
use crate::session::SessionInfo;
use ocapn_types::Value;
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, warn};

pub const GIFT_ID_LEN: usize = 16;

fn random_gift_id() -> [u8; GIFT_ID_LEN] {
    let mut id = [0u8; GIFT_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Gifter role: deposit `gift` at its exporter and return the give for
/// the peer of `receiver_side`.
pub(crate) fn send_handoff(receiver_side: &SessionInfo, gift: &RemoteObject) -> WireResult<SignedGive> {
    let exporter = gift
        .captp()
        .filter(|captp| !captp.is_disconnected())
        .ok_or_else(|| WireError::Disconnected("gift's session has ended".into()))?;
    let exporter_side = exporter.info();
    let gift_id = random_gift_id();

    let give = HandoffGive {
        receiver_key: receiver_side.peer.public_key.clone(),
        exporter_location: exporter_side.peer.location.clone(),
        exporter_session_id: exporter_side.id.to_vec(),
        gifter_side_id: exporter_side.self_identity.key_id().to_vec(),
        gift_id: gift_id.to_vec(),
    };
    let signed = give.sign(&exporter_side.self_identity.keypair)?;

    debug!(
        exporter = %exporter_side.peer.location,
        receiver = %receiver_side.peer.location,
        gift = %hex::encode(gift_id),
        "OCapN: depositing gift"
    );
    let deposited = eventual::send(
        &exporter.bootstrap(),
        "deposit-gift",
        vec![
            Passable::Data(Value::bytes(gift_id.to_vec())),
            Passable::Object(ObjectRef::Remote(gift.clone())),
        ],
    );
    deposited.when_settled(|settled| {
        if let Err(reason) = settled {
            warn!(?reason, "OCapN: deposit-gift failed");
        }
    });
    Ok(signed)
}

/// Receiver role: a promise for the object described by `signed_give`,
/// received over the session `gifter_side`.
pub(crate) fn receive_handoff(
    gifter_side: Arc<SessionInfo>,
    context: Arc<dyn SessionContext>,
    signed_give: SignedGive,
) -> Promise {
    let (promise, resolver) = Promise::pending();
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        resolver.reject(Passable::error("Handoff needs a running runtime"));
        return promise;
    };
    runtime.spawn(async move {
        match withdraw(&gifter_side, context.as_ref(), signed_give).await {
            Ok(gift) => resolver.resolve(Passable::Promise(gift)),
            Err(e) => {
                warn!(error = %e, "OCapN: handoff failed");
                resolver.reject(Passable::error(e.to_string()));
            }
        }
    });
    promise
}

async fn withdraw(
    gifter_side: &SessionInfo,
    context: &dyn SessionContext,
    signed_give: SignedGive,
) -> WireResult<Promise> {
    let exporter = context
        .provide_session(&signed_give.give.exporter_location)
        .await?;
    let handoff_count = exporter.take_next_handoff_count();
    let receive = HandoffReceive {
        receiving_session: exporter.id().to_vec(),
        receiving_side: exporter.self_identity().key_id().to_vec(),
        handoff_count,
        signed_give,
    };
    let signed = receive.sign(&gifter_side.self_identity.keypair)?;
    debug!(
        exporter = %exporter.peer().location,
        count = handoff_count,
        "OCapN: withdrawing gift"
    );
    Ok(eventual::send(
        &exporter.bootstrap(),
        "withdraw-gift",
        vec![Passable::Data(signed.to_value())],
    ))
}
