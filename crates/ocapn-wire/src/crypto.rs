//! Ed25519 identities, content-addressed key IDs and session IDs.
//!
//! Keys and signatures travel as nested-list descriptors:
//!
//! ```text
//! [public-key [ecc [curve Ed25519] [flags eddsa] [q <32 bytes>]]]
//! [sig-val [eddsa [r <32 bytes>] [s <32 bytes>]]]
//! ```
//!
//! The ID of a key is `SHA256(SHA256(syrup(descriptor)))`. That ID, never the
//! raw point, is what session and handoff logic compares.

use crate::error::{WireError, WireResult};
use crate::location::Location;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use ocapn_types::{encode_syrup, Value};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use subtle::ConstantTimeEq;

/// Length of every key ID and session ID.
pub const ID_LEN: usize = 32;

const SESSION_ID_PREFIX: &[u8] = b"prot0";

fn sha256d(bytes: &[u8]) -> [u8; ID_LEN] {
    let once = Sha256::digest(bytes);
    Sha256::digest(once).into()
}

fn tagged(name: &str, rest: Vec<Value>) -> Value {
    let mut items = Vec::with_capacity(rest.len() + 1);
    items.push(Value::symbol(name));
    items.extend(rest);
    Value::List(items)
}

/// Match `[name ...rest]` and return `rest`.
fn untag<'a>(value: &'a Value, name: &str) -> WireResult<&'a [Value]> {
    match value.as_list() {
        Some([head, rest @ ..]) if head.as_symbol() == Some(name) => Ok(rest),
        _ => Err(WireError::InvalidDescriptor(format!(
            "expected [{name} ...], got {value}"
        ))),
    }
}

fn fixed_bytes<const N: usize>(value: &Value, what: &str) -> WireResult<[u8; N]> {
    value
        .as_bytes()
        .and_then(|b| <[u8; N]>::try_from(b).ok())
        .ok_or_else(|| WireError::InvalidDescriptor(format!("{what} must be {N} bytes")))
}

/// Content-address of a key descriptor.
pub fn public_key_id(descriptor: &Value) -> WireResult<[u8; ID_LEN]> {
    Ok(sha256d(&encode_syrup(descriptor)?))
}

/// Bytewise comparison of two IDs; shorter wins on a common prefix.
pub fn compare_ids(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Constant-time equality for IDs received from peers.
pub fn ids_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Derive the session ID for two key IDs. Argument order does not matter.
pub fn make_session_id(a: &[u8], b: &[u8]) -> [u8; ID_LEN] {
    let (lesser, greater) = match compare_ids(a, b) {
        Ordering::Greater => (b, a),
        _ => (a, b),
    };
    let mut input = Vec::with_capacity(SESSION_ID_PREFIX.len() + lesser.len() + greater.len());
    input.extend_from_slice(SESSION_ID_PREFIX);
    input.extend_from_slice(lesser);
    input.extend_from_slice(greater);
    sha256d(&input)
}

/// A detached Ed25519 signature in its `sig-val` form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    r: [u8; 32],
    s: [u8; 32],
}

impl Signature {
    pub fn to_value(&self) -> Value {
        tagged(
            "sig-val",
            vec![tagged(
                "eddsa",
                vec![
                    tagged("r", vec![Value::bytes(self.r.to_vec())]),
                    tagged("s", vec![Value::bytes(self.s.to_vec())]),
                ],
            )],
        )
    }

    pub fn from_value(value: &Value) -> WireResult<Self> {
        let [scheme] = untag(value, "sig-val")? else {
            return Err(WireError::InvalidDescriptor("sig-val arity".into()));
        };
        let [r, s] = untag(scheme, "eddsa")? else {
            return Err(WireError::InvalidDescriptor("eddsa arity".into()));
        };
        let [r] = untag(r, "r")? else {
            return Err(WireError::InvalidDescriptor("r arity".into()));
        };
        let [s] = untag(s, "s")? else {
            return Err(WireError::InvalidDescriptor("s arity".into()));
        };
        Ok(Self {
            r: fixed_bytes(r, "signature r")?,
            s: fixed_bytes(s, "signature s")?,
        })
    }

    fn to_dalek(self) -> ed25519_dalek::Signature {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        ed25519_dalek::Signature::from_bytes(&bytes)
    }

    fn from_dalek(signature: &ed25519_dalek::Signature) -> Self {
        Self {
            r: *signature.r_bytes(),
            s: *signature.s_bytes(),
        }
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.r[..4]))
    }
}

/// An Ed25519 public key with its descriptor and derived ID.
#[derive(Clone)]
pub struct PublicKey {
    key: VerifyingKey,
    descriptor: Value,
    id: [u8; ID_LEN],
}

impl PublicKey {
    pub fn from_bytes(q: &[u8; 32]) -> WireResult<Self> {
        let key = VerifyingKey::from_bytes(q)
            .map_err(|e| WireError::InvalidDescriptor(format!("bad Ed25519 point: {e}")))?;
        Ok(Self::from_verifying_key(key))
    }

    fn from_verifying_key(key: VerifyingKey) -> Self {
        let descriptor = tagged(
            "public-key",
            vec![tagged(
                "ecc",
                vec![
                    tagged("curve", vec![Value::symbol("Ed25519")]),
                    tagged("flags", vec![Value::symbol("eddsa")]),
                    tagged("q", vec![Value::bytes(key.to_bytes().to_vec())]),
                ],
            )],
        );
        // A descriptor built from atoms always encodes.
        let id = public_key_id(&descriptor).unwrap_or([0u8; ID_LEN]);
        Self {
            key,
            descriptor,
            id,
        }
    }

    /// Parse and validate a `public-key` descriptor.
    pub fn from_descriptor(value: &Value) -> WireResult<Self> {
        let [ecc] = untag(value, "public-key")? else {
            return Err(WireError::InvalidDescriptor("public-key arity".into()));
        };
        let [curve, flags, q] = untag(ecc, "ecc")? else {
            return Err(WireError::InvalidDescriptor("ecc arity".into()));
        };
        match untag(curve, "curve")? {
            [c] if c.as_symbol() == Some("Ed25519") => {}
            _ => return Err(WireError::InvalidDescriptor("unsupported curve".into())),
        }
        match untag(flags, "flags")? {
            [f] if f.as_symbol() == Some("eddsa") => {}
            _ => return Err(WireError::InvalidDescriptor("unsupported flags".into())),
        }
        let [q] = untag(q, "q")? else {
            return Err(WireError::InvalidDescriptor("q arity".into()));
        };
        Self::from_bytes(&fixed_bytes(q, "public key q")?)
    }

    pub fn descriptor(&self) -> &Value {
        &self.descriptor
    }

    pub fn id(&self) -> &[u8; ID_LEN] {
        &self.id
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.key.verify(message, &signature.to_dalek()).is_ok()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.id[..8]))
    }
}

/// An Ed25519 keypair. The private scalar never leaves this struct.
pub struct KeyPair {
    signing: SigningKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = PublicKey::from_verifying_key(signing.verifying_key());
        Self { signing, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_dalek(&self.signing.sign(message))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Sign the canonical encoding of a location.
pub fn sign_location(location: &Location, keypair: &KeyPair) -> WireResult<Signature> {
    Ok(keypair.sign(&encode_syrup(&location.to_value())?))
}

/// Fail unless `signature` is `public_key`'s signature over `location`.
pub fn assert_location_signature_valid(
    location: &Location,
    signature: &Signature,
    public_key: &PublicKey,
) -> WireResult<()> {
    let message = encode_syrup(&location.to_value())?;
    if public_key.verify(&message, signature) {
        Ok(())
    } else {
        Err(WireError::InvalidSignature(format!(
            "Invalid location signature for {}",
            location.id()
        )))
    }
}
