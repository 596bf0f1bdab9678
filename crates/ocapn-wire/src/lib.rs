//! OCapN peer: authenticated sessions, CapTP and three-party handoffs.
//!
//! Connects nodes over TCP, authenticates each connection with a fresh
//! Ed25519 session key, and runs the CapTP remote-reference protocol with
//! promise pipelining on top.
//!
//! ## Architecture
//!
//! - **OcapnNode**: TCP netlayer that listens, dials and owns the sessions
//! - **SessionManager**: at most one session per peer location
//! - **CapTp**: per-session engine with import, export and answer tables
//! - **Bootstrap**: export 0 of every session (`fetch`, `deposit-gift`, `withdraw-gift`)
//! - **Passable / Promise**: values that carry capabilities, and their eventual results

pub mod bootstrap;
pub mod captp;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod descriptors;
pub mod error;
pub mod eventual;
mod handoff;
pub mod handshake;
pub mod location;
pub mod message;
pub mod node;
pub mod passable;
pub mod promise;
pub mod registry;
pub mod session;
pub mod tables;

pub use bootstrap::GiftTable;
pub use captp::{CapTp, Direction, Observed, RemoteObject, SessionContext, SESSION_DISCONNECTED};
pub use config::{load_config, NodeConfig};
pub use crypto::{KeyPair, PublicKey, Signature};
pub use error::{WireError, WireResult};
pub use location::Location;
pub use message::Message;
pub use node::OcapnNode;
pub use passable::{Invocable, ObjectRef, Passable};
pub use promise::{Promise, Resolver, Settlement};
pub use registry::SessionManager;
pub use session::{Session, SessionInfo};
