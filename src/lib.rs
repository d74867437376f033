//! End-to-end encrypted realtime messaging core.
//!
//! Users publish X3DH pre-key bundles through the [`KeyManager`]. The
//! [`SessionCoordinator`] turns them into directional Double Ratchet sessions,
//! the [`GroupSessionCoordinator`] fans group messages out over those pairwise
//! sessions, and the [`RealtimeDispatcher`] routes client events between
//! connections and the [`MessageStore`].

mod error;
pub use error::Error;

mod ids;
pub use ids::*;

mod config;
pub use config::{Config, SessionConfig};

pub mod crypto;
pub use crypto::{CryptoProvider, OsCryptoProvider};

pub mod x3dh;

pub mod ratchet;

mod account;
pub use account::{
    IdentityPublicKeys, OneTimePreKeyPublic, OutboundSessionX3DHKeys, PreKeyBundle,
    SignedPreKeyPublic,
};

mod key_manager;
pub use key_manager::KeyManager;

pub mod session;
pub use session::{EncryptedPayload, EncryptionScheme, Session, SessionCoordinator, SessionStore};

mod group;
pub use group::GroupSessionCoordinator;

pub mod storage;
pub use storage::{MemoryMessageStore, MessageStore};

pub mod realtime;
pub use realtime::{Authenticator, Connection, JwtAuthenticator, RealtimeDispatcher};

pub mod logging;
