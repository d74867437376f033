//! Connection handling and event routing.

mod auth;
pub use auth::{Authenticator, JwtAuthenticator};

mod dispatcher;
pub use dispatcher::{Connection, Presence, RealtimeDispatcher};

pub mod events;
pub use events::{InboundEvent, OutboundEvent};

mod registry;
pub use registry::{ChannelHandle, ConnectionRegistry};
