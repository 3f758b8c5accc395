//! Real-time presence shared across worker processes.

pub mod bus;
mod messages;
mod registry;
pub mod relay;
mod service;
pub mod visibility;

pub use bus::{BusError, BusMessage, BusPayload, InProcessBus, InProcessHub, PresenceBus, WorkerId};
pub use messages::{ClientMessage, OnlineStatus, ServerMessage, UserStatus};
pub use registry::{ConnectionId, LocalRegistry};
pub use relay::RelayBus;
pub use service::{
    DISCONNECT_GRACE, GATHER_TIMEOUT, PresenceConnection, PresenceService, PresenceSettings,
    STARTUP_GRACE,
};
pub use visibility::{
    CachedWhitelist, GroupWhitelist, StaticWhitelist, VisibilityWhitelist, WhitelistError,
};
