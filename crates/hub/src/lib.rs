pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod liveness;
pub mod pool;
pub mod registry;
pub mod router;
pub mod session;

#[cfg(test)]
mod testing;

pub use broadcast::StateSync;
pub use config::{ConfigError, HubConfig};
pub use connection::{Connection, Delivery, Frame, PeerGone};
pub use error::HubError;
pub use hub::{Collaborators, Hub};
pub use liveness::{LivenessManager, SweepReport, Verdict};
pub use pool::{ConnectionPool, KeyStatus};
pub use registry::{Binding, RegistryEntry, Unbinding};
pub use router::Router;
pub use session::SessionTracker;
