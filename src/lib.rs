//! # MPS Control Plane
//!
//! Referee-side control backend for the Modular Production Stations (MPS) of
//! a logistics robot competition. This library provides a uniform command and
//! status surface over a fleet of programmable industrial stations, a
//! transport layer with interchangeable fieldbus backends, and the bridge into
//! an external forward-chaining rule engine.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod fleet;
pub mod station;
pub mod transport;

pub use bridge::{Bridge, CommandRegistrar, EngineHandle, RuleEngine};
pub use cli::Args;
pub use config::{ConnectionMode, MpsConfig, StationEntry};
pub use fleet::Fleet;
pub use station::{CommonStationOps, Machine, StationKind, StationName};
pub use transport::{MpsTransport, Register, RegisterValue, TransportError};

/// The current version of the MPS control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default interval of the periodic status tick in milliseconds
    pub const TIMER_INTERVAL_MS: u64 = 40;

    /// Default timeout bounding each BUSY-edge wait of a station command
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default interval of the fieldbus input-register sweep
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Timeout for establishing a fieldbus connection
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Initial delay before retrying a lost fieldbus connection
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

    /// Upper bound for the reconnect backoff
    pub const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(32);

    /// Bound of the per-station register event queue
    pub const EVENT_QUEUE_DEPTH: usize = 64;

    /// Bound of the fleet-wide status feedback queue
    pub const FEEDBACK_QUEUE_DEPTH: usize = 256;
}
