//! # Fieldbus Transport Abstraction
//!
//! This module provides the unified abstraction over the three ways the
//! referee talks to a Modular Production Station: the real PLC on the field,
//! an external simulator speaking the same wire schema, and an in-process
//! mockup that takes hardware out of the loop entirely.
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │     Station     │───▶│   MpsTransport   │───▶│    Specific     │
//! │  command logic  │    │      trait       │    │    backend      │
//! │                 │    │  (abstraction)   │    │ (PLC/SIM/MOCK)  │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! ## Register Model
//!
//! Every station exposes the same symbolic register set: command slots the
//! referee writes (`ACTION`, `DATA`, `STATUS_ENABLE`, light words, heartbeat)
//! and status inputs the station publishes (`STATUS_READY_IN`,
//! `STATUS_BUSY_IN`, `BARCODE_IN`, `SLIDECOUNT_IN`). The numeric addresses
//! behind these symbols are a deployment detail of the wire backend; the rest
//! of the crate only ever sees the enumeration.
//!
//! ## Subscription Model
//!
//! Backends never call user code from their polling task. Input-register
//! changes are delivered as [`RegisterEvent`]s over a bounded channel handed
//! out by [`MpsTransport::subscribe`]; the owning station drains that channel
//! on its own task.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ConnectionMode;

pub mod mockup;
pub(crate) mod modbus;
pub mod plc;
pub mod simulation;

pub use mockup::MockupTransport;
pub use plc::PlcTransport;
pub use simulation::SimulationTransport;

/// `ACTION` opcodes of the station wire schema.
///
/// Like the register addresses these are deployment constants; every backend
/// (and the firmware of the real PLC) agrees on them.
pub mod opcode {
    pub const RESET: u16 = 1;
    pub const MOVE_CONVEYOR: u16 = 2;
    pub const DISPENSE_BASE: u16 = 10;
    pub const RETRIEVE_CAP: u16 = 20;
    pub const MOUNT_CAP: u16 = 21;
    pub const MOUNT_RING: u16 = 30;
    pub const RESET_SLIDE: u16 = 31;
    pub const DELIVER: u16 = 40;
}

/// Symbolic register slots shared by every station variety.
///
/// Command slots are written by the referee; status inputs are read back from
/// the station. `BarcodeIn` is a 32-bit value and may span more than one word
/// on the wire; backends are responsible for reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    /// Command opcode slot
    Action,
    /// First command argument
    Data0,
    /// Second command argument
    Data1,
    /// Rising edge arms the command placed in `Action`/`Data*`
    StatusEnable,
    /// Red signal light word (state | duration << 8)
    LightRed,
    /// Yellow signal light word
    LightYellow,
    /// Green signal light word
    LightGreen,
    /// Watchdog slot toggled by the referee so the PLC knows it is alive
    Heartbeat,
    /// Workpiece present and ready at the in-feed
    StatusReadyIn,
    /// Station is executing a command
    StatusBusyIn,
    /// Barcode of the workpiece currently at the in-feed (int32)
    BarcodeIn,
    /// Payment bases remaining on the slide (Ring stations only)
    SlideCountIn,
}

impl Register {
    /// All status input registers, in wire order.
    pub const INPUTS: [Register; 4] = [
        Register::StatusReadyIn,
        Register::StatusBusyIn,
        Register::BarcodeIn,
        Register::SlideCountIn,
    ];

    /// Whether this register is published by the station rather than written
    /// by the referee.
    pub fn is_input(self) -> bool {
        matches!(
            self,
            Register::StatusReadyIn
                | Register::StatusBusyIn
                | Register::BarcodeIn
                | Register::SlideCountIn
        )
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Register::Action => "ACTION",
            Register::Data0 => "DATA0",
            Register::Data1 => "DATA1",
            Register::StatusEnable => "STATUS_ENABLE",
            Register::LightRed => "LIGHT_RED",
            Register::LightYellow => "LIGHT_YELLOW",
            Register::LightGreen => "LIGHT_GREEN",
            Register::Heartbeat => "HEARTBEAT",
            Register::StatusReadyIn => "STATUS_READY_IN",
            Register::StatusBusyIn => "STATUS_BUSY_IN",
            Register::BarcodeIn => "BARCODE_IN",
            Register::SlideCountIn => "SLIDECOUNT_IN",
        };
        f.write_str(name)
    }
}

/// Typed value carried by a register.
///
/// The wire may flatten these to 16-bit words, but the rest of the crate
/// works with the typed form: flags for the handshake bits, words for
/// opcodes, arguments and counters, a signed 32-bit integer for the barcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Flag(bool),
    Word(u16),
    Int(i32),
}

impl RegisterValue {
    /// Flag / non-zero-word truthiness; `Int` is never a flag.
    pub fn as_flag(self) -> bool {
        match self {
            RegisterValue::Flag(b) => b,
            RegisterValue::Word(w) => w != 0,
            RegisterValue::Int(_) => false,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Flag(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            RegisterValue::Word(w) => write!(f, "{w}"),
            RegisterValue::Int(i) => write!(f, "{i}"),
        }
    }
}

/// A decoded change of a status input register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterEvent {
    pub register: Register,
    pub value: RegisterValue,
}

/// Errors surfaced by transport operations.
///
/// All of these are non-fatal at the transport layer: they propagate to the
/// owning station, which decides whether to reconnect or surface the failure
/// as a command error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection to the station, or the connection was lost mid-operation
    #[error("not connected")]
    Disconnected,

    /// The operation did not complete within its deadline
    #[error("fieldbus operation timed out")]
    Timeout,

    /// The peer answered, but not with something we can use
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Connection lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created but never connected
    Uninitialized,
    /// Connection attempt in progress
    Connecting,
    /// Ready for register traffic
    Connected,
    /// Connection lost or closed; a reconnect may bring it back
    Disconnected,
}

/// Connection parameters for a single station's transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Fieldbus host of the station (or the shared gateway)
    pub host: String,
    /// TCP port; Modbus deployments conventionally use 502
    pub port: u16,
    /// Unit id for single-server deployments that multiplex stations
    pub unit: u8,
    /// Interval of the input-register sweep
    pub poll_interval: std::time::Duration,
}

impl TransportConfig {
    /// Build a transport config from a station's host/port entry. The unit id
    /// for single-server deployments is derived from the low byte of the
    /// configured port.
    pub fn for_station(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            unit: (port & 0xff) as u8,
            poll_interval: crate::defaults::POLL_INTERVAL,
        }
    }
}

/// Uniform interface over the PLC, simulation and mockup backends.
///
/// Implementations use interior mutability: stations hold the transport
/// behind a shared reference and issue writes from asynchronous command
/// tasks. Writes issued by a single caller are observed by the peer in issue
/// order.
#[async_trait]
pub trait MpsTransport: Send + Sync {
    /// Establish the connection. Idempotent; reconnects after a loss.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear the connection down and stop background polling.
    async fn disconnect(&self);

    /// Write a command register.
    async fn write(&self, register: Register, value: RegisterValue) -> Result<(), TransportError>;

    /// Read a single register (command or input).
    async fn read(&self, register: Register) -> Result<RegisterValue, TransportError>;

    /// Obtain a bounded stream of change events for the given input
    /// registers. May be called before `connect`; events start flowing once
    /// the backend is connected.
    fn subscribe(&self, registers: &[Register]) -> mpsc::Receiver<RegisterEvent>;

    /// Current connection state.
    fn state(&self) -> TransportState;

    /// Human-readable backend name for logging.
    fn name(&self) -> &'static str;
}

/// Factory creating the backend matching a configured connection mode.
pub struct TransportFactory;

impl TransportFactory {
    /// Create the transport backend for one station.
    pub fn create(mode: ConnectionMode, config: TransportConfig) -> Box<dyn MpsTransport> {
        match mode {
            ConnectionMode::Plc => Box::new(PlcTransport::new(config)),
            ConnectionMode::Simulation => Box::new(SimulationTransport::new(config)),
            ConnectionMode::Mockup => Box::new(MockupTransport::new()),
        }
    }
}
