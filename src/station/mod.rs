//! # Station Command and State Abstraction
//!
//! One [`Machine`] is the referee's handle on one Modular Production Station.
//! The four varieties (Base, Cap, Ring, Delivery) share a common command set
//! (connect, reset, signal lights, conveyor) expressed by
//! [`CommonStationOps`], and add their own operations on the refined handle.
//!
//! ## Command pipeline
//!
//! Every command lowers to the same wire conversation: place the `ACTION`
//! opcode and its `DATA` words, raise `STATUS_ENABLE`, then watch the
//! station's `BUSY` flag. The low→high transition marks acceptance, the
//! high→low transition completion. A timeout bounds each wait.
//!
//! ```text
//! IDLE ──writes──▶ ARMED ──BUSY↑──▶ RUNNING ──BUSY↓──▶ DONE ─▶ IDLE
//!                    │                  │
//!                    └── error/timeout ─┴──▶ FAILED
//! ```
//!
//! `reset` is the sole out-of-band command: it always fires and force-restores
//! `IDLE` regardless of what the pipeline was doing.
//!
//! ## Status propagation
//!
//! Each station runs a pump task draining its transport's event queue. The
//! pump keeps the [`StatusSnapshot`] current, feeds the BUSY watch channels
//! the command pipeline waits on, and forwards normalized [`StatusEvent`]s to
//! the engine bridge. Transport callbacks never run referee code directly.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::defaults;
use crate::transport::{
    opcode, MpsTransport, Register, RegisterEvent, RegisterValue, TransportError, TransportState,
};

pub mod base;
pub mod cap;
pub mod delivery;
pub mod ring;

pub use base::BaseStation;
pub use cap::CapStation;
pub use delivery::DeliveryStation;
pub use ring::RingStation;

/// Stable short name of a station, e.g. `C-BS` or `M-RS1`.
///
/// The first character encodes the team, characters 3–4 the variety. Identity
/// is immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StationName(String);

impl StationName {
    pub fn parse(name: &str) -> Result<Self, StationError> {
        let bytes = name.as_bytes();
        let well_formed = bytes.len() >= 4
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b'-'
            && bytes[2].is_ascii_uppercase()
            && bytes[3].is_ascii_uppercase();
        if !well_formed {
            return Err(StationError::InvalidName(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Team tag, the character before the dash.
    pub fn team(&self) -> char {
        self.0.chars().next().unwrap_or('?')
    }

    /// Variety encoded in characters 3–4 of the name, if recognized.
    pub fn kind_hint(&self) -> Option<StationKind> {
        match &self.0[2..4] {
            "BS" => Some(StationKind::Base),
            "CS" => Some(StationKind::Cap),
            "RS" => Some(StationKind::Ring),
            "DS" => Some(StationKind::Delivery),
            _ => None,
        }
    }
}

impl fmt::Display for StationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The four station varieties on the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationKind {
    #[serde(rename = "BS")]
    Base,
    #[serde(rename = "CS")]
    Cap,
    #[serde(rename = "RS")]
    Ring,
    #[serde(rename = "DS")]
    Delivery,
}

impl fmt::Display for StationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            StationKind::Base => "BS",
            StationKind::Cap => "CS",
            StationKind::Ring => "RS",
            StationKind::Delivery => "DS",
        };
        f.write_str(tag)
    }
}

/// Signal light colors, top to bottom on the mast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightColor {
    Red,
    Yellow,
    Green,
}

impl LightColor {
    pub const ALL: [LightColor; 3] = [LightColor::Red, LightColor::Yellow, LightColor::Green];

    fn index(self) -> usize {
        match self {
            LightColor::Red => 0,
            LightColor::Yellow => 1,
            LightColor::Green => 2,
        }
    }

    fn register(self) -> Register {
        match self {
            LightColor::Red => Register::LightRed,
            LightColor::Yellow => Register::LightYellow,
            LightColor::Green => Register::LightGreen,
        }
    }
}

impl FromStr for LightColor {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RED" => Ok(LightColor::Red),
            "YELLOW" => Ok(LightColor::Yellow),
            "GREEN" => Ok(LightColor::Green),
            _ => Err(StationError::invalid_enum("light color", s)),
        }
    }
}

/// State of one signal light. Exactly one state per color at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightState {
    #[default]
    Off,
    On,
    Blink,
}

impl LightState {
    fn code(self) -> u16 {
        match self {
            LightState::Off => 0,
            LightState::On => 1,
            LightState::Blink => 2,
        }
    }
}

impl FromStr for LightState {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFF" => Ok(LightState::Off),
            "ON" => Ok(LightState::On),
            "BLINK" => Ok(LightState::Blink),
            _ => Err(StationError::invalid_enum("light state", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConveyorDirection {
    Forward,
    Backward,
}

impl ConveyorDirection {
    fn code(self) -> u16 {
        match self {
            ConveyorDirection::Forward => 1,
            ConveyorDirection::Backward => 2,
        }
    }
}

impl FromStr for ConveyorDirection {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FORWARD" => Ok(ConveyorDirection::Forward),
            "BACKWARD" => Ok(ConveyorDirection::Backward),
            _ => Err(StationError::invalid_enum("conveyor direction", s)),
        }
    }
}

/// Sensor at which a conveyor move terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConveyorSensor {
    Input,
    Middle,
    Output,
}

impl ConveyorSensor {
    fn code(self) -> u16 {
        match self {
            ConveyorSensor::Input => 1,
            ConveyorSensor::Middle => 2,
            ConveyorSensor::Output => 3,
        }
    }
}

impl FromStr for ConveyorSensor {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPUT" => Ok(ConveyorSensor::Input),
            "MIDDLE" => Ok(ConveyorSensor::Middle),
            "OUTPUT" => Ok(ConveyorSensor::Output),
            _ => Err(StationError::invalid_enum("conveyor position", s)),
        }
    }
}

/// Workpiece colors a Base station can dispense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseColor {
    Red,
    Silver,
    Black,
}

impl BaseColor {
    pub(crate) fn code(self) -> u16 {
        match self {
            BaseColor::Red => 1,
            BaseColor::Silver => 2,
            BaseColor::Black => 3,
        }
    }
}

impl FromStr for BaseColor {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BASE_RED" => Ok(BaseColor::Red),
            "BASE_SILVER" => Ok(BaseColor::Silver),
            "BASE_BLACK" => Ok(BaseColor::Black),
            _ => Err(StationError::invalid_enum("base color", s)),
        }
    }
}

/// Ring colors a Ring station can mount. Each costs a configured number of
/// payment bases from the station's slide.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RingColor {
    Blue,
    Green,
    Orange,
    Yellow,
}

impl RingColor {
    pub(crate) fn code(self) -> u16 {
        match self {
            RingColor::Blue => 1,
            RingColor::Green => 2,
            RingColor::Orange => 3,
            RingColor::Yellow => 4,
        }
    }

    /// Season-default payment cost, overridable per station in the config.
    pub fn default_cost(self) -> u16 {
        match self {
            RingColor::Blue => 2,
            RingColor::Green => 1,
            RingColor::Orange => 1,
            RingColor::Yellow => 0,
        }
    }
}

impl FromStr for RingColor {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BLUE" => Ok(RingColor::Blue),
            "GREEN" => Ok(RingColor::Green),
            "ORANGE" => Ok(RingColor::Orange),
            "YELLOW" => Ok(RingColor::Yellow),
            _ => Err(StationError::invalid_enum("ring color", s)),
        }
    }
}

/// One of the three delivery gates of a Delivery station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryGate(u8);

impl DeliveryGate {
    pub fn new(gate: u8) -> Result<Self, StationError> {
        if (1..=3).contains(&gate) {
            Ok(Self(gate))
        } else {
            Err(StationError::invalid_enum("delivery gate", &gate.to_string()))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

/// The entire observable state a station exports upward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub ready: bool,
    pub busy: bool,
    pub barcode: i32,
    /// Payment bases remaining on the slide; meaningful for Ring stations.
    pub slide_count: u16,
}

/// Pipeline state of the (at most one) command occupying a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandState {
    #[default]
    Idle,
    /// Opcode and data written, enable edge not yet raised
    Armed,
    /// BUSY observed high, the station is executing
    Running,
    Done,
    Failed,
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            CommandState::Idle => "IDLE",
            CommandState::Armed => "ARMED",
            CommandState::Running => "RUNNING",
            CommandState::Done => "DONE",
            CommandState::Failed => "FAILED",
        };
        f.write_str(tag)
    }
}

/// Status slot names as they appear in asserted facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSlot {
    Ready,
    Busy,
    Barcode,
    SlideCounter,
}

impl fmt::Display for StatusSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            StatusSlot::Ready => "READY",
            StatusSlot::Busy => "BUSY",
            StatusSlot::Barcode => "BARCODE",
            StatusSlot::SlideCounter => "SLIDE-COUNTER",
        };
        f.write_str(tag)
    }
}

/// Normalized status change forwarded from a station to the engine bridge.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub station: StationName,
    pub slot: StatusSlot,
    pub value: RegisterValue,
}

/// Station-level usage errors: unknown names, variety mismatches, values
/// outside the recognized enumerations. Non-fatal; callers log and no-op.
#[derive(Debug, Error)]
pub enum StationError {
    #[error("unknown station '{0}'")]
    UnknownStation(String),

    #[error("station '{0}' is not a {1} station")]
    KindMismatch(String, StationKind),

    #[error("invalid station name '{0}'")]
    InvalidName(String),

    #[error("invalid {what} '{value}'")]
    InvalidEnum { what: &'static str, value: String },
}

impl StationError {
    fn invalid_enum(what: &'static str, value: &str) -> Self {
        StationError::InvalidEnum {
            what,
            value: value.to_string(),
        }
    }
}

/// Failure of a single station command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("station not connected")]
    NotConnected,
}

/// Status state shared between a station's command pipeline and its pump
/// task.
struct StatusShared {
    snapshot: RwLock<StatusSnapshot>,
    /// Current BUSY level
    busy_level: watch::Sender<bool>,
    /// Count of completed BUSY high→low pulses; commands wait on this so a
    /// pulse that completes before the waiter looks is still observed.
    busy_pulses: watch::Sender<u64>,
}

struct RetrySchedule {
    at: Instant,
    delay: Duration,
}

/// Shared machinery of all four station varieties.
pub struct StationCore {
    name: StationName,
    kind: StationKind,
    transport: Box<dyn MpsTransport>,
    command_timeout: Duration,
    command: Mutex<CommandState>,
    lights: Mutex<[LightState; 3]>,
    status: Arc<StatusShared>,
    /// Serializes bursts of register writes so they hit the wire in issue
    /// order even when a reset races a running command.
    write_gate: tokio::sync::Mutex<()>,
    retry: Mutex<RetrySchedule>,
    reconnecting: AtomicBool,
}

impl StationCore {
    pub(crate) fn new(
        name: StationName,
        kind: StationKind,
        transport: Box<dyn MpsTransport>,
        feedback: mpsc::Sender<StatusEvent>,
        command_timeout: Duration,
    ) -> Arc<Self> {
        let events = transport.subscribe(&Register::INPUTS);
        let (busy_level, _) = watch::channel(false);
        let (busy_pulses, _) = watch::channel(0u64);
        let status = Arc::new(StatusShared {
            snapshot: RwLock::new(StatusSnapshot::default()),
            busy_level,
            busy_pulses,
        });

        tokio::spawn(pump(
            name.clone(),
            kind,
            Arc::clone(&status),
            events,
            feedback,
        ));

        Arc::new(Self {
            name,
            kind,
            transport,
            command_timeout,
            command: Mutex::new(CommandState::Idle),
            lights: Mutex::new([LightState::Off; 3]),
            status,
            write_gate: tokio::sync::Mutex::new(()),
            retry: Mutex::new(RetrySchedule {
                at: Instant::now(),
                delay: defaults::RECONNECT_DELAY,
            }),
            reconnecting: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &StationName {
        &self.name
    }

    pub fn kind(&self) -> StationKind {
        self.kind
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        *self.status.snapshot.read()
    }

    pub fn command_state(&self) -> CommandState {
        *self.command.lock()
    }

    pub fn lights(&self) -> [LightState; 3] {
        *self.lights.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.state() == TransportState::Connected
    }

    /// Coarse state tag broadcast once per tick.
    pub fn coarse_state(&self) -> &'static str {
        if !self.is_connected() {
            return "DOWN";
        }
        let snapshot = self.snapshot();
        if snapshot.busy {
            "BUSY"
        } else if snapshot.ready {
            "READY-AT-OUTPUT"
        } else {
            "IDLE"
        }
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        match self.transport.connect().await {
            Ok(()) => {
                info!(target: "MPS", "{}: connected via {}", self.name, self.transport.name());
                self.reset_retry();
                Ok(())
            }
            Err(err) => {
                warn!(target: "MPS", "{}: connect failed: {}", self.name, err);
                self.defer_retry();
                Err(err)
            }
        }
    }

    fn reset_retry(&self) {
        let mut retry = self.retry.lock();
        retry.delay = defaults::RECONNECT_DELAY;
        retry.at = Instant::now();
    }

    fn defer_retry(&self) {
        let mut retry = self.retry.lock();
        retry.at = Instant::now() + retry.delay;
        retry.delay = (retry.delay * 2).min(defaults::RECONNECT_DELAY_MAX);
    }

    /// Fleet-tick hook: if the transport is down and the backoff deadline has
    /// passed, spawn one reconnect attempt. Never blocks the tick; the tick
    /// may run on a timer thread outside the runtime, hence the handle.
    pub(crate) fn poll_reconnect(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        if self.is_connected() || self.retry.lock().at > Instant::now() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let core = Arc::clone(self);
        runtime.spawn(async move {
            let _ = core.connect().await;
            core.reconnecting.store(false, Ordering::Release);
        });
    }

    fn set_state(&self, next: CommandState) {
        let mut state = self.command.lock();
        if *state != next {
            debug!(target: "MPS", "{}: command {} -> {}", self.name, *state, next);
            *state = next;
        }
    }

    fn ensure_connected(&self) -> Result<(), CommandError> {
        if self.is_connected() {
            Ok(())
        } else {
            error!(target: "MPS", "{}: not connected, dropping command", self.name);
            Err(CommandError::NotConnected)
        }
    }

    fn fail(&self, err: TransportError) -> CommandError {
        error!(target: "MPS", "{}: command failed: {}", self.name, err);
        self.set_state(CommandState::Failed);
        CommandError::Transport(err)
    }

    fn fail_timeout(&self) -> CommandError {
        error!(
            target: "MPS",
            "{}: command timed out after {:?}", self.name, self.command_timeout
        );
        self.set_state(CommandState::Failed);
        CommandError::Timeout(self.command_timeout)
    }

    /// Best-effort drop of the enable flag, so a timed-out command leaves a
    /// clean edge for whatever runs next.
    async fn clear_enable(&self) {
        let _gate = self.write_gate.lock().await;
        let _ = self
            .transport
            .write(Register::StatusEnable, RegisterValue::Flag(false))
            .await;
    }

    /// Run one command through the wire pipeline: arm, enable, watch the BUSY
    /// handshake.
    pub(crate) async fn execute(&self, action: u16, data: &[u16]) -> Result<(), CommandError> {
        self.ensure_connected()?;

        let mut level = self.status.busy_level.subscribe();
        let mut pulses = self.status.busy_pulses.subscribe();
        let pulses_before = *pulses.borrow_and_update();

        {
            let _gate = self.write_gate.lock().await;
            self.transport
                .write(Register::Action, RegisterValue::Word(action))
                .await
                .map_err(|e| self.fail(e))?;
            for (register, word) in [Register::Data0, Register::Data1].into_iter().zip(data) {
                self.transport
                    .write(register, RegisterValue::Word(*word))
                    .await
                    .map_err(|e| self.fail(e))?;
            }
            self.set_state(CommandState::Armed);
            self.transport
                .write(Register::StatusEnable, RegisterValue::Flag(true))
                .await
                .map_err(|e| self.fail(e))?;
        }

        // Acceptance: BUSY rising. A fast station may have finished the whole
        // pulse before we look, which counts as acceptance and completion.
        let accepted = async {
            tokio::select! {
                done = pulses.wait_for(|count| *count > pulses_before) => done.map(|_| true),
                running = level.wait_for(|busy| *busy) => running.map(|_| false),
            }
        };
        let completed = match timeout(self.command_timeout, accepted).await {
            Err(_) => {
                self.clear_enable().await;
                return Err(self.fail_timeout());
            }
            Ok(Err(_)) => return Err(self.fail(TransportError::Disconnected)),
            Ok(Ok(completed)) => completed,
        };

        if !completed {
            self.set_state(CommandState::Running);
        }

        // The PLC latched the command on the rising edge; drop the enable so
        // the next command starts from a clean edge.
        {
            let _gate = self.write_gate.lock().await;
            self.transport
                .write(Register::StatusEnable, RegisterValue::Flag(false))
                .await
                .map_err(|e| self.fail(e))?;
        }

        if !completed {
            let outcome = timeout(
                self.command_timeout,
                pulses.wait_for(|count| *count > pulses_before),
            )
            .await
            .map(|inner| inner.map(|_| ()));
            match outcome {
                Err(_) => {
                    self.clear_enable().await;
                    return Err(self.fail_timeout());
                }
                Ok(Err(_)) => return Err(self.fail(TransportError::Disconnected)),
                Ok(Ok(())) => {}
            }
        }

        self.set_state(CommandState::Done);
        self.set_state(CommandState::Idle);
        Ok(())
    }

    /// Out-of-band reset: fire the opcode, force the pipeline back to `IDLE`,
    /// drop the light bookkeeping. Does not wait for the BUSY handshake, so
    /// it cannot wedge on a dead PLC and is idempotent.
    pub async fn reset(&self) -> Result<(), CommandError> {
        self.ensure_connected()?;
        {
            let _gate = self.write_gate.lock().await;
            self.transport
                .write(Register::Action, RegisterValue::Word(opcode::RESET))
                .await
                .map_err(|e| self.fail(e))?;
            self.transport
                .write(Register::StatusEnable, RegisterValue::Flag(true))
                .await
                .map_err(|e| self.fail(e))?;
            self.transport
                .write(Register::StatusEnable, RegisterValue::Flag(false))
                .await
                .map_err(|e| self.fail(e))?;
        }
        *self.lights.lock() = [LightState::Off; 3];
        self.set_state(CommandState::Idle);
        Ok(())
    }

    pub async fn set_light(
        &self,
        color: LightColor,
        state: LightState,
        duration: Option<Duration>,
    ) -> Result<(), CommandError> {
        self.ensure_connected()?;
        let seconds = duration.map_or(0, |d| d.as_secs().min(255) as u16);
        let word = state.code() | (seconds << 8);
        {
            let _gate = self.write_gate.lock().await;
            self.transport
                .write(color.register(), RegisterValue::Word(word))
                .await
                .map_err(|e| self.fail(e))?;
        }
        self.lights.lock()[color.index()] = state;
        Ok(())
    }

    /// Force all three lights OFF. The write burst is issued under one gate
    /// hold so no other light write can interleave.
    pub async fn reset_light(&self) -> Result<(), CommandError> {
        self.ensure_connected()?;
        {
            let _gate = self.write_gate.lock().await;
            for color in LightColor::ALL {
                self.transport
                    .write(color.register(), RegisterValue::Word(LightState::Off.code()))
                    .await
                    .map_err(|e| self.fail(e))?;
            }
        }
        *self.lights.lock() = [LightState::Off; 3];
        Ok(())
    }

    pub async fn conveyor_move(
        &self,
        direction: ConveyorDirection,
        sensor: ConveyorSensor,
    ) -> Result<(), CommandError> {
        self.execute(opcode::MOVE_CONVEYOR, &[sensor.code(), direction.code()])
            .await
    }
}

/// Pump task: drains the transport event queue, keeps the snapshot and BUSY
/// watches current, forwards normalized events toward the bridge.
async fn pump(
    name: StationName,
    kind: StationKind,
    status: Arc<StatusShared>,
    mut events: mpsc::Receiver<RegisterEvent>,
    feedback: mpsc::Sender<StatusEvent>,
) {
    let mut forwarding = true;
    while let Some(event) = events.recv().await {
        let slot = match event.register {
            Register::StatusReadyIn => {
                status.snapshot.write().ready = event.value.as_flag();
                Some(StatusSlot::Ready)
            }
            Register::StatusBusyIn => {
                let level = event.value.as_flag();
                let was = {
                    let mut snapshot = status.snapshot.write();
                    std::mem::replace(&mut snapshot.busy, level)
                };
                status.busy_level.send_replace(level);
                if was && !level {
                    status.busy_pulses.send_modify(|count| *count += 1);
                }
                Some(StatusSlot::Busy)
            }
            Register::BarcodeIn => {
                if let RegisterValue::Int(code) = event.value {
                    status.snapshot.write().barcode = code;
                }
                Some(StatusSlot::Barcode)
            }
            Register::SlideCountIn => {
                if let RegisterValue::Word(count) = event.value {
                    status.snapshot.write().slide_count = count;
                }
                // Only Ring stations report a slide upward.
                (kind == StationKind::Ring).then_some(StatusSlot::SlideCounter)
            }
            _ => None,
        };

        if let (Some(slot), true) = (slot, forwarding) {
            let event = StatusEvent {
                station: name.clone(),
                slot,
                value: event.value,
            };
            if feedback.send(event).await.is_err() {
                debug!(target: "MPS", "{name}: status sink gone, feedback stops");
                forwarding = false;
            }
        }
    }
}

/// The command set shared by every station variety.
#[async_trait]
pub trait CommonStationOps: Send + Sync {
    fn name(&self) -> &StationName;
    fn kind(&self) -> StationKind;
    fn snapshot(&self) -> StatusSnapshot;
    fn command_state(&self) -> CommandState;
    fn lights(&self) -> [LightState; 3];
    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), TransportError>;
    async fn reset(&self) -> Result<(), CommandError>;
    async fn set_light(
        &self,
        color: LightColor,
        state: LightState,
        duration: Option<Duration>,
    ) -> Result<(), CommandError>;
    async fn reset_light(&self) -> Result<(), CommandError>;
    async fn conveyor_move(
        &self,
        direction: ConveyorDirection,
        sensor: ConveyorSensor,
    ) -> Result<(), CommandError>;
}

/// Implements [`CommonStationOps`] for a variety struct wrapping a
/// `core: Arc<StationCore>` field.
macro_rules! impl_common_ops {
    ($variety:ty) => {
        #[async_trait::async_trait]
        impl $crate::station::CommonStationOps for $variety {
            fn name(&self) -> &$crate::station::StationName {
                self.core.name()
            }

            fn kind(&self) -> $crate::station::StationKind {
                self.core.kind()
            }

            fn snapshot(&self) -> $crate::station::StatusSnapshot {
                self.core.snapshot()
            }

            fn command_state(&self) -> $crate::station::CommandState {
                self.core.command_state()
            }

            fn lights(&self) -> [$crate::station::LightState; 3] {
                self.core.lights()
            }

            fn is_connected(&self) -> bool {
                self.core.is_connected()
            }

            async fn connect(&self) -> Result<(), $crate::transport::TransportError> {
                self.core.connect().await
            }

            async fn reset(&self) -> Result<(), $crate::station::CommandError> {
                self.core.reset().await
            }

            async fn set_light(
                &self,
                color: $crate::station::LightColor,
                state: $crate::station::LightState,
                duration: Option<std::time::Duration>,
            ) -> Result<(), $crate::station::CommandError> {
                self.core.set_light(color, state, duration).await
            }

            async fn reset_light(&self) -> Result<(), $crate::station::CommandError> {
                self.core.reset_light().await
            }

            async fn conveyor_move(
                &self,
                direction: $crate::station::ConveyorDirection,
                sensor: $crate::station::ConveyorSensor,
            ) -> Result<(), $crate::station::CommandError> {
                self.core.conveyor_move(direction, sensor).await
            }
        }
    };
}
pub(crate) use impl_common_ops;

/// A station of any variety. Lookup by name yields this; the typed accessors
/// on the fleet yield the refined handles.
#[derive(Clone)]
pub enum Machine {
    Base(BaseStation),
    Cap(CapStation),
    Ring(RingStation),
    Delivery(DeliveryStation),
}

impl Machine {
    pub fn as_common(&self) -> &dyn CommonStationOps {
        match self {
            Machine::Base(station) => station,
            Machine::Cap(station) => station,
            Machine::Ring(station) => station,
            Machine::Delivery(station) => station,
        }
    }

    pub fn name(&self) -> &StationName {
        self.as_common().name()
    }

    pub fn kind(&self) -> StationKind {
        self.as_common().kind()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.as_common().snapshot()
    }

    pub(crate) fn core(&self) -> &Arc<StationCore> {
        match self {
            Machine::Base(station) => station.core(),
            Machine::Cap(station) => station.core(),
            Machine::Ring(station) => station.core(),
            Machine::Delivery(station) => station.core(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::transport::MockupTransport;

    /// A connected core over a fresh mockup, with the feedback receiver and
    /// the mockup handle kept for inspection.
    pub(crate) async fn connected_core(
        name: &str,
        kind: StationKind,
    ) -> (Arc<StationCore>, MockupTransport, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(defaults::FEEDBACK_QUEUE_DEPTH);
        let mock = MockupTransport::new();
        let core = StationCore::new(
            StationName::parse(name).unwrap(),
            kind,
            Box::new(mock.clone()),
            tx,
            Duration::from_millis(250),
        );
        core.connect().await.unwrap();
        (core, mock, rx)
    }
}
