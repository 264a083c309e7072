//! # Rule Engine Bridge
//!
//! The bridge mediates between the external forward-chaining rule engine and
//! the station fleet. Downward it exposes one shim per engine-callable
//! command (`mps-*`); each shim validates its string arguments, resolves the
//! station and delegates to the fleet. Upward it asserts three kinds of
//! facts: per-change status feedback, command milestone feedback, and the
//! per-tick coarse state broadcast.
//!
//! ## Lock discipline
//!
//! The engine and the bridge share one recursive lock ([`EngineHandle`]).
//! Facts are only ever asserted under that lock, and the lock is never held
//! across transport I/O: command thunks run their phases unlocked and take
//! the lock only for the narrow assert windows in between. The per-tick
//! state rows are asserted under a single lock acquisition, so the engine
//! sees each tick atomically.
//!
//! ## Error policy
//!
//! Station-level problems (unknown name, variety mismatch, bad enum string)
//! never propagate into the engine as errors: they are logged under the
//! `MPS` target and the call becomes a no-op, exactly like the original
//! referee behaves.

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{error, info};

use crate::fleet::Fleet;
use crate::station::cap::CapOperation;
use crate::station::{
    BaseColor, CommonStationOps, ConveyorDirection, ConveyorSensor, DeliveryGate, LightColor,
    LightState, Machine, RingColor, StatusEvent,
};

/// The contract the external rule engine must offer: a fact sink. Callers of
/// [`RuleEngine::assert_fact`] hold the shared engine lock; implementations
/// need no locking of their own.
pub trait RuleEngine: Send + Sync {
    fn assert_fact(&self, fact: &str);
}

/// The rule engine coupled with the shared recursive lock.
///
/// The lock is recursive because the engine may call back into a bridge shim
/// while already holding it from its own activation loop.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn RuleEngine>,
    lock: Arc<ReentrantMutex<()>>,
}

impl EngineHandle {
    pub fn new(engine: Arc<dyn RuleEngine>) -> Self {
        Self {
            engine,
            lock: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// The shared lock itself, for the embedding engine's activation loop.
    pub fn lock_handle(&self) -> Arc<ReentrantMutex<()>> {
        Arc::clone(&self.lock)
    }

    /// Run `f` against the engine under the shared lock.
    pub fn with_lock<R>(&self, f: impl FnOnce(&dyn RuleEngine) -> R) -> R {
        let _guard = self.lock.lock();
        f(self.engine.as_ref())
    }

    /// Assert a single fact in its own lock window.
    pub fn assert_fact(&self, fact: &str) {
        self.with_lock(|engine| engine.assert_fact(fact));
    }
}

/// Function-registration hook of the rule engine. The bridge registers its
/// command shims through this during setup.
pub trait CommandRegistrar {
    fn register(&mut self, name: &'static str, handler: CommandHandler);
}

/// One registered command shim. Arguments arrive as the engine's strings;
/// validation happens inside.
pub type CommandHandler = Box<dyn Fn(&[String]) + Send + Sync>;

/// Fact sink that logs every assertion; stands in when no rule engine is
/// attached (the shipped binary runs with this). The per-tick state rows
/// repeat every few dozen milliseconds and go to debug; everything else is
/// operator-visible.
#[derive(Default)]
pub struct LoggingEngine;

impl RuleEngine for LoggingEngine {
    fn assert_fact(&self, fact: &str) {
        if fact.starts_with("(machine-mps-state") {
            tracing::debug!(target: "FACT", "{fact}");
        } else {
            info!(target: "FACT", "{fact}");
        }
    }
}

/// Fact sink that records every assertion in order, for tests and harnesses.
#[derive(Default)]
pub struct RecordingEngine {
    facts: Mutex<Vec<String>>,
}

impl RecordingEngine {
    pub fn facts(&self) -> Vec<String> {
        self.facts.lock().clone()
    }
}

impl RuleEngine for RecordingEngine {
    fn assert_fact(&self, fact: &str) {
        self.facts.lock().push(fact.to_string());
    }
}

/// The bridge between the rule engine and the station fleet.
pub struct Bridge {
    fleet: Arc<Fleet>,
    engine: EngineHandle,
}

impl Bridge {
    /// Couple the fleet to the engine and start the status pump, the single
    /// writer that turns station feedback into `mps-status-feedback` facts.
    pub fn new(fleet: Arc<Fleet>, engine: EngineHandle) -> Arc<Self> {
        let bridge = Arc::new(Self { fleet, engine });
        bridge.start_status_pump();
        bridge
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    fn start_status_pump(self: &Arc<Self>) {
        let Some(mut feedback) = self.fleet.take_feedback() else {
            error!(target: "MPS", "Status feedback stream already taken, facts will be missing");
            return;
        };
        let bridge = Arc::clone(self);
        self.fleet.spawn(async move {
            while let Some(event) = feedback.recv().await {
                bridge.assert_status(&event);
            }
        });
    }

    fn assert_status(&self, event: &StatusEvent) {
        self.engine.assert_fact(&format!(
            "(mps-status-feedback {} {} {})",
            event.station, event.slot, event.value
        ));
    }

    fn assert_milestone(&self, machine: &str, op: &str, phase: &str) {
        self.engine
            .assert_fact(&format!("(mps-feedback {machine} {op} {phase})"));
    }

    /// One tick: collect the coarse state of every station and assert the
    /// rows atomically under a single lock acquisition.
    pub fn tick(&self) {
        let rows = self.fleet.process();
        self.engine.with_lock(|engine| {
            for row in &rows {
                engine.assert_fact(&format!(
                    "(machine-mps-state (name {}) (state {}) (num-bases {}))",
                    row.name, row.state, row.num_bases
                ));
            }
        });
    }

    /// Register every command shim under its engine-visible name.
    pub fn register_commands(self: &Arc<Self>, registrar: &mut dyn CommandRegistrar) {
        fn shim(
            bridge: &Arc<Bridge>,
            method: fn(&Arc<Bridge>, &[String]),
        ) -> CommandHandler {
            let bridge = Arc::clone(bridge);
            Box::new(move |args: &[String]| method(&bridge, args))
        }

        registrar.register("mps-move-conveyor", shim(self, Bridge::cmd_move_conveyor));
        registrar.register("mps-cs-retrieve-cap", shim(self, Bridge::cmd_cs_retrieve_cap));
        registrar.register("mps-cs-mount-cap", shim(self, Bridge::cmd_cs_mount_cap));
        registrar.register("mps-bs-dispense", shim(self, Bridge::cmd_bs_dispense));
        registrar.register("mps-set-light", shim(self, Bridge::cmd_set_light));
        registrar.register("mps-set-lights", shim(self, Bridge::cmd_set_lights));
        registrar.register("mps-reset-lights", shim(self, Bridge::cmd_reset_lights));
        registrar.register("mps-ds-process", shim(self, Bridge::cmd_ds_process));
        registrar.register("mps-rs-mount-ring", shim(self, Bridge::cmd_rs_mount_ring));
        registrar.register("mps-cs-process", shim(self, Bridge::cmd_cs_process));
        registrar.register("mps-reset", shim(self, Bridge::cmd_reset));
        registrar.register("mps-reset-base-counter", shim(self, Bridge::cmd_reset_base_counter));
        registrar.register("mps-deliver", shim(self, Bridge::cmd_deliver));
    }

    fn station(&self, name: &str) -> Option<Machine> {
        let station = self.fleet.get_station(name);
        if station.is_none() {
            error!(target: "MPS", "Invalid station {name}");
        }
        station
    }

    fn cmd_reset(self: &Arc<Self>, args: &[String]) {
        let Some([machine]) = fixed_args("mps-reset", args) else {
            return;
        };
        info!(target: "MPS", "Resetting machine {machine}");
        let Some(station) = self.station(machine) else {
            return;
        };
        let name = machine.clone();
        self.fleet.issue(machine, "mps-reset", async move {
            if let Err(err) = station.as_common().reset().await {
                error!(target: "MPS", "{name}: reset failed: {err}");
            }
        });
    }

    fn cmd_reset_base_counter(self: &Arc<Self>, args: &[String]) {
        let Some([machine]) = fixed_args("mps-reset-base-counter", args) else {
            return;
        };
        info!(target: "MPS", "Resetting base counter of {machine}");
        let station = match self.fleet.get_ring(machine) {
            Ok(station) => station,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let name = machine.clone();
        self.fleet.issue(machine, "mps-reset-base-counter", async move {
            if let Err(err) = station.reset_base_counter().await {
                error!(target: "MPS", "{name}: base counter reset failed: {err}");
            }
        });
    }

    fn cmd_deliver(self: &Arc<Self>, args: &[String]) {
        let Some([machine]) = fixed_args("mps-deliver", args) else {
            return;
        };
        info!(target: "MPS", "Delivering on {machine}");
        let Some(station) = self.station(machine) else {
            return;
        };
        let bridge = Arc::clone(self);
        let name = machine.clone();
        self.fleet.issue(machine, "mps-deliver", async move {
            match station
                .as_common()
                .conveyor_move(ConveyorDirection::Forward, ConveyorSensor::Output)
                .await
            {
                Ok(()) => bridge
                    .engine
                    .assert_fact(&format!("(mps-feedback mps-deliver success {name})")),
                Err(err) => {
                    error!(target: "MPS", "{name}: deliver failed: {err}");
                    bridge
                        .engine
                        .assert_fact(&format!("(mps-feedback mps-deliver failed {name})"));
                }
            }
        });
    }

    fn cmd_bs_dispense(self: &Arc<Self>, args: &[String]) {
        let Some([machine, color]) = fixed_args("mps-bs-dispense", args) else {
            return;
        };
        info!(target: "MPS", "Dispense {machine}: {color}");
        let color: BaseColor = match color.parse() {
            Ok(color) => color,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let station = match self.fleet.get_base(machine) {
            Ok(station) => station,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let name = machine.clone();
        self.fleet.issue(machine, "mps-bs-dispense", async move {
            if let Err(err) = station.get_base(color).await {
                error!(target: "MPS", "{name}: dispense failed: {err}");
            }
        });
    }

    fn cmd_ds_process(self: &Arc<Self>, args: &[String]) {
        let Some([machine, gate]) = fixed_args("mps-ds-process", args) else {
            return;
        };
        info!(target: "MPS", "Processing on {machine}: gate {gate}");
        let gate = match gate.parse::<u8>().ok().and_then(|g| DeliveryGate::new(g).ok()) {
            Some(gate) => gate,
            None => {
                error!(target: "MPS", "Invalid delivery gate '{gate}'");
                return;
            }
        };
        let station = match self.fleet.get_delivery(machine) {
            Ok(station) => station,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let name = machine.clone();
        self.fleet.issue(machine, "mps-ds-process", async move {
            if let Err(err) = station.deliver_product(gate).await {
                error!(target: "MPS", "{name}: delivery failed: {err}");
            }
        });
    }

    fn cmd_rs_mount_ring(self: &Arc<Self>, args: &[String]) {
        let Some([machine, color]) = fixed_args("mps-rs-mount-ring", args) else {
            return;
        };
        info!(target: "MPS", "Mount ring on {machine}: {color}");
        let color: RingColor = match color.parse() {
            Ok(color) => color,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let station = match self.fleet.get_ring(machine) {
            Ok(station) => station,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let name = machine.clone();
        self.fleet.issue(machine, "mps-rs-mount-ring", async move {
            if let Err(err) = station.mount_ring(color).await {
                error!(target: "MPS", "{name}: ring mount failed: {err}");
            }
        });
    }

    fn cmd_move_conveyor(self: &Arc<Self>, args: &[String]) {
        // The engine may omit the direction; it defaults to FORWARD.
        let (machine, position, direction) = match args {
            [machine, position] => (machine, position, "FORWARD"),
            [machine, position, direction] => (machine, position, direction.as_str()),
            _ => {
                error!(
                    target: "MPS",
                    "mps-move-conveyor: expected 2 or 3 arguments, got {}", args.len()
                );
                return;
            }
        };
        let sensor: ConveyorSensor = match position.parse() {
            Ok(sensor) => sensor,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let direction: ConveyorDirection = match direction.parse() {
            Ok(direction) => direction,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let Some(station) = self.station(machine) else {
            return;
        };
        let name = machine.clone();
        self.fleet.issue(machine, "mps-move-conveyor", async move {
            if let Err(err) = station.as_common().conveyor_move(direction, sensor).await {
                error!(target: "MPS", "{name}: conveyor move failed: {err}");
            }
        });
    }

    fn cmd_cs_retrieve_cap(self: &Arc<Self>, args: &[String]) {
        let Some([machine]) = fixed_args("mps-cs-retrieve-cap", args) else {
            return;
        };
        self.issue_cap_op(machine, CapOperation::Retrieve, "mps-cs-retrieve-cap");
    }

    fn cmd_cs_mount_cap(self: &Arc<Self>, args: &[String]) {
        let Some([machine]) = fixed_args("mps-cs-mount-cap", args) else {
            return;
        };
        self.issue_cap_op(machine, CapOperation::Mount, "mps-cs-mount-cap");
    }

    fn issue_cap_op(&self, machine: &str, operation: CapOperation, op_name: &'static str) {
        let station = match self.fleet.get_cap(machine) {
            Ok(station) => station,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let name = machine.to_string();
        self.fleet.issue(machine, op_name, async move {
            if let Err(err) = station.operate(operation).await {
                error!(target: "MPS", "{name}: {} failed: {err}", operation.as_str());
            }
        });
    }

    /// Compound cap processing: drive the workpiece under the tool, announce
    /// availability, run the cap operation, drive to the output, announce
    /// completion. Each announcement takes the engine lock in its own narrow
    /// window; no transport I/O happens under the lock.
    fn cmd_cs_process(self: &Arc<Self>, args: &[String]) {
        let Some([machine, operation]) = fixed_args("mps-cs-process", args) else {
            return;
        };
        info!(target: "MPS", "{operation} on {machine}");
        let operation: CapOperation = match operation.parse() {
            Ok(operation) => operation,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let station = match self.fleet.get_cap(machine) {
            Ok(station) => station,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let bridge = Arc::clone(self);
        let name = machine.clone();
        self.fleet.issue(machine, "mps-cs-process", async move {
            let op = operation.as_str();
            let outcome = async {
                station.band_on_until_mid().await?;
                bridge.assert_milestone(&name, op, "AVAILABLE");
                station.operate(operation).await?;
                station.band_on_until_out().await?;
                Ok::<(), crate::station::CommandError>(())
            }
            .await;
            match outcome {
                Ok(()) => bridge.assert_milestone(&name, op, "DONE"),
                Err(err) => {
                    error!(target: "MPS", "{name}: {op} failed: {err}");
                    bridge.assert_milestone(&name, op, "FAILED");
                }
            }
        });
    }

    fn cmd_set_light(self: &Arc<Self>, args: &[String]) {
        let Some([machine, color, state]) = fixed_args("mps-set-light", args) else {
            return;
        };
        let Some((color, state)) = parse_light(color, state) else {
            return;
        };
        let Some(station) = self.station(machine) else {
            return;
        };
        let name = machine.clone();
        self.fleet.spawn(async move {
            if let Err(err) = station.as_common().set_light(color, state, None).await {
                error!(target: "MPS", "{name}: set light failed: {err}");
            }
        });
    }

    /// Equivalent to three `mps-set-light` calls, applied in color order
    /// RED, YELLOW, GREEN within one task so the writes cannot interleave.
    fn cmd_set_lights(self: &Arc<Self>, args: &[String]) {
        let Some([machine, red, yellow, green]) = fixed_args("mps-set-lights", args) else {
            return;
        };
        let states: Vec<LightState> = match [red, yellow, green]
            .iter()
            .map(|state| state.parse())
            .collect()
        {
            Ok(states) => states,
            Err(err) => {
                error!(target: "MPS", "{err}");
                return;
            }
        };
        let Some(station) = self.station(machine) else {
            return;
        };
        let name = machine.clone();
        self.fleet.spawn(async move {
            for (color, state) in LightColor::ALL.into_iter().zip(states) {
                if let Err(err) = station.as_common().set_light(color, state, None).await {
                    error!(target: "MPS", "{name}: set light failed: {err}");
                    return;
                }
            }
        });
    }

    fn cmd_reset_lights(self: &Arc<Self>, args: &[String]) {
        let Some([machine]) = fixed_args("mps-reset-lights", args) else {
            return;
        };
        let Some(station) = self.station(machine) else {
            return;
        };
        let name = machine.clone();
        self.fleet.spawn(async move {
            if let Err(err) = station.as_common().reset_light().await {
                error!(target: "MPS", "{name}: light reset failed: {err}");
            }
        });
    }
}

fn parse_light(color: &str, state: &str) -> Option<(LightColor, LightState)> {
    let color: LightColor = match color.parse() {
        Ok(color) => color,
        Err(err) => {
            error!(target: "MPS", "{err}");
            return None;
        }
    };
    let state: LightState = match state.parse() {
        Ok(state) => state,
        Err(err) => {
            error!(target: "MPS", "{err}");
            return None;
        }
    };
    Some((color, state))
}

fn fixed_args<'a, const N: usize>(command: &str, args: &'a [String]) -> Option<&'a [String; N]> {
    match <&[String; N]>::try_from(args) {
        Ok(args) => Some(args),
        Err(_) => {
            error!(
                target: "MPS",
                "{command}: expected {N} argument(s), got {}", args.len()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionMode, MpsConfig};
    use std::collections::HashMap;
    use std::time::Duration;

    /// Registrar backed by a plain map, standing in for the engine's
    /// function table.
    #[derive(Default)]
    struct MapRegistrar {
        handlers: HashMap<&'static str, CommandHandler>,
    }

    impl CommandRegistrar for MapRegistrar {
        fn register(&mut self, name: &'static str, handler: CommandHandler) {
            self.handlers.insert(name, handler);
        }
    }

    impl MapRegistrar {
        fn call(&self, name: &str, args: &[&str]) {
            let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            (self.handlers[name])(&args);
        }
    }

    struct Harness {
        fleet: Arc<Fleet>,
        engine: Arc<RecordingEngine>,
        registrar: MapRegistrar,
        _bridge: Arc<Bridge>,
    }

    async fn harness() -> Harness {
        let mut config: MpsConfig = serde_json::from_str(
            r#"{
                "stations": {
                    "C-BS": { "type": "BS", "host": "127.0.0.1", "port": 4840 },
                    "C-CS1": { "type": "CS", "host": "127.0.0.1", "port": 4841 },
                    "C-RS1": { "type": "RS", "host": "127.0.0.1", "port": 4842 },
                    "C-DS": { "type": "DS", "host": "127.0.0.1", "port": 4843 },
                    "M-RS1": { "type": "RS", "host": "127.0.0.1", "port": 4844 }
                }
            }"#,
        )
        .unwrap();
        config.connection = Some(ConnectionMode::Mockup);

        let fleet = Arc::new(Fleet::new(&config).await.unwrap());
        let engine = Arc::new(RecordingEngine::default());
        let handle = EngineHandle::new(Arc::clone(&engine) as Arc<dyn RuleEngine>);
        let bridge = Bridge::new(Arc::clone(&fleet), handle);
        let mut registrar = MapRegistrar::default();
        bridge.register_commands(&mut registrar);

        Harness {
            fleet,
            engine,
            registrar,
            _bridge: bridge,
        }
    }

    async fn wait_for_fact(engine: &RecordingEngine, needle: &str) -> Vec<String> {
        for _ in 0..200 {
            let facts = engine.facts();
            if facts.iter().any(|fact| fact.contains(needle)) {
                return facts;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("fact containing '{needle}' never asserted; have {:?}", engine.facts());
    }

    async fn settle(fleet: &Fleet, name: &str) {
        for _ in 0..200 {
            if !fleet.command_in_flight(name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("command on {name} never finished");
    }

    #[tokio::test]
    async fn all_thirteen_shims_are_registered() {
        let h = harness().await;
        for name in [
            "mps-move-conveyor",
            "mps-cs-retrieve-cap",
            "mps-cs-mount-cap",
            "mps-bs-dispense",
            "mps-set-light",
            "mps-set-lights",
            "mps-reset-lights",
            "mps-ds-process",
            "mps-rs-mount-ring",
            "mps-cs-process",
            "mps-reset",
            "mps-reset-base-counter",
            "mps-deliver",
        ] {
            assert!(h.registrar.handlers.contains_key(name), "missing {name}");
        }
        assert_eq!(h.registrar.handlers.len(), 13);
    }

    #[tokio::test]
    async fn unknown_station_is_a_no_op() {
        let h = harness().await;
        h.registrar.call("mps-reset", &["X-ZZ"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.fleet.command_in_flight("X-ZZ"));
        assert!(h.engine.facts().is_empty());
    }

    #[tokio::test]
    async fn invalid_enum_never_reaches_the_station() {
        let h = harness().await;
        h.registrar.call("mps-bs-dispense", &["C-BS", "BASE_GOLD"]);
        h.registrar.call("mps-set-light", &["C-BS", "PINK", "ON"]);
        h.registrar.call("mps-move-conveyor", &["C-BS", "SIDEWAYS"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.fleet.command_in_flight("C-BS"));
        assert!(h.engine.facts().is_empty());
    }

    #[tokio::test]
    async fn dispense_runs_and_emits_busy_feedback_in_order() {
        let h = harness().await;
        h.registrar.call("mps-bs-dispense", &["C-BS", "BASE_RED"]);
        let facts = wait_for_fact(&h.engine, "(mps-status-feedback C-BS BUSY FALSE)").await;

        let busy_true = facts
            .iter()
            .position(|f| f == "(mps-status-feedback C-BS BUSY TRUE)")
            .expect("BUSY TRUE fact");
        let busy_false = facts
            .iter()
            .position(|f| f == "(mps-status-feedback C-BS BUSY FALSE)")
            .expect("BUSY FALSE fact");
        assert!(busy_true < busy_false);
    }

    #[tokio::test]
    async fn variety_mismatch_is_rejected() {
        let h = harness().await;
        // C-DS is not a Base station.
        h.registrar.call("mps-bs-dispense", &["C-DS", "BASE_RED"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.fleet.command_in_flight("C-DS"));
    }

    #[tokio::test]
    async fn set_lights_equals_three_sequential_set_light_calls() {
        let h = harness().await;
        h.registrar
            .call("mps-set-lights", &["M-RS1", "ON", "BLINK", "OFF"]);
        let station = h.fleet.get_station("M-RS1").unwrap();
        for _ in 0..200 {
            if station.as_common().lights() == [LightState::On, LightState::Blink, LightState::Off]
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            station.as_common().lights(),
            [LightState::On, LightState::Blink, LightState::Off]
        );

        // The law: the same end state as three sequential single calls.
        h.registrar.call("mps-reset-lights", &["M-RS1"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.registrar.call("mps-set-light", &["M-RS1", "RED", "ON"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.registrar
            .call("mps-set-light", &["M-RS1", "YELLOW", "BLINK"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.registrar.call("mps-set-light", &["M-RS1", "GREEN", "OFF"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            station.as_common().lights(),
            [LightState::On, LightState::Blink, LightState::Off]
        );
    }

    #[tokio::test]
    async fn reset_lights_turns_everything_off() {
        let h = harness().await;
        h.registrar.call("mps-set-lights", &["C-CS1", "ON", "ON", "ON"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.registrar.call("mps-reset-lights", &["C-CS1"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let station = h.fleet.get_station("C-CS1").unwrap();
        assert_eq!(station.as_common().lights(), [LightState::Off; 3]);
    }

    #[tokio::test]
    async fn cs_process_asserts_available_then_done() {
        let h = harness().await;
        h.registrar
            .call("mps-cs-process", &["C-CS1", "RETRIEVE_CAP"]);
        let facts = wait_for_fact(&h.engine, "(mps-feedback C-CS1 RETRIEVE_CAP DONE)").await;

        let available = facts
            .iter()
            .position(|f| f == "(mps-feedback C-CS1 RETRIEVE_CAP AVAILABLE)")
            .expect("AVAILABLE fact");
        let done = facts
            .iter()
            .position(|f| f == "(mps-feedback C-CS1 RETRIEVE_CAP DONE)")
            .expect("DONE fact");
        assert!(available < done, "AVAILABLE must come strictly before DONE");
    }

    #[tokio::test]
    async fn cs_process_rejects_unknown_operation() {
        let h = harness().await;
        h.registrar.call("mps-cs-process", &["C-CS1", "POLISH_CAP"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.fleet.command_in_flight("C-CS1"));
        assert!(h.engine.facts().is_empty());
    }

    #[tokio::test]
    async fn double_deliver_runs_one_future_and_one_fact() {
        let h = harness().await;
        h.registrar.call("mps-deliver", &["C-DS"]);
        h.registrar.call("mps-deliver", &["C-DS"]);
        settle(&h.fleet, "C-DS").await;
        wait_for_fact(&h.engine, "(mps-feedback mps-deliver success C-DS)").await;
        // Give any (incorrect) second future time to surface.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let success_count = h
            .engine
            .facts()
            .iter()
            .filter(|f| *f == "(mps-feedback mps-deliver success C-DS)")
            .count();
        assert_eq!(success_count, 1);
    }

    #[tokio::test]
    async fn mount_ring_reports_slide_counter() {
        let h = harness().await;
        h.registrar.call("mps-rs-mount-ring", &["C-RS1", "BLUE"]);
        let facts = wait_for_fact(&h.engine, "(mps-status-feedback C-RS1 SLIDE-COUNTER 0)").await;
        assert!(facts
            .iter()
            .any(|f| f.starts_with("(mps-status-feedback C-RS1 SLIDE-COUNTER")));
    }

    #[tokio::test]
    async fn tick_asserts_state_rows_for_all_stations() {
        let h = harness().await;
        h._bridge.tick();
        let facts = h.engine.facts();
        assert_eq!(facts.len(), 5);
        assert!(facts
            .iter()
            .any(|f| f == "(machine-mps-state (name C-BS) (state IDLE) (num-bases 0))"));
        assert!(facts
            .iter()
            .any(|f| f.starts_with("(machine-mps-state (name C-RS1)")));
    }

    #[tokio::test]
    async fn recursive_lock_allows_reentrant_assertion() {
        let engine = Arc::new(RecordingEngine::default());
        let handle = EngineHandle::new(Arc::clone(&engine) as Arc<dyn RuleEngine>);
        // The engine holds the lock and calls back into an assert window, the
        // way a rule activation invoking a shim would.
        handle.with_lock(|_| {
            handle.assert_fact("(inner)");
        });
        assert_eq!(engine.facts(), vec!["(inner)".to_string()]);
    }
}
