//! # Station Fleet
//!
//! The fleet owns every station on the field, keyed by name. It is built once
//! from the typed configuration, hands out common or refined station handles,
//! serializes long-running commands so each station has at most one in
//! flight, and produces the coarse per-station state rows broadcast on every
//! tick.
//!
//! ## Command tickets
//!
//! Long-running commands are spawned as tasks and tracked in a per-station
//! ticket slot. While a ticket's task has not finished, further commands for
//! the same station are dropped with an info log; the rule engine re-issues
//! on its next activation if it still wants the operation. Short critical
//! sections only: the ticket map mutex is never held across I/O.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, MpsConfig};
use crate::defaults;
use crate::station::{
    BaseStation, CapStation, DeliveryStation, Machine, RingStation, StationCore, StationError,
    StationKind, StationName, StatusEvent,
};
use crate::transport::{TransportConfig, TransportFactory};

/// One row of the per-tick coarse state broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub name: String,
    pub state: &'static str,
    /// Live slide count for Ring stations, 0 for every other variety.
    pub num_bases: u16,
}

struct CommandTicket {
    op: &'static str,
    handle: JoinHandle<()>,
}

/// Registry and scheduler for all stations of the field.
pub struct Fleet {
    stations: BTreeMap<String, Machine>,
    tickets: Mutex<HashMap<String, CommandTicket>>,
    feedback_rx: Mutex<Option<mpsc::Receiver<StatusEvent>>>,
    runtime: Handle,
}

impl Fleet {
    /// Build every active station from the configuration and attempt the
    /// initial transport connection. Connection failures are logged and the
    /// station starts disconnected (the tick retries); configuration problems
    /// abort startup.
    pub async fn new(config: &MpsConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let (feedback_tx, feedback_rx) = mpsc::channel(defaults::FEEDBACK_QUEUE_DEPTH);
        let mut stations = BTreeMap::new();

        for (name, entry) in &config.stations {
            if !entry.active {
                info!(target: "MPS", "Skipping inactive station {name}");
                continue;
            }

            let mode = config.connection_for(entry);
            info!(
                target: "MPS",
                "Adding {} {} at {}:{} ({})", entry.kind, name, entry.host, entry.port, mode
            );

            let transport = TransportFactory::create(
                mode,
                TransportConfig::for_station(&entry.host, entry.port),
            );
            let station_name =
                StationName::parse(name).map_err(|_| ConfigError::InvalidName(name.clone()))?;
            let core = StationCore::new(
                station_name,
                entry.kind,
                transport,
                feedback_tx.clone(),
                config.command_timeout(),
            );

            let machine = match entry.kind {
                StationKind::Base => Machine::Base(BaseStation::from_core(core)),
                StationKind::Cap => Machine::Cap(CapStation::from_core(core)),
                StationKind::Ring => {
                    Machine::Ring(RingStation::from_core(core, entry.ring_costs.clone()))
                }
                StationKind::Delivery => Machine::Delivery(DeliveryStation::from_core(core)),
            };

            // Initial connect; a refused PLC is not fatal, the tick retries.
            let _ = machine.as_common().connect().await;

            stations.insert(name.clone(), machine);
        }

        Ok(Self {
            stations,
            tickets: Mutex::new(HashMap::new()),
            feedback_rx: Mutex::new(Some(feedback_rx)),
            runtime: Handle::current(),
        })
    }

    /// Number of live stations.
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// The fleet-wide status feedback stream; the bridge takes this exactly
    /// once and pumps it into the rule engine.
    pub fn take_feedback(&self) -> Option<mpsc::Receiver<StatusEvent>> {
        self.feedback_rx.lock().take()
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Look a station up by name, any variety.
    pub fn get_station(&self, name: &str) -> Option<Machine> {
        self.stations.get(name).cloned()
    }

    /// Typed lookup of a Base station.
    pub fn get_base(&self, name: &str) -> Result<BaseStation, StationError> {
        match self.lookup(name)? {
            Machine::Base(station) => Ok(station),
            _ => Err(StationError::KindMismatch(
                name.to_string(),
                StationKind::Base,
            )),
        }
    }

    /// Typed lookup of a Cap station.
    pub fn get_cap(&self, name: &str) -> Result<CapStation, StationError> {
        match self.lookup(name)? {
            Machine::Cap(station) => Ok(station),
            _ => Err(StationError::KindMismatch(
                name.to_string(),
                StationKind::Cap,
            )),
        }
    }

    /// Typed lookup of a Ring station.
    pub fn get_ring(&self, name: &str) -> Result<RingStation, StationError> {
        match self.lookup(name)? {
            Machine::Ring(station) => Ok(station),
            _ => Err(StationError::KindMismatch(
                name.to_string(),
                StationKind::Ring,
            )),
        }
    }

    /// Typed lookup of a Delivery station.
    pub fn get_delivery(&self, name: &str) -> Result<DeliveryStation, StationError> {
        match self.lookup(name)? {
            Machine::Delivery(station) => Ok(station),
            _ => Err(StationError::KindMismatch(
                name.to_string(),
                StationKind::Delivery,
            )),
        }
    }

    fn lookup(&self, name: &str) -> Result<Machine, StationError> {
        self.get_station(name)
            .ok_or_else(|| StationError::UnknownStation(name.to_string()))
    }

    /// Spawn a long-running command for `name` unless one is already in
    /// flight. Returns whether the command was actually started.
    pub fn issue<F>(&self, name: &str, op: &'static str, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tickets = self.tickets.lock();
        if let Some(ticket) = tickets.get(name) {
            if !ticket.handle.is_finished() {
                info!(
                    target: "MPS",
                    "{name}: dropping {op}, {} still in flight", ticket.op
                );
                return false;
            }
        }
        tickets.insert(
            name.to_string(),
            CommandTicket {
                op,
                handle: self.runtime.spawn(future),
            },
        );
        true
    }

    /// Whether a command ticket for `name` is still running.
    pub fn command_in_flight(&self, name: &str) -> bool {
        self.tickets
            .lock()
            .get(name)
            .is_some_and(|ticket| !ticket.handle.is_finished())
    }

    /// One tick: prune finished tickets, kick reconnects for stations whose
    /// transport is down, and collect the coarse state rows. Does no I/O and
    /// takes no engine lock; callers assert the rows under their own lock.
    pub fn process(&self) -> Vec<MachineState> {
        self.tickets
            .lock()
            .retain(|_, ticket| !ticket.handle.is_finished());

        let mut rows = Vec::with_capacity(self.stations.len());
        for (name, machine) in &self.stations {
            machine.core().poll_reconnect(&self.runtime);
            let num_bases = match machine {
                Machine::Ring(station) => station.slide_count(),
                _ => 0,
            };
            rows.push(MachineState {
                name: name.clone(),
                state: machine.core().coarse_state(),
                num_bases,
            });
        }
        rows
    }

    /// Detach all outstanding command tickets, for shutdown.
    pub fn shutdown(&self) {
        let mut tickets = self.tickets.lock();
        if !tickets.is_empty() {
            warn!(
                target: "MPS",
                "Detaching {} outstanding command(s) on shutdown", tickets.len()
            );
        }
        tickets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionMode;
    use std::time::Duration;

    fn mockup_config(json: &str) -> MpsConfig {
        let mut config: MpsConfig = serde_json::from_str(json).unwrap();
        config.connection = Some(ConnectionMode::Mockup);
        config
    }

    fn two_station_config() -> MpsConfig {
        mockup_config(
            r#"{
                "stations": {
                    "C-BS": { "type": "BS", "host": "127.0.0.1", "port": 4840 },
                    "C-RS1": { "type": "RS", "host": "127.0.0.1", "port": 4841 },
                    "M-DS": { "type": "DS", "host": "127.0.0.1", "port": 4842, "active": false }
                }
            }"#,
        )
    }

    #[tokio::test]
    async fn builds_active_stations_only() {
        let fleet = Fleet::new(&two_station_config()).await.unwrap();
        assert_eq!(fleet.len(), 2);
        assert!(fleet.get_station("C-BS").is_some());
        assert!(fleet.get_station("M-DS").is_none(), "inactive is skipped");
    }

    #[tokio::test]
    async fn construction_fails_on_invalid_config() {
        let mut config = two_station_config();
        config.stations.get_mut("C-BS").unwrap().port = 0;
        assert!(Fleet::new(&config).await.is_err());
    }

    #[tokio::test]
    async fn typed_lookup_enforces_variety() {
        let fleet = Fleet::new(&two_station_config()).await.unwrap();

        assert!(fleet.get_base("C-BS").is_ok());
        assert!(matches!(
            fleet.get_cap("C-BS"),
            Err(StationError::KindMismatch(_, StationKind::Cap))
        ));
        assert!(matches!(
            fleet.get_base("X-ZZ"),
            Err(StationError::UnknownStation(_))
        ));
        assert!(fleet.get_ring("C-RS1").is_ok());
    }

    #[tokio::test]
    async fn second_command_is_dropped_while_first_runs() {
        let fleet = Fleet::new(&two_station_config()).await.unwrap();

        let started = fleet.issue("C-BS", "first", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        assert!(started);
        assert!(fleet.command_in_flight("C-BS"));

        let started = fleet.issue("C-BS", "second", async {});
        assert!(!started, "second command must be dropped");

        // A different station is unaffected.
        assert!(fleet.issue("C-RS1", "other", async {}));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!fleet.command_in_flight("C-BS"));
        assert!(fleet.issue("C-BS", "third", async {}));
    }

    #[tokio::test]
    async fn process_reports_coarse_state_rows() {
        let fleet = Fleet::new(&two_station_config()).await.unwrap();
        let rows = fleet.process();

        assert_eq!(rows.len(), 2);
        let bs = rows.iter().find(|row| row.name == "C-BS").unwrap();
        assert_eq!(bs.state, "IDLE");
        assert_eq!(bs.num_bases, 0);
    }

    #[tokio::test]
    async fn feedback_stream_is_taken_once() {
        let fleet = Fleet::new(&two_station_config()).await.unwrap();
        assert!(fleet.take_feedback().is_some());
        assert!(fleet.take_feedback().is_none());
    }
}
