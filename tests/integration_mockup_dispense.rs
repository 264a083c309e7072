use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mps_control::{
    bridge::{Bridge, CommandHandler, CommandRegistrar, EngineHandle, RecordingEngine, RuleEngine},
    config::MpsConfig,
    fleet::Fleet,
};

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

/// Verify the full boot-and-dispense path end to end: a fleet with exactly
/// one Base station on the mockup backend, a dispense issued through the
/// registered engine shim, and a clean completion.
#[tokio::test]
async fn mockup_fleet_boots_and_dispenses() -> Result<()> {
    let config: MpsConfig = serde_json::from_str(
        r#"{
            "enable": true,
            "stations": {
                "C-BS": {
                    "type": "BS",
                    "host": "127.0.0.1",
                    "port": 4840,
                    "connection": "mockup"
                }
            }
        }"#,
    )?;

    let fleet = Arc::new(Fleet::new(&config).await?);
    assert_eq!(fleet.len(), 1);

    let engine = Arc::new(RecordingEngine::default());
    let bridge = Bridge::new(
        Arc::clone(&fleet),
        EngineHandle::new(Arc::clone(&engine) as Arc<dyn RuleEngine>),
    );
    let mut registrar = MapRegistrar::default();
    bridge.register_commands(&mut registrar);

    registrar.call("mps-bs-dispense", &["C-BS", "BASE_RED"]);

    // Wait for the ticket to drain.
    for _ in 0..200 {
        if !fleet.command_in_flight("C-BS") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!fleet.command_in_flight("C-BS"), "dispense never completed");

    // The mockup completed the command; the only facts are status feedback.
    assert!(engine
        .facts()
        .iter()
        .all(|fact| fact.starts_with("(mps-status-feedback C-BS")));
    Ok(())
}

/// Unknown stations are a no-op: nothing spawns and nothing is asserted.
#[tokio::test]
async fn unknown_station_commands_are_dropped() -> Result<()> {
    let config: MpsConfig = serde_json::from_str(
        r#"{
            "stations": {
                "C-BS": { "type": "BS", "host": "127.0.0.1", "port": 4840, "connection": "mockup" }
            }
        }"#,
    )?;

    let fleet = Arc::new(Fleet::new(&config).await?);
    let engine = Arc::new(RecordingEngine::default());
    let bridge = Bridge::new(
        Arc::clone(&fleet),
        EngineHandle::new(Arc::clone(&engine) as Arc<dyn RuleEngine>),
    );
    let mut registrar = MapRegistrar::default();
    bridge.register_commands(&mut registrar);

    registrar.call("mps-reset", &["X-ZZ"]);
    registrar.call("mps-deliver", &["X-ZZ"]);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!fleet.command_in_flight("X-ZZ"));
    assert!(engine.facts().is_empty());
    Ok(())
}
