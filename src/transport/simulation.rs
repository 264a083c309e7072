//! Simulation backend: the external field simulator over the PLC wire schema.
//!
//! The simulator exposes every simulated station on its own port with a fixed
//! unit id, so the unit derivation used for single-server PLC deployments
//! does not apply here. On connect the heartbeat word is raised once to
//! announce the referee to the simulator.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::modbus::ModbusChannel;
use super::{
    MpsTransport, Register, RegisterEvent, RegisterValue, TransportConfig, TransportError,
    TransportState,
};

/// Unit id every simulated station answers on.
const SIMULATOR_UNIT: u8 = 1;

/// Transport speaking the PLC register schema to the external simulator.
pub struct SimulationTransport {
    channel: ModbusChannel,
}

impl SimulationTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            channel: ModbusChannel::new("Simulation", config, Some(SIMULATOR_UNIT)),
        }
    }
}

#[async_trait]
impl MpsTransport for SimulationTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.channel.connect().await?;
        // Announce ourselves; the simulator gates station activity on it.
        self.channel
            .write(Register::Heartbeat, RegisterValue::Flag(true))
            .await
    }

    async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    async fn write(&self, register: Register, value: RegisterValue) -> Result<(), TransportError> {
        self.channel.write(register, value).await
    }

    async fn read(&self, register: Register) -> Result<RegisterValue, TransportError> {
        self.channel.read(register).await
    }

    fn subscribe(&self, registers: &[Register]) -> mpsc::Receiver<RegisterEvent> {
        self.channel.subscribe(registers)
    }

    fn state(&self) -> TransportState {
        self.channel.state()
    }

    fn name(&self) -> &'static str {
        self.channel.backend()
    }
}
