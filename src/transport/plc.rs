//! PLC backend: Modbus/TCP to the programmable controller inside a station.
//!
//! This is the wire profile compiled into this build (the field alternates
//! between Modbus and OPC-UA generations; the register schema is identical).
//! Subscriptions are synthesized by the shared channel's polling sweep, since
//! Modbus has no server push.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::modbus::ModbusChannel;
use super::{
    MpsTransport, Register, RegisterEvent, RegisterValue, TransportConfig, TransportError,
    TransportState,
};

/// Transport speaking Modbus/TCP to the real PLC.
pub struct PlcTransport {
    channel: ModbusChannel,
}

impl PlcTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            channel: ModbusChannel::new("PLC", config, None),
        }
    }
}

#[async_trait]
impl MpsTransport for PlcTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.channel.connect().await
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
