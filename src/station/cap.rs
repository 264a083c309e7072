//! Cap station (CS): buffers caps retrieved from parked workpieces and
//! mounts them onto new ones.

use std::sync::Arc;

use tracing::info;

use crate::transport::opcode;

use super::{
    impl_common_ops, CommandError, ConveyorDirection, ConveyorSensor, StationCore, StationError,
};

/// The two things a Cap station can do with a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapOperation {
    Retrieve,
    Mount,
}

impl CapOperation {
    /// Spelling used on the rule-engine surface.
    pub fn as_str(self) -> &'static str {
        match self {
            CapOperation::Retrieve => "RETRIEVE_CAP",
            CapOperation::Mount => "MOUNT_CAP",
        }
    }
}

impl std::str::FromStr for CapOperation {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RETRIEVE_CAP" => Ok(CapOperation::Retrieve),
            "MOUNT_CAP" => Ok(CapOperation::Mount),
            _ => Err(StationError::InvalidEnum {
                what: "cap operation",
                value: s.to_string(),
            }),
        }
    }
}

/// Refined handle on a Cap station.
#[derive(Clone)]
pub struct CapStation {
    core: Arc<StationCore>,
}

impl CapStation {
    pub(crate) fn from_core(core: Arc<StationCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<StationCore> {
        &self.core
    }

    /// Pull the cap off the workpiece parked at the cap magazine.
    pub async fn retrieve_cap(&self) -> Result<(), CommandError> {
        info!(target: "MPS", "{}: retrieving cap", self.core.name());
        self.core.execute(opcode::RETRIEVE_CAP, &[]).await
    }

    /// Press the buffered cap onto the workpiece under the mount.
    pub async fn mount_cap(&self) -> Result<(), CommandError> {
        info!(target: "MPS", "{}: mounting cap", self.core.name());
        self.core.execute(opcode::MOUNT_CAP, &[]).await
    }

    pub async fn operate(&self, operation: CapOperation) -> Result<(), CommandError> {
        match operation {
            CapOperation::Retrieve => self.retrieve_cap().await,
            CapOperation::Mount => self.mount_cap().await,
        }
    }

    /// Drive the conveyor forward to the middle stop, under the cap tool.
    pub async fn band_on_until_mid(&self) -> Result<(), CommandError> {
        self.core
            .conveyor_move(ConveyorDirection::Forward, ConveyorSensor::Middle)
            .await
    }

    /// Drive the conveyor forward to the output stop.
    pub async fn band_on_until_out(&self) -> Result<(), CommandError> {
        self.core
            .conveyor_move(ConveyorDirection::Forward, ConveyorSensor::Output)
            .await
    }
}

impl_common_ops!(CapStation);
