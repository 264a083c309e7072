//! Base station (BS): dispenses colored workpiece bases to its in-feed.

use std::sync::Arc;

use tracing::info;

use crate::transport::opcode;

use super::{impl_common_ops, BaseColor, CommandError, StationCore};

/// Refined handle on a Base station.
#[derive(Clone)]
pub struct BaseStation {
    core: Arc<StationCore>,
}

impl BaseStation {
    pub(crate) fn from_core(core: Arc<StationCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<StationCore> {
        &self.core
    }

    /// Dispense one workpiece of the given color to the in-feed.
    pub async fn get_base(&self, color: BaseColor) -> Result<(), CommandError> {
        info!(target: "MPS", "{}: dispensing {:?} base", self.core.name(), color);
        self.core
            .execute(opcode::DISPENSE_BASE, &[color.code()])
            .await
    }
}

impl_common_ops!(BaseStation);
