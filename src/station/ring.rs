//! Ring station (RS): mounts colored rings, paid for with bases from the
//! station's slide.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::transport::opcode;

use super::{impl_common_ops, CommandError, RingColor, StationCore};

/// Refined handle on a Ring station.
#[derive(Clone)]
pub struct RingStation {
    core: Arc<StationCore>,
    costs: Arc<BTreeMap<RingColor, u16>>,
}

impl RingStation {
    /// Colors missing from `costs` fall back to the season defaults.
    pub(crate) fn from_core(
        core: Arc<StationCore>,
        costs: Option<BTreeMap<RingColor, u16>>,
    ) -> Self {
        let mut table: BTreeMap<RingColor, u16> = [
            RingColor::Blue,
            RingColor::Green,
            RingColor::Orange,
            RingColor::Yellow,
        ]
        .into_iter()
        .map(|color| (color, color.default_cost()))
        .collect();
        if let Some(overrides) = costs {
            table.extend(overrides);
        }
        Self {
            core,
            costs: Arc::new(table),
        }
    }

    pub(crate) fn core(&self) -> &Arc<StationCore> {
        &self.core
    }

    /// Payment bases a ring of this color consumes.
    pub fn cost(&self, color: RingColor) -> u16 {
        self.costs.get(&color).copied().unwrap_or(0)
    }

    /// Bases currently loaded on the payment slide.
    pub fn slide_count(&self) -> u16 {
        self.core.snapshot().slide_count
    }

    /// Mount one ring; the station consumes the color's cost from the slide.
    pub async fn mount_ring(&self, color: RingColor) -> Result<(), CommandError> {
        let cost = self.cost(color);
        info!(
            target: "MPS",
            "{}: mounting {:?} ring ({} bases)", self.core.name(), color, cost
        );
        self.core
            .execute(opcode::MOUNT_RING, &[color.code(), cost])
            .await
    }

    /// Zero the payment slide counter.
    pub async fn reset_base_counter(&self) -> Result<(), CommandError> {
        info!(target: "MPS", "{}: resetting base counter", self.core.name());
        self.core.execute(opcode::RESET_SLIDE, &[]).await
    }
}

impl_common_ops!(RingStation);

#[cfg(test)]
mod tests {
    use super::super::testutil::connected_core;
    use super::*;
    use crate::station::StationKind;
    use crate::transport::{Register, RegisterValue};

    #[tokio::test]
    async fn mount_ring_consumes_configured_cost() {
        let (core, mock, _rx) = connected_core("C-RS1", StationKind::Ring).await;
        mock.set_slide_count(3);
        let station = RingStation::from_core(
            core,
            Some(BTreeMap::from([(RingColor::Green, 2)])),
        );

        station.mount_ring(RingColor::Green).await.unwrap();

        assert_eq!(mock.slide_count(), 1);
        let writes = mock.writes();
        assert_eq!(
            writes[0],
            (Register::Action, RegisterValue::Word(opcode::MOUNT_RING))
        );
        assert_eq!(
            writes[1],
            (Register::Data0, RegisterValue::Word(RingColor::Green.code()))
        );
        assert_eq!(writes[2], (Register::Data1, RegisterValue::Word(2)));
    }

    #[tokio::test]
    async fn unconfigured_colors_use_season_defaults() {
        let (core, _mock, _rx) = connected_core("M-RS2", StationKind::Ring).await;
        let station = RingStation::from_core(core, None);
        assert_eq!(station.cost(RingColor::Blue), RingColor::Blue.default_cost());
        assert_eq!(station.cost(RingColor::Yellow), 0);
    }

    #[tokio::test]
    async fn slide_count_follows_status_feed() {
        let (core, mock, mut rx) = connected_core("C-RS2", StationKind::Ring).await;
        let station = RingStation::from_core(core, None);
        assert_eq!(station.slide_count(), 0);

        mock.fire(Register::SlideCountIn, RegisterValue::Word(4));
        rx.recv().await.unwrap();
        assert_eq!(station.slide_count(), 4);
    }

    #[tokio::test]
    async fn reset_base_counter_zeroes_slide() {
        let (core, mock, _rx) = connected_core("C-RS1", StationKind::Ring).await;
        mock.set_slide_count(5);
        let station = RingStation::from_core(core, None);

        station.reset_base_counter().await.unwrap();
        assert_eq!(mock.slide_count(), 0);
    }
}
