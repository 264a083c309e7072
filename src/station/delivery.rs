//! Delivery station (DS): accepts a finished product and routes it to one of
//! three delivery gates.

use std::sync::Arc;

use tracing::info;

use crate::transport::opcode;

use super::{impl_common_ops, CommandError, DeliveryGate, StationCore};

/// Refined handle on a Delivery station.
#[derive(Clone)]
pub struct DeliveryStation {
    core: Arc<StationCore>,
}

impl DeliveryStation {
    pub(crate) fn from_core(core: Arc<StationCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<StationCore> {
        &self.core
    }

    /// Route the product at the in-feed to the given gate.
    pub async fn deliver_product(&self, gate: DeliveryGate) -> Result<(), CommandError> {
        info!(
            target: "MPS",
            "{}: delivering to gate {}", self.core.name(), gate.number()
        );
        self.core
            .execute(opcode::DELIVER, &[u16::from(gate.number())])
            .await
    }
}

impl_common_ops!(DeliveryStation);

#[cfg(test)]
mod tests {
    use super::super::testutil::connected_core;
    use super::*;
    use crate::station::StationKind;

    #[tokio::test]
    async fn deliver_routes_to_requested_gate() {
        let (core, mock, _rx) = connected_core("C-DS", StationKind::Delivery).await;
        let station = DeliveryStation::from_core(core);

        station
            .deliver_product(DeliveryGate::new(2).unwrap())
            .await
            .unwrap();
        station
            .deliver_product(DeliveryGate::new(3).unwrap())
            .await
            .unwrap();

        assert_eq!(mock.delivered(), vec![2, 3]);
    }
}
