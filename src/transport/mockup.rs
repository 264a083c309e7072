//! Mockup backend: in-process stand-in for a station.
//!
//! Writes succeed synchronously and are recorded. A rising edge on
//! `STATUS_ENABLE` applies the armed command's visible effect (dispense
//! record, slide-counter decrement, delivery record) and synthesizes the
//! BUSY high/low pulse a real station would produce, so commands complete
//! immediately. The test harness can inject arbitrary input events with
//! [`MockupTransport::fire`]. This backend takes the hardware out of the loop
//! for CI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::defaults;

use super::{
    opcode, MpsTransport, Register, RegisterEvent, RegisterValue, TransportError, TransportState,
};

struct Subscriber {
    registers: Vec<Register>,
    tx: mpsc::Sender<RegisterEvent>,
}

#[derive(Default)]
struct CommandImage {
    action: u16,
    data0: u16,
    data1: u16,
    enable: bool,
}

#[derive(Default)]
struct InputImage {
    ready: bool,
    busy: bool,
    barcode: i32,
    slide_count: u16,
}

struct MockupInner {
    state: Mutex<TransportState>,
    subscribers: Mutex<Vec<Subscriber>>,
    command: Mutex<CommandImage>,
    inputs: Mutex<InputImage>,
    writes: Mutex<Vec<(Register, RegisterValue)>>,
    dispensed: Mutex<Vec<u16>>,
    delivered: Mutex<Vec<u16>>,
    auto_complete: AtomicBool,
}

/// Cheaply cloneable handle; clones share the recorded state, so a test can
/// keep one clone while the station owns the other.
#[derive(Clone)]
pub struct MockupTransport {
    inner: Arc<MockupInner>,
}

impl Default for MockupTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockupTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockupInner {
                state: Mutex::new(TransportState::Uninitialized),
                subscribers: Mutex::new(Vec::new()),
                command: Mutex::new(CommandImage::default()),
                inputs: Mutex::new(InputImage::default()),
                writes: Mutex::new(Vec::new()),
                dispensed: Mutex::new(Vec::new()),
                delivered: Mutex::new(Vec::new()),
                auto_complete: AtomicBool::new(true),
            }),
        }
    }

    /// Inject an input-register event, as the test harness's stand-in for the
    /// station publishing a change.
    pub fn fire(&self, register: Register, value: RegisterValue) {
        {
            let mut inputs = self.inner.inputs.lock();
            match (register, value) {
                (Register::StatusReadyIn, v) => inputs.ready = v.as_flag(),
                (Register::StatusBusyIn, v) => inputs.busy = v.as_flag(),
                (Register::BarcodeIn, RegisterValue::Int(code)) => inputs.barcode = code,
                (Register::SlideCountIn, RegisterValue::Word(count)) => {
                    inputs.slide_count = count;
                }
                _ => {}
            }
        }
        self.inner.dispatch(RegisterEvent { register, value });
    }

    /// Disable the automatic BUSY pulse so commands hang until the test
    /// completes (or times out) on its own terms.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.inner.auto_complete.store(enabled, Ordering::Relaxed);
    }

    /// Drop the simulated connection; subsequent writes fail until the next
    /// `connect`.
    pub fn sever(&self) {
        *self.inner.state.lock() = TransportState::Disconnected;
    }

    /// Preload the payment slide of a simulated Ring station.
    pub fn set_slide_count(&self, count: u16) {
        self.inner.inputs.lock().slide_count = count;
    }

    /// Every write issued so far, in order.
    pub fn writes(&self) -> Vec<(Register, RegisterValue)> {
        self.inner.writes.lock().clone()
    }

    /// Base colors dispensed so far (wire codes, in order).
    pub fn dispensed(&self) -> Vec<u16> {
        self.inner.dispensed.lock().clone()
    }

    /// Delivery gates routed so far (wire codes, in order).
    pub fn delivered(&self) -> Vec<u16> {
        self.inner.delivered.lock().clone()
    }

    pub fn slide_count(&self) -> u16 {
        self.inner.inputs.lock().slide_count
    }

    fn apply_command(&self) {
        let (action, data0, data1) = {
            let command = self.inner.command.lock();
            (command.action, command.data0, command.data1)
        };
        debug!("Mockup executing action {action} ({data0}, {data1})");

        match action {
            opcode::DISPENSE_BASE => self.inner.dispensed.lock().push(data0),
            opcode::DELIVER => self.inner.delivered.lock().push(data0),
            opcode::MOUNT_RING => {
                let count = {
                    let mut inputs = self.inner.inputs.lock();
                    inputs.slide_count = inputs.slide_count.saturating_sub(data1);
                    inputs.slide_count
                };
                self.fire(Register::SlideCountIn, RegisterValue::Word(count));
            }
            opcode::RESET_SLIDE => {
                self.inner.inputs.lock().slide_count = 0;
                self.fire(Register::SlideCountIn, RegisterValue::Word(0));
            }
            opcode::RESET | opcode::MOVE_CONVEYOR | opcode::RETRIEVE_CAP | opcode::MOUNT_CAP => {}
            other => warn!("Mockup ignoring unknown action {other}"),
        }

        // The pulse a real station produces around command execution.
        self.fire(Register::StatusBusyIn, RegisterValue::Flag(true));
        self.fire(Register::StatusBusyIn, RegisterValue::Flag(false));
    }
}

impl MockupInner {
    fn dispatch(&self, event: RegisterEvent) {
        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            if !sub.registers.contains(&event.register) {
                continue;
            }
            if sub.tx.try_send(event).is_err() {
                warn!("Mockup event queue full, dropping {} update", event.register);
            }
        }
    }
}

#[async_trait]
impl MpsTransport for MockupTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        *self.inner.state.lock() = TransportState::Connected;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.inner.state.lock() = TransportState::Disconnected;
    }

    async fn write(&self, register: Register, value: RegisterValue) -> Result<(), TransportError> {
        if *self.inner.state.lock() != TransportState::Connected {
            return Err(TransportError::Disconnected);
        }
        self.inner.writes.lock().push((register, value));

        let fire_command = {
            let mut command = self.inner.command.lock();
            match register {
                Register::Action => {
                    command.action = match value {
                        RegisterValue::Word(w) => w,
                        other => {
                            return Err(TransportError::Protocol(format!(
                                "unexpected ACTION value {other:?}"
                            )))
                        }
                    };
                    false
                }
                Register::Data0 => {
                    if let RegisterValue::Word(w) = value {
                        command.data0 = w;
                    }
                    false
                }
                Register::Data1 => {
                    if let RegisterValue::Word(w) = value {
                        command.data1 = w;
                    }
                    false
                }
                Register::StatusEnable => {
                    let level = value.as_flag();
                    let rising = level && !command.enable;
                    command.enable = level;
                    rising && self.inner.auto_complete.load(Ordering::Relaxed)
                }
                _ => false,
            }
        };

        if fire_command {
            self.apply_command();
        }
        Ok(())
    }

    async fn read(&self, register: Register) -> Result<RegisterValue, TransportError> {
        if *self.inner.state.lock() != TransportState::Connected {
            return Err(TransportError::Disconnected);
        }
        let inputs = self.inner.inputs.lock();
        let value = match register {
            Register::StatusReadyIn => RegisterValue::Flag(inputs.ready),
            Register::StatusBusyIn => RegisterValue::Flag(inputs.busy),
            Register::BarcodeIn => RegisterValue::Int(inputs.barcode),
            Register::SlideCountIn => RegisterValue::Word(inputs.slide_count),
            other => {
                let command = self.inner.command.lock();
                match other {
                    Register::Action => RegisterValue::Word(command.action),
                    Register::Data0 => RegisterValue::Word(command.data0),
                    Register::Data1 => RegisterValue::Word(command.data1),
                    Register::StatusEnable => RegisterValue::Flag(command.enable),
                    _ => RegisterValue::Word(0),
                }
            }
        };
        Ok(value)
    }

    fn subscribe(&self, registers: &[Register]) -> mpsc::Receiver<RegisterEvent> {
        let (tx, rx) = mpsc::channel(defaults::EVENT_QUEUE_DEPTH);
        self.inner.subscribers.lock().push(Subscriber {
            registers: registers.to_vec(),
            tx,
        });
        rx
    }

    fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    fn name(&self) -> &'static str {
        "Mockup"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_fail_until_connected() {
        let mock = MockupTransport::new();
        assert!(mock
            .write(Register::Action, RegisterValue::Word(1))
            .await
            .is_err());
        mock.connect().await.unwrap();
        assert!(mock
            .write(Register::Action, RegisterValue::Word(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn enable_edge_pulses_busy_in_order() {
        let mock = MockupTransport::new();
        let mut events = mock.subscribe(&[Register::StatusBusyIn]);
        mock.connect().await.unwrap();

        mock.write(Register::Action, RegisterValue::Word(opcode::MOVE_CONVEYOR))
            .await
            .unwrap();
        mock.write(Register::StatusEnable, RegisterValue::Flag(true))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.value, RegisterValue::Flag(true));
        assert_eq!(second.value, RegisterValue::Flag(false));
    }

    #[tokio::test]
    async fn enable_must_fall_before_next_pulse() {
        let mock = MockupTransport::new();
        let mut events = mock.subscribe(&[Register::StatusBusyIn]);
        mock.connect().await.unwrap();

        mock.write(Register::StatusEnable, RegisterValue::Flag(true))
            .await
            .unwrap();
        // Still high: no second rising edge, no second pulse.
        mock.write(Register::StatusEnable, RegisterValue::Flag(true))
            .await
            .unwrap();

        assert!(events.recv().await.is_some());
        assert!(events.recv().await.is_some());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispense_is_recorded() {
        let mock = MockupTransport::new();
        mock.connect().await.unwrap();
        mock.write(Register::Action, RegisterValue::Word(opcode::DISPENSE_BASE))
            .await
            .unwrap();
        mock.write(Register::Data0, RegisterValue::Word(2))
            .await
            .unwrap();
        mock.write(Register::StatusEnable, RegisterValue::Flag(true))
            .await
            .unwrap();
        assert_eq!(mock.dispensed(), vec![2]);
    }

    #[tokio::test]
    async fn mount_ring_decrements_slide() {
        let mock = MockupTransport::new();
        let mut events = mock.subscribe(&[Register::SlideCountIn]);
        mock.set_slide_count(3);
        mock.connect().await.unwrap();

        mock.write(Register::Action, RegisterValue::Word(opcode::MOUNT_RING))
            .await
            .unwrap();
        mock.write(Register::Data1, RegisterValue::Word(2))
            .await
            .unwrap();
        mock.write(Register::StatusEnable, RegisterValue::Flag(true))
            .await
            .unwrap();

        assert_eq!(mock.slide_count(), 1);
        assert_eq!(
            events.recv().await.unwrap().value,
            RegisterValue::Word(1)
        );
    }

    #[tokio::test]
    async fn fired_events_reach_matching_subscribers_only() {
        let mock = MockupTransport::new();
        let mut busy = mock.subscribe(&[Register::StatusBusyIn]);
        let mut barcode = mock.subscribe(&[Register::BarcodeIn]);

        mock.fire(Register::BarcodeIn, RegisterValue::Int(77));
        assert_eq!(
            barcode.try_recv().unwrap().value,
            RegisterValue::Int(77)
        );
        assert!(busy.try_recv().is_err());
    }
}
