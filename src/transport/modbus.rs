//! Shared Modbus/TCP channel used by the PLC and simulation backends.
//!
//! One channel owns one Modbus context. Command slots live in the holding
//! register block, status inputs in the input register block; a background
//! sweep task reads the input block on a fixed interval, synthesizes change
//! events for subscribers and toggles the heartbeat word so the station's
//! watchdog sees a live referee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::Slave;
use tracing::{debug, warn};

use crate::defaults;

use super::{Register, RegisterEvent, RegisterValue, TransportConfig, TransportError, TransportState};

/// Holding register addresses of the command block.
const ADDR_ACTION: u16 = 0;
const ADDR_DATA0: u16 = 1;
const ADDR_DATA1: u16 = 2;
const ADDR_STATUS_ENABLE: u16 = 3;
const ADDR_LIGHT_RED: u16 = 4;
const ADDR_LIGHT_YELLOW: u16 = 5;
const ADDR_LIGHT_GREEN: u16 = 6;
const ADDR_HEARTBEAT: u16 = 7;

/// Input register addresses of the status block.
const ADDR_READY_IN: u16 = 0;
const ADDR_BUSY_IN: u16 = 1;
const ADDR_BARCODE_LO: u16 = 2;
const ADDR_BARCODE_HI: u16 = 3;
const ADDR_SLIDECOUNT_IN: u16 = 4;

/// Number of words in one input block sweep.
const INPUT_BLOCK_LEN: u16 = 5;

/// Per-request deadline; connection loss otherwise stalls a write forever.
const IO_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

fn command_address(register: Register) -> Option<u16> {
    match register {
        Register::Action => Some(ADDR_ACTION),
        Register::Data0 => Some(ADDR_DATA0),
        Register::Data1 => Some(ADDR_DATA1),
        Register::StatusEnable => Some(ADDR_STATUS_ENABLE),
        Register::LightRed => Some(ADDR_LIGHT_RED),
        Register::LightYellow => Some(ADDR_LIGHT_YELLOW),
        Register::LightGreen => Some(ADDR_LIGHT_GREEN),
        Register::Heartbeat => Some(ADDR_HEARTBEAT),
        _ => None,
    }
}

fn encode_word(register: Register, value: RegisterValue) -> Result<u16, TransportError> {
    match value {
        RegisterValue::Flag(b) => Ok(u16::from(b)),
        RegisterValue::Word(w) => Ok(w),
        RegisterValue::Int(_) => Err(TransportError::Protocol(format!(
            "register {register} does not take an int32"
        ))),
    }
}

/// Decoded snapshot of the input block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InputImage {
    pub ready: bool,
    pub busy: bool,
    pub barcode: i32,
    pub slide_count: u16,
}

impl InputImage {
    pub(crate) fn decode(words: &[u16]) -> Result<Self, TransportError> {
        if words.len() < INPUT_BLOCK_LEN as usize {
            return Err(TransportError::Protocol(format!(
                "short input block: {} words",
                words.len()
            )));
        }
        Ok(Self {
            ready: words[ADDR_READY_IN as usize] != 0,
            busy: words[ADDR_BUSY_IN as usize] != 0,
            barcode: (i32::from(words[ADDR_BARCODE_HI as usize]) << 16)
                | i32::from(words[ADDR_BARCODE_LO as usize]),
            slide_count: words[ADDR_SLIDECOUNT_IN as usize],
        })
    }

    /// Events for every field that changed relative to `prev`. With no prior
    /// image (first sweep after connect) every field is reported, so the
    /// station picks up its initial state.
    pub(crate) fn diff(prev: Option<&InputImage>, next: &InputImage) -> Vec<RegisterEvent> {
        let mut events = Vec::new();
        if prev.map_or(true, |p| p.ready != next.ready) {
            events.push(RegisterEvent {
                register: Register::StatusReadyIn,
                value: RegisterValue::Flag(next.ready),
            });
        }
        if prev.map_or(true, |p| p.busy != next.busy) {
            events.push(RegisterEvent {
                register: Register::StatusBusyIn,
                value: RegisterValue::Flag(next.busy),
            });
        }
        if prev.map_or(true, |p| p.barcode != next.barcode) {
            events.push(RegisterEvent {
                register: Register::BarcodeIn,
                value: RegisterValue::Int(next.barcode),
            });
        }
        if prev.map_or(true, |p| p.slide_count != next.slide_count) {
            events.push(RegisterEvent {
                register: Register::SlideCountIn,
                value: RegisterValue::Word(next.slide_count),
            });
        }
        events
    }
}

struct Subscriber {
    registers: Vec<Register>,
    tx: mpsc::Sender<RegisterEvent>,
}

/// One Modbus connection plus its sweep task and subscriber registry.
pub(crate) struct ModbusChannel {
    backend: &'static str,
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    backend: &'static str,
    config: TransportConfig,
    unit: Slave,
    ctx: tokio::sync::Mutex<Option<Context>>,
    state: Mutex<TransportState>,
    subscribers: Mutex<Vec<Subscriber>>,
    last_image: Mutex<Option<InputImage>>,
    heartbeat: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusChannel {
    /// `unit` overrides the config-derived unit id; the simulation backend
    /// pins it to the simulator's fixed unit.
    pub(crate) fn new(backend: &'static str, config: TransportConfig, unit: Option<u8>) -> Self {
        let unit = Slave(unit.unwrap_or(config.unit));
        Self {
            backend,
            inner: Arc::new(ChannelInner {
                backend,
                config,
                unit,
                ctx: tokio::sync::Mutex::new(None),
                state: Mutex::new(TransportState::Uninitialized),
                subscribers: Mutex::new(Vec::new()),
                last_image: Mutex::new(None),
                heartbeat: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn backend(&self) -> &'static str {
        self.backend
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    pub(crate) async fn connect(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        let addr = format!("{}:{}", inner.config.host, inner.config.port);
        debug!("{} connecting to {} (unit {})", inner.backend, addr, inner.unit.0);
        *inner.state.lock() = TransportState::Connecting;

        let stream = match timeout(defaults::CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Err(_) => {
                *inner.state.lock() = TransportState::Disconnected;
                return Err(TransportError::Timeout);
            }
            Ok(Err(err)) => {
                debug!("{} connect to {} failed: {}", inner.backend, addr, err);
                *inner.state.lock() = TransportState::Disconnected;
                return Err(TransportError::Disconnected);
            }
            Ok(Ok(stream)) => stream,
        };

        // Tune the socket for the small, latency-sensitive register writes
        // this link carries.
        let stream = (|| -> std::io::Result<TcpStream> {
            let std_stream = stream.into_std()?;
            let socket = socket2::Socket::from(std_stream.try_clone()?);
            socket.set_nodelay(true)?;
            TcpStream::from_std(std_stream)
        })()
        .map_err(|err| {
            debug!("{} socket setup for {} failed: {}", inner.backend, addr, err);
            *inner.state.lock() = TransportState::Disconnected;
            TransportError::Disconnected
        })?;

        let ctx = tcp::attach_slave(stream, inner.unit);
        *inner.ctx.lock().await = Some(ctx);
        *inner.last_image.lock() = None;
        *inner.state.lock() = TransportState::Connected;
        debug!("{} connected to {}", inner.backend, addr);

        // (Re)start the input sweep.
        let mut sweeper = inner.sweeper.lock();
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
        *sweeper = Some(tokio::spawn(Arc::clone(inner).sweep_loop()));
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        let inner = &self.inner;
        if let Some(handle) = inner.sweeper.lock().take() {
            handle.abort();
        }
        if let Some(mut ctx) = inner.ctx.lock().await.take() {
            let _ = ctx.disconnect().await;
        }
        *inner.state.lock() = TransportState::Disconnected;
        debug!("{} disconnected from {}", inner.backend, inner.config.host);
    }

    pub(crate) async fn write(
        &self,
        register: Register,
        value: RegisterValue,
    ) -> Result<(), TransportError> {
        let addr = command_address(register).ok_or_else(|| {
            TransportError::Protocol(format!("register {register} is not writable"))
        })?;
        let word = encode_word(register, value)?;

        let mut guard = self.inner.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(TransportError::Disconnected)?;
        match timeout(IO_TIMEOUT, ctx.write_single_register(addr, word)).await {
            Err(_) => {
                drop(guard);
                self.inner.mark_lost("write timed out");
                Err(TransportError::Timeout)
            }
            Ok(Err(err)) => {
                drop(guard);
                self.inner.mark_lost(&err.to_string());
                Err(TransportError::Disconnected)
            }
            Ok(Ok(resp)) => {
                resp.map_err(|exc| TransportError::Protocol(exc.to_string()))?;
                Ok(())
            }
        }
    }

    pub(crate) async fn read(&self, register: Register) -> Result<RegisterValue, TransportError> {
        let mut guard = self.inner.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(TransportError::Disconnected)?;

        let (addr, count, input) = match register {
            Register::StatusReadyIn => (ADDR_READY_IN, 1, true),
            Register::StatusBusyIn => (ADDR_BUSY_IN, 1, true),
            Register::BarcodeIn => (ADDR_BARCODE_LO, 2, true),
            Register::SlideCountIn => (ADDR_SLIDECOUNT_IN, 1, true),
            other => {
                let addr = command_address(other).ok_or_else(|| {
                    TransportError::Protocol(format!("register {other} is not readable"))
                })?;
                (addr, 1, false)
            }
        };

        let request = async {
            if input {
                ctx.read_input_registers(addr, count).await
            } else {
                ctx.read_holding_registers(addr, count).await
            }
        };
        let words = match timeout(IO_TIMEOUT, request).await {
            Err(_) => {
                drop(guard);
                self.inner.mark_lost("read timed out");
                return Err(TransportError::Timeout);
            }
            Ok(Err(err)) => {
                drop(guard);
                self.inner.mark_lost(&err.to_string());
                return Err(TransportError::Disconnected);
            }
            Ok(Ok(resp)) => resp.map_err(|exc| TransportError::Protocol(exc.to_string()))?,
        };

        match register {
            Register::StatusReadyIn | Register::StatusBusyIn | Register::StatusEnable => {
                Ok(RegisterValue::Flag(words.first().copied().unwrap_or(0) != 0))
            }
            Register::BarcodeIn => {
                if words.len() < 2 {
                    return Err(TransportError::Protocol("short barcode read".into()));
                }
                Ok(RegisterValue::Int(
                    (i32::from(words[1]) << 16) | i32::from(words[0]),
                ))
            }
            _ => Ok(RegisterValue::Word(words.first().copied().unwrap_or(0))),
        }
    }

    pub(crate) fn subscribe(&self, registers: &[Register]) -> mpsc::Receiver<RegisterEvent> {
        let (tx, rx) = mpsc::channel(defaults::EVENT_QUEUE_DEPTH);
        self.inner.subscribers.lock().push(Subscriber {
            registers: registers.to_vec(),
            tx,
        });
        rx
    }
}

impl ChannelInner {
    fn mark_lost(&self, reason: &str) {
        let mut state = self.state.lock();
        if *state == TransportState::Connected {
            warn!(
                "{} connection to {}:{} lost: {}",
                self.backend, self.config.host, self.config.port, reason
            );
        }
        *state = TransportState::Disconnected;
    }

    fn dispatch(&self, events: &[RegisterEvent]) {
        let subscribers = self.subscribers.lock();
        for event in events {
            for sub in subscribers.iter() {
                if !sub.registers.contains(&event.register) {
                    continue;
                }
                // Never block the sweep on a slow consumer.
                if sub.tx.try_send(*event).is_err() {
                    warn!(
                        "{} event queue full, dropping {} update",
                        self.backend, event.register
                    );
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep_once().await {
                self.mark_lost(&err.to_string());
                self.ctx.lock().await.take();
                break;
            }
        }
    }

    async fn sweep_once(&self) -> Result<(), TransportError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(TransportError::Disconnected)?;

        let words = match timeout(IO_TIMEOUT, ctx.read_input_registers(0, INPUT_BLOCK_LEN)).await {
            Err(_) => return Err(TransportError::Timeout),
            Ok(Err(_)) => return Err(TransportError::Disconnected),
            Ok(Ok(resp)) => resp.map_err(|exc| TransportError::Protocol(exc.to_string()))?,
        };

        let beat = !self.heartbeat.fetch_xor(true, Ordering::Relaxed);
        match timeout(
            IO_TIMEOUT,
            ctx.write_single_register(ADDR_HEARTBEAT, u16::from(beat)),
        )
        .await
        {
            Err(_) => return Err(TransportError::Timeout),
            Ok(Err(_)) => return Err(TransportError::Disconnected),
            Ok(Ok(resp)) => resp.map_err(|exc| TransportError::Protocol(exc.to_string()))?,
        }
        drop(guard);

        let image = InputImage::decode(&words)?;
        let events = {
            let mut last = self.last_image.lock();
            let events = InputImage::diff(last.as_ref(), &image);
            *last = Some(image);
            events
        };
        self.dispatch(&events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_combines_barcode_words() {
        let image = InputImage::decode(&[1, 0, 0x5678, 0x1234, 3]).unwrap();
        assert!(image.ready);
        assert!(!image.busy);
        assert_eq!(image.barcode, 0x1234_5678);
        assert_eq!(image.slide_count, 3);
    }

    #[test]
    fn decode_rejects_short_block() {
        assert!(InputImage::decode(&[1, 0]).is_err());
    }

    #[test]
    fn first_sweep_reports_every_field() {
        let image = InputImage::decode(&[0, 1, 7, 0, 2]).unwrap();
        let events = InputImage::diff(None, &image);
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            RegisterEvent {
                register: Register::StatusReadyIn,
                value: RegisterValue::Flag(false),
            }
        );
        assert_eq!(
            events[1],
            RegisterEvent {
                register: Register::StatusBusyIn,
                value: RegisterValue::Flag(true),
            }
        );
    }

    #[test]
    fn diff_reports_only_changes() {
        let prev = InputImage {
            ready: false,
            busy: false,
            barcode: 0,
            slide_count: 2,
        };
        let next = InputImage {
            busy: true,
            slide_count: 1,
            ..prev
        };
        let events = InputImage::diff(Some(&prev), &next);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].register, Register::StatusBusyIn);
        assert_eq!(events[1].register, Register::SlideCountIn);
        assert_eq!(events[1].value, RegisterValue::Word(1));
    }

    #[test]
    fn inputs_are_not_writable() {
        assert!(command_address(Register::StatusBusyIn).is_none());
        assert!(command_address(Register::BarcodeIn).is_none());
        assert_eq!(command_address(Register::Action), Some(ADDR_ACTION));
    }

    #[test]
    fn int_values_are_rejected_on_write() {
        assert!(encode_word(Register::Data0, RegisterValue::Int(5)).is_err());
        assert_eq!(
            encode_word(Register::StatusEnable, RegisterValue::Flag(true)).unwrap(),
            1
        );
    }
}
