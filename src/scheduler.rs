/// Port scheduler
///
/// One scheduler exclusively owns one transport port and the device
/// sessions attached to it. A single task runs the poll loop: between
/// scheduled reads it waits a bounded slice of the poll interval for
/// asynchronous write requests, drains them, and only then issues the
/// next read, so bytes of different transactions never interleave on
/// the bus.
///
/// Exactly one external thread is recognized: the write requester. It
/// talks to the scheduler through a mutex-guarded queue plus a
/// notification handle and never touches the port or register state.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

use crate::device::{DeviceConfig, DeviceSession};
use crate::error::{BusError, BusResult};
use crate::events::{ErrorChange, EventSink, PendingEvent, RegisterHandle, ValueChange};
use crate::executor;
use crate::query::Query;
use crate::register::{ErrorState, RegisterDef};
use crate::transport::{Port, RtuPort, SerialSettings};

/// Default duration of one poll cycle's flush waits in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20;

/// Handle to a device registered with a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(pub(crate) usize);

/// Top-level configuration of one serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub serial: SerialSettings,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub debug: bool,
    /// Re-publish a stable value after this many cycles; <= 0 disables
    #[serde(default = "default_max_unchanged_cycles")]
    pub max_unchanged_cycles: i32,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_unchanged_cycles() -> i32 {
    -1
}

impl PortConfig {
    /// Parse a port configuration from JSON
    pub fn from_json(json: &str) -> BusResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Value carried by an asynchronous write request
#[derive(Debug, Clone)]
pub enum WriteValue {
    /// Raw wire value
    Raw(u64),
    /// Text parsed through the register's format at flush time
    Text(String),
}

#[derive(Debug)]
struct WriteRequest {
    handle: RegisterHandle,
    value: WriteValue,
}

/// Queue plus wakeup flag shared with the write requester
struct FlushShared {
    queue: Mutex<VecDeque<WriteRequest>>,
    notify: Notify,
}

/// Cloneable handle for requesting register writes from another thread
///
/// Writes are queued and flushed by the scheduler between reads with
/// at-most-once delivery: each request maps to exactly one wire
/// transaction, never retried and never coalesced with another.
#[derive(Clone)]
pub struct WriteHandle {
    shared: Arc<FlushShared>,
}

impl WriteHandle {
    /// Request a raw-value write
    pub fn write_raw(&self, handle: RegisterHandle, raw: u64) {
        self.push(WriteRequest {
            handle,
            value: WriteValue::Raw(raw),
        });
    }

    /// Request a write of a text value
    pub fn write_text(&self, handle: RegisterHandle, text: impl Into<String>) {
        self.push(WriteRequest {
            handle,
            value: WriteValue::Text(text.into()),
        });
    }

    fn push(&self, request: WriteRequest) {
        self.shared.queue.lock().unwrap().push_back(request);
        self.shared.notify.notify_one();
    }
}

/// Cloneable handle for stopping a running scheduler
///
/// Cooperative: the scheduler observes the flag at the top of each
/// query iteration and closes the port after the in-flight request
/// completes.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Driver for one serial port and its devices
pub struct PortScheduler {
    port: Box<dyn Port + Send>,
    sessions: Vec<DeviceSession>,
    poll_interval: Duration,
    max_unchanged_cycles: i32,
    debug: bool,
    sink: EventSink,
    shared: Arc<FlushShared>,
    stop: Arc<AtomicBool>,
    last_device: Option<usize>,
    started: bool,
}

impl PortScheduler {
    /// Create a scheduler around an already-constructed port
    pub fn new(port: Box<dyn Port + Send>, sink: EventSink) -> Self {
        Self {
            port,
            sessions: Vec::new(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_unchanged_cycles: -1,
            debug: false,
            sink,
            shared: Arc::new(FlushShared {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            last_device: None,
            started: false,
        }
    }

    /// Create a scheduler, serial port and devices from a configuration
    pub fn from_config(config: PortConfig, sink: EventSink) -> BusResult<Self> {
        let port = RtuPort::new(config.serial.clone()).with_logger(sink.logger().clone());
        let mut scheduler = Self::new(Box::new(port), sink);
        scheduler.poll_interval = Duration::from_millis(config.poll_interval_ms);
        scheduler.max_unchanged_cycles = config.max_unchanged_cycles;
        scheduler.set_debug(config.debug);
        for device in config.devices {
            scheduler.add_device(device)?;
        }
        Ok(scheduler)
    }

    /// Set the poll interval shared out across the cycle's flush waits
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// Set the unchanged-value republication cadence; <= 0 disables
    pub fn set_max_unchanged_cycles(&mut self, cycles: i32) {
        self.max_unchanged_cycles = cycles;
    }

    /// Toggle frame-level debug dumps
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
        self.port.set_debug(debug);
    }

    /// Whether frame-level debug dumps are enabled
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Attach a device to this port
    ///
    /// Devices cannot be added once the scheduler has started.
    pub fn add_device(&mut self, config: DeviceConfig) -> BusResult<DeviceHandle> {
        if self.started {
            return Err(BusError::configuration(
                "cannot add devices to a started scheduler",
            ));
        }
        if self
            .sessions
            .iter()
            .any(|s| s.config().slave_id == config.slave_id)
        {
            return Err(BusError::configuration(format!(
                "duplicate slave id {} on this port",
                config.slave_id
            )));
        }
        self.sink
            .logger()
            .debug(&format!("add device: {} @ {}", config.id, config.slave_id));
        self.sessions.push(DeviceSession::new(config)?);
        Ok(DeviceHandle(self.sessions.len() - 1))
    }

    /// Register one logical register on a device
    pub fn add_register(
        &mut self,
        device: DeviceHandle,
        def: RegisterDef,
    ) -> BusResult<RegisterHandle> {
        if self.started {
            return Err(BusError::configuration(
                "cannot add registers to a started scheduler",
            ));
        }
        let session = self
            .sessions
            .get_mut(device.0)
            .ok_or_else(|| BusError::internal("unknown device handle"))?;
        let slot = session.add_register(def)?;
        Ok(RegisterHandle {
            device: device.0,
            slot,
        })
    }

    /// Handle for the external write requester
    pub fn write_handle(&self) -> WriteHandle {
        WriteHandle {
            shared: self.shared.clone(),
        }
    }

    /// Handle for stopping the poll loop
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
        }
    }

    /// Whether a register was read successfully at least once
    pub fn did_read(&self, handle: RegisterHandle) -> bool {
        self.state_of(handle)
            .map(|s| s.did_read())
            .unwrap_or(false)
    }

    /// Current error condition of a register
    pub fn error_state(&self, handle: RegisterHandle) -> ErrorState {
        self.state_of(handle)
            .map(|s| s.error_state())
            .unwrap_or(ErrorState::Unknown)
    }

    /// Current value of a register, rendered through its format
    pub fn text_value(&self, handle: RegisterHandle) -> Option<String> {
        let session = self.sessions.get(handle.device)?;
        let slot = session.slots().get(handle.slot)?;
        Some(slot.def.format.render(slot.state.value()))
    }

    fn state_of(&self, handle: RegisterHandle) -> Option<&crate::register::RegisterState> {
        Some(
            &self
                .sessions
                .get(handle.device)?
                .slots()
                .get(handle.slot)?
                .state,
        )
    }

    /// Open the port and freeze the plan
    ///
    /// Re-entrant: an already-started scheduler only reopens the port if
    /// it was lost, which also re-arms every device's prepare hook.
    pub async fn connect(&mut self) -> BusResult<()> {
        if !self.started {
            if self.sessions.iter().all(|s| s.plan_len() == 0) {
                for session in &mut self.sessions {
                    session.build_plan()?;
                }
            }
            if self.sessions.iter().all(|s| s.plan_len() == 0) {
                return Err(BusError::configuration("no registers defined"));
            }
            self.started = true;
        }
        if !self.port.is_open() {
            self.port.open().await?;
            for session in &mut self.sessions {
                session.reset_prepared();
            }
            self.last_device = None;
        }
        Ok(())
    }

    /// Run poll cycles until stopped, reopening the port on fatal
    /// transport errors
    pub async fn run(&mut self) -> BusResult<()> {
        while !self.stop.load(Ordering::SeqCst) {
            match self.cycle().await {
                Ok(()) => {}
                Err(error) if error.is_transport_error() => {
                    self.sink
                        .logger()
                        .error(&format!("poll cycle failed: {}", error));
                    let _ = self.port.close().await;
                    self.last_device = None;
                    // reopened at the top of the next cycle
                    self.port.sleep(self.poll_interval).await;
                }
                Err(error) => {
                    let _ = self.port.close().await;
                    return Err(error);
                }
            }
        }
        self.port.close().await
    }

    /// Execute one full poll cycle
    ///
    /// Per planned query: wait a slice of the poll interval for write
    /// requests and drain them, prepare the target device if the bus is
    /// switching, execute the read, dispatch its events. Ends the cycle
    /// by advancing every device's unchanged-value counters.
    pub async fn cycle(&mut self) -> BusResult<()> {
        self.connect().await?;

        let plan: Vec<(usize, usize)> = self
            .sessions
            .iter()
            .enumerate()
            .flat_map(|(device, session)| (0..session.plan_len()).map(move |i| (device, i)))
            .collect();
        let slice = self.poll_interval / plan.len().max(1) as u32;

        for (device, index) in plan {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.wait_for_flush(slice).await?;
            self.prepare_to_access(device).await?;

            let mut query = self.sessions[device].planned_query(index);
            let events = self.execute_on(device, &mut query).await?;
            self.dispatch(device, events);
        }

        for device in 0..self.sessions.len() {
            let events = self.sessions[device].end_cycle(self.max_unchanged_cycles);
            self.dispatch(device, events);
        }
        Ok(())
    }

    /// Wait up to `slice` for a flush notification, draining the write
    /// queue every time it fires
    async fn wait_for_flush(&mut self, slice: Duration) -> BusResult<()> {
        let deadline = Instant::now() + slice;
        loop {
            if !self.shared.queue.lock().unwrap().is_empty() {
                self.flush().await?;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let shared = self.shared.clone();
            let notified = shared.notify.notified();
            if timeout(remaining, notified).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Drain all pending writes
    ///
    /// Each request is dequeued before execution and never re-enqueued:
    /// delivery is at most once per request.
    async fn flush(&mut self) -> BusResult<()> {
        loop {
            let request = self.shared.queue.lock().unwrap().pop_front();
            let Some(request) = request else {
                return Ok(());
            };
            let RegisterHandle { device, slot } = request.handle;
            if device >= self.sessions.len() || slot >= self.sessions[device].slots().len() {
                self.sink
                    .logger()
                    .error("dropping write request for unknown register");
                continue;
            }

            let raw = match request.value {
                WriteValue::Raw(raw) => raw,
                WriteValue::Text(text) => {
                    let format = self.sessions[device].slots()[slot].def.format;
                    match format.parse(&text) {
                        Ok(raw) => raw,
                        Err(error) => {
                            self.sink
                                .logger()
                                .error(&format!("dropping write request: {}", error));
                            continue;
                        }
                    }
                }
            };

            let mut query = match self.sessions[device].write_query(slot, raw) {
                Ok(query) => query,
                Err(error) => {
                    self.sink
                        .logger()
                        .error(&format!("dropping write request: {}", error));
                    continue;
                }
            };

            self.prepare_to_access(device).await?;
            let events = self.execute_on(device, &mut query).await?;
            self.dispatch(device, events);
        }
    }

    /// Run the prepare hook when the bus switches devices
    ///
    /// Switching pauses for the device's inter-device delay; the first
    /// contact after an open additionally writes the setup items.
    async fn prepare_to_access(&mut self, device: usize) -> BusResult<()> {
        if self.last_device == Some(device) {
            return Ok(());
        }
        self.last_device = Some(device);

        let delay = Duration::from_millis(self.sessions[device].config().delay_ms);
        if !delay.is_zero() {
            self.port.sleep(delay).await;
        }

        if !self.sessions[device].is_prepared() {
            let queries = self.sessions[device].setup_queries()?;
            let count = queries.len();
            for mut query in queries {
                let events = self.execute_on(device, &mut query).await?;
                self.dispatch(device, events);
            }
            self.sessions[device].mark_prepared();
            if count > 0 {
                self.sink.logger().info(&format!(
                    "{}: wrote {} setup item(s)",
                    self.sessions[device].config().id,
                    count
                ));
            }
        }
        Ok(())
    }

    async fn execute_on(
        &mut self,
        device: usize,
        query: &mut Query,
    ) -> BusResult<Vec<PendingEvent>> {
        let session = &mut self.sessions[device];
        let (config, slots) = session.parts_mut();
        executor::execute_query(self.port.as_mut(), config, slots, query, self.sink.logger()).await
    }

    /// Resolve pending events into consumer callbacks
    fn dispatch(&mut self, device: usize, events: Vec<PendingEvent>) {
        for event in events {
            let session = &mut self.sessions[device];
            let device_id = session.config().id.clone();
            match event {
                PendingEvent::Value { slot } => {
                    let (kind, address, format) = {
                        let def = &session.slots()[slot].def;
                        (def.kind, def.address, def.format)
                    };
                    let (_, slots) = session.parts_mut();
                    let state = &mut slots[slot].state;
                    let raw = state.value();
                    let text = format.render(raw);
                    state.mark_published(text.clone());
                    self.sink.publish_value(ValueChange {
                        handle: RegisterHandle { device, slot },
                        device_id,
                        kind,
                        address,
                        raw,
                        text,
                    });
                }
                PendingEvent::Error { slot, state } => {
                    let def = &session.slots()[slot].def;
                    let (kind, address) = (def.kind, def.address);
                    self.sink.publish_error(ErrorChange {
                        handle: RegisterHandle { device, slot },
                        device_id,
                        kind,
                        address,
                        state,
                    });
                }
            }
        }
    }
}
