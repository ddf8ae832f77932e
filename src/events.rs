/// Event surface towards the upstream consumer
///
/// Two callbacks cross the crate boundary: value-changed and
/// error-changed. Both run on the scheduler task; implementations must
/// not block it. A value-changed event is delivered only when the newly
/// decoded value differs from the last published one (or the
/// republication cadence fires); error-changed fires exactly on
/// transitions of the per-register read/write error vector.
use std::fmt;

use crate::logging::CallbackLogger;
use crate::protocol::RegisterKind;
use crate::register::ErrorState;

/// Opaque handle identifying one registered logical register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterHandle {
    pub(crate) device: usize,
    pub(crate) slot: usize,
}

/// A published value change
#[derive(Debug, Clone)]
pub struct ValueChange {
    pub handle: RegisterHandle,
    pub device_id: String,
    pub kind: RegisterKind,
    pub address: u16,
    /// Raw wire value
    pub raw: u64,
    /// Text form rendered through the register's format
    pub text: String,
}

impl fmt::Display for ValueChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} @ {} = {}",
            self.device_id, self.kind, self.address, self.text
        )
    }
}

/// A register error-state transition
#[derive(Debug, Clone)]
pub struct ErrorChange {
    pub handle: RegisterHandle,
    pub device_id: String,
    pub kind: RegisterKind,
    pub address: u16,
    pub state: ErrorState,
}

/// Callback invoked on every published value change
pub type ValueCallback = Box<dyn Fn(ValueChange) + Send + Sync>;

/// Callback invoked on every error-state transition
pub type ErrorCallback = Box<dyn Fn(ErrorChange) + Send + Sync>;

/// Event, produced while applying a query outcome, still addressed by
/// slot index
///
/// The scheduler resolves pending events into the public callback types
/// once it knows the owning device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingEvent {
    /// The slot's decoded value differs from the last published one
    Value { slot: usize },
    /// The slot's error vector transitioned to a new state
    Error { slot: usize, state: ErrorState },
}

/// Aggregated consumer-facing callbacks plus the debug-log sink
pub struct EventSink {
    on_value: Option<ValueCallback>,
    on_error: Option<ErrorCallback>,
    logger: CallbackLogger,
}

impl EventSink {
    /// Create a sink that drops everything
    pub fn new() -> Self {
        Self {
            on_value: None,
            on_error: None,
            logger: CallbackLogger::disabled(),
        }
    }

    /// Set the value-changed callback
    pub fn on_value(mut self, callback: ValueCallback) -> Self {
        self.on_value = Some(callback);
        self
    }

    /// Set the error-changed callback
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Set the debug-log sink
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Access the debug-log sink
    pub fn logger(&self) -> &CallbackLogger {
        &self.logger
    }

    pub(crate) fn publish_value(&self, change: ValueChange) {
        self.logger.debug(&format!("value changed: {}", change));
        if let Some(ref callback) = self.on_value {
            callback(change);
        }
    }

    pub(crate) fn publish_error(&self, change: ErrorChange) {
        self.logger.debug(&format!(
            "error state of {} {} @ {} is now {:?}",
            change.device_id, change.kind, change.address, change.state
        ));
        if let Some(ref callback) = self.on_error {
            callback(change);
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
