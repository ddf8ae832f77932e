/// Debug-log sink for bus diagnostics
///
/// The driver never prints on its own; every diagnostic line and frame
/// dump goes through a `CallbackLogger` handed in by the consumer. Bus
/// traffic is logged per direction and, depending on the configured
/// mode, as raw hex, as an interpreted ADU summary, or both.
use std::fmt;
use std::sync::Arc;

use crate::codec::EXCEPTION_BIT;
use crate::protocol::{ExceptionCode, FunctionCode};

/// Severity of a diagnostic line
///
/// Ordered from most to least severe; a logger passes everything at or
/// above its configured minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        write!(f, "{}", name)
    }
}

/// How bus frames are rendered into log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Hex dump of the ADU bytes
    Raw,
    /// Decoded summary: slave, function, address, exception
    #[default]
    Interpreted,
    /// Decoded summary followed by the hex dump
    Both,
}

/// Direction of a frame on the bus, as seen by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Tx,
    Rx,
}

impl fmt::Display for FrameDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                FrameDirection::Tx => "TX",
                FrameDirection::Rx => "RX",
            }
        )
    }
}

/// Consumer-provided sink for diagnostic lines
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// The debug-log sink threaded through the scheduler, executor and port
#[derive(Clone)]
pub struct CallbackLogger {
    sink: Option<Arc<dyn Fn(LogLevel, &str) + Send + Sync>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Wrap a callback, passing lines at or above `min_level`
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            sink: callback.map(|cb| -> Arc<dyn Fn(LogLevel, &str) + Send + Sync> { Arc::from(cb) }),
            min_level,
            mode: LoggingMode::default(),
        }
    }

    /// Select how bus frames are rendered
    pub fn with_mode(mut self, mode: LoggingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Logger printing to the process console, errors and warnings on
    /// stderr
    pub fn console() -> Self {
        Self::new(
            Some(Box::new(|level, line| {
                let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
                if level <= LogLevel::Warn {
                    eprintln!("{} [{}] {}", stamp, level, line);
                } else {
                    println!("{} [{}] {}", stamp, level, line);
                }
            })),
            LogLevel::Info,
        )
    }

    /// Logger that drops everything
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Change the frame rendering mode in place
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Current frame rendering mode
    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    /// Whether a line at this level would reach the sink
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.sink.is_some() && level <= self.min_level
    }

    fn emit(&self, level: LogLevel, line: &str) {
        if let Some(sink) = &self.sink {
            if level <= self.min_level {
                sink(level, line);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.emit(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.emit(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.emit(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.emit(LogLevel::Debug, message);
    }

    /// Log one ADU according to the configured mode
    ///
    /// Frames log at debug severity; the direction decides how the PDU
    /// fields are read (request shapes for TX, response shapes for RX).
    pub fn frame(&self, direction: FrameDirection, adu: &[u8]) {
        if !self.enabled(LogLevel::Debug) {
            return;
        }
        if self.mode != LoggingMode::Raw {
            self.emit(
                LogLevel::Debug,
                &format!("{} {}", direction, describe_adu(direction, adu)),
            );
        }
        if self.mode != LoggingMode::Interpreted {
            self.emit(
                LogLevel::Debug,
                &format!("{} {} byte(s): {}", direction, adu.len(), hex_dump(adu)),
            );
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Render ADU bytes as spaced uppercase hex
pub fn hex_dump(data: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// Summarize the interesting fields of an ADU
fn describe_adu(direction: FrameDirection, adu: &[u8]) -> String {
    if adu.len() < 2 {
        return format!("truncated frame ({} byte(s))", adu.len());
    }
    let slave = adu[0];
    let raw_function = adu[1];

    if raw_function & EXCEPTION_BIT != 0 {
        return match adu.get(2).copied().and_then(ExceptionCode::from_u8) {
            Some(code) => format!(
                "slave {} rejects function 0x{:02X}: {}",
                slave,
                raw_function & !EXCEPTION_BIT,
                code
            ),
            None => format!(
                "slave {} rejects function 0x{:02X} with unknown exception",
                slave,
                raw_function & !EXCEPTION_BIT
            ),
        };
    }

    let function = match FunctionCode::from_u8(raw_function) {
        Ok(function) => function,
        Err(_) => {
            return format!(
                "slave {} unknown function 0x{:02X}, {} byte(s)",
                slave,
                raw_function,
                adu.len()
            )
        }
    };

    match direction {
        FrameDirection::Tx if adu.len() >= 6 => {
            let address = u16::from_be_bytes([adu[2], adu[3]]);
            let argument = u16::from_be_bytes([adu[4], adu[5]]);
            format!("slave {} {} @ {} arg {}", slave, function, address, argument)
        }
        FrameDirection::Rx if function.is_read_function() && adu.len() >= 3 => {
            format!("slave {} {} returned {} data byte(s)", slave, function, adu[2])
        }
        FrameDirection::Rx if adu.len() >= 4 => {
            let address = u16::from_be_bytes([adu[2], adu[3]]);
            format!("slave {} {} confirmed @ {}", slave, function, address)
        }
        _ => format!("slave {} {}", slave, function),
    }
}
