/// Serial transport layer
///
/// The `Port` trait is the executor's only view of the outside world:
/// byte-level write, predicate-bounded frame read, noise skipping and
/// timed sleeps. The production implementation drives an RS-485 adapter
/// through tokio-serial; tests substitute a scripted port.
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{BusError, BusResult};
use crate::logging::{CallbackLogger, FrameDirection};

/// Largest frame the reader will buffer
pub const MAX_FRAME_SIZE: usize = 256;

/// Inter-frame silence for a baud rate, in microseconds
///
/// 3.5 character times round up to ceil(35_000_000 / baud).
pub fn frame_gap_micros(baud_rate: u32) -> u64 {
    (35_000_000u64 + u64::from(baud_rate) - 1) / u64::from(baud_rate)
}

/// Transmission time of one character (11 bits), in microseconds
pub fn char_time_micros(baud_rate: u32) -> u64 {
    11_000_000u64 / u64::from(baud_rate)
}

/// Frame-complete predicate handed to `Port::read_frame`
pub type FrameCompleteFn = dyn Fn(&[u8]) -> bool + Send + Sync;

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct PortStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub timeouts: u64,
}

/// One serial bus endpoint, exclusively owned by a port scheduler
///
/// Exactly one request is outstanding at any time; the scheduler
/// serializes all access.
#[async_trait]
pub trait Port: Send {
    /// Open the underlying device
    async fn open(&mut self) -> BusResult<()>;

    /// Close the underlying device
    async fn close(&mut self) -> BusResult<()>;

    /// Check whether the port is open
    fn is_open(&self) -> bool;

    /// Transmit a complete frame
    async fn write_bytes(&mut self, data: &[u8]) -> BusResult<()>;

    /// Read one frame
    ///
    /// Accumulates bytes until `frame_complete` accepts the buffer,
    /// `max_len` is reached or the timeout expires. An expired timeout
    /// with nothing received is a `Timeout` error; a partial frame is
    /// returned as-is for the caller to reject.
    async fn read_frame(
        &mut self,
        max_len: usize,
        frame_timeout: Duration,
        frame_complete: &FrameCompleteFn,
    ) -> BusResult<Vec<u8>>;

    /// Discard stray bytes until the line is silent
    async fn skip_noise(&mut self) -> BusResult<()>;

    /// Sleep, observing the port's notion of time
    async fn sleep(&self, duration: Duration);

    /// Toggle frame-level debug dumps
    fn set_debug(&mut self, debug: bool);

    /// Get transport statistics
    fn stats(&self) -> PortStats;
}

/// Parity configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParityMode {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: ParityMode,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialSettings {
    /// Settings for a path with everything else at 9600 8N1
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: ParityMode::None,
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            ParityMode::None => tokio_serial::Parity::None,
            ParityMode::Even => tokio_serial::Parity::Even,
            ParityMode::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// RS-485 serial port over tokio-serial
pub struct RtuPort {
    settings: SerialSettings,
    stream: Option<SerialStream>,
    frame_gap: Duration,
    debug: bool,
    logger: CallbackLogger,
    stats: PortStats,
}

impl RtuPort {
    /// Create a closed port for the given line settings
    pub fn new(settings: SerialSettings) -> Self {
        let frame_gap = Duration::from_micros(frame_gap_micros(settings.baud_rate));
        Self {
            settings,
            stream: None,
            frame_gap,
            debug: false,
            logger: CallbackLogger::disabled(),
            stats: PortStats::default(),
        }
    }

    /// Attach a debug-log sink
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    fn stream_mut(&mut self) -> BusResult<&mut SerialStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| BusError::connection("port is not open"))
    }
}

#[async_trait]
impl Port for RtuPort {
    async fn open(&mut self) -> BusResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio_serial::new(&self.settings.path, self.settings.baud_rate)
            .data_bits(self.settings.data_bits())
            .stop_bits(self.settings.stop_bits())
            .parity(self.settings.parity())
            .open_native_async()?;
        self.stream = Some(stream);
        self.logger.info(&format!(
            "opened {} at {} baud",
            self.settings.path, self.settings.baud_rate
        ));
        Ok(())
    }

    async fn close(&mut self) -> BusResult<()> {
        if self.stream.take().is_some() {
            self.logger.info(&format!("closed {}", self.settings.path));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_bytes(&mut self, data: &[u8]) -> BusResult<()> {
        use tokio::io::AsyncWriteExt;

        if self.debug {
            self.logger.frame(FrameDirection::Tx, data);
        }
        let stream = self.stream_mut()?;
        if let Err(e) = stream.write_all(data).await {
            self.stats.errors += 1;
            return Err(BusError::io(format!("write failed: {}", e)));
        }
        self.stats.bytes_sent += data.len() as u64;
        Ok(())
    }

    async fn read_frame(
        &mut self,
        max_len: usize,
        frame_timeout: Duration,
        frame_complete: &FrameCompleteFn,
    ) -> BusResult<Vec<u8>> {
        let deadline = Instant::now() + frame_timeout;
        let mut buf = BytesMut::with_capacity(max_len);

        while !frame_complete(&buf) && buf.len() < max_len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let stream = self.stream_mut()?;
            match timeout(remaining, stream.read_buf(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    self.stats.errors += 1;
                    return Err(BusError::connection("serial stream closed"));
                }
                Ok(Ok(n)) => {
                    self.stats.bytes_received += n as u64;
                }
                Ok(Err(e)) => {
                    self.stats.errors += 1;
                    return Err(BusError::io(format!("read failed: {}", e)));
                }
            }
        }

        if buf.is_empty() {
            self.stats.timeouts += 1;
            return Err(BusError::timeout(
                "read frame",
                frame_timeout.as_millis() as u64,
            ));
        }
        if self.debug {
            self.logger.frame(FrameDirection::Rx, &buf);
        }
        Ok(buf.to_vec())
    }

    async fn skip_noise(&mut self) -> BusResult<()> {
        let gap = self.frame_gap.max(Duration::from_millis(1));
        let mut scratch = [0u8; 64];
        let mut skipped = 0usize;
        loop {
            let stream = self.stream_mut()?;
            match timeout(gap, stream.read(&mut scratch)).await {
                // the line went silent, resynchronized
                Err(_) => break,
                Ok(Ok(0)) => return Err(BusError::connection("serial stream closed")),
                Ok(Ok(n)) => skipped += n,
                Ok(Err(e)) => return Err(BusError::io(format!("read failed: {}", e))),
            }
        }
        if skipped > 0 {
            self.logger
                .debug(&format!("skipped {} byte(s) of noise", skipped));
        }
        Ok(())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    fn stats(&self) -> PortStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_gap_calculations() {
        assert_eq!(frame_gap_micros(9600), 3646);
        assert_eq!(frame_gap_micros(19200), 1823);
        assert_eq!(frame_gap_micros(115200), 304);

        for baud in [9600u32, 19200, 38400, 57600, 115200] {
            let char_time = char_time_micros(baud);
            let gap = frame_gap_micros(baud);
            assert!(char_time > 0);
            // 3.5 character times, rounded up
            assert!(gap >= char_time * 3);
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings: SerialSettings =
            serde_json::from_str(r#"{ "path": "/dev/ttyUSB0" }"#).unwrap();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.stop_bits, 1);
        assert_eq!(settings.parity, ParityMode::None);
    }

    #[tokio::test]
    async fn test_rtu_port_requires_open() {
        let mut port = RtuPort::new(SerialSettings::new("/dev/null-serial"));
        assert!(!port.is_open());
        let result = port.write_bytes(&[0x01]).await;
        assert!(matches!(result, Err(BusError::Connection { .. })));
    }
}
