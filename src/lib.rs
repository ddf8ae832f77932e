//! # Voltage Serial - Field-Bus Driver and Register Poller
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.2.0
//! **License:** MIT
//!
//! A serial-bus driver and poller for field devices speaking binary
//! register-oriented protocols (Modbus RTU over RS-485), designed for
//! industrial automation, energy metering and smart grid systems.
//!
//! For every configured device the driver maintains a picture of that
//! device's register space, polls it at a configured cadence, surfaces
//! value changes and error transitions to the consumer, and carries
//! asynchronous writes back to the bus with at-most-once delivery.
//!
//! ## Features
//!
//! - **🚀 Batched polling**: registers coalesce into minimal bus queries,
//!   with per-device limits on batch size and tolerated address holes
//! - **🛡️ Strict validation**: length, CRC, slave-id and function echoes
//!   checked on every frame; the port resynchronizes after line noise
//! - **🔄 Single-owner port discipline**: one scheduler task owns the
//!   port, writes are flushed between reads, bytes never interleave
//! - **⚡ Split-on-error**: address rejections on coalesced ranges split
//!   the query once to localize the hole
//! - **📊 Typed registers**: 1-bit to 64-bit values, signed, unsigned,
//!   float and BCD formats, configurable word order
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_serial::{
//!     DeviceConfig, EventSink, PortScheduler, RegisterDef, RegisterFormat, RegisterKind,
//! };
//! use voltage_serial::transport::{RtuPort, SerialSettings};
//!
//! #[tokio::main]
//! async fn main() -> voltage_serial::BusResult<()> {
//!     let sink = EventSink::new()
//!         .on_value(Box::new(|change| println!("{}", change)))
//!         .on_error(Box::new(|change| eprintln!("{:?} -> {:?}", change.address, change.state)));
//!
//!     let port = RtuPort::new(SerialSettings::new("/dev/ttyUSB0").with_baud_rate(19200));
//!     let mut scheduler = PortScheduler::new(Box::new(port), sink);
//!
//!     let meter = scheduler.add_device(DeviceConfig::new("meter", 12))?;
//!     scheduler.add_register(
//!         meter,
//!         RegisterDef::new(RegisterKind::Input, 40).with_format(RegisterFormat::Float),
//!     )?;
//!
//!     let writer = scheduler.write_handle();
//!     let stopper = scheduler.stop_handle();
//!     let _ = (writer, stopper); // hand these to other threads
//!
//!     scheduler.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  value/error events   ┌──────────────┐
//! │   Consumer   │◄──────────────────────│ Event surface│
//! └──────┬───────┘                       └──────▲───────┘
//!        │ writes (queue + notify)              │
//! ┌──────▼───────────────────────────────────────────────┐
//! │                 Port scheduler (one task)            │
//! │   plan builder ── device sessions ── query executor  │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ ADU frames
//!                  ┌─────────▼─────────┐
//!                  │  Port (RS-485)    │
//!                  └───────────────────┘
//! ```

/// Core error types and result handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod error;

/// Protocol definitions: function codes, exceptions, register kinds
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod protocol;

/// RTU wire codec: framing, checksums, response validation
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod codec;

/// Value formats, word order and text rendering
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod value;

/// Register descriptors and per-register state
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod register;

/// Protocol queries over coalesced register spans
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod query;

/// Register plan builder
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod plan;

/// Serial transport layer
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod transport;

/// Protocol executor
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod executor;

/// Device configuration and sessions
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod device;

/// Port scheduler and write/stop handles
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod scheduler;

/// Event surface towards the consumer
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod events;

/// Logging system for the library
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod logging;

// Re-export main types for convenience
pub use device::{ChannelConfig, DeviceConfig, DeviceSession, SetupItemConfig};
pub use error::{BusError, BusResult};
pub use events::{ErrorChange, EventSink, RegisterHandle, ValueChange};
pub use logging::{CallbackLogger, FrameDirection, LogCallback, LogLevel, LoggingMode};
pub use plan::DeviceLimits;
pub use protocol::{ExceptionCode, FunctionCode, QueryStatus, RegisterKind, SlaveId};
pub use query::{Query, QueryOperation};
pub use register::{ErrorState, RegisterDef, RegisterState};
pub use scheduler::{DeviceHandle, PortConfig, PortScheduler, StopHandle, WriteHandle};
pub use transport::{Port, PortStats, RtuPort, SerialSettings};
pub use value::{RegisterFormat, WordOrder};

/// Maximum number of coils that can be read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = protocol::MAX_READ_BITS;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = protocol::MAX_READ_REGISTERS;

/// Maximum RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = transport::MAX_FRAME_SIZE;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Serial v{} - Modbus RTU field-bus driver by Evan Liu",
        VERSION
    )
}
