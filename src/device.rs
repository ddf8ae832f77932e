/// Device configuration and per-device session state
///
/// A device session owns everything the driver knows about one slave:
/// its configuration, the register slots with their cached values and
/// error bits, the one-shot setup items and the cached read plan. State
/// is mutated only from the scheduler task.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};
use crate::events::PendingEvent;
use crate::plan::{self, DeviceLimits};
use crate::protocol::SlaveId;
use crate::query::{Query, QuerySlot};
use crate::register::{RegisterDef, RegisterSlot};
use crate::value::WordOrder;

/// Frame timeout applied when the device does not configure one
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 500;

/// Pause inserted when the bus switches to another device
pub const DEFAULT_INTER_DEVICE_DELAY_MS: u64 = 100;

/// Default device access level
pub const DEFAULT_ACCESS_LEVEL: u8 = 1;

/// One register group exposed by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(rename = "type", default = "default_channel_type")]
    pub channel_type: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub registers: Vec<RegisterDef>,
}

fn default_channel_type() -> String {
    "text".to_string()
}

/// An address/value pair written once at first contact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupItemConfig {
    pub name: String,
    pub register: RegisterDef,
    pub value: u64,
}

/// Static configuration of one device on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Identifier used in events and logs
    pub id: String,
    /// Bus address (1-247)
    pub slave_id: SlaveId,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Pause before the first request after a device switch, ms
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_access_level")]
    pub access_level: u8,
    /// Frame timeout in ms; negative selects the protocol default
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: i64,
    /// Largest tolerated address gap inside a register query
    #[serde(default)]
    pub max_hole_registers: u16,
    /// Largest tolerated address gap inside a bit query
    #[serde(default)]
    pub max_hole_bits: u16,
    /// Read batch ceiling, clamped to the protocol maximum
    #[serde(default = "default_max_read_registers")]
    pub max_read_registers: u16,
    /// Default element order for this device's registers
    #[serde(default)]
    pub word_order: WordOrder,
    /// Mandatory silence before each request, µs
    #[serde(default)]
    pub guard_interval_us: u64,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub setup: Vec<SetupItemConfig>,
}

fn default_protocol() -> String {
    "modbus_rtu".to_string()
}

fn default_delay_ms() -> u64 {
    DEFAULT_INTER_DEVICE_DELAY_MS
}

fn default_access_level() -> u8 {
    DEFAULT_ACCESS_LEVEL
}

fn default_frame_timeout_ms() -> i64 {
    -1
}

fn default_max_read_registers() -> u16 {
    1
}

impl DeviceConfig {
    /// Minimal configuration for an id and slave address
    pub fn new(id: impl Into<String>, slave_id: SlaveId) -> Self {
        Self {
            id: id.into(),
            slave_id,
            protocol: default_protocol(),
            delay_ms: default_delay_ms(),
            access_level: default_access_level(),
            frame_timeout_ms: default_frame_timeout_ms(),
            max_hole_registers: 0,
            max_hole_bits: 0,
            max_read_registers: default_max_read_registers(),
            word_order: WordOrder::default(),
            guard_interval_us: 0,
            channels: Vec::new(),
            setup: Vec::new(),
        }
    }

    /// Effective frame timeout
    pub fn frame_timeout(&self) -> Duration {
        if self.frame_timeout_ms < 0 {
            Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS)
        } else {
            Duration::from_millis(self.frame_timeout_ms as u64)
        }
    }

    /// Guard interval, if one is configured
    pub fn guard_interval(&self) -> Option<Duration> {
        if self.guard_interval_us == 0 {
            None
        } else {
            Some(Duration::from_micros(self.guard_interval_us))
        }
    }

    /// Protocol limits derived from this configuration
    pub fn limits(&self) -> DeviceLimits {
        DeviceLimits::new()
            .with_max_hole_registers(self.max_hole_registers)
            .with_max_hole_bits(self.max_hole_bits)
            .with_max_read_registers(self.max_read_registers)
    }

    fn validate(&self) -> BusResult<()> {
        if self.id.is_empty() {
            return Err(BusError::configuration("device id must not be empty"));
        }
        if self.slave_id == 0 || self.slave_id > 247 {
            return Err(BusError::configuration(format!(
                "invalid slave id {} for device '{}'",
                self.slave_id, self.id
            )));
        }
        Ok(())
    }
}

/// Runtime state of one device on the bus
pub struct DeviceSession {
    config: DeviceConfig,
    limits: DeviceLimits,
    slots: Vec<RegisterSlot>,
    /// Slots included in the poll plan, in registration order
    poll_slots: Vec<usize>,
    /// (slot, value) pairs written once by the prepare hook
    setup_items: Vec<(usize, u64)>,
    plan: Vec<Query>,
    prepared: bool,
}

impl DeviceSession {
    /// Create a session, pulling registers and setup items out of the
    /// configured channels
    pub fn new(config: DeviceConfig) -> BusResult<Self> {
        config.validate()?;
        let limits = config.limits();
        let mut session = Self {
            config,
            limits,
            slots: Vec::new(),
            poll_slots: Vec::new(),
            setup_items: Vec::new(),
            plan: Vec::new(),
            prepared: false,
        };

        for channel in session.config.channels.clone() {
            for mut def in channel.registers {
                if channel.read_only {
                    def.read_only = true;
                }
                session.add_register(def)?;
            }
        }
        for item in session.config.setup.clone() {
            session.add_setup_item(item.register, item.value)?;
        }
        Ok(session)
    }

    /// Register one more logical register for polling
    ///
    /// Registers default to the device's word order unless the
    /// descriptor sets its own. Duplicate (kind, address) registrations
    /// are rejected.
    pub fn add_register(&mut self, mut def: RegisterDef) -> BusResult<usize> {
        def.validate()?;
        if def.word_order == WordOrder::default() {
            def.word_order = self.config.word_order;
        }
        let duplicate = self.poll_slots.iter().any(|&i| {
            self.slots[i].def.kind == def.kind && self.slots[i].def.address == def.address
        });
        if duplicate {
            return Err(BusError::configuration(format!(
                "duplicate register {} @ {} on device '{}'",
                def.kind, def.address, self.config.id
            )));
        }

        let index = self.slots.len();
        self.slots.push(RegisterSlot::new(def));
        self.poll_slots.push(index);
        self.plan.clear();
        Ok(index)
    }

    /// Add a one-shot setup write executed by the prepare hook
    pub fn add_setup_item(&mut self, mut def: RegisterDef, value: u64) -> BusResult<()> {
        def.validate()?;
        if def.word_order == WordOrder::default() {
            def.word_order = self.config.word_order;
        }
        if !def.kind.is_writable() {
            return Err(BusError::configuration(format!(
                "setup item on read-only {} register @ {}",
                def.kind, def.address
            )));
        }
        let index = self.slots.len();
        self.slots.push(RegisterSlot::new(def));
        self.setup_items.push((index, value));
        Ok(())
    }

    /// Compute (or recompute) the read plan
    pub fn build_plan(&mut self) -> BusResult<()> {
        self.plan = plan::build_queries(&self.slots, &self.poll_slots, &self.limits)?;
        Ok(())
    }

    /// Number of queries in the cached plan
    pub fn plan_len(&self) -> usize {
        self.plan.len()
    }

    /// Clone the n-th planned query with a clean status
    ///
    /// Runtime execution works on a copy; splitting a failing query
    /// never mutates the plan itself.
    pub fn planned_query(&self, index: usize) -> Query {
        let mut query = self.plan[index].clone();
        query.reset_status();
        query
    }

    /// Build the write query for one register slot
    pub fn write_query(&self, slot: usize, raw: u64) -> BusResult<Query> {
        let def = &self
            .slots
            .get(slot)
            .ok_or_else(|| BusError::internal(format!("no register slot {}", slot)))?
            .def;
        if def.read_only {
            return Err(BusError::configuration(format!(
                "register {} @ {} of device '{}' is read-only",
                def.kind, def.address, self.config.id
            )));
        }
        Query::write(
            def.kind,
            QuerySlot {
                index: slot,
                address: def.address,
                width: def.width,
            },
            raw,
            def.word_order,
        )
    }

    /// Write queries for the configured setup items, in config order
    pub fn setup_queries(&self) -> BusResult<Vec<Query>> {
        self.setup_items
            .iter()
            .map(|&(slot, value)| {
                let def = &self.slots[slot].def;
                Query::write(
                    def.kind,
                    QuerySlot {
                        index: slot,
                        address: def.address,
                        width: def.width,
                    },
                    value,
                    def.word_order,
                )
            })
            .collect()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn slots(&self) -> &[RegisterSlot] {
        &self.slots
    }

    /// Split borrow for the executor: configuration plus mutable slots
    pub fn parts_mut(&mut self) -> (&DeviceConfig, &mut [RegisterSlot]) {
        (&self.config, &mut self.slots)
    }

    /// Whether the prepare hook already ran since the last (re)open
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn mark_prepared(&mut self) {
        self.prepared = true;
    }

    /// Force the prepare hook to run again (port was reopened)
    pub(crate) fn reset_prepared(&mut self) {
        self.prepared = false;
    }

    /// Advance unchanged-value counters after a completed poll cycle
    ///
    /// Returns republication events for registers whose value has been
    /// stable for `max_unchanged_cycles` cycles.
    pub fn end_cycle(&mut self, max_unchanged_cycles: i32) -> Vec<PendingEvent> {
        let mut events = Vec::new();
        for &index in &self.poll_slots {
            if self.slots[index].state.end_cycle(max_unchanged_cycles) {
                events.push(PendingEvent::Value { slot: index });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FunctionCode, RegisterKind};
    use crate::value::RegisterFormat;

    #[test]
    fn test_config_defaults_from_json() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{ "id": "meter", "slave_id": 12 }"#).unwrap();
        assert_eq!(config.delay_ms, 100);
        assert_eq!(config.access_level, 1);
        assert_eq!(config.frame_timeout_ms, -1);
        assert_eq!(config.frame_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_read_registers, 1);
        assert_eq!(config.guard_interval(), None);
        assert_eq!(config.protocol, "modbus_rtu");
    }

    #[test]
    fn test_config_validation() {
        assert!(DeviceSession::new(DeviceConfig::new("dev", 0)).is_err());
        assert!(DeviceSession::new(DeviceConfig::new("dev", 248)).is_err());
        assert!(DeviceSession::new(DeviceConfig::new("", 1)).is_err());
        assert!(DeviceSession::new(DeviceConfig::new("dev", 247)).is_ok());
    }

    #[test]
    fn test_duplicate_registers_rejected() {
        let mut session = DeviceSession::new(DeviceConfig::new("dev", 1)).unwrap();
        session
            .add_register(RegisterDef::new(RegisterKind::Holding, 10))
            .unwrap();
        assert!(session
            .add_register(RegisterDef::new(RegisterKind::Holding, 10))
            .is_err());
        // same address, different kind is a different register
        session
            .add_register(RegisterDef::new(RegisterKind::Coil, 10))
            .unwrap();
    }

    #[test]
    fn test_channels_feed_the_plan() {
        let mut config = DeviceConfig::new("dev", 1);
        config.max_read_registers = 16;
        config.channels = vec![ChannelConfig {
            name: "power".to_string(),
            channel_type: "value".to_string(),
            read_only: true,
            registers: vec![
                RegisterDef::new(RegisterKind::Input, 0),
                RegisterDef::new(RegisterKind::Input, 1),
            ],
        }];

        let mut session = DeviceSession::new(config).unwrap();
        session.build_plan().unwrap();
        assert_eq!(session.plan_len(), 1);
        assert!(session.slots()[0].def.read_only);
        assert!(session.write_query(0, 1).is_err());
    }

    #[test]
    fn test_device_word_order_is_the_default() {
        let mut config = DeviceConfig::new("dev", 1);
        config.word_order = WordOrder::LittleEndian;
        let mut session = DeviceSession::new(config).unwrap();
        let slot = session
            .add_register(RegisterDef::new(RegisterKind::Holding, 0).with_format(RegisterFormat::U32))
            .unwrap();
        assert_eq!(session.slots()[slot].def.word_order, WordOrder::LittleEndian);
    }

    #[test]
    fn test_setup_items_become_write_queries() {
        let mut config = DeviceConfig::new("dev", 1);
        config.setup = vec![SetupItemConfig {
            name: "unlock".to_string(),
            register: RegisterDef::new(RegisterKind::Holding, 100),
            value: 0xA5,
        }];
        let mut session = DeviceSession::new(config).unwrap();
        session.build_plan().unwrap();

        // setup slots are not polled
        assert_eq!(session.plan_len(), 0);
        let queries = session.setup_queries().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].function(), FunctionCode::WriteSingleRegister);
        assert_eq!(queries[0].start(), 100);
        assert_eq!(queries[0].write_words(), &[0xA5]);

        // setup items on read-only kinds are rejected
        let mut config = DeviceConfig::new("dev", 1);
        config.setup = vec![SetupItemConfig {
            name: "bad".to_string(),
            register: RegisterDef::new(RegisterKind::Input, 1),
            value: 1,
        }];
        assert!(DeviceSession::new(config).is_err());
    }

    #[test]
    fn test_write_query_uses_register_word_order() {
        let mut session = DeviceSession::new(DeviceConfig::new("dev", 1)).unwrap();
        let slot = session
            .add_register(
                RegisterDef::new(RegisterKind::Holding, 40)
                    .with_format(RegisterFormat::U32)
                    .with_word_order(WordOrder::LittleEndian),
            )
            .unwrap();

        let query = session.write_query(slot, 0x0001_0002).unwrap();
        assert_eq!(query.function(), FunctionCode::WriteMultipleRegisters);
        assert_eq!(query.write_words(), &[0x0002, 0x0001]);
    }
}
