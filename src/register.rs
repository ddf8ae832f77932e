/// Logical register descriptors and per-register runtime state
///
/// A descriptor names one user-visible value on a device: its kind, base
/// address and width in protocol elements (a width above one packs the
/// value across consecutive elements and is always read and written as a
/// whole). The runtime state keeps the last accepted raw value, the last
/// published value and the read/write error vector, and is the single
/// place where error transitions are debounced.
use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};
use crate::protocol::RegisterKind;
use crate::value::{RegisterFormat, WordOrder};

/// Descriptor of one logical register on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDef {
    /// Register kind (fixes element width and legal operations)
    pub kind: RegisterKind,
    /// Base element address
    pub address: u16,
    /// Width in protocol elements (1..=4); multi-element values are atomic
    #[serde(default = "default_width")]
    pub width: u16,
    /// Numeric interpretation of the raw value
    #[serde(default)]
    pub format: RegisterFormat,
    /// Element order for width > 1
    #[serde(default)]
    pub word_order: WordOrder,
    /// Reject writes regardless of kind
    #[serde(default)]
    pub read_only: bool,
    /// Poll cadence override; registers merge into one query only when equal
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

fn default_width() -> u16 {
    1
}

impl RegisterDef {
    /// Create a descriptor with width 1 and default format
    pub fn new(kind: RegisterKind, address: u16) -> Self {
        Self {
            kind,
            address,
            width: 1,
            format: RegisterFormat::default(),
            word_order: WordOrder::default(),
            read_only: false,
            poll_interval_ms: None,
        }
    }

    /// Set the format; the width follows the format's element count
    pub fn with_format(mut self, format: RegisterFormat) -> Self {
        self.format = format;
        if !self.kind.is_single_bit() {
            self.width = format.element_count();
        }
        self
    }

    /// Set the width in protocol elements
    pub fn with_width(mut self, width: u16) -> Self {
        self.width = width;
        self
    }

    /// Set the element order
    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    /// Mark the register read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Set the per-register poll cadence
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = Some(interval);
        self
    }

    /// Last element address covered by this register
    pub fn end_address(&self) -> u16 {
        self.address + self.width - 1
    }

    /// Validate descriptor invariants
    pub fn validate(&self) -> BusResult<()> {
        if !(1..=4).contains(&self.width) {
            return Err(BusError::configuration(format!(
                "register width {} out of range 1..=4",
                self.width
            )));
        }
        if self.kind.is_single_bit() && self.width != 1 {
            return Err(BusError::configuration(format!(
                "width other than 1 is not supported for {} registers",
                self.kind
            )));
        }
        if u32::from(self.address) + u32::from(self.width) > 0x1_0000 {
            return Err(BusError::invalid_address(self.address, self.width));
        }
        Ok(())
    }
}

/// Error condition of one register, as a read/write bit vector
///
/// `Unknown` is the pre-contact state; it never reappears once the
/// device has answered for this register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorState {
    None,
    ReadError,
    WriteError,
    ReadWriteError,
    Unknown,
}

impl ErrorState {
    fn from_bits(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => ErrorState::None,
            (true, false) => ErrorState::ReadError,
            (false, true) => ErrorState::WriteError,
            (true, true) => ErrorState::ReadWriteError,
        }
    }

    /// Check the read-error bit
    pub fn has_read_error(self) -> bool {
        matches!(self, ErrorState::ReadError | ErrorState::ReadWriteError)
    }

    /// Check the write-error bit
    pub fn has_write_error(self) -> bool {
        matches!(self, ErrorState::WriteError | ErrorState::ReadWriteError)
    }

    fn with_read(self, error: bool) -> Self {
        Self::from_bits(error, self.has_write_error())
    }

    fn with_write(self, error: bool) -> Self {
        Self::from_bits(self.has_read_error(), error)
    }
}

/// Runtime state of one register
///
/// Owned by the device session and mutated only from the scheduler task.
#[derive(Debug, Clone)]
pub struct RegisterState {
    value: u64,
    published: u64,
    published_text: Option<String>,
    error: ErrorState,
    did_read: bool,
    unchanged_cycles: u32,
}

impl Default for RegisterState {
    fn default() -> Self {
        Self {
            value: 0,
            published: 0,
            published_text: None,
            error: ErrorState::Unknown,
            did_read: false,
            unchanged_cycles: 0,
        }
    }
}

impl RegisterState {
    /// Last accepted raw value
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Last published text form, if any value was published yet
    pub fn published_text(&self) -> Option<&str> {
        self.published_text.as_deref()
    }

    /// Current error condition
    pub fn error_state(&self) -> ErrorState {
        self.error
    }

    /// Whether the register was read successfully at least once
    pub fn did_read(&self) -> bool {
        self.did_read
    }

    /// Accept a freshly decoded value from a successful read
    ///
    /// Returns whether the value differs from the last published one and
    /// the error transition, if the read cleared an error condition.
    pub(crate) fn accept_read_value(&mut self, raw: u64) -> (bool, Option<ErrorState>) {
        self.did_read = true;
        let transition = self.transition(self.error.with_read(false));
        let changed = raw != self.published;
        self.value = raw;
        if changed {
            self.unchanged_cycles = 0;
        }
        (changed, transition)
    }

    /// Record a failed read; the last value is kept
    pub(crate) fn accept_read_error(&mut self) -> Option<ErrorState> {
        self.transition(self.error.with_read(true))
    }

    /// Record a confirmed write
    pub(crate) fn accept_write_ok(&mut self) -> Option<ErrorState> {
        self.transition(self.error.with_write(false))
    }

    /// Record a failed write
    pub(crate) fn accept_write_error(&mut self) -> Option<ErrorState> {
        self.transition(self.error.with_write(true))
    }

    /// Remember what was handed to the consumer
    pub(crate) fn mark_published(&mut self, text: String) {
        self.published = self.value;
        self.published_text = Some(text);
    }

    /// Advance the unchanged-cycle counter at the end of a poll cycle
    ///
    /// Returns true when the value should be re-published even though it
    /// did not change. `limit` <= 0 disables republication.
    pub(crate) fn end_cycle(&mut self, limit: i32) -> bool {
        if !self.did_read {
            return false;
        }
        self.unchanged_cycles += 1;
        if limit > 0 && self.unchanged_cycles >= limit as u32 {
            self.unchanged_cycles = 0;
            true
        } else {
            false
        }
    }

    /// Transition to a new error state, reporting it only on change
    ///
    /// The initial `Unknown` -> `None` transition is silent: a clean
    /// first contact is not an error event.
    fn transition(&mut self, new: ErrorState) -> Option<ErrorState> {
        let old = std::mem::replace(&mut self.error, new);
        if new != old && !(old == ErrorState::Unknown && new == ErrorState::None) {
            Some(new)
        } else {
            None
        }
    }
}

/// A descriptor paired with its runtime state
///
/// The unit of ownership inside a device session; queries refer to
/// slots by index.
#[derive(Debug, Clone)]
pub struct RegisterSlot {
    pub def: RegisterDef,
    pub state: RegisterState,
}

impl RegisterSlot {
    pub fn new(def: RegisterDef) -> Self {
        Self {
            def,
            state: RegisterState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_def_validation() {
        let def = RegisterDef::new(RegisterKind::Holding, 30).with_format(RegisterFormat::S64);
        assert_eq!(def.width, 4);
        assert_eq!(def.end_address(), 33);
        assert!(def.validate().is_ok());

        let def = RegisterDef::new(RegisterKind::Coil, 0).with_width(2);
        assert!(def.validate().is_err());

        let def = RegisterDef::new(RegisterKind::Holding, 10).with_width(5);
        assert!(def.validate().is_err());

        let def = RegisterDef::new(RegisterKind::Holding, 0xFFFF).with_width(2);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_first_clean_read_is_not_an_error_transition() {
        let mut state = RegisterState::default();
        assert_eq!(state.error_state(), ErrorState::Unknown);

        let (changed, transition) = state.accept_read_value(7);
        assert!(changed);
        assert_eq!(transition, None);
        assert_eq!(state.error_state(), ErrorState::None);
        assert!(state.did_read());
    }

    #[test]
    fn test_error_transitions_are_debounced() {
        let mut state = RegisterState::default();

        assert_eq!(state.accept_read_error(), Some(ErrorState::ReadError));
        // identical successive errors are coalesced
        assert_eq!(state.accept_read_error(), None);
        assert_eq!(state.accept_write_error(), Some(ErrorState::ReadWriteError));
        assert_eq!(state.accept_write_error(), None);

        let (_, transition) = state.accept_read_value(1);
        assert_eq!(transition, Some(ErrorState::WriteError));
        assert_eq!(state.accept_write_ok(), Some(ErrorState::None));
        assert_eq!(state.accept_write_ok(), None);
    }

    #[test]
    fn test_value_change_tracked_against_published() {
        let mut state = RegisterState::default();

        // zero matches the initial published value
        let (changed, _) = state.accept_read_value(0);
        assert!(!changed);

        let (changed, _) = state.accept_read_value(5);
        assert!(changed);
        state.mark_published("5".to_string());

        let (changed, _) = state.accept_read_value(5);
        assert!(!changed);
        assert_eq!(state.published_text(), Some("5"));
    }

    #[test]
    fn test_unchanged_cycle_republication() {
        let mut state = RegisterState::default();
        state.accept_read_value(5);
        state.mark_published("5".to_string());

        assert!(!state.end_cycle(3));
        assert!(!state.end_cycle(3));
        assert!(state.end_cycle(3));
        // counter resets after republication
        assert!(!state.end_cycle(3));

        // disabled limit never republishes
        let mut state = RegisterState::default();
        state.accept_read_value(1);
        for _ in 0..100 {
            assert!(!state.end_cycle(0));
            assert!(!state.end_cycle(-1));
        }
    }
}
