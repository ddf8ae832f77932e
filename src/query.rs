/// Protocol queries
///
/// A query describes one request/response transaction: a read over a
/// coalesced span of registers, or a write of a single logical register.
/// Queries reference register slots by index (the device session owns
/// the actual state) and are immutable after construction except for the
/// execution status.
use crate::error::{BusError, BusResult};
use crate::events::PendingEvent;
use crate::protocol::{FunctionCode, QueryStatus, RegisterKind};
use crate::register::RegisterSlot;
use crate::value::{self, WordOrder};

/// Operation performed by a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperation {
    Read,
    Write,
}

/// Borrow-style reference to one register slot covered by a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySlot {
    /// Slot index within the owning device session
    pub index: usize,
    /// Base element address
    pub address: u16,
    /// Width in elements
    pub width: u16,
}

impl QuerySlot {
    fn end_address(&self) -> u16 {
        self.address + self.width - 1
    }
}

/// One planned protocol transaction
#[derive(Debug, Clone)]
pub struct Query {
    operation: QueryOperation,
    kind: RegisterKind,
    function: FunctionCode,
    start: u16,
    count: u16,
    slots: Vec<QuerySlot>,
    has_holes: bool,
    splittable: bool,
    status: QueryStatus,
    write_words: Vec<u16>,
}

impl Query {
    /// Build a read query over an ascending run of register slots
    ///
    /// All slots must share the register kind; the covered span may
    /// contain holes but never exceeds the kind's protocol ceiling.
    pub fn read(kind: RegisterKind, slots: Vec<QuerySlot>) -> BusResult<Self> {
        let first = slots
            .first()
            .ok_or_else(|| BusError::internal("query over empty register list"))?;

        let mut has_holes = false;
        for pair in slots.windows(2) {
            if pair[1].address < pair[0].end_address() + 1 {
                return Err(BusError::internal(format!(
                    "register run not strictly increasing at address {}",
                    pair[1].address
                )));
            }
            has_holes |= pair[1].address > pair[0].end_address() + 1;
        }

        let start = first.address;
        let count = slots[slots.len() - 1].end_address() - start + 1;
        if count > kind.max_read_elements() {
            return Err(BusError::invalid_address(start, count));
        }

        let splittable = slots.len() > 1;
        Ok(Self {
            operation: QueryOperation::Read,
            kind,
            function: kind.read_function(),
            start,
            count,
            slots,
            has_holes,
            splittable,
            status: QueryStatus::NotExecuted,
            write_words: Vec::new(),
        })
    }

    /// Build a write query for one logical register
    ///
    /// The single-write function is used when the kind permits it and the
    /// value fits one element; multi-element values always travel in one
    /// multi-write request, elements laid out in the given word order.
    pub fn write(
        kind: RegisterKind,
        slot: QuerySlot,
        raw: u64,
        word_order: WordOrder,
    ) -> BusResult<Self> {
        let (write_words, packed) = if kind.is_single_bit() {
            (vec![u16::from(raw != 0)], false)
        } else {
            let packed = slot.width > 1 || kind == RegisterKind::HoldingMulti;
            (value::raw_to_words(raw, slot.width, word_order), packed)
        };
        let function = kind.write_function(packed)?;

        Ok(Self {
            operation: QueryOperation::Write,
            kind,
            function,
            start: slot.address,
            count: slot.width,
            slots: vec![slot],
            has_holes: false,
            splittable: false,
            status: QueryStatus::NotExecuted,
            write_words,
        })
    }

    pub fn operation(&self) -> QueryOperation {
        self.operation
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    /// Number of protocol elements covered, holes included
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Slots covered by this query, ascending by address
    pub fn slots(&self) -> &[QuerySlot] {
        &self.slots
    }

    /// Whether the covered span skips unpolled addresses
    pub fn has_holes(&self) -> bool {
        self.has_holes
    }

    /// Whether a rejection may still be narrowed down by splitting
    pub fn splittable(&self) -> bool {
        self.splittable
    }

    pub(crate) fn set_splittable(&mut self, splittable: bool) {
        self.splittable = splittable;
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub(crate) fn reset_status(&mut self) {
        self.status = QueryStatus::NotExecuted;
    }

    pub(crate) fn set_status(&mut self, status: QueryStatus) {
        self.status = status;
    }

    /// Element values of a write query, in address order
    pub fn write_words(&self) -> &[u16] {
        &self.write_words
    }

    /// Human-readable range for logs and errors
    pub fn describe(&self) -> String {
        let op = match self.operation {
            QueryOperation::Read => "read",
            QueryOperation::Write => "write",
        };
        format!(
            "{} {} {}(s) @ {}",
            op,
            self.count,
            self.kind.name(),
            self.start
        )
    }

    /// Split into two queries over the first and second half of the
    /// covered registers
    ///
    /// Only read queries over more than one register split; the halves
    /// inherit kind and function. Returns `None` (and pins the query as
    /// unsplittable) otherwise.
    pub fn split(&mut self) -> Option<(Query, Query)> {
        if self.operation != QueryOperation::Read || self.slots.len() < 2 {
            self.splittable = false;
            return None;
        }
        let mid = self.slots.len() / 2;
        let low = Query::read(self.kind, self.slots[..mid].to_vec()).ok()?;
        let high = Query::read(self.kind, self.slots[mid..].to_vec()).ok()?;
        Some((low, high))
    }

    /// Apply a successful read payload onto the covered registers
    ///
    /// Decodes each register's elements out of the payload, feeds them to
    /// the register states and reports the resulting events.
    pub fn finalize_read(
        &mut self,
        slots: &mut [RegisterSlot],
        payload: &[u8],
    ) -> BusResult<Vec<PendingEvent>> {
        debug_assert_eq!(self.operation, QueryOperation::Read);

        let needed = if self.kind.is_single_bit() {
            (self.count as usize + 7) / 8
        } else {
            self.count as usize * 2
        };
        if payload.len() < needed {
            return Err(BusError::frame(format!(
                "read payload is {} byte(s), expected {}",
                payload.len(),
                needed
            )));
        }

        let words = if self.kind.is_single_bit() {
            Vec::new()
        } else {
            value::words_from_payload(payload)
        };

        let mut events = Vec::new();
        for qslot in &self.slots {
            let slot = &mut slots[qslot.index];
            let raw = if self.kind.is_single_bit() {
                u64::from(value::bit_from_payload(
                    payload,
                    (qslot.address - self.start) as usize,
                ))
            } else {
                let offset = (qslot.address - self.start) as usize;
                value::words_to_raw(
                    &words[offset..offset + qslot.width as usize],
                    slot.def.word_order,
                )
            };

            let (changed, transition) = slot.state.accept_read_value(raw);
            if let Some(state) = transition {
                events.push(PendingEvent::Error {
                    slot: qslot.index,
                    state,
                });
            }
            if changed {
                events.push(PendingEvent::Value { slot: qslot.index });
            }
        }

        self.status = QueryStatus::Ok;
        Ok(events)
    }

    /// Mark the covered registers as successfully written
    pub fn finalize_write(&mut self, slots: &mut [RegisterSlot]) -> Vec<PendingEvent> {
        debug_assert_eq!(self.operation, QueryOperation::Write);

        let mut events = Vec::new();
        for qslot in &self.slots {
            if let Some(state) = slots[qslot.index].state.accept_write_ok() {
                events.push(PendingEvent::Error {
                    slot: qslot.index,
                    state,
                });
            }
        }
        self.status = QueryStatus::Ok;
        events
    }

    /// Record a failed execution on the covered registers
    ///
    /// Values are left untouched; only the per-operation error bit flips,
    /// and only actual transitions produce events.
    pub fn fail(&mut self, slots: &mut [RegisterSlot], status: QueryStatus) -> Vec<PendingEvent> {
        debug_assert!(status.is_error());
        self.status = status;

        let mut events = Vec::new();
        for qslot in &self.slots {
            let transition = match self.operation {
                QueryOperation::Read => slots[qslot.index].state.accept_read_error(),
                QueryOperation::Write => slots[qslot.index].state.accept_write_error(),
            };
            if let Some(state) = transition {
                events.push(PendingEvent::Error {
                    slot: qslot.index,
                    state,
                });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{ErrorState, RegisterDef};
    use crate::value::RegisterFormat;

    fn slot(index: usize, address: u16, width: u16) -> QuerySlot {
        QuerySlot {
            index,
            address,
            width,
        }
    }

    fn holding_slots(defs: &[(u16, u16)]) -> Vec<RegisterSlot> {
        defs.iter()
            .map(|&(address, width)| {
                RegisterSlot::new(
                    RegisterDef::new(RegisterKind::Holding, address).with_width(width),
                )
            })
            .collect()
    }

    #[test]
    fn test_read_query_span() {
        let q = Query::read(
            RegisterKind::Holding,
            vec![slot(0, 4, 1), slot(1, 6, 2), slot(2, 18, 1)],
        )
        .unwrap();
        assert_eq!(q.start(), 4);
        assert_eq!(q.count(), 15);
        assert!(q.has_holes());
        assert!(q.splittable());
        assert_eq!(q.function(), FunctionCode::ReadHoldingRegisters);
        assert_eq!(q.describe(), "read 15 holding(s) @ 4");
    }

    #[test]
    fn test_contiguous_query_has_no_holes() {
        let q = Query::read(
            RegisterKind::Holding,
            vec![slot(0, 10, 2), slot(1, 12, 1)],
        )
        .unwrap();
        assert!(!q.has_holes());
    }

    #[test]
    fn test_read_query_rejects_overlap_and_ceiling() {
        assert!(Query::read(
            RegisterKind::Holding,
            vec![slot(0, 10, 2), slot(1, 11, 1)],
        )
        .is_err());

        assert!(Query::read(
            RegisterKind::Holding,
            vec![slot(0, 0, 1), slot(1, 200, 1)],
        )
        .is_err());
    }

    #[test]
    fn test_split_halves() {
        let mut q = Query::read(
            RegisterKind::Holding,
            vec![slot(0, 4, 1), slot(1, 6, 1), slot(2, 7, 1), slot(3, 18, 1)],
        )
        .unwrap();
        let (low, high) = q.split().unwrap();
        assert_eq!(low.start(), 4);
        assert_eq!(low.count(), 3);
        assert_eq!(high.start(), 7);
        assert_eq!(high.count(), 12);

        let mut single = Query::read(RegisterKind::Holding, vec![slot(0, 4, 1)]).unwrap();
        assert!(single.split().is_none());
        assert!(!single.splittable());
    }

    #[test]
    fn test_finalize_read_decodes_multi_element_values() {
        let mut slots = holding_slots(&[(30, 4), (34, 1)]);
        slots[0].def = slots[0].def.clone().with_format(RegisterFormat::S64);

        let mut q = Query::read(
            RegisterKind::Holding,
            vec![slot(0, 30, 4), slot(1, 34, 1)],
        )
        .unwrap();

        let payload = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // slot 0
            0x00, 0x15, // slot 1
        ];
        let events = q.finalize_read(&mut slots, &payload).unwrap();
        assert_eq!(q.status(), QueryStatus::Ok);
        assert_eq!(slots[0].state.value(), 0x0102_0304_0506_0708);
        assert_eq!(slots[1].state.value(), 0x15);
        assert_eq!(
            events,
            vec![
                PendingEvent::Value { slot: 0 },
                PendingEvent::Value { slot: 1 }
            ]
        );
    }

    #[test]
    fn test_finalize_read_decodes_bits_with_holes() {
        let mut slots: Vec<RegisterSlot> = [0u16, 1, 4]
            .iter()
            .map(|&a| RegisterSlot::new(RegisterDef::new(RegisterKind::Coil, a)))
            .collect();

        let mut q = Query::read(
            RegisterKind::Coil,
            vec![slot(0, 0, 1), slot(1, 1, 1), slot(2, 4, 1)],
        )
        .unwrap();

        // bits 0..=4 on the wire: 0, 1, x, x, 1
        let events = q.finalize_read(&mut slots, &[0b0001_0010]).unwrap();
        assert_eq!(slots[0].state.value(), 0);
        assert_eq!(slots[1].state.value(), 1);
        assert_eq!(slots[2].state.value(), 1);
        // coil@0 read zero, which matches the initial published value
        assert_eq!(
            events,
            vec![
                PendingEvent::Value { slot: 1 },
                PendingEvent::Value { slot: 2 }
            ]
        );
    }

    #[test]
    fn test_finalize_read_rejects_short_payload() {
        let mut slots = holding_slots(&[(0, 1), (1, 1)]);
        let mut q =
            Query::read(RegisterKind::Holding, vec![slot(0, 0, 1), slot(1, 1, 1)]).unwrap();
        assert!(q.finalize_read(&mut slots, &[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_fail_flips_error_bits_once() {
        let mut slots = holding_slots(&[(0, 1)]);
        let mut q = Query::read(RegisterKind::Holding, vec![slot(0, 0, 1)]).unwrap();

        let events = q.fail(&mut slots, QueryStatus::TransientError);
        assert_eq!(
            events,
            vec![PendingEvent::Error {
                slot: 0,
                state: ErrorState::ReadError
            }]
        );
        // same failure again: debounced, no event
        let events = q.fail(&mut slots, QueryStatus::TransientError);
        assert!(events.is_empty());
    }

    #[test]
    fn test_write_query_encoding() {
        let def_slot = slot(0, 70, 1);
        let q = Query::write(RegisterKind::Holding, def_slot, 0x15, WordOrder::BigEndian).unwrap();
        assert_eq!(q.function(), FunctionCode::WriteSingleRegister);
        assert_eq!(q.write_words(), &[0x15]);

        let q = Query::write(
            RegisterKind::Holding,
            slot(0, 30, 4),
            0x0102_0304_0506_0708,
            WordOrder::BigEndian,
        )
        .unwrap();
        assert_eq!(q.function(), FunctionCode::WriteMultipleRegisters);
        assert_eq!(q.write_words(), &[0x0102, 0x0304, 0x0506, 0x0708]);

        let q = Query::write(
            RegisterKind::Holding,
            slot(0, 30, 2),
            0x0001_0002,
            WordOrder::LittleEndian,
        )
        .unwrap();
        assert_eq!(q.write_words(), &[0x0002, 0x0001]);

        let q = Query::write(RegisterKind::Coil, slot(0, 0, 1), 1, WordOrder::BigEndian).unwrap();
        assert_eq!(q.function(), FunctionCode::WriteSingleCoil);
        assert_eq!(q.write_words(), &[1]);

        let q = Query::write(
            RegisterKind::HoldingMulti,
            slot(0, 5, 1),
            0x42,
            WordOrder::BigEndian,
        )
        .unwrap();
        assert_eq!(q.function(), FunctionCode::WriteMultipleRegisters);

        assert!(Query::write(RegisterKind::Input, slot(0, 5, 1), 1, WordOrder::BigEndian).is_err());
    }
}
