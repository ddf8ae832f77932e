/// Register plan builder
///
/// Groups a device's polled registers into the minimal sequence of read
/// queries that covers every register, under the device's limits:
/// maximum elements per read and maximum tolerated address gap between
/// coalesced registers. Identical inputs always produce the identical
/// query sequence.
use crate::error::BusResult;
use crate::protocol::{RegisterKind, MAX_READ_REGISTERS};
use crate::query::{Query, QuerySlot};
use crate::register::RegisterSlot;

/// Per-device protocol limits
///
/// Devices frequently stay below the protocol ceilings; the defaults are
/// the conservative ones (no coalescing across gaps, one register per
/// read) so that an unconfigured device is never over-asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest tolerated address gap inside a 16-bit register query
    pub max_hole_registers: u16,
    /// Largest tolerated address gap inside a single-bit query
    pub max_hole_bits: u16,
    /// Maximum 16-bit elements per read, clamped to the protocol ceiling
    pub max_read_registers: u16,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_hole_registers: 0,
            max_hole_bits: 0,
            max_read_registers: 1,
        }
    }
}

impl DeviceLimits {
    /// Create limits with the conservative defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the register-query hole tolerance
    pub fn with_max_hole_registers(mut self, holes: u16) -> Self {
        self.max_hole_registers = holes;
        self
    }

    /// Set the bit-query hole tolerance
    pub fn with_max_hole_bits(mut self, holes: u16) -> Self {
        self.max_hole_bits = holes;
        self
    }

    /// Set the read batch ceiling; values outside 1..=125 are clamped
    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count.clamp(1, MAX_READ_REGISTERS);
        self
    }

    /// Hole tolerance for a register kind
    pub fn max_hole(&self, kind: RegisterKind) -> u16 {
        if kind.is_single_bit() {
            self.max_hole_bits
        } else {
            self.max_hole_registers
        }
    }

    /// Element ceiling for a register kind
    ///
    /// Bit reads are cheap on the wire and always use the protocol
    /// ceiling; register reads honour the configured batch size.
    pub fn max_elements(&self, kind: RegisterKind) -> u16 {
        if kind.is_single_bit() {
            kind.max_read_elements()
        } else {
            self.max_read_registers.clamp(1, MAX_READ_REGISTERS)
        }
    }
}

/// Build the read plan for one device
///
/// `indices` selects the polled slots. Registers are sorted by
/// (kind, address) and greedily accumulated into runs; a run is extended
/// by the next register iff the kind matches, the poll interval matches,
/// the address gap stays within the hole tolerance and the merged span
/// stays within the element ceiling. A register wider than the ceiling
/// still becomes a query of its own: multi-element values are atomic.
pub fn build_queries(
    slots: &[RegisterSlot],
    indices: &[usize],
    limits: &DeviceLimits,
) -> BusResult<Vec<Query>> {
    let mut order: Vec<usize> = indices.to_vec();
    order.sort_by_key(|&i| (slots[i].def.kind, slots[i].def.address));

    let mut queries = Vec::new();
    let mut run: Vec<QuerySlot> = Vec::new();
    let mut run_kind = RegisterKind::Coil;
    let mut run_interval = None;
    let mut run_start = 0u16;
    let mut run_end = 0u32; // exclusive, u32 to survive address 0xFFFF

    for &index in &order {
        let def = &slots[index].def;
        let new_end = u32::from(def.address) + u32::from(def.width);

        let extends = !run.is_empty()
            && def.kind == run_kind
            && def.poll_interval_ms == run_interval
            && u32::from(def.address) >= run_end
            && u32::from(def.address) <= run_end + u32::from(limits.max_hole(def.kind))
            && new_end - u32::from(run_start) <= u32::from(limits.max_elements(def.kind));

        if !extends {
            if !run.is_empty() {
                queries.push(Query::read(run_kind, std::mem::take(&mut run))?);
            }
            run_kind = def.kind;
            run_interval = def.poll_interval_ms;
            run_start = def.address;
        }

        run.push(QuerySlot {
            index,
            address: def.address,
            width: def.width,
        });
        run_end = new_end;
    }

    if !run.is_empty() {
        queries.push(Query::read(run_kind, run)?);
    }

    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegisterDef;
    use crate::value::RegisterFormat;

    fn slots(defs: Vec<RegisterDef>) -> (Vec<RegisterSlot>, Vec<usize>) {
        let indices = (0..defs.len()).collect();
        (defs.into_iter().map(RegisterSlot::new).collect(), indices)
    }

    #[test]
    fn test_hole_coalescing() {
        let (slots, indices) = slots(vec![
            RegisterDef::new(RegisterKind::Holding, 4),
            RegisterDef::new(RegisterKind::Holding, 6),
            RegisterDef::new(RegisterKind::Holding, 7),
            RegisterDef::new(RegisterKind::Holding, 18),
        ]);

        let limits = DeviceLimits::new()
            .with_max_hole_registers(10)
            .with_max_read_registers(100);
        let plan = build_queries(&slots, &indices, &limits).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].start(), 4);
        assert_eq!(plan[0].count(), 15);
        assert!(plan[0].has_holes());

        // coalescing disabled: three queries (6 and 7 stay adjacent)
        let limits = DeviceLimits::new().with_max_read_registers(100);
        let plan = build_queries(&slots, &indices, &limits).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].start(), 4);
        assert_eq!(plan[1].start(), 6);
        assert_eq!(plan[1].count(), 2);
        assert_eq!(plan[2].start(), 18);
    }

    #[test]
    fn test_kinds_never_mix() {
        let (slots, indices) = slots(vec![
            RegisterDef::new(RegisterKind::Coil, 0),
            RegisterDef::new(RegisterKind::Coil, 1),
            RegisterDef::new(RegisterKind::Discrete, 20),
            RegisterDef::new(RegisterKind::Holding, 30).with_format(RegisterFormat::S64),
            RegisterDef::new(RegisterKind::Holding, 70),
            RegisterDef::new(RegisterKind::Input, 40),
        ]);

        let plan = build_queries(&slots, &indices, &DeviceLimits::new()).unwrap();
        assert_eq!(plan.len(), 5);
        // deterministic (kind, address) order
        assert_eq!(plan[0].kind(), RegisterKind::Coil);
        assert_eq!(plan[0].count(), 2);
        assert_eq!(plan[1].kind(), RegisterKind::Discrete);
        assert_eq!(plan[2].kind(), RegisterKind::Holding);
        assert_eq!(plan[2].start(), 30);
        assert_eq!(plan[2].count(), 4);
        assert_eq!(plan[3].kind(), RegisterKind::Holding);
        assert_eq!(plan[3].start(), 70);
        assert_eq!(plan[4].kind(), RegisterKind::Input);
    }

    #[test]
    fn test_every_register_covered_exactly_once() {
        let defs: Vec<RegisterDef> = (0..40)
            .map(|i| RegisterDef::new(RegisterKind::Holding, i * 3))
            .collect();
        let (slots, indices) = slots(defs);

        let limits = DeviceLimits::new()
            .with_max_hole_registers(2)
            .with_max_read_registers(10);
        let plan = build_queries(&slots, &indices, &limits).unwrap();

        let mut covered: Vec<usize> = plan
            .iter()
            .flat_map(|q| q.slots().iter().map(|s| s.index))
            .collect();
        covered.sort_unstable();
        assert_eq!(covered, indices);

        for query in &plan {
            assert!(query.count() <= 10);
        }
    }

    #[test]
    fn test_batch_ceiling_respected() {
        let defs: Vec<RegisterDef> = (0..10)
            .map(|i| RegisterDef::new(RegisterKind::Holding, i))
            .collect();
        let (slots, indices) = slots(defs);

        let limits = DeviceLimits::new()
            .with_max_hole_registers(0)
            .with_max_read_registers(4);
        let plan = build_queries(&slots, &indices, &limits).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].count(), 4);
        assert_eq!(plan[1].count(), 4);
        assert_eq!(plan[2].count(), 2);
    }

    #[test]
    fn test_wide_register_is_atomic() {
        // a width-4 register is one query even with a batch ceiling of 1
        let (slots, indices) = slots(vec![
            RegisterDef::new(RegisterKind::Holding, 10).with_format(RegisterFormat::U64),
            RegisterDef::new(RegisterKind::Holding, 14),
        ]);

        let plan = build_queries(&slots, &indices, &DeviceLimits::new()).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].start(), 10);
        assert_eq!(plan[0].count(), 4);
        assert_eq!(plan[1].start(), 14);
        assert_eq!(plan[1].count(), 1);
    }

    #[test]
    fn test_differing_poll_intervals_do_not_merge() {
        let (slots, indices) = slots(vec![
            RegisterDef::new(RegisterKind::Holding, 0),
            RegisterDef::new(RegisterKind::Holding, 1).with_poll_interval_ms(1000),
        ]);

        let limits = DeviceLimits::new().with_max_read_registers(10);
        let plan = build_queries(&slots, &indices, &limits).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_bit_batches_use_protocol_ceiling() {
        let defs: Vec<RegisterDef> = (0..300)
            .map(|i| RegisterDef::new(RegisterKind::Coil, i))
            .collect();
        let (slots, indices) = slots(defs);

        // max_read_registers applies to 16-bit kinds only
        let plan = build_queries(&slots, &indices, &DeviceLimits::new()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].count(), 300);
    }

    #[test]
    fn test_deterministic_output() {
        let defs: Vec<RegisterDef> = vec![
            RegisterDef::new(RegisterKind::Input, 9),
            RegisterDef::new(RegisterKind::Holding, 3),
            RegisterDef::new(RegisterKind::Coil, 12),
            RegisterDef::new(RegisterKind::Holding, 1),
        ];
        let (slots, indices) = slots(defs);
        let limits = DeviceLimits::new()
            .with_max_hole_registers(1)
            .with_max_read_registers(8);

        let a = build_queries(&slots, &indices, &limits).unwrap();
        let b = build_queries(&slots, &indices, &limits).unwrap();
        let describe = |plan: &[Query]| {
            plan.iter().map(|q| q.describe()).collect::<Vec<_>>()
        };
        assert_eq!(describe(&a), describe(&b));
        assert_eq!(describe(&a), vec![
            "read 1 coil(s) @ 12",
            "read 3 holding(s) @ 1",
            "read 1 input(s) @ 9",
        ]);
    }
}
