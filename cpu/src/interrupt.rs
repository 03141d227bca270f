//! Arbitration of device and software interrupt requests.
//!
//! Each priority level has a fixed number of vector slots.  A device
//! is given a contiguous run of slots at one level when it is
//! attached, and it raises or withdraws its requests through them.
//! The processor's program interrupt request register (PIRQ) is a
//! second source of requests, one bit per level 1 to 7, all sharing
//! a single vector.
//!
//! The fabric never dispatches anything itself.  It summarises
//! whether any request is above the processor priority into the
//! interrupt slot of the [`TrapUnit`], and when the processor decides
//! to take an interrupt it hands out the winning vector.
use std::fmt::{self, Display, Formatter};

use tracing::{event, Level};

use base::prelude::*;

use crate::bus::{DeviceId, RegistrationError};
use crate::config::CpuConfiguration;
use crate::trap::TrapUnit;

/// Vector used for all program interrupt requests.
pub const PIRQ_VECTOR: u16 = 0o240;

/// Request bits of the PIRQ register; level L is bit 8+L.
const PIRQ_REQUEST_BITS: u16 = 0o177000;

/// What a device asks for when it is attached: `count` vector slots
/// at `level`, with vectors `first_vector`, `first_vector + 4`, and
/// so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptRequest {
    pub level: PriorityLevel,
    pub first_vector: u16,
    pub count: u8,
}

/// The slots assigned to one device.  A device refers to its
/// interrupts by index into this table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorTable {
    pub level: PriorityLevel,
    pub first_slot: u8,
    pub vectors: Vec<u16>,
}

impl VectorTable {
    pub fn slot(&self, index: usize) -> Option<u8> {
        if index < self.vectors.len() {
            u8::try_from(index).ok().map(|i| self.first_slot + i)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotAssignment {
    vector: u16,
    owner: DeviceId,
}

#[derive(Debug, Clone)]
struct InterruptLevel {
    pending: u64,
    slots: Vec<Option<SlotAssignment>>,
}

/// Where an acknowledged interrupt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    Device { owner: DeviceId, slot: u8 },
    Program,
}

/// An interrupt the processor has agreed to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledged {
    pub vector: u16,
    pub level: PriorityLevel,
    pub source: InterruptSource,
}

impl Display for Acknowledged {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self.source {
            InterruptSource::Device { owner, slot } => write!(
                f,
                "level {} interrupt from {owner} (slot {slot}), vector {:o}",
                self.level, self.vector
            ),
            InterruptSource::Program => write!(
                f,
                "level {} program interrupt, vector {:o}",
                self.level, self.vector
            ),
        }
    }
}

#[derive(Debug)]
pub struct InterruptFabric {
    levels: Vec<InterruptLevel>,
    slots_per_level: u8,
    lowest_device_level: u8,
    pirq: u16,
}

impl InterruptFabric {
    pub fn new(config: &CpuConfiguration) -> InterruptFabric {
        let level = InterruptLevel {
            pending: 0,
            slots: vec![None; usize::from(config.slots_per_level)],
        };
        InterruptFabric {
            levels: vec![level; usize::from(config.priority_levels)],
            slots_per_level: config.slots_per_level,
            lowest_device_level: config.lowest_device_level,
            pirq: 0,
        }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn slots_per_level(&self) -> u8 {
        self.slots_per_level
    }

    fn device_level(&self, level: PriorityLevel) -> Result<&InterruptLevel, RegistrationError> {
        if level.value() < self.lowest_device_level {
            return Err(RegistrationError::LevelNotInterruptCapable(level));
        }
        self.levels
            .get(level.index())
            .ok_or(RegistrationError::LevelNotInterruptCapable(level))
    }

    /// Assign a contiguous run of free slots to `owner`.  Fails
    /// without assigning anything if there is no such run.
    pub fn reserve(
        &mut self,
        owner: DeviceId,
        request: InterruptRequest,
    ) -> Result<VectorTable, RegistrationError> {
        let count = usize::from(request.count);
        let slots = &self.device_level(request.level)?.slots;
        let first = (0..slots.len())
            .find(|start| {
                slots
                    .get(*start..start + count)
                    .is_some_and(|run| run.iter().all(Option::is_none))
            })
            .ok_or(RegistrationError::SlotsExhausted {
                level: request.level,
                wanted: request.count,
            })?;
        let vectors: Vec<u16> = (0..request.count)
            .map(|i| request.first_vector.wrapping_add(4 * u16::from(i)))
            .collect();
        let level = &mut self.levels[request.level.index()];
        for (i, vector) in vectors.iter().enumerate() {
            level.slots[first + i] = Some(SlotAssignment {
                vector: *vector,
                owner,
            });
        }
        // first < slots_per_level <= 64, so this cannot truncate.
        let first_slot = first as u8;
        event!(
            Level::DEBUG,
            "{owner} given level {} slots {first_slot}..{}",
            request.level,
            first + count
        );
        Ok(VectorTable {
            level: request.level,
            first_slot,
            vectors,
        })
    }

    /// Free every slot owned by `owner`, withdrawing its requests.
    pub fn release(&mut self, owner: DeviceId) {
        for level in self.levels.iter_mut() {
            for (i, slot) in level.slots.iter_mut().enumerate() {
                if slot.is_some_and(|a| a.owner == owner) {
                    *slot = None;
                    level.pending &= !(1 << i);
                }
            }
        }
    }

    fn assigned(&mut self, level: PriorityLevel, slot: u8) -> Option<&mut InterruptLevel> {
        let l = self.levels.get_mut(level.index())?;
        match l.slots.get(usize::from(slot)) {
            Some(Some(_)) => Some(l),
            _ => {
                event!(
                    Level::WARN,
                    "ignoring request on unassigned level {level} slot {slot}"
                );
                None
            }
        }
    }

    /// Raise the request on a slot.  Raising an already-raised request
    /// has no effect.
    pub fn request(&mut self, level: PriorityLevel, slot: u8) {
        if let Some(l) = self.assigned(level, slot) {
            l.pending |= 1 << slot;
        }
    }

    pub fn cancel(&mut self, level: PriorityLevel, slot: u8) {
        if let Some(l) = self.assigned(level, slot) {
            l.pending &= !(1 << slot);
        }
    }

    pub fn is_requesting(&self, level: PriorityLevel, slot: u8) -> bool {
        self.levels
            .get(level.index())
            .is_some_and(|l| slot < 64 && l.pending & (1 << slot) != 0)
    }

    fn program_request(&self, level: usize) -> bool {
        (1..8).contains(&level) && self.pirq & (1 << (8 + level)) != 0
    }

    /// Levels strictly above `ipl`, highest first.
    fn levels_above(&self, ipl: PriorityLevel) -> impl Iterator<Item = usize> {
        (ipl.index() + 1..self.levels.len()).rev()
    }

    /// Work out whether any request is above `ipl` and tell the trap
    /// unit.  This has to happen after anything which might change
    /// the answer.
    pub fn reevaluate(&self, ipl: PriorityLevel, traps: &mut TrapUnit) -> bool {
        let pending = self
            .levels_above(ipl)
            .any(|l| self.levels[l].pending != 0 || self.program_request(l));
        traps.set_interrupt_pending(pending);
        pending
    }

    /// Take the most urgent request above `ipl`.  Within a level,
    /// device requests win over the program request and lower slot
    /// numbers win over higher ones.  A device request is consumed;
    /// the program request stays until software clears it.
    pub fn acknowledge(&mut self, ipl: PriorityLevel) -> Option<Acknowledged> {
        for l in self.levels_above(ipl) {
            // l < 8 because there are at most 8 levels.
            let level = PriorityLevel::from_bits(l as u16);
            let state = &mut self.levels[l];
            if state.pending != 0 {
                let slot = state.pending.trailing_zeros() as u8;
                state.pending &= !(1 << slot);
                if let Some(a) = state.slots[usize::from(slot)] {
                    let ack = Acknowledged {
                        vector: a.vector,
                        level,
                        source: InterruptSource::Device {
                            owner: a.owner,
                            slot,
                        },
                    };
                    event!(Level::DEBUG, "acknowledged {ack}");
                    return Some(ack);
                }
            }
            if self.program_request(l) {
                let ack = Acknowledged {
                    vector: PIRQ_VECTOR,
                    level,
                    source: InterruptSource::Program,
                };
                event!(Level::DEBUG, "acknowledged {ack}");
                return Some(ack);
            }
        }
        None
    }

    /// The value read from the PIRQ register: the request bits plus
    /// the highest requested level, encoded twice.
    pub fn pirq(&self) -> u16 {
        let requests = self.pirq & PIRQ_REQUEST_BITS;
        if requests == 0 {
            return 0;
        }
        let highest = 15 - requests.leading_zeros() as u16 - 8;
        requests | (highest << 5) | (highest << 1)
    }

    /// Load the request bits of the PIRQ register.  The level fields
    /// are computed, not stored.
    pub fn write_pirq(&mut self, value: u16) {
        self.pirq = value & PIRQ_REQUEST_BITS;
        event!(Level::DEBUG, "PIRQ set to {:o}", self.pirq());
    }

    pub fn pending_masks(&self) -> Vec<u64> {
        self.levels.iter().map(|l| l.pending).collect()
    }

    /// Restore the pending masks from a snapshot.  Bits for
    /// unassigned slots are dropped.
    pub(crate) fn restore(&mut self, masks: &[u64], pirq: u16) {
        for (level, mask) in self.levels.iter_mut().zip(masks) {
            let assigned: u64 = level
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_some())
                .fold(0, |acc, (i, _)| acc | (1 << i));
            level.pending = mask & assigned;
        }
        self.pirq = pirq & PIRQ_REQUEST_BITS;
    }

    /// Withdraw every request, as a bus reset does.  Slot assignments
    /// are kept.
    pub fn reset(&mut self) {
        for level in self.levels.iter_mut() {
            level.pending = 0;
        }
        self.pirq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::TrapSlot;
    use proptest::prop_assert_eq;
    use test_strategy::proptest;

    fn level(n: u8) -> PriorityLevel {
        PriorityLevel::try_from(n).expect("test levels are valid")
    }

    fn fabric() -> InterruptFabric {
        InterruptFabric::new(&CpuConfiguration::default())
    }

    fn one(level_number: u8, vector: u16) -> InterruptRequest {
        InterruptRequest {
            level: level(level_number),
            first_vector: vector,
            count: 1,
        }
    }

    #[test]
    fn test_reservation_is_contiguous_and_ascending() {
        let mut f = fabric();
        let a = f
            .reserve(DeviceId::new(1), InterruptRequest { count: 2, ..one(5, 0o300) })
            .expect("room");
        assert_eq!(a.first_slot, 0);
        assert_eq!(a.vectors, vec![0o300, 0o304]);
        let b = f.reserve(DeviceId::new(2), one(5, 0o310)).expect("room");
        assert_eq!(b.first_slot, 2);
        f.release(DeviceId::new(1));
        let c = f
            .reserve(DeviceId::new(3), InterruptRequest { count: 3, ..one(5, 0o320) })
            .expect("room");
        // Slots 0 and 1 are free again but too few for three.
        assert_eq!(c.first_slot, 3);
        let d = f.reserve(DeviceId::new(4), one(5, 0o340)).expect("room");
        assert_eq!(d.first_slot, 0);
    }

    #[test]
    fn test_reservation_fails_closed() {
        let mut f = fabric();
        assert_eq!(
            f.reserve(DeviceId::new(1), one(3, 0o300)),
            Err(RegistrationError::LevelNotInterruptCapable(level(3)))
        );
        assert_eq!(
            f.reserve(DeviceId::new(1), InterruptRequest { count: 33, ..one(4, 0o300) }),
            Err(RegistrationError::SlotsExhausted {
                level: level(4),
                wanted: 33
            })
        );
        // Nothing was assigned by the failed attempts.
        let whole = f
            .reserve(DeviceId::new(2), InterruptRequest { count: 32, ..one(4, 0o300) })
            .expect("all 32 slots are free");
        assert_eq!(whole.first_slot, 0);
    }

    #[test]
    fn test_lowest_slot_wins_within_a_level() {
        let mut f = fabric();
        for i in 0..8u16 {
            f.reserve(DeviceId::new(i), one(5, 0o300 + 4 * i)).expect("room");
        }
        f.request(level(5), 7);
        f.request(level(5), 3);
        let first = f.acknowledge(PriorityLevel::ZERO).expect("pending");
        assert_eq!(first.vector, 0o314);
        let second = f.acknowledge(PriorityLevel::ZERO).expect("pending");
        assert_eq!(second.vector, 0o334);
        assert_eq!(f.acknowledge(PriorityLevel::ZERO), None);
    }

    #[test]
    fn test_requests_at_or_below_priority_are_masked() {
        let mut f = fabric();
        let mut traps = TrapUnit::new();
        f.reserve(DeviceId::new(1), one(4, 0o60)).expect("room");
        f.request(level(4), 0);
        assert!(!f.reevaluate(level(5), &mut traps));
        assert!(!f.reevaluate(level(4), &mut traps));
        assert!(!traps.is_pending(TrapSlot::Interrupt));
        assert_eq!(f.acknowledge(level(4)), None);
        assert!(f.reevaluate(level(3), &mut traps));
        assert!(traps.is_pending(TrapSlot::Interrupt));
        assert_eq!(f.acknowledge(level(3)).map(|a| a.vector), Some(0o60));
        assert!(!f.reevaluate(level(3), &mut traps));
        assert!(!traps.is_pending(TrapSlot::Interrupt));
    }

    #[test]
    fn test_higher_level_wins() {
        let mut f = fabric();
        f.reserve(DeviceId::new(1), one(4, 0o60)).expect("room");
        f.reserve(DeviceId::new(2), one(6, 0o100)).expect("room");
        f.request(level(4), 0);
        f.request(level(6), 0);
        assert_eq!(f.acknowledge(PriorityLevel::ZERO).map(|a| a.vector), Some(0o100));
        assert_eq!(f.acknowledge(PriorityLevel::ZERO).map(|a| a.vector), Some(0o60));
    }

    #[test]
    fn test_cancel_and_unassigned_requests() {
        let mut f = fabric();
        f.reserve(DeviceId::new(1), one(6, 0o100)).expect("room");
        f.request(level(6), 0);
        f.request(level(6), 0);
        assert!(f.is_requesting(level(6), 0));
        f.cancel(level(6), 0);
        assert!(!f.is_requesting(level(6), 0));
        f.request(level(6), 5);
        assert!(!f.is_requesting(level(6), 5));
    }

    #[test]
    fn test_program_interrupt_requests() {
        let mut f = fabric();
        let mut traps = TrapUnit::new();
        f.write_pirq((1 << 14) | (1 << 10) | 0o356);
        // Levels 6 and 2 requested; the highest is reported twice.
        assert_eq!(f.pirq(), (1 << 14) | (1 << 10) | (6 << 5) | (6 << 1));
        assert!(f.reevaluate(level(5), &mut traps));
        let ack = f.acknowledge(level(5)).expect("level 6 requested");
        assert_eq!(ack.vector, PIRQ_VECTOR);
        assert_eq!(ack.level, level(6));
        assert_eq!(ack.source, InterruptSource::Program);
        // Still requested until software clears it.
        assert_eq!(f.acknowledge(level(5)).map(|a| a.level), Some(level(6)));
        assert!(!f.reevaluate(level(6), &mut traps));
        assert_eq!(f.acknowledge(level(1)).map(|a| a.level), Some(level(6)));
        f.write_pirq(1 << 10);
        assert_eq!(f.acknowledge(level(1)).map(|a| a.level), Some(level(2)));
        assert_eq!(f.acknowledge(level(2)), None);
    }

    #[test]
    fn test_device_beats_program_request_at_same_level() {
        let mut f = fabric();
        f.reserve(DeviceId::new(1), one(6, 0o100)).expect("room");
        f.write_pirq(1 << 14);
        f.request(level(6), 0);
        assert_eq!(f.acknowledge(level(0)).map(|a| a.vector), Some(0o100));
        assert_eq!(f.acknowledge(level(0)).map(|a| a.vector), Some(PIRQ_VECTOR));
    }

    #[test]
    fn test_program_request_beats_device_at_lower_level() {
        let mut f = fabric();
        let mut traps = TrapUnit::new();
        f.reserve(DeviceId::new(1), one(4, 0o60)).expect("room");
        f.request(level(4), 0);
        f.write_pirq(1 << 15);
        assert_eq!(f.acknowledge(level(0)).map(|a| a.vector), Some(PIRQ_VECTOR));
        // The program request at the processor's own level is masked.
        assert!(!f.reevaluate(level(7), &mut traps));
        assert_eq!(f.acknowledge(level(7)), None);
        f.write_pirq(0);
        assert_eq!(f.acknowledge(level(0)).map(|a| a.vector), Some(0o60));
    }

    #[test]
    fn test_release_withdraws_requests() {
        let mut f = fabric();
        f.reserve(DeviceId::new(1), one(7, 0o200)).expect("room");
        f.request(level(7), 0);
        f.release(DeviceId::new(1));
        assert_eq!(f.acknowledge(PriorityLevel::ZERO), None);
        assert_eq!(f.pending_masks(), vec![0; 8]);
    }

    /// Requests on levels 4 to 7 (one device per slot) plus program
    /// requests, taken at processor priority `ipl & 7`.
    #[proptest]
    fn acknowledged_level_is_highest_above_priority(
        #[strategy(proptest::collection::vec((4u8..8, 0u8..32), 0..24))] requests: Vec<(u8, u8)>,
        pirq: u16,
        ipl: u8,
    ) {
        let mut f = fabric();
        let mut traps = TrapUnit::new();
        for n in 4..8u8 {
            for slot in 0..32u16 {
                let owner = DeviceId::new(u16::from(n) * 32 + slot);
                f.reserve(owner, one(n, 0o300)).expect("one device per slot");
            }
        }
        for (n, slot) in &requests {
            f.request(level(*n), *slot);
        }
        f.write_pirq(pirq);
        let ipl = level(ipl & 7);

        let highest = (1..8u8)
            .filter(|n| {
                requests.iter().any(|(r, _)| r == n) || pirq & (1 << (8 + n)) != 0
            })
            .max();
        let expected = highest.filter(|n| *n > ipl.value());
        prop_assert_eq!(f.reevaluate(ipl, &mut traps), expected.is_some());
        prop_assert_eq!(f.acknowledge(ipl).map(|a| a.level.value()), expected);
    }
}
