//! Execution plan
//!
//! The scheduler's scratch area: one entry per `(cycle, lane)` slot,
//! `slot = cycle * workers + lane`. Floating instructions take two adjacent
//! slots of one cycle (one when a hash has a single lane).

use crate::randomx::config::RANDOMX_PROGRAM_SIZE;

/// Occupant of one slot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Slot {
    #[default]
    Free,
    Int(u8),
    /// First slot of a floating instruction
    FloatHead(u8),
    /// Second slot of a floating instruction
    FloatTail(u8),
}

impl Slot {
    pub fn is_free(self) -> bool {
        self == Slot::Free
    }

    /// Raw instruction index, for heads and integer slots only
    pub fn instruction(self) -> Option<usize> {
        match self {
            Slot::Int(i) | Slot::FloatHead(i) => Some(i as usize),
            Slot::Free | Slot::FloatTail(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    workers: usize,
    slots: Vec<Slot>,
}

impl ExecutionPlan {
    /// Room for every instruction in its own cycle, plus two spare cycles
    pub fn new(workers: usize) -> Self {
        assert!(workers.is_power_of_two() && workers <= 8);
        Self {
            workers,
            slots: vec![Slot::Free; (RANDOMX_PROGRAM_SIZE * 2 + 2) * workers],
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Slots a floating instruction takes
    pub fn float_width(&self) -> usize {
        self.workers.min(2)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Slot {
        self.slots[slot]
    }

    pub fn is_free(&self, slot: usize) -> bool {
        self.slots[slot].is_free()
    }

    pub fn cycle_of(&self, slot: usize) -> usize {
        slot / self.workers
    }

    /// First slot of the cycle holding `slot`
    pub fn cycle_start(&self, slot: usize) -> usize {
        slot - slot % self.workers
    }

    pub fn place_int(&mut self, slot: usize, index: usize) {
        assert!(self.slots[slot].is_free(), "slot {slot} already taken");
        self.slots[slot] = Slot::Int(index as u8);
    }

    pub fn place_float(&mut self, slot: usize, index: usize) {
        assert!(self.slots[slot].is_free(), "slot {slot} already taken");
        self.slots[slot] = Slot::FloatHead(index as u8);
        if self.float_width() == 2 {
            debug_assert_eq!(self.cycle_of(slot), self.cycle_of(slot + 1));
            assert!(self.slots[slot + 1].is_free(), "slot {} already taken", slot + 1);
            self.slots[slot + 1] = Slot::FloatTail(index as u8);
        }
    }

    /// Move the integer occupants of `from` and `from + 1` into the free
    /// pair at `to`, keeping their order and leaving `from..from + 2` free.
    ///
    /// When `to == from + 1` the pair overlaps the vacated slots, so the
    /// occupant shifts past them to `to + 1`.
    pub fn relocate(&mut self, from: usize, to: usize) {
        debug_assert!(to > from);
        debug_assert_eq!(self.cycle_of(from), self.cycle_of(to + 1));
        let moved = [self.slots[from], self.slots[from + 1]];
        self.slots[from] = Slot::Free;
        self.slots[from + 1] = Slot::Free;

        let mut dest = to;
        for entry in moved {
            if entry.is_free() {
                continue;
            }
            debug_assert!(matches!(entry, Slot::Int(_)), "only integer slots move");
            if dest < from + 2 {
                dest = from + 2;
            }
            assert!(self.slots[dest].is_free(), "relocation target {dest} taken");
            self.slots[dest] = entry;
            dest += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_takes_a_pair() {
        let mut plan = ExecutionPlan::new(4);
        plan.place_float(2, 7);
        assert_eq!(plan.get(2), Slot::FloatHead(7));
        assert_eq!(plan.get(3), Slot::FloatTail(7));
        assert_eq!(plan.get(3).instruction(), None);
        assert_eq!(plan.cycle_of(3), 0);
        assert_eq!(plan.cycle_start(6), 4);

        let mut serial = ExecutionPlan::new(1);
        serial.place_float(0, 1);
        assert!(serial.is_free(1));
        assert_eq!(serial.float_width(), 1);
    }

    #[test]
    fn relocate_disjoint_pair() {
        let mut plan = ExecutionPlan::new(8);
        plan.place_int(0, 3);
        plan.place_int(1, 4);
        plan.relocate(0, 4);
        assert!(plan.is_free(0) && plan.is_free(1));
        assert_eq!(plan.get(4), Slot::Int(3));
        assert_eq!(plan.get(5), Slot::Int(4));
    }

    #[test]
    fn relocate_overlapping_pair() {
        let mut plan = ExecutionPlan::new(4);
        plan.place_int(0, 9);
        // free pair found at 1..3 overlaps the vacated slots
        plan.relocate(0, 1);
        assert!(plan.is_free(0) && plan.is_free(1));
        assert_eq!(plan.get(2), Slot::Int(9));
        plan.place_float(0, 10);
        assert_eq!(plan.get(1), Slot::FloatTail(10));
        assert!(plan.is_free(3));
    }

    #[test]
    fn relocation_keeps_order() {
        let mut plan = ExecutionPlan::new(8);
        plan.place_int(0, 0);
        plan.place_int(1, 1);
        plan.place_int(2, 2);
        plan.relocate(0, 3);
        assert_eq!(plan.get(3), Slot::Int(0));
        assert_eq!(plan.get(4), Slot::Int(1));
        assert_eq!(plan.get(2), Slot::Int(2));
        plan.place_float(0, 5);
        assert_eq!(plan.get(0).instruction(), Some(5));
    }
}
