//! Lane-group primitives
//!
//! The lanes of one hash instance run in lockstep on a single thread. Each
//! lane keeps its own copy of the control state (instruction pointer and
//! rounding mode); after every dispatch group the lanes vote on pending
//! control changes and the lowest requesting lane broadcasts its value, so
//! all copies agree again before the next group starts.

use crate::randomx::config::LANES_PER_HASH;
use crate::randomx::softfloat::RoundingMode;

/// One bit per lane, lane 0 in bit 0
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaneMask(u8);

impl LaneMask {
    /// Collect one vote per lane, in lane order
    pub fn ballot<I: IntoIterator<Item = bool>>(votes: I) -> Self {
        let bits = votes
            .into_iter()
            .take(LANES_PER_HASH)
            .enumerate()
            .fold(0u8, |acc, (lane, vote)| acc | ((vote as u8) << lane));
        Self(bits)
    }

    pub fn any(self) -> bool {
        self.0 != 0
    }

    /// Lowest lane that voted yes
    pub fn lowest(self) -> Option<usize> {
        self.any().then(|| self.0.trailing_zeros() as usize)
    }
}

/// Control state private to one lane
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lane {
    pub ip: usize,
    pub fprc: RoundingMode,
    /// Jump requested during the current group
    pub jump: Option<usize>,
    /// Rounding mode requested during the current group
    pub rounding: Option<RoundingMode>,
}

impl Lane {
    fn new(fprc: RoundingMode) -> Self {
        Self {
            ip: 0,
            fprc,
            jump: None,
            rounding: None,
        }
    }
}

/// The cooperating lanes of one hash instance
#[derive(Clone, Debug)]
pub struct LaneGroup {
    lanes: [Lane; LANES_PER_HASH],
    width: usize,
}

impl LaneGroup {
    pub fn new(width: usize, fprc: RoundingMode) -> Self {
        assert!((1..=LANES_PER_HASH).contains(&width), "lane group of {width}");
        Self {
            lanes: [Lane::new(fprc); LANES_PER_HASH],
            width,
        }
    }

    pub fn lane(&self, lane: usize) -> &Lane {
        &self.lanes[..self.width][lane]
    }

    pub fn lane_mut(&mut self, lane: usize) -> &mut Lane {
        &mut self.lanes[..self.width][lane]
    }

    /// Shared instruction pointer; lanes agree outside a group
    pub fn ip(&self) -> usize {
        self.lanes[0].ip
    }

    /// Shared rounding mode; lanes agree outside a group
    pub fn rounding_mode(&self) -> RoundingMode {
        self.lanes[0].fprc
    }

    pub fn ballot<F: Fn(&Lane) -> bool>(&self, vote: F) -> LaneMask {
        LaneMask::ballot(self.lanes[..self.width].iter().map(vote))
    }

    /// Value held by lane `from`, as seen by every lane
    pub fn broadcast<T, F: Fn(&Lane) -> T>(&self, from: usize, read: F) -> T {
        read(&self.lanes[..self.width][from])
    }

    /// End-of-group resynchronization: settle pending jumps and rounding
    /// changes from the lowest requesting lane, then move every lane to the
    /// same next instruction. `fallthrough` is the word after the group.
    pub fn resync(&mut self, fallthrough: usize) {
        let jump = self
            .ballot(|lane| lane.jump.is_some())
            .lowest()
            .and_then(|from| self.broadcast(from, |lane| lane.jump));
        let rounding = self
            .ballot(|lane| lane.rounding.is_some())
            .lowest()
            .and_then(|from| self.broadcast(from, |lane| lane.rounding));

        let next = jump.unwrap_or(fallthrough);
        for lane in self.lanes[..self.width].iter_mut() {
            lane.ip = next;
            if let Some(mode) = rounding {
                lane.fprc = mode;
            }
            lane.jump = None;
            lane.rounding = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_votes() {
        let mask = LaneMask::ballot([false, true, false, true]);
        assert!(mask.any());
        assert_eq!(mask, LaneMask(0b1010));
        assert_eq!(mask.lowest(), Some(1));
        assert_eq!(LaneMask::ballot([false; 8]).lowest(), None);
    }

    #[test]
    fn lowest_requesting_lane_wins() {
        let mut group = LaneGroup::new(4, RoundingMode::NearestEven);
        group.lane_mut(3).jump = Some(10);
        group.lane_mut(2).jump = Some(7);
        group.lane_mut(1).rounding = Some(RoundingMode::TowardZero);
        group.resync(5);
        assert_eq!(group.ip(), 7);
        assert_eq!(group.rounding_mode(), RoundingMode::TowardZero);
        for lane in 0..4 {
            assert_eq!(group.lane(lane).ip, 7);
            assert_eq!(group.lane(lane).jump, None);
            assert_eq!(group.lane(lane).fprc, RoundingMode::TowardZero);
        }
    }

    #[test]
    fn quiet_group_falls_through() {
        let mut group = LaneGroup::new(2, RoundingMode::TowardPositive);
        group.resync(3);
        assert_eq!(group.ip(), 3);
        assert_eq!(group.rounding_mode(), RoundingMode::TowardPositive);
        assert_eq!(group.lane(1).ip, 3);
    }
}
