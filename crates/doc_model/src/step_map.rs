//! Position mapping through applied steps
//!
//! A `StepMap` records which ranges of the old document a step replaced and
//! how large the replacement was. Positions from before the step can be
//! pushed through it to find their counterpart afterwards. A `Mapping`
//! chains several maps, in application order.

use serde::{Deserialize, Serialize};

/// Which side a position sticks to when content is inserted exactly at it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assoc {
    /// Stay in front of inserted content
    Before,
    /// Move past inserted content
    After,
}

/// A replaced range, in the coordinates of the document before the step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedRange {
    pub start: usize,
    pub old_size: usize,
    pub new_size: usize,
}

/// Outcome of mapping one position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    /// Content directly before the position was deleted
    pub deleted_before: bool,
    /// Content directly after the position was deleted
    pub deleted_after: bool,
    /// The position was strictly inside a deleted range
    pub deleted_across: bool,
}

impl MapResult {
    fn unchanged(pos: usize) -> Self {
        Self {
            pos,
            deleted_before: false,
            deleted_after: false,
            deleted_across: false,
        }
    }

    fn merge(&mut self, other: MapResult) {
        self.pos = other.pos;
        self.deleted_before |= other.deleted_before;
        self.deleted_after |= other.deleted_after;
        self.deleted_across |= other.deleted_across;
    }
}

/// Position map of a single step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMap {
    ranges: Vec<MappedRange>,
}

impl StepMap {
    /// A map that leaves every position in place
    pub fn identity() -> Self {
        Self::default()
    }

    /// A map replacing `old_size` positions at `start` with `new_size` positions
    pub fn replace(start: usize, old_size: usize, new_size: usize) -> Self {
        if old_size == 0 && new_size == 0 {
            return Self::identity();
        }
        Self {
            ranges: vec![MappedRange {
                start,
                old_size,
                new_size,
            }],
        }
    }

    pub fn ranges(&self) -> &[MappedRange] {
        &self.ranges
    }

    pub fn is_identity(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut diff: isize = 0;
        for range in &self.ranges {
            let start = range.start;
            if start > pos {
                break;
            }
            let end = start + range.old_size;
            if pos <= end {
                let side = if range.old_size == 0 {
                    assoc
                } else if pos == start {
                    Assoc::Before
                } else if pos == end {
                    Assoc::After
                } else {
                    assoc
                };
                let offset = match side {
                    Assoc::Before => 0,
                    Assoc::After => range.new_size,
                };
                let mapped = (start as isize + diff) as usize + offset;
                let deleted = range.old_size > 0;
                return MapResult {
                    pos: mapped,
                    deleted_before: deleted && pos != start,
                    deleted_after: deleted && pos != end,
                    deleted_across: deleted && pos != start && pos != end,
                };
            }
            diff += range.new_size as isize - range.old_size as isize;
        }
        MapResult::unchanged((pos as isize + diff) as usize)
    }
}

/// A sequence of step maps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    maps: Vec<StepMap>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, map: StepMap) {
        if !map.is_identity() {
            self.maps.push(map);
        }
    }

    /// Append all maps of another mapping
    pub fn extend(&mut self, other: Mapping) {
        self.maps.extend(other.maps);
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut result = MapResult::unchanged(pos);
        for map in &self.maps {
            let next = map.map_result(result.pos, assoc);
            result.merge(next);
        }
        result
    }
}

impl From<StepMap> for Mapping {
    fn from(map: StepMap) -> Self {
        let mut mapping = Mapping::new();
        mapping.push(map);
        mapping
    }
}

impl FromIterator<StepMap> for Mapping {
    fn from_iter<T: IntoIterator<Item = StepMap>>(iter: T) -> Self {
        let mut mapping = Mapping::new();
        for map in iter {
            mapping.push(map);
        }
        mapping
    }
}
