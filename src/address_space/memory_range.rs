use crate::remote_ptr::RemotePtr;
use core::cmp::Ordering;
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::fmt::{Display, Formatter, Result};
use std::ops::{Deref, DerefMut};

#[derive(
    Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct MemoryRange {
    start_: RemotePtr,
    end_: RemotePtr,
}

/// Note: The end point (end_) is implicitly NOT included in the MemoryRange
impl MemoryRange {
    pub fn new() -> MemoryRange {
        Default::default()
    }

    pub fn new_range(addr: RemotePtr, num_bytes: usize) -> MemoryRange {
        // If there is an overflow in addition, rust should panic in debug mode.
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(addr: RemotePtr, end: RemotePtr) -> MemoryRange {
        let result = MemoryRange {
            start_: addr,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// The memory behind `items`.
    pub fn of_slice<T>(items: &[T]) -> MemoryRange {
        MemoryRange::new_range(RemotePtr::from_ptr(items.as_ptr()), std::mem::size_of_val(items))
    }

    /// Return true iff `other` is an address range fully contained by self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    /// Note that we have p < self.end_ and not p <= self.end here.
    pub fn contains_ptr(&self, p: RemotePtr) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersect(&self, other: &MemoryRange) -> MemoryRange {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        MemoryRange {
            start_: s,
            end_: max(s, e),
        }
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    /// The parts of self not covered by any of `others`, in address order.
    pub fn subtract(&self, others: &[MemoryRange]) -> Vec<MemoryRange> {
        let mut holes: Vec<MemoryRange> = others
            .iter()
            .filter(|o| o.intersects(self))
            .map(|o| o.intersect(self))
            .collect();
        holes.sort();

        let mut result = Vec::new();
        let mut cursor = self.start_;
        for h in holes {
            if h.start_ > cursor {
                result.push(MemoryRange::from_range(cursor, h.start_));
            }
            cursor = max(cursor, h.end_);
        }
        if cursor < self.end_ {
            result.push(MemoryRange::from_range(cursor, self.end_));
        }
        result
    }

    pub fn start(&self) -> RemotePtr {
        self.start_
    }
    pub fn end(&self) -> RemotePtr {
        self.end_
    }
    pub fn size(&self) -> usize {
        // Should automatically flag an error in debug mode if size() is negative
        self.end_ - self.start_
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}

/// This wrapper type is needed for special ordering requirements
/// Traits PartialOrd, Ord, PartialEq, Eq are manually derived (see below).
///
/// Overlapping ranges compare equal, so a `BTreeMap<MemoryRangeKey, _>` can be
/// queried with a one-page range to find the entry covering an address.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRangeKey(pub MemoryRange);

impl PartialOrd for MemoryRangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryRangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if !self.0.intersects(&other.0) {
            self.0.start_.cmp(&other.0.start_)
        } else {
            Ordering::Equal
        }
    }
}

impl PartialEq for MemoryRangeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemoryRangeKey {}

impl Deref for MemoryRangeKey {
    type Target = MemoryRange;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MemoryRangeKey {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<MemoryRange> for MemoryRangeKey {
    fn from(r: MemoryRange) -> Self {
        MemoryRangeKey(r)
    }
}
