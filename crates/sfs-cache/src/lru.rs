//! Midpoint LRU over inode numbers.
//!
//! Two segments: a hot top and a cold bottom. Fresh inodes enter at the
//! midpoint (front of the bottom segment) so untouched entries age out
//! without ever displacing the hot set; a touch promotes to the front of
//! the top. Expiry scans from the cold tail and only ever returns entries
//! whose owner has marked them expireable (no pins held).

use sfs_types::InodeNumber;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Top,
    Bottom,
}

#[derive(Debug)]
pub struct Lru {
    max: usize,
    midpoint: f64,
    /// Front = most recent.
    top: Vec<InodeNumber>,
    bottom: Vec<InodeNumber>,
    index: HashMap<InodeNumber, (Segment, bool)>,
}

impl Lru {
    #[must_use]
    pub fn new(max: usize, midpoint: f64) -> Self {
        assert!((0.0..=1.0).contains(&midpoint));
        Self {
            max,
            midpoint,
            top: Vec::new(),
            bottom: Vec::new(),
            index: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.index.contains_key(&ino)
    }

    /// Insert at the midpoint. New entries are expireable until pinned.
    pub fn insert_mid(&mut self, ino: InodeNumber) {
        assert!(
            self.index.insert(ino, (Segment::Bottom, true)).is_none(),
            "inode {ino} already in lru"
        );
        self.bottom.insert(0, ino);
        self.balance();
    }

    /// Promote to the front of the hot segment.
    pub fn touch(&mut self, ino: InodeNumber) {
        let Some(&(seg, expireable)) = self.index.get(&ino) else {
            return;
        };
        self.remove_from_segment(ino, seg);
        self.top.insert(0, ino);
        self.index.insert(ino, (Segment::Top, expireable));
        self.balance();
    }

    pub fn remove(&mut self, ino: InodeNumber) {
        if let Some((seg, _)) = self.index.remove(&ino) {
            self.remove_from_segment(ino, seg);
        }
    }

    /// Record whether the owner currently allows this entry to expire.
    pub fn set_expireable(&mut self, ino: InodeNumber, expireable: bool) {
        if let Some(entry) = self.index.get_mut(&ino) {
            entry.1 = expireable;
        }
    }

    /// Pop the coldest expireable entry, bottom tail first, then the top
    /// tail. Returns `None` when everything left is pinned.
    pub fn expire(&mut self) -> Option<InodeNumber> {
        for seg in [Segment::Bottom, Segment::Top] {
            let list = match seg {
                Segment::Top => &self.top,
                Segment::Bottom => &self.bottom,
            };
            if let Some(pos) = list.iter().rposition(|ino| self.index[ino].1) {
                let ino = match seg {
                    Segment::Top => self.top.remove(pos),
                    Segment::Bottom => self.bottom.remove(pos),
                };
                self.index.remove(&ino);
                return Some(ino);
            }
        }
        None
    }

    fn remove_from_segment(&mut self, ino: InodeNumber, seg: Segment) {
        let list = match seg {
            Segment::Top => &mut self.top,
            Segment::Bottom => &mut self.bottom,
        };
        if let Some(pos) = list.iter().position(|i| *i == ino) {
            list.remove(pos);
        }
    }

    /// Keep the hot segment at its configured share by demoting its tail.
    fn balance(&mut self) {
        let cap = self.max.max(self.len());
        let top_cap = ((cap as f64) * self.midpoint).ceil() as usize;
        while self.top.len() > top_cap {
            let ino = self.top.pop().expect("non-empty top");
            self.bottom.insert(0, ino);
            if let Some(entry) = self.index.get_mut(&ino) {
                entry.0 = Segment::Bottom;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ino(n: u64) -> InodeNumber {
        InodeNumber(n)
    }

    #[test]
    fn expire_is_cold_first_and_skips_pinned() {
        let mut lru = Lru::new(10, 0.5);
        for n in 1..=4 {
            lru.insert_mid(ino(n));
        }
        // 1 is the coldest (inserted first, never touched).
        lru.set_expireable(ino(1), false);
        assert_eq!(lru.expire(), Some(ino(2)));
        lru.set_expireable(ino(1), true);
        assert_eq!(lru.expire(), Some(ino(1)));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn touch_promotes_out_of_expiry_order() {
        let mut lru = Lru::new(10, 0.5);
        for n in 1..=3 {
            lru.insert_mid(ino(n));
        }
        lru.touch(ino(1));
        // 1 is now hot; 2 is the coldest remaining.
        assert_eq!(lru.expire(), Some(ino(2)));
        assert_eq!(lru.expire(), Some(ino(3)));
        assert_eq!(lru.expire(), Some(ino(1)));
        assert_eq!(lru.expire(), None);
    }

    #[test]
    fn everything_pinned_means_no_expiry() {
        let mut lru = Lru::new(4, 0.5);
        lru.insert_mid(ino(1));
        lru.set_expireable(ino(1), false);
        assert_eq!(lru.expire(), None);
        assert_eq!(lru.len(), 1);
    }
}
