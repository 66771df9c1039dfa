//! YATA sequence: the ordered item list behind text and array types.
//!
//! Items live in an arena and are chained through `left`/`right` links, so an
//! item keeps its arena slot forever (tombstones included) and lookups by
//! [`Id`] are a hash-map hit.
//!
//! Positional lookups start from a search marker, the last slot resolved
//! together with the number of visible items before it. Consecutive edits
//! around the same spot (typing, backspacing) walk only the distance from
//! the previous edit.
//!
//! # References
//!
//! Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared Editing on Extensible
//! Data Types" (GROUP 2016)

use crate::clock::Id;
use crate::update::Content;
use std::collections::{HashMap, HashSet};

/// One element of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Item id
    pub id: Id,
    /// Left neighbour at creation time
    pub origin_left: Option<Id>,
    /// Right neighbour at creation time
    pub origin_right: Option<Id>,
    /// Payload
    pub content: Content,
    /// Tombstone flag
    pub deleted: bool,
    left: Option<usize>,
    right: Option<usize>,
}

impl Item {
    /// Build an unlinked item ready for [`Sequence::integrate`].
    #[must_use]
    pub fn new(id: Id, origin_left: Option<Id>, origin_right: Option<Id>, content: Content) -> Self {
        Self {
            id,
            origin_left,
            origin_right,
            content,
            deleted: false,
            left: None,
            right: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    slot: usize,
    /// Visible items strictly left of `slot`
    before: usize,
}

/// Ordered list of items, tombstones included.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    items: Vec<Item>,
    index: HashMap<Id, usize>,
    start: Option<usize>,
    visible: usize,
    marker: Option<Marker>,
}

impl Sequence {
    /// Create an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible (non-deleted) items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.visible
    }

    /// Whether no item is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Whether an item with this id has been integrated.
    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        self.index.contains_key(id)
    }

    /// Look up an item by id.
    #[must_use]
    pub fn get(&self, id: &Id) -> Option<&Item> {
        self.index.get(id).map(|&slot| &self.items[slot])
    }

    /// Iterate over every item in list order, tombstones included.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            seq: self,
            next: self.start,
        }
    }

    /// Iterate over visible items in list order.
    pub fn visible(&self) -> impl Iterator<Item = &Item> {
        self.iter().filter(|item| !item.deleted)
    }

    fn visible_slot(&mut self, index: usize) -> Option<usize> {
        if index >= self.visible {
            return None;
        }
        let (mut slot, mut before) = match self.marker {
            Some(marker) => (marker.slot, marker.before),
            None => (self.start?, 0),
        };
        loop {
            let item = &self.items[slot];
            if before == index && !item.deleted {
                break;
            }
            if before <= index {
                if !item.deleted {
                    before += 1;
                }
                slot = item.right?;
            } else {
                slot = item.left?;
                if !self.items[slot].deleted {
                    before -= 1;
                }
            }
        }
        self.marker = Some(Marker { slot, before });
        Some(slot)
    }

    /// Origins for an insertion at visible position `index`.
    ///
    /// The left origin is the visible item at `index - 1`; the right origin is
    /// whatever directly follows it in the list, tombstone or not. Returns
    /// `None` if `index` is past the end.
    #[must_use]
    pub fn origins_at(&mut self, index: usize) -> Option<(Option<Id>, Option<Id>)> {
        if index > self.visible {
            return None;
        }
        if index == 0 {
            return Some((None, self.start.map(|slot| self.items[slot].id)));
        }
        let left = self.visible_slot(index - 1)?;
        let right = self.items[left].right.map(|slot| self.items[slot].id);
        Some((Some(self.items[left].id), right))
    }

    /// Ids of the visible items in `index..index + len`, or `None` if the
    /// range does not fit.
    #[must_use]
    pub fn visible_range(&mut self, index: usize, len: usize) -> Option<Vec<Id>> {
        let end = index.checked_add(len)?;
        if end > self.visible {
            return None;
        }
        if len == 0 {
            return Some(Vec::new());
        }
        let first = self.visible_slot(index)?;
        Some(
            Iter {
                seq: &*self,
                next: Some(first),
            }
            .filter(|item| !item.deleted)
            .take(len)
            .map(|item| item.id)
            .collect(),
        )
    }

    /// Id of the item directly right of `id` in the list.
    #[must_use]
    pub fn right_of(&self, id: &Id) -> Option<Id> {
        let slot = *self.index.get(id)?;
        self.items[slot].right.map(|r| self.items[r].id)
    }

    /// Integrate an item whose origins are already known.
    ///
    /// Concurrent items sharing the same left origin are ordered by ascending
    /// replica id; items whose left origin lies inside the scanned region are
    /// stepped over. The final position depends only on the item's origins
    /// and replica, never on arrival order. An origin that is not present is
    /// treated as the sequence boundary.
    pub fn integrate(&mut self, mut item: Item) {
        let origin_left_slot = item.origin_left.and_then(|id| self.index.get(&id).copied());
        let origin_right_slot = item
            .origin_right
            .and_then(|id| self.index.get(&id).copied());

        let mut left = origin_left_slot;
        let mut cursor = match origin_left_slot {
            Some(slot) => self.items[slot].right,
            None => self.start,
        };

        let mut before_origin: HashSet<usize> = HashSet::new();
        let mut conflicting: HashSet<usize> = HashSet::new();

        while let Some(slot) = cursor {
            if Some(slot) == origin_right_slot {
                break;
            }
            before_origin.insert(slot);
            conflicting.insert(slot);

            let other = &self.items[slot];
            if other.origin_left == item.origin_left {
                if other.id.replica < item.id.replica {
                    left = Some(slot);
                    conflicting.clear();
                } else if other.origin_right == item.origin_right {
                    break;
                }
            } else {
                match other.origin_left.and_then(|id| self.index.get(&id).copied()) {
                    Some(other_origin) if before_origin.contains(&other_origin) => {
                        if !conflicting.contains(&other_origin) {
                            left = Some(slot);
                            conflicting.clear();
                        }
                    }
                    _ => break,
                }
            }
            cursor = other.right;
        }

        let slot = self.items.len();
        item.left = left;
        item.right = match left {
            Some(l) => self.items[l].right,
            None => self.start,
        };
        if let Some(r) = item.right {
            self.items[r].left = Some(slot);
        }
        match left {
            Some(l) => self.items[l].right = Some(slot),
            None => self.start = Some(slot),
        }
        if !item.deleted {
            self.visible += 1;
            // Only an insert right after the marker leaves its count intact
            self.marker = match self.marker {
                Some(marker) if left == Some(marker.slot) => Some(Marker {
                    slot,
                    before: marker.before + usize::from(!self.items[marker.slot].deleted),
                }),
                _ => None,
            };
        }
        self.index.insert(item.id, slot);
        self.items.push(item);
    }

    /// Tombstone an item. Returns `true` if it was visible.
    pub fn delete(&mut self, id: &Id) -> bool {
        let Some(&slot) = self.index.get(id) else {
            return false;
        };
        let item = &mut self.items[slot];
        if item.deleted {
            return false;
        }
        item.deleted = true;
        self.visible -= 1;
        if self.marker.is_some_and(|marker| marker.slot != slot) {
            self.marker = None;
        }
        true
    }
}

/// List-order iterator returned by [`Sequence::iter`].
#[derive(Debug)]
pub struct Iter<'a> {
    seq: &'a Sequence,
    next: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = &self.seq.items[self.next?];
        self.next = item.right;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReplicaId;

    fn text(seq: &Sequence) -> String {
        seq.visible()
            .filter_map(|item| match item.content {
                Content::Char(c) => Some(c),
                Content::Json(_) => None,
            })
            .collect()
    }

    /// Items typed left to right starting at the front of the sequence.
    fn typed(replica: u128, first_clock: u64, s: &str) -> Vec<Item> {
        let replica = ReplicaId::from_u128(replica);
        let mut prev = None;
        s.chars()
            .enumerate()
            .map(|(i, c)| {
                let id = Id::new(replica, first_clock + i as u64);
                let item = Item::new(id, prev, None, Content::Char(c));
                prev = Some(id);
                item
            })
            .collect()
    }

    #[test]
    fn concurrent_inserts_at_front_converge() {
        let a = typed(1, 1, "Hello");
        let b = typed(2, 1, "Hi ");

        let mut left = Sequence::new();
        for item in a.iter().chain(&b) {
            left.integrate(item.clone());
        }
        let mut right = Sequence::new();
        for item in b.iter().chain(&a) {
            right.integrate(item.clone());
        }
        let mut interleaved = Sequence::new();
        for (x, y) in a.iter().zip(&b) {
            interleaved.integrate(y.clone());
            interleaved.integrate(x.clone());
        }
        for item in &a[3..] {
            interleaved.integrate(item.clone());
        }

        assert_eq!(text(&left), "HelloHi ");
        assert_eq!(text(&right), "HelloHi ");
        assert_eq!(text(&interleaved), "HelloHi ");
    }

    #[test]
    fn origins_reference_tombstones_on_the_right() {
        let mut seq = Sequence::new();
        for item in typed(1, 1, "abc") {
            seq.integrate(item);
        }
        let b = Id::new(ReplicaId::from_u128(1), 2);
        assert!(seq.delete(&b));
        assert!(!seq.delete(&b));

        let (left, right) = seq.origins_at(1).unwrap();
        assert_eq!(left, Some(Id::new(ReplicaId::from_u128(1), 1)));
        assert_eq!(right, Some(b));
        assert_eq!(seq.len(), 2);
        assert!(seq.origins_at(3).is_none());
    }

    #[test]
    fn insert_between_neighbours() {
        let mut seq = Sequence::new();
        for item in typed(1, 1, "ac") {
            seq.integrate(item);
        }
        let (left, right) = seq.origins_at(1).unwrap();
        seq.integrate(Item::new(
            Id::new(ReplicaId::from_u128(2), 1),
            left,
            right,
            Content::Char('b'),
        ));
        assert_eq!(text(&seq), "abc");
        assert_eq!(
            seq.visible_range(1, 2).unwrap(),
            vec![
                Id::new(ReplicaId::from_u128(2), 1),
                Id::new(ReplicaId::from_u128(1), 2)
            ]
        );
        assert!(seq.visible_range(2, 2).is_none());
    }

    #[test]
    fn marker_lookups_match_a_fresh_scan() {
        let mut seq = Sequence::new();
        for item in typed(1, 1, "abcdefgh") {
            seq.integrate(item);
        }
        for clock in [3, 6] {
            seq.delete(&Id::new(ReplicaId::from_u128(1), clock));
        }
        // visible: a b d e g h

        let far = seq.visible_range(5, 1).unwrap();
        let near = seq.visible_range(1, 2).unwrap();
        assert_eq!(far, vec![Id::new(ReplicaId::from_u128(1), 8)]);
        assert_eq!(
            near,
            vec![
                Id::new(ReplicaId::from_u128(1), 2),
                Id::new(ReplicaId::from_u128(1), 4)
            ]
        );

        // Typing after the marker keeps it, an unrelated insert drops it
        let (left, right) = seq.origins_at(2).unwrap();
        seq.integrate(Item::new(
            Id::new(ReplicaId::from_u128(2), 1),
            left,
            right,
            Content::Char('X'),
        ));
        seq.integrate(Item::new(
            Id::new(ReplicaId::from_u128(3), 1),
            None,
            seq.iter().next().map(|item| item.id),
            Content::Char('Y'),
        ));
        assert_eq!(text(&seq), "YabXdegh");
        for (index, expected) in text(&seq).chars().enumerate() {
            let ids = seq.visible_range(index, 1).unwrap();
            assert_eq!(seq.get(&ids[0]).unwrap().content, Content::Char(expected));
        }
        for index in (0..8).rev() {
            let ids = seq.visible_range(index, 1).unwrap();
            let expected = text(&seq).chars().nth(index).unwrap();
            assert_eq!(seq.get(&ids[0]).unwrap().content, Content::Char(expected));
        }
    }

    #[test]
    fn concurrent_inserts_between_same_neighbours_order_by_replica() {
        let mut base = Sequence::new();
        for item in typed(1, 1, "xy") {
            base.integrate(item);
        }
        let x = Some(Id::new(ReplicaId::from_u128(1), 1));
        let y = Some(Id::new(ReplicaId::from_u128(1), 2));
        let low = Item::new(Id::new(ReplicaId::from_u128(5), 1), x, y, Content::Char('5'));
        let high = Item::new(Id::new(ReplicaId::from_u128(9), 1), x, y, Content::Char('9'));

        let mut first = base.clone();
        first.integrate(low.clone());
        first.integrate(high.clone());
        let mut second = base;
        second.integrate(high);
        second.integrate(low);

        assert_eq!(text(&first), "x59y");
        assert_eq!(text(&second), "x59y");
    }
}
