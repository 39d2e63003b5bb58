use crate::error::{VmaError, VmaResult};
use crate::utils::{GTT_PAGE_SIZE_4K, align_down, align_up, range_overflows};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// Colour of the space past the end of a range. Never equal to a node's
/// colour, so coloured placements keep a page away from the top.
pub const COLOR_UNEVICTABLE: u64 = u64::MAX;

/// One occupied range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub start: u64,
    pub size: u64,
    pub color: u64,
}

impl Node {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Where to look first when searching for a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertMode {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, Copy)]
struct Hole {
    prev: Option<Node>,
    next: Option<Node>,
    start: u64,
    end: u64,
}

/// Manages a range of an address space: GPU virtual addresses for an
/// address space, or DMA addresses for a memory region.
///
/// With colour adjustment enabled, a node may only sit directly next to a
/// node of the same colour. Differently coloured neighbours must be kept
/// apart by at least one free page.
#[derive(Debug)]
pub struct RangeAllocator {
    base: u64,
    limit: u64,
    color_adjust: bool,

    // Occupied ranges: start -> (size, color)
    nodes: BTreeMap<u64, (u64, u64)>,
}

impl RangeAllocator {
    #[must_use]
    pub fn new(base: u64, size: u64, color_adjust: bool) -> Self {
        Self {
            base,
            limit: base + size,
            color_adjust,
            nodes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// Whether differently coloured neighbours are kept apart.
    #[must_use]
    pub const fn color_adjust(&self) -> bool {
        self.color_adjust
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn make_node(start: u64, (size, color): (u64, u64)) -> Node {
        Node { start, size, color }
    }

    #[must_use]
    pub fn node(&self, start: u64) -> Option<Node> {
        self.nodes.get(&start).map(|&v| Self::make_node(start, v))
    }

    /// Occupied ranges in address order.
    pub fn iter(&self) -> impl Iterator<Item = Node> + '_ {
        self.nodes.iter().map(|(&s, &v)| Self::make_node(s, v))
    }

    /// The nodes directly before and after the node at `start`.
    #[must_use]
    pub fn neighbours(&self, start: u64) -> (Option<Node>, Option<Node>) {
        let prev = self
            .nodes
            .range(..start)
            .next_back()
            .map(|(&s, &v)| Self::make_node(s, v));
        let next = self
            .nodes
            .range((Excluded(start), Unbounded))
            .next()
            .map(|(&s, &v)| Self::make_node(s, v));
        (prev, next)
    }

    /// True if free space follows the node at `start`.
    #[must_use]
    pub fn hole_follows(&self, start: u64) -> bool {
        let Some(node) = self.node(start) else {
            return false;
        };
        match self.neighbours(start).1 {
            Some(next) => next.start > node.end(),
            None => node.end() < self.limit,
        }
    }

    /// True if the node at `start` respects the colouring rule against both
    /// of its neighbours.
    #[must_use]
    pub fn valid_space(&self, start: u64) -> bool {
        if !self.color_adjust {
            return true;
        }
        let Some(node) = self.node(start) else {
            return false;
        };
        let (prev, next) = self.neighbours(start);
        if let Some(prev) = prev {
            if prev.color != node.color && !self.hole_follows(prev.start) {
                return false;
            }
        }
        if let Some(next) = next {
            if next.color != node.color && !self.hole_follows(node.start) {
                return false;
            }
        }
        true
    }

    fn holes(&self) -> Vec<Hole> {
        let mut holes = Vec::new();
        let mut prev: Option<Node> = None;
        let mut cursor = self.base;

        for node in self.iter() {
            if node.start > cursor {
                holes.push(Hole {
                    prev,
                    next: Some(node),
                    start: cursor,
                    end: node.start,
                });
            }
            cursor = node.end();
            prev = Some(node);
        }

        if cursor < self.limit {
            holes.push(Hole {
                prev,
                next: None,
                start: cursor,
                end: self.limit,
            });
        }
        holes
    }

    /// Shrinks a hole so a node of `color` placed inside it keeps clear of
    /// differently coloured neighbours.
    fn adjust(&self, hole: &Hole, color: u64) -> (u64, u64) {
        let (mut start, mut end) = (hole.start, hole.end);
        if !self.color_adjust {
            return (start, end);
        }
        if hole.prev.is_some_and(|p| p.color != color) {
            start += GTT_PAGE_SIZE_4K;
        }
        let next_color = hole.next.map_or(COLOR_UNEVICTABLE, |n| n.color);
        if next_color != color {
            end = end.saturating_sub(GTT_PAGE_SIZE_4K);
        }
        (start, end)
    }

    fn find(
        &self,
        size: u64,
        align: u64,
        color: u64,
        range_start: u64,
        range_end: u64,
        mode: InsertMode,
    ) -> Option<u64> {
        debug_assert!(align.is_power_of_two());
        let holes = self.holes();
        let ordered: Box<dyn Iterator<Item = &Hole>> = match mode {
            InsertMode::Low => Box::new(holes.iter()),
            InsertMode::High => Box::new(holes.iter().rev()),
        };

        for hole in ordered {
            let (start, end) = self.adjust(hole, color);
            let start = start.max(range_start);
            let end = end.min(range_end);
            if start >= end || end - start < size {
                continue;
            }

            let candidate = match mode {
                InsertMode::Low => align_up(start, align),
                InsertMode::High => align_down(end - size, align),
            };
            if candidate >= start && candidate <= end && end - candidate >= size {
                return Some(candidate);
            }
        }
        None
    }

    /// Searches `[range_start, range_end)` for a free, `align`ed range of
    /// `size` bytes and claims it.
    pub fn insert(
        &mut self,
        size: u64,
        align: u64,
        color: u64,
        range_start: u64,
        range_end: u64,
        mode: InsertMode,
    ) -> VmaResult<Node> {
        if size == 0 {
            return Err(VmaError::InvalidArgument("zero sized node"));
        }
        let align = align.max(1);
        let start = self
            .find(size, align, color, range_start, range_end, mode)
            .ok_or(VmaError::NoSpace)?;
        self.nodes.insert(start, (size, color));
        Ok(Node { start, size, color })
    }

    /// Whether `insert` with the same arguments would succeed.
    #[must_use]
    pub fn can_fit(
        &self,
        size: u64,
        align: u64,
        color: u64,
        range_start: u64,
        range_end: u64,
        mode: InsertMode,
    ) -> bool {
        size != 0
            && self
                .find(size, align.max(1), color, range_start, range_end, mode)
                .is_some()
    }

    /// Claims exactly `[start, start + size)`.
    pub fn reserve(&mut self, start: u64, size: u64, color: u64) -> VmaResult<Node> {
        if size == 0 {
            return Err(VmaError::InvalidArgument("zero sized node"));
        }
        if start < self.base || range_overflows(start, size, self.limit) {
            return Err(VmaError::NoSpace);
        }

        let end = start + size;
        let hole = self
            .holes()
            .into_iter()
            .find(|h| h.start <= start && end <= h.end)
            .ok_or(VmaError::NoSpace)?;

        let (adj_start, adj_end) = self.adjust(&hole, color);
        if adj_start > start || adj_end < end {
            return Err(VmaError::NoSpace);
        }

        self.nodes.insert(start, (size, color));
        Ok(Node { start, size, color })
    }

    /// Nodes overlapping `[start, end)`.
    #[must_use]
    pub fn overlapping(&self, start: u64, end: u64) -> Vec<Node> {
        let first = self
            .nodes
            .range(..start)
            .next_back()
            .map_or(start, |(&s, _)| s);
        self.nodes
            .range(first..end)
            .map(|(&s, &v)| Self::make_node(s, v))
            .filter(|n| n.end() > start)
            .collect()
    }

    pub fn remove(&mut self, start: u64) -> Option<Node> {
        let removed = self.nodes.remove(&start).map(|v| Self::make_node(start, v));
        if removed.is_none() {
            log::warn!("range allocator: no node at 0x{start:x}");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = GTT_PAGE_SIZE_4K;

    #[test]
    fn low_and_high_insertion() {
        let mut mm = RangeAllocator::new(0, 64 * PAGE, false);
        let low = mm.insert(PAGE, PAGE, 0, 0, 64 * PAGE, InsertMode::Low).unwrap();
        let high = mm.insert(PAGE, PAGE, 0, 0, 64 * PAGE, InsertMode::High).unwrap();
        assert_eq!(low.start, 0);
        assert_eq!(high.start, 63 * PAGE);
    }

    #[test]
    fn alignment_and_bounds_are_honoured() {
        let mut mm = RangeAllocator::new(0, 1 << 24, false);
        mm.reserve(0, PAGE, 0).unwrap();
        let node = mm.insert(PAGE, 1 << 16, 0, 0, 1 << 24, InsertMode::Low).unwrap();
        assert_eq!(node.start, 1 << 16);

        let bounded = mm.insert(PAGE, PAGE, 0, 1 << 20, 2 << 20, InsertMode::Low).unwrap();
        assert!(bounded.start >= 1 << 20 && bounded.end() <= 2 << 20);
    }

    #[test]
    fn reserve_rejects_overlap() {
        let mut mm = RangeAllocator::new(0, 16 * PAGE, false);
        mm.reserve(4 * PAGE, 2 * PAGE, 0).unwrap();
        assert_eq!(mm.reserve(5 * PAGE, PAGE, 0), Err(VmaError::NoSpace));
        assert_eq!(mm.reserve(15 * PAGE, 2 * PAGE, 0), Err(VmaError::NoSpace));
        mm.remove(4 * PAGE).unwrap();
        mm.reserve(5 * PAGE, PAGE, 0).unwrap();
    }

    #[test]
    fn colours_keep_a_gap() {
        let mut mm = RangeAllocator::new(0, 16 * PAGE, true);
        let a = mm.insert(PAGE, PAGE, 1, 0, 16 * PAGE, InsertMode::Low).unwrap();
        let b = mm.insert(PAGE, PAGE, 2, 0, 16 * PAGE, InsertMode::Low).unwrap();
        assert_eq!(b.start, a.end() + PAGE);
        let c = mm.insert(PAGE, PAGE, 2, 0, 16 * PAGE, InsertMode::Low).unwrap();
        assert_eq!(c.start, b.end());
        assert!(mm.valid_space(a.start));
        assert!(mm.valid_space(b.start));

        // Directly against a different colour is refused.
        assert_eq!(mm.reserve(c.end(), PAGE, 1), Err(VmaError::NoSpace));
    }

    #[test]
    fn hole_follows_tracks_gaps() {
        let mut mm = RangeAllocator::new(0, 4 * PAGE, false);
        mm.reserve(0, PAGE, 0).unwrap();
        mm.reserve(PAGE, PAGE, 0).unwrap();
        assert!(!mm.hole_follows(0));
        assert!(mm.hole_follows(PAGE));
        assert_eq!(mm.overlapping(0, 2 * PAGE).len(), 2);
    }
}
