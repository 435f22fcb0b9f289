//! Coarse dirty-region accumulation.
//!
//! A region is at most two rectangles. Adding a rectangle merges it into
//! whichever slot it touches; when it touches neither and both slots are
//! taken, the older slot absorbs it. The union of the slots only ever
//! grows, so pixels are never lost, only over-approximated.

use crate::rect::{Rect, ZR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirty {
    a: Rect,
    b: Rect,
}

impl Dirty {
    pub fn clean() -> Dirty {
        Dirty { a: ZR, b: ZR }
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty() && self.b.is_empty()
    }

    pub fn add(self, update: Rect) -> Dirty {
        if update.is_empty() {
            return self;
        }
        if self.is_empty() {
            Dirty { a: update, b: self.b }
        } else if !self.a.intersect(update).is_empty() {
            if self.b.intersect(update).is_empty() {
                Dirty { a: self.a.union(update), b: self.b }
            } else {
                Dirty { a: self.a.union(update).union(self.b), b: ZR }
            }
        } else if !self.b.intersect(update).is_empty() {
            Dirty { a: self.a, b: self.b.union(update) }
        } else if !self.b.is_empty() {
            Dirty { a: self.b.union(update), b: self.a }
        } else {
            Dirty { a: update, b: self.a }
        }
    }

    /// Clips both slots. Distributes over the union of the slots.
    pub fn intersect(self, rect: Rect) -> Dirty {
        Dirty {
            a: self.a.intersect(rect),
            b: self.b.intersect(rect),
        }
    }

    /// Non-empty slots, `a` first.
    pub fn rects(&self) -> Vec<Rect> {
        match (self.a.is_empty(), self.b.is_empty()) {
            (true, true) => vec![],
            (true, false) => vec![self.b],
            (false, true) => vec![self.a],
            (false, false) => vec![self.a, self.b],
        }
    }
}
