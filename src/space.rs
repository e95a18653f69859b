//! Free-space pool over the 16-bit address space.
//!
//! Spans are inclusive on both ends, kept sorted and never overlapping or
//! touching: adjacent and overlapping inserts are merged.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::strategy::PackingStrategy;
use crate::{Address, Error};

/// An inclusive range of free addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FreeSpan {
    pub start: Address,
    pub end: Address,
}

impl FreeSpan {
    pub fn new(start: Address, end: Address) -> Result<Self, Error> {
        if start > end {
            return Err(Error::InvalidRequest(format!(
                "span 0x{:04x}-0x{:04x} ends before it starts",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Never true; a span holds at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: Address) -> bool {
        (self.start..=self.end).contains(&addr)
    }

    /// True if the two spans share at least one address.
    pub fn overlaps(&self, other: &FreeSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn touches(&self, other: &FreeSpan) -> bool {
        u32::from(self.start) <= u32::from(other.end) + 1 && u32::from(other.start) <= u32::from(self.end) + 1
    }
}

impl fmt::Display for FreeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}-0x{:04x}", self.start, self.end)
    }
}

/// A set of free spans to allocate from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpacePool {
    spans: Vec<FreeSpan>,
}

impl SpacePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `start..=end` as free.
    pub fn add_space(&mut self, start: Address, end: Address) -> Result<(), Error> {
        self.add_span(FreeSpan::new(start, end)?);
        Ok(())
    }

    /// Mark `span` as free, merging it with neighbours.
    pub fn add_span(&mut self, span: FreeSpan) {
        let mut merged = span;
        let mut kept = Vec::with_capacity(self.spans.len() + 1);
        for existing in self.spans.drain(..) {
            if existing.touches(&merged) {
                if existing.overlaps(&merged) {
                    log::warn!("Free span {} overlaps existing free span {}", span, existing);
                }
                merged = FreeSpan {
                    start: merged.start.min(existing.start),
                    end: merged.end.max(existing.end),
                };
            } else {
                kept.push(existing);
            }
        }
        kept.push(merged);
        kept.sort();
        self.spans = kept;
    }

    /// Carve `length` bytes out of the pool and return their start.
    ///
    /// The chosen span shrinks from its low end. Ties go to the lowest
    /// address.
    pub fn take_space(&mut self, length: usize, strategy: PackingStrategy) -> Result<Address, Error> {
        if length == 0 {
            return Err(Error::InvalidRequest("cannot allocate zero bytes".to_string()));
        }

        let fitting = self.spans.iter().enumerate().filter(|(_, s)| s.len() >= length);
        let chosen = match strategy {
            PackingStrategy::First => fitting.map(|(i, _)| i).next(),
            PackingStrategy::Smallest => fitting.min_by_key(|(i, s)| (s.len(), *i)).map(|(i, _)| i),
            PackingStrategy::Largest => fitting
                .max_by(|(i, a), (j, b)| a.len().cmp(&b.len()).then(j.cmp(i)))
                .map(|(i, _)| i),
        };

        let Some(index) = chosen else {
            return Err(Error::OutOfSpace {
                requested: length,
                total: self.total_available(),
                largest: self.largest_available(),
            });
        };

        let span = self.spans[index];
        if span.len() == length {
            self.spans.remove(index);
        } else {
            self.spans[index].start = span.start + length as Address;
        }
        log::trace!("Took {} bytes at 0x{:04x} from {}", length, span.start, span);
        Ok(span.start)
    }

    /// Sum of all free bytes
    pub fn total_available(&self) -> usize {
        self.spans.iter().map(FreeSpan::len).sum()
    }

    /// Length of the largest free span
    pub fn largest_available(&self) -> usize {
        self.spans.iter().map(FreeSpan::len).max().unwrap_or(0)
    }

    /// Free spans in address order
    pub fn spans(&self) -> &[FreeSpan] {
        &self.spans
    }
}
