//! Lifetime-interval buffer allocation.
//!
//! The tile search hands this module one request per chain node: a byte
//! size, a memory location, and the topological-step interval during which
//! the buffer must stay resident. The allocator answers pass/fail per
//! location budget; on pass, every request gets a concrete offset such
//! that buffers whose intervals overlap never overlap in memory.

use crate::graph::NodeId;
use indexmap::IndexMap;
use log::trace;
use thiserror::Error;

/// The topological-step range `[start, end)` during which a buffer must
/// remain allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lifeness {
    pub start: u32,
    pub end: u32,
}

impl Lifeness {
    pub fn new(start: u32, end: u32) -> Lifeness {
        debug_assert!(end > start);
        Lifeness { start, end }
    }

    pub fn overlaps(&self, other: &Lifeness) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Where a chain value lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    /// Chain boundary value read from outside.
    Input,
    /// Chain boundary value written back out.
    Output,
    /// Resident sharded constant data.
    Rdata,
    /// Scratch for intermediate tiles.
    L2Data,
}

/// One buffer the chain needs, before placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRequest {
    pub id: NodeId,
    pub size: u64,
    pub kind: MemKind,
    pub lifeness: Lifeness,
    /// Pins the buffer at a caller-chosen offset (parameter buffers whose
    /// address the runtime fixes).
    pub fixed_offset: Option<u64>,
}

/// A placed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBuffer {
    pub id: NodeId,
    pub size: u64,
    pub kind: MemKind,
    pub lifeness: Lifeness,
    pub offset: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("buffers totalling {required} bytes exceed the {budget}-byte budget for {kind:?}")]
    OverBudget {
        kind: MemKind,
        required: u64,
        budget: u64,
    },
    #[error("fixed buffer {id} at [{offset}, {end}) collides with a live buffer")]
    FixedCollision { id: NodeId, offset: u64, end: u64 },
}

/// Pass/fail buffer placement over lifetime intervals. Deterministic given
/// identical request sets.
pub trait LifetimeAllocator {
    fn allocate(
        &self,
        requests: &[BufferRequest],
    ) -> Result<Vec<ScheduledBuffer>, AllocError>;
}

/// First-fit placement with an independent byte budget per [MemKind].
///
/// Requests are taken in the order given (the chain's topological order),
/// and each is placed at the lowest offset in its location that no
/// interval-overlapping earlier buffer occupies.
#[derive(Debug, Clone)]
pub struct IntervalAllocator {
    budgets: IndexMap<MemKind, u64>,
}

impl IntervalAllocator {
    pub fn new(budgets: IndexMap<MemKind, u64>) -> IntervalAllocator {
        IntervalAllocator { budgets }
    }

    /// A budget of `bytes` for every location.
    pub fn uniform(bytes: u64) -> IntervalAllocator {
        let budgets = [
            MemKind::Input,
            MemKind::Output,
            MemKind::Rdata,
            MemKind::L2Data,
        ]
        .into_iter()
        .map(|k| (k, bytes))
        .collect();
        IntervalAllocator { budgets }
    }

    fn budget(&self, kind: MemKind) -> u64 {
        self.budgets.get(&kind).copied().unwrap_or(u64::MAX)
    }
}

impl LifetimeAllocator for IntervalAllocator {
    fn allocate(
        &self,
        requests: &[BufferRequest],
    ) -> Result<Vec<ScheduledBuffer>, AllocError> {
        let mut placed: Vec<ScheduledBuffer> = Vec::with_capacity(requests.len());

        // Fixed-address buffers first so free-floating ones route around
        // them.
        let (fixed, floating): (Vec<&BufferRequest>, Vec<&BufferRequest>) =
            requests.iter().partition(|r| r.fixed_offset.is_some());

        for req in fixed {
            let offset = req.fixed_offset.unwrap();
            let end = offset + req.size;
            let collides = placed.iter().any(|b| {
                b.kind == req.kind
                    && b.lifeness.overlaps(&req.lifeness)
                    && offset < b.offset + b.size
                    && b.offset < end
            });
            if collides {
                return Err(AllocError::FixedCollision {
                    id: req.id,
                    offset,
                    end,
                });
            }
            if end > self.budget(req.kind) {
                return Err(AllocError::OverBudget {
                    kind: req.kind,
                    required: end,
                    budget: self.budget(req.kind),
                });
            }
            placed.push(scheduled(req, offset));
        }

        for req in floating {
            let offset = first_fit(&placed, req);
            let end = offset + req.size;
            if end > self.budget(req.kind) {
                return Err(AllocError::OverBudget {
                    kind: req.kind,
                    required: end,
                    budget: self.budget(req.kind),
                });
            }
            trace!("{} -> {:?}+{}", req.id, req.kind, offset);
            placed.push(scheduled(req, offset));
        }

        // Report in request order.
        placed.sort_by_key(|b| requests.iter().position(|r| r.id == b.id).unwrap());
        Ok(placed)
    }
}

fn scheduled(req: &BufferRequest, offset: u64) -> ScheduledBuffer {
    ScheduledBuffer {
        id: req.id,
        size: req.size,
        kind: req.kind,
        lifeness: req.lifeness,
        offset,
    }
}

/// Lowest offset at which `req` fits among the live, same-location buffers
/// already placed.
fn first_fit(placed: &[ScheduledBuffer], req: &BufferRequest) -> u64 {
    let mut live: Vec<&ScheduledBuffer> = placed
        .iter()
        .filter(|b| b.kind == req.kind && b.lifeness.overlaps(&req.lifeness))
        .collect();
    live.sort_by_key(|b| b.offset);

    let mut offset = 0;
    for b in live {
        if offset + req.size <= b.offset {
            break;
        }
        offset = offset.max(b.offset + b.size);
    }
    offset
}
