//! End-to-end driver: layout assignment, bucketed tile search, lowering.
//!
//! Chains are processed one at a time, to completion, in a fixed order;
//! per-chain memo state lives inside the stage objects and is never
//! shared across chains.

use crate::alloc::{IntervalAllocator, LifetimeAllocator, MemKind};
use crate::assign::{AssignError, AssignedChain, DistributedLayoutAssigner};
use crate::graph::{Graph, NodeId};
use crate::lower::{AffineTileLowerer, LowerError, PrimFunction};
use crate::placement::{DistributedType, Placement};
use crate::saturate::EggEngine;
use crate::search::{TileFeasibilityChecker, TileFragment, TileOptions};
use indexmap::IndexMap;
use log::{debug, info};
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Assign(#[from] AssignError),
    #[error(transparent)]
    Lower(#[from] LowerError),
}

/// Memory budgets and tile search configuration for one device.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub placement: Rc<Placement>,
    /// Byte budget per memory location.
    pub budgets: IndexMap<MemKind, u64>,
    pub tile: TileOptions,
    /// Required layout of the chain's result, if the surrounding program
    /// constrains it.
    pub required_output: Option<DistributedType>,
}

/// The fully scheduled form of one fused chain: the layout-assigned graph
/// plus one lowered function per surviving bucket.
#[derive(Debug)]
pub struct ScheduledChain {
    pub assigned: AssignedChain,
    pub fragments: Vec<TileFragment>,
    pub functions: Vec<PrimFunction>,
}

impl ScheduledChain {
    /// Whether tile search produced at least one usable bucket. A chain
    /// with zero buckets cannot be scheduled and the caller must reject
    /// the fusion that produced it.
    pub fn schedulable(&self) -> bool {
        !self.fragments.is_empty()
    }
}

/// Runs the whole pipeline for one chain rooted at `root`.
pub fn schedule_chain(
    graph: &Graph,
    root: NodeId,
    options: &ScheduleOptions,
) -> Result<ScheduledChain, PipelineError> {
    let mut engine = EggEngine::new();
    let assigner = DistributedLayoutAssigner::new(graph, options.placement.clone(), &mut engine);
    let assigned = assigner.assign(root, options.required_output.as_ref())?;
    debug!(
        "assigned {} nodes, root type {}",
        assigned.types.len(),
        assigned.types[&assigned.root]
    );

    let allocator = IntervalAllocator::new(options.budgets.clone());
    let fragments = tile_search(&assigned, &allocator, &options.tile);

    let mut functions = Vec::with_capacity(fragments.len());
    for fragment in &fragments {
        functions.push(AffineTileLowerer::new(&assigned, fragment).lower()?);
    }

    info!(
        "chain at {}: {} bucket(s), schedulable: {}",
        assigned.root,
        fragments.len(),
        !fragments.is_empty()
    );
    Ok(ScheduledChain {
        assigned,
        fragments,
        functions,
    })
}

fn tile_search(
    assigned: &AssignedChain,
    allocator: &dyn LifetimeAllocator,
    options: &TileOptions,
) -> Vec<TileFragment> {
    let checker = TileFeasibilityChecker::new(assigned, allocator);
    checker.check(options)
}
