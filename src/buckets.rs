//! Case-splitting a sharded chain by which split axes sit at a tail shard.
//!
//! When a split does not divide its axis evenly, the last shard along that
//! axis is narrower, so devices see up to two distinct local extents per
//! split axis. A [BucketCondition] fixes one combination of normal/tail
//! positions; the tile search then runs once per distinct combination.

use crate::common::Shape;
use crate::graph::NodeId;
use crate::placement::DistributedType;
use indexmap::IndexMap;
use std::fmt::{self, Display, Formatter};

/// Whether a shard sits at the normal (full-width) or tail (narrower, last)
/// position along its split axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardPos {
    Norm,
    Tail,
}

/// One normal/tail choice per potentially split axis: the block-level split
/// axis, the thread-level split axis, and the combined axis used when both
/// levels split the same tensor axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketCondition {
    pub block: ShardPos,
    pub thread: ShardPos,
    pub combined: ShardPos,
}

impl BucketCondition {
    /// All 8 combinations, normal-first so the all-normal bucket is always
    /// kept during shape dedup.
    pub fn enumerate() -> [BucketCondition; 8] {
        use ShardPos::*;
        let mut out = [BucketCondition {
            block: Norm,
            thread: Norm,
            combined: Norm,
        }; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = BucketCondition {
                block: if i & 4 != 0 { Tail } else { Norm },
                thread: if i & 2 != 0 { Tail } else { Norm },
                combined: if i & 1 != 0 { Tail } else { Norm },
            };
        }
        out
    }

    /// Whether `level`'s shard of `ty` is at a tail position under this
    /// condition. Both levels splitting the same tensor axis defer to the
    /// combined flag.
    fn at_tail(&self, ty: &DistributedType, level: usize) -> bool {
        let flag = if same_axis_split(ty) {
            self.combined
        } else if level == 0 {
            self.block
        } else {
            self.thread
        };
        flag == ShardPos::Tail
    }

    /// The concrete per-device shape `ty` takes in this bucket.
    pub fn node_shape(&self, ty: &DistributedType) -> Shape {
        ty.local_shape_with(|level| self.at_tail(ty, level))
    }
}

impl Display for BucketCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let ch = |p| if p == ShardPos::Tail { 'T' } else { 'N' };
        write!(f, "{}{}{}", ch(self.block), ch(self.thread), ch(self.combined))
    }
}

fn same_axis_split(ty: &DistributedType) -> bool {
    use crate::placement::Sbp;
    match ty.sbp.as_slice() {
        [Sbp::Split(a), Sbp::Split(b)] => a == b,
        _ => false,
    }
}

/// One case of the sharded chain: the condition plus each node's concrete
/// local shape under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub cond: BucketCondition,
    pub shapes: IndexMap<NodeId, Shape>,
}

/// Enumerates the chain's distinct buckets. Conditions whose full per-node
/// shape map coincides with an already-kept bucket are discarded, so a
/// uniformly divided chain yields exactly one bucket and a chain with one
/// uneven split axis yields two.
pub fn split_buckets(
    order: &[NodeId],
    types: &IndexMap<NodeId, DistributedType>,
) -> Vec<Bucket> {
    let mut kept: Vec<Bucket> = Vec::new();
    for cond in BucketCondition::enumerate() {
        let shapes: IndexMap<NodeId, Shape> = order
            .iter()
            .map(|&id| (id, cond.node_shape(&types[&id])))
            .collect();
        if kept.iter().any(|b| b.shapes == shapes) {
            continue;
        }
        kept.push(Bucket { cond, shapes });
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::placement::{DeviceKind, Placement, Sbp, TensorType};
    use crate::shape;
    use std::rc::Rc;

    fn dist(
        shape: crate::common::Shape,
        sbp: &[Sbp],
        hierarchy: &[u32],
    ) -> DistributedType {
        let tags: Vec<&str> = ["block", "thread"][..hierarchy.len()].to_vec();
        let placement = Placement::new(DeviceKind::Npu, hierarchy, &tags).unwrap();
        DistributedType::new(TensorType::new(Dtype::Float32, shape), sbp, placement)
    }

    fn chain(tys: &[DistributedType]) -> (Vec<NodeId>, IndexMap<NodeId, DistributedType>) {
        let order: Vec<NodeId> = (0..tys.len()).map(|i| NodeId(i as u32)).collect();
        let types = order.iter().copied().zip(tys.iter().cloned()).collect();
        (order, types)
    }

    #[test]
    fn test_uniform_chain_has_one_bucket() {
        let (order, types) = chain(&[dist(shape![8, 8], &[Sbp::Split(0)], &[4])]);
        let buckets = split_buckets(&order, &types);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].shapes[&NodeId(0)], shape![2, 8]);
    }

    #[test]
    fn test_uneven_split_has_two_buckets() {
        // 10 into 4 parts: norm 3, tail 1.
        let (order, types) = chain(&[dist(shape![10, 8], &[Sbp::Split(0)], &[4])]);
        let buckets = split_buckets(&order, &types);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].shapes[&NodeId(0)], shape![3, 8]);
        assert_eq!(buckets[1].shapes[&NodeId(0)], shape![1, 8]);
    }

    #[test]
    fn test_two_uneven_axes_have_four_buckets() {
        let (order, types) = chain(&[dist(
            shape![10, 10],
            &[Sbp::Split(0), Sbp::Split(1)],
            &[4, 4],
        )]);
        let buckets = split_buckets(&order, &types);
        assert_eq!(buckets.len(), 4);
    }

    #[test]
    fn test_uniform_axis_collapses_buckets() {
        // Axis 0 divides evenly; only axis 1's tail condition matters, so
        // at most 4 of the 8 conditions survive, and here exactly 2 do.
        let (order, types) = chain(&[dist(
            shape![8, 10],
            &[Sbp::Split(0), Sbp::Split(1)],
            &[4, 4],
        )]);
        let buckets = split_buckets(&order, &types);
        assert!(buckets.len() <= 4);
        assert_eq!(buckets.len(), 2);
    }

    #[test]
    fn test_combined_split_uses_combined_flag() {
        // Both levels split axis 0: 2*2 = 4 parts of 10 rows. Level 0
        // shards into 5, level 1 shards the 5 into norm 3 / tail 2.
        let (order, types) = chain(&[dist(
            shape![10, 8],
            &[Sbp::Split(0), Sbp::Split(0)],
            &[2, 2],
        )]);
        let buckets = split_buckets(&order, &types);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].shapes[&NodeId(0)], shape![3, 8]);
        assert_eq!(buckets[1].shapes[&NodeId(0)], shape![2, 8]);
    }

    #[test]
    fn test_broadcast_chain_single_bucket() {
        let (order, types) = chain(&[
            dist(shape![8, 8], &[Sbp::Broadcast], &[4]),
            dist(shape![8, 8], &[Sbp::Broadcast], &[4]),
        ]);
        assert_eq!(split_buckets(&order, &types).len(), 1);
    }
}
