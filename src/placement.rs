use crate::common::{DimSize, Dtype, Shape};
use divrem::DivCeil;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;
use thiserror::Error;

/// At most two shardable hierarchy levels: the block axis then the thread
/// axis. Bucket conditions enumerate exactly these.
pub const MAX_PLACEMENT_LEVELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum DeviceKind {
    Npu,
    Cpu,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("placement hierarchy has {0} levels; at most {MAX_PLACEMENT_LEVELS} are supported")]
    TooManyLevels(usize),
    #[error("placement level {0} has zero replicas")]
    ZeroReplicas(usize),
    #[error("split axis {axis} is out of range for a rank-{rank} tensor")]
    SplitAxisOutOfRange { axis: u8, rank: usize },
    #[error(
        "splitting extent {extent} over {parts} replicas leaves an empty tail shard on axis {axis}"
    )]
    EmptyTailShard { axis: u8, extent: u32, parts: u32 },
}

/// A device hierarchy: per-level replica counts with a name tag per level.
/// Immutable and shared by reference across many distributed types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Placement {
    kind: DeviceKind,
    hierarchy: SmallVec<[u32; MAX_PLACEMENT_LEVELS]>,
    tags: SmallVec<[String; MAX_PLACEMENT_LEVELS]>,
}

impl Placement {
    pub fn new(
        kind: DeviceKind,
        hierarchy: &[u32],
        tags: &[&str],
    ) -> Result<Rc<Placement>, PlacementError> {
        if hierarchy.len() > MAX_PLACEMENT_LEVELS {
            return Err(PlacementError::TooManyLevels(hierarchy.len()));
        }
        if let Some(lvl) = hierarchy.iter().position(|&r| r == 0) {
            return Err(PlacementError::ZeroReplicas(lvl));
        }
        debug_assert_eq!(hierarchy.len(), tags.len());
        Ok(Rc::new(Placement {
            kind,
            hierarchy: hierarchy.iter().copied().collect(),
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
        }))
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn levels(&self) -> usize {
        self.hierarchy.len()
    }

    /// Replica count at hierarchy level `level`.
    pub fn replicas(&self, level: usize) -> u32 {
        self.hierarchy[level]
    }

    pub fn tag(&self, level: usize) -> &str {
        &self.tags[level]
    }
}

impl Display for Placement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "@[")?;
        for (i, r) in self.hierarchy.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, "]")
    }
}

/// Per-placement-level sharding descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Sbp {
    Broadcast,
    Split(u8),
    PartialSum,
}

impl Display for Sbp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Sbp::Broadcast => write!(f, "B"),
            Sbp::Split(axis) => write!(f, "S({axis})"),
            Sbp::PartialSum => write!(f, "P"),
        }
    }
}

/// An unsharded tensor type: scalar element type plus logical shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TensorType {
    pub dtype: Dtype,
    pub shape: Shape,
}

impl TensorType {
    pub fn new(dtype: Dtype, shape: Shape) -> TensorType {
        TensorType { dtype, shape }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

impl Display for TensorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// The widths of the normal and tail shards when `extent` is divided into
/// `parts` pieces. The tail shard is the last one and may be narrower.
/// Returns `None` when the division would leave the tail shard empty, e.g.
/// 9 over 4 replicas (3+3+3+0); such splits fail [DistributedType::validate].
pub fn shard_widths(extent: DimSize, parts: u32) -> Option<(DimSize, DimSize)> {
    debug_assert_ne!(parts, 0);
    let norm = DivCeil::div_ceil(extent.get(), parts);
    let tail = extent
        .get()
        .checked_sub(norm * (parts - 1))
        .and_then(DimSize::new)?;
    Some((DimSize::new(norm).unwrap(), tail))
}

/// Whether `extent` divides into `parts` equal shards.
pub fn evenly_divided(extent: DimSize, parts: u32) -> bool {
    extent.get() % parts == 0
}

/// A tensor type annotated with one [Sbp] per placement level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DistributedType {
    pub tensor: TensorType,
    pub sbp: SmallVec<[Sbp; MAX_PLACEMENT_LEVELS]>,
    pub placement: Rc<Placement>,
}

impl DistributedType {
    pub fn new(tensor: TensorType, sbp: &[Sbp], placement: Rc<Placement>) -> DistributedType {
        debug_assert_eq!(sbp.len(), placement.levels());
        DistributedType {
            tensor,
            sbp: sbp.iter().copied().collect(),
            placement,
        }
    }

    /// A replicated type: `Broadcast` at every level.
    pub fn broadcast(tensor: TensorType, placement: Rc<Placement>) -> DistributedType {
        let sbp: SmallVec<[Sbp; MAX_PLACEMENT_LEVELS]> =
            (0..placement.levels()).map(|_| Sbp::Broadcast).collect();
        DistributedType {
            tensor,
            sbp,
            placement,
        }
    }

    pub fn has_partial(&self) -> bool {
        self.sbp.iter().any(|s| matches!(s, Sbp::PartialSum))
    }

    /// Checks that every split level names an in-range axis and leaves no
    /// device with an empty shard. Internally generated layouts satisfy this
    /// by construction; caller-supplied layouts must be checked before use.
    pub fn validate(&self) -> Result<(), PlacementError> {
        let rank = self.tensor.shape.len();
        // Levels shard progressively, so a second split of the same axis
        // divides the already-sharded extent.
        let mut shape = self.tensor.shape.clone();
        for (level, s) in self.sbp.iter().enumerate() {
            if let Sbp::Split(axis) = s {
                if usize::from(*axis) >= rank {
                    return Err(PlacementError::SplitAxisOutOfRange { axis: *axis, rank });
                }
                let extent = shape[usize::from(*axis)];
                let parts = self.placement.replicas(level);
                match shard_widths(extent, parts) {
                    Some((norm, _)) => shape[usize::from(*axis)] = norm,
                    None => {
                        return Err(PlacementError::EmptyTailShard {
                            axis: *axis,
                            extent: extent.get(),
                            parts,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// The normal (non-tail) per-device shape.
    pub fn local_shape(&self) -> Shape {
        self.local_shape_with(|_| false)
    }

    /// The per-device shape where `at_tail(level)` selects whether each
    /// splitting level contributes its tail shard width. Split levels that
    /// [validate](Self::validate) would reject leave their axis unsharded.
    pub fn local_shape_with(&self, mut at_tail: impl FnMut(usize) -> bool) -> Shape {
        let mut shape = self.tensor.shape.clone();
        for (level, s) in self.sbp.iter().enumerate() {
            if let Sbp::Split(axis) = s {
                let parts = self.placement.replicas(level);
                if let Some((norm, tail)) = shard_widths(shape[usize::from(*axis)], parts) {
                    shape[usize::from(*axis)] = if at_tail(level) { tail } else { norm };
                }
            }
        }
        shape
    }

    /// True when every split level divides its axis evenly, i.e. there is
    /// no narrower tail shard anywhere.
    pub fn uniformly_divided(&self) -> bool {
        self.sbp.iter().enumerate().all(|(level, s)| match s {
            Sbp::Split(axis) => evenly_divided(
                self.tensor.shape[usize::from(*axis)],
                self.placement.replicas(level),
            ),
            _ => true,
        })
    }
}

impl Display for DistributedType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{{", self.tensor, self.placement)?;
        for (i, s) in self.sbp.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{s}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dimsize, shape};

    fn single_level() -> Rc<Placement> {
        Placement::new(DeviceKind::Npu, &[4], &["block"]).unwrap()
    }

    #[test]
    fn test_placement_rejects_deep_hierarchy() {
        assert_eq!(
            Placement::new(DeviceKind::Npu, &[2, 2, 2], &["a", "b", "c"]),
            Err(PlacementError::TooManyLevels(3))
        );
    }

    #[test]
    fn test_shard_widths_even_and_tail() {
        assert_eq!(
            shard_widths(dimsize!(128), 4),
            Some((dimsize!(32), dimsize!(32)))
        );
        // 10 into 4 parts: three shards of 3 and a tail of 1.
        assert_eq!(shard_widths(dimsize!(10), 4), Some((dimsize!(3), dimsize!(1))));
        // 9 into 4 parts would be 3+3+3+0: the last replica holds nothing.
        assert_eq!(shard_widths(dimsize!(9), 4), None);
    }

    #[test]
    fn test_validate_rejects_empty_tail_shard() {
        let ty = DistributedType::new(
            TensorType::new(Dtype::Float32, shape![9, 8]),
            &[Sbp::Split(0)],
            single_level(),
        );
        assert_eq!(
            ty.validate(),
            Err(PlacementError::EmptyTailShard {
                axis: 0,
                extent: 9,
                parts: 4
            })
        );
        // The local shape stays total even for the rejected layout.
        assert_eq!(ty.local_shape_with(|_| true), shape![9, 8]);

        let oob = DistributedType::new(
            TensorType::new(Dtype::Float32, shape![9, 8]),
            &[Sbp::Split(5)],
            single_level(),
        );
        assert_eq!(
            oob.validate(),
            Err(PlacementError::SplitAxisOutOfRange { axis: 5, rank: 2 })
        );

        let ok = DistributedType::new(
            TensorType::new(Dtype::Float32, shape![10, 8]),
            &[Sbp::Split(0)],
            single_level(),
        );
        assert_eq!(ok.validate(), Ok(()));
    }

    #[test]
    fn test_local_shape_split() {
        let ty = DistributedType::new(
            TensorType::new(Dtype::Float32, shape![128, 256]),
            &[Sbp::Split(0)],
            single_level(),
        );
        assert_eq!(ty.local_shape(), shape![32, 256]);
        assert!(ty.uniformly_divided());
    }

    #[test]
    fn test_local_shape_tail() {
        let ty = DistributedType::new(
            TensorType::new(Dtype::Float32, shape![10, 8]),
            &[Sbp::Split(0)],
            single_level(),
        );
        assert!(!ty.uniformly_divided());
        assert_eq!(ty.local_shape(), shape![3, 8]);
        assert_eq!(ty.local_shape_with(|_| true), shape![1, 8]);
    }

    #[test]
    fn test_display_signature() {
        let ty = DistributedType::new(
            TensorType::new(Dtype::Float32, shape![128, 256]),
            &[Sbp::Split(0)],
            single_level(),
        );
        assert_eq!(ty.to_string(), "f32[128,256]@[4]{S(0)}");
    }
}
