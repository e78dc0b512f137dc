use crate::graph::{BinaryKind, Op};
use crate::placement::{DistributedType, Sbp, TensorType};
use smallvec::SmallVec;
use thiserror::Error;

/// Result of re-inferring a node's output type for one combination of
/// operand layouts. `Inconclusive` means validity cannot be judged from the
/// types alone; callers skip the combination without treating it as a
/// contradiction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferOutcome {
    Resolved(DistributedType),
    Inconclusive,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InferError {
    #[error("operation `{0}` has no distributed inference rule")]
    UnsupportedOp(&'static str),
    #[error("operands live on different placements")]
    PlacementMismatch,
    #[error("sbp combination is not realizable for `{op}` at level {level}")]
    InvalidCombination { op: &'static str, level: usize },
    #[error("split axis {axis} does not align across operand shapes")]
    SplitMisaligned { axis: u8 },
    #[error("matmul operands must be rank 2, got {0} and {1}")]
    MatMulRank(usize, usize),
}

/// Re-infers the output [DistributedType] of `op` (whose unsharded result
/// type is `out`) from one concrete combination of operand layouts.
pub fn infer_output(
    op: &Op,
    out: &TensorType,
    operands: &[&DistributedType],
) -> Result<InferOutcome, InferError> {
    let Some(first) = operands.first() else {
        return Err(InferError::UnsupportedOp(op.name()));
    };
    if operands
        .iter()
        .any(|o| o.placement != first.placement)
    {
        return Err(InferError::PlacementMismatch);
    }

    match op {
        Op::Load | Op::Unary(_) => Ok(InferOutcome::Resolved(DistributedType::new(
            out.clone(),
            &first.sbp,
            first.placement.clone(),
        ))),
        Op::Store => {
            // A store materializes its value; a pending partial sum cannot
            // be written out.
            if first.has_partial() {
                return Err(InferError::InvalidCombination {
                    op: op.name(),
                    level: first
                        .sbp
                        .iter()
                        .position(|s| matches!(s, Sbp::PartialSum))
                        .unwrap_or(0),
                });
            }
            Ok(InferOutcome::Resolved(DistributedType::new(
                out.clone(),
                &first.sbp,
                first.placement.clone(),
            )))
        }
        Op::Binary(kind) => infer_binary(*kind, out, operands),
        Op::MatMul => infer_matmul(out, operands),
        Op::Reshape => {
            // Reshaping invalidates axis alignment; only fully replicated
            // operands pass. The assigner recomputes split candidates from
            // the new shape when this fails.
            for (level, s) in first.sbp.iter().enumerate() {
                if !matches!(s, Sbp::Broadcast) {
                    return Err(InferError::InvalidCombination {
                        op: op.name(),
                        level,
                    });
                }
            }
            Ok(InferOutcome::Resolved(DistributedType::broadcast(
                out.clone(),
                first.placement.clone(),
            )))
        }
        // Leaves, inserted conversions, and fusions are resolved by the
        // assigner itself (a fusion inherits its inner root's type), not by
        // per-operand inference.
        Op::Var | Op::Const | Op::Boxing | Op::Fusion => Err(InferError::UnsupportedOp(op.name())),
    }
}

/// Maps an operand-local split axis onto the output's axis space under
/// right-aligned broadcasting. `None` if the axes cannot correspond.
fn split_axis_on_output(operand: &TensorType, out: &TensorType, axis: u8) -> Option<u8> {
    let a = usize::from(axis);
    if a >= operand.rank() {
        return None;
    }
    let shifted = a + out.rank() - operand.rank();
    (operand.shape[a] == out.shape[shifted] && operand.shape[a].get() != 1)
        .then(|| u8::try_from(shifted).unwrap())
}

/// Whether splitting output axis `axis` leaves the other (unsplit) operand
/// consistent: under broadcasting it must not carry a full-extent copy of
/// that axis.
fn tolerates_peer_split(peer: &TensorType, out: &TensorType, axis: u8) -> bool {
    let a = usize::from(axis);
    if a + peer.rank() < out.rank() {
        return true; // axis not covered by the peer at all
    }
    let peer_axis = a + peer.rank() - out.rank();
    peer.shape[peer_axis].get() == 1
}

fn infer_binary(
    kind: BinaryKind,
    out: &TensorType,
    operands: &[&DistributedType],
) -> Result<InferOutcome, InferError> {
    debug_assert_eq!(operands.len(), 2);
    let (lhs, rhs) = (operands[0], operands[1]);
    let linear = matches!(kind, BinaryKind::Add | BinaryKind::Sub);
    let op_name = Op::Binary(kind).name();

    let mut sbp: SmallVec<[Sbp; 2]> = SmallVec::new();
    for (level, (l, r)) in lhs.sbp.iter().zip(&rhs.sbp).enumerate() {
        let combined = match (l, r) {
            (Sbp::Broadcast, Sbp::Broadcast) => Sbp::Broadcast,
            (Sbp::Split(a), Sbp::Split(b)) => {
                let la = split_axis_on_output(&lhs.tensor, out, *a)
                    .ok_or(InferError::SplitMisaligned { axis: *a })?;
                let rb = split_axis_on_output(&rhs.tensor, out, *b)
                    .ok_or(InferError::SplitMisaligned { axis: *b })?;
                if la != rb {
                    return Err(InferError::InvalidCombination {
                        op: op_name,
                        level,
                    });
                }
                Sbp::Split(la)
            }
            (Sbp::Split(a), Sbp::Broadcast) => {
                let la = split_axis_on_output(&lhs.tensor, out, *a)
                    .ok_or(InferError::SplitMisaligned { axis: *a })?;
                if !tolerates_peer_split(&rhs.tensor, out, la) {
                    return Err(InferError::InvalidCombination {
                        op: op_name,
                        level,
                    });
                }
                Sbp::Split(la)
            }
            (Sbp::Broadcast, Sbp::Split(b)) => {
                let rb = split_axis_on_output(&rhs.tensor, out, *b)
                    .ok_or(InferError::SplitMisaligned { axis: *b })?;
                if !tolerates_peer_split(&lhs.tensor, out, rb) {
                    return Err(InferError::InvalidCombination {
                        op: op_name,
                        level,
                    });
                }
                Sbp::Split(rb)
            }
            (Sbp::PartialSum, Sbp::PartialSum) if linear => Sbp::PartialSum,
            // Adding a replicated value to a partial sum is only valid if
            // the replicated side is zero, which types cannot show.
            (Sbp::PartialSum, Sbp::Broadcast) | (Sbp::Broadcast, Sbp::PartialSum) if linear => {
                return Ok(InferOutcome::Inconclusive);
            }
            _ => {
                return Err(InferError::InvalidCombination {
                    op: op_name,
                    level,
                })
            }
        };
        sbp.push(combined);
    }

    Ok(InferOutcome::Resolved(DistributedType::new(
        out.clone(),
        &sbp,
        lhs.placement.clone(),
    )))
}

fn infer_matmul(
    out: &TensorType,
    operands: &[&DistributedType],
) -> Result<InferOutcome, InferError> {
    debug_assert_eq!(operands.len(), 2);
    let (lhs, rhs) = (operands[0], operands[1]);
    if lhs.tensor.rank() != 2 || rhs.tensor.rank() != 2 {
        return Err(InferError::MatMulRank(lhs.tensor.rank(), rhs.tensor.rank()));
    }
    let out_rows = u8::try_from(out.rank() - 2).unwrap();
    let out_cols = u8::try_from(out.rank() - 1).unwrap();

    let mut sbp: SmallVec<[Sbp; 2]> = SmallVec::new();
    for (level, (l, r)) in lhs.sbp.iter().zip(&rhs.sbp).enumerate() {
        let combined = match (l, r) {
            (Sbp::Broadcast, Sbp::Broadcast) => Sbp::Broadcast,
            // Row-split left operand, replicated right.
            (Sbp::Split(0), Sbp::Broadcast) => Sbp::Split(out_rows),
            // Replicated left, column-split right.
            (Sbp::Broadcast, Sbp::Split(1)) => Sbp::Split(out_cols),
            // Both split along the contraction axis: device-local partial
            // products that sum to the result.
            (Sbp::Split(1), Sbp::Split(0)) => Sbp::PartialSum,
            // Matmul is linear in each argument separately.
            (Sbp::PartialSum, Sbp::Broadcast) | (Sbp::Broadcast, Sbp::PartialSum) => {
                Sbp::PartialSum
            }
            _ => {
                return Err(InferError::InvalidCombination {
                    op: "matmul",
                    level,
                })
            }
        };
        sbp.push(combined);
    }

    Ok(InferOutcome::Resolved(DistributedType::new(
        out.clone(),
        &sbp,
        lhs.placement.clone(),
    )))
}
