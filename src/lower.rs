//! Lowering a tiled chain to a nested-loop primitive function.
//!
//! One [TileFragment] (a finalized per-node tile map for one bucket) plus
//! the assigned chain becomes a [PrimFunction]: a flat parameter buffer
//! list and a block-structured body whose leaves are named hardware
//! primitives over buffer regions rather than raw index arithmetic.

use crate::affine::{dim, AffineError, AffineMap, MapExpr};
use crate::alloc::{MemKind, ScheduledBuffer};
use crate::assign::AssignedChain;
use crate::common::{DimSize, Dtype, Shape};
use crate::expr::AffineForm;
use crate::graph::{BinaryKind, Node, NodeId, Op, UnaryKind};
use crate::search::{NodeInfo, TileFragment};
use divrem::DivCeil;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error(transparent)]
    Affine(#[from] AffineError),
    #[error("no lowering rule for `{0}`")]
    Unsupported(&'static str),
    #[error("{0} has no entry in the tile fragment")]
    MissingTile(NodeId),
}

/// A sub-rectangle of a node's buffer: per-axis offset expressions over
/// the enclosing loop variables, a nominal tile extent, and the buffer's
/// true bound the extent is clamped to at boundary tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub buffer: NodeId,
    pub offsets: Vec<MapExpr>,
    pub sizes: Shape,
    pub bounds: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    /// `for var in 0..extent`, with loop variables numbered outermost
    /// first.
    Loop {
        var: u8,
        extent: u32,
        body: Vec<Stmt>,
    },
    Block(Vec<Stmt>),
    Primitive {
        name: String,
        inputs: Vec<Region>,
        output: Region,
        /// Accumulate into the output instead of overwriting it.
        accumulate: bool,
    },
}

/// One buffer parameter of the lowered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub id: NodeId,
    pub kind: MemKind,
    pub dtype: Dtype,
    pub buffer: ScheduledBuffer,
}

/// The lowered form of one bucket: input parameters followed by output
/// parameters, then a nested-loop body.
#[derive(Debug, Clone)]
pub struct PrimFunction {
    pub params: Vec<Param>,
    pub body: Stmt,
}

/// Explicitly threaded lowering state, one frame per chain. The loop
/// variable count grows when recursion enters a nested loop and is
/// restored by the caller on return.
struct LoweringContext {
    depth: u8,
    region_memo: HashMap<NodeId, Region>,
}

pub struct AffineTileLowerer<'a> {
    chain: &'a AssignedChain,
    fragment: &'a TileFragment,
}

impl<'a> AffineTileLowerer<'a> {
    pub fn new(chain: &'a AssignedChain, fragment: &'a TileFragment) -> AffineTileLowerer<'a> {
        AffineTileLowerer { chain, fragment }
    }

    pub fn lower(&self) -> Result<PrimFunction, LowerError> {
        let root_info = self.info(self.chain.root)?;
        let rank = u8::try_from(root_info.tile.len()).unwrap_or(u8::MAX);

        // Grid loop over the root's tile: one loop per axis, offsets are
        // `loop var * tile extent`, clamped downstream by each region's
        // bound.
        let root_map = AffineMap::new(
            rank,
            0,
            root_info
                .tile
                .iter()
                .enumerate()
                .map(|(a, t)| dim(a as u8) * i64::from(t.get()))
                .collect(),
        );

        let mut ctx = LoweringContext {
            depth: rank,
            region_memo: HashMap::new(),
        };
        let inner = self.lower_node(self.chain.root, &root_map, &mut ctx)?;

        let mut body = Stmt::Block(inner);
        for (a, (&tile, &shape)) in root_info
            .tile
            .iter()
            .zip(&root_info.shape)
            .enumerate()
            .rev()
        {
            body = Stmt::Loop {
                var: a as u8,
                extent: trip_count(shape, tile),
                body: vec![body],
            };
        }

        Ok(PrimFunction {
            params: self.params(),
            body,
        })
    }

    /// All `Input`-location buffers, then all `Output`-location ones, in
    /// chain order.
    fn params(&self) -> Vec<Param> {
        let param = |(&id, info): (&NodeId, &NodeInfo)| Param {
            id,
            kind: info.kind,
            dtype: self.chain.types[&id].tensor.dtype,
            buffer: info.buffer.clone(),
        };
        let of_kind = |kind: MemKind| {
            self.fragment
                .nodes
                .iter()
                .filter(move |(_, info)| info.kind == kind)
                .map(param)
        };
        of_kind(MemKind::Input).chain(of_kind(MemKind::Output)).collect()
    }

    fn info(&self, id: NodeId) -> Result<&NodeInfo, LowerError> {
        self.fragment.nodes.get(&id).ok_or(LowerError::MissingTile(id))
    }

    fn node(&self, id: NodeId) -> &Node {
        self.chain.graph.node(id)
    }

    /// The node's buffer region under `map`, memoized so repeated
    /// references within this bucket share one region.
    fn region(
        &self,
        id: NodeId,
        map: &AffineMap,
        ctx: &mut LoweringContext,
    ) -> Result<Region, LowerError> {
        if let Some(hit) = ctx.region_memo.get(&id) {
            return Ok(hit.clone());
        }
        let info = self.info(id)?;
        let region = Region {
            buffer: id,
            offsets: map.results().to_vec(),
            sizes: info.tile.clone(),
            bounds: info.shape.clone(),
        };
        ctx.region_memo.insert(id, region.clone());
        Ok(region)
    }

    /// Lowers `id` and everything beneath it; statements for operands
    /// come before the node's own primitive.
    fn lower_node(
        &self,
        id: NodeId,
        map: &AffineMap,
        ctx: &mut LoweringContext,
    ) -> Result<Vec<Stmt>, LowerError> {
        let node = self.node(id).clone();
        match &node.op {
            // Leaves are materialized buffers; consumers read them via
            // their regions directly.
            Op::Var | Op::Const => Ok(Vec::new()),
            Op::Load | Op::Store | Op::Boxing => {
                let operand = node.operands[0];
                let operand_map = self.broadcast_map(map, id, operand)?;
                let mut stmts = self.lower_node(operand, &operand_map, ctx)?;
                let src = self.region(operand, &operand_map, ctx)?;
                let dst = self.region(id, map, ctx)?;
                let name = if node.op == Op::Boxing { "rebox" } else { "memcopy" };
                stmts.push(Stmt::Primitive {
                    name: name.to_owned(),
                    inputs: vec![src],
                    output: dst,
                    accumulate: false,
                });
                Ok(stmts)
            }
            Op::Unary(kind) => {
                let operand = node.operands[0];
                let operand_map = self.broadcast_map(map, id, operand)?;
                let mut stmts = self.lower_node(operand, &operand_map, ctx)?;
                let src = self.region(operand, &operand_map, ctx)?;
                let dst = self.region(id, map, ctx)?;
                stmts.push(Stmt::Primitive {
                    name: unary_name(*kind).to_owned(),
                    inputs: vec![src],
                    output: dst,
                    accumulate: false,
                });
                Ok(stmts)
            }
            Op::Binary(kind) => {
                let mut stmts = Vec::new();
                let mut inputs = Vec::new();
                for &operand in &node.operands {
                    let operand_map = self.broadcast_map(map, id, operand)?;
                    stmts.extend(self.lower_node(operand, &operand_map, ctx)?);
                    inputs.push(self.region(operand, &operand_map, ctx)?);
                }
                let dst = self.region(id, map, ctx)?;
                stmts.push(Stmt::Primitive {
                    name: binary_name(*kind).to_owned(),
                    inputs,
                    output: dst,
                    accumulate: false,
                });
                Ok(stmts)
            }
            Op::MatMul => self.lower_matmul(id, &node, map, ctx),
            Op::Fusion => self.lower_fusion(id, &node, map, ctx),
            Op::Reshape => Err(LowerError::Unsupported(node.op.name())),
        }
    }

    /// Serial reduction loop over `K`: operand maps are rebuilt from the
    /// output's trailing two offset results, substituting the reduction
    /// loop variable for the contracted axis on each side.
    fn lower_matmul(
        &self,
        id: NodeId,
        node: &Node,
        map: &AffineMap,
        ctx: &mut LoweringContext,
    ) -> Result<Vec<Stmt>, LowerError> {
        let (lhs, rhs) = (node.operands[0], node.operands[1]);
        let lhs_info = self.info(lhs)?;
        let k_extent = lhs_info.shape[lhs_info.shape.len() - 1];
        let k_tile = self
            .fragment
            .reduction_tile
            .unwrap_or(k_extent)
            .min(k_extent);
        let steps = trip_count(k_extent, k_tile);

        let results = map.results();
        let row_off = results[results.len() - 2].clone();
        let col_off = results[results.len() - 1].clone();

        let k_var = ctx.depth;
        let k_off = dim(k_var) * i64::from(k_tile.get());
        let lhs_map = AffineMap::new(k_var + 1, 0, vec![row_off, k_off.clone()]);
        let rhs_map = AffineMap::new(k_var + 1, 0, vec![k_off, col_off]);

        ctx.depth += 1;
        let mut inner = self.lower_node(lhs, &lhs_map, ctx)?;
        inner.extend(self.lower_node(rhs, &rhs_map, ctx)?);
        let a = self.region(lhs, &lhs_map, ctx)?;
        let b = self.region(rhs, &rhs_map, ctx)?;
        let dst = self.region(id, map, ctx)?;
        ctx.depth -= 1;

        if steps == 1 {
            inner.push(Stmt::Primitive {
                name: "matmul".to_owned(),
                inputs: vec![a, b],
                output: dst,
                accumulate: false,
            });
            return Ok(vec![Stmt::Loop {
                var: k_var,
                extent: 1,
                body: inner,
            }]);
        }

        // Multiple reduction steps: zero the output once, then accumulate
        // every step.
        inner.push(Stmt::Primitive {
            name: "matmul".to_owned(),
            inputs: vec![a, b],
            output: dst.clone(),
            accumulate: true,
        });
        Ok(vec![
            Stmt::Primitive {
                name: "fill".to_owned(),
                inputs: Vec::new(),
                output: dst,
                accumulate: false,
            },
            Stmt::Loop {
                var: k_var,
                extent: steps,
                body: inner,
            },
        ])
    }

    /// A nested sub-chain lowers inside its own grid loop over the fusion
    /// node's tile, stepping by the inner root's tile; each step copies the
    /// inner root's result into the fusion's buffer, which consumers read
    /// through their own (outer) regions.
    fn lower_fusion(
        &self,
        id: NodeId,
        node: &Node,
        map: &AffineMap,
        ctx: &mut LoweringContext,
    ) -> Result<Vec<Stmt>, LowerError> {
        let Some(body) = node.body else {
            return Err(LowerError::Unsupported(node.op.name()));
        };
        let info = self.info(id)?.clone();
        let body_tile = self.info(body)?.tile.clone();
        let rank = u8::try_from(info.tile.len()).unwrap_or(u8::MAX);

        let base = ctx.depth;
        let inner_map = AffineMap::new(
            base + rank,
            0,
            map.results()
                .iter()
                .zip(&body_tile)
                .enumerate()
                .map(|(a, (off, t))| off.clone() + dim(base + a as u8) * i64::from(t.get()))
                .collect(),
        );

        ctx.depth += rank;
        let mut inner = self.lower_node(body, &inner_map, ctx)?;
        let src = self.region(body, &inner_map, ctx)?;
        ctx.depth -= rank;

        // The destination region is built directly rather than memoized:
        // consumers of the fusion address its buffer with the outer map.
        inner.push(Stmt::Primitive {
            name: "memcopy".to_owned(),
            inputs: vec![src],
            output: Region {
                buffer: id,
                offsets: inner_map.results().to_vec(),
                sizes: body_tile.clone(),
                bounds: info.shape.clone(),
            },
            accumulate: false,
        });

        let mut stmt = Stmt::Block(inner);
        for (a, (&tile, &step)) in info.tile.iter().zip(&body_tile).enumerate().rev() {
            stmt = Stmt::Loop {
                var: base + a as u8,
                extent: trip_count(tile, step),
                body: vec![stmt],
            };
        }
        Ok(vec![stmt])
    }

    /// The operand-facing map for broadcast-shaped operands: trailing
    /// results align right, and size-1 operand axes pin their offset to 0.
    fn broadcast_map(
        &self,
        map: &AffineMap,
        out: NodeId,
        operand: NodeId,
    ) -> Result<AffineMap, LowerError> {
        let out_rank = self.info(out)?.shape.len();
        let operand_shape = self.info(operand)?.shape.clone();
        let results = map.results();
        let skip = out_rank.saturating_sub(operand_shape.len());
        let adjusted = operand_shape
            .iter()
            .enumerate()
            .map(|(a, ext)| {
                if ext.get() == 1 {
                    AffineForm::constant(0)
                } else {
                    results[skip + a].clone()
                }
            })
            .collect();
        Ok(AffineMap::new(map.num_dims(), map.num_syms(), adjusted))
    }
}

fn trip_count(extent: DimSize, tile: DimSize) -> u32 {
    DivCeil::div_ceil(extent.get(), tile.get())
}

fn unary_name(kind: UnaryKind) -> &'static str {
    match kind {
        UnaryKind::Abs => "abs",
        UnaryKind::Neg => "neg",
        UnaryKind::Exp => "exp",
        UnaryKind::Sqrt => "sqrt",
    }
}

fn binary_name(kind: BinaryKind) -> &'static str {
    match kind {
        BinaryKind::Add => "add",
        BinaryKind::Sub => "sub",
        BinaryKind::Mul => "mul",
        BinaryKind::Div => "div",
        BinaryKind::Max => "max",
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.buffer)?;
        for (i, (off, (size, bound))) in self
            .offsets
            .iter()
            .zip(self.sizes.iter().zip(&self.bounds))
            .enumerate()
        {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{off}:+{size}")?;
            if size < bound {
                write!(f, "|{bound}")?;
            }
        }
        write!(f, "]")
    }
}

impl Stmt {
    fn fmt_indented(&self, f: &mut Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Stmt::Loop { var, extent, body } => {
                writeln!(f, "{pad}for i{var} in 0..{extent} {{")?;
                for s in body {
                    s.fmt_indented(f, indent + 1)?;
                }
                writeln!(f, "{pad}}}")
            }
            Stmt::Block(body) => {
                for s in body {
                    s.fmt_indented(f, indent)?;
                }
                Ok(())
            }
            Stmt::Primitive {
                name,
                inputs,
                output,
                accumulate,
            } => {
                write!(f, "{pad}{name}(")?;
                for (i, r) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{r}")?;
                }
                write!(f, ") -> {output}")?;
                if *accumulate {
                    write!(f, " [accumulate]")?;
                }
                writeln!(f)
            }
        }
    }
}

impl Display for Stmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl Display for PrimFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut sig = String::new();
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(sig, ", ")?;
            }
            write!(sig, "{}: {:?}/{}", p.id, p.kind, p.dtype)?;
        }
        writeln!(f, "fn({sig}) {{")?;
        self.body.fmt_indented(f, 1)?;
        writeln!(f, "}}")
    }
}
