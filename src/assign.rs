use crate::graph::{Graph, Node, NodeId, Op};
use crate::infer::{infer_output, InferError, InferOutcome};
use crate::placement::{evenly_divided, DistributedType, Placement, PlacementError, Sbp, TensorType};
use crate::saturate::{dedup_equivalents, SaturationEngine};
use egg::{Id, RecExpr, SymbolLang};
use indexmap::IndexMap;
use itertools::Itertools;
use log::warn;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

/// Ceiling on the Cartesian product of operand candidates considered per
/// node. The product is truncated (deterministically, in order) past this.
pub const MAX_LAYOUT_CANDIDATES: usize = 256;

#[derive(Debug, Error)]
pub enum AssignError {
    #[error("`{op}` at {node} has no realizable layout under the given placement, even after reboxing")]
    Unrealizable { node: NodeId, op: &'static str },
    #[error(transparent)]
    Unsupported(InferError),
    #[error("required output layout is invalid: {0}")]
    InvalidLayout(#[from] PlacementError),
}

/// Index into the assigner's candidate arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CandId(u32);

/// One candidate rewrite of a source node (or an inserted boxing
/// conversion), with a fully resolved output type.
#[derive(Debug, Clone)]
struct Candidate {
    /// Source node, or `None` for inserted boxing conversions.
    source: Option<NodeId>,
    op: Op,
    children: SmallVec<[CandId; 2]>,
    ty: DistributedType,
}

/// The assigner's answer: a rewritten chain (possibly containing inserted
/// [Op::Boxing] nodes) where every node carries one resolved
/// [DistributedType].
#[derive(Debug)]
pub struct AssignedChain {
    pub graph: Graph,
    pub root: NodeId,
    pub types: IndexMap<NodeId, DistributedType>,
}

/// Walks the chain bottom-up, producing per-node candidate layout rewrites,
/// deduplicating semantically equivalent ones through the saturation
/// engine, and extracting a single whole-chain representative.
pub struct DistributedLayoutAssigner<'a, E: SaturationEngine> {
    graph: &'a Graph,
    placement: Rc<Placement>,
    engine: &'a mut E,
    cands: Vec<Candidate>,
    memo: IndexMap<NodeId, Vec<CandId>>,
}

impl<'a, E: SaturationEngine> DistributedLayoutAssigner<'a, E> {
    pub fn new(
        graph: &'a Graph,
        placement: Rc<Placement>,
        engine: &'a mut E,
    ) -> DistributedLayoutAssigner<'a, E> {
        DistributedLayoutAssigner {
            graph,
            placement,
            engine,
            cands: Vec::new(),
            memo: IndexMap::new(),
        }
    }

    /// Assigns a layout to every node reachable from `root`. When
    /// `required` is given, rewrites whose root type differs get a final
    /// boxing conversion before entering the root equivalence class.
    pub fn assign(
        mut self,
        root: NodeId,
        required: Option<&DistributedType>,
    ) -> Result<AssignedChain, AssignError> {
        if let Some(required) = required {
            required.validate()?;
        }
        for id in self.graph.post_order(root) {
            let cands = self.candidates_for(id)?;
            self.memo.insert(id, cands);
            self.dedup_node(id);
        }

        // Union every surviving whole-chain rewrite into one class,
        // boxing type-mismatched ones to the required output type.
        let mut root_cands = self.memo[&root].clone();
        if let Some(required) = required {
            root_cands = root_cands
                .into_iter()
                .map(|c| {
                    if &self.cands[c.0 as usize].ty == required {
                        c
                    } else {
                        self.push_candidate(Candidate {
                            source: None,
                            op: Op::Boxing,
                            children: [c].into_iter().collect(),
                            ty: required.clone(),
                        })
                    }
                })
                .collect();
        }
        let exprs: Vec<RecExpr<SymbolLang>> =
            root_cands.iter().map(|&c| self.render(c)).collect();
        let extraction = dedup_equivalents(&mut *self.engine, &exprs);
        let winner = root_cands[extraction.best];

        Ok(self.materialize(winner))
    }

    fn node(&self, id: NodeId) -> &Node {
        self.graph.node(id)
    }

    fn push_candidate(&mut self, cand: Candidate) -> CandId {
        let id = CandId(u32::try_from(self.cands.len()).unwrap());
        self.cands.push(cand);
        id
    }

    fn candidates_for(&mut self, id: NodeId) -> Result<Vec<CandId>, AssignError> {
        let node = self.node(id).clone();
        if node.op.is_leaf() {
            return Ok(self.leaf_candidates(id, &node));
        }
        if node.op == Op::Fusion {
            return self.fusion_candidates(id, &node);
        }

        // Step 2: Cartesian product of the operands' resolved candidates.
        let mut found = self.product_candidates(id, &node, None)?;

        // Step 3: reshape invalidates axis alignment; recompute layouts
        // from scratch against the new output shape.
        if found.is_empty() && node.op == Op::Reshape {
            found = self.reshape_fallback(id, &node);
        }

        // Step 4: rebox PartialSum operands and retry.
        if found.is_empty() {
            let boxed = self.boxed_operand_candidates(&node);
            if boxed.values().any(|v| !v.is_empty()) {
                found = self.product_candidates(id, &node, Some(&boxed))?;
            }
        }

        // Step 5: fatal; the subgraph as sharded has no realizable layout.
        if found.is_empty() {
            return Err(AssignError::Unrealizable {
                node: id,
                op: node.op.name(),
            });
        }
        Ok(found)
    }

    /// Step 1: every per-level combination of Broadcast or a
    /// divisibility-valid Split. Never PartialSum.
    fn leaf_candidates(&mut self, id: NodeId, node: &Node) -> Vec<CandId> {
        let layouts = leaf_layouts(&node.ty, &self.placement);
        layouts
            .into_iter()
            .map(|sbp| {
                let ty = DistributedType::new(node.ty.clone(), &sbp, self.placement.clone());
                self.push_candidate(Candidate {
                    source: Some(id),
                    op: node.op.clone(),
                    children: SmallVec::new(),
                    ty,
                })
            })
            .collect()
    }

    /// A fusion resolves to whatever its inner root resolves to: each
    /// surviving body rewrite yields one fusion candidate of the same
    /// distributed type. The operands need no candidates of their own here;
    /// the body rewrite already fixes the layout of every leaf it reads.
    fn fusion_candidates(&mut self, id: NodeId, node: &Node) -> Result<Vec<CandId>, AssignError> {
        let Some(body) = node.body else {
            return Err(AssignError::Unrealizable {
                node: id,
                op: node.op.name(),
            });
        };
        let found = self.memo[&body]
            .clone()
            .into_iter()
            .map(|b| {
                let ty = self.cands[b.0 as usize].ty.clone();
                self.push_candidate(Candidate {
                    source: Some(id),
                    op: Op::Fusion,
                    children: [b].into_iter().collect(),
                    ty,
                })
            })
            .collect();
        Ok(found)
    }

    /// The Cartesian product over operand candidate lists, keeping each
    /// combination that re-infers without error. `extra` supplies
    /// additional (boxed) candidates per operand.
    fn product_candidates(
        &mut self,
        id: NodeId,
        node: &Node,
        extra: Option<&IndexMap<NodeId, Vec<CandId>>>,
    ) -> Result<Vec<CandId>, AssignError> {
        let operand_lists: Vec<Vec<CandId>> = node
            .operands
            .iter()
            .map(|o| {
                let mut list = self.memo[o].clone();
                if let Some(extra) = extra {
                    if let Some(more) = extra.get(o) {
                        list.extend(more.iter().copied());
                    }
                }
                list
            })
            .collect();

        let mut found = Vec::new();
        for (i, combo) in operand_lists
            .iter()
            .map(|l| l.iter().copied())
            .multi_cartesian_product()
            .enumerate()
        {
            if i >= MAX_LAYOUT_CANDIDATES {
                warn!(
                    "{}: layout candidate product truncated at {MAX_LAYOUT_CANDIDATES}",
                    id
                );
                break;
            }
            let operand_tys: Vec<&DistributedType> =
                combo.iter().map(|c| &self.cands[c.0 as usize].ty).collect();
            match infer_output(&node.op, &node.ty, &operand_tys) {
                Ok(InferOutcome::Resolved(ty)) => {
                    let children = combo.iter().copied().collect();
                    found.push(self.push_candidate(Candidate {
                        source: Some(id),
                        op: node.op.clone(),
                        children,
                        ty,
                    }));
                }
                Ok(InferOutcome::Inconclusive) => {}
                Err(e @ InferError::UnsupportedOp(_)) => {
                    return Err(AssignError::Unsupported(e))
                }
                Err(_) => {}
            }
        }
        Ok(found)
    }

    fn reshape_fallback(&mut self, id: NodeId, node: &Node) -> Vec<CandId> {
        debug_assert_eq!(node.operands.len(), 1);
        let operand = node.operands[0];
        let Some(&base) = self.memo[&operand].first() else {
            return Vec::new();
        };
        leaf_layouts(&node.ty, &self.placement)
            .into_iter()
            .map(|sbp| {
                let ty = DistributedType::new(node.ty.clone(), &sbp, self.placement.clone());
                self.push_candidate(Candidate {
                    source: Some(id),
                    op: node.op.clone(),
                    children: [base].into_iter().collect(),
                    ty,
                })
            })
            .collect()
    }

    /// For every operand candidate carrying a PartialSum level, boxed
    /// variants converting it to Broadcast or any divisibility-valid Split.
    fn boxed_operand_candidates(&mut self, node: &Node) -> IndexMap<NodeId, Vec<CandId>> {
        let mut result: IndexMap<NodeId, Vec<CandId>> = IndexMap::new();
        for &operand in &node.operands {
            let mut boxed = Vec::new();
            for &cand in self.memo[&operand].clone().iter() {
                let ty = self.cands[cand.0 as usize].ty.clone();
                if !ty.has_partial() {
                    continue;
                }
                for target in rebox_targets(&ty) {
                    boxed.push(self.push_candidate(Candidate {
                        source: None,
                        op: Op::Boxing,
                        children: [cand].into_iter().collect(),
                        ty: target,
                    }));
                }
            }
            result.insert(operand, boxed);
        }
        result
    }

    /// Step 6: among a node's validating rewrites, rewrites with the same
    /// output type are mutually equivalent; keep only the canonical
    /// representative chosen by the saturation engine.
    fn dedup_node(&mut self, id: NodeId) {
        let cands = self.memo[&id].clone();
        let mut by_type: IndexMap<DistributedType, Vec<CandId>> = IndexMap::new();
        for c in cands {
            by_type
                .entry(self.cands[c.0 as usize].ty.clone())
                .or_default()
                .push(c);
        }

        let mut kept = Vec::new();
        for (_, group) in by_type {
            if group.len() == 1 {
                kept.push(group[0]);
                continue;
            }
            let exprs: Vec<RecExpr<SymbolLang>> =
                group.iter().map(|&c| self.render(c)).collect();
            let extraction = dedup_equivalents(&mut *self.engine, &exprs);
            for (i, &c) in group.iter().enumerate() {
                if extraction.kept[i] {
                    kept.push(c);
                }
            }
        }
        self.memo.insert(id, kept);
    }

    /// Renders a candidate tree as a term for the saturation engine.
    fn render(&self, cand: CandId) -> RecExpr<SymbolLang> {
        let mut expr = RecExpr::default();
        self.render_into(cand, &mut expr);
        expr
    }

    fn render_into(&self, cand: CandId, expr: &mut RecExpr<SymbolLang>) -> Id {
        let c = &self.cands[cand.0 as usize];
        let children: Vec<Id> = c
            .children
            .iter()
            .map(|&ch| self.render_into(ch, expr))
            .collect();
        let symbol = match c.source {
            Some(node) => format!("{}.{}:{}", c.op.name(), node.0, c.ty),
            None => format!("{}:{}", c.op.name(), c.ty),
        };
        expr.add(SymbolLang::new(symbol, children))
    }

    /// Builds the rewritten chain for the winning candidate tree.
    fn materialize(self, winner: CandId) -> AssignedChain {
        let mut graph = Graph::new();
        let mut types = IndexMap::new();
        let mut built: HashMap<CandId, NodeId> = HashMap::new();
        let root = materialize_into(
            self.graph,
            &self.cands,
            winner,
            &mut graph,
            &mut types,
            &mut built,
        );
        AssignedChain { graph, root, types }
    }
}

fn materialize_into(
    src: &Graph,
    cands: &[Candidate],
    cand: CandId,
    graph: &mut Graph,
    types: &mut IndexMap<NodeId, DistributedType>,
    built: &mut HashMap<CandId, NodeId>,
) -> NodeId {
    if let Some(&done) = built.get(&cand) {
        return done;
    }
    let c = &cands[cand.0 as usize];
    let id = if let (Op::Fusion, Some(orig)) = (&c.op, c.source) {
        // The single child is the body rewrite; the fusion's operands are
        // recovered as the body tree's rewrites of the source operands.
        let body = materialize_into(src, cands, c.children[0], graph, types, built);
        let operands: Vec<NodeId> = src
            .node(orig)
            .operands
            .iter()
            .map(|&o| {
                let rewrite = source_candidate(cands, c.children[0], o)
                    .expect("fusion operand is not read by its body");
                built[&rewrite]
            })
            .collect();
        graph.add_fusion(&operands, body, c.ty.tensor.clone())
    } else {
        let operands: Vec<NodeId> = c
            .children
            .iter()
            .map(|&ch| materialize_into(src, cands, ch, graph, types, built))
            .collect();
        graph.add(c.op.clone(), &operands, c.ty.tensor.clone())
    };
    types.insert(id, c.ty.clone());
    built.insert(cand, id);
    id
}

/// The candidate within `root`'s tree that rewrites source node `node`.
fn source_candidate(cands: &[Candidate], root: CandId, node: NodeId) -> Option<CandId> {
    let c = &cands[root.0 as usize];
    if c.source == Some(node) {
        return Some(root);
    }
    c.children
        .iter()
        .find_map(|&ch| source_candidate(cands, ch, node))
}

/// All per-level combinations of Broadcast or a Split along an axis whose
/// extent the level's replica count divides evenly.
fn leaf_layouts(ty: &TensorType, placement: &Placement) -> Vec<SmallVec<[Sbp; 2]>> {
    let per_level: Vec<Vec<Sbp>> = (0..placement.levels())
        .map(|level| {
            let mut options = vec![Sbp::Broadcast];
            for (axis, &extent) in ty.shape.iter().enumerate() {
                if evenly_divided(extent, placement.replicas(level)) {
                    options.push(Sbp::Split(u8::try_from(axis).unwrap()));
                }
            }
            options
        })
        .collect();
    per_level
        .iter()
        .map(|l| l.iter().copied())
        .multi_cartesian_product()
        .map(|combo| combo.into_iter().collect())
        .collect()
}

/// The reboxing targets for a PartialSum-bearing type: Broadcast, plus
/// every divisibility-valid Split, at each PartialSum level.
fn rebox_targets(ty: &DistributedType) -> Vec<DistributedType> {
    let mut out = Vec::new();
    for (level, s) in ty.sbp.iter().enumerate() {
        if !matches!(s, Sbp::PartialSum) {
            continue;
        }
        let mut replacements = vec![Sbp::Broadcast];
        for (axis, &extent) in ty.tensor.shape.iter().enumerate() {
            if evenly_divided(extent, ty.placement.replicas(level)) {
                replacements.push(Sbp::Split(u8::try_from(axis).unwrap()));
            }
        }
        for replacement in replacements {
            let mut sbp = ty.sbp.clone();
            sbp[level] = replacement;
            out.push(DistributedType::new(
                ty.tensor.clone(),
                &sbp,
                ty.placement.clone(),
            ));
        }
    }
    out
}
