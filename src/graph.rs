use crate::placement::TensorType;
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

/// Index of a node in a [Graph] arena. Memo tables key on this rather than
/// on reference identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryKind {
    Abs,
    Neg,
    Exp,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
    Max,
}

/// The closed set of operations the tiling core understands. Anything else
/// in the surrounding compiler must be fused or rejected before reaching
/// this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    /// A runtime input (chain leaf).
    Var,
    /// A compile-time constant (chain leaf).
    Const,
    Load,
    Store,
    Unary(UnaryKind),
    Binary(BinaryKind),
    MatMul,
    Reshape,
    /// An inserted re-layout conversion between two distributed types of
    /// the same logical tensor.
    Boxing,
    /// A nested sub-chain used as an operand of an outer chain. The node's
    /// `body` is the inner root; its operands are the outer arguments.
    Fusion,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Var => "var",
            Op::Const => "const",
            Op::Load => "load",
            Op::Store => "store",
            Op::Unary(UnaryKind::Abs) => "abs",
            Op::Unary(UnaryKind::Neg) => "neg",
            Op::Unary(UnaryKind::Exp) => "exp",
            Op::Unary(UnaryKind::Sqrt) => "sqrt",
            Op::Binary(BinaryKind::Add) => "add",
            Op::Binary(BinaryKind::Sub) => "sub",
            Op::Binary(BinaryKind::Mul) => "mul",
            Op::Binary(BinaryKind::Div) => "div",
            Op::Binary(BinaryKind::Max) => "max",
            Op::MatMul => "matmul",
            Op::Reshape => "reshape",
            Op::Boxing => "boxing",
            Op::Fusion => "fusion",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::Var | Op::Const)
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub operands: SmallVec<[NodeId; 2]>,
    /// The resolved (unsharded) result type.
    pub ty: TensorType,
    /// Inner root for [Op::Fusion] nodes.
    pub body: Option<NodeId>,
}

/// An arena-allocated operation DAG. Nodes are appended once and never
/// mutated; operands always precede their consumers in the arena, so arena
/// order is a valid topological order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add(&mut self, op: Op, operands: &[NodeId], ty: TensorType) -> NodeId {
        debug_assert!(operands.iter().all(|o| (o.0 as usize) < self.nodes.len()));
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap());
        self.nodes.push(Node {
            op,
            operands: operands.iter().copied().collect(),
            ty,
            body: None,
        });
        id
    }

    pub fn add_fusion(&mut self, operands: &[NodeId], body: NodeId, ty: TensorType) -> NodeId {
        let id = self.add(Op::Fusion, operands, ty);
        self.nodes[id.0 as usize].body = Some(body);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes reachable from `root`, operands before consumers, each visited
    /// once. Deterministic for a given graph and root.
    pub fn post_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut visited = vec![false; self.nodes.len()];
        self.post_order_into(root, &mut visited, &mut order);
        order
    }

    fn post_order_into(&self, id: NodeId, visited: &mut [bool], order: &mut Vec<NodeId>) {
        if std::mem::replace(&mut visited[id.0 as usize], true) {
            return;
        }
        for operand in self.node(id).operands.clone() {
            self.post_order_into(operand, visited, order);
        }
        // A fusion node depends on its inner root the same way it depends on
        // its operands, so the body chain precedes it in the order.
        if let Some(body) = self.node(id).body {
            self.post_order_into(body, visited, order);
        }
        order.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::shape;

    fn f32_ty(s: crate::common::Shape) -> TensorType {
        TensorType::new(Dtype::Float32, s)
    }

    #[test]
    fn test_post_order_operands_first() {
        let mut g = Graph::new();
        let x = g.add(Op::Var, &[], f32_ty(shape![4, 4]));
        let y = g.add(Op::Var, &[], f32_ty(shape![4, 4]));
        let mm = g.add(Op::MatMul, &[x, y], f32_ty(shape![4, 4]));
        let out = g.add(Op::Store, &[mm], f32_ty(shape![4, 4]));
        assert_eq!(g.post_order(out), vec![x, y, mm, out]);
    }

    #[test]
    fn test_post_order_shared_operand_visited_once() {
        let mut g = Graph::new();
        let x = g.add(Op::Var, &[], f32_ty(shape![4]));
        let a = g.add(Op::Unary(UnaryKind::Abs), &[x], f32_ty(shape![4]));
        let b = g.add(Op::Binary(BinaryKind::Add), &[a, a], f32_ty(shape![4]));
        assert_eq!(g.post_order(b), vec![x, a, b]);
    }

    #[test]
    fn test_post_order_descends_into_fusion_body() {
        let mut g = Graph::new();
        let x = g.add(Op::Var, &[], f32_ty(shape![4, 4]));
        let y = g.add(Op::Var, &[], f32_ty(shape![4, 4]));
        let mm = g.add(Op::MatMul, &[x, y], f32_ty(shape![4, 4]));
        let fused = g.add_fusion(&[x, y], mm, f32_ty(shape![4, 4]));
        let store = g.add(Op::Store, &[fused], f32_ty(shape![4, 4]));
        // The inner root appears between the shared leaves and the fusion
        // node, so downstream passes see every body node exactly once.
        assert_eq!(g.post_order(store), vec![x, y, mm, fused, store]);
    }
}
