use egg::{CostFunction, EGraph, Extractor, Id, Language, RecExpr, SymbolLang};

/// Rewrite terms are rendered into [SymbolLang] with one symbol per node;
/// boxing conversions are prefixed so the cost function can see them.
pub const BOXING_SYMBOL_PREFIX: &str = "boxing";

const BOXING_COST: u64 = 8;

/// Charges boxing nodes [BOXING_COST] and everything else 1, so extraction
/// prefers rewrites with fewer re-layouts and breaks ties by node count.
pub struct BoxingWeight;

impl CostFunction<SymbolLang> for BoxingWeight {
    type Cost = u64;

    fn cost<C>(&mut self, enode: &SymbolLang, mut costs: C) -> Self::Cost
    where
        C: FnMut(Id) -> Self::Cost,
    {
        let own = if enode.op.as_str().starts_with(BOXING_SYMBOL_PREFIX) {
            BOXING_COST
        } else {
            1
        };
        enode.fold(own, |sum, id| sum.saturating_add(costs(id)))
    }
}

/// The result of extracting one representative from an equivalence class of
/// candidate rewrites.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Index of the canonical representative among the submitted candidates.
    pub best: usize,
    /// `kept[i]` is true only for the representative.
    pub kept: Vec<bool>,
}

/// The narrow equality-saturation surface the layout assigner depends on.
/// Deterministic given identical inputs.
pub trait SaturationEngine {
    fn insert(&mut self, expr: &RecExpr<SymbolLang>) -> Id;
    fn union(&mut self, a: Id, b: Id) -> bool;
    fn rebuild(&mut self);

    /// Extracts the single best representative of `root`'s class, reporting
    /// a kept/discarded flag per submitted candidate.
    fn extract(&self, root: Id, candidates: &[RecExpr<SymbolLang>]) -> Extraction;
}

/// Production engine over an [egg::EGraph].
#[derive(Default)]
pub struct EggEngine {
    egraph: EGraph<SymbolLang, ()>,
}

impl EggEngine {
    pub fn new() -> EggEngine {
        EggEngine::default()
    }
}

impl SaturationEngine for EggEngine {
    fn insert(&mut self, expr: &RecExpr<SymbolLang>) -> Id {
        self.egraph.add_expr(expr)
    }

    fn union(&mut self, a: Id, b: Id) -> bool {
        self.egraph.union(a, b)
    }

    fn rebuild(&mut self) {
        self.egraph.rebuild();
    }

    fn extract(&self, root: Id, candidates: &[RecExpr<SymbolLang>]) -> Extraction {
        debug_assert!(!candidates.is_empty());
        let extractor = Extractor::new(&self.egraph, BoxingWeight);
        let (_, best_expr) = extractor.find_best(root);

        // The class only ever holds the submitted terms, so the extracted
        // expression normally matches one of them structurally. Fall back to
        // a direct cost comparison if extraction rebuilt an alias.
        let best = candidates
            .iter()
            .position(|c| c == &best_expr)
            .unwrap_or_else(|| {
                candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(i, c)| (expr_cost(c), *i))
                    .map(|(i, _)| i)
                    .unwrap()
            });

        let kept = (0..candidates.len()).map(|i| i == best).collect();
        Extraction { best, kept }
    }
}

/// Bottom-up [BoxingWeight] cost of a standalone term.
fn expr_cost(expr: &RecExpr<SymbolLang>) -> u64 {
    let nodes = expr.as_ref();
    let mut costs = vec![0u64; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let own = if node.op.as_str().starts_with(BOXING_SYMBOL_PREFIX) {
            BOXING_COST
        } else {
            1
        };
        costs[i] = node.fold(own, |sum, id| sum.saturating_add(costs[usize::from(id)]));
    }
    costs.last().copied().unwrap_or(0)
}

/// Inserts every candidate, unions them into one class, and extracts the
/// canonical representative.
pub fn dedup_equivalents(
    engine: &mut dyn SaturationEngine,
    candidates: &[RecExpr<SymbolLang>],
) -> Extraction {
    debug_assert!(!candidates.is_empty());
    let ids: Vec<Id> = candidates.iter().map(|c| engine.insert(c)).collect();
    for pair in ids.windows(2) {
        engine.union(pair[0], pair[1]);
    }
    engine.rebuild();
    engine.extract(ids[0], candidates)
}
