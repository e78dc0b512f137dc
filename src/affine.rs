use crate::expr::{AffineForm, Atom, Bounds, IndexAtom, IndexExpr, Substitute, Term};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// A variable of an [AffineMap]: either an iteration dimension or a symbol
/// (runtime parameter). Composition renames by index space, so no textual
/// fresh-name generation is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IxVar {
    Dim(u8),
    Sym(u8),
}

impl Bounds for IxVar {}
impl Atom for IxVar {}

impl Display for IxVar {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IxVar::Dim(i) => write!(f, "d{i}"),
            IxVar::Sym(i) => write!(f, "s{i}"),
        }
    }
}

pub type MapExpr = IndexExpr<IxVar>;

/// Shorthand for the expression consisting of dimension `i` alone.
pub fn dim(i: u8) -> MapExpr {
    IxVar::Dim(i).into()
}

/// Shorthand for the expression consisting of symbol `i` alone.
pub fn sym(i: u8) -> MapExpr {
    IxVar::Sym(i).into()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AffineError {
    #[error("composing map with {produced} results into map expecting {expected} dims")]
    ComposeRankMismatch { produced: usize, expected: usize },
    #[error("expected {expected} {kind} arguments, got {got}")]
    ArityMismatch {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("inverse_permutation requires a symbol-free map")]
    InverseWithSymbols,
}

/// A map from dimension and symbol variables to integer-valued index
/// expressions. Immutable once built; composition and application produce
/// new maps or expressions rather than mutating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffineMap {
    num_dims: u8,
    num_syms: u8,
    results: Vec<MapExpr>,
}

impl AffineMap {
    pub fn new(num_dims: u8, num_syms: u8, results: Vec<MapExpr>) -> AffineMap {
        AffineMap {
            num_dims,
            num_syms,
            results,
        }
    }

    /// The rank-`r` map `(d0, .., dr-1) -> (d0, .., dr-1)`.
    pub fn identity(rank: u8) -> AffineMap {
        AffineMap {
            num_dims: rank,
            num_syms: 0,
            results: (0..rank).map(dim).collect(),
        }
    }

    /// The degenerate scalar map `() -> (v)`.
    pub fn constant_map(v: i64) -> AffineMap {
        AffineMap::point_map(&[v])
    }

    /// The fixed-index map `() -> (v0, .., vn)`.
    pub fn point_map(values: &[i64]) -> AffineMap {
        AffineMap {
            num_dims: 0,
            num_syms: 0,
            results: values.iter().map(|&v| AffineForm::constant(v)).collect(),
        }
    }

    pub fn num_dims(&self) -> u8 {
        self.num_dims
    }

    pub fn num_syms(&self) -> u8 {
        self.num_syms
    }

    pub fn results(&self) -> &[MapExpr] {
        &self.results
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    /// Substitutes `other`'s results for this map's dimensions, producing
    /// the map that applies `other` first and then `self`.
    ///
    /// Requires `other.num_results() == self.num_dims()`. `other`'s symbols
    /// are renamed past this map's own symbols, so repeated composition
    /// cannot collide symbol indices.
    pub fn compose(&self, other: &AffineMap) -> Result<AffineMap, AffineError> {
        if usize::from(self.num_dims) != other.num_results() {
            return Err(AffineError::ComposeRankMismatch {
                produced: other.num_results(),
                expected: usize::from(self.num_dims),
            });
        }

        let offset = self.num_syms;
        let renamed: Vec<MapExpr> = other
            .results
            .iter()
            .map(|r| {
                r.clone().map_vars(&mut |v| -> MapExpr {
                    match v {
                        IxVar::Dim(i) => dim(i),
                        IxVar::Sym(j) => sym(offset + j),
                    }
                })
            })
            .collect();

        let results = self
            .results
            .iter()
            .map(|r| {
                r.clone().map_vars(&mut |v| -> MapExpr {
                    match v {
                        IxVar::Dim(i) => renamed[usize::from(i)].clone(),
                        IxVar::Sym(j) => sym(j),
                    }
                })
            })
            .collect();

        Ok(AffineMap {
            num_dims: other.num_dims,
            num_syms: self.num_syms + other.num_syms,
            results,
        })
    }

    /// Inverts a literal permutation such as `(d0, d1) -> (d1, d0)`.
    ///
    /// Returns `Ok(None)` when the map is not a bijective permutation of
    /// its dimensions; errs when the map has symbols, which is a misuse.
    pub fn inverse_permutation(&self) -> Result<Option<AffineMap>, AffineError> {
        if self.num_syms != 0 {
            return Err(AffineError::InverseWithSymbols);
        }
        let mut inverse: Vec<Option<MapExpr>> = vec![None; usize::from(self.num_dims)];
        for (result_idx, r) in self.results.iter().enumerate() {
            let Some(source_dim) = as_single_dim(r) else {
                return Ok(None);
            };
            let slot = &mut inverse[usize::from(source_dim)];
            if slot.is_some() {
                return Ok(None);
            }
            *slot = Some(dim(u8::try_from(result_idx).unwrap()));
        }
        let Some(results) = inverse.into_iter().collect::<Option<Vec<_>>>() else {
            return Ok(None);
        };
        Ok(Some(AffineMap {
            num_dims: u8::try_from(self.results.len()).unwrap(),
            num_syms: 0,
            results,
        }))
    }

    /// Fully numeric evaluation. Argument counts must match exactly.
    pub fn eval(&self, dims: &[i64], syms: &[i64]) -> Result<Vec<i64>, AffineError> {
        if dims.len() != usize::from(self.num_dims) {
            return Err(AffineError::ArityMismatch {
                kind: "dimension",
                expected: usize::from(self.num_dims),
                got: dims.len(),
            });
        }
        if syms.len() != usize::from(self.num_syms) {
            return Err(AffineError::ArityMismatch {
                kind: "symbol",
                expected: usize::from(self.num_syms),
                got: syms.len(),
            });
        }
        Ok(self
            .results
            .iter()
            .map(|r| {
                r.clone()
                    .map_vars(&mut |v| -> MapExpr {
                        AffineForm::constant(match v {
                            IxVar::Dim(i) => dims[usize::from(i)],
                            IxVar::Sym(j) => syms[usize::from(j)],
                        })
                    })
                    .as_constant()
                    .expect("numeric substitution folds every result to a constant")
            })
            .collect())
    }

    /// Symbolic application: substitutes arbitrary expressions for this
    /// map's dimensions and symbols, yielding one expression per result.
    pub fn apply<B: Atom>(
        &self,
        dims: &[IndexExpr<B>],
        syms: &[IndexExpr<B>],
    ) -> Result<Vec<IndexExpr<B>>, AffineError> {
        if dims.len() != usize::from(self.num_dims) {
            return Err(AffineError::ArityMismatch {
                kind: "dimension",
                expected: usize::from(self.num_dims),
                got: dims.len(),
            });
        }
        if syms.len() != usize::from(self.num_syms) {
            return Err(AffineError::ArityMismatch {
                kind: "symbol",
                expected: usize::from(self.num_syms),
                got: syms.len(),
            });
        }
        Ok(self
            .results
            .iter()
            .map(|r| {
                r.clone().map_vars(&mut |v| match v {
                    IxVar::Dim(i) => dims[usize::from(i)].clone(),
                    IxVar::Sym(j) => syms[usize::from(j)].clone(),
                })
            })
            .collect())
    }
}

/// Returns `Some(i)` iff the expression is exactly the variable `di`.
fn as_single_dim(e: &MapExpr) -> Option<u8> {
    if e.1 != 0 || e.0.len() != 1 {
        return None;
    }
    match &e.0[0] {
        Term(1, IndexAtom::Leaf(IxVar::Dim(i))) => Some(*i),
        _ => None,
    }
}

impl Display for AffineMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for i in 0..self.num_dims {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "d{i}")?;
        }
        write!(f, ")")?;
        if self.num_syms > 0 {
            write!(f, "[")?;
            for i in 0..self.num_syms {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "s{i}")?;
            }
            write!(f, "]")?;
        }
        write!(f, " -> (")?;
        for (i, r) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn transpose2() -> AffineMap {
        AffineMap::new(2, 0, vec![dim(1), dim(0)])
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(AffineMap::identity(2).to_string(), "(d0,d1) -> ((d0), (d1))");
    }

    #[test]
    fn test_display_with_symbols() {
        let m = AffineMap::new(1, 1, vec![dim(0) * 4 + sym(0)]);
        assert_eq!(m.to_string(), "(d0)[s0] -> (4(d0) + (s0))");
    }

    #[test]
    fn test_compose_rank_mismatch() {
        let m = AffineMap::identity(2);
        let p = AffineMap::point_map(&[3]);
        assert!(matches!(
            m.compose(&p),
            Err(AffineError::ComposeRankMismatch { .. })
        ));
    }

    #[test]
    fn test_compose_substitutes_results() {
        // self: (d0) -> (4*d0 + 1), other: (d0, d1) -> (d0 + d1)
        let scale = AffineMap::new(1, 0, vec![dim(0) * 4 + 1]);
        let add = AffineMap::new(2, 0, vec![dim(0) + dim(1)]);
        let composed = scale.compose(&add).unwrap();
        assert_eq!(composed.eval(&[2, 3], &[]).unwrap(), vec![21]);
    }

    #[test]
    fn test_compose_offsets_symbols() {
        // self: (d0)[s0] -> (d0 + s0), other: (d0)[s0] -> (2*d0 + s0)
        let a = AffineMap::new(1, 1, vec![dim(0) + sym(0)]);
        let b = AffineMap::new(1, 1, vec![dim(0) * 2 + sym(0)]);
        let c = a.compose(&b).unwrap();
        assert_eq!(c.num_syms(), 2);
        // c(d0; s0, s1) = 2*d0 + s1 + s0
        assert_eq!(c.eval(&[3], &[10, 100]).unwrap(), vec![116]);

        // Composing again must not collide the symbol index spaces.
        let d = c.compose(&b).unwrap();
        assert_eq!(d.num_syms(), 3);
        assert_eq!(d.eval(&[1], &[10, 100, 1000]).unwrap(), vec![2 * (2 + 1000) + 100 + 10]);
    }

    #[test]
    fn test_identity_law() {
        let t = transpose2();
        let left = AffineMap::identity(2).compose(&t).unwrap();
        let right = t.compose(&AffineMap::identity(2)).unwrap();
        for d0 in -3i64..3 {
            for d1 in -3i64..3 {
                let expected = t.eval(&[d0, d1], &[]).unwrap();
                assert_eq!(left.eval(&[d0, d1], &[]).unwrap(), expected);
                assert_eq!(right.eval(&[d0, d1], &[]).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_transpose_inverse_is_self() {
        let t = transpose2();
        let inv = t.inverse_permutation().unwrap().unwrap();
        assert_eq!(inv, t);
        let roundtrip = t.compose(&inv).unwrap();
        for d0 in 0i64..4 {
            for d1 in 0i64..4 {
                assert_eq!(roundtrip.eval(&[d0, d1], &[]).unwrap(), vec![d0, d1]);
            }
        }
    }

    #[test]
    fn test_inverse_permutation_rejects_symbols() {
        let m = AffineMap::new(1, 1, vec![dim(0) + sym(0)]);
        assert_eq!(
            m.inverse_permutation(),
            Err(AffineError::InverseWithSymbols)
        );
    }

    #[test]
    fn test_inverse_permutation_non_bijective_is_none() {
        // (d0, d1) -> (d0, d0) never produces d1.
        let m = AffineMap::new(2, 0, vec![dim(0), dim(0)]);
        assert_eq!(m.inverse_permutation(), Ok(None));
        // A non-variable result is not a permutation either.
        let m2 = AffineMap::new(1, 0, vec![dim(0) * 2]);
        assert_eq!(m2.inverse_permutation(), Ok(None));
    }

    #[test]
    fn test_eval_arity_checked() {
        let m = AffineMap::identity(2);
        assert!(matches!(
            m.eval(&[1], &[]),
            Err(AffineError::ArityMismatch { .. })
        ));
        assert!(matches!(
            m.eval(&[1, 2], &[9]),
            Err(AffineError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn test_associativity_three_stage_chain() {
        // C: transpose, B: identity, A: (d0) -> (d0 + 1, 2*d0).
        let c = transpose2();
        let b = AffineMap::identity(2);
        let a = AffineMap::new(1, 0, vec![dim(0) + 1, dim(0) * 2]);
        let left = c.compose(&b.compose(&a).unwrap()).unwrap();
        let right = c.compose(&b).unwrap().compose(&a).unwrap();
        for x in -8i64..8 {
            assert_eq!(
                left.eval(&[x], &[]).unwrap(),
                right.eval(&[x], &[]).unwrap()
            );
        }
    }

    proptest! {
        #[test]
        fn test_eval_apply_consistency(
            coeffs in prop::collection::vec(-4i64..4, 2),
            intercept in -10i64..10,
            d in prop::collection::vec(-20i64..20, 2),
            s in -20i64..20,
        ) {
            let result = AffineForm(
                vec![
                    Term(coeffs[0], IndexAtom::Leaf(IxVar::Dim(0))),
                    Term(coeffs[1], IndexAtom::Leaf(IxVar::Dim(1))),
                    Term(1, IndexAtom::Leaf(IxVar::Sym(0))),
                ],
                intercept,
            );
            let m = AffineMap::new(2, 1, vec![result]);

            let evaled = m.eval(&d, &[s]).unwrap();
            let applied: Vec<IndexExpr<IxVar>> = m
                .apply(
                    &[AffineForm::constant(d[0]), AffineForm::constant(d[1])],
                    &[AffineForm::constant(s)],
                )
                .unwrap();
            let folded: Vec<i64> = applied
                .iter()
                .map(|e| e.as_constant().unwrap())
                .collect();
            prop_assert_eq!(evaled, folded);
        }
    }
}
