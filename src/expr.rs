use std::{
    fmt::Display,
    ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Rem, Sub},
};

/// An index expression: an affine combination of non-affine atoms.
pub type IndexExpr<T> = AffineForm<IndexAtom<T>>;

pub trait Bounds {
    /// The inclusive bounds of the value, if known.
    fn bounds(&self) -> Option<(i64, i64)> {
        None
    }

    fn as_constant(&self) -> Option<i64> {
        match self.bounds() {
            Some((lo, hi)) if lo == hi => Some(lo),
            _ => None,
        }
    }
}

pub trait Atom: Clone + Eq + Bounds {}

pub trait Substitute<R> {
    type Atom: Atom;
    type Output;

    fn subs(self, atom: &Self::Atom, replacement: &R) -> Self::Output
    where
        Self: Sized,
        R: Clone + From<Self::Atom>,
    {
        self.map_vars(&mut |a| {
            if atom == &a {
                replacement.clone()
            } else {
                a.into()
            }
        })
    }

    fn map_vars(self, mapper: &mut impl FnMut(Self::Atom) -> R) -> Self::Output;
}

/// A sum of coefficient-weighted terms plus an integer intercept.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct AffineForm<T>(pub Vec<Term<T>>, pub i64);

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Term<T>(pub i64, pub T);

/// The non-affine constructors of the index sublanguage. Division and
/// modulus are restricted to constant divisors.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum IndexAtom<T> {
    Constant(i64),
    Leaf(T),
    FloorDiv(Box<IndexExpr<T>>, i64),
    CeilDiv(Box<IndexExpr<T>>, i64),
    Mod(Box<IndexExpr<T>>, i64),
}

pub(crate) fn ceil_div_i64(n: i64, d: i64) -> i64 {
    debug_assert_ne!(d, 0);
    let q = n / d;
    if n % d != 0 && (n < 0) == (d < 0) {
        q + 1
    } else {
        q
    }
}

pub(crate) fn floor_div_i64(n: i64, d: i64) -> i64 {
    debug_assert_ne!(d, 0);
    let q = n / d;
    if n % d != 0 && (n < 0) != (d < 0) {
        q - 1
    } else {
        q
    }
}

impl<T> AffineForm<T> {
    pub const fn zero() -> Self {
        AffineForm(vec![], 0)
    }

    pub const fn constant(c: i64) -> Self {
        AffineForm(vec![], c)
    }
}

impl<T: Bounds> Bounds for AffineForm<T> {
    fn bounds(&self) -> Option<(i64, i64)> {
        let mut minimum = self.1;
        let mut maximum = self.1;
        for Term(coeff, sym) in &self.0 {
            let (sym_min, sym_max) = sym.bounds()?;
            if *coeff < 0 {
                minimum = minimum.checked_add(coeff.checked_mul(sym_max)?)?;
                maximum = maximum.checked_add(coeff.checked_mul(sym_min)?)?;
            } else {
                minimum = minimum.checked_add(coeff.checked_mul(sym_min)?)?;
                maximum = maximum.checked_add(coeff.checked_mul(sym_max)?)?;
            }
        }
        Some((minimum, maximum))
    }
}

impl<T: Bounds> Bounds for IndexAtom<T> {
    fn bounds(&self) -> Option<(i64, i64)> {
        match self {
            IndexAtom::Constant(v) => Some((*v, *v)),
            IndexAtom::Leaf(v) => v.bounds(),
            IndexAtom::FloorDiv(v, d) => v
                .bounds()
                .map(|(lo, hi)| (floor_div_i64(lo, *d), floor_div_i64(hi, *d))),
            IndexAtom::CeilDiv(v, d) => v
                .bounds()
                .map(|(lo, hi)| (ceil_div_i64(lo, *d), ceil_div_i64(hi, *d))),
            IndexAtom::Mod(v, m) => v.bounds().map(|(_, hi)| (0, hi.min(m - 1).max(0))),
        }
    }
}

impl Bounds for String {}
impl Bounds for &str {}
impl Atom for String {}
impl Atom for &str {}

// Substituting into an AffineForm flattens any AffineForms produced for its
// atoms back into a single sum.
impl<T, R, RO> Substitute<R> for AffineForm<T>
where
    T: Substitute<R, Output = AffineForm<RO>> + Bounds,
    R: Clone + Eq,
    RO: Bounds + Eq,
{
    type Atom = T::Atom;
    type Output = AffineForm<RO>;

    fn map_vars(mut self, mapper: &mut impl FnMut(Self::Atom) -> R) -> Self::Output {
        let mut accum = AffineForm(vec![], self.1);
        for Term(c, s) in self.0.drain(..) {
            let subbed = s.map_vars(mapper);
            if subbed.as_constant() != Some(0) {
                accum += subbed * c;
            }
        }
        accum
    }
}

impl<T, R, RO> Substitute<R> for IndexAtom<T>
where
    T: Substitute<R, Output = IndexExpr<RO>> + Bounds,
    R: Clone + Eq,
    RO: Bounds + Eq,
{
    type Atom = T::Atom;
    type Output = IndexExpr<RO>;

    fn map_vars(self, mapper: &mut impl FnMut(Self::Atom) -> R) -> Self::Output {
        match self {
            IndexAtom::Constant(c) => IndexExpr::constant(c),
            IndexAtom::Leaf(v) => v.map_vars(mapper),
            IndexAtom::FloorDiv(v, d) => v.map_vars(mapper) / d,
            IndexAtom::CeilDiv(v, d) => v.map_vars(mapper).ceil_div(d),
            IndexAtom::Mod(v, m) => v.map_vars(mapper) % m,
        }
    }
}

// An atom can always stand in for itself; substitution is equality testing.
impl<T: Atom, R: Clone> Substitute<R> for T {
    type Atom = T;
    type Output = R;

    fn map_vars(self, mapper: &mut impl FnMut(Self::Atom) -> R) -> R {
        mapper(self)
    }
}

impl<T> From<T> for AffineForm<T> {
    fn from(t: T) -> Self {
        AffineForm(vec![Term(1, t)], 0)
    }
}

impl<T: Atom> From<T> for IndexExpr<T> {
    fn from(t: T) -> Self {
        AffineForm(vec![Term(1, IndexAtom::Leaf(t))], 0)
    }
}

impl<T> PartialEq<i64> for AffineForm<T> {
    fn eq(&self, rhs: &i64) -> bool {
        self.0.is_empty() && self.1 == *rhs
    }
}

impl<T: PartialEq> Add for AffineForm<T> {
    type Output = Self;

    fn add(mut self, rhs: AffineForm<T>) -> Self::Output {
        self += rhs;
        self
    }
}

impl<T> Add<i64> for AffineForm<T> {
    type Output = Self;

    fn add(mut self, rhs: i64) -> Self::Output {
        self.1 += rhs;
        self
    }
}

impl<T> Sub<i64> for AffineForm<T> {
    type Output = Self;

    fn sub(mut self, rhs: i64) -> Self::Output {
        self.1 -= rhs;
        self
    }
}

impl<T: PartialEq> Sub for AffineForm<T> {
    type Output = Self;

    fn sub(mut self, rhs: AffineForm<T>) -> Self::Output {
        self += rhs.neg();
        self
    }
}

impl<T: PartialEq> AddAssign for AffineForm<T> {
    fn add_assign(&mut self, rhs: Self) {
        let AffineForm(terms, intercept) = self;
        *intercept += rhs.1;
        for Term(c, s) in rhs.0 {
            if let Some(Term(c2, _)) = terms.iter_mut().find(|Term(_, s2)| &s == s2) {
                *c2 += c;
            } else {
                terms.push(Term(c, s));
            }
        }
        terms.retain(|Term(c, _)| *c != 0);
    }
}

impl<T> Neg for AffineForm<T> {
    type Output = Self;

    fn neg(mut self) -> Self::Output {
        self.0.iter_mut().for_each(|Term(c, _)| *c = -*c);
        self.1 = -self.1;
        self
    }
}

impl<T> Mul<i64> for AffineForm<T> {
    type Output = Self;

    fn mul(mut self, rhs: i64) -> Self::Output {
        self *= rhs;
        self
    }
}

impl<T> MulAssign<i64> for AffineForm<T> {
    fn mul_assign(&mut self, rhs: i64) {
        self.0.iter_mut().for_each(|Term(c, _)| *c *= rhs);
        self.0.retain(|Term(c, _)| *c != 0);
        self.1 *= rhs;
    }
}

impl<T: Bounds> Div<i64> for IndexExpr<T> {
    type Output = Self;

    /// Floor division by a constant divisor.
    fn div(mut self, rhs: i64) -> Self::Output {
        debug_assert_ne!(rhs, 0);
        if rhs == 1 {
            self
        } else if self.0.is_empty() {
            AffineForm::constant(floor_div_i64(self.1, rhs))
        } else if self.div_through(rhs) {
            self
        } else if self.remainder_stays_within(rhs) {
            self.0.iter_mut().for_each(|Term(c, _)| *c /= rhs);
            self.0.retain(|Term(c, _)| *c != 0);
            self.1 = floor_div_i64(self.1, rhs);
            self
        } else {
            IndexAtom::FloorDiv(Box::new(self), rhs).into()
        }
    }
}

impl<T: Bounds> Rem<i64> for IndexExpr<T> {
    type Output = Self;

    fn rem(mut self, rhs: i64) -> Self::Output {
        assert_ne!(rhs, 0);
        if rhs == 1 {
            return AffineForm::constant(0);
        }
        if self.0.is_empty() {
            return AffineForm::constant(self.1.rem_euclid(rhs));
        }
        // Bounds may already confine the value to [0, rhs).
        if let Some((lo, hi)) = self.bounds() {
            if lo >= 0 && hi < rhs {
                return self;
            }
        }
        // Reduce every coefficient and the intercept modulo rhs.
        let reduced_intercept = self.1.rem_euclid(rhs);
        self.0.retain_mut(|Term(c, _)| {
            *c = c.rem_euclid(rhs);
            *c != 0
        });
        if self.0.is_empty() {
            AffineForm::constant(reduced_intercept)
        } else {
            self.1 = reduced_intercept;
            IndexAtom::Mod(Box::new(self), rhs).into()
        }
    }
}

impl<T: Bounds> IndexExpr<T> {
    /// Ceiling division by a constant divisor.
    pub fn ceil_div(mut self, rhs: i64) -> Self {
        debug_assert_ne!(rhs, 0);
        if rhs == 1 {
            self
        } else if self.0.is_empty() {
            AffineForm::constant(ceil_div_i64(self.1, rhs))
        } else if self.div_through(rhs) {
            // Exactly divisible, so ceiling and floor agree.
            self
        } else {
            IndexAtom::CeilDiv(Box::new(self), rhs).into()
        }
    }

    /// Divide all coefficients and the intercept by `rhs` if all are
    /// divisible. Returns `true` if so.
    fn div_through(&mut self, rhs: i64) -> bool {
        if self.1 % rhs == 0 && self.0.iter().all(|Term(c, _)| c % rhs == 0) {
            self.0.iter_mut().for_each(|Term(c, _)| *c /= rhs);
            self.1 /= rhs;
            true
        } else {
            false
        }
    }

    /// Whether, dividing by `rhs`, the implied remainder provably lies in
    /// [0, rhs), making the term-wise quotient exact.
    fn remainder_stays_within(&self, rhs: i64) -> bool {
        if self.1 < 0 || self.0.iter().any(|Term(c, _)| *c < 0) {
            return false;
        }
        let base = self.1 % rhs;
        let mut lo = base;
        let mut hi = base;
        for Term(c, s) in &self.0 {
            let r = c % rhs;
            if r == 0 {
                continue;
            }
            let Some((smin, smax)) = s.bounds() else {
                return false;
            };
            lo += r * smin;
            hi += r * smax;
        }
        lo >= 0 && hi < rhs
    }
}

impl<T> Default for AffineForm<T> {
    fn default() -> Self {
        AffineForm::zero()
    }
}

impl<T> Default for IndexAtom<T> {
    fn default() -> Self {
        IndexAtom::Constant(0)
    }
}

impl<T: Display> Display for AffineForm<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some((first, rest)) = self.0.split_first() else {
            return write!(f, "{}", self.1);
        };
        write_term(f, first)?;
        for t in rest {
            write!(f, " + ")?;
            write_term(f, t)?;
        }
        if self.1 != 0 {
            write!(f, " + {}", self.1)?;
        }
        Ok(())
    }
}

impl<T: Display> Display for IndexAtom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexAtom::Constant(v) => write!(f, "{v}"),
            IndexAtom::Leaf(v) => write!(f, "{v}"),
            IndexAtom::FloorDiv(v, d) => write!(f, "({v}) / {d}"),
            IndexAtom::CeilDiv(v, d) => write!(f, "({v}) /^ {d}"),
            IndexAtom::Mod(v, m) => write!(f, "({v}) % {m}"),
        }
    }
}

fn write_term<T: Display>(f: &mut std::fmt::Formatter<'_>, t: &Term<T>) -> std::fmt::Result {
    if t.0 == 1 {
        write!(f, "({})", t.1)
    } else {
        write!(f, "{}({})", t.0, t.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Eq, Debug)]
    struct Ranged(&'static str, i64, i64);
    impl Bounds for Ranged {
        fn bounds(&self) -> Option<(i64, i64)> {
            Some((self.1, self.2))
        }
    }
    impl Atom for Ranged {}

    #[test]
    fn test_add_merges_terms_and_drops_zeros() {
        let mut e = AffineForm(vec![Term(3, "x")], 2);
        e += AffineForm(vec![Term(-3, "x"), Term(1, "y")], 1);
        assert_eq!(e, AffineForm(vec![Term(1, "y")], 3));
    }

    #[test]
    fn test_neg_then_sub() {
        let a = AffineForm(vec![Term(2, "x")], 1);
        let b = AffineForm(vec![Term(2, "x")], 1);
        assert_eq!(a - b, AffineForm::constant(0));
    }

    #[test]
    fn test_subs_flattens_replacement() {
        let e = AffineForm(vec![Term(2, String::from("x")), Term(4, String::from("y"))], 1);
        let replacement =
            AffineForm(vec![Term(1, String::from("y")), Term(2, String::from("z"))], 1);
        let expected = AffineForm(
            vec![
                Term(2, String::from("x")),
                Term(4, String::from("y")),
                Term(8, String::from("z")),
            ],
            5,
        );
        assert_eq!(e.subs(&String::from("y"), &replacement), expected);
    }

    #[test]
    fn test_constant_division_folds() {
        let e: IndexExpr<&str> = AffineForm::constant(7);
        assert_eq!(e.clone() / 2, AffineForm::constant(3));
        assert_eq!(e.ceil_div(2), AffineForm::constant(4));
    }

    #[test]
    fn test_floor_div_negative_constant() {
        let e: IndexExpr<&str> = AffineForm::constant(-7);
        assert_eq!(e / 2, AffineForm::constant(-4));
    }

    #[test]
    fn test_div_through_all_divisible() {
        let e: IndexExpr<&str> = AffineForm(
            vec![Term(16, IndexAtom::Leaf("x")), Term(32, IndexAtom::Leaf("y"))],
            48,
        );
        let expected: IndexExpr<&str> = AffineForm(
            vec![Term(1, IndexAtom::Leaf("x")), Term(2, IndexAtom::Leaf("y"))],
            3,
        );
        assert_eq!(e / 16, expected);
    }

    #[test]
    fn test_div_wraps_when_not_divisible() {
        let e: IndexExpr<&str> =
            AffineForm(vec![Term(16, IndexAtom::Leaf("x")), Term(18, IndexAtom::Leaf("y"))], 4);
        let got = e.clone() / 4;
        let expected: IndexExpr<&str> = IndexAtom::FloorDiv(Box::new(e), 4).into();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_bounds_make_division_exact() {
        // (x + 16*y) / 16 where x in [0, 15]  =>  y
        let x = Ranged("x", 0, 15);
        let y = Ranged("y", 0, 100);
        let e: IndexExpr<Ranged> = AffineForm(
            vec![
                Term(1, IndexAtom::Leaf(x)),
                Term(16, IndexAtom::Leaf(y.clone())),
            ],
            0,
        );
        assert_eq!(e / 16, AffineForm(vec![Term(1, IndexAtom::Leaf(y))], 0));
    }

    #[test]
    fn test_mod_reduces_coefficients() {
        // (5*x + 11) % 5 == 1
        let e: IndexExpr<&str> = AffineForm(vec![Term(5, IndexAtom::Leaf("x"))], 11);
        assert_eq!(e % 5, AffineForm::constant(1));
    }

    #[test]
    fn test_mod_within_bounds_is_identity() {
        let x = Ranged("x", 0, 5);
        let e: IndexExpr<Ranged> = AffineForm(vec![Term(1, IndexAtom::Leaf(x))], 2);
        assert_eq!(e.clone() % 8, e);
    }

    #[test]
    fn test_substitute_through_floor_div() {
        // (x / 16) with x := 16*y  =>  y
        let e: IndexExpr<&str> = AffineForm(
            vec![Term(
                1,
                IndexAtom::FloorDiv(Box::new(IndexExpr::from("x")), 16),
            )],
            0,
        );
        let got = e.subs(&"x", &AffineForm(vec![Term(16, IndexAtom::Leaf("y"))], 0));
        assert_eq!(got, AffineForm(vec![Term(1, IndexAtom::Leaf("y"))], 0));
    }

    #[test]
    fn test_substitute_through_ceil_div() {
        // ceil(x / 8) with x := 24  =>  3; with x := 25  =>  4
        let e: IndexExpr<&str> = AffineForm(
            vec![Term(1, IndexAtom::CeilDiv(Box::new(IndexExpr::from("x")), 8))],
            0,
        );
        assert_eq!(
            e.clone().subs(&"x", &AffineForm::constant(24)),
            AffineForm::constant(3)
        );
        assert_eq!(e.subs(&"x", &AffineForm::constant(25)), AffineForm::constant(4));
    }

    #[test]
    fn test_affine_form_bounds_mixed_signs() {
        let e = AffineForm(
            vec![
                Term(1, Ranged("a", 0, 10)),
                Term(-2, Ranged("b", -5, 10)),
            ],
            1,
        );
        assert_eq!(e.bounds(), Some((-19, 21)));
    }
}
