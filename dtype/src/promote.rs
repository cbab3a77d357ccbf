//! Type promotion.
//!
//! The lattice mirrors the common tensor-framework rule set: Bool promotes to
//! the integers, integers promote to the reduced-precision floats, floats
//! widen, and the complex chain runs in parallel. Mixing an integral type with
//! a floating-point type yields the float of the wider precision.

use enumset::EnumSet;

use crate::{DType, Error, Result};

impl DType {
    /// Direct promotion parents.
    const fn promotion_parents(self) -> &'static [Self] {
        use DType::*;
        match self {
            Bool => &[Int32],
            Int32 => &[Int64],
            Int64 => &[Half, BFloat16],
            Half => &[Float],
            BFloat16 => &[Float],
            Float => &[Double, ComplexFloat],
            Double => &[ComplexDouble],
            ComplexFloat => &[ComplexDouble],
            // Unsigned types sit outside the lattice: they participate only
            // through an explicit bit-cast roundtrip. Index is resolved
            // separately in `promote`.
            ComplexDouble | UInt32 | UInt64 | Index => &[],
        }
    }

    /// The type together with everything it can promote to.
    fn promotion_ancestors(self) -> EnumSet<Self> {
        self.promotion_parents()
            .iter()
            .fold(EnumSet::only(self), |acc, &parent| acc | parent.promotion_ancestors())
    }
}

/// Promote two scalar types to their least common type.
///
/// Commutative. Fails with [`Error::UnsignedNeedsBitCast`] when an unsigned
/// type is mixed with any other type, and [`Error::NoCommonType`] when the
/// lattice has no common ancestor.
pub fn promote(lhs: DType, rhs: DType) -> Result<DType> {
    if lhs == rhs {
        return Ok(lhs);
    }

    for dtype in [lhs, rhs] {
        if dtype.is_unsigned() {
            return Err(Error::UnsignedNeedsBitCast { dtype });
        }
    }

    // Index behaves as the widest integer: it absorbs integrals and booleans
    // and defers to floating point and complex.
    match (lhs, rhs) {
        (DType::Index, other) | (other, DType::Index) => {
            return if other.is_floating_point() || other.is_complex() { Ok(other) } else { Ok(DType::Index) };
        }
        _ => {}
    }

    let common = lhs.promotion_ancestors() & rhs.promotion_ancestors();
    // EnumSet iterates in declaration order, which is topological for the
    // lattice, so the first common ancestor is the least one.
    common.iter().next().ok_or(Error::NoCommonType { lhs, rhs })
}

/// Promote a non-empty list of types left to right.
pub fn promote_all(dtypes: &[DType]) -> Result<DType> {
    let (&first, rest) = dtypes.split_first().ok_or(Error::EmptyPromotion)?;
    rest.iter().try_fold(first, |acc, &next| promote(acc, next))
}
