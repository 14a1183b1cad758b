//! Target values: constants of a fixed mode.

use crate::ir::Mode;
use std::fmt::{self, Display};

/// A constant value of a particular [`Mode`][crate::ir::Mode].
///
/// Integer and reference values are stored as their two's complement bit
/// pattern, truncated to the mode's width. Float values are stored as the
/// IEEE bit pattern of an `f32` or `f64`; they are carried around but never
/// folded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tarval {
    mode: Mode,
    bits: u128,
}

fn mask(width: u16) -> u128 {
    if width >= 128 {
        !0
    } else {
        (1u128 << width) - 1
    }
}

impl Tarval {
    /// Create a value of `mode` from raw bits, truncating to the mode width.
    pub fn from_bits(mode: Mode, bits: u128) -> Self {
        let bits = if mode.is_float() {
            bits
        } else {
            bits & mask(mode.bits())
        };
        Tarval { mode, bits }
    }

    /// Create a value of `mode` from an integer.
    ///
    /// Float modes convert the integer to the nearest float.
    pub fn from_i128(mode: Mode, value: i128) -> Self {
        match mode {
            Mode::Float { bits: 32 } => Tarval::from_bits(mode, (value as f32).to_bits() as u128),
            Mode::Float { .. } => Tarval::from_bits(mode, (value as f64).to_bits() as u128),
            _ => Tarval::from_bits(mode, value as u128),
        }
    }

    /// Create a float value of `mode`.
    ///
    /// # Panics
    ///
    /// Panics if `mode` is not a float mode.
    pub fn from_f64(mode: Mode, value: f64) -> Self {
        match mode {
            Mode::Float { bits: 32 } => Tarval::from_bits(mode, (value as f32).to_bits() as u128),
            Mode::Float { .. } => Tarval::from_bits(mode, value.to_bits() as u128),
            _ => panic!("float constant of non-float mode {}", mode),
        }
    }

    /// The all-zero value of `mode`.
    pub fn null(mode: Mode) -> Self {
        Tarval { mode, bits: 0 }
    }

    /// The all-ones value of `mode`.
    pub fn all_one(mode: Mode) -> Self {
        Tarval::from_bits(mode, !0)
    }

    /// The mode of this value.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The raw bits of this value.
    pub fn bits(&self) -> u128 {
        self.bits
    }

    /// Is this the all-zero value?
    pub fn is_null(&self) -> bool {
        self.bits == 0
    }

    /// Is this the all-ones value of an integer or reference mode?
    pub fn is_all_one(&self) -> bool {
        !self.mode.is_float() && self.bits == mask(self.mode.bits())
    }

    /// Is this the value one?
    pub fn is_one(&self) -> bool {
        !self.mode.is_float() && self.bits == 1
    }

    /// Interpret the bits as a signed integer of the mode's width.
    pub fn as_i128(&self) -> i128 {
        let width = self.mode.bits();
        if width >= 128 {
            return self.bits as i128;
        }
        let shift = 128 - u32::from(width);
        ((self.bits << shift) as i128) >> shift
    }

    /// Interpret the bits as a float.
    pub fn as_f64(&self) -> f64 {
        match self.mode {
            Mode::Float { bits: 32 } => f64::from(f32::from_bits(self.bits as u32)),
            _ => f64::from_bits(self.bits as u64),
        }
    }

    fn binary(self, other: Tarval, f: impl FnOnce(u128, u128) -> u128) -> Tarval {
        debug_assert!(!self.mode.is_float());
        Tarval::from_bits(self.mode, f(self.bits, other.bits))
    }

    /// Wrapping addition.
    pub fn add(self, other: Tarval) -> Tarval {
        self.binary(other, u128::wrapping_add)
    }

    /// Wrapping subtraction.
    pub fn sub(self, other: Tarval) -> Tarval {
        self.binary(other, u128::wrapping_sub)
    }

    /// Wrapping multiplication.
    pub fn mul(self, other: Tarval) -> Tarval {
        self.binary(other, u128::wrapping_mul)
    }

    /// Bit-wise and.
    pub fn and(self, other: Tarval) -> Tarval {
        self.binary(other, |a, b| a & b)
    }

    /// Bit-wise or.
    pub fn or(self, other: Tarval) -> Tarval {
        self.binary(other, |a, b| a | b)
    }

    /// Bit-wise exclusive or.
    pub fn eor(self, other: Tarval) -> Tarval {
        self.binary(other, |a, b| a ^ b)
    }

    /// Bit-wise complement.
    pub fn not(self) -> Tarval {
        Tarval::from_bits(self.mode, !self.bits)
    }

    /// Two's complement negation.
    pub fn neg(self) -> Tarval {
        Tarval::from_bits(self.mode, self.bits.wrapping_neg())
    }

    /// Shift left. Shifting by the width or more yields zero.
    pub fn shl(self, amount: Tarval) -> Tarval {
        let width = u128::from(self.mode.bits());
        if amount.bits >= width {
            return Tarval::null(self.mode);
        }
        Tarval::from_bits(self.mode, self.bits << amount.bits)
    }

    /// Logical shift right. Shifting by the width or more yields zero.
    pub fn shr(self, amount: Tarval) -> Tarval {
        let width = u128::from(self.mode.bits());
        if amount.bits >= width {
            return Tarval::null(self.mode);
        }
        Tarval::from_bits(self.mode, self.bits >> amount.bits)
    }

    /// Arithmetic shift right. Shifting by the width or more replicates the
    /// sign bit.
    pub fn shrs(self, amount: Tarval) -> Tarval {
        let width = u128::from(self.mode.bits());
        let amount = amount.bits.min(width - 1) as u32;
        Tarval::from_bits(self.mode, (self.as_i128() >> amount) as u128)
    }

    /// Convert to another integer or reference mode.
    ///
    /// Widening sign-extends when the source mode is signed and zero-extends
    /// otherwise; narrowing truncates.
    pub fn convert(self, mode: Mode) -> Tarval {
        debug_assert!(!self.mode.is_float() && !mode.is_float());
        if self.mode.is_signed() {
            Tarval::from_bits(mode, self.as_i128() as u128)
        } else {
            Tarval::from_bits(mode, self.bits)
        }
    }
}

impl Display for Tarval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.mode {
            Mode::Float { .. } => write!(f, "{:?}", self.as_f64()),
            Mode::Int { signed: true, .. } => write!(f, "{}", self.as_i128()),
            _ => write!(f, "{}", self.bits),
        }
    }
}
