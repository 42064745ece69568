//! Condition flags held in the flags register (`r4`).
//!
//! Arithmetic only ever computes Zero, Sign and Parity. Carry and Overflow have
//! reserved bits but nothing sets them, so `JGT` reduces to "zero set or sign
//! clear" and `JLT` to "sign set" unless a program writes `r4` itself (through
//! `MOV r4, ..` or `POPF`).

/// Result was zero.
pub const FLAG_ZERO: i32 = 1 << 0;
/// Result was negative.
pub const FLAG_SIGN: i32 = 1 << 1;
/// Result had an even number of set bits.
pub const FLAG_PARITY: i32 = 1 << 2;
/// Reserved, never computed.
pub const FLAG_CARRY: i32 = 1 << 3;
/// Reserved, never computed.
pub const FLAG_OVERFLOW: i32 = 1 << 4;

/// A view over the raw flags register value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub i32);

impl Flags {
    pub const fn bits(&self) -> i32 {
        self.0
    }

    const fn is_set(&self, flag: i32) -> bool {
        self.0 & flag != 0
    }

    pub const fn zero(&self) -> bool {
        self.is_set(FLAG_ZERO)
    }

    pub const fn sign(&self) -> bool {
        self.is_set(FLAG_SIGN)
    }

    pub const fn parity(&self) -> bool {
        self.is_set(FLAG_PARITY)
    }

    pub const fn carry(&self) -> bool {
        self.is_set(FLAG_CARRY)
    }

    pub const fn overflow(&self) -> bool {
        self.is_set(FLAG_OVERFLOW)
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}{}",
            letter(self.overflow(), 'O'),
            letter(self.carry(), 'C'),
            letter(self.parity(), 'P'),
            letter(self.sign(), 'S'),
            letter(self.zero(), 'Z'),
        )
    }
}

/// Computes Zero, Sign and Parity for an arithmetic result.
pub const fn compute_flags(value: i32) -> Flags {
    let mut bits = 0;
    if value == 0 {
        bits |= FLAG_ZERO;
    }
    if value < 0 {
        bits |= FLAG_SIGN;
    }
    if value.count_ones() % 2 == 0 {
        bits |= FLAG_PARITY;
    }
    Flags(bits)
}
