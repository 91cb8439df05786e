//! The address and architecture value types shared by every other module.

use std::fmt;
use std::ops::{Add, Sub};

use failure::Fail;

/// Supported CPU architectures. Only x86 is implemented; the type exists
/// so that arch mismatches are a typed error rather than a magic string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
}

/// Supported address widths for `Arch::X86`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    M32,
    M64,
}

impl Mode {
    /// Width, in bytes, of a pointer in this mode.
    pub fn pointer_width(self) -> usize {
        match self {
            Mode::M32 => 4,
            Mode::M64 => 8,
        }
    }
}

#[derive(Debug, Fail)]
pub enum ArchError {
    #[fail(display = "invalid arch provided")]
    InvalidArch,
    #[fail(display = "invalid mode provided")]
    InvalidMode,
}

/// A 64-bit absolute address within a workspace's virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VA(pub u64);

/// A 64-bit offset relative to a module's base address.
///
/// RVAs are always stored and transmitted as 32-bit quantities on disk
/// (see `AddressSpace::mem_read_rva`), even when the in-memory address
/// width is 64 bits; this type widens them for convenient arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RVA(pub u64);

impl RVA {
    /// `rva.to_va(base) == base + rva`
    pub fn to_va(self, base: VA) -> VA {
        VA(base.0 + self.0)
    }
}

impl VA {
    /// The inverse of `RVA::to_va`; `None` if `self` is below `base`.
    pub fn to_rva(self, base: VA) -> Option<RVA> {
        if self < base {
            None
        } else {
            Some(RVA(self.0 - base.0))
        }
    }
}

impl fmt::Display for VA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for RVA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl From<u64> for VA {
    fn from(v: u64) -> VA {
        VA(v)
    }
}

impl From<u64> for RVA {
    fn from(v: u64) -> RVA {
        RVA(v)
    }
}

impl From<u32> for RVA {
    fn from(v: u32) -> RVA {
        RVA(v as u64)
    }
}

impl Add<u64> for VA {
    type Output = VA;
    fn add(self, rhs: u64) -> VA {
        VA(self.0 + rhs)
    }
}

impl Add<usize> for VA {
    type Output = VA;
    fn add(self, rhs: usize) -> VA {
        VA(self.0 + rhs as u64)
    }
}

impl Sub<VA> for VA {
    type Output = u64;
    fn sub(self, rhs: VA) -> u64 {
        self.0 - rhs.0
    }
}

impl Add<u64> for RVA {
    type Output = RVA;
    fn add(self, rhs: u64) -> RVA {
        RVA(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rva_to_va_roundtrip() {
        let base = VA(0x4000_0000);
        let rva = RVA(0x1234);
        let va = rva.to_va(base);
        assert_eq!(va, VA(0x4000_1234));
        assert_eq!(va.to_rva(base), Some(rva));
    }

    #[test]
    fn rva_below_base_has_no_rva() {
        let base = VA(0x4000_0000);
        let va = VA(0x1000);
        assert_eq!(va.to_rva(base), None);
    }
}
