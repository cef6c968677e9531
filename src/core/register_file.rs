//! Physical register bookkeeping.
//!
//! This module implements the RegisterFile that records which variable occupies which
//! physical register, per register class. Allocation policy lives in the compilation
//! context; the register file only answers "who is where" and "what is free".

use super::variable::VarId;

/// Maximum number of registers per class.
pub const MAX_REGISTERS_PER_CLASS: usize = 16;

/// Number of register classes.
pub const NUM_REG_CLASSES: usize = 3;

/// Physical register class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// General purpose 64-bit registers.
    Gp = 0,
    /// MMX registers.
    Mm = 1,
    /// SSE registers.
    Xmm = 2,
}

impl RegClass {
    pub const ALL: [RegClass; NUM_REG_CLASSES] = [RegClass::Gp, RegClass::Mm, RegClass::Xmm];

    /// Number of physical registers in this class.
    pub const fn count(self) -> u8 {
        match self {
            RegClass::Gp => 16,
            RegClass::Mm => 8,
            RegClass::Xmm => 16,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub class: RegClass,
    pub index: u8,
}

impl Reg {
    pub const fn new(class: RegClass, index: u8) -> Self {
        Self { class, index }
    }

    pub const fn gp(index: u8) -> Self {
        Self::new(RegClass::Gp, index)
    }

    pub const fn mm(index: u8) -> Self {
        Self::new(RegClass::Mm, index)
    }

    pub const fn xmm(index: u8) -> Self {
        Self::new(RegClass::Xmm, index)
    }
}

/// General purpose register indices in hardware encoding order.
pub mod gp {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
    pub const R8: u8 = 8;
    pub const R9: u8 = 9;
    pub const R10: u8 = 10;
    pub const R11: u8 = 11;
    pub const R12: u8 = 12;
    pub const R13: u8 = 13;
    pub const R14: u8 = 14;
    pub const R15: u8 = 15;
}

/// Bit set of register indices within one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegMask(pub u32);

impl RegMask {
    pub const EMPTY: RegMask = RegMask(0);

    pub const fn single(index: u8) -> Self {
        RegMask(1 << index)
    }

    /// Mask with the first `count` registers set.
    pub const fn all(count: u8) -> Self {
        RegMask((1u32 << count) - 1)
    }

    pub const fn contains(self, index: u8) -> bool {
        self.0 & (1 << index) != 0
    }

    pub fn insert(&mut self, index: u8) {
        self.0 |= 1 << index;
    }

    pub fn remove(&mut self, index: u8) {
        self.0 &= !(1 << index);
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over set register indices, lowest first.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..32u8).filter(move |&i| self.0 & (1 << i) != 0)
    }
}

impl std::ops::BitAnd for RegMask {
    type Output = RegMask;
    fn bitand(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for RegMask {
    type Output = RegMask;
    fn bitor(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for RegMask {
    fn bitor_assign(&mut self, rhs: RegMask) {
        self.0 |= rhs.0;
    }
}

impl std::ops::Not for RegMask {
    type Output = RegMask;
    fn not(self) -> RegMask {
        RegMask(!self.0)
    }
}

/// Occupancy table indexed by class and register index.
pub type Occupants = [[Option<VarId>; MAX_REGISTERS_PER_CLASS]; NUM_REG_CLASSES];

/// Current occupancy of all physical registers.
///
/// The `used` masks mirror `occupants`; both are only updated through
/// [`RegisterFile::assign`] and [`RegisterFile::release`].
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    occupants: Occupants,
    used: [RegMask; NUM_REG_CLASSES],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupant(&self, reg: Reg) -> Option<VarId> {
        self.occupants[reg.class.index()][reg.index as usize]
    }

    pub fn is_free(&self, reg: Reg) -> bool {
        !self.used[reg.class.index()].contains(reg.index)
    }

    pub fn used(&self, class: RegClass) -> RegMask {
        self.used[class.index()]
    }

    pub fn occupants(&self) -> &Occupants {
        &self.occupants
    }

    /// Bind `var` to `reg`. The register must be free or already hold `var`.
    pub fn assign(&mut self, reg: Reg, var: VarId) {
        self.occupants[reg.class.index()][reg.index as usize] = Some(var);
        self.used[reg.class.index()].insert(reg.index);
    }

    /// Free `reg` and return its previous occupant.
    pub fn release(&mut self, reg: Reg) -> Option<VarId> {
        self.used[reg.class.index()].remove(reg.index);
        self.occupants[reg.class.index()][reg.index as usize].take()
    }

    /// Replace the whole table, recomputing the used masks.
    pub fn load(&mut self, occupants: &Occupants) {
        self.occupants = *occupants;
        for class in RegClass::ALL {
            let mut mask = RegMask::EMPTY;
            for (i, slot) in self.occupants[class.index()].iter().enumerate() {
                if slot.is_some() {
                    mask.insert(i as u8);
                }
            }
            self.used[class.index()] = mask;
        }
    }

    /// Number of occupied registers in `class`.
    pub fn occupied_count(&self, class: RegClass) -> u32 {
        self.used[class.index()].count()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_operations() {
        let mut mask = RegMask::EMPTY;
        mask.insert(gp::RAX);
        mask.insert(gp::R12);
        assert!(mask.contains(gp::RAX));
        assert!(!mask.contains(gp::RCX));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 12]);

        mask.remove(gp::RAX);
        assert_eq!(mask, RegMask::single(gp::R12));
        assert_eq!(RegMask::all(8).count(), 8);
        assert_eq!((RegMask::all(4) & !RegMask::single(gp::RSP)).count(), 4);
        assert_eq!((RegMask::all(5) & !RegMask::single(gp::RSP)).count(), 4);
    }

    #[test]
    fn test_assign_and_release() {
        let mut file = RegisterFile::new();
        let rbx = Reg::gp(gp::RBX);
        let xmm3 = Reg::xmm(3);

        file.assign(rbx, VarId(1));
        file.assign(xmm3, VarId(2));
        assert_eq!(file.occupant(rbx), Some(VarId(1)));
        assert!(!file.is_free(rbx));
        assert!(file.is_free(Reg::mm(3)));
        assert_eq!(file.occupied_count(RegClass::Gp), 1);

        assert_eq!(file.release(rbx), Some(VarId(1)));
        assert!(file.is_free(rbx));
        assert_eq!(file.used(RegClass::Xmm), RegMask::single(3));
    }

    #[test]
    fn test_load_recomputes_masks() {
        let mut occupants: Occupants = Default::default();
        occupants[RegClass::Gp.index()][gp::RSI as usize] = Some(VarId(4));
        occupants[RegClass::Mm.index()][0] = Some(VarId(5));

        let mut file = RegisterFile::new();
        file.load(&occupants);
        assert_eq!(file.used(RegClass::Gp), RegMask::single(gp::RSI));
        assert_eq!(file.used(RegClass::Mm), RegMask::single(0));
        assert_eq!(file.used(RegClass::Xmm), RegMask::EMPTY);
    }
}
