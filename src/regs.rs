//! Register access
//!
//! The clock engine never dereferences a register address itself. Every
//! backend talks to the hardware through [`RegisterAccess`], which is
//! implemented by [`Mmio`] for the real memory-mapped peripherals and by a
//! simulated register file in the unit tests.

/// Access width of a register.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    /// 8-bit register
    U8,
    /// 16-bit register
    U16,
    /// 32-bit register
    U32,
}

impl Width {
    const fn mask(self) -> u32 {
        match self {
            Width::U8 => 0xff,
            Width::U16 => 0xffff,
            Width::U32 => 0xffff_ffff,
        }
    }
}

/// A register at an absolute address.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg {
    /// Absolute address
    pub addr: u32,
    /// Access width
    pub width: Width,
}

impl Reg {
    /// 8-bit register at `addr`
    pub const fn u8(addr: u32) -> Self {
        Self { addr, width: Width::U8 }
    }

    /// 16-bit register at `addr`
    pub const fn u16(addr: u32) -> Self {
        Self { addr, width: Width::U16 }
    }

    /// 32-bit register at `addr`
    pub const fn u32(addr: u32) -> Self {
        Self { addr, width: Width::U32 }
    }

    /// Same width, `by` bytes further. Used for register arrays.
    pub const fn offset(self, by: u32) -> Self {
        Self {
            addr: self.addr + by,
            width: self.width,
        }
    }
}

/// Minimal register-access capability.
pub trait RegisterAccess {
    /// Read the register. Values narrower than 32 bits are zero-extended.
    fn read(&self, reg: Reg) -> u32;

    /// Write the register. Bits above the register width are dropped.
    fn write(&mut self, reg: Reg, value: u32);

    /// Read-modify-write.
    fn modify(&mut self, reg: Reg, f: impl FnOnce(u32) -> u32) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }

    /// Returns `true` if every bit of `mask` is set.
    fn is_set(&self, reg: Reg, mask: u32) -> bool {
        self.read(reg) & mask == mask
    }
}

impl<R: RegisterAccess + ?Sized> RegisterAccess for &mut R {
    fn read(&self, reg: Reg) -> u32 {
        (**self).read(reg)
    }

    fn write(&mut self, reg: Reg, value: u32) {
        (**self).write(reg, value)
    }
}

/// Volatile access to the memory-mapped peripherals.
#[derive(Debug)]
pub struct Mmio {
    _private: (),
}

impl Mmio {
    /// Create the accessor.
    ///
    /// # Safety
    ///
    /// Only one `Mmio` may drive the clock registers at a time, and only on a
    /// device whose memory map matches the backend it is handed to.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl RegisterAccess for Mmio {
    fn read(&self, reg: Reg) -> u32 {
        let addr = reg.addr as usize;
        // SAFETY: the backends only name registers of their own memory map,
        // see `Mmio::new`.
        unsafe {
            match reg.width {
                Width::U8 => core::ptr::read_volatile(addr as *const u8) as u32,
                Width::U16 => core::ptr::read_volatile(addr as *const u16) as u32,
                Width::U32 => core::ptr::read_volatile(addr as *const u32),
            }
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        let addr = reg.addr as usize;
        // SAFETY: see `read`
        unsafe {
            match reg.width {
                Width::U8 => core::ptr::write_volatile(addr as *mut u8, value as u8),
                Width::U16 => core::ptr::write_volatile(addr as *mut u16, value as u16),
                Width::U32 => core::ptr::write_volatile(addr as *mut u32, value),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod sim {
    //! Simulated register file.
    //!
    //! Stored values behave like plain memory. Status bits that hardware would
    //! drive are modelled as rules forcing bits high or low on read, optionally
    //! only while another register holds a given value.

    use std::collections::BTreeMap;
    use std::vec::Vec;

    use super::{Reg, RegisterAccess};

    #[derive(Clone, Copy, Debug)]
    struct Rule {
        addr: u32,
        mask: u32,
        high: bool,
        when: Option<(u32, u32, u32)>,
    }

    #[derive(Debug, Default)]
    pub(crate) struct SimRegisters {
        values: BTreeMap<u32, u32>,
        rules: Vec<Rule>,
        writes: Vec<(u32, u32)>,
    }

    impl SimRegisters {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Set a stored value without recording a write.
        pub(crate) fn preset(&mut self, reg: Reg, value: u32) {
            self.values.insert(reg.addr, value & reg.width.mask());
        }

        pub(crate) fn force_high(&mut self, reg: Reg, mask: u32) {
            self.rules.push(Rule {
                addr: reg.addr,
                mask,
                high: true,
                when: None,
            });
        }

        pub(crate) fn force_low(&mut self, reg: Reg, mask: u32) {
            self.rules.push(Rule {
                addr: reg.addr,
                mask,
                high: false,
                when: None,
            });
        }

        /// Force `mask` high in `reg` only while `(cond & cond_mask) == cond_value`.
        pub(crate) fn force_high_when(&mut self, reg: Reg, mask: u32, cond: Reg, cond_mask: u32, cond_value: u32) {
            self.rules.push(Rule {
                addr: reg.addr,
                mask,
                high: true,
                when: Some((cond.addr, cond_mask, cond_value)),
            });
        }

        /// Drop every rule touching `reg`.
        pub(crate) fn release(&mut self, reg: Reg) {
            self.rules.retain(|rule| rule.addr != reg.addr);
        }

        /// Stored value, ignoring rules.
        pub(crate) fn stored(&self, reg: Reg) -> u32 {
            self.values.get(&reg.addr).copied().unwrap_or(0)
        }

        /// Every value written to `reg`, oldest first.
        pub(crate) fn writes_to(&self, reg: Reg) -> Vec<u32> {
            self.writes
                .iter()
                .filter(|(addr, _)| *addr == reg.addr)
                .map(|(_, value)| *value)
                .collect()
        }

        /// Position of the first write to `reg` in the write log.
        pub(crate) fn first_write(&self, reg: Reg) -> Option<usize> {
            self.writes.iter().position(|(addr, _)| *addr == reg.addr)
        }

        /// Position of the last write to `reg` in the write log.
        pub(crate) fn last_write(&self, reg: Reg) -> Option<usize> {
            self.writes.iter().rposition(|(addr, _)| *addr == reg.addr)
        }

        /// Positions of every write to `reg` in the write log.
        pub(crate) fn write_positions(&self, reg: Reg) -> Vec<usize> {
            self.writes
                .iter()
                .enumerate()
                .filter(|(_, (addr, _))| *addr == reg.addr)
                .map(|(i, _)| i)
                .collect()
        }

        pub(crate) fn write_count(&self) -> usize {
            self.writes.len()
        }
    }

    impl RegisterAccess for SimRegisters {
        fn read(&self, reg: Reg) -> u32 {
            let mut value = self.stored(reg);
            for rule in self.rules.iter().filter(|rule| rule.addr == reg.addr) {
                let active = match rule.when {
                    None => true,
                    Some((addr, mask, expected)) => {
                        self.values.get(&addr).copied().unwrap_or(0) & mask == expected
                    }
                };
                if active {
                    if rule.high {
                        value |= rule.mask;
                    } else {
                        value &= !rule.mask;
                    }
                }
            }
            value & reg.width.mask()
        }

        fn write(&mut self, reg: Reg, value: u32) {
            let value = value & reg.width.mask();
            self.values.insert(reg.addr, value);
            self.writes.push((reg.addr, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimRegisters;
    use super::*;

    const STATUS: Reg = Reg::u8(0x4000_0001);
    const CTRL: Reg = Reg::u16(0x4000_0002);

    #[test]
    fn writes_are_truncated_to_width() {
        let mut regs = SimRegisters::new();
        regs.write(CTRL, 0x1234_5678);
        assert_eq!(regs.read(CTRL), 0x5678);
    }

    #[test]
    fn modify_preserves_other_bits() {
        let mut regs = SimRegisters::new();
        regs.write(CTRL, 0x00f0);
        regs.modify(CTRL, |v| v | 0x1);
        assert_eq!(regs.read(CTRL), 0x00f1);
        assert_eq!(regs.writes_to(CTRL), [0x00f0, 0x00f1]);
    }

    #[test]
    fn conditional_rule_follows_other_register() {
        let mut regs = SimRegisters::new();
        regs.force_high_when(STATUS, 0x80, CTRL, 0xff, 0x42);
        assert!(!regs.is_set(STATUS, 0x80));
        regs.write(CTRL, 0x42);
        assert!(regs.is_set(STATUS, 0x80));
        regs.write(CTRL, 0x43);
        assert!(!regs.is_set(STATUS, 0x80));
    }

    #[test]
    fn forced_low_wins_over_stored_value() {
        let mut regs = SimRegisters::new();
        regs.write(STATUS, 0xff);
        regs.force_low(STATUS, 0x01);
        assert_eq!(regs.read(STATUS), 0xfe);
        regs.release(STATUS);
        assert_eq!(regs.read(STATUS), 0xff);
    }

    #[test]
    fn offset_keeps_width() {
        let base = Reg::u32(0x4000_1c20);
        assert_eq!(base.offset(8), Reg::u32(0x4000_1c28));
    }
}
