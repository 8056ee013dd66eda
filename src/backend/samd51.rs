//! SAMD51 backend
//!
//! ```text
//!  XOSC32K ────────────────────────────┐ REFCLK = XOSC32
//!             ┌─────────┐  PCHCTRL[1]  ▼
//!  OSCULP32K─▶│GENCTRL1 │─────────▶┌───────┐           ┌──────────┐
//!             └─────────┘ REFCLK = │ FDPLL0│──────────▶│GENCTRL0  │ CPU
//!                          GCLK    │ LDR + │   DPLL0   │GENCTRL2  │ peripherals
//!                                  │LDRFRAC│  DFLL48M ▶│GENCTRL3  │ 8 MHz timers
//!                                  └───────┘           └──────────┘
//!
//!  GENCTRL1 ──▶ PCHCTRL[0] ──▶ DFLL48M closed loop (crystal reference only)
//! ```
//!
//! Unlike the SAMD21 every generator has its own register and its own
//! `SYNCBUSY.GENCTRLn` bit, and the DPLL has a separate `DPLLSYNCBUSY`.

use core::ops::RangeInclusive;

use super::{BusClock, BusMask, ClockBackend, MultiplierRequest, REFERENCE_GENERATOR};
use crate::clocks::generators::{Generator, GeneratorSource};
use crate::clocks::multiplier::MultiplierMode;
use crate::clocks::reference::{Calibration, ReferenceKind};
use crate::clocks::{ClockError, PollBudget};
use crate::regs::{Reg, RegisterAccess};

const OSC32KCTRL: u32 = 0x4000_1400;
pub(crate) const OSC32K_STATUS: Reg = Reg::u32(OSC32KCTRL + 0x0C);
pub(crate) const XOSC32K: Reg = Reg::u16(OSC32KCTRL + 0x14);
pub(crate) const CFDCTRL: Reg = Reg::u8(OSC32KCTRL + 0x16);
pub(crate) const OSCULP32K: Reg = Reg::u32(OSC32KCTRL + 0x1C);

pub(crate) const STATUS_XOSC32KRDY: u32 = 1 << 0;
const XOSC32K_ENABLE: u32 = 1 << 1;
const XOSC32K_XTALEN: u32 = 1 << 2;
const XOSC32K_EN32K: u32 = 1 << 3;
const XOSC32K_RUNSTDBY: u32 = 1 << 6;
const XOSC32K_STARTUP_POS: u32 = 8;
const XOSC32K_CGM_POS: u32 = 13;
const XOSC32K_CGM_HS: u32 = 0x2;
pub(crate) const CFDCTRL_CFDEN: u32 = 1 << 0;
const OSCULP32K_CALIB_POS: u32 = 8;
const OSCULP32K_CALIB_MASK: u32 = 0x3f << OSCULP32K_CALIB_POS;

const OSCCTRL: u32 = 0x4000_1000;
pub(crate) const OSCCTRL_STATUS: Reg = Reg::u32(OSCCTRL + 0x10);
pub(crate) const DFLLCTRLA: Reg = Reg::u8(OSCCTRL + 0x1C);
pub(crate) const DFLLCTRLB: Reg = Reg::u8(OSCCTRL + 0x20);
pub(crate) const DFLLVAL: Reg = Reg::u32(OSCCTRL + 0x24);
pub(crate) const DFLLMUL: Reg = Reg::u32(OSCCTRL + 0x28);
pub(crate) const DFLLSYNC: Reg = Reg::u8(OSCCTRL + 0x2C);
pub(crate) const DPLLCTRLA: Reg = Reg::u8(OSCCTRL + 0x30);
pub(crate) const DPLLRATIO: Reg = Reg::u32(OSCCTRL + 0x34);
pub(crate) const DPLLCTRLB: Reg = Reg::u32(OSCCTRL + 0x38);
pub(crate) const DPLLSYNCBUSY: Reg = Reg::u32(OSCCTRL + 0x3C);
pub(crate) const DPLLSTATUS: Reg = Reg::u32(OSCCTRL + 0x40);

const DFLLVAL_COARSE_POS: u32 = 10;
const DFLLVAL_FINE_MASK: u32 = 0xff;
pub(crate) const DFLLSYNC_ENABLE: u32 = 1 << 1;
pub(crate) const DFLLSYNC_DFLLCTRLB: u32 = 1 << 2;
pub(crate) const DFLLSYNC_DFLLVAL: u32 = 1 << 3;
pub(crate) const DFLLSYNC_DFLLMUL: u32 = 1 << 4;
pub(crate) const STATUS_DFLLLCKF: u32 = 1 << 10;
pub(crate) const DFLLCTRLA_ENABLE: u32 = 1 << 1;
pub(crate) const DFLLCTRLA_RUNSTDBY: u32 = 1 << 6;
pub(crate) const DFLLCTRLB_MODE: u32 = 1 << 0;
pub(crate) const DFLLCTRLB_BPLCKC: u32 = 1 << 6;
const DFLLMUL_FSTEP_POS: u32 = 16;
const DFLLMUL_CSTEP_POS: u32 = 26;
const DFLL_NOMINAL_HZ: u32 = 48_000_000;
// 48 MHz from the 32.768 kHz crystal, rounded
pub(crate) const DFLL_CLOSED_LOOP_MUL: u32 = (DFLL_NOMINAL_HZ + 16_384) / 32_768;

pub(crate) const DPLLCTRLA_ENABLE: u32 = 1 << 1;
const DPLLCTRLA_RUNSTDBY: u32 = 1 << 6;
pub(crate) const DPLLRATIO_LDR_MASK: u32 = 0x1fff;
pub(crate) const DPLLRATIO_LDRFRAC_POS: u32 = 16;
const DPLLCTRLB_FILTER_POS: u32 = 0;
const DPLLCTRLB_WUF: u32 = 1 << 4;
pub(crate) const DPLLCTRLB_REFCLK_POS: u32 = 5;
const DPLLCTRLB_LBYPASS: u32 = 1 << 11;
const DPLLCTRLB_DIV_POS: u32 = 16;
pub(crate) const REFCLK_GCLK: u32 = 0x0;
pub(crate) const REFCLK_XOSC32: u32 = 0x1;
pub(crate) const DPLLSYNCBUSY_ENABLE: u32 = 1 << 1;
pub(crate) const DPLLSYNCBUSY_DPLLRATIO: u32 = 1 << 2;
pub(crate) const DPLLSTATUS_LOCK: u32 = 1 << 0;
pub(crate) const DPLLSTATUS_CLKRDY: u32 = 1 << 1;

const GCLK: u32 = 0x4000_1C00;
pub(crate) const GCLK_SYNCBUSY: Reg = Reg::u32(GCLK + 0x04);
pub(crate) const GENCTRL0: Reg = Reg::u32(GCLK + 0x20);
pub(crate) const PCHCTRL0: Reg = Reg::u32(GCLK + 0x80);

const SYNCBUSY_GENCTRL_POS: u32 = 2;
const GENCTRL_SRC_MASK: u32 = 0x1f;
pub(crate) const GENCTRL_GENEN: u32 = 1 << 8;
const GENCTRL_IDC: u32 = 1 << 9;
const GENCTRL_RUNSTDBY: u32 = 1 << 13;
const GENCTRL_DIV_POS: u32 = 16;
pub(crate) const PCHCTRL_CHEN: u32 = 1 << 6;

const SRC_OSCULP32K: u32 = 0x04;
const SRC_XOSC32K: u32 = 0x05;
const SRC_DFLL: u32 = 0x06;
pub(crate) const SRC_DPLL0: u32 = 0x07;

pub(crate) const PCHCTRL_ID_DFLL48: u8 = 0;
pub(crate) const PCHCTRL_ID_FDPLL0: u8 = 1;

const MCLK: u32 = 0x4000_0800;
pub(crate) const MCLK_AHBMASK: Reg = Reg::u32(MCLK + 0x10);
pub(crate) const MCLK_APBAMASK: Reg = Reg::u32(MCLK + 0x14);
pub(crate) const MCLK_APBBMASK: Reg = Reg::u32(MCLK + 0x18);
pub(crate) const MCLK_APBCMASK: Reg = Reg::u32(MCLK + 0x1C);
pub(crate) const MCLK_APBDMASK: Reg = Reg::u32(MCLK + 0x20);

/// `GENCTRL[n]`
pub(crate) const fn genctrl(index: usize) -> Reg {
    GENCTRL0.offset(4 * index as u32)
}

/// `PCHCTRL[m]`
pub(crate) const fn pchctrl(channel: u8) -> Reg {
    PCHCTRL0.offset(4 * channel as u32)
}

/// SAMD51 clock registers.
#[derive(Debug)]
pub struct Samd51<R> {
    regs: R,
}

impl<R: RegisterAccess> Samd51<R> {
    /// Wrap a register accessor.
    pub fn new(regs: R) -> Self {
        Self { regs }
    }

    /// The register accessor.
    pub fn regs(&self) -> &R {
        &self.regs
    }

    /// Give back the register accessor.
    pub fn free(self) -> R {
        self.regs
    }

    fn wait_dpll_sync(&self, what: &'static str, mask: u32, budget: PollBudget) -> Result<(), ClockError> {
        budget.wait(what, || !self.regs.is_set(DPLLSYNCBUSY, mask))
    }

    fn dfll_closed_loop(&self) -> bool {
        self.regs.is_set(DFLLCTRLB, DFLLCTRLB_MODE)
    }

    fn wait_dfll_sync(&self, what: &'static str, mask: u32, budget: PollBudget) -> Result<(), ClockError> {
        budget.wait(what, || !self.regs.is_set(DFLLSYNC, mask))
    }

    /// Lock the DFLL onto the crystal through generator 1. The loop is
    /// opened again if it doesn't lock.
    fn close_dfll_loop(&mut self, budget: PollBudget) -> Result<(), ClockError> {
        self.write_channel(PCHCTRL_ID_DFLL48, REFERENCE_GENERATOR, true, budget)?;
        if let Err(err) = self.lock_dfll(budget) {
            warn!("DFLL did not lock onto the crystal, back to open loop");
            if self.open_dfll_loop(budget).is_err() {
                error!("DFLL left in closed loop");
            }
            return Err(err);
        }
        debug!("DFLL locked onto the crystal");
        Ok(())
    }

    fn lock_dfll(&mut self, budget: PollBudget) -> Result<(), ClockError> {
        self.regs.write(
            DFLLMUL,
            (1 << DFLLMUL_CSTEP_POS) | (1 << DFLLMUL_FSTEP_POS) | DFLL_CLOSED_LOOP_MUL,
        );
        self.wait_dfll_sync("DFLLSYNC.DFLLMUL", DFLLSYNC_DFLLMUL, budget)?;

        self.regs.write(DFLLCTRLB, DFLLCTRLB_MODE | DFLLCTRLB_BPLCKC);
        self.wait_dfll_sync("DFLLSYNC.DFLLCTRLB", DFLLSYNC_DFLLCTRLB, budget)?;

        // coarse lock is bypassed, only the fine lock matters
        budget.wait("DFLL fine lock", || self.regs.is_set(OSCCTRL_STATUS, STATUS_DFLLLCKF))?;

        self.regs.write(DFLLCTRLA, DFLLCTRLA_RUNSTDBY | DFLLCTRLA_ENABLE);
        self.wait_dfll_sync("DFLLSYNC.ENABLE", DFLLSYNC_ENABLE, budget)
    }

    /// Back to open loop at the trimmed 48 MHz, reference channel stopped.
    fn open_dfll_loop(&mut self, budget: PollBudget) -> Result<(), ClockError> {
        self.regs.write(DFLLCTRLB, 0);
        self.wait_dfll_sync("DFLLSYNC.DFLLCTRLB", DFLLSYNC_DFLLCTRLB, budget)?;
        self.write_channel(PCHCTRL_ID_DFLL48, REFERENCE_GENERATOR, false, budget)
    }

    fn trim_dfll(&mut self, trim: Calibration, budget: PollBudget) -> Result<(), ClockError> {
        self.regs.write(
            DFLLVAL,
            (u32::from(trim.coarse) << DFLLVAL_COARSE_POS) | (u32::from(trim.fine) & DFLLVAL_FINE_MASK),
        );
        self.wait_dfll_sync("DFLLSYNC.DFLLVAL", DFLLSYNC_DFLLVAL, budget)
    }

    const fn source(source: GeneratorSource) -> u32 {
        match source {
            GeneratorSource::Internal => SRC_DFLL,
            GeneratorSource::Internal32k => SRC_OSCULP32K,
            GeneratorSource::MultiplierOutput => SRC_DPLL0,
            GeneratorSource::Crystal => SRC_XOSC32K,
        }
    }
}

impl<R: RegisterAccess> ClockBackend for Samd51<R> {
    const NAME: &'static str = "SAMD51";
    const GENERATORS: usize = 12;
    const MULTIPLIER_RANGE: RangeInclusive<u32> = 96_000_000..=200_000_000;
    const FRACTIONAL_SCALE: u32 = 32;
    // LDR is 13 bits and holds factor - 1
    const MAX_RATIO: u32 = DPLLRATIO_LDR_MASK + 1;
    const FINE_DEFAULT: u16 = 128;
    const USB_RECOVERY_REFERENCE_HZ: Option<u32> = None;
    // GCLK0 from DFLL48M in open loop
    const RESET_CPU_HZ: u32 = 48_000_000;
    const RESET_BUS_HZ: u32 = 48_000_000;
    const BUS: BusClock = BusClock::Generator(2);
    const AUXILIARY_GENERATORS: &'static [(usize, Generator)] = &[
        (2, Generator::new(GeneratorSource::Internal, 1)),
        (3, Generator::new(GeneratorSource::Internal, 6)),
    ];

    fn start_crystal(&mut self, fail_safe: bool) -> bool {
        self.regs.write(
            XOSC32K,
            (XOSC32K_CGM_HS << XOSC32K_CGM_POS)
                | (0x4 << XOSC32K_STARTUP_POS)
                | XOSC32K_RUNSTDBY
                | XOSC32K_EN32K
                | XOSC32K_XTALEN,
        );
        if fail_safe {
            // switch to OSCULP32K on crystal failure
            self.regs.modify(CFDCTRL, |v| v | CFDCTRL_CFDEN);
        }
        self.regs.modify(XOSC32K, |v| v | XOSC32K_ENABLE);
        fail_safe
    }

    fn crystal_ready(&self) -> bool {
        self.regs.is_set(OSC32K_STATUS, STATUS_XOSC32KRDY)
    }

    fn stop_crystal(&mut self) {
        self.regs.modify(CFDCTRL, |v| v & !CFDCTRL_CFDEN);
        self.regs.modify(XOSC32K, |v| v & !XOSC32K_ENABLE);
    }

    fn trim_internal_reference(&mut self, calibration: Calibration) {
        let calib = (u32::from(calibration.fine) << OSCULP32K_CALIB_POS) & OSCULP32K_CALIB_MASK;
        self.regs.modify(OSCULP32K, |v| (v & !OSCULP32K_CALIB_MASK) | calib);
    }

    fn factory_calibration(&self) -> Calibration {
        // loaded by the boot ROM from the calibration area
        let dfllval = self.regs.read(DFLLVAL);
        Calibration {
            coarse: ((dfllval >> DFLLVAL_COARSE_POS) & 0x3f) as u8,
            fine: (dfllval & DFLLVAL_FINE_MASK) as u16,
        }
    }

    fn program_multiplier(&mut self, request: &MultiplierRequest<'_>, budget: PollBudget) -> Result<(), ClockError> {
        let config = request.config;

        // The DFLL keeps the CPU running while the DPLL is down. In closed
        // loop the hardware owns DFLLVAL.
        match (config.reference_kind, self.dfll_closed_loop()) {
            (ReferenceKind::ExternalCrystal, true) => {}
            (ReferenceKind::ExternalCrystal, false) => {
                self.trim_dfll(request.trim, budget)?;
                self.close_dfll_loop(budget)?;
            }
            (ReferenceKind::Internal, closed) => {
                if closed {
                    self.open_dfll_loop(budget)?;
                }
                self.trim_dfll(request.trim, budget)?;
            }
        }

        self.regs.modify(DPLLCTRLA, |v| v & !DPLLCTRLA_ENABLE);
        self.wait_dpll_sync("DPLLSYNCBUSY.ENABLE", DPLLSYNCBUSY_ENABLE, budget)?;

        let refclk = match config.reference_kind {
            ReferenceKind::ExternalCrystal => REFCLK_XOSC32,
            ReferenceKind::Internal => {
                self.write_channel(PCHCTRL_ID_FDPLL0, REFERENCE_GENERATOR, true, budget)?;
                REFCLK_GCLK
            }
        };
        self.regs.write(
            DPLLCTRLB,
            (1 << DPLLCTRLB_DIV_POS)
                | DPLLCTRLB_LBYPASS
                | (refclk << DPLLCTRLB_REFCLK_POS)
                | DPLLCTRLB_WUF
                | (0x1 << DPLLCTRLB_FILTER_POS),
        );

        // LDR holds the factor minus one
        let ldr = config.integer_ratio.saturating_sub(1) & DPLLRATIO_LDR_MASK;
        self.regs.write(DPLLRATIO, (config.fractional_step << DPLLRATIO_LDRFRAC_POS) | ldr);
        self.wait_dpll_sync("DPLLSYNCBUSY.DPLLRATIO", DPLLSYNCBUSY_DPLLRATIO, budget)?;

        self.regs.write(DPLLCTRLA, DPLLCTRLA_ENABLE | DPLLCTRLA_RUNSTDBY);
        self.wait_dpll_sync("DPLLSYNCBUSY.ENABLE", DPLLSYNCBUSY_ENABLE, budget)?;

        // Errata 2.13.1: LOCK alone is not enough, CLKRDY must be set too
        budget.wait("DPLL0 lock", || {
            self.regs.is_set(DPLLSTATUS, DPLLSTATUS_CLKRDY | DPLLSTATUS_LOCK)
        })
    }

    fn stop_multiplier(&mut self, budget: PollBudget) -> Result<(), ClockError> {
        self.regs.modify(DPLLCTRLA, |v| v & !DPLLCTRLA_ENABLE);
        self.wait_dpll_sync("DPLLSYNCBUSY.ENABLE", DPLLSYNCBUSY_ENABLE, budget)?;
        if self.dfll_closed_loop() {
            self.open_dfll_loop(budget)?;
        }
        Ok(())
    }

    // GCLK1 feeds the DPLL on the internal reference, the DFLL loop on the crystal
    fn reference_through_generator(_mode: MultiplierMode, _reference: ReferenceKind) -> bool {
        true
    }

    fn max_divisor(index: usize) -> u32 {
        match index {
            1 => 0xffff,
            _ => 0xff,
        }
    }

    fn internal_source_hz(&self) -> u32 {
        if self.dfll_closed_loop() {
            Self::CRYSTAL_HZ * DFLL_CLOSED_LOOP_MUL
        } else {
            DFLL_NOMINAL_HZ
        }
    }

    fn write_generator(&mut self, index: usize, generator: &Generator, budget: PollBudget) -> Result<(), ClockError> {
        let mut value = (generator.divisor << GENCTRL_DIV_POS)
            | (Self::source(generator.source) & GENCTRL_SRC_MASK)
            | GENCTRL_RUNSTDBY
            | GENCTRL_IDC;
        if generator.enabled {
            value |= GENCTRL_GENEN;
        }
        self.regs.write(genctrl(index), value);

        let busy = 1 << (SYNCBUSY_GENCTRL_POS + index as u32);
        budget.wait("SYNCBUSY.GENCTRL", || !self.regs.is_set(GCLK_SYNCBUSY, busy))
    }

    gate_table! {
        MCLK;
        Eic: Some(4), apba[10];
        Sercom0: Some(7), apba[12];
        Sercom1: Some(8), apba[13];
        Tc0: Some(9), apba[14];
        Tc1: Some(9), apba[15];
        Usb: Some(10), apbb[1];
        Port: None, apbb[4];
        Sercom2: Some(23), apbb[9];
        Sercom3: Some(24), apbb[10];
        Tcc0: Some(25), apbb[11];
        Tcc1: Some(25), apbb[12];
        Tc2: Some(26), apbb[13];
        Tc3: Some(26), apbb[14];
        Tcc2: Some(29), apbc[3];
        Tc4: Some(30), apbc[5];
        Tc5: Some(30), apbc[6];
        Sercom4: Some(34), apbd[0];
        Sercom5: Some(35), apbd[1];
        Sercom6: Some(36), apbd[2];
        Sercom7: Some(37), apbd[3];
        Adc0: Some(40), apbd[7];
        Dac: Some(42), apbd[10];
        Dmac: None, ahb[9];
    }

    fn write_channel(&mut self, channel: u8, generator: usize, enable: bool, budget: PollBudget) -> Result<(), ClockError> {
        let reg = pchctrl(channel);
        let mut value = generator as u32 & 0xf;
        if enable {
            value |= PCHCTRL_CHEN;
        }
        self.regs.write(reg, value);
        // CHEN reads back once the channel has switched
        budget.wait("PCHCTRL.CHEN", || self.regs.is_set(reg, PCHCTRL_CHEN) == enable)
    }

    fn set_bus_mask(&mut self, mask: BusMask, on: bool) {
        let bit = 1 << mask.bit;
        self.regs.modify(mask.reg, |v| if on { v | bit } else { v & !bit });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::gate::PeripheralId;
    use crate::clocks::multiplier::MultiplierConfig;
    use crate::regs::sim::SimRegisters;

    fn dpll_120m(kind: ReferenceKind) -> MultiplierConfig {
        MultiplierConfig {
            reference_kind: kind,
            reference_frequency_hz: 32_768,
            target_frequency_hz: 120_000_000,
            integer_ratio: 3662,
            fractional_step: 4,
            fractional_scale: 32,
            locked: false,
        }
    }

    fn request(config: &MultiplierConfig) -> MultiplierRequest<'_> {
        MultiplierRequest {
            config,
            mode: MultiplierMode::ClosedLoop,
            trim: Calibration { coarse: 0x1f, fine: 128 },
        }
    }

    fn locking_regs() -> SimRegisters {
        let mut regs = SimRegisters::new();
        regs.force_high(OSCCTRL_STATUS, STATUS_DFLLLCKF);
        regs.force_high(DPLLSTATUS, DPLLSTATUS_LOCK | DPLLSTATUS_CLKRDY);
        regs
    }

    #[test]
    fn ratio_register_holds_factor_minus_one() {
        let mut backend = Samd51::new(locking_regs());
        let config = dpll_120m(ReferenceKind::ExternalCrystal);
        backend.program_multiplier(&request(&config), PollBudget::DEFAULT).unwrap();

        let ratio = backend.regs().stored(DPLLRATIO);
        assert_eq!(ratio & DPLLRATIO_LDR_MASK, 3661);
        assert_eq!(ratio >> DPLLRATIO_LDRFRAC_POS, 4);
    }

    #[test]
    fn reference_is_selected_before_enable() {
        let mut backend = Samd51::new(locking_regs());
        let config = dpll_120m(ReferenceKind::ExternalCrystal);
        backend.program_multiplier(&request(&config), PollBudget::DEFAULT).unwrap();

        let regs = backend.regs();
        // disable, then CTRLB, then RATIO, then enable
        assert_eq!(regs.writes_to(DPLLCTRLA), [0, DPLLCTRLA_ENABLE | DPLLCTRLA_RUNSTDBY]);
        assert!(regs.first_write(DPLLCTRLA) < regs.first_write(DPLLCTRLB));
        assert!(regs.first_write(DPLLCTRLB) < regs.first_write(DPLLRATIO));
        assert!(regs.first_write(DPLLRATIO) < regs.last_write(DPLLCTRLA));
        assert_eq!((regs.stored(DPLLCTRLB) >> DPLLCTRLB_REFCLK_POS) & 0x7, REFCLK_XOSC32);
        // crystal reference doesn't need the GCLK channel
        assert!(regs.writes_to(pchctrl(PCHCTRL_ID_FDPLL0)).is_empty());
    }

    #[test]
    fn internal_reference_goes_through_generator_one() {
        let mut backend = Samd51::new(locking_regs());
        let config = dpll_120m(ReferenceKind::Internal);
        backend.program_multiplier(&request(&config), PollBudget::DEFAULT).unwrap();

        let regs = backend.regs();
        assert_eq!(regs.stored(pchctrl(PCHCTRL_ID_FDPLL0)), 1 | PCHCTRL_CHEN);
        assert!(regs.first_write(pchctrl(PCHCTRL_ID_FDPLL0)) < regs.first_write(DPLLCTRLB));
        assert_eq!((regs.stored(DPLLCTRLB) >> DPLLCTRLB_REFCLK_POS) & 0x7, REFCLK_GCLK);
    }

    #[test]
    fn lock_without_clkrdy_times_out() {
        let mut regs = SimRegisters::new();
        regs.force_high(OSCCTRL_STATUS, STATUS_DFLLLCKF);
        regs.force_high(DPLLSTATUS, DPLLSTATUS_LOCK);
        let mut backend = Samd51::new(regs);
        let config = dpll_120m(ReferenceKind::ExternalCrystal);
        assert_eq!(
            backend.program_multiplier(&request(&config), PollBudget(100)),
            Err(ClockError::LockTimeout { what: "DPLL0 lock" })
        );
    }

    #[test]
    fn stuck_ratio_synchronizer_times_out() {
        let mut regs = locking_regs();
        regs.force_high(DPLLSYNCBUSY, DPLLSYNCBUSY_DPLLRATIO);
        let mut backend = Samd51::new(regs);
        let config = dpll_120m(ReferenceKind::ExternalCrystal);
        assert_eq!(
            backend.program_multiplier(&request(&config), PollBudget(100)),
            Err(ClockError::LockTimeout { what: "DPLLSYNCBUSY.DPLLRATIO" })
        );
        // never enabled
        assert_eq!(backend.regs().writes_to(DPLLCTRLA), [0]);
    }

    #[test]
    fn crystal_reference_closes_dfll_loop() {
        let mut backend = Samd51::new(locking_regs());
        assert_eq!(backend.internal_source_hz(), 48_000_000);
        let config = dpll_120m(ReferenceKind::ExternalCrystal);
        backend.program_multiplier(&request(&config), PollBudget::DEFAULT).unwrap();

        let regs = backend.regs();
        assert_eq!(regs.stored(pchctrl(PCHCTRL_ID_DFLL48)), 1 | PCHCTRL_CHEN);
        assert_eq!(regs.stored(DFLLMUL) & 0xffff, 1465);
        assert_eq!(regs.stored(DFLLCTRLB), DFLLCTRLB_MODE | DFLLCTRLB_BPLCKC);
        assert_eq!(regs.stored(DFLLCTRLA), DFLLCTRLA_RUNSTDBY | DFLLCTRLA_ENABLE);
        // trim, then loop, then the DPLL
        assert!(regs.first_write(DFLLVAL) < regs.first_write(DFLLCTRLB));
        assert!(regs.first_write(DFLLCTRLA) < regs.first_write(DPLLCTRLA));
        assert_eq!(backend.internal_source_hz(), 48_005_120);

        // relock on the same crystal leaves the DFLL alone
        backend.program_multiplier(&request(&config), PollBudget::DEFAULT).unwrap();
        assert_eq!(backend.regs().writes_to(DFLLCTRLB).len(), 1);
        assert_eq!(backend.regs().writes_to(DFLLVAL).len(), 1);
    }

    #[test]
    fn dfll_lock_timeout_reopens_loop() {
        let mut regs = SimRegisters::new();
        regs.force_high(DPLLSTATUS, DPLLSTATUS_LOCK | DPLLSTATUS_CLKRDY);
        let mut backend = Samd51::new(regs);
        let config = dpll_120m(ReferenceKind::ExternalCrystal);

        assert_eq!(
            backend.program_multiplier(&request(&config), PollBudget(50)),
            Err(ClockError::LockTimeout { what: "DFLL fine lock" })
        );
        let regs = backend.regs();
        assert_eq!(regs.stored(DFLLCTRLB), 0);
        assert!(!regs.is_set(pchctrl(PCHCTRL_ID_DFLL48), PCHCTRL_CHEN));
        // DPLL never touched
        assert!(regs.writes_to(DPLLCTRLA).is_empty());
        assert_eq!(backend.internal_source_hz(), 48_000_000);
    }

    #[test]
    fn internal_reference_and_stop_reopen_dfll_loop() {
        let mut backend = Samd51::new(locking_regs());
        let crystal = dpll_120m(ReferenceKind::ExternalCrystal);
        backend.program_multiplier(&request(&crystal), PollBudget::DEFAULT).unwrap();
        let internal = dpll_120m(ReferenceKind::Internal);
        backend.program_multiplier(&request(&internal), PollBudget::DEFAULT).unwrap();
        assert_eq!(backend.regs().stored(DFLLCTRLB), 0);
        assert_eq!(backend.regs().writes_to(DFLLVAL).len(), 2);

        backend.program_multiplier(&request(&crystal), PollBudget::DEFAULT).unwrap();
        backend.stop_multiplier(PollBudget::DEFAULT).unwrap();
        assert_eq!(backend.regs().stored(DFLLCTRLB), 0);
        assert!(!backend.regs().is_set(DPLLCTRLA, DPLLCTRLA_ENABLE));
        assert!(!backend.regs().is_set(pchctrl(PCHCTRL_ID_DFLL48), PCHCTRL_CHEN));
    }

    #[test]
    fn crystal_arms_failure_detection() {
        let mut backend = Samd51::new(SimRegisters::new());
        assert!(backend.start_crystal(true));
        assert!(backend.regs().is_set(CFDCTRL, CFDCTRL_CFDEN));
        assert!(backend.regs().is_set(XOSC32K, XOSC32K_ENABLE | XOSC32K_XTALEN));
        backend.stop_crystal();
        assert!(!backend.regs().is_set(XOSC32K, XOSC32K_ENABLE));
        assert!(!backend.regs().is_set(CFDCTRL, CFDCTRL_CFDEN));
    }

    #[test]
    fn generators_wait_on_their_own_sync_bit() {
        let mut regs = SimRegisters::new();
        // generator 3 is stuck, generator 2 is not
        regs.force_high(GCLK_SYNCBUSY, 1 << 5);
        let mut backend = Samd51::new(regs);
        let generator = Generator::new(GeneratorSource::Internal, 6);

        backend.write_generator(2, &generator, PollBudget(10)).unwrap();
        assert_eq!(
            backend.write_generator(3, &generator, PollBudget(10)),
            Err(ClockError::LockTimeout { what: "SYNCBUSY.GENCTRL" })
        );
        assert_eq!(
            backend.regs().stored(genctrl(2)),
            (6 << 16) | SRC_DFLL | GENCTRL_RUNSTDBY | GENCTRL_IDC | GENCTRL_GENEN
        );
    }

    #[test]
    fn factory_calibration_reads_dfllval() {
        let mut regs = SimRegisters::new();
        regs.preset(DFLLVAL, (0x3f << 10) | 0x80);
        let backend = Samd51::new(regs);
        assert_eq!(backend.factory_calibration(), Calibration { coarse: 0x3f, fine: 0x80 });
    }

    #[test]
    fn sercom_masks_are_spread_over_buses() {
        let sercom0 = Samd51::<SimRegisters>::gate(PeripheralId::Sercom0).unwrap();
        let sercom5 = Samd51::<SimRegisters>::gate(PeripheralId::Sercom5).unwrap();
        assert_eq!(sercom0.mask, BusMask { reg: MCLK_APBAMASK, bit: 12 });
        assert_eq!(sercom5.mask, BusMask { reg: MCLK_APBDMASK, bit: 1 });
        assert_eq!(sercom5.channel, Some(35));

        let dmac = Samd51::<SimRegisters>::gate(PeripheralId::Dmac).unwrap();
        assert_eq!(dmac.mask.reg, MCLK_AHBMASK);
        assert_eq!(dmac.channel, None);
    }
}
