//! SAMD21 backend
//!
//! ```text
//!             ┌──────────┐  GCLK1   ┌─────────┐           ┌────────┐
//!  XOSC32K ──▶│          │─────────▶│ DFLL48M │──────────▶│        │ GCLK0 (CPU)
//!             │ GENCTRL  │ CLKCTRL  │ MUL x   │  DFLL48M  │GENCTRL │ GCLK2 (48 MHz)
//!  OSCULP32K─▶│ ID = 1   │ ID = 0   └─────────┘           │GENDIV  │ GCLK3 (1 MHz)
//!             └──────────┘                      OSC8M ───▶│        │ GCLK8 (1 kHz)
//!                                                         └────────┘
//! ```
//!
//! All GCLK registers go through one synchronizer (`STATUS.SYNCBUSY`), and
//! the generator / channel registers are addressed indirectly through their
//! `ID` fields.

use core::ops::RangeInclusive;

use super::{BusClock, BusMask, ClockBackend, MultiplierRequest, REFERENCE_GENERATOR};
use crate::clocks::generators::{Generator, GeneratorSource};
use crate::clocks::multiplier::MultiplierMode;
use crate::clocks::reference::{Calibration, ReferenceKind};
use crate::clocks::{ClockError, PollBudget};
use crate::regs::{Reg, RegisterAccess};

const SYSCTRL: u32 = 0x4000_0800;
pub(crate) const PCLKSR: Reg = Reg::u32(SYSCTRL + 0x0C);
pub(crate) const XOSC32K: Reg = Reg::u16(SYSCTRL + 0x14);
pub(crate) const OSCULP32K: Reg = Reg::u8(SYSCTRL + 0x1C);
pub(crate) const OSC8M: Reg = Reg::u32(SYSCTRL + 0x20);
pub(crate) const DFLLCTRL: Reg = Reg::u16(SYSCTRL + 0x24);
pub(crate) const DFLLVAL: Reg = Reg::u32(SYSCTRL + 0x28);
pub(crate) const DFLLMUL: Reg = Reg::u32(SYSCTRL + 0x2C);

pub(crate) const PCLKSR_XOSC32KRDY: u32 = 1 << 1;
pub(crate) const PCLKSR_DFLLRDY: u32 = 1 << 4;
pub(crate) const PCLKSR_DFLLLCKF: u32 = 1 << 6;

const XOSC32K_ENABLE: u32 = 1 << 1;
const XOSC32K_XTALEN: u32 = 1 << 2;
const XOSC32K_EN32K: u32 = 1 << 3;
const XOSC32K_STARTUP_POS: u32 = 8;

const OSCULP32K_CALIB_MASK: u32 = 0x1f;
const OSC8M_PRESC_POS: u32 = 8;

pub(crate) const DFLLCTRL_ENABLE: u32 = 1 << 1;
pub(crate) const DFLLCTRL_MODE: u32 = 1 << 2;
pub(crate) const DFLLCTRL_USBCRM: u32 = 1 << 5;
pub(crate) const DFLLCTRL_CCDIS: u32 = 1 << 8;
pub(crate) const DFLLCTRL_BPLCKC: u32 = 1 << 10;
pub(crate) const DFLLCTRL_WAITLOCK: u32 = 1 << 11;

const DFLLVAL_COARSE_POS: u32 = 10;
const DFLLMUL_FSTEP_POS: u32 = 16;
const DFLLMUL_CSTEP_POS: u32 = 26;

const GCLK: u32 = 0x4000_0C00;
pub(crate) const GCLK_STATUS: Reg = Reg::u8(GCLK + 0x01);
pub(crate) const CLKCTRL: Reg = Reg::u16(GCLK + 0x02);
pub(crate) const GENCTRL: Reg = Reg::u32(GCLK + 0x04);
pub(crate) const GENDIV: Reg = Reg::u32(GCLK + 0x08);

pub(crate) const STATUS_SYNCBUSY: u32 = 1 << 7;
const CLKCTRL_GEN_POS: u32 = 8;
pub(crate) const CLKCTRL_CLKEN: u32 = 1 << 14;
const GENCTRL_SRC_POS: u32 = 8;
pub(crate) const GENCTRL_GENEN: u32 = 1 << 16;
const GENCTRL_IDC: u32 = 1 << 17;
const GENDIV_DIV_POS: u32 = 8;

const SRC_OSCULP32K: u32 = 0x03;
const SRC_XOSC32K: u32 = 0x05;
const SRC_OSC8M: u32 = 0x06;
const SRC_DFLL48M: u32 = 0x07;

pub(crate) const CLKCTRL_ID_DFLL48: u8 = 0x00;

const PM: u32 = 0x4000_0400;
pub(crate) const PM_APBAMASK: Reg = Reg::u32(PM + 0x18);
pub(crate) const PM_APBBMASK: Reg = Reg::u32(PM + 0x1C);
pub(crate) const PM_APBCMASK: Reg = Reg::u32(PM + 0x20);

pub(crate) const NVMCTRL_CTRLB: Reg = Reg::u32(0x4100_4004);
const NVMCTRL_CTRLB_RWS_POS: u32 = 1;
const NVMCTRL_CTRLB_RWS_MASK: u32 = 0xf << NVMCTRL_CTRLB_RWS_POS;
const NVMCTRL_CTRLB_MANW: u32 = 1 << 7;

/// NVM software calibration row word holding `DFLL48M_COARSE_CAL`.
pub(crate) const NVM_CALIBRATION: Reg = Reg::u32(0x0080_6024);
const NVM_DFLL_COARSE_POS: u32 = 26;

/// One flash wait state is needed above this CPU frequency.
const ZERO_WAIT_STATE_MAX_HZ: u32 = 24_000_000;

/// SAMD21 clock registers.
#[derive(Debug)]
pub struct Samd21<R> {
    regs: R,
}

impl<R: RegisterAccess> Samd21<R> {
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

    fn wait_gclk_sync(&self, budget: PollBudget) -> Result<(), ClockError> {
        budget.wait("GCLK SYNCBUSY", || !self.regs.is_set(GCLK_STATUS, STATUS_SYNCBUSY))
    }

    fn wait_dfll_ready(&self, budget: PollBudget) -> Result<(), ClockError> {
        budget.wait("DFLLRDY", || self.regs.is_set(PCLKSR, PCLKSR_DFLLRDY))
    }

    const fn source(source: GeneratorSource) -> u32 {
        match source {
            GeneratorSource::Internal => SRC_OSC8M,
            GeneratorSource::Internal32k => SRC_OSCULP32K,
            GeneratorSource::MultiplierOutput => SRC_DFLL48M,
            GeneratorSource::Crystal => SRC_XOSC32K,
        }
    }
}

impl<R: RegisterAccess> ClockBackend for Samd21<R> {
    const NAME: &'static str = "SAMD21";
    const GENERATORS: usize = 9;
    const MULTIPLIER_RANGE: RangeInclusive<u32> = 47_000_000..=49_000_000;
    const FRACTIONAL_SCALE: u32 = 1;
    const MAX_RATIO: u32 = 0xffff;
    const FINE_DEFAULT: u16 = 512;
    const USB_RECOVERY_REFERENCE_HZ: Option<u32> = Some(1_000);
    // OSC8M with its reset prescaler of /8
    const RESET_CPU_HZ: u32 = 1_000_000;
    const RESET_BUS_HZ: u32 = 1_000_000;
    const BUS: BusClock = BusClock::FollowsCpu;
    const AUXILIARY_GENERATORS: &'static [(usize, Generator)] = &[
        (2, Generator::new(GeneratorSource::MultiplierOutput, 1)),
        (3, Generator::new(GeneratorSource::MultiplierOutput, 48)),
        (8, Generator::new(GeneratorSource::Internal32k, 32)),
    ];

    fn start_crystal(&mut self, fail_safe: bool) -> bool {
        if fail_safe {
            debug!("SAMD21 has no 32k crystal failure detector");
        }
        self.regs.write(
            XOSC32K,
            (0x3 << XOSC32K_STARTUP_POS) | XOSC32K_EN32K | XOSC32K_XTALEN,
        );
        self.regs.modify(XOSC32K, |v| v | XOSC32K_ENABLE);
        false
    }

    fn crystal_ready(&self) -> bool {
        self.regs.is_set(PCLKSR, PCLKSR_XOSC32KRDY)
    }

    fn stop_crystal(&mut self) {
        self.regs.modify(XOSC32K, |v| v & !XOSC32K_ENABLE);
    }

    fn trim_internal_reference(&mut self, calibration: Calibration) {
        let calib = u32::from(calibration.fine) & OSCULP32K_CALIB_MASK;
        self.regs.modify(OSCULP32K, |v| (v & !OSCULP32K_CALIB_MASK) | calib);
    }

    fn factory_calibration(&self) -> Calibration {
        let coarse = (self.regs.read(NVM_CALIBRATION) >> NVM_DFLL_COARSE_POS) & 0x3f;
        Calibration {
            coarse: coarse as u8,
            fine: Self::FINE_DEFAULT,
        }
    }

    fn program_multiplier(&mut self, request: &MultiplierRequest<'_>, budget: PollBudget) -> Result<(), ClockError> {
        // The DFLL reference comes in on its own channel. USB clock recovery
        // locks onto SOF packets instead.
        if request.mode != MultiplierMode::UsbRecovery {
            self.write_channel(CLKCTRL_ID_DFLL48, REFERENCE_GENERATOR, true, budget)?;
        }

        // Errata 1.2.1: DFLLVAL and DFLLMUL only accept writes while
        // DFLLCTRL.ENABLE is set
        self.regs.write(DFLLCTRL, DFLLCTRL_ENABLE);
        self.wait_dfll_ready(budget)?;

        self.regs.write(
            DFLLVAL,
            (u32::from(request.trim.coarse) << DFLLVAL_COARSE_POS) | u32::from(request.trim.fine),
        );
        self.wait_dfll_ready(budget)?;

        self.regs.write(
            DFLLMUL,
            (1 << DFLLMUL_CSTEP_POS) | (1 << DFLLMUL_FSTEP_POS) | request.config.integer_ratio,
        );
        self.wait_dfll_ready(budget)?;

        match request.mode {
            MultiplierMode::ClosedLoop => {
                self.regs.modify(DFLLCTRL, |v| {
                    v | DFLLCTRL_MODE | DFLLCTRL_WAITLOCK | DFLLCTRL_BPLCKC | DFLLCTRL_ENABLE
                });
                // coarse lock is bypassed, only the fine lock matters
                budget.wait("DFLL fine lock", || self.regs.is_set(PCLKSR, PCLKSR_DFLLLCKF))
            }
            MultiplierMode::OpenLoop => self.wait_dfll_ready(budget),
            MultiplierMode::UsbRecovery => {
                self.regs.write(
                    DFLLCTRL,
                    DFLLCTRL_CCDIS | DFLLCTRL_USBCRM | DFLLCTRL_MODE | DFLLCTRL_ENABLE,
                );
                self.wait_dfll_ready(budget)
            }
        }
    }

    fn stop_multiplier(&mut self, budget: PollBudget) -> Result<(), ClockError> {
        self.regs.write(DFLLCTRL, 0);
        self.wait_dfll_ready(budget)
    }

    // every mode but USB recovery routes GCLK1 to the DFLL channel
    fn reference_through_generator(mode: MultiplierMode, _reference: ReferenceKind) -> bool {
        mode != MultiplierMode::UsbRecovery
    }

    fn max_divisor(index: usize) -> u32 {
        match index {
            1 => 0xffff,
            2 => 0x1f,
            _ => 0xff,
        }
    }

    fn internal_source_hz(&self) -> u32 {
        let presc = (self.regs.read(OSC8M) >> OSC8M_PRESC_POS) & 0x3;
        8_000_000 >> presc
    }

    fn write_generator(&mut self, index: usize, generator: &Generator, budget: PollBudget) -> Result<(), ClockError> {
        let id = index as u32;

        self.regs.write(GENDIV, id | (generator.divisor << GENDIV_DIV_POS));
        self.wait_gclk_sync(budget)?;

        let mut genctrl = id | (Self::source(generator.source) << GENCTRL_SRC_POS) | GENCTRL_IDC;
        if generator.enabled {
            genctrl |= GENCTRL_GENEN;
        }
        self.regs.write(GENCTRL, genctrl);
        self.wait_gclk_sync(budget)
    }

    fn set_flash_wait_states(&mut self, cpu_hz: u32) {
        let rws = u32::from(cpu_hz > ZERO_WAIT_STATE_MAX_HZ);
        let current = self.regs.read(NVMCTRL_CTRLB);
        let wanted = (current & !NVMCTRL_CTRLB_RWS_MASK) | (rws << NVMCTRL_CTRLB_RWS_POS) | NVMCTRL_CTRLB_MANW;
        if wanted != current {
            trace!("flash wait states: {}", rws);
            self.regs.write(NVMCTRL_CTRLB, wanted);
        }
    }

    gate_table! {
        PM;
        Eic: Some(0x05), apba[6];
        Usb: Some(0x06), apbb[5];
        Port: None, apbb[3];
        Dmac: None, apbb[4];
        Sercom0: Some(0x14), apbc[2];
        Sercom1: Some(0x15), apbc[3];
        Sercom2: Some(0x16), apbc[4];
        Sercom3: Some(0x17), apbc[5];
        Sercom4: Some(0x18), apbc[6];
        Sercom5: Some(0x19), apbc[7];
        Tcc0: Some(0x1A), apbc[8];
        Tcc1: Some(0x1A), apbc[9];
        Tcc2: Some(0x1B), apbc[10];
        Tc3: Some(0x1B), apbc[11];
        Tc4: Some(0x1C), apbc[12];
        Tc5: Some(0x1C), apbc[13];
        Adc0: Some(0x1E), apbc[16];
        Dac: Some(0x21), apbc[18];
    }

    fn write_channel(&mut self, channel: u8, generator: usize, enable: bool, budget: PollBudget) -> Result<(), ClockError> {
        let mut clkctrl = u32::from(channel) | ((generator as u32) << CLKCTRL_GEN_POS);
        if enable {
            clkctrl |= CLKCTRL_CLKEN;
        }
        self.regs.write(CLKCTRL, clkctrl);
        self.wait_gclk_sync(budget)
    }

    fn set_bus_mask(&mut self, mask: BusMask, on: bool) {
        let bit = 1 << mask.bit;
        self.regs.modify(mask.reg, |v| if on { v | bit } else { v & !bit });
    }
}
