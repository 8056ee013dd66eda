//! Device backends
//!
//! A backend knows the register layout of one MCU family and nothing about
//! bring-up order, rollback or bookkeeping; that all lives in
//! [`crate::clocks`]. Both backends are always compiled, the `samd21` /
//! `samd51` features only pick [`DefaultBackend`].

use core::ops::RangeInclusive;

use crate::clocks::gate::PeripheralId;
use crate::clocks::generators::Generator;
use crate::clocks::multiplier::{MultiplierConfig, MultiplierMode};
use crate::clocks::reference::{Calibration, ReferenceKind};
use crate::clocks::PollBudget;
use crate::clocks::ClockError;
use crate::regs::Reg;

/// Expands to [`ClockBackend::gate`] from a table of
/// `Peripheral: channel, mask_register[bit];` rows. `$prefix` names the
/// module owning the mask registers (`PM`, `MCLK`).
macro_rules! gate_table {
    ($prefix:ident; $($peripheral:ident: $channel:expr, $bus:ident[$bit:literal];)*) => {
        fn gate(peripheral: $crate::clocks::gate::PeripheralId) -> Option<$crate::backend::Gate> {
            ::paste::paste! {
                match peripheral {
                    $($crate::clocks::gate::PeripheralId::$peripheral => Some($crate::backend::Gate {
                        channel: $channel,
                        mask: $crate::backend::BusMask { reg: [<$prefix _ $bus:upper MASK>], bit: $bit },
                    }),)*
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    };
}

pub mod samd21;
pub mod samd51;

cfg_if::cfg_if! {
    if #[cfg(feature = "samd51")] {
        /// Backend selected by the chip feature.
        pub type DefaultBackend<R> = samd51::Samd51<R>;
    } else {
        /// Backend selected by the chip feature.
        pub type DefaultBackend<R> = samd21::Samd21<R>;
    }
}

/// Generator that carries the reference oscillator to the multiplier.
pub const REFERENCE_GENERATOR: usize = 1;

/// Where the bus (APB) frequency comes from.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusClock {
    /// APB prescalers fixed at /1, the bus runs at the CPU frequency
    FollowsCpu,
    /// The bus runs from this generator, or from the CPU clock while it is
    /// disabled
    Generator(usize),
}

/// A bus mask bit (`PM.APBxMASK` / `MCLK.APBxMASK`).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusMask {
    /// Mask register
    pub reg: Reg,
    /// Bit in `reg`
    pub bit: u8,
}

/// How a peripheral is clocked.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gate {
    /// Generic clock channel, `None` for bus clocked peripherals
    pub channel: Option<u8>,
    /// Bus interface clock
    pub mask: BusMask,
}

/// Everything a backend needs to (re)program its multiplier.
#[derive(Clone, Copy, Debug)]
pub struct MultiplierRequest<'a> {
    /// Ratio to program. `locked` is ignored.
    pub config: &'a MultiplierConfig,
    /// Loop mode
    pub mode: MultiplierMode,
    /// Coarse/fine trim, sentinel already resolved
    pub trim: Calibration,
}

/// Register level operations of one MCU family.
///
/// Every method that writes through a synchronizer waits for it with the
/// given [`PollBudget`].
pub trait ClockBackend {
    /// Family name, for logs.
    const NAME: &'static str;
    /// Number of generic clock generators.
    const GENERATORS: usize;
    /// Valid multiplier output range in Hz.
    const MULTIPLIER_RANGE: RangeInclusive<u32>;
    /// Denominator of the fractional ratio, 1 for integer-only multipliers.
    const FRACTIONAL_SCALE: u32;
    /// Largest multiplication factor the ratio field can hold.
    const MAX_RATIO: u32;
    /// Fine trim used with a substituted coarse value.
    const FINE_DEFAULT: u16;
    /// External crystal frequency.
    const CRYSTAL_HZ: u32 = 32_768;
    /// Always-on internal low power oscillator frequency.
    const INTERNAL_REFERENCE_HZ: u32 = 32_768;
    /// Reference frequency seen by the multiplier in USB clock recovery mode,
    /// `None` when the device has no such mode.
    const USB_RECOVERY_REFERENCE_HZ: Option<u32>;
    /// CPU frequency out of reset.
    const RESET_CPU_HZ: u32;
    /// Bus frequency out of reset.
    const RESET_BUS_HZ: u32;
    /// Bus clock derivation.
    const BUS: BusClock;
    /// Generators installed at bring-up next to the CPU and reference
    /// generators.
    const AUXILIARY_GENERATORS: &'static [(usize, Generator)];

    /// Start the 32.768 kHz crystal. Returns whether failure detection was
    /// armed.
    fn start_crystal(&mut self, fail_safe: bool) -> bool;
    /// Crystal ready flag.
    fn crystal_ready(&self) -> bool;
    /// Stop the crystal.
    fn stop_crystal(&mut self);
    /// Write a trim to the internal reference oscillator, if it has one.
    fn trim_internal_reference(&mut self, calibration: Calibration);

    /// Factory coarse/fine values, possibly the unprogrammed sentinel.
    fn factory_calibration(&self) -> Calibration;
    /// Program the multiplier and wait for it to lock.
    fn program_multiplier(&mut self, request: &MultiplierRequest<'_>, budget: PollBudget) -> Result<(), ClockError>;
    /// Disable the multiplier.
    fn stop_multiplier(&mut self, budget: PollBudget) -> Result<(), ClockError>;
    /// Whether a multiplier locked in `mode` takes its reference through
    /// [`REFERENCE_GENERATOR`].
    fn reference_through_generator(mode: MultiplierMode, reference: ReferenceKind) -> bool;

    /// Largest divisor generator `index` accepts.
    fn max_divisor(index: usize) -> u32;
    /// Current frequency of [`GeneratorSource::Internal`](crate::GeneratorSource::Internal).
    fn internal_source_hz(&self) -> u32;
    /// Write one generator.
    fn write_generator(&mut self, index: usize, generator: &Generator, budget: PollBudget) -> Result<(), ClockError>;
    /// Adjust flash wait states for a CPU frequency.
    fn set_flash_wait_states(&mut self, _cpu_hz: u32) {}

    /// How `peripheral` is clocked, `None` if the device doesn't have it.
    fn gate(peripheral: PeripheralId) -> Option<Gate>;
    /// Route (or stop) a generic clock channel.
    fn write_channel(&mut self, channel: u8, generator: usize, enable: bool, budget: PollBudget)
        -> Result<(), ClockError>;
    /// Set or clear a bus mask bit.
    fn set_bus_mask(&mut self, mask: BusMask, on: bool);
}
