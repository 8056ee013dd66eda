//! Frequency multiplier stage (SAMD21 DFLL48M, SAMD51 FDPLL0)
//!
//! The ratio is computed in units of one fractional step:
//!
//! ```text
//! steps           = (target * scale + reference / 2) / reference
//! integer_ratio   = steps / scale
//! fractional_step = steps % scale
//! output          = reference * steps / scale
//! ```
//!
//! With `scale = 1` this is plain round-to-nearest integer multiplication,
//! with `scale = 32` the half-step bias rounds the fractional part.

use core::ops::RangeInclusive;

use super::config::ClockConfig;
use super::reference::{Calibration, ReferenceKind, ReferenceOscillator};
use super::ClockError;
use crate::backend::{ClockBackend, MultiplierRequest};

/// Coarse value of an unprogrammed calibration row.
pub const COARSE_UNPROGRAMMED: u8 = 0x3f;
/// Mid-range coarse value substituted for [`COARSE_UNPROGRAMMED`].
pub const COARSE_DEFAULT: u8 = 0x1f;

/// Loop mode of the multiplier.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MultiplierMode {
    /// Locked onto the reference
    ClosedLoop,
    /// Free running from the calibration values
    OpenLoop,
    /// Locked onto USB start-of-frame packets
    UsbRecovery,
}

/// A multiplier setting, and whether the hardware reported lock for it.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultiplierConfig {
    /// Oscillator the ratio applies to
    pub reference_kind: ReferenceKind,
    /// Frequency seen at the multiplier input
    pub reference_frequency_hz: u32,
    /// Requested output frequency
    pub target_frequency_hz: u32,
    /// Multiplication factor
    pub integer_ratio: u32,
    /// Fractional part, in `1 / fractional_scale` units
    pub fractional_step: u32,
    /// Fraction denominator, 1 for integer-only multipliers
    pub fractional_scale: u32,
    /// Lock observed
    pub locked: bool,
}

impl MultiplierConfig {
    /// Output frequency this setting actually produces.
    pub fn output_frequency_hz(&self) -> u32 {
        let steps = u64::from(self.integer_ratio) * u64::from(self.fractional_scale) + u64::from(self.fractional_step);
        (u64::from(self.reference_frequency_hz) * steps / u64::from(self.fractional_scale)) as u32
    }

    /// Size of one fractional step in Hz.
    pub fn step_hz(&self) -> u32 {
        self.reference_frequency_hz / self.fractional_scale
    }

    /// Same hardware setting, ignoring the lock flag and the request it was
    /// computed for.
    pub fn same_setting(&self, other: &Self) -> bool {
        self.reference_kind == other.reference_kind
            && self.reference_frequency_hz == other.reference_frequency_hz
            && self.integer_ratio == other.integer_ratio
            && self.fractional_step == other.fractional_step
            && self.fractional_scale == other.fractional_scale
    }
}

/// Compute a ratio for `target_hz` from `reference_hz`.
///
/// Fails with [`ClockError::UnsupportedFrequency`] if the resulting output
/// is outside `range`, or the factor doesn't fit `1..=max_ratio`.
pub fn compute_ratio(
    reference_hz: u32,
    target_hz: u32,
    scale: u32,
    range: RangeInclusive<u32>,
    max_ratio: u32,
) -> Result<(u32, u32), ClockError> {
    if reference_hz == 0 || scale == 0 {
        return Err(ClockError::unsupported("reference frequency is zero"));
    }

    let reference = u64::from(reference_hz);
    let scale = u64::from(scale);
    let steps = (u64::from(target_hz) * scale + reference / 2) / reference;
    let integer = steps / scale;
    let fractional = steps % scale;

    if integer == 0 || integer > u64::from(max_ratio) {
        return Err(ClockError::unsupported("multiplier ratio out of register range"));
    }

    let output = reference * steps / scale;
    if output < u64::from(*range.start()) || output > u64::from(*range.end()) {
        return Err(ClockError::unsupported("multiplier output out of range"));
    }

    Ok((integer as u32, fractional as u32))
}

/// Reference frequency as seen by the multiplier.
fn input_frequency<B: ClockBackend>(reference: &ReferenceOscillator, config: &ClockConfig) -> u32 {
    match (reference.kind, B::USB_RECOVERY_REFERENCE_HZ) {
        (ReferenceKind::Internal, Some(sof_hz)) if config.usb_clock_recovery => sof_hz,
        _ => reference.nominal_frequency_hz,
    }
}

/// Plan a multiplier setting for `target_hz` on `reference`. Touches no
/// hardware.
pub fn plan<B: ClockBackend>(
    reference: &ReferenceOscillator,
    target_hz: u32,
    config: &ClockConfig,
) -> Result<MultiplierConfig, ClockError> {
    let reference_frequency_hz = input_frequency::<B>(reference, config);
    let (integer_ratio, fractional_step) = compute_ratio(
        reference_frequency_hz,
        target_hz,
        B::FRACTIONAL_SCALE,
        B::MULTIPLIER_RANGE,
        B::MAX_RATIO,
    )?;

    Ok(MultiplierConfig {
        reference_kind: reference.kind,
        reference_frequency_hz,
        target_frequency_hz: target_hz,
        integer_ratio,
        fractional_step,
        fractional_scale: B::FRACTIONAL_SCALE,
        locked: false,
    })
}

/// Replace an unprogrammed coarse value by the mid-range default.
pub fn resolve_calibration<B: ClockBackend>(factory: Calibration) -> Calibration {
    if factory.coarse == COARSE_UNPROGRAMMED {
        debug!("no factory coarse value, using {}", COARSE_DEFAULT);
        Calibration {
            coarse: COARSE_DEFAULT,
            fine: B::FINE_DEFAULT,
        }
    } else {
        factory
    }
}

fn mode_for<B: ClockBackend>(wanted: &MultiplierConfig, config: &ClockConfig) -> MultiplierMode {
    match wanted.reference_kind {
        ReferenceKind::ExternalCrystal => MultiplierMode::ClosedLoop,
        ReferenceKind::Internal if config.usb_clock_recovery && B::USB_RECOVERY_REFERENCE_HZ.is_some() => {
            MultiplierMode::UsbRecovery
        }
        // The DPLL has no open loop, it locks onto the GCLK reference
        ReferenceKind::Internal if B::FRACTIONAL_SCALE > 1 => MultiplierMode::ClosedLoop,
        ReferenceKind::Internal => MultiplierMode::OpenLoop,
    }
}

/// Whether a locked multiplier holds [`REFERENCE_GENERATOR`](crate::backend::REFERENCE_GENERATOR)
/// as its reference input.
pub(crate) fn takes_reference_generator<B: ClockBackend>(locked: &MultiplierConfig, config: &ClockConfig) -> bool {
    B::reference_through_generator(mode_for::<B>(locked, config), locked.reference_kind)
}

/// Program a planned setting and wait for lock.
///
/// The reference must already be routed (generator 1) and ready.
pub(crate) fn lock<B: ClockBackend>(
    backend: &mut B,
    wanted: &MultiplierConfig,
    config: &ClockConfig,
) -> Result<MultiplierConfig, ClockError> {
    let trim = resolve_calibration::<B>(backend.factory_calibration());
    let mode = mode_for::<B>(wanted, config);
    debug!(
        "locking multiplier: ratio {} + {}/{}, mode {:?}",
        wanted.integer_ratio,
        wanted.fractional_step,
        wanted.fractional_scale,
        mode
    );

    let request = MultiplierRequest {
        config: wanted,
        mode,
        trim,
    };
    backend.program_multiplier(&request, config.poll_budget)?;

    info!("multiplier locked at {} Hz", wanted.output_frequency_hz());
    Ok(MultiplierConfig {
        locked: true,
        ..*wanted
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::samd21::Samd21;
    use crate::backend::samd51::{self, Samd51};
    use crate::clocks::PollBudget;
    use crate::regs::sim::SimRegisters;

    type D21 = Samd21<SimRegisters>;
    type D51 = Samd51<SimRegisters>;

    fn crystal<B: ClockBackend>() -> ReferenceOscillator {
        let mut reference = ReferenceOscillator::inactive::<B>(ReferenceKind::ExternalCrystal);
        reference.ready = true;
        reference
    }

    #[test]
    fn dpll_120mhz_from_crystal() {
        let planned = plan::<D51>(&crystal::<D51>(), 120_000_000, &ClockConfig::default()).unwrap();
        assert_eq!(planned.integer_ratio, 3662);
        assert_eq!(planned.fractional_step, 4);
        assert_eq!(planned.output_frequency_hz(), 120_000_512);
        assert_eq!(planned.step_hz(), 1024);
        assert!(!planned.locked);
    }

    #[test]
    fn dfll_rounds_to_nearest_integer() {
        // (48 MHz + 16384) / 32768
        let planned = plan::<D21>(&crystal::<D21>(), 48_000_000, &ClockConfig::default()).unwrap();
        assert_eq!(planned.integer_ratio, 1465);
        assert_eq!(planned.fractional_step, 0);
        assert_eq!(planned.output_frequency_hz(), 48_005_120);
    }

    #[test]
    fn output_is_within_one_step_of_target() {
        for target in (96_000_000..=200_000_000).step_by(7_777_777) {
            let planned = plan::<D51>(&crystal::<D51>(), target, &ClockConfig::default()).unwrap();
            let error = planned.output_frequency_hz().abs_diff(target);
            assert!(error <= planned.step_hz(), "{target}: off by {error}");
            assert!(planned.fractional_step < planned.fractional_scale);
        }
    }

    #[test]
    fn any_reference_rounds_within_one_step() {
        for reference in [1_000u32, 32_768, 1_000_000] {
            for scale in [1u32, 32] {
                let step = u64::from(reference.div_ceil(scale));
                for target in (96_000_000u32..=200_000_000).step_by(3_333_331) {
                    let (integer, fractional) = compute_ratio(reference, target, scale, 1..=u32::MAX, u32::MAX).unwrap();
                    assert!(fractional < scale);
                    let steps = u64::from(integer) * u64::from(scale) + u64::from(fractional);
                    let output = u64::from(reference) * steps / u64::from(scale);
                    let error = output.abs_diff(u64::from(target));
                    assert!(error <= step, "{reference} Hz / {scale}: {target} off by {error}");
                }
            }
        }
    }

    #[test]
    fn out_of_range_targets_are_rejected() {
        let config = ClockConfig::default();
        assert!(matches!(
            plan::<D51>(&crystal::<D51>(), 250_000_000, &config),
            Err(ClockError::UnsupportedFrequency { .. })
        ));
        assert!(matches!(
            plan::<D51>(&crystal::<D51>(), 48_000_000, &config),
            Err(ClockError::UnsupportedFrequency { .. })
        ));
        assert!(matches!(
            plan::<D21>(&crystal::<D21>(), 60_000_000, &config),
            Err(ClockError::UnsupportedFrequency { .. })
        ));
    }

    #[test]
    fn ratio_must_fit_register() {
        assert_eq!(
            compute_ratio(1_000, 48_000_000, 1, 47_000_000..=49_000_000, 0xffff),
            Ok((48_000, 0))
        );
        assert!(compute_ratio(100, 48_000_000, 1, 47_000_000..=49_000_000, 0xffff).is_err());
        assert!(compute_ratio(0, 48_000_000, 1, 47_000_000..=49_000_000, 0xffff).is_err());
    }

    #[test]
    fn usb_recovery_uses_sof_reference() {
        let config = ClockConfig {
            usb_clock_recovery: true,
            ..ClockConfig::default()
        };
        let internal = ReferenceOscillator::internal::<D21>();
        let planned = plan::<D21>(&internal, 48_000_000, &config).unwrap();
        assert_eq!(planned.reference_frequency_hz, 1_000);
        assert_eq!(planned.integer_ratio, 48_000);
        assert_eq!(mode_for::<D21>(&planned, &config), MultiplierMode::UsbRecovery);

        // no such mode on the DPLL
        let planned = plan::<D51>(&ReferenceOscillator::internal::<D51>(), 120_000_000, &config).unwrap();
        assert_eq!(planned.reference_frequency_hz, 32_768);
        assert_eq!(mode_for::<D51>(&planned, &config), MultiplierMode::ClosedLoop);
    }

    #[test]
    fn unprogrammed_coarse_is_substituted() {
        let factory = Calibration { coarse: 0x3f, fine: 3 };
        assert_eq!(resolve_calibration::<D21>(factory), Calibration { coarse: 0x1f, fine: 512 });
        assert_eq!(resolve_calibration::<D51>(factory), Calibration { coarse: 0x1f, fine: 128 });

        let programmed = Calibration { coarse: 0x22, fine: 77 };
        assert_eq!(resolve_calibration::<D51>(programmed), programmed);
    }

    #[test]
    fn lock_writes_resolved_trim() {
        let mut regs = SimRegisters::new();
        regs.preset(samd51::DFLLVAL, (0x3f << 10) | 0x40);
        regs.force_high(samd51::OSCCTRL_STATUS, samd51::STATUS_DFLLLCKF);
        regs.force_high(samd51::DPLLSTATUS, samd51::DPLLSTATUS_LOCK | samd51::DPLLSTATUS_CLKRDY);
        let mut backend = Samd51::new(regs);
        let config = ClockConfig::default();
        let planned = plan::<D51>(&crystal::<D51>(), 120_000_000, &config).unwrap();

        let locked = lock(&mut backend, &planned, &config).unwrap();
        assert!(locked.locked);
        assert!(locked.same_setting(&planned));
        assert_eq!(backend.regs().writes_to(samd51::DFLLVAL), [(0x1f << 10) | 128]);
    }

    #[test]
    fn lock_timeout_is_reported() {
        let mut regs = SimRegisters::new();
        regs.force_high(samd51::OSCCTRL_STATUS, samd51::STATUS_DFLLLCKF);
        let mut backend = Samd51::new(regs);
        let config = ClockConfig {
            poll_budget: PollBudget(20),
            ..ClockConfig::default()
        };
        let planned = plan::<D51>(&crystal::<D51>(), 120_000_000, &config).unwrap();
        assert_eq!(
            lock(&mut backend, &planned, &config),
            Err(ClockError::LockTimeout { what: "DPLL0 lock" })
        );
    }
}
