//! Reference oscillator selection

use super::config::ClockConfig;
use super::ClockError;
use crate::backend::ClockBackend;

/// Which oscillator feeds the multiplier.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Always-on internal 32.768 kHz oscillator (OSCULP32K)
    Internal,
    /// External 32.768 kHz crystal (XOSC32K)
    ExternalCrystal,
}

/// Coarse/fine oscillator trim.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Calibration {
    /// Coarse value, `0x3f` when the factory row was never programmed
    pub coarse: u8,
    /// Fine value
    pub fine: u16,
}

/// The oscillator currently feeding the multiplier.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceOscillator {
    /// Oscillator kind
    pub kind: ReferenceKind,
    /// Nominal output frequency
    pub nominal_frequency_hz: u32,
    /// Trim written at activation, if any
    pub calibration: Option<Calibration>,
    /// Ready flag observed
    pub ready: bool,
    /// Crystal failure detection armed
    pub fail_safe: bool,
}

impl ReferenceOscillator {
    /// Not yet started oscillator of the given kind.
    pub const fn inactive<B: ClockBackend>(kind: ReferenceKind) -> Self {
        let nominal_frequency_hz = match kind {
            ReferenceKind::Internal => B::INTERNAL_REFERENCE_HZ,
            ReferenceKind::ExternalCrystal => B::CRYSTAL_HZ,
        };
        Self {
            kind,
            nominal_frequency_hz,
            calibration: None,
            ready: false,
            fail_safe: false,
        }
    }

    /// The internal oscillator, which runs from power-on.
    pub const fn internal<B: ClockBackend>() -> Self {
        let mut this = Self::inactive::<B>(ReferenceKind::Internal);
        this.ready = true;
        this
    }
}

/// Bring up the requested reference.
///
/// On a crystal timeout the crystal is stopped again and the error returned;
/// whatever reference was active before stays in use.
pub(crate) fn activate<B: ClockBackend>(
    backend: &mut B,
    kind: ReferenceKind,
    calibration: Option<Calibration>,
    config: &ClockConfig,
) -> Result<ReferenceOscillator, ClockError> {
    let mut reference = ReferenceOscillator::inactive::<B>(kind);

    match kind {
        ReferenceKind::Internal => {
            if let Some(calibration) = calibration {
                debug!("trimming internal reference: {}", calibration.fine);
                backend.trim_internal_reference(calibration);
                reference.calibration = Some(calibration);
            }
        }
        ReferenceKind::ExternalCrystal => {
            reference.fail_safe = backend.start_crystal(config.crystal_fail_safe);
            if let Err(err) = config.poll_budget.wait("XOSC32K ready", || backend.crystal_ready()) {
                warn!("32k crystal did not start, keeping previous reference");
                backend.stop_crystal();
                return Err(err);
            }
        }
    }

    reference.ready = true;
    info!("{} reference ready at {} Hz", B::NAME, reference.nominal_frequency_hz);
    Ok(reference)
}
