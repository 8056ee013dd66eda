use super::reference::Calibration;
use super::PollBudget;

/// Runtime options of the clock engine.
///
/// ```text
///  reference ──▶ multiplier ──▶ GCLK0 (CPU)
///      │                   ├──▶ auxiliary generators   (auxiliary_generators)
///      │                   └──▶ USB clock recovery     (usb_clock_recovery, SAMD21)
///      └── crystal failure detection                    (crystal_fail_safe, SAMD51)
/// ```
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockConfig {
    /// Iterations of every hardware wait before giving up with
    /// [`ClockError::LockTimeout`](super::ClockError::LockTimeout)
    pub poll_budget: PollBudget,
    /// With the internal reference, lock the SAMD21 DFLL onto USB
    /// start-of-frame packets instead of running it open loop.
    /// Ignored on devices without the mode.
    pub usb_clock_recovery: bool,
    /// Arm the crystal failure detector where the device has one, falling
    /// back to the internal oscillator if the crystal stops.
    pub crystal_fail_safe: bool,
    /// Install the device's fixed peripheral generators at bring-up
    /// (SAMD21: 48 MHz, 1 MHz and 1 kHz; SAMD51: 48 MHz and 8 MHz).
    pub auxiliary_generators: bool,
    /// Trim for the internal 32 kHz oscillator, written when it is selected
    /// as reference.
    pub internal_calibration: Option<Calibration>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            poll_budget: PollBudget::DEFAULT,
            usb_clock_recovery: false,
            crystal_fail_safe: true,
            auxiliary_generators: true,
            internal_calibration: None,
        }
    }
}
