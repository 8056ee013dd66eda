//! Published CPU and bus frequencies
//!
//! Drivers that compute baud rates or timer prescalers only need a
//! `&'static FrequencyState`; they never see the engine. The snapshot is
//! swapped as a whole inside a critical section, so a reader gets either
//! the old or the new frequencies, never a mix.

use core::cell::Cell;

use critical_section::Mutex;

use crate::backend::ClockBackend;

/// A consistent set of frequencies.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrequencySnapshot {
    /// Bumped on every change
    pub version: u32,
    /// Generator 0
    pub cpu_frequency_hz: u32,
    /// APB clock
    pub bus_frequency_hz: u32,
}

/// Holder of the current [`FrequencySnapshot`].
pub struct FrequencyState {
    current: Mutex<Cell<FrequencySnapshot>>,
}

impl FrequencyState {
    /// State with the given frequencies at version 0.
    pub const fn new(cpu_frequency_hz: u32, bus_frequency_hz: u32) -> Self {
        Self {
            current: Mutex::new(Cell::new(FrequencySnapshot {
                version: 0,
                cpu_frequency_hz,
                bus_frequency_hz,
            })),
        }
    }

    /// State matching the reset clock configuration of `B`.
    pub const fn at_reset<B: ClockBackend>() -> Self {
        Self::new(B::RESET_CPU_HZ, B::RESET_BUS_HZ)
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> FrequencySnapshot {
        critical_section::with(|cs| self.current.borrow(cs).get())
    }

    /// CPU frequency in Hz.
    pub fn cpu_frequency(&self) -> u32 {
        self.snapshot().cpu_frequency_hz
    }

    /// Bus frequency in Hz.
    pub fn bus_frequency(&self) -> u32 {
        self.snapshot().bus_frequency_hz
    }

    /// Replace the snapshot if the frequencies changed.
    pub(crate) fn publish(&self, cpu_frequency_hz: u32, bus_frequency_hz: u32) -> FrequencySnapshot {
        critical_section::with(|cs| {
            let current = self.current.borrow(cs);
            let snapshot = current.get();
            if snapshot.cpu_frequency_hz == cpu_frequency_hz && snapshot.bus_frequency_hz == bus_frequency_hz {
                return snapshot;
            }

            let next = FrequencySnapshot {
                version: snapshot.version.wrapping_add(1),
                cpu_frequency_hz,
                bus_frequency_hz,
            };
            current.set(next);
            next
        })
    }
}

impl core::fmt::Debug for FrequencyState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("FrequencyState").field(&self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::samd21::Samd21;
    use crate::backend::samd51::Samd51;
    use crate::regs::sim::SimRegisters;

    static SHARED: FrequencyState = FrequencyState::new(8_000_000, 8_000_000);

    #[test]
    fn reset_values_come_from_backend() {
        let d21 = FrequencyState::at_reset::<Samd21<SimRegisters>>();
        assert_eq!(d21.cpu_frequency(), 1_000_000);
        let d51 = FrequencyState::at_reset::<Samd51<SimRegisters>>();
        assert_eq!(d51.snapshot(), FrequencySnapshot { version: 0, cpu_frequency_hz: 48_000_000, bus_frequency_hz: 48_000_000 });
    }

    #[test]
    fn publish_bumps_version_only_on_change() {
        let state = FrequencyState::new(48_000_000, 48_000_000);
        let first = state.publish(120_000_512, 48_000_000);
        assert_eq!(first.version, 1);
        let again = state.publish(120_000_512, 48_000_000);
        assert_eq!(again, first);
        assert_eq!(state.publish(48_000_000, 48_000_000).version, 2);
        assert_eq!(state.bus_frequency(), 48_000_000);
    }

    #[test]
    fn readers_see_whole_snapshots() {
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 1..=1_000u32 {
                    SHARED.publish(i * 1_000, i * 1_000);
                }
            });
            for _ in 0..1_000 {
                let snapshot = SHARED.snapshot();
                assert_eq!(snapshot.cpu_frequency_hz, snapshot.bus_frequency_hz);
            }
        });
    }
}
