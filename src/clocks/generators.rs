//! Generic clock generator bank
//!
//! Changes are staged and only reach the hardware on [`GeneratorBank::apply`],
//! which writes them in index order and puts already written generators back
//! if a write times out.

use super::{ClockError, PollBudget};
use crate::backend::ClockBackend;

/// Largest generator count of any supported device.
pub const MAX_GENERATORS: usize = 12;

/// Generator input.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratorSource {
    /// Internal high speed oscillator (SAMD21 OSC8M, SAMD51 DFLL48M)
    Internal,
    /// Internal 32.768 kHz oscillator (OSCULP32K)
    Internal32k,
    /// Multiplier output (SAMD21 DFLL48M, SAMD51 DPLL0)
    MultiplierOutput,
    /// 32.768 kHz crystal (XOSC32K)
    Crystal,
}

/// One generator setting.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Generator {
    /// Input
    pub source: GeneratorSource,
    /// Output = input / divisor
    pub divisor: u32,
    /// Output enabled
    pub enabled: bool,
}

impl Generator {
    /// Enabled generator.
    pub const fn new(source: GeneratorSource, divisor: u32) -> Self {
        Self {
            source,
            divisor,
            enabled: true,
        }
    }

    /// Disabled generator, as found out of reset.
    pub const fn disabled() -> Self {
        Self {
            source: GeneratorSource::Internal,
            divisor: 1,
            enabled: false,
        }
    }

    /// Output frequency, `None` while disabled or while the source isn't
    /// running.
    pub fn frequency(&self, sources: &SourceFrequencies) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        sources.of(self.source).map(|hz| hz / self.divisor.max(1))
    }
}

/// Frequency of each generator source, `None` for sources that are not
/// ready/locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceFrequencies {
    /// [`GeneratorSource::Internal`]
    pub internal: u32,
    /// [`GeneratorSource::Internal32k`]
    pub internal_32k: u32,
    /// [`GeneratorSource::Crystal`]
    pub crystal: Option<u32>,
    /// [`GeneratorSource::MultiplierOutput`]
    pub multiplier: Option<u32>,
}

impl SourceFrequencies {
    /// Frequency of `source`, if it is running.
    pub fn of(&self, source: GeneratorSource) -> Option<u32> {
        match source {
            GeneratorSource::Internal => Some(self.internal),
            GeneratorSource::Internal32k => Some(self.internal_32k),
            GeneratorSource::Crystal => self.crystal,
            GeneratorSource::MultiplierOutput => self.multiplier,
        }
    }
}

/// Committed and staged generator settings.
#[derive(Clone, Debug)]
pub(crate) struct GeneratorBank {
    count: usize,
    current: [Generator; MAX_GENERATORS],
    pending: [Option<Generator>; MAX_GENERATORS],
}

impl GeneratorBank {
    /// Reset state: generator 0 runs the CPU from the internal oscillator.
    pub(crate) fn at_reset(count: usize) -> Self {
        let mut current = [Generator::disabled(); MAX_GENERATORS];
        current[0] = Generator::new(GeneratorSource::Internal, 1);
        Self {
            count: count.min(MAX_GENERATORS),
            current,
            pending: [None; MAX_GENERATORS],
        }
    }

    /// Number of generators.
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// Committed setting.
    pub(crate) fn get(&self, index: usize) -> Option<Generator> {
        (index < self.count).then(|| self.current[index])
    }

    /// Staged setting, or the committed one.
    pub(crate) fn effective(&self, index: usize) -> Option<Generator> {
        (index < self.count).then(|| self.pending[index].unwrap_or(self.current[index]))
    }

    /// Committed, enabled and running from `source`.
    pub(crate) fn uses(&self, index: usize, source: GeneratorSource) -> bool {
        self.get(index).is_some_and(|g| g.enabled && g.source == source)
    }

    pub(crate) fn is_enabled(&self, index: usize) -> bool {
        self.get(index).is_some_and(|g| g.enabled)
    }

    /// Stage `generator` for `index`. Callers validate.
    pub(crate) fn stage(&mut self, index: usize, generator: Generator) {
        if index < self.count {
            self.pending[index] = Some(generator);
        }
    }

    /// Indexes staged to be disabled.
    pub(crate) fn staged_disables(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).filter(|&i| {
            self.pending[i].is_some_and(|g| !g.enabled) && self.current[i].enabled
        })
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending[..self.count].iter().any(Option::is_some)
    }

    pub(crate) fn discard(&mut self) {
        self.pending = [None; MAX_GENERATORS];
    }

    /// Frequency of a committed generator.
    pub(crate) fn frequency(&self, index: usize, sources: &SourceFrequencies) -> Option<u32> {
        self.get(index)?.frequency(sources)
    }

    /// Write every staged change in index order.
    ///
    /// A staged generator whose source isn't running fails with
    /// [`ClockError::InvalidSource`] before anything is written. If a write
    /// times out, the generators written so far (and the one that failed)
    /// are written back with their committed settings. Either way the staged
    /// changes are gone afterwards.
    pub(crate) fn apply<B: ClockBackend>(
        &mut self,
        backend: &mut B,
        sources: &SourceFrequencies,
        budget: PollBudget,
    ) -> Result<(), ClockError> {
        let count = self.count;
        let unready = self.pending[..count]
            .iter()
            .flatten()
            .any(|g| g.enabled && sources.of(g.source).is_none());
        if unready {
            self.discard();
            return Err(ClockError::InvalidSource);
        }

        for index in 0..count {
            let Some(next) = self.pending[index] else {
                continue;
            };
            if next == self.current[index] {
                continue;
            }

            trace!("GCLK{}: {:?} / {}", index, next.source, next.divisor);
            if let Err(err) = backend.write_generator(index, &next, budget) {
                warn!("GCLK{} write failed, restoring generators", index);
                self.restore(backend, index, budget);
                self.discard();
                return Err(err);
            }
        }

        for (current, pending) in self.current[..count].iter_mut().zip(self.pending[..count].iter_mut()) {
            if let Some(next) = pending.take() {
                *current = next;
            }
        }
        Ok(())
    }

    /// Put generators `0..=last` that had changes staged back to their
    /// committed settings, highest index first.
    fn restore<B: ClockBackend>(&self, backend: &mut B, last: usize, budget: PollBudget) {
        for index in (0..=last).rev() {
            match self.pending[index] {
                Some(next) if next != self.current[index] => {
                    if backend.write_generator(index, &self.current[index], budget).is_err() {
                        error!("GCLK{} could not be restored", index);
                    }
                }
                _ => {}
            }
        }
    }
}
