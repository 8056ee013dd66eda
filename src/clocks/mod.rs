//! Clock tree engine
//!
//! ```text
//!           init_clock_tree                 set_cpu_frequency
//!                 │                                 │
//!   Reset ──▶ ReferenceReady ──▶ MultiplierLocked ──▶ GeneratorsCommitted ──▶ Stable
//!                 ▲                                                            │
//!                 └──────────────────────── init_clock_tree ───────────────────┘
//! ```
//!
//! Each stage only starts once the previous one reported ready/locked. A
//! failure anywhere puts the hardware back the way it was before the call
//! and leaves the published [`FrequencyState`] alone.

use config::ClockConfig;
use gate::{GateTable, PeripheralChannel, PeripheralId};
use generators::{Generator, GeneratorBank, GeneratorSource, SourceFrequencies};
use multiplier::MultiplierConfig;
use reference::{ReferenceKind, ReferenceOscillator};
use state::{FrequencySnapshot, FrequencyState};

use crate::backend::{BusClock, ClockBackend, REFERENCE_GENERATOR};

pub mod config;
pub mod gate;
pub mod generators;
pub mod multiplier;
pub mod reference;
pub mod state;

/// Clock configuration errors
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockError {
    /// The requested frequency or divisor can't be produced
    UnsupportedFrequency {
        /// What was out of range
        reason: &'static str,
    },
    /// A ready, lock or sync flag didn't show up within the poll budget
    LockTimeout {
        /// The flag waited for
        what: &'static str,
    },
    /// The generator source isn't ready or locked
    InvalidSource,
    /// No such generator, the generator isn't running, or it can't be used
    /// here
    InvalidGenerator,
    /// The peripheral, or one sharing its channel, is fed by another
    /// generator
    AlreadyBound,
    /// Enabled peripheral clocks still depend on the generator
    GeneratorInUse,
    /// The device doesn't have this peripheral
    UnknownPeripheral,
}

impl ClockError {
    pub(crate) fn unsupported(reason: &'static str) -> Self {
        Self::UnsupportedFrequency { reason }
    }
}

impl core::fmt::Display for ClockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnsupportedFrequency { reason } => write!(f, "unsupported frequency: {reason}"),
            Self::LockTimeout { what } => write!(f, "timed out waiting for {what}"),
            Self::InvalidSource => f.write_str("generator source not ready"),
            Self::InvalidGenerator => f.write_str("invalid generator"),
            Self::AlreadyBound => f.write_str("peripheral bound to another generator"),
            Self::GeneratorInUse => f.write_str("generator still feeds enabled peripherals"),
            Self::UnknownPeripheral => f.write_str("peripheral not present on this device"),
        }
    }
}

/// Upper bound on the number of polls of any hardware flag.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollBudget(pub u32);

impl PollBudget {
    /// 100 000 polls
    pub const DEFAULT: Self = Self(100_000);

    /// Poll `done` until it returns `true`, at most `self.0` times (and at
    /// least once).
    pub fn wait(self, what: &'static str, mut done: impl FnMut() -> bool) -> Result<(), ClockError> {
        for _ in 0..self.0.max(1) {
            if done() {
                return Ok(());
            }
            spin();
        }
        warn!("timed out waiting for {}", what);
        Err(ClockError::LockTimeout { what })
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[inline(always)]
fn spin() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::nop();
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    core::hint::spin_loop();
}

/// Bring-up progress, in order.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Nothing configured yet
    Reset,
    /// Reference oscillator running
    ReferenceReady,
    /// Multiplier locked onto the reference
    MultiplierLocked,
    /// Generators written
    GeneratorsCommitted,
    /// Frequencies published
    Stable,
}

/// Multiplier setting and CPU generator divisor for one CPU target.
#[derive(Clone, Copy, Debug)]
struct Plan {
    divisor: u32,
    multiplier: MultiplierConfig,
}

/// Everything a failed reconfiguration has to go back to.
#[derive(Clone, Debug)]
struct Checkpoint {
    phase: Phase,
    reference: ReferenceOscillator,
    multiplier: Option<MultiplierConfig>,
    generators: GeneratorBank,
}

/// The clock tree of one device.
///
/// Holding `&mut ClockTree` is the reconfiguration lock; drivers that only
/// need frequencies read the shared [`FrequencyState`] instead.
pub struct ClockTree<'a, B: ClockBackend> {
    backend: B,
    state: &'a FrequencyState,
    config: ClockConfig,
    phase: Phase,
    reference: ReferenceOscillator,
    multiplier: Option<MultiplierConfig>,
    generators: GeneratorBank,
    gates: GateTable,
}

impl<'a, B: ClockBackend> ClockTree<'a, B> {
    /// Take over a device in its reset clock configuration. Touches no
    /// hardware.
    pub fn new(backend: B, state: &'a FrequencyState, config: ClockConfig) -> Self {
        Self {
            backend,
            state,
            config,
            phase: Phase::Reset,
            reference: ReferenceOscillator::internal::<B>(),
            multiplier: None,
            generators: GeneratorBank::at_reset(B::GENERATORS),
            gates: GateTable::new(),
        }
    }

    /// Bring the whole tree up: reference, multiplier, generators.
    ///
    /// The multiplier runs at `target * d` for the smallest generator 0
    /// divisor `d` that puts it in its valid range. Calling this again with
    /// the same arguments writes nothing and publishes nothing new.
    pub fn init_clock_tree(
        &mut self,
        target_cpu_frequency_hz: u32,
        reference: ReferenceKind,
    ) -> Result<FrequencySnapshot, ClockError> {
        info!("{} clock tree: {} Hz from {:?}", B::NAME, target_cpu_frequency_hz, reference);
        let plan = self.plan(target_cpu_frequency_hz, reference)?;
        self.discard_staged();

        let checkpoint = self.checkpoint();
        match self.bring_up(reference, plan) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                self.recover(checkpoint);
                Err(err)
            }
        }
    }

    /// Retarget the CPU frequency on the current reference.
    ///
    /// The multiplier is left alone if it is already locked at the needed
    /// ratio.
    pub fn set_cpu_frequency(&mut self, target_hz: u32) -> Result<FrequencySnapshot, ClockError> {
        info!("retargeting CPU to {} Hz", target_hz);
        let plan = self.plan(target_hz, self.reference.kind)?;
        self.discard_staged();

        let checkpoint = self.checkpoint();
        match self.retarget(plan) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                self.recover(checkpoint);
                Err(err)
            }
        }
    }

    /// Published CPU frequency.
    pub fn cpu_frequency(&self) -> u32 {
        self.state.cpu_frequency()
    }

    /// Published bus frequency.
    pub fn bus_frequency(&self) -> u32 {
        self.state.bus_frequency()
    }

    /// Stage a generator change, applied by [`ClockTree::commit`].
    pub fn configure_generator(
        &mut self,
        index: usize,
        source: GeneratorSource,
        divisor: u32,
    ) -> Result<(), ClockError> {
        if index >= B::GENERATORS {
            return Err(ClockError::InvalidGenerator);
        }
        if index == REFERENCE_GENERATOR && self.reference_generator_held() {
            return Err(ClockError::GeneratorInUse);
        }
        if self.sources().of(source).is_none() {
            return Err(ClockError::InvalidSource);
        }
        if !(1..=B::max_divisor(index)).contains(&divisor) {
            return Err(ClockError::unsupported("generator divisor out of range"));
        }

        self.generators.stage(index, Generator::new(source, divisor));
        Ok(())
    }

    /// Stage disabling a generator. Generator 0 runs the CPU and can't be
    /// disabled, generator 1 can't while the multiplier locks onto it.
    pub fn disable_generator(&mut self, index: usize) -> Result<(), ClockError> {
        if index == 0 {
            return Err(ClockError::InvalidGenerator);
        }
        let current = self.generators.effective(index).ok_or(ClockError::InvalidGenerator)?;
        if self.generator_in_use(index) {
            return Err(ClockError::GeneratorInUse);
        }

        self.generators.stage(
            index,
            Generator {
                enabled: false,
                ..current
            },
        );
        Ok(())
    }

    /// Write every staged generator change and publish the resulting
    /// frequencies.
    ///
    /// On failure nothing staged survives and the generators already written
    /// are put back.
    pub fn commit(&mut self) -> Result<FrequencySnapshot, ClockError> {
        let in_use = self.generators.staged_disables().any(|index| self.generator_in_use(index));
        if in_use {
            self.generators.discard();
            return Err(ClockError::GeneratorInUse);
        }
        self.commit_staged()
    }

    /// Feed `peripheral` from generator `generator_index`.
    pub fn enable_peripheral_clock(&mut self, peripheral: PeripheralId, generator_index: usize) -> Result<(), ClockError> {
        let running = self.generators.is_enabled(generator_index);
        self.gates.enable(
            &mut self.backend,
            peripheral,
            generator_index,
            running,
            self.config.poll_budget,
        )
    }

    /// Stop the clocks of `peripheral`.
    pub fn disable_peripheral_clock(&mut self, peripheral: PeripheralId) -> Result<(), ClockError> {
        self.gates.disable(&mut self.backend, peripheral, self.config.poll_budget)
    }

    /// Clock frequency seen by an enabled peripheral.
    pub fn peripheral_frequency(&self, peripheral: PeripheralId) -> Option<u32> {
        let channel = self.gates.get(peripheral)?;
        match B::gate(peripheral)?.channel {
            None => Some(self.bus_frequency()),
            Some(_) => self.generators.frequency(channel.generator_index, &self.sources()),
        }
    }

    /// Gate record of an enabled peripheral.
    pub fn peripheral(&self, peripheral: PeripheralId) -> Option<PeripheralChannel> {
        self.gates.get(peripheral)
    }

    /// Committed generator setting.
    pub fn generator(&self, index: usize) -> Option<Generator> {
        self.generators.get(index)
    }

    /// Output frequency of a committed generator.
    pub fn generator_frequency(&self, index: usize) -> Option<u32> {
        self.generators.frequency(index, &self.sources())
    }

    /// Bring-up progress.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Active reference oscillator.
    pub fn reference(&self) -> &ReferenceOscillator {
        &self.reference
    }

    /// Locked multiplier setting.
    pub fn multiplier(&self) -> Option<&MultiplierConfig> {
        self.multiplier.as_ref()
    }

    /// Runtime options.
    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Published frequencies.
    pub fn state(&self) -> &'a FrequencyState {
        self.state
    }

    /// Device backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Give back the backend.
    pub fn free(self) -> B {
        self.backend
    }

    /// The locked multiplier takes its reference from generator 1.
    fn reference_generator_held(&self) -> bool {
        self.multiplier
            .is_some_and(|m| m.locked && multiplier::takes_reference_generator::<B>(&m, &self.config))
    }

    fn generator_in_use(&self, index: usize) -> bool {
        self.gates.bound_to(index) || (index == REFERENCE_GENERATOR && self.reference_generator_held())
    }

    fn sources(&self) -> SourceFrequencies {
        let crystal = (self.reference.kind == ReferenceKind::ExternalCrystal && self.reference.ready)
            .then_some(self.reference.nominal_frequency_hz);
        SourceFrequencies {
            internal: self.backend.internal_source_hz(),
            internal_32k: B::INTERNAL_REFERENCE_HZ,
            crystal,
            multiplier: self.multiplier.filter(|m| m.locked).map(|m| m.output_frequency_hz()),
        }
    }

    /// CPU and bus frequency of the committed generators.
    fn frequencies(&self) -> (u32, u32) {
        let sources = self.sources();
        let cpu = self.generators.frequency(0, &sources).unwrap_or(0);
        let bus = match B::BUS {
            BusClock::FollowsCpu => cpu,
            BusClock::Generator(index) => self.generators.frequency(index, &sources).unwrap_or(cpu),
        };
        (cpu, bus)
    }

    fn plan(&self, target_hz: u32, kind: ReferenceKind) -> Result<Plan, ClockError> {
        if target_hz == 0 {
            return Err(ClockError::unsupported("target frequency is zero"));
        }
        let reference = if self.reference.kind == kind {
            self.reference
        } else {
            ReferenceOscillator::inactive::<B>(kind)
        };

        let range = B::MULTIPLIER_RANGE;
        for divisor in 1..=B::max_divisor(0) {
            let output = u64::from(target_hz) * u64::from(divisor);
            if output > u64::from(*range.end()) {
                break;
            }
            if output < u64::from(*range.start()) {
                continue;
            }
            if let Ok(multiplier) = multiplier::plan::<B>(&reference, output as u32, &self.config) {
                debug!("multiplier at {} Hz, CPU divisor {}", output, divisor);
                return Ok(Plan { divisor, multiplier });
            }
        }

        warn!("{} Hz can't be reached", target_hz);
        Err(ClockError::unsupported("no CPU divisor brings the target into the multiplier range"))
    }

    fn discard_staged(&mut self) {
        if self.generators.has_pending() {
            debug!("dropping uncommitted generator changes");
            self.generators.discard();
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            phase: self.phase,
            reference: self.reference,
            multiplier: self.multiplier,
            generators: self.generators.clone(),
        }
    }

    fn bring_up(&mut self, kind: ReferenceKind, plan: Plan) -> Result<FrequencySnapshot, ClockError> {
        let calibration = match kind {
            ReferenceKind::Internal => self.config.internal_calibration,
            ReferenceKind::ExternalCrystal => None,
        };
        let active = self.reference.kind == kind && self.reference.ready && self.reference.calibration == calibration;
        if !active {
            self.reference = reference::activate(&mut self.backend, kind, calibration, &self.config)?;
        }
        self.phase = Phase::ReferenceReady;

        self.retarget(plan)
    }

    fn retarget(&mut self, plan: Plan) -> Result<FrequencySnapshot, ClockError> {
        let relock = !self
            .multiplier
            .is_some_and(|m| m.locked && m.same_setting(&plan.multiplier));

        if relock {
            self.park()?;
            self.multiplier = None;

            let reference_source = match self.reference.kind {
                ReferenceKind::Internal => GeneratorSource::Internal32k,
                ReferenceKind::ExternalCrystal => GeneratorSource::Crystal,
            };
            self.generators.stage(REFERENCE_GENERATOR, Generator::new(reference_source, 1));
            self.apply_staged()?;

            self.multiplier = Some(multiplier::lock(&mut self.backend, &plan.multiplier, &self.config)?);
        } else {
            debug!("multiplier already locked at this ratio");
        }
        self.phase = Phase::MultiplierLocked;

        self.generators.stage(0, Generator::new(GeneratorSource::MultiplierOutput, plan.divisor));
        if self.config.auxiliary_generators {
            for &(index, generator) in B::AUXILIARY_GENERATORS {
                self.generators.stage(index, generator);
            }
        }
        self.commit_staged()
    }

    /// Move the CPU off the multiplier so it can be reprogrammed.
    fn park(&mut self) -> Result<(), ClockError> {
        if !self.generators.uses(0, GeneratorSource::MultiplierOutput) {
            return Ok(());
        }
        debug!("parking GCLK0 on the internal oscillator");
        self.generators.stage(0, Generator::new(GeneratorSource::Internal, 1));
        self.apply_staged()
    }

    /// Apply staged generators, keeping flash wait states sufficient for the
    /// faster of the old and new CPU frequency while switching.
    fn apply_staged(&mut self) -> Result<(), ClockError> {
        let sources = self.sources();
        let before = self.generators.frequency(0, &sources).unwrap_or(0);
        let after = self
            .generators
            .effective(0)
            .and_then(|g| g.frequency(&sources))
            .unwrap_or(before);
        self.backend.set_flash_wait_states(before.max(after));

        let result = self.generators.apply(&mut self.backend, &sources, self.config.poll_budget);

        let now = self.generators.frequency(0, &sources).unwrap_or(before);
        self.backend.set_flash_wait_states(now);
        result
    }

    fn commit_staged(&mut self) -> Result<FrequencySnapshot, ClockError> {
        self.apply_staged()?;
        self.phase = Phase::GeneratorsCommitted;

        let (cpu, bus) = self.frequencies();
        let snapshot = self.state.publish(cpu, bus);
        info!("clocks committed: CPU {} Hz, bus {} Hz (v{})", cpu, bus, snapshot.version);
        self.phase = Phase::Stable;
        Ok(snapshot)
    }

    /// Return to `previous` after a failed reconfiguration.
    ///
    /// If the hardware can't be fully restored, the frequencies it is
    /// actually running at are published instead.
    fn recover(&mut self, previous: Checkpoint) {
        warn!("reconfiguration failed, restoring previous clock tree");
        self.generators.discard();
        let started_crystal = previous.reference.kind == ReferenceKind::Internal
            && self.reference.kind == ReferenceKind::ExternalCrystal;
        let mut clean = true;

        if let Some(locked) = previous.multiplier.filter(|m| Some(*m) != self.multiplier) {
            clean &= self.park().is_ok();
            self.reference = previous.reference;
            if let Some(reference_generator) = previous.generators.get(REFERENCE_GENERATOR) {
                self.generators.stage(REFERENCE_GENERATOR, reference_generator);
            }
            clean &= self.apply_staged().is_ok();
            self.multiplier = match multiplier::lock(&mut self.backend, &locked, &self.config) {
                Ok(relocked) => Some(relocked),
                Err(_) => {
                    clean = false;
                    None
                }
            };
        }

        self.reference = previous.reference;
        for index in 0..self.generators.count() {
            if let Some(generator) = previous.generators.get(index) {
                self.generators.stage(index, generator);
            }
        }
        clean &= self.apply_staged().is_ok();

        // a multiplier started by this attempt, locked or not
        if previous.multiplier.is_none() && self.phase > previous.phase {
            clean &= self.backend.stop_multiplier(self.config.poll_budget).is_ok();
            self.multiplier = None;
        }
        if started_crystal {
            self.backend.stop_crystal();
        }
        self.phase = previous.phase;

        if !clean {
            error!("clock tree only partially restored");
            let (cpu, bus) = self.frequencies();
            self.state.publish(cpu, bus);
        }
    }
}
