#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

//! Clock tree bring-up for SAMD21 and SAMD51 microcontrollers.
//!
//! The engine walks the clock tree from reset to a requested CPU frequency:
//!
//! ```text
//!  reference ──▶ DFLL / DPLL ──▶ GCLK0..GCLKn ──▶ peripheral channels
//!  (32k xtal        (locked)        (divided)        (gated per
//!   or internal)                                      peripheral)
//! ```
//!
//! Each stage only runs once the stage before it reports ready/locked, every
//! hardware wait is a bounded poll, and the published [`FrequencyState`] is
//! replaced atomically, and only after a generator commit succeeded.
//!
//! ```rust,ignore
//! use samd_clocks::{ClockConfig, ClockTree, FrequencyState, PeripheralId, ReferenceKind};
//! use samd_clocks::backend::DefaultBackend;
//! use samd_clocks::regs::Mmio;
//!
//! static FREQUENCIES: FrequencyState = FrequencyState::at_reset::<DefaultBackend<Mmio>>();
//!
//! let backend = DefaultBackend::new(unsafe { Mmio::new() });
//! let mut clocks = ClockTree::new(backend, &FREQUENCIES, ClockConfig::default());
//! clocks.init_clock_tree(120_000_000, ReferenceKind::ExternalCrystal)?;
//! clocks.enable_peripheral_clock(PeripheralId::Sercom0, 2)?;
//! ```
//!
//! ## Feature flags
#![doc = document_features::document_features!()]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod backend;
pub mod clocks;
pub mod regs;

pub use clocks::config::ClockConfig;
pub use clocks::gate::PeripheralId;
pub use clocks::generators::{Generator, GeneratorSource};
pub use clocks::multiplier::MultiplierConfig;
pub use clocks::reference::{Calibration, ReferenceKind, ReferenceOscillator};
pub use clocks::state::{FrequencySnapshot, FrequencyState};
pub use clocks::{ClockError, ClockTree, Phase};
