//! Peripheral clock gates
//!
//! A peripheral needs two clocks: its bus interface clock (a mask bit) and,
//! for most peripherals, a generic clock channel routed from a generator.
//! Some channels are shared by two peripherals (SAMD21 `TC4_TC5`, SAMD51
//! `TC0_TC1`), so both have to agree on the generator.

use super::{ClockError, PollBudget};
use crate::backend::ClockBackend;

macro_rules! peripherals {
    ($($(#[$meta:meta])* $name:ident,)*) => {
        /// Peripherals with a clock gate.
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum PeripheralId {
            $($(#[$meta])* $name,)*
        }

        impl PeripheralId {
            /// Every peripheral, in declaration order.
            pub const ALL: &'static [PeripheralId] = &[$(PeripheralId::$name,)*];
            /// Number of peripherals.
            pub const COUNT: usize = Self::ALL.len();

            /// Position in [`PeripheralId::ALL`].
            pub const fn index(self) -> usize {
                self as usize
            }
        }
    };
}

peripherals! {
    /// External interrupt controller
    Eic,
    /// USB device/host
    Usb,
    /// Serial communication interface 0
    Sercom0,
    /// Serial communication interface 1
    Sercom1,
    /// Serial communication interface 2
    Sercom2,
    /// Serial communication interface 3
    Sercom3,
    /// Serial communication interface 4
    Sercom4,
    /// Serial communication interface 5
    Sercom5,
    /// Serial communication interface 6 (SAMD51)
    Sercom6,
    /// Serial communication interface 7 (SAMD51)
    Sercom7,
    /// Timer/counter for control 0
    Tcc0,
    /// Timer/counter for control 1
    Tcc1,
    /// Timer/counter for control 2
    Tcc2,
    /// Timer/counter 0 (SAMD51)
    Tc0,
    /// Timer/counter 1 (SAMD51)
    Tc1,
    /// Timer/counter 2 (SAMD51)
    Tc2,
    /// Timer/counter 3
    Tc3,
    /// Timer/counter 4
    Tc4,
    /// Timer/counter 5
    Tc5,
    /// Analog to digital converter
    Adc0,
    /// Digital to analog converter
    Dac,
    /// I/O port, bus clocked
    Port,
    /// DMA controller, bus clocked
    Dmac,
}

/// A gated peripheral and the generator it is bound to.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeripheralChannel {
    /// Peripheral
    pub peripheral_id: PeripheralId,
    /// Generator feeding it, 0 for bus clocked peripherals
    pub generator_index: usize,
    /// Clock running
    pub enabled: bool,
}

/// Bookkeeping for every gate.
#[derive(Clone, Debug)]
pub(crate) struct GateTable {
    channels: [Option<PeripheralChannel>; PeripheralId::COUNT],
}

impl GateTable {
    pub(crate) const fn new() -> Self {
        Self {
            channels: [None; PeripheralId::COUNT],
        }
    }

    /// Enabled record of `peripheral`.
    pub(crate) fn get(&self, peripheral: PeripheralId) -> Option<PeripheralChannel> {
        self.channels[peripheral.index()].filter(|c| c.enabled)
    }

    /// Any enabled peripheral is fed by `generator`.
    pub(crate) fn bound_to(&self, generator: usize) -> bool {
        self.enabled().any(|c| c.generator_index == generator)
    }

    fn enabled(&self) -> impl Iterator<Item = PeripheralChannel> + '_ {
        self.channels.iter().flatten().copied().filter(|c| c.enabled)
    }

    /// Other enabled peripherals on the same generic clock channel.
    fn sharing<B: ClockBackend>(&self, peripheral: PeripheralId, channel: u8) -> impl Iterator<Item = PeripheralChannel> + '_ {
        self.enabled().filter(move |c| {
            c.peripheral_id != peripheral && B::gate(c.peripheral_id).and_then(|g| g.channel) == Some(channel)
        })
    }

    /// Route `generator` to `peripheral` and open its bus clock.
    ///
    /// `generator_enabled` is the committed state of that generator.
    pub(crate) fn enable<B: ClockBackend>(
        &mut self,
        backend: &mut B,
        peripheral: PeripheralId,
        generator: usize,
        generator_enabled: bool,
        budget: PollBudget,
    ) -> Result<(), ClockError> {
        let gate = B::gate(peripheral).ok_or(ClockError::UnknownPeripheral)?;
        if generator >= B::GENERATORS || !generator_enabled {
            return Err(ClockError::InvalidGenerator);
        }

        if let Some(existing) = self.get(peripheral) {
            return if existing.generator_index == generator {
                Ok(())
            } else {
                Err(ClockError::AlreadyBound)
            };
        }

        match gate.channel {
            // bus clocked peripherals run from the CPU generator
            None if generator != 0 => return Err(ClockError::InvalidGenerator),
            None => {}
            Some(channel) => {
                let mut shared = false;
                for other in self.sharing::<B>(peripheral, channel) {
                    if other.generator_index != generator {
                        return Err(ClockError::AlreadyBound);
                    }
                    shared = true;
                }
                // a shared channel is already running for the other peripheral
                if !shared {
                    backend.write_channel(channel, generator, true, budget)?;
                }
            }
        }

        backend.set_bus_mask(gate.mask, true);
        self.channels[peripheral.index()] = Some(PeripheralChannel {
            peripheral_id: peripheral,
            generator_index: generator,
            enabled: true,
        });
        debug!("{:?} clocked from GCLK{}", peripheral, generator);
        Ok(())
    }

    /// Stop the channel unless it is shared with another enabled peripheral,
    /// then close the bus clock. Generators are not touched.
    ///
    /// If the channel doesn't stop, the peripheral stays recorded and its
    /// bus clock stays open.
    pub(crate) fn disable<B: ClockBackend>(
        &mut self,
        backend: &mut B,
        peripheral: PeripheralId,
        budget: PollBudget,
    ) -> Result<(), ClockError> {
        let gate = B::gate(peripheral).ok_or(ClockError::UnknownPeripheral)?;
        let Some(existing) = self.get(peripheral) else {
            return Ok(());
        };

        if let Some(channel) = gate.channel {
            if self.sharing::<B>(peripheral, channel).next().is_none() {
                backend.write_channel(channel, existing.generator_index, false, budget)?;
            }
        }
        backend.set_bus_mask(gate.mask, false);

        self.channels[peripheral.index()] = None;
        debug!("{:?} clock stopped", peripheral);
        Ok(())
    }
}
