// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! I/O port peripheral: DDR/PORT/PIN plus the per-pin signal fabric that
//! everything else (external interrupts, timer capture and compare pins,
//! harness code) plugs into.
//!
//! Signal layout per port, discoverable under `iog<letter>`:
//! indices 0..7 are the per-bit pins (bidirectional: raise to drive the
//! external level, listen to see effective-level changes), 8 reports PORT
//! register writes, 9 reports DDR writes, 10 strobes on firmware PIN reads
//! (the lazy-input hook), and 11 carries the whole effective pin byte on
//! any change.

use crate::interrupts::Vector;
use crate::irq::{ioctl_instance, DeviceSink, IrqId, IrqSink};
use crate::machine::{Avr, ConfigError};
use crate::memory::{IoRead, IoWrite, PortReg};
use crate::regbit::RegBit;

pub const IOPORT_IRQ_PIN0: u32 = 0;
pub const IOPORT_IRQ_REG_PORT: u32 = 8;
pub const IOPORT_IRQ_REG_DDR: u32 = 9;
pub const IOPORT_IRQ_REG_PIN: u32 = 10;
pub const IOPORT_IRQ_PIN_ALL: u32 = 11;
pub const IOPORT_IRQ_COUNT: u32 = 12;

/// OR'd into a per-pin raise to force the level regardless of DDR (timer
/// compare outputs, externally driven lines).
pub const IOPORT_OUTPUT: u32 = 0x100;

pub const fn ioport_getirq_key(name: char) -> u32 {
    ioctl_instance(*b"iog", name)
}

/// Pin-change interrupt bank attached to a port.
#[derive(Copy, Clone, Debug, Default)]
pub struct PcintConfig {
    pub vector: Vector,
    pub r_pcmsk: u16,
}

#[derive(Default)]
pub struct Ioport {
    pub name: char,
    pub r_port: u16,
    pub r_ddr: u16,
    pub r_pin: u16,
    pub pcint: Option<PcintConfig>,

    // Runtime state.
    pub irq_base: IrqId,
    /// Last externally injected level per pin.
    pub external: u8,
    /// Pins that have ever been externally driven.
    pub driven: u8,
    /// Pins forced by an OUTPUT-flagged raise, and their forced levels.
    pub override_mask: u8,
    pub override_val: u8,
}

impl Ioport {
    /// Effective pin byte under the current register and external state.
    fn effective(&self, avr: &Avr) -> u8 {
        let ddr = avr.data[self.r_ddr as usize];
        let port = avr.data[self.r_port as usize];
        let mut out = port & ddr;
        // Input pins: externally driven level, else pull-up, else low.
        let inputs = !ddr;
        out |= inputs & self.driven & self.external;
        if avr.pullups_enabled {
            out |= inputs & !self.driven & port;
        }
        // Forced pins win over everything.
        (out & !self.override_mask) | (self.override_val & self.override_mask)
    }
}

pub fn init(avr: &mut Avr, index: usize) -> Result<(), ConfigError> {
    let port = &avr.ports[index];
    let name = port.name;
    let (r_port, r_ddr, r_pin) = (port.r_port, port.r_ddr, port.r_pin);
    let pcint = port.pcint;

    let names: Vec<String> = (0..8)
        .map(|i| format!("{}{}", name, i))
        .chain(
            ["port", "ddr", "pin", "all"]
                .iter()
                .map(|s| format!("8>{}", s)),
        )
        .collect();
    let name_refs: Vec<Option<&str>> = names.iter().map(|s| Some(s.as_str())).collect();
    let base = avr.alloc_irqs(ioport_getirq_key(name), IOPORT_IRQ_COUNT, &name_refs);
    avr.ports[index].irq_base = base;

    // The per-pin signals' device sink is the external injection path.
    for bit in 0..8u8 {
        avr.pool.listen(
            IrqId(base.0 + bit as u32),
            IrqSink::Device(DeviceSink::PortPin {
                port: index as u8,
                bit,
            }),
        );
    }

    avr.register_io_write(
        r_port,
        IoWrite::Port {
            port: index as u8,
            reg: PortReg::Port,
        },
    );
    avr.register_io_write(
        r_ddr,
        IoWrite::Port {
            port: index as u8,
            reg: PortReg::Ddr,
        },
    );
    avr.register_io_write(
        r_pin,
        IoWrite::Port {
            port: index as u8,
            reg: PortReg::Pin,
        },
    );
    avr.register_io_read(r_pin, IoRead::PortPin { port: index as u8 });

    if let Some(pc) = pcint {
        avr.register_vector(pc.vector)?;
        if pc.vector.raised.is_valid() {
            avr.register_io_write(pc.vector.raised.reg, IoWrite::PcintMask { port: index as u8 });
        }
        if pc.r_pcmsk != 0 {
            avr.register_io_write(pc.r_pcmsk, IoWrite::PcintMask { port: index as u8 });
        }
    }
    Ok(())
}

pub fn reset(avr: &mut Avr, index: usize) {
    let port = &mut avr.ports[index];
    port.external = 0;
    port.driven = 0;
    port.override_mask = 0;
    port.override_val = 0;
    let r_pin = port.r_pin;
    avr.data[r_pin as usize] = 0;
}

/// Recompute the effective pin byte and publish any change on the per-bit
/// signals, the aggregate signal, and the pin-change interrupt.
fn update_pins(avr: &mut Avr, index: usize) {
    let new = avr.ports[index].effective(avr);
    let r_pin = avr.ports[index].r_pin;
    let old = avr.data[r_pin as usize];
    if new == old {
        return;
    }
    avr.data[r_pin as usize] = new;

    let base = avr.ports[index].irq_base;
    let changed = old ^ new;
    for b in 0..8 {
        if changed & (1 << b) != 0 {
            avr.raise_irq(IrqId(base.0 + b as u32), (new >> b) as u32 & 1);
        }
    }
    avr.raise_irq(IrqId(base.0 + IOPORT_IRQ_PIN_ALL), new as u32);

    if let Some(pc) = avr.ports[index].pcint {
        let mask = if pc.r_pcmsk != 0 {
            avr.data[pc.r_pcmsk as usize]
        } else {
            0xff
        };
        if changed & mask != 0 {
            avr.raise_interrupt(pc.vector.vector);
        }
    }
}

/// Firmware write to PORT, DDR or PIN.
pub(crate) fn reg_write(avr: &mut Avr, index: usize, reg: PortReg, addr: u16, v: u8) {
    let base = avr.ports[index].irq_base;
    match reg {
        PortReg::Port => {
            avr.store(addr, v);
            avr.raise_irq(IrqId(base.0 + IOPORT_IRQ_REG_PORT), v as u32);
        }
        PortReg::Ddr => {
            avr.store(addr, v);
            avr.raise_irq(IrqId(base.0 + IOPORT_IRQ_REG_DDR), v as u32);
        }
        PortReg::Pin => {
            // Writing PIN toggles PORT; the written byte is not stored.
            let r_port = avr.ports[index].r_port;
            let toggled = avr.data[r_port as usize] ^ v;
            avr.store(r_port, toggled);
            avr.raise_irq(IrqId(base.0 + IOPORT_IRQ_REG_PORT), toggled as u32);
        }
    }
    update_pins(avr, index);
}

/// Firmware write to a PCINT mask register, or write-one-to-clear of the
/// bank's flag bit.
pub(crate) fn pcint_mask_write(avr: &mut Avr, index: usize, addr: u16, v: u8) {
    let Some(pc) = avr.ports[index].pcint else {
        return;
    };
    if addr == pc.r_pcmsk {
        avr.store(addr, v);
        return;
    }
    // Flag register: only our own bit, write-one-to-clear semantics.
    if pc.vector.raised.from_value(v) != 0 {
        avr.clear_interrupt(pc.vector.vector);
    }
}

/// Firmware read of PIN: strobe the lazy-input signal first so a harness
/// can inject a fresh level (and possibly fault the instruction).
pub(crate) fn pin_read(avr: &mut Avr, index: usize, _addr: u16) {
    let base = avr.ports[index].irq_base;
    let r_pin = avr.ports[index].r_pin;
    let current = avr.data[r_pin as usize];
    avr.raise_irq(IrqId(base.0 + IOPORT_IRQ_REG_PIN), current as u32);
}

/// Delivery on a per-pin signal: external code (or a chained peripheral
/// output) drives the pin.
pub(crate) fn pin_input(avr: &mut Avr, index: usize, bit: u8, value: u32) {
    let mask = 1u8 << bit;
    let level = (value & 1) as u8;
    let port = &mut avr.ports[index];
    if value & IOPORT_OUTPUT != 0 {
        port.override_mask |= mask;
        if level != 0 {
            port.override_val |= mask;
        } else {
            port.override_val &= !mask;
        }
    } else {
        port.override_mask &= !mask;
        port.driven |= mask;
        if level != 0 {
            port.external |= mask;
        } else {
            port.external &= !mask;
        }
    }
    update_pins(avr, index);
}
