// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! External interrupts: maps port-pin levels and edges onto vectors.
//!
//! Each entry watches one port pin through the signal graph and decodes
//! its ISC sense bits: 00 low-level, 01 any edge, 10 falling, 11 rising.
//! Pins with a single (asynchronous) sense bit only support falling and
//! rising. Level triggering is continuously sensed: the pending state is
//! re-derived whenever the pin, the enable bit or the sense bits change,
//! never on interrupt return.

use enumn::N;

use crate::interrupts::Vector;
use crate::irq::{ioctl, DeviceSink, IrqId, IrqSink};
use crate::machine::{Avr, ConfigError};
use crate::memory::IoWrite;
use crate::regbit::{regbit_get_array, RegBit};

pub const EXTINT_IOCTL: u32 = ioctl(*b"int\0");

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum SenseMode {
    LowLevel = 0,
    AnyEdge = 1,
    Falling = 2,
    Rising = 3,
}

#[derive(Clone, Debug, Default)]
pub struct ExtintEntry {
    /// Name of the controlling port and the pin within it.
    pub port_name: char,
    pub port_pin: u8,
    /// Sense control bits; a nil second descriptor marks an async-only
    /// pin with just falling/rising modes.
    pub isc: [RegBit; 2],
    pub vector: Vector,

    // Runtime state.
    pub port_index: Option<u8>,
    pub previous_enable: u8,
    pub previous_mode: u8,
}

#[derive(Default)]
pub struct Extint {
    pub eint: Vec<ExtintEntry>,
    pub irq_base: IrqId,
}

fn sense_mode(avr: &Avr, entry: &ExtintEntry) -> SenseMode {
    let mut mode = if entry.isc[1].is_valid() {
        regbit_get_array(&avr.data, &entry.isc)
    } else {
        // Async pins collapse to falling/rising.
        entry.isc[0].get(&avr.data) + 2
    };
    if mode > 3 {
        mode &= 3;
    }
    SenseMode::n(mode).unwrap_or(SenseMode::Rising)
}

/// Current level of the entry's source pin.
fn pin_level(avr: &Avr, entry: &ExtintEntry) -> u8 {
    match entry.port_index {
        Some(p) => {
            let r_pin = avr.ports[p as usize].r_pin;
            (avr.data[r_pin as usize] >> entry.port_pin) & 1
        }
        None => 1, // Unconnected pins read high.
    }
}

pub fn init(avr: &mut Avr) -> Result<(), ConfigError> {
    let ext = avr.extint.as_ref().unwrap();
    let count = ext.eint.len() as u32;
    let names: Vec<String> = (0..count).map(|i| format!("<int{}", i)).collect();
    let name_refs: Vec<Option<&str>> = names.iter().map(|s| Some(s.as_str())).collect();
    let base = avr.alloc_irqs(EXTINT_IOCTL, count, &name_refs);
    avr.extint.as_mut().unwrap().irq_base = base;

    let mut regs: Vec<u16> = Vec::new();
    for i in 0..avr.extint.as_ref().unwrap().eint.len() {
        let entry = avr.extint.as_ref().unwrap().eint[i].clone();
        avr.register_vector(entry.vector)?;
        avr.pool.listen(
            IrqId(base.0 + i as u32),
            IrqSink::Device(DeviceSink::ExtintPin { index: i as u8 }),
        );
        let port_index = avr
            .ports
            .iter()
            .position(|p| p.name == entry.port_name)
            .map(|p| p as u8);
        avr.extint.as_mut().unwrap().eint[i].port_index = port_index;

        for reg in [
            entry.vector.enable.reg,
            entry.isc[0].reg,
            entry.isc[1].reg,
            entry.vector.raised.reg,
        ] {
            if reg != 0 && !regs.contains(&reg) {
                regs.push(reg);
                avr.register_io_write(reg, IoWrite::ExtintControl);
            }
        }
    }
    Ok(())
}

pub fn reset(avr: &mut Avr) {
    for i in 0..avr.extint.as_ref().unwrap().eint.len() {
        let entry = &mut avr.extint.as_mut().unwrap().eint[i];
        entry.previous_enable = 0;
        entry.previous_mode = if entry.isc[1].is_valid() { 0 } else { 2 };
    }
}

fn port_pin_irq(avr: &mut Avr, index: usize) -> Option<IrqId> {
    let entry = &avr.extint.as_ref().unwrap().eint[index];
    let port = entry.port_index? as usize;
    let pin = entry.port_pin as u32;
    Some(IrqId(avr.ports[port].irq_base.0 + pin))
}

/// Raise the level-triggered interrupt if the line is asserted (low).
fn test_level(avr: &mut Avr, index: usize) {
    let entry = avr.extint.as_ref().unwrap().eint[index].clone();
    if pin_level(avr, &entry) == 0 {
        avr.set_interrupt_level(entry.vector.vector, true);
        avr.raise_interrupt(entry.vector.vector);
    }
}

fn drop_level(avr: &mut Avr, index: usize) {
    let vector = avr.extint.as_ref().unwrap().eint[index].vector.vector;
    avr.set_interrupt_level(vector, false);
    avr.clear_interrupt(vector);
}

/// An enable, sense-control or flag register was written.
pub(crate) fn status_change(avr: &mut Avr, addr: u16, v: u8) {
    // Flag registers are write-one-to-clear and are not stored.
    let mut is_flag_reg = false;
    for entry in &avr.extint.as_ref().unwrap().eint {
        if entry.vector.raised.reg == addr {
            is_flag_reg = true;
        }
    }
    if is_flag_reg {
        let count = avr.extint.as_ref().unwrap().eint.len();
        for i in 0..count {
            let entry = avr.extint.as_ref().unwrap().eint[i].clone();
            if entry.vector.raised.reg == addr && entry.vector.raised.from_value(v) != 0 {
                avr.clear_interrupt(entry.vector.vector);
            }
        }
        return;
    }

    avr.store(addr, v);
    let count = avr.extint.as_ref().unwrap().eint.len();
    for i in 0..count {
        let entry = avr.extint.as_ref().unwrap().eint[i].clone();
        let enable = entry.vector.enable.get(&avr.data);
        let mode = sense_mode(avr, &entry) as u8;
        let ext_irq = IrqId(avr.extint.as_ref().unwrap().irq_base.0 + i as u32);

        if enable != entry.previous_enable {
            if enable != 0 {
                // Start watching the pin.
                if let Some(pin_irq) = port_pin_irq(avr, i) {
                    avr.connect_irq(pin_irq, ext_irq);
                    // Seed the edge detector with the current level.
                    avr.pool.get_mut(ext_irq).value = pin_level(avr, &entry) as u32;
                }
                if mode == SenseMode::LowLevel as u8 {
                    test_level(avr, i);
                }
            } else {
                if let Some(pin_irq) = port_pin_irq(avr, i) {
                    avr.unconnect_irq(pin_irq, ext_irq);
                }
                drop_level(avr, i);
            }
        } else if enable != 0 && mode != entry.previous_mode {
            // Level is continuously sensed: re-derive it on any sense
            // change instead of waiting for the handler to return.
            if entry.previous_mode == SenseMode::LowLevel as u8 {
                drop_level(avr, i);
            } else if mode == SenseMode::LowLevel as u8 {
                test_level(avr, i);
            }
        }
        let entry = &mut avr.extint.as_mut().unwrap().eint[i];
        entry.previous_enable = enable;
        entry.previous_mode = mode;
    }
}

/// Delivery from the watched pin (or a direct harness raise).
pub(crate) fn pin_change(avr: &mut Avr, index: usize, src: IrqId, value: u32) {
    let entry = avr.extint.as_ref().unwrap().eint[index].clone();
    let old = avr.pool.value(src) & 1;
    let new = value & 1;
    let up = old == 0 && new == 1;
    let down = old == 1 && new == 0;

    match sense_mode(avr, &entry) {
        SenseMode::LowLevel => {
            if new == 0 {
                avr.set_interrupt_level(entry.vector.vector, true);
                avr.raise_interrupt(entry.vector.vector);
            } else {
                drop_level(avr, index);
            }
        }
        SenseMode::AnyEdge => {
            if up || down {
                avr.raise_interrupt(entry.vector.vector);
            }
        }
        SenseMode::Falling => {
            if down {
                avr.raise_interrupt(entry.vector.vector);
            }
        }
        SenseMode::Rising => {
            if up {
                avr.raise_interrupt(entry.vector.vector);
            }
        }
    }
}
