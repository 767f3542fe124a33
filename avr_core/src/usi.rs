// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Universal Serial Interface, software-clocked modes.
//!
//! USIDR shifts on USICLK (and on USITC when USICS0 selects it), the
//! 4-bit counter overflow raises the USI_OVF vector, and the data output
//! is published on a signal that chip tables chain to the DO pin. Timer
//! and external-clock counter sources are not modeled.

use crate::interrupts::Vector;
use crate::irq::{ioctl, DeviceSink, IrqId, IrqSink};
use crate::machine::{Avr, ConfigError};
use crate::memory::{IoWrite, UsiReg};
use crate::regbit::RegBit;

pub const USI_IOCTL: u32 = ioctl(*b"usi\0");

pub const USI_IRQ_DO: u32 = 0;
pub const USI_IRQ_DI: u32 = 1;
pub const USI_IRQ_CLOCK: u32 = 2;
pub const USI_IRQ_COUNT: u32 = 3;

#[derive(Clone, Debug, Default)]
pub struct Usi {
    pub r_usidr: u16,
    pub r_usisr: u16,
    pub r_usicr: u16,
    pub usioif: RegBit,
    pub usiwm: [RegBit; 2],
    pub usics: [RegBit; 2],
    pub usiclk: RegBit,
    pub usitc: RegBit,
    pub overflow: Vector,
    /// DI / SCK pins, chained from the port at init.
    pub di_pin: Option<(char, u8)>,
    pub sck_pin: Option<(char, u8)>,

    // Runtime state.
    pub irq_base: IrqId,
    pub di_level: u8,
}

pub fn init(avr: &mut Avr) -> Result<(), ConfigError> {
    let base = avr.alloc_irqs(
        USI_IOCTL,
        USI_IRQ_COUNT,
        &[Some(">do"), Some("<di"), Some(">clock")],
    );
    avr.usi.as_mut().unwrap().irq_base = base;
    avr.pool
        .listen(IrqId(base.0 + USI_IRQ_DI), IrqSink::Device(DeviceSink::UsiDataIn));

    let usi = avr.usi.as_ref().unwrap();
    let (r_usicr, r_usisr, overflow, di_pin) =
        (usi.r_usicr, usi.r_usisr, usi.overflow, usi.di_pin);
    avr.register_vector(overflow)?;
    avr.register_io_write(r_usicr, IoWrite::UsiControl { reg: UsiReg::Usicr });
    avr.register_io_write(r_usisr, IoWrite::UsiControl { reg: UsiReg::Usisr });

    // Listen to the DI pin through the port fabric.
    if let Some(pin) = di_pin {
        if let Some(port) = avr.ports.iter().find(|p| p.name == pin.0) {
            let pin_irq = IrqId(port.irq_base.0 + pin.1 as u32);
            avr.connect_irq(pin_irq, IrqId(base.0 + USI_IRQ_DI));
        }
    }
    Ok(())
}

pub fn reset(avr: &mut Avr) {
    avr.usi.as_mut().unwrap().di_level = 0;
}

pub(crate) fn di_change(avr: &mut Avr, value: u32) {
    avr.usi.as_mut().unwrap().di_level = (value & 1) as u8;
}

fn counter(avr: &Avr) -> u8 {
    avr.data[avr.usi.as_ref().unwrap().r_usisr as usize] & 0x0f
}

fn set_counter(avr: &mut Avr, v: u8) {
    let r_usisr = avr.usi.as_ref().unwrap().r_usisr;
    let byte = &mut avr.data[r_usisr as usize];
    *byte = (*byte & 0xf0) | (v & 0x0f);
}

/// One shift-register clock: shift DI in, publish the new MSB on DO,
/// bump the counter and raise the overflow on wrap.
fn tick(avr: &mut Avr) {
    let usi = avr.usi.as_ref().unwrap();
    let (r_usidr, base, di) = (usi.r_usidr, usi.irq_base, usi.di_level);
    let v = avr.data[r_usidr as usize];
    let shifted = (v << 1) | di;
    avr.data[r_usidr as usize] = shifted;
    avr.raise_irq(IrqId(base.0 + USI_IRQ_DO), (shifted >> 7) as u32);

    let next = (counter(avr) + 1) & 0x0f;
    set_counter(avr, next);
    if next == 0 {
        let usi = avr.usi.as_ref().unwrap();
        let (usioif, vector) = (usi.usioif, usi.overflow.vector);
        usioif.set(&mut avr.data);
        avr.raise_interrupt(vector);
    }
}

pub(crate) fn control_write(avr: &mut Avr, reg: UsiReg, addr: u16, v: u8) {
    let usi = avr.usi.as_ref().unwrap();
    let (usiclk, usitc, usics, usioif, vector, base, sck_pin) = (
        usi.usiclk,
        usi.usitc,
        usi.usics,
        usi.usioif,
        usi.overflow.vector,
        usi.irq_base,
        usi.sck_pin,
    );
    match reg {
        UsiReg::Usisr => {
            // Counter bits store; flags are write-one-to-clear.
            let mut store = avr.data[addr as usize] & 0xf0 | (v & 0x0f);
            if usioif.from_value(v) != 0 {
                avr.clear_interrupt(vector);
                store &= !(usioif.mask << usioif.bit);
            }
            avr.store(addr, store);
        }
        UsiReg::Usicr => {
            // Strobe bits act and are not stored.
            let strobes = (usiclk.mask << usiclk.bit) | (usitc.mask << usitc.bit);
            avr.store(addr, v & !strobes);
            if usiclk.from_value(v) != 0 {
                tick(avr);
            }
            if usitc.from_value(v) != 0 {
                // Toggle the clock line; in USICS=x1 mode the toggle is
                // also the shift clock.
                let level = avr.pool.value(IrqId(base.0 + USI_IRQ_CLOCK)) ^ 1;
                avr.raise_irq(IrqId(base.0 + USI_IRQ_CLOCK), level & 1);
                if let Some(pin) = sck_pin {
                    if let Some(port) = avr.ports.iter().find(|p| p.name == pin.0) {
                        let pin_irq = IrqId(port.irq_base.0 + pin.1 as u32);
                        avr.raise_irq(pin_irq, crate::ioport::IOPORT_OUTPUT | (level & 1));
                    }
                }
                if usics[0].from_value(avr.data[addr as usize]) != 0 {
                    tick(avr);
                }
            }
        }
    }
}
