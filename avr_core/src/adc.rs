// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ADC: successive-approximation converter fed by per-channel millivolt
//! signals.
//!
//! A conversion is a scheduled event 13 (25 for the first) ADC clocks
//! after ADSC, with the ADC clock derived from the ADPS prescaler. When
//! the conversion fires, the trigger-out signal strobes first so a lazy
//! harness can inject fresh channel values before the result is latched.

use crate::cycle_timers::CycleSlot;
use crate::interrupts::Vector;
use crate::irq::{ioctl, DeviceSink, IrqFlags, IrqId, IrqSink};
use crate::machine::{Avr, ConfigError};
use crate::memory::{AdcReg, IoWrite};
use crate::regbit::{regbit_get_array, RegBit};

pub const ADC_IOCTL: u32 = ioctl(*b"adc\0");

pub const ADC_IRQ_ADC0: u32 = 0;
pub const ADC_IRQ_TEMP: u32 = 16;
pub const ADC_IRQ_OUT_TRIGGER: u32 = 17;
pub const ADC_IRQ_COUNT: u32 = 18;

/// Millivolts reported by the bandgap reference channel.
pub const ADC_BANDGAP_MV: u16 = 1100;

/// What a mux selection measures.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MuxMode {
    #[default]
    None,
    /// Single-ended channel.
    Single { src: u8 },
    /// Differential pair with gain.
    Diff { pos: u8, neg: u8, gain: u8 },
    /// Fixed internal level in millivolts (bandgap, ground).
    Reference { mv: u16 },
    /// The on-die temperature channel.
    Temp,
}

/// Reference selection values; zero means "use VCC".
pub const ADC_VREF_VCC: u16 = 0;
pub const ADC_VREF_AREF: u16 = 0xffff;
pub const ADC_VREF_V110: u16 = 1100;
pub const ADC_VREF_V256: u16 = 2560;

#[derive(Clone, Debug, Default)]
pub struct Adc {
    pub r_admux: u16,
    pub mux: [RegBit; 5],
    pub ref_bits: [RegBit; 3],
    pub ref_values: [u16; 8],
    pub adlar: RegBit,
    pub r_adcsra: u16,
    pub aden: RegBit,
    pub adsc: RegBit,
    pub adate: RegBit,
    pub adps: [RegBit; 3],
    pub r_adch: u16,
    pub r_adcl: u16,
    pub r_adcsrb: u16,
    pub adts: [RegBit; 3],
    pub bin: RegBit,
    pub muxmode: [MuxMode; 32],
    pub interrupt: Vector,

    // Runtime state.
    pub irq_base: IrqId,
    pub channels: [u16; 16],
    pub temp_mv: u16,
    pub first_conversion: bool,
    pub converting: bool,
}

pub fn init(avr: &mut Avr) -> Result<(), ConfigError> {
    let names: Vec<String> = (0..16)
        .map(|i| format!("16<adc{}", i))
        .chain(["16<temp".to_string(), ">trigger".to_string()])
        .collect();
    let name_refs: Vec<Option<&str>> = names.iter().map(|s| Some(s.as_str())).collect();
    let base = avr.alloc_irqs(ADC_IOCTL, ADC_IRQ_COUNT, &name_refs);
    {
        let adc = avr.adc.as_mut().unwrap();
        adc.irq_base = base;
        adc.first_conversion = true;
    }
    for i in 0..=ADC_IRQ_TEMP {
        avr.pool.set_flags(IrqId(base.0 + i), IrqFlags::FILTERED);
        avr.pool.listen(
            IrqId(base.0 + i),
            IrqSink::Device(DeviceSink::AdcChannel { index: i as u8 }),
        );
    }

    let adc = avr.adc.as_ref().unwrap();
    let (r_admux, r_adcsra, r_adcsrb, vector) =
        (adc.r_admux, adc.r_adcsra, adc.r_adcsrb, adc.interrupt);
    avr.register_vector(vector)?;
    avr.register_io_write(r_admux, IoWrite::AdcControl { reg: AdcReg::Admux });
    avr.register_io_write(r_adcsra, IoWrite::AdcControl { reg: AdcReg::Adcsra });
    if r_adcsrb != 0 {
        avr.register_io_write(r_adcsrb, IoWrite::AdcControl { reg: AdcReg::Adcsrb });
    }
    Ok(())
}

pub fn reset(avr: &mut Avr) {
    let adc = avr.adc.as_mut().unwrap();
    adc.first_conversion = true;
    adc.converting = false;
    avr.cycle_timer_cancel(CycleSlot::AdcConversion);
}

/// Channel (or temperature) level injected from outside, in millivolts.
pub(crate) fn channel_change(avr: &mut Avr, index: usize, value: u32) {
    let adc = avr.adc.as_mut().unwrap();
    if index == ADC_IRQ_TEMP as usize {
        adc.temp_mv = value as u16;
    } else {
        adc.channels[index] = value as u16;
    }
}

fn reference_mv(avr: &Avr) -> u32 {
    let adc = avr.adc.as_ref().unwrap();
    let sel = regbit_get_array(&avr.data, &adc.ref_bits);
    match adc.ref_values[sel as usize & 7] {
        ADC_VREF_VCC => avr.vcc,
        ADC_VREF_AREF => avr.aref,
        mv => mv as u32,
    }
}

fn conversion_cycles(avr: &Avr) -> u64 {
    let adc = avr.adc.as_ref().unwrap();
    let adps = regbit_get_array(&avr.data, &adc.adps);
    let div = 1u64 << adps.max(1); // ADPS=0 divides by 2 as well.
    let clocks = if adc.first_conversion { 25 } else { 13 };
    div * clocks
}

/// Writes to ADMUX/ADCSRA/ADCSRB.
pub(crate) fn control_write(avr: &mut Avr, reg: AdcReg, addr: u16, v: u8) {
    let adc = avr.adc.as_ref().unwrap();
    let vector = adc.interrupt;
    let (aden, adsc) = (adc.aden, adc.adsc);

    if reg == AdcReg::Adcsra {
        // ADIF is write-one-to-clear; keep it out of the stored byte.
        let mut store = v;
        if vector.raised.from_value(v) != 0 {
            avr.clear_interrupt(vector.vector);
            store &= !(vector.raised.mask << vector.raised.bit);
        }
        avr.store(addr, store);
        let enabled = aden.get(&avr.data) != 0;
        let start = adsc.from_value(v) != 0;
        let busy = avr.adc.as_ref().unwrap().converting;
        if enabled && start && !busy {
            avr.adc.as_mut().unwrap().converting = true;
            let cycles = conversion_cycles(avr);
            avr.cycle_timer_register(cycles, CycleSlot::AdcConversion);
        } else if !enabled {
            avr.adc.as_mut().unwrap().converting = false;
            avr.adc.as_mut().unwrap().first_conversion = true;
            avr.cycle_timer_cancel(CycleSlot::AdcConversion);
            adsc.clear(&mut avr.data);
        }
    } else {
        avr.store(addr, v);
    }
}

/// Scheduled end of conversion.
pub(crate) fn conversion_done(avr: &mut Avr, _when: u64) -> u64 {
    let base = avr.adc.as_ref().unwrap().irq_base;
    // Lazy harnesses refresh their channel injections on this strobe.
    avr.raise_irq(IrqId(base.0 + ADC_IRQ_OUT_TRIGGER), 1);

    let adc = avr.adc.as_ref().unwrap();
    let mux = regbit_get_array(&avr.data, &adc.mux);
    let mode = adc.muxmode[mux as usize & 31];
    let vref = reference_mv(avr).max(1);
    let adc = avr.adc.as_ref().unwrap();

    let value: i32 = match mode {
        MuxMode::None => 0,
        MuxMode::Single { src } => {
            (adc.channels[src as usize & 15] as i32 * 1023) / vref as i32
        }
        MuxMode::Diff { pos, neg, gain } => {
            let d = adc.channels[pos as usize & 15] as i32 - adc.channels[neg as usize & 15] as i32;
            (d * gain as i32 * 512) / vref as i32
        }
        MuxMode::Reference { mv } => (mv as i32 * 1023) / vref as i32,
        MuxMode::Temp => (adc.temp_mv as i32 * 1023) / vref as i32,
    };
    let value = value.clamp(-512, 1023);
    let raw = if matches!(mode, MuxMode::Diff { .. }) {
        (value as u16) & 0x3ff // Two's complement, 10 bits.
    } else {
        value.max(0) as u16
    };

    let adlar = adc.adlar.get(&avr.data) != 0;
    let (r_adcl, r_adch) = (adc.r_adcl, adc.r_adch);
    let out = if adlar { raw << 6 } else { raw };
    avr.data[r_adcl as usize] = out as u8;
    avr.data[r_adch as usize] = (out >> 8) as u8;

    let adc = avr.adc.as_mut().unwrap();
    adc.first_conversion = false;
    adc.converting = false;

    let adsc = avr.adc.as_ref().unwrap().adsc;
    let adate = avr.adc.as_ref().unwrap().adate;
    let adts = avr.adc.as_ref().unwrap().adts;
    adsc.clear(&mut avr.data);
    let vector = avr.adc.as_ref().unwrap().interrupt.vector;
    avr.raise_interrupt(vector);

    // Free-running auto-trigger restarts immediately.
    if adate.get(&avr.data) != 0 && regbit_get_array(&avr.data, &adts) == 0 {
        adsc.set(&mut avr.data);
        avr.adc.as_mut().unwrap().converting = true;
        let cycles = conversion_cycles(avr);
        avr.cycle_timer_register(cycles, CycleSlot::AdcConversion);
    }
    0
}
