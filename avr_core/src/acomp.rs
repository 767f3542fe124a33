// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Analog comparator.
//!
//! Inputs are millivolt signals: AIN0/AIN1 pins plus the ADC multiplexer
//! channels when ACME routes one onto the negative input. The comparator
//! output (ACO) is re-evaluated one cycle after any input or control
//! change, mirroring the synchronizer on silicon; a change fires the ACIS
//! sense logic, the output signal, and optionally the timer input-capture
//! chain (ACIC).

use crate::cycle_timers::CycleSlot;
use crate::interrupts::Vector;
use crate::irq::{ioctl, DeviceSink, IrqFlags, IrqId, IrqSink};
use crate::machine::{Avr, ConfigError};
use crate::memory::IoWrite;
use crate::regbit::{regbit_get_array, RegBit};
use crate::timer::{timer_getirq_key, TIMER_IRQ_IN_ICP};

pub const ACOMP_IOCTL: u32 = ioctl(*b"acp\0");

pub const ACOMP_IRQ_AIN0: u32 = 0;
pub const ACOMP_IRQ_AIN1: u32 = 1;
pub const ACOMP_IRQ_ADC0: u32 = 2;
pub const ACOMP_IRQ_OUT: u32 = 18;
pub const ACOMP_IRQ_INPUT_STATE: u32 = 19;
pub const ACOMP_IRQ_COUNT: u32 = 20;

pub const ACOMP_BANDGAP_MV: u16 = 1100;

/// Resolved input routing, packed onto the input-state signal as
/// `active | positive << 8 | negative << 16`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AcompInputs {
    pub active: bool,
    /// Positive input: false = AIN0 pin, true = bandgap.
    pub positive_bandgap: bool,
    /// Negative input: 0 = AIN1 pin, 1.. = ADC channel n-1.
    pub negative: u8,
}

impl AcompInputs {
    fn packed(&self) -> u32 {
        self.active as u32
            | (self.positive_bandgap as u32) << 8
            | (self.negative as u32) << 16
    }
}

#[derive(Clone, Debug, Default)]
pub struct Acomp {
    pub mux_inputs: u8,
    pub mux: [RegBit; 4],
    pub pradc: RegBit,
    pub aden: RegBit,
    pub acme: RegBit,
    pub r_acsr: u16,
    pub acis: [RegBit; 2],
    pub aco: RegBit,
    pub acbg: RegBit,
    pub acic: RegBit,
    pub disabled: RegBit,
    pub interrupt: Vector,
    /// Timer whose capture input ACIC feeds.
    pub timer_name: char,

    // Runtime state.
    pub irq_base: IrqId,
    pub inputs: AcompInputs,
    pub ain_values: [u16; 2],
    pub adc_values: [u16; 16],
    pub timer_icp: Option<IrqId>,
}

pub fn init(avr: &mut Avr) -> Result<(), ConfigError> {
    let names: Vec<String> = (0..2)
        .map(|i| format!("16<ain{}", i))
        .chain((0..16).map(|i| format!("16<acmp_adc{}", i)))
        .chain([">out".to_string(), "32>input_state".to_string()])
        .collect();
    let name_refs: Vec<Option<&str>> = names.iter().map(|s| Some(s.as_str())).collect();
    let base = avr.alloc_irqs(ACOMP_IOCTL, ACOMP_IRQ_COUNT, &name_refs);
    avr.acomp.as_mut().unwrap().irq_base = base;
    avr.pool
        .set_flags(IrqId(base.0 + ACOMP_IRQ_INPUT_STATE), IrqFlags::FILTERED);

    // All millivolt inputs funnel into one sink, indexed like the pool.
    for i in 0..ACOMP_IRQ_OUT {
        avr.pool.listen(
            IrqId(base.0 + i),
            IrqSink::Device(DeviceSink::AcompIn { index: i as u8 }),
        );
    }

    let ac = avr.acomp.as_ref().unwrap();
    let (r_acsr, vector) = (ac.r_acsr, ac.interrupt);
    let deps = [ac.pradc, ac.aden, ac.acme, ac.mux[0], ac.mux[1], ac.mux[2], ac.mux[3]];
    avr.register_vector(vector)?;
    avr.register_io_write(r_acsr, IoWrite::AcompControl);

    // The comparator does not own the ADC control registers it depends
    // on; watch them through the I/O-memory observation signals.
    for rb in deps {
        if rb.is_valid() {
            let dep = avr.iomem_getirq(rb.reg, Some(rb.bit));
            let hook = crate::irq::ExternalHook::new(move |avr: &mut Avr, _, _| {
                schedule_sync(avr);
            });
            avr.irq_register_notify(dep, hook);
        }
    }
    Ok(())
}

pub fn reset(avr: &mut Avr) {
    let ac = avr.acomp.as_mut().unwrap();
    ac.inputs = AcompInputs {
        active: true,
        ..Default::default()
    };
    ac.timer_icp = None;
    avr.cycle_timer_cancel(CycleSlot::AcompSync);
}

fn comparator_state(avr: &Avr) -> u8 {
    let ac = avr.acomp.as_ref().unwrap();
    let positive = if ac.inputs.positive_bandgap {
        ACOMP_BANDGAP_MV
    } else {
        ac.ain_values[0]
    };
    let negative = if ac.inputs.negative != 0 {
        ac.adc_values[(ac.inputs.negative - 1) as usize]
    } else {
        ac.ain_values[1]
    };
    (positive > negative) as u8
}

/// Re-derive the input routing, publish it, and schedule the output
/// evaluation for the next cycle.
fn schedule_sync(avr: &mut Avr) {
    let ac = avr.acomp.as_ref().unwrap();
    let mut inputs = AcompInputs::default();
    if ac.disabled.get(&avr.data) == 0 {
        inputs.active = true;
        inputs.positive_bandgap = ac.acbg.get(&avr.data) != 0;
        // The multiplexer feeds the negative input when ACME is set and
        // the ADC proper is off.
        inputs.negative = 0;
        if ac.acme.get(&avr.data) != 0
            && ac.aden.get(&avr.data) == 0
            && ac.pradc.get(&avr.data) == 0
        {
            let n = regbit_get_array(&avr.data, &ac.mux);
            if n < ac.mux_inputs && (n as usize) < 16 {
                inputs.negative = n + 1;
            }
        }
    }
    let base = avr.acomp.as_ref().unwrap().irq_base;
    avr.acomp.as_mut().unwrap().inputs = inputs;
    avr.raise_irq(IrqId(base.0 + ACOMP_IRQ_INPUT_STATE), inputs.packed());
    if inputs.active {
        avr.cycle_timer_register(1, CycleSlot::AcompSync);
    }
}

/// Scheduled output evaluation.
pub(crate) fn test_state(avr: &mut Avr, _when: u64) -> u64 {
    let ac = avr.acomp.as_ref().unwrap();
    let aco = ac.aco;
    let acis = ac.acis;
    let vector = ac.interrupt.vector;
    let base = ac.irq_base;

    let cur = aco.get(&avr.data);
    let new = comparator_state(avr);
    if new != cur {
        aco.set_to(&mut avr.data, new);
        let acis0 = acis[0].get(&avr.data);
        let acis1 = acis[1].get(&avr.data);
        // ACIS 00 = toggle, 10 = falling, 11 = rising.
        if (acis0 == 0 && acis1 == 0) || (acis1 == 1 && acis0 == new) {
            avr.raise_interrupt(vector);
        }
        avr.raise_irq(IrqId(base.0 + ACOMP_IRQ_OUT), new as u32);
    }
    0
}

/// ACSR write: write-one-to-clear on ACI, ACIC capture routing, then a
/// full input re-evaluation.
pub(crate) fn acsr_write(avr: &mut Avr, addr: u16, v: u8) {
    let ac = avr.acomp.as_ref().unwrap();
    let vector = ac.interrupt;
    let (acic, timer_name) = (ac.acic, ac.timer_name);
    let base = ac.irq_base;

    let mut store = v;
    if vector.raised.from_value(v) != 0 {
        avr.clear_interrupt(vector.vector);
        store &= !(vector.raised.mask << vector.raised.bit);
    }
    // ACO is read-only.
    let ac = avr.acomp.as_ref().unwrap();
    let aco_mask = if ac.aco.is_valid() {
        ac.aco.mask << ac.aco.bit
    } else {
        0
    };
    store = (store & !aco_mask) | (avr.data[addr as usize] & aco_mask);
    avr.store(addr, store);

    // Connect or disconnect the capture chain when ACIC flips.
    let want_icp = acic.get(&avr.data) != 0;
    let have_icp = avr.acomp.as_ref().unwrap().timer_icp.is_some();
    if want_icp != have_icp {
        let out = IrqId(base.0 + ACOMP_IRQ_OUT);
        if have_icp {
            let icp = avr.acomp.as_ref().unwrap().timer_icp.unwrap();
            avr.unconnect_irq(out, icp);
            avr.acomp.as_mut().unwrap().timer_icp = None;
        } else if let Some(icp) =
            avr.io_getirq(timer_getirq_key(timer_name), TIMER_IRQ_IN_ICP)
        {
            avr.connect_irq(out, icp);
            avr.acomp.as_mut().unwrap().timer_icp = Some(icp);
        }
    }

    schedule_sync(avr);
}

/// A millivolt input signal changed.
pub(crate) fn input_change(avr: &mut Avr, index: usize, value: u32) {
    {
        let ac = avr.acomp.as_mut().unwrap();
        if index < 2 {
            ac.ain_values[index] = value as u16;
        } else {
            ac.adc_values[index - 2] = value as u16;
        }
    }
    schedule_sync(avr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Chip;
    use crate::regbit::regbit;

    const ACSR: u16 = 0x50;
    const ADMUX: u16 = 0x7c;
    const ADCSRA: u16 = 0x7a;
    const ADCSRB: u16 = 0x7b;

    fn chip() -> Chip {
        Chip {
            mmcu: "test",
            flashend: 0x0fff,
            ramend: 0x045f,
            ioend: 0xff,
            e2end: 0,
            vector_size: 1,
            addr_sreg: 0x5f,
            addr_spl: 0x5d,
            addr_sph: 0x5e,
            ports: vec![],
            timers: vec![],
            extint: None,
            adc: None,
            acomp: Some(Acomp {
                mux_inputs: 8,
                mux: [
                    regbit(ADMUX, 0),
                    regbit(ADMUX, 1),
                    regbit(ADMUX, 2),
                    RegBit::NONE,
                ],
                aden: regbit(ADCSRA, 7),
                acme: regbit(ADCSRB, 6),
                r_acsr: ACSR,
                acis: [regbit(ACSR, 0), regbit(ACSR, 1)],
                aco: regbit(ACSR, 5),
                acbg: regbit(ACSR, 6),
                acic: regbit(ACSR, 2),
                disabled: regbit(ACSR, 7),
                interrupt: Vector {
                    vector: 23,
                    enable: regbit(ACSR, 3),
                    raised: regbit(ACSR, 4),
                    ..Default::default()
                },
                timer_name: '1',
                ..Default::default()
            }),
            eeprom: None,
            watchdog: None,
            usi: None,
        }
    }

    fn settle(avr: &mut Avr) {
        for _ in 0..4 {
            avr.cycle += 1;
            avr.run_cycle_timers();
        }
    }

    #[test]
    fn aco_follows_inputs() {
        let mut avr = Avr::new(chip(), 8).unwrap();
        let ain0 = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_AIN0).unwrap();
        let ain1 = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_AIN1).unwrap();
        avr.raise_irq(ain0, 2000);
        avr.raise_irq(ain1, 1800);
        settle(&mut avr);
        assert_eq!(avr.data[ACSR as usize] & 0x20, 0x20);
        avr.raise_irq(ain1, 2200);
        settle(&mut avr);
        assert_eq!(avr.data[ACSR as usize] & 0x20, 0x00);
    }

    #[test]
    fn toggle_mode_interrupts_on_both_edges() {
        let mut avr = Avr::new(chip(), 8).unwrap();
        avr.write_data(ACSR, 0x08); // ACIE, ACIS=00 (toggle)
        let ain0 = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_AIN0).unwrap();
        let ain1 = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_AIN1).unwrap();
        avr.raise_irq(ain1, 1000);
        avr.raise_irq(ain0, 1500);
        settle(&mut avr);
        assert!(avr.is_interrupt_pending(23));
        avr.clear_interrupt(23);
        avr.raise_irq(ain0, 500);
        settle(&mut avr);
        assert!(avr.is_interrupt_pending(23));
    }

    #[test]
    fn rising_mode_filters_edges() {
        let mut avr = Avr::new(chip(), 8).unwrap();
        avr.write_data(ACSR, 0x08 | 0x03); // ACIE, ACIS=11 (rising)
        let ain0 = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_AIN0).unwrap();
        let ain1 = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_AIN1).unwrap();
        avr.raise_irq(ain1, 1000);
        avr.raise_irq(ain0, 1500); // rising edge
        settle(&mut avr);
        assert!(avr.is_interrupt_pending(23));
        avr.clear_interrupt(23);
        avr.raise_irq(ain0, 500); // falling edge: ignored
        settle(&mut avr);
        assert!(!avr.is_interrupt_pending(23));
    }

    #[test]
    fn mux_routes_negative_input() {
        let mut avr = Avr::new(chip(), 8).unwrap();
        avr.write_data(ADCSRB, 0x40); // ACME, ADC off
        avr.write_data(ADMUX, 0x02); // channel 2
        let ain0 = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_AIN0).unwrap();
        let ch2 = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_ADC0 + 2).unwrap();
        avr.raise_irq(ain0, 1500);
        avr.raise_irq(ch2, 1000);
        settle(&mut avr);
        assert_eq!(avr.data[ACSR as usize] & 0x20, 0x20);
        avr.raise_irq(ch2, 1900);
        settle(&mut avr);
        assert_eq!(avr.data[ACSR as usize] & 0x20, 0x00);
        assert_eq!(avr.acomp.as_ref().unwrap().inputs.negative, 3);
    }

    #[test]
    fn input_state_signal_reports_routing() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut avr = Avr::new(chip(), 8).unwrap();
        let states: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let s = states.clone();
        let state_irq = avr.io_getirq(ACOMP_IOCTL, ACOMP_IRQ_INPUT_STATE).unwrap();
        avr.irq_register_notify(
            state_irq,
            crate::irq::ExternalHook::new(move |_, _, v| s.borrow_mut().push(v)),
        );
        avr.write_data(ADCSRB, 0x40);
        avr.write_data(ADMUX, 0x01);
        // active=1, negative = channel 1 + 1.
        assert_eq!(states.borrow().last().copied(), Some(1 | 2 << 16));
        // Disabling the comparator reports inactive.
        avr.write_data(ACSR, 0x80);
        assert_eq!(states.borrow().last().copied(), Some(0));
    }
}
