// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! EEPROM controller: EEAR/EEDR/EECR with the armed-write protocol.
//!
//! EERE reads complete immediately; programming takes its documented
//! ~3.4 ms, modeled through the cycle scheduler, with EEPE readable as
//! busy until the ready event fires the EERIE vector.

use crate::cycle_timers::CycleSlot;
use crate::interrupts::Vector;
use crate::machine::{Avr, ConfigError};
use crate::memory::IoWrite;
use crate::regbit::RegBit;

/// Write time on silicon, microseconds.
const WRITE_TIME_USEC: u64 = 3400;
/// EEMPE arms EEPE for this many cycles.
const ARM_WINDOW_CYCLES: u64 = 4;

#[derive(Clone, Debug, Default)]
pub struct Eeprom {
    pub r_eearl: u16,
    pub r_eearh: u16,
    pub r_eedr: u16,
    pub r_eecr: u16,
    pub eere: RegBit,
    pub eepe: RegBit,
    pub eempe: RegBit,
    pub ready: Vector,

    // Runtime state.
    pub storage: Vec<u8>,
    pub armed_until: u64,
}

impl Eeprom {
    fn addr(&self, avr: &Avr) -> usize {
        let mut a = avr.data[self.r_eearl as usize] as usize;
        if self.r_eearh != 0 {
            a |= (avr.data[self.r_eearh as usize] as usize) << 8;
        }
        a % self.storage.len().max(1)
    }
}

pub fn init(avr: &mut Avr) -> Result<(), ConfigError> {
    let e2size = avr.e2end as usize + 1;
    {
        let ee = avr.eeprom.as_mut().unwrap();
        ee.storage = vec![0xff; e2size];
    }
    let ee = avr.eeprom.as_ref().unwrap();
    let (r_eecr, ready) = (ee.r_eecr, ee.ready);
    avr.register_vector(ready)?;
    avr.register_io_write(r_eecr, IoWrite::EepromControl);
    Ok(())
}

pub fn reset(avr: &mut Avr) {
    avr.eeprom.as_mut().unwrap().armed_until = 0;
    avr.cycle_timer_cancel(CycleSlot::EepromReady);
}

/// Embedder access to the backing store.
impl Avr {
    pub fn eeprom_data(&self) -> Option<&[u8]> {
        self.eeprom.as_ref().map(|e| e.storage.as_slice())
    }

    pub fn eeprom_data_mut(&mut self) -> Option<&mut [u8]> {
        self.eeprom.as_mut().map(|e| e.storage.as_mut_slice())
    }
}

pub(crate) fn eecr_write(avr: &mut Avr, addr: u16, v: u8) {
    let ee = avr.eeprom.as_ref().unwrap();
    let (eere, eepe, eempe) = (ee.eere, ee.eepe, ee.eempe);
    let busy = avr.cycle_timers.is_scheduled(CycleSlot::EepromReady);

    avr.store(addr, v);
    if busy {
        // Programming in progress; EEPE stays readable as set.
        eepe.set(&mut avr.data);
        return;
    }

    if eempe.from_value(v) != 0 && eepe.from_value(v) == 0 {
        avr.eeprom.as_mut().unwrap().armed_until = avr.cycle + ARM_WINDOW_CYCLES;
    }

    if eepe.from_value(v) != 0 {
        let armed = avr.cycle <= avr.eeprom.as_ref().unwrap().armed_until;
        if armed {
            let ee = avr.eeprom.as_ref().unwrap();
            let a = ee.addr(avr);
            let byte = avr.data[ee.r_eedr as usize];
            avr.eeprom.as_mut().unwrap().storage[a] = byte;
            let cycles = avr.usec_to_cycles(WRITE_TIME_USEC);
            avr.cycle_timer_register(cycles, CycleSlot::EepromReady);
            log::trace!("eeprom write [{:#x}] = {:#04x}", a, byte);
        } else {
            // Arm window missed; the write is ignored.
            eepe.clear(&mut avr.data);
        }
        eempe.clear(&mut avr.data);
        avr.eeprom.as_mut().unwrap().armed_until = 0;
    }

    if eere.from_value(v) != 0 {
        let ee = avr.eeprom.as_ref().unwrap();
        let a = ee.addr(avr);
        let r_eedr = ee.r_eedr;
        let byte = avr.eeprom.as_ref().unwrap().storage[a];
        avr.data[r_eedr as usize] = byte;
        eere.clear(&mut avr.data);
    }
}

/// Scheduled completion of a programming operation.
pub(crate) fn write_done(avr: &mut Avr, _when: u64) -> u64 {
    let ee = avr.eeprom.as_ref().unwrap();
    let (eepe, vector) = (ee.eepe, ee.ready.vector);
    eepe.clear(&mut avr.data);
    avr.raise_interrupt(vector);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Chip;
    use crate::regbit::regbit;

    const EECR: u16 = 0x3f;
    const EEDR: u16 = 0x40;
    const EEARL: u16 = 0x41;
    const EEARH: u16 = 0x42;

    fn chip() -> Chip {
        Chip {
            mmcu: "test",
            flashend: 0x0fff,
            ramend: 0x045f,
            ioend: 0xff,
            e2end: 0x1ff,
            vector_size: 1,
            addr_sreg: 0x5f,
            addr_spl: 0x5d,
            addr_sph: 0x5e,
            ports: vec![],
            timers: vec![],
            extint: None,
            adc: None,
            acomp: None,
            eeprom: Some(Eeprom {
                r_eearl: EEARL,
                r_eearh: EEARH,
                r_eedr: EEDR,
                r_eecr: EECR,
                eere: regbit(EECR, 0),
                eepe: regbit(EECR, 1),
                eempe: regbit(EECR, 2),
                ready: Vector {
                    vector: 22,
                    enable: regbit(EECR, 3),
                    ..Default::default()
                },
                ..Default::default()
            }),
            watchdog: None,
            usi: None,
        }
    }

    fn drain(avr: &mut Avr, cycles: u64) {
        let end = avr.cycle + cycles;
        while avr.cycle < end {
            avr.cycle += 100;
            avr.run_cycle_timers();
        }
    }

    #[test]
    fn armed_write_then_read_back() {
        let mut avr = Avr::new(chip(), 8).unwrap();
        avr.write_data(EEARL, 0x10);
        avr.write_data(EEDR, 0x5a);
        avr.write_data(EECR, 0x04); // EEMPE
        avr.write_data(EECR, 0x02); // EEPE within the window
        assert_eq!(avr.eeprom_data().unwrap()[0x10], 0x5a);
        let cycles = avr.usec_to_cycles(4000);
        drain(&mut avr, cycles);
        // Busy flag released after the programming time.
        assert_eq!(avr.data[EECR as usize] & 0x02, 0);
        avr.write_data(EECR, 0x01); // EERE
        assert_eq!(avr.data[EEDR as usize], 0x5a);
    }

    #[test]
    fn unarmed_write_is_ignored() {
        let mut avr = Avr::new(chip(), 8).unwrap();
        avr.write_data(EEARL, 0x10);
        avr.write_data(EEDR, 0x77);
        avr.write_data(EECR, 0x02); // EEPE, never armed
        assert_eq!(avr.eeprom_data().unwrap()[0x10], 0xff);
    }

    #[test]
    fn arm_window_expires() {
        let mut avr = Avr::new(chip(), 8).unwrap();
        avr.write_data(EEDR, 0x42);
        avr.write_data(EECR, 0x04);
        avr.cycle += 10; // past the 4-cycle window
        avr.write_data(EECR, 0x02);
        assert_eq!(avr.eeprom_data().unwrap()[0], 0xff);
    }

    #[test]
    fn ready_interrupt_fires() {
        let mut avr = Avr::new(chip(), 8).unwrap();
        avr.write_data(EECR, 0x08 | 0x04); // EERIE + EEMPE
        avr.write_data(EECR, 0x08 | 0x02);
        let cycles = avr.usec_to_cycles(4000);
        drain(&mut avr, cycles);
        assert!(avr.is_interrupt_pending(22));
    }
}
