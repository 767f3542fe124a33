// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Watchdog timer running off the 128 kHz oscillator.
//!
//! In interrupt mode the timeout raises the WDT vector; the vector's
//! clear-both attribute clears WDIE at service so a stuck handler falls
//! through to the reset mode, as on silicon. In reset mode the timeout
//! resets the machine. The WDR instruction re-arms the countdown.

use crate::cycle_timers::CycleSlot;
use crate::interrupts::Vector;
use crate::machine::{Avr, ConfigError};
use crate::memory::IoWrite;
use crate::regbit::RegBit;

const WDT_OSC_HZ: u64 = 128_000;
/// WDCE stays open this many cycles after being written.
const CHANGE_WINDOW_CYCLES: u64 = 4;

#[derive(Clone, Debug, Default)]
pub struct Watchdog {
    pub r_wdtcr: u16,
    pub wdce: RegBit,
    pub wde: RegBit,
    pub wdp: [RegBit; 4],
    pub interrupt: Vector,

    // Runtime state.
    pub change_until: u64,
}

impl Watchdog {
    fn prescale(&self, data: &[u8]) -> u32 {
        let mut wdp = 0u8;
        for (i, rb) in self.wdp.iter().enumerate() {
            wdp |= rb.get(data) << i;
        }
        wdp as u32
    }
}

pub fn init(avr: &mut Avr) -> Result<(), ConfigError> {
    let wd = avr.watchdog.as_ref().unwrap();
    let (r_wdtcr, mut vector) = (wd.r_wdtcr, wd.interrupt);
    // Servicing the interrupt clears WDIE too: next timeout resets.
    vector.clear_both = true;
    avr.watchdog.as_mut().unwrap().interrupt = vector;
    avr.register_vector(vector)?;
    avr.register_io_write(r_wdtcr, IoWrite::WatchdogControl);
    Ok(())
}

pub fn reset(avr: &mut Avr) {
    avr.watchdog.as_mut().unwrap().change_until = 0;
    avr.cycle_timer_cancel(CycleSlot::WatchdogTimeout);
}

fn timeout_cycles(avr: &Avr) -> u64 {
    let wd = avr.watchdog.as_ref().unwrap();
    let wdp = wd.prescale(&avr.data);
    // 2048 cycles of the 128 kHz oscillator at WDP=0, doubling per step.
    let wdt_cycles = 2048u64 << wdp;
    wdt_cycles * avr.frequency as u64 / WDT_OSC_HZ
}

fn rearm(avr: &mut Avr) {
    let wd = avr.watchdog.as_ref().unwrap();
    let enabled =
        wd.wde.get(&avr.data) != 0 || wd.interrupt.enable.get(&avr.data) != 0;
    if enabled {
        let cycles = timeout_cycles(avr);
        avr.cycle_timer_register(cycles, CycleSlot::WatchdogTimeout);
    } else {
        avr.cycle_timer_cancel(CycleSlot::WatchdogTimeout);
    }
}

pub(crate) fn control_write(avr: &mut Avr, addr: u16, v: u8) {
    let wd = avr.watchdog.as_ref().unwrap();
    let (wdce, wde, vector) = (wd.wdce, wd.wde, wd.interrupt);
    let old_wde = wde.get(&avr.data);
    let in_window = avr.cycle <= wd.change_until;

    // Clearing WDE (or lowering the prescaler) requires the timed
    // sequence: WDCE+WDE first, the real write within four cycles.
    let mut store = v;
    if vector.raised.from_value(v) != 0 {
        avr.clear_interrupt(vector.vector);
        store &= !(vector.raised.mask << vector.raised.bit);
    }
    if wde.from_value(v) == 0 && old_wde != 0 && !in_window {
        log::trace!("watchdog disable without timed sequence ignored");
        store |= wde.mask << wde.bit;
    }
    avr.store(addr, store);

    if wdce.from_value(v) != 0 && wde.from_value(v) != 0 {
        avr.watchdog.as_mut().unwrap().change_until = avr.cycle + CHANGE_WINDOW_CYCLES;
    } else if !in_window {
        avr.watchdog.as_mut().unwrap().change_until = 0;
    }
    wdce.clear(&mut avr.data);

    rearm(avr);
}

/// WDR instruction.
pub(crate) fn wdr(avr: &mut Avr) {
    if avr.watchdog.is_some() {
        rearm(avr);
    }
}

/// Scheduled timeout.
pub(crate) fn timeout(avr: &mut Avr, _when: u64) -> u64 {
    let wd = avr.watchdog.as_ref().unwrap();
    let vector = wd.interrupt;
    let wde = wd.wde;

    if vector.enable.get(&avr.data) != 0 {
        avr.raise_interrupt(vector.vector);
        timeout_cycles(avr)
    } else if wde.get(&avr.data) != 0 {
        log::warn!("watchdog timeout, resetting");
        avr.reset();
        0
    } else {
        0
    }
}
