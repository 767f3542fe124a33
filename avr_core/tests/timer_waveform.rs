// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Timer/counter behavior: compare and overflow timing, the derived
//! TCNT read-back in every waveform mode, CTC periods, PWM pin action
//! and input capture.
//!
//! Time is driven at harness level (cycle stepping plus scheduler
//! drains); firmware execution is covered by the chip-level suites.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::*;

use avr_core::ioport::ioport_getirq_key;
use avr_core::timer::timer_getirq_key;
use avr_core::ExternalHook;

const PRESCALE: u64 = 64;

/// Start timer 0 in `wgm` mode with /64 and reset the count, returning
/// the cycle the count was rebased at.
fn start_timer0(avr: &mut avr_core::Avr, wgm: u8) -> u64 {
    avr.write_data(TCCR0A, wgm & 0x3);
    avr.write_data(TCCR0B, ((wgm as u16 >> 2 << 3) as u8 & 0x08) | 0x03);
    avr.write_data(TCNT0, 0);
    avr.cycle
}

fn tcnt0(avr: &mut avr_core::Avr) -> u8 {
    avr.read_data(TCNT0)
}

#[test]
fn normal_mode_compare_and_overflow_timing() {
    let mut avr = common::machine();
    avr.data[TIMSK0 as usize] = 0x03; // TOIE0 | OCIE0A
    avr.write_data(OCR0A, 49);
    let base = start_timer0(&mut avr, 0);

    let compare_at = common::tick_until(&mut avr, 20_000, |avr| {
        avr.is_interrupt_pending(TIMER0_COMPA_VECT)
    })
    .expect("compare never fired");
    // (V+1) * P, give or take the instruction-boundary cycle.
    let expect = base + 50 * PRESCALE;
    assert!(compare_at >= expect && compare_at <= expect + 2);

    let overflow_at = common::tick_until(&mut avr, 20_000, |avr| {
        avr.is_interrupt_pending(TIMER0_OVF_VECT)
    })
    .expect("overflow never fired");
    let expect = base + 256 * PRESCALE;
    assert!(overflow_at >= expect && overflow_at <= expect + 2);

    // The next compare lands one full period later: no drift.
    avr.clear_interrupt(TIMER0_COMPA_VECT);
    let second = common::tick_until(&mut avr, 20_000, |avr| {
        avr.is_interrupt_pending(TIMER0_COMPA_VECT)
    })
    .expect("second compare never fired");
    assert_eq!(second - compare_at, 256 * PRESCALE);
}

#[test]
fn normal_mode_tcnt_readback() {
    let mut avr = common::machine();
    let base = start_timer0(&mut avr, 0);
    // Sampling one cycle past the tick boundary absorbs the
    // instruction-boundary cycle the rebase accounts for.
    for (ticks, expect) in [(10u64, 10u8), (250, 250), (256, 0), (517, 5)] {
        let target = base + ticks * PRESCALE + 1;
        while avr.cycle < target {
            avr.cycle += 1;
            avr.run_cycle_timers();
        }
        assert_eq!(tcnt0(&mut avr), expect, "at tick {}", ticks);
    }
}

#[test]
fn ctc_mode_wraps_at_ocr() {
    let mut avr = common::machine();
    avr.write_data(OCR0A, 22);
    let base = start_timer0(&mut avr, 2); // CTC
    for (ticks, expect) in [(10u64, 10u8), (23, 0), (252, 22)] {
        let target = base + ticks * PRESCALE + 1;
        while avr.cycle < target {
            avr.cycle += 1;
            avr.run_cycle_timers();
        }
        assert_eq!(tcnt0(&mut avr), expect, "at tick {}", ticks);
    }
    // The period event is the compare, not the overflow.
    assert_eq!(avr.data[TIFR0 as usize] & 0x02, 0x02);
    assert_eq!(avr.data[TIFR0 as usize] & 0x01, 0x00);
}

#[test]
fn phase_correct_tcnt_readback() {
    let mut avr = common::machine();
    let base = start_timer0(&mut avr, 1); // dual slope, TOP = 255
    for (ticks, expect) in [
        (10u64, 10u8),
        (254, 254),
        (255, 255),
        (256, 254),
        (259, 251),
        (509, 1),
        (510, 0),
        (511, 1),
        (765, 255),
        (766, 254),
        (1020, 0),
    ] {
        let target = base + ticks * PRESCALE + 1;
        while avr.cycle < target {
            avr.cycle += 1;
            avr.run_cycle_timers();
        }
        assert_eq!(tcnt0(&mut avr), expect, "at tick {}", ticks);
    }
}

#[test]
fn fast_pwm_tcnt_wraps_at_top() {
    let mut avr = common::machine();
    let base = start_timer0(&mut avr, 3);
    for (ticks, expect) in [(10u64, 10u8), (245, 245), (256, 0), (300, 44)] {
        let target = base + ticks * PRESCALE + 1;
        while avr.cycle < target {
            avr.cycle += 1;
            avr.run_cycle_timers();
        }
        assert_eq!(tcnt0(&mut avr), expect, "at tick {}", ticks);
    }
}

#[test]
fn tcnt_write_rebases_the_count() {
    let mut avr = common::machine();
    start_timer0(&mut avr, 0);
    common::tick_until(&mut avr, 1000, |_| false);
    avr.write_data(TCNT0, 10);
    let base = avr.cycle;
    let target = base + 200 * PRESCALE;
    while avr.cycle < target {
        avr.cycle += 1;
        avr.run_cycle_timers();
    }
    assert_eq!(tcnt0(&mut avr), 210);
}

#[test]
fn stopping_the_clock_freezes_and_cancels() {
    let mut avr = common::machine();
    avr.data[TIMSK0 as usize] = 0x01;
    let base = start_timer0(&mut avr, 0);
    let target = base + 100 * PRESCALE;
    while avr.cycle < target {
        avr.cycle += 1;
        avr.run_cycle_timers();
    }
    avr.write_data(TCCR0B, 0x00); // clock off
    let frozen = tcnt0(&mut avr);
    assert_eq!(frozen, 100);
    // Nothing fires any more.
    assert!(common::tick_until(&mut avr, 30_000, |avr| {
        avr.is_interrupt_pending(TIMER0_OVF_VECT)
    })
    .is_none());
    assert_eq!(tcnt0(&mut avr), 100);
}

#[test]
fn compare_pin_toggles_through_the_port() {
    // OC0A lives on port D bit 6 in the fixture; COM0A = toggle.
    let mut avr = common::machine();
    let transitions: Rc<RefCell<Vec<(u64, u32)>>> = Rc::new(RefCell::new(Vec::new()));
    let t = transitions.clone();
    let pin6 = avr.io_getirq(ioport_getirq_key('D'), 6).unwrap();
    avr.irq_register_notify(
        pin6,
        ExternalHook::new(move |avr, _, v| t.borrow_mut().push((avr.cycle, v & 1))),
    );

    avr.write_data(OCR0A, 49);
    avr.write_data(TCCR0A, 0x40); // COM0A toggle, normal mode
    avr.write_data(TCCR0B, 0x03);
    avr.write_data(TCNT0, 0);
    let base = avr.cycle;

    while transitions.borrow().len() < 2 && avr.cycle < base + 4 * 256 * PRESCALE {
        avr.cycle += 1;
        avr.run_cycle_timers();
    }
    let tr = transitions.borrow();
    assert_eq!(tr.len(), 2);
    // First toggle at the first match, second one full period later.
    let first = tr[0].0 - base;
    assert!(first >= 50 * PRESCALE && first <= 50 * PRESCALE + 2);
    assert_eq!(tr[1].0 - tr[0].0, 256 * PRESCALE);
    assert_eq!(tr[0].1, 1);
    assert_eq!(tr[1].1, 0);
}

#[test]
fn fast_pwm_drives_clear_on_match_set_at_bottom() {
    let mut avr = common::machine();
    let transitions: Rc<RefCell<Vec<(u64, u32)>>> = Rc::new(RefCell::new(Vec::new()));
    let t = transitions.clone();
    let pin6 = avr.io_getirq(ioport_getirq_key('D'), 6).unwrap();
    avr.irq_register_notify(
        pin6,
        ExternalHook::new(move |avr, _, v| t.borrow_mut().push((avr.cycle, v & 1))),
    );

    avr.write_data(OCR0A, 99);
    avr.write_data(TCCR0A, 0x80 | 0x03); // COM0A clear-on-match, fast PWM
    avr.write_data(TCCR0B, 0x03);
    avr.write_data(TCNT0, 0);
    let base = avr.cycle;

    while transitions.borrow().len() < 3 && avr.cycle < base + 4 * 256 * PRESCALE {
        avr.cycle += 1;
        avr.run_cycle_timers();
    }
    let tr = transitions.borrow();
    // The pin starts low, so the first visible edge is the set at TOP;
    // then clear-on-match, then set at the following TOP.
    assert_eq!(tr[0].1, 1);
    assert_eq!(tr[1].1, 0);
    assert_eq!(tr[2].1, 1);
    let high = tr[0].0 - base;
    assert!(high >= 256 * PRESCALE && high <= 256 * PRESCALE + 2);
    assert_eq!(tr[1].0 - tr[0].0, 100 * PRESCALE);
    assert_eq!(tr[2].0 - tr[0].0, 256 * PRESCALE);
}

#[test]
fn sixteen_bit_normal_mode_compare() {
    let mut avr = common::machine();
    avr.data[TIMSK1 as usize] = 0x05; // TOIE1 | OCIE1B
    // OCR1B = 49: high byte first, low byte triggers nothing special
    // (the low address is the documented trigger for reconfiguration).
    avr.write_data(OCR1BH, 0);
    avr.write_data(OCR1BL, 49);
    avr.write_data(TCCR1B, 0x01); // /1
    avr.write_data(TCNT1H, 0);
    avr.write_data(TCNT1L, 0);
    let base = avr.cycle;

    let compare_at = common::tick_until(&mut avr, 200, |avr| {
        avr.is_interrupt_pending(TIMER1_COMPB_VECT)
    })
    .expect("compare never fired");
    assert!(compare_at - base >= 50 && compare_at - base <= 52);

    let overflow_at = common::tick_until(&mut avr, 70_000, |avr| {
        avr.is_interrupt_pending(TIMER1_OVF_VECT)
    })
    .expect("overflow never fired");
    assert!(overflow_at - base >= 65536 && overflow_at - base <= 65538);
}

#[test]
fn input_capture_snapshots_the_count() {
    let mut avr = common::machine();
    avr.data[TIMSK1 as usize] = 0x20; // ICIE1
    avr.write_data(TCCR1B, 0x41); // ICES1 rising, /1
    avr.write_data(TCNT1H, 0);
    avr.write_data(TCNT1L, 0);
    let base = avr.cycle;
    while avr.cycle < base + 1000 {
        avr.cycle += 1;
        avr.run_cycle_timers();
    }
    // Rising edge on ICP1 (port B bit 0).
    let icp = avr.io_getirq(ioport_getirq_key('B'), 0).unwrap();
    avr.raise_irq(icp, 1);
    assert!(avr.is_interrupt_pending(TIMER1_CAPT_VECT));
    let icr = avr.data[ICR1L as usize] as u16 | (avr.data[ICR1H as usize] as u16) << 8;
    let expect = ((avr.cycle - base) as u16).wrapping_sub(1);
    assert!(icr == expect || icr == expect.wrapping_add(1));
    // A falling edge does not capture again.
    avr.clear_interrupt(TIMER1_CAPT_VECT);
    avr.raise_irq(icp, 0);
    assert!(!avr.is_interrupt_pending(TIMER1_CAPT_VECT));
}

#[test]
fn ocr_buffered_in_fast_pwm() {
    let mut avr = common::machine();
    avr.write_data(OCR0A, 40);
    avr.write_data(TCCR0A, 0x03); // fast PWM, no pin action
    avr.write_data(TCCR0B, 0x03);
    avr.write_data(TCNT0, 0);
    let base = avr.cycle;
    // Half way through the period, change OCR; the live value must not
    // move until TOP.
    let target = base + 128 * PRESCALE;
    while avr.cycle < target {
        avr.cycle += 1;
        avr.run_cycle_timers();
    }
    avr.write_data(OCR0A, 200);
    let timer = &avr.timers[0];
    assert_eq!(timer.comp[0].as_ref().unwrap().ocr, 40);
    // After the wrap the buffer is latched.
    let target = base + 260 * PRESCALE;
    while avr.cycle < target {
        avr.cycle += 1;
        avr.run_cycle_timers();
    }
    assert_eq!(avr.timers[0].comp[0].as_ref().unwrap().ocr, 200);
}

#[test]
fn external_clock_counts_pin_edges() {
    let mut avr = common::machine();
    avr.data[TIMSK0 as usize] = 0x01;
    avr.write_data(TCCR0B, 0x07); // external, rising edge (T0 = PD4)
    let t0 = avr.io_getirq(ioport_getirq_key('D'), 4).unwrap();
    for _ in 0..10 {
        avr.raise_irq(t0, 1);
        avr.raise_irq(t0, 0);
    }
    assert_eq!(tcnt0(&mut avr), 10);
    // Falling edges do not count in rising mode; drive to overflow.
    for _ in 0..246 {
        avr.raise_irq(t0, 1);
        avr.raise_irq(t0, 0);
    }
    assert_eq!(tcnt0(&mut avr), 0);
    assert!(avr.is_interrupt_pending(TIMER0_OVF_VECT));
}

#[test]
fn pwm_value_signal_reports_ocr_writes() {
    let mut avr = common::machine();
    let values: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let v = values.clone();
    let pwm0 = avr.io_getirq(timer_getirq_key('0'), 0).unwrap();
    avr.irq_register_notify(
        pwm0,
        ExternalHook::new(move |_, _, val| v.borrow_mut().push(val)),
    );
    avr.write_data(OCR0A, 10);
    avr.write_data(OCR0A, 10); // filtered: same value, no event
    avr.write_data(OCR0A, 20);
    assert_eq!(values.borrow().as_slice(), &[10, 20]);
}
