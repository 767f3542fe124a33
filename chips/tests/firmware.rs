// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end scenarios: hand-assembled firmware running on the real
//! chip tables, observed purely through the signal fabric.

use std::cell::RefCell;
use std::rc::Rc;

use avr_core::ioport::{
    ioport_getirq_key, IOPORT_IRQ_PIN_ALL, IOPORT_IRQ_REG_DDR, IOPORT_IRQ_REG_PIN,
    IOPORT_IRQ_REG_PORT,
};
use avr_core::{CpuState, ExternalCycleHook, ExternalHook};

// ---- A tiny assembler ----------------------------------------------------

const fn ldi(d: u16, k: u8) -> u16 {
    0xe000 | ((k as u16 & 0xf0) << 4) | ((d - 16) << 4) | (k as u16 & 0xf)
}

const fn in_(d: u16, a: u16) -> u16 {
    0xb000 | ((a & 0x30) << 5) | (d << 4) | (a & 0xf)
}

const fn out(a: u16, r: u16) -> u16 {
    0xb800 | ((a & 0x30) << 5) | (r << 4) | (a & 0xf)
}

const fn sbi(a: u16, b: u16) -> u16 {
    0x9a00 | (a << 3) | b
}

const fn sbic(a: u16, b: u16) -> u16 {
    0x9900 | (a << 3) | b
}

const fn rjmp(k: i16) -> u16 {
    0xc000 | (k as u16 & 0xfff)
}

const fn inc(d: u16) -> u16 {
    0x9403 | (d << 4)
}

const fn st_xp(r: u16) -> u16 {
    0x920d | (r << 4)
}

const SEI: u16 = 0x9478;
const CLI: u16 = 0x94f8;
const SLEEP: u16 = 0x9588;
const RETI: u16 = 0x9518;

/// `sts addr, r` as its two words.
const fn sts(r: u16, addr: u16) -> [u16; 2] {
    [0x9200 | (r << 4), addr]
}

fn assemble(chunks: &[&[u16]]) -> Vec<u16> {
    let mut v = Vec::new();
    for c in chunks {
        v.extend_from_slice(c);
    }
    v
}

// ---- ATmega88 interrupt-priority storm -----------------------------------

#[test]
fn atmega88_priority_storm_services_lowest_first() {
    // Every enabled vector gets a two-word stub that records its number
    // into a RAM buffer; the harness raises them all, highest first,
    // inside one scheduled callback.
    const EICRA: u16 = 0x69;
    const WDTCSR: u16 = 0x60;
    const TIMSK0: u16 = 0x6e;
    const TIMSK1: u16 = 0x6f;
    const TIMSK2: u16 = 0x70;
    const EIMSK_IO: u16 = 0x3d - 0x20;
    const BUF: u16 = 0x200;

    let vectors: Vec<u8> = vec![1, 2, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

    let mut avr = chips::make_mcu_by_name("atmega88", 8).unwrap();

    // Vector slots: word v holds a jump to its stub.
    let handlers = 20u16; // stubs start here, 2 words each
    let common = handlers + 2 * 16; // shared store/RETI tail
    for v in 1..=16u16 {
        let stub = handlers + 2 * (v - 1);
        avr.load_words(&[rjmp(stub as i16 - v as i16 - 1)], v as u32)
            .unwrap();
        avr.load_words(
            &[ldi(16, v as u8), rjmp(common as i16 - (stub + 1) as i16 - 1)],
            stub as u32,
        )
        .unwrap();
    }
    avr.load_words(&[st_xp(16), RETI], common as u32).unwrap();

    let main = 60u16;
    avr.load_words(&[rjmp(main as i16 - 1)], 0).unwrap();
    let code = assemble(&[
        &[ldi(26, 0x00), ldi(27, 0x02)], // X = BUF
        &[ldi(16, 0x0f)],
        &sts(16, EICRA), // INT0/INT1 rising edge
        &[ldi(16, 0x03), out(EIMSK_IO, 16)],
        &[ldi(16, 0x40)],
        &sts(16, WDTCSR), // WDIE
        &[ldi(16, 0x07)],
        &sts(16, TIMSK0),
        &[ldi(16, 0x27)],
        &sts(16, TIMSK1),
        &[ldi(16, 0x07)],
        &sts(16, TIMSK2),
        &[SEI],
        &[inc(20), rjmp(-2)],
    ]);
    avr.load_words(&code, main as u32).unwrap();

    // The storm: everything at once, highest priority raised last.
    let storm = vectors.clone();
    avr.cycle_timer_register_external(
        150,
        ExternalCycleHook::new(move |avr, _| {
            for v in storm.iter().rev() {
                avr.raise_interrupt(*v);
            }
            0
        }),
    );

    let mut first_service = 0;
    for _ in 0..4000 {
        avr.step();
        if first_service == 0 && avr.data[BUF as usize] != 0 {
            first_service = avr.cycle;
        }
        if avr.data[BUF as usize + vectors.len() - 1] != 0 {
            break;
        }
    }
    let got: Vec<u8> = avr.data[BUF as usize..BUF as usize + vectors.len()].to_vec();
    assert_eq!(got, vectors);
    // Services run back to back: the whole storm drains in a tight span.
    assert!(first_service > 150);
    assert!(avr.cycle - first_service < vectors.len() as u64 * 30);
}

// ---- ATmega88 I/O port event ordering ------------------------------------

#[test]
fn atmega88_port_writes_and_reads_are_observable_in_order() {
    const DDRD_IO: u16 = 0x0a;
    const PORTD_IO: u16 = 0x0b;
    const PIND_IO: u16 = 0x09;

    let mut avr = chips::make_mcu_by_name("atmega88", 8).unwrap();
    let code = assemble(&[
        &[ldi(26, 0x00), ldi(27, 0x02)],
        &[ldi(16, 0x0f), out(DDRD_IO, 16)],
        &[ldi(16, 0x0a), out(PORTD_IO, 16)],
        &[in_(17, PIND_IO), st_xp(17)],
        &[ldi(16, 0x30), out(PIND_IO, 16)], // toggle PORTD bits 4/5
        &[CLI, SLEEP],
    ]);
    avr.load_words(&code, 0).unwrap();

    let log: Rc<RefCell<Vec<(char, u32)>>> = Rc::new(RefCell::new(Vec::new()));
    let key = ioport_getirq_key('D');
    for (tag, index) in [
        ('d', IOPORT_IRQ_REG_DDR),
        ('o', IOPORT_IRQ_REG_PORT),
        ('i', IOPORT_IRQ_REG_PIN),
        ('p', IOPORT_IRQ_PIN_ALL),
    ] {
        let l = log.clone();
        let id = avr.io_getirq(key, index).unwrap();
        avr.irq_register_notify(
            id,
            ExternalHook::new(move |_, _, v| l.borrow_mut().push((tag, v))),
        );
    }

    assert_eq!(avr.run(), CpuState::Done);
    assert_eq!(avr.data[0x200], 0x0a);
    assert_eq!(
        log.borrow().as_slice(),
        &[
            ('d', 0x0f),
            ('o', 0x0a),
            ('p', 0x0a),
            ('i', 0x0a),
            ('o', 0x3a), // PIN-write toggle lands in PORT
            ('p', 0x3a),
        ]
    );
}

// ---- ATtiny85 pin-change wakeup ------------------------------------------

#[test]
fn attiny85_pcint_wakes_from_sleep() {
    const GIMSK_IO: u16 = 0x3b;
    const PCMSK_IO: u16 = 0x15;

    let mut avr = chips::make_mcu_by_name("attiny85", 8).unwrap();

    // Vector 2 (PCINT0) -> stub counting wakeups.
    let isr = 16u16;
    let main = 20u16;
    avr.load_words(&[rjmp(main as i16 - 1)], 0).unwrap();
    avr.load_words(&[rjmp(isr as i16 - 2 - 1)], 2).unwrap();
    avr.load_words(&[inc(21), RETI], isr as u32).unwrap();
    // The wakeup ISR runs only after the one instruction following
    // SLEEP, so the main loop polls its counter between naps.
    let code = assemble(&[
        &[ldi(16, 0x01), out(PCMSK_IO, 16)], // main+0..1
        &[ldi(16, 0x20), out(GIMSK_IO, 16)], // main+2..3
        &[SEI],                              // main+4
        &[0xfe00 | (21 << 4)],               // main+5: sbrs r21, 0
        &[rjmp(1)],                          // main+6: -> sleep
        &[rjmp(2)],                          // main+7: -> done
        &[SLEEP],                            // main+8
        &[rjmp(-5)],                         // main+9: -> poll
        &[CLI, SLEEP],                       // main+10..11: done
    ]);
    avr.load_words(&code, main as u32).unwrap();

    avr.cycle_timer_register_external(
        500,
        ExternalCycleHook::new(|avr, _| {
            let pin0 = avr.io_getirq(ioport_getirq_key('B'), 0).unwrap();
            avr.raise_irq(pin0, 1);
            0
        }),
    );

    assert_eq!(avr.run(), CpuState::Done);
    assert_eq!(avr.data[21], 1);
    assert!(avr.cycle >= 500);
    // The sleep was fast-forwarded, not spun.
    assert!(avr.cycle < 2000);
}

// ---- ATtiny85 EEPROM programming cycle -----------------------------------

#[test]
fn attiny85_eeprom_write_and_read_back() {
    const EECR_IO: u16 = 0x1c;
    const EEDR_IO: u16 = 0x1d;
    const EEARL_IO: u16 = 0x1e;

    let mut avr = chips::make_mcu_by_name("attiny85", 8).unwrap();
    let code = assemble(&[
        &[ldi(26, 0x00), ldi(27, 0x01)], // X = 0x100 (tiny SRAM starts at 0x60)
        &[ldi(16, 0x10), out(EEARL_IO, 16)],
        &[ldi(16, 0x5a), out(EEDR_IO, 16)],
        &[sbi(EECR_IO, 2)], // EEMPE
        &[sbi(EECR_IO, 1)], // EEPE
        // Busy-wait for the programming time.
        &[sbic(EECR_IO, 1), rjmp(-2)],
        &[ldi(16, 0x00), out(EEDR_IO, 16)], // scrub EEDR
        &[sbi(EECR_IO, 0)],                 // EERE
        &[in_(17, EEDR_IO), st_xp(17)],
        &[CLI, SLEEP],
    ]);
    avr.load_words(&code, 0).unwrap();

    assert_eq!(avr.run(), CpuState::Done);
    assert_eq!(avr.eeprom_data().unwrap()[0x10], 0x5a);
    assert_eq!(avr.data[0x100], 0x5a);
    // The write took its documented programming time.
    assert!(avr.cycle >= avr.usec_to_cycles(3400));
}

// ---- ATtiny85 timer interrupt cadence ------------------------------------

#[test]
fn attiny85_timer0_overflow_interrupt_cadence() {
    const TCCR0B_IO: u16 = 0x33;
    const TIMSK_IO: u16 = 0x39;

    let mut avr = chips::make_mcu_by_name("attiny85", 8).unwrap();
    // Vector 5 = TIMER0_OVF.
    let isr = 16u16;
    let main = 20u16;
    avr.load_words(&[rjmp(main as i16 - 1)], 0).unwrap();
    avr.load_words(&[rjmp(isr as i16 - 5 - 1)], 5).unwrap();
    avr.load_words(&[inc(21), RETI], isr as u32).unwrap();
    let code = assemble(&[
        &[ldi(16, 0x03), out(TCCR0B_IO, 16)], // /64
        &[ldi(16, 0x02), out(TIMSK_IO, 16)],  // TOIE0
        &[SEI],
        &[rjmp(-1)],
    ]);
    avr.load_words(&code, main as u32).unwrap();

    // Three overflows at 256 * 64 cycles apart.
    let limit = 3 * 256 * 64 + 500;
    while avr.data[21] < 3 && avr.cycle < limit {
        avr.step();
    }
    assert_eq!(avr.data[21], 3);
    let expect = 3 * 256 * 64;
    assert!(avr.cycle as i64 - expect as i64 >= 0);
    assert!((avr.cycle as i64 - expect as i64) < 300);
}

// ---- Reset clears peripheral and interrupt state -------------------------

#[test]
fn reset_clears_pending_work_but_keeps_signals() {
    let mut avr = chips::make_mcu_by_name("atmega88", 8).unwrap();
    avr.data[0x6e] = 0x01; // TIMSK0
    avr.raise_interrupt(16);
    assert!(avr.has_pending_interrupts());
    let pin3 = avr.io_getirq(ioport_getirq_key('B'), 3).unwrap();
    avr.raise_irq(pin3, 1);

    avr.reset();
    assert!(!avr.has_pending_interrupts());
    assert_eq!(avr.cycle, 0);
    assert_eq!(avr.state, CpuState::Running);
    // Signals survive reset and remain discoverable.
    assert_eq!(avr.io_getirq(ioport_getirq_key('B'), 3), Some(pin3));
}
