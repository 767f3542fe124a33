// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared fixtures: a synthetic test MCU and a tiny opcode assembler.

#![allow(dead_code)]

use avr_core::extint::{Extint, ExtintEntry};
use avr_core::interrupts::Vector;
use avr_core::ioport::{Ioport, PcintConfig};
use avr_core::timer::{CsEntry, Timer, TimerComp, WgmMode};
use avr_core::{regbit, regbits, Avr, Chip, RegBit};

pub const PINB: u16 = 0x23;
pub const DDRB: u16 = 0x24;
pub const PORTB: u16 = 0x25;
pub const PIND: u16 = 0x29;
pub const DDRD: u16 = 0x2a;
pub const PORTD: u16 = 0x2b;
pub const TIFR0: u16 = 0x35;
pub const TIFR1: u16 = 0x36;
pub const PCIFR: u16 = 0x3b;
pub const EIFR: u16 = 0x3c;
pub const EIMSK: u16 = 0x3d;
pub const TCCR0A: u16 = 0x44;
pub const TCCR0B: u16 = 0x45;
pub const TCNT0: u16 = 0x46;
pub const OCR0A: u16 = 0x47;
pub const OCR0B: u16 = 0x48;
pub const SPL: u16 = 0x5d;
pub const SPH: u16 = 0x5e;
pub const SREG: u16 = 0x5f;
pub const PCICR: u16 = 0x68;
pub const EICRA: u16 = 0x69;
pub const PCMSK0: u16 = 0x6b;
pub const TIMSK0: u16 = 0x6e;
pub const TIMSK1: u16 = 0x6f;
pub const TCCR1A: u16 = 0x80;
pub const TCCR1B: u16 = 0x81;
pub const TCNT1L: u16 = 0x84;
pub const TCNT1H: u16 = 0x85;
pub const ICR1L: u16 = 0x86;
pub const ICR1H: u16 = 0x87;
pub const OCR1AL: u16 = 0x88;
pub const OCR1AH: u16 = 0x89;
pub const OCR1BL: u16 = 0x8a;
pub const OCR1BH: u16 = 0x8b;

pub const INT0_VECT: u8 = 1;
pub const PCINT0_VECT: u8 = 3;
pub const TIMER1_CAPT_VECT: u8 = 10;
pub const TIMER1_COMPA_VECT: u8 = 11;
pub const TIMER1_COMPB_VECT: u8 = 12;
pub const TIMER1_OVF_VECT: u8 = 13;
pub const TIMER0_COMPA_VECT: u8 = 14;
pub const TIMER0_COMPB_VECT: u8 = 15;
pub const TIMER0_OVF_VECT: u8 = 16;

fn timer0() -> Timer {
    let mut wgm_op = [WgmMode::default(); 16];
    wgm_op[0] = WgmMode::normal(8);
    wgm_op[1] = WgmMode::phase_correct(8);
    wgm_op[2] = WgmMode::ctc(8);
    wgm_op[3] = WgmMode::fast_pwm(8);
    wgm_op[7] = WgmMode::fast_pwm_ocra(8);
    let mut cs_div = [CsEntry::Stop; 16];
    cs_div[1] = CsEntry::Div(0);
    cs_div[2] = CsEntry::Div(3);
    cs_div[3] = CsEntry::Div(6);
    cs_div[4] = CsEntry::Div(8);
    cs_div[5] = CsEntry::Div(10);
    cs_div[6] = CsEntry::ExtFalling;
    cs_div[7] = CsEntry::ExtRising;
    Timer {
        name: '0',
        wgm: [
            regbit(TCCR0A, 0),
            regbit(TCCR0A, 1),
            regbit(TCCR0B, 3),
            RegBit::NONE,
        ],
        wgm_op,
        cs: [
            regbit(TCCR0B, 0),
            regbit(TCCR0B, 1),
            regbit(TCCR0B, 2),
            RegBit::NONE,
        ],
        cs_div,
        r_tcnt: TCNT0,
        ext_clock_pin: Some(('D', 4)),
        overflow: Vector {
            vector: TIMER0_OVF_VECT,
            enable: regbit(TIMSK0, 0),
            raised: regbit(TIFR0, 0),
            ..Default::default()
        },
        comp: [
            Some(TimerComp {
                r_ocr: OCR0A,
                com: regbits(TCCR0A, 6, 0x3),
                com_pin: Some(('D', 6)),
                foc: regbit(TCCR0B, 7),
                interrupt: Vector {
                    vector: TIMER0_COMPA_VECT,
                    enable: regbit(TIMSK0, 1),
                    raised: regbit(TIFR0, 1),
                    ..Default::default()
                },
                ..Default::default()
            }),
            Some(TimerComp {
                r_ocr: OCR0B,
                com: regbits(TCCR0A, 4, 0x3),
                com_pin: Some(('D', 5)),
                foc: regbit(TCCR0B, 6),
                interrupt: Vector {
                    vector: TIMER0_COMPB_VECT,
                    enable: regbit(TIMSK0, 2),
                    raised: regbit(TIFR0, 2),
                    ..Default::default()
                },
                ..Default::default()
            }),
            None,
        ],
        ..Default::default()
    }
}

fn timer1() -> Timer {
    let mut wgm_op = [WgmMode::default(); 16];
    wgm_op[0] = WgmMode::normal(16);
    wgm_op[1] = WgmMode::phase_correct(8);
    wgm_op[2] = WgmMode::phase_correct(9);
    wgm_op[3] = WgmMode::phase_correct(10);
    wgm_op[4] = WgmMode::ctc(16);
    wgm_op[5] = WgmMode::fast_pwm(8);
    wgm_op[12] = WgmMode::ctc_icr(16);
    wgm_op[14] = WgmMode::fast_pwm_icr(16);
    let mut cs_div = [CsEntry::Stop; 16];
    cs_div[1] = CsEntry::Div(0);
    cs_div[2] = CsEntry::Div(3);
    cs_div[3] = CsEntry::Div(6);
    cs_div[4] = CsEntry::Div(8);
    cs_div[5] = CsEntry::Div(10);
    Timer {
        name: '1',
        wgm: [
            regbit(TCCR1A, 0),
            regbit(TCCR1A, 1),
            regbit(TCCR1B, 3),
            regbit(TCCR1B, 4),
        ],
        wgm_op,
        cs: [
            regbit(TCCR1B, 0),
            regbit(TCCR1B, 1),
            regbit(TCCR1B, 2),
            RegBit::NONE,
        ],
        cs_div,
        r_tcnt: TCNT1L,
        r_tcnth: TCNT1H,
        r_icr: ICR1L,
        r_icrh: ICR1H,
        icp: Some(('B', 0)),
        ices: regbit(TCCR1B, 6),
        overflow: Vector {
            vector: TIMER1_OVF_VECT,
            enable: regbit(TIMSK1, 0),
            raised: regbit(TIFR1, 0),
            ..Default::default()
        },
        icr_vector: Vector {
            vector: TIMER1_CAPT_VECT,
            enable: regbit(TIMSK1, 5),
            raised: regbit(TIFR1, 5),
            ..Default::default()
        },
        comp: [
            Some(TimerComp {
                r_ocr: OCR1AL,
                r_ocrh: OCR1AH,
                com: regbits(TCCR1A, 6, 0x3),
                com_pin: Some(('B', 1)),
                interrupt: Vector {
                    vector: TIMER1_COMPA_VECT,
                    enable: regbit(TIMSK1, 1),
                    raised: regbit(TIFR1, 1),
                    ..Default::default()
                },
                ..Default::default()
            }),
            Some(TimerComp {
                r_ocr: OCR1BL,
                r_ocrh: OCR1BH,
                com: regbits(TCCR1A, 4, 0x3),
                com_pin: Some(('B', 2)),
                interrupt: Vector {
                    vector: TIMER1_COMPB_VECT,
                    enable: regbit(TIMSK1, 2),
                    raised: regbit(TIFR1, 2),
                    ..Default::default()
                },
                ..Default::default()
            }),
            None,
        ],
        ..Default::default()
    }
}

/// A representative little MCU: ports B and D, one 8-bit and one 16-bit
/// timer, INT0 and a pin-change bank.
pub fn testmcu() -> Chip {
    Chip {
        mmcu: "testmcu",
        flashend: 0x1fff,
        ramend: 0x04ff,
        ioend: 0xff,
        e2end: 0,
        vector_size: 1,
        addr_sreg: SREG,
        addr_spl: SPL,
        addr_sph: SPH,
        ports: vec![
            Ioport {
                name: 'B',
                r_port: PORTB,
                r_ddr: DDRB,
                r_pin: PINB,
                pcint: Some(PcintConfig {
                    vector: Vector {
                        vector: PCINT0_VECT,
                        enable: regbit(PCICR, 0),
                        raised: regbit(PCIFR, 0),
                        ..Default::default()
                    },
                    r_pcmsk: PCMSK0,
                }),
                ..Default::default()
            },
            Ioport {
                name: 'D',
                r_port: PORTD,
                r_ddr: DDRD,
                r_pin: PIND,
                ..Default::default()
            },
        ],
        timers: vec![timer0(), timer1()],
        extint: Some(Extint {
            eint: vec![ExtintEntry {
                port_name: 'D',
                port_pin: 2,
                isc: [regbit(EICRA, 0), regbit(EICRA, 1)],
                vector: Vector {
                    vector: INT0_VECT,
                    enable: regbit(EIMSK, 0),
                    raised: regbit(EIFR, 0),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }),
        adc: None,
        acomp: None,
        eeprom: None,
        watchdog: None,
        usi: None,
    }
}

pub fn machine() -> Avr {
    let _ = env_logger::builder().is_test(true).try_init();
    Avr::new(testmcu(), 8).unwrap()
}

/// Advance the machine's timebase cycle by cycle, draining the scheduler,
/// without executing instructions. Returns the cycle at which `until`
/// first reports true, if it does.
pub fn tick_until(avr: &mut Avr, limit: u64, mut until: impl FnMut(&Avr) -> bool) -> Option<u64> {
    for _ in 0..limit {
        avr.cycle += 1;
        avr.run_cycle_timers();
        if until(avr) {
            return Some(avr.cycle);
        }
    }
    None
}

// ---- Opcode helpers for hand-assembled firmware --------------------------

pub const fn ldi(d: u16, k: u8) -> u16 {
    0xe000 | ((k as u16 & 0xf0) << 4) | ((d - 16) << 4) | (k as u16 & 0xf)
}

/// IN Rd, addr (I/O address space, 0x00..0x3f).
pub const fn in_(d: u16, a: u16) -> u16 {
    0xb000 | ((a & 0x30) << 5) | (d << 4) | (a & 0xf)
}

/// OUT addr, Rr.
pub const fn out(a: u16, r: u16) -> u16 {
    0xb800 | ((a & 0x30) << 5) | (r << 4) | (a & 0xf)
}

pub const fn sts(r: u16) -> [u16; 2] {
    // Caller supplies the address word separately.
    [0x9200 | (r << 4), 0]
}

pub const fn rjmp(k: i16) -> u16 {
    0xc000 | (k as u16 & 0xfff)
}

pub const fn rcall(k: i16) -> u16 {
    0xd000 | (k as u16 & 0xfff)
}

pub const SEI: u16 = 0x9478;
pub const CLI: u16 = 0x94f8;
pub const SLEEP: u16 = 0x9588;
pub const RET: u16 = 0x9508;
pub const RETI: u16 = 0x9518;
pub const NOP: u16 = 0x0000;

pub const fn inc(d: u16) -> u16 {
    0x9403 | (d << 4)
}

/// ST X+, Rr
pub const fn st_xp(r: u16) -> u16 {
    0x920d | (r << 4)
}
