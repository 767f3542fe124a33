// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ATtiny85: one port, two 8-bit timers (timer 1 with the 15-step
//! prescaler and no waveform field), INT0 + PCINT0, ADC with the
//! differential gain pairs, comparator, EEPROM, watchdog and USI.

use avr_core::acomp::Acomp;
use avr_core::adc::{Adc, MuxMode, ADC_BANDGAP_MV, ADC_VREF_AREF, ADC_VREF_V110, ADC_VREF_V256, ADC_VREF_VCC};
use avr_core::eeprom::Eeprom;
use avr_core::extint::{Extint, ExtintEntry};
use avr_core::ioport::{Ioport, PcintConfig};
use avr_core::timer::{CsEntry, Timer, TimerComp, WgmMode};
use avr_core::usi::Usi;
use avr_core::watchdog::Watchdog;
use avr_core::{regbit, regbits, Chip, RegBit, Vector};

// Data-space register addresses.
const PRR: u16 = 0x20;
const ADCSRB: u16 = 0x23;
const ADCL: u16 = 0x24;
const ADCH: u16 = 0x25;
const ADCSRA: u16 = 0x26;
const ADMUX: u16 = 0x27;
const ACSR: u16 = 0x28;
const USICR: u16 = 0x2d;
const USISR: u16 = 0x2e;
const USIDR: u16 = 0x2f;
const PCMSK: u16 = 0x35;
const PINB: u16 = 0x36;
const DDRB: u16 = 0x37;
const PORTB: u16 = 0x38;
const EECR: u16 = 0x3c;
const EEDR: u16 = 0x3d;
const EEARL: u16 = 0x3e;
const EEARH: u16 = 0x3f;
const WDTCR: u16 = 0x41;
const OCR0B: u16 = 0x48;
const OCR0A: u16 = 0x49;
const TCCR0A: u16 = 0x4a;
const OCR1B: u16 = 0x4b;
const GTCCR: u16 = 0x4c;
const OCR1C: u16 = 0x4d;
const OCR1A: u16 = 0x4e;
const TCNT1: u16 = 0x4f;
const TCCR1: u16 = 0x50;
const TCNT0: u16 = 0x52;
const TCCR0B: u16 = 0x53;
const MCUCR: u16 = 0x55;
const TIFR: u16 = 0x58;
const TIMSK: u16 = 0x59;
const GIFR: u16 = 0x5a;
const GIMSK: u16 = 0x5b;
const SPL: u16 = 0x5d;
const SPH: u16 = 0x5e;
const SREG: u16 = 0x5f;

// Vector numbers (reset is 0).
const INT0_VECT: u8 = 1;
const PCINT0_VECT: u8 = 2;
const TIMER1_COMPA_VECT: u8 = 3;
const TIMER1_OVF_VECT: u8 = 4;
const TIMER0_OVF_VECT: u8 = 5;
const EE_RDY_VECT: u8 = 6;
const ANA_COMP_VECT: u8 = 7;
const ADC_VECT: u8 = 8;
const TIMER1_COMPB_VECT: u8 = 9;
const TIMER0_COMPA_VECT: u8 = 10;
const TIMER0_COMPB_VECT: u8 = 11;
const WDT_VECT: u8 = 12;
const USI_OVF_VECT: u8 = 14;

fn timer0() -> Timer {
    let mut wgm_op = [WgmMode::default(); 16];
    wgm_op[0] = WgmMode::normal(8);
    wgm_op[1] = WgmMode::phase_correct(8);
    wgm_op[2] = WgmMode::ctc(8);
    wgm_op[3] = WgmMode::fast_pwm(8);
    wgm_op[5] = WgmMode::phase_correct_ocra(8);
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
        ext_clock_pin: Some(('B', 2)),
        overflow: Vector {
            vector: TIMER0_OVF_VECT,
            enable: regbit(TIMSK, 1),
            raised: regbit(TIFR, 1),
            ..Default::default()
        },
        comp: [
            Some(TimerComp {
                r_ocr: OCR0A,
                com: regbits(TCCR0A, 6, 0x3),
                com_pin: Some(('B', 0)),
                foc: regbit(TCCR0B, 7),
                interrupt: Vector {
                    vector: TIMER0_COMPA_VECT,
                    enable: regbit(TIMSK, 4),
                    raised: regbit(TIFR, 4),
                    ..Default::default()
                },
                ..Default::default()
            }),
            Some(TimerComp {
                r_ocr: OCR0B,
                com: regbits(TCCR0A, 4, 0x3),
                com_pin: Some(('B', 1)),
                foc: regbit(TCCR0B, 6),
                interrupt: Vector {
                    vector: TIMER0_COMPB_VECT,
                    enable: regbit(TIMSK, 3),
                    raised: regbit(TIFR, 3),
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
    // No waveform field: always an 8-bit normal counter, but with the
    // deep 15-step prescaler chain.
    let mut wgm_op = [WgmMode::default(); 16];
    wgm_op[0] = WgmMode::normal(8);

    let mut cs_div = [CsEntry::Stop; 16];
    for (i, entry) in cs_div.iter_mut().enumerate().skip(1) {
        *entry = CsEntry::Div(i as u8 - 1);
    }

    Timer {
        name: '1',
        wgm_op,
        cs: [
            regbit(TCCR1, 0),
            regbit(TCCR1, 1),
            regbit(TCCR1, 2),
            regbit(TCCR1, 3),
        ],
        cs_div,
        r_tcnt: TCNT1,
        overflow: Vector {
            vector: TIMER1_OVF_VECT,
            enable: regbit(TIMSK, 2),
            raised: regbit(TIFR, 2),
            ..Default::default()
        },
        comp: [
            Some(TimerComp {
                r_ocr: OCR1A,
                com: regbits(TCCR1, 4, 0x3),
                com_pin: Some(('B', 1)),
                interrupt: Vector {
                    vector: TIMER1_COMPA_VECT,
                    enable: regbit(TIMSK, 6),
                    raised: regbit(TIFR, 6),
                    ..Default::default()
                },
                ..Default::default()
            }),
            Some(TimerComp {
                r_ocr: OCR1B,
                com: regbits(GTCCR, 4, 0x3),
                com_pin: Some(('B', 4)),
                interrupt: Vector {
                    vector: TIMER1_COMPB_VECT,
                    enable: regbit(TIMSK, 5),
                    raised: regbit(TIFR, 5),
                    ..Default::default()
                },
                ..Default::default()
            }),
            Some(TimerComp {
                r_ocr: OCR1C,
                ..Default::default()
            }),
        ],
        ..Default::default()
    }
}

fn adc() -> Adc {
    let mut muxmode = [MuxMode::None; 32];
    muxmode[0] = MuxMode::Single { src: 0 };
    muxmode[1] = MuxMode::Single { src: 1 };
    muxmode[2] = MuxMode::Single { src: 2 };
    muxmode[3] = MuxMode::Single { src: 3 };
    muxmode[4] = MuxMode::Diff { pos: 2, neg: 2, gain: 1 };
    muxmode[5] = MuxMode::Diff { pos: 2, neg: 2, gain: 20 };
    muxmode[6] = MuxMode::Diff { pos: 2, neg: 3, gain: 1 };
    muxmode[7] = MuxMode::Diff { pos: 2, neg: 3, gain: 20 };
    muxmode[8] = MuxMode::Diff { pos: 0, neg: 0, gain: 1 };
    muxmode[9] = MuxMode::Diff { pos: 0, neg: 0, gain: 20 };
    muxmode[10] = MuxMode::Diff { pos: 0, neg: 1, gain: 1 };
    muxmode[11] = MuxMode::Diff { pos: 0, neg: 1, gain: 20 };
    muxmode[12] = MuxMode::Reference { mv: ADC_BANDGAP_MV };
    muxmode[13] = MuxMode::Reference { mv: 0 };
    muxmode[15] = MuxMode::Temp;

    Adc {
        r_admux: ADMUX,
        mux: [
            regbit(ADMUX, 0),
            regbit(ADMUX, 1),
            regbit(ADMUX, 2),
            regbit(ADMUX, 3),
            RegBit::NONE,
        ],
        ref_bits: [regbit(ADMUX, 6), regbit(ADMUX, 7), regbit(ADMUX, 4)],
        ref_values: [
            ADC_VREF_VCC,
            ADC_VREF_AREF,
            ADC_VREF_V110,
            0,
            ADC_VREF_VCC,
            0,
            ADC_VREF_V256,
            ADC_VREF_V256,
        ],
        adlar: regbit(ADMUX, 5),
        r_adcsra: ADCSRA,
        aden: regbit(ADCSRA, 7),
        adsc: regbit(ADCSRA, 6),
        adate: regbit(ADCSRA, 5),
        adps: [regbit(ADCSRA, 0), regbit(ADCSRA, 1), regbit(ADCSRA, 2)],
        r_adch: ADCH,
        r_adcl: ADCL,
        r_adcsrb: ADCSRB,
        adts: [regbit(ADCSRB, 0), regbit(ADCSRB, 1), regbit(ADCSRB, 2)],
        bin: regbit(ADCSRB, 7),
        muxmode,
        interrupt: Vector {
            vector: ADC_VECT,
            enable: regbit(ADCSRA, 3),
            raised: regbit(ADCSRA, 4),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn attiny85() -> Chip {
    Chip {
        mmcu: "attiny85",
        flashend: 0x1fff,
        ramend: 0x025f,
        ioend: 0x5f,
        e2end: 0x1ff,
        vector_size: 1,
        addr_sreg: SREG,
        addr_spl: SPL,
        addr_sph: SPH,
        ports: vec![Ioport {
            name: 'B',
            r_port: PORTB,
            r_ddr: DDRB,
            r_pin: PINB,
            pcint: Some(PcintConfig {
                vector: Vector {
                    vector: PCINT0_VECT,
                    enable: regbit(GIMSK, 5),
                    raised: regbit(GIFR, 5),
                    ..Default::default()
                },
                r_pcmsk: PCMSK,
            }),
            ..Default::default()
        }],
        timers: vec![timer0(), timer1()],
        extint: Some(Extint {
            eint: vec![ExtintEntry {
                port_name: 'B',
                port_pin: 2,
                isc: [regbit(MCUCR, 0), regbit(MCUCR, 1)],
                vector: Vector {
                    vector: INT0_VECT,
                    enable: regbit(GIMSK, 6),
                    raised: regbit(GIFR, 6),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }),
        adc: Some(adc()),
        acomp: Some(Acomp {
            mux_inputs: 4,
            mux: [
                regbit(ADMUX, 0),
                regbit(ADMUX, 1),
                regbit(ADMUX, 2),
                regbit(ADMUX, 3),
            ],
            pradc: regbit(PRR, 0),
            aden: regbit(ADCSRA, 7),
            acme: regbit(ADCSRB, 6),
            r_acsr: ACSR,
            acis: [regbit(ACSR, 0), regbit(ACSR, 1)],
            aco: regbit(ACSR, 5),
            acbg: regbit(ACSR, 6),
            disabled: regbit(ACSR, 7),
            interrupt: Vector {
                vector: ANA_COMP_VECT,
                enable: regbit(ACSR, 3),
                raised: regbit(ACSR, 4),
                ..Default::default()
            },
            ..Default::default()
        }),
        eeprom: Some(Eeprom {
            r_eearl: EEARL,
            r_eearh: EEARH,
            r_eedr: EEDR,
            r_eecr: EECR,
            eere: regbit(EECR, 0),
            eepe: regbit(EECR, 1),
            eempe: regbit(EECR, 2),
            ready: Vector {
                vector: EE_RDY_VECT,
                enable: regbit(EECR, 3),
                ..Default::default()
            },
            ..Default::default()
        }),
        watchdog: Some(Watchdog {
            r_wdtcr: WDTCR,
            wdce: regbit(WDTCR, 4),
            wde: regbit(WDTCR, 3),
            wdp: [
                regbit(WDTCR, 0),
                regbit(WDTCR, 1),
                regbit(WDTCR, 2),
                regbit(WDTCR, 5),
            ],
            interrupt: Vector {
                vector: WDT_VECT,
                enable: regbit(WDTCR, 6),
                raised: regbit(WDTCR, 7),
                ..Default::default()
            },
            ..Default::default()
        }),
        usi: Some(Usi {
            r_usidr: USIDR,
            r_usisr: USISR,
            r_usicr: USICR,
            usioif: regbit(USISR, 6),
            usiwm: [regbit(USICR, 4), regbit(USICR, 5)],
            usics: [regbit(USICR, 2), regbit(USICR, 3)],
            usiclk: regbit(USICR, 1),
            usitc: regbit(USICR, 0),
            overflow: Vector {
                vector: USI_OVF_VECT,
                enable: regbit(USICR, 6),
                raised: regbit(USISR, 6),
                raise_sticky: true,
                ..Default::default()
            },
            di_pin: Some(('B', 0)),
            sck_pin: Some(('B', 2)),
            ..Default::default()
        }),
    }
}
