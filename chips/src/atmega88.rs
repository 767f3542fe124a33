// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ATmega88: three ports, 8-bit timer 0, 16-bit timer 1 with input
//! capture, async-capable timer 2, INT0/INT1, three pin-change banks,
//! ADC, comparator, EEPROM and watchdog.

use avr_core::acomp::Acomp;
use avr_core::adc::{Adc, MuxMode, ADC_BANDGAP_MV, ADC_VREF_AREF, ADC_VREF_V110, ADC_VREF_VCC};
use avr_core::eeprom::Eeprom;
use avr_core::extint::{Extint, ExtintEntry};
use avr_core::ioport::{Ioport, PcintConfig};
use avr_core::timer::{CsEntry, Timer, TimerComp, WgmMode};
use avr_core::watchdog::Watchdog;
use avr_core::{regbit, regbits, Chip, RegBit, Vector};

// Data-space register addresses.
const PINB: u16 = 0x23;
const DDRB: u16 = 0x24;
const PORTB: u16 = 0x25;
const PINC: u16 = 0x26;
const DDRC: u16 = 0x27;
const PORTC: u16 = 0x28;
const PIND: u16 = 0x29;
const DDRD: u16 = 0x2a;
const PORTD: u16 = 0x2b;
const TIFR0: u16 = 0x35;
const TIFR1: u16 = 0x36;
const TIFR2: u16 = 0x37;
const PCIFR: u16 = 0x3b;
const EIFR: u16 = 0x3c;
const EIMSK: u16 = 0x3d;
const EECR: u16 = 0x3f;
const EEDR: u16 = 0x40;
const EEARL: u16 = 0x41;
const EEARH: u16 = 0x42;
const TCCR0A: u16 = 0x44;
const TCCR0B: u16 = 0x45;
const TCNT0: u16 = 0x46;
const OCR0A: u16 = 0x47;
const OCR0B: u16 = 0x48;
const ACSR: u16 = 0x50;
const SPL: u16 = 0x5d;
const SPH: u16 = 0x5e;
const SREG: u16 = 0x5f;
const WDTCSR: u16 = 0x60;
const PRR: u16 = 0x64;
const PCICR: u16 = 0x68;
const EICRA: u16 = 0x69;
const PCMSK0: u16 = 0x6b;
const PCMSK1: u16 = 0x6c;
const PCMSK2: u16 = 0x6d;
const TIMSK0: u16 = 0x6e;
const TIMSK1: u16 = 0x6f;
const TIMSK2: u16 = 0x70;
const ADCL: u16 = 0x78;
const ADCH: u16 = 0x79;
const ADCSRA: u16 = 0x7a;
const ADCSRB: u16 = 0x7b;
const ADMUX: u16 = 0x7c;
const TCCR1A: u16 = 0x80;
const TCCR1B: u16 = 0x81;
const TCCR1C: u16 = 0x82;
const TCNT1L: u16 = 0x84;
const TCNT1H: u16 = 0x85;
const ICR1L: u16 = 0x86;
const ICR1H: u16 = 0x87;
const OCR1AL: u16 = 0x88;
const OCR1AH: u16 = 0x89;
const OCR1BL: u16 = 0x8a;
const OCR1BH: u16 = 0x8b;
const TCCR2A: u16 = 0xb0;
const TCCR2B: u16 = 0xb1;
const TCNT2: u16 = 0xb2;
const OCR2A: u16 = 0xb3;
const OCR2B: u16 = 0xb4;
const ASSR: u16 = 0xb6;

// Vector numbers (reset is 0).
const INT0_VECT: u8 = 1;
const INT1_VECT: u8 = 2;
const PCINT0_VECT: u8 = 3;
const PCINT1_VECT: u8 = 4;
const PCINT2_VECT: u8 = 5;
const WDT_VECT: u8 = 6;
const TIMER2_COMPA_VECT: u8 = 7;
const TIMER2_COMPB_VECT: u8 = 8;
const TIMER2_OVF_VECT: u8 = 9;
const TIMER1_CAPT_VECT: u8 = 10;
const TIMER1_COMPA_VECT: u8 = 11;
const TIMER1_COMPB_VECT: u8 = 12;
const TIMER1_OVF_VECT: u8 = 13;
const TIMER0_COMPA_VECT: u8 = 14;
const TIMER0_COMPB_VECT: u8 = 15;
const TIMER0_OVF_VECT: u8 = 16;
const ADC_VECT: u8 = 21;
const EE_READY_VECT: u8 = 22;
const ANALOG_COMP_VECT: u8 = 23;

fn port(name: char, r_pin: u16, r_ddr: u16, r_port: u16, pcint: u8, r_pcmsk: u16) -> Ioport {
    Ioport {
        name,
        r_port,
        r_ddr,
        r_pin,
        pcint: Some(PcintConfig {
            vector: Vector {
                vector: pcint,
                enable: regbit(PCICR, pcint - PCINT0_VECT),
                raised: regbit(PCIFR, pcint - PCINT0_VECT),
                ..Default::default()
            },
            r_pcmsk,
        }),
        ..Default::default()
    }
}

fn cs_3bit() -> [CsEntry; 16] {
    let mut cs = [CsEntry::Stop; 16];
    cs[1] = CsEntry::Div(0);
    cs[2] = CsEntry::Div(3);
    cs[3] = CsEntry::Div(6);
    cs[4] = CsEntry::Div(8);
    cs[5] = CsEntry::Div(10);
    cs[6] = CsEntry::ExtFalling;
    cs[7] = CsEntry::ExtRising;
    cs
}

fn timer0() -> Timer {
    let mut wgm_op = [WgmMode::default(); 16];
    wgm_op[0] = WgmMode::normal(8);
    wgm_op[1] = WgmMode::phase_correct(8);
    wgm_op[2] = WgmMode::ctc(8);
    wgm_op[3] = WgmMode::fast_pwm(8);
    wgm_op[5] = WgmMode::phase_correct_ocra(8);
    wgm_op[7] = WgmMode::fast_pwm_ocra(8);

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
        cs_div: cs_3bit(),
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
    wgm_op[6] = WgmMode::fast_pwm(9);
    wgm_op[7] = WgmMode::fast_pwm(10);
    // Phase & frequency correct shares the dual-slope machinery.
    wgm_op[8] = WgmMode::phase_correct_icr(16);
    wgm_op[9] = WgmMode::phase_correct_ocra(16);
    wgm_op[10] = WgmMode::phase_correct_icr(16);
    wgm_op[11] = WgmMode::phase_correct_ocra(16);
    wgm_op[12] = WgmMode::ctc_icr(16);
    wgm_op[14] = WgmMode::fast_pwm_icr(16);
    wgm_op[15] = WgmMode::fast_pwm_ocra(16);

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
        cs_div: cs_3bit(),
        r_tcnt: TCNT1L,
        r_tcnth: TCNT1H,
        r_icr: ICR1L,
        r_icrh: ICR1H,
        icp: Some(('B', 0)),
        ices: regbit(TCCR1B, 6),
        ext_clock_pin: Some(('D', 5)),
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
                foc: regbit(TCCR1C, 7),
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
                foc: regbit(TCCR1C, 6),
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

fn timer2() -> Timer {
    let mut wgm_op = [WgmMode::default(); 16];
    wgm_op[0] = WgmMode::normal(8);
    wgm_op[1] = WgmMode::phase_correct(8);
    wgm_op[2] = WgmMode::ctc(8);
    wgm_op[3] = WgmMode::fast_pwm(8);
    wgm_op[5] = WgmMode::phase_correct_ocra(8);
    wgm_op[7] = WgmMode::fast_pwm_ocra(8);

    // Timer 2 has the finer prescaler chain and the async crystal.
    let mut cs_div = [CsEntry::Stop; 16];
    cs_div[1] = CsEntry::Div(0);
    cs_div[2] = CsEntry::Div(3);
    cs_div[3] = CsEntry::Div(5);
    cs_div[4] = CsEntry::Div(6);
    cs_div[5] = CsEntry::Div(7);
    cs_div[6] = CsEntry::Div(8);
    cs_div[7] = CsEntry::Div(10);

    Timer {
        name: '2',
        wgm: [
            regbit(TCCR2A, 0),
            regbit(TCCR2A, 1),
            regbit(TCCR2B, 3),
            RegBit::NONE,
        ],
        wgm_op,
        cs: [
            regbit(TCCR2B, 0),
            regbit(TCCR2B, 1),
            regbit(TCCR2B, 2),
            RegBit::NONE,
        ],
        cs_div,
        as2: regbit(ASSR, 5),
        r_tcnt: TCNT2,
        overflow: Vector {
            vector: TIMER2_OVF_VECT,
            enable: regbit(TIMSK2, 0),
            raised: regbit(TIFR2, 0),
            ..Default::default()
        },
        comp: [
            Some(TimerComp {
                r_ocr: OCR2A,
                com: regbits(TCCR2A, 6, 0x3),
                com_pin: Some(('B', 3)),
                foc: regbit(TCCR2B, 7),
                interrupt: Vector {
                    vector: TIMER2_COMPA_VECT,
                    enable: regbit(TIMSK2, 1),
                    raised: regbit(TIFR2, 1),
                    ..Default::default()
                },
                ..Default::default()
            }),
            Some(TimerComp {
                r_ocr: OCR2B,
                com: regbits(TCCR2A, 4, 0x3),
                com_pin: Some(('D', 3)),
                foc: regbit(TCCR2B, 6),
                interrupt: Vector {
                    vector: TIMER2_COMPB_VECT,
                    enable: regbit(TIMSK2, 2),
                    raised: regbit(TIFR2, 2),
                    ..Default::default()
                },
                ..Default::default()
            }),
            None,
        ],
        ..Default::default()
    }
}

fn adc() -> Adc {
    let mut muxmode = [MuxMode::None; 32];
    for i in 0..8 {
        muxmode[i] = MuxMode::Single { src: i as u8 };
    }
    muxmode[8] = MuxMode::Temp;
    muxmode[14] = MuxMode::Reference { mv: ADC_BANDGAP_MV };
    muxmode[15] = MuxMode::Reference { mv: 0 };

    Adc {
        r_admux: ADMUX,
        mux: [
            regbit(ADMUX, 0),
            regbit(ADMUX, 1),
            regbit(ADMUX, 2),
            regbit(ADMUX, 3),
            RegBit::NONE,
        ],
        ref_bits: [regbit(ADMUX, 6), regbit(ADMUX, 7), RegBit::NONE],
        ref_values: [
            ADC_VREF_AREF,
            ADC_VREF_VCC,
            0,
            ADC_VREF_V110,
            0,
            0,
            0,
            0,
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

pub fn atmega88() -> Chip {
    Chip {
        mmcu: "atmega88",
        flashend: 0x1fff,
        ramend: 0x04ff,
        ioend: 0xff,
        e2end: 0x1ff,
        vector_size: 1,
        addr_sreg: SREG,
        addr_spl: SPL,
        addr_sph: SPH,
        ports: vec![
            port('B', PINB, DDRB, PORTB, PCINT0_VECT, PCMSK0),
            port('C', PINC, DDRC, PORTC, PCINT1_VECT, PCMSK1),
            port('D', PIND, DDRD, PORTD, PCINT2_VECT, PCMSK2),
        ],
        timers: vec![timer0(), timer1(), timer2()],
        extint: Some(Extint {
            eint: vec![
                ExtintEntry {
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
                },
                ExtintEntry {
                    port_name: 'D',
                    port_pin: 3,
                    isc: [regbit(EICRA, 2), regbit(EICRA, 3)],
                    vector: Vector {
                        vector: INT1_VECT,
                        enable: regbit(EIMSK, 1),
                        raised: regbit(EIFR, 1),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        adc: Some(adc()),
        acomp: Some(Acomp {
            mux_inputs: 8,
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
            acic: regbit(ACSR, 2),
            disabled: regbit(ACSR, 7),
            interrupt: Vector {
                vector: ANALOG_COMP_VECT,
                enable: regbit(ACSR, 3),
                raised: regbit(ACSR, 4),
                ..Default::default()
            },
            timer_name: '1',
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
                vector: EE_READY_VECT,
                enable: regbit(EECR, 3),
                ..Default::default()
            },
            ..Default::default()
        }),
        watchdog: Some(Watchdog {
            r_wdtcr: WDTCSR,
            wdce: regbit(WDTCSR, 4),
            wde: regbit(WDTCSR, 3),
            wdp: [
                regbit(WDTCSR, 0),
                regbit(WDTCSR, 1),
                regbit(WDTCSR, 2),
                regbit(WDTCSR, 5),
            ],
            interrupt: Vector {
                vector: WDT_VECT,
                enable: regbit(WDTCSR, 6),
                raised: regbit(WDTCSR, 7),
                ..Default::default()
            },
            ..Default::default()
        }),
        usi: None,
    }
}
