// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 8/16-bit Timer/Counter with waveform generation.
//!
//! The counter itself is never ticked; TCNT is derived on demand from the
//! cycle counter and a per-timer base, and all events (TOP, BOTTOM,
//! compare matches) are parked in the cycle-timer queue. Reconfiguration
//! (WGM, clock select, AS2) cancels everything and re-arms from the
//! current derived count.
//!
//! Externally clocked timers (Tn pin, async 32 kHz crystal) count edges or
//! run on a virtual clock with a fractional-cycle accumulator so long-term
//! frequency stays accurate.

use bitflags::bitflags;
use enumn::N;

use crate::cycle_timers::CycleSlot;
use crate::interrupts::Vector;
use crate::ioport::IOPORT_OUTPUT;
use crate::irq::{ioctl_instance, DeviceSink, IrqFlags, IrqId, IrqSink};
use crate::machine::{Avr, ConfigError};
use crate::memory::{IoRead, IoWrite};
use crate::regbit::{regbit_get_array, RegBit};

pub const TIMER_IRQ_OUT_PWM0: u32 = 0;
pub const TIMER_IRQ_OUT_PWM1: u32 = 1;
pub const TIMER_IRQ_OUT_PWM2: u32 = 2;
pub const TIMER_IRQ_IN_ICP: u32 = 3;
pub const TIMER_IRQ_OUT_COMP: u32 = 4;
pub const TIMER_IRQ_COUNT: u32 = 7;

pub const TIMER_COMP_COUNT: usize = 3;

pub const fn timer_getirq_key(name: char) -> u32 {
    ioctl_instance(*b"tmr", name)
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WgmKind {
    #[default]
    None,
    Normal,
    Ctc,
    FastPwm,
    PhaseCorrect,
}

/// Where TOP comes from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TopSource {
    /// The counter's numeric maximum for `size` bits.
    #[default]
    Max,
    Ocra,
    Icr,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WgmMode {
    pub kind: WgmKind,
    pub top: TopSource,
    /// Counter width in bits for this mode (8, 9, 10 or 16).
    pub size: u8,
}

impl WgmMode {
    pub const fn normal(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::Normal,
            top: TopSource::Max,
            size,
        }
    }

    pub const fn ctc(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::Ctc,
            top: TopSource::Ocra,
            size,
        }
    }

    pub const fn ctc_icr(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::Ctc,
            top: TopSource::Icr,
            size,
        }
    }

    pub const fn fast_pwm(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::FastPwm,
            top: TopSource::Max,
            size,
        }
    }

    pub const fn fast_pwm_ocra(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::FastPwm,
            top: TopSource::Ocra,
            size,
        }
    }

    pub const fn fast_pwm_icr(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::FastPwm,
            top: TopSource::Icr,
            size,
        }
    }

    pub const fn phase_correct(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::PhaseCorrect,
            top: TopSource::Max,
            size,
        }
    }

    pub const fn phase_correct_ocra(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::PhaseCorrect,
            top: TopSource::Ocra,
            size,
        }
    }

    pub const fn phase_correct_icr(size: u8) -> WgmMode {
        WgmMode {
            kind: WgmKind::PhaseCorrect,
            top: TopSource::Icr,
            size,
        }
    }

    fn max(&self) -> u32 {
        (1u32 << self.size) - 1
    }
}

/// One clock-select table entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CsEntry {
    #[default]
    Stop,
    /// Prescaler divisor as a power of two (cycles per timer tick).
    Div(u8),
    ExtFalling,
    ExtRising,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ExtClock: u8 {
        /// Clocked from the Tn pin.
        const TN = 1 << 0;
        /// Count rising edges (falling otherwise).
        const EDGE = 1 << 1;
        /// Asynchronous 32 kHz crystal (AS2).
        const AS2 = 1 << 2;
        /// At least one edge seen since configuration.
        const STARTED = 1 << 3;
        /// Model the external clock virtually instead of per-edge.
        const VIRT = 1 << 4;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum ComMode {
    Disconnected = 0,
    Toggle = 1,
    Clear = 2,
    Set = 3,
}

#[derive(Clone, Debug, Default)]
pub struct TimerComp {
    pub r_ocr: u16,
    pub r_ocrh: u16,
    /// Compare-output-mode field (2 bits).
    pub com: RegBit,
    /// Physical OCnX pin, when one exists.
    pub com_pin: Option<(char, u8)>,
    /// Force-output-compare strobe bit.
    pub foc: RegBit,
    pub interrupt: Vector,

    // Runtime state.
    pub ocr: u16,
    pub comp_cycles: u64,
    pub wave_active: bool,
    pub pin_irq: Option<IrqId>,
}

#[derive(Clone, Debug, Default)]
pub struct Timer {
    pub name: char,
    pub wgm: [RegBit; 4],
    pub wgm_op: [WgmMode; 16],
    pub cs: [RegBit; 4],
    pub cs_div: [CsEntry; 16],
    pub as2: RegBit,
    pub r_tcnt: u16,
    pub r_tcnth: u16,
    pub r_icr: u16,
    pub r_icrh: u16,
    /// Input-capture pin and its edge-select bit.
    pub icp: Option<(char, u8)>,
    pub ices: RegBit,
    /// Tn external clock pin.
    pub ext_clock_pin: Option<(char, u8)>,
    pub overflow: Vector,
    pub icr_vector: Vector,
    pub comp: [Option<TimerComp>; TIMER_COMP_COUNT],

    // Runtime state.
    pub irq_base: IrqId,
    pub mode: WgmMode,
    pub top: u32,
    /// Cycles per timer tick; zero while the clock is stopped.
    pub cs_div_value: u32,
    /// Cycle of the last TOP event for internally clocked timers; the raw
    /// count itself for externally clocked ones.
    pub tov_base: u64,
    pub tov_cycles: u64,
    pub down: bool,
    pub bottom: bool,
    pub ext_flags: ExtClock,
    pub ext_clock: f32,
    pub tov_cycles_fract: f32,
    pub phase_accumulator: f32,
}

// ---- Register assembly helpers ------------------------------------------

fn get_ocr(avr: &Avr, t: usize, comp: usize) -> u16 {
    let cp = avr.timers[t].comp[comp].as_ref().unwrap();
    let mut v = avr.data[cp.r_ocr as usize] as u16;
    if cp.r_ocrh != 0 {
        v |= (avr.data[cp.r_ocrh as usize] as u16) << 8;
    }
    v
}

fn get_tcnt_raw(avr: &Avr, t: usize) -> u16 {
    let p = &avr.timers[t];
    let mut v = avr.data[p.r_tcnt as usize] as u16;
    if p.r_tcnth != 0 {
        v |= (avr.data[p.r_tcnth as usize] as u16) << 8;
    }
    v
}

fn get_icr(avr: &Avr, t: usize) -> u16 {
    let p = &avr.timers[t];
    if p.r_icr == 0 {
        return 0;
    }
    let mut v = avr.data[p.r_icr as usize] as u16;
    if p.r_icrh != 0 {
        v |= (avr.data[p.r_icrh as usize] as u16) << 8;
    }
    v
}

fn port_pin_bit(avr: &Avr, pin: (char, u8)) -> u8 {
    match avr.ports.iter().find(|p| p.name == pin.0) {
        Some(p) => (avr.data[p.r_pin as usize] >> pin.1) & 1,
        None => 0,
    }
}

fn port_pin_irq(avr: &Avr, pin: (char, u8)) -> Option<IrqId> {
    avr.ports
        .iter()
        .find(|p| p.name == pin.0)
        .map(|p| IrqId(p.irq_base.0 + pin.1 as u32))
}

fn uses_ext_clock(p: &Timer) -> bool {
    p.ext_flags.intersects(ExtClock::TN | ExtClock::AS2)
}

fn virt_clock(p: &Timer) -> bool {
    uses_ext_clock(p) && p.ext_flags.contains(ExtClock::VIRT)
}

/// Logical counter value derived from the cycle counter.
pub fn current_tcnt(avr: &Avr, t: usize) -> u16 {
    let p = &avr.timers[t];
    if p.mode.kind == WgmKind::None {
        return get_tcnt_raw(avr, t);
    }
    if !uses_ext_clock(p) || virt_clock(p) {
        if p.tov_cycles != 0 && p.cs_div_value != 0 {
            let ticks = avr.cycle.wrapping_sub(p.tov_base) / p.cs_div_value as u64;
            if p.mode.kind == WgmKind::PhaseCorrect {
                if p.down {
                    return (p.top as u64).wrapping_sub(ticks).wrapping_sub(1) as u16;
                } else if p.bottom {
                    return ticks.wrapping_sub(p.top as u64).wrapping_add(1) as u16;
                }
            }
            return ticks as u16;
        }
        0
    } else {
        p.tov_base as u16
    }
}

// ---- Compare output unit -------------------------------------------------

/// Handle a compare event: interrupt (unless forced), then the COM pin
/// action routed over the compare-output signal.
fn comp_event(avr: &mut Avr, t: usize, comp: usize, _when: u64, raise_interrupt: bool) {
    let Some(cp) = avr.timers[t].comp[comp].clone() else {
        return;
    };
    if raise_interrupt {
        avr.raise_interrupt(cp.interrupt.vector);
    }

    let mode = ComMode::n(cp.com.get(&avr.data)).unwrap_or(ComMode::Disconnected);
    let irq = IrqId(avr.timers[t].irq_base.0 + TIMER_IRQ_OUT_COMP + comp as u32);
    let have_pin = cp.pin_irq.is_some();

    // Waveform output drives the physical pin only while a non-normal COM
    // mode is selected; hook and unhook the pin chain on transitions.
    if have_pin {
        let pin_irq = cp.pin_irq.unwrap();
        if cp.wave_active && mode == ComMode::Disconnected {
            avr.unconnect_irq(irq, pin_irq);
            avr.timers[t].comp[comp].as_mut().unwrap().wave_active = false;
        } else if !cp.wave_active && mode != ComMode::Disconnected {
            avr.connect_irq(irq, pin_irq);
            avr.timers[t].comp[comp].as_mut().unwrap().wave_active = true;
        }
    }
    let wave_active = avr.timers[t].comp[comp].as_ref().unwrap().wave_active;
    let flags: u32 = if wave_active { IOPORT_OUTPUT } else { 0 };
    let kind = avr.timers[t].mode.kind;
    let top = avr.timers[t].mode.top;
    let down = avr.timers[t].down as u32;

    match kind {
        WgmKind::PhaseCorrect => match mode {
            ComMode::Disconnected => avr.raise_irq(irq, 1),
            ComMode::Toggle => {
                if comp != 0 || top == TopSource::Max || !have_pin {
                    let v = avr.pool.value(irq);
                    avr.raise_irq(irq, if v != 0 { 0 } else { 1 });
                } else {
                    // Toggle only applies with TOP = OCRA on these modes.
                    let pin = cp.com_pin.map(|p| port_pin_bit(avr, p)).unwrap_or(0);
                    avr.raise_irq(irq, flags | (pin == 0) as u32);
                }
            }
            // Dual slope: clear-on-match-up means set-on-match-down.
            ComMode::Clear => avr.raise_irq(irq, flags | down),
            ComMode::Set => avr.raise_irq(irq, flags | (down ^ 1)),
        },
        _ => match mode {
            ComMode::Disconnected => avr.raise_irq(irq, 1),
            ComMode::Toggle => {
                if have_pin {
                    let pin = cp.com_pin.map(|p| port_pin_bit(avr, p)).unwrap_or(0);
                    avr.raise_irq(irq, flags | (pin == 0) as u32);
                } else {
                    let v = avr.pool.value(irq);
                    avr.raise_irq(irq, if v != 0 { 0 } else { 1 });
                }
            }
            ComMode::Clear => avr.raise_irq(irq, flags),
            ComMode::Set => avr.raise_irq(irq, flags | 1),
        },
    }
}

/// PWM overflow side of the compare pin: the inverse action re-arms the
/// waveform at TOP/BOTTOM.
fn comp_on_tov(avr: &mut Avr, t: usize, comp: usize) {
    let kind = avr.timers[t].mode.kind;
    if kind != WgmKind::FastPwm && kind != WgmKind::PhaseCorrect {
        return;
    }
    let Some(cp) = avr.timers[t].comp[comp].clone() else {
        return;
    };
    let mode = ComMode::n(cp.com.get(&avr.data)).unwrap_or(ComMode::Disconnected);
    let irq = IrqId(avr.timers[t].irq_base.0 + TIMER_IRQ_OUT_COMP + comp as u32);
    let flags: u32 = if cp.com_pin.is_some() { IOPORT_OUTPUT } else { 0 };
    match mode {
        ComMode::Disconnected | ComMode::Toggle => {}
        ComMode::Clear => avr.raise_irq(irq, flags | 1),
        ComMode::Set => avr.raise_irq(irq, flags),
    }
}

/// Cycle-slot entry point for a compare match.
pub(crate) fn comp_fire(avr: &mut Avr, t: usize, comp: usize, when: u64) -> u64 {
    comp_event(avr, t, comp, when, true);
    0
}

// ---- Scheduling ----------------------------------------------------------

fn cancel_all(avr: &mut Avr, t: usize, clear: bool) {
    if clear {
        for comp in avr.timers[t].comp.iter_mut().flatten() {
            comp.comp_cycles = 0;
        }
        avr.timers[t].tov_cycles = 0;
    }
    avr.cycle_timer_cancel(CycleSlot::TimerTov(t as u8));
    avr.cycle_timer_cancel(CycleSlot::TimerBottom(t as u8));
    for c in 0..TIMER_COMP_COUNT {
        avr.cycle_timer_cancel(CycleSlot::TimerComp(t as u8, c as u8));
    }
}

/// Latch buffered OCR values; true when anything changed.
fn update_ocr(avr: &mut Avr, t: usize) -> bool {
    let mut action = false;
    for c in 0..TIMER_COMP_COUNT {
        if avr.timers[t].comp[c].as_ref().map_or(true, |cp| cp.r_ocr == 0) {
            break;
        }
        let buffered = get_ocr(avr, t, c);
        let div = avr.timers[t].cs_div_value as u64;
        let cp = avr.timers[t].comp[c].as_mut().unwrap();
        if cp.ocr != buffered {
            cp.ocr = buffered;
            cp.comp_cycles = (buffered as u64 + 1) * div;
            action = true;
        }
    }
    action
}

/// Fractional-cycle correction for external/async clocking: accumulate
/// the per-period remainder and pay it back one whole cycle at a time.
fn cycle_adjust(avr: &mut Avr, t: usize) -> i64 {
    let p = &mut avr.timers[t];
    let mut adj = 0i64;
    if uses_ext_clock(p) && p.tov_cycles_fract != 0.0 {
        p.phase_accumulator += p.tov_cycles_fract;
        if p.bottom {
            p.phase_accumulator += p.tov_cycles_fract;
        }
        if p.phase_accumulator >= 1.0 {
            adj += 1;
            p.phase_accumulator -= 1.0;
        } else if p.phase_accumulator <= -1.0 {
            adj -= 1;
            p.phase_accumulator += 1.0;
        }
    }
    adj
}

fn register_at(avr: &mut Avr, target: i64, slot: CycleSlot) {
    avr.cycle_timers.register(target.max(0) as u64, slot);
}

/// BOTTOM of fast and dual-slope PWM periods.
pub(crate) fn bottom(avr: &mut Avr, t: usize, when: u64) -> u64 {
    match avr.timers[t].mode.kind {
        WgmKind::FastPwm => {
            if update_ocr(avr, t) {
                if avr.timers[t].mode.top == TopSource::Ocra {
                    reconfigure(avr, t, false);
                } else {
                    start(avr, t);
                }
            }
        }
        WgmKind::PhaseCorrect => {
            let frac = cycle_adjust(avr, t);
            avr.timers[t].down = false;
            avr.timers[t].bottom = true;
            let overflow = avr.timers[t].overflow.vector;
            avr.raise_interrupt(overflow);
            update_ocr(avr, t);
            for c in 0..TIMER_COMP_COUNT {
                let Some(cp) = avr.timers[t].comp[c].clone() else {
                    break;
                };
                if cp.r_ocr == 0 {
                    break;
                }
                if cp.comp_cycles != 0 {
                    register_at(
                        avr,
                        when as i64 + cp.comp_cycles as i64 + frac,
                        CycleSlot::TimerComp(t as u8, c as u8),
                    );
                }
            }
        }
        _ => {}
    }
    0
}

/// TOP: single-slope overflow actions and the next round of compare
/// schedules; dual-slope modes flip to counting down and park BOTTOM.
pub(crate) fn tov(avr: &mut Avr, t: usize, when: u64) -> u64 {
    let frac = cycle_adjust(avr, t);
    let kind = avr.timers[t].mode.kind;
    let div = avr.timers[t].cs_div_value as u64;
    let top = avr.timers[t].top as u64;

    match kind {
        WgmKind::PhaseCorrect => {
            avr.timers[t].down = true;
            avr.timers[t].bottom = false;
            let down_cycles = top.saturating_sub(1) * div;
            register_at(
                avr,
                when as i64 + down_cycles as i64 + frac,
                CycleSlot::TimerBottom(t as u8),
            );
            update_ocr(avr, t);
        }
        WgmKind::FastPwm => {
            register_at(avr, when as i64 + div as i64, CycleSlot::TimerBottom(t as u8));
            let overflow = avr.timers[t].overflow.vector;
            avr.raise_interrupt(overflow);
            // TOP-from-register modes flag the TOP event on that
            // register's interrupt as well.
            match avr.timers[t].mode.top {
                TopSource::Icr => {
                    let v = avr.timers[t].icr_vector.vector;
                    avr.raise_interrupt(v);
                }
                TopSource::Ocra => {
                    if let Some(cp) = &avr.timers[t].comp[0] {
                        let v = cp.interrupt.vector;
                        avr.raise_interrupt(v);
                    }
                }
                TopSource::Max => {}
            }
        }
        WgmKind::Ctc => {
            // A CTC period ends at the compare match; the overflow flag
            // only appears when TOP is the numeric maximum.
            if avr.timers[t].mode.top == TopSource::Max
                || current_tcnt(avr, t) as u32 >= avr.timers[t].top
            {
                let overflow = avr.timers[t].overflow.vector;
                avr.raise_interrupt(overflow);
            }
        }
        _ => {
            let overflow = avr.timers[t].overflow.vector;
            avr.raise_interrupt(overflow);
        }
    }
    avr.timers[t].tov_base = when;

    let tov_cycles = avr.timers[t].tov_cycles;
    let late = avr.cycle.wrapping_sub(when);
    for c in 0..TIMER_COMP_COUNT {
        let Some(cp) = avr.timers[t].comp[c].clone() else {
            break;
        };
        if cp.r_ocr == 0 {
            break;
        }
        if cp.comp_cycles == 0 {
            continue;
        }
        if cp.comp_cycles < tov_cycles && cp.comp_cycles >= late {
            comp_on_tov(avr, t, c);
            let next_match = if avr.timers[t].mode.kind == WgmKind::PhaseCorrect {
                tov_cycles - cp.comp_cycles
            } else {
                cp.comp_cycles
            };
            register_at(
                avr,
                when as i64 + next_match as i64 + frac,
                CycleSlot::TimerComp(t as u8, c as u8),
            );
        } else if cp.comp_cycles == tov_cycles {
            comp_event(avr, t, c, when, true);
        }
    }

    let next = if avr.timers[t].down {
        2 * top * div
    } else {
        tov_cycles
    };
    (next as i64 + frac).max(1) as u64
}

/// (Re)arm everything from the current derived count. Runs after any
/// register write that moves the counter or its schedule.
fn start(avr: &mut Avr, t: usize) {
    let tcnt = current_tcnt(avr, t) as u64;
    let p = &avr.timers[t];
    let div = p.cs_div_value as u64;
    if div == 0 {
        return;
    }
    let top = p.top as u64;
    let down = p.down;
    let size = p.mode.size;
    let now = avr.cycle as i64;
    let adj = if div > 1 {
        (avr.cycle.wrapping_sub(p.tov_base) % div) as i64 - 1
    } else {
        -1
    };

    if down {
        // Counting down: BOTTOM first, then TOP a full slope later.
        let when = (tcnt + 1) * div;
        register_at(avr, now + when as i64 - adj, CycleSlot::TimerBottom(t as u8));
        let to_top = (tcnt + top) * div;
        register_at(avr, now + to_top as i64 - adj, CycleSlot::TimerTov(t as u8));
    } else {
        let to_top = if tcnt >= top {
            ((1u64 << size) + 1).saturating_sub(tcnt).max(1)
        } else {
            top + 1 - tcnt
        };
        register_at(
            avr,
            now + (to_top * div) as i64 - adj,
            CycleSlot::TimerTov(t as u8),
        );
    }

    for c in 0..TIMER_COMP_COUNT {
        let Some(cp) = avr.timers[t].comp[c].clone() else {
            break;
        };
        if cp.r_ocr == 0 {
            break;
        }
        let m = cp.ocr as u64;
        if m >= top {
            continue; // Equality is handled by the TOP callback.
        }
        if tcnt < m && !down {
            let when = (m + 1 - tcnt) * div;
            register_at(
                avr,
                now + when as i64 - adj,
                CycleSlot::TimerComp(t as u8, c as u8),
            );
        } else if tcnt > m && down {
            let when = (tcnt - m + 1) * div;
            register_at(
                avr,
                now + when as i64 - adj,
                CycleSlot::TimerComp(t as u8, c as u8),
            );
        } else {
            avr.cycle_timer_cancel(CycleSlot::TimerComp(t as u8, c as u8));
        }
    }
}

fn configure(avr: &mut Avr, t: usize, prescaler: u32, top: u32, reset_phase: bool) {
    avr.timers[t].top = top;
    let freq = avr.frequency as f32;
    let use_ext = uses_ext_clock(&avr.timers[t]);
    let virt = virt_clock(&avr.timers[t]);

    {
        let p = &mut avr.timers[t];
        if !use_ext {
            p.tov_cycles = prescaler as u64 * (top as u64 + 1);
            p.tov_cycles_fract = 0.0;
        } else if !virt {
            p.tov_cycles = 0;
            p.tov_cycles_fract = 0.0;
        } else {
            let exact = freq / p.ext_clock * prescaler as f32 * (top as f32 + 1.0);
            p.tov_cycles = (exact + 0.5) as u64;
            p.tov_cycles_fract = exact - p.tov_cycles as f32;
        }
    }

    for c in 0..TIMER_COMP_COUNT {
        let Some(cp) = avr.timers[t].comp[c].clone() else {
            continue;
        };
        if cp.r_ocr == 0 {
            continue;
        }
        let ocr = cp.ocr as u64;
        let comp_cycles = if virt {
            (freq / avr.timers[t].ext_clock * prescaler as f32 * (ocr as f32 + 1.0)) as u64
        } else {
            prescaler as u64 * (ocr + 1)
        };
        let cp = avr.timers[t].comp[c].as_mut().unwrap();
        cp.comp_cycles = 0;
        if ocr <= top as u64 {
            cp.comp_cycles = comp_cycles;
        }
    }

    if !use_ext || virt {
        if avr.timers[t].tov_cycles > 1 {
            if reset_phase {
                avr.timers[t].phase_accumulator = 0.0;
            }
            start(avr, t);
        }
    } else if reset_phase {
        avr.timers[t].tov_base = 0;
    }

    if reset_phase {
        // Track the Tn pin only while it is the selected clock.
        if let Some(pin) = avr.timers[t].ext_clock_pin {
            if let Some(pin_irq) = port_pin_irq(avr, pin) {
                let sink = IrqSink::Device(DeviceSink::TimerExtClock { timer: t as u8 });
                if use_ext && !virt {
                    avr.pool.listen(pin_irq, sink);
                } else {
                    avr.pool.unlisten(pin_irq, sink);
                }
            }
        }
    }
}

fn reconfigure(avr: &mut Avr, t: usize, reset_phase: bool) {
    cancel_all(avr, t, true);
    let mode = avr.timers[t].mode;
    let div = avr.timers[t].cs_div_value;
    match mode.kind {
        WgmKind::Normal | WgmKind::None => configure(avr, t, div, mode.max(), reset_phase),
        WgmKind::Ctc => {
            let top = match mode.top {
                TopSource::Icr => get_icr(avr, t) as u32,
                _ => avr.timers[t].comp[0].as_ref().map_or(0, |c| c.ocr as u32),
            };
            configure(avr, t, div, top, reset_phase);
        }
        WgmKind::FastPwm | WgmKind::PhaseCorrect => {
            if mode.kind == WgmKind::PhaseCorrect && reset_phase {
                // The slope direction must be settled before the new
                // schedule is computed.
                avr.timers[t].down = false;
                avr.timers[t].bottom = false;
            }
            let top = match mode.top {
                TopSource::Icr => get_icr(avr, t) as u32,
                TopSource::Ocra => avr.timers[t].comp[0].as_ref().map_or(0, |c| c.ocr as u32),
                TopSource::Max => mode.max(),
            };
            configure(avr, t, div, top, reset_phase);
        }
    }
}

// ---- Register write handlers ---------------------------------------------

/// WGM / clock-select / AS2 registers.
pub(crate) fn control_write(avr: &mut Avr, t: usize, addr: u16, v: u8) {
    let p = &avr.timers[t];
    let old_as2 = p.as2.get(&avr.data);
    let old_cs = regbit_get_array(&avr.data, &p.cs);
    let old_mode = regbit_get_array(&avr.data, &p.wgm);

    avr.store(addr, v);

    let p = &avr.timers[t];
    let new_as2 = p.as2.get(&avr.data);
    let new_cs = regbit_get_array(&avr.data, &p.cs);
    let new_mode = regbit_get_array(&avr.data, &p.wgm);

    // Only a change to the clocking or waveform bits restarts the timer;
    // edge-select and force bits share these registers.
    if new_cs == old_cs && new_mode == old_mode && new_as2 == old_as2 {
        return;
    }

    let tcnt = current_tcnt(avr, t) as u64;
    let p = &avr.timers[t];
    let adj = if p.cs_div_value > 1 {
        avr.cycle.wrapping_sub(p.tov_base) % p.cs_div_value as u64
    } else {
        0
    };

    let p = &mut avr.timers[t];
    p.ext_flags
        .remove(ExtClock::TN | ExtClock::EDGE | ExtClock::AS2 | ExtClock::STARTED);
    let entry = p.cs_div[new_cs as usize];
    match entry {
        CsEntry::ExtFalling | CsEntry::ExtRising if p.ext_clock_pin.is_some() => {
            // External clock: the prescaler is irrelevant.
            p.cs_div_value = 1;
            p.ext_flags.insert(ExtClock::TN);
            if entry == CsEntry::ExtRising {
                p.ext_flags.insert(ExtClock::EDGE);
            }
        }
        CsEntry::Div(shift) => {
            p.cs_div_value = 1 << shift;
            if new_as2 != 0 {
                p.ext_flags.insert(ExtClock::AS2 | ExtClock::EDGE);
            }
        }
        _ => p.cs_div_value = 0,
    }

    p.mode = p.wgm_op[new_mode as usize];

    if p.cs_div_value == 0 || matches!(entry, CsEntry::Stop) {
        // Clock stopped: freeze everything.
        let stopped_from_running = old_cs != 0;
        p.cs_div_value = 0;
        p.down = false;
        p.bottom = false;
        p.mode = WgmMode {
            kind: WgmKind::None,
            ..p.mode
        };
        cancel_all(avr, t, true);
        if stopped_from_running {
            log::trace!("timer{} clock turned off", avr.timers[t].name);
        }
        // Freeze the visible count where it stood.
        let r_tcnt = avr.timers[t].r_tcnt;
        let r_tcnth = avr.timers[t].r_tcnth;
        avr.data[r_tcnt as usize] = tcnt as u8;
        if r_tcnth != 0 {
            avr.data[r_tcnth as usize] = (tcnt >> 8) as u8;
        }
    } else {
        let div = avr.timers[t].cs_div_value as u64;
        avr.timers[t].tov_base = avr.cycle.saturating_sub(tcnt * div + adj);
        reconfigure(avr, t, true);
    }
}

/// TCNT writes rebase the derived count.
pub(crate) fn tcnt_write(avr: &mut Avr, t: usize, addr: u16, v: u8) {
    avr.store(addr, v);
    let tcnt = get_tcnt_raw(avr, t) as u64;
    let p = &avr.timers[t];
    if !uses_ext_clock(p) || virt_clock(p) {
        let div = p.cs_div_value as u64;
        if div == 0 {
            return;
        }
        cancel_all(avr, t, false);
        avr.timers[t].tov_base = avr.cycle.saturating_sub(tcnt * div);
        if avr.timers[t].tov_cycles > 1 {
            start(avr, t);
        }
    } else {
        avr.timers[t].tov_base = tcnt;
    }
}

/// Reads of TCNT compute the count on demand.
pub(crate) fn tcnt_read(avr: &mut Avr, t: usize, _addr: u16) {
    let tcnt = current_tcnt(avr, t);
    let r_tcnt = avr.timers[t].r_tcnt;
    let r_tcnth = avr.timers[t].r_tcnth;
    avr.data[r_tcnt as usize] = tcnt as u8;
    if r_tcnth != 0 {
        avr.data[r_tcnth as usize] = (tcnt >> 8) as u8;
    }
}

pub(crate) fn ocr_write(avr: &mut Avr, t: usize, comp: usize, addr: u16, v: u8) {
    avr.store(addr, v);
    let newv = get_ocr(avr, t, comp);
    avr.raise_irq(
        IrqId(avr.timers[t].irq_base.0 + TIMER_IRQ_OUT_PWM0 + comp as u32),
        newv as u32,
    );

    let kind = avr.timers[t].mode.kind;
    if kind == WgmKind::FastPwm || kind == WgmKind::PhaseCorrect {
        return; // Buffered: latched at TOP/BOTTOM.
    }
    avr.timers[t].comp[comp].as_mut().unwrap().ocr = newv;
    reconfigure(avr, t, false);
}

/// Write-one-to-clear on the interrupt flag register.
pub(crate) fn pending_write(avr: &mut Avr, t: usize, addr: u16, v: u8) {
    let p = &avr.timers[t];
    let overflow = p.overflow;
    let icr = p.icr_vector;
    let comps: Vec<Vector> = p.comp.iter().flatten().map(|c| c.interrupt).collect();

    if overflow.raised.reg == addr && overflow.raised.from_value(v) != 0 {
        avr.clear_interrupt(overflow.vector);
    }
    if icr.raised.reg == addr && icr.raised.from_value(v) != 0 {
        avr.clear_interrupt(icr.vector);
    }
    for vec in comps {
        if vec.raised.reg == addr && vec.raised.from_value(v) != 0 {
            avr.clear_interrupt(vec.vector);
        }
    }
}

/// Force-output-compare strobes: act, don't store.
pub(crate) fn foc_write(avr: &mut Avr, t: usize, addr: u16, v: u8) {
    for c in 0..TIMER_COMP_COUNT {
        let Some(cp) = avr.timers[t].comp[c].clone() else {
            continue;
        };
        if cp.foc.reg == addr && cp.foc.from_value(v) != 0 {
            let when = avr.cycle;
            comp_event(avr, t, c, when, false);
        }
    }
}

// ---- Signal sinks --------------------------------------------------------

/// Input-capture pin change.
pub(crate) fn icp_change(avr: &mut Avr, t: usize, src: IrqId, value: u32) {
    if avr.timers[t].mode.top == TopSource::Icr {
        return; // ICR is TOP; capture is disabled.
    }
    let rising = avr.timers[t].ices.get(&avr.data) != 0;
    let old = avr.pool.value(src) & 1;
    let new = value & 1;
    let fired = if rising {
        old == 0 && new == 1
    } else {
        old == 1 && new == 0
    };
    if !fired {
        return;
    }
    let tcnt = current_tcnt(avr, t);
    let p = &avr.timers[t];
    let (r_icr, r_icrh, vector) = (p.r_icr, p.r_icrh, p.icr_vector.vector);
    if r_icr == 0 {
        return;
    }
    avr.data[r_icr as usize] = tcnt as u8;
    if r_icrh != 0 {
        avr.data[r_icrh as usize] = (tcnt >> 8) as u8;
    }
    avr.raise_interrupt(vector);
}

/// One edge of the Tn external clock.
pub(crate) fn ext_clock_edge(avr: &mut Avr, t: usize, src: IrqId, value: u32) {
    {
        let p = &avr.timers[t];
        if p.ext_flags.contains(ExtClock::VIRT) || p.top == 0 {
            return;
        }
        let old = avr.pool.value(src) & 1;
        let new = value & 1;
        let ticked = if p.ext_flags.contains(ExtClock::EDGE) {
            old == 0 && new == 1
        } else {
            old == 1 && new == 0
        };
        if !ticked {
            return;
        }
    }
    avr.timers[t].ext_flags.insert(ExtClock::STARTED);

    // Comparators observe the count from before the increment.
    for c in 0..TIMER_COMP_COUNT {
        let Some(cp) = avr.timers[t].comp[c].clone() else {
            break;
        };
        let kind = avr.timers[t].mode.kind;
        if kind != WgmKind::Ctc && avr.timers[t].mode.top == TopSource::Ocra && c == 0 {
            continue; // OCRA defines TOP here.
        }
        if cp.comp_cycles != 0 && avr.timers[t].tov_base == cp.comp_cycles {
            comp_event(avr, t, c, avr.cycle, true);
            if kind == WgmKind::Ctc {
                avr.timers[t].tov_base = 0;
            }
        }
    }

    let mut overflowed = false;
    let kind = avr.timers[t].mode.kind;
    let top = avr.timers[t].top as u64;
    let max = avr.timers[t].mode.max() as u64;
    {
        let p = &mut avr.timers[t];
        match kind {
            WgmKind::PhaseCorrect => {
                if p.down {
                    p.tov_base = p.tov_base.saturating_sub(1);
                    if p.tov_base == 0 {
                        p.down = false;
                        overflowed = true;
                    }
                } else {
                    p.tov_base += 1;
                    if p.tov_base >= top {
                        p.down = true;
                    }
                }
            }
            WgmKind::FastPwm => {
                p.tov_base += 1;
                if p.tov_base == top {
                    overflowed = true;
                } else if p.tov_base > top {
                    p.tov_base = 0;
                }
            }
            WgmKind::Ctc => {
                p.tov_base += 1;
                if p.tov_base > max {
                    p.tov_base = 0;
                    overflowed = true;
                }
            }
            _ => {
                p.tov_base += 1;
                if p.tov_base > top {
                    p.tov_base = 0;
                    overflowed = true;
                }
            }
        }
    }

    if overflowed {
        if kind == WgmKind::FastPwm {
            match avr.timers[t].mode.top {
                TopSource::Icr => {
                    let v = avr.timers[t].icr_vector.vector;
                    avr.raise_interrupt(v);
                }
                TopSource::Ocra => {
                    if let Some(cp) = &avr.timers[t].comp[0] {
                        let v = cp.interrupt.vector;
                        avr.raise_interrupt(v);
                    }
                }
                TopSource::Max => {}
            }
        }
        for c in 0..TIMER_COMP_COUNT {
            let has = avr.timers[t].comp[c]
                .as_ref()
                .map_or(false, |cp| cp.comp_cycles != 0);
            if has {
                if avr.timers[t].mode.top == TopSource::Ocra && c == 0 {
                    continue;
                }
                comp_on_tov(avr, t, c);
            }
        }
        let v = avr.timers[t].overflow.vector;
        avr.raise_interrupt(v);
    }
}

// ---- Lifecycle -----------------------------------------------------------

pub fn init(avr: &mut Avr, t: usize) -> Result<(), ConfigError> {
    let name = avr.timers[t].name;
    let base = avr.alloc_irqs(
        timer_getirq_key(name),
        TIMER_IRQ_COUNT,
        &[
            Some("8>pwm0"),
            Some("8>pwm1"),
            Some("8>pwm2"),
            Some("<icp"),
            Some(">compa"),
            Some(">compb"),
            Some(">compc"),
        ],
    );
    avr.timers[t].irq_base = base;
    for i in [TIMER_IRQ_OUT_PWM0, TIMER_IRQ_OUT_PWM1, TIMER_IRQ_OUT_PWM2] {
        avr.pool.set_flags(IrqId(base.0 + i), IrqFlags::FILTERED);
    }
    avr.pool.listen(
        IrqId(base.0 + TIMER_IRQ_IN_ICP),
        IrqSink::Device(DeviceSink::TimerIcp { timer: t as u8 }),
    );

    avr.register_vector(avr.timers[t].overflow)?;
    if avr.timers[t].icr_vector.vector != 0 {
        avr.register_vector(avr.timers[t].icr_vector)?;
    }

    // Watch every distinct register that carries WGM, CS or AS2 bits.
    let p = avr.timers[t].clone();
    let mut regs: Vec<u16> = Vec::new();
    for rb in p.wgm.iter().chain(p.cs.iter()).chain([p.as2].iter()) {
        if rb.reg != 0 && !regs.contains(&rb.reg) {
            regs.push(rb.reg);
            avr.register_io_write(rb.reg, IoWrite::TimerControl { timer: t as u8 });
        }
    }
    if p.overflow.raised.reg != 0 {
        avr.register_io_write(
            p.overflow.raised.reg,
            IoWrite::TimerPending { timer: t as u8 },
        );
    }
    for (c, cp) in p.comp.iter().enumerate() {
        let Some(cp) = cp else { continue };
        avr.register_vector(cp.interrupt)?;
        if cp.r_ocr != 0 {
            avr.register_io_write(
                cp.r_ocr,
                IoWrite::TimerOcr {
                    timer: t as u8,
                    comp: c as u8,
                },
            );
        }
        if cp.foc.reg != 0 {
            avr.register_io_write(cp.foc.reg, IoWrite::TimerFoc { timer: t as u8 });
        }
    }
    avr.register_io_write(p.r_tcnt, IoWrite::TimerTcnt { timer: t as u8 });
    avr.register_io_read(p.r_tcnt, IoRead::TimerTcnt { timer: t as u8 });

    {
        let p = &mut avr.timers[t];
        if p.as2.is_valid() {
            p.ext_flags = ExtClock::VIRT;
            p.ext_clock = 32768.0;
        }
        // Backfill mode sizes the table left implicit.
        let default_size = if p.r_tcnth != 0 { 16 } else { 8 };
        for m in p.wgm_op.iter_mut() {
            if m.size == 0 {
                m.size = default_size;
            }
        }
    }
    Ok(())
}

pub fn reset(avr: &mut Avr, t: usize) {
    cancel_all(avr, t, false);

    // Resolve compare pins to their port signals.
    for c in 0..TIMER_COMP_COUNT {
        let Some(cp) = avr.timers[t].comp[c].clone() else {
            continue;
        };
        let pin_irq = cp.com_pin.and_then(|p| port_pin_irq(avr, p));
        let cp = avr.timers[t].comp[c].as_mut().unwrap();
        cp.comp_cycles = 0;
        cp.pin_irq = pin_irq;
        cp.wave_active = false;
    }

    // Wire the input-capture pin to this timer's capture signal.
    if let Some(icp) = avr.timers[t].icp {
        if let Some(pin_irq) = port_pin_irq(avr, icp) {
            let icp_irq = IrqId(avr.timers[t].irq_base.0 + TIMER_IRQ_IN_ICP);
            avr.connect_irq(pin_irq, icp_irq);
        }
    }

    let p = &mut avr.timers[t];
    p.ext_flags
        .remove(ExtClock::STARTED | ExtClock::TN | ExtClock::AS2);
    p.down = false;
    p.bottom = false;
    p.mode = WgmMode::default();
    p.cs_div_value = 0;
    p.tov_base = 0;
    p.tov_cycles = 0;
    p.top = 0;
    p.phase_accumulator = 0.0;
}
