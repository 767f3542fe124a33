// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The instruction interpreter.
//!
//! Executes exactly one instruction at the current PC, charging cycles to
//! the machine's counter and returning the next PC in flash words. Data
//! accesses go through the two-layer memory model so that I/O transformers
//! (and the lazy-input fault protocol) see every firmware load and store.

use crate::machine::{
    Avr, CpuState, OVERFLOW_OPCODE, SREG_C, SREG_H, SREG_I, SREG_N, SREG_S, SREG_T, SREG_V, SREG_Z,
};

const R_X: u16 = 26;
const R_Y: u16 = 28;
const R_Z: u16 = 30;

#[inline]
fn bit(v: u8, b: u8) -> u8 {
    (v >> b) & 1
}

/// True for the opcodes that occupy two flash words.
fn is_two_words(op: u16) -> bool {
    (op & 0xfe0f) == 0x9000        // LDS
        || (op & 0xfe0f) == 0x9200 // STS
        || (op & 0xfe0e) == 0x940c // JMP
        || (op & 0xfe0e) == 0x940e // CALL
}

impl Avr {
    pub(crate) fn reg(&self, r: u16) -> u8 {
        self.data[r as usize]
    }

    pub(crate) fn set_reg(&mut self, r: u16, v: u8) {
        self.data[r as usize] = v;
    }

    pub(crate) fn reg16(&self, r: u16) -> u16 {
        self.reg(r) as u16 | (self.reg(r + 1) as u16) << 8
    }

    pub(crate) fn set_reg16(&mut self, r: u16, v: u16) {
        self.set_reg(r, v as u8);
        self.set_reg(r + 1, (v >> 8) as u8);
    }
}

// Flag helpers. They write the arithmetic flags directly; only the I flag
// goes through `sreg_set`, which owns the interrupt latency bookkeeping.

fn flags_logic(avr: &mut Avr, res: u8) {
    avr.sreg[SREG_V] = 0;
    avr.sreg[SREG_N] = bit(res, 7);
    avr.sreg[SREG_Z] = (res == 0) as u8;
    avr.sreg[SREG_S] = avr.sreg[SREG_N];
}

fn flags_add(avr: &mut Avr, d: u8, r: u8, res: u8) {
    let carries = (d & r) | (r & !res) | (!res & d);
    avr.sreg[SREG_H] = bit(carries, 3);
    avr.sreg[SREG_C] = bit(carries, 7);
    avr.sreg[SREG_V] = bit((d & r & !res) | (!d & !r & res), 7);
    avr.sreg[SREG_N] = bit(res, 7);
    avr.sreg[SREG_Z] = (res == 0) as u8;
    avr.sreg[SREG_S] = avr.sreg[SREG_N] ^ avr.sreg[SREG_V];
}

fn flags_sub(avr: &mut Avr, d: u8, r: u8, res: u8, keep_z: bool) {
    let borrows = (!d & r) | (r & res) | (res & !d);
    avr.sreg[SREG_H] = bit(borrows, 3);
    avr.sreg[SREG_C] = bit(borrows, 7);
    avr.sreg[SREG_V] = bit((d & !r & !res) | (!d & r & res), 7);
    avr.sreg[SREG_N] = bit(res, 7);
    let z = (res == 0) as u8;
    avr.sreg[SREG_Z] = if keep_z { avr.sreg[SREG_Z] & z } else { z };
    avr.sreg[SREG_S] = avr.sreg[SREG_N] ^ avr.sreg[SREG_V];
}

fn flags_shift_right(avr: &mut Avr, d: u8, res: u8) {
    avr.sreg[SREG_C] = bit(d, 0);
    avr.sreg[SREG_N] = bit(res, 7);
    avr.sreg[SREG_Z] = (res == 0) as u8;
    avr.sreg[SREG_V] = avr.sreg[SREG_N] ^ avr.sreg[SREG_C];
    avr.sreg[SREG_S] = avr.sreg[SREG_N] ^ avr.sreg[SREG_V];
}

fn crash(avr: &mut Avr, pc: u32, op: u16) -> u32 {
    log::error!(
        "invalid opcode {:#06x} at pc {:#x} (cycle {})",
        op,
        pc * 2,
        avr.cycle
    );
    avr.state = CpuState::Crashed;
    pc
}

/// Skip over the next instruction; returns (words skipped, extra cycles).
fn skip_next(avr: &Avr, next_pc: u32) -> (u32, u64) {
    let next = avr.fetch_word(next_pc);
    if is_two_words(next) {
        (2, 2)
    } else {
        (1, 1)
    }
}

/// Execute the instruction at the current PC. Returns the next PC in
/// words; the caller decides whether to commit it (it is discarded when a
/// listener faulted the instruction).
pub fn run_one(avr: &mut Avr) -> u32 {
    let pc = avr.pc;
    if pc as usize >= avr.flash.len() {
        return crash(avr, pc, OVERFLOW_OPCODE);
    }
    let op = avr.fetch_word(pc);
    if op == OVERFLOW_OPCODE {
        return crash(avr, pc, op);
    }
    let mut new_pc = pc + 1;
    let mut cycles: u64 = 1;

    match op >> 12 {
        0x0 => match (op >> 8) & 0xf {
            0x0 => {
                if op != 0 {
                    return crash(avr, pc, op); // Only NOP lives here.
                }
            }
            0x1 => {
                // MOVW
                let d = ((op >> 4) & 0xf) * 2;
                let r = (op & 0xf) * 2;
                let v = avr.reg16(r);
                avr.set_reg16(d, v);
            }
            0x2 => {
                // MULS
                let d = 16 + ((op >> 4) & 0xf);
                let r = 16 + (op & 0xf);
                let res = ((avr.reg(d) as i8 as i32) * (avr.reg(r) as i8 as i32)) as u32 & 0xffff;
                avr.set_reg16(0, res as u16);
                avr.sreg[SREG_C] = ((res >> 15) & 1) as u8;
                avr.sreg[SREG_Z] = (res == 0) as u8;
                cycles = 2;
            }
            0x3 => {
                // MULSU / FMUL / FMULS / FMULSU
                let d = 16 + ((op >> 4) & 0x7);
                let r = 16 + (op & 0x7);
                let (a, b, frac) = match (bit((op >> 4) as u8, 3), bit(op as u8, 3)) {
                    (0, 0) => (avr.reg(d) as i8 as i32, avr.reg(r) as i32, false),
                    (0, 1) => (avr.reg(d) as i32, avr.reg(r) as i32, true),
                    (1, 0) => (avr.reg(d) as i8 as i32, avr.reg(r) as i8 as i32, true),
                    _ => (avr.reg(d) as i8 as i32, avr.reg(r) as i32, true),
                };
                let mut res = (a * b) as u32 & 0xffff;
                avr.sreg[SREG_C] = ((res >> 15) & 1) as u8;
                if frac {
                    res = (res << 1) & 0xffff;
                }
                avr.set_reg16(0, res as u16);
                avr.sreg[SREG_Z] = (res == 0) as u8;
                cycles = 2;
            }
            x => {
                let d = (op >> 4) & 0x1f;
                let r = (op & 0xf) | ((op >> 5) & 0x10);
                let rd = avr.reg(d);
                let rr = avr.reg(r);
                match x >> 2 {
                    0x1 => {
                        // CPC
                        let res = rd.wrapping_sub(rr).wrapping_sub(avr.sreg[SREG_C]);
                        flags_sub(avr, rd, rr, res, true);
                    }
                    0x2 => {
                        // SBC
                        let res = rd.wrapping_sub(rr).wrapping_sub(avr.sreg[SREG_C]);
                        flags_sub(avr, rd, rr, res, true);
                        avr.set_reg(d, res);
                    }
                    _ => {
                        // ADD (LSL when d == r)
                        let res = rd.wrapping_add(rr);
                        flags_add(avr, rd, rr, res);
                        avr.set_reg(d, res);
                    }
                }
            }
        },
        0x1 => {
            let d = (op >> 4) & 0x1f;
            let r = (op & 0xf) | ((op >> 5) & 0x10);
            let rd = avr.reg(d);
            let rr = avr.reg(r);
            match (op >> 10) & 0x3 {
                0x0 => {
                    // CPSE
                    if rd == rr {
                        let (words, extra) = skip_next(avr, new_pc);
                        new_pc += words;
                        cycles += extra;
                    }
                }
                0x1 => {
                    let res = rd.wrapping_sub(rr);
                    flags_sub(avr, rd, rr, res, false); // CP
                }
                0x2 => {
                    let res = rd.wrapping_sub(rr);
                    flags_sub(avr, rd, rr, res, false); // SUB
                    avr.set_reg(d, res);
                }
                _ => {
                    // ADC (ROL when d == r)
                    let res = rd.wrapping_add(rr).wrapping_add(avr.sreg[SREG_C]);
                    flags_add(avr, rd, rr, res);
                    avr.set_reg(d, res);
                }
            }
        }
        0x2 => {
            let d = (op >> 4) & 0x1f;
            let r = (op & 0xf) | ((op >> 5) & 0x10);
            let rd = avr.reg(d);
            let rr = avr.reg(r);
            match (op >> 10) & 0x3 {
                0x0 => {
                    let res = rd & rr;
                    flags_logic(avr, res);
                    avr.set_reg(d, res);
                }
                0x1 => {
                    let res = rd ^ rr;
                    flags_logic(avr, res);
                    avr.set_reg(d, res);
                }
                0x2 => {
                    let res = rd | rr;
                    flags_logic(avr, res);
                    avr.set_reg(d, res);
                }
                _ => avr.set_reg(d, rr), // MOV
            }
        }
        0x3 => {
            // CPI
            let d = 16 + ((op >> 4) & 0xf);
            let k = ((op >> 4) & 0xf0) as u8 | (op & 0xf) as u8;
            let rd = avr.reg(d);
            let res = rd.wrapping_sub(k);
            flags_sub(avr, rd, k, res, false);
        }
        0x4 | 0x5 => {
            // SBCI / SUBI
            let d = 16 + ((op >> 4) & 0xf);
            let k = ((op >> 4) & 0xf0) as u8 | (op & 0xf) as u8;
            let rd = avr.reg(d);
            let with_carry = op >> 12 == 0x4;
            let res = if with_carry {
                rd.wrapping_sub(k).wrapping_sub(avr.sreg[SREG_C])
            } else {
                rd.wrapping_sub(k)
            };
            flags_sub(avr, rd, k, res, with_carry);
            avr.set_reg(d, res);
        }
        0x6 | 0x7 => {
            // ORI / ANDI
            let d = 16 + ((op >> 4) & 0xf);
            let k = ((op >> 4) & 0xf0) as u8 | (op & 0xf) as u8;
            let res = if op >> 12 == 0x6 {
                avr.reg(d) | k
            } else {
                avr.reg(d) & k
            };
            flags_logic(avr, res);
            avr.set_reg(d, res);
        }
        0x8 | 0xa => {
            // LDD / STD through Y or Z with displacement.
            let d = (op >> 4) & 0x1f;
            let q = (op & 0x7) | ((op >> 7) & 0x18) | ((op >> 8) & 0x20);
            let base = if op & 0x8 != 0 { R_Y } else { R_Z };
            let addr = avr.reg16(base).wrapping_add(q);
            if op & 0x200 != 0 {
                let v = avr.reg(d);
                avr.write_data(addr, v);
            } else {
                let v = avr.read_data(addr);
                avr.set_reg(d, v);
            }
            cycles = 2;
        }
        0x9 => match (op >> 9) & 0x7 {
            0x0 | 0x1 => {
                // Load/store group.
                let store = op & 0x200 != 0;
                let d = (op >> 4) & 0x1f;
                match op & 0xf {
                    0x0 => {
                        // LDS / STS
                        let k = avr.fetch_word(new_pc);
                        new_pc += 1;
                        if store {
                            let v = avr.reg(d);
                            avr.write_data(k, v);
                        } else {
                            let v = avr.read_data(k);
                            avr.set_reg(d, v);
                        }
                        cycles = 2;
                    }
                    0x1 | 0x2 | 0x9 | 0xa | 0xc | 0xd | 0xe => {
                        // LD/ST through X, Y or Z with pre-dec/post-inc.
                        let base = match op & 0xc {
                            0x0 => R_Z,
                            0x8 => R_Y,
                            _ => R_X,
                        };
                        let mut ptr = avr.reg16(base);
                        if op & 0x3 == 0x2 {
                            ptr = ptr.wrapping_sub(1);
                            avr.set_reg16(base, ptr);
                        }
                        if store {
                            let v = avr.reg(d);
                            avr.write_data(ptr, v);
                        } else {
                            let v = avr.read_data(ptr);
                            avr.set_reg(d, v);
                        }
                        if op & 0x3 == 0x1 {
                            avr.set_reg16(base, ptr.wrapping_add(1));
                        }
                        cycles = 2;
                    }
                    0x4 | 0x5 | 0x6 | 0x7 if !store => {
                        // LPM/ELPM Rd, Z (and Z+); no RAMPZ on these parts.
                        let z = avr.reg16(R_Z);
                        let byte = (avr.fetch_word((z >> 1) as u32) >> ((z & 1) * 8)) as u8;
                        avr.set_reg(d, byte);
                        if op & 0x1 != 0 {
                            avr.set_reg16(R_Z, z.wrapping_add(1));
                        }
                        cycles = 3;
                    }
                    0xf => {
                        // PUSH / POP
                        if store {
                            let v = avr.reg(d);
                            avr.push8(v);
                        } else {
                            let v = avr.pop8();
                            avr.set_reg(d, v);
                        }
                        cycles = 2;
                    }
                    _ => return crash(avr, pc, op),
                }
            }
            0x2 => {
                // One-operand ALU, zero-operand column, JMP/CALL.
                let d = (op >> 4) & 0x1f;
                match op & 0xf {
                    0x0 => {
                        // COM
                        let res = !avr.reg(d);
                        flags_logic(avr, res);
                        avr.sreg[SREG_C] = 1;
                        avr.set_reg(d, res);
                    }
                    0x1 => {
                        // NEG
                        let rd = avr.reg(d);
                        let res = 0u8.wrapping_sub(rd);
                        avr.sreg[SREG_H] = bit(res | rd, 3);
                        avr.sreg[SREG_C] = (res != 0) as u8;
                        avr.sreg[SREG_V] = (res == 0x80) as u8;
                        avr.sreg[SREG_N] = bit(res, 7);
                        avr.sreg[SREG_Z] = (res == 0) as u8;
                        avr.sreg[SREG_S] = avr.sreg[SREG_N] ^ avr.sreg[SREG_V];
                        avr.set_reg(d, res);
                    }
                    0x2 => {
                        // SWAP
                        let rd = avr.reg(d);
                        avr.set_reg(d, rd << 4 | rd >> 4);
                    }
                    0x3 => {
                        // INC
                        let res = avr.reg(d).wrapping_add(1);
                        avr.sreg[SREG_V] = (res == 0x80) as u8;
                        avr.sreg[SREG_N] = bit(res, 7);
                        avr.sreg[SREG_Z] = (res == 0) as u8;
                        avr.sreg[SREG_S] = avr.sreg[SREG_N] ^ avr.sreg[SREG_V];
                        avr.set_reg(d, res);
                    }
                    0x5 => {
                        // ASR
                        let rd = avr.reg(d);
                        let res = (rd >> 1) | (rd & 0x80);
                        flags_shift_right(avr, rd, res);
                        avr.set_reg(d, res);
                    }
                    0x6 => {
                        // LSR
                        let rd = avr.reg(d);
                        let res = rd >> 1;
                        flags_shift_right(avr, rd, res);
                        avr.set_reg(d, res);
                    }
                    0x7 => {
                        // ROR
                        let rd = avr.reg(d);
                        let res = (rd >> 1) | (avr.sreg[SREG_C] << 7);
                        flags_shift_right(avr, rd, res);
                        avr.set_reg(d, res);
                    }
                    0x8 if op & 0x100 == 0 => {
                        // BSET / BCLR
                        let s = ((op >> 4) & 0x7) as usize;
                        let v = (op & 0x80 == 0) as u8;
                        avr.sreg_set(s, v);
                    }
                    0x8 => match (op >> 4) & 0xf {
                        0x0 | 0x1 => {
                            // RET / RETI
                            if avr.sp_get() as u32 + avr.address_size as u32 > avr.ramend as u32 {
                                log::error!("stack underflow at pc {:#x}", pc * 2);
                                avr.state = CpuState::Crashed;
                                return pc;
                            }
                            new_pc = avr.pop_return_addr();
                            cycles = 2 + avr.address_size as u64;
                            if op & 0x10 != 0 {
                                // RETI: interrupts back on with the
                                // single-instruction grace before service.
                                avr.sreg_set(SREG_I, 1);
                            }
                        }
                        0x8 => avr.state = CpuState::Sleeping,
                        0x9 => {
                            // BREAK with no debugger attached.
                            log::warn!("BREAK at pc {:#x}", pc * 2);
                            avr.state = CpuState::Stopped;
                        }
                        0xa => crate::watchdog::wdr(avr),
                        0xc | 0xd => {
                            // LPM / ELPM into r0
                            let z = avr.reg16(R_Z);
                            let byte = (avr.fetch_word((z >> 1) as u32) >> ((z & 1) * 8)) as u8;
                            avr.set_reg(0, byte);
                            cycles = 3;
                        }
                        0xe => log::trace!("SPM ignored at pc {:#x}", pc * 2),
                        _ => return crash(avr, pc, op),
                    },
                    0x9 => {
                        // IJMP / ICALL (no EIND on these parts)
                        if op & 0x100 != 0 {
                            cycles = 1 + avr.push_return_addr(new_pc);
                        } else {
                            cycles = 2;
                        }
                        new_pc = avr.reg16(R_Z) as u32;
                    }
                    0xa => {
                        // DEC
                        let res = avr.reg(d).wrapping_sub(1);
                        avr.sreg[SREG_V] = (res == 0x7f) as u8;
                        avr.sreg[SREG_N] = bit(res, 7);
                        avr.sreg[SREG_Z] = (res == 0) as u8;
                        avr.sreg[SREG_S] = avr.sreg[SREG_N] ^ avr.sreg[SREG_V];
                        avr.set_reg(d, res);
                    }
                    0xc | 0xd => {
                        // JMP
                        let k = (((op as u32 & 0x1f0) >> 3) | (op as u32 & 1)) << 16;
                        new_pc = k | avr.fetch_word(pc + 1) as u32;
                        cycles = 3;
                    }
                    0xe | 0xf => {
                        // CALL
                        let k = (((op as u32 & 0x1f0) >> 3) | (op as u32 & 1)) << 16;
                        let target = k | avr.fetch_word(pc + 1) as u32;
                        cycles = 2 + avr.push_return_addr(pc + 2);
                        new_pc = target;
                    }
                    _ => return crash(avr, pc, op),
                }
            }
            0x3 => {
                // ADIW / SBIW
                let d = 24 + ((op >> 3) & 0x6);
                let k = ((op & 0xf) | ((op >> 2) & 0x30)) as u16;
                let rd = avr.reg16(d);
                let res = if op & 0x100 == 0 {
                    rd.wrapping_add(k)
                } else {
                    rd.wrapping_sub(k)
                };
                avr.set_reg16(d, res);
                let rdh7 = bit((rd >> 8) as u8, 7);
                let res15 = bit((res >> 8) as u8, 7);
                if op & 0x100 == 0 {
                    avr.sreg[SREG_V] = (rdh7 == 0 && res15 == 1) as u8;
                    avr.sreg[SREG_C] = (res15 == 0 && rdh7 == 1) as u8;
                } else {
                    avr.sreg[SREG_V] = (rdh7 == 1 && res15 == 0) as u8;
                    avr.sreg[SREG_C] = (res15 == 1 && rdh7 == 0) as u8;
                }
                avr.sreg[SREG_N] = res15;
                avr.sreg[SREG_Z] = (res == 0) as u8;
                avr.sreg[SREG_S] = avr.sreg[SREG_N] ^ avr.sreg[SREG_V];
                cycles = 2;
            }
            0x4 | 0x5 => {
                // CBI / SBIC / SBI / SBIS
                let addr = 32 + ((op >> 3) & 0x1f);
                let b = (op & 0x7) as u8;
                match (op >> 8) & 0x3 {
                    0x0 => {
                        let v = avr.read_data(addr);
                        avr.write_data(addr, v & !(1 << b));
                        cycles = 2;
                    }
                    0x1 => {
                        if bit(avr.read_data(addr), b) == 0 {
                            let (words, extra) = skip_next(avr, new_pc);
                            new_pc += words;
                            cycles += extra;
                        }
                    }
                    0x2 => {
                        let v = avr.read_data(addr);
                        avr.write_data(addr, v | 1 << b);
                        cycles = 2;
                    }
                    _ => {
                        if bit(avr.read_data(addr), b) != 0 {
                            let (words, extra) = skip_next(avr, new_pc);
                            new_pc += words;
                            cycles += extra;
                        }
                    }
                }
            }
            _ => {
                // MUL
                let d = (op >> 4) & 0x1f;
                let r = (op & 0xf) | ((op >> 5) & 0x10);
                let res = avr.reg(d) as u16 * avr.reg(r) as u16;
                avr.set_reg16(0, res);
                avr.sreg[SREG_C] = (res >> 15) as u8;
                avr.sreg[SREG_Z] = (res == 0) as u8;
                cycles = 2;
            }
        },
        0xb => {
            // IN / OUT
            let d = (op >> 4) & 0x1f;
            let addr = 32 + ((op & 0xf) | ((op >> 5) & 0x30));
            if op & 0x800 != 0 {
                let v = avr.reg(d);
                avr.write_data(addr, v);
            } else {
                let v = avr.read_data(addr);
                avr.set_reg(d, v);
            }
        }
        0xc | 0xd => {
            // RJMP / RCALL
            let k = (((op & 0xfff) << 4) as i16) >> 4;
            if op & 0x1000 != 0 {
                cycles = 1 + avr.push_return_addr(new_pc);
            } else {
                cycles = 2;
            }
            new_pc = (new_pc as i32 + k as i32) as u32;
        }
        0xe => {
            // LDI
            let d = 16 + ((op >> 4) & 0xf);
            let k = ((op >> 4) & 0xf0) as u8 | (op & 0xf) as u8;
            avr.set_reg(d, k);
        }
        _ => match (op >> 9) & 0x7 {
            0x0 | 0x1 | 0x2 | 0x3 => {
                // BRBS / BRBC
                let s = (op & 0x7) as usize;
                let k = ((((op >> 3) & 0x7f) << 1) as u8 as i8) >> 1;
                let taken = if op & 0x400 == 0 {
                    avr.sreg[s] != 0
                } else {
                    avr.sreg[s] == 0
                };
                if taken {
                    new_pc = (new_pc as i32 + k as i32) as u32;
                    cycles = 2;
                }
            }
            0x4 => {
                // BLD
                let b = (op & 0x7) as u8;
                let d = (op >> 4) & 0x1f;
                let v = (avr.reg(d) & !(1 << b)) | avr.sreg[SREG_T] << b;
                avr.set_reg(d, v);
            }
            0x5 => {
                // BST
                let b = (op & 0x7) as u8;
                let d = (op >> 4) & 0x1f;
                avr.sreg[SREG_T] = bit(avr.reg(d), b);
            }
            _ => {
                // SBRC / SBRS
                let b = (op & 0x7) as u8;
                let d = (op >> 4) & 0x1f;
                let set = bit(avr.reg(d), b) != 0;
                let skip_when_set = op & 0x200 != 0;
                if set == skip_when_set {
                    let (words, extra) = skip_next(avr, new_pc);
                    new_pc += words;
                    cycles += extra;
                }
            }
        },
    }

    avr.cycle += cycles;
    new_pc
}
