// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The two-layer data-space model.
//!
//! Layer one is the flat byte store: CPU registers in the low 32 bytes, the
//! I/O window, then SRAM. Layer two is a pair of transformer tables over
//! the I/O window: an address may carry at most one read transformer (the
//! value is computed on demand) and any number of write transformers
//! (several peripherals can share one flag register). An address with no
//! transformer falls through to the byte store.
//!
//! Independently of the transformers, any data-space address can grow
//! observation signals (`iomem_getirq`) that fire on writes; harnesses use
//! these to watch registers the peripherals do not own.

use std::collections::HashMap;

use crate::irq::{ioctl, IrqId};
use crate::machine::Avr;

/// Read transformers: compute the stored byte just before it is read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoRead {
    /// Derive TCNTn from the cycle counter.
    TimerTcnt { timer: u8 },
    /// Fire the PIN-read strobe (lazy external inputs).
    PortPin { port: u8 },
    /// Assemble SREG from the split flag array.
    Sreg,
}

/// Write transformers. A transformer is responsible for storing the byte
/// (or deliberately not storing it, e.g. write-one-to-clear flags).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoWrite {
    Port { port: u8, reg: PortReg },
    PcintMask { port: u8 },
    TimerControl { timer: u8 },
    TimerTcnt { timer: u8 },
    TimerOcr { timer: u8, comp: u8 },
    TimerPending { timer: u8 },
    TimerFoc { timer: u8 },
    ExtintControl,
    AdcControl { reg: AdcReg },
    AcompControl,
    EepromControl,
    WatchdogControl,
    UsiControl { reg: UsiReg },
    Sreg,
    Console,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortReg {
    Port,
    Ddr,
    Pin,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdcReg {
    Admux,
    Adcsra,
    Adcsrb,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UsiReg {
    Usicr,
    Usisr,
}

/// Per-address observation signals: bits 0..7 plus the whole byte at
/// index 8.
pub const IOMEM_IRQ_ALL: u32 = 8;

#[derive(Default)]
pub struct IoHooks {
    read: HashMap<u16, IoRead>,
    write: HashMap<u16, Vec<IoWrite>>,
    iomem: HashMap<u16, IrqId>,
}

impl IoHooks {
    pub fn read_hook(&self, addr: u16) -> Option<IoRead> {
        self.read.get(&addr).copied()
    }

    pub fn write_hooks(&self, addr: u16) -> &[IoWrite] {
        self.write.get(&addr).map_or(&[], |v| v.as_slice())
    }

    pub fn iomem_base(&self, addr: u16) -> Option<IrqId> {
        self.iomem.get(&addr).copied()
    }
}

impl Avr {
    /// Install a read transformer. At most one per address; a second
    /// registration is a chip-table bug and is ignored with a log.
    pub fn register_io_read(&mut self, addr: u16, hook: IoRead) {
        if let Some(old) = self.io.read.insert(addr, hook) {
            if old != hook {
                log::error!("duplicate read transformer at {:#04x}", addr);
            }
        }
    }

    /// Install a write transformer; duplicates collapse, distinct hooks
    /// chain in registration order.
    pub fn register_io_write(&mut self, addr: u16, hook: IoWrite) {
        let hooks = self.io.write.entry(addr).or_default();
        if !hooks.contains(&hook) {
            hooks.push(hook);
        }
    }

    /// Observation signal for a data-space address: `bit` 0..7 for one bit,
    /// `None` for the whole byte. Allocated on first use.
    pub fn iomem_getirq(&mut self, addr: u16, bit: Option<u8>) -> IrqId {
        let base = match self.io.iomem.get(&addr) {
            Some(base) => *base,
            None => {
                let key = ioctl([b'i', b'o', (addr >> 8) as u8, addr as u8]);
                let base = self.alloc_irqs(key, 9, &[]);
                self.io.iomem.insert(addr, base);
                base
            }
        };
        IrqId(base.0 + bit.map_or(IOMEM_IRQ_ALL, u32::from))
    }

    /// Raw byte store, no transformers. Used by transformers themselves
    /// and by harness code that wants to bypass side effects.
    pub fn store(&mut self, addr: u16, v: u8) {
        self.data[addr as usize] = v;
    }

    /// Harness-side watched write: applies the byte and fires the
    /// observation signals, but does not run peripheral transformers.
    pub fn core_watch_write(&mut self, addr: u16, v: u8) {
        let old = self.data[addr as usize];
        self.data[addr as usize] = v;
        self.raise_iomem(addr, old, v);
    }

    fn raise_iomem(&mut self, addr: u16, old: u8, new: u8) {
        let Some(base) = self.io.iomem_base(addr) else {
            return;
        };
        let changed = old ^ new;
        for bit in 0..8 {
            if changed & (1 << bit) != 0 {
                self.raise_irq(IrqId(base.0 + bit as u32), (new >> bit) as u32 & 1);
            }
        }
        self.raise_irq(IrqId(base.0 + IOMEM_IRQ_ALL), new as u32);
    }

    /// Data-space read as seen by firmware.
    pub fn read_data(&mut self, addr: u16) -> u8 {
        if let Some(hook) = self.io.read_hook(addr) {
            self.dispatch_io_read(hook, addr);
        }
        self.data[addr as usize]
    }

    /// Data-space write as seen by firmware.
    pub fn write_data(&mut self, addr: u16, v: u8) {
        let old = self.data[addr as usize];
        let hooks: Vec<IoWrite> = self.io.write_hooks(addr).to_vec();
        if hooks.is_empty() {
            self.data[addr as usize] = v;
        } else {
            // Transformers decide what (if anything) reaches the store.
            for hook in hooks {
                self.dispatch_io_write(hook, addr, v);
            }
        }
        let new = self.data[addr as usize];
        self.raise_iomem(addr, old, new);
    }

    fn dispatch_io_read(&mut self, hook: IoRead, addr: u16) {
        match hook {
            IoRead::TimerTcnt { timer } => crate::timer::tcnt_read(self, timer as usize, addr),
            IoRead::PortPin { port } => crate::ioport::pin_read(self, port as usize, addr),
            IoRead::Sreg => {
                let mut v = 0u8;
                for (i, f) in self.sreg.iter().enumerate() {
                    if *f != 0 {
                        v |= 1 << i;
                    }
                }
                self.data[addr as usize] = v;
            }
        }
    }

    fn dispatch_io_write(&mut self, hook: IoWrite, addr: u16, v: u8) {
        match hook {
            IoWrite::Port { port, reg } => {
                crate::ioport::reg_write(self, port as usize, reg, addr, v)
            }
            IoWrite::PcintMask { port } => {
                crate::ioport::pcint_mask_write(self, port as usize, addr, v)
            }
            IoWrite::TimerControl { timer } => {
                crate::timer::control_write(self, timer as usize, addr, v)
            }
            IoWrite::TimerTcnt { timer } => crate::timer::tcnt_write(self, timer as usize, addr, v),
            IoWrite::TimerOcr { timer, comp } => {
                crate::timer::ocr_write(self, timer as usize, comp as usize, addr, v)
            }
            IoWrite::TimerPending { timer } => {
                crate::timer::pending_write(self, timer as usize, addr, v)
            }
            IoWrite::TimerFoc { timer } => crate::timer::foc_write(self, timer as usize, addr, v),
            IoWrite::ExtintControl => crate::extint::status_change(self, addr, v),
            IoWrite::AdcControl { reg } => crate::adc::control_write(self, reg, addr, v),
            IoWrite::AcompControl => crate::acomp::acsr_write(self, addr, v),
            IoWrite::EepromControl => crate::eeprom::eecr_write(self, addr, v),
            IoWrite::WatchdogControl => crate::watchdog::control_write(self, addr, v),
            IoWrite::UsiControl { reg } => crate::usi::control_write(self, reg, addr, v),
            IoWrite::Sreg => {
                for i in 0..8 {
                    self.sreg_set(i, (v >> i) & 1);
                }
                self.data[addr as usize] = v;
            }
            IoWrite::Console => crate::machine::console_write(self, v),
        }
    }
}
