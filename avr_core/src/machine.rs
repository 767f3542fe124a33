// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Machine state and the instruction-driven run loop.
//!
//! One [`Avr`] value owns everything: flash, the data space, the split
//! status register, the signal arena, the cycle-timer queue, the interrupt
//! table, and every peripheral by value. All simulation work happens on the
//! calling thread through `&mut Avr`; there is exactly one writer of any
//! piece of state at a time.

use std::collections::HashMap;

use remain::sorted;
use thiserror::Error;

use crate::acomp::Acomp;
use crate::adc::Adc;
use crate::cycle_timers::{CycleTimers, ExternalCycleHook};
use crate::eeprom::Eeprom;
use crate::extint::Extint;
use crate::interrupts::{IntTable, VectorError};
use crate::ioport::Ioport;
use crate::irq::{ioctl, DeviceSink, ExternalHook, IrqFlags, IrqId, IrqPool, IrqSink};
use crate::memory::{IoHooks, IoWrite};
use crate::timer::Timer;
use crate::usi::Usi;
use crate::watchdog::Watchdog;

// SREG flag indices; the register is kept split for cheap arithmetic.
pub const SREG_C: usize = 0;
pub const SREG_Z: usize = 1;
pub const SREG_N: usize = 2;
pub const SREG_V: usize = 3;
pub const SREG_S: usize = 4;
pub const SREG_H: usize = 5;
pub const SREG_T: usize = 6;
pub const SREG_I: usize = 7;

/// Opcode parked past the end of flash to catch PC overflows.
pub const OVERFLOW_OPCODE: u16 = 0xf1f1;

/// Control key of the machine-level supply signals (VCC, AVCC, AREF).
pub const SUPPLY_IOCTL: u32 = ioctl(*b"avr ");
pub const SUPPLY_IRQ_VCC: u32 = 0;
pub const SUPPLY_IRQ_AVCC: u32 = 1;
pub const SUPPLY_IRQ_AREF: u32 = 2;
pub const SUPPLY_IRQ_COUNT: u32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuState {
    /// Allocated but not yet initialized.
    Limbo,
    Running,
    Sleeping,
    /// Externally halted; resumable.
    Stopped,
    /// Execute exactly one instruction, then report StepDone.
    Step,
    StepDone,
    /// A signal listener asked for the current instruction to be retried
    /// (lazy external inputs). Resumable via [`Avr::resume`].
    Fault,
    /// Firmware did something fatal (illegal opcode, bad PC).
    Crashed,
    /// Graceful end: SLEEP with interrupts disabled. Do not re-enter.
    Done,
}

#[sorted]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("firmware of {size} bytes does not fit in {flash} bytes of flash")]
    CodeTooBig { size: usize, flash: usize },
    #[error("frequency must be a whole number of MHz")]
    Frequency,
    #[error(transparent)]
    Vector(#[from] VectorError),
}

/// Everything a chip definition table supplies. Peripheral structs are
/// plain data here; [`Avr::new`] wires them up.
pub struct Chip {
    pub mmcu: &'static str,
    /// Byte address of the last flash byte.
    pub flashend: u32,
    pub ramend: u16,
    /// Last address of the I/O window (inclusive).
    pub ioend: u16,
    pub e2end: u16,
    /// Words of flash per interrupt vector slot (1 or 2).
    pub vector_size: u8,
    pub addr_sreg: u16,
    pub addr_spl: u16,
    pub addr_sph: u16,
    pub ports: Vec<Ioport>,
    pub timers: Vec<Timer>,
    pub extint: Option<Extint>,
    pub adc: Option<Adc>,
    pub acomp: Option<Acomp>,
    pub eeprom: Option<Eeprom>,
    pub watchdog: Option<Watchdog>,
    pub usi: Option<Usi>,
}

pub struct Avr {
    pub mmcu: &'static str,
    /// CPU clock in Hz; always a whole number of MHz so cycle/microsecond
    /// conversions divide exactly.
    pub frequency: u32,
    pub flashend: u32,
    pub ramend: u16,
    pub ioend: u16,
    pub e2end: u16,
    pub vector_size: u8,
    /// Bytes pushed for a return address (3 on extended-flash parts).
    pub address_size: u8,
    pub addr_sreg: u16,
    pub addr_spl: u16,
    pub addr_sph: u16,

    /// Flash, word addressed; one trap word appended past the end.
    pub flash: Vec<u16>,
    /// Last loaded code byte (exclusive), for PC sanity checks.
    pub codeend: u32,
    pub data: Vec<u8>,
    pub sreg: [u8; 8],
    /// Program counter in flash words.
    pub pc: u32,
    pub reset_pc: u32,
    pub cycle: u64,
    pub state: CpuState,
    pub saved_state: CpuState,
    /// Negative: servicing latency countdown. Zero: idle. Positive:
    /// pending interrupts at the time the latency elapsed.
    pub interrupt_state: i8,

    pub pool: IrqPool,
    keymap: HashMap<u32, (IrqId, u32)>,
    pub(crate) external_hooks: Vec<Option<ExternalHook>>,
    pub(crate) external_cycle_hooks: Vec<Option<ExternalCycleHook>>,
    pub cycle_timers: CycleTimers,
    pub interrupts: IntTable,
    pub io: IoHooks,

    pub ports: Vec<Ioport>,
    pub timers: Vec<Timer>,
    pub extint: Option<Extint>,
    pub adc: Option<Adc>,
    pub acomp: Option<Acomp>,
    pub eeprom: Option<Eeprom>,
    pub watchdog: Option<Watchdog>,
    pub usi: Option<Usi>,

    /// Weak pull-ups participate in input resolution.
    pub pullups_enabled: bool,
    /// Supply levels in millivolts.
    pub vcc: u32,
    pub avcc: u32,
    pub aref: u32,
    supply_irq: IrqId,

    console_addr: Option<u16>,
    console: Vec<u8>,
    console_line: Vec<u8>,
}

impl Avr {
    pub fn new(chip: Chip, frequency_mhz: u32) -> Result<Avr, ConfigError> {
        if frequency_mhz == 0 {
            return Err(ConfigError::Frequency);
        }
        let flash_words = (chip.flashend as usize + 1) / 2;
        let mut flash = vec![0xffffu16; flash_words + 1];
        flash[flash_words] = OVERFLOW_OPCODE;

        let mut avr = Avr {
            mmcu: chip.mmcu,
            frequency: frequency_mhz * 1_000_000,
            flashend: chip.flashend,
            ramend: chip.ramend,
            ioend: chip.ioend,
            e2end: chip.e2end,
            vector_size: chip.vector_size,
            address_size: 2,
            addr_sreg: chip.addr_sreg,
            addr_spl: chip.addr_spl,
            addr_sph: chip.addr_sph,
            flash,
            codeend: chip.flashend + 1,
            data: vec![0u8; chip.ramend as usize + 1],
            sreg: [0; 8],
            pc: 0,
            reset_pc: 0,
            cycle: 0,
            state: CpuState::Limbo,
            saved_state: CpuState::Limbo,
            interrupt_state: 0,
            pool: IrqPool::default(),
            keymap: HashMap::new(),
            external_hooks: Vec::new(),
            external_cycle_hooks: Vec::new(),
            cycle_timers: CycleTimers::default(),
            interrupts: IntTable::default(),
            io: IoHooks::default(),
            ports: chip.ports,
            timers: chip.timers,
            extint: chip.extint,
            adc: chip.adc,
            acomp: chip.acomp,
            eeprom: chip.eeprom,
            watchdog: chip.watchdog,
            usi: chip.usi,
            pullups_enabled: true,
            vcc: 5000,
            avcc: 5000,
            aref: 5000,
            supply_irq: IrqId(0),
            console_addr: None,
            console: Vec::new(),
            console_line: Vec::new(),
        };

        avr.supply_irq = avr.alloc_irqs(
            SUPPLY_IOCTL,
            SUPPLY_IRQ_COUNT,
            &[Some("32<vcc"), Some("32<avcc"), Some("32<aref")],
        );
        for i in 0..SUPPLY_IRQ_COUNT {
            let id = IrqId(avr.supply_irq.0 + i);
            avr.pool.set_flags(id, IrqFlags::FILTERED);
            avr.pool
                .listen(id, IrqSink::Device(DeviceSink::Supply { index: i as u8 }));
        }

        // SREG is memory mapped; keep the split array authoritative.
        avr.register_io_read(chip.addr_sreg, crate::memory::IoRead::Sreg);
        avr.register_io_write(chip.addr_sreg, IoWrite::Sreg);

        for i in 0..avr.ports.len() {
            crate::ioport::init(&mut avr, i)?;
        }
        for i in 0..avr.timers.len() {
            crate::timer::init(&mut avr, i)?;
        }
        if avr.extint.is_some() {
            crate::extint::init(&mut avr)?;
        }
        if avr.adc.is_some() {
            crate::adc::init(&mut avr)?;
        }
        if avr.acomp.is_some() {
            crate::acomp::init(&mut avr)?;
        }
        if avr.eeprom.is_some() {
            crate::eeprom::init(&mut avr)?;
        }
        if avr.watchdog.is_some() {
            crate::watchdog::init(&mut avr)?;
        }
        if avr.usi.is_some() {
            crate::usi::init(&mut avr)?;
        }

        avr.reset();
        log::trace!(
            "{}: flashend {:#x} ramend {:#x} e2end {:#x}",
            avr.mmcu,
            avr.flashend,
            avr.ramend,
            avr.e2end
        );
        Ok(avr)
    }

    /// Load raw code bytes at a flash byte address.
    pub fn load_code(&mut self, code: &[u8], address: u32) -> Result<(), ConfigError> {
        if address as usize + code.len() > self.flashend as usize + 1 {
            return Err(ConfigError::CodeTooBig {
                size: code.len(),
                flash: self.flashend as usize + 1,
            });
        }
        for (i, b) in code.iter().enumerate() {
            let byte_addr = address as usize + i;
            let word = &mut self.flash[byte_addr / 2];
            if byte_addr % 2 == 0 {
                *word = (*word & 0xff00) | *b as u16;
            } else {
                *word = (*word & 0x00ff) | ((*b as u16) << 8);
            }
        }
        self.codeend = self.codeend.max(address + code.len() as u32);
        Ok(())
    }

    /// Load code expressed as instruction words (test harness convenience).
    pub fn load_words(&mut self, words: &[u16], word_address: u32) -> Result<(), ConfigError> {
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        self.load_code(&bytes, word_address * 2)
    }

    /// Hardware reset: registers, interrupts and scheduled work are
    /// cleared; signals persist.
    pub fn reset(&mut self) {
        log::trace!("{} reset", self.mmcu);
        self.state = CpuState::Running;
        for i in 0x20..=self.ioend as usize {
            self.data[i] = 0;
        }
        self.sp_set(self.ramend);
        self.pc = self.reset_pc;
        self.sreg = [0; 8];
        self.interrupt_state = 0;
        self.interrupts.reset();
        self.cycle_timers.clear();
        for i in 0..self.ports.len() {
            crate::ioport::reset(self, i);
        }
        for i in 0..self.timers.len() {
            crate::timer::reset(self, i);
        }
        if self.extint.is_some() {
            crate::extint::reset(self);
        }
        if self.adc.is_some() {
            crate::adc::reset(self);
        }
        if self.acomp.is_some() {
            crate::acomp::reset(self);
        }
        if self.eeprom.is_some() {
            crate::eeprom::reset(self);
        }
        if self.watchdog.is_some() {
            crate::watchdog::reset(self);
        }
        if self.usi.is_some() {
            crate::usi::reset(self);
        }
        self.cycle = 0;
    }

    // ---- SREG and stack -------------------------------------------------

    /// Set one SREG flag. Toggling the interrupt enable drives the
    /// service latency state machine.
    pub fn sreg_set(&mut self, flag: usize, value: u8) {
        if flag == SREG_I {
            if value != 0 {
                if self.sreg[SREG_I] == 0 {
                    self.interrupt_state = -1;
                }
            } else {
                self.interrupt_state = 0;
            }
        }
        self.sreg[flag] = value;
    }

    pub fn sreg_byte(&self) -> u8 {
        let mut v = 0;
        for (i, f) in self.sreg.iter().enumerate() {
            if *f != 0 {
                v |= 1 << i;
            }
        }
        v
    }

    pub fn sp_get(&self) -> u16 {
        let lo = self.data[self.addr_spl as usize] as u16;
        let hi = if self.addr_sph != 0 {
            self.data[self.addr_sph as usize] as u16
        } else {
            0
        };
        lo | hi << 8
    }

    pub fn sp_set(&mut self, sp: u16) {
        self.data[self.addr_spl as usize] = sp as u8;
        if self.addr_sph != 0 {
            self.data[self.addr_sph as usize] = (sp >> 8) as u8;
        }
    }

    pub fn push8(&mut self, v: u8) {
        let sp = self.sp_get();
        // A wild SP wraps into the data space rather than escaping it,
        // matching how badly it ends on hardware.
        let len = self.data.len();
        self.data[sp as usize % len] = v;
        self.sp_set(sp.wrapping_sub(1));
    }

    pub fn pop8(&mut self) -> u8 {
        let sp = self.sp_get().wrapping_add(1);
        self.sp_set(sp);
        self.data[sp as usize % self.data.len()]
    }

    /// Push a return address (word units); returns cycles consumed.
    pub fn push_return_addr(&mut self, addr: u32) -> u64 {
        self.push8(addr as u8);
        self.push8((addr >> 8) as u8);
        if self.address_size > 2 {
            self.push8((addr >> 16) as u8);
        }
        self.address_size as u64
    }

    pub fn pop_return_addr(&mut self) -> u32 {
        let mut addr = 0u32;
        if self.address_size > 2 {
            addr = (self.pop8() as u32) << 16;
        }
        addr |= (self.pop8() as u32) << 8;
        addr |= self.pop8() as u32;
        addr
    }

    /// Fetch the instruction word at a word address.
    pub fn fetch_word(&self, pc: u32) -> u16 {
        match self.flash.get(pc as usize) {
            Some(w) => *w,
            None => OVERFLOW_OPCODE,
        }
    }

    // ---- Signals --------------------------------------------------------

    /// Allocate a pool of signals discoverable under a control key.
    pub fn alloc_irqs(&mut self, key: u32, count: u32, names: &[Option<&str>]) -> IrqId {
        let base = self.pool.alloc(count, names);
        self.keymap.insert(key, (base, count));
        base
    }

    /// The only discovery path for external code.
    pub fn io_getirq(&mut self, key: u32, index: u32) -> Option<IrqId> {
        let (base, count) = *self.keymap.get(&key)?;
        if index >= count {
            return None;
        }
        Some(IrqId(base.0 + index))
    }

    /// Propagate `value` to every listener. Filtered signals skip delivery
    /// when the value is unchanged (unless strobing). The stored value is
    /// replaced only after dispatch, so listeners can read the previous
    /// value from the pool.
    pub fn raise_irq(&mut self, id: IrqId, value: u32) {
        let irq = self.pool.get(id);
        let flags = irq.flags;
        if flags.contains(IrqFlags::FILTERED)
            && !flags.contains(IrqFlags::STROBE)
            && irq.value == value
        {
            return;
        }
        let mut i = 0;
        loop {
            let sink = match self.pool.get(id).listeners.get(i) {
                Some(s) => *s,
                None => break,
            };
            self.deliver(sink, id, value);
            i += 1;
        }
        self.pool.get_mut(id).value = value;
    }

    /// Register an embedder callback on a signal; returns an unregister
    /// handle.
    pub fn irq_register_notify(&mut self, id: IrqId, hook: ExternalHook) -> u32 {
        let handle = self.external_hooks.len() as u32;
        self.external_hooks.push(Some(hook));
        self.pool.listen(id, IrqSink::External(handle));
        handle
    }

    pub fn irq_unregister_notify(&mut self, id: IrqId, handle: u32) {
        self.pool.unlisten(id, IrqSink::External(handle));
        if let Some(h) = self.external_hooks.get_mut(handle as usize) {
            *h = None;
        }
    }

    /// Forward raises of `src` to `dst`.
    pub fn connect_irq(&mut self, src: IrqId, dst: IrqId) {
        self.pool.listen(src, IrqSink::Chain(dst));
    }

    pub fn unconnect_irq(&mut self, src: IrqId, dst: IrqId) {
        self.pool.unlisten(src, IrqSink::Chain(dst));
    }

    fn deliver(&mut self, sink: IrqSink, src: IrqId, value: u32) {
        match sink {
            IrqSink::Chain(dst) => self.raise_irq(dst, value),
            IrqSink::External(handle) => {
                let hook = self
                    .external_hooks
                    .get(handle as usize)
                    .and_then(|h| h.clone());
                if let Some(hook) = hook {
                    (hook.0.borrow_mut())(self, src, value);
                }
            }
            IrqSink::Device(d) => self.deliver_device(d, src, value),
        }
    }

    fn deliver_device(&mut self, sink: DeviceSink, src: IrqId, value: u32) {
        match sink {
            DeviceSink::PortPin { port, bit } => {
                crate::ioport::pin_input(self, port as usize, bit, value)
            }
            DeviceSink::ExtintPin { index } => {
                crate::extint::pin_change(self, index as usize, src, value)
            }
            DeviceSink::TimerIcp { timer } => {
                crate::timer::icp_change(self, timer as usize, src, value)
            }
            DeviceSink::TimerExtClock { timer } => {
                crate::timer::ext_clock_edge(self, timer as usize, src, value)
            }
            DeviceSink::AcompIn { index } => crate::acomp::input_change(self, index as usize, value),
            DeviceSink::AdcChannel { index } => {
                crate::adc::channel_change(self, index as usize, value)
            }
            DeviceSink::Supply { index } => match index as u32 {
                SUPPLY_IRQ_VCC => self.vcc = value,
                SUPPLY_IRQ_AVCC => self.avcc = value,
                _ => self.aref = value,
            },
            DeviceSink::UsiDataIn => crate::usi::di_change(self, value),
        }
    }

    // ---- Run loop -------------------------------------------------------

    /// Lazy-input protocol: called from inside a signal listener during
    /// instruction execution. The run loop returns `Fault` with the PC and
    /// cycle counter rewound; after the embedder adjusts inputs and calls
    /// [`Avr::resume`], the same instruction is re-executed.
    pub fn fault_current(&mut self) {
        self.saved_state = self.state;
        self.state = CpuState::Fault;
    }

    /// Leave the Fault state, restoring the state saved by
    /// [`Avr::fault_current`].
    pub fn resume(&mut self) {
        if self.state == CpuState::Fault {
            self.state = self.saved_state;
        }
    }

    /// One pass of the fetch-execute-service loop. Returns the CPU state;
    /// callers drive this until it stops being `Running`/`Sleeping`.
    pub fn step(&mut self) -> CpuState {
        let pc0 = self.pc;
        let cycle0 = self.cycle;
        let mut new_pc = self.pc;

        let stepping = self.state == CpuState::Step;
        if stepping {
            self.state = CpuState::Running;
        }
        if self.state == CpuState::Running {
            new_pc = crate::exec::run_one(self);
        }
        if self.state == CpuState::Fault {
            // The instruction will be retried; nothing it did to the
            // timebase may stick, or the retry would be observable.
            self.pc = pc0;
            self.cycle = cycle0;
            return CpuState::Fault;
        }

        let sleep = self.run_cycle_timers();
        self.pc = new_pc;

        if self.state == CpuState::Sleeping {
            if self.sreg[SREG_I] == 0 {
                log::trace!("sleeping with interrupts off, quitting gracefully");
                self.state = CpuState::Done;
                return self.state;
            }
            // Fast-forward to the next scheduled event in one step.
            self.cycle += 1 + sleep;
        }
        if self.state == CpuState::Running || self.state == CpuState::Sleeping {
            if self.interrupt_state != 0 {
                self.service_interrupts();
            }
        }
        if stepping && self.state == CpuState::Running {
            self.state = CpuState::StepDone;
        }
        self.state
    }

    /// Drive [`Avr::step`] until the machine is no longer runnable.
    pub fn run(&mut self) -> CpuState {
        loop {
            match self.step() {
                CpuState::Running | CpuState::Sleeping => {}
                state => return state,
            }
        }
    }

    /// Run for at most `limit` more cycles (handy for harnesses).
    pub fn run_for(&mut self, limit: u64) -> CpuState {
        let deadline = self.cycle + limit;
        while self.cycle < deadline {
            match self.step() {
                CpuState::Running | CpuState::Sleeping | CpuState::StepDone => {}
                state => return state,
            }
        }
        self.state
    }

    // ---- Console --------------------------------------------------------

    /// Route writes of `addr` to the byte console (how test firmware
    /// reports without a UART model).
    pub fn set_console_register(&mut self, addr: u16) {
        if self.console_addr == Some(addr) {
            return;
        }
        self.console_addr = Some(addr);
        self.register_io_write(addr, IoWrite::Console);
    }

    pub fn console_output(&self) -> &[u8] {
        &self.console
    }

    pub fn console_take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.console)
    }

    pub fn cycles_to_usec(&self, cycles: u64) -> u64 {
        cycles / (self.frequency as u64 / 1_000_000)
    }

    pub fn usec_to_cycles(&self, usec: u64) -> u64 {
        usec * (self.frequency as u64 / 1_000_000)
    }
}

pub(crate) fn console_write(avr: &mut Avr, v: u8) {
    avr.console.push(v);
    if v == b'\r' || v == b'\n' {
        if !avr.console_line.is_empty() {
            log::info!("O: {}", String::from_utf8_lossy(&avr.console_line));
            avr.console_line.clear();
        }
    } else {
        avr.console_line.push(v);
    }
}
