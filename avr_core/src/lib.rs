// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cycle-accurate simulation engine for 8-bit AVR microcontrollers.
//!
//! The engine executes AVR machine instructions and models the on-chip
//! peripherals closely enough that firmware observes the same register,
//! interrupt and timing behavior it would on silicon. Embedding code
//! (harnesses, panels, tracers) interacts exclusively through named
//! signals; see [`irq`].

pub mod acomp;
pub mod adc;
pub mod cycle_timers;
pub mod eeprom;
pub mod exec;
pub mod extint;
pub mod interrupts;
pub mod ioport;
pub mod irq;
pub mod machine;
pub mod memory;
pub mod regbit;
pub mod timer;
pub mod usi;
pub mod watchdog;

pub use crate::cycle_timers::{CycleSlot, ExternalCycleHook, DEFAULT_SLEEP_CYCLES};
pub use crate::interrupts::{Vector, VectorError, MAX_VECTORS};
pub use crate::irq::{ioctl, ioctl_instance, DeviceSink, ExternalHook, IrqFlags, IrqId, IrqSink};
pub use crate::machine::{
    Avr, Chip, ConfigError, CpuState, SREG_C, SREG_H, SREG_I, SREG_N, SREG_S, SREG_T, SREG_V,
    SREG_Z,
};
pub use crate::regbit::{regbit, regbits, RegBit};
