// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interrupt vectors: registration, pending/priority bookkeeping, and the
//! service step the CPU runs between instructions.
//!
//! Vector numbers start at one; zero is reset. The table owns every vector
//! by value and peripherals refer to theirs by number, so a duplicate
//! registration (chips share the odd vector between peripherals) is simply
//! required to agree with the first one; there is no pointer chasing at
//! raise time.

use remain::sorted;
use thiserror::Error;

use crate::machine::{Avr, CpuState, SREG_I};
use crate::regbit::RegBit;

pub const MAX_VECTORS: usize = 64;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VectorError {
    #[error("vector {0} conflicts with an earlier registration")]
    Conflict(u8),
    #[error("vector {0} out of range")]
    OutOfRange(u8),
}

/// One interrupt vector. `enable` and `raised` point at the peripheral's
/// mask and flag bits; both may be nil for purely internal vectors.
#[derive(Copy, Clone, Debug, Default)]
pub struct Vector {
    pub vector: u8,
    pub enable: RegBit,
    pub raised: RegBit,
    /// Level-triggered: not auto-cleared at service, re-fires until the
    /// source de-asserts.
    pub level: bool,
    /// Do not auto-clear `raised` in `clear_interrupt` (polled flags).
    pub raise_sticky: bool,
    /// Also clear `enable` when serviced (watchdog interrupt mode).
    pub clear_both: bool,
    pub pending: bool,
}

pub struct IntTable {
    vectors: [Option<Vector>; MAX_VECTORS],
    pub max_vector: u8,
    pub pending_count: u8,
    pub next_vector: u8,
}

impl Default for IntTable {
    fn default() -> Self {
        IntTable {
            vectors: [None; MAX_VECTORS],
            max_vector: 0,
            pending_count: 0,
            next_vector: 0,
        }
    }
}

impl IntTable {
    pub fn get(&self, vector: u8) -> Option<&Vector> {
        self.vectors.get(vector as usize).and_then(|v| v.as_ref())
    }

    fn get_mut(&mut self, vector: u8) -> Option<&mut Vector> {
        self.vectors.get_mut(vector as usize).and_then(|v| v.as_mut())
    }

    /// Claim a vector. Registering the same number again is accepted when
    /// the descriptors agree (shared vectors); disagreement is a bug in a
    /// chip table.
    pub fn register(&mut self, vector: Vector) -> Result<(), VectorError> {
        let num = vector.vector;
        if num == 0 {
            return Ok(()); // Reserved for reset; tables may leave it nil.
        }
        if num as usize >= MAX_VECTORS {
            return Err(VectorError::OutOfRange(num));
        }
        if let Some(old) = &self.vectors[num as usize] {
            if old.enable == vector.enable
                && old.raised == vector.raised
                && old.raise_sticky == vector.raise_sticky
            {
                return Ok(());
            }
            return Err(VectorError::Conflict(num));
        }
        if !vector.enable.is_valid() {
            log::warn!("vector {} has no enable bit", num);
        }
        self.vectors[num as usize] = Some(vector);
        if self.max_vector < num {
            self.max_vector = num;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.pending_count = 0;
        self.next_vector = 0;
        for v in self.vectors.iter_mut().flatten() {
            v.pending = false;
            v.level = false;
        }
    }
}

impl Avr {
    pub fn register_vector(&mut self, vector: Vector) -> Result<(), VectorError> {
        self.interrupts.register(vector)
    }

    pub fn has_pending_interrupts(&self) -> bool {
        self.interrupts.pending_count != 0
    }

    pub fn is_interrupt_pending(&self, vector: u8) -> bool {
        self.interrupts.get(vector).map_or(false, |v| v.pending)
    }

    pub fn is_interrupt_enabled(&self, vector: u8) -> bool {
        match self.interrupts.get(vector) {
            Some(v) => v.enable.get(&self.data) != 0,
            None => false,
        }
    }

    /// Mark a vector's level-triggered state (external-interrupt low-level
    /// mode). While set, servicing does not clear the pending bit.
    pub fn set_interrupt_level(&mut self, vector: u8, level: bool) {
        if let Some(v) = self.interrupts.get_mut(vector) {
            v.level = level;
        }
    }

    /// Latch an interrupt. The `raised` flag is set unconditionally so
    /// firmware can poll it; the vector only becomes pending when its
    /// enable bit reads as set. Returns true when newly pending.
    pub fn raise_interrupt(&mut self, vector: u8) -> bool {
        let Some(v) = self.interrupts.get(vector).copied() else {
            return false;
        };
        if v.raised.is_valid() {
            let raised = v.raised;
            raised.set(&mut self.data);
        }
        if v.pending {
            return false;
        }
        if v.enable.get(&self.data) == 0 {
            return false;
        }

        let table = &mut self.interrupts;
        table.get_mut(vector).unwrap().pending = true;
        let was_empty = table.pending_count == 0;
        table.pending_count += 1;
        if was_empty || vector < table.next_vector || table.next_vector == 0 {
            table.next_vector = vector;
        }

        if self.sreg[SREG_I] != 0 && self.interrupt_state == 0 {
            self.interrupt_state = -1;
        }
        if self.state == CpuState::Sleeping {
            self.state = CpuState::Running;
        }
        true
    }

    /// Drop a vector's pending status (and, unless sticky, its flag bit).
    pub fn clear_interrupt(&mut self, vector: u8) {
        let Some(v) = self.interrupts.get(vector).copied() else {
            return;
        };
        if v.raised.is_valid() && !v.raise_sticky {
            v.raised.clear(&mut self.data);
        }
        if !v.pending {
            return;
        }
        let table = &mut self.interrupts;
        table.get_mut(vector).unwrap().pending = false;
        table.pending_count -= 1;
        if table.pending_count > 0 && table.next_vector == vector {
            // Scan forward for the new highest-priority pending vector.
            let mut found = false;
            for i in vector + 1..=table.max_vector {
                if table.get(i).map_or(false, |v| v.pending) {
                    table.next_vector = i;
                    found = true;
                    break;
                }
            }
            if !found {
                log::error!("pending interrupt not found ({})", table.pending_count);
                table.pending_count = 0;
                table.next_vector = 0;
            }
        } else if table.pending_count == 0 {
            table.next_vector = 0;
            if self.interrupt_state > 0 {
                self.interrupt_state = 0;
            }
        }
    }

    /// Write-one-to-clear helper: clear the interrupt when its flag bit is
    /// currently set, otherwise restore `old` into the flag. Returns true
    /// when cleared.
    pub fn clear_interrupt_if(&mut self, vector: u8, old: u8) -> bool {
        let Some(v) = self.interrupts.get(vector).copied() else {
            return false;
        };
        if v.raised.get(&self.data) != 0 {
            self.clear_interrupt(vector);
            return true;
        }
        v.raised.set_to(&mut self.data, old);
        false
    }

    /// Run at most one pending interrupt, honoring the one-cycle latency
    /// and the single-instruction grace after SREG.I is set.
    pub(crate) fn service_interrupts(&mut self) {
        if self.interrupt_state == 0 {
            return;
        }
        if self.interrupt_state < 0 {
            self.interrupt_state += 1;
            if self.interrupt_state == 0 {
                self.interrupt_state = self.interrupts.pending_count as i8;
            }
            return;
        }
        if self.sreg[SREG_I] == 0 {
            self.interrupt_state = 0;
            return;
        }

        let next = self.interrupts.next_vector;
        if self.interrupts.pending_count == 0 || next == 0 {
            log::error!(
                "no active interrupt to service: {}/{}",
                self.interrupts.pending_count,
                next
            );
            self.interrupt_state = 0;
            return;
        }
        let v = self.interrupts.get(next).copied().unwrap();

        // The vector may have been masked or cleared since it was raised.
        if (v.enable.is_valid() && v.enable.get(&self.data) == 0)
            || (v.raised.is_valid() && v.raised.get(&self.data) == 0)
            || !v.pending
        {
            log::trace!("interrupt {} no longer serviceable", next);
        } else {
            let pushed = self.push_return_addr(self.pc);
            self.cycle += pushed;
            self.sreg_set(SREG_I, 0);
            self.pc = next as u32 * self.vector_size as u32;
        }

        if !v.level {
            self.clear_interrupt(next);
            if v.clear_both && v.enable.is_valid() {
                v.enable.clear(&mut self.data);
            }
        }
    }
}
