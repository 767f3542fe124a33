// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deferred work keyed by absolute cycle count.
//!
//! Peripherals never poll; they park a slot here and are called back at (or
//! just after, if an instruction straddles the target) the requested cycle.
//! The callback's identity is a [`CycleSlot`] value rather than a function
//! pointer, so at most one instance of a given slot can be queued and the
//! machine can dispatch with plain `&mut` access to everything.
//!
//! The list stays sorted by target; same-target entries keep insertion
//! order. Linear insertion is fine, the population is bounded by the number
//! of live peripherals.

use std::cell::RefCell;
use std::rc::Rc;

use crate::machine::Avr;

/// Suggested sleep when nothing is queued.
pub const DEFAULT_SLEEP_CYCLES: u64 = 1000;

/// Identity of a deferred callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CycleSlot {
    /// Timer reaches TOP (or overflows).
    TimerTov(u8),
    /// Compare-unit match; second field is the unit index.
    TimerComp(u8, u8),
    /// Dual-slope timer reaches BOTTOM.
    TimerBottom(u8),
    /// ADC conversion completes.
    AdcConversion,
    /// Comparator re-evaluates its inputs.
    AcompSync,
    /// EEPROM programming finishes.
    EepromReady,
    /// Watchdog counter expires.
    WatchdogTimeout,
    /// Embedder callback, by handle.
    External(u32),
}

/// External deferred callback: receives the machine and the slot's target
/// cycle, returns an offset from that target to re-arm (0 = one-shot).
pub type CycleFn = dyn FnMut(&mut Avr, u64) -> u64;

#[derive(Clone)]
pub struct ExternalCycleHook(pub Rc<RefCell<CycleFn>>);

impl ExternalCycleHook {
    pub fn new<F: FnMut(&mut Avr, u64) -> u64 + 'static>(f: F) -> Self {
        ExternalCycleHook(Rc::new(RefCell::new(f)))
    }
}

#[derive(Copy, Clone, Debug)]
struct Entry {
    when: u64,
    slot: CycleSlot,
}

#[derive(Default)]
pub struct CycleTimers {
    entries: Vec<Entry>,
}

impl CycleTimers {
    /// Queue `slot` for absolute cycle `when`. A previous entry for the
    /// same slot is moved, not duplicated.
    pub fn register(&mut self, when: u64, slot: CycleSlot) {
        self.cancel(slot);
        // Insert after any entry with an equal or earlier target so that
        // same-cycle callbacks run in registration order.
        let pos = self.entries.partition_point(|e| e.when <= when);
        self.entries.insert(pos, Entry { when, slot });
    }

    pub fn cancel(&mut self, slot: CycleSlot) {
        self.entries.retain(|e| e.slot != slot);
    }

    pub fn is_scheduled(&self, slot: CycleSlot) -> bool {
        self.entries.iter().any(|e| e.slot == slot)
    }

    /// Target cycle of a queued slot, if any.
    pub fn deadline(&self, slot: CycleSlot) -> Option<u64> {
        self.entries.iter().find(|e| e.slot == slot).map(|e| e.when)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn pop_expired(&mut self, now: u64) -> Option<Entry> {
        if self.entries.first().map_or(false, |e| e.when <= now) {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    fn next_deadline(&self) -> Option<u64> {
        self.entries.first().map(|e| e.when)
    }
}

impl Avr {
    /// Queue `slot` to fire `offset` cycles from now.
    pub fn cycle_timer_register(&mut self, offset: u64, slot: CycleSlot) {
        let when = self.cycle + offset;
        self.cycle_timers.register(when, slot);
    }

    pub fn cycle_timer_cancel(&mut self, slot: CycleSlot) {
        self.cycle_timers.cancel(slot);
    }

    /// Cycles remaining until `slot` fires, or `None` if not queued.
    pub fn cycle_timer_status(&self, slot: CycleSlot) -> Option<u64> {
        self.cycle_timers
            .deadline(slot)
            .map(|when| when.saturating_sub(self.cycle))
    }

    /// Register an embedder callback and return the slot that names it.
    pub fn cycle_timer_register_external(&mut self, offset: u64, hook: ExternalCycleHook) -> CycleSlot {
        let handle = self.external_cycle_hooks.len() as u32;
        self.external_cycle_hooks.push(Some(hook));
        let slot = CycleSlot::External(handle);
        self.cycle_timer_register(offset, slot);
        slot
    }

    /// Run every entry whose target has been reached and return the
    /// suggested sleep: cycles until the next entry, or
    /// [`DEFAULT_SLEEP_CYCLES`] when the queue is empty.
    pub fn run_cycle_timers(&mut self) -> u64 {
        while let Some(entry) = self.cycle_timers.pop_expired(self.cycle) {
            let next = self.fire_cycle_slot(entry.slot, entry.when);
            if next > 0 {
                // Periodic re-arm is relative to the nominal target, not to
                // the (possibly later) current cycle, so schedules do not
                // drift when instructions straddle a deadline.
                self.cycle_timers.register(entry.when + next, entry.slot);
            }
        }
        match self.cycle_timers.next_deadline() {
            Some(when) => when - self.cycle,
            None => DEFAULT_SLEEP_CYCLES,
        }
    }

    pub(crate) fn fire_cycle_slot(&mut self, slot: CycleSlot, when: u64) -> u64 {
        match slot {
            CycleSlot::TimerTov(t) => crate::timer::tov(self, t as usize, when),
            CycleSlot::TimerComp(t, c) => {
                crate::timer::comp_fire(self, t as usize, c as usize, when)
            }
            CycleSlot::TimerBottom(t) => crate::timer::bottom(self, t as usize, when),
            CycleSlot::AdcConversion => crate::adc::conversion_done(self, when),
            CycleSlot::AcompSync => crate::acomp::test_state(self, when),
            CycleSlot::EepromReady => crate::eeprom::write_done(self, when),
            CycleSlot::WatchdogTimeout => crate::watchdog::timeout(self, when),
            CycleSlot::External(handle) => {
                let hook = self
                    .external_cycle_hooks
                    .get(handle as usize)
                    .and_then(|h| h.clone());
                match hook {
                    Some(h) => (h.0.borrow_mut())(self, when),
                    None => 0,
                }
            }
        }
    }
}
