//! Per-task signal state and delivery (spec.md §4.6).
//!
//! Generalizes `irq::Controller`'s `{pending, enabled}` bitmask pair into the spec's richer
//! per-signal counters plus an aggregate, consulted at the same point in the context switch that
//! `irq::Controller::refresh_cpu_irq` is consulted.

use c4rt_abi::signal::{DefaultAction, Signal};

#[derive(Copy, Clone, Debug, Default)]
pub struct SignalSlot {
    pub pending: u32,
    pub blocked: bool,
    pub handler_pc: Option<u64>,
}

/// One task's full signal table: a fixed slot per [`Signal`] plus the aggregate counter
/// (spec.md §3 Invariant 4: "equals the sum of per-signal pending counters").
#[derive(Debug)]
pub struct SignalTable {
    slots: [SignalSlot; Signal::COUNT],
    aggregate: u32,
}

impl Default for SignalTable {
    fn default() -> SignalTable {
        SignalTable {
            slots: [SignalSlot::default(); Signal::COUNT],
            aggregate: 0,
        }
    }
}

impl SignalTable {
    pub fn handler_of(&self, sig: Signal) -> Option<u64> {
        self.slots[sig as usize].handler_pc
    }

    /// Install a handler, returning whatever was installed before (spec.md §6.2 `SIGNAL`).
    pub fn install(&mut self, sig: Signal, handler_pc: u64) -> Option<u64> {
        std::mem::replace(&mut self.slots[sig as usize].handler_pc, Some(handler_pc))
    }

    pub fn is_blocked(&self, sig: Signal) -> bool {
        self.slots[sig as usize].blocked
    }

    /// Bump both the per-signal and aggregate counters (spec.md §4.6 `internal_signal` step a).
    pub fn raise(&mut self, sig: Signal) {
        self.slots[sig as usize].pending += 1;
        self.aggregate += 1;
    }

    pub fn has_pending(&self) -> bool {
        self.aggregate != 0
    }

    /// Find the lowest-numbered pending signal, decrement both counters, and return it with its
    /// handler (spec.md §4.4 step 3 "locate the lowest-numbered pending signal").
    pub fn take_lowest_pending(&mut self) -> Option<(Signal, Option<u64>)> {
        for sig in Signal::ALL {
            let slot = &mut self.slots[sig as usize];
            if slot.pending > 0 {
                slot.pending -= 1;
                self.aggregate -= 1;
                return Some((sig, slot.handler_pc));
            }
        }
        None
    }
}

/// What should happen to a task that receives a signal it has no handler installed for
/// (spec.md §7 "User signals").
pub fn default_action(sig: Signal) -> DefaultAction {
    sig.default_action()
}
