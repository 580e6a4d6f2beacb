//! The per-slot task record (spec.md §3 "Task record").
//!
//! Field grouping mirrors `nr32-rt::Task` (state, saved registers, stack ownership) generalized
//! to the fuller record the spec calls for: argv, a signal table, wait state, and accounting.

use std::fs::File;

use bitflags::bitflags;

use crate::loader::Module;

use super::signal::SignalTable;

bitflags! {
    /// "A bitmask from the set `{UNLOADED, LOADED, RUNNING, WAITING, ZOMBIE}`" (spec.md §3
    /// Invariant 2). `UNLOADED` is the empty set; exactly one of the other three is meaningful
    /// at a time while `LOADED` is set.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TaskState: u8 {
        const LOADED  = 0b0001;
        const RUNNING = 0b0010;
        const WAITING = 0b0100;
        const ZOMBIE  = 0b1000;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
}

/// What a `WAITING` task is blocked on (spec.md §4.4 "Wait states").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitState {
    None,
    /// Wake when `now_ms >= deadline_ms`.
    Time { deadline_ms: u64 },
    /// Wake when the task with this pid terminates; `None` until then.
    Pid { pid: i64 },
    /// Equivalent to `Time` in this core; messages are not yet delivered (spec.md §4.4).
    Message { deadline_ms: u64 },
}

/// The saved VM register file for a task that is not currently live (spec.md §3 "Saved
/// registers").
#[derive(Copy, Clone, Debug, Default)]
pub struct SavedRegisters {
    pub a: i64,
    pub bp: u64,
    pub sp: u64,
    pub pc: u64,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct Accounting {
    pub cycles_executed: u64,
    pub wall_time_ms: u64,
    pub trap_count: u64,
    pub nice: i32,
    pub nice_base: i32,
}

pub struct Task {
    pub id: i64,
    pub parent_id: i64,
    pub name: String,
    pub privilege: Privilege,

    pub state: TaskState,
    pub saved: SavedRegisters,
    pub entry_pc: u64,

    pub stack_base: u64,
    pub stack_len: u64,
    pub argv_base: u64,
    pub argv_len: u64,
    pub module: Option<Module>,

    pub wait: WaitState,
    pub signals: SignalTable,
    pub accounting: Accounting,

    /// Reserved, minimally used by this core (spec.md §3 "Mailbox").
    pub mailbox: Option<i64>,

    /// Set when the task becomes `ZOMBIE`; stable until the slot is reaped.
    pub exit_code: Option<i64>,

    /// Host file descriptors opened by this task through `OPEN` (spec.md §4.1 base syscalls);
    /// indices into this vector are the fds handed back to guest code. `None` marks a closed fd
    /// so the slot can be reused without shifting every later index.
    pub files: Vec<Option<File>>,
}

impl Task {
    pub fn is_runnable(&self) -> bool {
        self.state.contains(TaskState::LOADED)
            && !self.state.contains(TaskState::WAITING)
            && !self.state.contains(TaskState::ZOMBIE)
    }
}
