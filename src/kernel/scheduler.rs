//! Task selection with the nice-counter fairness rule (spec.md §4.4 "Scheduler fairness").
//!
//! Structurally grounded on `nr32-rt::scheduler::Scheduler::schedule`: a full round-robin scan
//! from a saved cursor, an outgoing/incoming save-and-load, a fallback when nothing is runnable —
//! adapted from priority comparison to the spec's nice-counter decrement rule.

use super::task::{Task, TaskState, WaitState};

#[derive(Default)]
pub struct Scheduler {
    cursor: usize,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler { cursor: 0 }
    }

    /// Wake every task whose timed wait has elapsed (spec.md §4.4 "TIME: the scan wakes the task
    /// when `now >= deadline`"; `MESSAGE` is "equivalent to `TIME` in this core").
    pub fn wake_timed_out(tasks: &mut [Option<Task>], now_ms: u64) {
        for slot in tasks.iter_mut().flatten() {
            let deadline = match slot.wait {
                WaitState::Time { deadline_ms } => Some(deadline_ms),
                WaitState::Message { deadline_ms } => Some(deadline_ms),
                _ => None,
            };
            if let Some(deadline) = deadline {
                if now_ms >= deadline {
                    slot.wait = WaitState::None;
                    slot.state.remove(TaskState::WAITING);
                }
            }
        }
    }

    /// Find the next runnable task, applying the nice-counter fairness rule. Returns the chosen
    /// slot index, or `None` if nothing is runnable (the idle task should run instead).
    pub fn find_runnable(&mut self, tasks: &mut [Option<Task>]) -> Option<usize> {
        let n = tasks.len();
        if n == 0 {
            return None;
        }

        let mut backup: Option<usize> = None;

        for step in 1..=n {
            let i = (self.cursor + step) % n;
            let Some(task) = tasks[i].as_mut() else {
                continue;
            };
            if !task.is_runnable() {
                continue;
            }

            if task.accounting.nice == 0 {
                self.cursor = i;
                task.accounting.nice = task.accounting.nice_base;
                return Some(i);
            }

            task.accounting.nice -= 1;

            let lower = backup
                .and_then(|b| tasks[b].as_ref())
                .map(|t| t.accounting.nice)
                .unwrap_or(i32::MAX);
            if task.accounting.nice < lower {
                backup = Some(i);
            }
        }

        if let Some(b) = backup {
            self.cursor = b;
            if let Some(task) = tasks[b].as_mut() {
                task.accounting.nice = task.accounting.nice_base;
            }
        }
        backup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::signal::SignalTable;
    use crate::kernel::task::{Accounting, Privilege, SavedRegisters};

    fn stub_task(nice_base: i32) -> Task {
        Task {
            id: 0,
            parent_id: 0,
            name: String::new(),
            privilege: Privilege::User,
            state: TaskState::LOADED | TaskState::RUNNING,
            saved: SavedRegisters::default(),
            entry_pc: 0,
            stack_base: 0,
            stack_len: 0,
            argv_base: 0,
            argv_len: 0,
            module: None,
            wait: WaitState::None,
            signals: SignalTable::default(),
            accounting: Accounting {
                nice: 0,
                nice_base,
                ..Default::default()
            },
            mailbox: None,
            exit_code: None,
            files: Vec::new(),
        }
    }

    #[test]
    fn equal_nice_tasks_are_each_picked_within_one_round() {
        let mut tasks: Vec<Option<Task>> = (0..3).map(|_| Some(stub_task(0))).collect();
        let mut sched = Scheduler::new();

        let mut picked = std::collections::HashSet::new();
        for _ in 0..3 {
            let i = sched.find_runnable(&mut tasks).unwrap();
            picked.insert(i);
        }
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn higher_nice_base_is_picked_less_often() {
        let mut tasks: Vec<Option<Task>> = vec![Some(stub_task(0)), Some(stub_task(3))];
        let mut sched = Scheduler::new();

        let mut counts = [0u32; 2];
        for _ in 0..20 {
            let i = sched.find_runnable(&mut tasks).unwrap();
            counts[i] += 1;
        }
        assert!(counts[0] > counts[1]);
    }
}
