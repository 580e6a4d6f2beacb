//! The fixed signal numbering used by `kernel::signal` and the `SIGNAL`/`KILL` syscalls.

/// Default policy applied to a signal when the target task has no handler installed (spec §7).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DefaultAction {
    /// Terminate the task with a negative exit code.
    Terminate,
    /// Log and continue; the signal is otherwise a no-op.
    Ignore,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Signal {
    Hup = 0,
    Int = 1,
    Quit = 2,
    Ill = 3,
    Abrt = 4,
    Trap = 5,
    Term = 6,
    Kill = 7,
}

impl Signal {
    pub const COUNT: usize = 8;

    pub const ALL: [Signal; Signal::COUNT] = [
        Signal::Hup,
        Signal::Int,
        Signal::Quit,
        Signal::Ill,
        Signal::Abrt,
        Signal::Trap,
        Signal::Term,
        Signal::Kill,
    ];

    pub fn from_number(n: i64) -> Option<Signal> {
        Signal::ALL.into_iter().find(|s| *s as i64 == n)
    }

    pub fn default_action(self) -> DefaultAction {
        match self {
            Signal::Trap => DefaultAction::Ignore,
            _ => DefaultAction::Terminate,
        }
    }
}
