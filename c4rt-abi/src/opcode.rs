//! The C4 bytecode opcode table.
//!
//! Mirrors the split in `cpu::decoder` of "what a word in the code stream means" from the VM
//! that executes it: this module only knows how to turn a code word into an [`Op`], the VM core
//! (`vm::core`) is the one that gives each variant meaning.

/// A decoded instruction. Opcodes that take an immediate carry it as an `i64` read from the code
/// word that follows them; see `spec.md` §3 for which opcodes those are.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    // -- register / memory --
    /// `A := BP + k*word_size`
    Lea,
    /// `A := v`
    Imm,
    /// Load word through `A`
    Li,
    /// Load byte (sign-extended) through `A`
    Lc,
    /// Store word through `*SP++`
    Si,
    /// Store byte through `*SP++`
    Sc,
    /// `*--SP := A`
    Psh,

    // -- control flow --
    Jmp,
    Bz,
    Bnz,
    Jsr,
    /// Call through a function pointer stored in a global (dereferences the target once)
    Jsri,
    /// Call through a function pointer passed by value at `BP+k`
    Jsrs,
    Ent,
    Adj,
    Lev,

    // -- arithmetic / logic, each pops one stack word and combines with A --
    Or,
    Xor,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // -- trap machinery --
    /// Restore `PC/SP/BP/A` from the trap frame at the top of the stack and resume
    Tlev,
    /// Dispatch to the opcode numbered by the current value of `A`, faulting with `OPV` if it
    /// does not name a valid instruction. Used together with `REQUEST_SYMBOL` to invoke a
    /// syscall whose numeric id was looked up at runtime rather than baked in as a literal.
    Opi,
    /// Internal relay opcode at the tail of the kernel's generated trap-handler stub: signals
    /// the host that a VM-autonomous trap (`ILLOP`/`SEGV`/`OPV`/`HARD_IRQ`/forwarded host signal)
    /// has reached its handler frame. Never appears in a compiled C4R image.
    Ktrap,

    // -- VM configuration, exposed only to kernel-privileged code --
    /// Install the handler invoked on `HARD_IRQ` (cycle-timer expiry)
    Scyh,
    /// Set the cycle interval; 0 disables preemption
    Sivl,
    /// Read the current cycle counter into `A`
    Cycc,
    /// Install the handler invoked on `ILLOP`/`SEGV`/`OPV`
    Strh,
    /// Query a small system-info word (bit 0: running under a kernel; bits 8-15: word width)
    Sysi,

    // -- base syscalls recognized directly by the VM --
    Open,
    Read,
    Clos,
    Prtf,
    Malc,
    Free,
    Mset,
    Mcmp,
    Mcpy,
    Exit,

    // -- kernel-registered syscalls (custom opcode range, see `syscall` module) --
    Syscall(SyscallId),
}

/// The stable kernel syscall surface (spec §6.2), each a distinct opcode value in the custom
/// range dispatched through a kernel-installed handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum SyscallId {
    Schedule = 0,
    Sleep = 1,
    AwaitPid = 2,
    AwaitMessage = 3,
    Pid = 4,
    Parent = 5,
    Signal = 6,
    Kill = 7,
    StartC4r = 8,
    TaskFocus = 9,
    TasksExport = 10,
    TasksUpdate = 11,
    TasksFree = 12,
    RequestExclusive = 13,
    ReleaseExclusive = 14,
    RequestSymbol = 15,
    /// Read back a task's human-readable name, given its pid.
    GetTaskName = 16,
    /// Adjust a task's `nice_base` at runtime.
    SetPriority = 17,
    /// Cooperative handoff hint to the scheduler: prefer this pid next.
    YieldTo = 18,
}

impl SyscallId {
    pub const COUNT: usize = 19;

    pub fn from_index(i: u16) -> Option<SyscallId> {
        use SyscallId::*;
        Some(match i {
            0 => Schedule,
            1 => Sleep,
            2 => AwaitPid,
            3 => AwaitMessage,
            4 => Pid,
            5 => Parent,
            6 => Signal,
            7 => Kill,
            8 => StartC4r,
            9 => TaskFocus,
            10 => TasksExport,
            11 => TasksUpdate,
            12 => TasksFree,
            13 => RequestExclusive,
            14 => ReleaseExclusive,
            15 => RequestSymbol,
            16 => GetTaskName,
            17 => SetPriority,
            18 => YieldTo,
            _ => return None,
        })
    }

    /// The name used by the `REQUEST_SYMBOL` syscall to look up an opcode id dynamically.
    pub fn name(self) -> &'static str {
        use SyscallId::*;
        match self {
            Schedule => "schedule",
            Sleep => "sleep",
            AwaitPid => "await_pid",
            AwaitMessage => "await_message",
            Pid => "pid",
            Parent => "parent",
            Signal => "signal",
            Kill => "kill",
            StartC4r => "start_c4r",
            TaskFocus => "task_focus",
            TasksExport => "tasks_export",
            TasksUpdate => "tasks_update",
            TasksFree => "tasks_free",
            RequestExclusive => "request_exclusive",
            ReleaseExclusive => "release_exclusive",
            RequestSymbol => "request_symbol",
            GetTaskName => "get_task_name",
            SetPriority => "set_priority",
            YieldTo => "yield_to",
        }
    }

    pub fn by_name(name: &str) -> Option<SyscallId> {
        (0..Self::COUNT as u16)
            .map(|i| Self::from_index(i).unwrap())
            .find(|s| s.name() == name)
    }
}

/// Base (non-kernel) opcode numbering. Two-operand opcodes occupy the word immediately after
/// their own; see `spec.md` §3.
const BASE_OPS: &[Op] = &[
    Op::Lea,
    Op::Imm,
    Op::Jmp,
    Op::Jsr,
    Op::Jsri,
    Op::Jsrs,
    Op::Bz,
    Op::Bnz,
    Op::Ent,
    Op::Adj,
    Op::Lev,
    Op::Li,
    Op::Lc,
    Op::Si,
    Op::Sc,
    Op::Psh,
    Op::Or,
    Op::Xor,
    Op::And,
    Op::Eq,
    Op::Ne,
    Op::Lt,
    Op::Gt,
    Op::Le,
    Op::Ge,
    Op::Shl,
    Op::Shr,
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::Mod,
    Op::Tlev,
    Op::Opi,
    Op::Ktrap,
    Op::Scyh,
    Op::Sivl,
    Op::Cycc,
    Op::Strh,
    Op::Sysi,
    Op::Open,
    Op::Read,
    Op::Clos,
    Op::Prtf,
    Op::Malc,
    Op::Free,
    Op::Mset,
    Op::Mcmp,
    Op::Mcpy,
    Op::Exit,
];

/// First opcode number in the kernel syscall range.
pub const SYSCALL_BASE: i64 = BASE_OPS.len() as i64;

/// Opcodes that consume the code word immediately following them as an immediate operand.
pub fn has_immediate(op: Op) -> bool {
    matches!(
        op,
        Op::Lea
            | Op::Imm
            | Op::Jmp
            | Op::Jsr
            | Op::Jsri
            | Op::Jsrs
            | Op::Bz
            | Op::Bnz
            | Op::Ent
            | Op::Adj
    )
}

/// Decode a raw code word into an [`Op`]. Returns `None` for values outside the known opcode
/// space; the VM turns that into an `ILLOP` trap.
pub fn decode(word: i64) -> Option<Op> {
    if word < 0 {
        return None;
    }

    if let Some(&op) = BASE_OPS.get(word as usize) {
        return Some(op);
    }

    let idx = word - SYSCALL_BASE;
    if idx < 0 || idx > u16::MAX as i64 {
        return None;
    }

    SyscallId::from_index(idx as u16).map(Op::Syscall)
}

/// Encode an [`Op`] back into its numeric opcode value. Used by the test-only C4R writer.
pub fn encode(op: Op) -> i64 {
    match op {
        Op::Syscall(id) => SYSCALL_BASE + id as i64,
        other => BASE_OPS
            .iter()
            .position(|&o| o == other)
            .expect("non-syscall Op must be present in BASE_OPS") as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_base_ops() {
        for &op in BASE_OPS {
            assert_eq!(decode(encode(op)), Some(op));
        }
    }

    #[test]
    fn roundtrip_syscalls() {
        for i in 0..SyscallId::COUNT as u16 {
            let id = SyscallId::from_index(i).unwrap();
            let op = Op::Syscall(id);
            assert_eq!(decode(encode(op)), Some(op));
        }
    }

    #[test]
    fn syscall_name_lookup_roundtrips() {
        for i in 0..SyscallId::COUNT as u16 {
            let id = SyscallId::from_index(i).unwrap();
            assert_eq!(SyscallId::by_name(id.name()), Some(id));
        }
    }

    #[test]
    fn unknown_opcode_decodes_to_none() {
        assert_eq!(decode(-1), None);
        assert_eq!(decode(i64::MAX), None);
    }
}
