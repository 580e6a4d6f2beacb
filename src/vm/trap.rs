//! Trap frame push/pop (spec.md §4.1 "Traps", §4.2).
//!
//! Grounded on `cpu::trigger_trap`'s shape (compute a cause, save what's needed to resume,
//! redirect `PC` at a handler) but targeting the VM's own operand stack instead of hardware CSRs,
//! and self-describing via a sentinel `TLEV` return address instead of a dedicated mode bit.

use crate::mem::{Memory, WORD_SIZE};
use c4rt_abi::opcode::{self, Op};
use c4rt_abi::Word;

use super::Vm;

/// The four trap classes the VM itself can deliver (spec.md §4.1), plus `Signal`, delivered by
/// the kernel through the same mechanism (spec.md §4.6).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum TrapType {
    /// Unknown opcode encountered in the code stream
    Illop = 0,
    /// The per-task cycle counter reached the configured interval
    HardIrq = 1,
    /// A memory read failed the configurable bounds check
    Segv = 2,
    /// `OPI` was given a value that does not name a valid opcode
    Opv = 3,
    /// A signal is being delivered to the task's handler
    Signal = 4,
    /// The host process's terminal interrupt was forwarded to the focused task (spec.md §4.6)
    HostSignal = 5,
}

/// Address of the word reserved for the `TLEV` trampoline at the bottom of every task's stack
/// region, written once at task creation (spec.md §4.4 "seeds the stack so that ... the next
/// opcode executed is `TASK_FINISH`" uses the same trick for normal return; we reuse one `TLEV`
/// opcode cell per task for every trap delivered to it).
pub struct TlevSlot(pub u64);

/// Push a trap frame for `trap_type`/`parameter` onto the current stack and redirect execution
/// into `handler_pc`, exactly as described in spec.md §4.1 step 1-3:
///
/// 1. push `type, parameter, A, BP, SP_at_trap, return_PC, &TLEV, <slot for handler BP>`
///    (downward, so the last word pushed ends up at the lowest address / new `SP`)
/// 2. peek the handler's `ENT k` prologue to learn how many local words to reserve
/// 3. install `BP := new frame base`, `PC := handler + 2` (past the `ENT`)
///
/// Returns `Err` if the handler's prologue isn't a valid `ENT` (a misconfigured handler is a
/// kernel bug, reported as a fault rather than silently corrupting the stack).
pub fn trigger_trap(
    vm: &mut Vm,
    mem: &mut Memory,
    tlev_addr: u64,
    handler_pc: u64,
    trap_type: TrapType,
    parameter: Word,
) -> Result<(), TrapError> {
    let w = WORD_SIZE as u64;

    let mut push = |mem: &mut Memory, v: Word| -> Result<(), TrapError> {
        vm.sp -= w;
        mem.write_word(vm.sp, v).map_err(|_| TrapError::StackOverflow)
    };

    let sp_at_trap = vm.sp;
    let pre_trap_bp = vm.bp;

    push(mem, trap_type as i64)?;
    push(mem, parameter)?;
    push(mem, vm.a)?;
    push(mem, pre_trap_bp)?;
    push(mem, sp_at_trap as Word)?;
    push(mem, vm.pc as Word)?;
    push(mem, tlev_addr as Word)?;
    push(mem, pre_trap_bp)?;

    let new_bp = vm.sp;

    let ent_op = mem.read_word(handler_pc).map_err(|_| TrapError::BadHandler)?;
    if opcode::decode(ent_op) != Some(Op::Ent) {
        return Err(TrapError::BadHandler);
    }
    let locals = mem
        .read_word(handler_pc + w)
        .map_err(|_| TrapError::BadHandler)?;
    if locals < 0 {
        return Err(TrapError::BadHandler);
    }

    vm.bp = new_bp;
    vm.sp = new_bp - (locals as u64) * w;
    vm.pc = handler_pc + 2 * w;

    Ok(())
}

/// The inverse of [`trigger_trap`]: `TLEV` pops `return_PC, SP_at_trap, BP, A` (in that order,
/// since the handler's own `LEV` epilogue already consumed the `&TLEV`/saved-BP pair below them)
/// and resumes the pre-trap code. Handlers may have edited these words in place before executing
/// `TLEV` — the scheduler relies on exactly this to switch tasks from within a trap.
pub fn tlev(vm: &mut Vm, mem: &mut Memory) -> Result<(), TrapError> {
    let w = WORD_SIZE as u64;

    let mut pop = |mem: &mut Memory| -> Result<Word, TrapError> {
        let v = mem.read_word(vm.sp).map_err(|_| TrapError::Corrupt)?;
        vm.sp += w;
        Ok(v)
    };

    let return_pc = pop(&mut *mem)?;
    let sp_at_trap = pop(&mut *mem)?;
    let bp = pop(&mut *mem)?;
    let a = pop(&mut *mem)?;

    vm.pc = return_pc as u64;
    vm.sp = sp_at_trap as u64;
    vm.bp = bp;
    vm.a = a;

    Ok(())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TrapError {
    #[error("stack overflowed while delivering a trap")]
    StackOverflow,
    #[error("trap handler does not begin with a valid ENT prologue")]
    BadHandler,
    #[error("trap frame is corrupt or was popped past its bounds")]
    Corrupt,
}
