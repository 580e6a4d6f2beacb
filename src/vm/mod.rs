//! The stack-machine interpreter (spec.md §4.1).
//!
//! Grounded on `cpu.rs`'s `Cpu`: a small fixed register file, a `step()` that fetches one
//! instruction and mutates registers/memory in place, and a `Debug` impl good enough to dump into
//! a fault log. Unlike `Cpu`, this machine never decodes into a cached micro-op (bytecode has no
//! variable-length instructions to cache), so `vm::opcode::decode` is a plain match.

pub mod trap;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use c4rt_abi::opcode::{self, Op, SyscallId};
use c4rt_abi::Word;

use crate::mem::{Memory, WORD_SIZE};
use trap::{TrapError, TrapType};

/// What happened on one call to [`Vm::step`]. `Continue` means the VM consumed exactly one
/// instruction and is ready for another; every other variant means the host (the kernel) needs to
/// act before stepping again.
#[derive(Debug)]
pub enum StepOutcome {
    Continue,
    /// One of the base syscalls recognized directly by the VM (spec.md §4.1); `PC` already
    /// points past the opcode. The host reads arguments off the stack, writes a result to `A`.
    BaseSyscall(Op),
    /// A kernel-registered syscall opcode; same calling convention as `BaseSyscall`.
    Syscall(SyscallId),
    /// Execution reached `KTRAP`, the middle instruction of the kernel's generated handler stub
    /// (`ENT 0; KTRAP; LEV`): a VM-autonomous trap (fault, preemption, or forwarded host signal)
    /// needs host-side handling. `type`/`parameter` are readable at `vm.bp + 7*word_size` /
    /// `vm.bp + 6*word_size` (spec.md §4.1 step 1's push order). The host saves or switches
    /// `vm.pc/sp/bp/a` as needed (exactly like a syscall-triggered switch) and, if it leaves them
    /// untouched, the stub's trailing `LEV` plus the freestanding `TLEV` cell it jumps to resume
    /// the interrupted task with its registers intact.
    KernelTrap,
    /// The VM could not deliver a trap because no handler is installed for it — this can only
    /// happen if the kernel started a task before configuring itself, which is a kernel bug
    /// rather than a guest-code fault (spec.md §7 "a fault in the kernel's own trap handler ...
    /// is treated as unrecoverable").
    Fault(FaultReason),
}

#[derive(Debug, thiserror::Error)]
pub enum FaultReason {
    #[error("no handler installed for {0:?}")]
    NoHandler(TrapType),
    #[error(transparent)]
    Trap(#[from] TrapError),
    #[error(transparent)]
    Mem(#[from] crate::mem::MemError),
}

/// The live register file plus the bits of VM configuration a kernel installs through the
/// configuration opcodes (`SCYH`/`SIVL`/`CYCC`/`STRH`/`SYSI`).
pub struct Vm {
    pub pc: u64,
    pub sp: u64,
    pub bp: u64,
    pub a: Word,

    /// Monotonically increasing; compared against `cycle_interval` once per instruction.
    pub cycle_count: u64,
    /// Zero disables preemption.
    pub cycle_interval: u64,

    /// Installed by `SCYH`; invoked on `HARD_IRQ`.
    pub cycle_handler_pc: Option<u64>,
    /// Installed by `STRH`; invoked on `ILLOP`/`SEGV`/`OPV`.
    pub trap_handler_pc: Option<u64>,
    /// Set directly by the kernel at boot, not through a guest opcode: the handler for a host
    /// signal forwarded into the VM loop (spec.md §4.6).
    pub signal_forwarder_pc: Option<u64>,

    /// Address of a code cell holding a bare `TLEV` opcode, used as the trampoline return address
    /// every trap frame points at.
    pub tlev_trampoline: u64,

    /// Whether `LI` bounds-checks its address before dereferencing (spec.md §4.1 "enabled by a
    /// configurable check on LI").
    pub segv_checks: bool,

    /// Set by a host signal handler (`signal-hook`), cleared by the VM loop the next time it
    /// checks (spec.md §4.6 "the VM loop checks `pending_signal` at the top of each cycle").
    pub host_signal_pending: Arc<AtomicBool>,
}

impl Vm {
    pub fn new(tlev_trampoline: u64) -> Vm {
        Vm {
            pc: 0,
            sp: 0,
            bp: 0,
            a: 0,
            cycle_count: 0,
            cycle_interval: 0,
            cycle_handler_pc: None,
            trap_handler_pc: None,
            signal_forwarder_pc: None,
            tlev_trampoline,
            segv_checks: true,
            host_signal_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the currently-live register file, as a context switch loads a task's saved
    /// registers (spec.md §4.4 step 4). Deliberately separate from `TLEV`: a syscall-triggered
    /// switch never pushed a trap frame to begin with, so there is nothing for `TLEV` to pop —
    /// the kernel just assigns the incoming task's registers directly.
    pub fn install(&mut self, pc: u64, sp: u64, bp: u64, a: Word) {
        self.pc = pc;
        self.sp = sp;
        self.bp = bp;
        self.a = a;
    }

    fn deliver(
        &mut self,
        mem: &mut Memory,
        trap_type: TrapType,
        parameter: Word,
    ) -> Result<(), FaultReason> {
        let handler = match trap_type {
            TrapType::HardIrq => self.cycle_handler_pc,
            TrapType::Illop | TrapType::Segv | TrapType::Opv => self.trap_handler_pc,
            TrapType::HostSignal => self.signal_forwarder_pc,
            TrapType::Signal => {
                unreachable!("signal injection goes through inject_signal_trap, not deliver")
            }
        }
        .ok_or(FaultReason::NoHandler(trap_type))?;

        trap::trigger_trap(self, mem, self.tlev_trampoline, handler, trap_type, parameter)
            .map_err(FaultReason::from)
    }

    /// Deliver a trap into the currently-live task from outside the step loop — used by the
    /// kernel to inject a pending signal's *user-installed* handler during a context switch
    /// (spec.md §4.4 step 3). Unlike the VM-autonomous traps, the target here is real guest
    /// bytecode the task installed via the `SIGNAL` syscall, so it bypasses the kernel's relay
    /// stub entirely and runs like any other call until the handler itself executes `TLEV`.
    pub fn inject_signal_trap(
        &mut self,
        mem: &mut Memory,
        handler_pc: u64,
        signal_number: Word,
    ) -> Result<(), FaultReason> {
        trap::trigger_trap(
            self,
            mem,
            self.tlev_trampoline,
            handler_pc,
            TrapType::Signal,
            signal_number,
        )
        .map_err(FaultReason::from)
    }

    /// Fetch, decode, and execute exactly one instruction, or deliver exactly one trap.
    pub fn step(&mut self, mem: &mut Memory) -> StepOutcome {
        if self.host_signal_pending.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.deliver(mem, TrapType::HostSignal, 0) {
                return StepOutcome::Fault(e);
            }
        }

        let word = match mem.read_word(self.pc) {
            Ok(w) => w,
            Err(_) => {
                return match self.deliver(mem, TrapType::Segv, self.pc as Word) {
                    Ok(()) => StepOutcome::Continue,
                    Err(e) => StepOutcome::Fault(e),
                }
            }
        };

        let op = match opcode::decode(word) {
            Some(op) => op,
            None => {
                return match self.deliver(mem, TrapType::Illop, word) {
                    Ok(()) => StepOutcome::Continue,
                    Err(e) => StepOutcome::Fault(e),
                }
            }
        };

        self.pc += WORD_SIZE as u64;

        let imm = if opcode::has_immediate(op) {
            match mem.read_word(self.pc) {
                Ok(v) => {
                    self.pc += WORD_SIZE as u64;
                    v
                }
                Err(e) => return StepOutcome::Fault(FaultReason::Mem(e)),
            }
        } else {
            0
        };

        macro_rules! pop {
            () => {{
                let v = match mem.read_word(self.sp) {
                    Ok(v) => v,
                    Err(e) => return StepOutcome::Fault(FaultReason::Mem(e)),
                };
                self.sp += WORD_SIZE as u64;
                v
            }};
        }
        macro_rules! push {
            ($v:expr) => {{
                self.sp -= WORD_SIZE as u64;
                if let Err(e) = mem.write_word(self.sp, $v) {
                    return StepOutcome::Fault(FaultReason::Mem(e));
                }
            }};
        }

        match op {
            Op::Lea => self.a = (self.bp as i64) + imm * WORD_SIZE as i64,
            Op::Imm => self.a = imm,
            Op::Li => {
                let addr = self.a as u64;
                if self.segv_checks && !mem.in_bounds(addr, WORD_SIZE) {
                    return match self.deliver(mem, TrapType::Segv, addr as Word) {
                        Ok(()) => StepOutcome::Continue,
                        Err(e) => StepOutcome::Fault(e),
                    };
                }
                self.a = match mem.read_word(addr) {
                    Ok(v) => v,
                    Err(e) => return StepOutcome::Fault(FaultReason::Mem(e)),
                };
            }
            Op::Lc => {
                self.a = match mem.read_byte(self.a as u64) {
                    Ok(v) => v as i8 as Word,
                    Err(e) => return StepOutcome::Fault(FaultReason::Mem(e)),
                };
            }
            Op::Si => {
                let v = pop!();
                if let Err(e) = mem.write_word(self.a as u64, v) {
                    return StepOutcome::Fault(FaultReason::Mem(e));
                }
            }
            Op::Sc => {
                let v = pop!();
                if let Err(e) = mem.write_byte(self.a as u64, v as u8) {
                    return StepOutcome::Fault(FaultReason::Mem(e));
                }
            }
            Op::Psh => push!(self.a),

            Op::Jmp => self.pc = imm as u64,
            Op::Bz => {
                if self.a == 0 {
                    self.pc = imm as u64;
                }
            }
            Op::Bnz => {
                if self.a != 0 {
                    self.pc = imm as u64;
                }
            }
            Op::Jsr => {
                push!(self.pc as Word);
                self.pc = imm as u64;
            }
            Op::Jsri => {
                push!(self.pc as Word);
                let target = match mem.read_word(imm as u64) {
                    Ok(v) => v,
                    Err(e) => return StepOutcome::Fault(FaultReason::Mem(e)),
                };
                self.pc = target as u64;
            }
            Op::Jsrs => {
                push!(self.pc as Word);
                let target = match mem.read_word((self.bp as i64 + imm * WORD_SIZE as i64) as u64) {
                    Ok(v) => v,
                    Err(e) => return StepOutcome::Fault(FaultReason::Mem(e)),
                };
                self.pc = target as u64;
            }
            Op::Ent => {
                push!(self.bp as Word);
                self.bp = self.sp;
                self.sp -= (imm as u64) * WORD_SIZE as u64;
            }
            Op::Adj => self.sp += (imm as u64) * WORD_SIZE as u64,
            Op::Lev => {
                self.sp = self.bp;
                self.bp = pop!() as u64;
                self.pc = pop!() as u64;
            }

            Op::Or => self.a = pop!() | self.a,
            Op::Xor => self.a = pop!() ^ self.a,
            Op::And => self.a = pop!() & self.a,
            Op::Eq => self.a = (pop!() == self.a) as Word,
            Op::Ne => self.a = (pop!() != self.a) as Word,
            Op::Lt => self.a = (pop!() < self.a) as Word,
            Op::Gt => self.a = (pop!() > self.a) as Word,
            Op::Le => self.a = (pop!() <= self.a) as Word,
            Op::Ge => self.a = (pop!() >= self.a) as Word,
            Op::Shl => self.a = pop!() << self.a,
            Op::Shr => self.a = pop!() >> self.a,
            Op::Add => self.a = pop!() + self.a,
            Op::Sub => self.a = pop!() - self.a,
            Op::Mul => self.a = pop!().wrapping_mul(self.a),
            Op::Div => {
                let lhs = pop!();
                // Design Notes §9: clamp rather than let a zero divisor propagate a host panic.
                self.a = if self.a == 0 { 0 } else { lhs / self.a };
            }
            Op::Mod => {
                let lhs = pop!();
                self.a = if self.a == 0 { 0 } else { lhs % self.a };
            }

            Op::Tlev => {
                if let Err(e) = trap::tlev(self, mem) {
                    return StepOutcome::Fault(FaultReason::Trap(e));
                }
            }
            Op::Ktrap => return StepOutcome::KernelTrap,
            Op::Opi => {
                match opcode::decode(self.a) {
                    Some(target) => return self.dispatch_custom(mem, target),
                    None => {
                        let bad = self.a;
                        return match self.deliver(mem, TrapType::Opv, bad) {
                            Ok(()) => StepOutcome::Continue,
                            Err(e) => StepOutcome::Fault(e),
                        };
                    }
                }
            }

            Op::Scyh => self.cycle_handler_pc = Some(self.a as u64),
            Op::Sivl => self.cycle_interval = self.a as u64,
            Op::Cycc => self.a = self.cycle_count as Word,
            Op::Strh => self.trap_handler_pc = Some(self.a as u64),
            Op::Sysi => self.a = 0b1 | (WORD_SIZE as Word * 8) << 8,

            Op::Open | Op::Read | Op::Clos | Op::Prtf | Op::Malc | Op::Free | Op::Mset
            | Op::Mcmp | Op::Mcpy | Op::Exit => return StepOutcome::BaseSyscall(op),

            Op::Syscall(id) => return StepOutcome::Syscall(id),
        }

        self.tick(mem)
    }

    /// `OPI`'s target turned out to be a syscall/base-syscall rather than an ordinary opcode;
    /// bubble it the same way a direct decode would have.
    fn dispatch_custom(&mut self, mem: &mut Memory, target: Op) -> StepOutcome {
        match target {
            Op::Syscall(id) => StepOutcome::Syscall(id),
            other @ (Op::Open | Op::Read | Op::Clos | Op::Prtf | Op::Malc | Op::Free | Op::Mset
            | Op::Mcmp | Op::Mcpy | Op::Exit) => StepOutcome::BaseSyscall(other),
            _ => match self.deliver(mem, TrapType::Opv, self.a) {
                Ok(()) => self.tick(mem),
                Err(e) => StepOutcome::Fault(e),
            },
        }
    }

    /// Cycle accounting, run after every completed instruction (spec.md §4.1 "Cycle counter").
    fn tick(&mut self, mem: &mut Memory) -> StepOutcome {
        self.cycle_count += 1;
        if self.cycle_interval != 0 && self.cycle_count >= self.cycle_interval {
            self.cycle_count = 0;
            return match self.deliver(mem, TrapType::HardIrq, 0) {
                Ok(()) => StepOutcome::Continue,
                Err(e) => StepOutcome::Fault(e),
            };
        }
        StepOutcome::Continue
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("bp", &format_args!("{:#x}", self.bp))
            .field("a", &self.a)
            .field("cycle_count", &self.cycle_count)
            .field("cycle_interval", &self.cycle_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_vm_with_stack(mem: &mut Memory, stack_top: u64) -> Vm {
        let mut vm = Vm::new(0);
        vm.sp = stack_top;
        vm.bp = stack_top;
        vm
    }

    fn asm(mem: &mut Memory, pc: u64, words: &[i64]) {
        for (i, w) in words.iter().enumerate() {
            mem.write_word(pc + (i as u64) * WORD_SIZE as u64, *w).unwrap();
        }
    }

    #[test]
    fn ent_then_lev_is_a_no_op_over_bp_sp() {
        let mut mem = Memory::new(4096);
        let stack_top = 2048;
        let mut vm = new_vm_with_stack(&mut mem, stack_top);
        vm.pc = 0;
        asm(
            &mut mem,
            0,
            &[
                opcode::encode(Op::Ent),
                3,
                opcode::encode(Op::Lev),
            ],
        );

        let bp_before = vm.bp;
        let sp_before = vm.sp;
        assert!(matches!(vm.step(&mut mem), StepOutcome::Continue)); // ENT
        assert_eq!(vm.bp, sp_before - WORD_SIZE as u64);
        assert_eq!(vm.sp, vm.bp - 3 * WORD_SIZE as u64);

        assert!(matches!(vm.step(&mut mem), StepOutcome::Continue)); // LEV
        assert_eq!(vm.bp, bp_before);
        assert_eq!(vm.sp, sp_before + WORD_SIZE as u64);
    }

    #[test]
    fn jsr_then_lev_returns_past_the_call() {
        let mut mem = Memory::new(4096);
        let stack_top = 2048;
        let mut vm = new_vm_with_stack(&mut mem, stack_top);
        vm.pc = 0;
        // 0: JSR 10   2: (return here)
        asm(&mut mem, 0, &[opcode::encode(Op::Jsr), 10]);
        // 10: ENT 0   12: LEV
        asm(&mut mem, 10, &[opcode::encode(Op::Ent), 0, opcode::encode(Op::Lev)]);

        assert!(matches!(vm.step(&mut mem), StepOutcome::Continue)); // JSR
        assert_eq!(vm.pc, 10);
        assert!(matches!(vm.step(&mut mem), StepOutcome::Continue)); // ENT
        assert!(matches!(vm.step(&mut mem), StepOutcome::Continue)); // LEV
        assert_eq!(vm.pc, 2);
    }

    #[test]
    fn unknown_opcode_delivers_illop() {
        let mut mem = Memory::new(4096);
        let stack_top = 2048;
        let mut vm = new_vm_with_stack(&mut mem, stack_top);
        vm.pc = 0;
        vm.trap_handler_pc = Some(100);
        asm(&mut mem, 0, &[9999]);
        asm(&mut mem, 100, &[opcode::encode(Op::Ent), 0]);

        match vm.step(&mut mem) {
            StepOutcome::Continue => {}
            other => panic!("expected Continue after trap delivery, got {other:?}"),
        }
        assert_eq!(vm.pc, 104);
    }

    #[test]
    fn division_by_zero_is_clamped_not_panicking() {
        let mut mem = Memory::new(4096);
        let stack_top = 2048;
        let mut vm = new_vm_with_stack(&mut mem, stack_top);
        vm.pc = 0;
        vm.sp -= WORD_SIZE as u64;
        mem.write_word(vm.sp, 42).unwrap();
        vm.a = 0;
        asm(&mut mem, 0, &[opcode::encode(Op::Div)]);

        assert!(matches!(vm.step(&mut mem), StepOutcome::Continue));
        assert_eq!(vm.a, 0);
    }

    #[test]
    fn cycle_interval_delivers_hard_irq() {
        let mut mem = Memory::new(4096);
        let stack_top = 2048;
        let mut vm = new_vm_with_stack(&mut mem, stack_top);
        vm.pc = 0;
        vm.cycle_interval = 1;
        vm.cycle_handler_pc = Some(100);
        asm(&mut mem, 0, &[opcode::encode(Op::Imm), 7]);
        asm(&mut mem, 100, &[opcode::encode(Op::Ent), 0]);

        assert!(matches!(vm.step(&mut mem), StepOutcome::Continue));
        // IMM itself ran (A == 7 was overwritten by the trap frame push, but PC landed in the
        // handler rather than at word 2).
        assert_eq!(vm.pc, 104);
    }
}
