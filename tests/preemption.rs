//! spec.md §8 "Preemption": two equal-nice tight infinite loops must both accumulate a non-zero
//! number of executed cycles while a third task sleeps for a bit, proving neither is starved by
//! the other under the cycle-interrupt-driven scheduler.

mod common;

use c4rt_abi::opcode::{Op, SyscallId};

use c4rt::kernel::task::Privilege;
use c4rt::loader::writer::ModuleWriter;

/// `entry: JMP entry` — the simplest possible busy task; it never voluntarily yields, so it only
/// ever gets interrupted by `HARD_IRQ`.
fn build_spin_module() -> Vec<u8> {
    let mut w = ModuleWriter::new();
    w.set_entry(0);
    let start = w.here();
    let jmp_at = w.op_imm(Op::Jmp, 0);
    common::patch_jump(&mut w, jmp_at, start);
    w.finish()
}

fn build_timer_module(sleep_ms: i64) -> Vec<u8> {
    let mut w = ModuleWriter::new();
    w.set_entry(0);
    w.op_imm(Op::Ent, 0);
    w.op_imm(Op::Imm, sleep_ms);
    w.op(Op::Psh);
    w.op(Op::Syscall(SyscallId::Sleep));
    w.op_imm(Op::Imm, 0);
    w.op(Op::Exit);
    w.finish()
}

#[test]
fn two_equal_nice_spinners_both_make_progress() {
    // A small cycle interval forces frequent HARD_IRQs so both spinners get scheduled many times
    // during the timer's short sleep, without the test itself needing a full second of wall time.
    let mut kernel = common::test_kernel(200);

    let spin_a = build_spin_module();
    let spin_b = build_spin_module();
    let pid_a = kernel
        .start_task("spin-a", Privilege::User, Some(&spin_a), &["spin-a".to_string()], 1)
        .expect("spinner a starts");
    let pid_b = kernel
        .start_task("spin-b", Privilege::User, Some(&spin_b), &["spin-b".to_string()], 1)
        .expect("spinner b starts");

    let timer = build_timer_module(50);
    let pid_timer = kernel
        .start_task("timer", Privilege::User, Some(&timer), &["timer".to_string()], 1)
        .expect("timer starts");

    kernel.run_until_exit(pid_timer);

    let cycles_a = kernel.task_by_pid(pid_a).expect("spinner a still in the table").accounting.cycles_executed;
    let cycles_b = kernel.task_by_pid(pid_b).expect("spinner b still in the table").accounting.cycles_executed;

    assert!(cycles_a > 0, "spinner a never ran");
    assert!(cycles_b > 0, "spinner b never ran");
}
