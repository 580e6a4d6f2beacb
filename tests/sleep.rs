//! spec.md §8 "Sleep": a task that calls `sleep(100)` must not be woken before 100ms of host wall
//! time have elapsed, and the idle loop must actually notice the deadline passed (the bug this
//! guards against: an idle kernel with no other runnable task never reconsiders its wait queue).

mod common;

use std::time::Instant;

use c4rt_abi::opcode::{Op, SyscallId};

use c4rt::kernel::task::Privilege;
use c4rt::loader::writer::ModuleWriter;

fn build_sleep_module(ms: i64, exit_code: i64) -> Vec<u8> {
    let mut w = ModuleWriter::new();
    w.set_entry(0);
    w.op_imm(Op::Ent, 0);

    w.op_imm(Op::Imm, ms);
    w.op(Op::Psh); // SP[0] = ms
    w.op(Op::Syscall(SyscallId::Sleep));

    w.op_imm(Op::Imm, exit_code);
    w.op(Op::Exit);

    w.finish()
}

#[test]
fn sleep_does_not_return_before_the_deadline() {
    let bytes = build_sleep_module(100, 42);
    let mut kernel = common::test_kernel(2_000);

    let pid = kernel
        .start_task("sleeper", Privilege::User, Some(&bytes), &["sleeper".to_string()], 1)
        .expect("task starts");

    let t0 = Instant::now();
    let exit_code = kernel.run_until_exit(pid);
    let elapsed = t0.elapsed();

    assert_eq!(exit_code, 42);
    assert!(
        elapsed.as_millis() >= 100,
        "task resumed after only {elapsed:?}, expected at least 100ms"
    );
}
