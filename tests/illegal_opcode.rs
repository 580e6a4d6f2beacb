//! spec.md §8 "Illegal opcode": a task whose code stream contains a raw invalid opcode word
//! faults to a negative exit code and becomes a zombie, while an unrelated task keeps running and
//! exits normally — one bad task must never take the kernel down.

mod common;

use c4rt_abi::opcode::Op;

use c4rt::kernel::task::{Privilege, TaskState};
use c4rt::loader::writer::ModuleWriter;

/// A single word that decodes to nothing in `BASE_OPS` — the VM must deliver `ILL_OP`/fault
/// rather than panic.
const INVALID_OPCODE_WORD: i64 = -1;

fn build_faulting_module() -> Vec<u8> {
    let mut w = ModuleWriter::new();
    w.set_entry(0);
    w.raw(INVALID_OPCODE_WORD);
    w.finish()
}

fn build_sane_module(exit_code: i64) -> Vec<u8> {
    let mut w = ModuleWriter::new();
    w.set_entry(0);
    w.op_imm(Op::Ent, 0);
    w.op_imm(Op::Imm, exit_code);
    w.op(Op::Exit);
    w.finish()
}

#[test]
fn a_faulting_task_becomes_a_zombie_without_taking_down_the_kernel() {
    let mut kernel = common::test_kernel(10_000);

    let faulting = build_faulting_module();
    let faulting_pid = kernel
        .start_task("faulter", Privilege::User, Some(&faulting), &["faulter".to_string()], 1)
        .expect("faulting task starts");

    let sane = build_sane_module(7);
    let sane_pid = kernel
        .start_task("sane", Privilege::User, Some(&sane), &["sane".to_string()], 1)
        .expect("sane task starts");

    let sane_exit = kernel.run_until_exit(sane_pid);
    assert_eq!(sane_exit, 7, "unrelated task must still run to completion");

    let faulter = kernel.task_by_pid(faulting_pid).expect("faulting task stays in the table as a zombie");
    assert_eq!(faulter.state, TaskState::ZOMBIE);
    assert!(
        faulter.exit_code.expect("zombie has an exit code") < 0,
        "a faulted task's exit code must be negative"
    );
}
