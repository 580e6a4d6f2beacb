//! spec.md §8 "Factorial": compute `10! = 3628800` in one task, await it from the test, and check
//! the exit code.

mod common;

use c4rt_abi::opcode::Op;

use c4rt::kernel::task::Privilege;
use c4rt::loader::writer::ModuleWriter;

/// `i` and `acc` live as two locals (`BP-1`, `BP-2`) rather than registers, the same local-slot
/// convention a real c4 compiler would emit for `int fact(int n) { int acc = 1; while (n) { acc
/// *= n; n -= 1; } return acc; }`.
fn build_factorial_module(n: i64) -> Vec<u8> {
    let mut w = ModuleWriter::new();
    w.set_entry(0);

    w.op_imm(Op::Ent, 2);

    // acc (-2) = 1
    w.op_imm(Op::Imm, 1);
    w.op(Op::Psh);
    w.op_imm(Op::Lea, -2);
    w.op(Op::Si);

    // i (-1) = n
    w.op_imm(Op::Imm, n);
    w.op(Op::Psh);
    w.op_imm(Op::Lea, -1);
    w.op(Op::Si);

    let loop_start = w.here();
    w.op_imm(Op::Lea, -1);
    w.op(Op::Li); // A = i
    let bz_at = w.op_imm(Op::Bz, 0); // -> done, patched below

    // acc = acc * i
    w.op_imm(Op::Lea, -2);
    w.op(Op::Li); // A = acc
    w.op(Op::Psh);
    w.op_imm(Op::Lea, -1);
    w.op(Op::Li); // A = i
    w.op(Op::Mul); // A = acc * i
    w.op(Op::Psh);
    w.op_imm(Op::Lea, -2);
    w.op(Op::Si);

    // i = i - 1
    w.op_imm(Op::Lea, -1);
    w.op(Op::Li); // A = i
    w.op(Op::Psh);
    w.op_imm(Op::Imm, 1);
    w.op(Op::Sub); // A = i - 1
    w.op(Op::Psh);
    w.op_imm(Op::Lea, -1);
    w.op(Op::Si);

    let jmp_at = w.op_imm(Op::Jmp, 0);
    common::patch_jump(&mut w, jmp_at, loop_start);

    let done = w.here();
    common::patch_jump(&mut w, bz_at, done);

    w.op_imm(Op::Lea, -2);
    w.op(Op::Li); // A = acc
    w.op(Op::Exit);

    w.finish()
}

#[test]
fn factorial_of_ten_exits_with_3628800() {
    let bytes = build_factorial_module(10);
    let mut kernel = common::test_kernel(10_000);

    let pid = kernel
        .start_task("factorial", Privilege::User, Some(&bytes), &["factorial".to_string()], 1)
        .expect("task starts");

    let exit_code = kernel.run_until_exit(pid);
    assert_eq!(exit_code, 3_628_800);
}

#[test]
fn factorial_of_zero_is_the_identity() {
    let bytes = build_factorial_module(0);
    let mut kernel = common::test_kernel(10_000);

    let pid = kernel
        .start_task("factorial0", Privilege::User, Some(&bytes), &["factorial0".to_string()], 1)
        .expect("task starts");

    assert_eq!(kernel.run_until_exit(pid), 1);
}
