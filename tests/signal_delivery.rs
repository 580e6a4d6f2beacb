//! spec.md §8 "Signal delivery": one task installs a handler that sets a data global to 1, then
//! loops sleeping; a second task `kill`s it with that signal. The first task notices the global
//! flip and reports success itself, bounding the wait in bytecode instead of real wall time.

mod common;

use c4rt_abi::opcode::{Op, SyscallId};
use c4rt_abi::signal::Signal;

use c4rt::kernel::task::Privilege;
use c4rt::loader::writer::ModuleWriter;

const POLL_ROUNDS: i64 = 500;

/// The watched task: installs a handler for `Signal::Hup` that writes `1` into a data cell, then
/// polls that cell once per millisecond (sleeping between polls) until either it flips or
/// `POLL_ROUNDS` is exhausted.
fn build_watcher_module() -> Vec<u8> {
    let mut w = ModuleWriter::new();
    let global_off = w.add_data(&[0u8; 8]);

    let handler_off = w.here();
    w.op_imm(Op::Ent, 0);
    w.op_imm(Op::Imm, 1);
    w.op(Op::Psh);
    let h_addr_at = w.op_imm(Op::Imm, 0);
    common::patch_data_address(&mut w, h_addr_at, global_off);
    w.op(Op::Si);
    w.op(Op::Lev);

    let main_off = w.here();
    w.set_entry(main_off);
    w.op_imm(Op::Ent, 1); // local -1: rounds remaining

    // SIGNAL(Hup, handler_pc)
    let handler_imm_at = w.op_imm(Op::Imm, 0);
    common::patch_code_address(&mut w, handler_imm_at, handler_off);
    w.op(Op::Psh); // SP[1] = handler_pc
    w.op_imm(Op::Imm, Signal::Hup as i64);
    w.op(Op::Psh); // SP[0] = sig
    w.op(Op::Syscall(SyscallId::Signal));

    w.op_imm(Op::Imm, POLL_ROUNDS);
    w.op(Op::Psh);
    w.op_imm(Op::Lea, -1);
    w.op(Op::Si); // rounds = POLL_ROUNDS

    let loop_start = w.here();
    w.op_imm(Op::Imm, 1);
    w.op(Op::Psh); // SP[0] = 1ms
    w.op(Op::Syscall(SyscallId::Sleep));

    let g_addr_at = w.op_imm(Op::Imm, 0);
    common::patch_data_address(&mut w, g_addr_at, global_off);
    w.op(Op::Li); // A = global
    let bnz_at = w.op_imm(Op::Bnz, 0); // -> success

    w.op_imm(Op::Lea, -1);
    w.op(Op::Li);
    w.op(Op::Psh);
    w.op_imm(Op::Imm, 1);
    w.op(Op::Sub);
    w.op(Op::Psh);
    w.op_imm(Op::Lea, -1);
    w.op(Op::Si); // rounds -= 1

    w.op_imm(Op::Lea, -1);
    w.op(Op::Li);
    let bz_at = w.op_imm(Op::Bz, 0); // -> failure

    let jmp_back_at = w.op_imm(Op::Jmp, 0);
    common::patch_jump(&mut w, jmp_back_at, loop_start);

    let failure = w.here();
    common::patch_jump(&mut w, bz_at, failure);
    w.op_imm(Op::Imm, 0);
    w.op(Op::Exit);

    let success = w.here();
    common::patch_jump(&mut w, bnz_at, success);
    w.op_imm(Op::Imm, 1);
    w.op(Op::Exit);

    w.finish()
}

/// The killer: posts `Hup` to `target_pid` once, then exits.
fn build_killer_module(target_pid: i64) -> Vec<u8> {
    let mut w = ModuleWriter::new();
    w.set_entry(0);
    w.op_imm(Op::Ent, 0);

    w.op_imm(Op::Imm, Signal::Hup as i64);
    w.op(Op::Psh); // SP[1] = sig
    w.op_imm(Op::Imm, target_pid);
    w.op(Op::Psh); // SP[0] = pid
    w.op(Op::Syscall(SyscallId::Kill));

    w.op_imm(Op::Imm, 0);
    w.op(Op::Exit);

    w.finish()
}

#[test]
fn kill_delivers_the_signal_and_the_handler_runs() {
    let mut kernel = common::test_kernel(500);

    let watcher_bytes = build_watcher_module();
    let watcher_pid = kernel
        .start_task("watcher", Privilege::User, Some(&watcher_bytes), &["watcher".to_string()], 1)
        .expect("watcher starts");

    let killer_bytes = build_killer_module(watcher_pid);
    let _killer_pid = kernel
        .start_task("killer", Privilege::User, Some(&killer_bytes), &["killer".to_string()], 1)
        .expect("killer starts");

    let exit_code = kernel.run_until_exit(watcher_pid);
    assert_eq!(exit_code, 1, "watcher should have observed the global flip to 1");
}
