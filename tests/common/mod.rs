//! Shared fixture-building helpers for the end-to-end scenario tests (spec.md §8 "Concrete
//! scenarios"). Every scenario assembles its own C4R bytes in-process with
//! [`c4rt::loader::writer::ModuleWriter`] rather than depending on a real C4 compiler, then drives
//! it through a real [`Kernel`].

use c4rt::config::Config;
use c4rt::kernel::Kernel;
use c4rt::loader::writer::ModuleWriter;
use c4rt::mem::WORD_SIZE;

/// Patch a `JMP`/`BZ`/`BNZ`/`JSR` immediate (the word right after `at`, the opcode's own offset)
/// to the absolute runtime address of `target_word_offset` once the module is loaded. Jump/branch
/// targets are absolute addresses (`vm.pc = imm as u64`), so unlike a plain constant they must go
/// through a CODE relocation rather than being written as a literal.
pub fn patch_jump(w: &mut ModuleWriter, at: i64, target_word_offset: i64) {
    w.add_code_patch(at + 1, target_word_offset * WORD_SIZE as i64);
}

/// Same idea for an `IMM` immediate that is meant to evaluate to a code address (e.g. a signal
/// handler PC passed to the `SIGNAL` syscall) rather than a plain numeric constant.
pub fn patch_code_address(w: &mut ModuleWriter, imm_at: i64, target_word_offset: i64) {
    w.add_code_patch(imm_at + 1, target_word_offset * WORD_SIZE as i64);
}

/// Patch an `IMM` immediate to the absolute runtime address of a byte offset into the data
/// segment. Data patches carry their byte offset through unmodified (spec.md §8 property 6), so
/// unlike [`patch_jump`]/[`patch_code_address`] there is no word-to-byte scaling here.
pub fn patch_data_address(w: &mut ModuleWriter, imm_at: i64, data_byte_offset: i64) {
    w.add_data_patch(imm_at + 1, data_byte_offset);
}

/// A kernel with calibration skipped and a small, deterministic cycle interval — scenario tests
/// care about scheduling behavior, not measuring the host's real instructions-per-second rate.
pub fn test_kernel(forced_cycle_interval: u64) -> Kernel {
    let config = Config {
        skip_calibration: true,
        forced_cycle_interval: Some(forced_cycle_interval),
        ..Config::default()
    };
    Kernel::new(config).expect("kernel boots")
}
