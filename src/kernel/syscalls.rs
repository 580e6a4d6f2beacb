//! The syscall surface (spec.md §4.5/§6.2), plus the base opcodes the VM recognizes directly.
//!
//! Each handler is a plain function over `&mut Kernel`, matched from [`dispatch`]/
//! [`dispatch_base`] — Design Notes §9's "prefer an enum of syscall kinds matched in the
//! dispatcher" over a function-pointer table, mirrored from how `nr32-common::syscall` documents
//! its register-passed arguments (`/// - a0: ...`), adapted here to stack slots.
//!
//! Arguments sit on the operand stack at the point the syscall opcode is reached: the compiler
//! pushes them in order and cleans the stack up afterward with `ADJ`, so this core reads the
//! first argument at `SP[0]`, the second at `SP[1]*word_size` above it, and so on — zero-indexed,
//! unlike spec.md's descriptive `SP[1], SP[2], ...` prose, which is not meant as a literal offset
//! formula (see DESIGN.md).

use std::fs::File;
use std::io::{Read as IoRead, Write as IoWrite};

use c4rt_abi::error::SysError;
use c4rt_abi::opcode::{Op, SyscallId};
use c4rt_abi::signal::Signal;
use c4rt_abi::Word;
use log::{info, warn};

use crate::mem::WORD_SIZE;

use super::task::{Privilege, TaskState, WaitState};
use super::Kernel;

fn arg(kernel: &Kernel, index: u64) -> Word {
    kernel
        .mem
        .read_word(kernel.vm.sp + index * WORD_SIZE as u64)
        .unwrap_or(0)
}

fn read_cstr(kernel: &Kernel, addr: Word) -> Option<String> {
    if addr <= 0 {
        return None;
    }
    let mut bytes = Vec::new();
    let mut p = addr as u64;
    loop {
        let b = kernel.mem.read_byte(p).ok()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
        p += 1;
        if bytes.len() > 4096 {
            break;
        }
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Entry point for `StepOutcome::Syscall` (spec.md §4.5).
pub fn dispatch(kernel: &mut Kernel, cur: usize, id: SyscallId) {
    let result = match id {
        SyscallId::Schedule => sys_schedule(kernel, cur),
        SyscallId::Sleep => sys_sleep(kernel, cur),
        SyscallId::AwaitPid => sys_await_pid(kernel, cur),
        SyscallId::AwaitMessage => sys_await_message(kernel, cur),
        SyscallId::Pid => sys_pid(kernel, cur),
        SyscallId::Parent => sys_parent(kernel, cur),
        SyscallId::Signal => sys_signal(kernel, cur),
        SyscallId::Kill => sys_kill(kernel, cur),
        SyscallId::StartC4r => sys_start_c4r(kernel, cur),
        SyscallId::TaskFocus => sys_task_focus(kernel, cur),
        SyscallId::TasksExport => sys_tasks_export(kernel, cur),
        SyscallId::TasksUpdate => sys_tasks_update(kernel, cur),
        SyscallId::TasksFree => sys_tasks_free(kernel, cur),
        SyscallId::RequestExclusive => sys_request_exclusive(kernel, cur),
        SyscallId::ReleaseExclusive => sys_release_exclusive(kernel, cur),
        SyscallId::RequestSymbol => sys_request_symbol(kernel, cur),
        SyscallId::GetTaskName => sys_get_task_name(kernel, cur),
        SyscallId::SetPriority => sys_set_priority(kernel, cur),
        SyscallId::YieldTo => sys_yield_to(kernel, cur),
    };

    // `SCHEDULE`/`SLEEP`/`AWAIT_*`/`YIELD_TO` perform their own context switch and must not have
    // `A` clobbered afterward; everything else writes its return word directly.
    if let Some(word) = result {
        kernel.vm.a = word;
    }
}

/// Entry point for `StepOutcome::BaseSyscall` (spec.md §4.1 "base set").
pub fn dispatch_base(kernel: &mut Kernel, cur: usize, op: Op) {
    match op {
        Op::Open => {
            let path_ptr = arg(kernel, 0);
            let word = match read_cstr(kernel, path_ptr).and_then(|p| File::open(p).ok()) {
                Some(file) => {
                    let fd = alloc_fd(kernel, cur, file);
                    fd as Word
                }
                None => SysError::Invalid.as_word(),
            };
            kernel.vm.a = word;
        }
        Op::Read => {
            let fd = arg(kernel, 0);
            let buf_ptr = arg(kernel, 1) as u64;
            let len = arg(kernel, 2).max(0) as usize;
            kernel.vm.a = read_fd(kernel, cur, fd, buf_ptr, len);
        }
        Op::Clos => {
            let fd = arg(kernel, 0);
            kernel.vm.a = close_fd(kernel, cur, fd);
        }
        Op::Prtf => {
            let fmt_ptr = arg(kernel, 0);
            match read_cstr(kernel, fmt_ptr) {
                Some(s) => {
                    print!("{s}");
                    let _ = std::io::stdout().flush();
                    kernel.vm.a = s.len() as Word;
                }
                None => kernel.vm.a = SysError::Invalid.as_word(),
            }
        }
        Op::Malc => {
            let size = arg(kernel, 0).max(0) as u64;
            kernel.vm.a = match kernel.mem.alloc(size, WORD_SIZE as u64) {
                Ok(addr) => addr as Word,
                Err(_) => 0,
            };
        }
        Op::Free => {
            let addr = arg(kernel, 0) as u64;
            let size = arg(kernel, 1).max(0) as u64;
            kernel.mem.free(addr, size);
            kernel.vm.a = 0;
        }
        Op::Mset => {
            let addr = arg(kernel, 0) as u64;
            let val = arg(kernel, 1) as u8;
            let len = arg(kernel, 2).max(0) as usize;
            for i in 0..len as u64 {
                let _ = kernel.mem.write_byte(addr + i, val);
            }
            kernel.vm.a = addr as Word;
        }
        Op::Mcmp => {
            let a = arg(kernel, 0) as u64;
            let b = arg(kernel, 1) as u64;
            let len = arg(kernel, 2).max(0) as usize;
            let mut result = 0i64;
            for i in 0..len as u64 {
                let x = kernel.mem.read_byte(a + i).unwrap_or(0);
                let y = kernel.mem.read_byte(b + i).unwrap_or(0);
                if x != y {
                    result = x as i64 - y as i64;
                    break;
                }
            }
            kernel.vm.a = result;
        }
        Op::Mcpy => {
            let dst = arg(kernel, 0) as u64;
            let src = arg(kernel, 1) as u64;
            let len = arg(kernel, 2).max(0) as usize;
            for i in 0..len as u64 {
                let b = kernel.mem.read_byte(src + i).unwrap_or(0);
                let _ = kernel.mem.write_byte(dst + i, b);
            }
            kernel.vm.a = dst as Word;
        }
        Op::Exit => {
            let code = kernel.vm.a;
            info!("task {} exited with code {code}", kernel.tasks()[cur].as_ref().map(|t| t.id).unwrap_or(-1));
            kernel.terminate(cur, code);
            kernel.context_switch(cur);
        }
        other => unreachable!("{other:?} is not a base syscall"),
    }
}

fn alloc_fd(kernel: &mut Kernel, cur: usize, file: File) -> i64 {
    let Some(task) = kernel.tasks_mut()[cur].as_mut() else {
        return SysError::Invalid.as_word();
    };
    task.files.push(Some(file));
    (task.files.len() - 1) as i64
}

fn read_fd(kernel: &mut Kernel, cur: usize, fd: Word, buf_ptr: u64, len: usize) -> Word {
    if fd < 0 {
        return SysError::Invalid.as_word();
    }
    let mut chunk = vec![0u8; len];
    let n = {
        let Some(task) = kernel.tasks_mut()[cur].as_mut() else {
            return SysError::Invalid.as_word();
        };
        match task.files.get_mut(fd as usize) {
            Some(Some(file)) => file.read(&mut chunk).unwrap_or(0),
            _ => return SysError::Invalid.as_word(),
        }
    };
    let _ = kernel.mem.write_slice(buf_ptr, &chunk[..n]);
    n as Word
}

fn close_fd(kernel: &mut Kernel, cur: usize, fd: Word) -> Word {
    if fd < 0 {
        return SysError::Invalid.as_word();
    }
    let Some(task) = kernel.tasks_mut()[cur].as_mut() else {
        return SysError::Invalid.as_word();
    };
    match task.files.get_mut(fd as usize) {
        Some(slot @ Some(_)) => {
            *slot = None;
            0
        }
        _ => SysError::Invalid.as_word(),
    }
}

fn sys_schedule(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    let switched = kernel.scheduler_would_switch();
    kernel.context_switch(cur);
    kernel.vm.a = switched as Word;
    None
}

fn sys_sleep(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    let ms = arg(kernel, 0).max(0) as u64;
    let now = kernel.now_ms();
    if let Some(task) = kernel.tasks_mut()[cur].as_mut() {
        task.wait = WaitState::Time { deadline_ms: now + ms };
        task.state.insert(TaskState::WAITING);
    }
    kernel.vm.a = 0;
    kernel.context_switch(cur);
    None
}

fn sys_await_pid(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    let pid = arg(kernel, 0);
    match kernel.task_by_pid(pid).and_then(|t| t.exit_code) {
        Some(code) => Some(code),
        None => {
            if kernel.task_by_pid(pid).is_none() {
                return Some(-1);
            }
            if let Some(task) = kernel.tasks_mut()[cur].as_mut() {
                task.wait = WaitState::Pid { pid };
                task.state.insert(TaskState::WAITING);
                task.mailbox = None;
            }
            kernel.context_switch(cur);
            // Woken by `terminate`, which stashed the exit code in `mailbox`.
            let code = kernel.tasks()[cur].as_ref().and_then(|t| t.mailbox).unwrap_or(-1);
            Some(code)
        }
    }
}

fn sys_await_message(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    // Messages are not yet delivered in this core (spec.md §4.4): equivalent to a timed sleep
    // that always reports "no message" on wake.
    let timeout_ms = arg(kernel, 0).max(0) as u64;
    let now = kernel.now_ms();
    if let Some(task) = kernel.tasks_mut()[cur].as_mut() {
        task.wait = WaitState::Message { deadline_ms: now + timeout_ms };
        task.state.insert(TaskState::WAITING);
    }
    kernel.context_switch(cur);
    Some(0)
}

fn sys_pid(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    Some(kernel.tasks()[cur].as_ref().map(|t| t.id).unwrap_or(-1))
}

fn sys_parent(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    Some(kernel.tasks()[cur].as_ref().map(|t| t.parent_id).unwrap_or(-1))
}

fn sys_signal(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    let sig_num = arg(kernel, 0);
    let handler_pc = arg(kernel, 1) as u64;
    let Some(sig) = Signal::from_number(sig_num) else {
        return Some(SysError::Invalid.as_word());
    };
    let Some(task) = kernel.tasks_mut()[cur].as_mut() else {
        return Some(SysError::Invalid.as_word());
    };
    let prev = task.signals.install(sig, handler_pc);
    Some(prev.map(|pc| pc as Word).unwrap_or(0))
}

fn sys_kill(kernel: &mut Kernel, _cur: usize) -> Option<Word> {
    let pid = arg(kernel, 0);
    let sig_num = arg(kernel, 1);
    let Some(sig) = Signal::from_number(sig_num) else {
        return Some(SysError::Invalid.as_word());
    };
    match kernel.find_pid(pid) {
        Some(slot) => {
            kernel.internal_signal(slot, sig);
            Some(0)
        }
        None => Some(-1),
    }
}

fn sys_start_c4r(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    let argc = arg(kernel, 0).max(0) as usize;
    let argv_ptr = arg(kernel, 1) as u64;
    let name_ptr = arg(kernel, 2);
    let privs = arg(kernel, 3);

    let name = read_cstr(kernel, name_ptr).unwrap_or_else(|| "c4r".to_string());
    let mut argv = Vec::with_capacity(argc);
    for i in 0..argc {
        let ptr = kernel.mem.read_word(argv_ptr + (i as u64) * WORD_SIZE as u64).unwrap_or(0);
        argv.push(read_cstr(kernel, ptr).unwrap_or_default());
    }

    let module_path_ptr = if argc > 0 { Some(argv[0].clone()) } else { None };
    let Some(path) = module_path_ptr else {
        return Some(0);
    };
    let Ok(bytes) = std::fs::read(&path) else {
        warn!("START_C4R: could not read {path}");
        return Some(0);
    };

    let privilege = if privs != 0 { Privilege::Kernel } else { Privilege::User };
    let nice_base = kernel.tasks()[cur].as_ref().map(|t| t.accounting.nice_base).unwrap_or(1);
    match kernel.start_task(&name, privilege, Some(&bytes), &argv, nice_base) {
        Ok(pid) => Some(pid),
        Err(e) => {
            warn!("START_C4R failed: {e}");
            Some(0)
        }
    }
}

fn sys_task_focus(kernel: &mut Kernel, _cur: usize) -> Option<Word> {
    let pid = arg(kernel, 0);
    kernel.focus_task = Some(pid);
    Some(0)
}

fn sys_tasks_export(kernel: &mut Kernel, _cur: usize) -> Option<Word> {
    Some(kernel.export_task_snapshot() as Word)
}

fn sys_tasks_update(kernel: &mut Kernel, _cur: usize) -> Option<Word> {
    let kti = arg(kernel, 0) as u64;
    Some(kernel.refresh_task_snapshot(kti) as Word)
}

fn sys_tasks_free(kernel: &mut Kernel, _cur: usize) -> Option<Word> {
    let kti = arg(kernel, 0) as u64;
    kernel.free_task_snapshot(kti);
    Some(0)
}

fn sys_request_exclusive(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    let pid = kernel.tasks()[cur].as_ref().map(|t| t.id).unwrap_or(-1);
    kernel.critical_section = Some((pid, kernel.vm.cycle_interval));
    kernel.vm.cycle_interval = 0;
    Some(0)
}

fn sys_release_exclusive(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    let pid = kernel.tasks()[cur].as_ref().map(|t| t.id).unwrap_or(-1);
    if matches!(kernel.critical_section, Some((holder, _)) if holder == pid) {
        let (_, interval) = kernel.critical_section.take().unwrap();
        kernel.vm.cycle_interval = interval;
    }
    Some(0)
}

fn sys_request_symbol(kernel: &mut Kernel, _cur: usize) -> Option<Word> {
    let name_ptr = arg(kernel, 0);
    let Some(name) = read_cstr(kernel, name_ptr) else {
        return Some(SysError::Invalid.as_word());
    };
    match SyscallId::by_name(&name) {
        Some(id) => Some(c4rt_abi::opcode::encode(Op::Syscall(id))),
        None => Some(SysError::Invalid.as_word()),
    }
}

fn sys_get_task_name(kernel: &mut Kernel, _cur: usize) -> Option<Word> {
    let pid = arg(kernel, 0);
    let name_buf = arg(kernel, 1) as u64;
    let Some(task) = kernel.task_by_pid(pid) else {
        return Some(SysError::NoSuchProcess.as_word());
    };
    let bytes = task.name.as_bytes();
    let mut buf = bytes.to_vec();
    buf.push(0);
    match kernel.mem.write_slice(name_buf, &buf) {
        Ok(()) => Some(bytes.len() as Word),
        Err(_) => Some(SysError::Invalid.as_word()),
    }
}

fn sys_set_priority(kernel: &mut Kernel, _cur: usize) -> Option<Word> {
    let pid = arg(kernel, 0);
    let nice_base = arg(kernel, 1) as i32;
    match kernel.find_pid(pid) {
        Some(slot) => {
            if let Some(task) = kernel.tasks_mut()[slot].as_mut() {
                task.accounting.nice_base = nice_base.max(0);
            }
            Some(0)
        }
        None => Some(SysError::NoSuchProcess.as_word()),
    }
}

fn sys_yield_to(kernel: &mut Kernel, cur: usize) -> Option<Word> {
    let pid = arg(kernel, 0);
    kernel.set_yield_hint(pid);
    kernel.context_switch(cur);
    Some(1)
}
