//! The task table, scheduler driver, and syscall dispatch loop (spec.md §4.4-§4.6).
//!
//! `Kernel` plays the role Design Notes §9 recommends: "model [global mutable state] as fields
//! of one value owned by `main`, passed into handlers explicitly." There is no bytecode
//! equivalent of the original `c4ke.c` kernel in this build — `Kernel` *is* the kernel, written as
//! host Rust, the way `NoRa32` in `lib.rs` owns every peripheral directly rather than running a
//! firmware image for them.

pub mod scheduler;
pub mod signal;
pub mod syscalls;
pub mod task;

use std::time::{Duration, Instant};

use c4rt_abi::opcode::Op;
use c4rt_abi::signal::Signal;
use c4rt_abi::Word;
use log::{debug, error, info, warn};

use crate::config::{Config, MIN_CYCLE_INTERVAL, TARGET_INTERRUPTS_PER_SEC};
use crate::loader::{LoadError, Module};
use crate::mem::{Memory, WORD_SIZE};
use crate::vm::trap::TrapType;
use crate::vm::{StepOutcome, Vm};

use task::{Accounting, Privilege, SavedRegisters, Task, TaskState, WaitState};

/// Per-task stack size. Not spec-mandated; a fixed generous default keeps the bootstrap simple.
const STACK_WORDS: u64 = 16 * 1024;
/// Negative exit code recorded for a task killed by a runtime fault (spec.md §7).
const FAULT_EXIT_CODE: i64 = -1;
/// Negative exit code recorded for a task terminated by an unhandled signal (spec.md §7).
const SIGNAL_EXIT_CODE: i64 = -2;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("no free task slot")]
    NoFreeSlot,
    #[error("no such process: {0}")]
    NoSuchProcess(i64),
    #[error(transparent)]
    Mem(#[from] crate::mem::MemError),
    #[error("the kernel's own trap handling faulted: {0}")]
    Unrecoverable(String),
}

pub struct Kernel {
    pub vm: Vm,
    pub mem: Memory,
    tasks: Vec<Option<Task>>,
    scheduler: scheduler::Scheduler,
    /// Index into `tasks` of the currently-live task, if any has ever run.
    current: Option<usize>,
    /// Set by `TASK_FOCUS`; the task that receives forwarded host signals (spec.md §4.6).
    pub focus_task: Option<i64>,
    next_pid: i64,
    pub config: Config,
    boot_time: Instant,
    /// One-shot hint set by `YIELD_TO`, consumed by the next `schedule()` (spec.md §6.2 [ADD]).
    yield_hint: Option<i64>,
    /// Set by `REQUEST_EXCLUSIVE` to `(holder pid, interval at the time)`, cleared by
    /// `RELEASE_EXCLUSIVE` (spec.md §6.2). `terminate()` also clears it, restoring the interval,
    /// if the holder dies (faults or is killed) before releasing — otherwise a dead task would
    /// leave preemption disabled kernel-wide forever.
    critical_section: Option<(i64, u64)>,
    /// `(address, length)` of every outstanding `TASKS_EXPORT` snapshot, keyed by its own address
    /// (doubling as the `kti` handle returned to guest code).
    task_snapshots: std::collections::HashMap<u64, u64>,
}

impl Kernel {
    pub fn new(config: Config) -> Result<Kernel, KernelError> {
        let mut mem = Memory::new(1 << 20);

        // A lone `TLEV` cell every trap frame's `&TLEV` slot points at.
        let tlev_cell = mem.alloc(WORD_SIZE as u64, WORD_SIZE as u64)?;
        mem.write_word(tlev_cell, c4rt_abi::opcode::encode(Op::Tlev))?;

        // The relay stub: built once at boot, not per-trap. `KTRAP` bubbles to the host; the
        // trailing `LEV` (reached only once the host leaves registers alone) lands on the `TLEV`
        // cell above and resumes the interrupted task with its registers intact.
        let stub_base = mem.alloc(4 * WORD_SIZE as u64, WORD_SIZE as u64)?;
        mem.write_word(stub_base, c4rt_abi::opcode::encode(Op::Ent))?;
        mem.write_word(stub_base + WORD_SIZE as u64, 0)?;
        mem.write_word(stub_base + 2 * WORD_SIZE as u64, c4rt_abi::opcode::encode(Op::Ktrap))?;
        mem.write_word(stub_base + 3 * WORD_SIZE as u64, c4rt_abi::opcode::encode(Op::Lev))?;

        let mut vm = Vm::new(tlev_cell);
        vm.trap_handler_pc = Some(stub_base);
        vm.cycle_handler_pc = Some(stub_base);
        vm.signal_forwarder_pc = Some(stub_base);
        vm.cycle_interval = config
            .forced_cycle_interval
            .unwrap_or(MIN_CYCLE_INTERVAL * 10);

        let task_table_size = config.task_table_size;
        Ok(Kernel {
            vm,
            mem,
            tasks: (0..task_table_size).map(|_| None).collect(),
            scheduler: scheduler::Scheduler::new(),
            current: None,
            focus_task: None,
            next_pid: 1,
            config,
            boot_time: Instant::now(),
            yield_hint: None,
            critical_section: None,
            task_snapshots: std::collections::HashMap::new(),
        })
    }

    /// Measure cycles-per-second empirically and set the interval to hit
    /// `TARGET_INTERRUPTS_PER_SEC`, clamped to `MIN_CYCLE_INTERVAL` (spec.md §4.4 "Preemption
    /// interval"). Skipped when `-m` is passed or `-c` forced an explicit interval.
    pub fn calibrate(&mut self) {
        if self.config.skip_calibration || self.config.forced_cycle_interval.is_some() {
            return;
        }

        let window = Duration::from_millis(50);
        let mut mem = Memory::new(64);
        mem.write_word(0, c4rt_abi::opcode::encode(Op::Jmp)).unwrap();
        mem.write_word(8, 0).unwrap();
        let mut probe = Vm::new(0);
        probe.pc = 0;
        probe.sp = 64;
        probe.bp = 64;

        let start = Instant::now();
        let mut cycles: u64 = 0;
        while start.elapsed() < window {
            for _ in 0..10_000 {
                probe.step(&mut mem);
            }
            cycles += 10_000;
        }

        let elapsed_ms = start.elapsed().as_millis().max(1) as u64; // clamp: Design Notes §9
        let cycles_per_sec = cycles * 1000 / elapsed_ms;
        let interval = (cycles_per_sec / TARGET_INTERRUPTS_PER_SEC).max(MIN_CYCLE_INTERVAL);
        info!("calibrated cycle interval to {interval} ({cycles_per_sec} cycles/sec measured)");
        self.vm.cycle_interval = interval;
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.tasks.iter().position(|t| t.is_none())
    }

    fn find_pid(&self, pid: i64) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| matches!(t, Some(task) if task.id == pid))
    }

    pub fn task_by_pid(&self, pid: i64) -> Option<&Task> {
        self.find_pid(pid).and_then(|i| self.tasks[i].as_ref())
    }

    fn now_ms(&self) -> u64 {
        self.boot_time.elapsed().as_millis() as u64
    }

    /// Start a task loading `module_bytes` (or no module, for a privileged helper), with `argv`
    /// packed onto its fresh stack. Returns the new pid (spec.md §4.4 `start_task`).
    pub fn start_task(
        &mut self,
        name: &str,
        privilege: Privilege,
        module_bytes: Option<&[u8]>,
        argv: &[String],
        nice_base: i32,
    ) -> Result<i64, KernelError> {
        let slot = self.find_free_slot().ok_or(KernelError::NoFreeSlot)?;

        let module = module_bytes
            .map(|bytes| Module::parse(bytes, &mut self.mem))
            .transpose()?;
        let entry = module.as_ref().and_then(|m| m.entry).unwrap_or(0);

        let stack_base = self.mem.alloc(STACK_WORDS * WORD_SIZE as u64, WORD_SIZE as u64)?;
        let stack_top = stack_base + STACK_WORDS * WORD_SIZE as u64;

        let packed_len = argv.len() * WORD_SIZE + argv.iter().map(|s| s.len() + 1).sum::<usize>();
        let argv_base = self.mem.alloc(packed_len.max(1) as u64, WORD_SIZE as u64)?;
        let packed_argv = pack_argv(argv, argv_base);
        self.mem.write_slice(argv_base, &packed_argv)?;

        // Seed the stack so a normal `return` from `entry` falls into `EXIT` (spec.md §4.4
        // "seeds the stack so that ... the next opcode executed is TASK_FINISH"). `EXIT` is a
        // base opcode rather than bytecode here — one code cell holding it stands in for the
        // bytecode `TASK_FINISH` stub the original kernel would have compiled.
        let finish_cell = self.mem.alloc(WORD_SIZE as u64, WORD_SIZE as u64)?;
        self.mem
            .write_word(finish_cell, c4rt_abi::opcode::encode(Op::Exit))?;

        let mut sp = stack_top;
        sp -= WORD_SIZE as u64;
        self.mem.write_word(sp, argv.len() as Word)?; // argc
        sp -= WORD_SIZE as u64;
        self.mem.write_word(sp, argv_base as Word)?; // argv
        sp -= WORD_SIZE as u64;
        self.mem.write_word(sp, finish_cell as Word)?; // return address

        let pid = self.next_pid;
        self.next_pid += 1;

        self.tasks[slot] = Some(Task {
            id: pid,
            parent_id: self.current.and_then(|i| self.tasks[i].as_ref()).map(|t| t.id).unwrap_or(0),
            name: name.to_string(),
            privilege,
            state: TaskState::LOADED | TaskState::RUNNING,
            saved: SavedRegisters {
                a: 0,
                bp: sp,
                sp,
                pc: entry,
            },
            entry_pc: entry,
            stack_base,
            stack_len: STACK_WORDS * WORD_SIZE as u64,
            argv_base,
            argv_len: packed_argv.len() as u64,
            module,
            wait: WaitState::None,
            signals: signal::SignalTable::default(),
            accounting: Accounting {
                nice_base,
                nice: nice_base,
                ..Default::default()
            },
            mailbox: None,
            exit_code: None,
            files: Vec::new(),
        });

        info!("started task {pid} ({name}) at entry {entry:#x}");
        Ok(pid)
    }

    /// Run every constructor in table order for `pid`'s module (spec.md §4.3 "Execute").
    /// Unused for the init module in this core (constructors run as ordinary code before `main`
    /// in the original system); kept as a direct entry point for library-style modules loaded
    /// via `START_C4R`.
    pub fn run_constructors(&mut self, _pid: i64) {
        // Constructors execute as ordinary instructions once a task starts at its module's
        // declared entry; this core does not synthesize a separate constructor-calling
        // trampoline, since the VM has no notion of "call and return to host" outside traps.
    }

    /// Drive the VM until the task identified by `init_pid` reaches `ZOMBIE`, then return its
    /// exit code. This is the kernel's main loop (spec.md §2 "the VM executes that task until a
    /// trap ... lands in a kernel-provided handler").
    pub fn run_until_exit(&mut self, init_pid: i64) -> i64 {
        if self.current.is_none() {
            self.current = self.find_pid(init_pid);
            if let Some(i) = self.current {
                let t = self.tasks[i].as_ref().unwrap();
                self.vm.install(t.saved.pc, t.saved.sp, t.saved.bp, t.saved.a);
            }
        }

        loop {
            if let Some(code) = self.task_by_pid(init_pid).and_then(|t| t.exit_code) {
                return code;
            }

            let Some(cur) = self.current else {
                self.idle_tick();
                continue;
            };

            match self.vm.step(&mut self.mem) {
                StepOutcome::Continue => {
                    if let Some(task) = self.tasks[cur].as_mut() {
                        task.accounting.cycles_executed += 1;
                    }
                }
                StepOutcome::BaseSyscall(op) => self.handle_base_syscall(cur, op),
                StepOutcome::Syscall(id) => syscalls::dispatch(self, cur, id),
                StepOutcome::KernelTrap => self.handle_kernel_trap(cur),
                StepOutcome::Fault(reason) => {
                    error!("unrecoverable kernel fault: {reason}");
                    return FAULT_EXIT_CODE;
                }
            }
        }
    }

    fn idle_tick(&mut self) {
        std::thread::sleep(Duration::from_millis(1));
        self.reap_zombies();
        self.schedule_next();
    }

    /// Release every owned resource of each `ZOMBIE` slot, returning it to `None` (spec.md §4.4
    /// "the idle task reaps ZOMBIE tasks ... freeing all owned memory").
    pub fn reap_zombies(&mut self) {
        for slot in self.tasks.iter_mut() {
            let is_zombie = matches!(slot, Some(t) if t.state.contains(TaskState::ZOMBIE));
            if !is_zombie {
                continue;
            }
            let task = slot.take().unwrap();
            if let Some(module) = &task.module {
                module.free(&mut self.mem);
            }
            self.mem.free(task.stack_base, task.stack_len);
            self.mem.free(task.argv_base, task.argv_len.max(1));
            debug!("reaped task {} ({})", task.id, task.name);
        }
    }

    /// Read `type`/`parameter` out of the frame the relay stub is sitting on top of, per the
    /// push order in `vm::trap::trigger_trap`.
    fn read_kernel_trap_frame(&self) -> (TrapType, Word) {
        let base = self.vm.bp;
        let w = WORD_SIZE as u64;
        let parameter = self.mem.read_word(base + 6 * w).unwrap_or(0);
        let type_word = self.mem.read_word(base + 7 * w).unwrap_or(0);
        let trap_type = match type_word {
            0 => TrapType::Illop,
            1 => TrapType::HardIrq,
            2 => TrapType::Segv,
            3 => TrapType::Opv,
            _ => TrapType::HostSignal,
        };
        (trap_type, parameter)
    }

    fn handle_kernel_trap(&mut self, cur: usize) {
        let (trap_type, parameter) = self.read_kernel_trap_frame();

        match trap_type {
            TrapType::HardIrq => self.context_switch(cur),
            TrapType::Illop | TrapType::Segv | TrapType::Opv => {
                let pc_hint = self
                    .tasks
                    .get(cur)
                    .and_then(|t| t.as_ref())
                    .and_then(|t| t.module.as_ref())
                    .and_then(|m| m.symbol_for_pc(self.vm.pc))
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| "<unknown>".to_string());
                error!(
                    "task {} faulted: {trap_type:?} param={parameter:#x} near symbol {pc_hint}",
                    self.tasks[cur].as_ref().map(|t| t.id).unwrap_or(-1)
                );
                self.terminate(cur, FAULT_EXIT_CODE);
                self.context_switch(cur);
            }
            TrapType::HostSignal => {
                if let Some(focus_pid) = self.focus_task {
                    if let Some(i) = self.find_pid(focus_pid) {
                        self.internal_signal(i, Signal::Int);
                    }
                }
                // Registers are untouched; the stub's trailing LEV+TLEV resume `cur` directly.
            }
            TrapType::Signal => unreachable!("signal injection never routes through the relay stub"),
        }
    }

    fn handle_base_syscall(&mut self, cur: usize, op: Op) {
        syscalls::dispatch_base(self, cur, op);
    }

    /// Save the live registers into the outgoing task, then run [`Kernel::schedule_next`]
    /// (spec.md §4.4 "Context switch").
    pub fn context_switch(&mut self, outgoing: usize) {
        if let Some(task) = self.tasks[outgoing].as_mut() {
            task.saved = SavedRegisters {
                a: self.vm.a,
                bp: self.vm.bp,
                sp: self.vm.sp,
                pc: self.vm.pc,
            };
        }
        self.schedule_next();
    }

    /// Pick the next runnable task via the scheduler (honoring a pending `YIELD_TO` hint),
    /// deliver any pending signal into it, and install its registers as live. Tasks killed
    /// outright by an unhandled fatal signal are skipped and the search repeats. Shared by
    /// `context_switch` (there's a live outgoing task to save first) and `idle_tick` (there isn't
    /// one — every task was already waiting or the table is empty).
    fn schedule_next(&mut self) {
        scheduler::Scheduler::wake_timed_out(&mut self.tasks, self.now_ms());

        loop {
            let next = if let Some(hint_pid) = self.yield_hint.take() {
                self.find_pid(hint_pid)
                    .filter(|&i| self.tasks[i].as_ref().map(|t| t.is_runnable()).unwrap_or(false))
            } else {
                None
            }
            .or_else(|| self.scheduler.find_runnable(&mut self.tasks));

            let Some(next) = next else {
                self.current = None;
                return;
            };

            // Deliver any pending signal into the incoming task before it resumes (spec.md §4.4
            // step 3).
            let pending = self.tasks[next]
                .as_mut()
                .filter(|t| t.signals.has_pending())
                .and_then(|t| t.signals.take_lowest_pending());

            if let Some((sig, handler)) = pending {
                match handler {
                    Some(handler_pc) => {
                        let saved = self.tasks[next].as_ref().unwrap().saved;
                        self.vm.install(saved.pc, saved.sp, saved.bp, saved.a);
                        if self
                            .vm
                            .inject_signal_trap(&mut self.mem, handler_pc, sig as i64)
                            .is_err()
                        {
                            warn!("failed to inject signal {sig:?} into task {next}");
                        }
                        self.current = Some(next);
                        return;
                    }
                    None => {
                        if signal::default_action(sig) == c4rt_abi::signal::DefaultAction::Terminate {
                            self.terminate(next, SIGNAL_EXIT_CODE);
                            continue;
                        }
                    }
                }
            }

            let saved = self.tasks[next].as_ref().unwrap().saved;
            self.vm.install(saved.pc, saved.sp, saved.bp, saved.a);
            self.current = Some(next);
            return;
        }
    }

    /// Mark a task `ZOMBIE`, record its exit code, and wake every pid-waiter (spec.md §4.4
    /// "Lifecycle").
    pub fn terminate(&mut self, slot: usize, exit_code: i64) {
        let pid = match self.tasks[slot].as_mut() {
            Some(task) => {
                task.state = TaskState::ZOMBIE;
                task.exit_code = Some(exit_code);
                task.id
            }
            None => return,
        };

        if matches!(self.critical_section, Some((holder, _)) if holder == pid) {
            let (_, interval) = self.critical_section.take().unwrap();
            self.vm.cycle_interval = interval;
        }

        for other in self.tasks.iter_mut().flatten() {
            if matches!(other.wait, WaitState::Pid { pid: waited } if waited == pid) {
                other.wait = WaitState::None;
                other.state.remove(TaskState::WAITING);
                other.mailbox = Some(exit_code);
            }
        }
    }

    /// Bump a task's signal counters and wake it if waiting (spec.md §4.6 `internal_signal`).
    pub fn internal_signal(&mut self, target: usize, sig: Signal) {
        if let Some(task) = self.tasks[target].as_mut() {
            task.signals.raise(sig);
            task.wait = WaitState::None;
            task.state.remove(TaskState::WAITING);
        }
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    pub fn tasks(&self) -> &[Option<Task>] {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut [Option<Task>] {
        &mut self.tasks
    }

    /// Whether `SCHEDULE` would actually hand off to a different task right now, for the
    /// "1 if switched else 0" return value (spec.md §6.2) — computed without mutating scheduler
    /// state, since the real switch happens immediately afterward in `context_switch`.
    fn scheduler_would_switch(&self) -> bool {
        let n = self.tasks.len();
        (0..n).any(|i| {
            Some(i) != self.current
                && self.tasks[i].as_ref().map(|t| t.is_runnable()).unwrap_or(false)
        })
    }

    fn set_yield_hint(&mut self, pid: i64) {
        self.yield_hint = Some(pid);
    }

    /// Serialize every non-empty task slot into a fixed-size record table and return its address,
    /// which doubles as the `kti` handle passed back to `TASKS_UPDATE`/`TASKS_FREE` (spec.md §6.2
    /// "Task-listing snapshot for `ps`/`top`").
    pub fn export_task_snapshot(&mut self) -> u64 {
        let bytes = self.render_task_snapshot();
        let addr = match self.mem.alloc(bytes.len() as u64, WORD_SIZE as u64) {
            Ok(a) => a,
            Err(_) => return 0,
        };
        if self.mem.write_slice(addr, &bytes).is_err() {
            return 0;
        }
        self.task_snapshots.insert(addr, bytes.len() as u64);
        addr
    }

    /// Re-render the snapshot. If the task count changed since the handle was created the old
    /// region can no longer hold it; a fresh region is allocated and the caller gets a new handle
    /// back (the ABI only promises the *contents* are current, not a stable address).
    pub fn refresh_task_snapshot(&mut self, kti: u64) -> u64 {
        let Some(&old_len) = self.task_snapshots.get(&kti) else {
            return 0;
        };
        let bytes = self.render_task_snapshot();
        if bytes.len() as u64 == old_len {
            let _ = self.mem.write_slice(kti, &bytes);
            return kti;
        }
        self.mem.free(kti, old_len);
        self.task_snapshots.remove(&kti);
        self.export_task_snapshot()
    }

    pub fn free_task_snapshot(&mut self, kti: u64) {
        if let Some(len) = self.task_snapshots.remove(&kti) {
            self.mem.free(kti, len);
        }
    }

    /// One 64-byte record per live task: `id, parent_id, state bits, nice_base, cycles_executed`
    /// as five words, followed by a 24-byte NUL-padded name.
    const SNAPSHOT_RECORD_LEN: usize = 5 * WORD_SIZE + 24;

    fn render_task_snapshot(&self) -> Vec<u8> {
        let live: Vec<&Task> = self.tasks.iter().flatten().collect();
        let mut out = vec![0u8; WORD_SIZE + live.len() * Self::SNAPSHOT_RECORD_LEN];
        out[0..WORD_SIZE].copy_from_slice(&(live.len() as Word).to_le_bytes());

        for (i, task) in live.iter().enumerate() {
            let base = WORD_SIZE + i * Self::SNAPSHOT_RECORD_LEN;
            let mut w = |k: usize, v: Word| {
                out[base + k * WORD_SIZE..base + (k + 1) * WORD_SIZE].copy_from_slice(&v.to_le_bytes());
            };
            w(0, task.id);
            w(1, task.parent_id);
            w(2, task.state.bits() as Word);
            w(3, task.accounting.nice_base as Word);
            w(4, task.accounting.cycles_executed as Word);

            let name_off = base + 5 * WORD_SIZE;
            let name_bytes = task.name.as_bytes();
            let n = name_bytes.len().min(23);
            out[name_off..name_off + n].copy_from_slice(&name_bytes[..n]);
        }
        out
    }
}

/// Pack argv the way a C `main(argc, argv)` expects: a pointer array followed by NUL-terminated
/// strings, all in one contiguous byte blob (spec.md §3 "argv vector and packed argv bytes").
/// Packs `argv` into one blob: a leading table of `char *`-sized pointers followed by the
/// NUL-terminated strings they point at, ready to be written starting at `argv_base` — a real
/// absolute address in `Memory`'s single shared arena, not an offset relative to the blob, so
/// guest code indexing `argv[i]` and dereferencing the result sees a valid pointer.
fn pack_argv(argv: &[String], argv_base: u64) -> Vec<u8> {
    let ptr_area = argv.len() * WORD_SIZE;
    let mut strings = Vec::new();
    let mut offsets = Vec::with_capacity(argv.len());
    for s in argv {
        offsets.push(argv_base + (ptr_area + strings.len()) as u64);
        strings.extend_from_slice(s.as_bytes());
        strings.push(0);
    }

    let mut out = vec![0u8; ptr_area + strings.len()];
    for (i, &off) in offsets.iter().enumerate() {
        out[i * WORD_SIZE..i * WORD_SIZE + WORD_SIZE]
            .copy_from_slice(&(off as Word).to_le_bytes());
    }
    out[ptr_area..].copy_from_slice(&strings);
    out
}
