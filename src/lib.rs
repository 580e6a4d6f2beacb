//! A single flat-address-space, single-heap cooperative+preemptive multitasking runtime for a
//! small stack-based bytecode (spec.md §1).
//!
//! `vm` is the interpreter core, `loader` turns a relocatable C4R image into a running module in
//! the shared [`mem::Memory`] arena, and `kernel` ties both together with a task table, scheduler,
//! and syscall surface. `main.rs` is the thin CLI front end.

#[macro_use]
extern crate log;

pub mod config;
pub mod kernel;
pub mod loader;
pub mod mem;
pub mod vm;
