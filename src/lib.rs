//! Cross-process garbage collection coordination.
//!
//! A mutator process and a GC service process share one region of memory, created before the
//! service is forked. The mutator owns the heap: it allocates, runs the write barrier into the
//! [card table](accounting::CardTable), and drives each collection cycle through a fixed sequence
//! of [phases](collector::GcPhase). When a service process is attached, the mutator hands it the
//! recursive marking of a cycle and blocks until the service publishes the end of marking.
//!
//! The main entry points are:
//! * [`GcContextBuilder`]: options, and creation of the shared region.
//! * [`collector::IPCHeap`]: the mutator side. Spaces, allocation recording, collections, and the
//!   background GC daemon.
//! * [`collector::GcService`]: the service side.
//! * [`vm::VMBinding`]: what the runtime must provide (thread control, roots, object tracing and
//!   reclamation).
//!
//! The crate only runs on Linux: the inter-process locks are built on futexes.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod util;

pub mod accounting;
mod build_info;
pub mod collector;
mod gc_context;
pub mod ipc;
pub mod vm;

pub use crate::gc_context::{GcContext, GcContextBuilder};
pub use crate::util::Address;
