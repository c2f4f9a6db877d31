//! Operating system services: memory mappings and futex words.
//!
//! Everything the crate asks of the OS goes through here, so that the accounting structures and
//! IPC primitives only deal with [`MemMap`] and [`futex`].

mod imp;
mod mem_map;
mod memory;

pub mod futex;

pub use self::mem_map::{MemMap, MemMapDescriptor};
pub use self::memory::*;

pub(crate) use self::imp::current_thread_id;
