//! The collector: kinds of collection, the phase protocol both processes follow, and the two
//! sides of it. [`IPCHeap`] runs cycles in the mutator process; [`GcService`] marks for it from the
//! service process.

mod gc_type;
mod heap;
mod marking;
mod phase;
mod service;
mod session;
pub mod shared;
mod space;

pub use self::gc_type::{CollectorConfig, GcRetentionPolicy, GcType};
pub use self::heap::{AllocationError, CycleStats, IPCHeap};
pub use self::phase::GcPhase;
pub use self::service::GcService;
pub use self::session::CollectorSession;
pub use self::space::Space;
