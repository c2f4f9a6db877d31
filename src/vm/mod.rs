//! The interface to the runtime: everything the collector needs from the outside world.

mod collection;
mod scanning;

pub use self::collection::Collection;
pub use self::scanning::Scanning;

/// A runtime binding. Implemented for every type that implements both halves of the interface.
pub trait VMBinding: Collection + Scanning {}

impl<T: Collection + Scanning> VMBinding for T {}
