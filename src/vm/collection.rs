use crate::collector::Space;
use crate::util::Address;

/// Thread control and object reclamation, provided by the runtime that owns the mutators.
pub trait Collection: Send + Sync + 'static {
    /// Stop every mutator thread. Returns once none of them can touch the heap.
    fn stop_all_mutators(&self);

    /// Resume the mutators stopped by [`Collection::stop_all_mutators`].
    fn resume_mutators(&self);

    /// Free `objects`, which are garbage in `space`. Returns the number of bytes freed.
    ///
    /// Called with addresses in ascending order, in batches.
    fn sweep_objects(&self, space: &Space, objects: &[Address]) -> usize;

    /// Drop soft references so their referents become unreachable. Called before the last
    /// collection attempt of an allocation that is about to fail.
    fn clear_soft_references(&self) {}
}
