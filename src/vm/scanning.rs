use crate::util::Address;

/// Root enumeration and object tracing, provided by the runtime that owns the object layout.
///
/// Visitors take object addresses. Every address passed to a visitor must be the start of an
/// object aligned to its space's alignment.
pub trait Scanning: Send + Sync + 'static {
    /// Report the roots held by mutator threads. When the world is not stopped, the runtime runs
    /// this as a checkpoint on each thread.
    fn scan_thread_roots(&self, visitor: &mut dyn FnMut(Address));

    /// Report roots not held by any thread.
    fn scan_global_roots(&self, visitor: &mut dyn FnMut(Address));

    /// Report referents of soft references that should be kept alive in this collection.
    fn scan_soft_references(&self, _visitor: &mut dyn FnMut(Address)) {}

    /// Report every object referenced by `object`.
    ///
    /// The service process calls this too, so it may only read memory the two processes share.
    fn scan_object(&self, object: Address, visitor: &mut dyn FnMut(Address));
}
