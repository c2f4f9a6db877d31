use std::sync::Arc;

use crate::build_info;
use crate::collector::shared::SharedHeapHeader;
use crate::ipc::{SharedRef, SharedRegion};
use crate::util::options::Options;
use crate::vm::VMBinding;

/// Builds a [`GcContext`]. Options start from their defaults plus `GCSERVICE_` environment
/// variables and can be overridden before [`GcContextBuilder::build`].
pub struct GcContextBuilder {
    options: Options,
}

impl GcContextBuilder {
    pub fn new() -> Self {
        GcContextBuilder {
            options: Options::default(),
        }
    }

    /// Set an option by name. Returns false if the name is unknown or the value invalid.
    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        self.options.set_from_str(name, value)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// Create the shared region and the shared header. Must happen before any cooperating process
    /// is forked, since the region is only reachable by inheritance.
    pub fn build<VM: VMBinding>(self, binding: VM) -> GcContext<VM> {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("gcservice initialized the logger."),
            Err(_) => debug!(
                "gcservice failed to initialize the built-in env_logger. This is not an error if a logger has been set before."
            ),
        }
        info!(
            "gcservice {} (features: {})",
            build_info::GCSERVICE_PKG_VERSION,
            build_info::GCSERVICE_FEATURES
        );
        debug!("gcservice git version: {}", *build_info::GCSERVICE_GIT_VERSION);
        let region = SharedRegion::create(self.options.shared_region_size)
            .unwrap_or_else(|e| fatal!("Failed to create the shared region: {}", e));
        let header = region.alloc_zeroed::<SharedHeapHeader>();
        GcContext {
            options: Arc::new(self.options),
            region,
            header,
            binding: Arc::new(binding),
        }
    }
}

impl Default for GcContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a process needs to take part in collection: its options, the shared region and
/// header, and the runtime binding. Passed explicitly to the heap and the service.
pub struct GcContext<VM: VMBinding> {
    options: Arc<Options>,
    region: Arc<SharedRegion>,
    header: SharedRef<SharedHeapHeader>,
    binding: Arc<VM>,
}

impl<VM: VMBinding> GcContext<VM> {
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn header(&self) -> &SharedHeapHeader {
        &self.header
    }

    pub fn binding(&self) -> &VM {
        &self.binding
    }
}

impl<VM: VMBinding> Clone for GcContext<VM> {
    fn clone(&self) -> Self {
        GcContext {
            options: self.options.clone(),
            region: self.region.clone(),
            header: self.header.clone(),
            binding: self.binding.clone(),
        }
    }
}
