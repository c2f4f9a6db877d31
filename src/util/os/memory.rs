/// Strategy for performing mmap
#[derive(Debug, Copy, Clone)]
pub struct MmapStrategy {
    /// Whether the mapping is shared with processes forked after it is created. Private mappings
    /// are copied on write in the child and are useless for cross-process structures.
    pub shared: bool,
    /// The protection flags for mmap.
    pub prot: MmapProtection,
    /// Whether this mmap reserves swap space / physical memory up front.
    pub reserve: bool,
}

impl std::default::Default for MmapStrategy {
    fn default() -> Self {
        Self {
            shared: false,
            prot: MmapProtection::ReadWrite,
            reserve: true,
        }
    }
}

impl MmapStrategy {
    /// Create a new strategy
    pub fn new(shared: bool, prot: MmapProtection, reserve: bool) -> Self {
        Self {
            shared,
            prot,
            reserve,
        }
    }

    // Builder methods

    /// Set the shared flag.
    pub fn shared(self, shared: bool) -> Self {
        Self { shared, ..self }
    }

    /// Set protection option.
    pub fn prot(self, prot: MmapProtection) -> Self {
        Self { prot, ..self }
    }

    /// Set the reserve flag.
    pub fn reserve(self, reserve: bool) -> Self {
        Self { reserve, ..self }
    }

    /// The strategy for structures that both the mutator and the service process touch: card
    /// tables, bitmaps and the shared region.
    pub const SHARED_METADATA: Self = Self {
        shared: true,
        prot: MmapProtection::ReadWrite,
        reserve: true,
    };

    /// The strategy for memory only the current process touches.
    pub const PRIVATE: Self = Self {
        shared: false,
        prot: MmapProtection::ReadWrite,
        reserve: true,
    };
}

/// The protection flags for Mmap
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmapProtection {
    /// Allow read + write
    ReadWrite,
    /// Allow read only
    ReadOnly,
    /// Do not allow any access
    NoAccess,
}

impl MmapProtection {
    pub(crate) fn get_native_flags(&self) -> i32 {
        use libc::{PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::ReadOnly => PROT_READ,
            Self::NoAccess => PROT_NONE,
        }
    }
}

/// Annotation for an mmap entry.
///
/// This is for debugging.  On Linux, we use `prctl` with `PR_SET_VMA` to set the human-readable
/// name for anonymous mappings, so `/proc/<pid>/maps` of both the mutator and the service process
/// show what each shared mapping holds.  The annotation is ignored on other platforms.
pub enum MmapAnnotation<'a> {
    /// The mapping backs a card table.
    CardTable {
        /// The name of the heap the card table covers.
        heap: &'a str,
    },
    /// The mapping backs a space bitmap.
    Bitmap {
        /// The name of the bitmap.
        name: &'a str,
    },
    /// The mapping is the shared region.
    SharedRegion,
    /// The mmap is for a test case.  Usually constructed using the [`mmap_anno_test!`] macro.
    Test {
        /// The source file.
        file: &'a str,
        /// The line number.
        line: u32,
    },
    /// For all other use cases.
    Misc {
        /// A human-readable descriptive name.
        name: &'a str,
    },
}

/// Construct an `MmapAnnotation::Test` with the current file name and line number.
#[macro_export]
macro_rules! mmap_anno_test {
    () => {
        &$crate::util::os::MmapAnnotation::Test {
            file: file!(),
            line: line!(),
        }
    };
}

// Export this to external crates
pub use mmap_anno_test;

impl std::fmt::Display for MmapAnnotation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MmapAnnotation::CardTable { heap } => write!(f, "gcservice:cardtable:{heap}"),
            MmapAnnotation::Bitmap { name } => write!(f, "gcservice:bitmap:{name}"),
            MmapAnnotation::SharedRegion => write!(f, "gcservice:shared-region"),
            MmapAnnotation::Test { file, line } => write!(f, "gcservice:test:{file}:{line}"),
            MmapAnnotation::Misc { name } => write!(f, "gcservice:misc:{name}"),
        }
    }
}
