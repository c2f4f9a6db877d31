use std::io::Result;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};

use super::imp;
use super::{MmapAnnotation, MmapProtection, MmapStrategy};
use crate::util::conversions;
use crate::util::Address;

/// Where a mapping lives, in a form that can be written into shared memory and read back by
/// another process. Anonymous mappings have `fd == -1` and can only be reached by inheriting them
/// through `fork`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Zeroable)]
pub struct MemMapDescriptor {
    pub fd: i32,
    pub offset: usize,
    pub size: usize,
}

/// An owned memory mapping, unmapped on drop.
///
/// Mappings that another process must see are created shared
/// ([`MmapStrategy::SHARED_METADATA`] or [`MemMap::map_named_shared`]) before the cooperating
/// process is forked.
pub struct MemMap {
    name: String,
    begin: Address,
    size: usize,
    prot: AtomicU8,
    fd: Option<OwnedFd>,
    /// Unowned descriptor this mapping was attached from.
    attached_fd: Option<RawFd>,
}

impl MemMap {
    /// Map `size` bytes (rounded up to pages) of zero-filled anonymous memory.
    pub fn map_anonymous(
        name: &str,
        size: usize,
        strategy: MmapStrategy,
        annotation: &MmapAnnotation<'_>,
    ) -> Result<MemMap> {
        let size = conversions::page_align_up_bytes(size.max(1));
        let begin = imp::mmap_anonymous(size, strategy)?;
        if !cfg!(feature = "no_mmap_annotation") {
            imp::set_vma_name(begin, size, annotation);
        }
        debug!(
            "Mapped {} [{}, {}) shared={} prot={:?}",
            name,
            begin,
            begin + size,
            strategy.shared,
            strategy.prot
        );
        Ok(MemMap {
            name: name.to_string(),
            begin,
            size,
            prot: AtomicU8::new(prot_to_u8(strategy.prot)),
            fd: None,
            attached_fd: None,
        })
    }

    /// Map `size` bytes of a fresh memory file. Its [`MemMapDescriptor`] lets a process that did
    /// not inherit the mapping attach to it with [`MemMap::attach`].
    pub fn map_named_shared(name: &str, size: usize, prot: MmapProtection) -> Result<MemMap> {
        let size = conversions::page_align_up_bytes(size.max(1));
        let fd = imp::create_shared_fd(name)?;
        imp::ftruncate(fd.as_raw_fd(), size)?;
        let begin = imp::mmap_fd(fd.as_raw_fd(), 0, size, prot)?;
        debug!("Mapped named {} [{}, {})", name, begin, begin + size);
        Ok(MemMap {
            name: name.to_string(),
            begin,
            size,
            prot: AtomicU8::new(prot_to_u8(prot)),
            fd: Some(fd),
            attached_fd: None,
        })
    }

    /// Map the memory described by `descriptor`. The descriptor must come from a named shared
    /// mapping whose file descriptor is valid in this process.
    pub fn attach(name: &str, descriptor: &MemMapDescriptor, prot: MmapProtection) -> Result<MemMap> {
        if descriptor.fd < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "anonymous mappings can only be inherited",
            ));
        }
        let begin = imp::mmap_fd(descriptor.fd, descriptor.offset, descriptor.size, prot)?;
        Ok(MemMap {
            name: name.to_string(),
            begin,
            size: descriptor.size,
            prot: AtomicU8::new(prot_to_u8(prot)),
            fd: None,
            attached_fd: Some(descriptor.fd),
        })
    }

    /// Change the protection of the whole mapping.
    pub fn protect(&self, prot: MmapProtection) -> Result<()> {
        imp::mprotect(self.begin, self.size, prot)?;
        self.prot.store(prot_to_u8(prot), Ordering::Relaxed);
        Ok(())
    }

    pub fn prot(&self) -> MmapProtection {
        u8_to_prot(self.prot.load(Ordering::Relaxed))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn end(&self) -> Address {
        self.begin + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.begin && addr < self.end()
    }

    pub fn descriptor(&self) -> MemMapDescriptor {
        let fd = self
            .fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .or(self.attached_fd)
            .unwrap_or(-1);
        MemMapDescriptor {
            fd,
            offset: 0,
            size: self.size,
        }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        if let Err(e) = imp::munmap(self.begin, self.size) {
            warn!("Failed to unmap {} at {}: {}", self.name, self.begin, e);
        }
    }
}

impl std::fmt::Debug for MemMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MemMap[{}: {}-{} {:?}]",
            self.name,
            self.begin,
            self.end(),
            self.prot()
        )
    }
}

fn prot_to_u8(prot: MmapProtection) -> u8 {
    match prot {
        MmapProtection::ReadWrite => 0,
        MmapProtection::ReadOnly => 1,
        MmapProtection::NoAccess => 2,
    }
}

fn u8_to_prot(v: u8) -> MmapProtection {
    match v {
        0 => MmapProtection::ReadWrite,
        1 => MmapProtection::ReadOnly,
        _ => MmapProtection::NoAccess,
    }
}
