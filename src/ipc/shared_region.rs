use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::Zeroable;

use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions::raw_align_up;
use crate::util::os::{MemMap, MemMapDescriptor, MmapAnnotation, MmapStrategy};
use crate::util::Address;

const REGION_MAGIC: u32 = 0x6763_7372;

/// Lives at offset 0 of the mapping. Every process sharing the mapping bumps the same cursor.
#[repr(C)]
struct RegionHeader {
    magic: AtomicU32,
    size: AtomicUsize,
    cursor: AtomicUsize,
}

const HEADER_SIZE: usize = raw_align_up(size_of::<RegionHeader>(), 64);

/// The location of an allocation in the shared region, relative to the region start. Unlike a
/// pointer, an offset means the same thing in every process sharing the region, so it is what
/// shared records store to refer to each other.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Zeroable)]
pub struct SharedOffset(usize);

impl SharedOffset {
    /// No allocation. The region header occupies offset 0, so no allocation can have it.
    pub const NULL: SharedOffset = SharedOffset(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// A slot in shared memory holding a [`SharedOffset`] that is published after the slot itself was
/// allocated.
#[repr(transparent)]
#[derive(Default, Zeroable)]
pub struct AtomicSharedOffset(AtomicUsize);

impl AtomicSharedOffset {
    pub fn load(&self) -> SharedOffset {
        SharedOffset(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, offset: SharedOffset) {
        self.0.store(offset.0, Ordering::Release)
    }
}

impl std::fmt::Debug for AtomicSharedOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.load())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedRegionError {
    /// The region cannot satisfy an allocation of `requested` bytes.
    Exhausted { requested: usize, remaining: usize },
}

impl std::fmt::Display for SharedRegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharedRegionError::Exhausted {
                requested,
                remaining,
            } => write!(
                f,
                "shared region exhausted: requested {} bytes, {} remaining",
                requested, remaining
            ),
        }
    }
}

impl std::error::Error for SharedRegionError {}

/// A bump allocator over one shared anonymous mapping.
///
/// The region is created once, before any cooperating process exists. Processes forked afterwards
/// inherit the mapping at the same address and can allocate from it as well. Nothing allocated
/// here is ever freed, and nothing is ever dropped: values placed in the region live until the
/// mapping goes away.
pub struct SharedRegion {
    map: MemMap,
}

impl SharedRegion {
    pub fn create(size: usize) -> std::io::Result<Arc<SharedRegion>> {
        let map = MemMap::map_anonymous(
            "shared region",
            size.max(HEADER_SIZE),
            MmapStrategy::SHARED_METADATA,
            &MmapAnnotation::SharedRegion,
        )?;
        let region = SharedRegion { map };
        let header = region.header();
        header.size.store(region.map.size(), Ordering::Relaxed);
        header.cursor.store(HEADER_SIZE, Ordering::Relaxed);
        header.magic.store(REGION_MAGIC, Ordering::Release);
        debug!(
            "Created shared region [{}, {}) of {} bytes",
            region.map.begin(),
            region.map.end(),
            region.map.size()
        );
        Ok(Arc::new(region))
    }

    fn header(&self) -> &RegionHeader {
        unsafe { &*self.map.begin().to_ptr::<RegionHeader>() }
    }

    pub fn begin(&self) -> Address {
        self.map.begin()
    }

    pub fn end(&self) -> Address {
        self.map.end()
    }

    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Bytes allocated so far, including the region header.
    pub fn used(&self) -> usize {
        self.header().cursor.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> usize {
        self.size() - self.used()
    }

    pub fn descriptor(&self) -> MemMapDescriptor {
        self.map.descriptor()
    }

    /// Allocate `size` zeroed bytes aligned to at least a word.
    pub fn try_alloc_raw(&self, size: usize, align: usize) -> Result<SharedOffset, SharedRegionError> {
        let align = align.max(BYTES_IN_WORD);
        debug_assert!(align.is_power_of_two());
        let capacity = self.size();
        let cursor = &self.header().cursor;
        let old = cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let start = raw_align_up(cur, align);
                start
                    .checked_add(size)
                    .filter(|end| *end <= capacity)
            })
            .map_err(|cur| SharedRegionError::Exhausted {
                requested: size,
                remaining: capacity - cur,
            })?;
        let start = raw_align_up(old, align);
        trace!("Shared region: allocated {} bytes at offset {}", size, start);
        Ok(SharedOffset(start))
    }

    /// Place `value` in the region. The value is never dropped.
    pub fn try_alloc<T: Sync>(self: &Arc<Self>, value: T) -> Result<SharedRef<T>, SharedRegionError> {
        let offset = self.try_alloc_raw(size_of::<T>(), align_of::<T>())?;
        unsafe {
            std::ptr::write(self.address_of(offset).to_mut_ptr::<T>(), value);
            Ok(SharedRef::from_offset(self.clone(), offset))
        }
    }

    pub fn alloc<T: Sync>(self: &Arc<Self>, value: T) -> SharedRef<T> {
        self.try_alloc(value)
            .unwrap_or_else(|e| fatal!("Cannot allocate {}: {}", std::any::type_name::<T>(), e))
    }

    /// Allocate a `T` whose bytes are all zero. Fresh region memory is zero-filled and never
    /// reused, so no write is needed.
    pub fn alloc_zeroed<T: Zeroable + Sync>(self: &Arc<Self>) -> SharedRef<T> {
        match self.try_alloc_raw(size_of::<T>(), align_of::<T>()) {
            Ok(offset) => unsafe { SharedRef::from_offset(self.clone(), offset) },
            Err(e) => fatal!("Cannot allocate {}: {}", std::any::type_name::<T>(), e),
        }
    }

    pub fn try_alloc_array<T: Zeroable + Sync>(
        self: &Arc<Self>,
        len: usize,
    ) -> Result<SharedSlice<T>, SharedRegionError> {
        let bytes = size_of::<T>()
            .checked_mul(len)
            .ok_or(SharedRegionError::Exhausted {
                requested: usize::MAX,
                remaining: self.remaining(),
            })?;
        let offset = self.try_alloc_raw(bytes, align_of::<T>())?;
        Ok(unsafe { SharedSlice::from_offset(self.clone(), offset, len) })
    }

    /// Allocate `len` zeroed elements.
    pub fn alloc_array<T: Zeroable + Sync>(self: &Arc<Self>, len: usize) -> SharedSlice<T> {
        self.try_alloc_array(len).unwrap_or_else(|e| {
            fatal!(
                "Cannot allocate {} x {}: {}",
                len,
                std::any::type_name::<T>(),
                e
            )
        })
    }

    /// The address of `size` bytes at `offset`. An offset outside the allocated part of the region
    /// means a shared record is corrupt, which is fatal.
    pub fn resolve(&self, offset: SharedOffset, size: usize) -> Address {
        let used = self.used();
        if offset.0 < HEADER_SIZE || offset.0.checked_add(size).map_or(true, |end| end > used) {
            fatal!(
                "Shared offset {} (+{} bytes) is outside the allocated region [{}, {})",
                offset.0,
                size,
                HEADER_SIZE,
                used
            );
        }
        self.address_of(offset)
    }

    /// The offset of `addr`, which must point into the allocated part of the region.
    pub fn offset_of(&self, addr: Address) -> SharedOffset {
        if addr < self.begin() + HEADER_SIZE || addr >= self.begin() + self.used() {
            fatal!("{} does not point into the shared region", addr);
        }
        SharedOffset(addr - self.begin())
    }

    fn address_of(&self, offset: SharedOffset) -> Address {
        self.begin() + offset.0
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("begin", &self.begin())
            .field("size", &self.size())
            .field("used", &self.used())
            .finish()
    }
}

/// A reference to a `T` in the shared region. Keeps the region mapped.
pub struct SharedRef<T> {
    region: Arc<SharedRegion>,
    offset: SharedOffset,
    _phantom: PhantomData<T>,
}

impl<T> SharedRef<T> {
    /// View the allocation at `offset` as a `T`.
    ///
    /// # Safety
    ///
    /// `offset` must have been allocated for a `T` (or a type with the same layout) and the value
    /// there must be initialized.
    pub unsafe fn from_offset(region: Arc<SharedRegion>, offset: SharedOffset) -> Self {
        region.resolve(offset, size_of::<T>());
        SharedRef {
            region,
            offset,
            _phantom: PhantomData,
        }
    }

    pub fn offset(&self) -> SharedOffset {
        self.offset
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }
}

impl<T> Deref for SharedRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.region.address_of(self.offset).to_ptr::<T>() }
    }
}

impl<T> Clone for SharedRef<T> {
    fn clone(&self) -> Self {
        SharedRef {
            region: self.region.clone(),
            offset: self.offset,
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SharedRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedRef<{}>@{}", std::any::type_name::<T>(), self.offset.0)
    }
}

/// A fixed-length array in the shared region.
pub struct SharedSlice<T> {
    region: Arc<SharedRegion>,
    offset: SharedOffset,
    len: usize,
    _phantom: PhantomData<T>,
}

impl<T> SharedSlice<T> {
    /// # Safety
    ///
    /// `offset` must have been allocated for `len` initialized values of type `T`.
    pub unsafe fn from_offset(region: Arc<SharedRegion>, offset: SharedOffset, len: usize) -> Self {
        region.resolve(offset, size_of::<T>() * len);
        SharedSlice {
            region,
            offset,
            len,
            _phantom: PhantomData,
        }
    }

    pub fn offset(&self) -> SharedOffset {
        self.offset
    }

    pub fn address(&self) -> Address {
        self.region.address_of(self.offset)
    }
}

impl<T> Deref for SharedSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.address().to_ptr::<T>(), self.len) }
    }
}

impl<T> Clone for SharedSlice<T> {
    fn clone(&self) -> Self {
        SharedSlice {
            region: self.region.clone(),
            offset: self.offset,
            len: self.len,
            _phantom: PhantomData,
        }
    }
}
