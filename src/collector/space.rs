use std::ops::Range;
use std::sync::Arc;

use super::gc_type::GcRetentionPolicy;
use crate::accounting::{SpaceBitmap, SpaceBitmapRecord};
use crate::ipc::SharedRegion;
use crate::util::Address;

const MAX_SPACE_NAME: usize = 32;

/// A space as described in shared memory. Written once when the space is registered.
#[repr(C)]
pub struct SpaceRecord {
    name: [u8; MAX_SPACE_NAME],
    begin: Address,
    limit: Address,
    alignment: usize,
    retention: u8,
    /// The two bitmaps of the space. Which one is live and which one is mark is recorded in the
    /// heap bitmap records of the shared header.
    bitmaps: [SpaceBitmapRecord; 2],
}

/// A range of the heap whose objects share a retention policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Space {
    index: usize,
    name: String,
    begin: Address,
    limit: Address,
    alignment: usize,
    retention: GcRetentionPolicy,
    discontinuous: bool,
}

impl Space {
    pub(crate) fn new_continuous(
        index: usize,
        name: &str,
        begin: Address,
        limit: Address,
        alignment: usize,
        retention: GcRetentionPolicy,
    ) -> Space {
        Space {
            index,
            name: name.to_string(),
            begin,
            limit,
            alignment,
            retention,
            discontinuous: false,
        }
    }

    /// A space whose objects may be anywhere outside the continuous spaces, such as a large
    /// object space.
    pub(crate) fn new_discontinuous(name: &str, alignment: usize, retention: GcRetentionPolicy) -> Space {
        Space {
            index: usize::MAX,
            name: name.to_string(),
            begin: Address::ZERO,
            limit: Address::MAX,
            alignment,
            retention,
            discontinuous: true,
        }
    }

    /// Position in the shared space registry. Meaningless for a discontinuous space.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    pub fn range(&self) -> Range<Address> {
        self.begin..self.limit
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn retention(&self) -> GcRetentionPolicy {
        self.retention
    }

    pub fn is_discontinuous(&self) -> bool {
        self.discontinuous
    }

    pub fn contains(&self, addr: Address) -> bool {
        !self.discontinuous && addr >= self.begin && addr < self.limit
    }

    /// Create the two bitmaps of a continuous space in the shared region and the record that
    /// describes them.
    pub(crate) fn create_bitmaps(&self, region: &Arc<SharedRegion>) -> ([Arc<SpaceBitmap>; 2], SpaceRecord) {
        debug_assert!(!self.discontinuous);
        let capacity = self.limit - self.begin;
        let make = |suffix: &str| {
            Arc::new(SpaceBitmap::create_in_region(
                region,
                &format!("{} {} bitmap", self.name, suffix),
                self.begin,
                capacity,
                self.alignment,
            ))
        };
        let bitmaps = [make("0"), make("1")];
        let mut name = [0u8; MAX_SPACE_NAME];
        let len = self.name.len().min(MAX_SPACE_NAME);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        let record = SpaceRecord {
            name,
            begin: self.begin,
            limit: self.limit,
            alignment: self.alignment,
            retention: self.retention as u8,
            bitmaps: [
                Self::bitmap_record(&bitmaps[0]),
                Self::bitmap_record(&bitmaps[1]),
            ],
        };
        (bitmaps, record)
    }

    fn bitmap_record(bitmap: &SpaceBitmap) -> SpaceBitmapRecord {
        bitmap
            .record()
            .unwrap_or_else(|| fatal!("Bitmap {} is not in the shared region", bitmap))
    }

    /// Rebuild a space and views of its bitmaps from its shared record.
    pub(crate) fn open(
        region: &Arc<SharedRegion>,
        index: usize,
        record: &SpaceRecord,
    ) -> (Space, [Arc<SpaceBitmap>; 2]) {
        let end = record.name.iter().position(|&b| b == 0).unwrap_or(MAX_SPACE_NAME);
        let name = String::from_utf8_lossy(&record.name[..end]).into_owned();
        let retention = GcRetentionPolicy::from_u8(record.retention)
            .unwrap_or_else(|| fatal!("Space {} has invalid retention {}", name, record.retention));
        let open = |i: usize| {
            Arc::new(SpaceBitmap::from_record(
                region,
                &format!("{} {} bitmap", name, i),
                &record.bitmaps[i],
            ))
        };
        let bitmaps = [open(0), open(1)];
        let space = Space::new_continuous(index, &name, record.begin, record.limit, record.alignment, retention);
        (space, bitmaps)
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.discontinuous {
            write!(f, "{} (discontinuous, {})", self.name, self.retention)
        } else {
            write!(f, "{} [{}, {}) {}", self.name, self.begin, self.limit, self.retention)
        }
    }
}
