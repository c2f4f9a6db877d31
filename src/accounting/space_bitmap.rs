use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ipc::{SharedOffset, SharedRegion, SharedSlice};
use crate::util::constants::{BITS_IN_WORD, BYTES_IN_WORD, WORD_HIGH_BIT};
use crate::util::conversions::raw_align_up;
use crate::util::os::{MemMap, MmapAnnotation, MmapStrategy};
use crate::util::rust_util::atomically;
use crate::util::Address;

/// Bits of a word at slot `n` and after.
fn slots_from(n: usize) -> usize {
    usize::MAX.checked_shr(n as u32).unwrap_or(0)
}

/// Bits of a word before slot `n`.
fn slots_before(n: usize) -> usize {
    !slots_from(n)
}

/// Number of bitmap words needed to cover `capacity` bytes of heap.
pub fn compute_bitmap_words(capacity: usize, alignment: usize) -> usize {
    raw_align_up(capacity, alignment * BITS_IN_WORD) / alignment / BITS_IN_WORD
}

/// Everything another process needs to rebuild a view of a bitmap stored in the shared region.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Zeroable)]
pub struct SpaceBitmapRecord {
    pub words: SharedOffset,
    pub num_words: usize,
    pub heap_begin: Address,
    pub heap_limit: Address,
    pub alignment: usize,
}

impl SpaceBitmapRecord {
    pub fn is_null(&self) -> bool {
        self.words.is_null()
    }
}

enum Storage {
    Mapped(MemMap),
    Shared(SharedSlice<AtomicUsize>),
}

/// One bit per `alignment`-sized slot of a contiguous heap range.
///
/// The bit for slot `i` lives in word `i / BITS_IN_WORD` at mask `WORD_HIGH_BIT >> (i %
/// BITS_IN_WORD)`, so scanning a word from its high bit down with `leading_zeros` yields
/// addresses in ascending order.
///
/// All bit updates are atomic. The bitmap never touches the heap it describes.
pub struct SpaceBitmap {
    name: String,
    storage: Storage,
    num_words: usize,
    heap_begin: Address,
    heap_limit: Address,
    alignment: usize,
}

impl SpaceBitmap {
    /// Create a bitmap in its own shared anonymous mapping.
    pub fn create(name: &str, heap_begin: Address, heap_capacity: usize, alignment: usize) -> SpaceBitmap {
        Self::check_shape(name, heap_begin, alignment);
        let num_words = compute_bitmap_words(heap_capacity, alignment);
        let map = MemMap::map_anonymous(
            name,
            num_words * BYTES_IN_WORD,
            MmapStrategy::SHARED_METADATA,
            &MmapAnnotation::Bitmap { name },
        )
        .unwrap_or_else(|e| fatal!("Failed to map bitmap {}: {}", name, e));
        SpaceBitmap {
            name: name.to_string(),
            storage: Storage::Mapped(map),
            num_words,
            heap_begin,
            heap_limit: heap_begin + heap_capacity,
            alignment,
        }
    }

    /// Create a bitmap whose words live in the shared region, so that it can be described by a
    /// [`SpaceBitmapRecord`] and opened by another process.
    pub fn create_in_region(
        region: &Arc<SharedRegion>,
        name: &str,
        heap_begin: Address,
        heap_capacity: usize,
        alignment: usize,
    ) -> SpaceBitmap {
        Self::check_shape(name, heap_begin, alignment);
        let num_words = compute_bitmap_words(heap_capacity, alignment);
        let words = region.alloc_array::<AtomicUsize>(num_words);
        SpaceBitmap {
            name: name.to_string(),
            storage: Storage::Shared(words),
            num_words,
            heap_begin,
            heap_limit: heap_begin + heap_capacity,
            alignment,
        }
    }

    /// Open a bitmap described by `record`.
    pub fn from_record(region: &Arc<SharedRegion>, name: &str, record: &SpaceBitmapRecord) -> SpaceBitmap {
        if record.is_null() {
            fatal!("Bitmap record for {} is empty", name);
        }
        let words = unsafe { SharedSlice::from_offset(region.clone(), record.words, record.num_words) };
        SpaceBitmap {
            name: name.to_string(),
            storage: Storage::Shared(words),
            num_words: record.num_words,
            heap_begin: record.heap_begin,
            heap_limit: record.heap_limit,
            alignment: record.alignment,
        }
    }

    fn check_shape(name: &str, heap_begin: Address, alignment: usize) {
        if !alignment.is_power_of_two() || !heap_begin.is_aligned_to(alignment) {
            fatal!(
                "Bitmap {}: bad alignment {} for heap begin {}",
                name,
                alignment,
                heap_begin
            );
        }
    }

    /// The record for a bitmap stored in the shared region. `None` for a bitmap with its own
    /// mapping.
    pub fn record(&self) -> Option<SpaceBitmapRecord> {
        match &self.storage {
            Storage::Shared(words) => Some(SpaceBitmapRecord {
                words: words.offset(),
                num_words: self.num_words,
                heap_begin: self.heap_begin,
                heap_limit: self.heap_limit,
                alignment: self.alignment,
            }),
            Storage::Mapped(_) => None,
        }
    }

    fn words(&self) -> &[AtomicUsize] {
        match &self.storage {
            Storage::Mapped(map) => unsafe {
                std::slice::from_raw_parts(map.begin().to_ptr::<AtomicUsize>(), self.num_words)
            },
            Storage::Shared(words) => words,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap_begin(&self) -> Address {
        self.heap_begin
    }

    pub fn heap_limit(&self) -> Address {
        self.heap_limit
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn size_in_words(&self) -> usize {
        self.num_words
    }

    /// Shrink or grow the covered range. The new limit must still fit the allocated words.
    pub fn set_heap_limit(&mut self, new_limit: Address) {
        let capacity = new_limit - self.heap_begin;
        if compute_bitmap_words(capacity, self.alignment) > self.num_words {
            fatal!("Bitmap {} cannot cover up to {}", self.name, new_limit);
        }
        self.heap_limit = new_limit;
    }

    pub fn has_address(&self, addr: Address) -> bool {
        addr >= self.heap_begin && addr < self.heap_limit
    }

    #[inline(always)]
    fn slot_of(&self, addr: Address) -> (usize, usize) {
        let slot = (addr - self.heap_begin) / self.alignment;
        (slot / BITS_IN_WORD, WORD_HIGH_BIT >> (slot % BITS_IN_WORD))
    }

    #[inline(always)]
    fn word_base(&self, index: usize) -> Address {
        self.heap_begin + index * BITS_IN_WORD * self.alignment
    }

    fn check_address(&self, addr: Address) {
        if !self.has_address(addr) {
            fatal!(
                "{} is outside bitmap {} [{}, {})",
                addr,
                self.name,
                self.heap_begin,
                self.heap_limit
            );
        }
        debug_assert!(addr.is_aligned_to(self.alignment), "{} is not aligned", addr);
    }

    pub fn test(&self, addr: Address) -> bool {
        self.check_address(addr);
        let (index, mask) = self.slot_of(addr);
        self.words()[index].load(Ordering::Relaxed) & mask != 0
    }

    /// Set the bit for `addr`. Returns the previous value.
    pub fn set(&self, addr: Address) -> bool {
        self.check_address(addr);
        let (index, mask) = self.slot_of(addr);
        self.words()[index].fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    /// Clear the bit for `addr`. Returns the previous value.
    pub fn clear(&self, addr: Address) -> bool {
        self.check_address(addr);
        let (index, mask) = self.slot_of(addr);
        self.words()[index].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    /// Set the bit for `addr` with a compare-and-swap. Returns true if it was already set, in which
    /// case no atomic write is attempted.
    pub fn atomic_test_and_set(&self, addr: Address) -> bool {
        self.check_address(addr);
        let (index, mask) = self.slot_of(addr);
        let word = &self.words()[index];
        if word.load(Ordering::Relaxed) & mask != 0 {
            return true;
        }
        atomically(word, |w| w | mask).old() & mask != 0
    }

    pub fn clear_all(&self) {
        for w in self.words() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Clear the bits of every slot in `[begin, end)`.
    pub fn clear_range(&self, begin: Address, end: Address) {
        let (begin, end) = self.checked_range(begin, end);
        if begin >= end {
            return;
        }
        let first = (begin - self.heap_begin) / self.alignment;
        let last = (end - self.heap_begin) / self.alignment;
        let (first_index, first_bit) = (first / BITS_IN_WORD, first % BITS_IN_WORD);
        let (last_index, last_bit) = (last / BITS_IN_WORD, last % BITS_IN_WORD);
        let words = self.words();
        if first_index == last_index {
            words[first_index].fetch_and(!(slots_from(first_bit) & slots_before(last_bit)), Ordering::Relaxed);
            return;
        }
        words[first_index].fetch_and(!slots_from(first_bit), Ordering::Relaxed);
        for w in &words[first_index + 1..last_index] {
            w.store(0, Ordering::Relaxed);
        }
        if last_bit != 0 {
            words[last_index].fetch_and(!slots_before(last_bit), Ordering::Relaxed);
        }
    }

    /// Copy every bit of `other`, which must have the same shape.
    pub fn copy_from(&self, other: &SpaceBitmap) {
        if other.heap_begin != self.heap_begin
            || other.alignment != self.alignment
            || other.num_words != self.num_words
        {
            fatal!("Cannot copy bitmap {} into {}", other, self);
        }
        for (dst, src) in self.words().iter().zip(other.words()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Round a range to slot boundaries. A range reaching outside the bitmap is fatal.
    fn checked_range(&self, begin: Address, end: Address) -> (Address, Address) {
        if begin < self.heap_begin || end > self.heap_limit {
            fatal!(
                "Range [{}, {}) is outside bitmap {} [{}, {})",
                begin,
                end,
                self.name,
                self.heap_begin,
                self.heap_limit
            );
        }
        (begin.align_up(self.alignment), end.align_up(self.alignment))
    }

    #[inline(always)]
    fn visit_word<V: FnMut(Address)>(&self, index: usize, mut word: usize, visitor: &mut V) {
        let base = self.word_base(index);
        while word != 0 {
            let shift = word.leading_zeros() as usize;
            visitor(base + shift * self.alignment);
            word ^= WORD_HIGH_BIT >> shift;
        }
    }

    /// Visit the address of every set bit in `[begin, end)` in ascending order.
    ///
    /// Each word is read once. Bits set or cleared concurrently may or may not be seen.
    pub fn visit_marked_range<V: FnMut(Address)>(&self, begin: Address, end: Address, mut visitor: V) {
        let (begin, end) = self.checked_range(begin, end);
        if begin >= end {
            return;
        }
        let start_slot = (begin - self.heap_begin) / self.alignment;
        let end_slot = (end - self.heap_begin) / self.alignment;
        let (index_start, bit_start) = (start_slot / BITS_IN_WORD, start_slot % BITS_IN_WORD);
        let (index_end, bit_end) = (end_slot / BITS_IN_WORD, end_slot % BITS_IN_WORD);
        let words = self.words();

        if index_start == index_end {
            let word = words[index_start].load(Ordering::Relaxed)
                & slots_from(bit_start)
                & slots_before(bit_end);
            self.visit_word(index_start, word, &mut visitor);
            return;
        }

        let left_edge = words[index_start].load(Ordering::Relaxed) & slots_from(bit_start);
        self.visit_word(index_start, left_edge, &mut visitor);

        for (i, w) in words.iter().enumerate().take(index_end).skip(index_start + 1) {
            let word = w.load(Ordering::Relaxed);
            if word != 0 {
                self.visit_word(i, word, &mut visitor);
            }
        }

        // `index_end` is one past the last word when `end` is the limit on a word boundary.
        if bit_end != 0 {
            let right_edge = words[index_end].load(Ordering::Relaxed) & slots_before(bit_end);
            self.visit_word(index_end, right_edge, &mut visitor);
        }
    }

    /// Visit every set bit in the bitmap.
    pub fn walk<V: FnMut(Address)>(&self, mut visitor: V) {
        let end_slot = (self.heap_limit - self.heap_begin).div_ceil(self.alignment);
        let end_index = end_slot.div_ceil(BITS_IN_WORD).min(self.num_words);
        for (i, w) in self.words()[..end_index].iter().enumerate() {
            let word = w.load(Ordering::Relaxed);
            if word != 0 {
                self.visit_word(i, word, &mut visitor);
            }
        }
    }

    /// Report every slot in `[sweep_begin, sweep_end)` whose bit is set in `live` but not in
    /// `mark`, in ascending order, in batches of at most `buffer_capacity` addresses.
    ///
    /// The two bitmaps must cover the same heap with the same alignment.
    pub fn sweep_walk<F: FnMut(&[Address])>(
        live: &SpaceBitmap,
        mark: &SpaceBitmap,
        sweep_begin: Address,
        sweep_end: Address,
        buffer_capacity: usize,
        mut callback: F,
    ) {
        if live.heap_begin != mark.heap_begin
            || live.alignment != mark.alignment
            || live.words().len() != mark.words().len()
        {
            fatal!("Cannot sweep {} against {}: different shapes", live, mark);
        }
        debug_assert!(buffer_capacity >= BITS_IN_WORD);
        let (begin, end) = live.checked_range(sweep_begin, sweep_end);
        if begin >= end {
            return;
        }
        let first_slot = (begin - live.heap_begin) / live.alignment;
        let last_slot = (end - live.heap_begin) / live.alignment - 1;
        let (index_start, bit_start) = (first_slot / BITS_IN_WORD, first_slot % BITS_IN_WORD);
        let (index_end, bit_end) = (last_slot / BITS_IN_WORD, last_slot % BITS_IN_WORD);
        let (live_words, mark_words) = (live.words(), mark.words());

        let mut buffer: Vec<Address> = Vec::with_capacity(buffer_capacity);
        for i in index_start..=index_end {
            let mut garbage =
                live_words[i].load(Ordering::Relaxed) & !mark_words[i].load(Ordering::Relaxed);
            if i == index_start {
                garbage &= slots_from(bit_start);
            }
            if i == index_end {
                garbage &= slots_before(bit_end + 1);
            }
            if garbage != 0 {
                live.visit_word(i, garbage, &mut |a| buffer.push(a));
                // Flush while another full word is still guaranteed to fit.
                if buffer.len() + BITS_IN_WORD > buffer_capacity {
                    callback(&buffer);
                    buffer.clear();
                }
            }
        }
        if !buffer.is_empty() {
            callback(&buffer);
        }
    }
}

impl fmt::Display for SpaceBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [begin={} limit={} words={} align={}]",
            self.name, self.heap_begin, self.heap_limit, self.num_words, self.alignment
        )
    }
}

impl fmt::Debug for SpaceBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
