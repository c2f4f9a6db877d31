use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use super::space_bitmap::SpaceBitmap;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::os::{MemMap, MemMapDescriptor, MmapAnnotation, MmapStrategy};
use crate::util::rust_util::{atomically, AtomicUpdate};
use crate::util::Address;

pub const LOG_BYTES_IN_CARD: usize = 9;
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// Must be zero: fresh mappings are zero-filled and clearing relies on it.
pub const CARD_CLEAN: u8 = 0;
pub const CARD_DIRTY: u8 = 0x70;
/// A card that was dirty at the start of the current cycle.
pub const CARD_AGED: u8 = CARD_DIRTY - 1;

/// Extra bytes mapped so that the biased base can be moved to a position whose low byte is
/// [`CARD_DIRTY`].
const CARD_TABLE_SLACK: usize = 256;

/// One byte per [`BYTES_IN_CARD`] bytes of heap, recording whether the heap range may have been
/// written since the card was last cleared or aged.
///
/// The card for `addr` is at `biased_begin + (addr >> LOG_BYTES_IN_CARD)`. The biased base is
/// chosen so that its low byte equals [`CARD_DIRTY`], which lets a compiled write barrier store
/// the low byte of the base register instead of loading the constant.
pub struct CardTable {
    mem_map: MemMap,
    /// Offset in `mem_map` of the card for `heap_begin`.
    offset: usize,
    biased_begin: usize,
    heap_begin: Address,
    heap_limit: Address,
}

/// dirty -> aged, anything else -> clean.
pub fn age_card(card: u8) -> u8 {
    if card == CARD_DIRTY {
        CARD_AGED
    } else {
        CARD_CLEAN
    }
}

impl CardTable {
    pub fn create(heap_begin: Address, heap_capacity: usize) -> CardTable {
        if !heap_begin.is_aligned_to(BYTES_IN_CARD) {
            fatal!("Card table heap begin {} is not card aligned", heap_begin);
        }
        let capacity = heap_capacity.div_ceil(BYTES_IN_CARD);
        let heap_name = format!("heap@{}", heap_begin);
        let mem_map = MemMap::map_anonymous(
            "card table",
            capacity + CARD_TABLE_SLACK,
            MmapStrategy::SHARED_METADATA,
            &MmapAnnotation::CardTable { heap: &heap_name },
        )
        .unwrap_or_else(|e| fatal!("Failed to map card table for {}: {}", heap_name, e));

        let cardtable_begin = mem_map.begin().as_usize();
        let mut biased_begin = cardtable_begin.wrapping_sub(heap_begin.as_usize() >> LOG_BYTES_IN_CARD);
        let mut offset = 0;
        let low_byte = (biased_begin & 0xff) as u8;
        if low_byte != CARD_DIRTY {
            let delta = CARD_DIRTY.wrapping_sub(low_byte) as usize;
            offset = delta;
            biased_begin = biased_begin.wrapping_add(delta);
        }
        debug_assert_eq!((biased_begin & 0xff) as u8, CARD_DIRTY);
        debug!(
            "Card table for [{}, {}) at {} offset {}",
            heap_begin,
            heap_begin + heap_capacity,
            mem_map.begin(),
            offset
        );
        CardTable {
            mem_map,
            offset,
            biased_begin,
            heap_begin,
            heap_limit: heap_begin + heap_capacity,
        }
    }

    /// The biased base pointer. Its low byte is always [`CARD_DIRTY`].
    pub fn biased_begin(&self) -> Address {
        unsafe { Address::from_usize(self.biased_begin) }
    }

    pub fn heap_begin(&self) -> Address {
        self.heap_begin
    }

    pub fn heap_limit(&self) -> Address {
        self.heap_limit
    }

    pub fn num_cards(&self) -> usize {
        (self.heap_limit - self.heap_begin).div_ceil(BYTES_IN_CARD)
    }

    pub fn descriptor(&self) -> MemMapDescriptor {
        self.mem_map.descriptor()
    }

    fn cards_begin(&self) -> Address {
        self.mem_map.begin() + self.offset
    }

    fn cards_end(&self) -> Address {
        self.cards_begin() + self.num_cards()
    }

    /// Whether `card` points into the part of the mapping that holds cards.
    pub fn addr_is_in_card_table(&self, card: Address) -> bool {
        card >= self.cards_begin() && card < self.cards_end()
    }

    fn check_card_valid(&self, card: Address) {
        if !self.addr_is_in_card_table(card) {
            fatal!(
                "Card {} is outside the card table [{}, {}) for heap [{}, {})",
                card,
                self.cards_begin(),
                self.cards_end(),
                self.heap_begin,
                self.heap_limit
            );
        }
    }

    /// The address of the card byte covering `addr`.
    pub fn card_from_addr(&self, addr: Address) -> Address {
        let card = unsafe {
            Address::from_usize(self.biased_begin.wrapping_add(addr.as_usize() >> LOG_BYTES_IN_CARD))
        };
        self.check_card_valid(card);
        card
    }

    /// The first heap address covered by `card`.
    pub fn addr_from_card(&self, card: Address) -> Address {
        self.check_card_valid(card);
        unsafe { Address::from_usize(card.as_usize().wrapping_sub(self.biased_begin) << LOG_BYTES_IN_CARD) }
    }

    pub fn card_index(&self, addr: Address) -> usize {
        self.card_from_addr(addr) - self.cards_begin()
    }

    fn card_byte(&self, card: Address) -> &AtomicU8 {
        unsafe { &*card.to_ptr::<AtomicU8>() }
    }

    fn card_word(&self, card: Address) -> &AtomicUsize {
        debug_assert!(card.is_aligned_to(BYTES_IN_WORD));
        unsafe { &*card.to_ptr::<AtomicUsize>() }
    }

    pub fn get_card(&self, addr: Address) -> u8 {
        self.card_byte(self.card_from_addr(addr)).load(Ordering::Relaxed)
    }

    pub fn is_dirty(&self, addr: Address) -> bool {
        self.get_card(addr) == CARD_DIRTY
    }

    /// The write barrier: dirty the card covering `addr`.
    #[inline(always)]
    pub fn mark_card(&self, addr: Address) {
        self.card_byte(self.card_from_addr(addr))
            .store(CARD_DIRTY, Ordering::Relaxed);
    }

    /// Reset every card to clean.
    pub fn clear_card_table(&self) {
        let begin = self.mem_map.begin();
        unsafe { std::ptr::write_bytes(begin.to_mut_ptr::<u8>(), CARD_CLEAN, self.mem_map.size()) };
    }

    /// Reset the cards covering `[begin, end)` to clean.
    pub fn clear_card_range(&self, begin: Address, end: Address) {
        let card_begin = self.card_from_addr(begin.align_down(BYTES_IN_CARD));
        let card_end = self.card_end_for(end);
        let mut card = card_begin;
        while card < card_end {
            self.card_byte(card).store(CARD_CLEAN, Ordering::Relaxed);
            card = card + 1usize;
        }
    }

    /// One past the card covering the last byte before `end`.
    fn card_end_for(&self, end: Address) -> Address {
        let end = end.align_up(BYTES_IN_CARD);
        if end == self.heap_limit.align_up(BYTES_IN_CARD) {
            self.cards_end()
        } else {
            self.card_from_addr(end)
        }
    }

    fn visit_card<V: FnMut(Address)>(&self, bitmap: &SpaceBitmap, card: Address, visitor: &mut V) {
        let start = self.addr_from_card(card).max(bitmap.heap_begin());
        let end = (self.addr_from_card(card) + BYTES_IN_CARD).min(bitmap.heap_limit());
        if start < end {
            bitmap.visit_marked_range(start, end, &mut *visitor);
        }
    }

    /// Visit every object marked in `bitmap` in `[scan_begin, scan_end)` whose card is at least
    /// `minimum_age`, in ascending order. Returns the number of cards that qualified.
    ///
    /// Whole cards are visited, so objects in the first and last card before `scan_begin` or after
    /// `scan_end` are reported too. Words of clean cards are skipped without decoding them.
    pub fn scan<V: FnMut(Address)>(
        &self,
        bitmap: &SpaceBitmap,
        scan_begin: Address,
        scan_end: Address,
        mut visitor: V,
        minimum_age: u8,
    ) -> usize {
        let card_begin = self.card_from_addr(scan_begin.align_down(BYTES_IN_CARD));
        let card_end = self.card_end_for(scan_end);
        if card_begin >= card_end {
            return 0;
        }

        if minimum_age == 0 {
            let begin = self.addr_from_card(card_begin).max(bitmap.heap_begin());
            let end = (scan_end.align_up(BYTES_IN_CARD)).min(bitmap.heap_limit());
            if begin < end {
                bitmap.visit_marked_range(begin, end, &mut visitor);
            }
            return card_end - card_begin;
        }

        let mut cards_scanned = 0;
        let mut card = card_begin;
        // Leading cards up to a word boundary.
        while card < card_end && !card.is_aligned_to(BYTES_IN_WORD) {
            if self.card_byte(card).load(Ordering::Relaxed) >= minimum_age {
                self.visit_card(bitmap, card, &mut visitor);
                cards_scanned += 1;
            }
            card = card + 1usize;
        }

        let word_end = card_end.align_down(BYTES_IN_WORD);
        while card < word_end {
            let word = usize::from_le(self.card_word(card).load(Ordering::Relaxed));
            if word != 0 {
                for lane in 0..BYTES_IN_WORD {
                    let value = ((word >> (lane * 8)) & 0xff) as u8;
                    if value >= minimum_age {
                        self.visit_card(bitmap, card + lane, &mut visitor);
                        cards_scanned += 1;
                    }
                }
            }
            card = card + BYTES_IN_WORD;
        }

        // Trailing cards after the last full word.
        while card < card_end {
            if self.card_byte(card).load(Ordering::Relaxed) >= minimum_age {
                self.visit_card(bitmap, card, &mut visitor);
                cards_scanned += 1;
            }
            card = card + 1usize;
        }
        trace!(
            "Scanned cards [{}, {}) age >= {}: {} qualified",
            card_begin,
            card_end,
            minimum_age,
            cards_scanned
        );
        cards_scanned
    }

    /// Replace every card covering `[scan_begin, scan_end)` with `visitor(card)`, using
    /// compare-and-swap so that concurrent write barriers are never lost. `modified(addr, old,
    /// new)` is called for every card that changed, with the first heap address it covers.
    ///
    /// Interior cards are updated a word at a time. A word of clean cards is skipped when the
    /// visitor maps clean to clean.
    pub fn modify_cards_atomic<V, M>(&self, scan_begin: Address, scan_end: Address, visitor: V, mut modified: M)
    where
        V: Fn(u8) -> u8,
        M: FnMut(Address, u8, u8),
    {
        let mut card = self.card_from_addr(scan_begin.align_down(BYTES_IN_CARD));
        let mut card_end = self.card_end_for(scan_end);
        if card >= card_end {
            return;
        }
        let skip_clean_words = visitor(CARD_CLEAN) == CARD_CLEAN;

        let mut modify_byte = |card: Address| {
            if let AtomicUpdate::Changed(old, new) = atomically(self.card_byte(card), |c| visitor(c)) {
                modified(self.addr_from_card(card), old, new);
            }
        };

        while card < card_end && !card.is_aligned_to(BYTES_IN_WORD) {
            modify_byte(card);
            card = card + 1usize;
        }
        while card < card_end && !card_end.is_aligned_to(BYTES_IN_WORD) {
            card_end = card_end - 1usize;
            modify_byte(card_end);
        }

        while card < card_end {
            let word = self.card_word(card);
            if skip_clean_words && word.load(Ordering::Relaxed) == 0 {
                card = card + BYTES_IN_WORD;
                continue;
            }
            let update = atomically(word, |w| {
                let lanes = usize::from_le(w);
                let mut new_lanes = 0usize;
                for lane in 0..BYTES_IN_WORD {
                    let value = ((lanes >> (lane * 8)) & 0xff) as u8;
                    new_lanes |= (visitor(value) as usize) << (lane * 8);
                }
                usize::to_le(new_lanes)
            });
            if let AtomicUpdate::Changed(old, new) = update {
                let (old, new) = (usize::from_le(old), usize::from_le(new));
                for lane in 0..BYTES_IN_WORD {
                    let old_value = ((old >> (lane * 8)) & 0xff) as u8;
                    let new_value = ((new >> (lane * 8)) & 0xff) as u8;
                    if old_value != new_value {
                        modified(self.addr_from_card(card + lane), old_value, new_value);
                    }
                }
            }
            card = card + BYTES_IN_WORD;
        }
    }

    /// Check that every card holds one of the three legal values.
    pub fn verify(&self) {
        let mut card = self.cards_begin();
        while card < self.cards_end() {
            let value = self.card_byte(card).load(Ordering::Relaxed);
            if value != CARD_CLEAN && value != CARD_AGED && value != CARD_DIRTY {
                fatal!(
                    "Card {} for heap address {} has value {:#x}",
                    card,
                    self.addr_from_card(card),
                    value
                );
            }
            card = card + 1usize;
        }
    }
}

impl std::fmt::Debug for CardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardTable")
            .field("heap_begin", &self.heap_begin)
            .field("heap_limit", &self.heap_limit)
            .field("biased_begin", &self.biased_begin())
            .finish()
    }
}
