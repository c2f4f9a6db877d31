use std::sync::Arc;

use super::object_set::ObjectSet;
use super::space_bitmap::SpaceBitmap;
use crate::util::Address;

/// Routes bitmap operations to the bitmap of the space that owns an address.
///
/// Continuous spaces each have a [`SpaceBitmap`]; their ranges never overlap. Any address that no
/// continuous bitmap covers belongs to a discontinuous space and goes to an [`ObjectSet`].
#[derive(Default)]
pub struct HeapBitmap {
    continuous: Vec<Arc<SpaceBitmap>>,
    discontinuous: Vec<Arc<ObjectSet>>,
}

impl HeapBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_sets(&self) -> &[Arc<ObjectSet>] {
        &self.discontinuous
    }

    pub fn get_continuous_space_bitmap(&self, addr: Address) -> Option<&Arc<SpaceBitmap>> {
        self.continuous.iter().find(|b| b.has_address(addr))
    }

    pub fn test(&self, addr: Address) -> bool {
        if let Some(bitmap) = self.get_continuous_space_bitmap(addr) {
            return bitmap.test(addr);
        }
        self.discontinuous.iter().any(|set| set.test(addr))
    }

    /// Set the bit for `addr`. Returns the previous value.
    pub fn set(&self, addr: Address) -> bool {
        if let Some(bitmap) = self.get_continuous_space_bitmap(addr) {
            return bitmap.set(addr);
        }
        self.first_object_set(addr).set(addr)
    }

    /// Clear the bit for `addr`. Returns the previous value.
    pub fn clear(&self, addr: Address) -> bool {
        if let Some(bitmap) = self.get_continuous_space_bitmap(addr) {
            return bitmap.clear(addr);
        }
        if self.discontinuous.is_empty() {
            Self::unroutable(addr);
        }
        self.discontinuous.iter().any(|set| set.clear(addr))
    }

    /// Like [`Self::set`], but atomic with respect to other markers of the same continuous bitmap.
    pub fn atomic_test_and_set(&self, addr: Address) -> bool {
        if let Some(bitmap) = self.get_continuous_space_bitmap(addr) {
            return bitmap.atomic_test_and_set(addr);
        }
        self.first_object_set(addr).set(addr)
    }

    fn first_object_set(&self, addr: Address) -> &Arc<ObjectSet> {
        match self.discontinuous.first() {
            Some(set) => set,
            None => Self::unroutable(addr),
        }
    }

    fn unroutable(addr: Address) -> ! {
        fatal!("{} is not covered by any bitmap or object set", addr)
    }

    pub fn add_continuous_space_bitmap(&mut self, bitmap: Arc<SpaceBitmap>) {
        for existing in &self.continuous {
            if bitmap.heap_begin() < existing.heap_limit() && existing.heap_begin() < bitmap.heap_limit() {
                fatal!("Bitmap {} overlaps existing bitmap {}", bitmap, existing);
            }
        }
        trace!("Adding continuous bitmap {}", bitmap);
        self.continuous.push(bitmap);
    }

    pub fn add_object_set(&mut self, set: Arc<ObjectSet>) {
        trace!("Adding object set {}", set.name());
        self.discontinuous.push(set);
    }

    /// Put `new` in the place of `old`. They must cover the same range.
    pub fn replace_bitmap(&mut self, old: &Arc<SpaceBitmap>, new: Arc<SpaceBitmap>) {
        match self.continuous.iter_mut().find(|b| Arc::ptr_eq(b, old)) {
            Some(slot) => {
                debug_assert_eq!(old.heap_begin(), new.heap_begin());
                *slot = new;
            }
            None => fatal!("Cannot replace unregistered bitmap {}", old),
        }
    }

    pub fn replace_object_set(&mut self, old: &Arc<ObjectSet>, new: Arc<ObjectSet>) {
        match self.discontinuous.iter_mut().find(|s| Arc::ptr_eq(s, old)) {
            Some(slot) => *slot = new,
            None => fatal!("Cannot replace unregistered object set {}", old.name()),
        }
    }

    /// Visit every set bit of every continuous bitmap, then every object of every object set.
    pub fn walk<V: FnMut(Address)>(&self, mut visitor: V) {
        for bitmap in &self.continuous {
            bitmap.walk(&mut visitor);
        }
        for set in &self.discontinuous {
            set.walk(&mut visitor);
        }
    }

    pub fn clear_all(&self) {
        for bitmap in &self.continuous {
            bitmap.clear_all();
        }
        for set in &self.discontinuous {
            set.clear_all();
        }
    }
}

impl std::fmt::Debug for HeapBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBitmap")
            .field("continuous", &self.continuous)
            .field("discontinuous", &self.discontinuous)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::{BYTES_IN_PAGE, MIN_OBJECT_ALIGNMENT};
    use crate::util::test_util::TEST_HEAP_BEGIN;

    const ALIGN: usize = MIN_OBJECT_ALIGNMENT;
    const SPACE: usize = 16 * BYTES_IN_PAGE;

    fn two_spaces() -> (HeapBitmap, Arc<SpaceBitmap>, Arc<SpaceBitmap>) {
        let a = Arc::new(SpaceBitmap::create("a", TEST_HEAP_BEGIN, SPACE, ALIGN));
        let b = Arc::new(SpaceBitmap::create("b", TEST_HEAP_BEGIN + SPACE, SPACE, ALIGN));
        let mut heap = HeapBitmap::new();
        heap.add_continuous_space_bitmap(a.clone());
        heap.add_continuous_space_bitmap(b.clone());
        (heap, a, b)
    }

    #[test]
    fn routes_to_owning_bitmap() {
        let (heap, a, b) = two_spaces();
        let last_of_a = TEST_HEAP_BEGIN + SPACE - ALIGN;
        let first_of_b = TEST_HEAP_BEGIN + SPACE;
        heap.set(last_of_a);
        assert!(a.test(last_of_a));
        assert!(!heap.test(first_of_b));
        heap.set(first_of_b);
        assert!(b.test(first_of_b));
        assert!(heap.clear(last_of_a));
        assert!(!a.test(last_of_a));
        assert!(heap.test(first_of_b));
        assert!(!heap.atomic_test_and_set(last_of_a));
        assert!(heap.atomic_test_and_set(last_of_a));
    }

    #[test]
    #[should_panic]
    fn overlapping_bitmaps_are_fatal() {
        let (mut heap, _, _) = two_spaces();
        heap.add_continuous_space_bitmap(Arc::new(SpaceBitmap::create(
            "overlap",
            TEST_HEAP_BEGIN + SPACE / 2,
            SPACE,
            ALIGN,
        )));
    }

    #[test]
    fn unknown_address_goes_to_object_set() {
        let (mut heap, _, _) = two_spaces();
        let large = TEST_HEAP_BEGIN + 4 * SPACE;
        assert!(!heap.test(large));
        let los = Arc::new(ObjectSet::new("los"));
        heap.add_object_set(los.clone());
        assert!(!heap.set(large));
        assert!(los.test(large));
        assert!(heap.test(large));
        assert!(heap.clear(large));
        assert!(!heap.test(large));
    }

    #[test]
    #[should_panic]
    fn unroutable_set_is_fatal() {
        let (heap, _, _) = two_spaces();
        heap.set(TEST_HEAP_BEGIN + 4 * SPACE);
    }

    #[test]
    #[should_panic]
    fn unroutable_clear_is_fatal() {
        let (heap, _, _) = two_spaces();
        heap.clear(TEST_HEAP_BEGIN + 4 * SPACE);
    }

    #[test]
    fn replace_object_set() {
        let (mut heap, _, _) = two_spaces();
        let large = TEST_HEAP_BEGIN + 4 * SPACE;
        let live = Arc::new(ObjectSet::new("live"));
        let mark = Arc::new(ObjectSet::new("mark"));
        live.set(large);
        heap.add_object_set(live.clone());
        assert!(heap.test(large));
        heap.replace_object_set(&live, mark.clone());
        assert!(!heap.test(large));
        heap.set(large);
        assert!(mark.test(large));
        assert_eq!(heap.object_sets().len(), 1);
    }

    #[test]
    #[should_panic]
    fn replacing_unregistered_object_set_is_fatal() {
        let (mut heap, _, _) = two_spaces();
        heap.replace_object_set(&Arc::new(ObjectSet::new("a")), Arc::new(ObjectSet::new("b")));
    }

    #[test]
    fn replace_and_walk() {
        let (mut heap, a, _) = two_spaces();
        let a2 = Arc::new(SpaceBitmap::create("a2", TEST_HEAP_BEGIN, SPACE, ALIGN));
        a2.set(TEST_HEAP_BEGIN + ALIGN);
        a.set(TEST_HEAP_BEGIN + 2 * ALIGN);
        heap.replace_bitmap(&a, a2.clone());
        assert!(heap.test(TEST_HEAP_BEGIN + ALIGN));
        assert!(!heap.test(TEST_HEAP_BEGIN + 2 * ALIGN));
        heap.set(TEST_HEAP_BEGIN + SPACE + ALIGN);
        let mut seen = vec![];
        heap.walk(|x| seen.push(x));
        assert_eq!(seen, vec![TEST_HEAP_BEGIN + ALIGN, TEST_HEAP_BEGIN + SPACE + ALIGN]);
        heap.clear_all();
        assert!(!heap.test(TEST_HEAP_BEGIN + ALIGN));
    }
}
