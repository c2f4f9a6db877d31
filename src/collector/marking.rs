use std::ops::Range;

use crate::accounting::{HeapBitmap, ObjectStack};
use crate::vm::VMBinding;
use crate::util::Address;

/// Transitive marking through a heap bitmap, shared by the mutator and the service process.
///
/// Newly marked objects go to the shared mark stack. When it is full they spill to a stack
/// private to this marker.
pub(crate) struct Marker<'a, VM: VMBinding> {
    binding: &'a VM,
    mark_bitmap: &'a HeapBitmap,
    immune: Range<Address>,
    mark_stack: &'a ObjectStack,
    overflow: Vec<Address>,
    /// Objects no continuous bitmap covers are pushed here instead of being marked.
    deferred: Option<&'a ObjectStack>,
    marked: usize,
}

impl<'a, VM: VMBinding> Marker<'a, VM> {
    pub fn new(
        binding: &'a VM,
        mark_bitmap: &'a HeapBitmap,
        immune: Range<Address>,
        mark_stack: &'a ObjectStack,
        deferred: Option<&'a ObjectStack>,
    ) -> Self {
        Marker {
            binding,
            mark_bitmap,
            immune,
            mark_stack,
            overflow: vec![],
            deferred,
            marked: 0,
        }
    }

    /// Number of objects this marker found unmarked and marked.
    pub fn marked(&self) -> usize {
        self.marked
    }

    pub fn mark_object(&mut self, object: Address) {
        if object.is_zero() || self.immune.contains(&object) {
            return;
        }
        if let Some(deferred) = self.deferred {
            if self.mark_bitmap.get_continuous_space_bitmap(object).is_none() {
                if !deferred.push(object) {
                    fatal!("Deferred stack overflow while deferring {}", object);
                }
                trace!("Deferred {}", object);
                return;
            }
        }
        if !self.mark_bitmap.atomic_test_and_set(object) {
            self.marked += 1;
            if !self.mark_stack.push(object) {
                self.overflow.push(object);
            }
        }
    }

    /// Mark everything `object` references.
    pub fn scan_object(&mut self, object: Address) {
        let binding = self.binding;
        binding.scan_object(object, &mut |child| self.mark_object(child));
    }

    /// Scan marked objects until both stacks are empty.
    pub fn process_mark_stack(&mut self) {
        while let Some(object) = self.overflow.pop().or_else(|| self.mark_stack.pop()) {
            self.scan_object(object);
        }
    }
}
