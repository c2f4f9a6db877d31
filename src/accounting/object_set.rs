use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::util::Address;

/// Mark or live information for spaces that are not contiguous, such as a large object space.
/// Each object is tracked by its address.
///
/// The set is private to the process that owns it.
#[derive(Debug)]
pub struct ObjectSet {
    name: String,
    objects: Mutex<BTreeSet<Address>>,
}

impl ObjectSet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test(&self, addr: Address) -> bool {
        self.objects.lock().unwrap().contains(&addr)
    }

    /// Add `addr`. Returns true if it was already present.
    pub fn set(&self, addr: Address) -> bool {
        !self.objects.lock().unwrap().insert(addr)
    }

    /// Remove `addr`. Returns true if it was present.
    pub fn clear(&self, addr: Address) -> bool {
        self.objects.lock().unwrap().remove(&addr)
    }

    pub fn clear_all(&self) {
        self.objects.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every object in ascending order. The visitor must not modify this set.
    pub fn walk<V: FnMut(Address)>(&self, mut visitor: V) {
        for &addr in self.objects.lock().unwrap().iter() {
            visitor(addr);
        }
    }

    /// Exchange contents with `other`.
    pub fn swap(&self, other: &ObjectSet) {
        if std::ptr::eq(self, other) {
            return;
        }
        // Lock in address order so two concurrent swaps cannot deadlock.
        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };
        let mut a = first.objects.lock().unwrap();
        let mut b = second.objects.lock().unwrap();
        std::mem::swap(&mut *a, &mut *b);
    }
}
