//! Liveness and mutation accounting: card tables, mark/live bitmaps and address stacks.
//!
//! None of these structures read or write the heap they describe. Those that both the mutator and
//! the service process touch are backed by shared memory.

mod atomic_stack;
pub mod card_table;
mod heap_bitmap;
mod object_set;
pub mod space_bitmap;

pub use self::atomic_stack::{ObjectStack, ObjectStackRecord};
pub use self::card_table::CardTable;
pub use self::heap_bitmap::HeapBitmap;
pub use self::object_set::ObjectSet;
pub use self::space_bitmap::{SpaceBitmap, SpaceBitmapRecord};
