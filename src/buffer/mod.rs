//! Buffer pool layer: frame cache, LRU-K replacer, and page guards.

mod guard;
mod pool;
mod replacer;

pub use guard::{BasicPageGuard, PageRef, PageRefMut, ReadPageGuard, WritePageGuard};
pub use pool::BufferPool;
pub use replacer::LruKReplacer;
