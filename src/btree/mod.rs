//! B+ tree layer: ordered key/value storage over the buffer pool.

mod cursor;
mod tree;

pub use cursor::Cursor;
pub use tree::BPlusTree;
