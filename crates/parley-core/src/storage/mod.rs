//! Typed storage wrappers over parley-storage.

pub mod memory;

pub use memory::RedbMemoryStore;
