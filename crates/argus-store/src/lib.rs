pub mod memory;

pub use memory::MemoryResultStore;
