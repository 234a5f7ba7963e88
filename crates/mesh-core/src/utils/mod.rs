//! Small, dependency-free helpers shared across the crate.

pub mod murmur;

pub use murmur::murmur3_32;
