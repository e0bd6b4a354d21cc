//! Shared infrastructure: synchronization primitives for loaders and saves, and the dependency
//! graph used to order cascaded signing.

pub mod graph;
pub mod synchronization;
