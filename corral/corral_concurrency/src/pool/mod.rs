//! Resource pooling and reuse of expensive resources.
//!
//! Resources are created lazily up to a fixed capacity and lent out one
//! caller at a time, either through scoped access or an RAII handle.

pub mod resource;

// Re-export key types from resource
pub use resource::{
    ResourceHandle, ResourcePool, ResourcePoolConfig, ResourcePoolError, SlotStatus,
};
