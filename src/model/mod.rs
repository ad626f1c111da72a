//! Domain model shared across the coordinator, read path and backend seam

pub mod resource;
pub mod surrogate;
pub mod transaction;

pub use resource::{
    Payload, RawResource, ResourceDateKey, ResourceFormat, ResourceKey, ResourceTypeId,
    ResourceWrapper, WriteMethod,
};
pub use surrogate::SurrogateId;
pub use transaction::{MergeTransactionState, TransactionId, TransactionMetadata};
