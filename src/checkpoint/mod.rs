//! Checkpoint production and persistence.

pub mod store;
pub mod transform;

pub use store::CheckpointStore;
pub use transform::{
    fingerprint, referenced_objects, to_checkpoint, CheckpointData, CheckpointManifest,
    References, ResolvedRefs, TransformOptions,
};
