//! Object storage
//!
//! The aws-sdk-s3 adapter behind the [`ObjectStore`](crate::domain::ports::ObjectStore)
//! port, and the engine that empties buckets and prefixes on volume
//! deletion.

pub mod eradication;
pub mod s3;

pub use eradication::{
    listing_prefix, EradicationConfig, EradicationEngine, EradicationReport, EradicationStrategy,
};
pub use s3::{S3ObjectStore, S3ObjectStoreFactory};
