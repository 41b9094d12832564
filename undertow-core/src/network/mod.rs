//! Session-wide network resources: the bandwidth scheduler and its token
//! buckets.

pub mod bandwidth;
pub mod token_bucket;

pub use bandwidth::{BandwidthScheduler, Direction, QuotaRequest};
pub use token_bucket::TokenBucket;
