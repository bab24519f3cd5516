pub mod token_bucket;
pub mod traffic_shaping;

pub use token_bucket::{QuotaUsage, TokenBucket, TokenGrant, NO_SPEEDUP};
pub use traffic_shaping::{ShapingOutcome, TrafficShapingBucket};
