//! Shared test utilities for Redis-backed crates
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `unique_key`: collision-free key names for tests sharing one container
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::TestRedis;
//! use redis::AsyncCommands;
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let mut conn = redis.connection();
//!
//!     conn.rpush::<_, _, ()>("jobs", "payload").await.unwrap();
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Key name unique to this call, e.g. `test-jobs-6f1c...`
pub fn unique_key(prefix: &str) -> String {
    format!("test-{}-{}", prefix, Uuid::new_v4().simple())
}
