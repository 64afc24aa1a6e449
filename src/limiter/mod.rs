//! Window accounting backends and the limiter seam.

mod backend;
mod memory;
mod redis;

pub use backend::{Limit, Limiter, LimiterOptions};
pub use memory::{MemoryLimiter, MemoryStore};
pub use redis::RedisLimiter;
