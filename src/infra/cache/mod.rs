//! Status cache backends.

pub mod memory;
pub mod redis;

pub use memory::InMemoryStatusCache;
pub use redis::RedisStatusCache;
