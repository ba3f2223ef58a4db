pub mod client;
pub mod pool;

pub use pool::{BackendPool, HealthState, PoolError};
