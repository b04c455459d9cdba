pub mod cdp;
pub mod health;
pub mod launcher;
pub mod pool;

pub use cdp::{CdpClient, CdpError};
pub use health::{HealthMonitor, HealthProbe};
pub use pool::{ConnectionPool, EndpointDescriptor, PageHandle, PoolError, TargetInfo};
