mod admission;
mod error;
mod keyed_lock;
mod metrics;
mod orchestrator;
mod ports;
mod reaper;
mod worker;

pub use admission::{HostSnapshot, ResourceGuard};
pub use error::OrchError;
pub use keyed_lock::KeyedLocks;
pub use metrics::MetricsCollector;
pub use orchestrator::{Caller, OperationHandle, Orchestrator};
pub use ports::PortAllocator;
pub use reaper::Reaper;
pub use worker::WorkerPool;
