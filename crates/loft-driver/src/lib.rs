mod compose;
mod driver;
mod error;
mod iaas;
pub mod providers;
mod registry;

pub use compose::ComposeDriver;
pub use driver::{
    ContainerStatsSnapshot, Driver, LogLine, LogStream, ProvisionContext, ProvisionOutcome,
};
pub use error::DriverError;
pub use iaas::{CloudDriver, IaasToolRunner};
pub use providers::ProviderHooks;
pub use registry::DriverRegistry;
