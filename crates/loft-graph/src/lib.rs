mod error;
mod order;

pub use error::GraphError;
pub use order::{service_order, ServiceOrder};
