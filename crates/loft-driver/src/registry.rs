use std::collections::HashMap;
use std::sync::Arc;

use loft_domain::InfraKind;

use crate::driver::Driver;
use crate::error::DriverError;

/// Dispatches to the drivers responsible for an infrastructure kind.
///
/// LOCAL resolves to the compose driver, the cloud kinds to their
/// [`CloudDriver`](crate::CloudDriver), and HYBRID to the default cloud's
/// driver followed by the compose driver — cloud first so containers can
/// consume cloud outputs, teardown in the reverse order.
pub struct DriverRegistry {
    /// Cloud used by HYBRID environments.
    pub default_cloud: InfraKind,
    drivers: HashMap<InfraKind, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new(default_cloud: InfraKind) -> Self {
        Self { default_cloud, drivers: HashMap::new() }
    }

    /// Register a driver for a kind. Returns `&mut self` for chaining.
    pub fn register(&mut self, kind: InfraKind, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(kind, driver);
        self
    }

    /// Drivers in provision order for the given kind.
    pub fn drivers_for(&self, kind: InfraKind) -> Result<Vec<Arc<dyn Driver>>, DriverError> {
        match kind {
            InfraKind::Hybrid => {
                let cloud = self.single(self.default_cloud)?;
                let local = self.single(InfraKind::Local)?;
                Ok(vec![cloud, local])
            }
            other => Ok(vec![self.single(other)?]),
        }
    }

    /// The driver that owns engine containers for this kind, if any.
    /// Feeds stats and log subscriptions.
    pub fn container_driver(&self, kind: InfraKind) -> Option<Arc<dyn Driver>> {
        if kind.has_containers() {
            self.drivers.get(&InfraKind::Local).cloned()
        } else {
            None
        }
    }

    pub fn registered_kinds(&self) -> Vec<InfraKind> {
        self.drivers.keys().copied().collect()
    }

    fn single(&self, kind: InfraKind) -> Result<Arc<dyn Driver>, DriverError> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or(DriverError::DriverNotConfigured(kind))
    }
}
