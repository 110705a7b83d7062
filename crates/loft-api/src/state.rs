use std::sync::Arc;

use loft_core::Orchestrator;
use loft_notifier::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn notifier(&self) -> &Arc<Notifier> {
        self.orchestrator.notifier()
    }
}
