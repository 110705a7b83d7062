mod envelope;
mod notifier;

pub use envelope::{ClientAction, ClientCommand, MetricPayload, ServerMessage};
pub use notifier::{Notifier, SessionHandle, SessionId};
