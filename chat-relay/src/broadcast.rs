use std::sync::Arc;

use tracing::debug;

use crate::{
    connection::{Connection, ConnectionId},
    registry::Registry,
};

/// Outcome of one delivery pass. Informational only; failures are never
/// surfaced to the sender as errors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans lines out to a registry snapshot.
///
/// A recipient whose sink has closed is skipped and counted, never removed:
/// only the recipient's own session takes itself out of the registry.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Delivers `message` to every member except `sender`.
    pub async fn deliver(&self, message: &str, sender: ConnectionId) -> DeliveryReport {
        let recipients = self.registry.snapshot().await;
        fan_out(
            message,
            recipients.iter().filter(|member| member.id() != sender),
        )
    }

    /// Delivers `message` to every member.
    pub async fn announce(&self, message: &str) -> DeliveryReport {
        let recipients = self.registry.snapshot().await;
        fan_out(message, recipients.iter())
    }
}

fn fan_out<'a>(
    message: &str,
    recipients: impl Iterator<Item = &'a Connection>,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for recipient in recipients {
        match recipient.send(message) {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                debug!(conn = %recipient.id(), name = %recipient.name(), error = %err, "dropping line for departed recipient");
                report.failed += 1;
            }
        }
    }
    report
}
