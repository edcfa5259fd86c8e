//! Notification capability for inactivity events.
//!
//! The pipeline only knows this trait; what "delivery" means (a log line, a
//! webhook, a queue, nothing) is the collaborator's business and can be
//! swapped without touching the pipeline.

use async_trait::async_trait;
use tracing::warn;

use crate::inactivity::InactivePlayer;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, inactive: &[InactivePlayer]) -> anyhow::Result<()>;
}

/// Reports each flagged player as a structured warn event.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, inactive: &[InactivePlayer]) -> anyhow::Result<()> {
        for entry in inactive {
            warn!(
                account = %entry.player.account,
                name = %entry.player.name,
                days_inactive = entry.days_inactive,
                city = entry.city.as_ref().map(|c| c.name.as_str()).unwrap_or("-"),
                country = entry.country.as_ref().map(|c| c.name.as_str()).unwrap_or("-"),
                "player inactive"
            );
        }
        Ok(())
    }
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _inactive: &[InactivePlayer]) -> anyhow::Result<()> {
        Ok(())
    }
}
