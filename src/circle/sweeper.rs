//! Removal of circles past their expiry

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::lifecycle::CircleLifecycleManager;
use crate::error::Result;
use crate::store::{CircleFilter, CircleStore};

#[derive(Clone)]
pub struct ExpirationSweeper {
    store: Arc<dyn CircleStore>,
    lifecycle: CircleLifecycleManager,
}

impl ExpirationSweeper {
    pub fn new(store: Arc<dyn CircleStore>, lifecycle: CircleLifecycleManager) -> Self {
        Self { store, lifecycle }
    }

    /// Delete every active circle that has expired by now
    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_before(Utc::now()).await
    }

    /// Delete active circles whose `expires_at` is earlier than `instant`.
    ///
    /// Returns how many circles were actually removed. A failed delete is
    /// logged and skipped; running it again picks the circle up next time.
    pub async fn sweep_before(&self, instant: DateTime<Utc>) -> Result<usize> {
        let expired = self
            .store
            .select_circles(&CircleFilter::active().expiring_before(instant))
            .await?;

        let mut cleaned = 0;
        for circle in &expired {
            match self.lifecycle.delete(circle.id).await {
                Ok(true) => cleaned += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(circle_id = %circle.id, error = %e, "Failed to sweep expired circle");
                }
            }
        }

        if cleaned > 0 {
            tracing::info!(cleaned, found = expired.len(), "Swept expired circles");
        }
        Ok(cleaned)
    }
}
