use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
    store::lsm::LsmStore,
};

/// Periodically drops disk-segment blocks that sat unread in the cache for
/// longer than the configured lifetime.
pub struct BlockReleaseTask {
    store: Arc<LsmStore>,
    interval: Duration,
    lifetime: Duration,
}

impl BlockReleaseTask {
    pub fn new(store: Arc<LsmStore>, interval: Duration, lifetime: Duration) -> Self {
        Self {
            store,
            interval,
            lifetime,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for BlockReleaseTask {
    fn name(&self) -> &'static str {
        "block-release"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let released = self.store.release_inactive_blocks(self.lifetime);
        if released > 0 {
            debug!(
                parent: self.store.span(),
                task = ctx.task_name,
                run = ctx.run_id,
                released,
                "Released inactive blocks"
            );
        }
        Ok(())
    }
}
