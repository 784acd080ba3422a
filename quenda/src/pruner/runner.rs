use chrono::Utc;
use futures::{stream::FuturesOrdered, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::PrunerConfig;
use crate::store::JobStore;

pub(crate) struct PrunerRunner<S> {
    store: S,
    config: PrunerConfig,
}

impl<S> PrunerRunner<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub(crate) fn new(store: S, config: PrunerConfig) -> Self {
        Self { store, config }
    }

    /// Waits out one schedule slot per pass, then prunes. Re-deriving the
    /// next slot from the wall clock after each pass means a prune that
    /// outruns its slot never fires twice within it, and a prune that takes
    /// longer than the slot period simply skips to the next future slot.
    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(slot) = self.config.schedule.upcoming(Utc).next() {
                let wait = (slot - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("job pruner stopping");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                self.prune().await;
            }
            tracing::warn!("prune schedule has no upcoming slot; pruner exiting");
        })
    }

    async fn prune(&self) {
        self.config
            .pruners
            .iter()
            .map(|spec| self.store.prune_jobs(spec))
            .collect::<FuturesOrdered<_>>()
            .for_each(|result| async move {
                match result {
                    Ok(0) => {}
                    Ok(pruned) => tracing::debug!(pruned, "pruned finished jobs"),
                    Err(err) => tracing::error!(?err, "failed to prune jobs: {err}"),
                }
            })
            .await;
    }
}
