use crate::{ClaimOutcome, Error, PartId, Persistence, RequestId};
use chrono::Utc;

/// Gateway is the public surface of this crate: the durable scatter-gather
/// protocol, layered over a pluggable [`Persistence`] backend. It holds no
/// state of its own beyond the backend handle. Every operation is a short
/// sequence of persistent round-trips, and nothing survives a call beyond
/// what's written to the store.
pub struct Gateway<P> {
    persistence: P,
}

impl<P: Persistence> Gateway<P> {
    pub fn new(persistence: P) -> Self {
        Self { persistence }
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Erases any residual state for `request_id` (a prior attempt's Request
    /// row and parts), then inserts a fresh Request row with
    /// `scatter_completed = false` and no `locker_id`. Safe to call for a
    /// brand-new `request_id`, and safe to call again for a `request_id`
    /// that already completed or is still in flight. Either way, parts
    /// added before this call can no longer trigger completion.
    #[tracing::instrument(skip(self, context), fields(request_id = %request_id))]
    pub async fn begin_scatter(
        &self,
        request_id: &RequestId,
        context: impl Into<String> + Send,
    ) -> Result<(), Error> {
        self.cleanup(request_id).await?;
        self.persistence
            .request_put(request_id, &context.into(), Utc::now())
            .await
    }

    /// Inserts `part_ids` as Part rows, then invokes `callback`. Parts are
    /// always persisted before `callback` runs: if the callback dispatches
    /// work to a worker, a worker racing ahead of a not-yet-visible Part row
    /// could `gather` it and trigger completion prematurely.
    #[tracing::instrument(skip(self, callback), fields(request_id = %request_id, parts = part_ids.len()))]
    pub async fn scatter<F, Fut, T>(
        &self,
        request_id: &RequestId,
        part_ids: Vec<PartId>,
        callback: F,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = T> + Send,
    {
        if !part_ids.is_empty() {
            self.persistence
                .parts_put_batch(request_id, &part_ids)
                .await?;
        }
        Ok(callback().await)
    }

    /// Sets `scatter_completed = true`, then attempts completion once with
    /// `locker_id = "EndScatter-<request_id>"`. After this returns, no
    /// further `scatter` calls are expected, though the protocol tolerates
    /// late ones.
    #[tracing::instrument(skip(self, completion_handler), fields(request_id = %request_id))]
    pub async fn end_scatter<H, Fut>(
        &self,
        request_id: &RequestId,
        completion_handler: H,
    ) -> Result<(), Error>
    where
        H: FnOnce(String) -> Fut + Send,
        Fut: std::future::Future<Output = Result<(), Error>> + Send,
    {
        self.persistence
            .request_mark_scatter_completed(request_id)
            .await?;

        let locker_id = format!("EndScatter-{request_id}");
        self.try_complete(request_id, &locker_id, completion_handler)
            .await
    }

    /// Deletes the named Part rows, then attempts completion once with
    /// `locker_id = "Gather-<first part id>"`. Deleting already-absent
    /// parts is not an error. Deletion always precedes the completion
    /// attempt.
    #[tracing::instrument(skip(self, completion_handler), fields(request_id = %request_id, parts = part_ids.len()))]
    pub async fn gather<H, Fut>(
        &self,
        request_id: &RequestId,
        part_ids: Vec<PartId>,
        completion_handler: H,
    ) -> Result<(), Error>
    where
        H: FnOnce(String) -> Fut + Send,
        Fut: std::future::Future<Output = Result<(), Error>> + Send,
    {
        let Some(first) = part_ids.first().cloned() else {
            return Ok(());
        };

        self.persistence
            .parts_delete_batch(request_id, &part_ids)
            .await?;

        let locker_id = format!("Gather-{first}");
        self.try_complete(request_id, &locker_id, completion_handler)
            .await
    }

    /// The completion protocol shared by `end_scatter` and `gather`: probe
    /// for any outstanding part, attempt the conditional claim, invoke the
    /// handler exactly once on a win, and clean up afterwards. `locker_id`
    /// is deterministic per call site so a retry from the same site can
    /// re-enter the critical section after a handler failure, while a
    /// different call site is excluded.
    async fn try_complete<H, Fut>(
        &self,
        request_id: &RequestId,
        locker_id: &str,
        completion_handler: H,
    ) -> Result<(), Error>
    where
        H: FnOnce(String) -> Fut + Send,
        Fut: std::future::Future<Output = Result<(), Error>> + Send,
    {
        if self.persistence.parts_any_exist(request_id).await? {
            tracing::debug!(request_id = %request_id, "parts remain outstanding, not completed");
            return Ok(());
        }

        let context = match self
            .persistence
            .request_try_claim(request_id, locker_id)
            .await?
        {
            ClaimOutcome::NotCompleted => {
                tracing::debug!(request_id = %request_id, locker_id, "lost completion claim");
                return Ok(());
            }
            ClaimOutcome::Completed { context } => {
                tracing::debug!(request_id = %request_id, locker_id, "won completion claim");
                context
            }
        };

        // The handler's failure is propagated unchanged and cleanup is
        // skipped: `locker_id` stays set, so a retry from this same call
        // site re-enters the claim above (the condition permits
        // `locker_id = self`) instead of racing a different caller.
        completion_handler(context).await?;

        self.cleanup(request_id).await
    }

    /// Repeatedly lists and deletes all parts for `request_id`, then deletes
    /// the Request row. Invoked both to wipe residue at the start of
    /// `begin_scatter` and after a successful completion handler.
    async fn cleanup(&self, request_id: &RequestId) -> Result<(), Error> {
        loop {
            let parts = self.persistence.parts_list_all(request_id).await?;
            if parts.is_empty() {
                break;
            }
            self.persistence
                .parts_delete_batch(request_id, &parts)
                .await?;
        }
        self.persistence.request_delete(request_id).await
    }
}
