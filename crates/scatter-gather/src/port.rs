use crate::{Error, PartId, RequestId};
use chrono::{DateTime, Utc};

/// Outcome of a completion-claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    NotCompleted,
    Completed { context: String },
}

/// Persistence is the minimal capability set the coordination core requires
/// of any backing store. Adapters translate these calls into native
/// operations and contribute no protocol logic of their own: they do not
/// interpret `context`, do not retry on conditional-check failures, and do
/// not fabricate completion.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Insert or replace the Request row with `scatter_completed = false`
    /// and no `locker_id`. Idempotent with respect to re-invocation.
    async fn request_put(
        &self,
        request_id: &RequestId,
        context: &str,
        creation_time: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Unconditionally set `scatter_completed = true`. No-op if already true.
    async fn request_mark_scatter_completed(&self, request_id: &RequestId) -> Result<(), Error>;

    /// Atomically set `locker_id` if `scatter_completed = true` and
    /// (`locker_id` is absent or equal to `locker_id`). Returns the row's
    /// `context` on success. MUST be a single conditional write.
    async fn request_try_claim(
        &self,
        request_id: &RequestId,
        locker_id: &str,
    ) -> Result<ClaimOutcome, Error>;

    /// Delete the Request row if present. Not an error if absent.
    async fn request_delete(&self, request_id: &RequestId) -> Result<(), Error>;

    /// Insert Part rows. Reinserting an existing `(request_id, part_id)`
    /// must be tolerated silently.
    async fn parts_put_batch(&self, request_id: &RequestId, part_ids: &[PartId])
        -> Result<(), Error>;

    /// Delete Part rows. Absent rows are silently ignored.
    async fn parts_delete_batch(
        &self,
        request_id: &RequestId,
        part_ids: &[PartId],
    ) -> Result<(), Error>;

    /// True iff at least one Part row exists for the request. MUST use a
    /// strongly-consistent read.
    async fn parts_any_exist(&self, request_id: &RequestId) -> Result<bool, Error>;

    /// Enumerate all Part rows for the request, for cleanup. MUST use a
    /// strongly-consistent read.
    async fn parts_list_all(&self, request_id: &RequestId) -> Result<Vec<PartId>, Error>;
}
