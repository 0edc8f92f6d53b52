//! An in-process reference [`Persistence`] adapter.
//!
//! Implements the exact same conditional-claim and consistent-read
//! semantics as the DynamoDB and MongoDB adapters. There's nothing to
//! relax, since a `Mutex`-guarded map is already linearizable, so it's a
//! faithful stand-in for protocol tests rather than a simplified mock. This
//! crate's own test suite is built on it; it's also exported under the
//! `test-support` feature for downstream crates that want to exercise a
//! [`Gateway`](crate::Gateway) without a live database.

use crate::{ClaimOutcome, Error, PartId, Persistence, RequestId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct RequestRow {
    context: String,
    #[allow(dead_code)]
    creation_time: DateTime<Utc>,
    scatter_completed: bool,
    locker_id: Option<String>,
}

#[derive(Default)]
struct State {
    requests: HashMap<RequestId, RequestRow>,
    parts: HashMap<RequestId, BTreeSet<PartId>>,
}

/// MemoryPersistence is a `Mutex`-guarded, in-process implementation of
/// [`Persistence`]. Cheap to construct; making it reference-counted
/// internally would be overkill for tests, since callers typically keep one
/// instance per test and share `&MemoryPersistence` with a `Gateway`.
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<State>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Persistence for MemoryPersistence {
    async fn request_put(
        &self,
        request_id: &RequestId,
        context: &str,
        creation_time: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.requests.insert(
            request_id.clone(),
            RequestRow {
                context: context.to_string(),
                creation_time,
                scatter_completed: false,
                locker_id: None,
            },
        );
        Ok(())
    }

    async fn request_mark_scatter_completed(&self, request_id: &RequestId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.requests.get_mut(request_id) {
            row.scatter_completed = true;
        }
        Ok(())
    }

    async fn request_try_claim(
        &self,
        request_id: &RequestId,
        locker_id: &str,
    ) -> Result<ClaimOutcome, Error> {
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.requests.get_mut(request_id) else {
            return Ok(ClaimOutcome::NotCompleted);
        };

        let condition = row.scatter_completed
            && row
                .locker_id
                .as_deref()
                .map_or(true, |existing| existing == locker_id);

        if !condition {
            return Ok(ClaimOutcome::NotCompleted);
        }

        row.locker_id = Some(locker_id.to_string());
        Ok(ClaimOutcome::Completed {
            context: row.context.clone(),
        })
    }

    async fn request_delete(&self, request_id: &RequestId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.requests.remove(request_id);
        state.parts.remove(request_id);
        Ok(())
    }

    async fn parts_put_batch(
        &self,
        request_id: &RequestId,
        part_ids: &[PartId],
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let entry = state.parts.entry(request_id.clone()).or_default();
        for part_id in part_ids {
            entry.insert(part_id.clone());
        }
        Ok(())
    }

    async fn parts_delete_batch(
        &self,
        request_id: &RequestId,
        part_ids: &[PartId],
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.parts.get_mut(request_id) {
            for part_id in part_ids {
                entry.remove(part_id);
            }
        }
        Ok(())
    }

    async fn parts_any_exist(&self, request_id: &RequestId) -> Result<bool, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .parts
            .get(request_id)
            .is_some_and(|parts| !parts.is_empty()))
    }

    async fn parts_list_all(&self, request_id: &RequestId) -> Result<Vec<PartId>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .parts
            .get(request_id)
            .map(|parts| parts.iter().cloned().collect())
            .unwrap_or_default())
    }
}
