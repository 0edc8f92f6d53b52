//! A document-store [`Persistence`] adapter backed by MongoDB.
//!
//! Collections are named `<prefix>.Requests` and `<prefix>.Parts`. Part
//! documents use a composite `_id` of `{PartId, RequestId}`; an ascending
//! index on `_id.RequestId` is created lazily on first use so
//! `parts_any_exist`/`parts_list_all` stay O(matching rows).

use super::BATCH_CHUNK_SIZE;
use crate::{ClaimOutcome, Error, PartId, Persistence, RequestId};
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Document};
use mongodb::options::{IndexOptions, ReadConcern};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct RequestDoc {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "CreationTime")]
    creation_time: DateTime<Utc>,
    #[serde(rename = "Context")]
    context: String,
    #[serde(rename = "ScatterCompleted")]
    scatter_completed: bool,
    #[serde(rename = "LockerId")]
    locker_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartDocId {
    #[serde(rename = "PartId")]
    part_id: String,
    #[serde(rename = "RequestId")]
    request_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartDoc {
    #[serde(rename = "_id")]
    id: PartDocId,
}

/// MongoDbPersistence adapts the [`Persistence`] port onto a pair of
/// collections in `database`, named `<prefix>.Requests` / `<prefix>.Parts`.
pub struct MongoDbPersistence {
    requests: Collection<RequestDoc>,
    parts: Collection<PartDoc>,
    index_created: tokio::sync::OnceCell<()>,
}

impl MongoDbPersistence {
    pub fn new(database: &Database, prefix: &str) -> Self {
        Self {
            requests: database.collection(&format!("{prefix}.Requests")),
            parts: database.collection(&format!("{prefix}.Parts")),
            index_created: tokio::sync::OnceCell::new(),
        }
    }

    async fn ensure_index(&self) -> Result<(), Error> {
        self.index_created
            .get_or_try_init(|| async {
                let index = IndexModel::builder()
                    .keys(doc! { "_id.RequestId": 1 })
                    .options(IndexOptions::builder().build())
                    .build();
                self.parts.create_index(index).await?;
                Ok::<_, mongodb::error::Error>(())
            })
            .await?;
        Ok(())
    }

    fn request_filter(request_id: &RequestId) -> Document {
        doc! { "_id": request_id.as_str() }
    }

    fn part_range_filter(request_id: &RequestId) -> Document {
        doc! { "_id.RequestId": request_id.as_str() }
    }
}

#[async_trait::async_trait]
impl Persistence for MongoDbPersistence {
    async fn request_put(
        &self,
        request_id: &RequestId,
        context: &str,
        creation_time: DateTime<Utc>,
    ) -> Result<(), Error> {
        let doc = RequestDoc {
            id: request_id.to_string(),
            creation_time,
            context: context.to_string(),
            scatter_completed: false,
            locker_id: None,
        };

        self.requests
            .replace_one(Self::request_filter(request_id), doc)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn request_mark_scatter_completed(&self, request_id: &RequestId) -> Result<(), Error> {
        self.requests
            .update_one(
                Self::request_filter(request_id),
                doc! { "$set": { "ScatterCompleted": true } },
            )
            .await?;
        Ok(())
    }

    async fn request_try_claim(
        &self,
        request_id: &RequestId,
        locker_id: &str,
    ) -> Result<ClaimOutcome, Error> {
        let mut filter = Self::request_filter(request_id);
        filter.insert("ScatterCompleted", true);
        filter.insert(
            "$or",
            vec![
                doc! { "LockerId": mongodb::bson::Bson::Null },
                doc! { "LockerId": locker_id },
            ],
        );

        let updated = self
            .requests
            .find_one_and_update(filter, doc! { "$set": { "LockerId": locker_id } })
            .return_document(mongodb::options::ReturnDocument::After)
            .await?;

        Ok(match updated {
            Some(row) => ClaimOutcome::Completed {
                context: row.context,
            },
            None => ClaimOutcome::NotCompleted,
        })
    }

    async fn request_delete(&self, request_id: &RequestId) -> Result<(), Error> {
        self.requests.delete_one(Self::request_filter(request_id)).await?;
        Ok(())
    }

    async fn parts_put_batch(
        &self,
        request_id: &RequestId,
        part_ids: &[PartId],
    ) -> Result<(), Error> {
        self.ensure_index().await?;

        for chunk in part_ids.chunks(BATCH_CHUNK_SIZE) {
            let docs = chunk.iter().map(|part_id| PartDoc {
                id: PartDocId {
                    part_id: part_id.to_string(),
                    request_id: request_id.to_string(),
                },
            });
            match self.parts.insert_many(docs).await {
                // Reinserting an existing (request_id, part_id) must be
                // tolerated silently.
                Ok(_) => {}
                Err(err) if is_duplicate_key(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn parts_delete_batch(
        &self,
        request_id: &RequestId,
        part_ids: &[PartId],
    ) -> Result<(), Error> {
        for chunk in part_ids.chunks(BATCH_CHUNK_SIZE) {
            let ids: Vec<String> = chunk.iter().map(|p| p.to_string()).collect();
            self.parts
                .delete_many(doc! {
                    "_id.RequestId": request_id.as_str(),
                    "_id.PartId": { "$in": ids },
                })
                .await?;
        }
        Ok(())
    }

    async fn parts_any_exist(&self, request_id: &RequestId) -> Result<bool, Error> {
        let count = self
            .parts
            .count_documents(Self::part_range_filter(request_id))
            .read_concern(ReadConcern::majority())
            .limit(1)
            .await?;
        Ok(count > 0)
    }

    async fn parts_list_all(&self, request_id: &RequestId) -> Result<Vec<PartId>, Error> {
        use futures::stream::TryStreamExt;

        let cursor = self
            .parts
            .find(Self::part_range_filter(request_id))
            .read_concern(ReadConcern::majority())
            .await?;

        let docs: Vec<PartDoc> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(|d| PartId::new(d.id.part_id)).collect())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    matches!(err.kind.as_ref(), ErrorKind::Write(mongodb::error::WriteFailure::WriteError(w)) if w.code == 11000)
}
