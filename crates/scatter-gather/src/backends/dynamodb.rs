//! A wide-column [`Persistence`] adapter backed by DynamoDB.
//!
//! The Request table is keyed solely by `RequestId`; the Part table has a
//! composite key of `RequestId` (partition) and `PartId` (sort). Both
//! tables are assumed pre-created. This adapter never issues `CreateTable`.

use super::BATCH_CHUNK_SIZE;
use crate::{ClaimOutcome, Error, PartId, Persistence, RequestId};
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

const REQUEST_ID: &str = "RequestId";
const PART_ID: &str = "PartId";
const CREATION_TIME: &str = "CreationTime";
const CONTEXT: &str = "Context";
const SCATTER_COMPLETED: &str = "ScatterCompleted";
const LOCKER_ID: &str = "LockerId";

/// DynamoDbPersistence adapts the [`Persistence`] port onto a pair of
/// pre-created DynamoDB tables.
pub struct DynamoDbPersistence {
    client: Client,
    request_table: String,
    part_table: String,
}

impl DynamoDbPersistence {
    pub fn new(client: Client, request_table: impl Into<String>, part_table: impl Into<String>) -> Self {
        Self {
            client,
            request_table: request_table.into(),
            part_table: part_table.into(),
        }
    }

    async fn batch_write(&self, table: &str, requests: Vec<WriteRequest>) -> Result<(), Error> {
        for chunk in requests.chunks(BATCH_CHUNK_SIZE) {
            let mut items = HashMap::from([(table.to_string(), chunk.to_vec())]);

            loop {
                let output = self
                    .client
                    .batch_write_item()
                    .set_request_items(Some(items))
                    .send()
                    .await
                    .map_err(Error::dynamodb)?;

                let unprocessed = output.unprocessed_items.unwrap_or_default();
                if unprocessed.is_empty() {
                    break;
                }
                // DynamoDB may throttle and return a partial batch; retry the
                // remainder. The protocol treats this as an internal
                // adapter detail, not a caller-visible error.
                items = unprocessed;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Persistence for DynamoDbPersistence {
    async fn request_put(
        &self,
        request_id: &RequestId,
        context: &str,
        creation_time: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.client
            .put_item()
            .table_name(&self.request_table)
            .item(REQUEST_ID, AttributeValue::S(request_id.to_string()))
            .item(
                CREATION_TIME,
                AttributeValue::S(creation_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
            )
            .item(CONTEXT, AttributeValue::S(context.to_string()))
            .item(SCATTER_COMPLETED, AttributeValue::Bool(false))
            .send()
            .await
            .map_err(Error::dynamodb)?;
        Ok(())
    }

    async fn request_mark_scatter_completed(&self, request_id: &RequestId) -> Result<(), Error> {
        self.client
            .update_item()
            .table_name(&self.request_table)
            .key(REQUEST_ID, AttributeValue::S(request_id.to_string()))
            .update_expression(format!("SET {SCATTER_COMPLETED} = :true"))
            .expression_attribute_values(":true", AttributeValue::Bool(true))
            .send()
            .await
            .map_err(Error::dynamodb)?;
        Ok(())
    }

    async fn request_try_claim(
        &self,
        request_id: &RequestId,
        locker_id: &str,
    ) -> Result<ClaimOutcome, Error> {
        let result = self
            .client
            .update_item()
            .table_name(&self.request_table)
            .key(REQUEST_ID, AttributeValue::S(request_id.to_string()))
            .update_expression(format!("SET {LOCKER_ID} = :locker"))
            .condition_expression(format!(
                "{SCATTER_COMPLETED} = :true AND (attribute_not_exists({LOCKER_ID}) OR {LOCKER_ID} = :locker)"
            ))
            .expression_attribute_values(":true", AttributeValue::Bool(true))
            .expression_attribute_values(":locker", AttributeValue::S(locker_id.to_string()))
            .return_values(aws_sdk_dynamodb::types::ReturnValue::AllNew)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                return if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception())
                {
                    Ok(ClaimOutcome::NotCompleted)
                } else {
                    Err(Error::dynamodb(err))
                };
            }
        };

        let context = output
            .attributes
            .and_then(|attrs| attrs.get(CONTEXT).cloned())
            .and_then(|value| value.as_s().ok().cloned())
            .unwrap_or_default();

        Ok(ClaimOutcome::Completed { context })
    }

    async fn request_delete(&self, request_id: &RequestId) -> Result<(), Error> {
        self.client
            .delete_item()
            .table_name(&self.request_table)
            .key(REQUEST_ID, AttributeValue::S(request_id.to_string()))
            .send()
            .await
            .map_err(Error::dynamodb)?;
        Ok(())
    }

    async fn parts_put_batch(
        &self,
        request_id: &RequestId,
        part_ids: &[PartId],
    ) -> Result<(), Error> {
        let requests = part_ids
            .iter()
            .map(|part_id| {
                WriteRequest::builder()
                    .put_request(
                        PutRequest::builder()
                            .item(REQUEST_ID, AttributeValue::S(request_id.to_string()))
                            .item(PART_ID, AttributeValue::S(part_id.to_string()))
                            .build()
                            .expect("PutRequest requires at least one item"),
                    )
                    .build()
            })
            .collect();

        self.batch_write(&self.part_table, requests).await
    }

    async fn parts_delete_batch(
        &self,
        request_id: &RequestId,
        part_ids: &[PartId],
    ) -> Result<(), Error> {
        let requests = part_ids
            .iter()
            .map(|part_id| {
                WriteRequest::builder()
                    .delete_request(
                        DeleteRequest::builder()
                            .key(REQUEST_ID, AttributeValue::S(request_id.to_string()))
                            .key(PART_ID, AttributeValue::S(part_id.to_string()))
                            .build()
                            .expect("DeleteRequest requires a key"),
                    )
                    .build()
            })
            .collect();

        self.batch_write(&self.part_table, requests).await
    }

    async fn parts_any_exist(&self, request_id: &RequestId) -> Result<bool, Error> {
        let output = self
            .client
            .query()
            .table_name(&self.part_table)
            .consistent_read(true)
            .limit(1)
            .key_condition_expression(format!("{REQUEST_ID} = :rid"))
            .expression_attribute_values(":rid", AttributeValue::S(request_id.to_string()))
            .send()
            .await
            .map_err(Error::dynamodb)?;

        Ok(output.count > 0)
    }

    async fn parts_list_all(&self, request_id: &RequestId) -> Result<Vec<PartId>, Error> {
        let mut part_ids = Vec::new();
        let mut last_key = None;

        loop {
            let output = self
                .client
                .query()
                .table_name(&self.part_table)
                .consistent_read(true)
                .key_condition_expression(format!("{REQUEST_ID} = :rid"))
                .expression_attribute_values(":rid", AttributeValue::S(request_id.to_string()))
                .set_exclusive_start_key(last_key.take())
                .send()
                .await
                .map_err(Error::dynamodb)?;

            for item in output.items.unwrap_or_default() {
                if let Some(Ok(part_id)) = item.get(PART_ID).map(|v| v.as_s()) {
                    part_ids.push(PartId::new(part_id.clone()));
                }
            }

            last_key = output.last_evaluated_key;
            if last_key.is_none() {
                break;
            }
        }

        Ok(part_ids)
    }
}
