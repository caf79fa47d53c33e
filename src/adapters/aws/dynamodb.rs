use crate::domain::jobs::{JobStatus, Transition, VideoId, VideoRecord};
use crate::ports::repository::{StatusStore, StoreError, MAX_CAS_RETRIES};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Item layout: `video_id` (hash key), `status` and `version` as top-level
/// attributes for conditions and filters, the full record as JSON.
fn to_item(record: &VideoRecord) -> Result<HashMap<String, AttributeValue>, StoreError> {
    Ok(HashMap::from([
        (
            "video_id".to_string(),
            AttributeValue::S(record.video_id.to_string()),
        ),
        (
            "status".to_string(),
            AttributeValue::S(record.status.as_str().to_string()),
        ),
        (
            "version".to_string(),
            AttributeValue::N(record.version.to_string()),
        ),
        (
            "updated_at".to_string(),
            AttributeValue::S(record.updated_at.to_rfc3339()),
        ),
        (
            "record".to_string(),
            AttributeValue::S(serde_json::to_string(record)?),
        ),
    ]))
}

fn from_item(item: &HashMap<String, AttributeValue>) -> Result<VideoRecord, StoreError> {
    let json = item
        .get("record")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| backend("item has no record attribute"))?;
    Ok(serde_json::from_str(json)?)
}

/// DynamoStatusStore implements StatusStore for AWS DynamoDB.
#[derive(Clone)]
pub struct DynamoStatusStore {
    client: Client,
    table_name: String,
}

impl DynamoStatusStore {
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }
}

#[async_trait]
impl StatusStore for DynamoStatusStore {
    async fn create(&self, record: &VideoRecord) -> Result<(), StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(record)?))
            .condition_expression("attribute_not_exists(video_id)")
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    Err(StoreError::AlreadyExists(record.video_id.clone()))
                } else {
                    Err(backend(service))
                }
            }
        }
    }

    async fn get(&self, video_id: &VideoId) -> Result<Option<VideoRecord>, StoreError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("video_id", AttributeValue::S(video_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| backend(e.into_service_error()))?;

        resp.item.as_ref().map(from_item).transpose()
    }

    async fn apply(
        &self,
        video_id: &VideoId,
        transition: Transition,
    ) -> Result<VideoRecord, StoreError> {
        for attempt in 1..=MAX_CAS_RETRIES {
            let mut record = self
                .get(video_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(video_id.clone()))?;
            let expected = record.version;
            record.apply(&transition, Utc::now())?;

            let result = self
                .client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(to_item(&record)?))
                .condition_expression("version = :expected")
                .expression_attribute_values(":expected", AttributeValue::N(expected.to_string()))
                .send()
                .await;
            match result {
                Ok(_) => return Ok(record),
                Err(e) => {
                    let service = e.into_service_error();
                    if !service.is_conditional_check_failed_exception() {
                        return Err(backend(service));
                    }
                    debug!(video_id = %video_id, attempt, "status write raced, retrying");
                }
            }
        }
        Err(StoreError::Conflict(video_id.clone()))
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoRecord>, StoreError> {
        let mut records = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let resp = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression("#status = :status")
                .expression_attribute_names("#status", "status")
                .expression_attribute_values(":status", AttributeValue::S(status.as_str().to_string()))
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| backend(e.into_service_error()))?;

            for item in resp.items() {
                records.push(from_item(item)?);
            }

            match resp.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(records)
    }
}
