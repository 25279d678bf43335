//! DynamoDB lock table backend
//!
//! Each lock is one item keyed by [`PARTITION_KEY`]. Conditional writes use
//! `attribute_not_exists` for fresh acquisitions and a `fence_token` equality
//! check for renewals, reclamation and release. Reads are strongly consistent.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::error::{DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ProvisionedThroughput, ReturnValuesOnConditionCheckFailure, ScalarAttributeType,
};
use tracing::{debug, error, info};

use latch_common::PARTITION_KEY;

use crate::error::{Result, StoreError};
use crate::record::LockRecord;
use crate::traits::{CapacityMode, LockRecordStore, Precondition, PutOutcome, WriteOutcome};

const ATTR_FENCE_TOKEN: &str = "fence_token";
const ATTR_OWNER: &str = "owner";
const ATTR_LEASE_DURATION: &str = "lease_duration_ms";
const ATTR_ACQUIRED_AT: &str = "acquired_at";
const ATTR_EXPIRES_AT: &str = "expires_at";
const ATTR_LAST_RENEWED_AT: &str = "last_renewed_at";
const ATTR_RENEWAL_COUNT: &str = "renewal_count";
const ATTR_PAYLOAD: &str = "payload";

/// Connection settings for [`DynamoLockStore::connect`]
#[derive(Debug, Clone)]
pub struct DynamoStoreConfig {
    pub table_name: String,
    pub region: String,
    /// Override endpoint, e.g. `http://localhost:8000` for DynamoDB Local
    pub endpoint_url: Option<String>,
}

/// Lock record store backed by a DynamoDB table
#[derive(Clone)]
pub struct DynamoLockStore {
    client: Client,
    table_name: String,
}

impl DynamoLockStore {
    /// Wrap an existing, already-configured DynamoDB client
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Load AWS configuration from the environment and connect
    pub async fn connect(config: &DynamoStoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        info!(
            table = %config.table_name,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "Connected DynamoDB lock store"
        );

        Self::new(Client::new(&sdk_config), config.table_name.clone())
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

fn transport_error<E, R>(operation: &str, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));
    error!("{}", message);
    StoreError::Transport(message)
}

/// Encode a record as a DynamoDB item
pub(crate) fn record_to_item(record: &LockRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert(
        PARTITION_KEY.to_string(),
        AttributeValue::S(record.key.clone()),
    );
    item.insert(
        ATTR_FENCE_TOKEN.to_string(),
        AttributeValue::S(record.fence_token.clone()),
    );
    item.insert(
        ATTR_OWNER.to_string(),
        AttributeValue::S(record.owner.clone()),
    );
    item.insert(
        ATTR_LEASE_DURATION.to_string(),
        AttributeValue::N(record.lease_duration_ms.to_string()),
    );
    item.insert(
        ATTR_ACQUIRED_AT.to_string(),
        AttributeValue::N(record.acquired_at.to_string()),
    );
    item.insert(
        ATTR_EXPIRES_AT.to_string(),
        AttributeValue::N(record.expires_at.to_string()),
    );
    item.insert(
        ATTR_RENEWAL_COUNT.to_string(),
        AttributeValue::N(record.renewal_count.to_string()),
    );
    if let Some(renewed) = record.last_renewed_at {
        item.insert(
            ATTR_LAST_RENEWED_AT.to_string(),
            AttributeValue::N(renewed.to_string()),
        );
    }
    if let Some(payload) = &record.payload {
        item.insert(ATTR_PAYLOAD.to_string(), AttributeValue::S(payload.clone()));
    }
    item
}

fn malformed(key: &str, message: String) -> StoreError {
    StoreError::Malformed {
        key: key.to_string(),
        message,
    }
}

fn attr_s(item: &HashMap<String, AttributeValue>, key: &str, name: &str) -> Result<String> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| malformed(key, format!("missing string attribute '{}'", name)))
}

fn attr_n<T: std::str::FromStr>(
    item: &HashMap<String, AttributeValue>,
    key: &str,
    name: &str,
) -> Result<Option<T>> {
    match item.get(name) {
        None => Ok(None),
        Some(value) => {
            let raw = value
                .as_n()
                .map_err(|_| malformed(key, format!("attribute '{}' is not a number", name)))?;
            raw.parse::<T>()
                .map(Some)
                .map_err(|_| malformed(key, format!("attribute '{}' out of range: {}", name, raw)))
        }
    }
}

fn required_n<T: std::str::FromStr>(
    item: &HashMap<String, AttributeValue>,
    key: &str,
    name: &str,
) -> Result<T> {
    attr_n(item, key, name)?
        .ok_or_else(|| malformed(key, format!("missing number attribute '{}'", name)))
}

/// Decode a DynamoDB item into a record
pub(crate) fn item_to_record(
    key: &str,
    item: &HashMap<String, AttributeValue>,
) -> Result<LockRecord> {
    Ok(LockRecord {
        key: attr_s(item, key, PARTITION_KEY)?,
        fence_token: attr_s(item, key, ATTR_FENCE_TOKEN)?,
        owner: attr_s(item, key, ATTR_OWNER).unwrap_or_default(),
        lease_duration_ms: required_n(item, key, ATTR_LEASE_DURATION)?,
        acquired_at: required_n(item, key, ATTR_ACQUIRED_AT)?,
        expires_at: required_n(item, key, ATTR_EXPIRES_AT)?,
        last_renewed_at: attr_n(item, key, ATTR_LAST_RENEWED_AT)?,
        renewal_count: attr_n(item, key, ATTR_RENEWAL_COUNT)?.unwrap_or(0),
        payload: item
            .get(ATTR_PAYLOAD)
            .and_then(|v| v.as_s().ok())
            .cloned(),
    })
}

#[async_trait]
impl LockRecordStore for DynamoLockStore {
    async fn get(&self, key: &str) -> Result<Option<LockRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(PARTITION_KEY, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| transport_error("GetItem", e))?;

        output
            .item()
            .map(|item| item_to_record(key, item))
            .transpose()
    }

    async fn put_if(
        &self,
        record: &LockRecord,
        precondition: Precondition<'_>,
    ) -> Result<PutOutcome> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(record_to_item(record)))
            .return_values_on_condition_check_failure(
                ReturnValuesOnConditionCheckFailure::AllOld,
            );

        request = match precondition {
            Precondition::Absent => request
                .condition_expression("attribute_not_exists(#key)")
                .expression_attribute_names("#key", PARTITION_KEY),
            Precondition::TokenMatches(token) => request
                .condition_expression("#token = :token")
                .expression_attribute_names("#token", ATTR_FENCE_TOKEN)
                .expression_attribute_values(":token", AttributeValue::S(token.to_string())),
        };

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Applied),
            Err(err) => match err.as_service_error() {
                Some(PutItemError::ConditionalCheckFailedException(rejected)) => {
                    // An undecodable old item falls back to a read by the caller
                    let current = rejected
                        .item()
                        .and_then(|item| item_to_record(&record.key, item).ok());
                    debug!(key = %record.key, ?precondition, "Conditional put rejected");
                    Ok(PutOutcome::ConditionFailed { current })
                }
                _ => Err(transport_error("PutItem", err)),
            },
        }
    }

    async fn delete_if(&self, key: &str, fence_token: &str) -> Result<WriteOutcome> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(PARTITION_KEY, AttributeValue::S(key.to_string()))
            .condition_expression("#token = :token")
            .expression_attribute_names("#token", ATTR_FENCE_TOKEN)
            .expression_attribute_values(":token", AttributeValue::S(fence_token.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(err) => match err.as_service_error() {
                Some(service) if service.is_conditional_check_failed_exception() => {
                    Ok(WriteOutcome::ConditionFailed)
                }
                _ => Err(transport_error("DeleteItem", err)),
            },
        }
    }

    async fn create_table(&self, capacity: CapacityMode) -> Result<()> {
        let provisioning = |e: aws_sdk_dynamodb::error::BuildError| {
            StoreError::Provisioning(e.to_string())
        };

        let key_schema = KeySchemaElement::builder()
            .attribute_name(PARTITION_KEY)
            .key_type(KeyType::Hash)
            .build()
            .map_err(provisioning)?;
        let attribute = AttributeDefinition::builder()
            .attribute_name(PARTITION_KEY)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(provisioning)?;

        let mut request = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .key_schema(key_schema)
            .attribute_definitions(attribute);

        request = match capacity {
            CapacityMode::OnDemand => request.billing_mode(BillingMode::PayPerRequest),
            CapacityMode::Provisioned {
                read_units,
                write_units,
            } => {
                let throughput = ProvisionedThroughput::builder()
                    .read_capacity_units(read_units)
                    .write_capacity_units(write_units)
                    .build()
                    .map_err(provisioning)?;
                request
                    .billing_mode(BillingMode::Provisioned)
                    .provisioned_throughput(throughput)
            }
        };

        request.send().await.map_err(|e| {
            StoreError::Provisioning(format!(
                "CreateTable '{}' failed: {}",
                self.table_name,
                DisplayErrorContext(&e)
            ))
        })?;

        info!(table = %self.table_name, %capacity, "Lock table is provisioning");
        Ok(())
    }
}
