//! GraphQL-over-HTTP node gateway.
//!
//! Each node exposes `<base>/graphql` with an `Event { value, person }` type.
//! Writes go through `addEvent`, the high-water mark comes from
//! `aggregateEvent { count }`, and enumeration pages `queryEvent` ordered by
//! value.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::gateway::{BackendGateway, WriteRecord};

const ADD_EVENT: &str = "mutation AddEvent($input: [AddEventInput!]!) { \
     addEvent(input: $input) { event { value } } }";
const AGGREGATE_EVENT: &str = "query { aggregateEvent { count } }";
const QUERY_EVENT: &str = "query QueryEvent($first: Int, $offset: Int) { \
     queryEvent(first: $first, offset: $offset, order: {asc: value}) { value } }";

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct EventRow {
    value: i64,
}

#[derive(Debug, Deserialize)]
struct AddEventData {
    #[serde(rename = "addEvent")]
    add_event: Option<AddEventPayload>,
}

#[derive(Debug, Deserialize)]
struct AddEventPayload {
    #[serde(default)]
    event: Vec<EventRow>,
}

#[derive(Debug, Deserialize)]
struct AggregateData {
    #[serde(rename = "aggregateEvent")]
    aggregate_event: Option<AggregateCount>,
}

#[derive(Debug, Deserialize)]
struct AggregateCount {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct QueryEventData {
    #[serde(rename = "queryEvent", default)]
    query_event: Vec<EventRow>,
}

/// Decode a GraphQL response body, turning a non-empty `errors` array or a
/// missing `data` field into an error.
fn decode<T: DeserializeOwned>(body: &[u8]) -> anyhow::Result<T> {
    let response: GraphqlResponse<T> = serde_json::from_slice(body).with_context(|| {
        format!(
            "decode graphql response: {}",
            String::from_utf8_lossy(body)
        )
    })?;
    if !response.errors.is_empty() {
        let messages = response
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        anyhow::bail!("graphql errors: {messages}");
    }
    response
        .data
        .ok_or_else(|| anyhow::anyhow!("graphql response without data"))
}

/// A node reached through its GraphQL endpoint.
#[derive(Debug, Clone)]
pub struct GraphqlGateway {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl GraphqlGateway {
    /// Build a gateway for `base` (e.g. `http://localhost:8080`) with its own
    /// connection pool sized for `pool_size` concurrent writers.
    pub fn new(base: &str, pool_size: usize, timeout: Duration) -> anyhow::Result<Self> {
        let base = base.trim().trim_end_matches('/');
        anyhow::ensure!(!base.is_empty(), "node address must not be empty");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(pool_size.max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("build http client")?;
        Ok(Self {
            name: base.to_string(),
            endpoint: format!("{base}/graphql"),
            client,
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .with_context(|| format!("post {}", self.endpoint))?;
        let status = response.status();
        let body = response.bytes().await.context("read graphql body")?;
        anyhow::ensure!(
            status.is_success(),
            "graphql request failed with {status}: {}",
            String::from_utf8_lossy(&body)
        );
        decode(&body)
    }
}

#[async_trait]
impl BackendGateway for GraphqlGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, record: &WriteRecord) -> anyhow::Result<Vec<i64>> {
        let variables = json!({
            "input": [{ "value": record.value, "person": { "id": record.entity } }]
        });
        let data: AddEventData = self.execute(ADD_EVENT, variables).await?;
        Ok(data
            .add_event
            .map(|payload| payload.event.into_iter().map(|row| row.value).collect())
            .unwrap_or_default())
    }

    async fn aggregate_count(&self) -> anyhow::Result<u64> {
        let data: AggregateData = self.execute(AGGREGATE_EVENT, json!({})).await?;
        Ok(data.aggregate_event.map(|agg| agg.count).unwrap_or(0))
    }

    async fn page(&self, page_size: usize, offset: u64) -> anyhow::Result<Vec<i64>> {
        let data: QueryEventData = self
            .execute(QUERY_EVENT, json!({ "first": page_size, "offset": offset }))
            .await?;
        Ok(data.query_event.into_iter().map(|row| row.value).collect())
    }
}
