//! Hosted feature-layer access: retrying REST transport, layer schema
//! cache, and attribute-only edits keyed by `reach_id`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reach_core::{LayerKind, Point, ReachGeometry, UpdatePayload};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "reach-gis";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            token: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Immutable JSON-over-HTTP connection handle shared by the source fetcher
/// and the feature layers. Constructed once and passed in explicitly; there
/// is no ambient session.
#[derive(Debug)]
pub struct RestClient {
    client: reqwest::Client,
    token: Option<String>,
    backoff: BackoffPolicy,
}

impl RestClient {
    pub fn new(config: RestClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            token: config.token,
            backoff: config.backoff,
        })
    }

    fn with_token<'a>(&'a self, params: &'a [(&'a str, String)]) -> Vec<(&'a str, String)> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        if let Some(token) = &self.token {
            all.push(("token", token.clone()));
        }
        all
    }

    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, TransportError> {
        let params = self.with_token(params);
        self.execute_json(|| self.client.get(url).query(&params), url)
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, TransportError> {
        let params = self.with_token(params);
        self.execute_json(|| self.client.post(url).form(&params), url)
            .await
    }

    async fn execute_json<F>(&self, make_request: F, url: &str) -> Result<JsonValue, TransportError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let span = info_span!("gis_request", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match make_request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(TransportError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(TransportError::Request(err));
                }
            }
        }

        Err(TransportError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum GisError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("reach_id {reach_id} not present in target layer")]
    TargetNotFound { reach_id: String },
    #[error("reach_id {reach_id} matches {count} features in target layer")]
    DuplicateKey { reach_id: String, count: usize },
    #[error("target rejected the update (code {code}): {description}")]
    WriteRejected { code: i64, description: String },
    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

/// Reference to one stored feature. The line layer's geometry rides along
/// so length can be derived from the stored course when the source record
/// has none.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRef {
    pub object_id: i64,
    pub geometry: Option<ReachGeometry>,
}

/// Result of one accepted attribute write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Every attribute in the payload was written.
    Success,
    /// The target accepted the edit but skipped some columns; never
    /// silently swallowed, always surfaced in the batch report.
    PartialFailure { rejected_columns: Vec<String> },
}

/// Writable attribute columns for one target layer, captured once at
/// construction and shared read-only across jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSchema {
    writable: BTreeSet<String>,
}

impl LayerSchema {
    pub fn new(writable: BTreeSet<String>) -> Self {
        Self { writable }
    }

    /// Extract the writable, non-geometry columns from a layer metadata
    /// document. Object-id, geometry and system-maintained columns are
    /// never exposed as writable to this pipeline.
    pub fn from_layer_metadata(metadata: &JsonValue) -> Result<Self, GisError> {
        let fields = metadata
            .get("fields")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| GisError::Malformed("layer metadata has no fields array".into()))?;

        let mut writable = BTreeSet::new();
        for field in fields {
            let name = field.get("name").and_then(JsonValue::as_str);
            let field_type = field.get("type").and_then(JsonValue::as_str).unwrap_or("");
            let editable = field
                .get("editable")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);

            if !editable
                || matches!(
                    field_type,
                    "esriFieldTypeOID" | "esriFieldTypeGeometry" | "esriFieldTypeGlobalID"
                )
            {
                continue;
            }
            if let Some(name) = name {
                writable.insert(name.to_string());
            }
        }
        Ok(Self { writable })
    }

    pub fn writable(&self) -> &BTreeSet<String> {
        &self.writable
    }

    pub fn is_writable(&self, column: &str) -> bool {
        self.writable.contains(column)
    }
}

/// One reach-keyed target dataset. The seam the orchestrator and tests
/// depend on; [`FeatureLayer`] is the hosted implementation.
#[async_trait]
pub trait TargetLayer: Send + Sync {
    fn kind(&self) -> LayerKind;

    fn schema(&self) -> &LayerSchema;

    /// Locate the single stored feature for a business key. Zero matches
    /// and multiple matches are distinct, reportable conditions; neither
    /// aborts a batch.
    async fn find_by_reach_id(&self, reach_id: &str) -> Result<FeatureRef, GisError>;

    /// Push an attribute-only update to one stored feature. Stored line
    /// geometry is never modified.
    async fn update_attributes(
        &self,
        feature: &FeatureRef,
        payload: &UpdatePayload,
    ) -> Result<UpdateOutcome, GisError>;

    /// Enumerate distinct values of one column, optionally filtered with a
    /// where clause.
    async fn query_unique_keys(
        &self,
        column: &str,
        filter: Option<&str>,
    ) -> Result<BTreeSet<String>, GisError>;
}

/// A hosted feature layer addressed by its service URL.
pub struct FeatureLayer {
    client: Arc<RestClient>,
    url: String,
    kind: LayerKind,
    schema: LayerSchema,
}

impl FeatureLayer {
    /// Connect to a layer and cache its writable schema.
    pub async fn connect(
        client: Arc<RestClient>,
        url: impl Into<String>,
        kind: LayerKind,
    ) -> Result<Self, GisError> {
        let url = url.into();
        let metadata = client
            .get_json(&url, &[("f", "json".to_string())])
            .await?;
        let schema = LayerSchema::from_layer_metadata(&metadata)?;
        Ok(Self {
            client,
            url,
            kind,
            schema,
        })
    }

    fn query_url(&self) -> String {
        format!("{}/query", self.url)
    }

    fn apply_edits_url(&self) -> String {
        format!("{}/applyEdits", self.url)
    }
}

#[async_trait]
impl TargetLayer for FeatureLayer {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    fn schema(&self) -> &LayerSchema {
        &self.schema
    }

    async fn find_by_reach_id(&self, reach_id: &str) -> Result<FeatureRef, GisError> {
        let return_geometry = self.kind == LayerKind::Line;
        let params = [
            ("f", "json".to_string()),
            ("where", reach_id_where_clause(reach_id)),
            ("outFields", "*".to_string()),
            ("returnGeometry", return_geometry.to_string()),
        ];
        let body = self.client.get_json(&self.query_url(), &params).await?;
        parse_find_response(&body, reach_id)
    }

    async fn update_attributes(
        &self,
        feature: &FeatureRef,
        payload: &UpdatePayload,
    ) -> Result<UpdateOutcome, GisError> {
        let updates = edit_feature_json(feature.object_id, payload);
        let params = [
            ("f", "json".to_string()),
            ("updates", json!([updates]).to_string()),
        ];
        let body = self
            .client
            .post_form(&self.apply_edits_url(), &params)
            .await?;
        classify_update_response(&body)
    }

    async fn query_unique_keys(
        &self,
        column: &str,
        filter: Option<&str>,
    ) -> Result<BTreeSet<String>, GisError> {
        let params = [
            ("f", "json".to_string()),
            ("where", filter.unwrap_or("1=1").to_string()),
            ("outFields", column.to_string()),
            ("returnDistinctValues", "true".to_string()),
            ("returnGeometry", "false".to_string()),
        ];
        let body = self.client.get_json(&self.query_url(), &params).await?;
        parse_unique_keys(&body, column)
    }
}

/// Where clause for a business-key lookup. Single quotes in the key are
/// doubled per the feature-service SQL dialect.
pub fn reach_id_where_clause(reach_id: &str) -> String {
    format!("reach_id = '{}'", reach_id.replace('\'', "''"))
}

/// Convert an esri polyline geometry (`{"paths": [[[x, y], ...], ...]}`)
/// into the domain geometry. Malformed vertices are skipped rather than
/// failing the whole feature.
pub fn parse_esri_paths(geometry: &JsonValue) -> ReachGeometry {
    let paths = geometry
        .get("paths")
        .and_then(JsonValue::as_array)
        .map(|paths| {
            paths
                .iter()
                .map(|path| {
                    path.as_array()
                        .map(|vertices| {
                            vertices
                                .iter()
                                .filter_map(|vertex| {
                                    let pair = vertex.as_array()?;
                                    let x = pair.first()?.as_f64()?;
                                    let y = pair.get(1)?.as_f64()?;
                                    Some(Point::new(x, y))
                                })
                                .collect()
                        })
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();
    ReachGeometry::new(paths)
}

pub fn parse_find_response(body: &JsonValue, reach_id: &str) -> Result<FeatureRef, GisError> {
    let features = body
        .get("features")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| GisError::Malformed("query response has no features array".into()))?;

    match features.len() {
        0 => Err(GisError::TargetNotFound {
            reach_id: reach_id.to_string(),
        }),
        1 => {
            let feature = &features[0];
            let oid_field = body
                .get("objectIdFieldName")
                .and_then(JsonValue::as_str)
                .unwrap_or("OBJECTID");
            let object_id = feature
                .get("attributes")
                .and_then(|attrs| attrs.get(oid_field))
                .and_then(JsonValue::as_i64)
                .ok_or_else(|| {
                    GisError::Malformed(format!("feature is missing object id field {oid_field}"))
                })?;
            let geometry = feature.get("geometry").map(parse_esri_paths);
            Ok(FeatureRef {
                object_id,
                geometry,
            })
        }
        count => Err(GisError::DuplicateKey {
            reach_id: reach_id.to_string(),
            count,
        }),
    }
}

/// Build the `applyEdits` update entry for one feature. Only centroid
/// payloads carry geometry, as a point in wkid 4326.
pub fn edit_feature_json(object_id: i64, payload: &UpdatePayload) -> JsonValue {
    let mut attributes = serde_json::Map::new();
    attributes.insert("OBJECTID".to_string(), json!(object_id));
    for (column, value) in &payload.attributes {
        attributes.insert(column.clone(), value.clone());
    }

    match payload.geometry {
        Some(point) => json!({
            "attributes": attributes,
            "geometry": {
                "x": point.x,
                "y": point.y,
                "spatialReference": {"wkid": 4326},
            },
        }),
        None => json!({ "attributes": attributes }),
    }
}

/// Classify an `applyEdits` response for a single-feature update.
///
/// A rejected edit keeps the target's raw error code and description; an
/// accepted edit that skipped columns is a partial failure, never folded
/// into success.
pub fn classify_update_response(body: &JsonValue) -> Result<UpdateOutcome, GisError> {
    let result = body
        .get("updateResults")
        .and_then(JsonValue::as_array)
        .and_then(|results| results.first())
        .ok_or_else(|| GisError::Malformed("applyEdits response has no updateResults".into()))?;

    let success = result
        .get("success")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);

    if !success {
        let code = result
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(JsonValue::as_i64)
            .unwrap_or(-1);
        let description = result
            .get("error")
            .and_then(|e| e.get("description"))
            .and_then(JsonValue::as_str)
            .unwrap_or("update rejected without detail")
            .to_string();
        return Err(GisError::WriteRejected { code, description });
    }

    let rejected_columns: Vec<String> = result
        .get("rejectedFields")
        .and_then(JsonValue::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();

    if rejected_columns.is_empty() {
        Ok(UpdateOutcome::Success)
    } else {
        Ok(UpdateOutcome::PartialFailure { rejected_columns })
    }
}

pub fn parse_unique_keys(body: &JsonValue, column: &str) -> Result<BTreeSet<String>, GisError> {
    let features = body
        .get("features")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| GisError::Malformed("query response has no features array".into()))?;

    let mut keys = BTreeSet::new();
    for feature in features {
        let Some(value) = feature.get("attributes").and_then(|attrs| attrs.get(column)) else {
            continue;
        };
        match value {
            JsonValue::String(s) => {
                keys.insert(s.clone());
            }
            JsonValue::Number(n) => {
                keys.insert(n.to_string());
            }
            _ => {}
        }
    }
    Ok(keys)
}
