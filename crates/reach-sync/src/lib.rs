//! Batch synchronization of reach attributes across the hosted layers.
//!
//! One job per business key: fetch the reach from the source, coerce it
//! into the typed entity, derive the geometry attributes, then push an
//! attribute-only update to the line layer and the centroid layer. Jobs
//! run on a fixed-size worker pool; a failure in one job never touches its
//! siblings, and the whole run always comes back as a [`BatchReport`].

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reach_core::{LayerKind, PayloadScope, Reach};
use reach_gis::{
    FeatureLayer, GisError, RestClient, RestClientConfig, TargetLayer, UpdateOutcome,
};
use reach_source::{AwSource, ReachSource, SourceError};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reach-sync";

/// Stages a job moves through, in fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Pending,
    Fetching,
    Computing,
    UpdatingLine,
    UpdatingCentroid,
    Done,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Pending => "pending",
            JobStage::Fetching => "fetching",
            JobStage::Computing => "computing",
            JobStage::UpdatingLine => "updating(line)",
            JobStage::UpdatingCentroid => "updating(centroid)",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Done | JobStage::Failed)
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classified cause of a failed job, folded into the batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    SourceNotFound,
    InvalidRecord,
    TargetNotFound,
    DuplicateKey,
    PartialWrite,
    WriteRejected,
    Transport,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceUnavailable => "source-unavailable",
            FailureKind::SourceNotFound => "source-not-found",
            FailureKind::InvalidRecord => "invalid-record",
            FailureKind::TargetNotFound => "target-not-found",
            FailureKind::DuplicateKey => "duplicate-key",
            FailureKind::PartialWrite => "partial-write",
            FailureKind::WriteRejected => "write-rejected",
            FailureKind::Transport => "transport",
        }
    }
}

fn classify_source_error(err: &SourceError) -> FailureKind {
    match err {
        SourceError::Unavailable { .. } => FailureKind::SourceUnavailable,
        SourceError::NotFound { .. } => FailureKind::SourceNotFound,
        SourceError::Parse { .. } => FailureKind::InvalidRecord,
    }
}

fn classify_gis_error(err: &GisError) -> FailureKind {
    match err {
        GisError::TargetNotFound { .. } => FailureKind::TargetNotFound,
        GisError::DuplicateKey { .. } => FailureKind::DuplicateKey,
        GisError::WriteRejected { .. } => FailureKind::WriteRejected,
        GisError::Transport(_) | GisError::Malformed(_) => FailureKind::Transport,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobFailureRecord {
    pub reach_id: String,
    pub stage: JobStage,
    pub kind: FailureKind,
    pub detail: String,
}

#[derive(Debug, Clone)]
struct JobSuccess {
    no_geometry: bool,
}

#[derive(Debug, Clone)]
struct JobOutcome {
    reach_id: String,
    result: Result<JobSuccess, (JobStage, FailureKind, String)>,
}

/// Aggregate result of one batch run. Always produced, even when every
/// job failed; only setup problems abort a run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Unique keys accepted for scheduling after deduplication.
    pub scheduled: usize,
    pub succeeded: usize,
    pub not_found: usize,
    pub duplicate_key: usize,
    pub fetch_failed: usize,
    pub update_failed: usize,
    /// Successful jobs whose reach had no line geometry anywhere; their
    /// updates went out with length omitted.
    pub no_geometry: usize,
    /// Keys left unclaimed because the run was cancelled.
    pub skipped_by_cancel: usize,
    pub failures: Vec<JobFailureRecord>,
}

impl BatchReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, scheduled: usize) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            scheduled,
            succeeded: 0,
            not_found: 0,
            duplicate_key: 0,
            fetch_failed: 0,
            update_failed: 0,
            no_geometry: 0,
            skipped_by_cancel: 0,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome.result {
            Ok(success) => {
                self.succeeded += 1;
                if success.no_geometry {
                    self.no_geometry += 1;
                }
            }
            Err((stage, kind, detail)) => {
                match kind {
                    FailureKind::TargetNotFound => self.not_found += 1,
                    FailureKind::DuplicateKey => self.duplicate_key += 1,
                    FailureKind::SourceUnavailable
                    | FailureKind::SourceNotFound
                    | FailureKind::InvalidRecord => self.fetch_failed += 1,
                    FailureKind::PartialWrite
                    | FailureKind::WriteRejected
                    | FailureKind::Transport => self.update_failed += 1,
                }
                self.failures.push(JobFailureRecord {
                    reach_id: outcome.reach_id,
                    stage,
                    kind,
                    detail,
                });
            }
        }
    }

    pub fn completed(&self) -> usize {
        self.succeeded + self.failures.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Count table plus failure log, one line per failed key.
    pub fn summary_markdown(&self) -> String {
        let mut lines = vec![
            "# Reach Sync Report".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Scheduled: {}", self.scheduled),
            String::new(),
            "## Totals".to_string(),
            format!("- succeeded: {}", self.succeeded),
            format!("- not_found: {}", self.not_found),
            format!("- duplicate_key: {}", self.duplicate_key),
            format!("- fetch_failed: {}", self.fetch_failed),
            format!("- update_failed: {}", self.update_failed),
            format!("- no_geometry: {}", self.no_geometry),
            format!("- skipped_by_cancel: {}", self.skipped_by_cancel),
        ];

        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push("## Failures".to_string());
            for failure in &self.failures {
                lines.push(format!(
                    "- {}: {} {} ({})",
                    failure.reach_id,
                    failure.stage.as_str(),
                    failure.kind.as_str(),
                    failure.detail
                ));
            }
        }

        lines.join("\n")
    }

    /// Write `report.json` and `summary.md` under `<dir>/<run_id>/`.
    pub async fn write_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let run_dir = dir.join(self.run_id.to_string());
        tokio::fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(self).context("serializing batch report")?;
        tokio::fs::write(run_dir.join("report.json"), json)
            .await
            .context("writing report.json")?;

        tokio::fs::write(run_dir.join("summary.md"), self.summary_markdown())
            .await
            .context("writing summary.md")?;

        Ok(run_dir)
    }
}

/// The only fatal errors: a run that could not be set up at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("no reach ids to synchronize")]
    EmptyKeySet,
}

/// Schedules per-key sync jobs across a worker pool and aggregates their
/// outcomes. Holds only shared immutable handles; all per-job state lives
/// inside the job.
pub struct BatchOrchestrator {
    source: Arc<dyn ReachSource>,
    line: Arc<dyn TargetLayer>,
    centroid: Arc<dyn TargetLayer>,
    scope: PayloadScope,
}

impl BatchOrchestrator {
    pub fn new(
        source: Arc<dyn ReachSource>,
        line: Arc<dyn TargetLayer>,
        centroid: Arc<dyn TargetLayer>,
    ) -> Self {
        Self {
            source,
            line,
            centroid,
            scope: PayloadScope::Full,
        }
    }

    pub fn with_scope(mut self, scope: PayloadScope) -> Self {
        self.scope = scope;
        self
    }

    /// Run one batch over the given keys with `concurrency` workers.
    ///
    /// Keys are deduplicated before scheduling and each surviving key is
    /// claimed by exactly one worker. Cancelling the token stops workers
    /// from claiming new keys; jobs already in flight drain. Per-job
    /// failures are folded into the report and never abort the batch.
    pub async fn run(
        &self,
        reach_ids: impl IntoIterator<Item = String>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<BatchReport, SetupError> {
        if concurrency == 0 {
            return Err(SetupError::InvalidConcurrency);
        }
        let keys: BTreeSet<String> = reach_ids.into_iter().collect();
        if keys.is_empty() {
            return Err(SetupError::EmptyKeySet);
        }

        let scheduled = keys.len();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, scheduled, concurrency, "starting reach sync batch");

        let queue: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(keys.into_iter().collect()));

        let mut workers = JoinSet::new();
        for _ in 0..concurrency.min(scheduled) {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let source = Arc::clone(&self.source);
            let line = Arc::clone(&self.line);
            let centroid = Arc::clone(&self.centroid);
            let scope = self.scope;

            workers.spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let claimed = queue.lock().expect("work queue lock").pop_front();
                    let Some(reach_id) = claimed else {
                        break;
                    };
                    let outcome =
                        run_job(&*source, &*line, &*centroid, scope, &reach_id).await;
                    outcomes.push(outcome);
                }
                outcomes
            });
        }

        let mut report = BatchReport::new(run_id, started_at, scheduled);
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        report.record(outcome);
                    }
                }
                Err(err) => {
                    warn!(%run_id, error = %err, "sync worker aborted");
                }
            }
        }

        report.skipped_by_cancel = queue.lock().expect("work queue lock").len();
        report.finished_at = Utc::now();
        info!(
            %run_id,
            succeeded = report.succeeded,
            failed = report.failed(),
            skipped = report.skipped_by_cancel,
            "reach sync batch finished"
        );
        Ok(report)
    }
}

async fn run_job(
    source: &dyn ReachSource,
    line: &dyn TargetLayer,
    centroid: &dyn TargetLayer,
    scope: PayloadScope,
    reach_id: &str,
) -> JobOutcome {
    let failed = |stage: JobStage, kind: FailureKind, detail: String| JobOutcome {
        reach_id: reach_id.to_string(),
        result: Err((stage, kind, detail)),
    };

    // Fetching
    let record = match source.fetch(reach_id).await {
        Ok(record) => record,
        Err(err) => {
            warn!(reach_id, error = %err, "reach fetch failed");
            return failed(JobStage::Fetching, classify_source_error(&err), err.to_string());
        }
    };

    // Computing
    let mut reach = match Reach::from_record(record) {
        Ok(reach) => reach,
        Err(err) => {
            return failed(JobStage::Computing, FailureKind::InvalidRecord, err.to_string())
        }
    };

    // Updating(line). When the source document carried no course, the
    // stored line feature's geometry is the authoritative course and the
    // length is derived from it before the payload is built.
    let line_feature = match line.find_by_reach_id(reach_id).await {
        Ok(feature) => feature,
        Err(err) => {
            return failed(JobStage::UpdatingLine, classify_gis_error(&err), err.to_string())
        }
    };
    if reach.length_km.is_none() {
        if let Some(geometry) = line_feature.geometry.clone() {
            if !geometry.is_empty() {
                reach.set_geometry(geometry);
            }
        }
    }

    let payload = reach.attribute_payload(scope, line.kind(), line.schema().writable());
    match line.update_attributes(&line_feature, &payload).await {
        Ok(UpdateOutcome::Success) => {}
        Ok(UpdateOutcome::PartialFailure { rejected_columns }) => {
            return failed(
                JobStage::UpdatingLine,
                FailureKind::PartialWrite,
                format!("target skipped columns: {}", rejected_columns.join(", ")),
            );
        }
        Err(err) => {
            return failed(JobStage::UpdatingLine, classify_gis_error(&err), err.to_string())
        }
    }

    // Updating(centroid)
    let centroid_feature = match centroid.find_by_reach_id(reach_id).await {
        Ok(feature) => feature,
        Err(err) => {
            return failed(
                JobStage::UpdatingCentroid,
                classify_gis_error(&err),
                err.to_string(),
            )
        }
    };
    let payload = reach.attribute_payload(scope, centroid.kind(), centroid.schema().writable());
    match centroid.update_attributes(&centroid_feature, &payload).await {
        Ok(UpdateOutcome::Success) => {}
        Ok(UpdateOutcome::PartialFailure { rejected_columns }) => {
            return failed(
                JobStage::UpdatingCentroid,
                FailureKind::PartialWrite,
                format!("target skipped columns: {}", rejected_columns.join(", ")),
            );
        }
        Err(err) => {
            return failed(
                JobStage::UpdatingCentroid,
                classify_gis_error(&err),
                err.to_string(),
            )
        }
    }

    info!(reach_id, "reach sync job done");
    JobOutcome {
        reach_id: reach_id.to_string(),
        result: Ok(JobSuccess {
            no_geometry: reach.length_km.is_none(),
        }),
    }
}

/// Which keys a batch run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    /// Every reach with a gauge association, the usual refresh set.
    GaugedOnly,
    /// Every key present in the line layer.
    All,
    /// Caller-supplied keys.
    Explicit(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub aw_base_url: String,
    pub line_layer_url: String,
    pub centroid_layer_url: String,
    pub gis_token: Option<String>,
    pub concurrency: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub reports_dir: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            aw_base_url: std::env::var("AW_BASE_URL")
                .unwrap_or_else(|_| "https://www.americanwhitewater.org".to_string()),
            line_layer_url: std::env::var("REACH_LINE_LAYER").unwrap_or_default(),
            centroid_layer_url: std::env::var("REACH_CENTROID_LAYER").unwrap_or_default(),
            gis_token: std::env::var("GIS_TOKEN").ok().filter(|t| !t.is_empty()),
            concurrency: std::env::var("REACH_SYNC_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            http_timeout_secs: std::env::var("REACH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("REACH_USER_AGENT")
                .unwrap_or_else(|_| "reach-sync/0.1".to_string()),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
        }
    }
}

/// Build the pipeline from the environment, run one batch, and write the
/// run report. The entry point the CLI calls.
pub async fn run_sync_once(
    config: &SyncConfig,
    scope: PayloadScope,
    selection: KeySelection,
    concurrency_override: Option<usize>,
    cancel: CancellationToken,
) -> anyhow::Result<BatchReport> {
    anyhow::ensure!(
        !config.line_layer_url.is_empty(),
        "REACH_LINE_LAYER must be set to the line layer url"
    );
    anyhow::ensure!(
        !config.centroid_layer_url.is_empty(),
        "REACH_CENTROID_LAYER must be set to the centroid layer url"
    );

    let client = Arc::new(RestClient::new(RestClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        token: config.gis_token.clone(),
        ..Default::default()
    })?);

    let line = FeatureLayer::connect(
        Arc::clone(&client),
        config.line_layer_url.clone(),
        LayerKind::Line,
    )
    .await
    .context("connecting to the line layer")?;
    let centroid = FeatureLayer::connect(
        Arc::clone(&client),
        config.centroid_layer_url.clone(),
        LayerKind::Centroid,
    )
    .await
    .context("connecting to the centroid layer")?;

    let keys = match selection {
        KeySelection::GaugedOnly => line
            .query_unique_keys("reach_id", Some("gauge_id IS NOT NULL"))
            .await
            .context("enumerating gauged reach ids")?
            .into_iter()
            .collect(),
        KeySelection::All => line
            .query_unique_keys("reach_id", None)
            .await
            .context("enumerating reach ids")?
            .into_iter()
            .collect(),
        KeySelection::Explicit(keys) => keys,
    };

    let source = AwSource::new(Arc::clone(&client), config.aw_base_url.clone());
    let orchestrator = BatchOrchestrator::new(
        Arc::new(source),
        Arc::new(line),
        Arc::new(centroid),
    )
    .with_scope(scope);

    let concurrency = concurrency_override.unwrap_or(config.concurrency);
    let report = orchestrator.run(keys, concurrency, cancel).await?;

    let run_dir = report.write_to(&config.reports_dir).await?;
    info!(run_dir = %run_dir.display(), "batch report written");
    Ok(report)
}
