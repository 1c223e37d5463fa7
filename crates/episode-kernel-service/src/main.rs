use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use episode_kernel_api::{
    EpisodeKernel, EpisodeOutcome, ErrorBody, GuardStats, IngestError, SetupResult,
    API_CONTRACT_VERSION,
};
use episode_kernel_core::{
    Episode, FactRecord, KernelConfig, NewEpisode, ScoredFact, SubjectMatch,
};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Clone)]
struct ServiceState {
    kernel: Arc<EpisodeKernel>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct BulkRequest {
    episodes: Vec<NewEpisode>,
}

#[derive(Debug, Clone, Serialize)]
struct BulkEntry {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<EpisodeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
struct BulkResponse {
    succeeded: usize,
    failed: usize,
    results: Vec<BulkEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct RecentQuery {
    reference_time: Option<String>,
    last_n: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    as_of: Option<OffsetDateTime>,
    #[serde(default = "default_num_results")]
    num_results: usize,
}

#[derive(Debug, Clone, Serialize)]
struct SearchResponse {
    #[serde(with = "time::serde::rfc3339")]
    as_of: OffsetDateTime,
    results: Vec<ScoredFact>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubjectSearchRequest {
    query: String,
    #[serde(default = "default_num_results")]
    num_results: usize,
}

#[derive(Debug, Clone, Serialize)]
struct SubjectSearchResponse {
    subjects: Vec<SubjectMatch>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryRequest {
    subject: String,
    predicate: String,
}

fn default_num_results() -> usize {
    10
}

#[derive(Debug, Parser)]
#[command(name = "episode-kernel-service")]
#[command(about = "Local HTTP service for Episode Kernel")]
struct Args {
    #[arg(long, default_value = "./episode_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// YAML file with kernel settings.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn status_for(err: &IngestError) -> StatusCode {
    match err {
        IngestError::Validation(_) => StatusCode::BAD_REQUEST,
        IngestError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::AdmissionRejected(_) => StatusCode::TOO_MANY_REQUESTS,
        IngestError::TransientStorage(_)
        | IngestError::SupersessionConflict(_)
        | IngestError::RetryExhausted { .. }
        | IngestError::Timeout { .. }
        | IngestError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        IngestError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<IngestError> for ServiceError {
    fn from(err: IngestError) -> Self {
        Self {
            status: status_for(&err),
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.to_body(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn require_utc(value: OffsetDateTime, field: &str) -> Result<OffsetDateTime, ServiceError> {
    if value.offset() != UtcOffset::UTC {
        return Err(ServiceError::from(IngestError::Validation(format!(
            "{field} MUST use UTC offset Z"
        ))));
    }
    Ok(value)
}

fn parse_reference_time(value: Option<&str>) -> Result<OffsetDateTime, ServiceError> {
    match value {
        None => Ok(OffsetDateTime::now_utc()),
        Some(raw) => {
            let parsed =
                OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
                    .map_err(|err| {
                        ServiceError::from(IngestError::Validation(format!(
                            "invalid RFC3339 timestamp `{raw}`: {err}"
                        )))
                    })?;
            require_utc(parsed, "reference_time")
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/setup", post(setup))
        .route("/v1/episodes", post(add_episode))
        .route("/v1/episodes/bulk", post(add_episode_bulk))
        .route("/v1/episodes/recent", get(recent_episodes))
        .route("/v1/search", post(search))
        .route("/v1/subjects/search", post(search_subjects))
        .route("/v1/facts/history", post(fact_history))
        .route("/v1/stats", get(stats))
        .with_state(state)
}

fn load_config(path: Option<&std::path::Path>) -> Result<KernelConfig> {
    let Some(path) = path else {
        return Ok(KernelConfig::default());
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let kernel = EpisodeKernel::open(&args.db, config)?;
    kernel.build_indices_and_constraints().await?;
    let kernel = Arc::new(kernel);
    let state = ServiceState { kernel: Arc::clone(&kernel) };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "episode kernel service listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    kernel.close().await?;
    info!("episode kernel service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn setup(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SetupResult>>, ServiceError> {
    let result = state.kernel.build_indices_and_constraints().await?;
    Ok(Json(envelope(result)))
}

async fn add_episode(
    State(state): State<ServiceState>,
    Json(request): Json<NewEpisode>,
) -> Result<Json<ServiceEnvelope<EpisodeOutcome>>, ServiceError> {
    let outcome = state.kernel.add_episode(request).await?;
    Ok(Json(envelope(outcome)))
}

async fn add_episode_bulk(
    State(state): State<ServiceState>,
    Json(request): Json<BulkRequest>,
) -> Json<ServiceEnvelope<BulkResponse>> {
    let results = state.kernel.add_episode_bulk(request.episodes).await;
    let entries = results
        .into_iter()
        .map(|result| match result {
            Ok(outcome) => BulkEntry { ok: true, outcome: Some(outcome), error: None },
            Err(err) => BulkEntry { ok: false, outcome: None, error: Some(err.to_body()) },
        })
        .collect::<Vec<_>>();
    let succeeded = entries.iter().filter(|entry| entry.ok).count();
    Json(envelope(BulkResponse { succeeded, failed: entries.len() - succeeded, results: entries }))
}

async fn recent_episodes(
    State(state): State<ServiceState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Episode>>>, ServiceError> {
    let reference_time = parse_reference_time(query.reference_time.as_deref())?;
    let episodes =
        state.kernel.retrieve_episodes(reference_time, query.last_n.unwrap_or(10)).await?;
    Ok(Json(envelope(episodes)))
}

async fn search(
    State(state): State<ServiceState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<ServiceEnvelope<SearchResponse>>, ServiceError> {
    let as_of = match request.as_of {
        Some(as_of) => require_utc(as_of, "as_of")?,
        None => OffsetDateTime::now_utc(),
    };
    let results = state.kernel.search_as_of(&request.query, as_of, request.num_results).await?;
    Ok(Json(envelope(SearchResponse { as_of, results })))
}

async fn search_subjects(
    State(state): State<ServiceState>,
    Json(request): Json<SubjectSearchRequest>,
) -> Result<Json<ServiceEnvelope<SubjectSearchResponse>>, ServiceError> {
    let subjects = state.kernel.search_subjects(&request.query, request.num_results).await?;
    Ok(Json(envelope(SubjectSearchResponse { subjects })))
}

async fn fact_history(
    State(state): State<ServiceState>,
    Json(request): Json<HistoryRequest>,
) -> Result<Json<ServiceEnvelope<Vec<FactRecord>>>, ServiceError> {
    let records = state.kernel.fact_history(&request.subject, &request.predicate).await?;
    Ok(Json(envelope(records)))
}

async fn stats(State(state): State<ServiceState>) -> Json<ServiceEnvelope<GuardStats>> {
    Json(envelope(state.kernel.stats()))
}
