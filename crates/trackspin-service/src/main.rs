use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use trackspin_api::{
    upload_datasets, ApiOptions, LastTrackResponse, NextTrackRequest, NextTrackResponse,
    RecommendApi, Variant, API_CONTRACT_VERSION,
};
use trackspin_core::{Track, TrackId, UserId};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Clone)]
struct ServiceState {
    api: RecommendApi,
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
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "trackspin-service")]
#[command(about = "Local HTTP service for the Trackspin recommender")]
struct Args {
    #[arg(long, default_value = "./trackspin.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4017")]
    bind: SocketAddr,
    /// JSONL catalog to upload at startup.
    #[arg(long)]
    tracks_catalog: Option<PathBuf>,
    /// JSONL taste profiles to upload at startup; requires --tracks-catalog.
    #[arg(long)]
    taste_profiles: Option<PathBuf>,
    /// Append playback events to this JSONL file.
    #[arg(long)]
    play_log: Option<PathBuf>,
    /// Pin every request to one arm instead of experiment assignment.
    #[arg(long)]
    variant: Option<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    fn not_found(message: impl Into<String>) -> ServiceError {
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            status: StatusCode::NOT_FOUND,
        }
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

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/track/:track_id", get(track_show))
        .route("/v1/next/:user_id", post(next_track))
        .route("/v1/last/:user_id", post(last_track))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let variant = match &args.variant {
        Some(raw) => {
            Some(Variant::parse(raw).ok_or_else(|| anyhow!("unknown variant '{raw}'"))?)
        }
        None => None,
    };
    let api = RecommendApi::open(&args.db, ApiOptions { variant, play_log: args.play_log })?;

    if let Some(tracks_catalog) = &args.tracks_catalog {
        upload_datasets(api.store(), tracks_catalog, args.taste_profiles.as_deref())?;
    } else if args.taste_profiles.is_some() {
        return Err(anyhow!("--taste-profiles requires --tracks-catalog"));
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn track_show(
    State(state): State<ServiceState>,
    Path(track_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<Track>>, ServiceError> {
    let track = state
        .api
        .track_info(TrackId(track_id))
        .map_err(|err| ServiceState::error(err.to_string()))?
        .ok_or_else(|| ServiceState::not_found(format!("track not found: {track_id}")))?;
    Ok(Json(envelope(track)))
}

async fn next_track(
    State(state): State<ServiceState>,
    Path(user_id): Path<i64>,
    Json(request): Json<NextTrackRequest>,
) -> Result<Json<ServiceEnvelope<NextTrackResponse>>, ServiceError> {
    let response = state
        .api
        .next_track(UserId(user_id), &request)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(response)))
}

async fn last_track(
    State(state): State<ServiceState>,
    Path(user_id): Path<i64>,
    Json(request): Json<NextTrackRequest>,
) -> Result<Json<ServiceEnvelope<LastTrackResponse>>, ServiceError> {
    let response = state
        .api
        .last_track(UserId(user_id), &request)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(response)))
}
