use std::net::SocketAddr;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::autocomplete::MatchedPair;
use crate::cli::ServeArgs;
use crate::codesystem::{self, DEFAULT_SIZE};
use crate::error::BridgeError;
use crate::services::Services;

const API_PREFIX: &str = "/api/v1";

#[derive(Clone)]
pub struct AppState {
    services: Services,
    /// Externally visible origin, without a trailing slash.
    public_base: String,
}

impl AppState {
    pub fn new(services: Services, public_base: impl Into<String>) -> Self {
        Self {
            services,
            public_base: public_base.into(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.public_base)
    }
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let services = Services::from_args(&opts.storage, &opts.remote)?;

    if opts.rebuild {
        let report = services
            .namaste
            .rebuild()
            .await
            .context("rebuild NAMASTE index")?;
        tracing::info!(
            "Rebuilt NAMASTE index: {} records in {}",
            report.total_indexed(),
            report.generation
        );
    } else if let Err(e) = services.namaste.list(1).await {
        tracing::warn!("{}. Run: terminology-backend build (or GET /api/v1/sync)", e);
    }

    let state = AppState::new(services, opts.public_base());
    let app = router(state);

    let addr = tokio::net::lookup_host((opts.host.as_str(), opts.port))
        .await
        .context("resolve host:port")?
        .next()
        .with_context(|| format!("no address for {}:{}", opts.host, opts.port))?;
    serve_on(addr, app).await
}

async fn serve_on(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(api_health))
        .route("/sync", get(api_sync))
        .route("/autocomplete", get(api_autocomplete))
        .route("/codesystem/namaste", get(api_codesystem_namaste))
        .route("/codesystem/icd", get(api_codesystem_icd));

    Router::new()
        .nest(API_PREFIX, api)
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Message {
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn internal(e: BridgeError) -> Response {
    if e.is_transient() {
        tracing::warn!("request failed: {}", e);
    } else {
        tracing::error!("request failed: {}", e);
    }
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
}

async fn api_health() -> impl IntoResponse {
    Json(Message { message: "ok" })
}

async fn api_sync(State(st): State<AppState>) -> Response {
    match st.services.autocomplete.update().await {
        Ok(report) => {
            tracing::info!(
                "Synced NAMASTE index {} ({} records)",
                report.generation,
                report.total_indexed()
            );
            Json(Message {
                message: "All repositories synced",
            })
            .into_response()
        }
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
struct AutocompleteParams {
    query: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueSet {
    resource_type: &'static str,
    id: &'static str,
    status: &'static str,
    expansion: Expansion,
}

#[derive(Debug, Serialize)]
struct Expansion {
    identifier: String,
    timestamp: DateTime<Utc>,
    total: usize,
    offset: usize,
    contains: Vec<Contain>,
}

#[derive(Debug, Serialize)]
struct Contain {
    system: String,
    code: String,
    display: String,
    extension: Extension,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Extension {
    url: String,
    value_string: &'static str,
}

fn value_set(st: &AppState, pair: MatchedPair, timestamp: DateTime<Utc>) -> ValueSet {
    let source = |value_string| Extension {
        url: st.api_url("/structuredefinition/sourceSystem"),
        value_string,
    };
    let contains = vec![
        Contain {
            system: st.api_url("/codesystem/namaste"),
            code: pair.namaste.id,
            display: pair.namaste.name,
            extension: source("NAMASTE"),
        },
        Contain {
            system: st.api_url("/codesystem/icd"),
            code: pair.icd.id,
            display: pair.icd.name,
            extension: source("ICD"),
        },
    ];
    ValueSet {
        resource_type: "ValueSet",
        id: "autocomplete-results",
        status: "active",
        expansion: Expansion {
            identifier: st.api_url("/autocomplete"),
            timestamp,
            total: contains.len(),
            offset: 0,
            contains,
        },
    }
}

async fn api_autocomplete(
    State(st): State<AppState>,
    Query(p): Query<AutocompleteParams>,
) -> Response {
    let query = p.query.as_deref().map(str::trim).unwrap_or("");
    if query.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing query parameter: query");
    }

    // Dropping the handler (client went away) cancels the matcher call.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match st.services.autocomplete.find(&cancel, query).await {
        Ok(matches) => {
            let now = Utc::now();
            let sets: Vec<ValueSet> = matches
                .diseases
                .into_iter()
                .map(|pair| value_set(&st, pair, now))
                .collect();
            Json(sets).into_response()
        }
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
struct CodeSystemParams {
    size: Option<String>,
}

fn parse_size(p: &CodeSystemParams) -> Result<usize, Response> {
    match p.size.as_deref().map(str::trim) {
        None | Some("") => Ok(DEFAULT_SIZE),
        Some(s) => s.parse::<usize>().map_err(|e| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("unable to parse size: {e}"),
            )
        }),
    }
}

async fn api_codesystem_namaste(
    State(st): State<AppState>,
    Query(p): Query<CodeSystemParams>,
) -> Response {
    let size = match parse_size(&p) {
        Ok(size) => size,
        Err(resp) => return resp,
    };
    let url = st.api_url("/codesystem/namaste");
    match codesystem::namaste_code_system(&st.services.namaste, size, &url).await {
        Ok(cs) => Json(cs).into_response(),
        Err(e) => internal(e),
    }
}

async fn api_codesystem_icd(
    State(st): State<AppState>,
    Query(p): Query<CodeSystemParams>,
) -> Response {
    let size = match parse_size(&p) {
        Ok(size) => size,
        Err(resp) => return resp,
    };
    let url = st.api_url("/codesystem/icd");
    match codesystem::icd_code_system(&st.services.icd, size, &url).await {
        Ok(cs) => Json(cs).into_response(),
        Err(e) => internal(e),
    }
}
