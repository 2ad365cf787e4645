use crate::{
    app::App,
    semantic::{
        query::{merge_options, FilterSet},
        SearchError, SearchResult, SearchService,
    },
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    service: Arc<SearchService>,
}

pub fn start_daemon(app: App, port: u16) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(app, port).await })
}

async fn start_app(app: App, port: u16) -> anyhow::Result<()> {
    async fn shutdown_signal() {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        log::warn!("shutting down");
    }

    // both run on their own threads; requests are served meanwhile
    app.start_model();
    app.spawn_preload();

    let router = router(app.service().clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("listening on 0.0.0.0:{port}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub(crate) fn router(service: Arc<SearchService>) -> Router {
    let shared_state = Arc::new(SharedState { service });

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/search", get(search_get).post(search_post))
        .route("/preload/:granularity", post(preload))
        .route("/embed", post(embed))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

#[derive(Debug)]
enum HttpError {
    Search(SearchError),
    BadRequest(String),
}

impl From<SearchError> for HttpError {
    fn from(err: SearchError) -> Self {
        Self::Search(err)
    }
}

impl From<JsonRejection> for HttpError {
    fn from(err: JsonRejection) -> Self {
        Self::BadRequest(format!("Invalid request body: {}", err.body_text()))
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::Search(SearchError::NotLoaded(_)) => StatusCode::NOT_FOUND,
            HttpError::Search(SearchError::UnknownGranularity(_)) => StatusCode::BAD_REQUEST,
            HttpError::Search(SearchError::Load(_)) => {
                log::error!("{self:?}");
                StatusCode::BAD_GATEWAY
            }
            HttpError::Search(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match self {
            HttpError::BadRequest(message) => message,
            HttpError::Search(err) => err.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn status(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    Json(json!({
        "initialized": true,
        "indices": state.service.status(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
    query: Option<String>,
    k: Option<String>,
    book: Option<String>,
    chapter: Option<String>,
    verse: Option<String>,
    granularity: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(default)]
    query: String,
    #[serde(default)]
    options: FilterSet,
    #[serde(flatten)]
    explicit: FilterSet,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<VerseResult>,
    count: usize,
    status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerseResult {
    book: String,
    chapter: i64,
    verse_num: i64,
    text: String,
    #[serde(rename = "_searchMeta")]
    search_meta: SearchMeta,
}

#[derive(Debug, Serialize)]
struct SearchMeta {
    similarity: f32,
    score: f32,
    reference: String,
}

impl From<SearchResult> for VerseResult {
    fn from(result: SearchResult) -> Self {
        let meta = result.chunk.meta;
        VerseResult {
            book: meta.book,
            chapter: meta.chapter,
            verse_num: meta.verse_num.unwrap_or(0),
            text: result.chunk.text,
            search_meta: SearchMeta {
                similarity: result.similarity,
                score: result.score,
                reference: meta.reference.unwrap_or_default(),
            },
        }
    }
}

async fn search_get(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, HttpError> {
    let query = params
        .q
        .filter(|q| !q.is_empty())
        .or(params.query)
        .unwrap_or_default();

    // unparseable k is ignored
    let explicit = FilterSet {
        book: params.book,
        chapter: params.chapter,
        verse: params.verse,
        granularity: params.granularity,
        k: params.k.and_then(|k| k.trim().parse().ok()),
    };

    run_search(state, query, explicit, FilterSet::default())
}

async fn search_post(
    State(state): State<Arc<SharedState>>,
    payload: Result<Json<SearchBody>, JsonRejection>,
) -> Result<Json<SearchResponse>, HttpError> {
    let Json(body) = payload?;
    log::debug!("payload: {body:?}");

    run_search(state, body.query, body.explicit, body.options)
}

fn run_search(
    state: Arc<SharedState>,
    raw_query: String,
    explicit: FilterSet,
    nested: FilterSet,
) -> Result<Json<SearchResponse>, HttpError> {
    let (text, options) =
        merge_options(&raw_query, &explicit, &nested).map_err(SearchError::from)?;

    let results =
        tokio::task::block_in_place(move || state.service.search(&text, &options))?;

    let results: Vec<VerseResult> = results.into_iter().map(Into::into).collect();

    Ok(Json(SearchResponse {
        query: raw_query,
        count: results.len(),
        results,
        status: "success",
    }))
}

async fn preload(
    State(state): State<Arc<SharedState>>,
    Path(granularity): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let service = state.service.clone();
    let name = granularity.clone();
    let outcome = tokio::task::block_in_place(move || service.preload_granularity(&name))?;

    // another request owns the load; searches 404 until it lands
    let (code, status) = if outcome.is_ready() {
        (StatusCode::OK, "loaded")
    } else {
        (StatusCode::ACCEPTED, "loading")
    };

    Ok((
        code,
        Json(json!({
            "status": status,
            "granularity": granularity,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct EmbedRequest {
    #[serde(default)]
    text: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
    dimensions: usize,
}

async fn embed(
    State(state): State<Arc<SharedState>>,
    payload: Result<Json<EmbedRequest>, JsonRejection>,
) -> Result<Json<EmbedResponse>, HttpError> {
    let Json(request) = payload?;

    if request.text.is_empty() {
        return Err(HttpError::BadRequest("Text is required".to_string()));
    }

    let chain = state.service.chain().clone();
    let embedding = tokio::task::block_in_place(move || match request.kind.as_deref() {
        Some("document") => chain.embed_document(&request.text),
        _ => chain.embed_query(&request.text),
    })
    .map_err(SearchError::from)?;

    Ok(Json(EmbedResponse {
        dimensions: embedding.len(),
        embedding,
    }))
}
