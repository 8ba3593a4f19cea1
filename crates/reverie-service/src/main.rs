use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use reverie_api::{
    ErrorKind, FinalizeRequest, HistoryResponse, PipelineConfig, PlayTurnRequest,
    ProfileResponse, SceneResponse, SessionApi, SessionError, StartGameRequest, TimeoutStage,
    API_CONTRACT_VERSION,
};
use reverie_provider::{HttpChatProvider, HttpProviderConfig};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
/// Slack past the request deadline for a store write that already started.
const PERSIST_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct ServiceState {
    api: SessionApi,
    request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
    raw_output: Option<String>,
    kind: &'static str,
}

#[derive(Debug)]
struct ServiceError(SessionError);

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    api_contract_version: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Parser)]
#[command(name = "reverie-service")]
#[command(about = "HTTP service for the Reverie narrative game")]
struct Args {
    #[arg(long, env = "REVERIE_DB", default_value = "./reverie.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "REVERIE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "REVERIE_PROVIDER_BASE_URL", default_value = reverie_provider::DEFAULT_BASE_URL)]
    provider_base_url: String,
    #[arg(long, env = "REVERIE_MODEL", default_value = reverie_provider::DEFAULT_MODEL)]
    model: String,
    #[arg(long, env = "MISTRAL_API_KEY", hide_env_values = true)]
    api_key: String,
    #[arg(
        long,
        env = "REVERIE_GENERATION_TIMEOUT_SECS",
        default_value_t = reverie_provider::DEFAULT_GENERATION_TIMEOUT.as_secs()
    )]
    generation_timeout_secs: u64,
    #[arg(long, env = "REVERIE_STORE_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    store_busy_timeout_ms: u64,
    #[arg(long, env = "REVERIE_REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    request_timeout_secs: u64,
    #[arg(long, env = "REVERIE_MIN_FINALIZE_TURNS", default_value_t = 1)]
    min_finalize_turns: u64,
    #[arg(long, env = "REVERIE_ALLOWED_ORIGIN", default_value = "http://localhost:3000")]
    allowed_origin: String,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InsufficientHistory => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::GenerationParse | ErrorKind::Generation => StatusCode::BAD_GATEWAY,
        ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Conflict => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::warn!(kind = kind.as_str(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            raw_output: self.0.raw_output().map(str::to_string),
            kind: kind.as_str(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ServiceError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self(SessionError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        Self(SessionError::Validation(rejection.body_text()))
    }
}

impl ServiceState {
    /// Run a pipeline call on the blocking pool, bounded by the request timeout.
    ///
    /// The job carries the request deadline itself and stops before writing once it has
    /// passed. The outer timeout leaves room for a write that already began.
    async fn run<T, F>(&self, job: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(SessionApi) -> Result<T, SessionError> + Send + 'static,
    {
        let api = self.api.clone().with_deadline(Instant::now() + self.request_timeout);
        let task = tokio::task::spawn_blocking(move || job(api));
        let hard_limit =
            self.request_timeout + self.api.config().store_busy_timeout + PERSIST_GRACE;
        match tokio::time::timeout(hard_limit, task).await {
            Ok(Ok(result)) => result.map_err(ServiceError),
            Ok(Err(join_err)) => Err(ServiceError(SessionError::Generation(format!(
                "pipeline task aborted: {join_err}"
            )))),
            Err(_) => Err(ServiceError(SessionError::Timeout { stage: TimeoutStage::Request })),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/game/start", post(game_start))
        .route("/v1/game/turn", post(game_turn))
        .route("/v1/game/finalize", post(game_finalize))
        .route("/v1/game/:game_id/history", get(game_history))
        .with_state(state)
}

fn cors_layer(allowed_origin: &str) -> Result<CorsLayer> {
    let origin = allowed_origin
        .parse::<HeaderValue>()
        .with_context(|| format!("invalid allowed origin: {allowed_origin}"))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request()))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let args = Args::parse();

    let provider = HttpChatProvider::new(HttpProviderConfig {
        base_url: args.provider_base_url.clone(),
        model: args.model.clone(),
        api_key: args.api_key.clone(),
        timeout: Duration::from_secs(args.generation_timeout_secs),
    });
    let config = PipelineConfig {
        min_finalize_turns: args.min_finalize_turns,
        store_busy_timeout: Duration::from_millis(args.store_busy_timeout_ms),
    };
    let api = SessionApi::new(args.db.clone(), Arc::new(provider), config);

    let migration =
        api.history_api().migrate(false).context("failed to migrate history database")?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = ?migration.after_version,
        "history database ready"
    );

    let state =
        ServiceState { api, request_timeout: Duration::from_secs(args.request_timeout_secs) };
    let router = app(state)
        .layer(cors_layer(&args.allowed_origin)?)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, model = %args.model, "reverie service listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
    })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn game_start(
    State(state): State<ServiceState>,
    request: Result<Json<StartGameRequest>, JsonRejection>,
) -> Result<Json<SceneResponse>, ServiceError> {
    let Json(request) = request?;
    let response = state.run(move |api| api.start_game(&request)).await?;
    Ok(Json(response))
}

async fn game_turn(
    State(state): State<ServiceState>,
    request: Result<Json<PlayTurnRequest>, JsonRejection>,
) -> Result<Json<SceneResponse>, ServiceError> {
    let Json(request) = request?;
    let response = state.run(move |api| api.play_turn(&request)).await?;
    Ok(Json(response))
}

async fn game_finalize(
    State(state): State<ServiceState>,
    request: Result<Json<FinalizeRequest>, JsonRejection>,
) -> Result<Json<ProfileResponse>, ServiceError> {
    let Json(request) = request?;
    let response = state.run(move |api| api.finalize(&request)).await?;
    Ok(Json(response))
}

async fn game_history(
    State(state): State<ServiceState>,
    Path(game_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ServiceError> {
    let Query(query) = query?;
    let response = state.run(move |api| api.history(&game_id, query.limit)).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use reverie_provider::{GenerationProvider, GenerationRequest, ProviderError, ScriptedProvider};
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("reverie-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn state_with(provider: Arc<dyn GenerationProvider>, request_timeout: Duration) -> ServiceState {
        ServiceState {
            api: SessionApi::new(unique_temp_db_path(), provider, PipelineConfig::default()),
            request_timeout,
        }
    }

    fn scripted_state(responses: Vec<String>) -> ServiceState {
        state_with(Arc::new(ScriptedProvider::new(responses)), Duration::from_secs(30))
    }

    fn cleanup(state: &ServiceState) {
        let db_path = state.api.history_api().db_path().display().to_string();
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{db_path}{suffix}"));
        }
    }

    fn scene_json(symbolic_word: &str) -> String {
        serde_json::json!({
            "scene_description": "A lantern flickers at the edge of a quiet forest.",
            "options": [
                {"action": "Step into the trees.", "facet": "courage"},
                {"action": "Light a second lantern.", "facet": "preparation"},
                {"action": "Listen for a voice.", "facet": "attunement"},
                {"action": "Return to the road.", "facet": "prudence"}
            ],
            "symbolic_word": symbolic_word
        })
        .to_string()
    }

    fn profile_json() -> String {
        serde_json::json!({
            "personality_type": "INFJ",
            "title": "The Quiet Lantern",
            "description": "You read the forest before entering it.",
            "strengths": [{"name": "Insight"}],
            "growth_areas": [{"name": "Spontaneity", "recommendation": "Step in sooner."}],
            "closing_message": "The path remembers you."
        })
        .to_string()
    }

    fn post_json(uri: &str, payload: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: Router, request: Request<Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(scripted_state(Vec::new()));

        let response = send(router, get_request("/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert_eq!(value["api_contract_version"], API_CONTRACT_VERSION);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = app(scripted_state(Vec::new()));

        let response = send(router, get_request("/v1/openapi")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_text(response).await;
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/game/start"));
        assert!(body.contains("/v1/game/finalize"));
        assert!(body.contains("generation_parse"));
        assert!(
            body.contains(r##""502": { $ref: "#/components/responses/GenerationFailure" }"##)
        );
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn start_turn_and_finalize_flow_returns_flat_bodies() {
        let state =
            scripted_state(vec![scene_json("lantern"), scene_json("forest-edge"), profile_json()]);
        let router = app(state.clone());

        let start = send(
            router.clone(),
            post_json(
                "/v1/game/start",
                &serde_json::json!({"name": "Ana", "initial_archetype": "Explorer"}),
            ),
        )
        .await;
        assert_eq!(start.status(), StatusCode::OK);
        let start_value = response_json(start).await;
        let game_id = start_value["game_id"]
            .as_str()
            .unwrap_or_else(|| panic!("missing game_id in response: {start_value}"))
            .to_string();
        assert_eq!(start_value["options"].as_array().map(Vec::len), Some(4));
        assert_eq!(start_value["symbolic_word"], "lantern");

        let turn = send(
            router.clone(),
            post_json(
                "/v1/game/turn",
                &serde_json::json!({"game_id": game_id, "chosen_action": "Step into the trees."}),
            ),
        )
        .await;
        assert_eq!(turn.status(), StatusCode::OK);
        let turn_value = response_json(turn).await;
        assert_eq!(turn_value["game_id"], game_id.as_str());
        assert_eq!(turn_value["symbolic_word"], "forest-edge");

        let history = send(router.clone(), get_request(&format!("/v1/game/{game_id}/history"))).await;
        assert_eq!(history.status(), StatusCode::OK);
        let history_value = response_json(history).await;
        assert_eq!(history_value["turns"].as_array().map(Vec::len), Some(2));
        assert_eq!(history_value["turns"][1]["sequence"], 2);

        let finalize = send(
            router,
            post_json("/v1/game/finalize", &serde_json::json!({"game_id": game_id})),
        )
        .await;
        assert_eq!(finalize.status(), StatusCode::OK);
        let profile_value = response_json(finalize).await;
        assert_eq!(profile_value["game_id"], game_id.as_str());
        assert_eq!(profile_value["personality_type"], "INFJ");
        assert_eq!(profile_value["growth_areas"][0]["recommendation"], "Step in sooner.");

        cleanup(&state);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn finalize_unknown_game_returns_not_found_body() {
        let state = scripted_state(vec![profile_json()]);
        let router = app(state.clone());
        let game_id = ulid::Ulid::new().to_string();

        let response = send(
            router.clone(),
            post_json("/v1/game/finalize", &serde_json::json!({"game_id": game_id})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(value["kind"], "not_found");
        assert!(value["raw_output"].is_null());
        assert!(value["error"].as_str().is_some_and(|error| error.contains(&game_id)));

        let history = send(router, get_request(&format!("/v1/game/{game_id}/history"))).await;
        assert_eq!(history.status(), StatusCode::NOT_FOUND);

        cleanup(&state);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn malformed_generation_returns_raw_output() {
        let raw = "Sure! {\"scene_description\": \"x\", \"options\": [}";
        let state = scripted_state(vec![raw.to_string()]);
        let router = app(state.clone());

        let response = send(
            router,
            post_json(
                "/v1/game/start",
                &serde_json::json!({"name": "Ana", "initial_archetype": "Explorer"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let value = response_json(response).await;
        assert_eq!(value["kind"], "generation_parse");
        assert_eq!(value["raw_output"], raw);

        cleanup(&state);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn bad_request_shapes_are_validation_errors() {
        let state = scripted_state(Vec::new());
        let router = app(state.clone());

        let missing_field =
            send(router.clone(), post_json("/v1/game/start", &serde_json::json!({"name": "Ana"})))
                .await;
        assert_eq!(missing_field.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(missing_field).await["kind"], "validation");

        let bad_name = send(
            router.clone(),
            post_json(
                "/v1/game/start",
                &serde_json::json!({"name": "Ana  Lu", "initial_archetype": "Explorer"}),
            ),
        )
        .await;
        assert_eq!(bad_name.status(), StatusCode::BAD_REQUEST);

        let bad_game = send(
            router.clone(),
            post_json(
                "/v1/game/turn",
                &serde_json::json!({"game_id": "nope", "chosen_action": "Wait."}),
            ),
        )
        .await;
        assert_eq!(bad_game.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(bad_game).await["kind"], "validation");

        let game_id = ulid::Ulid::new();
        let bad_limit =
            send(router.clone(), get_request(&format!("/v1/game/{game_id}/history?limit=abc")))
                .await;
        assert_eq!(bad_limit.status(), StatusCode::BAD_REQUEST);
        let value = response_json(bad_limit).await;
        assert_eq!(value["kind"], "validation");
        assert!(value["raw_output"].is_null());

        let zero_limit =
            send(router, get_request(&format!("/v1/game/{game_id}/history?limit=0"))).await;
        assert_eq!(zero_limit.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response_json(zero_limit).await["error"],
            "validation error: limit MUST be at least 1"
        );

        cleanup(&state);
    }

    struct SlowProvider;

    impl GenerationProvider for SlowProvider {
        fn provider_name(&self) -> &str {
            "slow"
        }

        fn complete(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
            std::thread::sleep(Duration::from_millis(500));
            Err(ProviderError::Transport("too late".to_string()))
        }
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn slow_pipeline_hits_request_timeout() {
        let state = state_with(Arc::new(SlowProvider), Duration::from_millis(50));
        let router = app(state.clone());

        let response = send(
            router,
            post_json(
                "/v1/game/start",
                &serde_json::json!({"name": "Ana", "initial_archetype": "Explorer"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let value = response_json(response).await;
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["error"], "request timed out");

        cleanup(&state);
    }

    struct LateSceneProvider;

    impl GenerationProvider for LateSceneProvider {
        fn provider_name(&self) -> &str {
            "late-scene"
        }

        fn complete(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(scene_json("lantern"))
        }
    }

    // Test IDs: TSVC-010
    #[tokio::test]
    async fn timed_out_start_leaves_no_game_behind() {
        let state = state_with(Arc::new(LateSceneProvider), Duration::from_millis(50));
        let router = app(state.clone());

        let response = send(
            router,
            post_json(
                "/v1/game/start",
                &serde_json::json!({"name": "Ana", "initial_archetype": "Explorer"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response_json(response).await["kind"], "timeout");

        // Give a detached worker time to reach the store if it were going to.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let games = match state.api.history_api().list_games() {
            Ok(games) => games,
            Err(err) => panic!("failed to list games: {err:#}"),
        };
        assert!(games.is_empty(), "timed-out start persisted: {games:?}");

        cleanup(&state);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn cors_allows_configured_origin() {
        let layer = match cors_layer("http://localhost:3000") {
            Ok(layer) => layer,
            Err(err) => panic!("failed to build cors layer: {err}"),
        };
        let router = app(scripted_state(Vec::new())).layer(layer);

        let request = Request::builder()
            .uri("/v1/health")
            .method("GET")
            .header("origin", "http://localhost:3000")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(router, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|value| value.to_str().ok()),
            Some("http://localhost:3000")
        );
        assert!(cors_layer("bad\norigin").is_err());
    }

    // Test IDs: TSVC-009
    #[test]
    fn error_kinds_map_to_distinct_statuses() {
        assert_eq!(status_for(ErrorKind::InsufficientHistory), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Storage), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Generation), StatusCode::BAD_GATEWAY);
    }
}
