// Dynamic Sub-Ledger - Web Server
// REST API with Axum over the SQLite store

use anyhow::anyhow;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use dynamic_subledger::db::{get_dataset_stats, DatasetStat};
use dynamic_subledger::{
    get_entries, get_rules, insert_event, setup_database, summarize, AccountSummary, Config,
    Event, LedgerEntry, ResultSink, RuleDefinition, RuleFile, RuleProcessor, RuleSource,
    RunContext, RunIssue, SqliteExecutor, SqliteRuleStore, SqliteSink,
};
use log::{error, info};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<Config>,
}

impl AppState {
    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| anyhow!("Database lock poisoned"))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failed(message: String) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message),
        }
    }
}

fn ok_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn error_response(context: &str, e: anyhow::Error) -> Response {
    error!("{}: {:#}", context, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::failed(format!("{}: {:#}", context, e))),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    run_id: Option<String>,
}

/// POST /api/run body; every field optional
#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    /// Inline rules instead of the configured source
    rules: Option<Vec<RuleDefinition>>,
    workers: Option<usize>,
}

#[derive(Serialize)]
struct RunResponse {
    run_id: String,
    rules_total: usize,
    rules_processed: usize,
    rules_skipped: usize,
    rules_failed: usize,
    entries: usize,
    stored: usize,
    issues: Vec<RunIssue>,
    summary: Vec<AccountSummary>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/rules - Rules stored in the database
async fn list_rules(State(state): State<AppState>) -> Response {
    let rules = state.conn().and_then(|conn| get_rules(&conn));
    match rules {
        Ok(rules) => ok_response(rules),
        Err(e) => error_response("Error getting rules", e),
    }
}

/// GET /api/datasets - Loaded datasets and row counts
async fn list_datasets(State(state): State<AppState>) -> Response {
    let stats: anyhow::Result<Vec<DatasetStat>> =
        state.conn().and_then(|conn| get_dataset_stats(&conn));
    match stats {
        Ok(stats) => ok_response(stats),
        Err(e) => error_response("Error getting datasets", e),
    }
}

/// GET /api/entries?run_id= - Stored ledger entries
async fn list_entries(State(state): State<AppState>, Query(query): Query<RunQuery>) -> Response {
    let entries: anyhow::Result<Vec<LedgerEntry>> = state
        .conn()
        .and_then(|conn| get_entries(&conn, query.run_id.as_deref()));
    match entries {
        Ok(entries) => ok_response(entries),
        Err(e) => error_response("Error getting entries", e),
    }
}

/// GET /api/summary?run_id= - Per-account totals of stored entries
async fn get_summary(State(state): State<AppState>, Query(query): Query<RunQuery>) -> Response {
    let entries = state
        .conn()
        .and_then(|conn| get_entries(&conn, query.run_id.as_deref()));
    match entries {
        Ok(entries) => ok_response(summarize(&entries)),
        Err(e) => error_response("Error building summary", e),
    }
}

/// POST /api/run - Process rules and store the entries
async fn run_rules(State(state): State<AppState>, body: Option<Json<RunRequest>>) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let result = tokio::task::spawn_blocking(move || execute_run(&state, request)).await;
    match result {
        Ok(Ok(response)) => ok_response(response),
        Ok(Err(e)) => error_response("Run failed", e),
        Err(e) => error_response("Run failed", anyhow!(e)),
    }
}

fn execute_run(state: &AppState, request: RunRequest) -> anyhow::Result<RunResponse> {
    let source: Box<dyn RuleSource> = match (request.rules, &state.config.rules.path) {
        (Some(rules), _) => Box::new(rules),
        (None, Some(path)) => Box::new(RuleFile::new(path)),
        (None, None) => Box::new(SqliteRuleStore::new(state.db.clone())),
    };

    let mut options = state.config.run_options();
    if let Some(workers) = request.workers {
        options.workers = workers.max(1);
    }
    let ctx = RunContext::new(options);

    let processor = RuleProcessor::new(SqliteExecutor::new(state.db.clone()));
    let outcome = processor.run_from_source(source.as_ref(), &ctx)?;

    let conn = state.conn()?;
    let stored = SqliteSink::new(&conn).write(&outcome.entries)?;
    let event = Event::new(
        "run_completed",
        "run",
        &outcome.run_id,
        serde_json::json!({
            "rules_total": outcome.rules_total,
            "entries": outcome.entry_count(),
            "stored": stored,
        }),
        "subledger_api",
    );
    insert_event(&conn, &event)?;

    Ok(RunResponse {
        run_id: outcome.run_id.clone(),
        rules_total: outcome.rules_total,
        rules_processed: outcome.rules_processed,
        rules_skipped: outcome.rules_skipped,
        rules_failed: outcome.rules_failed,
        entries: outcome.entry_count(),
        stored,
        summary: outcome.summary(),
        issues: outcome.issues,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("SUBLEDGER_CONFIG").unwrap_or_else(|_| "subledger.yaml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    println!("🌐 Dynamic Sub-Ledger - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let conn = Connection::open(&config.database.path)?;
    setup_database(&conn)?;
    println!("✓ Database opened: {:?}", config.database.path);

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        config: Arc::new(config),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/rules", get(list_rules))
        .route("/datasets", get(list_datasets))
        .route("/entries", get(list_entries))
        .route("/summary", get(get_summary))
        .route("/run", post(run_rules))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = std::env::var("SUBLEDGER_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Listening on {}", addr);
    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/summary", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
