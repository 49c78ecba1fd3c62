use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{BusBackend, Config, DatabaseConfig, LogFormat, StoreBackend};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    bus::{LocalBus, PgNotifyBus, SharedBus},
    db::bootstrap,
    middleware::request_context::{self, RequestIdState},
    routes,
    store::{MemoryMessageLog, PgMessageLog, SharedLog},
    tracer,
};

/// Broadcast buffer of the in-process bus.
const LOCAL_BUS_CAPACITY: usize = 1024;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder once per process and returns its handle.
///
/// If another recorder is already installed the handle still renders, but
/// only what this recorder was given.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!(error = %err, "metrics recorder already installed");
            }
            handle
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates the Postgres pool shared by the message log and the bus.
///
/// # Errors
/// Returns an error if the URL is malformed or no connection can be opened.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(&db.url)?
        .options([("statement_timeout", format!("{}ms", db.statement_timeout_ms))]);
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(options)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

fn needs_database(config: &Config) -> bool {
    config.db.backend == StoreBackend::Postgres || config.bus.backend == BusBackend::Postgres
}

/// Picks the message log and bus implementations named by the configuration.
///
/// # Errors
/// Returns an error if a Postgres backend is selected without a pool.
pub fn select_backends(
    config: &Config,
    pool: Option<&sqlx::PgPool>,
) -> anyhow::Result<(SharedLog, SharedBus)> {
    let log: SharedLog = match config.db.backend {
        StoreBackend::Memory => Arc::new(MemoryMessageLog::new()),
        StoreBackend::Postgres => Arc::new(PgMessageLog::new(
            pool.cloned()
                .context("postgres message log selected without a database pool")?,
        )),
    };
    let bus: SharedBus = match config.bus.backend {
        BusBackend::Local => Arc::new(LocalBus::new(LOCAL_BUS_CAPACITY)),
        BusBackend::Postgres => Arc::new(PgNotifyBus::new(
            pool.cloned()
                .context("postgres bus selected without a database pool")?,
            config.bus.channel.clone(),
        )),
    };
    info!(store = log.name(), bus = bus.name(), "backends selected");
    Ok((log, bus))
}

/// Creates the CORS layer; an empty origin list allows any origin.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    use http::Method;

    let methods = vec![Method::GET, Method::POST, Method::PUT, Method::OPTIONS];

    let mut cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any())
        .allow_credentials(config.server.cors.allow_credentials)
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| http::HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    cors
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let cors = create_cors_layer(&state.config);
    let request_id_state = RequestIdState::from_config(&state.config);

    Router::new()
        .merge(routes::create_api_router())
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle))
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves when the process is asked to stop.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
    info!("Shutting down...");
}

/// Starts the server with a fully resolved configuration.
///
/// # Errors
/// Returns an error if the database cannot be reached or bootstrapped, the
/// bus subscription cannot be opened, or the listener cannot bind.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!(profile = ?config.profile, "Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);

    let pool = if needs_database(&config) {
        let pool = create_database_pool(&config.db)
            .await
            .context("connecting to the database")?;
        bootstrap::ensure_liveness(&pool)
            .await
            .context("database liveness check")?;
        if config.db.backend == StoreBackend::Postgres {
            let applied = bootstrap::run(&pool, &config.db)
                .await
                .context("database bootstrap")?;
            info!(applied, "database bootstrap complete");
        }
        Some(pool)
    } else {
        None
    };

    let (log, bus) = select_backends(&config, pool.as_ref())?;
    let state = Arc::new(AppState::assemble(Arc::clone(&config), log, bus));
    let relay = state
        .fanout
        .start()
        .await
        .context("subscribing to the fan-out bus")?;

    let app = create_app_router(Arc::clone(&state), metrics_handle);

    let host = IpAddr::from_str(&config.server.host)
        .with_context(|| format!("invalid server host {}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, node_id = %state.fanout.node_id(), "Listening");

    let registry = Arc::clone(&state.registry);
    serve(listener, app)
        .with_graceful_shutdown(async move {
            create_shutdown_signal().await;
            let closed = registry.close_all().await;
            info!(closed, "closed open streams");
        })
        .await
        .context("serving http")?;

    relay.abort();
    Ok(())
}
