use std::sync::Arc;

use dcms_scheduler::clock::SystemClock;
use dcms_scheduler::config::Config;
use dcms_scheduler::middleware::auth_context::PgSessions;
use dcms_scheduler::models::AppState;
use dcms_scheduler::scheduling::SchedulingCore;
use dcms_scheduler::store::PgStore;
use dcms_scheduler::{db, routes};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let settings = cfg.scheduling_settings()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;

    // One Postgres store serves as schedule store and as the directory,
    // holiday calendar and appointment-type catalog.
    let store = Arc::new(PgStore::new(pool.clone()));
    let core = SchedulingCore::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(SystemClock),
        settings,
    );

    let state = AppState {
        core: Arc::new(core),
        sessions: Arc::new(PgSessions::new(pool)),
    };

    // Browser and WebView clients call the API cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!(
        utc_offset = %settings.utc_offset,
        wait_escalation_min = settings.wait_escalation.num_minutes(),
        "Listening on http://{}",
        cfg.bind_addr
    );
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
