use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use eventsift_common::AppConfig;
use eventsift_scraper::analyze::ClaudeAnalyzer;
use eventsift_scraper::batch::{BatchStore, PgBatchStore};
use eventsift_scraper::fetch::HttpFetcher;
use eventsift_scraper::logs::{LogStore, PgLogStore};
use eventsift_scraper::methods::{PgMethodStore, PgSourceStore};
use eventsift_scraper::persist::{EventPersister, PgEventSink};
use eventsift_scraper::pipeline::{PipelineDeps, ScrapePipeline};
use eventsift_scraper::session::PgSessionStore;
use geocode_client::GeocodeClient;

mod routes;

pub struct AppState {
    pub pipeline: Arc<ScrapePipeline>,
    pub batches: Arc<dyn BatchStore>,
    pub logs: Arc<dyn LogStore>,
    pub pool: sqlx::PgPool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("eventsift=info".parse()?))
        .init();

    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    let mut persister = EventPersister::new(Arc::new(PgEventSink::new(pool.clone())));
    if let Some(key) = &config.geocode_api_key {
        let mut geocoder = GeocodeClient::new(key);
        if let Some(base) = &config.geocode_base_url {
            geocoder = geocoder.with_base_url(base);
        }
        persister = persister.with_geocoder(geocoder);
    }

    let pipeline = Arc::new(ScrapePipeline::new(PipelineDeps {
        fetcher: Arc::new(HttpFetcher::new()),
        analyzer: Arc::new(ClaudeAnalyzer::new(
            &config.anthropic_api_key,
            &config.claude_model,
        )),
        sessions: Arc::new(PgSessionStore::new(pool.clone())),
        methods: Arc::new(PgMethodStore::new(pool.clone())),
        sources: Arc::new(PgSourceStore::new(pool.clone())),
        persister,
    }));

    let state = Arc::new(AppState {
        pipeline,
        batches: Arc::new(PgBatchStore::new(pool.clone())),
        logs: Arc::new(PgLogStore::new(pool.clone())),
        pool,
    });

    let app = Router::new()
        // Health check
        .route("/", get(|| async { "ok" }))
        // Scrape API
        .route("/api/scrape/analyze", post(routes::analyze))
        .route("/api/scrape/approve", post(routes::approve))
        .route("/api/scrape/test-method", post(routes::test_method))
        .route("/api/scrape/stats", get(routes::stats))
        // Batch API
        .route("/api/scrape/batch", post(routes::batch_upload))
        .route("/api/scrape/batch/{id}", get(routes::batch_status))
        .route(
            "/api/scrape/batch/{id}/results.csv",
            get(routes::batch_results_csv),
        )
        .with_state(state)
        // CORS
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Logging layer: method + path + status + latency
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        );

    let addr = format!("{}:{}", config.api_host, config.api_port);
    info!("EventSift API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
