//! Tile rendering service entry point.

use anyhow::Result;
use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tile_api::config::Config;
use tile_api::handlers;
use tile_api::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "tile-api")]
#[command(about = "Map tile rendering and caching server")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let prometheus_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    info!("Starting tile API server");

    let config = Config::from_env();
    let state = Arc::new(AppState::new(config).await?);

    let app = Router::new()
        // Layer endpoints
        .route("/v2/tiles/create", post(handlers::create_layer_handler))
        .route("/v2/tiles/vectorize", post(handlers::vectorize_handler))
        .route("/v2/tiles/layer", get(handlers::get_layer_handler))
        .route("/v2/tiles/*path", get(handlers::layer_tile_handler))
        // Cube CRUD
        .route("/v2/cubes/create", post(handlers::create_cube_handler))
        .route("/v2/cubes/deleteCube", post(handlers::delete_cube_handler))
        .route("/v2/cubes/get", get(handlers::get_cube_handler))
        .route("/v2/cubes/add", post(handlers::add_datasets_handler))
        .route("/v2/cubes/remove", post(handlers::remove_datasets_handler))
        .route("/v2/cubes/replace", post(handlers::replace_datasets_handler))
        .route("/v2/cubes/update", post(handlers::update_cube_handler))
        // Masks
        .route("/v2/cubes/mask", post(handlers::mask_handler))
        .route("/v2/cubes/unmask", post(handlers::unmask_handler))
        .route("/v2/cubes/getMask", post(handlers::get_mask_handler))
        .route("/v2/cubes/updateMask", post(handlers::update_mask_handler))
        .route(
            "/v2/cubes/updateDatasetMask",
            post(handlers::update_mask_handler),
        )
        // Pre-render jobs
        .route("/v2/cubes/render/start", post(handlers::render_start_handler))
        .route(
            "/v2/cubes/render/status",
            post(handlers::render_status_handler),
        )
        .route(
            "/v2/cubes/render/estimate",
            post(handlers::render_estimate_handler),
        )
        // Masked queries
        .route("/v2/cubes/query", post(handlers::cube_query_handler))
        // Cube tiles
        .route("/v2/cubes/*path", get(handlers::cube_tile_handler))
        // Health & metrics
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(Extension(state))
        .layer(Extension(prometheus_handle))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = args.listen.parse()?;
    info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
