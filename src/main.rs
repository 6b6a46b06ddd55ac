use axum::extract::DefaultBodyLimit;
use axum::{routing::get, Router};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cmi5_runtime::config::Config;
use cmi5_runtime::importer::PackageImporter;
use cmi5_runtime::launch::{LaunchConfig, LaunchManager};
use cmi5_runtime::lrs::{HttpLrs, Lrs, SqlLrs};
use cmi5_runtime::packages::PackageRepo;
use cmi5_runtime::routes::{self, AppState};
use cmi5_runtime::storage::FsContentStore;
use cmi5_runtime::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "cmi5_runtime=info,axum=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect(&cfg.database_url).await?;
    tokio::fs::create_dir_all(cfg.data_dir.join("packages")).await?;

    let lrs: Arc<dyn Lrs> = match &cfg.remote_lrs_url {
        Some(url) => {
            tracing::info!(%url, "using remote lrs");
            let client = HttpLrs::new(url, &cfg.actor_home_page);
            Arc::new(match &cfg.remote_lrs_auth {
                Some(auth) => client.with_auth(auth),
                None => client,
            })
        }
        None => Arc::new(SqlLrs::new(pool.clone())),
    };

    let packages = PackageRepo::new(pool.clone());
    let store = Arc::new(FsContentStore::new(&cfg.data_dir));
    let state = AppState {
        importer: PackageImporter::new(packages.clone(), store, cfg.max_package_bytes),
        launcher: LaunchManager::new(
            packages.clone(),
            lrs.clone(),
            LaunchConfig {
                endpoint: cfg.lrs_endpoint.clone(),
                fetch_base_url: cfg.public_base_url.clone(),
                content_base_url: format!("{}/content", cfg.public_base_url),
                actor_home_page: cfg.actor_home_page.clone(),
                token_ttl: chrono::Duration::seconds(cfg.fetch_token_ttl_secs),
            },
        ),
        packages,
        lrs,
    };

    // leave headroom over the archive limit for multipart framing
    let body_limit = usize::try_from(cfg.max_package_bytes).unwrap_or(usize::MAX).saturating_add(1024 * 1024);
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(state, &cfg.data_dir))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://0.0.0.0:{}", cfg.port);

    axum::serve(listener, app).await?;
    Ok(())
}
