// This is where we create the default webserver for running the orchestrator

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Extension;
use clap::Parser;
use conductor::{
    application::{application::Application, config::configuration::Configuration},
    webserver,
};
use std::net::SocketAddr;
use tokio::signal;
use tokio::sync::oneshot;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    info!("conductor 🚀");
    let configuration = Configuration::parse();

    // We get the logging setup first
    debug!("installing logging to local file");
    Application::install_logging(&configuration);

    // Create a oneshot channel
    let (tx, rx) = oneshot::channel();

    // Spawn a task to listen for signals
    tokio::spawn(async move {
        signal::ctrl_c().await.expect("failed to listen for event");
        let _ = tx.send(());
    });

    let application = Application::initialize(configuration).await?;
    debug!("initialized application");

    // Main logic
    tokio::select! {
        // Start the webserver
        _ = run(application) => {
            // Your server logic
        }
        _ = rx => {
            // Signal received, this block will be executed.
            debug!("Signal received, cleaning up...");
        }
    }

    Ok(())
}

pub async fn run(application: Application) -> Result<()> {
    let mut joins = tokio::task::JoinSet::new();

    joins.spawn(start(application));

    while let Some(result) = joins.join_next().await {
        if let Ok(Err(err)) = result {
            error!(?err, "conductor failed");
            return Err(err);
        }
    }

    Ok(())
}

pub async fn start(app: Application) -> Result<()> {
    let bind = SocketAddr::new(app.config.host.parse()?, app.config.port);
    let mut api = axum::Router::new()
        .route("/models", get(webserver::chat::models))
        .nest("/chat", webserver::chat_router());

    api = api.route("/health", get(webserver::health::health));

    let api = api
        .layer(Extension(app.clone()))
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new())
        // attachment metadata payloads stay small, the blobs go elsewhere
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024));

    let router = axum::Router::new().nest("/api", api);

    axum::Server::bind(&bind)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
