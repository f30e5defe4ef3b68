//! Vista - conversational wellbeing support API
//!
//! Serves one persona chat session over HTTP: conversation history is kept in
//! a local store, replies come from the remote chat gateway and speech from
//! the remote synthesis gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vista::config::{Config, StorageBackend};
use vista::core::{
    ConversationStore, HeadlessEngine, JsonFileConversationStore, PlaybackCoordinator,
    SessionController, SqliteConversationStore,
};
use vista::providers::{HttpChatGateway, HttpSpeechGateway};
use vista::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vista=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    // Initialize conversation store
    let store_path = config.store_path();
    let store: Arc<dyn ConversationStore> = match config.client.storage.backend {
        StorageBackend::Sqlite => Arc::new(SqliteConversationStore::new(&store_path).await?),
        StorageBackend::Json => Arc::new(JsonFileConversationStore::new(&store_path)),
    };
    tracing::info!(path = %store_path.display(), backend = ?config.client.storage.backend, "Conversation store ready");

    // Remote gateways
    let gateway = &config.client.gateway;
    let chat = Arc::new(HttpChatGateway::new(gateway)?);
    let speech = Arc::new(HttpSpeechGateway::new(gateway)?);
    tracing::info!(chat = %gateway.chat_url(), speech = %gateway.speech_url(), "Gateways configured");

    let playback = PlaybackCoordinator::new(Arc::new(HeadlessEngine::new()), speech);
    let session = Arc::new(
        SessionController::open(store, chat, playback, &config.client.session).await?,
    );

    let state = AppState {
        config,
        session: session.clone(),
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Vista API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    session.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
