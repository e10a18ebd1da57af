use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use wapanel::api::{self, ApiState};
use wapanel::client::BridgeClientFactory;
use wapanel::config::Config;
use wapanel::conversation::{LoggingFollowUps, StoreConversationLog};
use wapanel::instance::{ReconnectCoordinator, SessionManager};
use wapanel::router::MessageRouter;
use wapanel::store::{MemoryStore, PersistenceGateway, PgStore};

#[derive(Parser, Debug)]
#[command(name = "wapanel")]
#[command(version)]
#[command(about = "Multi-agent WhatsApp session manager")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, env = "WAPANEL_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore sessions and serve the HTTP API (default)
    Serve {
        /// Keep all state in memory instead of PostgreSQL
        #[arg(long)]
        memory: bool,
    },

    /// Apply database migrations and exit
    Migrate,

    /// Print the stored state and contact count of every instance
    Status,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wapanel=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect_store(config: &Config) -> anyhow::Result<PgStore> {
    let store = PgStore::new(&config.database).await?;
    store.run_migrations().await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(cli.log_json);

    match cli.command.unwrap_or(Command::Serve { memory: false }) {
        Command::Migrate => {
            connect_store(&config).await?;
            tracing::info!("Migrations applied");
        }
        Command::Status => {
            let store = connect_store(&config).await?;
            for record in store.list_instances().await? {
                let contacts = store.list_assignments_for_agent(&record.agent_id).await?;
                println!(
                    "{:<24} {:<14} {:<16} {:>8} {}",
                    record.agent_id,
                    record.status,
                    record.phone_number.as_deref().unwrap_or("-"),
                    contacts.len(),
                    record.display_name
                );
            }
        }
        Command::Serve { memory } => {
            let store: Arc<dyn PersistenceGateway> = if memory {
                tracing::warn!("Running with in-memory state; nothing survives a restart");
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(connect_store(&config).await?)
            };
            serve(config, store).await?;
        }
    }

    Ok(())
}

async fn serve(config: Config, store: Arc<dyn PersistenceGateway>) -> anyhow::Result<()> {
    let factory = Arc::new(BridgeClientFactory::new(config.bridge.clone()));
    let router = MessageRouter::new(
        config.router.clone(),
        Arc::clone(&store),
        Arc::new(StoreConversationLog::new(Arc::clone(&store))),
        Arc::new(LoggingFollowUps),
    );
    let manager = SessionManager::new(config.manager.clone(), factory, store, router);

    let coordinator = ReconnectCoordinator::new(manager.clone())
        .await
        .map(ReconnectCoordinator::spawn);

    let restoring = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = restoring.restore_from_store().await {
            tracing::error!(error = %e, "Failed to restore instances");
        }
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
    };
    api::serve(ApiState { manager: manager.clone() }, &config.http, shutdown).await?;

    manager.shutdown().await;
    if let Some(coordinator) = coordinator {
        coordinator.abort();
    }
    Ok(())
}
