use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cart_pilot::agent::{Agent, RunControl, SessionFactory};
use cart_pilot::browser::ChromiumLauncher;
use cart_pilot::config::Config;
use cart_pilot::gemini::GeminiClient;
use cart_pilot::policy::DenyListPolicy;
use cart_pilot::reasoner::GeminiReasoner;
use cart_pilot::server::{self, AppState};
use cart_pilot::store::{DiskRunStore, DiskSnapshotStore};

#[derive(Parser, Debug)]
#[command(name = "cart-pilot")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the web UI and chat endpoints
    Serve {
        /// Listen address, overrides CART_PILOT_BIND
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one goal in the terminal and print the final run as JSON
    Run {
        /// What to do on Amazon, e.g. "search RTX 4090 and sort by price"
        goal: String,

        /// Step ceiling, overrides MAX_STEPS
        #[arg(long)]
        max_steps: Option<usize>,

        /// Run Chromium without a window
        #[arg(long)]
        headless: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();

    match args.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;
            let agent = build_agent(&config)?;
            let sessions: Arc<dyn SessionFactory> = Arc::new(ChromiumLauncher::new(config.browser.clone()));
            let state = AppState::new(agent, sessions, config.server.max_concurrent_runs);
            server::serve(state, &config.server.bind).await
        }
        Command::Run { goal, max_steps, headless } => {
            if let Some(n) = max_steps {
                config.agent.max_steps = n;
            }
            if headless {
                config.browser.headless = true;
            }
            config.validate()?;
            let agent = build_agent(&config)?;
            let session = ChromiumLauncher::new(config.browser.clone())
                .open_session()
                .await
                .context("launching browser")?;

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling run");
                    on_ctrl_c.cancel();
                }
            });

            let run = agent.run_with(&goal, session, RunControl::new(cancel)).await;
            info!("{}", run.status_text());
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
    }
}

fn build_agent(config: &Config) -> anyhow::Result<Agent<GeminiReasoner, DenyListPolicy>> {
    let client = GeminiClient::new(config.gemini.clone())?;
    let reasoner = GeminiReasoner::new(client);
    let policy = DenyListPolicy::new(&config.policy)?;
    let mut agent = Agent::new(reasoner, policy, config.agent.clone());
    if let Some(dir) = &config.runs_dir {
        info!(dir = %dir.display(), "persisting runs");
        agent = agent
            .with_store(Arc::new(DiskRunStore::new(dir)))
            .with_snapshot_store(Arc::new(DiskSnapshotStore::new(dir)));
    }
    Ok(agent)
}
