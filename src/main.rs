use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use assistant_console::actions::Actions;
use assistant_console::api::BackendApi;
use assistant_console::cache::ResponseCache;
use assistant_console::chat::engine::{AssistantChannel, ChatSession, ReplyStatus, SendReceipt};
use assistant_console::chat::poller::{PollPolicy, ReplyPoller};
use assistant_console::gateway::HttpGateway;
use assistant_console::invalidation::InvalidationCoordinator;
use assistant_console::models::{ChatMessage, ConversationId, Role};
use assistant_console::server;
use assistant_console::session::{CookiePolicy, SessionContext};
use assistant_console::settings::{
    resolve_effective_settings, CliOverrides, ConfigDefaults, EffectiveSettings, EnvSettings, Environment, PollSettings,
};

#[derive(Debug, Parser)]
#[command(name = "assistant_console")]
#[command(about = "Session gateway and chat console for an assistant backend", long_about = None)]
struct Cli {
    /// Backend base URL, e.g. https://api.example.com
    #[arg(long, global = true)]
    api_base_url: Option<String>,
    /// development or production
    #[arg(long, global = true)]
    env: Option<String>,
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,
    #[arg(long, global = true)]
    poll_max_wait_secs: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Start {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
    },
    /// Chat with an assistant from the terminal
    Chat {
        #[arg(long)]
        assistant: ConversationId,
        /// Access token, as issued at login
        #[arg(long)]
        token: String,
    },
}

impl Cli {
    fn overrides(&self) -> anyhow::Result<CliOverrides> {
        let environment = self
            .env
            .as_deref()
            .map(|v| Environment::parse(v).ok_or_else(|| anyhow!("unknown environment {v:?}")))
            .transpose()?;
        let poll = (self.poll_interval_ms.is_some() || self.poll_max_wait_secs.is_some()).then(|| PollSettings {
            interval_ms: self.poll_interval_ms,
            max_wait_secs: self.poll_max_wait_secs,
            retry_budget: None,
        });
        Ok(CliOverrides { api_base_url: self.api_base_url.clone(), environment, poll })
    }
}

fn build_api(settings: &EffectiveSettings) -> (BackendApi, Option<ResponseCache>) {
    let mut gateway = HttpGateway::new(settings.api_base_url.clone());
    let mut coordinator = InvalidationCoordinator::new();
    let cache = settings.response_cache.then(ResponseCache::new);
    if let Some(cache) = &cache {
        gateway = gateway.with_cache(cache.clone());
        coordinator = coordinator.with_sink(Arc::new(cache.clone()));
    }
    (BackendApi::new(Arc::new(gateway), coordinator), cache)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = resolve_effective_settings(&ConfigDefaults::default(), &EnvSettings::from_env(), &cli.overrides()?)?;

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.default_log_filter())))
        .init();

    let (api, cache) = build_api(&settings);
    match cli.command {
        Commands::Start { listen } => {
            let addr: SocketAddr = listen.parse().with_context(|| format!("invalid listen address {listen:?}"))?;
            let metrics = if settings.metrics {
                Some(PrometheusBuilder::new().install_recorder()?)
            } else {
                None
            };
            info!(backend = %settings.api_base_url, environment = ?settings.environment, cache = cache.is_some(), "starting");
            let state = server::AppState {
                api,
                cookies: CookiePolicy::for_environment(settings.environment),
                cache,
                metrics,
            };
            server::serve(addr, state).await?;
        }
        Commands::Chat { assistant, token } => {
            let actions = Actions::new(api, SessionContext::with_token(token));
            let channel = Arc::new(AssistantChannel::new(actions));
            let poller = ReplyPoller::new(channel.clone(), PollPolicy::from(&settings));
            chat(ChatSession::new(assistant, poller, channel)).await?;
        }
    }
    Ok(())
}

fn print_message(m: &ChatMessage) {
    let who = match m.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    println!("[{}] {who}: {}", m.timestamp.format("%H:%M:%S"), m.content);
}

async fn chat(session: ChatSession<AssistantChannel>) -> anyhow::Result<()> {
    session.load().await?;
    let history = session.visible().await;
    history.iter().for_each(print_message);
    let mut shown = history.len();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let reply = match session.send(&line).await {
            Ok(SendReceipt::Ignored) => continue,
            Ok(SendReceipt::Awaiting(reply)) => reply,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        println!("(waiting for reply, Ctrl-C to stop)");
        let wait = session.await_reply(reply);
        tokio::pin!(wait);
        let status = tokio::select! {
            status = &mut wait => status,
            _ = tokio::signal::ctrl_c() => {
                session.stop_waiting();
                wait.await
            }
        };
        match status {
            Ok(ReplyStatus::Arrived) => {}
            Ok(ReplyStatus::TimedOut) => println!("(no reply yet; it will show up on the next message)"),
            Ok(ReplyStatus::Cancelled) => println!("(stopped waiting)"),
            Err(e) => eprintln!("error: {e}"),
        }

        let visible = session.visible().await;
        visible
            .iter()
            .skip(shown)
            .filter(|m| m.role == Role::Assistant)
            .for_each(print_message);
        shown = visible.len();
    }
    Ok(())
}
