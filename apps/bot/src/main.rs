use std::path::Path;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kestrel_bot::commands::{CommandContext, CommandDescriptor, CommandRouter};
use kestrel_bot::config::{Config, TransportMode};
use kestrel_bot::error::{CommandError, StartupError, TransportError};
use kestrel_bot::gateway::dispatcher::Propagation;
use kestrel_bot::gateway::{client, server};
use kestrel_bot::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "kestrel-bot failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    let router = CommandRouter::builder().register(ping_command()?).build();
    let state = AppState::new(config, router);
    let service = state.start_service()?;

    let shutdown = CancellationToken::new();
    let mut transport = match state.config.mode {
        TransportMode::Server => tokio::spawn(server::serve(state.clone(), shutdown.clone())),
        TransportMode::Client => {
            let (state, service) = (state.clone(), service.clone());
            tokio::spawn(async move {
                client::run(state, service).await;
                Ok::<(), TransportError>(())
            })
        }
    };

    let joined = tokio::select! {
        joined = &mut transport => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            state.dispose_service(&service.service_id);
            shutdown.cancel();
            transport.await
        }
    };
    state.dispose_service(&service.service_id);

    match joined {
        Ok(result) => result.map_err(StartupError::from),
        Err(e) => Err(TransportError::Serve(std::io::Error::other(e)).into()),
    }
}

fn ping_command() -> Result<CommandDescriptor, CommandError> {
    CommandDescriptor::builder("ping")
        .pattern(r"^/ping\s*$")
        .handler(|ctx: CommandContext| async move {
            let resp = ctx.reply("pong").await;
            if !resp.is_success() {
                tracing::debug!(status = ?resp.status, "ping reply failed");
            }
            Propagation::Stop
        })
        .build()
}
