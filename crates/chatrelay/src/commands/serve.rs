//! HTTP server command implementation.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use chatrelay::challenge::{ChallengeRenderer, ChallengeStore, PassthroughRenderer};
use chatrelay::config::{self, Config};
use chatrelay::dispatch::MessageDispatcher;
use chatrelay::janitor::Janitor;
use chatrelay::server::{self, AppState, RuntimeServices};
use chatrelay::session::{RegistryConfig, SessionRegistry};
use chatrelay::transport::{
    LoopbackFactory, SubprocessConfig, SubprocessFactory, TransportFactory,
};

/// Default per-identity transport state directory (relative to config file).
const DEFAULT_STATE_DIR: &str = ".chatrelay/transports";

pub async fn run(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path).await?;

    // CLI overrides config
    if let Some(host) = host_override {
        config.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let config_path_ref = Path::new(config_path);

    // Challenge store and renderer
    let challenges = ChallengeStore::new(config.challenge.ttl());
    let renderer: Arc<dyn ChallengeRenderer> = Arc::new(PassthroughRenderer);

    // Transport factory per configured mode
    let factory: Arc<dyn TransportFactory> = match config.transport.mode.as_str() {
        "subprocess" => {
            let command = config
                .transport
                .command
                .clone()
                .context("transport.command is required for subprocess mode")?;
            let command = config::resolve_path(config_path_ref, Path::new(&command))
                .to_string_lossy()
                .to_string();
            let state_dir = config
                .transport
                .state_dir
                .as_ref()
                .map(|p| config::resolve_path(config_path_ref, p))
                .unwrap_or_else(|| {
                    config::resolve_path(config_path_ref, Path::new(DEFAULT_STATE_DIR))
                });
            Arc::new(SubprocessFactory::new(SubprocessConfig {
                command,
                args: config.transport.args.clone(),
                env: config.transport.env.clone(),
                state_dir,
            }))
        }
        "loopback" => Arc::new(LoopbackFactory::auto()),
        other => {
            warn!(mode = %other, "unknown transport mode, falling back to loopback");
            Arc::new(LoopbackFactory::auto())
        }
    };
    info!(mode = %config.transport.mode, "transport factory initialized");

    // Registry, dispatcher, janitor
    let registry = SessionRegistry::new(RegistryConfig {
        factory,
        renderer,
        challenges: challenges.clone(),
        timeouts: config.transport.lifecycle_timeouts(),
    });
    let dispatcher = MessageDispatcher::new(config.dispatch.retry_policy());

    let janitor = Janitor::new(
        registry.clone(),
        challenges.clone(),
        config.janitor.janitor_config(),
    );
    let janitor_task = janitor.spawn(registry.subscribe_shutdown());
    info!(
        interval_seconds = config.janitor.interval_seconds,
        bringup_window_seconds = config.janitor.bringup_window_seconds,
        "janitor started"
    );

    // Build app state
    let state = AppState {
        services: RuntimeServices {
            registry: registry.clone(),
            challenges,
            dispatcher,
        },
        challenge_wait: config.challenge.wait(),
    };

    let app = server::build_app(
        state,
        config.server.request_timeout_seconds,
        config.server.max_connections,
    );

    let ip: IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(addr = %addr, "starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shut down sessions (the same signal stops the janitor)
    registry.shutdown().await;
    if let Err(e) = janitor_task.await {
        warn!(error = ?e, "janitor task panicked during shutdown");
    }

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
