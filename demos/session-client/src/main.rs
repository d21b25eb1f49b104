//! Session client against the in-memory gateway.
//!
//! Run with: cargo run -p session-client-demo [-- gateway.json]
//!
//! The optional JSON file holds a `GatewayConfig`. The session is destroyed
//! after a few seconds, or earlier on Ctrl-C through the shutdown hooks.

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use futures::StreamExt;
use gateway_session::{
    GatewayConfig, ProcessShutdown, SessionCallback, SessionError, SessionFactoryHelper,
    SessionHelper,
    memory::MemoryGateway,
    runtime::{Identity, Servant},
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SESSION_LENGTH: Duration = Duration::from_secs(3);

enum Notice {
    Connected(Arc<SessionHelper>),
    Disconnected,
    Failed(SessionError),
}

/// Forwards notifications to the main task.
struct Notifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl SessionCallback for Notifier {
    fn created_communicator(&self, _session: &Arc<SessionHelper>) {
        tracing::info!("Runtime created");
    }

    fn connected(&self, session: &Arc<SessionHelper>) -> Result<(), SessionError> {
        tracing::info!(category = %session.category_for_client()?, "Session established");
        let _ = self.tx.send(Notice::Connected(Arc::clone(session)));
        Ok(())
    }

    fn disconnected(&self, _session: &Arc<SessionHelper>) {
        let _ = self.tx.send(Notice::Disconnected);
    }

    fn connect_failed(&self, _session: &Arc<SessionHelper>, error: &SessionError) {
        let _ = self.tx.send(Notice::Failed(error.clone()));
    }
}

struct Clock;

impl Servant for Clock {
    fn interface_id(&self) -> &str {
        "::Demo::Clock"
    }
}

fn load_config() -> anyhow::Result<GatewayConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(GatewayConfig {
            use_callbacks: true,
            ..GatewayConfig::default()
        });
    };
    let json =
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {path}"))?;
    GatewayConfig::from_json(&json).with_context(|| format!("Invalid gateway config in {path}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let gateway = MemoryGateway::new()
        .with_account("demo", "demo")
        .with_router_identity(
            config
                .router_identity
                .clone()
                .unwrap_or_else(Identity::default_router),
        )
        .with_latency(Duration::from_millis(50));

    ProcessShutdown::global().listen_for_ctrl_c();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let factory = SessionFactoryHelper::new(gateway.factory(), Arc::new(Notifier { tx }))
        .with_gateway_config(config);
    tracing::info!(finder = %factory.finder_str(), "Connecting");
    let helper = factory.connect_with_password("demo", "demo")?;

    let mut phases = helper.phase_stream();
    tokio::spawn(async move {
        while let Some(phase) = phases.next().await {
            tracing::debug!(%phase, "Session phase");
        }
    });

    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Connected(session) => {
                if session.use_callbacks() {
                    let proxy = session.add_with_uuid(Arc::new(Clock))?;
                    tracing::info!(%proxy, "Callback object registered");
                }
                tokio::spawn(async move {
                    tokio::time::sleep(SESSION_LENGTH).await;
                    session.destroy();
                });
            }
            Notice::Disconnected => {
                tracing::info!(live_runtimes = gateway.live_runtimes(), "Session ended");
                break;
            }
            Notice::Failed(error) => anyhow::bail!("Connect failed: {error}"),
        }
    }
    Ok(())
}
