//! Makerspace device agent: enrolls the device, joins the broker and
//! answers chat messages with locally generated responses.

use tracing_subscriber::EnvFilter;

use mk_device_agent::config::AgentConfig;
use mk_device_agent::service::DeviceService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "mk-device-agent starting"
    );

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/makerspace/agent.toml".to_string());

    let config = AgentConfig::load(&config_path)?;
    tracing::info!(
        device_id = %config.device_id,
        issuer = %config.issuer.url,
        credential_dir = %config.credential_dir.display(),
        "config loaded"
    );

    // ── Enroll and connect ──────────────────────────────────────
    let service = DeviceService::new(config)?;
    let record = service.start().await?;
    tracing::info!(
        client_name = %record.credential.client_name,
        broker = %record.credential.broker_hostname,
        "mk-device-agent ready"
    );

    tokio::select! {
        () = service.closed() => {
            tracing::error!("broker session ended");
        }
        // Graceful shutdown on SIGINT
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    service.stop().await;
    tracing::info!("mk-device-agent stopped");
    Ok(())
}
