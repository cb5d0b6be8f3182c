use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use fieldbook::config::{ConfigSource, FileConfigSource, StaticConfigSource};
use fieldbook::engine::Engine;
use fieldbook::notify::NotifyHub;
use fieldbook::{compactor, wire};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("FIELDBOOK_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    fieldbook::observability::init(metrics_port)?;

    let port = std::env::var("FIELDBOOK_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("FIELDBOOK_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("FIELDBOOK_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("FIELDBOOK_PASSWORD").unwrap_or_else(|_| "fieldbook".into());
    let max_connections: usize = env_or("FIELDBOOK_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("FIELDBOOK_COMPACT_THRESHOLD", 1000);

    let tls_cert = std::env::var("FIELDBOOK_TLS_CERT").ok();
    let tls_key = std::env::var("FIELDBOOK_TLS_KEY").ok();
    let tls_acceptor =
        fieldbook::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    let config: Arc<dyn ConfigSource> = match std::env::var("FIELDBOOK_CONFIG") {
        Ok(path) => {
            info!("  config: {path}");
            Arc::new(FileConfigSource::new(PathBuf::from(path)))
        }
        Err(_) => Arc::new(StaticConfigSource::from_env()),
    };

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("fieldbook.wal");
    let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()), config)?);
    tokio::spawn(compactor::run_compactor(engine.clone(), compact_threshold));

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("fieldbook listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(fieldbook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(fieldbook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(fieldbook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(fieldbook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Up to 10s for in-flight connections
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("fieldbook stopped");
    Ok(())
}
