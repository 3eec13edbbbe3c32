use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use labslot::compactor;
use labslot::config::{EventConfig, ServerConfig};
use labslot::engine::ReservationEngine;
use labslot::notify::NotifyHub;
use labslot::observability;
use labslot::store::ReservationTable;
use labslot::tls;
use labslot::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cfg = ServerConfig::from_env()?;
    let event = EventConfig::from_env()?;
    observability::init(cfg.metrics_port)?;

    let tls_acceptor = tls::load_tls_acceptor(cfg.tls_cert.as_deref(), cfg.tls_key.as_deref())?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let table = Arc::new(ReservationTable::open(&cfg.wal_path(), Arc::new(NotifyHub::new()))?);
    tokio::spawn(compactor::run_compactor(table.clone(), cfg.compact_threshold));

    let engine = Arc::new(ReservationEngine::new(table, Arc::new(event)));
    let semaphore = Arc::new(Semaphore::new(cfg.max_connections));

    let addr = cfg.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("labslot listening on {addr}");
    info!("  data_dir: {}", cfg.data_dir.display());
    info!("  event days: {} / {}", engine.config().days[0], engine.config().days[1]);
    info!("  stations: {}", engine.config().stations.join(", "));
    info!("  max_connections: {}", cfg.max_connections);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  master code: {}",
        if engine.config().master_code.is_some() { "set" } else { "unset" }
    );

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
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
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let password = cfg.password.clone();
                let op_timeout = cfg.op_timeout;
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) =
                        wire::process_connection(socket, engine, password, op_timeout, tls).await
                    {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == cfg.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = cfg.max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("labslot stopped");
    Ok(())
}
