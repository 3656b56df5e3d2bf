use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::info;

use facility::config::Config;
use facility::directory::{Directory, RemoteDirectory, StaticDirectory};
use facility::engine::{Engine, InMemoryStore, run_compactor};
use facility::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use facility::wire;

fn load_directory(config: &Config) -> std::io::Result<Directory> {
    if let Some(addr) = &config.directory_addr {
        info!("  directory: remote gateway at {addr}");
        return Ok(Directory::shared(Arc::new(RemoteDirectory::new(addr.clone()))));
    }
    let directory = match &config.directory_file {
        Some(path) => {
            info!("  directory: static tables from {}", path.display());
            StaticDirectory::from_json_file(path)?
        }
        None => {
            tracing::warn!("no directory configured, every permission check will deny");
            StaticDirectory::new()
        }
    };
    Ok(Directory::shared(Arc::new(directory)))
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Serve `socket` on its own task if a connection slot is free.
fn admit(
    socket: TcpStream,
    peer: SocketAddr,
    semaphore: &Arc<Semaphore>,
    engine: &Arc<Engine>,
    config: &Config,
    tls: &Option<TlsAcceptor>,
) {
    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
        tracing::warn!("connection limit reached, rejecting {peer}");
        metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
        return;
    };

    info!("connection from {peer}");
    metrics::counter!(CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    let (engine, password, tls) = (engine.clone(), config.password.clone(), tls.clone());

    tokio::spawn(async move {
        if let Err(e) = wire::process_connection(socket, engine, password, tls).await {
            tracing::error!("connection error from {peer}: {e}");
        }
        metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        drop(permit);
    });
}

/// Wait until every connection slot is returned, or `grace` runs out.
async fn drain(semaphore: &Semaphore, slots: usize, grace: Duration) {
    info!("draining connections...");
    let idle = async {
        while semaphore.available_permits() < slots {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(grace, idle).await {
        Ok(()) => info!("all connections drained"),
        Err(_) => {
            let remaining = slots - semaphore.available_permits();
            tracing::warn!("drain timeout, {remaining} connections still open");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    facility::observability::init(config.metrics_port);

    let tls_acceptor = config.tls_acceptor()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(InMemoryStore::open(&config.wal_path())?);
    tokio::spawn(run_compactor(store.clone(), config.compact_threshold));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("facility listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let directory = load_directory(&config)?;
    let engine = Arc::new(Engine::new(store, directory));
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => admit(socket, peer, &semaphore, &engine, &config, &tls_acceptor),
                Err(e) => tracing::error!("accept error: {e}"),
            },
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain(&semaphore, config.max_connections, Duration::from_secs(10)).await;
    info!("facility stopped");
    Ok(())
}
