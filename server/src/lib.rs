pub mod cli;
pub mod config;
pub mod core;
pub mod gateway;
pub mod rest;

use std::io::BufRead;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use agentmux_proto::SupervisorMessage;
use config::Config;
use core::restart::RestartManager;
use core::store::SessionStore;
use core::Registry;

/// Builds the shared router (REST + the `/ws` upgrade) over one registry.
pub fn build_router(config: Arc<Config>, registry: Arc<Registry>, restart_manager: Arc<RestartManager>) -> Router {
    rest::router()
        .route("/ws", get(gateway::ws_handler))
        .with_state((config, registry, restart_manager))
}

/// Brings up the registry, maintenance loops, panic hook, and the IPC
/// listener for the supervisor's graceful-shutdown request, then serves
/// `router` until the process is asked to exit.
pub async fn run(config: Config) -> std::io::Result<()> {
    let config = Arc::new(config);
    let store = Arc::new(SessionStore::new(SessionStore::default_path()));
    let registry = Registry::new((*config).clone(), store.clone());
    registry.spawn_maintenance_loops();

    let restart_manager = RestartManager::new(registry.clone());
    restart_manager.spawn_probe_loop();

    install_panic_hook(registry.clone());
    spawn_supervisor_ipc_listener(restart_manager.clone());

    let router = build_router(config.clone(), registry.clone(), restart_manager.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));

    let print_ready = serde_json::to_string(&agentmux_proto::ServerMessage::Ready { port: config.port }).unwrap_or_default();

    let result = if let Some(https) = &config.https {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&https.cert_path, &https.key_path)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("failed to load TLS cert/key: {e}")))?;
        log::info!("listening on {addr} (https)");
        println!("{print_ready}");
        axum_server::bind_rustls(addr, tls_config)
            .serve(router.into_make_service())
            .await
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("listening on {addr}");
        println!("{print_ready}");
        axum::serve(listener, router).await
    };
    registry.persist();
    result
}

/// Flushes a best-effort session snapshot before the process dies from an
/// unhandled panic in any task.
fn install_panic_hook(registry: Arc<Registry>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let records = registry.snapshot_for_crash();
        registry.store().save_crash_copy(&records);
        default_hook(info);
    }));
}

/// Reads line-delimited JSON [`SupervisorMessage`]s from stdin. This is how
/// the supervisor asks the server to shut down gracefully on platforms
/// without a portable "deliver a signal to my child" primitive.
fn spawn_supervisor_ipc_listener(restart_manager: Arc<RestartManager>) {
    std::thread::Builder::new()
        .name("supervisor-ipc".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SupervisorMessage>(&line) {
                    Ok(SupervisorMessage::Shutdown) => {
                        let rt = tokio::runtime::Handle::try_current();
                        if let Ok(handle) = rt {
                            let restart_manager = restart_manager.clone();
                            handle.spawn(async move {
                                restart_manager.shutdown_gracefully().await;
                            });
                        } else {
                            std::process::exit(0);
                        }
                    }
                    Err(e) => log::warn!("unrecognized supervisor message: {e}"),
                }
            }
        })
        .expect("failed to spawn supervisor IPC listener thread");
}
