//! wardgate/src/backend/mod.rs
//! Learning backend: update request handling, periodic model refits, and
//! the operator surface.

pub mod control;
pub mod kmeans;
pub mod service;

use crate::wire;
use dashmap::DashMap;
use service::Service;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Cadence of the model refit ticker.
pub const REFIT_INTERVAL: Duration = Duration::from_secs(45);

/// Bound on reading one update request and writing its reply.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// All services known to this backend, keyed by opaque service id.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
    data_dir: PathBuf,
}

impl ServiceRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry {
            services: DashMap::new(),
            data_dir: data_dir.into(),
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Service>> {
        self.services.get(id).map(|entry| entry.value().clone())
    }

    /// Looks a service up, creating it (and touching its log files) on
    /// first reference.
    pub fn get_or_create(&self, id: &str) -> io::Result<Arc<Service>> {
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }
        let created = Arc::new(Service::new(id, &self.data_dir)?);
        Ok(self
            .services
            .entry(id.to_string())
            .or_insert(created)
            .value()
            .clone())
    }

    pub fn snapshot(&self) -> Vec<Arc<Service>> {
        self.services
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// The learning backend process: accepts update requests from proxies,
/// refits models on a timer, and answers the operator.
pub struct Backend {
    port: u16,
    registry: Arc<ServiceRegistry>,
}

impl Backend {
    pub fn new(port: u16, data_dir: impl Into<PathBuf>) -> Backend {
        Backend {
            port,
            registry: ServiceRegistry::new(data_dir),
        }
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    /// Serves until ctrl-c or an operator SHUT_DOWN, then returns cleanly.
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(port = self.port, "backend listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let operator = tokio::spawn(control::run_control(
            self.registry.clone(),
            tokio::io::BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown_tx,
        ));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            _ = shutdown_rx.changed() => info!("shutdown requested by operator"),
            _ = Self::serve(listener, self.registry.clone()) => {}
            _ = Self::refit_loop(self.registry.clone()) => {}
        }
        operator.abort();
        let _ = operator.await;
        Ok(())
    }

    /// Accept loop on an already-bound listener, one task per request.
    pub async fn serve(listener: TcpListener, registry: Arc<ServiceRegistry>) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "update connection accepted");
                    let registry = registry.clone();
                    tokio::spawn(handle_request(socket, registry));
                }
                Err(e) => error!("accept failed: {}", e),
            }
        }
    }

    /// Refits every known service on a timer. The fits run on blocking
    /// threads so a large observation log never stalls the request path.
    async fn refit_loop(registry: Arc<ServiceRegistry>) {
        loop {
            tokio::time::sleep(REFIT_INTERVAL).await;
            debug!("model refit started");
            for service in registry.snapshot() {
                let handle = {
                    let service = service.clone();
                    tokio::task::spawn_blocking(move || service.refit())
                };
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(service = %service.id(), "refit failed: {}", e),
                    Err(e) => warn!(service = %service.id(), "refit task failed: {}", e),
                }
            }
            debug!("model refit finished");
        }
    }
}

/// One update exchange: read the framed request, reply with the current
/// (pre-update) model, then persist the pushed observations. A malformed
/// request closes the connection without a reply.
async fn handle_request(mut socket: TcpStream, registry: Arc<ServiceRegistry>) {
    let (mut reader, mut writer) = socket.split();
    let frame = match wire::read_framed(&mut reader, REQUEST_TIMEOUT).await {
        Ok(frame) => frame,
        Err(e) => {
            debug!("update request aborted: {}", e);
            return;
        }
    };

    let frame = frame.trim();
    let sections: Vec<&str> = frame.split(wire::SECTION_DELIMITER).collect();
    if sections[0] != "UPDATE" || sections.len() < 3 {
        debug!("malformed update request, closing without reply");
        return;
    }
    let service_id = sections[1];
    let payload = sections[2];

    let service = match registry.get_or_create(service_id) {
        Ok(service) => service,
        Err(e) => {
            error!(service = %service_id, "could not open service state: {}", e);
            return;
        }
    };

    // The reply carries the model from before this request's observations;
    // a brand-new service gets the bootstrap "[] # SIMULATION_MODE # []".
    let reply = service.model_reply();
    if let Err(e) = writer.write_all(reply.as_bytes()).await {
        warn!(service = %service_id, "could not send model reply: {}", e);
        return;
    }

    match wire::decode_dataset(payload) {
        Ok(conversations) => {
            if let Err(e) = service.append_observations(&conversations) {
                error!(service = %service_id, "could not persist observations: {}", e);
            } else if !conversations.is_empty() {
                info!(
                    service = %service_id,
                    observations = conversations.len(),
                    "observations recorded"
                );
            }
        }
        Err(e) => warn!(service = %service_id, "bad update payload: {}", e),
    }
    let _ = writer.shutdown().await;
}
