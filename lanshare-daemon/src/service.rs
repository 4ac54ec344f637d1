//! `ShareService`: owns the transfer engine, advertiser and browser for one host.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lanshare_core::{PeerRecord, ProgressSink, TransferError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::{Advertiser, Browser, DiscoveryBackend, DiscoveryError};
use crate::transfer::{TransferEngine, TransferSettings};

pub struct ShareService {
    config: Config,
    name: String,
    engine: TransferEngine,
    advertiser: Advertiser,
    browser: Browser,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShareService {
    pub fn new(config: Config, backend: Arc<dyn DiscoveryBackend>, sink: Arc<dyn ProgressSink>) -> Self {
        let name = config.advertised_name();
        let engine = TransferEngine::new(TransferSettings::from(&config), sink);
        let advertiser = Advertiser::new(backend.clone());
        let browser = Browser::new(backend, Some(name.clone()), config.resolve_timeout());
        Self {
            config,
            name,
            engine,
            advertiser,
            browser,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Name this host advertises.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the listener and start accepting, then advertise and browse.
    /// Only a listener failure is fatal; discovery failures are logged.
    pub async fn start(&self) -> Result<SocketAddr, TransferError> {
        let local = self.start_listening().await?;
        if let Err(e) = self.start_advertising() {
            warn!("continuing without advertising: {e}");
        }
        if let Err(e) = self.start_browsing() {
            warn!("continuing without browsing: {e}");
        }
        info!("{} ready on {local}", self.name);
        Ok(local)
    }

    /// Bind `bind_addr:port` and spawn the accept loop.
    pub async fn start_listening(&self) -> Result<SocketAddr, TransferError> {
        let ip: IpAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|_| TransferError::InvalidIpAddress(self.config.bind_addr.clone()))?;
        let (local, handle) = self.engine.listen(SocketAddr::new(ip, self.config.port)).await?;
        if let Ok(mut a) = self.local_addr.lock() {
            *a = Some(local);
        }
        self.track(handle);
        Ok(local)
    }

    /// Publish this host under the configured service type. Advertises the
    /// bound port once listening, the configured port otherwise.
    pub fn start_advertising(&self) -> Result<(), DiscoveryError> {
        let port = self.local_addr().map_or(self.config.port, |a| a.port());
        self.advertiser
            .publish(&self.name, &self.config.service_type, port)
    }

    pub fn start_browsing(&self) -> Result<(), DiscoveryError> {
        let handle = self.browser.start(&self.config.service_type)?;
        self.track(handle);
        Ok(())
    }

    /// Stop accepting and browsing, and withdraw the advertisement.
    /// Connections already accepted run to completion.
    pub fn stop(&self) {
        let tasks = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for t in &tasks {
            t.abort();
        }
        self.advertiser.unpublish();
        if let Ok(mut a) = self.local_addr.lock() {
            *a = None;
        }
    }

    pub async fn send_file(&self, ip: &str, port: u32, path: &Path) -> Result<(), TransferError> {
        self.engine.send_file(ip, port, path).await
    }

    /// Run `send_file` on its own task.
    pub fn spawn_send(
        &self,
        ip: impl Into<String>,
        port: u32,
        path: impl Into<PathBuf>,
    ) -> JoinHandle<Result<(), TransferError>> {
        let engine = self.engine.clone();
        let ip = ip.into();
        let path = path.into();
        tokio::spawn(async move { engine.send_file(&ip, port, &path).await })
    }

    /// Send to a resolved peer by advertised name. Unknown or unresolved
    /// names are an `InvalidIpAddress` error carrying the name and are never
    /// dialed, even when the name itself reads as an address.
    pub async fn send_to_peer(&self, name: &str, path: &Path) -> Result<(), TransferError> {
        let target = self
            .browser
            .peer(name)
            .await
            .filter(|p| p.resolved)
            .and_then(|p| p.preferred_addr());
        match target {
            Some(addr) => {
                self.send_file(&addr.ip().to_string(), u32::from(addr.port()), path)
                    .await
            }
            None => self.engine.reject_send(
                name,
                path,
                TransferError::InvalidIpAddress(name.to_string()),
            ),
        }
    }

    /// Resolved peers in discovery order.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.browser.peers().await
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<PeerRecord>> {
        self.browser.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut t) => t.push(handle),
            Err(_) => handle.abort(),
        }
    }
}

impl Drop for ShareService {
    fn drop(&mut self) {
        self.stop();
    }
}
