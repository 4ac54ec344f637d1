//! LAN discovery: advertise this host, browse for peers, resolve them, keep the registry.
//!
//! The service-discovery primitive sits behind [`DiscoveryBackend`]; the
//! daemon uses the mDNS backend, tests use [`MemoryBackend`].

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanshare_core::{FoundOutcome, PeerRecord, Registry};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Peer announcement seen while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Found(String),
    Removed(String),
}

/// Addresses and port a peer name resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("browse failed: {0}")]
    Browse(String),
    #[error("resolve failed: {0}")]
    Resolve(String),
    #[error("resolve timed out")]
    Timeout,
    #[error("discovery daemon unavailable: {0}")]
    Daemon(String),
}

/// Platform service-discovery primitive: publish a named, typed, ported
/// record; observe found/removed events for a type; resolve a name.
#[async_trait::async_trait]
pub trait DiscoveryBackend: Send + Sync {
    fn advertise(&self, name: &str, service_type: &str, port: u16) -> Result<(), DiscoveryError>;

    fn unpublish(&self, name: &str, service_type: &str) -> Result<(), DiscoveryError>;

    fn browse(
        &self,
        service_type: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError>;

    /// Resolve `name` to addresses. Callers bound this with `timeout` as well;
    /// backends may use it to size their own query.
    async fn resolve(
        &self,
        name: &str,
        service_type: &str,
        timeout: Duration,
    ) -> Result<Resolution, DiscoveryError>;
}

/// Publishes this host's record. Failures are reported once, never retried.
pub struct Advertiser {
    backend: Arc<dyn DiscoveryBackend>,
    published: Mutex<Option<(String, String)>>,
}

impl Advertiser {
    pub fn new(backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self {
            backend,
            published: Mutex::new(None),
        }
    }

    pub fn publish(&self, name: &str, service_type: &str, port: u16) -> Result<(), DiscoveryError> {
        match self.backend.advertise(name, service_type, port) {
            Ok(()) => {
                info!("advertising {name} ({service_type}) on port {port}");
                if let Ok(mut p) = self.published.lock() {
                    *p = Some((name.to_string(), service_type.to_string()));
                }
                Ok(())
            }
            Err(e) => {
                error!("could not advertise {name}: {e}");
                Err(e)
            }
        }
    }

    /// Withdraw the record, if one was published.
    pub fn unpublish(&self) {
        let taken = self.published.lock().ok().and_then(|mut p| p.take());
        if let Some((name, service_type)) = taken {
            match self.backend.unpublish(&name, &service_type) {
                Ok(()) => debug!("withdrew {name}"),
                Err(e) => warn!("could not withdraw {name}: {e}"),
            }
        }
    }

    pub fn published_name(&self) -> Option<String> {
        self.published
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(|(n, _)| n.clone()))
    }
}

struct BrowserShared {
    backend: Arc<dyn DiscoveryBackend>,
    registry: RwLock<Registry>,
    peers_tx: watch::Sender<Vec<PeerRecord>>,
    resolve_timeout: Duration,
}

impl BrowserShared {
    fn publish(&self, registry: &Registry) {
        self.peers_tx.send_replace(registry.snapshot());
    }
}

/// Observes discovery events and maintains the registry. Observers get whole
/// snapshots of resolved peers, taken under the registry lock.
#[derive(Clone)]
pub struct Browser {
    shared: Arc<BrowserShared>,
}

impl Browser {
    /// `own_name` is the name this host advertises; it is never listed as a peer.
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        own_name: Option<String>,
        resolve_timeout: Duration,
    ) -> Self {
        let registry = match own_name {
            Some(n) => Registry::with_own_name(n),
            None => Registry::new(),
        };
        let (peers_tx, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(BrowserShared {
                backend,
                registry: RwLock::new(registry),
                peers_tx,
                resolve_timeout,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerRecord>> {
        self.shared.peers_tx.subscribe()
    }

    /// Resolved peers in discovery order.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.shared.registry.read().await.snapshot()
    }

    pub async fn peer(&self, name: &str) -> Option<PeerRecord> {
        self.shared.registry.read().await.get(name).cloned()
    }

    /// Start browsing `service_type`. The returned task runs until the
    /// backend's event stream ends or the handle is aborted.
    pub fn start(&self, service_type: &str) -> Result<JoinHandle<()>, DiscoveryError> {
        let mut events = self.shared.backend.browse(service_type)?;
        info!("browsing for {service_type}");
        let shared = self.shared.clone();
        let service_type = service_type.to_string();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                handle_event(&shared, &service_type, event).await;
            }
            debug!("browse stream for {service_type} ended");
        }))
    }
}

async fn handle_event(shared: &Arc<BrowserShared>, service_type: &str, event: BrowseEvent) {
    match event {
        BrowseEvent::Found(name) => {
            let outcome = shared.registry.write().await.on_found(&name);
            match outcome {
                FoundOutcome::Resolve { attempt } => {
                    debug!("found {name}, resolving");
                    let shared = shared.clone();
                    let service_type = service_type.to_string();
                    tokio::spawn(async move {
                        resolve_peer(shared, service_type, name, attempt).await
                    });
                }
                FoundOutcome::Duplicate => debug!("found {name} again, ignoring"),
                FoundOutcome::OwnRecord => debug!("found own record {name}, ignoring"),
            }
        }
        BrowseEvent::Removed(name) => {
            let mut reg = shared.registry.write().await;
            if reg.on_removed(&name) {
                info!("peer {name} left");
                shared.publish(&reg);
            } else {
                debug!("removed {name} (not listed)");
            }
        }
    }
}

/// Resolve one announcement. The result only lands if `attempt` is still the
/// registry's current lookup for `name`.
async fn resolve_peer(shared: Arc<BrowserShared>, service_type: String, name: String, attempt: u64) {
    let timeout = shared.resolve_timeout;
    let result = match tokio::time::timeout(
        timeout,
        shared.backend.resolve(&name, &service_type, timeout),
    )
    .await
    {
        Ok(r) => r,
        Err(_) => Err(DiscoveryError::Timeout),
    };
    let mut reg = shared.registry.write().await;
    match result {
        Ok(res) => {
            if reg.on_resolved(&name, attempt, res.addresses.iter().copied(), res.port) {
                info!("peer {name} at {:?} port {}", res.addresses, res.port);
                shared.publish(&reg);
            }
        }
        Err(e) => {
            if reg.on_resolve_failed(&name, attempt) {
                warn!("could not resolve {name}: {e}");
            }
        }
    }
}

/// How a [`MemoryBackend`] answers `resolve` for one service.
#[derive(Debug, Clone)]
pub enum ResolveBehavior {
    Answer(Resolution),
    /// Answer after a delay, like a slow responder.
    Delayed(Duration, Resolution),
    Fail,
    /// Never answer; the caller's timeout fires.
    Hang,
}

#[derive(Default)]
struct MemoryState {
    services: Vec<(String, String, ResolveBehavior)>,
    browsers: Vec<(String, mpsc::UnboundedSender<BrowseEvent>)>,
}

/// In-process discovery: every backend clone shares one "network segment".
/// Advertised services resolve to loopback.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a service with explicit resolution behaviour (a foreign peer).
    pub fn announce(&self, name: &str, service_type: &str, behavior: ResolveBehavior) -> bool {
        let Ok(mut st) = self.state.lock() else {
            return false;
        };
        if st.services.iter().any(|(n, _, _)| n == name) {
            return false;
        }
        st.services
            .push((name.to_string(), service_type.to_string(), behavior));
        st.browsers.retain(|(t, tx)| {
            t != service_type || tx.send(BrowseEvent::Found(name.to_string())).is_ok()
        });
        true
    }

    /// Deliver a `found` event without touching the service table.
    pub fn repeat_found(&self, name: &str, service_type: &str) {
        if let Ok(st) = self.state.lock() {
            for (t, tx) in &st.browsers {
                if t == service_type {
                    let _ = tx.send(BrowseEvent::Found(name.to_string()));
                }
            }
        }
    }

    /// Withdraw a service; browsers see `removed`.
    pub fn withdraw(&self, name: &str) -> bool {
        let Ok(mut st) = self.state.lock() else {
            return false;
        };
        let Some(i) = st.services.iter().position(|(n, _, _)| n == name) else {
            return false;
        };
        let (_, service_type, _) = st.services.remove(i);
        st.browsers.retain(|(t, tx)| {
            *t != service_type || tx.send(BrowseEvent::Removed(name.to_string())).is_ok()
        });
        true
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for MemoryBackend {
    fn advertise(&self, name: &str, service_type: &str, port: u16) -> Result<(), DiscoveryError> {
        let res = Resolution {
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port,
        };
        if self.announce(name, service_type, ResolveBehavior::Answer(res)) {
            Ok(())
        } else {
            Err(DiscoveryError::Publish(format!("name {name:?} already in use")))
        }
    }

    fn unpublish(&self, name: &str, _service_type: &str) -> Result<(), DiscoveryError> {
        if self.withdraw(name) {
            Ok(())
        } else {
            Err(DiscoveryError::Publish(format!("{name:?} is not published")))
        }
    }

    fn browse(
        &self,
        service_type: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| DiscoveryError::Browse("state poisoned".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        for (name, t, _) in &st.services {
            if t == service_type {
                let _ = tx.send(BrowseEvent::Found(name.clone()));
            }
        }
        st.browsers.push((service_type.to_string(), tx));
        Ok(rx)
    }

    async fn resolve(
        &self,
        name: &str,
        _service_type: &str,
        _timeout: Duration,
    ) -> Result<Resolution, DiscoveryError> {
        let behavior = {
            let st = self
                .state
                .lock()
                .map_err(|_| DiscoveryError::Resolve("state poisoned".into()))?;
            st.services
                .iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, _, b)| b.clone())
        };
        match behavior {
            Some(ResolveBehavior::Answer(r)) => Ok(r),
            Some(ResolveBehavior::Delayed(d, r)) => {
                tokio::time::sleep(d).await;
                Ok(r)
            }
            Some(ResolveBehavior::Fail) => Err(DiscoveryError::Resolve(format!("{name} did not answer"))),
            Some(ResolveBehavior::Hang) => std::future::pending().await,
            None => Err(DiscoveryError::Resolve(format!("{name} is not published"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: &str = "_fileshare._tcp";

    fn answer(last: u8, port: u16) -> ResolveBehavior {
        ResolveBehavior::Answer(Resolution {
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))],
            port,
        })
    }

    /// Wait until the published peer list satisfies `pred`.
    async fn wait_for(
        rx: &mut watch::Receiver<Vec<PeerRecord>>,
        pred: impl Fn(&[PeerRecord]) -> bool,
    ) -> Vec<PeerRecord> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let peers = rx.borrow_and_update();
                    if pred(&peers) {
                        return peers.clone();
                    }
                }
                rx.changed().await.expect("browser dropped");
            }
        })
        .await
        .expect("peer list did not reach expected state")
    }

    #[tokio::test]
    async fn advertise_collision_is_reported() {
        let backend = Arc::new(MemoryBackend::new());
        let a = Advertiser::new(backend.clone());
        let b = Advertiser::new(backend);
        a.publish("LanShare-x", TYPE, 8080).unwrap();
        assert!(matches!(
            b.publish("LanShare-x", TYPE, 8080),
            Err(DiscoveryError::Publish(_))
        ));
        assert_eq!(a.published_name().as_deref(), Some("LanShare-x"));
        assert_eq!(b.published_name(), None);
    }

    #[tokio::test]
    async fn browser_lists_resolved_peers_and_skips_self() {
        let backend = Arc::new(MemoryBackend::new());
        let adv = Advertiser::new(backend.clone());
        adv.publish("LanShare-me", TYPE, 8080).unwrap();
        backend.announce("phone", TYPE, answer(7, 8080));

        let browser = Browser::new(backend.clone(), Some("LanShare-me".into()), Duration::from_secs(1));
        let mut rx = browser.subscribe();
        let _task = browser.start(TYPE).unwrap();

        let peers = wait_for(&mut rx, |p| p.len() == 1).await;
        assert_eq!(peers[0].name, "phone");
        assert!(peers[0].resolved);
        assert!(browser.peer("LanShare-me").await.is_none());

        backend.announce("tablet", TYPE, answer(8, 9000));
        let peers = wait_for(&mut rx, |p| p.len() == 2).await;
        let names: Vec<_> = peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["phone", "tablet"]);
        assert_eq!(peers[1].port, 9000);
    }

    #[tokio::test]
    async fn repeated_found_does_not_duplicate() {
        let backend = Arc::new(MemoryBackend::new());
        backend.announce("phone", TYPE, answer(7, 8080));
        let browser = Browser::new(backend.clone(), None, Duration::from_secs(1));
        let mut rx = browser.subscribe();
        let _task = browser.start(TYPE).unwrap();
        backend.repeat_found("phone", TYPE);
        backend.repeat_found("phone", TYPE);

        wait_for(&mut rx, |p| p.len() == 1).await;
        backend.announce("marker", TYPE, answer(9, 1));
        let peers = wait_for(&mut rx, |p| p.len() == 2).await;
        assert_eq!(peers.iter().filter(|p| p.name == "phone").count(), 1);
    }

    #[tokio::test]
    async fn removed_peer_disappears() {
        let backend = Arc::new(MemoryBackend::new());
        backend.announce("phone", TYPE, answer(7, 8080));
        let browser = Browser::new(backend.clone(), None, Duration::from_secs(1));
        let mut rx = browser.subscribe();
        let _task = browser.start(TYPE).unwrap();
        wait_for(&mut rx, |p| p.len() == 1).await;

        backend.withdraw("phone");
        wait_for(&mut rx, |p| p.is_empty()).await;
        assert!(browser.peers().await.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_peer_is_dropped_and_can_retry() {
        let backend = Arc::new(MemoryBackend::new());
        backend.announce("ghost", TYPE, ResolveBehavior::Hang);
        backend.announce("broken", TYPE, ResolveBehavior::Fail);
        let browser = Browser::new(backend.clone(), None, Duration::from_millis(100));
        let _task = browser.start(TYPE).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        {
            let reg = browser.shared.registry.read().await;
            assert!(reg.is_empty());
            assert!(!reg.is_resolving("ghost"));
            assert!(!reg.is_resolving("broken"));
        }

        // The peer comes back and answers this time.
        backend.withdraw("ghost");
        backend.announce("ghost", TYPE, answer(3, 8080));
        let mut rx = browser.subscribe();
        let peers = wait_for(&mut rx, |p| p.len() == 1).await;
        assert_eq!(peers[0].name, "ghost");
    }

    #[tokio::test]
    async fn late_answer_for_withdrawn_announcement_is_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let browser = Browser::new(backend.clone(), None, Duration::from_secs(2));
        let mut rx = browser.subscribe();
        let _task = browser.start(TYPE).unwrap();

        let old = Resolution {
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
            port: 1111,
        };
        let new = Resolution {
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))],
            port: 9000,
        };
        backend.announce("tablet", TYPE, ResolveBehavior::Delayed(Duration::from_millis(100), old));
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.withdraw("tablet");
        backend.announce("tablet", TYPE, ResolveBehavior::Delayed(Duration::from_millis(400), new));

        // The first lookup answers while the second is still out.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(browser.peers().await.is_empty());

        let peers = wait_for(&mut rx, |p| p.len() == 1).await;
        assert_eq!(peers[0].port, 9000);
        assert_eq!(
            peers[0].preferred_addr(),
            Some("10.0.0.2:9000".parse().unwrap())
        );
    }
}
