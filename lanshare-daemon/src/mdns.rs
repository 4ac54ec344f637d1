//! mDNS-based discovery backend using mdns-sd.
//!
//! Services are registered as `<name>.<type>.local.`. mdns-sd resolves found
//! services on its own; resolved records are cached here so `resolve` only
//! has to wait for the cache to fill.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::discovery::{BrowseEvent, DiscoveryBackend, DiscoveryError, Resolution};

const PROP_VERSION: &str = "version";

/// `_fileshare._tcp` -> `_fileshare._tcp.local.`
pub fn qualified_type(service_type: &str) -> String {
    let t = service_type.trim_end_matches('.');
    if t.ends_with(".local") {
        format!("{t}.")
    } else {
        format!("{t}.local.")
    }
}

/// Instance name from a full service name: `desk._fileshare._tcp.local.` -> `desk`.
pub fn instance_name<'a>(fullname: &'a str, qualified: &str) -> &'a str {
    fullname
        .strip_suffix(qualified)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(fullname)
}

pub struct MdnsBackend {
    daemon: ServiceDaemon,
    host: String,
    resolved: Arc<Mutex<HashMap<String, Resolution>>>,
    notify: Arc<Notify>,
}

impl MdnsBackend {
    /// `host` becomes the mDNS host name (`<host>.local.`) of advertised records.
    pub fn new(host: &str) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let host = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        Ok(Self {
            daemon,
            host,
            resolved: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS: shutdown: {e}");
        }
    }

    fn cached(&self, name: &str) -> Option<Resolution> {
        self.resolved.lock().ok().and_then(|m| m.get(name).cloned())
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for MdnsBackend {
    fn advertise(&self, name: &str, service_type: &str, port: u16) -> Result<(), DiscoveryError> {
        let properties = [(PROP_VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string())];
        let service = ServiceInfo::new(
            &qualified_type(service_type),
            name,
            &format!("{}.local.", self.host),
            "",
            port,
            &properties[..],
        )
        .map_err(|e| DiscoveryError::Publish(e.to_string()))?
        .enable_addr_auto();

        self.daemon
            .register(service)
            .map_err(|e| DiscoveryError::Publish(e.to_string()))?;
        info!("mDNS: registered {name} on port {port}");
        Ok(())
    }

    fn unpublish(&self, name: &str, service_type: &str) -> Result<(), DiscoveryError> {
        let fullname = format!("{name}.{}", qualified_type(service_type));
        self.daemon
            .unregister(&fullname)
            .map(|_| ())
            .map_err(|e| DiscoveryError::Publish(e.to_string()))
    }

    fn browse(
        &self,
        service_type: &str,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError> {
        let qualified = qualified_type(service_type);
        let receiver = self
            .daemon
            .browse(&qualified)
            .map_err(|e| DiscoveryError::Browse(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let resolved = self.resolved.clone();
        let notify = self.notify.clone();

        // The mdns-sd receiver is a blocking channel; drain it off the async workers.
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::ServiceFound(_ty, fullname) => {
                        let name = instance_name(&fullname, &qualified).to_string();
                        debug!("mDNS: found {name}");
                        if tx.send(BrowseEvent::Found(name)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        let name = instance_name(info.get_fullname(), &qualified).to_string();
                        let res = Resolution {
                            addresses: info.get_addresses().iter().map(|a| IpAddr::from(*a)).collect(),
                            port: info.get_port(),
                        };
                        debug!("mDNS: resolved {name} to {:?}:{}", res.addresses, res.port);
                        if let Ok(mut m) = resolved.lock() {
                            m.insert(name, res);
                        }
                        notify.notify_waiters();
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        let name = instance_name(&fullname, &qualified).to_string();
                        debug!("mDNS: removed {name}");
                        if let Ok(mut m) = resolved.lock() {
                            m.remove(&name);
                        }
                        if tx.send(BrowseEvent::Removed(name)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::SearchStopped(ty) => {
                        debug!("mDNS: browse for {ty} stopped");
                        break;
                    }
                    _ => {}
                }
            }
        });
        Ok(rx)
    }

    async fn resolve(
        &self,
        name: &str,
        _service_type: &str,
        timeout: Duration,
    ) -> Result<Resolution, DiscoveryError> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if let Some(r) = self.cached(name) {
                    return r;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DiscoveryError::Timeout)
    }
}

impl Drop for MdnsBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_is_qualified() {
        assert_eq!(qualified_type("_fileshare._tcp"), "_fileshare._tcp.local.");
        assert_eq!(qualified_type("_fileshare._tcp.local."), "_fileshare._tcp.local.");
        assert_eq!(qualified_type("_fileshare._tcp.local"), "_fileshare._tcp.local.");
    }

    #[test]
    fn instance_name_strips_type() {
        let q = qualified_type("_fileshare._tcp");
        assert_eq!(instance_name("LanShare-desk._fileshare._tcp.local.", &q), "LanShare-desk");
        assert_eq!(instance_name("odd-name", &q), "odd-name");
    }
}
