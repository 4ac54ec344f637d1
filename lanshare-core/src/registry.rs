//! Peer registry: known peers in discovery order, plus the rules for found /
//! resolved / removed events. No I/O; the browser drives it.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// A discovered peer. Only resolved records leave the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    pub addresses: BTreeSet<IpAddr>,
    pub port: u16,
    pub resolved: bool,
}

impl PeerRecord {
    fn unresolved(name: &str) -> Self {
        Self {
            name: name.to_string(),
            addresses: BTreeSet::new(),
            port: 0,
            resolved: false,
        }
    }

    /// Address to dial: first IPv4 address if any, else the first address.
    pub fn preferred_addr(&self) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.addresses.iter().next())
            .map(|ip| SocketAddr::new(*ip, self.port))
    }
}

/// What the browser should do after a `found` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundOutcome {
    /// New peer: a placeholder was inserted; start resolving it and hand
    /// `attempt` back with the result.
    Resolve { attempt: u64 },
    /// Already resolving or resolved; nothing to do.
    Duplicate,
    /// Our own advertisement.
    OwnRecord,
}

/// Ordered name -> record map. At most one record per name.
#[derive(Debug, Default)]
pub struct Registry {
    own_name: Option<String>,
    records: Vec<PeerRecord>,
    /// In-flight resolutions by name, tagged with the attempt that owns them.
    resolving: HashMap<String, u64>,
    next_attempt: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that ignores the record advertised under `own_name`.
    pub fn with_own_name(own_name: impl Into<String>) -> Self {
        Self {
            own_name: Some(own_name.into()),
            ..Self::default()
        }
    }

    pub fn own_name(&self) -> Option<&str> {
        self.own_name.as_deref()
    }

    pub fn on_found(&mut self, name: &str) -> FoundOutcome {
        if self.own_name.as_deref() == Some(name) {
            return FoundOutcome::OwnRecord;
        }
        if self.resolving.contains_key(name) || self.position(name).is_some() {
            return FoundOutcome::Duplicate;
        }
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.resolving.insert(name.to_string(), attempt);
        self.records.push(PeerRecord::unresolved(name));
        FoundOutcome::Resolve { attempt }
    }

    /// True if `attempt` is the resolution currently in flight for `name`.
    fn owns(&self, name: &str, attempt: u64) -> bool {
        self.resolving.get(name) == Some(&attempt)
    }

    /// Resolution `attempt` finished. Returns true if the visible peer set
    /// changed. Results for names no longer tracked, or from an attempt that
    /// was superseded by a removal and re-announcement, are dropped; an empty
    /// address set counts as a failed resolution.
    pub fn on_resolved(
        &mut self,
        name: &str,
        attempt: u64,
        addresses: impl IntoIterator<Item = IpAddr>,
        port: u16,
    ) -> bool {
        if !self.owns(name, attempt) {
            return false;
        }
        let addresses: BTreeSet<IpAddr> = addresses.into_iter().collect();
        if addresses.is_empty() {
            self.on_resolve_failed(name, attempt);
            return false;
        }
        self.resolving.remove(name);
        match self.position(name) {
            Some(i) => {
                let record = &mut self.records[i];
                record.addresses = addresses;
                record.port = port;
                record.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Resolution `attempt` failed or timed out: drop the in-flight record so
    /// a later announcement can retry. Returns true if a record was dropped.
    pub fn on_resolve_failed(&mut self, name: &str, attempt: u64) -> bool {
        if !self.owns(name, attempt) {
            return false;
        }
        self.resolving.remove(name);
        match self.position(name) {
            Some(i) if !self.records[i].resolved => {
                self.records.remove(i);
                true
            }
            _ => false,
        }
    }

    /// Peer went away. Clears resolving and resolved state alike.
    /// Returns true if the visible peer set changed.
    pub fn on_removed(&mut self, name: &str) -> bool {
        self.resolving.remove(name);
        match self.position(name) {
            Some(i) => self.records.remove(i).resolved,
            None => false,
        }
    }

    /// Resolved peers in discovery order.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.records.iter().filter(|r| r.resolved).cloned().collect()
    }

    /// Resolved peer by name.
    pub fn get(&self, name: &str) -> Option<&PeerRecord> {
        self.records.iter().find(|r| r.resolved && r.name == name)
    }

    pub fn is_resolving(&self, name: &str) -> bool {
        self.resolving.contains_key(name)
    }

    /// Number of tracked records, resolved or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn found(r: &mut Registry, name: &str) -> u64 {
        match r.on_found(name) {
            FoundOutcome::Resolve { attempt } => attempt,
            other => panic!("expected a new resolve for {name}, got {other:?}"),
        }
    }

    #[test]
    fn found_then_resolved_becomes_visible() {
        let mut r = Registry::with_own_name("LanShare-me");
        let a = found(&mut r, "phone");
        assert!(r.snapshot().is_empty());
        assert!(r.get("phone").is_none());
        assert!(r.is_resolving("phone"));

        assert!(r.on_resolved("phone", a, [ip(7)], 8080));
        let peers = r.snapshot();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].resolved);
        assert_eq!(peers[0].port, 8080);
        assert_eq!(peers[0].preferred_addr(), Some("192.168.1.7:8080".parse().unwrap()));
        assert!(!r.is_resolving("phone"));
    }

    #[test]
    fn duplicate_found_is_idempotent() {
        let mut r = Registry::new();
        let a = found(&mut r, "phone");
        assert_eq!(r.on_found("phone"), FoundOutcome::Duplicate);
        assert_eq!(r.len(), 1);
        r.on_resolved("phone", a, [ip(7)], 8080);
        assert_eq!(r.on_found("phone"), FoundOutcome::Duplicate);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn own_record_is_filtered() {
        let mut r = Registry::with_own_name("LanShare-me");
        assert_eq!(r.on_found("LanShare-me"), FoundOutcome::OwnRecord);
        assert!(r.is_empty());
        assert!(!r.on_resolved("LanShare-me", 1, [ip(1)], 8080));
        assert!(r.snapshot().is_empty());
    }

    #[test]
    fn removed_clears_resolving_state() {
        let mut r = Registry::new();
        let a = found(&mut r, "tablet");
        assert!(!r.on_removed("tablet"));
        assert!(!r.is_resolving("tablet"));
        assert!(r.is_empty());
        // A late resolution for a removed peer is discarded.
        assert!(!r.on_resolved("tablet", a, [ip(3)], 8080));
        assert!(r.snapshot().is_empty());
        // And the peer can be found again.
        found(&mut r, "tablet");
    }

    #[test]
    fn stale_attempt_does_not_touch_reannounced_peer() {
        let mut r = Registry::new();
        let first = found(&mut r, "tablet");
        r.on_removed("tablet");
        let second = found(&mut r, "tablet");
        assert_ne!(first, second);

        // The first lookup answers late, with an old address.
        assert!(!r.on_resolved("tablet", first, [ip(3)], 1111));
        assert!(!r.on_resolve_failed("tablet", first));
        assert!(r.is_resolving("tablet"));
        assert_eq!(r.len(), 1);
        assert!(r.snapshot().is_empty());

        assert!(r.on_resolved("tablet", second, [ip(4)], 8080));
        let peer = r.get("tablet").unwrap();
        assert_eq!(peer.preferred_addr(), Some("192.168.1.4:8080".parse().unwrap()));
    }

    #[test]
    fn removed_clears_resolved_record() {
        let mut r = Registry::new();
        let a = found(&mut r, "tablet");
        r.on_resolved("tablet", a, [ip(3)], 8080);
        assert!(r.on_removed("tablet"));
        assert!(r.snapshot().is_empty());
        assert!(!r.on_removed("tablet"));
    }

    #[test]
    fn failed_resolution_allows_retry() {
        let mut r = Registry::new();
        let a = found(&mut r, "laptop");
        assert!(r.on_resolve_failed("laptop", a));
        assert!(r.is_empty());
        assert!(!r.is_resolving("laptop"));
        found(&mut r, "laptop");
    }

    #[test]
    fn empty_address_set_is_a_failure() {
        let mut r = Registry::new();
        let a = found(&mut r, "laptop");
        assert!(!r.on_resolved("laptop", a, std::iter::empty(), 8080));
        assert!(r.is_empty());
        assert!(!r.is_resolving("laptop"));
    }

    #[test]
    fn snapshot_keeps_discovery_order() {
        let mut r = Registry::new();
        let attempts: Vec<u64> = ["c", "a", "b"].iter().map(|n| found(&mut r, n)).collect();
        // Resolution order differs from discovery order.
        r.on_resolved("b", attempts[2], [ip(2)], 1);
        r.on_resolved("c", attempts[0], [ip(3)], 1);
        r.on_resolved("a", attempts[1], [ip(1)], 1);
        let names: Vec<_> = r.snapshot().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn preferred_addr_favours_ipv4() {
        let mut r = Registry::new();
        let a = found(&mut r, "dual");
        r.on_resolved("dual", a, [IpAddr::V6(Ipv6Addr::LOCALHOST), ip(9)], 4000);
        let peer = r.get("dual").unwrap();
        assert_eq!(peer.addresses.len(), 2);
        assert_eq!(peer.preferred_addr(), Some("192.168.1.9:4000".parse().unwrap()));
    }
}
