//! LanShare daemon: advertise this host over mDNS, browse for peers, and move
//! files between hosts over direct TCP connections.

pub mod config;
pub mod discovery;
pub mod mdns;
pub mod progress;
pub mod service;
pub mod transfer;

pub use config::Config;
pub use discovery::{Advertiser, Browser, DiscoveryBackend, DiscoveryError, MemoryBackend};
pub use mdns::MdnsBackend;
pub use progress::{ChannelSink, LogSink};
pub use service::ShareService;
pub use transfer::{TransferEngine, TransferSettings};
