//! slbncd - a multi-user IRC bouncer.
//!
//! The bouncer keeps long-lived connections to remote IRC networks on
//! behalf of its users, multiplexes any number of concurrent clients per
//! user onto those connections, and replays missed conversation so clients
//! see continuity across disconnects.
//!
//! All state belonging to one user is mutated by a single task consuming
//! that user's event queue; sockets only produce events.

pub mod backoff;
pub mod config;
pub mod conn;
pub mod db;
pub mod delivered;
pub mod downstream;
pub mod identd;
pub mod msgstore;
pub mod network;
pub mod server;
pub mod service;
pub mod upstream;
pub mod user;

use std::time::Duration;

/// Nick reserved for the bouncer's service.
pub const SERVICE_NICK: &str = "BouncerServ";

/// PING token prefix used for delivery confirmation of a message ID.
pub const MSGID_PING_PREFIX: &str = "soju-msgid-";

/// Vendor capability for network discovery by id.
pub const CAP_BOUNCER_NETWORKS: &str = "soju.im/bouncer-networks";
/// Vendor capability for network state change notifications.
pub const CAP_BOUNCER_NETWORKS_NOTIFY: &str = "soju.im/bouncer-networks-notify";

/// Per-attempt upstream dial budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Reconnect backoff bounds.
pub const RETRY_CONNECT_MIN_DELAY: Duration = Duration::from_secs(60);
pub const RETRY_CONNECT_MAX_DELAY: Duration = Duration::from_secs(600);
pub const RETRY_CONNECT_JITTER: f64 = 0.25;

/// Upstream write rate limit: one message per delay once the burst is used.
pub const UPSTREAM_MESSAGE_DELAY: Duration = Duration::from_secs(2);
pub const UPSTREAM_MESSAGE_BURST: u32 = 10;

/// Capacity of a user's event queue; producers block when it is full.
pub const EVENT_QUEUE_CAP: usize = 64;
