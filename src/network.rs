//! Per-remote network lifecycle: the reconnection loop, detach/attach
//! state, delivery receipt persistence and the Web Push fan-out hook.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use slbnc_proto::{Casemap, Message, NameMap};

use crate::backoff::Backoff;
use crate::conn::{self, RateLimit, UpstreamAddr};
use crate::db;
use crate::delivered::DeliveredStore;
use crate::downstream::DownstreamConn;
use crate::identd::user_ident;
use crate::msgstore::MessageStore;
use crate::server::Shared;
use crate::upstream::{RegStep, RegistrationError, UpstreamConn};
use crate::user::{self, Event};
use crate::{
    CONNECT_TIMEOUT, RETRY_CONNECT_JITTER, RETRY_CONNECT_MAX_DELAY, RETRY_CONNECT_MIN_DELAY,
    UPSTREAM_MESSAGE_BURST, UPSTREAM_MESSAGE_DELAY,
};

/// Runtime state for one remote network, owned by the user task.
pub struct Network {
    pub record: db::Network,
    pub user_id: i64,
    pub shared: Arc<Shared>,
    pub channels: NameMap<db::Channel>,
    pub delivered: DeliveredStore,
    pub push_targets: NameMap<DateTime<Utc>>,
    pub conn: Option<UpstreamConn>,
    pub casemap: Casemap,
    pub last_error: Option<String>,
    /// Client names that have disconnected and still expect backlog.
    pub offline_clients: HashSet<String>,
    stopped: watch::Sender<bool>,
}

impl Network {
    pub fn new(
        record: db::Network,
        channels: Vec<db::Channel>,
        shared: Arc<Shared>,
        user_id: i64,
    ) -> Self {
        let casemap = Casemap::Rfc1459;
        let mut channel_map = NameMap::with_casemap(casemap);
        for ch in channels {
            let name = ch.name.clone();
            channel_map.insert(&name, ch);
        }
        let (stopped, _) = watch::channel(false);
        Network {
            record,
            user_id,
            shared,
            channels: channel_map,
            delivered: DeliveredStore::new(),
            push_targets: NameMap::with_casemap(casemap),
            conn: None,
            casemap,
            last_error: None,
            offline_clients: HashSet::new(),
            stopped,
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Signal the run loop to exit; the connection closes when the
    /// upstream state is dropped.
    pub fn stop(&mut self) {
        self.stopped.send_replace(true);
        self.conn = None;
    }

    /// Start the reconnection loop for this network.
    pub fn spawn_run_loop(
        &self,
        user_record: db::User,
        events: mpsc::Sender<Event>,
    ) -> JoinHandle<()> {
        let record = self.record.clone();
        let shared = self.shared.clone();
        let stopped = self.stopped.subscribe();
        tokio::spawn(run(record, user_record, shared, events, stopped))
    }

    /// Record a push-worthy message and fan out to Web Push endpoints.
    ///
    /// Delivery transport is out of scope; the hook enumerates the user's
    /// subscriptions and logs each attempt.
    pub fn maybe_push(&mut self, msg: &Message) {
        if msg.command != "PRIVMSG" && msg.command != "NOTICE" {
            return;
        }
        let Some(sender) = msg.source_nickname() else {
            return;
        };
        let Some(target) = msg.params.first() else {
            return;
        };
        let text = msg.params.get(1).map(String::as_str).unwrap_or("");

        let our_nick = match &self.conn {
            Some(uc) => uc.nick.clone(),
            None => self.record.nick.clone(),
        };
        if self.casemap.eq(sender, &our_nick) {
            return;
        }
        let direct = self.casemap.eq(target, &our_nick);
        let highlight = is_highlight(text, &our_nick);
        if !direct && !highlight {
            return;
        }

        self.push_targets.insert(target, Utc::now());

        let shared = self.shared.clone();
        let user_id = self.user_id;
        let net_id = self.record.id;
        let summary = format!("<{}> {}", sender, text);
        tokio::spawn(async move {
            let subs = match shared.db.list_webpush_subscriptions(user_id, net_id).await {
                Ok(subs) => subs,
                Err(e) => {
                    warn!(error = %e, "failed to list Web Push subscriptions");
                    return;
                }
            };
            for sub in subs {
                debug!(endpoint = %sub.endpoint, message = %summary, "delivering Web Push notification");
            }
        });
    }

    /// True when this network's highlight rules match the message text.
    pub fn is_highlight_for(&self, sender: &str, text: &str) -> bool {
        let nick = match &self.conn {
            Some(uc) => &uc.nick,
            None => &self.record.nick,
        };
        !self.casemap.eq(sender, nick) && is_highlight(text, nick)
    }

    /// Persist the delivery receipts of one client for this network.
    pub async fn store_client_delivery_receipts(&self, client_name: &str) {
        if client_name.is_empty() {
            // Ephemeral clients leave no persistent receipts.
            return;
        }
        let mut receipts = Vec::new();
        self.delivered.for_each_target(|target| {
            if let Some(id) = self.delivered.load_id(target, client_name) {
                if !id.is_empty() {
                    receipts.push(db::DeliveryReceipt {
                        target: target.to_owned(),
                        internal_msg_id: id.to_owned(),
                    });
                }
            }
        });
        if let Err(e) = self
            .shared
            .db
            .store_client_delivery_receipts(self.record.id, client_name, &receipts)
            .await
        {
            warn!(client = %client_name, error = %e, "failed to store delivery receipts");
        }
    }

    /// Store SASL PLAIN credentials sniffed from a NickServ exchange.
    /// Never overwrites another configured mechanism.
    pub async fn auto_save_sasl_plain(&mut self, username: &str, password: &str) {
        if !self.record.sasl.mechanism.is_empty() && self.record.sasl.mechanism != "PLAIN" {
            return;
        }
        info!(username = %username, "auto-saving SASL PLAIN credentials");
        self.record.sasl.mechanism = "PLAIN".into();
        self.record.sasl.plain_username = username.to_owned();
        self.record.sasl.plain_password = password.to_owned();
        let mut record = self.record.clone();
        if let Err(e) = self.shared.db.store_network(self.user_id, &mut record).await {
            warn!(error = %e, "failed to save SASL PLAIN credentials");
        }
    }
}

/// Whether a message in a detached channel warrants a service notice.
pub fn detached_message_needs_relay(ch: &db::Channel, highlight: bool) -> bool {
    ch.relay_detached == db::Filter::Message
        || ((ch.relay_detached == db::Filter::Highlight
            || ch.relay_detached == db::Filter::Default)
            && highlight)
}

/// Mark a channel detached: snapshot the backlog floor, cancel the
/// auto-detach timer and hide the channel from downstreams.
pub fn detach(
    net: &mut Network,
    downstreams: &[DownstreamConn],
    store: &dyn MessageStore,
    name: &str,
) {
    let Some(ch) = net.channels.get(name) else {
        return;
    };
    if ch.detached {
        return;
    }
    info!(channel = %name, "detaching channel");

    let name_cm = net.casemap.canonical(name);
    let last_id = store
        .last_msg_id(&net.record, &name_cm)
        .unwrap_or(None)
        .unwrap_or_default();

    let ch = net.channels.get_mut(name).unwrap();
    ch.detached = true;
    ch.detached_internal_msg_id = last_id;
    let ch_name = ch.name.clone();

    if let Some(uc) = net.conn.as_mut() {
        let events = uc.events_tx.clone();
        let net_id = uc.net_id;
        if let Some(uch) = uc.channels.get_mut(name) {
            uch.update_auto_detach(std::time::Duration::ZERO, events, net_id);
        }
    }

    for dc in user::downstreams_for(downstreams, net.record.id) {
        let marshaled = dc.marshal_entity(net, &ch_name);
        dc.send(
            Message::new("PART", vec![marshaled, "Detach".into()]).with_prefix(dc.prefix()),
        );
    }
}

/// Re-attach a detached channel: replay the channel state and the backlog
/// accumulated since the detach floor.
pub fn attach(
    net: &mut Network,
    downstreams: &[DownstreamConn],
    store: &dyn MessageStore,
    hostname: &str,
    history_limit: usize,
    name: &str,
) {
    let Some(ch) = net.channels.get_mut(name) else {
        return;
    };
    if !ch.detached {
        return;
    }
    info!(channel = %name, "attaching channel");

    let detached_msg_id = std::mem::take(&mut ch.detached_internal_msg_id);
    ch.detached = false;
    let ch_name = ch.name.clone();

    if let Some(uc) = net.conn.as_mut() {
        let channels = net.channels.clone();
        uc.update_channel_auto_detach(&channels, name);
    }

    for dc in user::downstreams_for(downstreams, net.record.id) {
        let marshaled = dc.marshal_entity(net, &ch_name);
        dc.send(Message::new("JOIN", vec![marshaled]).with_prefix(dc.prefix()));

        if let Some(uc) = net.conn.as_ref() {
            if let Some(uch) = uc.channels.get(&ch_name) {
                if uch.complete {
                    crate::downstream::forward_channel(dc, net, uch, hostname);
                }
            }
        }

        if !detached_msg_id.is_empty() {
            crate::downstream::send_target_backlog(
                dc,
                net,
                store,
                hostname,
                history_limit,
                &ch_name,
                &detached_msg_id,
            );
        }
    }
}

/// Swap the network's casemap and re-key every name-indexed structure.
pub fn update_casemapping(
    net: &mut Network,
    downstreams: &mut [DownstreamConn],
    casemap: Casemap,
) {
    net.casemap = casemap;
    net.channels.set_casemap(casemap);
    net.delivered.set_casemap(casemap);
    net.push_targets.set_casemap(casemap);
    if let Some(uc) = net.conn.as_mut() {
        uc.channels.set_casemap(casemap);
        for (_, uch) in uc.channels.iter_mut() {
            uch.members.set_casemap(casemap);
        }
        uc.monitored.set_casemap(casemap);
    }
    for dc in downstreams
        .iter_mut()
        .filter(|dc| dc.network_id == Some(net.record.id))
    {
        dc.monitored.set_casemap(casemap);
    }
}

enum ConnError {
    Registration(RegistrationError),
    Other(anyhow::Error),
}

impl std::fmt::Display for ConnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnError::Registration(e) => write!(f, "failed to register: {}", e.reason),
            ConnError::Other(e) => write!(f, "connection error: {:#}", e),
        }
    }
}

/// Pick the deterministic local bind address for this user, if ranges are
/// configured.
fn local_bind_ip(shared: &Shared, user_id: i64, addr: &UpstreamAddr) -> anyhow::Result<Option<IpAddr>> {
    let upstream = &shared.config.upstream;
    if upstream.bind_ipv4.is_none() && upstream.bind_ipv6.is_none() {
        return Ok(None);
    }
    if matches!(addr, UpstreamAddr::Unix { .. }) {
        return Ok(None);
    }

    // Prefer the v4 range; v6 is used when it is the only one configured.
    let range = match (&upstream.bind_ipv4, &upstream.bind_ipv6) {
        (Some(r), _) => crate::config::IpRange::parse(r)?,
        (None, Some(r)) => crate::config::IpRange::parse(r)?,
        (None, None) => return Ok(None),
    };
    let offset = u128::try_from(user_id).unwrap_or(0) + 1;
    match range.addr_at(offset) {
        Some(ip) => Ok(Some(ip)),
        None => anyhow::bail!("IP range {:?} too small for user {}", range, user_id),
    }
}

/// The reconnection loop: dial, register, pump messages, back off.
async fn run(
    record: db::Network,
    user_record: db::User,
    shared: Arc<Shared>,
    events: mpsc::Sender<Event>,
    mut stopped: watch::Receiver<bool>,
) {
    if !record.enabled {
        return;
    }

    let mut backoff = Backoff::new(
        RETRY_CONNECT_MIN_DELAY,
        RETRY_CONNECT_MAX_DELAY,
        RETRY_CONNECT_JITTER,
    );

    loop {
        if *stopped.borrow() {
            return;
        }

        let delay = backoff.next();
        if !delay.is_zero() {
            info!(
                network = %record.get_name(),
                delay_secs = delay.as_secs(),
                "waiting before reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped.changed() => return,
            }
        }

        match run_conn(&record, &user_record, &shared, &events, &mut stopped).await {
            Ok(()) => {
                backoff.reset();
            }
            Err(e) => {
                warn!(network = %record.get_name(), error = %e, "upstream connection failed");
                let _ = events
                    .send(Event::UpstreamConnectionError {
                        net_id: record.id,
                        err: e.to_string(),
                    })
                    .await;
                if let ConnError::Registration(reg) = &e {
                    if !reg.temporary {
                        // The network stays present but idle.
                        return;
                    }
                }
            }
        }
    }
}

/// One connection attempt, from dial to read-loop exit.
async fn run_conn(
    record: &db::Network,
    user_record: &db::User,
    shared: &Arc<Shared>,
    events: &mpsc::Sender<Event>,
    stopped: &mut watch::Receiver<bool>,
) -> Result<(), ConnError> {
    let addr = conn::parse_upstream_addr(&record.addr).map_err(ConnError::Other)?;
    let local_ip =
        local_bind_ip(shared, user_record.id, &addr).map_err(ConnError::Other)?;

    info!(network = %record.get_name(), addr = %record.addr, "connecting to upstream");

    let dialed = tokio::time::timeout(
        CONNECT_TIMEOUT,
        conn::dial_upstream(&record.addr, &record.sasl, local_ip),
    )
    .await
    .map_err(|_| ConnError::Other(anyhow::anyhow!("connect timed out")))?
    .context("failed to connect")
    .map_err(ConnError::Other)?;

    let remote_addr = dialed.remote_addr.clone();
    let local_addr = dialed.local_addr.clone();
    shared
        .identd
        .store(&remote_addr, &local_addr, user_ident(user_record.id));

    let result = run_registered_conn(
        dialed, record, user_record, shared, events, stopped,
    )
    .await;

    shared.identd.delete(&remote_addr, &local_addr);
    result
}

async fn run_registered_conn(
    dialed: conn::Dialed,
    record: &db::Network,
    user_record: &db::User,
    _shared: &Arc<Shared>,
    events: &mpsc::Sender<Event>,
    stopped: &mut watch::Receiver<bool>,
) -> Result<(), ConnError> {
    let (mut reader, writer) = conn::split(dialed.stream);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = conn::spawn_writer(
        writer,
        out_rx,
        Some(RateLimit {
            delay: UPSTREAM_MESSAGE_DELAY,
            burst: UPSTREAM_MESSAGE_BURST,
        }),
    );

    let mut uc = UpstreamConn::new(
        record,
        user_record,
        events.clone(),
        out_tx,
        dialed.remote_addr,
        dialed.local_addr,
    );
    uc.register(record);

    // Registration happens here, on the network task; the connection is
    // not shared with anyone yet.
    let registration = async {
        loop {
            let msg = match reader.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Err(ConnError::Other(
                        anyhow::Error::from(e).context("failed to read message"),
                    ))
                }
                None => {
                    return Err(ConnError::Other(anyhow::anyhow!(
                        "connection closed during registration"
                    )))
                }
            };
            match uc.handle_registration_message(&msg) {
                Ok(RegStep::Continue) => {}
                Ok(RegStep::Registered) => return Ok(()),
                Err(e) => return Err(ConnError::Registration(e)),
            }
        }
    };
    match tokio::time::timeout(CONNECT_TIMEOUT, registration).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            writer_task.abort();
            return Err(e);
        }
        Err(_) => {
            writer_task.abort();
            return Err(ConnError::Other(anyhow::anyhow!(
                "registration timed out"
            )));
        }
    }

    let net_id = record.id;
    // Ownership of the registered connection moves to the user task; if
    // the network was stopped or removed meanwhile, the user task drops
    // it, which closes the writer.
    if events
        .send(Event::UpstreamConnected { uc: Box::new(uc) })
        .await
        .is_err()
    {
        return Ok(());
    }

    let result = loop {
        tokio::select! {
            msg = reader.next() => match msg {
                Some(Ok(msg)) => {
                    if events
                        .send(Event::UpstreamMessage { net_id, msg })
                        .await
                        .is_err()
                    {
                        break Ok(());
                    }
                }
                Some(Err(e)) => {
                    let _ = events
                        .send(Event::UpstreamError {
                            net_id,
                            err: format!("failed to read message: {}", e),
                        })
                        .await;
                    break Ok(());
                }
                None => break Ok(()),
            },
            _ = stopped.changed() => break Ok(()),
        }
    };

    let _ = events
        .send(Event::UpstreamDisconnected { net_id })
        .await;
    result
}

fn is_word_boundary(c: char) -> bool {
    match c {
        '-' | '_' | '|' => false,
        '\u{00A0}' => true,
        _ => !c.is_alphanumeric(),
    }
}

/// Case-sensitive whole-word nick search, the conventional highlight rule.
pub fn is_highlight(text: &str, nick: &str) -> bool {
    if nick.is_empty() {
        return false;
    }
    let mut rest = text;
    loop {
        let Some(i) = rest.find(nick) else {
            return false;
        };
        let before = rest[..i].chars().next_back();
        let after = rest[i + nick.len()..].chars().next();
        if before.map_or(true, is_word_boundary) && after.map_or(true, is_word_boundary) {
            return true;
        }
        rest = &rest[i + nick.len()..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlight_word_boundaries() {
        assert!(is_highlight("hey alice!", "alice"));
        assert!(is_highlight("alice: ping", "alice"));
        assert!(!is_highlight("malice is afoot", "alice"));
        assert!(!is_highlight("alice_ is someone else", "alice"));
        assert!(!is_highlight("no mention here", "alice"));
        assert!(is_highlight("alice", "alice"));
    }

    #[test]
    fn relay_filters() {
        let ch = |relay| db::Channel {
            relay_detached: relay,
            ..Default::default()
        };
        assert!(detached_message_needs_relay(&ch(db::Filter::Message), false));
        assert!(detached_message_needs_relay(&ch(db::Filter::Default), true));
        assert!(!detached_message_needs_relay(&ch(db::Filter::Default), false));
        assert!(detached_message_needs_relay(&ch(db::Filter::Highlight), true));
        assert!(!detached_message_needs_relay(&ch(db::Filter::None), true));
    }
}
