//! Per-user event loop.
//!
//! One task per user consumes the bounded event queue and performs every
//! mutation of that user's networks, upstream connections and downstream
//! connections. Sockets, timers and admin calls only produce events.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use slbnc_proto::{Message, Prefix};

use crate::db;
use crate::downstream::{self, DownstreamConn, HandlerError};
use crate::msgstore::MessageStore;
use crate::network::Network;
use crate::server::Shared;
use crate::upstream::{self, UpstreamConn};
use crate::{CAP_BOUNCER_NETWORKS, CAP_BOUNCER_NETWORKS_NOTIFY, EVENT_QUEUE_CAP};

/// Everything that can happen to a user.
pub enum Event {
    /// A freshly registered upstream connection; ownership moves here.
    UpstreamConnected { uc: Box<UpstreamConn> },
    UpstreamDisconnected { net_id: i64 },
    /// Failure while connecting or registering.
    UpstreamConnectionError { net_id: i64, err: String },
    /// Failure on an established connection.
    UpstreamError { net_id: i64, err: String },
    UpstreamMessage { net_id: i64, msg: Message },
    ChannelDetach { net_id: i64, name: String },
    DownstreamConnected { dc: Box<DownstreamConn> },
    DownstreamDisconnected { id: u64 },
    DownstreamMessage { id: u64, msg: Message },
    Broadcast { msg: Message },
    UserUpdate {
        password: Option<String>,
        admin: Option<bool>,
        nick: Option<String>,
        realname: Option<String>,
        done: oneshot::Sender<Result<(), String>>,
    },
    TryRegainNick { net_id: i64, nick: String },
    Stop,
}

/// A LIST fan-out in progress for one downstream.
pub struct PendingList {
    pub downstream_id: u64,
    /// network id -> LIST command still to complete there.
    pub pending: HashMap<i64, Message>,
}

/// All state belonging to one user; owned by its event loop task.
pub struct User {
    pub record: db::User,
    pub shared: Arc<Shared>,
    pub events_tx: mpsc::Sender<Event>,
    pub msg_store: Arc<dyn MessageStore>,
    pub networks: Vec<Network>,
    pub downstreams: Vec<DownstreamConn>,
    pub pending_lists: Vec<PendingList>,
}

/// Downstreams attached to a network: bound to it, or multi-network.
pub fn downstreams_for(
    downstreams: &[DownstreamConn],
    net_id: i64,
) -> impl Iterator<Item = &DownstreamConn> {
    downstreams
        .iter()
        .filter(move |dc| dc.network_id.map_or(true, |id| id == net_id))
}

pub fn downstreams_for_mut(
    downstreams: &mut [DownstreamConn],
    net_id: i64,
) -> impl Iterator<Item = &mut DownstreamConn> {
    downstreams
        .iter_mut()
        .filter(move |dc| dc.network_id.map_or(true, |id| id == net_id))
}

/// Like [`downstreams_for`], further restricted to one downstream when a
/// labeled response identified it.
pub fn downstreams_for_id(
    downstreams: &[DownstreamConn],
    net_id: i64,
    id: Option<u64>,
) -> impl Iterator<Item = &DownstreamConn> {
    downstreams_for(downstreams, net_id).filter(move |dc| id.map_or(true, |id| dc.id == id))
}

/// Serialize bouncer-networks attributes (message-tag escaping).
pub fn format_attrs<V: AsRef<str>>(attrs: &[(&str, V)]) -> String {
    let mut out = String::new();
    for (i, (key, value)) in attrs.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(key);
        out.push('=');
        let _ = slbnc_proto::tags::escape_tag_value(&mut out, value.as_ref());
    }
    out
}

/// Current bouncer-networks attributes of a network.
pub fn network_attrs(net: &Network) -> Vec<(&'static str, String)> {
    let state = if net.conn.is_some() {
        "connected"
    } else {
        "disconnected"
    };
    let mut attrs = vec![
        ("name", net.record.get_name().to_owned()),
        ("host", net.record.addr.clone()),
        ("state", state.to_owned()),
        ("nickname", net.record.nick.clone()),
    ];
    if let Some(err) = &net.last_error {
        attrs.push(("error", err.clone()));
    }
    attrs
}

/// Broadcast a BOUNCER NETWORK state change to interested downstreams.
pub fn notify_bouncer_network_state(
    downstreams: &[DownstreamConn],
    hostname: &str,
    net_id: i64,
    attrs: &[(&str, &str)],
) {
    for dc in downstreams {
        if !dc.caps.is_enabled(CAP_BOUNCER_NETWORKS_NOTIFY) {
            continue;
        }
        dc.send(
            Message::new(
                "BOUNCER",
                vec![
                    "NETWORK".into(),
                    net_id.to_string(),
                    format_attrs(attrs),
                ],
            )
            .with_prefix(Prefix::ServerName(hostname.to_owned())),
        );
    }
}

/// Validate and create a new network, persist it and start its run loop.
pub async fn create_network(user: &mut User, mut record: db::Network) -> anyhow::Result<i64> {
    crate::conn::parse_upstream_addr(&record.addr)?;
    if record.get_name().is_empty() {
        bail!("network name cannot be empty");
    }
    if record.get_name().starts_with('-') {
        bail!("network name cannot start with a dash character");
    }
    for net in &user.networks {
        if net.record.get_name() == record.get_name() {
            bail!("a network with the name {:?} already exists", record.get_name());
        }
    }

    user.shared.db.store_network(user.record.id, &mut record).await?;
    let net = Network::new(record, Vec::new(), user.shared.clone(), user.record.id);
    net.spawn_run_loop(user.record.clone(), user.events_tx.clone());
    let net_id = net.record.id;

    let attrs = network_attrs(&net);
    let attrs: Vec<(&str, &str)> = attrs.iter().map(|(k, v)| (*k, v.as_str())).collect();
    user.networks.push(net);
    notify_bouncer_network_state(&user.downstreams, &user.shared.hostname, net_id, &attrs);
    Ok(net_id)
}

impl User {
    /// Build a user and its event queue.
    pub fn new(
        record: db::User,
        shared: Arc<Shared>,
        msg_store: Arc<dyn MessageStore>,
    ) -> (Self, mpsc::Sender<Event>, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAP);
        let user = User {
            record,
            shared,
            events_tx: events_tx.clone(),
            msg_store,
            networks: Vec::new(),
            downstreams: Vec::new(),
            pending_lists: Vec::new(),
        };
        (user, events_tx, events_rx)
    }

    /// Load persisted networks and start their run loops.
    pub async fn load_networks(&mut self) -> Result<(), db::DbError> {
        let records = self.shared.db.list_networks(self.record.id).await?;
        for record in records {
            let channels = self.shared.db.list_channels(record.id).await?;
            let receipts = self.shared.db.list_delivery_receipts(record.id).await?;

            let net = Network::new(record, channels, self.shared.clone(), self.record.id);
            net.spawn_run_loop(self.record.clone(), self.events_tx.clone());
            self.networks.push(net);
            let net = self.networks.last_mut().unwrap();
            for (client, receipt) in receipts {
                net.delivered
                    .store_id(&receipt.target, &client, &receipt.internal_msg_id);
                net.offline_clients.insert(client);
            }
        }
        Ok(())
    }

    fn network_idx(&self, net_id: i64) -> Option<usize> {
        self.networks.iter().position(|n| n.record.id == net_id)
    }

    /// Recompute auto-away on every upstream after a downstream change.
    fn update_away(&mut self) {
        let User {
            networks,
            downstreams,
            ..
        } = self;
        for net in networks.iter_mut() {
            let has = downstreams_for(downstreams, net.record.id).next().is_some();
            if let Some(uc) = net.conn.as_mut() {
                uc.update_away(has);
            }
        }
    }

    fn update_monitor(&mut self) {
        let User {
            networks,
            downstreams,
            ..
        } = self;
        for net in networks.iter_mut() {
            let net_id = net.record.id;
            let Some(uc) = net.conn.as_mut() else {
                continue;
            };
            let wanted: Vec<String> = downstreams
                .iter()
                .filter(|dc| dc.network_id == Some(net_id))
                .flat_map(|dc| dc.monitored.iter().map(|(nick, _)| nick.to_owned()))
                .collect();
            uc.update_monitor(wanted.iter().map(String::as_str));
        }
    }

    /// Run the event loop until `Event::Stop`.
    pub async fn run(mut self, mut events_rx: mpsc::Receiver<Event>) {
        if let Err(e) = self.load_networks().await {
            warn!(user = %self.record.username, error = %e, "failed to load networks");
            return;
        }

        while let Some(event) = events_rx.recv().await {
            match event {
                Event::UpstreamConnected { uc } => self.handle_upstream_connected(*uc),
                Event::UpstreamDisconnected { net_id } => {
                    self.handle_upstream_disconnected(net_id);
                }
                Event::UpstreamConnectionError { net_id, err } => {
                    self.handle_upstream_connection_error(net_id, err);
                }
                Event::UpstreamError { net_id, err } => {
                    self.handle_upstream_error(net_id, err);
                }
                Event::UpstreamMessage { net_id, msg } => {
                    if let Err(e) = upstream::handle_message(&mut self, net_id, msg).await {
                        warn!(error = %e, "failed to handle upstream message");
                    }
                }
                Event::ChannelDetach { net_id, name } => {
                    self.handle_channel_detach(net_id, name).await;
                }
                Event::DownstreamConnected { dc } => {
                    self.handle_downstream_connected(*dc).await;
                }
                Event::DownstreamDisconnected { id } => {
                    self.handle_downstream_disconnected(id).await;
                }
                Event::DownstreamMessage { id, msg } => {
                    let closed = self
                        .downstreams
                        .iter()
                        .find(|dc| dc.id == id)
                        .map(|dc| dc.is_closed());
                    match closed {
                        None | Some(true) => continue,
                        Some(false) => {}
                    }
                    match downstream::handle_message(&mut self, id, msg).await {
                        Ok(()) => {}
                        Err(HandlerError::Irc(mut reply)) => {
                            if let Some(dc) = self.downstreams.iter().find(|dc| dc.id == id) {
                                reply.prefix =
                                    Some(Prefix::ServerName(self.shared.hostname.clone()));
                                dc.send(reply);
                            }
                        }
                        Err(HandlerError::Fatal(err)) => {
                            warn!(error = %err, "failed to handle downstream message");
                            if let Some(dc) = self.downstreams.iter().find(|dc| dc.id == id) {
                                dc.send(Message::new(
                                    "ERROR",
                                    vec!["Internal server error".into()],
                                ));
                                dc.close();
                            }
                        }
                    }
                }
                Event::Broadcast { msg } => {
                    for dc in &self.downstreams {
                        dc.send(msg.clone());
                    }
                }
                Event::UserUpdate {
                    password,
                    admin,
                    nick,
                    realname,
                    done,
                } => {
                    let result = self
                        .handle_user_update(password.clone(), admin, nick, realname)
                        .await;
                    let _ = done.send(result.map_err(|e| e.to_string()));
                    if password.is_some() {
                        for dc in &self.downstreams {
                            dc.close();
                        }
                    }
                }
                Event::TryRegainNick { net_id, nick } => {
                    if let Some(idx) = self.network_idx(net_id) {
                        if let Some(uc) = self.networks[idx].conn.as_mut() {
                            uc.try_regain_nick(&nick);
                        }
                    }
                }
                Event::Stop => {
                    for dc in &self.downstreams {
                        dc.close();
                    }
                    for net in &mut self.networks {
                        net.stop();
                    }
                    for net in &self.networks {
                        let mut clients = Vec::new();
                        net.delivered.for_each_client(|c| clients.push(c.to_owned()));
                        for client in clients {
                            net.store_client_delivery_receipts(&client).await;
                        }
                    }
                    return;
                }
            }
        }
    }

    fn handle_upstream_connected(&mut self, uc: UpstreamConn) {
        let net_id = uc.net_id;
        let Some(idx) = self.network_idx(net_id) else {
            // The network is gone; dropping the connection closes it.
            return;
        };
        if self.networks[idx].is_stopped() {
            return;
        }

        let User {
            networks,
            downstreams,
            shared,
            record,
            ..
        } = self;
        let net = &mut networks[idx];
        net.conn = Some(uc);
        net.last_error = None;

        let uc = net.conn.as_mut().unwrap();
        for command in &net.record.connect_commands {
            match command.parse::<Message>() {
                Ok(msg) => uc.send(msg),
                Err(e) => warn!(command = %command, error = %e, "failed to parse connect command"),
            }
        }
        for (_, ch) in net.channels.iter() {
            let mut params = vec![ch.name.clone()];
            if !ch.key.is_empty() {
                params.push(ch.key.clone());
            }
            uc.send(Message::new("JOIN", params));
        }

        let has_downstreams = downstreams_for(downstreams, net_id).next().is_some();
        uc.update_away(has_downstreams);
        let wanted: Vec<String> = downstreams
            .iter()
            .filter(|dc| dc.network_id == Some(net_id))
            .flat_map(|dc| dc.monitored.iter().map(|(nick, _)| nick.to_owned()))
            .collect();
        uc.update_monitor(wanted.iter().map(String::as_str));

        let wanted_nick = net.record.get_nick(record);
        let uc = net.conn.as_mut().unwrap();
        if !uc.casemap().eq(&uc.nick, &wanted_nick) {
            uc.schedule_regain_nick(wanted_nick);
        }

        let name = net.record.get_name().to_owned();
        let net = &networks[idx];
        for dc in downstreams_for_mut(downstreams, net_id) {
            downstream::update_supported_caps(dc, networks);
            if !dc.caps.is_enabled(CAP_BOUNCER_NETWORKS) {
                dc.send_service_notice(&shared.hostname, &format!("connected to {}", name));
            }
            downstream::update_nick(dc, net);
        }
        notify_bouncer_network_state(
            downstreams,
            &shared.hostname,
            net_id,
            &[("state", "connected"), ("error", "")],
        );
    }

    fn handle_upstream_disconnected(&mut self, net_id: i64) {
        let Some(idx) = self.network_idx(net_id) else {
            return;
        };

        let User {
            networks,
            downstreams,
            pending_lists,
            shared,
            ..
        } = self;
        // Dropping the connection cancels its timers.
        networks[idx].conn = None;

        upstream::end_pending_lists(
            networks,
            downstreams,
            pending_lists,
            &shared.hostname,
            idx,
            true,
        );

        for dc in downstreams.iter_mut() {
            downstream::update_supported_caps(dc, networks);
        }

        notify_bouncer_network_state(
            downstreams,
            &shared.hostname,
            net_id,
            &[("state", "disconnected")],
        );

        let net = &networks[idx];
        if net.last_error.is_none() {
            for dc in downstreams_for(downstreams, net_id) {
                if !dc.caps.is_enabled(CAP_BOUNCER_NETWORKS) {
                    dc.send_service_notice(
                        &shared.hostname,
                        &format!("disconnected from {}", net.record.get_name()),
                    );
                }
            }
        }
    }

    fn handle_upstream_connection_error(&mut self, net_id: i64, err: String) {
        let Some(idx) = self.network_idx(net_id) else {
            return;
        };
        let net = &mut self.networks[idx];
        if !net.is_stopped() && net.last_error.as_deref() != Some(err.as_str()) {
            let name = net.record.get_name().to_owned();
            for dc in downstreams_for(&self.downstreams, net_id) {
                dc.send_service_notice(
                    &self.shared.hostname,
                    &format!("failed connecting/registering to {}: {}", name, err),
                );
            }
        }
        self.networks[idx].last_error = Some(err.clone());
        notify_bouncer_network_state(
            &self.downstreams,
            &self.shared.hostname,
            net_id,
            &[("error", err.as_str())],
        );
    }

    fn handle_upstream_error(&mut self, net_id: i64, err: String) {
        let Some(idx) = self.network_idx(net_id) else {
            return;
        };
        let name = self.networks[idx].record.get_name().to_owned();
        for dc in downstreams_for(&self.downstreams, net_id) {
            dc.send_service_notice(
                &self.shared.hostname,
                &format!("disconnected from {}: {}", name, err),
            );
        }
        self.networks[idx].last_error = Some(err.clone());
        notify_bouncer_network_state(
            &self.downstreams,
            &self.shared.hostname,
            net_id,
            &[("error", err.as_str())],
        );
    }

    async fn handle_channel_detach(&mut self, net_id: i64, name: String) {
        let Some(idx) = self.network_idx(net_id) else {
            return;
        };
        let User {
            networks,
            downstreams,
            msg_store,
            shared,
            ..
        } = self;
        let net = &mut networks[idx];
        match net.channels.get(&name) {
            Some(ch) if !ch.detached => {}
            _ => return,
        }
        crate::network::detach(net, downstreams, msg_store.as_ref(), &name);
        if let Some(ch) = net.channels.get(&name) {
            let mut ch = ch.clone();
            if let Err(e) = shared.db.store_channel(net_id, &mut ch).await {
                warn!(channel = %name, error = %e, "failed to store detached channel");
            } else {
                net.channels.insert(&name, ch);
            }
        }
    }

    async fn handle_downstream_connected(&mut self, mut dc: DownstreamConn) {
        match downstream::welcome(self, &mut dc).await {
            Ok(()) => {
                self.downstreams.push(dc);
                self.update_away();
            }
            Err(HandlerError::Irc(mut reply)) => {
                reply.prefix = Some(Prefix::ServerName(self.shared.hostname.clone()));
                dc.send(reply);
                dc.close();
            }
            Err(HandlerError::Fatal(err)) => {
                warn!(error = %err, "failed to welcome downstream connection");
                dc.send(Message::new("ERROR", vec!["Internal server error".into()]));
                dc.close();
            }
        }
    }

    async fn handle_downstream_disconnected(&mut self, id: u64) {
        let Some(idx) = self.downstreams.iter().position(|dc| dc.id == id) else {
            return;
        };
        let dc = self.downstreams.remove(idx);

        for net in self
            .networks
            .iter_mut()
            .filter(|n| dc.network_id.map_or(true, |nid| nid == n.record.id))
        {
            net.offline_clients.insert(dc.client_name.clone());
            net.store_client_delivery_receipts(&dc.client_name).await;
        }

        // Cancel LIST fan-outs issued by this downstream.
        self.pending_lists.retain(|pl| pl.downstream_id != id);
        for net in &mut self.networks {
            if let Some(uc) = net.conn.as_mut() {
                uc.pending_list_downstreams.remove(&id);
            }
        }

        self.update_away();
        self.update_monitor();
    }

    async fn handle_user_update(
        &mut self,
        password: Option<String>,
        admin: Option<bool>,
        nick: Option<String>,
        realname: Option<String>,
    ) -> Result<(), db::DbError> {
        let mut record = self.record.clone();
        if let Some(password) = password {
            record.password = password;
        }
        if let Some(admin) = admin {
            record.admin = admin;
        }
        let nick_updated = nick.as_ref().is_some_and(|n| *n != record.nick);
        if let Some(nick) = nick {
            record.nick = nick;
        }
        let realname_updated = realname.as_ref().is_some_and(|r| *r != record.realname);
        if let Some(realname) = realname {
            record.realname = realname;
        }

        self.shared.db.store_user(&mut record).await?;
        self.record = record;
        info!(user = %self.record.username, "updated user record");

        if nick_updated {
            for net in &self.networks {
                if !net.record.nick.is_empty() {
                    continue;
                }
                if let Some(uc) = &net.conn {
                    uc.send(Message::new(
                        "NICK",
                        vec![net.record.get_nick(&self.record)],
                    ));
                }
            }
        }

        if realname_updated {
            let mut restart = Vec::new();
            for (idx, net) in self.networks.iter().enumerate() {
                if !net.record.realname.is_empty() {
                    continue;
                }
                match &net.conn {
                    Some(uc) if uc.caps.is_enabled("setname") => {
                        uc.send(Message::new(
                            "SETNAME",
                            vec![net.record.get_realname(&self.record)],
                        ));
                    }
                    Some(_) => restart.push(idx),
                    None => {}
                }
            }
            for idx in restart {
                self.restart_network(idx);
            }
        }

        Ok(())
    }

    /// Stop and restart one network, carrying over its runtime state.
    fn restart_network(&mut self, idx: usize) {
        let old = &mut self.networks[idx];
        old.stop();
        let net_id = old.record.id;
        self.handle_upstream_disconnected(net_id);

        let old = self.networks.remove(idx);
        let channels: Vec<db::Channel> =
            old.channels.iter().map(|(_, ch)| ch.clone()).collect();
        let mut net = Network::new(
            old.record.clone(),
            channels,
            self.shared.clone(),
            self.record.id,
        );
        net.delivered = old.delivered.clone();
        net.offline_clients = old.offline_clients.clone();
        net.spawn_run_loop(self.record.clone(), self.events_tx.clone());
        self.networks.insert(idx, net);
    }
}

