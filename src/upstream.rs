//! Upstream connection: one IRC client session towards a remote network.
//!
//! The connection is built and registered on the network's reconnection
//! task, which owns it exclusively until `RPL_WELCOME`. Ownership is then
//! transferred into the user event loop inside `Event::UpstreamConnected`,
//! and every later mutation happens there.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use slbnc_proto::mode::UserModes;
use slbnc_proto::{
    apply_channel_modes, format_server_time, numeric, sasl, Caps, Isupport, MembershipSet,
    Message, NameMap, Prefix,
};
use slbnc_proto::mode::{format_channel_modes, parse_membership_prefixes, ChannelModes};

use crate::db;
use crate::downstream::{self, DownstreamConn};
use crate::network::{self, Network};
use crate::user::{self, Event, PendingList, User};
use crate::SERVICE_NICK;

/// Capabilities always requested from upstreams that support them.
pub const PERMANENT_UPSTREAM_CAPS: &[&str] = &[
    "away-notify",
    "batch",
    "extended-join",
    "labeled-response",
    "message-tags",
    "multi-prefix",
    "server-time",
];

/// Failure during upstream registration.
#[derive(Debug, Error)]
#[error("registration error: {reason}")]
pub struct RegistrationError {
    pub reason: String,
    /// Temporary errors trigger backoff-reconnect; fatal ones halt the
    /// network's run loop.
    pub temporary: bool,
}

impl RegistrationError {
    fn temporary(reason: impl Into<String>) -> Self {
        RegistrationError {
            reason: reason.into(),
            temporary: true,
        }
    }

    fn fatal(reason: impl Into<String>) -> Self {
        RegistrationError {
            reason: reason.into(),
            temporary: false,
        }
    }
}

/// SASL client state for the configured mechanism.
enum SaslClient {
    Plain { username: String, password: String },
    External,
}

impl SaslClient {
    fn mechanism(&self) -> &'static str {
        match self {
            SaslClient::Plain { .. } => "PLAIN",
            SaslClient::External => "EXTERNAL",
        }
    }

    fn initial_response(&self) -> Vec<u8> {
        match self {
            SaslClient::Plain { username, password } => {
                format!("\0{}\0{}", username, password).into_bytes()
            }
            SaslClient::External => Vec::new(),
        }
    }
}

/// An open IRCv3 batch.
pub struct Batch {
    pub batch_type: String,
    pub params: Vec<String>,
    pub outer: Option<String>,
    /// Label inherited by messages inside the batch.
    pub label: String,
}

/// Channel state mirrored from the upstream; exists only while joined.
pub struct UpstreamChannel {
    pub name: String,
    pub topic: String,
    pub topic_who: Option<Prefix>,
    pub topic_time: Option<chrono::DateTime<Utc>>,
    pub status: char,
    pub modes: Option<ChannelModes>,
    pub creation_time: String,
    pub members: NameMap<MembershipSet>,
    /// Received RPL_ENDOFNAMES.
    pub complete: bool,
    detach_timer: Option<JoinHandle<()>>,
}

impl UpstreamChannel {
    pub fn new(name: &str, casemap: slbnc_proto::Casemap) -> Self {
        UpstreamChannel {
            name: name.to_owned(),
            topic: String::new(),
            topic_who: None,
            topic_time: None,
            status: '=',
            modes: None,
            creation_time: String::new(),
            members: NameMap::with_casemap(casemap),
            complete: false,
            detach_timer: None,
        }
    }

    /// Reset (or cancel, with a zero duration) the auto-detach timer.
    ///
    /// The timer may still fire after cancellation; the event handler
    /// re-checks channel state, so a stale firing is harmless.
    pub fn update_auto_detach(
        &mut self,
        dur: Duration,
        events: mpsc::Sender<Event>,
        net_id: i64,
    ) {
        if let Some(timer) = self.detach_timer.take() {
            timer.abort();
        }
        if dur.is_zero() {
            return;
        }
        let name = self.name.clone();
        self.detach_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            let _ = events.send(Event::ChannelDetach { net_id, name }).await;
        }));
    }
}

/// One registered (or registering) connection to an upstream server.
pub struct UpstreamConn {
    pub net_id: i64,
    pub events_tx: mpsc::Sender<Event>,
    pub outgoing: mpsc::UnboundedSender<Message>,
    pub remote_addr: String,
    pub local_addr: String,

    pub server_name: String,
    pub available_user_modes: String,
    pub isupport: Isupport,

    pub registered: bool,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub modes: UserModes,
    pub channels: NameMap<UpstreamChannel>,
    pub caps: Caps,
    pub batches: HashMap<String, Batch>,
    pub away: bool,
    pub next_label_id: u64,
    pub monitored: NameMap<bool>,

    /// Downstreams that currently have a LIST in flight on this upstream.
    pub pending_list_downstreams: HashSet<u64>,

    sasl_config: db::Sasl,
    sasl_client: Option<SaslClient>,
    sasl_started: bool,
    regain_nick_timer: Option<JoinHandle<()>>,
}

impl Drop for UpstreamConn {
    fn drop(&mut self) {
        self.stop_regain_nick_timer();
        for (_, ch) in self.channels.iter_mut() {
            if let Some(timer) = ch.detach_timer.take() {
                timer.abort();
            }
        }
    }
}

/// Outcome of one registration-phase message.
pub enum RegStep {
    Continue,
    Registered,
}

impl UpstreamConn {
    pub fn new(
        record: &db::Network,
        user: &db::User,
        events_tx: mpsc::Sender<Event>,
        outgoing: mpsc::UnboundedSender<Message>,
        remote_addr: String,
        local_addr: String,
    ) -> Self {
        UpstreamConn {
            net_id: record.id,
            events_tx,
            outgoing,
            remote_addr,
            local_addr,
            server_name: String::new(),
            available_user_modes: String::new(),
            isupport: Isupport::default(),
            registered: false,
            nick: record.get_nick(user),
            username: record.get_username(user),
            realname: record.get_realname(user),
            modes: UserModes::default(),
            channels: NameMap::new(),
            caps: Caps::new(),
            batches: HashMap::new(),
            away: false,
            next_label_id: 0,
            monitored: NameMap::new(),
            pending_list_downstreams: HashSet::new(),
            sasl_config: record.sasl.clone(),
            sasl_client: None,
            sasl_started: false,
            regain_nick_timer: None,
        }
    }

    /// Queue a message; tags are dropped unless `message-tags` is on.
    pub fn send(&self, mut msg: Message) {
        if !self.caps.is_enabled("message-tags") {
            msg.tags.clear();
        }
        let _ = self.outgoing.send(msg);
    }

    /// Queue a message labeled `sd-<downstream>-<seq>` so replies can be
    /// routed back to the issuing downstream.
    pub fn send_labeled(&mut self, downstream_id: u64, mut msg: Message) {
        if self.caps.is_enabled("labeled-response") {
            msg.set_tag(
                "label",
                Some(format!("sd-{}-{}", downstream_id, self.next_label_id)),
            );
            self.next_label_id += 1;
        }
        self.send(msg);
    }

    pub fn is_channel(&self, entity: &str) -> bool {
        self.isupport.is_channel(entity)
    }

    pub fn casemap(&self) -> slbnc_proto::Casemap {
        self.isupport.casemapping
    }

    fn is_our_nick(&self, name: &str) -> bool {
        self.casemap().eq(name, &self.nick)
    }

    /// Send the registration burst: CAP LS, optional PASS, NICK, USER.
    pub fn register(&mut self, record: &db::Network) {
        self.send(Message::new("CAP", vec!["LS".into(), "302".into()]));
        if !record.pass.is_empty() {
            self.send(Message::new("PASS", vec![record.pass.clone()]));
        }
        self.send(Message::new("NICK", vec![self.nick.clone()]));
        self.send(Message::new(
            "USER",
            vec![
                self.username.clone(),
                "0".into(),
                "*".into(),
                self.realname.clone(),
            ],
        ));
    }

    fn handle_supported_caps(&mut self, caps: &str) {
        self.caps.add_available(caps);
    }

    fn request_caps(&mut self) {
        let mut request: Vec<&str> = PERMANENT_UPSTREAM_CAPS
            .iter()
            .copied()
            .filter(|c| self.caps.is_available(c) && !self.caps.is_enabled(c))
            .collect();
        if self.wants_sasl() && !self.caps.is_enabled("sasl") {
            request.push("sasl");
        }
        if request.is_empty() {
            return;
        }
        self.send(Message::new(
            "CAP",
            vec!["REQ".into(), request.join(" ")],
        ));
    }

    /// True when SASL is configured and the server offers the mechanism.
    fn wants_sasl(&self) -> bool {
        if self.sasl_config.mechanism.is_empty() {
            return false;
        }
        let Some(value) = self.caps.value("sasl") else {
            return false;
        };
        value.is_empty()
            || value
                .split(',')
                .any(|mech| mech.eq_ignore_ascii_case(&self.sasl_config.mechanism))
    }

    fn handle_cap_ack(&mut self, name: &str, ok: bool) -> anyhow::Result<()> {
        self.caps.set_enabled(name, ok);
        match name {
            "sasl" => {
                if !ok {
                    warn!("server refused to acknowledge the sasl capability");
                    return Ok(());
                }
                let client = match self.sasl_config.mechanism.as_str() {
                    "PLAIN" => SaslClient::Plain {
                        username: self.sasl_config.plain_username.clone(),
                        password: self.sasl_config.plain_password.clone(),
                    },
                    "EXTERNAL" => SaslClient::External,
                    mech => bail!("unsupported SASL mechanism {:?}", mech),
                };
                self.send(Message::new(
                    "AUTHENTICATE",
                    vec![client.mechanism().to_owned()],
                ));
                self.sasl_client = Some(client);
                self.sasl_started = false;
            }
            _ => {
                if !PERMANENT_UPSTREAM_CAPS.contains(&name) {
                    debug!(cap = name, "received CAP ACK/NAK for a cap we did not request");
                }
            }
        }
        Ok(())
    }

    fn handle_authenticate(&mut self, msg: &Message) -> anyhow::Result<()> {
        let abort = Message::new("AUTHENTICATE", vec!["*".into()]);
        let Some(client) = self.sasl_client.as_ref() else {
            bail!("received unexpected AUTHENTICATE message");
        };
        let Some(challenge) = msg.params.first() else {
            self.send(abort);
            bail!("AUTHENTICATE with no parameter");
        };
        if sasl::decode_authenticate_param(challenge).is_err() {
            self.send(abort);
            bail!("invalid AUTHENTICATE challenge");
        }

        if self.sasl_started {
            // PLAIN and EXTERNAL are single round trip mechanisms.
            self.send(abort);
            bail!("unexpected extra SASL challenge");
        }
        let resp = client.initial_response();
        self.sasl_started = true;
        for param in sasl::encode_authenticate_params(&resp) {
            self.send(Message::new("AUTHENTICATE", vec![param]));
        }
        Ok(())
    }

    fn finish_sasl(&mut self) {
        self.sasl_client = None;
        self.sasl_started = false;
        if !self.registered {
            self.send(Message::new("CAP", vec!["END".into()]));
        }
    }

    /// Handle one message during the registration phase, before the
    /// connection is handed to the user task.
    pub fn handle_registration_message(
        &mut self,
        msg: &Message,
    ) -> Result<RegStep, RegistrationError> {
        match msg.command.as_str() {
            "PING" => {
                self.send(Message::new("PONG", msg.params.clone()));
            }
            "CAP" => {
                if let Err(e) = self.handle_registration_cap(msg) {
                    warn!(error = %e, "failed to handle CAP message");
                }
            }
            "AUTHENTICATE" => {
                if let Err(e) = self.handle_authenticate(msg) {
                    warn!(error = %e, "SASL exchange failed");
                    self.finish_sasl();
                }
            }
            numeric::RPL_LOGGEDIN => {
                info!(account = msg.params.get(2).map(String::as_str).unwrap_or(""), "logged in");
            }
            numeric::RPL_LOGGEDOUT => {
                info!("logged out");
            }
            numeric::RPL_SASLSUCCESS => {
                self.finish_sasl();
            }
            numeric::ERR_NICKLOCKED
            | numeric::ERR_SASLFAIL
            | numeric::ERR_SASLTOOLONG
            | numeric::ERR_SASLABORTED => {
                warn!(
                    reason = msg.params.last().map(String::as_str).unwrap_or(""),
                    "SASL authentication failed"
                );
                self.finish_sasl();
            }
            numeric::RPL_WELCOME => {
                self.registered = true;
                if let Some(nick) = msg.params.first() {
                    self.nick = nick.clone();
                }
                info!("connection registered");
                return Ok(RegStep::Registered);
            }
            "ERROR" => {
                let text = msg.params.first().map(String::as_str).unwrap_or("");
                return Err(RegistrationError::temporary(format!(
                    "fatal server error: {}",
                    text
                )));
            }
            numeric::ERR_NICKNAMEINUSE
            | numeric::ERR_NICKCOLLISION
            | numeric::ERR_UNAVAILRESOURCE => {
                let text = msg.params.last().cloned().unwrap_or_default();
                return Err(RegistrationError::temporary(text));
            }
            numeric::ERR_ERRONEUSNICKNAME
            | numeric::ERR_PASSWDMISMATCH
            | numeric::ERR_NOPERMFORHOST
            | numeric::ERR_YOUREBANNEDCREEP => {
                let text = msg.params.last().cloned().unwrap_or_default();
                return Err(RegistrationError::fatal(text));
            }
            _ => {}
        }
        Ok(RegStep::Continue)
    }

    fn handle_registration_cap(&mut self, msg: &Message) -> anyhow::Result<()> {
        let sub_cmd = msg
            .params
            .get(1)
            .ok_or_else(|| anyhow!("CAP without subcommand"))?
            .to_ascii_uppercase();
        let sub_params = &msg.params[2.min(msg.params.len())..];
        match sub_cmd.as_str() {
            "LS" => {
                let caps = sub_params.last().map(String::as_str).unwrap_or("");
                let more = sub_params.len() >= 2 && sub_params[sub_params.len() - 2] == "*";
                self.handle_supported_caps(caps);
                if more {
                    return Ok(());
                }
                self.request_caps();
                if self.wants_sasl() {
                    // CAP END is sent once authentication completes.
                    return Ok(());
                }
                if !self.registered {
                    self.send(Message::new("CAP", vec!["END".into()]));
                }
            }
            "ACK" | "NAK" => {
                let caps = sub_params.first().map(String::as_str).unwrap_or("");
                for name in caps.split_whitespace() {
                    self.handle_cap_ack(&name.to_ascii_lowercase(), sub_cmd == "ACK")?;
                }
            }
            "NEW" => {
                let caps = sub_params.first().map(String::as_str).unwrap_or("");
                self.handle_supported_caps(caps);
                self.request_caps();
            }
            "DEL" => {
                let caps = sub_params.first().map(String::as_str).unwrap_or("");
                for name in caps.split_whitespace() {
                    self.caps.remove_available(name);
                }
            }
            _ => {
                debug!(subcommand = %sub_cmd, "unhandled CAP subcommand");
            }
        }
        Ok(())
    }

    /// Schedule an attempt to reclaim the preferred nick.
    pub fn schedule_regain_nick(&mut self, wanted: String) {
        if self.regain_nick_timer.is_some() || self.is_our_nick(&wanted) {
            return;
        }
        let events = self.events_tx.clone();
        let net_id = self.net_id;
        self.regain_nick_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = events
                .send(Event::TryRegainNick {
                    net_id,
                    nick: wanted,
                })
                .await;
        }));
    }

    pub fn stop_regain_nick_timer(&mut self) {
        if let Some(timer) = self.regain_nick_timer.take() {
            timer.abort();
        }
    }

    pub fn try_regain_nick(&mut self, nick: &str) {
        self.regain_nick_timer = None;
        if self.is_our_nick(nick) {
            return;
        }
        self.send(Message::new("NICK", vec![nick.to_owned()]));
    }

    /// Reset the auto-detach timer for a channel that has activity.
    pub fn update_channel_auto_detach(
        &mut self,
        persistent: &NameMap<db::Channel>,
        name: &str,
    ) {
        let events = self.events_tx.clone();
        let net_id = self.net_id;
        let Some(uch) = self.channels.get_mut(name) else {
            return;
        };
        match persistent.get(name) {
            Some(ch) if !ch.detached => {
                uch.update_auto_detach(ch.detach_after, events, net_id);
            }
            _ => uch.update_auto_detach(Duration::ZERO, events, net_id),
        }
    }

    /// Send AWAY when the last downstream leaves, clear it on return.
    pub fn update_away(&mut self, has_downstreams: bool) {
        let away = !has_downstreams;
        if away == self.away {
            return;
        }
        if away {
            self.send(Message::new("AWAY", vec!["Auto away".into()]));
        } else {
            self.send(Message::new("AWAY", vec![]));
        }
        self.away = away;
    }

    /// Reconcile the upstream MONITOR set with the union of the
    /// downstreams' monitored nicks.
    pub fn update_monitor<'a>(&mut self, wanted: impl Iterator<Item = &'a str>) {
        let casemap = self.casemap();
        let mut desired: NameMap<bool> = NameMap::with_casemap(casemap);
        for nick in wanted {
            desired.insert(nick, true);
        }

        let mut add = Vec::new();
        let mut remove = Vec::new();
        for (nick, _) in desired.iter() {
            if !self.monitored.has(nick) {
                add.push(nick.to_owned());
            }
        }
        for (nick, _) in self.monitored.iter() {
            if !desired.has(nick) {
                remove.push(nick.to_owned());
            }
        }

        if !add.is_empty() {
            self.send(Message::new("MONITOR", vec!["+".into(), add.join(",")]));
        }
        if !remove.is_empty() {
            self.send(Message::new("MONITOR", vec!["-".into(), remove.join(",")]));
        }
        for nick in add {
            self.monitored.insert(&nick, false);
        }
        for nick in remove {
            self.monitored.remove(&nick);
        }
    }
}

/// Decode a `sd-<downstream>-<seq>` label into the downstream id.
fn parse_label(label: &str) -> anyhow::Result<u64> {
    let rest = label
        .strip_prefix("sd-")
        .ok_or_else(|| anyhow!("invalid downstream reference in label {:?}", label))?;
    let (id, seq) = rest
        .split_once('-')
        .ok_or_else(|| anyhow!("invalid downstream reference in label {:?}", label))?;
    seq.parse::<u64>()
        .map_err(|_| anyhow!("invalid label sequence in {:?}", label))?;
    id.parse::<u64>()
        .map_err(|_| anyhow!("invalid downstream id in label {:?}", label))
}

/// Append a message to the store under the network's casemapped target
/// and seed delivery floors for clients that have never seen the target.
pub fn append_log(
    net: &mut Network,
    downstreams: &[DownstreamConn],
    store: &dyn crate::msgstore::MessageStore,
    target: &str,
    msg: &Message,
) -> Option<String> {
    let target_cm = net.casemap.canonical(target);

    if !net.delivered.has_target(&target_cm) {
        let floor = store
            .last_msg_id(&net.record, &target_cm)
            .unwrap_or(None)
            .unwrap_or_default();
        let detached = net.channels.get(target).is_some_and(|ch| ch.detached);
        for client in &net.offline_clients {
            net.delivered.store_id(&target_cm, client, &floor);
        }
        if detached {
            for dc in user::downstreams_for(downstreams, net.record.id) {
                net.delivered.store_id(&target_cm, &dc.client_name, &floor);
            }
        }
    }

    match store.append(&net.record, &target_cm, msg) {
        Ok(id) => id,
        Err(e) => {
            warn!(target = %target, error = %e, "failed to log message");
            None
        }
    }
}

/// Append to the log and forward to downstream connections.
///
/// Detached channels record but never forward. When `origin` is set and
/// that downstream lacks `echo-message`, it skips the echo and has its
/// delivery pointer advanced instead.
pub fn produce(
    net: &mut Network,
    downstreams: &mut [DownstreamConn],
    store: &dyn crate::msgstore::MessageStore,
    target: &str,
    msg: &Message,
    origin: Option<u64>,
) {
    let msg_id = if !target.is_empty() {
        append_log(net, downstreams, store, target, msg)
    } else {
        None
    };

    if net.channels.get(target).is_some_and(|ch| ch.detached) {
        return;
    }

    net.maybe_push(msg);

    let net_id = net.record.id;
    let target_cm = net.casemap.canonical(target);
    for dc in downstreams
        .iter_mut()
        .filter(|dc| dc.network_id.map_or(true, |id| id == net_id))
    {
        if origin != Some(dc.id) || dc.caps.is_enabled("echo-message") {
            let marshaled = dc.marshal_message(net, msg);
            dc.send_with_id(net_id, &target_cm, marshaled, msg_id.as_deref());
        } else if let Some(id) = &msg_id {
            net.delivered.store_id(&target_cm, &dc.client_name, id);
        }
    }
}

fn try_send_list(net: &mut Network, pending_lists: &[PendingList], downstream_id: u64) {
    let Some(uc) = net.conn.as_mut() else {
        return;
    };
    if uc.pending_list_downstreams.contains(&downstream_id) {
        // A LIST is already in flight; the next one goes out when it ends.
        return;
    }
    for pl in pending_lists {
        if pl.downstream_id != downstream_id {
            continue;
        }
        let Some(list_msg) = pl.pending.get(&net.record.id) else {
            continue;
        };
        uc.send_labeled(downstream_id, list_msg.clone());
        uc.pending_list_downstreams.insert(downstream_id);
        return;
    }
}

/// Finish the pending LIST(s) this upstream is involved in. When a
/// downstream's whole fan-out is complete, it receives the synthesized
/// RPL_LISTEND; otherwise the next queued LIST is released.
pub fn end_pending_lists(
    networks: &mut [Network],
    downstreams: &[DownstreamConn],
    pending_lists: &mut Vec<PendingList>,
    hostname: &str,
    net_idx: usize,
    all: bool,
) -> bool {
    let net_id = networks[net_idx].record.id;
    let mut found = false;
    let mut i = 0;
    while i < pending_lists.len() {
        if !pending_lists[i].pending.contains_key(&net_id) {
            i += 1;
            continue;
        }
        found = true;
        pending_lists[i].pending.remove(&net_id);
        let downstream_id = pending_lists[i].downstream_id;

        if pending_lists[i].pending.is_empty() {
            pending_lists.remove(i);
            for dc in downstreams.iter().filter(|dc| dc.id == downstream_id) {
                dc.send(
                    Message::new(
                        numeric::RPL_LISTEND,
                        vec![dc.nick.clone(), "End of /LIST".into()],
                    )
                    .with_prefix(Prefix::ServerName(hostname.to_owned())),
                );
            }
        } else {
            i += 1;
        }

        if !all {
            if let Some(uc) = networks[net_idx].conn.as_mut() {
                uc.pending_list_downstreams.remove(&downstream_id);
            }
            for net in networks.iter_mut() {
                try_send_list(net, pending_lists, downstream_id);
            }
            return true;
        }
    }
    if all {
        if let Some(uc) = networks[net_idx].conn.as_mut() {
            uc.pending_list_downstreams.clear();
        }
    }
    found
}

/// Register a downstream's LIST fan-out and start it on every upstream.
pub fn queue_list(
    networks: &mut [Network],
    pending_lists: &mut Vec<PendingList>,
    downstream_id: u64,
    commands: HashMap<i64, Message>,
) {
    pending_lists.push(PendingList {
        downstream_id,
        pending: commands,
    });
    for net in networks.iter_mut() {
        try_send_list(net, pending_lists, downstream_id);
    }
}

/// Dispatch one post-registration upstream message.
pub async fn handle_message(user: &mut User, net_id: i64, mut msg: Message) -> anyhow::Result<()> {
    let Some(net_idx) = user
        .networks
        .iter()
        .position(|n| n.record.id == net_id)
    else {
        bail!("message for unknown network {}", net_id);
    };

    if user.networks[net_idx].conn.is_none() {
        bail!("message for disconnected network {}", net_id);
    }

    // Resolve the label (directly or through the enclosing batch) into the
    // issuing downstream.
    let label = {
        let uc = user.networks[net_idx].conn.as_ref().unwrap();
        match msg.label() {
            Some(l) => Some(l.to_owned()),
            None => match msg.batch_ref() {
                Some(tag) => {
                    let b = uc
                        .batches
                        .get(tag)
                        .ok_or_else(|| anyhow!("reference to undefined batch {:?}", tag))?;
                    if b.label.is_empty() {
                        None
                    } else {
                        Some(b.label.clone())
                    }
                }
                None => None,
            },
        }
    };
    let downstream_id = match &label {
        Some(l) => Some(parse_label(l)?),
        None => None,
    };

    if msg.server_time().is_none() {
        msg.set_tag("time", Some(format_server_time(Utc::now())));
    }

    let hostname = user.shared.hostname.clone();
    let msg_store = user.msg_store.clone();

    let User {
        networks,
        downstreams,
        pending_lists,
        shared,
        record: user_record,
        ..
    } = user;
    let net = &mut networks[net_idx];

    match msg.command.as_str() {
        "PING" => {
            let uc = net.conn.as_ref().unwrap();
            uc.send(Message::new("PONG", msg.params.clone()));
        }
        "PRIVMSG" | "NOTICE" | "TAGMSG" => {
            let Some(prefix) = msg.prefix.clone() else {
                bail!("expected a prefix");
            };
            let entity = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("missing target"))?;
            let text = if msg.command == "TAGMSG" {
                String::new()
            } else {
                msg.params
                    .get(1)
                    .cloned()
                    .ok_or_else(|| anyhow!("missing text"))?
            };

            if prefix.name() == SERVICE_NICK || entity == SERVICE_NICK {
                debug!("skipping message involving the bouncer service nick");
                return Ok(());
            }

            if prefix.is_server() {
                // Server-wide notice, not tied to a conversation target.
                produce(net, downstreams, msg_store.as_ref(), "", &msg, None);
                return Ok(());
            }

            let uc = net.conn.as_ref().unwrap();
            let target = if uc.is_our_nick(&entity) {
                prefix.name().to_owned()
            } else {
                entity
            };

            let mut attach = false;
            if let Some(ch) = net.channels.get(&target).cloned() {
                let uc = net.conn.as_ref().unwrap();
                let highlight =
                    !uc.is_our_nick(prefix.name()) && network::is_highlight(&text, &uc.nick);
                if ch.detached {
                    if network::detached_message_needs_relay(&ch, highlight) {
                        let kind = if highlight { "highlight" } else { "message" };
                        for dc in user::downstreams_for(downstreams, net_id) {
                            let marshaled = dc.marshal_entity(net, &ch.name);
                            dc.send_service_notice(
                                &hostname,
                                &format!(
                                    "{} in {}: <{}> {}",
                                    kind,
                                    marshaled,
                                    prefix.name(),
                                    text
                                ),
                            );
                        }
                    }
                    if ch.reattach_on == db::Filter::Message
                        || (ch.reattach_on == db::Filter::Highlight && highlight)
                    {
                        attach = true;
                    }
                } else {
                    let reset = match ch.detach_on {
                        db::Filter::Message | db::Filter::Default => true,
                        db::Filter::Highlight => highlight,
                        db::Filter::None => false,
                    };
                    if reset {
                        let persistent = net.channels.clone();
                        if let Some(uc) = net.conn.as_mut() {
                            uc.update_channel_auto_detach(&persistent, &target);
                        }
                    }
                }
            }

            produce(net, downstreams, msg_store.as_ref(), &target, &msg, None);

            if attach {
                let name = target.clone();
                network::attach(
                    net,
                    downstreams,
                    msg_store.as_ref(),
                    &hostname,
                    shared.config.history.limit,
                    &name,
                );
                if let Some(ch) = net.channels.get(&name).cloned() {
                    let mut ch = ch;
                    if let Err(e) = shared.db.store_channel(net_id, &mut ch).await {
                        warn!(channel = %name, error = %e, "failed to update reattached channel");
                    } else {
                        net.channels.insert(&name, ch);
                    }
                }
            }
        }
        "CAP" => {
            let uc = net.conn.as_mut().unwrap();
            if let Err(e) = uc.handle_registration_cap(&msg) {
                warn!(error = %e, "failed to handle CAP message");
            }
            for dc in downstreams.iter_mut() {
                downstream::update_supported_caps(dc, networks);
            }
        }
        "AUTHENTICATE" => {
            let uc = net.conn.as_mut().unwrap();
            if let Err(e) = uc.handle_authenticate(&msg) {
                warn!(error = %e, "SASL exchange failed");
                uc.finish_sasl();
            }
        }
        numeric::RPL_LOGGEDIN | numeric::RPL_LOGGEDOUT => {
            info!(command = %msg.command, "account status changed");
        }
        numeric::RPL_SASLSUCCESS
        | numeric::ERR_NICKLOCKED
        | numeric::ERR_SASLFAIL
        | numeric::ERR_SASLTOOLONG
        | numeric::ERR_SASLABORTED => {
            let uc = net.conn.as_mut().unwrap();
            uc.finish_sasl();
        }
        numeric::RPL_MYINFO => {
            let uc = net.conn.as_mut().unwrap();
            if msg.params.len() < 5 {
                bail!("malformed RPL_MYINFO");
            }
            uc.server_name = msg.params[1].clone();
            uc.available_user_modes = msg.params[3].clone();
        }
        numeric::RPL_ISUPPORT => {
            if msg.params.len() < 2 {
                bail!("malformed RPL_ISUPPORT");
            }
            let tokens: Vec<String> =
                msg.params[1..msg.params.len() - 1].to_vec();
            let mut new_casemap = None;
            {
                let uc = net.conn.as_mut().unwrap();
                for token in &tokens {
                    match uc.isupport.apply_token(token) {
                        Ok(Some(cm)) => new_casemap = Some(cm),
                        Ok(None) => {}
                        Err(e) => warn!(token = %token, error = %e, "bad ISUPPORT token"),
                    }
                }
            }
            if let Some(cm) = new_casemap {
                network::update_casemapping(net, downstreams, cm);
            }
        }
        "BATCH" => {
            let uc = net.conn.as_mut().unwrap();
            let reference = msg
                .params
                .first()
                .ok_or_else(|| anyhow!("BATCH without reference"))?;
            if let Some(tag) = reference.strip_prefix('+') {
                if uc.batches.contains_key(tag) {
                    bail!("batch {:?} already defined", tag);
                }
                let batch_type = msg
                    .params
                    .get(1)
                    .cloned()
                    .ok_or_else(|| anyhow!("BATCH without type"))?;
                let outer = msg.batch_ref().map(str::to_owned);
                let label = label.clone().unwrap_or_default();
                uc.batches.insert(
                    tag.to_owned(),
                    Batch {
                        batch_type,
                        params: msg.params.get(2..).unwrap_or_default().to_vec(),
                        outer,
                        label,
                    },
                );
            } else if let Some(tag) = reference.strip_prefix('-') {
                if uc.batches.remove(tag).is_none() {
                    bail!("unknown batch reference {:?}", tag);
                }
            } else {
                bail!("missing +/- prefix in batch reference {:?}", reference);
            }
        }
        "NICK" => {
            let Some(prefix) = msg.prefix.clone() else {
                bail!("expected a prefix");
            };
            let new_nick = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("missing nick"))?;

            let uc = net.conn.as_mut().unwrap();
            let me = uc.is_our_nick(prefix.name());
            if me {
                info!(old = %uc.nick, new = %new_nick, "changed nick");
                uc.nick = new_nick.clone();
                let wanted = net.record.get_nick(user_record);
                if !uc.is_our_nick(&wanted) {
                    uc.schedule_regain_nick(wanted);
                }
            }

            let mut touched = Vec::new();
            for (_, ch) in uc.channels.iter_mut() {
                if let Some(memberships) = ch.members.remove(prefix.name()) {
                    ch.members.insert(&new_nick, memberships);
                    touched.push(ch.name.clone());
                }
            }
            for ch_name in touched {
                append_log(net, downstreams, msg_store.as_ref(), &ch_name, &msg);
            }

            let net = &networks[net_idx];
            if me {
                for dc in user::downstreams_for_mut(downstreams, net_id) {
                    downstream::update_nick(dc, net);
                }
            } else {
                for dc in user::downstreams_for(downstreams, net_id) {
                    dc.send(dc.marshal_message(net, &msg));
                }
            }
        }
        "JOIN" => {
            let Some(prefix) = msg.prefix.clone() else {
                bail!("expected a prefix");
            };
            let channels = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;

            for ch_name in channels.split(',') {
                let uc = net.conn.as_mut().unwrap();
                if uc.is_our_nick(prefix.name()) {
                    info!(channel = %ch_name, "joined channel");
                    let casemap = uc.casemap();
                    uc.channels
                        .insert(ch_name, UpstreamChannel::new(ch_name, casemap));
                    let persistent = net.channels.clone();
                    let uc = net.conn.as_mut().unwrap();
                    uc.update_channel_auto_detach(&persistent, ch_name);
                    uc.send(Message::new("MODE", vec![ch_name.to_owned()]));
                } else {
                    let Some(ch) = uc.channels.get_mut(ch_name) else {
                        bail!("JOIN for unknown channel {:?}", ch_name);
                    };
                    ch.members.insert(prefix.name(), MembershipSet::new());
                }

                let mut ch_msg = msg.clone();
                ch_msg.params[0] = ch_name.to_owned();
                produce(net, downstreams, msg_store.as_ref(), ch_name, &ch_msg, None);
            }
        }
        "PART" => {
            let Some(prefix) = msg.prefix.clone() else {
                bail!("expected a prefix");
            };
            let channels = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;

            for ch_name in channels.split(',') {
                let uc = net.conn.as_mut().unwrap();
                if uc.is_our_nick(prefix.name()) {
                    info!(channel = %ch_name, "parted channel");
                    if let Some(mut uch) = uc.channels.remove(ch_name) {
                        uch.update_auto_detach(
                            Duration::ZERO,
                            uc.events_tx.clone(),
                            uc.net_id,
                        );
                    }
                } else {
                    let Some(ch) = uc.channels.get_mut(ch_name) else {
                        bail!("PART for unknown channel {:?}", ch_name);
                    };
                    ch.members.remove(prefix.name());
                }

                let mut ch_msg = msg.clone();
                ch_msg.params[0] = ch_name.to_owned();
                produce(net, downstreams, msg_store.as_ref(), ch_name, &ch_msg, None);
            }
        }
        "KICK" => {
            if msg.prefix.is_none() {
                bail!("expected a prefix");
            }
            let channel = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let kicked = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing kicked user"))?;

            let uc = net.conn.as_mut().unwrap();
            if uc.is_our_nick(&kicked) {
                info!(channel = %channel, "kicked from channel");
                if let Some(mut uch) = uc.channels.remove(&channel) {
                    uch.update_auto_detach(Duration::ZERO, uc.events_tx.clone(), uc.net_id);
                }
            } else if let Some(ch) = uc.channels.get_mut(&channel) {
                ch.members.remove(&kicked);
            }

            produce(net, downstreams, msg_store.as_ref(), &channel, &msg, None);
        }
        "QUIT" => {
            let Some(prefix) = msg.prefix.clone() else {
                bail!("expected a prefix");
            };
            let uc = net.conn.as_mut().unwrap();
            let me = uc.is_our_nick(prefix.name());
            if me {
                info!("quit");
            }

            let mut touched = Vec::new();
            for (_, ch) in uc.channels.iter_mut() {
                if ch.members.remove(prefix.name()).is_some() {
                    touched.push(ch.name.clone());
                }
            }
            for ch_name in touched {
                append_log(net, downstreams, msg_store.as_ref(), &ch_name, &msg);
            }

            if !me {
                let net = &networks[net_idx];
                for dc in user::downstreams_for(downstreams, net_id) {
                    dc.send(dc.marshal_message(net, &msg));
                }
            }
        }
        "TOPIC" => {
            let Some(prefix) = msg.prefix.clone() else {
                bail!("expected a prefix");
            };
            let name = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let uc = net.conn.as_mut().unwrap();
            let Some(ch) = uc.channels.get_mut(&name) else {
                bail!("TOPIC for unknown channel {:?}", name);
            };
            match msg.params.get(1) {
                Some(topic) => {
                    ch.topic = topic.clone();
                    ch.topic_who = Some(prefix);
                    ch.topic_time = Some(Utc::now());
                }
                None => ch.topic.clear(),
            }
            produce(net, downstreams, msg_store.as_ref(), &name, &msg, None);
        }
        numeric::RPL_TOPIC | numeric::RPL_NOTOPIC => {
            let name = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let uc = net.conn.as_mut().unwrap();
            let Some(ch) = uc.channels.get_mut(&name) else {
                bail!("topic reply for unknown channel {:?}", name);
            };
            if msg.command == numeric::RPL_TOPIC {
                ch.topic = msg.params.get(2).cloned().unwrap_or_default();
            } else {
                ch.topic.clear();
            }
        }
        numeric::RPL_TOPICWHOTIME => {
            let name = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let who = msg
                .params
                .get(2)
                .cloned()
                .ok_or_else(|| anyhow!("missing who"))?;
            let time_str = msg
                .params
                .get(3)
                .cloned()
                .ok_or_else(|| anyhow!("missing time"))?;
            let seconds: i64 = time_str
                .parse()
                .context("failed to parse topic time")?;

            let uc = net.conn.as_mut().unwrap();
            let Some(ch) = uc.channels.get_mut(&name) else {
                bail!("topic metadata for unknown channel {:?}", name);
            };
            let first = ch.topic_who.is_none();
            ch.topic_who = Some(Prefix::new_from_str(&who));
            ch.topic_time = chrono::DateTime::from_timestamp(seconds, 0);
            if first {
                let net = &networks[net_idx];
                for dc in user::downstreams_for(downstreams, net_id) {
                    let topic_who = dc.marshal_user_prefix(
                        net,
                        net.conn.as_ref().unwrap().channels.get(&name).unwrap()
                            .topic_who
                            .as_ref()
                            .unwrap(),
                    );
                    dc.send(
                        Message::new(
                            numeric::RPL_TOPICWHOTIME,
                            vec![
                                dc.nick.clone(),
                                dc.marshal_entity(net, &name),
                                topic_who.to_string(),
                                time_str.clone(),
                            ],
                        )
                        .with_prefix(Prefix::ServerName(hostname.clone())),
                    );
                }
            }
        }
        "MODE" => {
            let name = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("missing target"))?;
            let mode_str = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing modestring"))?;

            let uc = net.conn.as_mut().unwrap();
            if !uc.is_channel(&name) {
                if !uc.is_our_nick(&name) {
                    bail!("MODE for unknown nick {:?}", name);
                }
                uc.modes.apply(&mode_str)?;
            } else {
                let available_memberships = uc.isupport.memberships.clone();
                let available_modes = uc.isupport.chanmodes.clone();
                let Some(ch) = uc.channels.get_mut(&name) else {
                    bail!("MODE for unknown channel {:?}", name);
                };
                let args = msg.params.get(2..).unwrap_or_default().to_vec();
                let mut scratch = ChannelModes::new();
                let modes = ch.modes.as_mut().unwrap_or(&mut scratch);
                let need_marshaling = apply_channel_modes(
                    Some(modes),
                    &mut ch.members,
                    &available_memberships,
                    &available_modes,
                    &mode_str,
                    &args,
                )?;

                append_log(net, downstreams, msg_store.as_ref(), &name, &msg);

                let detached = net.channels.get(&name).is_some_and(|ch| ch.detached);
                if !detached {
                    let net = &networks[net_idx];
                    for dc in user::downstreams_for(downstreams, net_id) {
                        let mut params =
                            vec![dc.marshal_entity(net, &name), mode_str.clone()];
                        for (i, arg) in args.iter().enumerate() {
                            if need_marshaling.contains(&i) {
                                params.push(dc.marshal_entity(net, arg));
                            } else {
                                params.push(arg.clone());
                            }
                        }
                        let prefix = dc.marshal_user_prefix(
                            net,
                            msg.prefix.as_ref().unwrap_or(&Prefix::ServerName(
                                hostname.clone(),
                            )),
                        );
                        dc.send(Message::new("MODE", params).with_prefix(prefix));
                    }
                }
            }
        }
        numeric::RPL_UMODEIS => {
            let mode_str = msg.params.get(1).cloned().unwrap_or_default();
            let uc = net.conn.as_mut().unwrap();
            uc.modes.clear();
            if !mode_str.is_empty() {
                uc.modes.apply(&mode_str)?;
            }
        }
        numeric::RPL_CHANNELMODEIS => {
            let channel = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let mode_str = msg.params.get(2).cloned().unwrap_or_default();
            let args = msg.params.get(3..).unwrap_or_default().to_vec();

            let uc = net.conn.as_mut().unwrap();
            let available_memberships = uc.isupport.memberships.clone();
            let available_modes = uc.isupport.chanmodes.clone();
            let Some(ch) = uc.channels.get_mut(&channel) else {
                bail!("324 reply for unknown channel {:?}", channel);
            };
            let first_mode = ch.modes.is_none();
            let mut modes = ChannelModes::new();
            apply_channel_modes(
                Some(&mut modes),
                &mut ch.members,
                &available_memberships,
                &available_modes,
                &mode_str,
                &args,
            )?;
            ch.modes = Some(modes);

            let detached = net.channels.get(&channel).is_some_and(|ch| ch.detached);
            if first_mode && !detached {
                let net = &networks[net_idx];
                let uc = net.conn.as_ref().unwrap();
                let (mode_str, mode_params) =
                    format_channel_modes(uc.channels.get(&channel).unwrap().modes.as_ref().unwrap());
                for dc in user::downstreams_for(downstreams, net_id) {
                    let mut params = vec![
                        dc.nick.clone(),
                        dc.marshal_entity(net, &channel),
                        mode_str.clone(),
                    ];
                    params.extend(mode_params.iter().cloned());
                    dc.send(
                        Message::new(numeric::RPL_CHANNELMODEIS, params)
                            .with_prefix(Prefix::ServerName(hostname.clone())),
                    );
                }
            }
        }
        numeric::RPL_CREATIONTIME => {
            let channel = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let creation_time = msg
                .params
                .get(2)
                .cloned()
                .ok_or_else(|| anyhow!("missing creation time"))?;
            let uc = net.conn.as_mut().unwrap();
            let Some(ch) = uc.channels.get_mut(&channel) else {
                bail!("329 reply for unknown channel {:?}", channel);
            };
            let first = ch.creation_time.is_empty();
            ch.creation_time = creation_time.clone();
            if first {
                let net = &networks[net_idx];
                for dc in user::downstreams_for(downstreams, net_id) {
                    dc.send(
                        Message::new(
                            numeric::RPL_CREATIONTIME,
                            vec![
                                dc.nick.clone(),
                                dc.marshal_entity(net, &channel),
                                creation_time.clone(),
                            ],
                        )
                        .with_prefix(Prefix::ServerName(hostname.clone())),
                    );
                }
            }
        }
        numeric::RPL_LIST => {
            let channel = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let clients = msg.params.get(2).cloned().unwrap_or_default();
            let topic = msg.params.get(3).cloned().unwrap_or_default();

            let Some(pl) = pending_lists
                .iter()
                .find(|pl| pl.pending.contains_key(&net_id))
            else {
                bail!("unexpected RPL_LIST: no matching pending LIST");
            };
            let target = pl.downstream_id;
            let net = &networks[net_idx];
            for dc in downstreams.iter().filter(|dc| dc.id == target) {
                dc.send(
                    Message::new(
                        numeric::RPL_LIST,
                        vec![
                            dc.nick.clone(),
                            dc.marshal_entity(net, &channel),
                            clients.clone(),
                            topic.clone(),
                        ],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_LISTEND => {
            if !end_pending_lists(networks, downstreams, pending_lists, &hostname, net_idx, false)
            {
                bail!("unexpected RPL_LISTEND: no matching pending LIST");
            }
        }
        numeric::RPL_NAMREPLY => {
            let status = msg.params.get(1).cloned().unwrap_or_default();
            let name = msg
                .params
                .get(2)
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let members_str = msg.params.get(3).cloned().unwrap_or_default();

            let uc = net.conn.as_mut().unwrap();
            if uc.channels.get(&name).is_none() {
                // NAMES on a channel we have not joined, forward to the
                // issuing downstream.
                let net = &networks[net_idx];
                let uc = net.conn.as_ref().unwrap();
                for dc in
                    user::downstreams_for_id(downstreams, net_id, downstream_id)
                {
                    let channel = dc.marshal_entity(net, &name);
                    let members: Vec<String> = members_str
                        .split_whitespace()
                        .map(|member| {
                            let (ms, nick) =
                                parse_membership_prefixes(&uc.isupport.memberships, member);
                            format!(
                                "{}{}",
                                dc.format_member_prefix(&ms),
                                dc.marshal_entity(net, nick)
                            )
                        })
                        .collect();
                    dc.send(
                        Message::new(
                            numeric::RPL_NAMREPLY,
                            vec![
                                dc.nick.clone(),
                                status.clone(),
                                channel,
                                members.join(" "),
                            ],
                        )
                        .with_prefix(Prefix::ServerName(hostname.clone())),
                    );
                }
                return Ok(());
            }

            let memberships = uc.isupport.memberships.clone();
            let ch = uc.channels.get_mut(&name).unwrap();
            ch.status = status.chars().next().unwrap_or('=');
            for member in members_str.split_whitespace() {
                let (ms, nick) = parse_membership_prefixes(&memberships, member);
                ch.members.insert(nick, ms);
            }
        }
        numeric::RPL_ENDOFNAMES => {
            let name = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;

            let uc = net.conn.as_mut().unwrap();
            if uc.channels.get(&name).is_none() {
                let net = &networks[net_idx];
                for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                    dc.send(
                        Message::new(
                            numeric::RPL_ENDOFNAMES,
                            vec![
                                dc.nick.clone(),
                                dc.marshal_entity(net, &name),
                                "End of /NAMES list".into(),
                            ],
                        )
                        .with_prefix(Prefix::ServerName(hostname.clone())),
                    );
                }
                return Ok(());
            }

            let ch = uc.channels.get_mut(&name).unwrap();
            if ch.complete {
                bail!("received unexpected RPL_ENDOFNAMES");
            }
            ch.complete = true;

            let detached = net.channels.get(&name).is_some_and(|ch| ch.detached);
            if !detached {
                let net = &networks[net_idx];
                let uc = net.conn.as_ref().unwrap();
                let ch = uc.channels.get(&name).unwrap();
                for dc in user::downstreams_for(downstreams, net_id) {
                    downstream::forward_channel(dc, net, ch, &hostname);
                }
            }
        }
        numeric::RPL_WHOREPLY => {
            if msg.params.len() < 8 {
                bail!("malformed RPL_WHOREPLY");
            }
            let channel = msg.params[1].clone();
            let username = msg.params[2].clone();
            let host = msg.params[3].clone();
            let server = msg.params[4].clone();
            let nick = msg.params[5].clone();
            let flags = msg.params[6].clone();
            let trailing = msg.params[7].clone();

            let (hops_str, realname) = trailing
                .split_once(' ')
                .ok_or_else(|| anyhow!("malformed RPL_WHOREPLY trailing parameter"))?;
            let hops: u32 = hops_str
                .parse()
                .context("malformed RPL_WHOREPLY hop count")?;
            let trailing = format!("{} {}", hops + 1, realname);

            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let channel = if channel == "*" {
                    channel.clone()
                } else {
                    dc.marshal_entity(net, &channel)
                };
                let nick = dc.marshal_entity(net, &nick);
                dc.send(
                    Message::new(
                        numeric::RPL_WHOREPLY,
                        vec![
                            dc.nick.clone(),
                            channel,
                            username.clone(),
                            host.clone(),
                            server.clone(),
                            nick,
                            flags.clone(),
                            trailing.clone(),
                        ],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_ENDOFWHO => {
            let name = msg.params.get(1).cloned().unwrap_or_default();
            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let name = if name == "*" {
                    name.clone()
                } else {
                    dc.marshal_entity(net, &name)
                };
                dc.send(
                    Message::new(
                        numeric::RPL_ENDOFWHO,
                        vec![dc.nick.clone(), name, "End of /WHO list".into()],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_WHOISUSER => {
            if msg.params.len() < 6 {
                bail!("malformed RPL_WHOISUSER");
            }
            let nick = msg.params[1].clone();
            let username = msg.params[2].clone();
            let host = msg.params[3].clone();
            let realname = msg.params[5].clone();
            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let nick = dc.marshal_entity(net, &nick);
                dc.send(
                    Message::new(
                        numeric::RPL_WHOISUSER,
                        vec![
                            dc.nick.clone(),
                            nick,
                            username.clone(),
                            host.clone(),
                            "*".into(),
                            realname.clone(),
                        ],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_WHOISSERVER => {
            if msg.params.len() < 4 {
                bail!("malformed RPL_WHOISSERVER");
            }
            let nick = msg.params[1].clone();
            let server = msg.params[2].clone();
            let server_info = msg.params[3].clone();
            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let nick = dc.marshal_entity(net, &nick);
                dc.send(
                    Message::new(
                        numeric::RPL_WHOISSERVER,
                        vec![dc.nick.clone(), nick, server.clone(), server_info.clone()],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_WHOISOPERATOR => {
            let nick = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing nick"))?;
            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let nick = dc.marshal_entity(net, &nick);
                dc.send(
                    Message::new(
                        numeric::RPL_WHOISOPERATOR,
                        vec![dc.nick.clone(), nick, "is an IRC operator".into()],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_WHOISIDLE => {
            if msg.params.len() < 3 {
                bail!("malformed RPL_WHOISIDLE");
            }
            let nick = msg.params[1].clone();
            let rest = msg.params[2..].to_vec();
            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let nick = dc.marshal_entity(net, &nick);
                let mut params = vec![dc.nick.clone(), nick];
                params.extend(rest.iter().cloned());
                dc.send(
                    Message::new(numeric::RPL_WHOISIDLE, params)
                        .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_WHOISCHANNELS => {
            if msg.params.len() < 3 {
                bail!("malformed RPL_WHOISCHANNELS");
            }
            let nick = msg.params[1].clone();
            let channel_list = msg.params[2].clone();
            let net = &networks[net_idx];
            let uc = net.conn.as_ref().unwrap();
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let nick = dc.marshal_entity(net, &nick);
                let channels: Vec<String> = channel_list
                    .split_whitespace()
                    .map(|channel| {
                        let (ms, name) =
                            parse_membership_prefixes(&uc.isupport.memberships, channel);
                        format!(
                            "{}{}",
                            dc.format_member_prefix(&ms),
                            dc.marshal_entity(net, name)
                        )
                    })
                    .collect();
                dc.send(
                    Message::new(
                        numeric::RPL_WHOISCHANNELS,
                        vec![dc.nick.clone(), nick, channels.join(" ")],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_ENDOFWHOIS => {
            let nick = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing nick"))?;
            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let nick = dc.marshal_entity(net, &nick);
                dc.send(
                    Message::new(
                        numeric::RPL_ENDOFWHOIS,
                        vec![dc.nick.clone(), nick, "End of /WHOIS list".into()],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        "INVITE" => {
            let Some(prefix) = msg.prefix.clone() else {
                bail!("expected a prefix");
            };
            let nick = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("missing nick"))?;
            let channel = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("missing channel"))?;
            let net = &networks[net_idx];
            let for_us = net
                .conn
                .as_ref()
                .is_some_and(|uc| uc.casemap().eq(&nick, &uc.nick));
            for dc in user::downstreams_for(downstreams, net_id) {
                if !dc.caps.is_enabled("invite-notify") && !for_us {
                    continue;
                }
                dc.send(
                    Message::new(
                        "INVITE",
                        vec![dc.marshal_entity(net, &nick), dc.marshal_entity(net, &channel)],
                    )
                    .with_prefix(dc.marshal_user_prefix(net, &prefix)),
                );
            }
        }
        numeric::RPL_INVITING => {
            if msg.params.len() < 3 {
                bail!("malformed RPL_INVITING");
            }
            let nick = msg.params[1].clone();
            let channel = msg.params[2].clone();
            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                dc.send(
                    Message::new(
                        numeric::RPL_INVITING,
                        vec![
                            dc.nick.clone(),
                            dc.marshal_entity(net, &nick),
                            dc.marshal_entity(net, &channel),
                        ],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_AWAY => {
            if msg.params.len() < 3 {
                bail!("malformed RPL_AWAY");
            }
            let nick = msg.params[1].clone();
            let reason = msg.params[2].clone();
            let net = &networks[net_idx];
            for dc in user::downstreams_for(downstreams, net_id) {
                dc.send(
                    Message::new(
                        numeric::RPL_AWAY,
                        vec![dc.nick.clone(), dc.marshal_entity(net, &nick), reason.clone()],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        "AWAY" => {
            let Some(prefix) = msg.prefix.clone() else {
                bail!("expected a prefix");
            };
            let net = &networks[net_idx];
            for dc in user::downstreams_for(downstreams, net_id) {
                if !dc.caps.is_enabled("away-notify") {
                    continue;
                }
                dc.send(
                    Message::new("AWAY", msg.params.clone())
                        .with_prefix(dc.marshal_user_prefix(net, &prefix)),
                );
            }
        }
        numeric::RPL_BANLIST
        | numeric::RPL_INVITELIST
        | numeric::RPL_EXCEPTLIST => {
            if msg.params.len() < 3 {
                bail!("malformed mask list reply");
            }
            let channel = msg.params[1].clone();
            let mask = msg.params[2].clone();
            let added_by = msg.params.get(3).cloned();
            let added_at = msg.params.get(4).cloned();

            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let channel = dc.marshal_entity(net, &channel);
                let mut params = vec![dc.nick.clone(), channel, mask.clone()];
                if let (Some(nick), Some(time)) = (&added_by, &added_at) {
                    params.push(dc.marshal_entity(net, nick));
                    params.push(time.clone());
                }
                dc.send(
                    Message::new(msg.command.clone(), params)
                        .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::RPL_ENDOFBANLIST
        | numeric::RPL_ENDOFINVITELIST
        | numeric::RPL_ENDOFEXCEPTLIST => {
            if msg.params.len() < 3 {
                bail!("malformed mask list end reply");
            }
            let channel = msg.params[1].clone();
            let trailing = msg.params[2].clone();
            let net = &networks[net_idx];
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                dc.send(
                    Message::new(
                        msg.command.clone(),
                        vec![dc.nick.clone(), dc.marshal_entity(net, &channel), trailing.clone()],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        numeric::ERR_UNKNOWNCOMMAND | numeric::RPL_TRYAGAIN => {
            if msg.params.len() < 3 {
                bail!("malformed command error reply");
            }
            let command = msg.params[1].clone();
            let reason = msg.params[2].clone();

            if command == "LIST"
                && !end_pending_lists(
                    networks,
                    downstreams,
                    pending_lists,
                    &hostname,
                    net_idx,
                    false,
                )
            {
                bail!("unexpected response for LIST: no matching pending LIST");
            }

            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                dc.send(
                    Message::new(
                        msg.command.clone(),
                        vec![dc.nick.clone(), command.clone(), reason.clone()],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        "ERROR" => {
            let text = msg.params.first().cloned().unwrap_or_default();
            let err = format!("fatal server error: {}", text);
            net.last_error = Some(err.clone());
            for dc in user::downstreams_for(downstreams, net_id) {
                dc.send_service_notice(
                    &hostname,
                    &format!("disconnected from {}: {}", net.record.get_name(), err),
                );
            }
            user::notify_bouncer_network_state(
                downstreams,
                &hostname,
                net_id,
                &[("error", err.as_str())],
            );
        }
        "MONITOR" => {
            // 730/731 style state pushes come as numerics; plain MONITOR
            // from the server is unexpected and dropped.
            debug!("unhandled MONITOR from upstream");
        }
        "730" | "731" => {
            let targets = msg.params.get(1).cloned().unwrap_or_default();
            let net = &networks[net_idx];
            for dc in user::downstreams_for(downstreams, net_id) {
                let marshaled: Vec<String> = targets
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|mask| {
                        let prefix = Prefix::new_from_str(mask);
                        dc.marshal_user_prefix(net, &prefix).to_string()
                    })
                    .collect();
                dc.send(
                    Message::new(
                        msg.command.clone(),
                        vec![dc.nick.clone(), marshaled.join(",")],
                    )
                    .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
        "ACK"
        | numeric::RPL_NOWAWAY
        | numeric::RPL_UNAWAY
        | numeric::RPL_YOURHOST
        | numeric::RPL_CREATED
        | numeric::RPL_LUSERCLIENT
        | numeric::RPL_LUSEROP
        | numeric::RPL_LUSERUNKNOWN
        | numeric::RPL_LUSERCHANNELS
        | numeric::RPL_LUSERME
        | numeric::RPL_LOCALUSERS
        | numeric::RPL_GLOBALUSERS
        | numeric::RPL_MOTDSTART
        | numeric::RPL_MOTD
        | numeric::RPL_ENDOFMOTD
        | numeric::ERR_NOMOTD
        | numeric::RPL_LISTSTART => {}
        _ => {
            debug!(command = %msg.command, "unhandled upstream message");
            // Best-effort forwarding for unknown replies: rewrite the
            // leading nick parameter for numerics, keep the rest as-is.
            let net = &networks[net_idx];
            let uc = net.conn.as_ref().unwrap();
            for dc in user::downstreams_for_id(downstreams, net_id, downstream_id) {
                let mut params = msg.params.clone();
                if msg.is_numeric() {
                    if let Some(first) = params.first_mut() {
                        if uc.is_our_nick(first) {
                            *first = dc.nick.clone();
                        }
                    }
                }
                dc.send(
                    Message::new(msg.command.clone(), params)
                        .with_prefix(Prefix::ServerName(hostname.clone())),
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_parsing() {
        assert_eq!(parse_label("sd-7-42").unwrap(), 7);
        assert!(parse_label("sd-7").is_err());
        assert!(parse_label("xx-7-42").is_err());
        assert!(parse_label("sd-a-b").is_err());
    }

    #[test]
    fn registration_error_classes() {
        let temp = RegistrationError::temporary("nick in use");
        assert!(temp.temporary);
        let fatal = RegistrationError::fatal("banned");
        assert!(!fatal.temporary);
    }
}
