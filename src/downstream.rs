//! Downstream connection: one client session attached to the bouncer.
//!
//! Registration (PASS/NICK/USER/CAP/AUTHENTICATE) runs on the accepting
//! connection task; the resulting `DownstreamConn` is then handed to the
//! owning user's event loop, which performs the welcome burst and every
//! later mutation.

use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use slbnc_proto::{
    format_server_time, numeric, parse_server_time, sasl, Caps, Casemap, MembershipSet, Message,
    NameMap, Prefix,
};

use crate::db;
use crate::msgstore::MessageStore;
use crate::network::{self, Network};
use crate::server::Shared;
use crate::upstream::{self, UpstreamChannel};
use crate::user::{self, User};
use crate::{CAP_BOUNCER_NETWORKS, CAP_BOUNCER_NETWORKS_NOTIFY, MSGID_PING_PREFIX, SERVICE_NICK};

/// Downstream capabilities always advertised.
const PERMANENT_DOWNSTREAM_CAPS: &[(&str, &str)] = &[
    ("batch", ""),
    ("cap-notify", ""),
    ("echo-message", ""),
    ("invite-notify", ""),
    ("message-tags", ""),
    ("sasl", "PLAIN"),
    ("server-time", ""),
    (CAP_BOUNCER_NETWORKS, ""),
    (CAP_BOUNCER_NETWORKS_NOTIFY, ""),
];

/// Capabilities advertised only while every connected upstream has them.
const NEED_ALL_UPSTREAM_CAPS: &[&str] = &["away-notify", "extended-join", "multi-prefix"];

/// Error from a downstream command handler.
///
/// An `Irc` error is relayed to the client with the bouncer's prefix; a
/// `Fatal` error closes the connection after a generic ERROR line.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Irc(Message),
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn unknown_command(cmd: &str) -> Self {
        HandlerError::Irc(Message::new(
            numeric::ERR_UNKNOWNCOMMAND,
            vec!["*".into(), cmd.to_owned(), "Unknown command".into()],
        ))
    }

    pub fn need_more_params(cmd: &str) -> Self {
        HandlerError::Irc(Message::new(
            numeric::ERR_NEEDMOREPARAMS,
            vec!["*".into(), cmd.to_owned(), "Not enough parameters".into()],
        ))
    }

    pub fn auth_failed() -> Self {
        HandlerError::Irc(Message::new(
            numeric::ERR_PASSWDMISMATCH,
            vec!["*".into(), "Invalid username or password".into()],
        ))
    }

    pub fn no_such_channel(name: &str) -> Self {
        HandlerError::Irc(Message::new(
            numeric::ERR_NOSUCHCHANNEL,
            vec![name.to_owned(), "No such channel".into()],
        ))
    }
}

impl From<std::fmt::Error> for HandlerError {
    fn from(e: std::fmt::Error) -> Self {
        HandlerError::Fatal(e.to_string())
    }
}

/// Split a raw username into `(username, client, network)`.
///
/// The suffixes `/network` and `@client` may appear in either order.
pub fn unmarshal_username(raw: &str) -> (String, String, String) {
    let mut username = raw;
    let mut client = "";
    let mut network = "";

    let first = raw.find(['/', '@']);
    let last = raw.rfind(['/', '@']);
    if let Some(i) = first {
        username = &raw[..i];
    }
    if let Some(j) = last {
        if raw.as_bytes()[j] == b'@' {
            client = &raw[j + 1..];
        } else {
            network = &raw[j + 1..];
        }
    }
    if let (Some(i), Some(j)) = (first, last) {
        if i < j {
            if raw.as_bytes()[i] == b'@' {
                client = &raw[i + 1..j];
            } else {
                network = &raw[i + 1..j];
            }
        }
    }
    (username.to_owned(), client.to_owned(), network.to_owned())
}

/// A registered client connection, owned by the user event loop.
pub struct DownstreamConn {
    pub id: u64,
    pub user_id: i64,
    outgoing: mpsc::UnboundedSender<Message>,
    closed: watch::Sender<bool>,

    pub nick: String,
    pub nick_cm: String,
    pub username: String,
    pub raw_username: String,
    pub client_name: String,
    pub network_name: String,
    pub realname: String,
    pub hostname: String,

    pub caps: Caps,
    pub cap_version: u32,
    /// Bound network; `None` is the multi-network view.
    pub network_id: Option<i64>,
    pub monitored: NameMap<bool>,

    /// Sent-but-unacknowledged message IDs, with the (network, target)
    /// needed to record the receipt once the client PONGs.
    pending_acks: HashMap<String, (i64, String)>,
}

impl DownstreamConn {
    pub fn prefix(&self) -> Prefix {
        Prefix::new(
            self.nick.clone(),
            self.username.clone(),
            self.hostname.clone(),
        )
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Ask the connection tasks to shut down.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Queue a message, applying per-capability downgrades.
    pub fn send(&self, mut msg: Message) {
        if msg.command == "TAGMSG" && !self.caps.is_enabled("message-tags") {
            return;
        }
        if !self.caps.is_enabled("message-tags") {
            msg.tags.retain(|t| t.0 == "time");
        }
        if !self.caps.is_enabled("server-time") {
            msg.remove_tag("time");
        }
        if msg.command == "JOIN"
            && !self.caps.is_enabled("extended-join")
            && msg.params.len() > 1
        {
            msg.params.truncate(1);
        }
        let _ = self.outgoing.send(msg);
    }

    /// Queue a message that carries an internal message ID, then confirm
    /// delivery with a `PING soju-msgid-<id>` round trip.
    pub fn send_with_id(
        &mut self,
        net_id: i64,
        target_cm: &str,
        msg: Message,
        msg_id: Option<&str>,
    ) {
        let confirm = matches!(msg.command.as_str(), "PRIVMSG" | "NOTICE");
        self.send(msg);
        let Some(id) = msg_id else {
            return;
        };
        if !confirm {
            return;
        }
        self.pending_acks
            .insert(id.to_owned(), (net_id, target_cm.to_owned()));
        let _ = self.outgoing.send(Message::new(
            "PING",
            vec![format!("{}{}", MSGID_PING_PREFIX, id)],
        ));
    }

    /// Resolve a PONG token into the receipt it acknowledges.
    pub fn take_ack(&mut self, token: &str) -> Option<(String, i64, String)> {
        let id = token.strip_prefix(MSGID_PING_PREFIX)?;
        let (net_id, target) = self.pending_acks.remove(id)?;
        Some((id.to_owned(), net_id, target))
    }

    pub fn send_service_notice(&self, hostname: &str, text: &str) {
        self.send(
            Message::new("NOTICE", vec![self.nick.clone(), text.to_owned()])
                .with_prefix(Prefix::new(SERVICE_NICK, SERVICE_NICK, hostname)),
        );
    }

    pub fn nick_is(&self, casemap: &Casemap, name: &str) -> bool {
        (*casemap).eq(name, &self.nick)
    }

    /// Format membership prefixes for this client: all of them with
    /// `multi-prefix`, otherwise only the highest.
    pub fn format_member_prefix(&self, ms: &MembershipSet) -> String {
        if self.caps.is_enabled("multi-prefix") {
            ms.prefixes()
        } else {
            ms.highest_prefix()
        }
    }

    /// Marshal an entity name for this client: channels and nicks gain a
    /// `/<network>` suffix in the multi-network view, and the network's
    /// partial casemap is applied to non-alphabetic bytes.
    pub fn marshal_entity(&self, net: &Network, name: &str) -> String {
        if let Some(uc) = &net.conn {
            if !uc.is_channel(name) && uc.casemap().eq(name, &uc.nick) {
                return self.nick.clone();
            }
        }
        let name = net.casemap.partial(name);
        if self.network_id.is_some() {
            name
        } else {
            format!("{}/{}", name, net.record.get_name())
        }
    }

    /// Marshal a message source.
    pub fn marshal_user_prefix(&self, net: &Network, prefix: &Prefix) -> Prefix {
        if let Some(uc) = &net.conn {
            if uc.casemap().eq(prefix.name(), &uc.nick) {
                return self.prefix();
            }
        }
        if self.network_id.is_some() {
            prefix.clone()
        } else {
            prefix.with_name(format!(
                "{}/{}",
                net.casemap.partial(prefix.name()),
                net.record.get_name()
            ))
        }
    }

    /// Marshal prefix and entity parameters of a forwarded message.
    pub fn marshal_message(&self, net: &Network, msg: &Message) -> Message {
        let mut out = msg.clone();
        if let Some(prefix) = &msg.prefix {
            out.prefix = Some(self.marshal_user_prefix(net, prefix));
        }
        match msg.command.as_str() {
            "PRIVMSG" | "NOTICE" | "TAGMSG" | "JOIN" | "PART" | "KICK" | "TOPIC" | "INVITE" => {
                if let Some(target) = out.params.first_mut() {
                    *target = self.marshal_entity(net, target);
                }
            }
            "NICK" => {
                // A rename of someone else: the new nick needs the suffix.
                if let Some(nick) = out.params.first_mut() {
                    *nick = self.marshal_entity(net, nick);
                }
            }
            "QUIT" | "SETNAME" => {}
            _ => {}
        }
        out
    }

    /// Split a client-supplied entity name into its network and the
    /// upstream name. In the multi-network view the name must carry a
    /// known `/<network>` suffix.
    pub fn unmarshal_entity(
        &self,
        networks: &[Network],
        name: &str,
    ) -> Result<(usize, String), HandlerError> {
        if let Some(net_id) = self.network_id {
            let idx = networks
                .iter()
                .position(|n| n.record.id == net_id)
                .ok_or_else(|| HandlerError::no_such_channel(name))?;
            return Ok((idx, name.to_owned()));
        }

        if let Some((entity, net_name)) = name.rsplit_once('/') {
            if let Some(idx) = networks
                .iter()
                .position(|n| n.record.get_name() == net_name)
            {
                return Ok((idx, entity.to_owned()));
            }
        }
        Err(HandlerError::no_such_channel(name))
    }
}

/// Recompute the dynamically advertised capabilities from the current
/// upstream cap state, emitting CAP NEW/DEL when `cap-notify` is on.
pub fn update_supported_caps(dc: &mut DownstreamConn, networks: &[Network]) {
    for &cap in NEED_ALL_UPSTREAM_CAPS {
        let supported = networks
            .iter()
            .filter(|net| dc.network_id.map_or(true, |id| id == net.record.id))
            .filter_map(|net| net.conn.as_ref())
            .all(|uc| uc.caps.is_enabled(cap));

        let was = dc.caps.is_available(cap);
        if supported && !was {
            dc.caps.set_available(cap, "");
            if dc.caps.is_enabled("cap-notify") {
                dc.send(Message::new(
                    "CAP",
                    vec![dc.nick.clone(), "NEW".into(), cap.to_owned()],
                ));
            }
        } else if !supported && was {
            dc.caps.remove_available(cap);
            if dc.caps.is_enabled("cap-notify") {
                dc.send(Message::new(
                    "CAP",
                    vec![dc.nick.clone(), "DEL".into(), cap.to_owned()],
                ));
            }
        }
    }
}

/// Tell a bound client about its network's nick after a change.
pub fn update_nick(dc: &mut DownstreamConn, net: &Network) {
    let Some(uc) = &net.conn else {
        return;
    };
    if dc.network_id != Some(net.record.id) {
        return;
    }
    if dc.nick == uc.nick {
        return;
    }
    let old_prefix = dc.prefix();
    dc.send(Message::new("NICK", vec![uc.nick.clone()]).with_prefix(old_prefix));
    dc.nick = uc.nick.clone();
    dc.nick_cm = Casemap::Ascii.canonical(&dc.nick);
}

/// Forward a fully mirrored channel: topic, then NAMES.
pub fn forward_channel(dc: &DownstreamConn, net: &Network, ch: &UpstreamChannel, hostname: &str) {
    send_topic(dc, net, ch, hostname);
    send_names(dc, net, ch, hostname);
}

pub fn send_topic(dc: &DownstreamConn, net: &Network, ch: &UpstreamChannel, hostname: &str) {
    let channel = dc.marshal_entity(net, &ch.name);
    let prefix = Prefix::ServerName(hostname.to_owned());
    if !ch.topic.is_empty() {
        dc.send(
            Message::new(
                numeric::RPL_TOPIC,
                vec![dc.nick.clone(), channel.clone(), ch.topic.clone()],
            )
            .with_prefix(prefix.clone()),
        );
        if let (Some(who), Some(time)) = (&ch.topic_who, &ch.topic_time) {
            dc.send(
                Message::new(
                    numeric::RPL_TOPICWHOTIME,
                    vec![
                        dc.nick.clone(),
                        channel,
                        dc.marshal_user_prefix(net, who).to_string(),
                        time.timestamp().to_string(),
                    ],
                )
                .with_prefix(prefix),
            );
        }
    } else {
        dc.send(
            Message::new(
                numeric::RPL_NOTOPIC,
                vec![dc.nick.clone(), channel, "No topic is set".into()],
            )
            .with_prefix(prefix),
        );
    }
}

pub fn send_names(dc: &DownstreamConn, net: &Network, ch: &UpstreamChannel, hostname: &str) {
    let channel = dc.marshal_entity(net, &ch.name);
    let prefix = Prefix::ServerName(hostname.to_owned());

    let mut line = String::new();
    for (nick, memberships) in ch.members.iter() {
        let entry = format!(
            "{}{}",
            dc.format_member_prefix(memberships),
            dc.marshal_entity(net, nick)
        );
        if !line.is_empty() && line.len() + 1 + entry.len() > 400 {
            dc.send(
                Message::new(
                    numeric::RPL_NAMREPLY,
                    vec![
                        dc.nick.clone(),
                        ch.status.to_string(),
                        channel.clone(),
                        std::mem::take(&mut line),
                    ],
                )
                .with_prefix(prefix.clone()),
            );
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&entry);
    }
    if !line.is_empty() {
        dc.send(
            Message::new(
                numeric::RPL_NAMREPLY,
                vec![
                    dc.nick.clone(),
                    ch.status.to_string(),
                    channel.clone(),
                    line,
                ],
            )
            .with_prefix(prefix.clone()),
        );
    }
    dc.send(
        Message::new(
            numeric::RPL_ENDOFNAMES,
            vec![dc.nick.clone(), channel, "End of /NAMES list".into()],
        )
        .with_prefix(prefix),
    );
}

/// Replay one target's backlog since `after_id` to one client.
///
/// Detached channels get a relay notice per matching message instead of a
/// normal replay.
pub fn send_target_backlog(
    dc: &DownstreamConn,
    net: &Network,
    store: &dyn MessageStore,
    hostname: &str,
    limit: usize,
    target: &str,
    after_id: &str,
) {
    let target_cm = net.casemap.canonical(target);
    let messages = match store.load_after_id(&net.record, &target_cm, after_id, limit) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(target = %target, error = %e, "failed to load backlog");
            return;
        }
    };
    if messages.is_empty() {
        return;
    }

    if let Some(ch) = net.channels.get(target) {
        if ch.detached {
            for msg in &messages {
                if msg.command != "PRIVMSG" && msg.command != "NOTICE" {
                    continue;
                }
                let sender = msg.source_nickname().unwrap_or("");
                let text = msg.params.get(1).map(String::as_str).unwrap_or("");
                let highlight = net.is_highlight_for(sender, text);
                if network::detached_message_needs_relay(ch, highlight) {
                    let kind = if highlight { "highlight" } else { "message" };
                    let marshaled = dc.marshal_entity(net, &ch.name);
                    dc.send_service_notice(
                        hostname,
                        &format!("{} in {}: <{}> {}", kind, marshaled, sender, text),
                    );
                }
            }
            return;
        }
    }

    let batch_ref = format!("history-{}", dc.id);
    let use_batch = dc.caps.is_enabled("batch");
    if use_batch {
        dc.send(
            Message::new(
                "BATCH",
                vec![
                    format!("+{}", batch_ref),
                    "chathistory".into(),
                    dc.marshal_entity(net, target),
                ],
            )
            .with_prefix(Prefix::ServerName(hostname.to_owned())),
        );
    }
    for msg in messages {
        let mut out = dc.marshal_message(net, &msg);
        if use_batch {
            out.set_tag("batch", Some(batch_ref.clone()));
        }
        dc.send(out);
    }
    if use_batch {
        dc.send(
            Message::new("BATCH", vec![format!("-{}", batch_ref)])
                .with_prefix(Prefix::ServerName(hostname.to_owned())),
        );
    }
}

// ---------------------------------------------------------------------------
// Registration

/// Outcome of a successful downstream registration.
pub struct Registered {
    pub user: db::User,
    pub dc: DownstreamConn,
}

/// Pre-registration state machine, driven by the accepting task.
pub struct Registration {
    pub id: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    closed: watch::Sender<bool>,
    hostname: String,

    nick: String,
    raw_username: String,
    realname: String,
    password: Option<String>,
    caps: Caps,
    cap_version: u32,
    negotiating_caps: bool,
    sasl_mechanism_pending: bool,
    sasl_user: Option<(db::User, String, String)>,
}

impl Registration {
    pub fn new(
        id: u64,
        hostname: String,
        outgoing: mpsc::UnboundedSender<Message>,
        closed: watch::Sender<bool>,
    ) -> Self {
        Registration {
            id,
            outgoing,
            closed,
            hostname,
            nick: String::new(),
            raw_username: String::new(),
            realname: String::new(),
            password: None,
            caps: Caps::new(),
            cap_version: 0,
            negotiating_caps: false,
            sasl_mechanism_pending: false,
            sasl_user: None,
        }
    }

    fn send(&self, msg: Message) {
        let _ = self.outgoing.send(msg);
    }

    fn send_prefixed(&self, server_hostname: &str, mut msg: Message) {
        msg.prefix = Some(Prefix::ServerName(server_hostname.to_owned()));
        self.send(msg);
    }

    fn reply_to(&self) -> String {
        if self.nick.is_empty() {
            "*".to_owned()
        } else {
            self.nick.clone()
        }
    }

    async fn authenticate(
        &self,
        shared: &Shared,
        raw_username: &str,
        password: &str,
    ) -> Result<(db::User, String, String), HandlerError> {
        let (username, client, network) = unmarshal_username(raw_username);

        let user = shared.db.get_user(&username).await.map_err(|e| {
            info!(username = %username, error = %e, "failed authentication");
            HandlerError::auth_failed()
        })?;
        let ok = bcrypt::verify(password, &user.password).unwrap_or(false);
        if !ok || !user.enabled {
            info!(username = %username, "failed authentication");
            return Err(HandlerError::auth_failed());
        }
        Ok((user, client, network))
    }

    /// Drive the state machine with one message. Returns the registered
    /// connection once PASS/NICK/USER (or SASL) completes.
    pub async fn handle_message(
        &mut self,
        shared: &Shared,
        msg: &Message,
    ) -> Result<Option<Registered>, HandlerError> {
        match msg.command.as_str() {
            "NICK" => {
                let nick = msg
                    .params
                    .first()
                    .ok_or_else(|| HandlerError::need_more_params("NICK"))?;
                if nick == SERVICE_NICK {
                    return Err(HandlerError::Irc(Message::new(
                        numeric::ERR_NICKNAMEINUSE,
                        vec![
                            self.reply_to(),
                            nick.clone(),
                            "Nickname reserved for bouncer service".into(),
                        ],
                    )));
                }
                self.nick = nick.clone();
            }
            "USER" => {
                if msg.params.len() < 4 {
                    return Err(HandlerError::need_more_params("USER"));
                }
                self.raw_username = msg.params[0].clone();
                self.realname = msg.params[3].clone();
            }
            "PASS" => {
                let pass = msg
                    .params
                    .first()
                    .ok_or_else(|| HandlerError::need_more_params("PASS"))?;
                self.password = Some(pass.clone());
            }
            "CAP" => {
                let sub_cmd = msg
                    .params
                    .first()
                    .ok_or_else(|| HandlerError::need_more_params("CAP"))?
                    .to_ascii_uppercase();
                self.handle_cap(shared, &sub_cmd, &msg.params[1..])?;
            }
            "AUTHENTICATE" => {
                return self.handle_authenticate(shared, msg).await.map(|_| None);
            }
            "QUIT" => {
                self.closed.send_replace(true);
                return Ok(None);
            }
            _ => {
                debug!(command = %msg.command, "unhandled message before registration");
                return Err(HandlerError::unknown_command(&msg.command));
            }
        }

        if !self.raw_username.is_empty() && !self.nick.is_empty() && !self.negotiating_caps {
            return self.register(shared).await.map(Some);
        }
        Ok(None)
    }

    fn handle_cap(
        &mut self,
        shared: &Shared,
        cmd: &str,
        args: &[String],
    ) -> Result<(), HandlerError> {
        let reply_to = self.reply_to();
        match cmd {
            "LS" => {
                if let Some(version) = args.first() {
                    self.cap_version = version.parse().unwrap_or(0);
                }
                if self.cap_version >= 302 {
                    // cap-notify is implied by 302 and cannot be disabled.
                    self.caps.set_enabled("cap-notify", true);
                }
                let caps: Vec<String> = PERMANENT_DOWNSTREAM_CAPS
                    .iter()
                    .map(|(name, value)| {
                        if self.cap_version >= 302 && !value.is_empty() {
                            format!("{}={}", name, value)
                        } else {
                            (*name).to_owned()
                        }
                    })
                    .collect();
                self.send_prefixed(
                    &shared.hostname,
                    Message::new("CAP", vec![reply_to, "LS".into(), caps.join(" ")]),
                );
                self.negotiating_caps = true;
            }
            "LIST" => {
                let enabled: Vec<String> =
                    self.caps.enabled().map(str::to_owned).collect();
                self.send_prefixed(
                    &shared.hostname,
                    Message::new("CAP", vec![reply_to, "LIST".into(), enabled.join(" ")]),
                );
            }
            "REQ" => {
                let Some(requested) = args.first() else {
                    return Err(HandlerError::Irc(Message::new(
                        numeric::ERR_INVALIDCAPCMD,
                        vec![
                            reply_to,
                            cmd.to_owned(),
                            "Missing argument in CAP REQ command".into(),
                        ],
                    )));
                };
                let mut ack = true;
                let mut changes = Vec::new();
                for name in requested.split_whitespace() {
                    let (name, enable) = match name.strip_prefix('-') {
                        Some(name) => (name.to_ascii_lowercase(), false),
                        None => (name.to_ascii_lowercase(), true),
                    };
                    let known = PERMANENT_DOWNSTREAM_CAPS
                        .iter()
                        .any(|(n, _)| *n == name)
                        || self.caps.is_available(&name);
                    if !known {
                        ack = false;
                        break;
                    }
                    if name == "cap-notify" && self.cap_version >= 302 && !enable {
                        ack = false;
                        break;
                    }
                    changes.push((name, enable));
                }
                if ack {
                    for (name, enable) in changes {
                        self.caps.set_enabled(&name, enable);
                    }
                }
                let reply = if ack { "ACK" } else { "NAK" };
                self.send_prefixed(
                    &shared.hostname,
                    Message::new(
                        "CAP",
                        vec![self.reply_to(), reply.into(), requested.clone()],
                    ),
                );
            }
            "END" => {
                self.negotiating_caps = false;
            }
            _ => {
                return Err(HandlerError::Irc(Message::new(
                    numeric::ERR_INVALIDCAPCMD,
                    vec![self.reply_to(), cmd.to_owned(), "Unknown CAP command".into()],
                )));
            }
        }
        Ok(())
    }

    async fn handle_authenticate(
        &mut self,
        shared: &Shared,
        msg: &Message,
    ) -> Result<(), HandlerError> {
        let sasl_fail = |text: &str| {
            HandlerError::Irc(Message::new(
                numeric::ERR_SASLFAIL,
                vec!["*".into(), text.to_owned()],
            ))
        };

        if !self.caps.is_enabled("sasl") {
            return Err(sasl_fail(
                "AUTHENTICATE requires the \"sasl\" capability to be enabled",
            ));
        }
        let Some(param) = msg.params.first() else {
            return Err(sasl_fail("Missing AUTHENTICATE argument"));
        };

        if !self.sasl_mechanism_pending {
            match param.to_ascii_uppercase().as_str() {
                "PLAIN" => {
                    self.sasl_mechanism_pending = true;
                    self.send_prefixed(
                        &shared.hostname,
                        Message::new("AUTHENTICATE", vec!["+".into()]),
                    );
                    Ok(())
                }
                mech => Err(sasl_fail(&format!("Unsupported SASL mechanism {:?}", mech))),
            }
        } else if param == "*" {
            self.sasl_mechanism_pending = false;
            Err(HandlerError::Irc(Message::new(
                numeric::ERR_SASLABORTED,
                vec!["*".into(), "SASL authentication aborted".into()],
            )))
        } else {
            self.sasl_mechanism_pending = false;
            let payload = sasl::decode_authenticate_param(param)
                .map_err(|_| sasl_fail("Invalid base64-encoded response"))?;
            let (_authzid, authcid, password) =
                sasl::decode_plain(&payload).map_err(|_| sasl_fail("Malformed response"))?;

            let (user, client, network) =
                self.authenticate(shared, &authcid, &password).await.map_err(|_| {
                    sasl_fail("Invalid username or password")
                })?;
            let username = user.username.clone();
            self.sasl_user = Some((user, client, network));

            self.send_prefixed(
                &shared.hostname,
                Message::new(
                    numeric::RPL_LOGGEDIN,
                    vec![
                        self.reply_to(),
                        self.reply_to(),
                        username,
                        "You are now logged in".into(),
                    ],
                ),
            );
            self.send_prefixed(
                &shared.hostname,
                Message::new(
                    numeric::RPL_SASLSUCCESS,
                    vec![self.reply_to(), "SASL authentication successful".into()],
                ),
            );
            Ok(())
        }
    }

    async fn register(&mut self, shared: &Shared) -> Result<Registered, HandlerError> {
        let password = self.password.take();

        let (user, client_name, mut network_name) = match self.sasl_user.take() {
            Some(authed) => authed,
            None => {
                let Some(password) = password else {
                    return Err(HandlerError::auth_failed());
                };
                self.authenticate(shared, &self.raw_username.clone(), &password)
                    .await?
            }
        };

        if network_name.is_empty() {
            let (_, _, from_user) = unmarshal_username(&self.raw_username);
            network_name = from_user;
        }

        info!(username = %user.username, "downstream registration complete");

        let dc = DownstreamConn {
            id: self.id,
            user_id: user.id,
            outgoing: self.outgoing.clone(),
            closed: self.closed.clone(),
            nick: self.nick.clone(),
            nick_cm: Casemap::Ascii.canonical(&self.nick),
            username: user.username.clone(),
            raw_username: self.raw_username.clone(),
            client_name,
            network_name,
            realname: self.realname.clone(),
            hostname: self.hostname.clone(),
            caps: self.caps.clone(),
            cap_version: self.cap_version,
            network_id: None,
            monitored: NameMap::with_casemap(Casemap::Ascii),
            pending_acks: HashMap::new(),
        };
        Ok(Registered { user, dc })
    }
}

// ---------------------------------------------------------------------------
// Welcome and backlog

fn isupport_tokens(user: &User, dc: &DownstreamConn) -> Vec<String> {
    let mut tokens = vec![
        format!("CHATHISTORY={}", user.shared.config.history.limit),
        "CASEMAPPING=ascii".to_owned(),
    ];
    if let Some(net_id) = dc.network_id {
        if let Some(net) = user.networks.iter().find(|n| n.record.id == net_id) {
            if let Some(uc) = &net.conn {
                for (key, value) in &uc.isupport.passthrough {
                    match value {
                        Some(v) => tokens.push(format!("{}={}", key, v)),
                        None => tokens.push(key.clone()),
                    }
                }
            }
        }
    }
    tokens
}

/// Run the welcome burst for a freshly registered downstream, binding (or
/// auto-creating) its network and replaying backlog.
pub async fn welcome(user: &mut User, dc: &mut DownstreamConn) -> Result<(), HandlerError> {
    let hostname = user.shared.hostname.clone();

    if !dc.network_name.is_empty() {
        let net_id = match user
            .networks
            .iter()
            .find(|n| {
                n.record.get_name() == dc.network_name || n.record.addr == dc.network_name
            })
            .map(|n| n.record.id)
        {
            Some(id) => id,
            None => {
                info!(network = %dc.network_name, "auto-creating network");
                let record = db::Network {
                    addr: dc.network_name.clone(),
                    nick: dc.nick.clone(),
                    enabled: true,
                    ..Default::default()
                };
                let net_id = user::create_network(user, record).await.map_err(|e| {
                    HandlerError::Irc(Message::new(
                        numeric::ERR_PASSWDMISMATCH,
                        vec![
                            "*".into(),
                            format!("Failed to connect to {:?}: {}", dc.network_name, e),
                        ],
                    ))
                })?;
                net_id
            }
        };
        dc.network_id = Some(net_id);
        if let Some(net) = user.networks.iter().find(|n| n.record.id == net_id) {
            dc.monitored.set_casemap(net.casemap);
        }
    }

    update_supported_caps(dc, &user.networks);

    let first_client_bearer = !user
        .downstreams
        .iter()
        .any(|other| other.client_name == dc.client_name);

    let prefix = Prefix::ServerName(hostname.clone());
    dc.send(
        Message::new(
            numeric::RPL_WELCOME,
            vec![dc.nick.clone(), format!("Welcome to slbncd, {}", dc.nick)],
        )
        .with_prefix(prefix.clone()),
    );
    dc.send(
        Message::new(
            numeric::RPL_YOURHOST,
            vec![dc.nick.clone(), format!("Your host is {}", hostname)],
        )
        .with_prefix(prefix.clone()),
    );
    dc.send(
        Message::new(
            numeric::RPL_CREATED,
            vec![
                dc.nick.clone(),
                "Who cares when the server was created?".into(),
            ],
        )
        .with_prefix(prefix.clone()),
    );
    dc.send(
        Message::new(
            numeric::RPL_MYINFO,
            vec![
                dc.nick.clone(),
                hostname.clone(),
                "slbncd".into(),
                "aiwroO".into(),
                "OovaimnqpsrtklbeI".into(),
            ],
        )
        .with_prefix(prefix.clone()),
    );
    let mut isupport = isupport_tokens(user, dc);
    isupport.push("are supported".into());
    let mut params = vec![dc.nick.clone()];
    params.append(&mut isupport);
    dc.send(Message::new(numeric::RPL_ISUPPORT, params).with_prefix(prefix.clone()));
    dc.send(
        Message::new(numeric::ERR_NOMOTD, vec![dc.nick.clone(), "No MOTD".into()])
            .with_prefix(prefix.clone()),
    );

    // Mirror joined channels.
    for net in user
        .networks
        .iter()
        .filter(|n| dc.network_id.map_or(true, |id| id == n.record.id))
    {
        let Some(uc) = &net.conn else {
            continue;
        };
        for (_, ch) in uc.channels.iter() {
            if !ch.complete {
                continue;
            }
            if net.channels.get(&ch.name).is_some_and(|c| c.detached) {
                continue;
            }
            dc.send(
                Message::new("JOIN", vec![dc.marshal_entity(net, &ch.name)])
                    .with_prefix(dc.prefix()),
            );
            forward_channel(dc, net, ch, &hostname);
        }
    }

    // Replay backlog and fast-forward the delivery pointers.
    let store = user.msg_store.clone();
    let limit = user.shared.config.history.limit;
    for net in user
        .networks
        .iter_mut()
        .filter(|n| dc.network_id.map_or(true, |id| id == n.record.id))
    {
        net.offline_clients.remove(&dc.client_name);
        if !first_client_bearer {
            continue;
        }
        let mut targets = Vec::new();
        net.delivered.for_each_target(|target| {
            if let Some(id) = net.delivered.load_id(target, &dc.client_name) {
                targets.push((target.to_owned(), id.to_owned()));
            }
        });
        for (target, after_id) in targets {
            send_target_backlog(dc, net, store.as_ref(), &hostname, limit, &target, &after_id);
            let last = store
                .last_msg_id(&net.record, &net.casemap.canonical(&target))
                .unwrap_or(None);
            if let Some(last) = last {
                net.delivered.store_id(&target, &dc.client_name, &last);
            }
        }
    }

    for net in &user.networks {
        if dc.network_id.map_or(false, |id| id != net.record.id) {
            continue;
        }
        if let Some(err) = &net.last_error {
            dc.send_service_notice(
                &hostname,
                &format!("disconnected from {}: {}", net.record.get_name(), err),
            );
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Registered command dispatch

/// Dispatch one message from a registered downstream.
pub async fn handle_message(
    user: &mut User,
    dc_id: u64,
    msg: Message,
) -> Result<(), HandlerError> {
    let Some(dc_idx) = user.downstreams.iter().position(|dc| dc.id == dc_id) else {
        return Ok(());
    };
    let hostname = user.shared.hostname.clone();
    let store = user.msg_store.clone();
    let history_limit = user.shared.config.history.limit;

    match msg.command.as_str() {
        "QUIT" => {
            user.downstreams[dc_idx].close();
        }
        "PING" => {
            let dc = &user.downstreams[dc_idx];
            dc.send(
                Message::new("PONG", msg.params.clone())
                    .with_prefix(Prefix::ServerName(hostname)),
            );
        }
        "PONG" => {
            let Some(token) = msg.params.last() else {
                return Ok(());
            };
            let dc = &mut user.downstreams[dc_idx];
            if let Some((id, net_id, target)) = dc.take_ack(token) {
                let client_name = dc.client_name.clone();
                if let Some(net) = user.networks.iter_mut().find(|n| n.record.id == net_id) {
                    net.delivered.store_id(&target, &client_name, &id);
                }
            }
        }
        "USER" => {
            return Err(HandlerError::Irc(Message::new(
                numeric::ERR_ALREADYREGISTERED,
                vec![
                    user.downstreams[dc_idx].nick.clone(),
                    "You may not reregister".into(),
                ],
            )));
        }
        "CAP" => {
            let sub_cmd = msg
                .params
                .first()
                .ok_or_else(|| HandlerError::need_more_params("CAP"))?
                .to_ascii_uppercase();
            handle_registered_cap(user, dc_idx, &sub_cmd, &msg.params[1..])?;
        }
        "AUTHENTICATE" => {
            return Err(HandlerError::Irc(Message::new(
                numeric::ERR_SASLALREADY,
                vec![
                    user.downstreams[dc_idx].nick.clone(),
                    "You have already authenticated".into(),
                ],
            )));
        }
        "NICK" => {
            let nick = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("NICK"))?;

            let dc = &user.downstreams[dc_idx];
            let (target_net, nick) = if dc.network_id.is_none() {
                match nick.rsplit_once('/') {
                    Some((nick, net_name)) => {
                        let idx = user
                            .networks
                            .iter()
                            .position(|n| n.record.get_name() == net_name)
                            .ok_or_else(|| HandlerError::no_such_channel(&nick))?;
                        (Some(idx), nick.to_owned())
                    }
                    None => (None, nick),
                }
            } else {
                let idx = user
                    .networks
                    .iter()
                    .position(|n| Some(n.record.id) == dc.network_id);
                (idx, nick)
            };

            let user_id = user.record.id;
            for (idx, net) in user.networks.iter_mut().enumerate() {
                if target_net.map_or(false, |t| t != idx) {
                    continue;
                }
                net.record.nick = nick.clone();
                let mut record = net.record.clone();
                if let Err(e) = user.shared.db.store_network(user_id, &mut record).await {
                    warn!(error = %e, "failed to store network");
                }
                if let Some(uc) = &net.conn {
                    uc.send(Message::new("NICK", vec![nick.clone()]));
                }
            }
        }
        "JOIN" => {
            let names = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("JOIN"))?;
            let keys: Vec<&str> = msg
                .params
                .get(1)
                .map(|k| k.split(',').collect())
                .unwrap_or_default();

            for (i, name) in names.split(',').enumerate() {
                let dc = &user.downstreams[dc_idx];
                let (net_idx, upstream_name) = dc.unmarshal_entity(&user.networks, name)?;
                let key = keys.get(i).copied().unwrap_or("").to_owned();

                let net = &mut user.networks[net_idx];
                let net_id = net.record.id;
                if let Some(uc) = &net.conn {
                    let mut params = vec![upstream_name.clone()];
                    if !key.is_empty() {
                        params.push(key.clone());
                    }
                    uc.send(Message::new("JOIN", params));
                }

                let was_detached = match net.channels.get_mut(&upstream_name) {
                    Some(ch) => {
                        ch.key = key;
                        ch.detached
                    }
                    None => {
                        net.channels.insert(
                            &upstream_name,
                            db::Channel {
                                name: upstream_name.clone(),
                                key,
                                ..Default::default()
                            },
                        );
                        false
                    }
                };
                if was_detached {
                    network::attach(
                        net,
                        &user.downstreams,
                        store.as_ref(),
                        &hostname,
                        history_limit,
                        &upstream_name,
                    );
                }

                let mut ch = net.channels.get(&upstream_name).unwrap().clone();
                if let Err(e) = user.shared.db.store_channel(net_id, &mut ch).await {
                    warn!(channel = %upstream_name, error = %e, "failed to store channel");
                }
                net.channels.insert(&upstream_name, ch);
            }
        }
        "PART" => {
            let names = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("PART"))?;
            let reason = msg.params.get(1).cloned();

            for name in names.split(',') {
                let dc = &user.downstreams[dc_idx];
                let (net_idx, upstream_name) = dc.unmarshal_entity(&user.networks, name)?;
                let net = &mut user.networks[net_idx];
                let net_id = net.record.id;

                if reason.as_deref() == Some("detach") {
                    network::detach(net, &user.downstreams, store.as_ref(), &upstream_name);
                    if let Some(ch) = net.channels.get(&upstream_name) {
                        let mut ch = ch.clone();
                        if let Err(e) = user.shared.db.store_channel(net_id, &mut ch).await {
                            warn!(channel = %upstream_name, error = %e, "failed to store channel");
                        }
                        net.channels.insert(&upstream_name, ch);
                    }
                } else {
                    if let Some(uc) = &net.conn {
                        let mut params = vec![upstream_name.clone()];
                        if let Some(reason) = &reason {
                            params.push(reason.clone());
                        }
                        uc.send(Message::new("PART", params));
                    }
                    net.channels.remove(&upstream_name);
                    if let Err(e) = user.shared.db.delete_channel(net_id, &upstream_name).await {
                        warn!(channel = %upstream_name, error = %e, "failed to delete channel");
                    }
                }
            }
        }
        "KICK" => {
            let channels = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("KICK"))?;
            let users_param = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("KICK"))?;
            let reason = msg.params.get(2).cloned();

            let channels: Vec<&str> = channels.split(',').collect();
            let users: Vec<&str> = users_param.split(',').collect();
            let dc_nick = user.downstreams[dc_idx].nick.clone();
            if channels.len() != 1 && channels.len() != users.len() {
                return Err(HandlerError::Irc(Message::new(
                    numeric::ERR_BADCHANMASK,
                    vec![dc_nick, "Bad channel mask".into()],
                )));
            }

            for (i, kicked) in users.iter().enumerate() {
                let channel = if channels.len() == 1 {
                    channels[0]
                } else {
                    channels[i]
                };
                let dc = &user.downstreams[dc_idx];
                let (ch_net, upstream_channel) =
                    dc.unmarshal_entity(&user.networks, channel)?;
                let (user_net, upstream_user) = dc.unmarshal_entity(&user.networks, kicked)?;
                if ch_net != user_net {
                    return Err(HandlerError::Irc(Message::new(
                        numeric::ERR_USERNOTINCHANNEL,
                        vec![
                            dc.nick.clone(),
                            (*kicked).to_owned(),
                            channel.to_owned(),
                            "They are not on that channel".into(),
                        ],
                    )));
                }
                if let Some(uc) = &user.networks[ch_net].conn {
                    let mut params = vec![upstream_channel, upstream_user];
                    if let Some(reason) = &reason {
                        params.push(reason.clone());
                    }
                    uc.send(Message::new("KICK", params));
                }
            }
        }
        "MODE" => {
            handle_mode(user, dc_idx, &msg)?;
        }
        "TOPIC" => {
            let channel = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("TOPIC"))?;
            let dc = &user.downstreams[dc_idx];
            let (net_idx, upstream_name) = dc.unmarshal_entity(&user.networks, &channel)?;
            let net = &user.networks[net_idx];

            if let Some(topic) = msg.params.get(1) {
                if let Some(uc) = &net.conn {
                    uc.send(Message::new(
                        "TOPIC",
                        vec![upstream_name, topic.clone()],
                    ));
                }
            } else {
                let Some(ch) = net.conn.as_ref().and_then(|uc| uc.channels.get(&upstream_name))
                else {
                    return Err(HandlerError::no_such_channel(&channel));
                };
                send_topic(dc, net, ch, &hostname);
            }
        }
        "LIST" => {
            let dc = &user.downstreams[dc_idx];
            let dc_id = dc.id;
            let mut commands: HashMap<i64, Message> = HashMap::new();
            if let Some(mask_param) = msg.params.first() {
                let mut per_network: HashMap<i64, Vec<String>> = HashMap::new();
                for mask in mask_param.split(',') {
                    let (net_idx, upstream_name) =
                        dc.unmarshal_entity(&user.networks, mask)?;
                    per_network
                        .entry(user.networks[net_idx].record.id)
                        .or_default()
                        .push(upstream_name);
                }
                for (net_id, masks) in per_network {
                    commands.insert(net_id, Message::new("LIST", vec![masks.join(",")]));
                }
            } else {
                for net in user
                    .networks
                    .iter()
                    .filter(|n| dc.network_id.map_or(true, |id| id == n.record.id))
                {
                    if net.conn.is_some() {
                        commands.insert(net.record.id, Message::new("LIST", vec![]));
                    }
                }
            }

            if commands.is_empty() {
                let dc = &user.downstreams[dc_idx];
                dc.send(
                    Message::new(
                        numeric::RPL_LISTEND,
                        vec![dc.nick.clone(), "End of /LIST".into()],
                    )
                    .with_prefix(Prefix::ServerName(hostname)),
                );
                return Ok(());
            }
            upstream::queue_list(
                &mut user.networks,
                &mut user.pending_lists,
                dc_id,
                commands,
            );
        }
        "NAMES" => {
            let Some(channels) = msg.params.first().cloned() else {
                let dc = &user.downstreams[dc_idx];
                dc.send(
                    Message::new(
                        numeric::RPL_ENDOFNAMES,
                        vec![dc.nick.clone(), "*".into(), "End of /NAMES list".into()],
                    )
                    .with_prefix(Prefix::ServerName(hostname)),
                );
                return Ok(());
            };

            for channel in channels.split(',') {
                let dc = &user.downstreams[dc_idx];
                let (net_idx, upstream_name) =
                    dc.unmarshal_entity(&user.networks, channel)?;
                let net = &mut user.networks[net_idx];
                let cached = net
                    .conn
                    .as_ref()
                    .and_then(|uc| uc.channels.get(&upstream_name))
                    .map(|ch| ch.complete)
                    .unwrap_or(false);
                if cached {
                    let net = &user.networks[net_idx];
                    let uc = net.conn.as_ref().unwrap();
                    let ch = uc.channels.get(&upstream_name).unwrap();
                    send_names(dc, net, ch, &hostname);
                } else if let Some(uc) = net.conn.as_mut() {
                    uc.send_labeled(dc_id, Message::new("NAMES", vec![upstream_name]));
                }
            }
        }
        "WHO" => {
            let Some(mask) = msg.params.first().cloned() else {
                let dc = &user.downstreams[dc_idx];
                dc.send(
                    Message::new(
                        numeric::RPL_ENDOFWHO,
                        vec![dc.nick.clone(), "*".into(), "End of /WHO list".into()],
                    )
                    .with_prefix(Prefix::ServerName(hostname)),
                );
                return Ok(());
            };

            let dc = &user.downstreams[dc_idx];
            if mask == dc.nick {
                let prefix = Prefix::ServerName(hostname.clone());
                dc.send(
                    Message::new(
                        numeric::RPL_WHOREPLY,
                        vec![
                            dc.nick.clone(),
                            "*".into(),
                            dc.username.clone(),
                            dc.hostname.clone(),
                            hostname.clone(),
                            dc.nick.clone(),
                            "H".into(),
                            format!("0 {}", dc.realname),
                        ],
                    )
                    .with_prefix(prefix.clone()),
                );
                dc.send(
                    Message::new(
                        numeric::RPL_ENDOFWHO,
                        vec![dc.nick.clone(), dc.nick.clone(), "End of /WHO list".into()],
                    )
                    .with_prefix(prefix),
                );
                return Ok(());
            }

            let (net_idx, upstream_name) = dc.unmarshal_entity(&user.networks, &mask)?;
            let mut params = vec![upstream_name];
            if let Some(options) = msg.params.get(1) {
                params.push(options.clone());
            }
            if let Some(uc) = user.networks[net_idx].conn.as_mut() {
                uc.send_labeled(dc_id, Message::new("WHO", params));
            }
        }
        "WHOIS" => {
            if msg.params.is_empty() {
                return Err(HandlerError::Irc(Message::new(
                    numeric::ERR_NONICKNAMEGIVEN,
                    vec![
                        user.downstreams[dc_idx].nick.clone(),
                        "No nickname given".into(),
                    ],
                )));
            }
            let (target, mask) = if msg.params.len() == 1 {
                (None, msg.params[0].clone())
            } else {
                (Some(msg.params[0].clone()), msg.params[1].clone())
            };
            let mask = mask.split(',').next().unwrap_or("").to_owned();

            let dc = &user.downstreams[dc_idx];
            if mask == dc.nick {
                let prefix = Prefix::ServerName(hostname.clone());
                dc.send(
                    Message::new(
                        numeric::RPL_WHOISUSER,
                        vec![
                            dc.nick.clone(),
                            dc.nick.clone(),
                            dc.username.clone(),
                            dc.hostname.clone(),
                            "*".into(),
                            dc.realname.clone(),
                        ],
                    )
                    .with_prefix(prefix.clone()),
                );
                dc.send(
                    Message::new(
                        numeric::RPL_WHOISSERVER,
                        vec![
                            dc.nick.clone(),
                            dc.nick.clone(),
                            hostname.clone(),
                            "slbncd".into(),
                        ],
                    )
                    .with_prefix(prefix.clone()),
                );
                dc.send(
                    Message::new(
                        numeric::RPL_ENDOFWHOIS,
                        vec![dc.nick.clone(), dc.nick.clone(), "End of /WHOIS list".into()],
                    )
                    .with_prefix(prefix),
                );
                return Ok(());
            }

            let (net_idx, upstream_nick) = dc.unmarshal_entity(&user.networks, &mask)?;
            let params = match target {
                Some(target) => vec![target, upstream_nick],
                None => vec![upstream_nick],
            };
            if let Some(uc) = user.networks[net_idx].conn.as_mut() {
                uc.send_labeled(dc_id, Message::new("WHOIS", params));
            }
        }
        "PRIVMSG" | "NOTICE" | "TAGMSG" => {
            handle_chat_message(user, dc_idx, &msg).await?;
        }
        "INVITE" => {
            let invited = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("INVITE"))?;
            let channel = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("INVITE"))?;

            let dc = &user.downstreams[dc_idx];
            let (ch_net, upstream_channel) = dc.unmarshal_entity(&user.networks, &channel)?;
            let (user_net, upstream_user) = dc.unmarshal_entity(&user.networks, &invited)?;
            if ch_net != user_net {
                return Err(HandlerError::Irc(Message::new(
                    numeric::ERR_USERNOTINCHANNEL,
                    vec![
                        dc.nick.clone(),
                        invited,
                        channel,
                        "They are not on that channel".into(),
                    ],
                )));
            }
            if let Some(uc) = user.networks[ch_net].conn.as_mut() {
                uc.send_labeled(
                    dc_id,
                    Message::new("INVITE", vec![upstream_user, upstream_channel]),
                );
            }
        }
        "MONITOR" => {
            handle_monitor(user, dc_idx, &msg)?;
        }
        "CHATHISTORY" => {
            handle_chathistory(user, dc_idx, &msg)?;
        }
        "BOUNCER" => {
            let subcommand = msg
                .params
                .first()
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("BOUNCER"))?
                .to_ascii_uppercase();
            if subcommand == "LISTNETWORKS" {
                let dc = &user.downstreams[dc_idx];
                for net in &user.networks {
                    let attrs = user::network_attrs(net);
                    dc.send(
                        Message::new(
                            "BOUNCER",
                            vec![
                                "NETWORK".into(),
                                net.record.id.to_string(),
                                user::format_attrs(&attrs),
                            ],
                        )
                        .with_prefix(Prefix::ServerName(hostname.clone())),
                    );
                }
            } else {
                return Err(HandlerError::unknown_command("BOUNCER"));
            }
        }
        _ => {
            debug!(command = %msg.command, "unhandled downstream message");
            return Err(HandlerError::unknown_command(&msg.command));
        }
    }
    Ok(())
}

fn handle_registered_cap(
    user: &mut User,
    dc_idx: usize,
    cmd: &str,
    args: &[String],
) -> Result<(), HandlerError> {
    let hostname = user.shared.hostname.clone();
    let dc = &mut user.downstreams[dc_idx];
    let reply_to = dc.nick.clone();
    match cmd {
        "LS" => {
            let mut caps: Vec<String> = PERMANENT_DOWNSTREAM_CAPS
                .iter()
                .map(|(name, value)| {
                    if dc.cap_version >= 302 && !value.is_empty() {
                        format!("{}={}", name, value)
                    } else {
                        (*name).to_owned()
                    }
                })
                .collect();
            for &cap in NEED_ALL_UPSTREAM_CAPS {
                if dc.caps.is_available(cap) {
                    caps.push(cap.to_owned());
                }
            }
            dc.send(
                Message::new("CAP", vec![reply_to, "LS".into(), caps.join(" ")])
                    .with_prefix(Prefix::ServerName(hostname)),
            );
        }
        "LIST" => {
            let enabled: Vec<String> = dc.caps.enabled().map(str::to_owned).collect();
            dc.send(
                Message::new("CAP", vec![reply_to, "LIST".into(), enabled.join(" ")])
                    .with_prefix(Prefix::ServerName(hostname)),
            );
        }
        "REQ" => {
            let Some(requested) = args.first() else {
                return Err(HandlerError::Irc(Message::new(
                    numeric::ERR_INVALIDCAPCMD,
                    vec![
                        reply_to,
                        cmd.to_owned(),
                        "Missing argument in CAP REQ command".into(),
                    ],
                )));
            };
            let mut ack = true;
            let mut changes = Vec::new();
            for name in requested.split_whitespace() {
                let (name, enable) = match name.strip_prefix('-') {
                    Some(name) => (name.to_ascii_lowercase(), false),
                    None => (name.to_ascii_lowercase(), true),
                };
                let known = PERMANENT_DOWNSTREAM_CAPS.iter().any(|(n, _)| *n == name)
                    || dc.caps.is_available(&name);
                if !known || (name == "cap-notify" && dc.cap_version >= 302 && !enable) {
                    ack = false;
                    break;
                }
                changes.push((name, enable));
            }
            if ack {
                for (name, enable) in changes {
                    dc.caps.set_enabled(&name, enable);
                }
            }
            let reply = if ack { "ACK" } else { "NAK" };
            dc.send(
                Message::new(
                    "CAP",
                    vec![dc.nick.clone(), reply.into(), requested.clone()],
                )
                .with_prefix(Prefix::ServerName(hostname)),
            );
        }
        "END" => {}
        _ => {
            return Err(HandlerError::Irc(Message::new(
                numeric::ERR_INVALIDCAPCMD,
                vec![reply_to, cmd.to_owned(), "Unknown CAP command".into()],
            )));
        }
    }
    Ok(())
}

fn handle_mode(user: &mut User, dc_idx: usize, msg: &Message) -> Result<(), HandlerError> {
    let hostname = user.shared.hostname.clone();
    let name = msg
        .params
        .first()
        .cloned()
        .ok_or_else(|| HandlerError::need_more_params("MODE"))?;
    let mode_str = msg.params.get(1).cloned();

    let dc = &user.downstreams[dc_idx];
    if name == dc.nick {
        match mode_str {
            Some(mode_str) => {
                for net in user
                    .networks
                    .iter()
                    .filter(|n| dc.network_id.map_or(true, |id| id == n.record.id))
                {
                    if let Some(uc) = &net.conn {
                        uc.send(Message::new(
                            "MODE",
                            vec![uc.nick.clone(), mode_str.clone()],
                        ));
                    }
                }
            }
            None => {
                let modes = dc
                    .network_id
                    .and_then(|id| user.networks.iter().find(|n| n.record.id == id))
                    .and_then(|net| net.conn.as_ref())
                    .map(|uc| uc.modes.to_string())
                    .unwrap_or_default();
                dc.send(
                    Message::new(numeric::RPL_UMODEIS, vec![dc.nick.clone(), modes])
                        .with_prefix(Prefix::ServerName(hostname)),
                );
            }
        }
        return Ok(());
    }

    let (net_idx, upstream_name) = dc.unmarshal_entity(&user.networks, &name)?;
    let net = &user.networks[net_idx];
    let is_channel = net
        .conn
        .as_ref()
        .map(|uc| uc.is_channel(&upstream_name))
        .unwrap_or_else(|| upstream_name.starts_with(['#', '&', '+', '!']));
    if !is_channel {
        return Err(HandlerError::Irc(Message::new(
            numeric::ERR_USERSDONTMATCH,
            vec![
                dc.nick.clone(),
                "Cannot change mode for other users".into(),
            ],
        )));
    }

    match mode_str {
        Some(mode_str) => {
            if let Some(uc) = &net.conn {
                let mut params = vec![upstream_name, mode_str];
                params.extend(msg.params.get(2..).unwrap_or_default().iter().cloned());
                uc.send(Message::new("MODE", params));
            }
        }
        None => {
            let Some(ch) = net.conn.as_ref().and_then(|uc| uc.channels.get(&upstream_name))
            else {
                return Err(HandlerError::no_such_channel(&name));
            };
            let Some(modes) = &ch.modes else {
                // The initial RPL_CHANNELMODEIS has not arrived yet; it
                // will be broadcast when it does.
                return Ok(());
            };
            let (mode_str, mode_params) = slbnc_proto::mode::format_channel_modes(modes);
            let mut params = vec![dc.nick.clone(), name.clone(), mode_str];
            params.extend(mode_params);
            dc.send(
                Message::new(numeric::RPL_CHANNELMODEIS, params)
                    .with_prefix(Prefix::ServerName(hostname.clone())),
            );
            if !ch.creation_time.is_empty() {
                dc.send(
                    Message::new(
                        numeric::RPL_CREATIONTIME,
                        vec![dc.nick.clone(), name, ch.creation_time.clone()],
                    )
                    .with_prefix(Prefix::ServerName(hostname)),
                );
            }
        }
    }
    Ok(())
}

async fn handle_chat_message(
    user: &mut User,
    dc_idx: usize,
    msg: &Message,
) -> Result<(), HandlerError> {
    let command = msg.command.clone();
    let targets = msg
        .params
        .first()
        .cloned()
        .ok_or_else(|| HandlerError::need_more_params(&command))?;
    let text = if command == "TAGMSG" {
        None
    } else {
        Some(
            msg.params
                .get(1)
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params(&command))?,
        )
    };

    let store = user.msg_store.clone();
    for target in targets.split(',') {
        if target == SERVICE_NICK {
            if command == "PRIVMSG" {
                let text = text.clone().unwrap_or_default();
                crate::service::handle_message(user, dc_idx, &text).await;
            }
            continue;
        }

        let dc = &user.downstreams[dc_idx];
        let dc_id = dc.id;
        let (net_idx, upstream_name) = dc.unmarshal_entity(&user.networks, target)?;

        if command == "PRIVMSG" && upstream_name.eq_ignore_ascii_case("NickServ") {
            let text = text.clone().unwrap_or_default();
            let nick = user.networks[net_idx]
                .conn
                .as_ref()
                .map(|uc| uc.nick.clone())
                .unwrap_or_default();
            if let Some((username, password)) = parse_nickserv_credentials(&text, &nick) {
                user.networks[net_idx]
                    .auto_save_sasl_plain(&username, &password)
                    .await;
            }
        }

        let net = &mut user.networks[net_idx];
        let Some(uc) = net.conn.as_ref() else {
            continue;
        };

        let mut upstream_msg = Message::new(command.clone(), vec![upstream_name.clone()]);
        if let Some(text) = &text {
            upstream_msg.params.push(text.clone());
        }
        upstream_msg.tags = msg.client_tags();

        if command == "TAGMSG" && !uc.caps.is_enabled("message-tags") {
            continue;
        }
        uc.send(upstream_msg.clone());

        // Self-echo: record the outgoing message and deliver it to the
        // user's other clients.
        let mut echo = upstream_msg.clone();
        echo.prefix = Some(Prefix::new(
            uc.nick.clone(),
            uc.username.clone(),
            String::new(),
        ));
        echo.set_tag("time", Some(format_server_time(Utc::now())));
        upstream::produce(
            net,
            &mut user.downstreams,
            store.as_ref(),
            &upstream_name,
            &echo,
            Some(dc_id),
        );
    }
    Ok(())
}

fn handle_monitor(user: &mut User, dc_idx: usize, msg: &Message) -> Result<(), HandlerError> {
    let dc = &user.downstreams[dc_idx];
    let Some(net_id) = dc.network_id else {
        // MONITOR is only available on single-network connections.
        return Err(HandlerError::unknown_command("MONITOR"));
    };
    let subcommand = msg
        .params
        .first()
        .cloned()
        .ok_or_else(|| HandlerError::need_more_params("MONITOR"))?
        .to_ascii_uppercase();

    let dc = &mut user.downstreams[dc_idx];
    match subcommand.as_str() {
        "+" | "-" => {
            let targets = msg
                .params
                .get(1)
                .cloned()
                .ok_or_else(|| HandlerError::need_more_params("MONITOR"))?;
            for target in targets.split(',').filter(|t| !t.is_empty()) {
                if subcommand == "+" {
                    dc.monitored.insert(target, true);
                } else {
                    dc.monitored.remove(target);
                }
            }
        }
        "C" => dc.monitored.clear(),
        "L" | "S" => {}
        _ => return Err(HandlerError::unknown_command("MONITOR")),
    }

    let wanted: Vec<String> = user
        .downstreams
        .iter()
        .filter(|dc| dc.network_id == Some(net_id))
        .flat_map(|dc| dc.monitored.iter().map(|(nick, _)| nick.to_owned()))
        .collect();
    if let Some(net) = user.networks.iter_mut().find(|n| n.record.id == net_id) {
        if let Some(uc) = net.conn.as_mut() {
            uc.update_monitor(wanted.iter().map(String::as_str));
        }
    }
    Ok(())
}

fn handle_chathistory(user: &mut User, dc_idx: usize, msg: &Message) -> Result<(), HandlerError> {
    let hostname = user.shared.hostname.clone();
    let store = user.msg_store.clone();
    let max_limit = user.shared.config.history.limit;

    let subcommand = msg
        .params
        .first()
        .cloned()
        .ok_or_else(|| HandlerError::need_more_params("CHATHISTORY"))?
        .to_ascii_uppercase();
    let target = msg
        .params
        .get(1)
        .cloned()
        .ok_or_else(|| HandlerError::need_more_params("CHATHISTORY"))?;

    let parse_bound = |param: &str| -> Option<chrono::DateTime<Utc>> {
        let (kind, value) = param.split_once('=')?;
        if kind != "timestamp" {
            return None;
        }
        parse_server_time(value)
    };

    let dc = &user.downstreams[dc_idx];
    let (net_idx, upstream_name) = dc.unmarshal_entity(&user.networks, &target)?;
    let net = &user.networks[net_idx];
    let target_cm = net.casemap.canonical(&upstream_name);

    let limit_at = |i: usize| -> usize {
        msg.params
            .get(i)
            .and_then(|l| l.parse::<usize>().ok())
            .unwrap_or(max_limit)
            .min(max_limit)
    };

    let messages = match subcommand.as_str() {
        "BEFORE" => {
            let bound = msg
                .params
                .get(2)
                .and_then(|p| parse_bound(p))
                .ok_or_else(|| HandlerError::need_more_params("CHATHISTORY"))?;
            store.load_before_time(&net.record, &target_cm, bound, limit_at(3))
        }
        "AFTER" => {
            let bound = msg
                .params
                .get(2)
                .and_then(|p| parse_bound(p))
                .ok_or_else(|| HandlerError::need_more_params("CHATHISTORY"))?;
            store.load_between_time(
                &net.record,
                &target_cm,
                bound,
                chrono::DateTime::<Utc>::MAX_UTC,
                limit_at(3),
            )
        }
        "BETWEEN" => {
            let start = msg
                .params
                .get(2)
                .and_then(|p| parse_bound(p))
                .ok_or_else(|| HandlerError::need_more_params("CHATHISTORY"))?;
            let end = msg
                .params
                .get(3)
                .and_then(|p| parse_bound(p))
                .ok_or_else(|| HandlerError::need_more_params("CHATHISTORY"))?;
            store.load_between_time(&net.record, &target_cm, start, end, limit_at(4))
        }
        _ => return Err(HandlerError::unknown_command("CHATHISTORY")),
    };

    let messages = match messages {
        Ok(messages) => messages,
        Err(e) => {
            warn!(target = %target, error = %e, "failed to load history");
            return Ok(());
        }
    };

    let batch_ref = format!("history-{}", dc.id);
    dc.send(
        Message::new(
            "BATCH",
            vec![
                format!("+{}", batch_ref),
                "chathistory".into(),
                target.clone(),
            ],
        )
        .with_prefix(Prefix::ServerName(hostname.clone())),
    );
    for stored in messages {
        let mut out = dc.marshal_message(net, &stored);
        out.set_tag("batch", Some(batch_ref.clone()));
        dc.send(out);
    }
    dc.send(
        Message::new("BATCH", vec![format!("-{}", batch_ref)])
            .with_prefix(Prefix::ServerName(hostname)),
    );
    Ok(())
}

/// Recognize NickServ credential commands worth auto-saving.
fn parse_nickserv_credentials(text: &str, nick: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() < 2 {
        return None;
    }
    let cmd = fields[0].to_ascii_uppercase();
    let params = &fields[1..];
    match cmd.as_str() {
        "REGISTER" => Some((nick.to_owned(), params[0].to_owned())),
        "IDENTIFY" => {
            if params.len() == 1 {
                Some((nick.to_owned(), params[0].to_owned()))
            } else {
                Some((params[0].to_owned(), params[1].to_owned()))
            }
        }
        "SET" => {
            if params.len() >= 2 && params[0].eq_ignore_ascii_case("PASSWORD") {
                Some((nick.to_owned(), params[1].to_owned()))
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_grammar() {
        assert_eq!(
            unmarshal_username("alice"),
            ("alice".into(), "".into(), "".into())
        );
        assert_eq!(
            unmarshal_username("alice/libera"),
            ("alice".into(), "".into(), "libera".into())
        );
        assert_eq!(
            unmarshal_username("alice@laptop"),
            ("alice".into(), "laptop".into(), "".into())
        );
        assert_eq!(
            unmarshal_username("alice/libera@laptop"),
            ("alice".into(), "laptop".into(), "libera".into())
        );
        assert_eq!(
            unmarshal_username("alice@laptop/libera"),
            ("alice".into(), "laptop".into(), "libera".into())
        );
    }

    #[test]
    fn nickserv_credentials() {
        assert_eq!(
            parse_nickserv_credentials("REGISTER hunter2", "alice"),
            Some(("alice".into(), "hunter2".into()))
        );
        assert_eq!(
            parse_nickserv_credentials("identify hunter2", "alice"),
            Some(("alice".into(), "hunter2".into()))
        );
        assert_eq!(
            parse_nickserv_credentials("IDENTIFY bob hunter2", "alice"),
            Some(("bob".into(), "hunter2".into()))
        );
        assert_eq!(
            parse_nickserv_credentials("SET PASSWORD hunter2", "alice"),
            Some(("alice".into(), "hunter2".into()))
        );
        assert_eq!(parse_nickserv_credentials("HELP", "alice"), None);
        assert_eq!(parse_nickserv_credentials("SET EMAIL x", "alice"), None);
    }
}
