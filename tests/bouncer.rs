//! End-to-end tests of the per-user multiplexer: upstream and downstream
//! handlers driven directly, with fake connections backed by channels.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use slbnc_proto::{Casemap, MembershipSet, Message};

use slbncd::config::{Config, DatabaseConfig, HistoryConfig, ListenConfig, ServerConfig, UpstreamConfig};
use slbncd::db;
use slbncd::downstream::{self, DownstreamConn, Registration};
use slbncd::identd::Identd;
use slbncd::msgstore::{MemoryStore, MessageStore};
use slbncd::network::Network;
use slbncd::server::Shared;
use slbncd::upstream::{self, UpstreamConn};
use slbncd::user::{Event, User};

struct TestBouncer {
    user: User,
    events_rx: mpsc::Receiver<Event>,
    shared: Arc<Shared>,
}

struct FakeDownstream {
    dc: DownstreamConn,
    out: mpsc::UnboundedReceiver<Message>,
}

async fn shared() -> Arc<Shared> {
    let config = Config {
        server: ServerConfig {
            hostname: "bouncer.test".into(),
        },
        listen: ListenConfig {
            address: "127.0.0.1:0".into(),
        },
        database: DatabaseConfig {
            path: ":memory:".into(),
        },
        history: HistoryConfig::default(),
        upstream: UpstreamConfig::default(),
    };
    let db = db::Database::new(":memory:").await.unwrap();
    Arc::new(Shared {
        hostname: config.server.hostname.clone(),
        config,
        db,
        identd: Identd::new(),
    })
}

async fn bouncer() -> TestBouncer {
    let shared = shared().await;
    let mut record = db::User {
        username: "alice".into(),
        password: bcrypt::hash("hunter2", 4).unwrap(),
        nick: "alice".into(),
        realname: "Alice".into(),
        enabled: true,
        ..Default::default()
    };
    shared.db.store_user(&mut record).await.unwrap();

    let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
    let (user, _events_tx, events_rx) = User::new(record, shared.clone(), store);
    TestBouncer {
        user,
        events_rx,
        shared,
    }
}

/// Add a network with a fake, already-registered upstream connection.
async fn add_network(
    tb: &mut TestBouncer,
    name: &str,
    nick: &str,
) -> (i64, mpsc::UnboundedReceiver<Message>) {
    let mut record = db::Network {
        name: name.into(),
        addr: format!("ircs://irc.{}.test", name),
        nick: nick.into(),
        enabled: true,
        ..Default::default()
    };
    tb.shared
        .db
        .store_network(tb.user.record.id, &mut record)
        .await
        .unwrap();

    let mut net = Network::new(
        record.clone(),
        Vec::new(),
        tb.shared.clone(),
        tb.user.record.id,
    );
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let mut uc = UpstreamConn::new(
        &record,
        &tb.user.record,
        tb.user.events_tx.clone(),
        out_tx,
        "remote".into(),
        "local".into(),
    );
    uc.registered = true;
    uc.nick = nick.into();
    net.conn = Some(uc);
    tb.user.networks.push(net);
    (record.id, out_rx)
}

/// Register a downstream through the real registration machine.
async fn connect_downstream(tb: &TestBouncer, id: u64, raw_username: &str) -> FakeDownstream {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (closed_tx, _) = watch::channel(false);
    let mut reg = Registration::new(id, "127.0.0.1".into(), out_tx, closed_tx);

    let msgs = [
        "PASS hunter2".to_owned(),
        "NICK alice".to_owned(),
        format!("USER {} 0 * :Alice", raw_username),
    ];
    let mut registered = None;
    for raw in msgs {
        let msg: Message = raw.parse().unwrap();
        if let Some(done) = reg.handle_message(&tb.shared, &msg).await.unwrap() {
            registered = Some(done);
        }
    }
    FakeDownstream {
        dc: registered.expect("registration did not complete").dc,
        out: out_rx,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn join_channel(tb: &mut TestBouncer, net_id: i64, name: &str, members: &[(&str, &str)]) {
    let net = tb
        .user
        .networks
        .iter_mut()
        .find(|n| n.record.id == net_id)
        .unwrap();
    let uc = net.conn.as_mut().unwrap();
    let casemap = uc.casemap();
    let available = uc.isupport.memberships.clone();
    let mut ch = upstream::UpstreamChannel::new(name, casemap);
    for (nick, prefixes) in members {
        let mut set = MembershipSet::new();
        for p in prefixes.chars() {
            let m = available.iter().find(|m| m.prefix == p).unwrap();
            set.add(&available, *m);
        }
        ch.members.insert(nick, set);
    }
    ch.complete = true;
    uc.channels.insert(name, ch);
}

#[tokio::test]
async fn nick_rename_preserves_memberships() {
    let mut tb = bouncer().await;
    let (net_id, _up_out) = add_network(&mut tb, "libera", "alice").await;
    join_channel(&mut tb, net_id, "#x", &[("alice", "@"), ("carol", "+")]);

    let mut dc = connect_downstream(&tb, 1, "alice/libera").await;
    downstream::welcome(&mut tb.user, &mut dc.dc).await.unwrap();
    drain(&mut dc.out);
    tb.user.downstreams.push(dc.dc);

    let msg: Message = ":alice!u@h NICK bob".parse().unwrap();
    upstream::handle_message(&mut tb.user, net_id, msg)
        .await
        .unwrap();

    let net = &tb.user.networks[0];
    let uc = net.conn.as_ref().unwrap();
    assert_eq!(uc.nick, "bob");
    let ch = uc.channels.get("#x").unwrap();
    assert!(ch.members.get("alice").is_none());
    assert_eq!(ch.members.get("bob").unwrap().prefixes(), "@");
    assert_eq!(ch.members.get("carol").unwrap().prefixes(), "+");

    // The bound client is renamed too.
    let nick_msgs: Vec<Message> = drain(&mut dc.out)
        .into_iter()
        .filter(|m| m.command == "NICK")
        .collect();
    assert_eq!(nick_msgs.len(), 1);
    assert_eq!(nick_msgs[0].params, ["bob"]);
    assert_eq!(nick_msgs[0].prefix.as_ref().unwrap().nick(), Some("alice"));
}

#[tokio::test(start_paused = true)]
async fn detach_after_inactivity_snapshots_backlog_floor() {
    // Database setup runs on real time; only the detach timer needs the
    // paused clock.
    tokio::time::resume();
    let mut tb = bouncer().await;
    let (net_id, _up_out) = add_network(&mut tb, "libera", "alice").await;
    tokio::time::pause();
    join_channel(&mut tb, net_id, "#dev", &[("alice", ""), ("carol", "")]);

    {
        let net = &mut tb.user.networks[0];
        net.channels.insert(
            "#dev",
            db::Channel {
                name: "#dev".into(),
                detach_after: Duration::from_secs(30),
                ..Default::default()
            },
        );
    }

    let msg: Message = ":carol!u@h PRIVMSG #dev :hi there".parse().unwrap();
    upstream::handle_message(&mut tb.user, net_id, msg)
        .await
        .unwrap();

    // The auto-detach timer fires 30 seconds later.
    let event = tokio::time::timeout(Duration::from_secs(60), tb.events_rx.recv())
        .await
        .expect("timer did not fire")
        .unwrap();
    let Event::ChannelDetach { net_id: ev_net, name } = event else {
        panic!("expected a channel detach event");
    };
    assert_eq!(ev_net, net_id);
    assert_eq!(name, "#dev");

    let last_id = {
        let net = &tb.user.networks[0];
        tb.user
            .msg_store
            .last_msg_id(&net.record, &net.casemap.canonical("#dev"))
            .unwrap()
            .expect("message was logged")
    };
    let store = tb.user.msg_store.clone();
    let net = &mut tb.user.networks[0];
    slbncd::network::detach(net, &tb.user.downstreams, store.as_ref(), &name);

    let ch = net.channels.get("#dev").unwrap();
    assert!(ch.detached);
    assert_eq!(ch.detached_internal_msg_id, last_id);
}

#[tokio::test]
async fn detached_channels_record_but_do_not_forward() {
    let mut tb = bouncer().await;
    let (net_id, _up_out) = add_network(&mut tb, "libera", "alice").await;
    join_channel(&mut tb, net_id, "#dev", &[("alice", ""), ("carol", "")]);
    tb.user.networks[0].channels.insert(
        "#dev",
        db::Channel {
            name: "#dev".into(),
            detached: true,
            ..Default::default()
        },
    );

    let mut dc = connect_downstream(&tb, 1, "alice/libera").await;
    downstream::welcome(&mut tb.user, &mut dc.dc).await.unwrap();
    drain(&mut dc.out);
    tb.user.downstreams.push(dc.dc);

    let msg: Message = ":carol!u@h PRIVMSG #dev :nothing urgent".parse().unwrap();
    upstream::handle_message(&mut tb.user, net_id, msg)
        .await
        .unwrap();

    let forwarded = drain(&mut dc.out);
    assert!(
        forwarded.iter().all(|m| m.command != "PRIVMSG"),
        "detached channel must not forward PRIVMSG"
    );

    // The message is still recorded.
    let net = &tb.user.networks[0];
    assert!(tb
        .user
        .msg_store
        .last_msg_id(&net.record, &net.casemap.canonical("#dev"))
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn list_fan_in_merges_upstream_replies() {
    let mut tb = bouncer().await;
    let (n1, mut up1) = add_network(&mut tb, "freenode", "alice").await;
    let (n2, mut up2) = add_network(&mut tb, "oftc", "alice").await;

    let mut dc = connect_downstream(&tb, 1, "alice").await;
    downstream::welcome(&mut tb.user, &mut dc.dc).await.unwrap();
    drain(&mut dc.out);
    tb.user.downstreams.push(dc.dc);

    downstream::handle_message(&mut tb.user, 1, "LIST".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(drain(&mut up1).iter().filter(|m| m.command == "LIST").count(), 1);
    assert_eq!(drain(&mut up2).iter().filter(|m| m.command == "LIST").count(), 1);

    // A second LIST is queued until the first fan-out completes.
    downstream::handle_message(&mut tb.user, 1, "LIST".parse().unwrap())
        .await
        .unwrap();
    assert!(drain(&mut up1).is_empty());
    assert!(drain(&mut up2).is_empty());

    for (net_id, chan) in [(n1, "#a"), (n1, "#b"), (n1, "#c"), (n2, "#d"), (n2, "#e"), (n2, "#f")]
    {
        let msg: Message = format!(":server 322 alice {} 3 :topic", chan).parse().unwrap();
        upstream::handle_message(&mut tb.user, net_id, msg)
            .await
            .unwrap();
    }
    upstream::handle_message(&mut tb.user, n1, ":server 323 alice :End of /LIST".parse().unwrap())
        .await
        .unwrap();
    upstream::handle_message(&mut tb.user, n2, ":server 323 alice :End of /LIST".parse().unwrap())
        .await
        .unwrap();

    let received = drain(&mut dc.out);
    let lists = received.iter().filter(|m| m.command == "322").count();
    let ends = received.iter().filter(|m| m.command == "323").count();
    assert_eq!(lists, 6);
    assert_eq!(ends, 1, "exactly one synthesized RPL_LISTEND");

    // The queued second LIST goes out now.
    assert_eq!(drain(&mut up1).iter().filter(|m| m.command == "LIST").count(), 1);
    assert_eq!(drain(&mut up2).iter().filter(|m| m.command == "LIST").count(), 1);
}

#[tokio::test]
async fn multi_network_entity_marshaling() {
    let mut tb = bouncer().await;
    let (_n1, _up1) = add_network(&mut tb, "freenode", "alice").await;
    let (n2, _up2) = add_network(&mut tb, "oftc", "alice").await;
    join_channel(&mut tb, n2, "#go", &[("alice", ""), ("alice2", "")]);

    let mut dc = connect_downstream(&tb, 1, "alice").await;
    downstream::welcome(&mut tb.user, &mut dc.dc).await.unwrap();
    drain(&mut dc.out);
    tb.user.downstreams.push(dc.dc);

    let msg: Message = ":alice2!u@h PRIVMSG #go :hi".parse().unwrap();
    upstream::handle_message(&mut tb.user, n2, msg).await.unwrap();

    let received = drain(&mut dc.out);
    let privmsg = received
        .iter()
        .find(|m| m.command == "PRIVMSG")
        .expect("message forwarded");
    assert_eq!(privmsg.prefix.as_ref().unwrap().nick(), Some("alice2/oftc"));
    assert_eq!(privmsg.params, ["#go/oftc", "hi"]);
}

#[tokio::test]
async fn marshal_unmarshal_roundtrip() {
    let mut tb = bouncer().await;
    let (n1, _up1) = add_network(&mut tb, "oftc", "alice").await;

    let dc = connect_downstream(&tb, 1, "alice").await;
    let marshaled = dc.dc.marshal_entity(&tb.user.networks[0], "#go");
    assert_eq!(marshaled, "#go/oftc");
    let (idx, name) = dc
        .dc
        .unmarshal_entity(&tb.user.networks, &marshaled)
        .unwrap();
    assert_eq!(tb.user.networks[idx].record.id, n1);
    assert_eq!(name, "#go");

    assert!(dc.dc.unmarshal_entity(&tb.user.networks, "#go").is_err());
    assert!(dc
        .dc
        .unmarshal_entity(&tb.user.networks, "#go/unknown")
        .is_err());
}

#[tokio::test]
async fn auto_away_follows_downstream_count() {
    let mut tb = bouncer().await;

    // Wire the network in memory only, so the spawned run loop does not
    // find (and re-dial) a persisted record.
    let record = db::Network {
        id: 1,
        name: "libera".into(),
        addr: "ircs://irc.libera.test".into(),
        nick: "alice".into(),
        enabled: true,
        ..Default::default()
    };
    let mut net = Network::new(
        record.clone(),
        Vec::new(),
        tb.shared.clone(),
        tb.user.record.id,
    );
    let (out_tx, mut up_out) = mpsc::unbounded_channel();
    let mut uc = UpstreamConn::new(
        &record,
        &tb.user.record,
        tb.user.events_tx.clone(),
        out_tx,
        "remote".into(),
        "local".into(),
    );
    uc.registered = true;
    uc.nick = "alice".into();
    net.conn = Some(uc);
    tb.user.networks.push(net);

    let user_events = tb.user.events_tx.clone();
    tokio::spawn(tb.user.run(tb.events_rx));

    let mut dc = connect_downstream_shared(&tb.shared, 1, "alice/libera").await;
    user_events
        .send(Event::DownstreamConnected {
            dc: Box::new(dc.dc),
        })
        .await
        .unwrap();
    // Welcome burst arrives, proving the connection is attached.
    wait_for(&mut dc.out, |m| m.command == "001").await;
    drain(&mut up_out);

    user_events
        .send(Event::DownstreamDisconnected { id: 1 })
        .await
        .unwrap();
    let away = wait_for(&mut up_out, |m| m.command == "AWAY").await;
    assert_eq!(away.params, ["Auto away"]);

    let dc2 = connect_downstream_shared(&tb.shared, 2, "alice/libera").await;
    user_events
        .send(Event::DownstreamConnected {
            dc: Box::new(dc2.dc),
        })
        .await
        .unwrap();
    let back = wait_for(&mut up_out, |m| m.command == "AWAY").await;
    assert!(back.params.is_empty(), "returning client clears AWAY");
}

/// Like `connect_downstream` but without borrowing the whole bouncer.
async fn connect_downstream_shared(
    shared: &Arc<Shared>,
    id: u64,
    raw_username: &str,
) -> FakeDownstream {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (closed_tx, _) = watch::channel(false);
    let mut reg = Registration::new(id, "127.0.0.1".into(), out_tx, closed_tx);
    let msgs = [
        "PASS hunter2".to_owned(),
        "NICK alice".to_owned(),
        format!("USER {} 0 * :Alice", raw_username),
    ];
    let mut registered = None;
    for raw in msgs {
        let msg: Message = raw.parse().unwrap();
        if let Some(done) = reg.handle_message(shared, &msg).await.unwrap() {
            registered = Some(done);
        }
    }
    FakeDownstream {
        dc: registered.expect("registration did not complete").dc,
        out: out_rx,
    }
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<Message>,
    mut pred: impl FnMut(&Message) -> bool,
) -> Message {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = rx.recv().await.expect("channel closed");
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("expected message did not arrive")
}

#[tokio::test]
async fn delivery_receipt_via_msgid_ping() {
    let mut tb = bouncer().await;
    let (net_id, _up_out) = add_network(&mut tb, "libera", "alice").await;
    join_channel(&mut tb, net_id, "#x", &[("alice", ""), ("carol", "")]);

    let mut dc = connect_downstream(&tb, 1, "alice/libera@laptop").await;
    downstream::welcome(&mut tb.user, &mut dc.dc).await.unwrap();
    drain(&mut dc.out);
    tb.user.downstreams.push(dc.dc);

    let msg: Message = ":carol!u@h PRIVMSG #x :ping me".parse().unwrap();
    upstream::handle_message(&mut tb.user, net_id, msg)
        .await
        .unwrap();

    let received = drain(&mut dc.out);
    let ping = received
        .iter()
        .find(|m| m.command == "PING")
        .expect("delivery confirmation PING");
    let token = ping.params[0].clone();
    assert!(token.starts_with("soju-msgid-"));
    let msg_id = token.trim_start_matches("soju-msgid-").to_owned();

    // Before the PONG, nothing is recorded.
    assert_eq!(
        tb.user.networks[0].delivered.load_id("#x", "laptop"),
        None
    );

    downstream::handle_message(&mut tb.user, 1, format!("PONG {}", token).parse().unwrap())
        .await
        .unwrap();
    assert_eq!(
        tb.user.networks[0].delivered.load_id("#x", "laptop"),
        Some(msg_id.as_str())
    );
}

#[tokio::test]
async fn backlog_replay_on_reconnect() {
    let mut tb = bouncer().await;
    let (net_id, _up_out) = add_network(&mut tb, "libera", "alice").await;
    join_channel(&mut tb, net_id, "#x", &[("alice", ""), ("carol", "")]);

    // Two messages arrive; the first is acked by a previous session.
    for text in ["one", "two"] {
        let msg: Message = format!(":carol!u@h PRIVMSG #x :{}", text).parse().unwrap();
        upstream::handle_message(&mut tb.user, net_id, msg)
            .await
            .unwrap();
    }
    tb.user.networks[0].delivered.store_id("#x", "laptop", "m1");

    let mut dc = connect_downstream(&tb, 1, "alice/libera@laptop").await;
    dc.dc.caps.set_enabled("batch", true);
    downstream::welcome(&mut tb.user, &mut dc.dc).await.unwrap();

    let received = drain(&mut dc.out);
    let replayed: Vec<&Message> = received
        .iter()
        .filter(|m| m.command == "PRIVMSG")
        .collect();
    assert_eq!(replayed.len(), 1, "only the unacked message is replayed");
    assert_eq!(replayed[0].params[1], "two");
    assert!(
        received
            .iter()
            .any(|m| m.command == "BATCH" && m.params.len() >= 2 && m.params[1] == "chathistory"),
        "backlog is wrapped in a chathistory batch"
    );

    // The pointer is fast-forwarded to the store head.
    assert_eq!(
        tb.user.networks[0].delivered.load_id("#x", "laptop"),
        Some("m2")
    );
}

#[tokio::test]
async fn casemap_switch_rehashes_network_state() {
    let mut tb = bouncer().await;
    let (net_id, _up_out) = add_network(&mut tb, "libera", "alice").await;
    join_channel(&mut tb, net_id, "#X[1]", &[("alice", "")]);
    tb.user.networks[0]
        .delivered
        .store_id("#X[1]", "laptop", "m1");

    let msg: Message = ":server 005 alice CASEMAPPING=ascii :are supported"
        .parse()
        .unwrap();
    upstream::handle_message(&mut tb.user, net_id, msg)
        .await
        .unwrap();

    let net = &tb.user.networks[0];
    assert_eq!(net.casemap, Casemap::Ascii);
    let uc = net.conn.as_ref().unwrap();
    assert!(uc.channels.get("#x[1]").is_some());
    assert!(
        uc.channels.get("#x{1}").is_none(),
        "rfc1459 aliasing no longer applies"
    );
    assert_eq!(net.delivered.load_id("#x[1]", "laptop"), Some("m1"));
}

#[tokio::test]
async fn mode_arguments_are_marshaled_and_tracked() {
    let mut tb = bouncer().await;
    let (net_id, _up_out) = add_network(&mut tb, "oftc", "alice").await;
    join_channel(&mut tb, net_id, "#go", &[("alice", ""), ("carol", "")]);

    let mut dc = connect_downstream(&tb, 1, "alice").await;
    downstream::welcome(&mut tb.user, &mut dc.dc).await.unwrap();
    drain(&mut dc.out);
    tb.user.downstreams.push(dc.dc);

    let msg: Message = ":op!u@h MODE #go +ok carol sesame".parse().unwrap();
    upstream::handle_message(&mut tb.user, net_id, msg)
        .await
        .unwrap();

    let net = &tb.user.networks[0];
    let ch = net.conn.as_ref().unwrap().channels.get("#go").unwrap();
    assert_eq!(ch.members.get("carol").unwrap().prefixes(), "@");

    let received = drain(&mut dc.out);
    let mode = received
        .iter()
        .find(|m| m.command == "MODE")
        .expect("MODE forwarded");
    assert_eq!(mode.params[0], "#go/oftc");
    assert_eq!(mode.params[1], "+ok");
    assert_eq!(mode.params[2], "carol/oftc", "member argument is marshaled");
    assert_eq!(mode.params[3], "sesame", "key argument is not");
}

#[tokio::test]
async fn unknown_labeled_reply_routes_to_issuing_downstream() {
    let mut tb = bouncer().await;
    let (net_id, mut up_out) = add_network(&mut tb, "libera", "alice").await;
    tb.user.networks[0]
        .conn
        .as_mut()
        .unwrap()
        .caps
        .set_enabled("labeled-response", true);

    let mut dc1 = connect_downstream(&tb, 1, "alice/libera").await;
    downstream::welcome(&mut tb.user, &mut dc1.dc).await.unwrap();
    drain(&mut dc1.out);
    tb.user.downstreams.push(dc1.dc);
    let mut dc2 = connect_downstream(&tb, 2, "alice/libera").await;
    downstream::welcome(&mut tb.user, &mut dc2.dc).await.unwrap();
    drain(&mut dc2.out);
    tb.user.downstreams.push(dc2.dc);

    downstream::handle_message(&mut tb.user, 2, "WHOIS carol".parse().unwrap())
        .await
        .unwrap();
    let sent = drain(&mut up_out);
    let whois = sent.iter().find(|m| m.command == "WHOIS").unwrap();
    let label = whois.label().expect("labeled command").to_owned();
    assert!(label.starts_with("sd-2-"));

    // An unhandled numeric carrying the label goes only to downstream 2.
    let reply: Message = format!("@label={} :server 276 alice carol :has client cert", label)
        .parse()
        .unwrap();
    upstream::handle_message(&mut tb.user, net_id, reply)
        .await
        .unwrap();

    assert!(drain(&mut dc1.out).iter().all(|m| m.command != "276"));
    let received = drain(&mut dc2.out);
    assert_eq!(received.iter().filter(|m| m.command == "276").count(), 1);
}

#[tokio::test]
async fn detached_relay_notices_respect_filters() {
    let mut tb = bouncer().await;
    let (net_id, _up_out) = add_network(&mut tb, "libera", "alice").await;
    join_channel(&mut tb, net_id, "#dev", &[("alice", ""), ("carol", "")]);
    tb.user.networks[0].channels.insert(
        "#dev",
        db::Channel {
            name: "#dev".into(),
            detached: true,
            relay_detached: db::Filter::Default,
            ..Default::default()
        },
    );

    let mut dc = connect_downstream(&tb, 1, "alice/libera").await;
    downstream::welcome(&mut tb.user, &mut dc.dc).await.unwrap();
    drain(&mut dc.out);
    tb.user.downstreams.push(dc.dc);

    // Non-highlight: no relay under the default filter.
    upstream::handle_message(
        &mut tb.user,
        net_id,
        ":carol!u@h PRIVMSG #dev :quiet chatter".parse().unwrap(),
    )
    .await
    .unwrap();
    assert!(drain(&mut dc.out)
        .iter()
        .all(|m| m.command != "NOTICE"));

    // Highlight: relayed as a service notice.
    upstream::handle_message(
        &mut tb.user,
        net_id,
        ":carol!u@h PRIVMSG #dev :alice: wake up".parse().unwrap(),
    )
    .await
    .unwrap();
    let received = drain(&mut dc.out);
    let notice = received
        .iter()
        .find(|m| m.command == "NOTICE")
        .expect("relay notice");
    assert!(notice.params[1].starts_with("highlight in #dev:"));
}
