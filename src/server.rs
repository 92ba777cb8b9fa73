//! Top-level server glue: shared state, user bootstrap and the
//! downstream accept loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use slbnc_proto::{Message, Prefix};

use crate::config::Config;
use crate::conn;
use crate::db::Database;
use crate::downstream::{HandlerError, Registration};
use crate::identd::Identd;
use crate::msgstore::{MemoryStore, MessageStore};
use crate::user::{Event, User};

/// State shared by every task: configuration, the persistence store and
/// the identd registry.
pub struct Shared {
    pub config: Config,
    pub hostname: String,
    pub db: Database,
    pub identd: Identd,
}

impl Shared {
    pub fn prefix(&self) -> Prefix {
        Prefix::ServerName(self.hostname.clone())
    }
}

/// Handle to a running user task.
#[derive(Clone)]
pub struct UserHandle {
    pub id: i64,
    pub events: mpsc::Sender<Event>,
}

/// The bouncer server: owns the user registry and accepts downstreams.
pub struct Server {
    pub shared: Arc<Shared>,
    users: Mutex<HashMap<String, UserHandle>>,
    next_downstream_id: AtomicU64,
}

impl Server {
    pub fn new(config: Config, db: Database) -> Arc<Self> {
        let hostname = config.server.hostname.clone();
        Arc::new(Server {
            shared: Arc::new(Shared {
                config,
                hostname,
                db,
                identd: Identd::new(),
            }),
            users: Mutex::new(HashMap::new()),
            next_downstream_id: AtomicU64::new(1),
        })
    }

    pub fn get_user(&self, username: &str) -> Option<UserHandle> {
        self.users.lock().unwrap().get(username).cloned()
    }

    /// Start the event loop task for one user.
    fn start_user(&self, record: crate::db::User) {
        let msg_store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        let (user, events_tx, events_rx) =
            User::new(record.clone(), self.shared.clone(), msg_store);
        self.users.lock().unwrap().insert(
            record.username.clone(),
            UserHandle {
                id: record.id,
                events: events_tx,
            },
        );
        info!(user = %record.username, "starting bouncer for user");
        tokio::spawn(user.run(events_rx));
    }

    /// Load every enabled user and run the accept loop.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let users = self.shared.db.list_users().await?;
        for record in users {
            if record.enabled {
                self.start_user(record);
            }
        }

        let addr = &self.shared.config.listen.address;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {:?}", addr))?;
        info!(address = %addr, "listening for downstream connections");

        loop {
            let (stream, remote) = listener.accept().await?;
            conn::set_keepalive(&stream);
            info!(peer = %remote, "new downstream connection");
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_downstream(stream, remote).await;
            });
        }
    }

    /// Drive one downstream connection: registration on this task, then
    /// pump messages into the owning user's event queue.
    async fn handle_downstream(self: Arc<Self>, stream: TcpStream, remote: std::net::SocketAddr) {
        let id = self.next_downstream_id.fetch_add(1, Ordering::Relaxed);
        let (mut reader, mut writer) = conn::split(conn::Stream::Tcp(stream));

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (closed_tx, mut closed_rx) = watch::channel(false);

        // Writer task: serializes the outbound queue, stops on close.
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = writer.send(msg).await {
                                warn!(error = %e, "failed to write to downstream");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = closed_rx.changed() => {
                        // Drain what is already queued, then stop.
                        while let Ok(msg) = out_rx.try_recv() {
                            if writer.send(msg).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
        });

        let hostname = remote.ip().to_string();
        let mut registration = Registration::new(id, hostname, out_tx.clone(), closed_tx.clone());

        // Registration phase, driven by this task.
        let mut closed_rx = closed_tx.subscribe();
        let registered = loop {
            let msg = tokio::select! {
                msg = reader.next() => msg,
                _ = closed_rx.changed() => None,
            };
            let Some(msg) = msg else {
                closed_tx.send_replace(true);
                let _ = writer_task.await;
                return;
            };
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "failed to read downstream message");
                    continue;
                }
            };
            match registration.handle_message(&self.shared, &msg).await {
                Ok(Some(registered)) => break registered,
                Ok(None) => {
                    if *closed_tx.borrow() {
                        let _ = writer_task.await;
                        return;
                    }
                }
                Err(HandlerError::Irc(mut reply)) => {
                    reply.prefix = Some(self.shared.prefix());
                    let _ = out_tx.send(reply);
                }
                Err(HandlerError::Fatal(err)) => {
                    warn!(error = %err, "failed downstream registration");
                    let _ = out_tx.send(Message::new(
                        "ERROR",
                        vec!["Internal server error".into()],
                    ));
                    closed_tx.send_replace(true);
                    let _ = writer_task.await;
                    return;
                }
            }
        };

        // Hand the registered connection to its user task.
        let Some(handle) = self.get_user(&registered.user.username) else {
            warn!(user = %registered.user.username, "user not active");
            let _ = out_tx.send(Message::new(
                "ERROR",
                vec!["Internal server error".into()],
            ));
            closed_tx.send_replace(true);
            let _ = writer_task.await;
            return;
        };

        if handle
            .events
            .send(Event::DownstreamConnected {
                dc: Box::new(registered.dc),
            })
            .await
            .is_err()
        {
            closed_tx.send_replace(true);
            let _ = writer_task.await;
            return;
        }

        // Read loop: sockets only produce events; the bounded queue
        // applies backpressure to this reader.
        loop {
            let msg = tokio::select! {
                msg = reader.next() => msg,
                _ = closed_rx.changed() => break,
            };
            match msg {
                Some(Ok(msg)) => {
                    if handle
                        .events
                        .send(Event::DownstreamMessage { id, msg })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "failed to read downstream message");
                    break;
                }
                None => break,
            }
        }

        let _ = handle
            .events
            .send(Event::DownstreamDisconnected { id })
            .await;
        closed_tx.send_replace(true);
        let _ = writer_task.await;
        info!(peer = %remote, "downstream connection closed");
    }
}
