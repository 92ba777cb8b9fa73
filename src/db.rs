//! Persistent store: users, networks, channels, delivery receipts and
//! Web Push subscriptions, backed by SQLite through SQLx.
//!
//! The pool is shared across all user tasks; every query is bounded by the
//! pool's acquire timeout.

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("user not found: {0}")]
    UserNotFound(String),
}

/// Persistent user record.
#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// bcrypt hash.
    pub password: String,
    pub admin: bool,
    pub nick: String,
    pub realname: String,
    pub enabled: bool,
}

/// SASL credentials attached to a network.
#[derive(Debug, Clone, Default)]
pub struct Sasl {
    /// Empty, `PLAIN` or `EXTERNAL`.
    pub mechanism: String,
    pub plain_username: String,
    pub plain_password: String,
    /// DER certificate for EXTERNAL.
    pub external_cert: Option<Vec<u8>>,
    /// DER PKCS#8 private key for EXTERNAL.
    pub external_key: Option<Vec<u8>>,
}

/// Persistent network record.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub id: i64,
    pub name: String,
    /// URL with scheme in {ircs, irc+insecure, irc+unix, unix}; a bare
    /// `host:port` defaults to ircs.
    pub addr: String,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub pass: String,
    pub sasl: Sasl,
    pub connect_commands: Vec<String>,
    pub enabled: bool,
}

impl Network {
    /// Display name: explicit name, else the address.
    pub fn get_name(&self) -> &str {
        if self.name.is_empty() {
            &self.addr
        } else {
            &self.name
        }
    }

    /// Effective nick: per-network override, else the user default.
    pub fn get_nick(&self, user: &User) -> String {
        if self.nick.is_empty() {
            user.nick.clone()
        } else {
            self.nick.clone()
        }
    }

    pub fn get_username(&self, user: &User) -> String {
        if !self.username.is_empty() {
            self.username.clone()
        } else {
            self.get_nick(user)
        }
    }

    pub fn get_realname(&self, user: &User) -> String {
        if !self.realname.is_empty() {
            self.realname.clone()
        } else if !user.realname.is_empty() {
            user.realname.clone()
        } else {
            self.get_nick(user)
        }
    }
}

/// Relay/detach filters on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    #[default]
    Default,
    None,
    Highlight,
    Message,
}

impl Filter {
    pub fn from_i64(v: i64) -> Filter {
        match v {
            1 => Filter::None,
            2 => Filter::Highlight,
            3 => Filter::Message,
            _ => Filter::Default,
        }
    }

    pub fn to_i64(self) -> i64 {
        match self {
            Filter::Default => 0,
            Filter::None => 1,
            Filter::Highlight => 2,
            Filter::Message => 3,
        }
    }
}

/// Persistent channel record.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub detached: bool,
    /// Message-store ID captured when the channel was detached.
    pub detached_internal_msg_id: String,
    /// Inactivity interval before auto-detach; zero disables it.
    pub detach_after: Duration,
    pub detach_on: Filter,
    pub relay_detached: Filter,
    pub reattach_on: Filter,
}

/// Stored (client, target) delivery position for a network.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub target: String,
    pub internal_msg_id: String,
}

/// Web Push subscription record.
#[derive(Debug, Clone)]
pub struct WebPushSubscription {
    pub id: i64,
    pub endpoint: String,
    pub key_auth: String,
    pub key_p256dh: String,
    pub key_vapid: String,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    admin INTEGER NOT NULL DEFAULT 0,
    nick TEXT NOT NULL DEFAULT '',
    realname TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS networks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL DEFAULT '',
    addr TEXT NOT NULL,
    nick TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT '',
    realname TEXT NOT NULL DEFAULT '',
    pass TEXT NOT NULL DEFAULT '',
    sasl_mechanism TEXT NOT NULL DEFAULT '',
    sasl_plain_username TEXT NOT NULL DEFAULT '',
    sasl_plain_password TEXT NOT NULL DEFAULT '',
    sasl_external_cert BLOB,
    sasl_external_key BLOB,
    connect_commands TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    UNIQUE(user_id, name)
);

CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id INTEGER NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    key TEXT NOT NULL DEFAULT '',
    detached INTEGER NOT NULL DEFAULT 0,
    detached_internal_msgid TEXT NOT NULL DEFAULT '',
    detach_after INTEGER NOT NULL DEFAULT 0,
    detach_on INTEGER NOT NULL DEFAULT 0,
    relay_detached INTEGER NOT NULL DEFAULT 0,
    reattach_on INTEGER NOT NULL DEFAULT 0,
    UNIQUE(network_id, name)
);

CREATE TABLE IF NOT EXISTS delivery_receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id INTEGER NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    client TEXT NOT NULL,
    target TEXT NOT NULL,
    internal_msgid TEXT NOT NULL,
    UNIQUE(network_id, client, target)
);

CREATE TABLE IF NOT EXISTS webpush_subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    network_id INTEGER,
    endpoint TEXT NOT NULL,
    key_auth TEXT NOT NULL,
    key_p256dh TEXT NOT NULL,
    key_vapid TEXT NOT NULL,
    UNIQUE(user_id, endpoint)
);
"#;

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

type NetworkRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<Vec<u8>>,
    Option<Vec<u8>>,
    String,
    bool,
);

fn network_from_row(row: NetworkRow) -> Network {
    let (
        id,
        name,
        addr,
        nick,
        username,
        realname,
        pass,
        sasl_mechanism,
        sasl_plain_username,
        sasl_plain_password,
        sasl_external_cert,
        sasl_external_key,
        connect_commands,
        enabled,
    ) = row;
    Network {
        id,
        name,
        addr,
        nick,
        username,
        realname,
        pass,
        sasl: Sasl {
            mechanism: sasl_mechanism,
            plain_username: sasl_plain_username,
            plain_password: sasl_plain_password,
            external_cert: sasl_external_cert,
            external_key: sasl_external_key,
        },
        connect_commands: connect_commands
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
        enabled,
    }
}

const NETWORK_COLUMNS: &str = "id, name, addr, nick, username, realname, pass, \
    sasl_mechanism, sasl_plain_username, sasl_plain_password, \
    sasl_external_cert, sasl_external_key, connect_commands, enabled";

impl Database {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open (or create) the database and apply the schema.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(if path == ":memory:" { 1 } else { 5 })
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        for stmt in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(stmt).execute(&pool).await?;
        }

        info!(path = %path, "database ready");
        Ok(Database { pool })
    }

    pub async fn list_users(&self) -> Result<Vec<User>, DbError> {
        let rows = sqlx::query_as::<_, (i64, String, String, bool, String, String, bool)>(
            "SELECT id, username, password, admin, nick, realname, enabled FROM users",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, username, password, admin, nick, realname, enabled)| User {
                id,
                username,
                password,
                admin,
                nick,
                realname,
                enabled,
            })
            .collect())
    }

    pub async fn get_user(&self, username: &str) -> Result<User, DbError> {
        let row = sqlx::query_as::<_, (i64, String, String, bool, String, String, bool)>(
            "SELECT id, username, password, admin, nick, realname, enabled \
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        let (id, username, password, admin, nick, realname, enabled) =
            row.ok_or_else(|| DbError::UserNotFound(username.to_owned()))?;
        Ok(User {
            id,
            username,
            password,
            admin,
            nick,
            realname,
            enabled,
        })
    }

    /// Insert or update a user; fills in `user.id` on insert.
    pub async fn store_user(&self, user: &mut User) -> Result<(), DbError> {
        if user.id == 0 {
            let result = sqlx::query(
                "INSERT INTO users (username, password, admin, nick, realname, enabled) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&user.username)
            .bind(&user.password)
            .bind(user.admin)
            .bind(&user.nick)
            .bind(&user.realname)
            .bind(user.enabled)
            .execute(&self.pool)
            .await?;
            user.id = result.last_insert_rowid();
        } else {
            sqlx::query(
                "UPDATE users SET username = ?, password = ?, admin = ?, nick = ?, \
                 realname = ?, enabled = ? WHERE id = ?",
            )
            .bind(&user.username)
            .bind(&user.password)
            .bind(user.admin)
            .bind(&user.nick)
            .bind(&user.realname)
            .bind(user.enabled)
            .bind(user.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn list_networks(&self, user_id: i64) -> Result<Vec<Network>, DbError> {
        let sql = format!(
            "SELECT {} FROM networks WHERE user_id = ? ORDER BY id",
            NETWORK_COLUMNS
        );
        let rows = sqlx::query_as::<_, NetworkRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(network_from_row).collect())
    }

    /// Insert or update a network; fills in `network.id` on insert.
    pub async fn store_network(&self, user_id: i64, network: &mut Network) -> Result<(), DbError> {
        let connect_commands = network.connect_commands.join("\n");
        if network.id == 0 {
            let result = sqlx::query(
                "INSERT INTO networks (user_id, name, addr, nick, username, realname, pass, \
                 sasl_mechanism, sasl_plain_username, sasl_plain_password, \
                 sasl_external_cert, sasl_external_key, connect_commands, enabled) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(&network.name)
            .bind(&network.addr)
            .bind(&network.nick)
            .bind(&network.username)
            .bind(&network.realname)
            .bind(&network.pass)
            .bind(&network.sasl.mechanism)
            .bind(&network.sasl.plain_username)
            .bind(&network.sasl.plain_password)
            .bind(&network.sasl.external_cert)
            .bind(&network.sasl.external_key)
            .bind(&connect_commands)
            .bind(network.enabled)
            .execute(&self.pool)
            .await?;
            network.id = result.last_insert_rowid();
        } else {
            sqlx::query(
                "UPDATE networks SET name = ?, addr = ?, nick = ?, username = ?, realname = ?, \
                 pass = ?, sasl_mechanism = ?, sasl_plain_username = ?, sasl_plain_password = ?, \
                 sasl_external_cert = ?, sasl_external_key = ?, connect_commands = ?, enabled = ? \
                 WHERE id = ?",
            )
            .bind(&network.name)
            .bind(&network.addr)
            .bind(&network.nick)
            .bind(&network.username)
            .bind(&network.realname)
            .bind(&network.pass)
            .bind(&network.sasl.mechanism)
            .bind(&network.sasl.plain_username)
            .bind(&network.sasl.plain_password)
            .bind(&network.sasl.external_cert)
            .bind(&network.sasl.external_key)
            .bind(&connect_commands)
            .bind(network.enabled)
            .bind(network.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_network(&self, network_id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM networks WHERE id = ?")
            .bind(network_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_channels(&self, network_id: i64) -> Result<Vec<Channel>, DbError> {
        let rows = sqlx::query_as::<
            _,
            (i64, String, String, bool, String, i64, i64, i64, i64),
        >(
            "SELECT id, name, key, detached, detached_internal_msgid, detach_after, \
             detach_on, relay_detached, reattach_on FROM channels WHERE network_id = ?",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    name,
                    key,
                    detached,
                    detached_internal_msg_id,
                    detach_after,
                    detach_on,
                    relay_detached,
                    reattach_on,
                )| Channel {
                    id,
                    name,
                    key,
                    detached,
                    detached_internal_msg_id,
                    detach_after: Duration::from_secs(detach_after.max(0) as u64),
                    detach_on: Filter::from_i64(detach_on),
                    relay_detached: Filter::from_i64(relay_detached),
                    reattach_on: Filter::from_i64(reattach_on),
                },
            )
            .collect())
    }

    /// Insert or update a channel (unique per (network, name)).
    pub async fn store_channel(&self, network_id: i64, channel: &mut Channel) -> Result<(), DbError> {
        let result = sqlx::query(
            "INSERT INTO channels (network_id, name, key, detached, detached_internal_msgid, \
             detach_after, detach_on, relay_detached, reattach_on) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(network_id, name) DO UPDATE SET \
             key = excluded.key, detached = excluded.detached, \
             detached_internal_msgid = excluded.detached_internal_msgid, \
             detach_after = excluded.detach_after, detach_on = excluded.detach_on, \
             relay_detached = excluded.relay_detached, reattach_on = excluded.reattach_on",
        )
        .bind(network_id)
        .bind(&channel.name)
        .bind(&channel.key)
        .bind(channel.detached)
        .bind(&channel.detached_internal_msg_id)
        .bind(channel.detach_after.as_secs() as i64)
        .bind(channel.detach_on.to_i64())
        .bind(channel.relay_detached.to_i64())
        .bind(channel.reattach_on.to_i64())
        .execute(&self.pool)
        .await?;
        if channel.id == 0 {
            channel.id = result.last_insert_rowid();
        }
        Ok(())
    }

    pub async fn delete_channel(&self, network_id: i64, name: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM channels WHERE network_id = ? AND name = ?")
            .bind(network_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_delivery_receipts(
        &self,
        network_id: i64,
    ) -> Result<Vec<(String, DeliveryReceipt)>, DbError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT client, target, internal_msgid FROM delivery_receipts WHERE network_id = ?",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(client, target, internal_msg_id)| {
                (
                    client,
                    DeliveryReceipt {
                        target,
                        internal_msg_id,
                    },
                )
            })
            .collect())
    }

    /// Replace all receipts of one client on one network.
    pub async fn store_client_delivery_receipts(
        &self,
        network_id: i64,
        client: &str,
        receipts: &[DeliveryReceipt],
    ) -> Result<(), DbError> {
        sqlx::query("DELETE FROM delivery_receipts WHERE network_id = ? AND client = ?")
            .bind(network_id)
            .bind(client)
            .execute(&self.pool)
            .await?;
        for receipt in receipts {
            sqlx::query(
                "INSERT INTO delivery_receipts (network_id, client, target, internal_msgid) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(network_id)
            .bind(client)
            .bind(&receipt.target)
            .bind(&receipt.internal_msg_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn list_webpush_subscriptions(
        &self,
        user_id: i64,
        network_id: i64,
    ) -> Result<Vec<WebPushSubscription>, DbError> {
        let rows = sqlx::query_as::<_, (i64, String, String, String, String)>(
            "SELECT id, endpoint, key_auth, key_p256dh, key_vapid FROM webpush_subscriptions \
             WHERE user_id = ? AND (network_id IS NULL OR network_id = ?)",
        )
        .bind(user_id)
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, endpoint, key_auth, key_p256dh, key_vapid)| WebPushSubscription {
                id,
                endpoint,
                key_auth,
                key_p256dh,
                key_vapid,
            })
            .collect())
    }

    pub async fn delete_webpush_subscription(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM webpush_subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn users_roundtrip() {
        let db = Database::new(":memory:").await.unwrap();
        let mut user = User {
            username: "alice".into(),
            password: "hash".into(),
            nick: "alice".into(),
            enabled: true,
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        assert_ne!(user.id, 0);

        let loaded = db.get_user("alice").await.unwrap();
        assert_eq!(loaded.id, user.id);
        assert_eq!(loaded.nick, "alice");

        assert!(matches!(
            db.get_user("nobody").await,
            Err(DbError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn networks_and_channels_roundtrip() {
        let db = Database::new(":memory:").await.unwrap();
        let mut user = User {
            username: "alice".into(),
            password: "hash".into(),
            enabled: true,
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();

        let mut network = Network {
            name: "libera".into(),
            addr: "ircs://irc.libera.chat".into(),
            nick: "alice".into(),
            connect_commands: vec!["PRIVMSG X :login".into()],
            enabled: true,
            ..Default::default()
        };
        db.store_network(user.id, &mut network).await.unwrap();
        assert_ne!(network.id, 0);

        let networks = db.list_networks(user.id).await.unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].connect_commands, ["PRIVMSG X :login"]);

        let mut channel = Channel {
            name: "#dev".into(),
            detach_after: Duration::from_secs(30),
            ..Default::default()
        };
        db.store_channel(network.id, &mut channel).await.unwrap();

        // Upsert keeps (network, name) unique.
        let mut again = Channel {
            name: "#dev".into(),
            key: "sesame".into(),
            ..Default::default()
        };
        db.store_channel(network.id, &mut again).await.unwrap();
        let channels = db.list_channels(network.id).await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].key, "sesame");
    }

    #[tokio::test]
    async fn delivery_receipts_replace() {
        let db = Database::new(":memory:").await.unwrap();
        let mut user = User {
            username: "u".into(),
            password: "h".into(),
            enabled: true,
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        let mut network = Network {
            name: "n".into(),
            addr: "ircs://example.org".into(),
            enabled: true,
            ..Default::default()
        };
        db.store_network(user.id, &mut network).await.unwrap();

        let receipts = vec![DeliveryReceipt {
            target: "#chan".into(),
            internal_msg_id: "m42".into(),
        }];
        db.store_client_delivery_receipts(network.id, "laptop", &receipts)
            .await
            .unwrap();
        db.store_client_delivery_receipts(network.id, "laptop", &receipts)
            .await
            .unwrap();

        let loaded = db.list_delivery_receipts(network.id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "laptop");
        assert_eq!(loaded[0].1.internal_msg_id, "m42");
    }
}
