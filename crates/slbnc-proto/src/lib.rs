//! IRC protocol support for the slbncd bouncer.
//!
//! This crate contains the wire-level building blocks shared by the
//! upstream (client) and downstream (server) halves of the bouncer:
//! message parsing and serialization with IRCv3 tags, case-mapping aware
//! name indexes, channel mode classification, ISUPPORT token parsing,
//! capability tables, SASL helpers and a tokio codec.

pub mod caps;
pub mod casemap;
pub mod codec;
pub mod error;
pub mod isupport;
pub mod message;
pub mod mode;
pub mod numeric;
pub mod prefix;
pub mod sasl;
pub mod tags;

pub use caps::Caps;
pub use casemap::{Casemap, NameMap};
pub use codec::IrcCodec;
pub use error::{MessageParseError, ProtocolError};
pub use isupport::Isupport;
pub use message::{Message, Tag};
pub use mode::{
    apply_channel_modes, ChannelModeType, ChannelModes, Membership, MembershipSet,
};
pub use prefix::Prefix;

/// Maximum length of an IRC line without tags, including CRLF.
pub const MAX_MESSAGE_LEN: usize = 512;

/// Maximum length of the tags section, per the message-tags spec.
pub const MAX_TAGS_LEN: usize = 8191;

/// `server-time` tag timestamp layout for [`chrono::format`].
pub const SERVER_TIME_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a UTC timestamp the way the `server-time` tag expects.
pub fn format_server_time(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format(SERVER_TIME_LAYOUT).to_string()
}

/// Parse a `server-time` tag value.
pub fn parse_server_time(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, SERVER_TIME_LAYOUT)
        .ok()
        .map(|t| t.and_utc())
}
