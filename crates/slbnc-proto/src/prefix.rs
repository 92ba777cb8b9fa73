//! IRC message prefix.
//!
//! A prefix identifies the origin of a message: either a server name or a
//! `nick!user@host` mask.

use std::fmt;

/// Message source.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum Prefix {
    /// Server name (e.g. `irc.example.org`).
    ServerName(String),
    /// User prefix: (nickname, username, hostname). Username and hostname
    /// may be empty.
    Nickname(String, String, String),
}

impl Prefix {
    /// Parse a prefix string. Lenient: a bare name containing a dot is
    /// treated as a server name, anything else as a nickname.
    pub fn new_from_str(s: &str) -> Self {
        #[derive(Copy, Clone, Eq, PartialEq)]
        enum Part {
            Name,
            User,
            Host,
        }

        let mut name = String::new();
        let mut user = String::new();
        let mut host = String::new();
        let mut part = Part::Name;
        let mut is_server = false;

        for c in s.chars() {
            if c == '.' && part == Part::Name {
                is_server = true;
            }
            match c {
                '!' if part == Part::Name => {
                    is_server = false;
                    part = Part::User;
                }
                '@' if part != Part::Host => {
                    is_server = false;
                    part = Part::Host;
                }
                _ => {
                    match part {
                        Part::Name => &mut name,
                        Part::User => &mut user,
                        Part::Host => &mut host,
                    }
                    .push(c);
                }
            }
        }

        if is_server {
            Prefix::ServerName(name)
        } else {
            Prefix::Nickname(name, user, host)
        }
    }

    /// Build a user prefix from its components.
    pub fn new(nick: impl Into<String>, user: impl Into<String>, host: impl Into<String>) -> Self {
        Prefix::Nickname(nick.into(), user.into(), host.into())
    }

    /// Leading name: nickname or server name.
    pub fn name(&self) -> &str {
        match self {
            Prefix::ServerName(name) => name,
            Prefix::Nickname(name, _, _) => name,
        }
    }

    /// Nickname, if this is a user prefix with a non-empty nick.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(nick, _, _) if !nick.is_empty() => Some(nick),
            _ => None,
        }
    }

    /// Username, if present.
    pub fn user(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(_, user, _) if !user.is_empty() => Some(user),
            _ => None,
        }
    }

    /// Hostname, if present.
    pub fn host(&self) -> Option<&str> {
        match self {
            Prefix::ServerName(host) => Some(host),
            Prefix::Nickname(_, _, host) if !host.is_empty() => Some(host),
            _ => None,
        }
    }

    /// True when the prefix carries neither user nor host, which is how
    /// servers that omit their name prefix their own messages.
    pub fn is_server(&self) -> bool {
        match self {
            Prefix::ServerName(_) => true,
            Prefix::Nickname(_, user, host) => user.is_empty() && host.is_empty(),
        }
    }

    /// Same prefix with the nickname replaced.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        match self {
            Prefix::ServerName(_) => Prefix::ServerName(name.into()),
            Prefix::Nickname(_, user, host) => {
                Prefix::Nickname(name.into(), user.clone(), host.clone())
            }
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => write!(f, "{}", name),
            Prefix::Nickname(name, user, host) => {
                write!(f, "{}", name)?;
                if !user.is_empty() {
                    write!(f, "!{}", user)?;
                }
                if !host.is_empty() {
                    write!(f, "@{}", host)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_user_prefix() {
        let p = Prefix::new_from_str("alice!u@example.org");
        assert_eq!(p.nick(), Some("alice"));
        assert_eq!(p.user(), Some("u"));
        assert_eq!(p.host(), Some("example.org"));
        assert!(!p.is_server());
    }

    #[test]
    fn parse_server_prefix() {
        let p = Prefix::new_from_str("irc.example.org");
        assert!(matches!(p, Prefix::ServerName(_)));
        assert!(p.is_server());
    }

    #[test]
    fn parse_bare_nick() {
        let p = Prefix::new_from_str("alice");
        assert_eq!(p.nick(), Some("alice"));
        assert!(p.is_server(), "bare nick has neither user nor host");
    }

    #[test]
    fn display_roundtrip() {
        for s in ["alice!u@h", "alice@h", "alice", "irc.example.org"] {
            assert_eq!(Prefix::new_from_str(s).to_string(), s);
        }
    }
}
