//! Owned IRC message type, parsing and serialization.
//!
//! Unlike a full client library, the bouncer has to forward commands it
//! does not understand byte-for-byte, so the command is kept as an
//! uppercase string plus positional parameters rather than a closed enum.

use std::fmt;
use std::str::FromStr;

use nom::bytes::complete::{tag, take_while1};
use nom::IResult;

use crate::error::{MessageParseError, ProtocolError};
use crate::prefix::Prefix;
use crate::tags::{escape_tag_value, unescape_tag_value};

/// An IRCv3 message tag: key plus optional value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Tag(pub String, pub Option<String>);

impl Tag {
    /// Create a new tag.
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Tag(key.into(), value)
    }
}

/// An owned IRC message: optional tags, optional prefix, command and
/// parameters.
///
/// ```
/// use slbnc_proto::Message;
///
/// let msg: Message = ":nick!u@h PRIVMSG #chan :Hello!".parse().unwrap();
/// assert_eq!(msg.command, "PRIVMSG");
/// assert_eq!(msg.params, ["#chan", "Hello!"]);
/// ```
#[derive(Clone, PartialEq, Debug)]
pub struct Message {
    pub tags: Vec<Tag>,
    pub prefix: Option<Prefix>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Build a message from a command and parameters.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Message {
            tags: Vec::new(),
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Get the value of a tag by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|Tag(k, _)| k == key)
            .and_then(|Tag(_, v)| v.as_deref())
    }

    /// True when the tag is present, with or without a value.
    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.iter().any(|Tag(k, _)| k == key)
    }

    /// Set or replace a tag.
    pub fn set_tag(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        if let Some(t) = self.tags.iter_mut().find(|Tag(k, _)| *k == key) {
            t.1 = value;
        } else {
            self.tags.push(Tag(key, value));
        }
    }

    /// Remove a tag by key.
    pub fn remove_tag(&mut self, key: &str) {
        self.tags.retain(|Tag(k, _)| k != key);
    }

    /// Builder-style tag attachment.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.set_tag(key, value);
        self
    }

    /// Builder-style prefix attachment.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// The `server-time` tag value.
    pub fn server_time(&self) -> Option<&str> {
        self.tag_value("time")
    }

    /// The labeled-response `label` tag value.
    pub fn label(&self) -> Option<&str> {
        self.tag_value("label")
    }

    /// The `batch` reference tag value.
    pub fn batch_ref(&self) -> Option<&str> {
        self.tag_value("batch")
    }

    /// Nickname of the message source, if any.
    pub fn source_nickname(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(|p| p.nick())
    }

    /// True for three-digit numeric replies.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }

    /// Copy of this message with only client-only (`+`-prefixed) tags kept.
    pub fn client_tags(&self) -> Vec<Tag> {
        self.tags
            .iter()
            .filter(|Tag(k, _)| k.starts_with('+'))
            .cloned()
            .collect()
    }
}

impl From<(&str, &[&str])> for Message {
    fn from((command, params): (&str, &[&str])) -> Self {
        Message::new(command, params.iter().map(|s| s.to_string()).collect())
    }
}

fn is_not_space_or_eol(c: char) -> bool {
    c != ' ' && c != '\r' && c != '\n'
}

fn parse_section<'a>(marker: &'static str, i: &'a str) -> IResult<&'a str, &'a str> {
    let (i, _) = tag(marker)(i)?;
    let (i, section) = take_while1(is_not_space_or_eol)(i)?;
    let (i, _) = take_while1(|c| c == ' ')(i)?;
    Ok((i, section))
}

fn parse_tags_section(i: &str) -> IResult<&str, &str> {
    parse_section("@", i)
}

fn parse_prefix_section(i: &str) -> IResult<&str, &str> {
    parse_section(":", i)
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(';')
        .filter(|s| !s.is_empty())
        .map(|item| {
            let mut iter = item.splitn(2, '=');
            let key = iter.next().unwrap_or("");
            let value = iter.next().map(unescape_tag_value);
            Tag(key.to_owned(), value)
        })
        .collect()
}

fn parse_params(mut i: &str) -> Vec<String> {
    let mut params = Vec::new();
    loop {
        i = i.trim_start_matches(' ');
        if i.is_empty() {
            break;
        }
        if let Some(trailing) = i.strip_prefix(':') {
            params.push(trailing.to_owned());
            break;
        }
        match i.find(' ') {
            Some(pos) => {
                params.push(i[..pos].to_owned());
                i = &i[pos..];
            }
            None => {
                params.push(i.to_owned());
                break;
            }
        }
    }
    params
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, Self::Err> {
        let input = s.trim_end_matches(['\r', '\n']);
        let invalid = |cause| ProtocolError::InvalidMessage {
            string: s.to_owned(),
            cause,
        };

        if input.is_empty() {
            return Err(invalid(MessageParseError::EmptyMessage));
        }

        let (rest, raw_tags) = match parse_tags_section(input) {
            Ok((rest, raw)) => (rest, Some(raw)),
            Err(_) => (input, None),
        };
        let (rest, raw_prefix) = match parse_prefix_section(rest) {
            Ok((rest, raw)) => (rest, Some(raw)),
            Err(_) => (rest, None),
        };

        let (rest, command) = take_while1::<_, _, nom::error::Error<&str>>(is_not_space_or_eol)(
            rest,
        )
        .map_err(|_: nom::Err<_>| invalid(MessageParseError::MissingCommand))?;

        Ok(Message {
            tags: raw_tags.map(parse_tags).unwrap_or_default(),
            prefix: raw_prefix.map(Prefix::new_from_str),
            command: command.to_ascii_uppercase(),
            params: parse_params(rest),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            f.write_str("@")?;
            for (i, Tag(key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                f.write_str(key)?;
                if let Some(value) = value {
                    f.write_str("=")?;
                    escape_tag_value(f, value)?;
                }
            }
            f.write_str(" ")?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            let last = i == self.params.len() - 1;
            let needs_trailing =
                param.is_empty() || param.starts_with(':') || param.contains(' ');
            if last && needs_trailing {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let msg: Message = "PING :irc.example.org\r\n".parse().unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, ["irc.example.org"]);
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parse_prefixed() {
        let msg: Message = ":nick!u@h PRIVMSG #chan :Hello, world!".parse().unwrap();
        assert_eq!(msg.source_nickname(), Some("nick"));
        assert_eq!(msg.params, ["#chan", "Hello, world!"]);
    }

    #[test]
    fn parse_with_tags() {
        let msg: Message = "@time=2023-01-01T00:00:00.000Z;msgid=abc :n PRIVMSG #c :hi"
            .parse()
            .unwrap();
        assert_eq!(msg.server_time(), Some("2023-01-01T00:00:00.000Z"));
        assert_eq!(msg.tag_value("msgid"), Some("abc"));
    }

    #[test]
    fn parse_escaped_tag_value() {
        let msg: Message = "@key=a\\sb PING :x".parse().unwrap();
        assert_eq!(msg.tag_value("key"), Some("a b"));
    }

    #[test]
    fn parse_middle_params() {
        let msg: Message = "CAP * LS :sasl message-tags".parse().unwrap();
        assert_eq!(msg.params, ["*", "LS", "sasl message-tags"]);
    }

    #[test]
    fn parse_empty_is_error() {
        assert!("".parse::<Message>().is_err());
        assert!("\r\n".parse::<Message>().is_err());
    }

    #[test]
    fn command_is_uppercased() {
        let msg: Message = "privmsg #c :x".parse().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn display_trailing_rules() {
        let msg = Message::new("PRIVMSG", vec!["#c".into(), "two words".into()]);
        assert_eq!(msg.to_string(), "PRIVMSG #c :two words");

        let msg = Message::new("AWAY", vec!["".into()]);
        assert_eq!(msg.to_string(), "AWAY :");

        let msg = Message::new("PONG", vec!["token".into()]);
        assert_eq!(msg.to_string(), "PONG token");
    }

    #[test]
    fn display_roundtrip() {
        let original = Message::new("PRIVMSG", vec!["#c".into(), "hi there".into()])
            .with_tag("time", Some("2023-01-01T00:00:00.000Z".into()))
            .with_prefix(Prefix::new("alice", "u", "h"));
        let parsed: Message = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn client_tags_filter() {
        let msg = Message::new("TAGMSG", vec!["#c".into()])
            .with_tag("+typing", Some("active".into()))
            .with_tag("time", Some("x".into()));
        let kept = msg.client_tags();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, "+typing");
    }
}
