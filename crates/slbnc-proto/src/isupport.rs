//! `RPL_ISUPPORT` token parsing.

use std::collections::HashMap;

use thiserror::Error;

use crate::casemap::Casemap;
use crate::mode::{std_channel_modes, std_memberships, ChannelModeType, Membership};

/// Channel type characters assumed until CHANTYPES arrives.
pub const STD_CHANNEL_TYPES: &str = "#&+!";

/// ISUPPORT tokens a single-network downstream may see verbatim.
pub const PASSTHROUGH_TOKENS: &[&str] = &[
    "AWAYLEN", "CHANLIMIT", "CHANNELLEN", "CHANTYPES", "EXCEPTS", "EXTBAN", "HOSTLEN", "INVEX",
    "KICKLEN", "MAXLIST", "MAXTARGETS", "MODES", "NETWORK", "NICKLEN", "PREFIX", "SAFELIST",
    "TARGMAX", "TOPICLEN", "USERLEN",
];

/// ISUPPORT parse error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IsupportError {
    #[error("malformed ISUPPORT CHANMODES value: {0}")]
    BadChanModes(String),
    #[error("malformed ISUPPORT PREFIX value: {0}")]
    BadPrefix(String),
}

/// Server feature tables derived from ISUPPORT, with RFC defaults.
#[derive(Clone, Debug)]
pub struct Isupport {
    pub chanmodes: HashMap<char, ChannelModeType>,
    pub chantypes: String,
    pub memberships: Vec<Membership>,
    pub casemapping: Casemap,
    /// Raw `key=value` tokens from [`PASSTHROUGH_TOKENS`], in arrival order.
    pub passthrough: Vec<(String, Option<String>)>,
}

impl Default for Isupport {
    fn default() -> Self {
        Isupport {
            chanmodes: std_channel_modes(),
            chantypes: STD_CHANNEL_TYPES.to_owned(),
            memberships: std_memberships(),
            casemapping: Casemap::Rfc1459,
            passthrough: Vec::new(),
        }
    }
}

impl Isupport {
    /// True when `entity` starts with a known channel type character.
    pub fn is_channel(&self, entity: &str) -> bool {
        entity
            .chars()
            .next()
            .is_some_and(|c| self.chantypes.contains(c))
    }

    /// Digest one ISUPPORT token (`KEY`, `KEY=value` or `-KEY`).
    ///
    /// Returns the new casemap when the token switched it.
    pub fn apply_token(&mut self, token: &str) -> Result<Option<Casemap>, IsupportError> {
        if let Some(key) = token.strip_prefix('-') {
            self.passthrough.retain(|(k, _)| k != key);
            return Ok(None);
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };

        match key {
            "CHANMODES" => {
                let value = value.unwrap_or("");
                self.chanmodes = parse_chanmodes(value)?;
            }
            "CHANTYPES" => {
                self.chantypes = value.unwrap_or("").to_owned();
            }
            "PREFIX" => {
                self.memberships = parse_prefix(value.unwrap_or(""))?;
            }
            "CASEMAPPING" => {
                if let Some(cm) = value.and_then(Casemap::from_token) {
                    self.casemapping = cm;
                    self.record_passthrough(key, value);
                    return Ok(Some(cm));
                }
            }
            _ => {}
        }
        self.record_passthrough(key, value);
        Ok(None)
    }

    fn record_passthrough(&mut self, key: &str, value: Option<&str>) {
        if !PASSTHROUGH_TOKENS.contains(&key) {
            return;
        }
        let value = value.map(str::to_owned);
        match self.passthrough.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.passthrough.push((key.to_owned(), value)),
        }
    }
}

fn parse_chanmodes(value: &str) -> Result<HashMap<char, ChannelModeType>, IsupportError> {
    let parts: Vec<&str> = value.splitn(5, ',').collect();
    if parts.len() < 4 {
        return Err(IsupportError::BadChanModes(value.to_owned()));
    }
    let mut modes = HashMap::new();
    let types = [
        ChannelModeType::A,
        ChannelModeType::B,
        ChannelModeType::C,
        ChannelModeType::D,
    ];
    for (part, mt) in parts.iter().zip(types) {
        for mode in part.chars() {
            modes.insert(mode, mt);
        }
    }
    Ok(modes)
}

fn parse_prefix(value: &str) -> Result<Vec<Membership>, IsupportError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = value.as_bytes();
    if bytes[0] != b'(' {
        return Err(IsupportError::BadPrefix(value.to_owned()));
    }
    let sep = value
        .find(')')
        .ok_or_else(|| IsupportError::BadPrefix(value.to_owned()))?;
    if value.len() != sep * 2 {
        return Err(IsupportError::BadPrefix(value.to_owned()));
    }
    let modes = &value[1..sep];
    let prefixes = &value[sep + 1..];
    Ok(modes
        .chars()
        .zip(prefixes.chars())
        .map(|(mode, prefix)| Membership { mode, prefix })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chanmodes_classification() {
        let mut is = Isupport::default();
        is.apply_token("CHANMODES=beI,k,l,imnst").unwrap();
        assert_eq!(is.chanmodes.get(&'b'), Some(&ChannelModeType::A));
        assert_eq!(is.chanmodes.get(&'k'), Some(&ChannelModeType::B));
        assert_eq!(is.chanmodes.get(&'l'), Some(&ChannelModeType::C));
        assert_eq!(is.chanmodes.get(&'i'), Some(&ChannelModeType::D));
    }

    #[test]
    fn malformed_chanmodes() {
        let mut is = Isupport::default();
        assert!(is.apply_token("CHANMODES=a,b").is_err());
    }

    #[test]
    fn prefix_pairs() {
        let mut is = Isupport::default();
        is.apply_token("PREFIX=(ov)@+").unwrap();
        assert_eq!(
            is.memberships,
            vec![
                Membership { mode: 'o', prefix: '@' },
                Membership { mode: 'v', prefix: '+' },
            ]
        );

        is.apply_token("PREFIX=").unwrap();
        assert!(is.memberships.is_empty());

        assert!(is.apply_token("PREFIX=ov@+").is_err());
        assert!(is.apply_token("PREFIX=(ov)@").is_err());
    }

    #[test]
    fn casemapping_switch() {
        let mut is = Isupport::default();
        let switched = is.apply_token("CASEMAPPING=ascii").unwrap();
        assert_eq!(switched, Some(Casemap::Ascii));
        assert_eq!(is.casemapping, Casemap::Ascii);
        // Unknown values leave the current casemap alone.
        assert_eq!(is.apply_token("CASEMAPPING=unicode").unwrap(), None);
        assert_eq!(is.casemapping, Casemap::Ascii);
    }

    #[test]
    fn passthrough_recorded_and_negated() {
        let mut is = Isupport::default();
        is.apply_token("NICKLEN=31").unwrap();
        is.apply_token("WHOX").unwrap();
        assert_eq!(
            is.passthrough,
            vec![("NICKLEN".to_owned(), Some("31".to_owned()))]
        );
        is.apply_token("-NICKLEN").unwrap();
        assert!(is.passthrough.is_empty());
    }

    #[test]
    fn is_channel_uses_chantypes() {
        let mut is = Isupport::default();
        assert!(is.is_channel("#x"));
        is.apply_token("CHANTYPES=#").unwrap();
        assert!(!is.is_channel("&x"));
    }
}
