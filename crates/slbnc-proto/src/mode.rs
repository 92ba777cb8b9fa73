//! Channel mode classification and membership tracking.
//!
//! Mode letters mean nothing on their own: the server's `ISUPPORT
//! CHANMODES` token sorts them into the four standard categories and
//! `PREFIX` lists the membership letters. Applying a MODE string walks the
//! plus/minus segments against those tables.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::casemap::NameMap;

/// Standard channel mode categories, per the modern IRC documentation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelModeType {
    /// Adds or removes an address from a list; always has an argument.
    A,
    /// Channel setting with a mandatory argument.
    B,
    /// Channel setting with an argument only when set.
    C,
    /// Channel setting without an argument.
    D,
}

/// Mode letters of the RFC 1459 core, used until ISUPPORT says otherwise.
pub fn std_channel_modes() -> HashMap<char, ChannelModeType> {
    HashMap::from([
        ('b', ChannelModeType::A),
        ('e', ChannelModeType::A),
        ('I', ChannelModeType::A),
        ('k', ChannelModeType::B),
        ('l', ChannelModeType::C),
        ('i', ChannelModeType::D),
        ('m', ChannelModeType::D),
        ('n', ChannelModeType::D),
        ('s', ChannelModeType::D),
        ('t', ChannelModeType::D),
    ])
}

/// A membership grade: mode letter plus its NAMES prefix character.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    pub mode: char,
    pub prefix: char,
}

/// Default membership table, used until ISUPPORT PREFIX arrives.
pub fn std_memberships() -> Vec<Membership> {
    vec![
        Membership { mode: 'q', prefix: '~' },
        Membership { mode: 'a', prefix: '&' },
        Membership { mode: 'o', prefix: '@' },
        Membership { mode: 'h', prefix: '%' },
        Membership { mode: 'v', prefix: '+' },
    ]
}

/// Ordered subset of the server's available memberships held by one
/// channel member, highest grade first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipSet(Vec<Membership>);

impl MembershipSet {
    pub fn new() -> Self {
        MembershipSet(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add a membership, keeping the set ordered by the server's table.
    pub fn add(&mut self, available: &[Membership], m: Membership) {
        if self.0.iter().any(|x| x.mode == m.mode) {
            return;
        }
        let rank = |mode: char| available.iter().position(|a| a.mode == mode);
        let pos = self
            .0
            .iter()
            .position(|x| rank(x.mode) > rank(m.mode))
            .unwrap_or(self.0.len());
        self.0.insert(pos, m);
    }

    pub fn remove(&mut self, mode: char) {
        self.0.retain(|m| m.mode != mode);
    }

    /// All prefixes, highest grade first (`multi-prefix` form).
    pub fn prefixes(&self) -> String {
        self.0.iter().map(|m| m.prefix).collect()
    }

    /// Only the highest prefix, or the empty string.
    pub fn highest_prefix(&self) -> String {
        self.0.first().map(|m| m.prefix.to_string()).unwrap_or_default()
    }
}

/// Parse a leading membership-prefix run off a NAMES entry, returning the
/// memberships and the bare nick.
pub fn parse_membership_prefixes<'a>(
    available: &[Membership],
    s: &'a str,
) -> (MembershipSet, &'a str) {
    let mut set = MembershipSet::new();
    let mut rest = s;
    while let Some(c) = rest.chars().next() {
        match available.iter().find(|m| m.prefix == c) {
            Some(m) => {
                set.add(available, *m);
                rest = &rest[c.len_utf8()..];
            }
            None => break,
        }
    }
    (set, rest)
}

/// Channel modes currently set, letter to argument (empty when the mode
/// takes none). A BTreeMap keeps `format` deterministic.
pub type ChannelModes = BTreeMap<char, String>;

/// Render modes as `+<with-args><without-args>` plus arguments in order.
pub fn format_channel_modes(modes: &ChannelModes) -> (String, Vec<String>) {
    let mut with_values = String::new();
    let mut without_values = String::new();
    let mut params = Vec::new();
    for (mode, value) in modes {
        if value.is_empty() {
            without_values.push(*mode);
        } else {
            with_values.push(*mode);
            params.push(value.clone());
        }
    }
    (format!("+{}{}", with_values, without_values), params)
}

/// Mode string application error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeError {
    #[error("malformed modestring {0:?}: missing plus/minus")]
    MissingPlusMinus(String),
    #[error("malformed modestring {mode_str:?}: missing argument for {plus_minus}{mode}")]
    MissingArgument {
        mode_str: String,
        plus_minus: char,
        mode: char,
    },
}

/// Apply a MODE string and its arguments to a channel.
///
/// Membership letters mutate the matching member's [`MembershipSet`];
/// setting modes land in `modes` when given. The returned set contains the
/// indexes of arguments that name entities and therefore need downstream
/// marshaling.
pub fn apply_channel_modes(
    mut modes: Option<&mut ChannelModes>,
    members: &mut NameMap<MembershipSet>,
    available_memberships: &[Membership],
    available_modes: &HashMap<char, ChannelModeType>,
    mode_str: &str,
    arguments: &[String],
) -> Result<HashSet<usize>, ModeError> {
    let mut need_marshaling = HashSet::new();
    let mut next_argument = 0usize;
    let mut plus_minus = None;

    'outer: for mode in mode_str.chars() {
        if mode == '+' || mode == '-' {
            plus_minus = Some(mode);
            continue;
        }
        let pm = plus_minus.ok_or_else(|| ModeError::MissingPlusMinus(mode_str.to_owned()))?;

        for membership in available_memberships {
            if membership.mode == mode {
                let member = arguments.get(next_argument).ok_or_else(|| {
                    ModeError::MissingArgument {
                        mode_str: mode_str.to_owned(),
                        plus_minus: pm,
                        mode,
                    }
                })?;
                if let Some(ms) = members.get_mut(member) {
                    if pm == '+' {
                        ms.add(available_memberships, *membership);
                    } else {
                        ms.remove(membership.mode);
                    }
                }
                need_marshaling.insert(next_argument);
                next_argument += 1;
                continue 'outer;
            }
        }

        let Some(mt) = available_modes.get(&mode).copied() else {
            continue;
        };
        match mt {
            ChannelModeType::A => {
                next_argument += 1;
            }
            ChannelModeType::B | ChannelModeType::C if !(mt == ChannelModeType::C && pm == '-') => {
                if pm == '+' {
                    // Sensitive arguments such as channel keys can be
                    // omitted in RPL_CHANNELMODEIS.
                    let argument = arguments.get(next_argument).cloned().unwrap_or_default();
                    if let Some(modes) = modes.as_deref_mut() {
                        modes.insert(mode, argument);
                    }
                } else if let Some(modes) = modes.as_deref_mut() {
                    modes.remove(&mode);
                }
                next_argument += 1;
            }
            _ => {
                if let Some(modes) = modes.as_deref_mut() {
                    if pm == '+' {
                        modes.insert(mode, String::new());
                    } else {
                        modes.remove(&mode);
                    }
                }
            }
        }
    }
    Ok(need_marshaling)
}

/// User modes as a flat letter set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserModes(String);

impl UserModes {
    pub fn has(&self, c: char) -> bool {
        self.0.contains(c)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Apply a `+ab-cd` style mode string.
    pub fn apply(&mut self, s: &str) -> Result<(), ModeError> {
        let mut plus_minus = None;
        for c in s.chars() {
            match c {
                '+' | '-' => plus_minus = Some(c),
                _ => match plus_minus {
                    Some('+') => {
                        if !self.has(c) {
                            self.0.push(c);
                        }
                    }
                    Some('-') => self.0.retain(|x| x != c),
                    _ => return Err(ModeError::MissingPlusMinus(s.to_owned())),
                },
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for UserModes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casemap::Casemap;

    fn members_with(names: &[&str]) -> NameMap<MembershipSet> {
        let mut m = NameMap::with_casemap(Casemap::Rfc1459);
        for n in names {
            m.insert(n, MembershipSet::new());
        }
        m
    }

    #[test]
    fn apply_membership_changes() {
        let avail = std_memberships();
        let chanmodes = std_channel_modes();
        let mut members = members_with(&["alice", "bob"]);
        let mut modes = ChannelModes::new();

        let marshal = apply_channel_modes(
            Some(&mut modes),
            &mut members,
            &avail,
            &chanmodes,
            "+ov",
            &["alice".into(), "bob".into()],
        )
        .unwrap();

        assert_eq!(marshal, HashSet::from([0, 1]));
        assert_eq!(members.get("ALICE").unwrap().prefixes(), "@");
        assert_eq!(members.get("bob").unwrap().prefixes(), "+");
    }

    #[test]
    fn membership_set_stays_ordered() {
        let avail = std_memberships();
        let mut ms = MembershipSet::new();
        ms.add(&avail, Membership { mode: 'v', prefix: '+' });
        ms.add(&avail, Membership { mode: 'o', prefix: '@' });
        assert_eq!(ms.prefixes(), "@+");
        assert_eq!(ms.highest_prefix(), "@");
        ms.remove('o');
        assert_eq!(ms.prefixes(), "+");
    }

    #[test]
    fn apply_setting_modes() {
        let avail = std_memberships();
        let chanmodes = std_channel_modes();
        let mut members = members_with(&[]);
        let mut modes = ChannelModes::new();

        apply_channel_modes(
            Some(&mut modes),
            &mut members,
            &avail,
            &chanmodes,
            "+ntk",
            &["secret".into()],
        )
        .unwrap();
        assert_eq!(modes.get(&'k').map(String::as_str), Some("secret"));
        assert_eq!(modes.get(&'n').map(String::as_str), Some(""));

        apply_channel_modes(
            Some(&mut modes),
            &mut members,
            &avail,
            &chanmodes,
            "-k+l",
            &["secret".into(), "42".into()],
        )
        .unwrap();
        assert!(!modes.contains_key(&'k'));
        assert_eq!(modes.get(&'l').map(String::as_str), Some("42"));
    }

    #[test]
    fn type_a_consumes_argument_without_storing() {
        let avail = std_memberships();
        let chanmodes = std_channel_modes();
        let mut members = members_with(&[]);
        let mut modes = ChannelModes::new();

        apply_channel_modes(
            Some(&mut modes),
            &mut members,
            &avail,
            &chanmodes,
            "+bk",
            &["*!*@spam".into(), "key".into()],
        )
        .unwrap();
        assert!(!modes.contains_key(&'b'));
        assert_eq!(modes.get(&'k').map(String::as_str), Some("key"));
    }

    #[test]
    fn missing_plus_minus_is_error() {
        let avail = std_memberships();
        let chanmodes = std_channel_modes();
        let mut members = members_with(&[]);
        let err = apply_channel_modes(None, &mut members, &avail, &chanmodes, "nt", &[]);
        assert!(matches!(err, Err(ModeError::MissingPlusMinus(_))));
    }

    #[test]
    fn format_orders_arguments() {
        let mut modes = ChannelModes::new();
        modes.insert('n', String::new());
        modes.insert('t', String::new());
        modes.insert('k', "secret".into());
        let (s, params) = format_channel_modes(&modes);
        assert_eq!(s, "+knt");
        assert_eq!(params, ["secret"]);
    }

    #[test]
    fn parse_names_prefix_run() {
        let avail = std_memberships();
        let (ms, nick) = parse_membership_prefixes(&avail, "@+alice");
        assert_eq!(ms.prefixes(), "@+");
        assert_eq!(nick, "alice");

        let (ms, nick) = parse_membership_prefixes(&avail, "bob");
        assert!(ms.is_empty());
        assert_eq!(nick, "bob");
    }

    #[test]
    fn user_modes_apply() {
        let mut m = UserModes::default();
        m.apply("+iw").unwrap();
        assert!(m.has('i') && m.has('w'));
        m.apply("-i").unwrap();
        assert!(!m.has('i'));
        assert!(m.apply("x").is_err());
    }
}
