//! IRCv3 message tag value escaping.

use std::fmt::{Result as FmtResult, Write};

/// Escape a tag value per the IRCv3 message-tags spec.
pub fn escape_tag_value(f: &mut dyn Write, value: &str) -> FmtResult {
    for c in value.chars() {
        match c {
            ';' => f.write_str("\\:")?,
            ' ' => f.write_str("\\s")?,
            '\\' => f.write_str("\\\\")?,
            '\r' => f.write_str("\\r")?,
            '\n' => f.write_str("\\n")?,
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

/// Unescape a tag value from wire format.
///
/// A trailing lone backslash and unknown escapes drop the backslash.
pub fn unescape_tag_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        let r = if c == '\\' {
            match iter.next() {
                Some(':') => ';',
                Some('s') => ' ',
                Some('\\') => '\\',
                Some('r') => '\r',
                Some('n') => '\n',
                Some(c) => c,
                None => break,
            }
        } else {
            c
        };
        unescaped.push(r);
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_sequences() {
        assert_eq!(unescape_tag_value("a\\:b"), "a;b");
        assert_eq!(unescape_tag_value("hello\\sworld"), "hello world");
        assert_eq!(unescape_tag_value("path\\\\file"), "path\\file");
        assert_eq!(unescape_tag_value("line\\rend"), "line\rend");
        assert_eq!(unescape_tag_value("line\\nend"), "line\nend");
        assert_eq!(unescape_tag_value("test\\"), "test");
        assert_eq!(unescape_tag_value("a\\xb"), "axb");
    }

    #[test]
    fn escape_roundtrip() {
        for original in ["simple", "with space", "with;semi", "a\\b", "n\nl"] {
            let mut escaped = String::new();
            escape_tag_value(&mut escaped, original).unwrap();
            assert_eq!(unescape_tag_value(&escaped), original);
        }
    }
}
