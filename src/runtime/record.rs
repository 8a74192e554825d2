//! Flat-record codec for command lines
//!
//! Command lines look like JSON objects with scalar values only, but clients
//! (and hand-edited state files) are sloppy, so the reader is deliberately
//! lenient: a missing closing brace, bare values and duplicate keys are all
//! accepted. It never fails on malformed input; it stops at the first thing
//! it cannot make sense of and returns what it has.

use std::fmt::Write as _;

/// Ordered key/value pairs from one command line.
///
/// Keys are unique. A repeated key overwrites the earlier value but keeps
/// its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    entries: Vec<(String, String)>,
}

impl Record {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line. Returns `None` if the line does not start with `{`
    /// after leading whitespace.
    pub fn parse(line: &str) -> Option<Record> {
        let mut cursor = Cursor::new(line.trim_start());
        if !cursor.eat('{') {
            return None;
        }

        let mut record = Record::new();
        loop {
            cursor.skip_ws();
            if cursor.peek().is_none_or(|c| c == '}') {
                break;
            }
            let Some(key) = cursor.quoted() else {
                break;
            };
            cursor.skip_ws();
            if !cursor.eat(':') {
                break;
            }
            cursor.skip_ws();
            let value = if cursor.peek() == Some('"') {
                match cursor.quoted() {
                    Some(value) => value,
                    None => break,
                }
            } else {
                cursor.bare()
            };
            record.insert(key, value);

            cursor.skip_ws();
            if !cursor.eat(',') {
                break;
            }
        }
        Some(record)
    }

    /// Set `key` to `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterate entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the record has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.chars.next();
        }
    }

    /// Quoted string starting at the current `"`. `None` if unterminated.
    fn quoted(&mut self) -> Option<String> {
        if !self.eat('"') {
            return None;
        }
        let mut out = String::new();
        while let Some(c) = self.chars.next() {
            match c {
                '"' => return Some(out),
                '\\' => match self.chars.next()? {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    other => out.push(other),
                },
                other => out.push(other),
            }
        }
        None
    }

    /// Bare value up to the next `,` or `}`, trimmed.
    fn bare(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == ',' || c == '}' {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out.trim().to_string()
    }
}

/// Builder for one outgoing record line.
///
/// Strings are quoted and escaped; numbers are written bare so the line
/// stays valid JSON.
#[derive(Debug, Default)]
pub struct RecordWriter {
    out: String,
}

impl RecordWriter {
    /// Start a new record.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, key: &str) {
        self.out.push(if self.out.is_empty() { '{' } else { ',' });
        push_quoted(&mut self.out, key);
        self.out.push(':');
    }

    /// Append a string field.
    pub fn str(mut self, key: &str, value: &str) -> Self {
        self.key(key);
        push_quoted(&mut self.out, value);
        self
    }

    /// Append a numeric field. Integral values are written without a
    /// fractional part.
    pub fn num(mut self, key: &str, value: f64) -> Self {
        self.key(key);
        if value.fract() == 0.0 && value.abs() < 1e15 {
            let _ = write!(self.out, "{}", value as i64);
        } else {
            let _ = write!(self.out, "{value}");
        }
        self
    }

    /// Close the record and return the line, without a trailing newline.
    pub fn finish(mut self) -> String {
        if self.out.is_empty() {
            self.out.push('{');
        }
        self.out.push('}');
        self.out
    }
}

fn push_quoted(out: &mut String, text: &str) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
}
