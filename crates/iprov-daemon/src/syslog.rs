//! Device syslog decoding
//!
//! `iosif log` frames each record as `*<count><json array>` where `count` is
//! the decimal byte length of the JSON plus its trailing newline. Long records
//! wrap onto further output lines and are reassembled here. `go-ios syslog`
//! prints one plain line per record instead.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::bridge::value_text;
use iprov_core::prelude::*;
use iprov_core::types::LogItem;

/// The count never has more digits than this
const MAX_COUNT_DIGITS: usize = 5;

/// Reassembles `*<count>[...]` records from output lines
#[derive(Debug, Default)]
pub struct LogRecordDecoder {
    buf: String,
    /// Bytes of the current record still expected, newlines included
    remaining: usize,
}

impl LogRecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output line; returns a record once one is complete
    pub fn push_line(&mut self, line: &str) -> Option<LogItem> {
        if let Some(framed) = line.strip_prefix('*') {
            return self.start_record(framed);
        }
        if self.remaining == 0 {
            return None;
        }

        self.buf.push_str(line);
        let consumed = line.len() + 1;
        if consumed >= self.remaining {
            self.remaining = 0;
            let record = std::mem::take(&mut self.buf);
            return decode_record(&record);
        }
        self.remaining -= consumed;
        self.buf.push('\n');
        None
    }

    fn start_record(&mut self, framed: &str) -> Option<LogItem> {
        self.buf.clear();
        self.remaining = 0;

        let digits = framed
            .char_indices()
            .take(MAX_COUNT_DIGITS + 1)
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)?;
        let count: usize = framed[..digits].parse().ok()?;
        let json = &framed[digits..];

        let consumed = json.len() + 1;
        if consumed >= count {
            return decode_record(json);
        }
        self.buf.push_str(json);
        self.buf.push('\n');
        self.remaining = count - consumed;
        None
    }
}

fn decode_record(json: &str) -> Option<LogItem> {
    let record: Vec<Value> = match serde_json::from_str(json) {
        Ok(record) => record,
        Err(e) => {
            debug!("Could not parse syslog record: {}", e);
            return None;
        }
    };
    Some(LogItem {
        app: record.get(1).map(value_text).unwrap_or_default(),
        msg: record.get(3).map(value_text).unwrap_or_default(),
    })
}

static PLAIN_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // "Oct 18 10:01:02 iPhone SpringBoard(FrontBoard)[57] <Notice>: message"
    Regex::new(r"^\w{3}\s+\d+ \d{2}:\d{2}:\d{2} \S+ ([^\[]+)\[\d+\] <[^>]*>: ?(.*)$")
        .expect("Invalid syslog line regex")
});

static UNICODE_ESCAPE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\u([0-9a-fA-F]{4})").expect("Invalid unicode escape regex"));

/// Parse one plain syslog line
pub fn parse_plain_line(line: &str) -> Option<LogItem> {
    let caps = PLAIN_LINE_REGEX.captures(line)?;
    let msg = UNICODE_ESCAPE_REGEX.replace_all(&caps[2], |c: &regex::Captures| {
        u32::from_str_radix(&c[1], 16)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    Some(LogItem {
        app: caps[1].to_string(),
        msg: msg.into_owned(),
    })
}
