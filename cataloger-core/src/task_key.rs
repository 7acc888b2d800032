use time::OffsetDateTime;

use crate::ObjectId;

/// Primary key of a persisted `DocumentTask` record.
///
/// Byte layout: little-endian `id` (8 bytes) || little-endian `added_µs`
/// (8 bytes) || little-endian `modified_µs` (8 bytes) || a single `0x00`
/// separator byte || the original checksum as an ASCII-quoted escaped string
/// || the archive checksum (or the empty string, if there is no archive) as
/// an ASCII-quoted escaped string.
///
/// This layout is load-bearing: mutating any of the five key components
/// (id, added, modified, either checksum) produces a *different* key, which
/// is intentional — a document that changed upstream starts with a clean
/// retry budget under a brand new record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentTaskKey(Vec<u8>);

impl DocumentTaskKey {
    pub fn new(
        id: ObjectId,
        added: OffsetDateTime,
        modified: OffsetDateTime,
        original_checksum: &str,
        archive_checksum: Option<&str>,
    ) -> Self {
        let mut buf = Vec::with_capacity(8 * 3 + 1 + original_checksum.len() + 8);
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&micros_since_epoch(added).to_le_bytes());
        buf.extend_from_slice(&micros_since_epoch(modified).to_le_bytes());
        buf.push(0x00);
        buf.extend_from_slice(quote_ascii(original_checksum).as_bytes());
        buf.extend_from_slice(quote_ascii(archive_checksum.unwrap_or("")).as_bytes());
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

fn micros_since_epoch(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000) as i64
}

/// ASCII-quoted, backslash-escaped string: wraps `s` in double quotes and
/// escapes quotes, backslashes and non-printable bytes so the result is
/// safe to concatenate into a binary key without embedded-separator
/// ambiguity.
fn quote_ascii(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || (c as u32) > 0x7e => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
