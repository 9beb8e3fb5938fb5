//! Opaque pagination cursors.
//!
//! A cursor packs the sort value and row id of the last item on a page into
//! an URL-safe base64 blob. Decoding is total: anything that is not a valid
//! cursor yields none rather than an error, and the caller treats that as
//! invalid input.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use uuid::Uuid;

const SEPARATOR: char = '|';

/// Encode a `(sort value, id)` pair into an opaque cursor.
pub fn encode_cursor(value: &str, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{value}{SEPARATOR}{id}"))
}

/// Decode a cursor back into its `(sort value, id)` pair.
pub fn decode_cursor(cursor: &str) -> Option<(String, Uuid)> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    // The id never contains the separator, so split from the right.
    let (value, id_text) = text.rsplit_once(SEPARATOR)?;
    let id = Uuid::parse_str(id_text).ok()?;
    Some((value.to_string(), id))
}
