//! Wire format for broadcast heartbeats.
//!
//! Every owner periodically announces `"<nonce>:<id>"` on the broadcast
//! channel. The nonce never contains `:` and the id is decimal. Parsing
//! splits on the first `:`; anything that does not yield a nonce and a
//! decimal id is malformed, and readers log and skip it.

/// A decoded heartbeat advertisement from the broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Heartbeat<'a> {
    /// The advertising session's nonce.
    pub nonce: &'a str,
    /// The id the session claims to own.
    pub id: u32,
}

impl<'a> Heartbeat<'a> {
    /// Parse a broadcast payload. Returns `None` for malformed payloads.
    pub fn parse(payload: &'a str) -> Option<Self> {
        let (nonce, id) = payload.split_once(':')?;
        let id = id.parse().ok()?;
        Some(Self { nonce, id })
    }

    /// Encode the payload advertising `id` under `nonce`.
    pub fn encode(nonce: &str, id: u32) -> String {
        format!("{nonce}:{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_nonce_and_id() {
        assert_eq!(Heartbeat::encode("abc-123", 42), "abc-123:42");
    }

    #[test]
    fn parses_encoded_payload() {
        let payload = Heartbeat::encode("abc-123", 42);
        let heartbeat = Heartbeat::parse(&payload).unwrap();
        assert_eq!(heartbeat.nonce, "abc-123");
        assert_eq!(heartbeat.id, 42);
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(Heartbeat::parse("no-separator"), None);
    }

    #[test]
    fn rejects_non_decimal_id() {
        assert_eq!(Heartbeat::parse("nonce:abc"), None);
    }

    #[test]
    fn rejects_extra_separator() {
        // Split happens on the first `:`, so the rest must still be decimal.
        assert_eq!(Heartbeat::parse("a:b:1"), None);
    }

    #[test]
    fn rejects_negative_id() {
        assert_eq!(Heartbeat::parse("nonce:-3"), None);
    }

    #[test]
    fn rejects_empty_payload() {
        assert_eq!(Heartbeat::parse(""), None);
    }
}
