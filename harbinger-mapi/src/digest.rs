//! Digest envelope consumed by the mailbox store.
//!
//! The store indexes a delivered message from a compact JSON summary whose
//! first member is always the materialized file name:
//! `{"file":"<name>",<digest fields>}`. The whole envelope must stay under
//! 256 KiB.

use harbinger_common::context::Mail;
use mailparse::MailHeaderMap;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Upper bound on the rendered envelope, in bytes.
pub const MAX_DIGEST_LEN: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("malformed RFC-822 stream: {0}")]
    Parse(String),

    #[error("digest would exceed {MAX_DIGEST_LEN} bytes ({0})")]
    TooLarge(usize),
}

/// Build the digest envelope for a materialized message.
pub fn build_digest(file_name: &str, mail: &Mail) -> Result<String, DigestError> {
    let parsed =
        mailparse::parse_mail(mail.bytes()).map_err(|e| DigestError::Parse(e.to_string()))?;
    let headers = &parsed.headers;

    let mut fields = Map::new();
    fields.insert("bytes".to_string(), json!(mail.len()));
    for (key, header) in [
        ("from", "From"),
        ("to", "To"),
        ("cc", "Cc"),
        ("subject", "Subject"),
        ("msgid", "Message-ID"),
        ("date", "Date"),
    ] {
        if let Some(value) = headers.get_first_value(header) {
            fields.insert(key.to_string(), json!(value));
        }
    }
    if let Some(priority) = headers.get_first_value("X-Priority") {
        fields.insert("priority".to_string(), json!(priority));
    }
    if !parsed.subparts.is_empty() {
        fields.insert("parts".to_string(), json!(parsed.subparts.len()));
    }

    let body = serde_json::to_string(&Value::Object(fields))
        .map_err(|e| DigestError::Parse(e.to_string()))?;
    // splice the digest fields after the "file" member, dropping the
    // object's own braces
    let inner = &body[1..body.len() - 1];
    let file = serde_json::to_string(file_name).map_err(|e| DigestError::Parse(e.to_string()))?;
    let envelope = format!("{{\"file\":{file},{inner}}}");

    if envelope.len() >= MAX_DIGEST_LEN {
        return Err(DigestError::TooLarge(envelope.len()));
    }
    Ok(envelope)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: alice@example.com\r\n\
To: bob@example.com\r\n\
Subject: report\r\n\
Message-ID: <m2@example.com>\r\n\
\r\n\
body\r\n";

    #[test]
    fn envelope_starts_with_the_file_member() {
        let digest = build_digest("1700000000.7.mx1", &Mail::new(SAMPLE)).unwrap();
        assert!(digest.starts_with("{\"file\":\"1700000000.7.mx1\","));
        assert!(digest.ends_with('}'));
    }

    #[test]
    fn envelope_is_valid_json_with_expected_fields() {
        let digest = build_digest("f", &Mail::new(SAMPLE)).unwrap();
        let value: Value = serde_json::from_str(&digest).unwrap();
        assert_eq!(value["file"], "f");
        assert_eq!(value["from"], "alice@example.com");
        assert_eq!(value["subject"], "report");
        assert_eq!(value["bytes"], SAMPLE.len());
    }

    #[test]
    fn oversized_digest_is_rejected() {
        let subject = "x".repeat(MAX_DIGEST_LEN);
        let raw = format!("Subject: {subject}\r\n\r\nbody\r\n");
        let err = build_digest("f", &Mail::new(raw.into_bytes())).unwrap_err();
        assert!(matches!(err, DigestError::TooLarge(_)));
    }

    #[test]
    fn file_names_are_json_escaped() {
        let digest = build_digest("odd\"name", &Mail::new(SAMPLE)).unwrap();
        let value: Value = serde_json::from_str(&digest).unwrap();
        assert_eq!(value["file"], "odd\"name");
    }
}
