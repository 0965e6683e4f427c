//! RFC-822 to MAPI import.
//!
//! Maps the transport headers of a message onto message properties. MIME
//! structure (attachments, nested parts) is the store's business; this layer
//! only lifts the addressing, subject, timing, and notification-request
//! headers, plus the text body, into the property bag.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone};
use harbinger_common::{context::Mail, services::UserDirectory};
use mailparse::{MailHeaderMap, ParsedMail};
use thiserror::Error;

use crate::{
    arena::ImportScratch,
    message::{MapiMessage, PropValue},
    nttime,
    propnames::{NamedPropertyMap, PropertyName, PROPID_UNRESOLVED},
    proptag::{self, make_tag, PT_UNICODE},
};

/// GUID of the public-strings property set used for free-form headers.
const PS_PUBLIC_STRINGS: &str = "00020329-0000-0000-c000-000000000046";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed RFC-822 stream: {0}")]
    Parse(String),
}

/// Converts an RFC-822 stream into a [`MapiMessage`] under a recipient's
/// charset and timezone.
pub struct Importer {
    names: Arc<NamedPropertyMap>,
    directory: Arc<dyn UserDirectory>,
}

impl Importer {
    pub fn new(names: Arc<NamedPropertyMap>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { names, directory }
    }

    /// Import `mail`. All intermediate allocations go through `scratch`,
    /// which the caller drops (or resets) once the returned message has
    /// been handed to the store.
    pub fn import(
        &self,
        charset: &str,
        timezone: &str,
        mail: &Mail,
        scratch: &mut ImportScratch,
    ) -> Result<MapiMessage, ImportError> {
        let parsed =
            mailparse::parse_mail(mail.bytes()).map_err(|e| ImportError::Parse(e.to_string()))?;
        let headers = &parsed.headers;

        let mut msg = MapiMessage::new();
        msg.set(
            proptag::MESSAGE_CLASS,
            PropValue::Unicode("IPM.Note".to_string()),
        );
        if let Some(cpid) = self.directory.charset_to_cpid(charset) {
            msg.set(proptag::INTERNET_CPID, PropValue::Long(cpid));
        }

        if let Some(from) = headers.get_first_value("From") {
            if let Ok(addrs) = mailparse::addrparse(&from) {
                if let Some(mailparse::MailAddr::Single(info)) = addrs.iter().next() {
                    if let Some(name) = &info.display_name {
                        msg.set(proptag::SENDER_NAME, PropValue::Unicode(name.clone()));
                    }
                    msg.set(
                        proptag::SENDER_EMAIL_ADDRESS,
                        PropValue::Unicode(info.addr.clone()),
                    );
                }
            }
        }
        if let Some(to) = headers.get_first_value("To") {
            msg.set(proptag::DISPLAY_TO, PropValue::Unicode(to));
        }
        if let Some(cc) = headers.get_first_value("Cc") {
            msg.set(proptag::DISPLAY_CC, PropValue::Unicode(cc));
        }
        if let Some(subject) = headers.get_first_value("Subject") {
            msg.set(proptag::SUBJECT, PropValue::Unicode(subject));
        }
        if let Some(message_id) = headers.get_first_value("Message-ID") {
            msg.set(
                proptag::INTERNET_MESSAGE_ID,
                PropValue::Unicode(message_id),
            );
        }
        if let Some(date) = headers.get_first_value("Date") {
            if let Some(nt) = submit_time(&date, timezone) {
                msg.set(proptag::CLIENT_SUBMIT_TIME, PropValue::SysTime(nt));
            }
        }
        msg.set(
            proptag::IMPORTANCE,
            PropValue::Long(importance(headers.get_first_value("Importance"), headers.get_first_value("X-Priority"))),
        );

        if headers.get_first_value("Return-Receipt-To").is_some() {
            msg.set(
                proptag::ORIGINATOR_DELIVERY_REPORT_REQUESTED,
                PropValue::Bool(true),
            );
        }
        if headers.get_first_value("Disposition-Notification-To").is_some() {
            msg.set(proptag::READ_RECEIPT_REQUESTED, PropValue::Bool(true));
        }

        if let Some(keywords) = headers.get_first_value("Keywords") {
            let name = PropertyName::name(PS_PUBLIC_STRINGS, "keywords");
            let id = self.names.resolve(&name, scratch);
            if id != PROPID_UNRESOLVED {
                msg.set(make_tag(id, PT_UNICODE), PropValue::Unicode(keywords));
            }
        }

        if let Some(body) = text_body(&parsed) {
            msg.set(proptag::BODY, PropValue::Unicode(body));
        }

        Ok(msg)
    }
}

/// Find the first `text/plain` leaf, depth-first.
fn text_body(part: &ParsedMail) -> Option<String> {
    if part.subparts.is_empty() {
        if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return part.get_body().ok();
        }
        return None;
    }
    part.subparts.iter().find_map(text_body)
}

/// Parse a Date header into NT time. A header with an explicit zone stands
/// on its own; a zoneless one is interpreted in the recipient's timezone.
fn submit_time(date: &str, timezone: &str) -> Option<u64> {
    let date = date.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(date) {
        return unix_secs(dt.timestamp());
    }
    let naive = ["%a, %d %b %Y %H:%M:%S", "%d %b %Y %H:%M:%S"]
        .into_iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(date, fmt).ok())?;
    let tz: chrono_tz::Tz = timezone.parse().ok()?;
    let local = tz.from_local_datetime(&naive).single()?;
    unix_secs(local.timestamp())
}

fn unix_secs(timestamp: i64) -> Option<u64> {
    u64::try_from(timestamp).ok().map(nttime::unix_to_nt)
}

fn importance(header: Option<String>, x_priority: Option<String>) -> u32 {
    if let Some(value) = header {
        return match value.trim().to_ascii_lowercase().as_str() {
            "high" => 2,
            "low" => 0,
            _ => 1,
        };
    }
    match x_priority
        .and_then(|p| p.trim().chars().next())
        .and_then(|c| c.to_digit(10))
    {
        Some(1 | 2) => 2,
        Some(4 | 5) => 0,
        _ => 1,
    }
}
