//! Bounce production.
//!
//! Builds the delivery-status messages the hook dispatcher and the retry
//! cache send back to envelope senders: delivery receipts, no-such-user and
//! quota failures, processing errors, and retry expiry. Subjects and
//! human-readable bodies come from an on-disk template set that the admin
//! console can reload; rendering is best-effort and never alters how the
//! triggering delivery was classified.

use std::{
    fmt::Write as _,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use harbinger_common::{
    context::{Mail, MessageControl, RecipientList},
    services::MtaHost,
};
use parking_lot::RwLock;

use crate::audit::BounceAudit;

/// What a bounce reports about the original message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BounceKind {
    /// Delivery receipt: the message arrived and the sender asked to know.
    Delivered,
    NoUser,
    MailboxFull,
    /// The message could not be processed into the store.
    OperationError,
    /// The retry cache gave up on the message.
    Timeout,
}

impl BounceKind {
    /// Template file stem under the templates directory.
    const fn stem(self) -> &'static str {
        match self {
            Self::Delivered => "mail_delivered",
            Self::NoUser => "no_user",
            Self::MailboxFull => "mailbox_full",
            Self::OperationError => "operation_error",
            Self::Timeout => "timeout",
        }
    }

    /// RFC 3464 per-recipient action and enhanced status code.
    const fn action_status(self) -> (&'static str, &'static str) {
        match self {
            Self::Delivered => ("delivered", "2.0.0"),
            Self::NoUser => ("failed", "5.1.1"),
            Self::MailboxFull => ("failed", "5.2.2"),
            Self::OperationError => ("failed", "5.3.0"),
            Self::Timeout => ("failed", "4.4.7"),
        }
    }

    fn default_template(self) -> BounceTemplate {
        let (subject, body) = match self {
            Self::Delivered => (
                "Delivery receipt",
                "Your message to {recipient} was delivered at {time}.\n",
            ),
            Self::NoUser => (
                "Undelivered mail: no such user",
                "Your message could not be delivered:\n\n\
                 {recipient}: no such user in the mail system.\n",
            ),
            Self::MailboxFull => (
                "Undelivered mail: mailbox full",
                "Your message could not be delivered:\n\n\
                 {recipient}: the recipient's mailbox is full.\n",
            ),
            Self::OperationError => (
                "Undelivered mail: processing error",
                "Your message could not be delivered:\n\n\
                 {recipient}: the message could not be processed into the \
                 recipient's mailbox.\n",
            ),
            Self::Timeout => (
                "Undelivered mail: delivery timed out",
                "Your message could not be delivered:\n\n\
                 {recipient}: delivery kept failing and has been abandoned.\n",
            ),
        };
        BounceTemplate {
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

/// One rendered-from-disk (or built-in) bounce text.
#[derive(Debug, Clone)]
pub struct BounceTemplate {
    pub subject: String,
    pub body: String,
}

const ALL_KINDS: [BounceKind; 5] = [
    BounceKind::Delivered,
    BounceKind::NoUser,
    BounceKind::MailboxFull,
    BounceKind::OperationError,
    BounceKind::Timeout,
];

static BOUNDARY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Renders bounce messages from a reloadable template set.
#[derive(Debug)]
pub struct BounceProducer {
    reporting_mta: String,
    templates_dir: Option<PathBuf>,
    templates: RwLock<AHashMap<BounceKind, BounceTemplate>>,
}

impl BounceProducer {
    /// `reporting_mta` names this host in the machine-readable part. When
    /// `templates_dir` is `None` the built-in texts are used.
    #[must_use]
    pub fn new(reporting_mta: impl Into<String>, templates_dir: Option<PathBuf>) -> Self {
        let producer = Self {
            reporting_mta: reporting_mta.into(),
            templates_dir,
            templates: RwLock::new(AHashMap::new()),
        };
        producer.refresh();
        producer
    }

    /// Reload templates from disk. A missing file falls back to the built-in
    /// text for that kind; any other read error keeps the previous set and
    /// reports failure.
    pub fn refresh(&self) -> bool {
        let mut fresh = AHashMap::new();
        for kind in ALL_KINDS {
            let mut template = kind.default_template();
            if let Some(dir) = &self.templates_dir {
                match std::fs::read_to_string(dir.join(format!("{}.tmpl", kind.stem()))) {
                    Ok(text) => template = parse_template(&text, template),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(kind = kind.stem(), error = %e, "failed to reload bounce template");
                        return false;
                    }
                }
            }
            fresh.insert(kind, template);
        }
        *self.templates.write() = fresh;
        true
    }

    /// Render the bounce mail for `kind`, addressed to the original sender.
    #[must_use]
    pub fn produce(
        &self,
        postmaster: &str,
        original_sender: &str,
        recipient: &str,
        original: &Mail,
        time: DateTime<Utc>,
        kind: BounceKind,
    ) -> Mail {
        let template = self
            .templates
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_template());

        let timestamp = time.to_rfc2822();
        let human = template
            .body
            .replace("{recipient}", recipient)
            .replace("{sender}", original_sender)
            .replace("{time}", &timestamp);

        let (action, status) = kind.action_status();
        let mut machine = format!("Reporting-MTA: dns; {}\r\n", self.reporting_mta);
        let _ = write!(machine, "Arrival-Date: {timestamp}\r\n\r\n");
        let _ = write!(machine, "Final-Recipient: rfc822; {recipient}\r\n");
        let _ = write!(machine, "Action: {action}\r\n");
        let _ = write!(machine, "Status: {status}\r\n");

        let original_headers = head_of(original.bytes());

        let boundary = format!(
            "----=_Part_{}_{}",
            time.timestamp_micros(),
            BOUNDARY_SEQ.fetch_add(1, Ordering::Relaxed),
        );
        let body = format!(
            "Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
             MIME-Version: 1.0\r\n\
             From: Mail Delivery System <{postmaster}>\r\n\
             To: {original_sender}\r\n\
             Date: {timestamp}\r\n\
             Subject: {subject}\r\n\
             Auto-Submitted: auto-replied\r\n\
             \r\n\
             This is a multi-part message in MIME format.\r\n\
             \r\n\
             --{boundary}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             {human}\r\n\
             --{boundary}\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             {machine}\r\n\
             --{boundary}\r\n\
             Content-Type: text/rfc822-headers\r\n\
             \r\n\
             {original_headers}\r\n\
             --{boundary}--\r\n",
            subject = template.subject,
        );
        Mail::new(body.into_bytes())
    }
}

/// First line `Subject: …`, remainder the body; anything else falls back to
/// the built-in for the missing half.
fn parse_template(text: &str, fallback: BounceTemplate) -> BounceTemplate {
    let mut lines = text.splitn(2, '\n');
    let first = lines.next().unwrap_or_default().trim_end_matches('\r');
    let rest = lines.next().unwrap_or_default();
    first.strip_prefix("Subject:").map_or(fallback, |subject| BounceTemplate {
        subject: subject.trim().to_string(),
        body: rest.to_string(),
    })
}

/// Original headers, capped at 1 KiB for the third report part.
fn head_of(data: &[u8]) -> String {
    let end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or_else(|| data.len().min(1024));
    String::from_utf8_lossy(&data[..end.min(1024)]).into_owned()
}

/// Applies the no-loop and audit gates, then builds and enqueues a bounce in
/// a context borrowed from the host pool.
pub struct Bouncer {
    host: Arc<dyn MtaHost>,
    audit: Arc<BounceAudit>,
    producer: Arc<BounceProducer>,
}

impl Bouncer {
    pub fn new(
        host: Arc<dyn MtaHost>,
        audit: Arc<BounceAudit>,
        producer: Arc<BounceProducer>,
    ) -> Self {
        Self {
            host,
            audit,
            producer,
        }
    }

    /// Produce a bounce of `kind` for `recipient` back to the sender in
    /// `control`. Quietly does nothing when the original asked for no
    /// bounces, when the sender is the no-reply address, when the audit
    /// denies the recipient, or when the context pool is exhausted.
    pub fn bounce(
        &self,
        control: &MessageControl,
        recipient: &str,
        original: &Mail,
        kind: BounceKind,
    ) {
        if !control.need_bounce || control.from.eq_ignore_ascii_case("none@none") {
            return;
        }
        let Some(mut context) = self.host.new_context() else {
            tracing::warn!(
                from = %control.from,
                to = %recipient,
                "failed to get bounce context"
            );
            return;
        };
        if !self.audit.check(recipient) {
            tracing::info!(
                to = %recipient,
                "will not produce bounce message, too many mails to recipient"
            );
            self.host.recycle(context);
            return;
        }

        let postmaster = format!("postmaster@{}", self.host.default_domain());
        context.mail = self.producer.produce(
            &postmaster,
            &control.from,
            recipient,
            original,
            Utc::now(),
            kind,
        );
        context.control.need_bounce = false;
        context.control.from = postmaster;
        let mut rcpt_to = RecipientList::new();
        rcpt_to.write_line(control.from.clone());
        context.control.rcpt_to = rcpt_to;
        self.host.enqueue(context);
    }
}
