//! Out-of-office auto-responses.
//!
//! After a successful delivery the unit may answer the envelope sender with
//! the mailbox's configured auto-reply. Replies are throttled per
//! (mailbox, sender) pair; the interval is shared with the bounce audit and
//! tunable from the admin console.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use chrono::Utc;
use dashmap::DashMap;
use harbinger_common::{
    context::{BoundType, Mail, RecipientList},
    services::MtaHost,
};
use serde::Deserialize;

/// Throttle entries are vacuumed once the table grows past this many pairs.
const TABLE_LIMIT: usize = 8192;

/// On-disk auto-reply settings, one file per mailbox under
/// `<home>/config/autoreply.json`.
#[derive(Debug, Deserialize)]
struct AutoReplyConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
}

/// Emits throttled out-of-office replies.
#[derive(Debug)]
pub struct AutoResponder {
    interval: AtomicU64,
    recent: DashMap<(String, String), Instant>,
}

impl AutoResponder {
    #[must_use]
    pub fn new(interval: u64) -> Self {
        Self {
            interval: AtomicU64::new(interval),
            recent: DashMap::new(),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval.load(Ordering::Relaxed)
    }

    pub fn set_interval(&self, interval: u64) {
        self.interval.store(interval, Ordering::Relaxed);
    }

    /// Send the mailbox's auto-reply to `sender`, unless the pair replied
    /// recently or the mailbox has no enabled auto-reply.
    pub async fn reply(
        &self,
        host: &dyn MtaHost,
        home_dir: &str,
        recipient: &str,
        sender: &str,
    ) {
        let key = (
            home_dir.to_ascii_lowercase(),
            sender.to_ascii_lowercase(),
        );
        let now = Instant::now();
        if let Some(last) = self.recent.get(&key) {
            if now.duration_since(*last).as_secs() < self.interval() {
                return;
            }
        }

        let path = std::path::Path::new(home_dir)
            .join("config")
            .join("autoreply.json");
        let Ok(raw) = tokio::fs::read(&path).await else {
            return;
        };
        let config: AutoReplyConfig = match serde_json::from_slice(&raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed auto-reply config");
                return;
            }
        };
        if !config.enabled {
            return;
        }

        let Some(mut context) = host.new_context() else {
            tracing::warn!(to = %sender, "failed to get auto-response context");
            return;
        };
        let subject = if config.subject.is_empty() {
            "Automatic reply".to_string()
        } else {
            config.subject
        };
        let body = format!(
            "From: {recipient}\r\n\
             To: {sender}\r\n\
             Date: {date}\r\n\
             Subject: {subject}\r\n\
             Auto-Submitted: auto-replied\r\n\
             X-Auto-Response-Suppress: All\r\n\
             \r\n\
             {text}\r\n",
            date = Utc::now().to_rfc2822(),
            text = config.body,
        );
        context.mail = Mail::new(body.into_bytes());
        context.control.bound_type = BoundType::App;
        context.control.from = recipient.to_string();
        context.control.need_bounce = false;
        let mut rcpt_to = RecipientList::new();
        rcpt_to.write_line(sender.to_string());
        context.control.rcpt_to = rcpt_to;
        host.enqueue(context);

        self.recent.insert(key, now);
        if self.recent.len() > TABLE_LIMIT {
            let interval = self.interval();
            self.recent
                .retain(|_, last| now.duration_since(*last).as_secs() < interval);
        }
    }
}
