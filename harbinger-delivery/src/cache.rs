//! Durable retry queue for transiently failed deliveries.
//!
//! Each deferred message lives on disk as `<id>.eml` (the raw message) plus
//! `<id>.ctl` (one tab-separated control line). A periodic scanner re-drives
//! the delivery unit for each entry: transient failures bump the attempt
//! counter, terminal outcomes remove the entry and emit whatever bounce the
//! outcome calls for, and entries that exhaust `retrying_times` are expired
//! with a timeout bounce.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use harbinger_common::{
    context::{BoundType, Mail, MessageContext, MessageControl, RecipientList},
    escape::{escape_field, unescape_field},
    stats::DeliveryStats,
    Signal,
};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    bounce::{BounceKind, Bouncer},
    error::DeliveryOutcome,
    quota::{log_delivery, DeliveryUnit},
};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control line of one cached entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub cache_id: u32,
    pub bound_type: BoundType,
    pub from: String,
    pub rcpt: String,
    pub need_bounce: bool,
    pub queue_id: u32,
    pub first_attempt: u64,
    pub last_attempt: u64,
    pub attempts: u32,
}

impl CacheEntry {
    fn to_line(&self) -> String {
        [
            self.cache_id.to_string(),
            self.bound_type.as_str().to_string(),
            escape_field(&self.from),
            escape_field(&self.rcpt),
            u32::from(self.need_bounce).to_string(),
            self.queue_id.to_string(),
            self.first_attempt.to_string(),
            self.last_attempt.to_string(),
            self.attempts.to_string(),
        ]
        .join("\t")
    }

    fn from_line(line: &str) -> Option<Self> {
        let mut fields = line.trim_end().split('\t');
        let entry = Self {
            cache_id: fields.next()?.parse().ok()?,
            bound_type: BoundType::from_str(fields.next()?).ok()?,
            from: unescape_field(fields.next()?),
            rcpt: unescape_field(fields.next()?),
            need_bounce: fields.next()? == "1",
            queue_id: fields.next()?.parse().ok()?,
            first_attempt: fields.next()?.parse().ok()?,
            last_attempt: fields.next()?.parse().ok()?,
            attempts: fields.next()?.parse().ok()?,
        };
        fields.next().is_none().then_some(entry)
    }
}

/// On-disk queue of deferred deliveries.
#[derive(Debug)]
pub struct RetryCache {
    dir: PathBuf,
    scan_interval: AtomicU64,
    retrying_times: AtomicU32,
    next_id: AtomicU32,
}

impl RetryCache {
    /// Open (and create) the cache directory, resuming id assignment after
    /// the highest id already on disk.
    pub fn open(
        dir: impl Into<PathBuf>,
        scan_interval: u64,
        retrying_times: u32,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut max_id = 0;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "ctl") {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u32>().ok())
                {
                    max_id = max_id.max(id);
                }
            }
        }
        Ok(Self {
            dir,
            scan_interval: AtomicU64::new(scan_interval),
            retrying_times: AtomicU32::new(retrying_times),
            next_id: AtomicU32::new(max_id + 1),
        })
    }

    pub fn scan_interval(&self) -> u64 {
        self.scan_interval.load(Ordering::Relaxed)
    }

    pub fn set_scan_interval(&self, interval: u64) {
        self.scan_interval.store(interval, Ordering::Relaxed);
    }

    pub fn retrying_times(&self) -> u32 {
        self.retrying_times.load(Ordering::Relaxed)
    }

    pub fn set_retrying_times(&self, times: u32) {
        self.retrying_times.store(times, Ordering::Relaxed);
    }

    /// Defer `recipient`'s copy of the context's message. Returns the
    /// assigned cache id.
    pub async fn put(
        &self,
        context: &MessageContext,
        recipient: &str,
        now: u64,
    ) -> Result<u32, CacheError> {
        let cache_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry {
            cache_id,
            bound_type: context.control.bound_type,
            from: context.control.from.clone(),
            rcpt: recipient.to_string(),
            need_bounce: context.control.need_bounce,
            queue_id: context.control.queue_id,
            first_attempt: now,
            last_attempt: now,
            attempts: 0,
        };

        let eml = self.dir.join(format!("{cache_id}.eml"));
        write_atomically(&eml, context.mail.bytes()).await?;
        if let Err(e) = self.write_entry(&entry).await {
            let _ = tokio::fs::remove_file(&eml).await;
            return Err(e);
        }
        Ok(cache_id)
    }

    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.dir.join(format!("{}.ctl", entry.cache_id));
        let mut line = entry.to_line();
        line.push('\n');
        write_atomically(&path, line.as_bytes()).await
    }

    async fn remove_entry(&self, cache_id: u32) {
        let _ = tokio::fs::remove_file(self.dir.join(format!("{cache_id}.ctl"))).await;
        let _ = tokio::fs::remove_file(self.dir.join(format!("{cache_id}.eml"))).await;
    }

    /// Run the periodic scanner until shutdown. The sleep is re-read each
    /// cycle so console changes to the scan interval apply on the next turn.
    pub async fn serve(
        self: Arc<Self>,
        unit: Arc<DeliveryUnit>,
        bouncer: Arc<Bouncer>,
        stats: Arc<DeliveryStats>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        harbinger_common::internal!(level = INFO, "retry cache scanner starting");
        loop {
            let pause = Duration::from_secs(self.scan_interval().max(1));
            tokio::select! {
                () = tokio::time::sleep(pause) => {
                    self.scan(&unit, &bouncer, &stats).await;
                }
                _ = shutdown.recv() => {
                    harbinger_common::internal!(level = INFO, "retry cache scanner shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over every cached entry.
    pub async fn scan(&self, unit: &DeliveryUnit, bouncer: &Bouncer, stats: &DeliveryStats) {
        let entries = match self.load_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(dir = %self.dir.display(), error = %e, "failed to scan retry cache");
                return;
            }
        };
        let now = unix_now();
        for mut entry in entries {
            let eml_path = self.dir.join(format!("{}.eml", entry.cache_id));
            let Ok(raw) = tokio::fs::read(&eml_path).await else {
                tracing::warn!(cache_id = entry.cache_id, "cached message payload missing, dropping entry");
                self.remove_entry(entry.cache_id).await;
                continue;
            };
            let mail = Mail::new(raw);
            let control = MessageControl {
                bound_type: entry.bound_type,
                from: entry.from.clone(),
                rcpt_to: std::iter::once(entry.rcpt.clone()).collect::<RecipientList>(),
                need_bounce: entry.need_bounce,
                queue_id: entry.queue_id,
            };

            if entry.attempts >= self.retrying_times() {
                log_delivery(
                    &control,
                    &entry.rcpt,
                    &format!(
                        "cache entry {} timed out after {} attempts",
                        entry.cache_id, entry.attempts
                    ),
                );
                bouncer.bounce(&control, &entry.rcpt, &mail, BounceKind::Timeout);
                self.remove_entry(entry.cache_id).await;
                continue;
            }
            if now.saturating_sub(entry.last_attempt) < self.scan_interval() {
                continue;
            }

            let context = MessageContext {
                control,
                mail,
            };
            match unit.deliver(&context, &entry.rcpt).await {
                DeliveryOutcome::Transient => {
                    entry.attempts += 1;
                    entry.last_attempt = now;
                    if let Err(e) = self.write_entry(&entry).await {
                        tracing::error!(
                            cache_id = entry.cache_id,
                            error = %e,
                            "failed to update cache entry"
                        );
                    }
                }
                outcome => {
                    match outcome {
                        DeliveryOutcome::Ok => stats.record_ok(),
                        DeliveryOutcome::DeliveredWithReceipt => {
                            stats.record_ok();
                            bouncer.bounce(
                                &context.control,
                                &entry.rcpt,
                                &context.mail,
                                BounceKind::Delivered,
                            );
                        }
                        DeliveryOutcome::NoUser => {
                            stats.record_nouser();
                            bouncer.bounce(
                                &context.control,
                                &entry.rcpt,
                                &context.mail,
                                BounceKind::NoUser,
                            );
                        }
                        DeliveryOutcome::MailboxFull => {
                            bouncer.bounce(
                                &context.control,
                                &entry.rcpt,
                                &context.mail,
                                BounceKind::MailboxFull,
                            );
                        }
                        DeliveryOutcome::Permanent => {
                            stats.record_permanent();
                            bouncer.bounce(
                                &context.control,
                                &entry.rcpt,
                                &context.mail,
                                BounceKind::OperationError,
                            );
                        }
                        DeliveryOutcome::Transient => unreachable!(),
                    }
                    self.remove_entry(entry.cache_id).await;
                }
            }
        }
    }

    pub(crate) async fn load_entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if !path.extension().is_some_and(|ext| ext == "ctl") {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            match CacheEntry::from_line(&text) {
                Some(entry) => entries.push(entry),
                None => {
                    tracing::warn!(path = %path.display(), "malformed cache control line, skipping");
                }
            }
        }
        entries.sort_by_key(|entry| entry.cache_id);
        Ok(entries)
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use harbinger_common::services::{MtaHost, UserDirectory};
    use harbinger_mapi::{Importer, NamedPropertyMap};

    use super::*;
    use crate::{
        audit::BounceAudit,
        bounce::BounceProducer,
        quota::tests::{sample_context, TestDirectory, TestHost, TestStore},
        response::AutoResponder,
        store::StoreStatus,
    };

    #[test]
    fn control_line_round_trips() {
        let entry = CacheEntry {
            cache_id: 12,
            bound_type: BoundType::In,
            from: "a b@example.com".to_string(),
            rcpt: "user#1@local.test".to_string(),
            need_bounce: true,
            queue_id: 99,
            first_attempt: 1000,
            last_attempt: 2000,
            attempts: 3,
        };
        let line = entry.to_line();
        assert_eq!(CacheEntry::from_line(&line), Some(entry));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(CacheEntry::from_line(""), None);
        assert_eq!(CacheEntry::from_line("1\tin\tf"), None);
        assert_eq!(
            CacheEntry::from_line("1\tnowhere\tf\tr\t1\t0\t0\t0\t0"),
            None
        );
    }

    fn assembly(
        home: &Path,
        status: StoreStatus,
    ) -> (Arc<RetryCache>, Arc<DeliveryUnit>, Arc<Bouncer>, Arc<TestHost>, Arc<TestStore>, tempfile::TempDir) {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(RetryCache::open(cache_dir.path(), 0, 2).unwrap());

        let directory = Arc::new(TestDirectory {
            home: home.to_str().unwrap().to_string(),
            fail_lookup: false,
        });
        let host = Arc::new(TestHost::default());
        let store = Arc::new(TestStore::with_status(status));
        let importer = Importer::new(
            Arc::new(NamedPropertyMap::from_lines([])),
            Arc::clone(&directory) as Arc<dyn UserDirectory>,
        );
        let unit = Arc::new(DeliveryUnit::new(
            Arc::clone(&directory) as Arc<dyn UserDirectory>,
            Arc::clone(&host) as Arc<dyn MtaHost>,
            Arc::clone(&store) as Arc<dyn crate::store::MessageStore>,
            Arc::new(AutoResponder::new(180)),
            importer,
            "utf-8",
            "UTC",
        ));
        let bouncer = Arc::new(Bouncer::new(
            Arc::clone(&host) as Arc<dyn MtaHost>,
            Arc::new(BounceAudit::new(100, 3600)),
            Arc::new(BounceProducer::new("mx1", None)),
        ));
        (cache, unit, bouncer, host, store, cache_dir)
    }

    fn mailbox() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("eml")).unwrap();
        dir
    }

    #[tokio::test]
    async fn put_materializes_payload_and_control_line() {
        let home = mailbox();
        let (cache, _unit, _bouncer, _host, _store, _guard) =
            assembly(home.path(), StoreStatus::Ok);

        let context = sample_context(true);
        let id = cache.put(&context, "user@local.test", 1000).await.unwrap();
        let second = cache.put(&context, "user@local.test", 1000).await.unwrap();
        assert!(second > id);

        let entries = cache.load_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rcpt, "user@local.test");
        assert_eq!(entries[0].attempts, 0);
    }

    #[tokio::test]
    async fn ids_resume_after_reopen() {
        let home = mailbox();
        let (cache, _unit, _bouncer, _host, _store, guard) =
            assembly(home.path(), StoreStatus::Ok);
        let id = cache
            .put(&sample_context(true), "user@local.test", 1000)
            .await
            .unwrap();

        let reopened = RetryCache::open(guard.path(), 0, 2).unwrap();
        let next = reopened
            .put(&sample_context(true), "user@local.test", 1000)
            .await
            .unwrap();
        assert!(next > id);
    }

    #[tokio::test]
    async fn successful_retry_removes_the_entry() {
        let home = mailbox();
        let (cache, unit, bouncer, _host, store, _guard) =
            assembly(home.path(), StoreStatus::Ok);
        let stats = DeliveryStats::default();

        cache
            .put(&sample_context(true), "user@local.test", 0)
            .await
            .unwrap();
        cache.scan(&unit, &bouncer, &stats).await;

        assert!(cache.load_entries().await.unwrap().is_empty());
        assert_eq!(store.calls.lock().unwrap().len(), 1);
        assert_eq!(stats.ok(), 1);
    }

    #[tokio::test]
    async fn transient_retry_bumps_the_attempt_counter() {
        let home = mailbox();
        let (cache, unit, bouncer, host, _store, _guard) =
            assembly(home.path(), StoreStatus::NoServer);
        let stats = DeliveryStats::default();

        cache
            .put(&sample_context(true), "user@local.test", 0)
            .await
            .unwrap();
        cache.scan(&unit, &bouncer, &stats).await;

        let entries = cache.load_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 1);
        // still transient: no bounce yet
        assert!(host.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_entry_expires_with_a_timeout_bounce() {
        let home = mailbox();
        let (cache, unit, bouncer, host, _store, _guard) =
            assembly(home.path(), StoreStatus::NoServer);
        let stats = DeliveryStats::default();

        cache
            .put(&sample_context(true), "user@local.test", 0)
            .await
            .unwrap();
        // retrying_times is 2 in the assembly
        cache.scan(&unit, &bouncer, &stats).await;
        cache.scan(&unit, &bouncer, &stats).await;
        cache.scan(&unit, &bouncer, &stats).await;

        assert!(cache.load_entries().await.unwrap().is_empty());
        let bounces = host.enqueued.lock().unwrap();
        assert_eq!(bounces.len(), 1);
        let text = String::from_utf8(bounces[0].mail.bytes().to_vec()).unwrap();
        assert!(text.contains("Status: 4.4.7"));
        assert_eq!(
            bounces[0].control.rcpt_to.lines().collect::<Vec<_>>(),
            ["sender@remote.net"]
        );
    }

    #[tokio::test]
    async fn no_user_retry_bounces_and_counts() {
        let home = mailbox();
        let (cache, unit, bouncer, host, _store, _guard) =
            assembly(home.path(), StoreStatus::Ok);
        let stats = DeliveryStats::default();

        cache
            .put(&sample_context(true), "ghost@local.test", 0)
            .await
            .unwrap();
        cache.scan(&unit, &bouncer, &stats).await;

        assert!(cache.load_entries().await.unwrap().is_empty());
        assert_eq!(stats.nouser(), 1);
        assert_eq!(host.enqueued.lock().unwrap().len(), 1);
    }
}
