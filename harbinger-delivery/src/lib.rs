//! Local mail delivery for the groupware suite.
//!
//! This crate is the MTA-side half of message ingestion: the hook that
//! claims local recipients, the per-recipient delivery protocol into the
//! mailbox store, the durable retry queue for transient failures, and the
//! bounce/auto-response machinery around them. The MTA runtime, the user
//! directory, and the store transport are supplied by the host through the
//! traits in `harbinger-common` and [`store`].

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod audit;
pub mod bounce;
pub mod cache;
pub mod error;
pub mod hook;
pub mod quota;
pub mod response;
pub mod sequence;
pub mod store;

use std::{path::PathBuf, sync::Arc};

use harbinger_common::{
    context::MessageContext,
    services::{MtaHost, UserDirectory},
    stats::DeliveryStats,
    Signal,
};
use harbinger_mapi::{Importer, NamedPropertyMap};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;

pub use audit::BounceAudit;
pub use bounce::{BounceKind, BounceProducer, Bouncer};
pub use cache::{CacheError, RetryCache};
pub use error::DeliveryOutcome;
pub use hook::HookDispatcher;
pub use quota::DeliveryUnit;
pub use response::AutoResponder;
pub use sequence::Sequencer;
pub use store::{MessageStore, StorePoolInfo, StoreStatus};

/// Module configuration, loaded from the suite's TOML config.
#[allow(
    clippy::struct_field_names,
    reason = "Field names mirror the operator-facing config keys"
)]
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Named-property list file.
    pub propname_path: PathBuf,

    /// Directory backing the retry cache.
    pub cache_path: PathBuf,

    /// Bounce template directory. Built-in texts are used when unset.
    #[serde(default)]
    pub bounce_template_path: Option<PathBuf>,

    #[serde(default = "defaults::default_charset")]
    pub default_charset: String,

    #[serde(default = "defaults::default_timezone")]
    pub default_timezone: String,

    /// Seconds between retry-cache scans; also the minimum spacing between
    /// attempts for one cached entry.
    #[serde(default = "defaults::cache_scan_interval")]
    pub cache_scan_interval: u64,

    /// Attempts before a cached entry expires with a timeout bounce.
    #[serde(default = "defaults::retrying_times")]
    pub retrying_times: u32,

    /// Bounces admitted per recipient per response interval.
    #[serde(default = "defaults::response_audit_capacity")]
    pub response_audit_capacity: u32,

    /// Window for the bounce audit and the auto-response throttle.
    #[serde(default = "defaults::response_interval")]
    pub response_interval: u64,

    /// Failures within the statistic interval that raise an alarm.
    #[serde(default = "defaults::alarm_failure_times")]
    pub alarm_failure_times: u32,

    #[serde(default = "defaults::alarm_statistic_interval")]
    pub alarm_statistic_interval: u64,

    /// Minimum spacing between alarm events.
    #[serde(default = "defaults::alarm_interval")]
    pub alarm_interval: u64,
}

mod defaults {
    pub fn default_charset() -> String {
        "utf-8".to_string()
    }

    pub fn default_timezone() -> String {
        "UTC".to_string()
    }

    pub const fn cache_scan_interval() -> u64 {
        180
    }

    pub const fn retrying_times() -> u32 {
        30
    }

    pub const fn response_audit_capacity() -> u32 {
        1000
    }

    pub const fn response_interval() -> u64 {
        180
    }

    pub const fn alarm_failure_times() -> u32 {
        1000
    }

    pub const fn alarm_statistic_interval() -> u64 {
        3600
    }

    pub const fn alarm_interval() -> u64 {
        1800
    }
}

/// Startup failure naming the capability that could not be bound.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to load named-property table from {path}: {source}")]
    PropertyTable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open retry cache: {0}")]
    Cache(#[from] CacheError),
}

/// The fully wired local delivery module.
pub struct LocalDelivery {
    pub dispatcher: HookDispatcher,
    pub unit: Arc<DeliveryUnit>,
    pub cache: Arc<RetryCache>,
    pub audit: Arc<BounceAudit>,
    pub responder: Arc<AutoResponder>,
    pub producer: Arc<BounceProducer>,
    pub bouncer: Arc<Bouncer>,
    pub stats: Arc<DeliveryStats>,
}

impl std::fmt::Debug for LocalDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDelivery").finish_non_exhaustive()
    }
}

impl LocalDelivery {
    /// Bind every collaborator and load the on-disk tables. Each failure
    /// names the capability that was being initialized.
    pub fn init(
        config: &DeliveryConfig,
        directory: Arc<dyn UserDirectory>,
        host: Arc<dyn MtaHost>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self, InitError> {
        let names =
            NamedPropertyMap::load(&config.propname_path).map_err(|source| InitError::PropertyTable {
                path: config.propname_path.clone(),
                source,
            })?;
        harbinger_common::internal!(
            level = INFO,
            "loaded {} named-property entries from {}",
            names.len(),
            config.propname_path.display()
        );

        let cache = Arc::new(RetryCache::open(
            &config.cache_path,
            config.cache_scan_interval,
            config.retrying_times,
        )?);
        let audit = Arc::new(BounceAudit::new(
            config.response_audit_capacity,
            config.response_interval,
        ));
        let responder = Arc::new(AutoResponder::new(config.response_interval));
        let stats = Arc::new(DeliveryStats::new(
            config.alarm_failure_times,
            config.alarm_statistic_interval,
            config.alarm_interval,
        ));

        let reporting_mta = {
            let host_id = host.host_id();
            if host_id.is_empty() {
                host.default_domain()
            } else {
                host_id
            }
        };
        let producer = Arc::new(BounceProducer::new(
            reporting_mta,
            config.bounce_template_path.clone(),
        ));
        let bouncer = Arc::new(Bouncer::new(
            Arc::clone(&host),
            Arc::clone(&audit),
            Arc::clone(&producer),
        ));

        let importer = Importer::new(Arc::new(names), Arc::clone(&directory));
        let unit = Arc::new(DeliveryUnit::new(
            Arc::clone(&directory),
            host,
            store,
            Arc::clone(&responder),
            importer,
            config.default_charset.clone(),
            config.default_timezone.clone(),
        ));
        let dispatcher = HookDispatcher::new(
            directory,
            Arc::clone(&unit),
            Arc::clone(&cache),
            Arc::clone(&bouncer),
            Arc::clone(&stats),
        );

        Ok(Self {
            dispatcher,
            unit,
            cache,
            audit,
            responder,
            producer,
            bouncer,
            stats,
        })
    }

    /// Spawn the retry-cache scanner. It stops at the first shutdown signal.
    pub fn start(&self, shutdown: broadcast::Receiver<Signal>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.cache).serve(
            Arc::clone(&self.unit),
            Arc::clone(&self.bouncer),
            Arc::clone(&self.stats),
            shutdown,
        ))
    }

    /// The per-message MTA hook.
    pub async fn hook(&self, context: &mut MessageContext) -> bool {
        self.dispatcher.hook(context).await
    }
}
