//! The local-delivery command set.
//!
//! Knob changes are written to the module config file first and only applied
//! to the running module when the save succeeds, so a restart always comes
//! up with the last accepted values.

use std::sync::Arc;

use async_trait::async_trait;
use harbinger_common::{
    config::RuntimeConfig,
    interval::{format_interval, parse_interval},
    stats::DeliveryStats,
};
use harbinger_delivery::{
    AutoResponder, BounceAudit, BounceProducer, MessageStore, RetryCache,
};

use crate::server::CommandHandler;

const HELP: &str = "250 local delivery help information:\r\n\
\tstatus\r\n\
\t    --print the running information\r\n\
\tinfo\r\n\
\t    --print the module information\r\n\
\tbounce reload\r\n\
\t    --reload the bounce resource list\r\n\
\tset alarm-frequncy <times>/<interval>\r\n\
\t    --set alarm frequency\r\n\
\tset alarm-interval <interval>\r\n\
\t    --set alarm interval\r\n\
\tset cache-scan <interval>\r\n\
\t    --set cache scanning interval\r\n\
\tset retrying-times <times>\r\n\
\t    --set the cache retrying times\r\n\
\tset response-interval <interval>\r\n\
\t    --set auto response interval\r\n\
\techo <mailbox_dir>\r\n\
\t    --echo store connection information";

/// Console command dispatcher for the wired delivery module.
pub struct ConsoleCommands {
    stats: Arc<DeliveryStats>,
    cache: Arc<RetryCache>,
    audit: Arc<BounceAudit>,
    responder: Arc<AutoResponder>,
    producer: Arc<BounceProducer>,
    store: Arc<dyn MessageStore>,
    config: Arc<RuntimeConfig>,
}

impl ConsoleCommands {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stats: Arc<DeliveryStats>,
        cache: Arc<RetryCache>,
        audit: Arc<BounceAudit>,
        responder: Arc<AutoResponder>,
        producer: Arc<BounceProducer>,
        store: Arc<dyn MessageStore>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            stats,
            cache,
            audit,
            responder,
            producer,
            store,
            config,
        }
    }

    fn status(&self) -> String {
        format!(
            "250 local delivery running information:\r\n\
             \tOK                       {}\r\n\
             \ttemporary fail           {}\r\n\
             \tpermanent fail           {}\r\n\
             \tno user                  {}",
            self.stats.ok(),
            self.stats.temp(),
            self.stats.permanent(),
            self.stats.nouser(),
        )
    }

    fn info(&self) -> String {
        format!(
            "250 local delivery module information:\r\n\
             \tstatistic times          {}\r\n\
             \tstatistic interval       {}\r\n\
             \talarm interval           {}\r\n\
             \tcache interval           {}\r\n\
             \tretrying times           {}\r\n\
             \tresponse capacity        {}\r\n\
             \tresponse interval        {}",
            self.stats.statistic_times(),
            format_interval(self.stats.statistic_interval()),
            format_interval(self.stats.alarm_interval()),
            format_interval(self.cache.scan_interval()),
            self.cache.retrying_times(),
            self.audit.capacity(),
            format_interval(self.audit.interval()),
        )
    }

    async fn persist(&self, pairs: &[(&str, i64)]) -> Result<(), String> {
        for (key, value) in pairs {
            self.config.set(key, *value);
        }
        self.config
            .save()
            .await
            .map_err(|e| format!("550 failed to save config file: {e}"))
    }

    async fn set_alarm_frequency(&self, value: &str) -> String {
        let Some((times, interval)) = value.split_once('/') else {
            return format!("550 invalid argument {value} should be times/interval");
        };
        let times: u32 = match times.parse() {
            Ok(times) if times > 0 => times,
            _ => return "550 times and interval should be larger than 0".to_string(),
        };
        let Some(interval) = parse_interval(interval).filter(|&interval| interval > 0) else {
            return "550 times and interval should be larger than 0".to_string();
        };
        if let Err(e) = self
            .persist(&[
                ("alarm_failure_times", i64::from(times)),
                ("alarm_statistic_interval", as_i64(interval)),
            ])
            .await
        {
            return e;
        }
        self.stats.set_alarm_frequency(times, interval);
        "250 frequency set OK".to_string()
    }

    async fn set_alarm_interval(&self, value: &str) -> String {
        let Some(interval) = parse_interval(value).filter(|&interval| interval > 0) else {
            return format!("550 invalid alarm-interval {value}");
        };
        if let Err(e) = self.persist(&[("alarm_interval", as_i64(interval))]).await {
            return e;
        }
        self.stats.set_alarm_interval(interval);
        "250 alarm-interval set OK".to_string()
    }

    async fn set_cache_scan(&self, value: &str) -> String {
        let Some(interval) = parse_interval(value).filter(|&interval| interval > 0) else {
            return format!("550 invalid cache-scan {value}");
        };
        if let Err(e) = self
            .persist(&[("cache_scan_interval", as_i64(interval))])
            .await
        {
            return e;
        }
        self.cache.set_scan_interval(interval);
        "250 cache-scan set OK".to_string()
    }

    async fn set_retrying_times(&self, value: &str) -> String {
        let times: u32 = match value.parse() {
            Ok(times) if times > 0 => times,
            _ => return format!("550 invalid retrying-times {value}"),
        };
        if let Err(e) = self.persist(&[("retrying_times", i64::from(times))]).await {
            return e;
        }
        self.cache.set_retrying_times(times);
        "250 retrying-times set OK".to_string()
    }

    async fn set_response_interval(&self, value: &str) -> String {
        let Some(interval) = parse_interval(value).filter(|&interval| interval > 0) else {
            return format!("550 invalid response-interval {value}");
        };
        if let Err(e) = self.persist(&[("response_interval", as_i64(interval))]).await {
            return e;
        }
        self.audit.set_interval(interval);
        self.responder.set_interval(interval);
        "250 response-interval set OK".to_string()
    }

    async fn echo(&self, mailbox_dir: &str) -> String {
        match self.store.connection_info(mailbox_dir).await {
            Some(info) => format!(
                "250 connection information of store(dir:{} host:{} port:{}):\r\n\
                 \ttotal connections        {}\r\n\
                 \tavailable connections    {}",
                mailbox_dir, info.host, info.port, info.total_connections, info.available_connections,
            ),
            None => format!("250 no information about store(dir:{mailbox_dir})"),
        }
    }
}

fn as_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl CommandHandler for ConsoleCommands {
    async fn handle(&self, argv: &[&str]) -> String {
        match argv {
            [] => "550 too few arguments".to_string(),
            ["--help" | "help"] => HELP.to_string(),
            ["status"] => self.status(),
            ["info"] => self.info(),
            ["bounce", "reload"] => {
                if self.producer.refresh() {
                    "250 bounce resource list reload OK".to_string()
                } else {
                    "550 bounce resource list reload error".to_string()
                }
            }
            ["set", "alarm-frequncy", value] => self.set_alarm_frequency(value).await,
            ["set", "alarm-interval", value] => self.set_alarm_interval(value).await,
            ["set", "cache-scan", value] => self.set_cache_scan(value).await,
            ["set", "retrying-times", value] => self.set_retrying_times(value).await,
            ["set", "response-interval", value] => self.set_response_interval(value).await,
            ["echo", mailbox_dir] => self.echo(mailbox_dir).await,
            [other, ..] => format!("550 invalid argument {other}"),
        }
    }
}
