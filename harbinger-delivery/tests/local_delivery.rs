//! End-to-end exercises of the wired delivery module: hook dispatch,
//! retry-cache turnaround, and startup validation.

#![allow(clippy::unwrap_used)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use harbinger_common::{
    context::{Mail, MessageContext},
    services::{DirectoryError, MtaHost, UserDirectory, UserIds, UserInfo},
    Signal,
};
use harbinger_delivery::{
    DeliveryConfig, LocalDelivery, MessageStore, StorePoolInfo, StoreStatus,
};
use harbinger_mapi::MapiMessage;
use tokio::sync::broadcast;

struct Directory {
    home: String,
}

impl UserDirectory for Directory {
    fn check_domain(&self, domain: &str) -> bool {
        domain.eq_ignore_ascii_case("local.test")
    }
    fn get_user_info(&self, address: &str) -> Result<UserInfo, DirectoryError> {
        if address.starts_with("ghost@") {
            return Ok(UserInfo::default());
        }
        Ok(UserInfo {
            home_dir: self.home.clone(),
            lang: "en".to_string(),
            timezone: "UTC".to_string(),
        })
    }
    fn get_user_ids(&self, _address: &str) -> Option<UserIds> {
        None
    }
    fn get_username(&self, _user_id: u32) -> Option<String> {
        None
    }
    fn lang_to_charset(&self, lang: &str) -> Option<String> {
        (lang == "en").then(|| "utf-8".to_string())
    }
    fn ltag_to_lcid(&self, _ltag: &str) -> Option<u32> {
        None
    }
    fn lcid_to_ltag(&self, _lcid: u32) -> Option<String> {
        None
    }
    fn charset_to_cpid(&self, charset: &str) -> Option<u32> {
        (charset == "utf-8").then_some(65001)
    }
    fn cpid_to_charset(&self, _cpid: u32) -> Option<String> {
        None
    }
    fn mime_to_extension(&self, _mime: &str) -> Option<String> {
        None
    }
    fn extension_to_mime(&self, _extension: &str) -> Option<String> {
        None
    }
}

#[derive(Default)]
struct Host {
    enqueued: Mutex<Vec<MessageContext>>,
}

impl MtaHost for Host {
    fn new_context(&self) -> Option<MessageContext> {
        Some(MessageContext::default())
    }
    fn recycle(&self, _context: MessageContext) {}
    fn enqueue(&self, context: MessageContext) {
        self.enqueued.lock().unwrap().push(context);
    }
    fn default_domain(&self) -> String {
        "local.test".to_string()
    }
    fn host_id(&self) -> String {
        "mx1.local.test".to_string()
    }
}

struct Store {
    status: Mutex<StoreStatus>,
    delivered: Mutex<Vec<(String, String, String)>>,
}

impl Store {
    fn new(status: StoreStatus) -> Self {
        Self {
            status: Mutex::new(status),
            delivered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl MessageStore for Store {
    async fn delivery_message(
        &self,
        home_dir: &str,
        sender: &str,
        recipient: &str,
        _flags: u32,
        _message: &MapiMessage,
        digest: &str,
    ) -> StoreStatus {
        self.delivered.lock().unwrap().push((
            home_dir.to_string(),
            format!("{sender} -> {recipient}"),
            digest.to_string(),
        ));
        *self.status.lock().unwrap()
    }

    async fn connection_info(&self, _home_dir: &str) -> Option<StorePoolInfo> {
        Some(StorePoolInfo {
            host: "127.0.0.1".to_string(),
            port: 5000,
            total_connections: 10,
            available_connections: 9,
        })
    }
}

struct Suite {
    delivery: LocalDelivery,
    host: Arc<Host>,
    store: Arc<Store>,
    _mailbox: tempfile::TempDir,
    _workdir: tempfile::TempDir,
}

fn suite(status: StoreStatus) -> Suite {
    let mailbox = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(mailbox.path().join("eml")).unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let propnames = workdir.path().join("propnames.txt");
    std::fs::write(
        &propnames,
        "GUID=00020329-0000-0000-c000-000000000046,NAME=keywords\n",
    )
    .unwrap();

    let toml = format!(
        r#"
propname_path = {propnames:?}
cache_path = {cache:?}
cache_scan_interval = 0
retrying_times = 2
"#,
        propnames = propnames,
        cache = workdir.path().join("cache"),
    );
    let config: DeliveryConfig = toml::from_str(&toml).unwrap();
    assert_eq!(config.default_charset, "utf-8");
    assert_eq!(config.response_audit_capacity, 1000);

    let host = Arc::new(Host::default());
    let store = Arc::new(Store::new(status));
    let delivery = LocalDelivery::init(
        &config,
        Arc::new(Directory {
            home: mailbox.path().to_str().unwrap().to_string(),
        }),
        Arc::clone(&host) as Arc<dyn MtaHost>,
        Arc::clone(&store) as Arc<dyn MessageStore>,
    )
    .unwrap();

    Suite {
        delivery,
        host,
        store,
        _mailbox: mailbox,
        _workdir: workdir,
    }
}

fn inbound(recipients: &[&str]) -> MessageContext {
    let mut context = MessageContext {
        mail: Mail::new(
            b"From: sender@remote.net\r\nTo: someone\r\nSubject: hi\r\n\r\nbody\r\n".as_slice(),
        ),
        ..MessageContext::default()
    };
    context.control.from = "sender@remote.net".to_string();
    context.control.queue_id = 31;
    for recipient in recipients {
        context.control.rcpt_to.write_line((*recipient).to_string());
    }
    context
}

#[tokio::test]
async fn mixed_recipients_split_between_local_and_remote() {
    let suite = suite(StoreStatus::Ok);
    let mut context = inbound(&["a@local.test", "b@remote.net", "c@local.test"]);

    let handled = suite.delivery.hook(&mut context).await;

    assert!(!handled);
    assert_eq!(
        context.control.rcpt_to.lines().collect::<Vec<_>>(),
        ["b@remote.net"]
    );
    assert_eq!(suite.store.delivered.lock().unwrap().len(), 2);
    assert_eq!(suite.delivery.stats.ok(), 2);
}

#[tokio::test]
async fn transient_store_failure_lands_in_the_cache_and_retries_to_success() {
    let suite = suite(StoreStatus::NoServer);
    let mut context = inbound(&["a@local.test"]);

    assert!(suite.delivery.hook(&mut context).await);
    assert_eq!(suite.delivery.stats.temp(), 1);
    assert!(suite.host.enqueued.lock().unwrap().is_empty());

    // the store comes back; the next scan drains the entry
    *suite.store.status.lock().unwrap() = StoreStatus::Ok;
    suite
        .delivery
        .cache
        .scan(
            &suite.delivery.unit,
            &suite.delivery.bouncer,
            &suite.delivery.stats,
        )
        .await;

    assert_eq!(suite.delivery.stats.ok(), 1);
    let delivered = suite.store.delivered.lock().unwrap();
    // one failed attempt, one successful retry
    assert_eq!(delivered.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn scanner_retries_on_its_interval_and_stops_on_shutdown() {
    let suite = suite(StoreStatus::NoServer);
    let mut context = inbound(&["a@local.test"]);

    assert!(suite.delivery.hook(&mut context).await);
    assert_eq!(suite.store.delivered.lock().unwrap().len(), 1);

    // the store comes back; the running scanner must drain the entry on
    // its own, without a direct scan() call
    *suite.store.status.lock().unwrap() = StoreStatus::Ok;
    let (shutdown, _keep) = broadcast::channel(1);
    let task = suite.delivery.start(shutdown.subscribe());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if suite.store.delivered.lock().unwrap().len() >= 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "scanner did not retry within its interval"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(suite.delivery.stats.ok(), 1);

    shutdown.send(Signal::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("scanner must exit promptly on shutdown")
        .unwrap();
}

#[tokio::test]
async fn no_user_produces_a_bounce_to_the_envelope_sender() {
    let suite = suite(StoreStatus::Ok);
    let mut context = inbound(&["ghost@local.test"]);

    assert!(suite.delivery.hook(&mut context).await);

    assert_eq!(suite.delivery.stats.nouser(), 1);
    let bounces = suite.host.enqueued.lock().unwrap();
    assert_eq!(bounces.len(), 1);
    assert_eq!(bounces[0].control.from, "postmaster@local.test");
}

#[tokio::test]
async fn missing_property_table_aborts_startup_naming_the_file() {
    let workdir = tempfile::tempdir().unwrap();
    let toml = format!(
        r#"
propname_path = {missing:?}
cache_path = {cache:?}
"#,
        missing = workdir.path().join("no-such-file.txt"),
        cache = workdir.path().join("cache"),
    );
    let config: DeliveryConfig = toml::from_str(&toml).unwrap();

    let err = LocalDelivery::init(
        &config,
        Arc::new(Directory {
            home: String::new(),
        }),
        Arc::new(Host::default()),
        Arc::new(Store::new(StoreStatus::Ok)),
    )
    .unwrap_err();

    assert!(err.to_string().contains("no-such-file.txt"));
}
