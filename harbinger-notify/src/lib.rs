//! Long-poll notification waiter.
//!
//! RPC clients park an `async_wait` call per `(username, context index)`
//! pair and are answered later: by a mailbox-store wakeup (notification
//! pending), by the timeout sweeper (nothing pending), or not at all when
//! the client cancels first. HTTP long-poll callers ride the same registry
//! through a host-registered activation callback instead of an RPC reply.
//!
//! The registry keeps two indices, by tag and by non-zero async id, under a
//! single lock so that membership in one always implies membership in the
//! other. Woken waiters move to a separate queue drained by a small worker
//! pool; the wake condition is signalled only after queue insertion and
//! never while the registry lock is held.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use harbinger_common::Signal;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::{broadcast, oneshot, Notify, OwnedSemaphorePermit, Semaphore};

/// Seconds a waiter may stay parked before the sweeper answers it.
pub const WAITING_INTERVAL: u64 = 300;

/// Scheduler slack subtracted from [`WAITING_INTERVAL`] by the sweeper.
const TIMEOUT_SLACK: u64 = 3;

/// `flags_out` bit: a notification is pending for the session.
pub const FLAG_NOTIFICATION_PENDING: u32 = 0x0000_0001;

/// Wire result codes surfaced to the RPC transport.
pub const EC_SUCCESS: u32 = 0;
pub const EC_REJECTED: u32 = 0x0000_07EE;

/// Opaque session handle issued by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub [u8; 16]);

/// The session manager's view of active sessions, supplied by the host.
pub trait SessionTable: Send + Sync {
    /// Resolve a handle to its `(username, context index)`. `None` means the
    /// handle is stale or forged and the wait is rejected.
    fn resolve(&self, handle: &SessionHandle) -> Option<(String, u16)>;

    /// Whether the session already has a notification queued, in which case
    /// a wait call returns immediately instead of parking.
    fn has_pending(&self, handle: &SessionHandle) -> bool;
}

/// Out-parameters of one `async_wait` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReply {
    pub flags_out: u32,
    pub result: u32,
}

impl WaitReply {
    const fn rejected() -> Self {
        Self {
            flags_out: 0,
            result: EC_REJECTED,
        }
    }

    const fn fired(pending: bool) -> Self {
        Self {
            flags_out: if pending { FLAG_NOTIFICATION_PENDING } else { 0 },
            result: EC_SUCCESS,
        }
    }
}

/// Where an activated waiter delivers its answer.
pub enum WaitChannel {
    /// In-process HTTP long-poll; activation goes through the callback
    /// registered with [`AsyncWaiter::register_http_activator`]. Used if and
    /// only if the waiter's `async_id` is zero.
    Http { context_id: u32 },
    /// RPC-bound wait; the reply slot is completed on activation.
    Rpc { reply: oneshot::Sender<WaitReply> },
}

/// Outcome of [`AsyncWaiter::async_wait`].
#[derive(Debug)]
pub enum Dispatch {
    /// Answer now; the wait channel was not consumed.
    Immediate(WaitReply),
    /// The caller is parked; the answer arrives through its channel.
    Pending,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Worker tasks draining the wake queue.
    #[serde(default = "defaults::threads_num")]
    pub threads_num: usize,

    /// Host session capacity; the waiter registry and pool are sized at
    /// twice this number.
    pub context_num: usize,

    /// Parked lifetime bound. Tests shrink this; operators do not.
    #[serde(default = "defaults::waiting_interval")]
    pub waiting_interval: u64,
}

mod defaults {
    pub const fn threads_num() -> usize {
        4
    }

    pub const fn waiting_interval() -> u64 {
        super::WAITING_INTERVAL
    }
}

type TagKey = (String, u16);

struct AsyncWait {
    username: String,
    cxr: u16,
    async_id: u32,
    registered_at: Instant,
    channel: WaitChannel,
    /// Pool slot; released when the waiter is dropped after activation or
    /// cancellation.
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Registry {
    tag: AHashMap<TagKey, AsyncWait>,
    by_async_id: AHashMap<u32, TagKey>,
}

type HttpActivator = Box<dyn Fn(u32, bool) + Send + Sync>;

/// The waiter registry plus its sweeper and worker pool.
pub struct AsyncWaiter {
    registry: Mutex<Registry>,
    wake_queue: Mutex<VecDeque<AsyncWait>>,
    waken: Notify,
    pool: Arc<Semaphore>,
    capacity: usize,
    threads_num: usize,
    waiting_interval: u64,
    sessions: Arc<dyn SessionTable>,
    http_activator: RwLock<Option<HttpActivator>>,
}

impl AsyncWaiter {
    #[must_use]
    pub fn new(config: &NotifyConfig, sessions: Arc<dyn SessionTable>) -> Arc<Self> {
        let capacity = 2 * config.context_num;
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            wake_queue: Mutex::new(VecDeque::new()),
            waken: Notify::new(),
            pool: Arc::new(Semaphore::new(capacity)),
            capacity,
            threads_num: config.threads_num,
            waiting_interval: config.waiting_interval,
            sessions,
            http_activator: RwLock::new(None),
        })
    }

    /// Install the HTTP long-poll activation callback. Called once by the
    /// HTTP transport module at startup.
    pub fn register_http_activator(&self, activator: impl Fn(u32, bool) + Send + Sync + 'static) {
        *self.http_activator.write() = Some(Box::new(activator));
    }

    /// Handle one `async_wait` RPC. `auth_username` is the authenticated
    /// caller identity from the transport; it must match the session owner.
    pub fn async_wait(
        &self,
        async_id: u32,
        handle: &SessionHandle,
        auth_username: &str,
        channel: WaitChannel,
    ) -> Dispatch {
        let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
            return Dispatch::Immediate(WaitReply::rejected());
        };
        let Some((username, cxr)) = self.sessions.resolve(handle) else {
            return Dispatch::Immediate(WaitReply::rejected());
        };
        if !username.eq_ignore_ascii_case(auth_username) {
            return Dispatch::Immediate(WaitReply::rejected());
        }
        if self.sessions.has_pending(handle) {
            return Dispatch::Immediate(WaitReply {
                flags_out: FLAG_NOTIFICATION_PENDING,
                result: EC_SUCCESS,
            });
        }

        let username = username.to_ascii_lowercase();
        let wait = AsyncWait {
            username: username.clone(),
            cxr,
            async_id,
            registered_at: Instant::now(),
            channel,
            _permit: permit,
        };

        let mut registry = self.registry.lock();
        if async_id != 0 && registry.by_async_id.contains_key(&async_id) {
            return Dispatch::Immediate(WaitReply::rejected());
        }
        let key = (username, cxr);
        if registry.tag.len() >= self.capacity || registry.tag.contains_key(&key) {
            return Dispatch::Immediate(WaitReply::rejected());
        }
        if async_id != 0 {
            registry.by_async_id.insert(async_id, key.clone());
        }
        registry.tag.insert(key, wait);
        Dispatch::Pending
    }

    /// A mailbox event for `(username, cxr)`. Detaches the matching waiter,
    /// if any, and hands it to the worker pool to fire as pending.
    pub fn wakeup(&self, username: &str, cxr: u16) {
        let key = (username.to_ascii_lowercase(), cxr);
        let wait = {
            let mut registry = self.registry.lock();
            let Some(wait) = registry.tag.remove(&key) else {
                return;
            };
            if wait.async_id != 0 {
                registry.by_async_id.remove(&wait.async_id);
            }
            wait
        };
        self.wake_queue.lock().push_back(wait);
        self.waken.notify_one();
    }

    /// Cancel by async id (the RPC transport lost the client).
    pub fn reclaim(&self, async_id: u32) {
        let mut registry = self.registry.lock();
        if let Some(key) = registry.by_async_id.remove(&async_id) {
            registry.tag.remove(&key);
        }
    }

    /// Cancel by session handle (the HTTP transport lost the client).
    pub fn remove(&self, handle: &SessionHandle) {
        let Some((username, cxr)) = self.sessions.resolve(handle) else {
            return;
        };
        let mut registry = self.registry.lock();
        let Some(wait) = registry.tag.remove(&(username.to_ascii_lowercase(), cxr)) else {
            return;
        };
        if wait.async_id != 0 {
            registry.by_async_id.remove(&wait.async_id);
        }
    }

    /// Spawn the sweeper and the worker pool. All tasks stop at the first
    /// shutdown signal.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<Signal>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.threads_num + 1);
        handles.push(tokio::spawn(
            Arc::clone(self).sweeper(shutdown.subscribe()),
        ));
        for _ in 0..self.threads_num {
            handles.push(tokio::spawn(Arc::clone(self).worker(shutdown.subscribe())));
        }
        handles
    }

    async fn worker(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        loop {
            tokio::select! {
                () = self.waken.notified() => {
                    loop {
                        let next = self.wake_queue.lock().pop_front();
                        match next {
                            Some(wait) => self.activate(wait, true),
                            None => break,
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let cutoff = self.waiting_interval.saturating_sub(TIMEOUT_SLACK);
        loop {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(1)) => {
                    let now = Instant::now();
                    let expired = {
                        let mut registry = self.registry.lock();
                        let keys: Vec<TagKey> = registry
                            .tag
                            .iter()
                            .filter(|(_, wait)| {
                                now.duration_since(wait.registered_at).as_secs() > cutoff
                            })
                            .map(|(key, _)| key.clone())
                            .collect();
                        let mut batch = Vec::with_capacity(keys.len());
                        for key in keys {
                            if let Some(wait) = registry.tag.remove(&key) {
                                if wait.async_id != 0 {
                                    registry.by_async_id.remove(&wait.async_id);
                                }
                                batch.push(wait);
                            }
                        }
                        batch
                    };
                    for wait in expired {
                        tracing::debug!(
                            username = %wait.username,
                            cxr = wait.cxr,
                            "notification wait timed out"
                        );
                        self.activate(wait, false);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Fire a detached waiter. The waiter (and its pool slot) is consumed.
    fn activate(&self, wait: AsyncWait, pending: bool) {
        match wait.channel {
            WaitChannel::Http { context_id } => {
                if let Some(activator) = &*self.http_activator.read() {
                    activator(context_id, pending);
                } else {
                    tracing::warn!(context_id, "no HTTP activator registered, dropping wakeup");
                }
            }
            WaitChannel::Rpc { reply } => {
                // a gone receiver just means the transport cancelled late
                let _ = reply.send(WaitReply::fired(pending));
            }
        }
    }

    /// Number of currently parked waiters.
    pub fn parked(&self) -> usize {
        self.registry.lock().tag.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct StaticSessions {
        username: String,
        cxr: u16,
        pending: bool,
    }

    impl SessionTable for StaticSessions {
        fn resolve(&self, handle: &SessionHandle) -> Option<(String, u16)> {
            (handle.0 != [0xFF; 16]).then(|| (self.username.clone(), self.cxr))
        }
        fn has_pending(&self, _handle: &SessionHandle) -> bool {
            self.pending
        }
    }

    fn waiter_with(context_num: usize, pending: bool) -> Arc<AsyncWaiter> {
        AsyncWaiter::new(
            &NotifyConfig {
                threads_num: 2,
                context_num,
                waiting_interval: WAITING_INTERVAL,
            },
            Arc::new(StaticSessions {
                username: "User".to_string(),
                cxr: 5,
                pending,
            }),
        )
    }

    fn rpc_channel() -> (WaitChannel, oneshot::Receiver<WaitReply>) {
        let (tx, rx) = oneshot::channel();
        (WaitChannel::Rpc { reply: tx }, rx)
    }

    const HANDLE: SessionHandle = SessionHandle([1; 16]);
    const BAD_HANDLE: SessionHandle = SessionHandle([0xFF; 16]);

    #[tokio::test]
    async fn parks_a_valid_wait() {
        let waiter = waiter_with(4, false);
        let (channel, _rx) = rpc_channel();
        let dispatch = waiter.async_wait(1, &HANDLE, "user", channel);
        assert!(matches!(dispatch, Dispatch::Pending));
        assert_eq!(waiter.parked(), 1);
    }

    #[tokio::test]
    async fn rejects_stale_handles_and_wrong_identities() {
        let waiter = waiter_with(4, false);

        let (channel, _rx) = rpc_channel();
        let Dispatch::Immediate(reply) = waiter.async_wait(1, &BAD_HANDLE, "user", channel) else {
            panic!("expected immediate rejection");
        };
        assert_eq!(reply.result, EC_REJECTED);

        let (channel, _rx) = rpc_channel();
        let Dispatch::Immediate(reply) = waiter.async_wait(2, &HANDLE, "intruder", channel) else {
            panic!("expected immediate rejection");
        };
        assert_eq!(reply.result, EC_REJECTED);
        assert_eq!(waiter.parked(), 0);
    }

    #[tokio::test]
    async fn pending_notification_answers_immediately() {
        let waiter = waiter_with(4, true);
        let (channel, _rx) = rpc_channel();
        let Dispatch::Immediate(reply) = waiter.async_wait(1, &HANDLE, "user", channel) else {
            panic!("expected immediate answer");
        };
        assert_eq!(reply.result, EC_SUCCESS);
        assert_eq!(reply.flags_out, FLAG_NOTIFICATION_PENDING);
    }

    #[tokio::test]
    async fn duplicate_tag_is_rejected() {
        let waiter = waiter_with(4, false);
        let (first, _rx1) = rpc_channel();
        assert!(matches!(
            waiter.async_wait(1, &HANDLE, "user", first),
            Dispatch::Pending
        ));
        let (second, _rx2) = rpc_channel();
        let Dispatch::Immediate(reply) = waiter.async_wait(2, &HANDLE, "user", second) else {
            panic!("second registration must be rejected");
        };
        assert_eq!(reply.result, EC_REJECTED);
        assert_eq!(waiter.parked(), 1);
    }

    #[tokio::test]
    async fn duplicate_async_id_is_rejected() {
        let waiter = waiter_with(4, false);
        let (first, _rx1) = rpc_channel();
        assert!(matches!(
            waiter.async_wait(7, &HANDLE, "user", first),
            Dispatch::Pending
        ));
        // the async-id index is checked before the tag index
        let (second, _rx2) = rpc_channel();
        let Dispatch::Immediate(reply) = waiter.async_wait(7, &HANDLE, "user", second) else {
            panic!("duplicate async id must be rejected");
        };
        assert_eq!(reply.result, EC_REJECTED);
        let registry = waiter.registry.lock();
        assert_eq!(registry.by_async_id.len(), 1);
    }

    #[tokio::test]
    async fn pool_exhaustion_rejects() {
        // context_num 1 gives capacity 2; workers are not running, so woken
        // waiters keep their pool slot while they sit in the queue
        let waiter = waiter_with(1, false);
        let (c1, _r1) = rpc_channel();
        assert!(matches!(
            waiter.async_wait(1, &HANDLE, "user", c1),
            Dispatch::Pending
        ));
        // second slot: same tag is rejected, so go through wakeup to free
        // the tag while holding the queue slot
        waiter.wakeup("user", 5);
        let (c2, _r2) = rpc_channel();
        assert!(matches!(
            waiter.async_wait(2, &HANDLE, "user", c2),
            Dispatch::Pending
        ));
        let (c3, _r3) = rpc_channel();
        waiter.wakeup("user", 5);
        let Dispatch::Immediate(reply) = waiter.async_wait(3, &HANDLE, "user", c3) else {
            panic!("pool must be exhausted");
        };
        assert_eq!(reply.result, EC_REJECTED);
    }

    #[tokio::test]
    async fn reclaim_and_remove_detach_both_indices() {
        let waiter = waiter_with(4, false);
        let (c1, _r1) = rpc_channel();
        waiter.async_wait(11, &HANDLE, "user", c1);
        waiter.reclaim(11);
        assert_eq!(waiter.parked(), 0);
        {
            let registry = waiter.registry.lock();
            assert!(registry.by_async_id.is_empty());
        }

        let (c2, _r2) = rpc_channel();
        waiter.async_wait(12, &HANDLE, "user", c2);
        waiter.remove(&HANDLE);
        assert_eq!(waiter.parked(), 0);
        let registry = waiter.registry.lock();
        assert!(registry.by_async_id.is_empty());
    }

    #[tokio::test]
    async fn wakeup_for_unknown_tag_is_a_no_op() {
        let waiter = waiter_with(4, false);
        waiter.wakeup("nobody", 3);
        assert!(waiter.wake_queue.lock().is_empty());
    }

    #[tokio::test]
    async fn tag_key_is_lowercased() {
        let waiter = waiter_with(4, false);
        let (c1, _r1) = rpc_channel();
        // session resolves to "User"; the registry key must fold case so a
        // wakeup spelled differently still matches
        waiter.async_wait(0x21, &HANDLE, "USER", c1);
        waiter.wakeup("UsEr", 5);
        assert_eq!(waiter.parked(), 0);
        assert_eq!(waiter.wake_queue.lock().len(), 1);
    }
}
