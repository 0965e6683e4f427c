//! The mailbox-store RPC boundary.
//!
//! The store client transport lives outside this suite; delivery only needs
//! the one call that hands a converted message plus its digest to the store,
//! and a pool-state probe for the admin console.

use async_trait::async_trait;
use harbinger_mapi::MapiMessage;

/// Status returned by the store for a delivery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Ok,
    MailboxFull,
    /// The store hit an internal error while applying the message.
    RuntimeError,
    /// No connection to the store server backing this mailbox.
    NoServer,
    /// The connection broke mid-call.
    RdwrError,
    /// The store answered with an error result.
    ResultError,
}

/// Connection-pool state for one mailbox directory, reported by `echo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePoolInfo {
    pub host: String,
    pub port: u16,
    pub total_connections: u32,
    pub available_connections: u32,
}

/// Client handle to the mailbox store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Deliver a converted message into `home_dir`. The `.eml` file named in
    /// `digest` is fully written and closed before this is called.
    async fn delivery_message(
        &self,
        home_dir: &str,
        sender: &str,
        recipient: &str,
        flags: u32,
        message: &MapiMessage,
        digest: &str,
    ) -> StoreStatus;

    /// Pool state for the server backing `home_dir`, if known.
    async fn connection_info(&self, home_dir: &str) -> Option<StorePoolInfo>;
}
