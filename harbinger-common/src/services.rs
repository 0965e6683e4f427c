//! Interfaces to the host MTA and the user directory.
//!
//! The original suite resolved these capabilities one by one from a service
//! registry at startup. Here each collaborator is a trait object bound once
//! when the module is wired together; a missing capability cannot survive
//! construction.

use thiserror::Error;

use crate::context::MessageContext;

/// Failure talking to the user data source. Always treated as transient by
/// the delivery pipeline.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("data source unavailable: {0}")]
    Unavailable(String),
}

/// Per-user delivery settings. Fields may be empty when the directory record
/// exists but the attribute is unset; an empty `home_dir` means the address
/// has no mailbox.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub home_dir: String,
    pub lang: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIds {
    pub user_id: u32,
    pub domain_id: u32,
    pub address_type: u32,
}

/// User directory service: domain/user lookups plus the pure mapping tables
/// (language, charset, codepage, MIME types).
pub trait UserDirectory: Send + Sync {
    /// Is this a domain the local system hosts?
    fn check_domain(&self, domain: &str) -> bool;

    fn get_user_info(&self, address: &str) -> Result<UserInfo, DirectoryError>;

    fn get_user_ids(&self, address: &str) -> Option<UserIds>;

    fn get_username(&self, user_id: u32) -> Option<String>;

    fn lang_to_charset(&self, lang: &str) -> Option<String>;

    fn ltag_to_lcid(&self, ltag: &str) -> Option<u32>;

    fn lcid_to_ltag(&self, lcid: u32) -> Option<String>;

    fn charset_to_cpid(&self, charset: &str) -> Option<u32>;

    fn cpid_to_charset(&self, cpid: u32) -> Option<String>;

    fn mime_to_extension(&self, mime: &str) -> Option<String>;

    fn extension_to_mime(&self, extension: &str) -> Option<String>;
}

/// Host MTA surface: context pool, transport queue, and identity.
pub trait MtaHost: Send + Sync {
    /// Borrow a fresh context from the host pool. `None` when the pool is
    /// exhausted; callers log and skip whatever they were building.
    fn new_context(&self) -> Option<MessageContext>;

    /// Return an unused context to the pool.
    fn recycle(&self, context: MessageContext);

    /// Hand a finished context to the host queue for transport.
    fn enqueue(&self, context: MessageContext);

    /// Domain used for system-generated senders (`postmaster@<domain>`).
    fn default_domain(&self) -> String;

    /// Host identity used in materialized file names. May be empty, in
    /// which case callers fall back to the OS hostname.
    fn host_id(&self) -> String;
}
