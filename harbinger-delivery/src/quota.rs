//! Single-recipient delivery into the mailbox store.
//!
//! The protocol is strictly ordered: resolve the user, undo dot
//! transparency, materialize the `.eml` file, build the digest, import to a
//! MAPI message, decorate, then issue the store RPC. Every failure is
//! classified at the step where it happens; transport errors never escape
//! as errors.

use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use harbinger_common::{
    context::{BoundType, MessageContext, MessageControl},
    services::{MtaHost, UserDirectory},
};
use harbinger_mapi::{
    digest::build_digest,
    nttime,
    proptag::{self, AUTO_RESPONSE_SUPPRESS_DR, AUTO_RESPONSE_SUPPRESS_OOF},
    ImportScratch, Importer, PropValue,
};
use tokio::io::AsyncWriteExt;

use crate::{
    error::DeliveryOutcome,
    response::AutoResponder,
    sequence::Sequencer,
    store::{MessageStore, StoreStatus},
};

/// Sender address carried by system mail that must never be answered.
pub const NO_REPLY_SENDER: &str = "none@none";

/// Per-recipient delivery engine.
pub struct DeliveryUnit {
    directory: Arc<dyn UserDirectory>,
    host: Arc<dyn MtaHost>,
    store: Arc<dyn MessageStore>,
    responder: Arc<AutoResponder>,
    importer: Importer,
    sequencer: Sequencer,
    default_charset: String,
    default_timezone: String,
}

impl DeliveryUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        host: Arc<dyn MtaHost>,
        store: Arc<dyn MessageStore>,
        responder: Arc<AutoResponder>,
        importer: Importer,
        default_charset: impl Into<String>,
        default_timezone: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            host,
            store,
            responder,
            importer,
            sequencer: Sequencer::new(),
            default_charset: default_charset.into(),
            default_timezone: default_timezone.into(),
        }
    }

    /// Deliver the context's message to one local `address`.
    pub async fn deliver(&self, context: &MessageContext, address: &str) -> DeliveryOutcome {
        let control = &context.control;

        let info = match self.directory.get_user_info(address) {
            Ok(info) => info,
            Err(e) => {
                log_delivery(
                    control,
                    address,
                    &format!("failed to get user information from data source: {e}"),
                );
                return DeliveryOutcome::Transient;
            }
        };
        let charset = if info.lang.is_empty() {
            self.default_charset.clone()
        } else {
            self.directory
                .lang_to_charset(&info.lang)
                .filter(|charset| !charset.is_empty())
                .unwrap_or_else(|| self.default_charset.clone())
        };
        if info.home_dir.is_empty() {
            log_delivery(control, address, "there is no such user in the mail system");
            return DeliveryOutcome::NoUser;
        }
        let timezone = if info.timezone.is_empty() {
            self.default_timezone.clone()
        } else {
            info.timezone
        };

        let mail = if context.mail.has_dot_lines() {
            context.mail.transfer_dot()
        } else {
            context.mail.clone()
        };

        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let file_name = format!("{unix_time}.{}.{}", self.sequencer.next(), self.hostname());
        let eml_path = Path::new(&info.home_dir).join("eml").join(&file_name);

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).read(true).write(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o666);
        let mut file = match options.open(&eml_path).await {
            Ok(file) => file,
            Err(e) => {
                log_delivery(
                    control,
                    address,
                    &format!("failed to create mail file in {}/eml: {e}", info.home_dir),
                );
                return DeliveryOutcome::Transient;
            }
        };
        if let Err(e) = write_fully(&mut file, mail.bytes()).await {
            drop(file);
            let _ = tokio::fs::remove_file(&eml_path).await;
            log_delivery(
                control,
                address,
                &format!("failed to write mail file in {}/eml: {e}", info.home_dir),
            );
            return DeliveryOutcome::Transient;
        }
        drop(file);

        let digest = match build_digest(&file_name, &mail) {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&eml_path).await;
                log_delivery(
                    control,
                    address,
                    &format!("permanent failure getting mail digest: {e}"),
                );
                return DeliveryOutcome::Permanent;
            }
        };

        let mut scratch = ImportScratch::new();
        let import = self.importer.import(&charset, &timezone, &mail, &mut scratch);
        drop(scratch);
        let mut message = match import {
            Ok(message) => message,
            Err(e) => {
                let _ = tokio::fs::remove_file(&eml_path).await;
                log_delivery(
                    control,
                    address,
                    &format!("failed to convert RFC-822 stream into MAPI message: {e}"),
                );
                return DeliveryOutcome::Permanent;
            }
        };

        message.set(
            proptag::MESSAGE_DELIVERY_TIME,
            PropValue::SysTime(nttime::nt_now()),
        );
        if !control.need_bounce {
            message.set(
                proptag::AUTO_RESPONSE_SUPPRESS,
                PropValue::Long(0xFFFF_FFFF),
            );
        }
        message.remove(proptag::CHANGE_NUMBER);

        let status = self
            .store
            .delivery_message(&info.home_dir, &control.from, address, 0, &message, &digest)
            .await;

        match status {
            StoreStatus::Ok => {
                let suppress_mask = message
                    .get_u32(proptag::AUTO_RESPONSE_SUPPRESS)
                    .unwrap_or(0);
                let receipt_requested = message
                    .get_bool(proptag::ORIGINATOR_DELIVERY_REPORT_REQUESTED)
                    .unwrap_or(false)
                    && suppress_mask & AUTO_RESPONSE_SUPPRESS_DR == 0;

                log_delivery(
                    control,
                    address,
                    &format!("message {} is delivered OK", eml_path.display()),
                );
                if control.need_bounce
                    && control.from != NO_REPLY_SENDER
                    && suppress_mask & AUTO_RESPONSE_SUPPRESS_OOF == 0
                {
                    self.responder
                        .reply(self.host.as_ref(), &info.home_dir, address, &control.from)
                        .await;
                }
                if receipt_requested {
                    DeliveryOutcome::DeliveredWithReceipt
                } else {
                    DeliveryOutcome::Ok
                }
            }
            StoreStatus::MailboxFull => {
                log_delivery(control, address, "user's mailbox is full");
                DeliveryOutcome::MailboxFull
            }
            StoreStatus::RuntimeError => {
                log_delivery(
                    control,
                    address,
                    &format!("rpc runtime error delivering into {}", info.home_dir),
                );
                DeliveryOutcome::Transient
            }
            StoreStatus::NoServer => {
                log_delivery(
                    control,
                    address,
                    &format!("missing store connection delivering into {}", info.home_dir),
                );
                DeliveryOutcome::Transient
            }
            StoreStatus::RdwrError => {
                log_delivery(
                    control,
                    address,
                    &format!("read/write error with store delivering into {}", info.home_dir),
                );
                DeliveryOutcome::Transient
            }
            StoreStatus::ResultError => {
                log_delivery(
                    control,
                    address,
                    &format!("error result from store delivering into {}", info.home_dir),
                );
                DeliveryOutcome::Transient
            }
        }
    }

    fn hostname(&self) -> String {
        let host_id = self.host.host_id();
        if !host_id.is_empty() {
            return host_id;
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

async fn write_fully(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

/// Queue-tagged delivery log line; APP-created mail has no queue identity.
pub(crate) fn log_delivery(control: &MessageControl, recipient: &str, message: &str) {
    match control.bound_type {
        BoundType::In | BoundType::Out | BoundType::Relay => {
            tracing::info!(
                queue_id = control.queue_id,
                from = %control.from,
                to = %recipient,
                "{message}"
            );
        }
        BoundType::NotLocal | BoundType::App => {
            tracing::info!(from = %control.from, to = %recipient, "APP created message: {message}");
        }
    }
}
