//! The MTA hook: recipient split and outcome dispatch.
//!
//! Each recipient of an inbound context is either delivered locally through
//! the delivery unit or passed through to the next hook. The hook claims the
//! message (`true`) only when nothing was left for remote transport.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use harbinger_common::{
    context::{BoundType, MessageContext, RecipientList},
    services::UserDirectory,
    stats::DeliveryStats,
};

use crate::{
    bounce::{BounceKind, Bouncer},
    cache::RetryCache,
    error::DeliveryOutcome,
    quota::{log_delivery, DeliveryUnit},
};

/// Entry point the MTA invokes once per queued message.
pub struct HookDispatcher {
    directory: Arc<dyn UserDirectory>,
    unit: Arc<DeliveryUnit>,
    cache: Arc<RetryCache>,
    bouncer: Arc<Bouncer>,
    stats: Arc<DeliveryStats>,
}

impl HookDispatcher {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        unit: Arc<DeliveryUnit>,
        cache: Arc<RetryCache>,
        bouncer: Arc<Bouncer>,
        stats: Arc<DeliveryStats>,
    ) -> Self {
        Self {
            directory,
            unit,
            cache,
            bouncer,
            stats,
        }
    }

    /// Process one message. Returns `true` when the message was fully
    /// handled locally; `false` leaves the (rewritten) recipient list to
    /// the next hook.
    pub async fn hook(&self, context: &mut MessageContext) -> bool {
        if context.control.bound_type == BoundType::NotLocal {
            return false;
        }

        let mut remote = RecipientList::new();
        let mut remote_found = false;
        let recipients: Vec<String> = context
            .control
            .rcpt_to
            .lines()
            .map(ToOwned::to_owned)
            .collect();

        for recipient in &recipients {
            let Some((_, domain)) = recipient.split_once('@') else {
                remote.write_line(recipient.clone());
                continue;
            };
            if !self.directory.check_domain(domain) {
                remote_found = true;
                remote.write_line(recipient.clone());
                continue;
            }

            match self.unit.deliver(context, recipient).await {
                DeliveryOutcome::Ok => self.stats.record_ok(),
                DeliveryOutcome::DeliveredWithReceipt => {
                    self.stats.record_ok();
                    self.bouncer.bounce(
                        &context.control,
                        recipient,
                        &context.mail,
                        BounceKind::Delivered,
                    );
                }
                DeliveryOutcome::NoUser => {
                    self.stats.record_nouser();
                    self.bouncer.bounce(
                        &context.control,
                        recipient,
                        &context.mail,
                        BounceKind::NoUser,
                    );
                }
                DeliveryOutcome::MailboxFull => {
                    self.bouncer.bounce(
                        &context.control,
                        recipient,
                        &context.mail,
                        BounceKind::MailboxFull,
                    );
                }
                DeliveryOutcome::Permanent => {
                    self.stats.record_permanent();
                    self.bouncer.bounce(
                        &context.control,
                        recipient,
                        &context.mail,
                        BounceKind::OperationError,
                    );
                }
                DeliveryOutcome::Transient => {
                    self.stats.record_temp();
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    match self.cache.put(context, recipient, now).await {
                        Ok(cache_id) => log_delivery(
                            &context.control,
                            recipient,
                            &format!(
                                "message is put into cache queue with cache ID {cache_id} \
                                 and will be delivered next time"
                            ),
                        ),
                        Err(e) => log_delivery(
                            &context.control,
                            recipient,
                            &format!("failed to put message into cache queue: {e}"),
                        ),
                    }
                }
            }
        }

        if remote_found {
            context.control.rcpt_to = remote;
            false
        } else {
            true
        }
    }
}
