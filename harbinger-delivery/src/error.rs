//! Delivery outcome classification.
//!
//! The delivery unit never propagates I/O or transport errors upward; every
//! failure collapses into one of these variants at the boundary, and the
//! hook dispatcher turns the variant into counters, bounces, or a retry.

/// Result of delivering one message to one local recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Stored successfully.
    Ok,
    /// Stored successfully and the originator asked for a delivery receipt.
    DeliveredWithReceipt,
    /// The address has no mailbox.
    NoUser,
    /// The recipient's quota is exhausted.
    MailboxFull,
    /// Digest or import failure. Bounced, never retried.
    Permanent,
    /// I/O, transport, or directory failure. Retried, never bounced now.
    Transient,
}

impl DeliveryOutcome {
    /// True for the two outcomes that left a message in the store.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::DeliveredWithReceipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stored_outcomes_count_as_success() {
        assert!(DeliveryOutcome::Ok.is_success());
        assert!(DeliveryOutcome::DeliveredWithReceipt.is_success());
        assert!(!DeliveryOutcome::NoUser.is_success());
        assert!(!DeliveryOutcome::MailboxFull.is_success());
        assert!(!DeliveryOutcome::Permanent.is_success());
        assert!(!DeliveryOutcome::Transient.is_success());
    }
}
