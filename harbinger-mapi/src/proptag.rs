//! Property tags.
//!
//! A tag packs a 16-bit property id in the high word and a 16-bit type code
//! in the low word. Named properties receive ids at or above 0x8001 from the
//! resolver; everything below is a fixed tag from the transport protocol.

pub type PropTag = u32;

pub const PT_LONG: u16 = 0x0003;
pub const PT_BOOLEAN: u16 = 0x000B;
pub const PT_I8: u16 = 0x0014;
pub const PT_UNICODE: u16 = 0x001F;
pub const PT_SYSTIME: u16 = 0x0040;
pub const PT_BINARY: u16 = 0x0102;

#[must_use]
pub const fn make_tag(id: u16, kind: u16) -> PropTag {
    ((id as u32) << 16) | kind as u32
}

#[must_use]
pub const fn prop_id(tag: PropTag) -> u16 {
    (tag >> 16) as u16
}

#[must_use]
pub const fn prop_type(tag: PropTag) -> u16 {
    (tag & 0xFFFF) as u16
}

pub const IMPORTANCE: PropTag = 0x0017_0003;
pub const MESSAGE_CLASS: PropTag = 0x001A_001F;
pub const ORIGINATOR_DELIVERY_REPORT_REQUESTED: PropTag = 0x0023_000B;
pub const READ_RECEIPT_REQUESTED: PropTag = 0x0029_000B;
pub const SUBJECT: PropTag = 0x0037_001F;
pub const CLIENT_SUBMIT_TIME: PropTag = 0x0039_0040;
pub const SENDER_NAME: PropTag = 0x0C1A_001F;
pub const SENDER_EMAIL_ADDRESS: PropTag = 0x0C1F_001F;
pub const DISPLAY_CC: PropTag = 0x0E03_001F;
pub const DISPLAY_TO: PropTag = 0x0E04_001F;
pub const MESSAGE_DELIVERY_TIME: PropTag = 0x0E06_0040;
pub const BODY: PropTag = 0x1000_001F;
pub const INTERNET_MESSAGE_ID: PropTag = 0x1035_001F;
pub const INTERNET_CPID: PropTag = 0x3FDE_0003;
pub const AUTO_RESPONSE_SUPPRESS: PropTag = 0x3FDF_0003;
pub const CHANGE_NUMBER: PropTag = 0x67A4_0014;

/// Bits of [`AUTO_RESPONSE_SUPPRESS`].
pub const AUTO_RESPONSE_SUPPRESS_DR: u32 = 0x0000_0001;
pub const AUTO_RESPONSE_SUPPRESS_NDR: u32 = 0x0000_0002;
pub const AUTO_RESPONSE_SUPPRESS_RN: u32 = 0x0000_0004;
pub const AUTO_RESPONSE_SUPPRESS_NRN: u32 = 0x0000_0008;
pub const AUTO_RESPONSE_SUPPRESS_OOF: u32 = 0x0000_0010;
pub const AUTO_RESPONSE_SUPPRESS_AUTOREPLY: u32 = 0x0000_0020;
