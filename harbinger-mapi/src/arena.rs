//! Per-import scratch space.
//!
//! The importer and the named-property resolver share short-lived buffers
//! for the duration of a single import. Callers create one scratch per
//! delivery, pass it down explicitly, and drop it before returning; nothing
//! allocated here survives the import.

/// Reusable buffers for one import pass.
#[derive(Debug, Default)]
pub struct ImportScratch {
    pub(crate) propids: Vec<u16>,
    pub(crate) key_buf: String,
}

impl ImportScratch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all buffers so the scratch can serve another import.
    pub fn reset(&mut self) {
        self.propids.clear();
        self.key_buf.clear();
    }
}
