//! Named-property resolution.
//!
//! A list file defines the mapping from `(GUID, LID|name)` to 16-bit
//! property ids: one entry per line, ids assigned in file order starting at
//! 0x8001. The table is immutable after load, so lookups take no lock.

use std::{fmt::Write as _, io, path::Path};

use ahash::AHashMap;

use crate::arena::ImportScratch;

/// Id returned for unknown names; the importer treats it as "skip".
pub const PROPID_UNRESOLVED: u16 = 0;

const FIRST_PROPID: u16 = 0x8001;

/// The discriminating half of a property name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropNameKind {
    Lid(u32),
    Name(String),
}

/// A `(GUID, LID|name)` pair as presented by the importer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyName {
    pub guid: String,
    pub kind: PropNameKind,
}

impl PropertyName {
    #[must_use]
    pub fn lid(guid: impl Into<String>, lid: u32) -> Self {
        Self {
            guid: guid.into(),
            kind: PropNameKind::Lid(lid),
        }
    }

    #[must_use]
    pub fn name(guid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            kind: PropNameKind::Name(name.into()),
        }
    }

    fn write_key(&self, buf: &mut String) {
        buf.clear();
        match &self.kind {
            PropNameKind::Lid(lid) => {
                let _ = write!(buf, "guid={},lid={lid}", self.guid);
            }
            PropNameKind::Name(name) => {
                let _ = write!(buf, "guid={},name={name}", self.guid);
            }
        }
        buf.make_ascii_lowercase();
    }
}

/// Immutable `(GUID, LID|name)` to property-id table.
#[derive(Debug, Default)]
pub struct NamedPropertyMap {
    ids: AHashMap<String, u16>,
}

impl NamedPropertyMap {
    /// Load the list file at `path`. Entries are lowercased; a key repeated
    /// later in the file overrides the earlier assignment (each line still
    /// consumes an id).
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_lines(text.lines()))
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ids = AHashMap::new();
        let mut next_id = FIRST_PROPID;
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            ids.insert(line.to_ascii_lowercase(), next_id);
            next_id = next_id.wrapping_add(1);
        }
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Resolve one name. Unknown names yield [`PROPID_UNRESOLVED`].
    #[must_use]
    pub fn resolve(&self, name: &PropertyName, scratch: &mut ImportScratch) -> u16 {
        let mut key = std::mem::take(&mut scratch.key_buf);
        name.write_key(&mut key);
        let id = self.ids.get(&key).copied().unwrap_or(PROPID_UNRESOLVED);
        scratch.key_buf = key;
        id
    }

    /// Resolve a batch of names into the scratch's id buffer, preserving
    /// order. The returned slice lives as long as the scratch borrow.
    pub fn resolve_all<'s>(
        &self,
        names: &[PropertyName],
        scratch: &'s mut ImportScratch,
    ) -> &'s [u16] {
        scratch.propids.clear();
        for name in names {
            let mut key = std::mem::take(&mut scratch.key_buf);
            name.write_key(&mut key);
            let id = self.ids.get(&key).copied().unwrap_or(PROPID_UNRESOLVED);
            scratch.key_buf = key;
            scratch.propids.push(id);
        }
        &scratch.propids
    }
}
