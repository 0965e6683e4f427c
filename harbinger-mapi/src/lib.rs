#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod arena;
pub mod digest;
pub mod import;
pub mod message;
pub mod nttime;
pub mod propnames;
pub mod proptag;

pub use arena::ImportScratch;
pub use import::{ImportError, Importer};
pub use message::{MapiMessage, PropValue};
pub use propnames::{NamedPropertyMap, PropNameKind, PropertyName};
