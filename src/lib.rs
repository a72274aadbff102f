//! Dictionary entry rendering.
//!
//! Raw dictionary records are HTML fragments with private link schemes
//! (`entry://`, `sound://`), relative resource paths and `@@@LINK=` alias
//! records. This crate resolves aliases, rewrites links for the page the
//! records end up in and merges records from several dictionaries into one
//! response. The optional `web` feature serves the result over HTTP.

pub mod dedupe;
pub mod error;
pub mod history;
pub mod link;
pub mod merge;
pub mod resource;
pub mod rewrite;
pub mod source;
#[cfg(feature = "web")]
pub mod web;

pub use error::{HistoryError, RenderError, ResourceError, Result, SourceError};
pub use history::{HistoryEntry, HistoryLog};
pub use link::RedirectInstruction;
pub use merge::{Rendered, RenderedPage, RenderedSection, Renderer, SourceListing};
pub use resource::ResourceService;
pub use rewrite::{RenderMode, RewriteContext};
pub use source::{
    DictionarySource, EntryLookup, SourceKind, SourceRegistry, StaticDictionary, Translator,
};
