//! Finders locate sources and manage their ownership.
//!
//! Finding is advisory: [`Finder::find_next_source`] never changes anything
//! outside the finder. Ownership is taken by [`Finder::claim_source`] and
//! given up by marking the source processed or failed.

pub mod drop_folder;
pub mod static_file;

pub use drop_folder::DropFolderFinder;
pub use static_file::StaticFileFinder;

use crate::{Component, Result, RunContext};

pub trait Finder: Component {
    /// The next unclaimed candidate, or `None` if there is nothing to do
    /// right now.
    fn find_next_source(&self, ctx: &RunContext<'_>) -> Result<Option<String>>;

    /// Take exclusive ownership of `uri`, returning the identifier to read
    /// from from now on. Called once per discovered source.
    fn claim_source(&mut self, ctx: &RunContext<'_>, uri: &str) -> Result<String>;

    /// Finalize a source that was read to the end.
    fn mark_source_processed(&mut self, ctx: &RunContext<'_>, uri: &str) -> Result<()>;

    /// Finalize a source that could not be completed.
    fn mark_source_failed(&mut self, ctx: &RunContext<'_>, uri: &str) -> Result<()>;
}
