//! Session persistence and report publishing for Quarry.
//!
//! [`SessionRepository`] stores session snapshots; [`FileSessionStore`] keeps
//! them as JSON files on disk. [`ReportWriter`] publishes finished reports;
//! [`MarkdownReportWriter`] writes one markdown document per session. Both
//! ports have in-memory doubles.

pub mod memory;
pub mod report;
pub mod store;

pub use memory::{MemoryReportWriter, MemorySessionStore};
pub use report::{render_document, MarkdownReportWriter, ReportWriter};
pub use store::{FileSessionStore, SessionFilters, SessionRepository, SortField, SortOrder};
