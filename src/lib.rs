//! # reportage
//!
//! A reporting engine that merges rows from pluggable sources into cached,
//! paged reports.
//!
//! ## Architecture
//!
//! A report is a set of columns grouped by the source that computes them,
//! plus a key range that enumerates the row keys:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           ReportDefinition (keys, columns, filters)      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [clean_user_inputs]
//! ┌─────────────────────────────────────────────────────────┐
//! │         Report (validated inputs, unique instance id)    │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [pre_process, key range tee]
//! ┌─────────────────────────────────────────────────────────┐
//! │    Sources: key / static / database / merge / derived    │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [k-way merge by key, post_process]
//! ┌─────────────────────────────────────────────────────────┐
//! │             ReportRun (complete rows + footer)           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [create_instance]
//! ┌─────────────────────────────────────────────────────────┐
//! │      ReportCache (LocalCache / MemoryCache), paging      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod column;
pub mod config;
pub mod database;
pub mod error;
pub mod filter;
pub mod format;
pub mod helpers;
pub mod key_range;
pub mod logging;
pub mod merge;
pub mod registry;
pub mod report;
pub mod row;
pub mod source;
pub mod stream;
pub mod value;
pub mod widget;

/// Re-exports for defining reports.
pub mod prelude {
    pub use crate::cache::{
        LocalCache, MemoryCache, ReportCache, RowQuery, Sort, SortDirection,
    };
    pub use crate::column::Column;
    pub use crate::database::{Condition, Database, Entity};
    pub use crate::error::{ReportError, ReportResult, ValidationError};
    pub use crate::filter::Filter;
    pub use crate::format::{Format, OutputMode};
    pub use crate::key_range::{DateBound, KeyRange};
    pub use crate::registry::{register, Registry};
    pub use crate::report::{Report, ReportDefinition};
    pub use crate::row::{Key, Row};
    pub use crate::source::{RunContext, Source, SourceKind};
    pub use crate::value::Value;
    pub use crate::widget::Widget;
}

pub use error::{ReportError, ReportResult};
pub use report::{Report, ReportDefinition};
pub use value::Value;
