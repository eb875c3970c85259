//! The merge-run pipeline: load the base, extract the mods, merge every file
//! into a staging directory, pack it and write the resolution report.

pub mod base;
pub mod engine;
pub mod prompt;
pub mod report;

pub use base::BaseArchive;
pub use engine::{MergeRequest, MergeRun};
pub use prompt::{Aborted, BatchPolicy, MergeReporter};
pub use report::{ConflictReport, FileAction, FileReport, MergeReport, MergeSummary};
