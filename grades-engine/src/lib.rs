//! # Grades Engine
//!
//! Turns learner score events into persisted subsection and course grades.
//!
//! **Pipeline:** inbound events are normalized by [`ingress`], written to the
//! score store, and queued on the [`scheduler`], which recomputes subsection
//! grades and then the course grade under the course grading policy.
//!
//! **Reads:** [`read_api`] serves point and bulk reads; [`reports`] pages
//! through a course to build CSV reports that can be cancelled and resumed.

pub mod config;
pub mod context;
pub mod directory;
pub mod engine;
pub mod error;
pub mod grader;
pub mod ingress;
pub mod policy;
pub mod read_api;
pub mod reports;
pub mod scheduler;
pub mod service;
pub mod stores;
pub mod structure;
pub mod utils;

pub use config::RuntimeSettings;
pub use error::{GradesError, Result};
pub use service::{GradesService, HandleOutcome, ServiceDeps};
