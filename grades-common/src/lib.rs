//! # Grades Common Library
//!
//! Shared code for the grades pipeline including:
//! - Course and usage key value objects
//! - Event types (GradeEvent, InboundEvent) and the EventBus
//! - Database initialization and migrations
//! - Bootstrap configuration loading
//! - Canonical digests and timestamp helpers

pub mod config;
pub mod db;
pub mod digest;
pub mod error;
pub mod events;
pub mod keys;
pub mod time;

pub use error::{Error, Result};
pub use keys::{CourseKey, LearnerId, UsageKey};
