//! Domain models for Mender.
//!
//! Canonical definitions for the records that flow through the pipeline:
//! - `ErrorEvent`: an observed failure extracted from a log stream
//! - `Fix`: a candidate patch and its lifecycle
//! - `ErrorFixPattern`: a learned (class, strategy) association

pub mod error;
pub mod event;
pub mod fingerprint;
pub mod fix;
pub mod pattern;

pub use error::{MenderError, PatternError, Result, TransitionError};
pub use event::{
    capture_environment, CodeSnippet, ErrorEvent, Severity, SourceLocation, StackFrame,
};
pub use fingerprint::{error_signature, fingerprint, normalize_message, DEFAULT_TOP_FRAMES};
pub use fix::{
    unit_interval, ChangeKind, CodeChange, Fix, FixStatus, RollbackData, StatusChange, TestResult,
};
pub use pattern::ErrorFixPattern;
