//! # tether-proto
//!
//! Shared types, error definitions, and traits for Tether.
//!
//! This crate provides the vocabulary spoken across the UI boundary:
//! - [`BoundaryEvent`]: notifications emitted toward the UI
//! - [`UiCommand`] and [`StartOptions`]: operations accepted from the UI
//! - [`ResumeStore`]: the narrow contract consumed from the conversation store

mod boundary;
mod command;
mod store;

pub use boundary::BoundaryEvent;
pub use command::{
    ImageAttachment, ParseDecisionError, ParseModeError, PermissionDecision, PermissionMode,
    StartOptions, UiCommand,
};
pub use store::{ResumeStore, StoreError};
