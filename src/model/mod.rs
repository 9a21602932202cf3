//! Core data model.
//!
//! Work items and their outcomes live in [`work`]; the loop's persisted
//! bookkeeping lives in [`scheduler`].

pub mod scheduler;
pub mod work;
