//! HTTP request handlers grouped by resource.

pub mod definition;
pub mod event;
pub mod instance;
