//! Core business logic for Stepline: the definition store, condition
//! evaluator, execution engine, trigger dispatcher, and the repository
//! traits the storage layer implements.

pub mod repository;
pub mod workflow;
