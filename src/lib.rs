//! ToolWarden Library
//!
//! This library provides the core functionality for ToolWarden, a mediated
//! execution pipeline for a fixed catalog of security tooling: argument
//! validation, permission and rate admission, safe command construction,
//! timed subprocess execution, audit logging, replayable history, and a
//! cron-driven task scheduler.

pub mod audit;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod history;
pub mod policy;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod telemetry;
pub mod validate;
