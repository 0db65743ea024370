//! Common test utilities and fixtures for the memovault test suite.
//!
//! Shared builders and sample types used across pipeline, policy, scope,
//! async, and property-based tests. Centralizing them keeps the suites
//! consistent about where their databases and blob directories live.

pub mod fixtures;
