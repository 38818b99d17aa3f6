//! Test utilities for the notifier crate.
//!
//! This module provides shared helpers for both unit tests (in `src/`) and
//! integration tests (in `tests/`). It is compiled for tests and behind the
//! `test-support` feature.

pub mod notifications;
