//! Integration test crate for the Cask marketplace.
//!
//! This crate exists solely to run integration tests that span the token and
//! marketplace crates. It has no public API - all functionality is in the
//! test modules.

#![forbid(unsafe_code)]
