//! # QuillDB Testkit
//!
//! Test utilities for the QuillDB journal.
//!
//! This crate provides:
//! - In-memory doubles for the journal's collaborator seams
//!   ([`MemoryPageDevice`], [`MemoryStore`])
//! - Temp-directory journal fixtures ([`JournalFixture`])
//! - A crash-recovery harness ([`RecoveryHarness`]) that scripts a
//!   workload, simulates a crash, and recovers into fresh state
//!
//! The end-to-end recovery scenarios live in `tests/recovery.rs`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;

pub use crash::{ChangesetCrashPoint, RecoveryHarness};
pub use fixtures::{JournalFixture, MemoryPageDevice, MemoryStore};
