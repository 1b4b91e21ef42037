//! # tracegraft
//!
//! `tracegraft` replays execution-time fault injections as surgical edits
//! to a post-execution witness trace, then compares the constraint
//! fallout of the two layers. It is organized around:
//! - `records`: tagged-record scraping from captured subject output
//! - `isa`: instruction classification and the register window map
//! - `trace`: validated index over the fine witness trace
//! - `offset`: coarse/fine step drift estimation from shared landmarks
//! - `correlate`: pc-anchored fault-to-step resolution
//! - `strategy`: per-fault-kind synthesis of the one trace edit
//! - `compare`: failure-set keying and the differential verdict
//! - `harness`: resumable campaign orchestration (feature `harness`)
//!
//! Anything specific to one subject binary (spawn flags, environment,
//! artifact layout) belongs in the harness layer, not in core.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod compare;
pub mod correlate;
pub mod isa;
pub mod offset;
pub mod records;
pub mod strategy;
pub mod trace;

#[cfg(feature = "harness")]
#[cfg_attr(docsrs, doc(cfg(feature = "harness")))]
pub mod harness;
