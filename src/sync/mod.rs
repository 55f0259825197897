// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Both sync directions.
//!
//! - [`inbound`]: client → server operations, merged field by field
//! - [`outbound`]: server → client change delivery behind a watermark
//! - [`merge`]: the pure last-writer-wins merge the inbound side uses

pub mod inbound;
pub mod merge;
pub mod outbound;

pub use inbound::{InboundSync, MergeHandler, MergeOutcome};
pub use merge::{merge_record, MergeReport};
pub use outbound::{OutboundMessage, OutboundSynchronizer, SweepSummary, SyncOutcome, SyncTrigger};
