// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage collaborators: traits plus in-memory reference implementations.

pub mod memory;
pub mod traits;

pub use memory::{InMemoryClientStore, InMemoryRecordStore};
pub use traits::{ClientStore, RecordQuery, RecordStore, StorageError, WriteScope};
