// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`traits`]: the [`BufferStore`](traits::BufferStore) and
//!   [`DocumentStore`](traits::DocumentStore) seams
//! - [`redis`]: Redis buffer store (queues, write buffer, read cache)
//! - [`mongo`]: MongoDB document store
//! - [`sql`]: SQL document store (SQLite/MySQL via sqlx `Any`)
//! - [`memory`]: in-process stores for tests and embedding

pub mod traits;
pub mod memory;
pub mod redis;
pub mod mongo;
pub mod sql;
