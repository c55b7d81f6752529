// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure handling.
//!
//! - [`retry`]: in-call retry for connections and idempotent buffer commands
//! - [`backoff`]: delay before a failed job is requeued
//! - [`degraded`]: health probes and the degraded-mode switch

pub mod retry;
pub mod backoff;
pub mod degraded;
