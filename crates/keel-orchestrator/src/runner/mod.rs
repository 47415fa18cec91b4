// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job runners.
//!
//! A runner executes one backend job in a prepared directory and reports
//! whether it is still running and how it ended. Two implementations:
//!
//! - [`ProcessJobRunner`]: local child processes
//! - [`MockJobRunner`]: in-memory double for tests

pub mod mock;
pub mod process;
mod traits;

pub use mock::MockJobRunner;
pub use process::ProcessJobRunner;
pub use traits::*;
