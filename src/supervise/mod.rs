// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured task supervision: cancellation scopes and backoff retry.
//!
//! [`Scope`] provides hierarchical, cooperative cancellation where cancelling
//! a node blocks until its whole subtree has torn down. [`run_with_retry`]
//! layers a cooldown-ladder retry loop on top for long-lived connections.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use cradlecast::supervise::{RetryPolicy, Scope, run_with_retry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let policy = RetryPolicy::new(vec![Duration::from_millis(10)], Duration::from_secs(2));
//!
//! let root = Scope::root();
//! run_with_retry(&root, "example", &policy, |_attempt| async move {
//!     // A real runner would connect and pump a transport here.
//!     Ok(())
//! })
//! .await;
//! # }
//! ```

mod retry;
mod scope;

pub use retry::{Attempt, RetryPolicy, run_with_retry};
pub use scope::{Outcome, Scope, TaskHandle};
