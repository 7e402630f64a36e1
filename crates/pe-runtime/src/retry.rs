// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policies and timeout configuration for resilient backend execution.

pub use pe_retry::{retry_async, RetryOutcome, RetryPolicy, RetryPolicyBuilder, TimeoutConfig};
