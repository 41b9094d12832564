//! Integration tests for Undertow
//!
//! These tests drive the engine through its public handle the way the
//! control layer would, and verify the observable lifecycle, queueing,
//! verification, tracker scheduling, and bandwidth contracts.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/session_lifecycle.rs"]
mod session_lifecycle;

#[path = "integration/queue_policy.rs"]
mod queue_policy;

#[path = "integration/tracker_schedule.rs"]
mod tracker_schedule;

#[path = "integration/bandwidth_policy.rs"]
mod bandwidth_policy;
