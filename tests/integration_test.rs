// tests/integration_test.rs

//! Integration tests for Helmsman.
//!
//! These tests run a complete controller against in-process collaborator
//! implementations, verifying election, join, transition execution, and
//! fencing end to end.

mod integration {
    pub mod controller_test;
    pub mod fencing_flow_test;
    pub mod fixtures;
}
