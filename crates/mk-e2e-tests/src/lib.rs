//! End-to-end scenario tests for the makerspace device agent.
//!
//! All tests live under `tests/`.
