//! Stateright models of the coordination protocols.
//!
//! Exhaustive state-space exploration of the manifest publish protocol.
//! The checks are `#[ignore]`d to keep the default test run fast:
//!
//! ```bash
//! cargo test stateright_ -- --ignored --nocapture
//! ```

pub mod manifest;
