//! Process-wide diagnostics.

pub mod logging;
