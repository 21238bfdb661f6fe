//! Discord presentation: embeds for command replies, status views and the
//! notifications the orchestrator broadcasts.

pub mod embeds;
