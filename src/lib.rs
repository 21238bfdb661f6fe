//! Open Music: a Discord music bot built around a per-guild playback
//! orchestrator. The [`audio`] module is usable on its own; [`bot`] wires it
//! to serenity and songbird.

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;
pub mod ui;
