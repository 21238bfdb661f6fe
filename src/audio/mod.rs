//! # Audio Module
//!
//! Per-guild playback orchestration for Open Music Bot.
//!
//! ## Architecture
//!
//! ### [`session`] and [`transitions`] - State Machine
//! - One [`GuildSession`](session::GuildSession) per guild: queue, history,
//!   blacklist, playback and connection state
//! - `handle(trigger, now)` is synchronous and returns a reply plus a list of
//!   [`Effect`](events::Effect)s; it never touches the network
//!
//! ### [`reconnect`] - Connection Lifecycle
//! - Join, drop detection, exponential backoff with a time budget
//! - Keep-alive while there is work queued, idle leave after a grace period
//!
//! ### [`registry`] and [`orchestrator`] - Concurrency Shell
//! - At most one session per guild, created on demand
//! - One worker task per guild serializes commands, transport events,
//!   resolution results and timers; guilds never block each other
//!
//! ### [`queue`] and [`track`] - Data
//! - Bounded FIFO with front insertion, bounded history, failure blacklist
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music::audio::{orchestrator::Orchestrator, track::TrackRef};
//! # use std::sync::Arc;
//! # use serenity::all::{ChannelId, GuildId, UserId};
//! # async fn example(orchestrator: Orchestrator) -> anyhow::Result<()> {
//! let guild_id = GuildId::new(123456789);
//!
//! orchestrator.join(guild_id, ChannelId::new(1), None).await?;
//! orchestrator
//!     .enqueue(guild_id, TrackRef::new("daft punk around the world", UserId::new(7)))
//!     .await?;
//! orchestrator.pause(guild_id).await?;
//! orchestrator.skip(guild_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod orchestrator;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod track;
pub mod transitions;

pub use events::{Ack, GuildNotification, Notification, TransportEvent};
pub use orchestrator::Orchestrator;
pub use session::{ConnectionState, PlaybackState, SessionSnapshot, SessionStatus};
pub use track::TrackRef;
