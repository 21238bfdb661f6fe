use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use tracing::warn;

use super::events::{PlaybackToken, ResolveToken};
use super::queue::{Blacklist, PlayHistory, TrackQueue};
use super::reconnect::Backoff;
use super::track::{StreamDescriptor, TrackRef};
use crate::config::PlaybackConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Idle,
    Resolving,
    Playing,
    Paused,
    Skipping,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Track en reproducción con su stream ya resuelto.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub track: TrackRef,
    pub stream: StreamDescriptor,
    pub interlude: bool,
}

/// Resolución lanzada y todavía sin respuesta.
#[derive(Debug, Clone)]
pub(super) struct PendingResolution {
    pub token: ResolveToken,
    pub track: TrackRef,
    pub interlude: bool,
}

/// Motivo por el que un track en pausa no está sonando.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Hold {
    None,
    /// Resuelto sin conexión de voz; arranca al conectar
    AwaitingConnection,
    /// Pausado a la fuerza por una caída de la conexión
    Outage,
}

/// Lo único que sobrevive a un reinicio: referencias, nunca streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub queue: Vec<TrackRef>,
    pub history: Vec<TrackRef>,
    pub now_playing: Option<TrackRef>,
}

impl SessionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.history.is_empty() && self.now_playing.is_none()
    }
}

/// Vista de solo lectura para `/status` y `/queue`.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub guild_id: GuildId,
    pub now_playing: Option<NowPlaying>,
    pub resolving: Option<TrackRef>,
    pub queue: TrackQueue,
    pub history: Vec<TrackRef>,
    pub blacklist_len: usize,
    pub playback_state: PlaybackState,
    pub connection_state: ConnectionState,
    pub voice_channel: Option<ChannelId>,
    pub reconnect_exhausted: bool,
    pub last_activity: DateTime<Utc>,
}

/// Estado completo de reproducción de un guild.
///
/// Solo se modifica a través de [`GuildSession::handle`], que corre bajo el
/// lock del slot del registro. Los campos son visibles para los módulos de
/// transiciones y reconexión, nunca fuera de `audio`.
#[derive(Debug)]
pub struct GuildSession {
    pub(super) guild_id: GuildId,
    pub(super) config: PlaybackConfig,

    pub(super) queue: TrackQueue,
    pub(super) history: PlayHistory,
    pub(super) now_playing: Option<NowPlaying>,
    pub(super) blacklist: Blacklist,
    pub(super) playback_state: PlaybackState,
    pub(super) connection_state: ConnectionState,
    pub(super) last_activity: DateTime<Utc>,

    pub(super) voice_channel: Option<ChannelId>,
    pub(super) text_channel: Option<ChannelId>,

    pub(super) pending: Option<PendingResolution>,
    pub(super) next_token: u64,
    pub(super) playback_token: Option<PlaybackToken>,
    pub(super) hold: Hold,
    /// Cuántos tracks al frente de la cola son interludios
    pub(super) front_interludes: usize,
    pub(super) consecutive_failures: usize,

    pub(super) backoff: Backoff,
    pub(super) reconnect_exhausted: bool,
    pub(super) keepalive_armed: bool,

    // Generaciones de timers: un disparo con generación vieja se ignora
    pub(super) idle_generation: u64,
    pub(super) keepalive_generation: u64,
    pub(super) reconnect_generation: u64,
}

impl GuildSession {
    pub fn new(guild_id: GuildId, config: PlaybackConfig) -> Self {
        Self {
            guild_id,
            config,
            queue: TrackQueue::new(config.max_queue_size),
            history: PlayHistory::new(config.max_history_size),
            now_playing: None,
            blacklist: Blacklist::default(),
            playback_state: PlaybackState::Idle,
            connection_state: ConnectionState::Disconnected,
            last_activity: Utc::now(),
            voice_channel: None,
            text_channel: None,
            pending: None,
            next_token: 0,
            playback_token: None,
            hold: Hold::None,
            front_interludes: 0,
            consecutive_failures: 0,
            backoff: Backoff::default(),
            reconnect_exhausted: false,
            keepalive_armed: false,
            idle_generation: 0,
            keepalive_generation: 0,
            reconnect_generation: 0,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn now_playing(&self) -> Option<&NowPlaying> {
        self.now_playing.as_ref()
    }

    pub fn queue(&self) -> &TrackQueue {
        &self.queue
    }

    pub fn history(&self) -> &PlayHistory {
        &self.history
    }

    pub fn is_blacklisted(&self, track: &TrackRef) -> bool {
        self.blacklist.contains(&track.identity())
    }

    pub fn text_channel(&self) -> Option<ChannelId> {
        self.text_channel
    }

    pub fn is_resolving(&self) -> bool {
        self.pending.is_some()
    }

    /// Sin cola, sin track actual y sin resolución pendiente.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.now_playing.is_none()
            && self.pending.is_none()
            && matches!(
                self.playback_state,
                PlaybackState::Idle | PlaybackState::Ended
            )
    }

    /// Foto persistible. Un track en resolución cuenta como el actual.
    pub fn snapshot(&self) -> SessionSnapshot {
        let now_playing = self
            .now_playing
            .as_ref()
            .map(|np| np.track.clone())
            .or_else(|| self.pending.as_ref().map(|p| p.track.clone()));

        SessionSnapshot {
            queue: self.queue.to_vec(),
            history: self.history.to_vec(),
            now_playing,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            guild_id: self.guild_id,
            now_playing: self.now_playing.clone(),
            resolving: self.pending.as_ref().map(|p| p.track.clone()),
            queue: self.queue.clone(),
            history: self.history.to_vec(),
            blacklist_len: self.blacklist.len(),
            playback_state: self.playback_state,
            connection_state: self.connection_state,
            voice_channel: self.voice_channel,
            reconnect_exhausted: self.reconnect_exhausted,
            last_activity: self.last_activity,
        }
    }

    /// Carga una foto en una sesión vacía, recortando a los límites actuales.
    ///
    /// Devuelve `(encolados, descartados)`.
    pub(super) fn load_snapshot(&mut self, snapshot: SessionSnapshot) -> (usize, usize) {
        let total = snapshot.queue.len() + usize::from(snapshot.now_playing.is_some());
        let queued = self
            .queue
            .extend_bounded(snapshot.now_playing.into_iter().chain(snapshot.queue));
        let dropped = total - queued;

        let history_overflow = snapshot
            .history
            .len()
            .saturating_sub(self.config.max_history_size);
        for track in snapshot.history {
            self.history.push(track);
        }

        if dropped > 0 || history_overflow > 0 {
            warn!(
                "✂️ Estado restaurado recortado en guild {}: {} de la cola y {} del historial",
                self.guild_id, dropped, history_overflow
            );
        }

        (queued, dropped)
    }

    pub(super) fn next_resolve_token(&mut self) -> ResolveToken {
        self.next_token += 1;
        ResolveToken(self.next_token)
    }

    pub(super) fn next_playback_token(&mut self) -> PlaybackToken {
        self.next_token += 1;
        PlaybackToken(self.next_token)
    }

    /// Retira el track actual junto con su token y su motivo de pausa.
    pub(super) fn take_now_playing(&mut self) -> Option<NowPlaying> {
        self.playback_token = None;
        self.hold = Hold::None;
        self.now_playing.take()
    }

    /// Comprueba las invariantes estructurales; solo para tests.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let active = matches!(
            self.playback_state,
            PlaybackState::Playing | PlaybackState::Paused
        );
        assert_eq!(
            self.now_playing.is_some(),
            active,
            "now_playing con estado {:?}",
            self.playback_state
        );
        assert_eq!(
            self.pending.is_some(),
            self.playback_state == PlaybackState::Resolving,
            "resolución pendiente con estado {:?}",
            self.playback_state
        );
        assert!(self.queue.len() <= self.config.max_queue_size);
        assert!(self.front_interludes <= self.queue.len());
        assert!(self.history.len() <= self.config.max_history_size);
        if self.hold != Hold::None {
            assert_eq!(self.playback_state, PlaybackState::Paused);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn track(query: &str) -> TrackRef {
        TrackRef::new(query, UserId::new(1))
    }

    fn session(max_queue: usize, max_history: usize) -> GuildSession {
        let config = PlaybackConfig {
            max_queue_size: max_queue,
            max_history_size: max_history,
            ..PlaybackConfig::default()
        };
        GuildSession::new(GuildId::new(1), config)
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = session(5, 5);
        assert!(session.is_idle());
        assert!(session.snapshot().is_empty());
        session.assert_invariants();
    }

    #[test]
    fn test_snapshot_counts_pending_as_current() {
        let mut session = session(5, 5);
        let token = session.next_resolve_token();
        session.pending = Some(PendingResolution {
            token,
            track: track("a"),
            interlude: false,
        });
        session.playback_state = PlaybackState::Resolving;
        session.queue.push_back(track("b")).unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.now_playing, Some(track("a")));
        assert_eq!(snapshot.queue, vec![track("b")]);
        assert!(!session.is_idle());
    }

    #[test]
    fn test_load_snapshot_truncates_to_bounds() {
        let mut session = session(2, 1);
        let snapshot = SessionSnapshot {
            queue: vec![track("b"), track("c")],
            history: vec![track("x"), track("y")],
            now_playing: Some(track("a")),
        };

        let (queued, dropped) = session.load_snapshot(snapshot);

        assert_eq!((queued, dropped), (2, 1));
        assert_eq!(session.queue.to_vec(), vec![track("a"), track("b")]);
        assert_eq!(session.history.to_vec(), vec![track("y")]);
        session.assert_invariants();
    }

    #[test]
    fn test_tokens_are_unique_across_kinds() {
        let mut session = session(1, 1);
        let resolve = session.next_resolve_token();
        let playback = session.next_playback_token();
        assert_ne!(resolve.0, playback.0);
    }
}
