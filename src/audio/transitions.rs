//! Transition function of a guild's playback state machine.
//!
//! [`GuildSession::handle`] is the single entry point for every trigger:
//! user commands, transport events, resolution results and timers. It is
//! synchronous and never fails; rejected commands leave the session
//! untouched and travel back in [`Step::reply`]. Anything that has to
//! suspend (resolving, talking to the voice driver, waiting) is returned as
//! an [`Effect`] for the guild worker to execute in order.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::events::{
    Ack, Command, Effect, Notification, ResolveToken, Step, TransportEvent, TransportIntent,
    Trigger,
};
use super::session::{
    ConnectionState, GuildSession, Hold, NowPlaying, PendingResolution, PlaybackState,
    SessionSnapshot,
};
use super::track::{StreamDescriptor, TrackRef};
use crate::error::{CommandError, ResolutionError, StaleOperation, ValidationError};

type Effects = Vec<Effect>;

impl GuildSession {
    pub fn handle(&mut self, trigger: Trigger, now: DateTime<Utc>) -> Step {
        let before = self.snapshot();
        let mut fx = Effects::new();

        let reply = match trigger {
            Trigger::Command(command) => {
                let name = command.name();
                self.last_activity = now;
                let result = self.on_command(command, &mut fx);
                if let Err(e) = &result {
                    debug!("🙅 Comando `{}` rechazado en guild {}: {}", name, self.guild_id, e);
                }
                Some(result)
            }
            Trigger::Transport(event) => {
                self.on_transport_event(event, now, &mut fx);
                None
            }
            Trigger::ResolutionCompleted { token, result } => {
                if let Err(stale) = self.on_resolution(token, result, &mut fx) {
                    debug!("⌛ {} (guild {}, token {:?})", stale, self.guild_id, token);
                }
                None
            }
            Trigger::JoinFailed { reason } => {
                self.on_join_failed(reason, &mut fx);
                None
            }
            Trigger::TimerFired { kind, generation } => {
                self.on_timer(kind, generation, &mut fx);
                None
            }
        };

        self.sync_keepalive(&mut fx);

        let releasing = fx.iter().any(|effect| matches!(effect, Effect::Release));
        if !releasing && self.snapshot() != before {
            fx.push(Effect::Persist);
        }

        Step { reply, effects: fx }
    }

    fn on_command(&mut self, command: Command, fx: &mut Effects) -> Result<Ack, CommandError> {
        match command {
            Command::Enqueue(track) => self.enqueue(track, fx),
            Command::EnqueuePlaylist(tracks) => self.enqueue_playlist(tracks, fx),
            Command::Skip => self.skip(fx),
            Command::Back => self.back(fx),
            Command::Pause => self.pause(fx),
            Command::Resume => self.resume(fx),
            Command::Interlude(tracks) => self.interlude(tracks, fx),
            Command::ClearQueue(count) => self.clear_queue(count),
            Command::ClearAll => Ok(self.clear_all(fx)),
            Command::Stop => Ok(self.stop(fx)),
            Command::Reset => Ok(self.reset(fx)),
            Command::Join {
                voice_channel,
                text_channel,
            } => self.join(voice_channel, text_channel, fx),
            Command::Restore(snapshot) => self.restore(snapshot, fx),
        }
    }

    fn ensure_not_ending(&self) -> Result<(), CommandError> {
        if self.playback_state == PlaybackState::Ended {
            return Err(CommandError::SessionBusy("la sesión se está cerrando"));
        }
        Ok(())
    }

    fn enqueue(&mut self, track: TrackRef, fx: &mut Effects) -> Result<Ack, CommandError> {
        self.ensure_not_ending()?;
        if self.queue.is_full() {
            return Err(ValidationError::QueueFull {
                max: self.queue.max_size(),
            }
            .into());
        }

        // Un pedido explícito le da otra oportunidad al track
        if self.blacklist.remove(&track.identity()) {
            info!("♻️ {} sale de la lista negra por pedido explícito", track);
        }

        let position = self.queue.push_back(track)?;
        let started = self.playback_state == PlaybackState::Idle;
        if started {
            self.consecutive_failures = 0;
            self.advance(fx);
        }

        Ok(Ack::Queued { position, started })
    }

    fn enqueue_playlist(
        &mut self,
        tracks: Vec<TrackRef>,
        fx: &mut Effects,
    ) -> Result<Ack, CommandError> {
        self.ensure_not_ending()?;
        if tracks.is_empty() {
            return Err(ValidationError::EmptyPlaylist.into());
        }
        if self.queue.is_full() {
            return Err(ValidationError::QueueFull {
                max: self.queue.max_size(),
            }
            .into());
        }

        let total = tracks.len();
        let accepted: Vec<TrackRef> = tracks
            .into_iter()
            .take(self.queue.remaining_capacity())
            .collect();
        for track in &accepted {
            self.blacklist.remove(&track.identity());
        }

        let added = self.queue.extend_bounded(accepted);
        let rejected = total - added;
        info!(
            "📋 Playlist en guild {}: {} agregadas, {} rechazadas por cola llena",
            self.guild_id, added, rejected
        );

        if self.playback_state == PlaybackState::Idle {
            self.consecutive_failures = 0;
            self.advance(fx);
        }

        Ok(Ack::PlaylistQueued { added, rejected })
    }

    fn skip(&mut self, fx: &mut Effects) -> Result<Ack, CommandError> {
        if !matches!(
            self.playback_state,
            PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Resolving
        ) {
            return Err(ValidationError::NothingPlaying.into());
        }

        self.playback_state = PlaybackState::Skipping;
        if let Some(skipped) = self.pending.take() {
            debug!("⏭️ Resolución de {} invalidada por skip", skipped.track);
        }
        if let Some(current) = self.take_now_playing() {
            info!("⏭️ Saltando: {}", current.stream.title);
            self.history.push(current.track);
            fx.push(Effect::Transport(TransportIntent::StopPlayback));
        }

        self.consecutive_failures = 0;
        self.advance(fx);
        Ok(Ack::Skipped)
    }

    /// Reserva lugar al frente de la cola para `extra` tracks más el que
    /// está sonando o resolviéndose.
    fn ensure_front_capacity(&self, extra: usize) -> Result<(), CommandError> {
        let displaced = usize::from(self.now_playing.is_some() || self.pending.is_some());
        if self.queue.remaining_capacity() < extra + displaced {
            return Err(ValidationError::QueueFull {
                max: self.queue.max_size(),
            }
            .into());
        }
        Ok(())
    }

    /// Saca el track actual (o el que se está resolviendo) sin pasarlo al
    /// historial. Devuelve la referencia y si había algo sonando.
    fn displace_current(&mut self, fx: &mut Effects) -> Option<(TrackRef, bool)> {
        if let Some(pending) = self.pending.take() {
            return Some((pending.track, pending.interlude));
        }

        let current = self.take_now_playing()?;
        fx.push(Effect::Transport(TransportIntent::StopPlayback));
        Some((current.track, current.interlude))
    }

    fn back(&mut self, fx: &mut Effects) -> Result<Ack, CommandError> {
        self.ensure_not_ending()?;
        if self.history.is_empty() {
            return Err(ValidationError::NothingToGoBackTo.into());
        }
        self.ensure_front_capacity(1)?;

        let Some(previous) = self.history.pop_latest() else {
            return Err(ValidationError::NothingToGoBackTo.into());
        };
        self.blacklist.remove(&previous.identity());

        if self.playback_state != PlaybackState::Idle {
            self.playback_state = PlaybackState::Skipping;
        }
        // El actual vuelve a sonar justo después del anterior
        if let Some((current, _)) = self.displace_current(fx) {
            self.queue.push_front(current)?;
        }
        self.queue.push_front(previous.clone())?;
        self.front_interludes = 0;

        info!("⏮️ Volviendo a: {}", previous);
        self.consecutive_failures = 0;
        self.advance(fx);
        Ok(Ack::WentBack { track: previous })
    }

    fn pause(&mut self, fx: &mut Effects) -> Result<Ack, CommandError> {
        if self.playback_state != PlaybackState::Playing {
            return Err(ValidationError::InvalidState {
                operation: "pause",
                state: self.playback_state,
            }
            .into());
        }

        self.playback_state = PlaybackState::Paused;
        fx.push(Effect::Transport(TransportIntent::PausePlayback));
        Ok(Ack::Paused)
    }

    fn resume(&mut self, fx: &mut Effects) -> Result<Ack, CommandError> {
        if self.playback_state != PlaybackState::Paused {
            return Err(ValidationError::InvalidState {
                operation: "resume",
                state: self.playback_state,
            }
            .into());
        }
        if self.hold != Hold::None {
            return Err(CommandError::SessionBusy("esperando la conexión de voz"));
        }

        self.playback_state = PlaybackState::Playing;
        fx.push(Effect::Transport(TransportIntent::ResumePlayback));
        Ok(Ack::Resumed)
    }

    /// Inserta uno o varios tracks (una playlist) para sonar ya, en su
    /// orden, seguidos del track interrumpido.
    fn interlude(&mut self, tracks: Vec<TrackRef>, fx: &mut Effects) -> Result<Ack, CommandError> {
        self.ensure_not_ending()?;
        if tracks.is_empty() {
            return Err(ValidationError::EmptyPlaylist.into());
        }
        self.ensure_front_capacity(tracks.len())?;

        for track in &tracks {
            self.blacklist.remove(&track.identity());
        }
        if self.playback_state != PlaybackState::Idle {
            self.playback_state = PlaybackState::Skipping;
        }

        // El interrumpido vuelve a empezar desde el principio
        // Un interludio interrumpido vuelve como track normal
        if let Some((current, _)) = self.displace_current(fx) {
            self.queue.push_front(current)?;
        }
        let count = tracks.len();
        info!("🎺 Interludio de {} track(s) en guild {}", count, self.guild_id);
        for track in tracks.into_iter().rev() {
            self.queue.push_front(track)?;
        }
        self.front_interludes = count;

        self.consecutive_failures = 0;
        self.advance(fx);
        Ok(Ack::InterludeQueued { count })
    }

    fn clear_queue(&mut self, count: usize) -> Result<Ack, CommandError> {
        if count == 0 {
            return Err(ValidationError::InvalidCount.into());
        }

        let removed = self.queue.remove_front(count);
        self.front_interludes = self.front_interludes.saturating_sub(removed);
        Ok(Ack::Cleared { removed })
    }

    fn clear_all(&mut self, fx: &mut Effects) -> Ack {
        let removed = self.queue.clear();
        self.front_interludes = 0;
        info!("🗑️ Cola vaciada en guild {} ({} canciones)", self.guild_id, removed);

        if let Some(cancelled) = self.pending.take() {
            debug!("🚫 Resolución de {} cancelada", cancelled.track);
            self.playback_state = PlaybackState::Idle;
            self.schedule_idle_leave(fx);
        }

        Ack::Cleared { removed }
    }

    fn stop(&mut self, fx: &mut Effects) -> Ack {
        self.pending = None;
        if let Some(current) = self.take_now_playing() {
            self.history.push(current.track);
            fx.push(Effect::Transport(TransportIntent::StopPlayback));
        }
        self.queue.clear();
        self.front_interludes = 0;

        if self.connection_state != ConnectionState::Disconnected {
            fx.push(Effect::Transport(TransportIntent::LeaveChannel));
        }
        self.connection_state = ConnectionState::Disconnected;
        self.playback_state = PlaybackState::Ended;
        self.cancel_timers();

        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
        fx.push(Effect::Notify(Notification::Left));
        fx.push(Effect::Release);
        Ack::Stopped
    }

    fn reset(&mut self, fx: &mut Effects) -> Ack {
        self.pending = None;
        if self.take_now_playing().is_some() {
            fx.push(Effect::Transport(TransportIntent::StopPlayback));
        }
        self.queue.clear();
        self.history.clear();
        self.blacklist.clear();
        self.front_interludes = 0;
        self.consecutive_failures = 0;
        self.playback_state = PlaybackState::Idle;

        info!("🔄 Sesión reiniciada en guild {}", self.guild_id);
        self.schedule_idle_leave(fx);
        Ack::Reset
    }

    fn restore(&mut self, snapshot: SessionSnapshot, fx: &mut Effects) -> Result<Ack, CommandError> {
        self.ensure_not_ending()?;
        if !self.is_idle() {
            return Err(CommandError::SessionBusy("la sesión ya tiene reproducción activa"));
        }

        let (queued, dropped) = self.load_snapshot(snapshot);
        info!(
            "📂 Estado restaurado en guild {}: {} en cola, {} en historial",
            self.guild_id,
            queued,
            self.history.len()
        );

        if self.connection_state == ConnectionState::Connected && !self.queue.is_empty() {
            self.consecutive_failures = 0;
            self.advance(fx);
        }

        Ok(Ack::Restored { queued, dropped })
    }

    /// Toma el siguiente track no vetado y pide su resolución.
    pub(super) fn advance(&mut self, fx: &mut Effects) {
        debug_assert!(self.now_playing.is_none());
        self.pending = None;

        loop {
            let Some(track) = self.queue.pop_front() else {
                self.front_interludes = 0;
                self.playback_state = PlaybackState::Idle;
                info!("📭 Cola terminada en guild {}", self.guild_id);
                fx.push(Effect::Notify(Notification::QueueFinished));
                self.schedule_idle_leave(fx);
                return;
            };
            let interlude = self.front_interludes > 0;
            self.front_interludes = self.front_interludes.saturating_sub(1);

            if self.blacklist.contains(&track.identity()) {
                debug!("🚫 {} está en la lista negra, se descarta", track);
                fx.push(Effect::Notify(Notification::TrackSkipped {
                    track,
                    reason: "falló antes en esta sesión".to_string(),
                }));
                continue;
            }

            let token = self.next_resolve_token();
            debug!("🔍 Resolviendo {} (token {:?})", track, token);
            self.pending = Some(PendingResolution {
                token,
                track: track.clone(),
                interlude,
            });
            self.playback_state = PlaybackState::Resolving;
            self.cancel_idle_leave();
            fx.push(Effect::Resolve { token, track });
            return;
        }
    }

    fn on_resolution(
        &mut self,
        token: ResolveToken,
        result: Result<StreamDescriptor, ResolutionError>,
        fx: &mut Effects,
    ) -> Result<(), StaleOperation> {
        if self.pending.as_ref().map(|p| p.token) != Some(token) {
            return Err(StaleOperation);
        }
        let Some(pending) = self.pending.take() else {
            return Err(StaleOperation);
        };

        match result {
            Ok(stream) => {
                self.consecutive_failures = 0;
                if let Some(previous) = self.take_now_playing() {
                    self.history.push(previous.track);
                }
                self.start(
                    NowPlaying {
                        track: pending.track,
                        stream,
                        interlude: pending.interlude,
                    },
                    fx,
                );
            }
            Err(e) => {
                warn!("⚠️ No se pudo resolver {}: {}", pending.track, e);
                self.blacklist.insert(pending.track.identity());
                fx.push(Effect::Notify(Notification::TrackSkipped {
                    track: pending.track,
                    reason: e.to_string(),
                }));

                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.retry_ceiling {
                    let failed = std::mem::take(&mut self.consecutive_failures);
                    warn!(
                        "❌ {} fallos seguidos en guild {}, se detiene el avance",
                        failed, self.guild_id
                    );
                    self.playback_state = PlaybackState::Idle;
                    fx.push(Effect::Notify(Notification::BatchResolutionFailure { failed }));
                    self.schedule_idle_leave(fx);
                } else {
                    self.advance(fx);
                }
            }
        }

        Ok(())
    }

    /// Instala el track resuelto; sin conexión queda en pausa hasta conectar.
    pub(super) fn start(&mut self, now_playing: NowPlaying, fx: &mut Effects) {
        let token = self.next_playback_token();
        self.playback_token = Some(token);

        fx.push(Effect::Notify(Notification::NowPlaying {
            track: now_playing.track.clone(),
            stream: now_playing.stream.clone(),
            interlude: now_playing.interlude,
        }));

        if self.connection_state == ConnectionState::Connected {
            info!("🎵 Reproduciendo: {}", now_playing.stream.title);
            self.playback_state = PlaybackState::Playing;
            self.hold = Hold::None;
            fx.push(Effect::Transport(TransportIntent::StartPlayback {
                stream: now_playing.stream.clone(),
                token,
            }));
        } else {
            info!(
                "⏸️ {} listo, esperando conexión de voz ({:?})",
                now_playing.stream.title, self.connection_state
            );
            self.playback_state = PlaybackState::Paused;
            self.hold = Hold::AwaitingConnection;
        }

        self.now_playing = Some(now_playing);
    }

    fn on_transport_event(&mut self, event: TransportEvent, now: DateTime<Utc>, fx: &mut Effects) {
        match event {
            TransportEvent::PlaybackFinished { token } => {
                if self.playback_token != Some(token) {
                    debug!("⌛ Fin de reproducción obsoleto ({:?}) en guild {}", token, self.guild_id);
                    return;
                }
                if let Some(finished) = self.take_now_playing() {
                    debug!("✅ Terminó: {}", finished.stream.title);
                    self.history.push(finished.track);
                }
                self.advance(fx);
            }
            TransportEvent::PlaybackErrored { token, reason } => {
                if self.playback_token != Some(token) {
                    debug!("⌛ Error de reproducción obsoleto ({:?}) en guild {}", token, self.guild_id);
                    return;
                }
                if let Some(broken) = self.take_now_playing() {
                    warn!("⚠️ Falló la reproducción de {}: {}", broken.stream.title, reason);
                    self.blacklist.insert(broken.track.identity());
                    fx.push(Effect::Notify(Notification::TrackSkipped {
                        track: broken.track,
                        reason,
                    }));
                }
                self.advance(fx);
            }
            TransportEvent::ConnectionDropped => self.on_connection_dropped(fx),
            TransportEvent::ConnectionRestored => self.on_connection_restored(now, fx),
        }
    }
}
