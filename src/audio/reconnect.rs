//! Voice connection health: reconnection backoff, keep-alive ticks and the
//! idle-leave grace period. Every wait is a scheduled [`Effect::Schedule`];
//! the timer comes back as a `TimerFired` trigger tagged with the generation
//! it was armed under, so re-arming or cancelling a timer is just bumping
//! its generation.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use serenity::model::id::ChannelId;

use super::events::{Ack, Effect, Notification, TimerKind, TransportIntent};
use super::session::{ConnectionState, GuildSession, Hold, PendingResolution, PlaybackState};
use crate::config::PlaybackConfig;
use crate::error::CommandError;

/// Backoff exponencial acotado por intentos y por tiempo total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backoff {
    attempt: u32,
    scheduled: Duration,
}

impl Backoff {
    /// Demora del próximo intento, o `None` si ya no quedan intentos.
    ///
    /// El intento `n` espera `base * 2^(n-1)`, tope `max_delay`.
    pub fn next_delay(&mut self, config: &PlaybackConfig) -> Option<Duration> {
        if self.attempt >= config.reconnect_max_attempts {
            return None;
        }

        let factor = 2u32.saturating_pow(self.attempt);
        let delay = config
            .reconnect_base_delay
            .saturating_mul(factor)
            .min(config.reconnect_max_delay);
        if self.scheduled + delay > config.reconnect_budget {
            return None;
        }

        self.attempt += 1;
        self.scheduled += delay;
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl GuildSession {
    pub(super) fn join(
        &mut self,
        voice_channel: ChannelId,
        text_channel: Option<ChannelId>,
        fx: &mut Vec<Effect>,
    ) -> Result<Ack, CommandError> {
        if self.playback_state == PlaybackState::Ended {
            return Err(CommandError::SessionBusy("la sesión se está cerrando"));
        }

        let same_channel = self.voice_channel == Some(voice_channel);
        let ack = match self.connection_state {
            ConnectionState::Reconnecting => {
                return Err(CommandError::SessionBusy("reconectando al canal de voz"));
            }
            ConnectionState::Connected if same_channel => Ack::AlreadyConnected,
            ConnectionState::Connecting if same_channel => Ack::Joining,
            _ => {
                info!("🔊 Conectando a {} en guild {}", voice_channel, self.guild_id);
                self.voice_channel = Some(voice_channel);
                self.connection_state = ConnectionState::Connecting;
                self.reconnect_exhausted = false;
                self.backoff.reset();
                fx.push(Effect::Transport(TransportIntent::JoinChannel {
                    channel: voice_channel,
                }));
                Ack::Joining
            }
        };

        if text_channel.is_some() {
            self.text_channel = text_channel;
        }
        Ok(ack)
    }

    pub(super) fn on_connection_dropped(&mut self, fx: &mut Vec<Effect>) {
        if self.connection_state != ConnectionState::Connected {
            debug!(
                "🔌 Caída de conexión ignorada en guild {} ({:?})",
                self.guild_id, self.connection_state
            );
            return;
        }

        warn!("🔌 Conexión de voz perdida en guild {}", self.guild_id);
        self.connection_state = ConnectionState::Reconnecting;
        if self.playback_state == PlaybackState::Playing {
            self.playback_state = PlaybackState::Paused;
            self.hold = Hold::Outage;
            fx.push(Effect::Transport(TransportIntent::PausePlayback));
        }

        self.backoff.reset();
        self.schedule_reconnect(fx);
    }

    pub(super) fn on_connection_restored(&mut self, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        match self.connection_state {
            ConnectionState::Connected => {
                debug!("🔗 Ya conectado en guild {}", self.guild_id);
                return;
            }
            ConnectionState::Reconnecting => {
                info!(
                    "🔗 Reconectado en guild {} tras {} intento(s)",
                    self.guild_id,
                    self.backoff.attempt()
                );
                fx.push(Effect::Notify(Notification::Reconnected));
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                info!("🔗 Conectado al canal de voz en guild {}", self.guild_id);
            }
        }

        self.connection_state = ConnectionState::Connected;
        self.reconnect_exhausted = false;
        self.reconnect_generation += 1;
        self.backoff.reset();

        self.release_hold(now, fx);

        if self.playback_state == PlaybackState::Idle {
            if !self.queue.is_empty() {
                info!(
                    "▶️ Reanudando {} canciones pendientes en guild {}",
                    self.queue.len(),
                    self.guild_id
                );
                self.consecutive_failures = 0;
                self.advance(fx);
            } else {
                self.schedule_idle_leave(fx);
            }
        }
    }

    /// Arranca o reanuda lo que quedó en pausa por falta de conexión.
    fn release_hold(&mut self, now: DateTime<Utc>, fx: &mut Vec<Effect>) {
        match self.hold {
            Hold::None => {}
            Hold::Outage => {
                self.hold = Hold::None;
                self.playback_state = PlaybackState::Playing;
                fx.push(Effect::Transport(TransportIntent::ResumePlayback));
            }
            Hold::AwaitingConnection => {
                let Some(current) = self.now_playing.as_ref() else {
                    self.hold = Hold::None;
                    return;
                };

                if current.stream.is_expired(now) {
                    // El stream caducó esperando: se resuelve de nuevo sin
                    // pasar por la cola, que puede estar llena
                    debug!("⌛ Stream de {} caducado, se resuelve de nuevo", current.track);
                    let Some(expired) = self.take_now_playing() else {
                        return;
                    };
                    let token = self.next_resolve_token();
                    self.pending = Some(PendingResolution {
                        token,
                        track: expired.track.clone(),
                        interlude: expired.interlude,
                    });
                    self.playback_state = PlaybackState::Resolving;
                    self.cancel_idle_leave();
                    fx.push(Effect::Resolve {
                        token,
                        track: expired.track,
                    });
                    return;
                }

                let Some(token) = self.playback_token else {
                    return;
                };
                self.hold = Hold::None;
                self.playback_state = PlaybackState::Playing;
                fx.push(Effect::Transport(TransportIntent::StartPlayback {
                    stream: current.stream.clone(),
                    token,
                }));
            }
        }
    }

    pub(super) fn on_join_failed(&mut self, reason: String, fx: &mut Vec<Effect>) {
        match self.connection_state {
            ConnectionState::Connecting => {
                warn!("❌ No se pudo conectar en guild {}: {}", self.guild_id, reason);
                self.connection_state = ConnectionState::Disconnected;
                fx.push(Effect::Notify(Notification::TransportFailure { reason }));
            }
            ConnectionState::Reconnecting => {
                warn!(
                    "🔁 Intento {} de reconexión fallido en guild {}: {}",
                    self.backoff.attempt(),
                    self.guild_id,
                    reason
                );
                self.schedule_reconnect(fx);
            }
            _ => debug!("Fallo de conexión ignorado en guild {}: {}", self.guild_id, reason),
        }
    }

    fn schedule_reconnect(&mut self, fx: &mut Vec<Effect>) {
        let Some(delay) = self.backoff.next_delay(&self.config) else {
            self.give_up_reconnecting(fx);
            return;
        };

        self.reconnect_generation += 1;
        let attempt = self.backoff.attempt();
        info!(
            "🔁 Reconexión {}/{} en guild {} dentro de {:?}",
            attempt, self.config.reconnect_max_attempts, self.guild_id, delay
        );
        fx.push(Effect::Schedule {
            kind: TimerKind::ReconnectAttempt,
            after: delay,
            generation: self.reconnect_generation,
        });
        fx.push(Effect::Notify(Notification::Reconnecting { attempt, delay }));
    }

    fn give_up_reconnecting(&mut self, fx: &mut Vec<Effect>) {
        let reason = format!(
            "no se pudo reconectar tras {} intentos",
            self.backoff.attempt()
        );
        error!("💀 Guild {}: {}", self.guild_id, reason);

        self.connection_state = ConnectionState::Disconnected;
        self.reconnect_exhausted = true;
        self.reconnect_generation += 1;
        // Al volver a unirse el track arranca de cero
        if self.hold == Hold::Outage {
            self.hold = Hold::AwaitingConnection;
        }

        fx.push(Effect::Transport(TransportIntent::LeaveChannel));
        fx.push(Effect::Notify(Notification::SessionFatal { reason }));
    }

    pub(super) fn on_timer(
        &mut self,
        kind: TimerKind,
        generation: u64,
        fx: &mut Vec<Effect>,
    ) {
        match kind {
            TimerKind::ReconnectAttempt => {
                if generation != self.reconnect_generation
                    || self.connection_state != ConnectionState::Reconnecting
                {
                    debug!("⌛ Timer de reconexión obsoleto en guild {}", self.guild_id);
                    return;
                }
                match self.voice_channel {
                    Some(channel) => {
                        fx.push(Effect::Transport(TransportIntent::JoinChannel { channel }))
                    }
                    None => self.give_up_reconnecting(fx),
                }
            }
            TimerKind::KeepAlive => {
                if generation != self.keepalive_generation || !self.keepalive_armed {
                    debug!("⌛ Keep-alive obsoleto en guild {}", self.guild_id);
                    return;
                }
                // Se vuelve a armar en `sync_keepalive` si sigue haciendo falta
                self.keepalive_armed = false;
                if self.connection_state == ConnectionState::Connected {
                    debug!("💓 Keep-alive en guild {}", self.guild_id);
                    fx.push(Effect::Transport(TransportIntent::SendKeepAlive));
                }
            }
            TimerKind::IdleLeave => {
                if generation != self.idle_generation {
                    debug!("⌛ Timer de inactividad obsoleto en guild {}", self.guild_id);
                    return;
                }
                if !self.is_idle() || self.playback_state != PlaybackState::Idle {
                    debug!("Guild {} volvió a tener actividad, se queda", self.guild_id);
                    return;
                }

                info!(
                    "👋 Saliendo del canal de voz en guild {} por inactividad (desde {})",
                    self.guild_id,
                    self.last_activity.format("%H:%M:%S")
                );
                if self.connection_state != ConnectionState::Disconnected {
                    fx.push(Effect::Transport(TransportIntent::LeaveChannel));
                }
                self.connection_state = ConnectionState::Disconnected;
                self.cancel_timers();
                fx.push(Effect::Notify(Notification::Left));
                fx.push(Effect::Release);
            }
        }
    }

    /// Mantiene armado el keep-alive mientras haya conexión y cola.
    pub(super) fn sync_keepalive(&mut self, fx: &mut Vec<Effect>) {
        let wanted =
            self.connection_state == ConnectionState::Connected && !self.queue.is_empty();

        if wanted && !self.keepalive_armed {
            self.keepalive_armed = true;
            self.keepalive_generation += 1;
            fx.push(Effect::Schedule {
                kind: TimerKind::KeepAlive,
                after: self.config.keepalive_interval,
                generation: self.keepalive_generation,
            });
        } else if !wanted && self.keepalive_armed {
            self.keepalive_armed = false;
            self.keepalive_generation += 1;
        }
    }

    pub(super) fn schedule_idle_leave(&mut self, fx: &mut Vec<Effect>) {
        self.idle_generation += 1;
        fx.push(Effect::Schedule {
            kind: TimerKind::IdleLeave,
            after: self.config.idle_leave_grace,
            generation: self.idle_generation,
        });
    }

    pub(super) fn cancel_idle_leave(&mut self) {
        self.idle_generation += 1;
    }

    pub(super) fn cancel_timers(&mut self) {
        self.idle_generation += 1;
        self.keepalive_generation += 1;
        self.reconnect_generation += 1;
        self.keepalive_armed = false;
        self.backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::{Command, Step, TransportEvent, Trigger};
    use crate::audio::transitions::tests::{
        command, fire, has_intent, play, playback_token, resolve_token, resolved, session,
        session_with, track,
    };
    use crate::audio::session::SessionSnapshot;
    use crate::audio::track::StreamDescriptor;
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId};

    fn drop_connection(session: &mut GuildSession) -> Step {
        fire(
            session,
            Trigger::Transport(TransportEvent::ConnectionDropped),
        )
    }

    fn restore_connection(session: &mut GuildSession) -> Step {
        fire(
            session,
            Trigger::Transport(TransportEvent::ConnectionRestored),
        )
    }

    fn scheduled(step: &Step, wanted: TimerKind) -> Option<(Duration, u64)> {
        step.effects.iter().find_map(|effect| match effect {
            Effect::Schedule {
                kind,
                after,
                generation,
            } if *kind == wanted => Some((*after, *generation)),
            _ => None,
        })
    }

    fn timer(session: &mut GuildSession, kind: TimerKind, generation: u64) -> Step {
        fire(session, Trigger::TimerFired { kind, generation })
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let config = PlaybackConfig {
            reconnect_max_attempts: 10,
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(10),
            reconnect_budget: Duration::from_secs(600),
            ..PlaybackConfig::default()
        };
        let mut backoff = Backoff::default();

        let delays: Vec<u64> = (0..5)
            .filter_map(|_| backoff.next_delay(&config))
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_backoff_respects_attempts_and_budget() {
        let config = PlaybackConfig::default();
        let mut by_attempts = Backoff::default();
        let count = std::iter::from_fn(|| by_attempts.next_delay(&config)).count();
        // 2 + 4 + 8 + 16 + 30 = 60s, dentro del presupuesto de 120s
        assert_eq!(count, 5);

        let tight = PlaybackConfig {
            reconnect_budget: Duration::from_secs(7),
            ..PlaybackConfig::default()
        };
        let mut by_budget = Backoff::default();
        let count = std::iter::from_fn(|| by_budget.next_delay(&tight)).count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_reconnect_preserves_queue_and_now_playing() {
        let mut session = session();
        play(&mut session, "A");
        command(&mut session, Command::Enqueue(track("B")));
        command(&mut session, Command::Enqueue(track("C")));
        let before: SessionSnapshot = session.snapshot();
        let playing_before = session.now_playing().cloned();

        let step = drop_connection(&mut session);
        assert_eq!(session.connection_state(), ConnectionState::Reconnecting);
        assert_eq!(session.playback_state(), PlaybackState::Paused);
        assert!(has_intent(&step, &TransportIntent::PausePlayback));
        let (delay, generation) = scheduled(&step, TimerKind::ReconnectAttempt).unwrap();
        assert_eq!(delay, Duration::from_secs(2));

        let step = timer(&mut session, TimerKind::ReconnectAttempt, generation);
        assert!(has_intent(
            &step,
            &TransportIntent::JoinChannel {
                channel: ChannelId::new(5)
            }
        ));

        let step = restore_connection(&mut session);
        assert!(step.effects.contains(&Effect::Notify(Notification::Reconnected)));
        assert!(has_intent(&step, &TransportIntent::ResumePlayback));
        assert_eq!(session.playback_state(), PlaybackState::Playing);
        assert_eq!(session.snapshot(), before);
        assert_eq!(session.now_playing().cloned(), playing_before);
    }

    #[test]
    fn test_user_pause_survives_reconnect() {
        let mut session = session();
        play(&mut session, "A");
        command(&mut session, Command::Pause);

        let step = drop_connection(&mut session);
        assert!(!has_intent(&step, &TransportIntent::PausePlayback));
        let step = restore_connection(&mut session);
        assert!(!has_intent(&step, &TransportIntent::ResumePlayback));
        assert_eq!(session.playback_state(), PlaybackState::Paused);
    }

    #[test]
    fn test_reconnect_exhaustion_is_fatal_but_keeps_queue() {
        let config = PlaybackConfig {
            reconnect_max_attempts: 2,
            ..PlaybackConfig::default()
        };
        let mut session = session_with(config);
        play(&mut session, "A");
        command(&mut session, Command::Enqueue(track("B")));

        drop_connection(&mut session);
        let step = fire(
            &mut session,
            Trigger::JoinFailed {
                reason: "timeout".into(),
            },
        );
        assert!(scheduled(&step, TimerKind::ReconnectAttempt).is_some());

        let step = fire(
            &mut session,
            Trigger::JoinFailed {
                reason: "timeout".into(),
            },
        );
        assert!(step
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(Notification::SessionFatal { .. }))));
        assert!(has_intent(&step, &TransportIntent::LeaveChannel));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(session.status().reconnect_exhausted);
        assert_eq!(session.queue().len(), 1);
        assert!(session.now_playing().is_some());

        // Sin más reintentos automáticos
        assert!(drop_connection(&mut session).effects.is_empty());

        // Un join manual vuelve a arrancar el track desde el principio
        let step = command(
            &mut session,
            Command::Join {
                voice_channel: ChannelId::new(5),
                text_channel: None,
            },
        );
        assert_eq!(step.reply, Some(Ok(Ack::Joining)));
        let step = restore_connection(&mut session);
        assert!(playback_token(&step).is_some());
        assert_eq!(session.playback_state(), PlaybackState::Playing);
    }

    #[test]
    fn test_stale_reconnect_timer_is_ignored() {
        let mut session = session();
        play(&mut session, "A");
        let step = drop_connection(&mut session);
        let (_, generation) = scheduled(&step, TimerKind::ReconnectAttempt).unwrap();
        restore_connection(&mut session);

        let step = timer(&mut session, TimerKind::ReconnectAttempt, generation);
        assert!(step.effects.is_empty());
    }

    #[test]
    fn test_resolution_during_outage_starts_on_restore() {
        let mut session = session();
        let step = command(&mut session, Command::Enqueue(track("A")));
        let token = resolve_token(&step).unwrap();
        drop_connection(&mut session);

        let step = resolved(&mut session, token, "A");
        assert!(playback_token(&step).is_none());
        assert_eq!(session.playback_state(), PlaybackState::Paused);

        let step = restore_connection(&mut session);
        assert!(playback_token(&step).is_some());
        assert_eq!(session.playback_state(), PlaybackState::Playing);
    }

    #[test]
    fn test_expired_stream_on_join_is_resolved_again_with_full_queue() {
        let config = PlaybackConfig {
            max_queue_size: 1,
            ..PlaybackConfig::default()
        };
        let mut session = GuildSession::new(GuildId::new(8), config);
        let step = command(&mut session, Command::Enqueue(track("a")));
        let token = resolve_token(&step).unwrap();
        command(&mut session, Command::Enqueue(track("b")));
        assert!(session.queue().is_full());

        fire(
            &mut session,
            Trigger::ResolutionCompleted {
                token,
                result: Ok(StreamDescriptor::new(
                    "https://rr1.googlevideo.com/videoplayback?expire=1000&id=a",
                    "a",
                )),
            },
        );
        assert_eq!(session.playback_state(), PlaybackState::Paused);

        command(
            &mut session,
            Command::Join {
                voice_channel: ChannelId::new(11),
                text_channel: None,
            },
        );
        let step = restore_connection(&mut session);

        let again = step.effects.iter().find_map(|effect| match effect {
            Effect::Resolve { track, .. } => Some(track.query().to_string()),
            _ => None,
        });
        assert_eq!(again.as_deref(), Some("a"));
        assert!(playback_token(&step).is_none());
        assert_eq!(session.playback_state(), PlaybackState::Resolving);

        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.now_playing.as_ref().map(|t| t.query()),
            Some("a")
        );
        let queued: Vec<&str> = snapshot.queue.iter().map(|t| t.query()).collect();
        assert_eq!(queued, vec!["b"]);
    }

    #[test]
    fn test_keepalive_armed_while_connected_with_queue() {
        let mut session = session();
        play(&mut session, "A");
        let step = command(&mut session, Command::Enqueue(track("B")));
        let (after, generation) = scheduled(&step, TimerKind::KeepAlive).unwrap();
        assert_eq!(after, Duration::from_secs(240));

        let step = timer(&mut session, TimerKind::KeepAlive, generation);
        assert!(has_intent(&step, &TransportIntent::SendKeepAlive));
        let (_, rearmed) = scheduled(&step, TimerKind::KeepAlive).unwrap();
        assert!(rearmed > generation);

        // Sin cola deja de hacer falta
        command(&mut session, Command::ClearAll);
        let step = timer(&mut session, TimerKind::KeepAlive, rearmed);
        assert!(step.effects.is_empty());
    }

    #[test]
    fn test_idle_leave_releases_session() {
        let mut session = session();
        let token = play(&mut session, "A");
        let step = fire(
            &mut session,
            Trigger::Transport(TransportEvent::PlaybackFinished { token }),
        );
        let (after, generation) = scheduled(&step, TimerKind::IdleLeave).unwrap();
        assert_eq!(after, Duration::from_secs(300));

        let step = timer(&mut session, TimerKind::IdleLeave, generation);
        assert_eq!(
            step.effects,
            vec![
                Effect::Transport(TransportIntent::LeaveChannel),
                Effect::Notify(Notification::Left),
                Effect::Release,
            ]
        );
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_idle_leave_cancelled_by_new_activity() {
        let mut session = session();
        let token = play(&mut session, "A");
        let step = fire(
            &mut session,
            Trigger::Transport(TransportEvent::PlaybackFinished { token }),
        );
        let (_, generation) = scheduled(&step, TimerKind::IdleLeave).unwrap();
        command(&mut session, Command::Enqueue(track("B")));

        assert!(timer(&mut session, TimerKind::IdleLeave, generation)
            .effects
            .is_empty());
    }

    #[test]
    fn test_join_resumes_restored_queue() {
        let mut session = GuildSession::new(GuildId::new(8), PlaybackConfig::default());
        command(
            &mut session,
            Command::Restore(SessionSnapshot {
                queue: vec![track("x")],
                history: Vec::new(),
                now_playing: None,
            }),
        );
        assert_eq!(session.playback_state(), PlaybackState::Idle);

        let step = command(
            &mut session,
            Command::Join {
                voice_channel: ChannelId::new(11),
                text_channel: Some(ChannelId::new(12)),
            },
        );
        assert!(has_intent(
            &step,
            &TransportIntent::JoinChannel {
                channel: ChannelId::new(11)
            }
        ));
        assert_eq!(session.connection_state(), ConnectionState::Connecting);

        let step = restore_connection(&mut session);
        assert!(resolve_token(&step).is_some());
        assert_eq!(session.text_channel(), Some(ChannelId::new(12)));
    }

    #[test]
    fn test_join_failure_while_connecting() {
        let mut session = GuildSession::new(GuildId::new(8), PlaybackConfig::default());
        command(
            &mut session,
            Command::Join {
                voice_channel: ChannelId::new(11),
                text_channel: None,
            },
        );
        let step = fire(
            &mut session,
            Trigger::JoinFailed {
                reason: "sin permisos".into(),
            },
        );
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(step
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(Notification::TransportFailure { .. }))));
    }

    #[test]
    fn test_join_same_channel_is_noop() {
        let mut session = session();
        let step = command(
            &mut session,
            Command::Join {
                voice_channel: ChannelId::new(5),
                text_channel: None,
            },
        );
        assert_eq!(step.reply, Some(Ok(Ack::AlreadyConnected)));
        assert!(step.effects.is_empty());
    }
}
