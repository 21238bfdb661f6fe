//! Async shell around the per-guild state machine.
//!
//! Each guild gets one worker task draining its trigger channel. For every
//! trigger the worker locks the session, runs the synchronous transition,
//! unlocks, and then executes the resulting effects in order: transport
//! intents are awaited inline (later triggers wait behind them), while
//! resolutions and timers are spawned and come back as new triggers. A
//! command's reply is sent only after its effects ran.

use chrono::Utc;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::events::{
    Ack, Command, Effect, EventSink, GuildNotification, Notification, ResolveToken, TimerKind,
    Transport, TransportEvent, TransportIntent, Trigger,
};
use super::registry::{GuildSlot, SessionRegistry};
use super::session::{SessionSnapshot, SessionStatus};
use super::track::TrackRef;
use crate::config::PlaybackConfig;
use crate::error::{CommandError, ResolutionError};
use crate::sources::Resolver;
use crate::storage::JsonStorage;

/// Un trigger en el canal del guild, con su respuesta si vino de un comando.
pub(crate) struct Envelope {
    trigger: Trigger,
    reply: Option<oneshot::Sender<Result<Ack, CommandError>>>,
}

impl Envelope {
    pub(crate) fn trigger(trigger: Trigger) -> Self {
        Self {
            trigger,
            reply: None,
        }
    }

    fn command(command: Command) -> (Self, oneshot::Receiver<Result<Ack, CommandError>>) {
        let (tx, rx) = oneshot::channel();
        let envelope = Self {
            trigger: Trigger::Command(command),
            reply: Some(tx),
        };
        (envelope, rx)
    }
}

/// Punto de entrada de la capa de comandos: una llamada por operación.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: SessionRegistry,
    resolver: Arc<dyn Resolver>,
    transport: Arc<dyn Transport>,
    storage: Option<JsonStorage>,
    notifications: broadcast::Sender<GuildNotification>,
    config: PlaybackConfig,
}

impl Orchestrator {
    pub fn new(
        config: PlaybackConfig,
        resolver: Arc<dyn Resolver>,
        transport: Arc<dyn Transport>,
        storage: Option<JsonStorage>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                registry: SessionRegistry::new(config),
                resolver,
                transport,
                storage,
                notifications,
                config,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuildNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.inner.resolver
    }

    pub async fn enqueue(&self, guild_id: GuildId, track: TrackRef) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Enqueue(track), true).await
    }

    pub async fn enqueue_playlist(
        &self,
        guild_id: GuildId,
        tracks: Vec<TrackRef>,
    ) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::EnqueuePlaylist(tracks), true)
            .await
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Skip, false).await
    }

    pub async fn back(&self, guild_id: GuildId) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Back, false).await
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Pause, false).await
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Resume, false).await
    }

    /// Hace sonar `tracks` ya mismo; lo interrumpido vuelve después.
    pub async fn interlude(
        &self,
        guild_id: GuildId,
        tracks: Vec<TrackRef>,
    ) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Interlude(tracks), true).await
    }

    pub async fn clear_queue(&self, guild_id: GuildId, count: usize) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::ClearQueue(count), false).await
    }

    pub async fn clear_all(&self, guild_id: GuildId) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::ClearAll, false).await
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Stop, false).await
    }

    pub async fn reset(&self, guild_id: GuildId) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Reset, false).await
    }

    pub async fn join(
        &self,
        guild_id: GuildId,
        voice_channel: ChannelId,
        text_channel: Option<ChannelId>,
    ) -> Result<Ack, CommandError> {
        let command = Command::Join {
            voice_channel,
            text_channel,
        };
        self.send(guild_id, command, true).await
    }

    pub async fn restore(
        &self,
        guild_id: GuildId,
        snapshot: SessionSnapshot,
    ) -> Result<Ack, CommandError> {
        self.send(guild_id, Command::Restore(snapshot), true).await
    }

    pub fn status(&self, guild_id: GuildId) -> Option<SessionStatus> {
        let slot = self.inner.registry.get(guild_id)?;
        let status = slot.session().status();
        Some(status)
    }

    pub fn snapshot(&self, guild_id: GuildId) -> Option<SessionSnapshot> {
        let slot = self.inner.registry.get(guild_id)?;
        let snapshot = slot.session().snapshot();
        Some(snapshot)
    }

    /// Reinyecta un evento de la capa de voz. Sin sesión se descarta.
    pub fn transport_event(&self, guild_id: GuildId, event: TransportEvent) -> bool {
        match self.inner.registry.get(guild_id) {
            Some(slot) => slot
                .sender()
                .send(Envelope::trigger(Trigger::Transport(event)))
                .is_ok(),
            None => {
                debug!("Evento {:?} para guild {} sin sesión", event, guild_id);
                false
            }
        }
    }

    pub fn remove_session(&self, guild_id: GuildId) -> Result<(), CommandError> {
        self.inner.registry.remove(guild_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Restaura todas las sesiones guardadas; devuelve cuántas se cargaron.
    pub async fn restore_all(&self) -> anyhow::Result<usize> {
        let Some(storage) = &self.inner.storage else {
            return Ok(0);
        };

        let mut restored = 0;
        for (guild_id, snapshot) in storage.load_all().await? {
            match self.restore(guild_id, snapshot).await {
                Ok(Ack::Restored { queued, dropped }) => {
                    restored += 1;
                    info!(
                        "📂 Guild {}: {} canciones restauradas ({} descartadas)",
                        guild_id, queued, dropped
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("⚠️ No se pudo restaurar guild {}: {}", guild_id, e),
            }
        }

        Ok(restored)
    }

    pub fn shutdown(&self) {
        info!("🛑 Deteniendo {} sesiones", self.inner.registry.len());
        self.inner.registry.shutdown();
    }

    fn slot(&self, guild_id: GuildId) -> Arc<GuildSlot> {
        let (slot, created) = self.inner.registry.get_or_create(guild_id);
        if created {
            if let Some(triggers) = slot.take_receiver() {
                tokio::spawn(run_worker(self.inner.clone(), slot.clone(), triggers));
            }
        }
        slot
    }

    async fn send(
        &self,
        guild_id: GuildId,
        command: Command,
        create: bool,
    ) -> Result<Ack, CommandError> {
        let name = command.name();

        // Un segundo intento cubre la carrera con un worker que se está liberando
        for _ in 0..2 {
            let slot = if create {
                self.slot(guild_id)
            } else {
                self.inner
                    .registry
                    .get(guild_id)
                    .ok_or(CommandError::NoSession)?
            };

            let (envelope, reply) = Envelope::command(command.clone());
            if slot.sender().send(envelope).is_err() {
                debug!("Canal de guild {} cerrado, reintentando `{}`", guild_id, name);
                if !create {
                    return Err(CommandError::NoSession);
                }
                continue;
            }

            return reply
                .await
                .unwrap_or(Err(CommandError::SessionBusy("la sesión se cerró")));
        }

        Err(CommandError::SessionBusy("la sesión se está cerrando"))
    }
}

async fn run_worker(inner: Arc<Inner>, slot: Arc<GuildSlot>, triggers: flume::Receiver<Envelope>) {
    let guild_id = slot.guild_id();
    let shutdown = slot.shutdown_token();
    debug!("🧵 Worker iniciado para guild {}", guild_id);

    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = triggers.recv_async() => match received {
                Ok(envelope) => envelope,
                Err(_) => break,
            },
        };

        let Envelope { trigger, reply } = envelope;
        let step = slot.session().handle(trigger, Utc::now());
        let released = inner.execute(&slot, step.effects).await;

        if let (Some(reply), Some(result)) = (reply, step.reply) {
            let _ = reply.send(result);
        }
        if released {
            break;
        }
    }

    // Lo que quedó en el canal ya no tiene sesión donde aplicarse
    for envelope in triggers.drain() {
        if let Some(reply) = envelope.reply {
            let _ = reply.send(Err(CommandError::SessionBusy("la sesión se cerró")));
        }
    }
    debug!("🧵 Worker terminado para guild {}", guild_id);
}

impl Inner {
    /// Ejecuta los efectos en orden. Devuelve `true` si la sesión se liberó.
    async fn execute(&self, slot: &Arc<GuildSlot>, effects: Vec<Effect>) -> bool {
        let mut released = false;

        for effect in effects {
            match effect {
                Effect::Transport(intent) => self.run_intent(slot, intent).await,
                Effect::Resolve { token, track } => self.spawn_resolution(slot, token, track),
                Effect::Schedule {
                    kind,
                    after,
                    generation,
                } => self.spawn_timer(slot, kind, after, generation),
                Effect::Notify(notification) => self.notify(slot, notification),
                Effect::Persist => self.persist(slot).await,
                Effect::Release => released = self.release(slot).await,
            }
        }

        released
    }

    async fn run_intent(&self, slot: &Arc<GuildSlot>, intent: TransportIntent) {
        let guild_id = slot.guild_id();
        let name = intent.name();
        let started = match &intent {
            TransportIntent::StartPlayback { token, .. } => Some(*token),
            _ => None,
        };
        let joining = matches!(intent, TransportIntent::JoinChannel { .. });
        let keepalive = matches!(intent, TransportIntent::SendKeepAlive);

        let events = EventSink::new(guild_id, slot.sender().clone());
        let result = self.transport.execute(guild_id, intent, events).await;

        let follow_up = match result {
            Ok(()) if joining => Some(Trigger::Transport(TransportEvent::ConnectionRestored)),
            Ok(()) => None,
            Err(e) => {
                warn!("⚠️ Falló `{}` en guild {}: {}", name, guild_id, e);
                if joining {
                    Some(Trigger::JoinFailed {
                        reason: e.to_string(),
                    })
                } else if let Some(token) = started {
                    Some(Trigger::Transport(TransportEvent::PlaybackErrored {
                        token,
                        reason: e.to_string(),
                    }))
                } else if keepalive {
                    Some(Trigger::Transport(TransportEvent::ConnectionDropped))
                } else {
                    None
                }
            }
        };

        if let Some(trigger) = follow_up {
            let _ = slot.sender().send(Envelope::trigger(trigger));
        }
    }

    fn spawn_resolution(&self, slot: &Arc<GuildSlot>, token: ResolveToken, track: TrackRef) {
        let resolver = self.resolver.clone();
        let sender = slot.sender().clone();
        let shutdown = slot.shutdown_token();
        let timeout = self.config.resolve_timeout;

        tokio::spawn(async move {
            let resolution = tokio::time::timeout(timeout, resolver.resolve(&track));
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = resolution => {
                    result.unwrap_or_else(|_| Err(ResolutionError::Timeout(timeout)))
                }
            };
            let _ = sender.send(Envelope::trigger(Trigger::ResolutionCompleted { token, result }));
        });
    }

    fn spawn_timer(&self, slot: &Arc<GuildSlot>, kind: TimerKind, after: Duration, generation: u64) {
        let sender = slot.sender().clone();
        let shutdown = slot.shutdown_token();

        // Jitter para que los guilds caídos juntos no reintenten a la vez
        let after = match kind {
            TimerKind::ReconnectAttempt => after.mul_f64(1.0 + fastrand::f64() * 0.1),
            _ => after,
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = sender.send(Envelope::trigger(Trigger::TimerFired { kind, generation }));
                }
            }
        });
    }

    fn notify(&self, slot: &Arc<GuildSlot>, notification: Notification) {
        if notification.is_failure() {
            warn!("📣 Guild {}: {:?}", slot.guild_id(), notification);
        } else {
            debug!("📣 Guild {}: {:?}", slot.guild_id(), notification);
        }

        let text_channel = slot.session().text_channel();
        // Sin suscriptores no hay a quién avisar
        let _ = self.notifications.send(GuildNotification {
            guild_id: slot.guild_id(),
            text_channel,
            notification,
        });
    }

    async fn persist(&self, slot: &Arc<GuildSlot>) {
        let Some(storage) = &self.storage else {
            return;
        };

        let snapshot = slot.session().snapshot();
        if let Err(e) = storage.save_snapshot(slot.guild_id(), &snapshot).await {
            warn!("💾 No se pudo guardar la sesión de guild {}: {:#}", slot.guild_id(), e);
        }
    }

    async fn release(&self, slot: &Arc<GuildSlot>) -> bool {
        if let Err(e) = self.registry.release(slot) {
            debug!("Guild {} no se libera: {}", slot.guild_id(), e);
            return false;
        }

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove_snapshot(slot.guild_id()).await {
                warn!("💾 No se pudo borrar la sesión de guild {}: {:#}", slot.guild_id(), e);
            }
        }
        true
    }
}
