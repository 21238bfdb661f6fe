use dashmap::DashMap;
use serenity::{async_trait, model::id::GuildId};
use songbird::{
    events::{CoreEvent, Event as VoiceEvent, EventContext, EventHandler as VoiceEventHandler, TrackEvent},
    input::HttpRequest,
    tracks::TrackHandle,
    Songbird,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audio::events::{EventSink, PlaybackToken, Transport, TransportEvent, TransportIntent};
use crate::error::TransportError;

/// Capa de voz sobre songbird: una llamada por guild y un track activo.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    tracks: DashMap<GuildId, TrackHandle>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            tracks: DashMap::new(),
        }
    }

    fn current_track(&self, guild_id: GuildId) -> Result<TrackHandle, TransportError> {
        self.tracks
            .get(&guild_id)
            .map(|handle| handle.clone())
            .ok_or_else(|| TransportError::Driver("no hay track activo".into()))
    }

    fn stop_current(&self, guild_id: GuildId) {
        if let Some((_, handle)) = self.tracks.remove(&guild_id) {
            // Si el track ya terminó, songbird devuelve error; no importa
            let _ = handle.stop();
        }
    }

    async fn join(
        &self,
        guild_id: GuildId,
        channel: serenity::model::id::ChannelId,
        events: EventSink,
    ) -> Result<(), TransportError> {
        let call = self
            .manager
            .join(guild_id, channel)
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;

        let mut call = call.lock().await;
        // Un join nuevo reemplaza los handlers de la sesión anterior
        call.remove_all_global_events();
        call.add_global_event(
            VoiceEvent::Core(CoreEvent::DriverDisconnect),
            DriverDisconnectHandler {
                events: events.clone(),
            },
        );
        call.add_global_event(
            VoiceEvent::Core(CoreEvent::DriverReconnect),
            DriverReconnectHandler { events },
        );

        info!("🔊 Conectado al canal de voz en guild {}", guild_id);
        Ok(())
    }

    async fn start(
        &self,
        guild_id: GuildId,
        stream_url: String,
        token: PlaybackToken,
        events: EventSink,
    ) -> Result<(), TransportError> {
        let call = self
            .manager
            .get(guild_id)
            .ok_or(TransportError::NotConnected)?;

        self.stop_current(guild_id);

        let input = HttpRequest::new(self.http.clone(), stream_url);
        let handle = call.lock().await.play_input(input.into());

        handle
            .add_event(
                VoiceEvent::Track(TrackEvent::End),
                TrackEndHandler {
                    token,
                    events: events.clone(),
                },
            )
            .map_err(|e| TransportError::Driver(e.to_string()))?;
        handle
            .add_event(
                VoiceEvent::Track(TrackEvent::Error),
                TrackErrorHandler { token, events },
            )
            .map_err(|e| TransportError::Driver(e.to_string()))?;

        self.tracks.insert(guild_id, handle);
        Ok(())
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.stop_current(guild_id);

        match self.manager.remove(guild_id).await {
            Ok(()) => {
                info!("👋 Desconectado del canal de voz en guild {}", guild_id);
                Ok(())
            }
            Err(songbird::error::JoinError::NoCall) => Ok(()),
            Err(e) => Err(TransportError::Driver(e.to_string())),
        }
    }

    async fn keep_alive(&self, guild_id: GuildId) -> Result<(), TransportError> {
        let call = self
            .manager
            .get(guild_id)
            .ok_or(TransportError::NotConnected)?;

        if call.lock().await.current_connection().is_none() {
            return Err(TransportError::NotConnected);
        }
        debug!("💓 Keep-alive OK en guild {}", guild_id);
        Ok(())
    }
}

#[async_trait]
impl Transport for SongbirdTransport {
    async fn execute(
        &self,
        guild_id: GuildId,
        intent: TransportIntent,
        events: EventSink,
    ) -> Result<(), TransportError> {
        match intent {
            TransportIntent::JoinChannel { channel } => self.join(guild_id, channel, events).await,
            TransportIntent::StartPlayback { stream, token } => {
                self.start(guild_id, stream.stream_url, token, events).await
            }
            TransportIntent::StopPlayback => {
                self.stop_current(guild_id);
                Ok(())
            }
            TransportIntent::PausePlayback => self
                .current_track(guild_id)?
                .pause()
                .map_err(|e| TransportError::Driver(e.to_string())),
            TransportIntent::ResumePlayback => self
                .current_track(guild_id)?
                .play()
                .map_err(|e| TransportError::Driver(e.to_string())),
            TransportIntent::LeaveChannel => self.leave(guild_id).await,
            TransportIntent::SendKeepAlive => self.keep_alive(guild_id).await,
        }
    }
}

/// Fin normal del track; el token distingue fines viejos de los actuales
struct TrackEndHandler {
    token: PlaybackToken,
    events: EventSink,
}

#[async_trait]
impl VoiceEventHandler for TrackEndHandler {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        debug!("🎵 Track terminó en guild {}", self.events.guild_id());
        self.events
            .report(TransportEvent::PlaybackFinished { token: self.token });
        None
    }
}

/// Handler para errores de tracks
struct TrackErrorHandler {
    token: PlaybackToken,
    events: EventSink,
}

#[async_trait]
impl VoiceEventHandler for TrackErrorHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        let reason = match ctx {
            EventContext::Track(tracks) => tracks
                .first()
                .map(|(state, _)| format!("{:?}", state.playing))
                .unwrap_or_else(|| "error desconocido".to_string()),
            _ => "error desconocido".to_string(),
        };

        error!(
            "❌ Error en track para guild {}: {}",
            self.events.guild_id(),
            reason
        );
        self.events.report(TransportEvent::PlaybackErrored {
            token: self.token,
            reason,
        });
        None
    }
}

struct DriverDisconnectHandler {
    events: EventSink,
}

#[async_trait]
impl VoiceEventHandler for DriverDisconnectHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        if let EventContext::DriverDisconnect(data) = ctx {
            warn!(
                "🔌 Driver de voz desconectado en guild {}: {:?}",
                self.events.guild_id(),
                data.reason
            );
        }
        self.events.report(TransportEvent::ConnectionDropped);
        None
    }
}

/// Songbird se reconectó por su cuenta
struct DriverReconnectHandler {
    events: EventSink,
}

#[async_trait]
impl VoiceEventHandler for DriverReconnectHandler {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        info!("🔄 Driver de voz reconectado en guild {}", self.events.guild_id());
        self.events.report(TransportEvent::ConnectionRestored);
        None
    }
}
