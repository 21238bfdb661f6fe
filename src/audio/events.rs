//! Closed set of inputs (`Trigger`) and outputs (`Effect`) of the per-guild
//! state machine, plus the transport boundary the effects are executed on.

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::time::Duration;

use super::session::SessionSnapshot;
use super::track::{StreamDescriptor, TrackRef};
use crate::error::{CommandError, ResolutionError, TransportError};

/// Token de una resolución en curso. Una respuesta con token viejo se descarta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolveToken(pub(crate) u64);

/// Token del stream entregado al transporte; los eventos de fin lo devuelven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackToken(pub(crate) u64);

/// Intención de usuario que llega desde la capa de comandos.
#[derive(Debug, Clone)]
pub enum Command {
    Enqueue(TrackRef),
    EnqueuePlaylist(Vec<TrackRef>),
    Skip,
    Back,
    Pause,
    Resume,
    /// Uno o varios tracks (playlist expandida) que suenan antes del actual
    Interlude(Vec<TrackRef>),
    ClearQueue(usize),
    ClearAll,
    Stop,
    Reset,
    Join {
        voice_channel: ChannelId,
        text_channel: Option<ChannelId>,
    },
    Restore(SessionSnapshot),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Enqueue(_) => "enqueue",
            Command::EnqueuePlaylist(_) => "playlist",
            Command::Skip => "skip",
            Command::Back => "back",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Interlude(_) => "interlude",
            Command::ClearQueue(_) => "clear",
            Command::ClearAll => "clearall",
            Command::Stop => "stop",
            Command::Reset => "reset",
            Command::Join { .. } => "join",
            Command::Restore(_) => "restore",
        }
    }
}

/// Confirmación de un comando aceptado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Queued { position: usize, started: bool },
    PlaylistQueued { added: usize, rejected: usize },
    Skipped,
    WentBack { track: TrackRef },
    Paused,
    Resumed,
    InterludeQueued { count: usize },
    Cleared { removed: usize },
    Stopped,
    Reset,
    Joining,
    AlreadyConnected,
    Restored { queued: usize, dropped: usize },
}

/// Eventos que la capa de voz reporta de vuelta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PlaybackFinished { token: PlaybackToken },
    PlaybackErrored { token: PlaybackToken, reason: String },
    ConnectionDropped,
    ConnectionRestored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    IdleLeave,
    KeepAlive,
    ReconnectAttempt,
}

/// Toda entrada de la máquina de estados de un guild.
#[derive(Debug)]
pub enum Trigger {
    Command(Command),
    Transport(TransportEvent),
    ResolutionCompleted {
        token: ResolveToken,
        result: Result<StreamDescriptor, ResolutionError>,
    },
    JoinFailed {
        reason: String,
    },
    TimerFired {
        kind: TimerKind,
        generation: u64,
    },
}

/// Intenciones que el orquestador pide a la capa de voz.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportIntent {
    StartPlayback {
        stream: StreamDescriptor,
        token: PlaybackToken,
    },
    StopPlayback,
    PausePlayback,
    ResumePlayback,
    JoinChannel {
        channel: ChannelId,
    },
    LeaveChannel,
    SendKeepAlive,
}

impl TransportIntent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportIntent::StartPlayback { .. } => "start",
            TransportIntent::StopPlayback => "stop",
            TransportIntent::PausePlayback => "pause",
            TransportIntent::ResumePlayback => "resume",
            TransportIntent::JoinChannel { .. } => "join",
            TransportIntent::LeaveChannel => "leave",
            TransportIntent::SendKeepAlive => "keepalive",
        }
    }
}

/// Avisos informativos para el canal de texto del guild.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NowPlaying {
        track: TrackRef,
        stream: StreamDescriptor,
        interlude: bool,
    },
    TrackSkipped {
        track: TrackRef,
        reason: String,
    },
    QueueFinished,
    BatchResolutionFailure {
        failed: usize,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Reconnected,
    TransportFailure {
        reason: String,
    },
    SessionFatal {
        reason: String,
    },
    Left,
}

impl Notification {
    /// Solo estos dejan al guild sin poder avanzar.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Notification::BatchResolutionFailure { .. } | Notification::SessionFatal { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct GuildNotification {
    pub guild_id: GuildId,
    pub text_channel: Option<ChannelId>,
    pub notification: Notification,
}

/// Salida de una transición; el worker del guild la ejecuta en orden.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Transport(TransportIntent),
    Resolve {
        token: ResolveToken,
        track: TrackRef,
    },
    Schedule {
        kind: TimerKind,
        after: Duration,
        generation: u64,
    },
    Notify(Notification),
    Persist,
    Release,
}

/// Resultado de aplicar un trigger.
#[derive(Debug, Default)]
pub struct Step {
    pub reply: Option<Result<Ack, CommandError>>,
    pub effects: Vec<Effect>,
}

/// Canal por el que la capa de voz reinyecta eventos en el guild.
#[derive(Clone)]
pub struct EventSink {
    guild_id: GuildId,
    sender: flume::Sender<super::orchestrator::Envelope>,
}

impl EventSink {
    pub(crate) fn new(
        guild_id: GuildId,
        sender: flume::Sender<super::orchestrator::Envelope>,
    ) -> Self {
        Self { guild_id, sender }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Devuelve `false` si la sesión ya fue liberada.
    pub fn report(&self, event: TransportEvent) -> bool {
        self.sender
            .send(super::orchestrator::Envelope::trigger(Trigger::Transport(event)))
            .is_ok()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("guild_id", &self.guild_id)
            .finish_non_exhaustive()
    }
}

/// Capa de voz: ejecuta intenciones, reporta eventos por el [`EventSink`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        guild_id: GuildId,
        intent: TransportIntent,
        events: EventSink,
    ) -> Result<(), TransportError>;
}
