//! # Error Types
//!
//! Typed failures of the playback core. Everything the orchestrator can
//! recover from locally (resolution failures, transport hiccups) is absorbed
//! and surfaced as a [`Notification`](crate::audio::events::Notification);
//! only [`CommandError`] travels back to the caller of a command.

use std::time::Duration;
use thiserror::Error;

use crate::audio::session::PlaybackState;

/// Rechazo de un comando por reglas de la cola o del estado actual.
///
/// Nunca modifica la sesión: el comando se descarta completo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("La cola está llena (máximo {max} canciones)")]
    QueueFull { max: usize },

    #[error("No hay canciones anteriores en el historial")]
    NothingToGoBackTo,

    #[error("No hay nada reproduciéndose")]
    NothingPlaying,

    #[error("`{operation}` no es válido en el estado {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PlaybackState,
    },

    #[error("La cantidad debe ser mayor que 0")]
    InvalidCount,

    #[error("La playlist no contiene canciones")]
    EmptyPlaylist,
}

/// Resultado fallido de un comando enviado al orquestador.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Hay una transición en curso o la sesión se está cerrando; se puede reintentar.
    #[error("La sesión está ocupada: {0}")]
    SessionBusy(&'static str),

    #[error("No hay una sesión activa en este servidor")]
    NoSession,
}

/// Fallo del servicio de extracción al resolver una referencia.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Tiempo de resolución agotado ({0:?})")]
    Timeout(Duration),

    #[error("No se encontraron resultados para: {0}")]
    NotFound(String),

    #[error("yt-dlp falló: {0}")]
    Extraction(String),

    #[error("Error de E/S al ejecutar el extractor: {0}")]
    Io(#[from] std::io::Error),
}

/// Fallo al ejecutar una intención sobre la capa de voz.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No hay conexión de voz para este servidor")]
    NotConnected,

    #[error("No se pudo unir al canal de voz: {0}")]
    Join(String),

    #[error("Error del driver de voz: {0}")]
    Driver(String),
}

/// Resultado tardío de una operación cuyo token ya fue invalidado.
///
/// Interno: se registra en `debug` y se descarta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operación obsoleta descartada")]
pub struct StaleOperation;
