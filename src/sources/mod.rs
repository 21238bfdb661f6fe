//! # Sources
//!
//! Resolution of queued [`TrackRef`]s into playable streams.
//!
//! The orchestrator only knows the [`Resolver`] trait: it hands over a
//! reference and gets back a [`StreamDescriptor`] or a [`ResolutionError`].
//! The timeout is applied by the caller, so implementations must be safe to
//! drop mid-flight (no side effects besides killing their own subprocess).
//!
//! The production implementation is [`YtDlpResolver`], which shells out to
//! `yt-dlp` for single tracks, flat playlist expansion and search listings.

pub mod ytdlp;

use async_trait::async_trait;
use std::time::Duration;

use crate::audio::track::{StreamDescriptor, TrackRef};
use crate::error::ResolutionError;

pub use ytdlp::YtDlpResolver;

/// Resultado de búsqueda: solo para mostrar, no se encola solo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub uploader: Option<String>,
    pub duration: Option<Duration>,
}

/// Servicio externo que convierte referencias en streams reproducibles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resuelve una URL o texto de búsqueda a un stream
    async fn resolve(&self, track: &TrackRef) -> Result<StreamDescriptor, ResolutionError>;

    /// Expande una playlist a las URLs de sus tracks, en orden
    async fn expand_playlist(&self, url: &str) -> Result<Vec<String>, ResolutionError>;

    /// Primeros `limit` resultados de búsqueda para un texto
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, ResolutionError>;

    /// Verifica si la URL apunta a una playlist
    fn is_playlist(&self, query: &str) -> bool;
}
