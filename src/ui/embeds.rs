use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::{
    events::Notification,
    session::{ConnectionState, PlaybackState, SessionStatus},
    track::{StreamDescriptor, TrackRef},
};
use crate::sources::SearchResult;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Open Music Bot";

const ITEMS_PER_PAGE: usize = 10;

/// Crea un embed para mostrar la canción actual
pub fn create_now_playing_embed(
    track: &TrackRef,
    stream: &StreamDescriptor,
    interlude: bool,
) -> CreateEmbed {
    let title = if interlude {
        "🎶 Interludio"
    } else {
        "🎵 Reproduciendo Ahora"
    };

    let duration = stream
        .duration
        .map(format_duration)
        .unwrap_or_else(|| "🔴 En vivo".to_string());

    let mut embed = CreateEmbed::default()
        .title(title)
        .description(format!("**{}**", stream.title))
        .color(colors::SUCCESS_GREEN)
        .field("⏱️ Duración", duration, true)
        .field("👤 Solicitado por", format!("<@{}>", track.requested_by()), true);

    if track.is_url() {
        embed = embed.url(track.query());
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Traduce un aviso del orquestador al embed que ve el canal de texto
pub fn create_notification_embed(notification: &Notification) -> CreateEmbed {
    match notification {
        Notification::NowPlaying {
            track,
            stream,
            interlude,
        } => create_now_playing_embed(track, stream, *interlude),
        Notification::TrackSkipped { track, reason } => create_warning_embed(
            "Canción Saltada",
            &format!("**{}** no se pudo reproducir.\n`{}`", track, reason),
        ),
        Notification::QueueFinished => create_info_embed(
            "Cola Terminada",
            "No quedan canciones. Usa `/play` para agregar más.",
        ),
        Notification::BatchResolutionFailure { failed } => create_error_embed(
            "Reproducción Detenida",
            &format!(
                "Fallaron **{}** canciones seguidas. La cola queda en pausa hasta el próximo comando.",
                failed
            ),
        ),
        Notification::Reconnecting { attempt, delay } => create_warning_embed(
            "Reconectando",
            &format!(
                "Se perdió la conexión de voz. Intento **{}** en {}.",
                attempt,
                humantime::format_duration(*delay)
            ),
        ),
        Notification::Reconnected => {
            create_success_embed("Reconectado", "La conexión de voz se recuperó.")
        }
        Notification::TransportFailure { reason } => {
            create_error_embed("Error de Conexión", &format!("`{}`", reason))
        }
        Notification::SessionFatal { reason } => create_error_embed(
            "Conexión Perdida",
            &format!("{}\nUsa `/join` para volver a intentar.", reason),
        ),
        Notification::Left => create_info_embed("Desconectado", "👋 Salí del canal de voz."),
    }
}

/// Crea un embed para mostrar la cola de reproducción
pub fn create_queue_embed(status: &SessionStatus, page: usize) -> CreateEmbed {
    let queue_page = status.queue.page(page, ITEMS_PER_PAGE);

    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    // Canción actual
    if let Some(current) = &status.now_playing {
        let icon = match status.playback_state {
            PlaybackState::Paused => "⏸️",
            _ => "▶️",
        };
        embed = embed.field(
            format!("{} Reproduciendo", icon),
            format!("**{}**", current.stream.title),
            false,
        );
    } else if let Some(resolving) = &status.resolving {
        embed = embed.field("🔍 Preparando", format!("**{}**", resolving), false);
    }

    if queue_page.total_items == 0 {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    let description: String = queue_page
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            format!(
                "**{}**. {} • <@{}> • <t:{}:R>\n",
                queue_page.first_position + i,
                item,
                item.requested_by(),
                item.enqueued_at().timestamp()
            )
        })
        .collect();
    embed = embed.field("Próximas canciones", description, false).field(
        "Información",
        format!(
            "**Total:** {} / {} canciones",
            queue_page.total_items,
            status.queue.max_size()
        ),
        false,
    );

    // Paginación
    if queue_page.total_pages > 1 {
        embed = embed.footer(CreateEmbedFooter::new(format!(
            "Página {} de {} • Open Music Bot",
            queue_page.current_page, queue_page.total_pages
        )));
    } else {
        embed = embed.footer(CreateEmbedFooter::new(STANDARD_FOOTER));
    }

    embed.timestamp(Timestamp::now())
}

/// Vista de depuración con el estado completo de la sesión
pub fn create_status_embed(status: &SessionStatus) -> CreateEmbed {
    let color = match status.connection_state {
        ConnectionState::Connected => colors::SUCCESS_GREEN,
        ConnectionState::Reconnecting | ConnectionState::Connecting => colors::WARNING_ORANGE,
        ConnectionState::Disconnected => colors::NEUTRAL_GRAY,
    };

    let current = match (&status.now_playing, &status.resolving) {
        (Some(now), _) => now.stream.title.clone(),
        (None, Some(track)) => format!("🔍 {}", track),
        (None, None) => "—".to_string(),
    };

    let voice = status
        .voice_channel
        .map(|channel| format!("<#{}>", channel))
        .unwrap_or_else(|| "—".to_string());

    let mut embed = CreateEmbed::default()
        .title("📊 Estado de la Sesión")
        .color(color)
        .field("🎵 Reproducción", format!("{:?}", status.playback_state), true)
        .field("🔊 Conexión", format!("{:?}", status.connection_state), true)
        .field("📡 Canal", voice, true)
        .field("▶️ Actual", current, false)
        .field("📋 En cola", status.queue.len().to_string(), true)
        .field("📜 Historial", status.history.len().to_string(), true)
        .field("🚫 Lista negra", status.blacklist_len.to_string(), true);

    if status.reconnect_exhausted {
        embed = embed.field(
            "⚠️ Reconexión",
            "Se agotaron los intentos; usa `/join`",
            false,
        );
    }

    embed
        .footer(CreateEmbedFooter::new(format!(
            "Última actividad: {}",
            status.last_activity.format("%H:%M:%S UTC")
        )))
        .timestamp(Timestamp::now())
}

/// Crea un embed para mostrar que una playlist fue agregada
pub fn create_playlist_added_embed(added: usize, rejected: usize, playlist_url: &str) -> CreateEmbed {
    let description = if added == 1 {
        "Se agregó **1 canción** de la playlist a la cola de reproducción".to_string()
    } else {
        format!(
            "Se agregaron **{} canciones** de la playlist a la cola de reproducción",
            added
        )
    };

    let mut embed = CreateEmbed::default()
        .title("📋 Playlist Agregada")
        .description(description)
        .color(colors::MUSIC_PURPLE)
        .field("📊 Canciones agregadas", added.to_string(), true);

    if rejected > 0 {
        embed = embed.field("🚫 Sin lugar en la cola", rejected.to_string(), true);
    }

    // Extraer el ID de la playlist para mostrar
    if let Some(list_id) = playlist_id(playlist_url) {
        embed = embed.field("🆔 Playlist ID", format!("`{}`", list_id), true);
    }

    embed
        .footer(CreateEmbedFooter::new(
            "🎵 Usa /queue para ver todas las canciones",
        ))
        .timestamp(Timestamp::now())
}

/// Lista de resultados de `/search`, cada uno con su link para `/play`
pub fn create_search_results_embed(query: &str, results: &[SearchResult]) -> CreateEmbed {
    if results.is_empty() {
        return create_warning_embed(
            "Sin Resultados",
            &format!("No se encontró nada para **{}**", query),
        );
    }

    let description: String = results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let mut line = format!("**{}**. [{}]({})", i + 1, result.title, result.url);
            if let Some(duration) = result.duration {
                line.push_str(&format!(" `{}`", format_duration(duration)));
            }
            if let Some(uploader) = &result.uploader {
                line.push_str(&format!(" • {}", uploader));
            }
            line.push('\n');
            line
        })
        .collect();

    CreateEmbed::default()
        .title(format!("🔍 Resultados para: {}", query))
        .description(description)
        .color(colors::INFO_BLUE)
        .footer(CreateEmbedFooter::new(
            "💡 Copia un link y usa /play <link> para reproducirlo",
        ))
        .timestamp(Timestamp::now())
}

/// Crea un embed de error
pub fn create_error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new("Open Music Bot"))
}

pub fn create_warning_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("⚠️ {}", title))
        .description(description)
        .color(colors::WARNING_ORANGE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new("Open Music Bot"))
}

/// Crea un embed de éxito
pub fn create_success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new("Open Music Bot"))
}

/// Crea un embed de información
pub fn create_info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("ℹ️ {}", title))
        .description(description)
        .color(colors::INFO_BLUE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new("Open Music Bot"))
}

fn playlist_id(playlist_url: &str) -> Option<&str> {
    let start = playlist_url.find("list=")? + "list=".len();
    playlist_url[start..]
        .split('&')
        .next()
        .filter(|id| !id.is_empty())
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::{Command, Trigger};
    use crate::audio::session::{GuildSession, SessionSnapshot};
    use chrono::Utc;
    use crate::config::PlaybackConfig;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use serenity::model::id::{GuildId, UserId};

    fn json(embed: &CreateEmbed) -> Value {
        serde_json::to_value(embed).unwrap()
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(59)), "0:59");
        assert_eq!(format_duration(Duration::from_secs(428)), "7:08");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1:02:05");
    }

    #[test]
    fn test_playlist_id_extraction() {
        assert_eq!(
            playlist_id("https://www.youtube.com/playlist?list=PLabc&index=2"),
            Some("PLabc")
        );
        assert_eq!(playlist_id("https://www.youtube.com/watch?v=x"), None);
        assert_eq!(playlist_id("https://www.youtube.com/playlist?list="), None);
    }

    #[test]
    fn test_interlude_uses_its_own_title() {
        let track = TrackRef::new("https://youtu.be/dQw4w9WgXcQ", UserId::new(1));
        let stream = StreamDescriptor::new("https://cdn.example.com/a", "Never Gonna Give You Up")
            .with_duration(Duration::from_secs(213));

        let embed = json(&create_now_playing_embed(&track, &stream, true));
        assert_eq!(embed["title"], "🎶 Interludio");
        assert_eq!(embed["description"], "**Never Gonna Give You Up**");
        assert_eq!(embed["url"], "https://youtu.be/dQw4w9WgXcQ");
    }

    #[test]
    fn test_queue_embed_pages() {
        let mut session = GuildSession::new(GuildId::new(1), PlaybackConfig::default());
        let tracks: Vec<TrackRef> = (1..=25)
            .map(|i| TrackRef::new(format!("canción {}", i), UserId::new(2)))
            .collect();
        let snapshot = SessionSnapshot {
            queue: tracks,
            ..Default::default()
        };
        session.handle(Trigger::Command(Command::Restore(snapshot)), Utc::now());

        let embed = json(&create_queue_embed(&session.status(), 3));
        assert_eq!(embed["footer"]["text"], "Página 3 de 3 • Open Music Bot");
        let listing = embed["fields"][0]["value"].as_str().unwrap();
        assert!(listing.starts_with("**21**. canción 21"), "{}", listing);
    }

    #[test]
    fn test_queue_embed_shows_when_each_item_was_added() {
        let mut session = GuildSession::new(GuildId::new(1), PlaybackConfig::default());
        let track = TrackRef::new("lofi", UserId::new(2));
        let added = track.enqueued_at().timestamp();
        let snapshot = SessionSnapshot {
            queue: vec![track],
            ..Default::default()
        };
        session.handle(Trigger::Command(Command::Restore(snapshot)), Utc::now());

        let embed = json(&create_queue_embed(&session.status(), 1));
        let listing = embed["fields"][0]["value"].as_str().unwrap();
        assert!(listing.contains(&format!("<t:{}:R>", added)), "{}", listing);
    }

    #[test]
    fn test_search_results_embed() {
        let results = vec![
            SearchResult {
                title: "Never Gonna Give You Up".to_string(),
                url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
                uploader: Some("Rick Astley".to_string()),
                duration: Some(Duration::from_secs(213)),
            },
            SearchResult {
                title: "Sin datos".to_string(),
                url: "https://www.youtube.com/watch?v=abc123def45".to_string(),
                uploader: None,
                duration: None,
            },
        ];

        let embed = json(&create_search_results_embed("rick", &results));
        assert_eq!(embed["title"], "🔍 Resultados para: rick");
        assert_eq!(
            embed["description"],
            "**1**. [Never Gonna Give You Up](https://www.youtube.com/watch?v=dQw4w9WgXcQ) `3:33` • Rick Astley\n\
             **2**. [Sin datos](https://www.youtube.com/watch?v=abc123def45)\n"
        );

        let empty = json(&create_search_results_embed("nada", &[]));
        assert_eq!(empty["title"], "⚠️ Sin Resultados");
    }

    #[test]
    fn test_empty_queue_embed() {
        let session = GuildSession::new(GuildId::new(1), PlaybackConfig::default());
        let embed = json(&create_queue_embed(&session.status(), 1));
        assert!(embed["description"]
            .as_str()
            .unwrap()
            .contains("La cola está vacía"));
    }
}
