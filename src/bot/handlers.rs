use anyhow::Result;
use serenity::{
    builder::{CreateEmbed, EditInteractionResponse},
    model::{
        application::{CommandDataOption, CommandInteraction},
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, warn};

use crate::{
    audio::{
        events::Ack,
        session::ConnectionState,
        track::TrackRef,
    },
    bot::OpenMusicBot,
    error::{CommandError, ValidationError},
    ui::embeds,
};

const SEARCH_RESULTS: usize = 5;

/// Respuesta final de un comando, ya lista para Discord
enum Reply {
    Content(String),
    Embed(CreateEmbed),
}

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &OpenMusicBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    // Join y resolución de playlists pueden tardar más que los 3s de Discord
    command.defer(&ctx.http).await?;

    let orchestrator = &bot.orchestrator;
    let options = &command.data.options;
    let reply = match command.data.name.as_str() {
        "play" => {
            let query = string_option(options, "query")
                .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;
            handle_play(ctx, &command, bot, guild_id, query).await
        }
        "playlist" => {
            let url = string_option(options, "url")
                .ok_or_else(|| anyhow::anyhow!("URL no proporcionada"))?;
            match ensure_voice(ctx, &command, bot, guild_id).await {
                Ok(()) => handle_playlist(bot, guild_id, command.user.id, url).await,
                Err(reply) => reply,
            }
        }
        "interlude" => {
            let query = string_option(options, "query")
                .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;
            match ensure_voice(ctx, &command, bot, guild_id).await {
                Ok(()) => handle_interlude(bot, guild_id, command.user.id, query).await,
                Err(reply) => reply,
            }
        }
        "search" => {
            let query = string_option(options, "query")
                .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;
            handle_search(bot, query).await
        }
        "skip" => outcome(orchestrator.skip(guild_id).await),
        "back" => outcome(orchestrator.back(guild_id).await),
        "pause" => outcome(orchestrator.pause(guild_id).await),
        "resume" => outcome(orchestrator.resume(guild_id).await),
        "clear" => match count_option(int_option(options, "amount")) {
            Ok(count) => outcome(orchestrator.clear_queue(guild_id, count).await),
            Err(e) => outcome(Err(e.into())),
        },
        "clearall" => outcome(orchestrator.clear_all(guild_id).await),
        "stop" => outcome(orchestrator.stop(guild_id).await),
        "reset" => outcome(orchestrator.reset(guild_id).await),
        "queue" => {
            let page = page_option(int_option(options, "page"));
            match orchestrator.status(guild_id) {
                Some(status) => Reply::Embed(embeds::create_queue_embed(&status, page)),
                None => outcome(Err(CommandError::NoSession)),
            }
        }
        "status" => match orchestrator.status(guild_id) {
            Some(status) => Reply::Embed(embeds::create_status_embed(&status)),
            None => outcome(Err(CommandError::NoSession)),
        },
        "join" => match get_user_voice_channel(ctx, guild_id, command.user.id) {
            Ok(voice_channel) => outcome(
                orchestrator
                    .join(guild_id, voice_channel, Some(command.channel_id))
                    .await,
            ),
            Err(e) => Reply::Content(format!("❌ {}", e)),
        },
        _ => Reply::Content("❌ Comando no reconocido".to_string()),
    };

    let response = match reply {
        Reply::Content(content) => EditInteractionResponse::new().content(content),
        Reply::Embed(embed) => EditInteractionResponse::new().embed(embed),
    };
    command.edit_response(&ctx.http, response).await?;

    Ok(())
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &OpenMusicBot,
    guild_id: GuildId,
    query: &str,
) -> Reply {
    if let Err(reply) = ensure_voice(ctx, command, bot, guild_id).await {
        return reply;
    }

    if bot.orchestrator.resolver().is_playlist(query) {
        return handle_playlist(bot, guild_id, command.user.id, query).await;
    }

    let track = TrackRef::new(query, command.user.id);
    outcome(bot.orchestrator.enqueue(guild_id, track).await)
}

/// Expande una playlist en tracks pedidos por `user`.
async fn expand_playlist(bot: &OpenMusicBot, user: UserId, url: &str) -> Result<Vec<TrackRef>, Reply> {
    match bot.orchestrator.resolver().expand_playlist(url).await {
        Ok(links) => Ok(links
            .into_iter()
            .map(|link| TrackRef::new(link, user))
            .collect()),
        Err(e) => {
            warn!("📋 No se pudo expandir la playlist {}: {}", url, e);
            Err(Reply::Embed(embeds::create_error_embed(
                "Error en Playlist",
                &e.to_string(),
            )))
        }
    }
}

async fn handle_playlist(bot: &OpenMusicBot, guild_id: GuildId, user: UserId, url: &str) -> Reply {
    let tracks = match expand_playlist(bot, user, url).await {
        Ok(tracks) => tracks,
        Err(reply) => return reply,
    };

    match bot.orchestrator.enqueue_playlist(guild_id, tracks).await {
        Ok(Ack::PlaylistQueued { added, rejected }) => {
            Reply::Embed(embeds::create_playlist_added_embed(added, rejected, url))
        }
        other => outcome(other),
    }
}

async fn handle_search(bot: &OpenMusicBot, query: &str) -> Reply {
    match bot.orchestrator.resolver().search(query, SEARCH_RESULTS).await {
        Ok(results) => Reply::Embed(embeds::create_search_results_embed(query, &results)),
        Err(e) => {
            warn!("🔍 Falló la búsqueda de {}: {}", query, e);
            Reply::Embed(embeds::create_error_embed("Error en Búsqueda", &e.to_string()))
        }
    }
}

/// Un interludio puede ser una playlist entera; suena en su orden.
async fn handle_interlude(bot: &OpenMusicBot, guild_id: GuildId, user: UserId, query: &str) -> Reply {
    let tracks = if bot.orchestrator.resolver().is_playlist(query) {
        match expand_playlist(bot, user, query).await {
            Ok(tracks) => tracks,
            Err(reply) => return reply,
        }
    } else {
        vec![TrackRef::new(query, user)]
    };

    outcome(bot.orchestrator.interlude(guild_id, tracks).await)
}

/// Conecta al canal de voz del usuario si el bot no está ya en uno
async fn ensure_voice(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &OpenMusicBot,
    guild_id: GuildId,
) -> Result<(), Reply> {
    let connected = bot
        .orchestrator
        .status(guild_id)
        .is_some_and(|status| status.connection_state != ConnectionState::Disconnected);
    if connected {
        return Ok(());
    }

    let voice_channel = get_user_voice_channel(ctx, guild_id, command.user.id)
        .map_err(|e| Reply::Content(format!("❌ {}", e)))?;

    match bot
        .orchestrator
        .join(guild_id, voice_channel, Some(command.channel_id))
        .await
    {
        Ok(_) => Ok(()),
        // Reconectando: la canción se encola igual y sonará al volver
        Err(CommandError::SessionBusy(_)) => Ok(()),
        Err(e) => Err(outcome(Err(e))),
    }
}

fn outcome(result: Result<Ack, CommandError>) -> Reply {
    match result {
        Ok(ack) => Reply::Content(ack_message(&ack)),
        Err(e) => Reply::Content(format!("❌ {}", e)),
    }
}

fn ack_message(ack: &Ack) -> String {
    match ack {
        Ack::Queued {
            started: true, ..
        } => "🎵 Preparando la canción...".to_string(),
        Ack::Queued { position, .. } => format!("✅ Agregada a la cola en la posición **{}**", position),
        Ack::PlaylistQueued { added, rejected: 0 } => {
            format!("📋 Se agregaron **{}** canciones", added)
        }
        Ack::PlaylistQueued { added, rejected } => format!(
            "📋 Se agregaron **{}** canciones ({} no entraron en la cola)",
            added, rejected
        ),
        Ack::Skipped => "⏭️ Canción saltada".to_string(),
        Ack::WentBack { track } => format!("⏮️ Volviendo a **{}**", track),
        Ack::Paused => "⏸️ Reproducción pausada".to_string(),
        Ack::Resumed => "▶️ Reproducción reanudada".to_string(),
        Ack::InterludeQueued { count: 1 } => {
            "🎶 Interludio en camino, después se retoma la canción actual".to_string()
        }
        Ack::InterludeQueued { count } => format!(
            "🎶 Interludio de **{}** canciones en camino, después se retoma la canción actual",
            count
        ),
        Ack::Cleared { removed } => format!("🧹 Se quitaron **{}** canciones de la cola", removed),
        Ack::Stopped => "⏹️ Reproducción detenida y cola limpiada".to_string(),
        Ack::Reset => "🔄 Sesión reiniciada".to_string(),
        Ack::Joining => "🔊 Conectando al canal de voz...".to_string(),
        Ack::AlreadyConnected => "🔊 Ya estoy en tu canal de voz".to_string(),
        Ack::Restored { queued, .. } => format!("📂 Se restauraron **{}** canciones", queued),
    }
}

// Funciones auxiliares

fn string_option<'a>(options: &'a [CommandDataOption], name: &str) -> Option<&'a str> {
    options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn int_option(options: &[CommandDataOption], name: &str) -> Option<i64> {
    options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

fn count_option(value: Option<i64>) -> Result<usize, ValidationError> {
    match value {
        Some(count) if count > 0 => usize::try_from(count).map_err(|_| ValidationError::InvalidCount),
        _ => Err(ValidationError::InvalidCount),
    }
}

fn page_option(value: Option<i64>) -> usize {
    value
        .and_then(|page| usize::try_from(page).ok())
        .unwrap_or(1)
        .max(1)
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_count_option() {
        assert_eq!(count_option(Some(3)), Ok(3));
        assert_eq!(count_option(Some(0)), Err(ValidationError::InvalidCount));
        assert_eq!(count_option(Some(-2)), Err(ValidationError::InvalidCount));
        assert_eq!(count_option(None), Err(ValidationError::InvalidCount));
    }

    #[test]
    fn test_page_option_defaults_to_first() {
        assert_eq!(page_option(None), 1);
        assert_eq!(page_option(Some(0)), 1);
        assert_eq!(page_option(Some(-4)), 1);
        assert_eq!(page_option(Some(7)), 7);
    }

    #[test]
    fn test_ack_messages() {
        assert_eq!(
            ack_message(&Ack::Queued {
                position: 4,
                started: false
            }),
            "✅ Agregada a la cola en la posición **4**"
        );
        assert_eq!(
            ack_message(&Ack::PlaylistQueued {
                added: 8,
                rejected: 2
            }),
            "📋 Se agregaron **8** canciones (2 no entraron en la cola)"
        );
        assert!(ack_message(&Ack::Queued {
            position: 1,
            started: true
        })
        .contains("Preparando"));
        assert_eq!(
            ack_message(&Ack::InterludeQueued { count: 3 }),
            "🎶 Interludio de **3** canciones en camino, después se retoma la canción actual"
        );
    }

    #[test]
    fn test_errors_are_shown_to_the_user() {
        let Reply::Content(text) = outcome(Err(CommandError::NoSession)) else {
            panic!("se esperaba texto");
        };
        assert_eq!(text, "❌ No hay una sesión activa en este servidor");

        let Reply::Content(text) = outcome(Err(ValidationError::QueueFull { max: 100 }.into())) else {
            panic!("se esperaba texto");
        };
        assert!(text.contains("100"));
    }
}
