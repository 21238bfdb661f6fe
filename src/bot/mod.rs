//! # Bot Module
//!
//! Discord glue around the playback [`Orchestrator`].
//!
//! - [`commands`]: slash command definitions and registration
//! - [`handlers`]: one handler per command, each a single orchestrator call
//! - [`voice`]: the songbird-backed [`Transport`](crate::audio::events::Transport)
//!
//! The [`OpenMusicBot`] event handler registers commands on `ready`, routes
//! interactions, and reports the bot being kicked from voice back to the
//! orchestrator as a dropped connection. Notifications flow the other way
//! through [`forward_notifications`].

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
    builder::CreateMessage,
    http::Http,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;
pub mod voice;

use crate::{
    audio::{events::GuildNotification, orchestrator::Orchestrator, TransportEvent},
    config::Config,
    ui::embeds,
};

/// Handler de eventos de Discord del bot
pub struct OpenMusicBot {
    config: Arc<Config>,
    pub orchestrator: Orchestrator,
}

impl OpenMusicBot {
    pub fn new(config: Arc<Config>, orchestrator: Orchestrator) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Registra los comandos slash, globales o solo en la guild de desarrollo.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        // Registrar comandos globales o por guild según configuración
        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);

                // Verificar que el bot esté en la guild
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id)
                    .await
                    .map_err(|e| {
                        error!("❌ Error registrando comandos de guild: {:?}", e);
                        anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                    })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for OpenMusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Si alguien saca al bot del canal, para el orquestador es una caída.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }

        let was_connected = old.and_then(|state| state.channel_id).is_some();
        if was_connected && new.channel_id.is_none() {
            if let Some(guild_id) = new.guild_id {
                info!("🔌 Bot desconectado en guild {}", guild_id);
                self.orchestrator
                    .transport_event(guild_id, TransportEvent::ConnectionDropped);
            }
        }
    }
}

/// Publica cada aviso del orquestador en el canal de texto de su guild.
pub async fn forward_notifications(
    http: Arc<Http>,
    mut notifications: broadcast::Receiver<GuildNotification>,
) {
    loop {
        let GuildNotification {
            guild_id,
            text_channel,
            notification,
        } = match notifications.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("📣 Se perdieron {} avisos por lentitud", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(channel) = text_channel else {
            debug!("📣 Guild {} sin canal de texto, aviso descartado", guild_id);
            continue;
        };

        let message = CreateMessage::new().embed(embeds::create_notification_embed(&notification));
        if let Err(e) = channel.send_message(&http, message).await {
            warn!("📣 No se pudo avisar en guild {}: {:?}", guild_id, e);
        }
    }
}
