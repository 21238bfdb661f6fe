use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info};

use open_music::audio::Orchestrator;
use open_music::bot::{self, voice::SongbirdTransport, OpenMusicBot};
use open_music::config::Config;
use open_music::sources::YtDlpResolver;
use open_music::storage::JsonStorage;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Bot v{}", env!("CARGO_PKG_VERSION"));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        YtDlpResolver::verify_dependencies().await?;
        println!("OK");
        return Ok(());
    }

    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    let storage = if config.persist_state {
        let storage = JsonStorage::new(config.data_dir.clone()).await?;
        match storage.stats().await {
            Ok(stats) => info!("{}", stats),
            Err(e) => error!("No se pudieron leer estadísticas de storage: {:?}", e),
        }
        Some(storage)
    } else {
        info!("💾 Persistencia desactivada");
        None
    };

    let songbird = Songbird::serenity();
    let orchestrator = Orchestrator::new(
        config.playback,
        Arc::new(YtDlpResolver::new()),
        Arc::new(SongbirdTransport::new(songbird.clone())),
        storage,
    );

    let restored = orchestrator.restore_all().await?;
    if restored > 0 {
        info!("📂 {} sesiones restauradas; sonarán al volver a /join", restored);
    }

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = OpenMusicBot::new(config.clone(), orchestrator.clone());
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    tokio::spawn(bot::forward_notifications(
        client.http.clone(),
        orchestrator.subscribe(),
    ));

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let shutdown = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown.shutdown();
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}
