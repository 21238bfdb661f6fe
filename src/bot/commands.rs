use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

/// Nombres de todos los comandos slash, en el orden en que se registran
pub const COMMAND_NAMES: [&str; 15] = [
    "play", "playlist", "interlude", "search", "skip", "back", "pause", "resume", "clear",
    "clearall", "stop", "queue", "status", "join", "reset",
];

pub fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        playlist_command(),
        interlude_command(),
        search_command(),
        skip_command(),
        back_command(),
        pause_command(),
        resume_command(),
        clear_command(),
        clearall_command(),
        stop_command(),
        queue_command(),
        status_command(),
        join_command(),
        reset_command(),
    ]
}

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

// Comandos de reproducción

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción o playlist")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
}

fn playlist_command() -> CreateCommand {
    CreateCommand::new("playlist")
        .description("Carga una playlist completa")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "url", "URL de la playlist")
                .required(true),
        )
}

fn interlude_command() -> CreateCommand {
    CreateCommand::new("interlude")
        .description("Reproduce algo ahora y después retoma la canción actual")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
}

fn search_command() -> CreateCommand {
    CreateCommand::new("search")
        .description("Busca en YouTube y muestra los primeros resultados")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "Término de búsqueda")
                .required(true),
        )
}

// Comandos de control

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta a la siguiente canción")
}

fn back_command() -> CreateCommand {
    CreateCommand::new("back").description("Vuelve a la canción anterior")
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Detiene la reproducción, limpia la cola y sale del canal")
}

fn reset_command() -> CreateCommand {
    CreateCommand::new("reset").description("Reinicia la sesión sin salir del canal")
}

// Comandos de cola

fn clear_command() -> CreateCommand {
    CreateCommand::new("clear")
        .description("Quita las próximas canciones de la cola")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "amount",
                "Cantidad de canciones a quitar",
            )
            .min_int_value(1)
            .required(true),
        )
}

fn clearall_command() -> CreateCommand {
    CreateCommand::new("clearall").description("Vacía la cola sin detener la canción actual")
}

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Muestra la cola de reproducción")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Número de página")
                .min_int_value(1),
        )
}

fn status_command() -> CreateCommand {
    CreateCommand::new("status").description("Muestra el estado interno de la sesión")
}

// Comandos de conexión

fn join_command() -> CreateCommand {
    CreateCommand::new("join").description("Conecta el bot a tu canal de voz")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_registered_names_match_builders() {
        let names: Vec<String> = all_commands()
            .iter()
            .map(|command| serde_json::to_value(command).unwrap()["name"].to_string())
            .map(|name| name.trim_matches('"').to_string())
            .collect();

        assert_eq!(names, COMMAND_NAMES.map(String::from).to_vec());
    }

    #[test]
    fn test_clear_requires_positive_amount() {
        let clear = serde_json::to_value(clear_command()).unwrap();
        let option = &clear["options"][0];
        assert_eq!(option["name"], "amount");
        assert_eq!(option["required"], true);
        assert_eq!(option["min_value"], 1);
    }
}
