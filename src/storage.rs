use anyhow::{Context, Result};
use serenity::model::id::GuildId;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::session::SessionSnapshot;

/// Persistencia de sesiones en archivos JSON, uno por guild.
///
/// Solo guarda referencias (cola, historial, track actual); los streams
/// resueltos caducan y se vuelven a resolver al restaurar.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    data_dir: PathBuf,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        // Crear directorio de datos si no existe
        let sessions_dir = data_dir.join("sessions");
        fs::create_dir_all(&sessions_dir)
            .await
            .with_context(|| format!("No se pudo crear {}", sessions_dir.display()))?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    /// Guarda la foto de un guild. Una foto vacía borra el archivo.
    pub async fn save_snapshot(&self, guild_id: GuildId, snapshot: &SessionSnapshot) -> Result<()> {
        if snapshot.is_empty() {
            return self.remove_snapshot(guild_id).await;
        }

        let file_path = self.session_file_path(guild_id);
        let tmp_path = file_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(snapshot)?;

        // Escritura atómica: un corte a mitad no deja un JSON roto
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &file_path).await?;

        debug!(
            "💾 Sesión guardada para guild {} ({} en cola)",
            guild_id,
            snapshot.queue.len()
        );
        Ok(())
    }

    pub async fn load_snapshot(&self, guild_id: GuildId) -> Result<Option<SessionSnapshot>> {
        let file_path = self.session_file_path(guild_id);
        let content = match fs::read_to_string(&file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("JSON inválido en {}", file_path.display()))?;
        Ok(Some(snapshot))
    }

    pub async fn remove_snapshot(&self, guild_id: GuildId) -> Result<()> {
        match fs::remove_file(self.session_file_path(guild_id)).await {
            Ok(()) => {
                debug!("🗑️ Sesión eliminada para guild {}", guild_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Carga todas las sesiones guardadas. Los archivos corruptos se saltan.
    pub async fn load_all(&self) -> Result<Vec<(GuildId, SessionSnapshot)>> {
        let sessions_dir = self.data_dir.join("sessions");
        let mut files = fs::read_dir(&sessions_dir).await?;
        let mut loaded = Vec::new();

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|name| name.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
                .filter(|id| *id != 0)
                .map(GuildId::new)
            else {
                continue;
            };

            match self.load_snapshot(guild_id).await {
                Ok(Some(snapshot)) => loaded.push((guild_id, snapshot)),
                Ok(None) => {}
                Err(e) => warn!("Error cargando sesión para guild {}: {:#}", guild_id, e),
            }
        }

        if !loaded.is_empty() {
            info!("📂 Cargadas {} sesiones guardadas", loaded.len());
        }

        Ok(loaded)
    }

    /// Obtiene estadísticas de almacenamiento
    pub async fn stats(&self) -> Result<StorageStats> {
        let sessions_dir = self.data_dir.join("sessions");
        let mut files = fs::read_dir(&sessions_dir).await?;
        let mut file_count = 0;
        let mut total_size = 0;

        while let Some(entry) = files.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                file_count += 1;
                if let Ok(metadata) = entry.metadata().await {
                    total_size += metadata.len();
                }
            }
        }

        Ok(StorageStats {
            session_files: file_count,
            total_size_bytes: total_size,
            data_dir: self.data_dir.clone(),
        })
    }

    fn session_file_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir
            .join("sessions")
            .join(format!("guild_{}.json", guild_id))
    }
}

/// Estadísticas de almacenamiento
#[derive(Debug)]
pub struct StorageStats {
    pub session_files: usize,
    pub total_size_bytes: u64,
    pub data_dir: PathBuf,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Storage: {} sesiones guardadas en {} ({:.2} KB)",
            self.session_files,
            self.data_dir.display(),
            self.total_size_bytes as f64 / 1024.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::TrackRef;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn snapshot() -> SessionSnapshot {
        let user = UserId::new(3);
        SessionSnapshot {
            queue: vec![
                TrackRef::new("https://youtu.be/dQw4w9WgXcQ", user),
                TrackRef::new("daft punk around the world", user),
            ],
            history: vec![TrackRef::new("https://example.com/a.mp3", user)],
            now_playing: Some(TrackRef::new("lofi beats", user)),
        }
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        let guild = GuildId::new(42);

        storage.save_snapshot(guild, &snapshot()).await.unwrap();

        let reopened = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        let loaded = reopened.load_snapshot(guild).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot());
        assert_eq!(
            loaded.queue[1].requested_by(),
            snapshot().queue[1].requested_by()
        );

        let all = reopened.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, guild);
    }

    #[tokio::test]
    async fn test_empty_snapshot_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        let guild = GuildId::new(7);

        storage.save_snapshot(guild, &snapshot()).await.unwrap();
        storage
            .save_snapshot(guild, &SessionSnapshot::default())
            .await
            .unwrap();

        assert!(storage.load_snapshot(guild).await.unwrap().is_none());
        assert_eq!(storage.stats().await.unwrap().session_files, 0);
        // Borrar dos veces no es error
        storage.remove_snapshot(guild).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupt_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        storage
            .save_snapshot(GuildId::new(1), &snapshot())
            .await
            .unwrap();

        let sessions = dir.path().join("sessions");
        std::fs::write(sessions.join("guild_2.json"), "{ no es json").unwrap();
        std::fs::write(sessions.join("notes.txt"), "hola").unwrap();
        std::fs::write(sessions.join("guild_abc.json"), "{}").unwrap();

        let all = storage.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, GuildId::new(1));
    }
}
