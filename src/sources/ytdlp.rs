use async_trait::async_trait;
use std::{path::Path, process::Output, time::Duration};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Resolver, SearchResult};
use crate::audio::track::{StreamDescriptor, TrackRef};
use crate::error::ResolutionError;

const YOUTUBE_WATCH: &str = "https://www.youtube.com/watch?v=";
const YOUTUBE_MUSIC_WATCH: &str = "https://music.youtube.com/watch?v=";

/// Cliente que usa yt-dlp para resolver URLs directas de audio
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    cookies: Option<String>,
    socket_timeout: Duration,
}

impl YtDlpResolver {
    pub fn new() -> Self {
        Self {
            cookies: find_cookies_file(),
            socket_timeout: Duration::from_secs(15),
        }
    }

    /// Verifica que yt-dlp y ffmpeg estén disponibles
    pub async fn verify_dependencies() -> anyhow::Result<()> {
        // Verificar yt-dlp
        let ytdlp_check = Command::new("yt-dlp").arg("--version").output().await;

        match ytdlp_check {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
            }
            _ => {
                error!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
                anyhow::bail!("yt-dlp no disponible");
            }
        }

        // Verificar ffmpeg
        let ffmpeg_check = Command::new("ffmpeg").arg("-version").output().await;

        match ffmpeg_check {
            Ok(output) if output.status.success() => {
                info!("✅ ffmpeg disponible");
            }
            _ => {
                error!("❌ ffmpeg no encontrado. Instala con: sudo apt install ffmpeg");
                anyhow::bail!("ffmpeg no disponible");
            }
        }

        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("yt-dlp");
        cmd.args(["--quiet", "--no-warnings", "--geo-bypass", "--force-ipv4"])
            .args(["--socket-timeout", &self.socket_timeout.as_secs().to_string()])
            .args(["--retries", "2"])
            // Si se descarta el future (timeout, skip) el proceso muere con él
            .kill_on_drop(true);

        // Agregar cookies si están disponibles para evitar throttling
        if let Some(cookies) = &self.cookies {
            cmd.args(["--cookies", cookies]);
        }
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<String, ResolutionError> {
        let output: Output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("código de salida distinto de cero")
                .trim()
                .to_string();
            return Err(ResolutionError::Extraction(reason));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, track: &TrackRef) -> Result<StreamDescriptor, ResolutionError> {
        debug!("🔍 yt-dlp resolviendo: {}", track.query());

        let target = if track.is_url() {
            track.query().to_string()
        } else {
            format!("ytsearch1:{}", track.query())
        };

        let mut cmd = self.command();
        cmd.args([
            "--format",
            "bestaudio[ext=m4a]/bestaudio[ext=webm]/bestaudio/best",
            "--no-playlist",
            "--print",
            "%(title)s",
            "--print",
            "%(duration)s",
            "--print",
            "%(url)s",
        ])
        .arg(&target);

        let stdout = self.run(cmd).await?;
        let stream = parse_resolved(&stdout)
            .ok_or_else(|| ResolutionError::NotFound(track.query().to_string()))?;

        info!("🎵 Resuelto: {} ({:?})", stream.title, stream.duration);
        Ok(stream)
    }

    async fn expand_playlist(&self, url: &str) -> Result<Vec<String>, ResolutionError> {
        let mut cmd = self.command();
        cmd.args(["--flat-playlist", "--print", "%(id)s"]).arg(url);

        let stdout = self.run(cmd).await?;
        let prefix = if is_youtube_music(url) {
            YOUTUBE_MUSIC_WATCH
        } else {
            YOUTUBE_WATCH
        };
        let links = parse_playlist_ids(&stdout, prefix);

        if links.is_empty() {
            warn!("📋 Playlist sin contenido: {}", url);
        } else {
            info!("🎵 Playlist extraída con {} tracks", links.len());
        }
        Ok(links)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, ResolutionError> {
        info!("🔍 Buscando con yt-dlp: {}", query);

        let mut cmd = self.command();
        cmd.args([
            "--flat-playlist",
            "--skip-download",
            "--print",
            "%(id)s|%(duration)s|%(uploader)s|%(title)s",
        ])
        .arg(format!("ytsearch{}:{}", limit.clamp(1, 10), query));

        let stdout = self.run(cmd).await?;
        let results = parse_search_results(&stdout);
        debug!("🔍 {} resultados para: {}", results.len(), query);
        Ok(results)
    }

    fn is_playlist(&self, query: &str) -> bool {
        let Ok(url) = Url::parse(query.trim()) else {
            return false;
        };
        let is_youtube = url
            .host_str()
            .is_some_and(|host| host.ends_with("youtube.com") || host == "youtu.be");

        is_youtube
            && (url.path() == "/playlist" || url.query_pairs().any(|(key, _)| key == "list"))
    }
}

fn is_youtube_music(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h == "music.youtube.com"))
        .unwrap_or(false)
}

/// Tres líneas: título, duración en segundos (o `NA`) y URL del stream.
fn parse_resolved(stdout: &str) -> Option<StreamDescriptor> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let title = lines.next()?;
    let duration = lines.next()?;
    let stream_url = lines.next()?;

    if !stream_url.starts_with("http") {
        return None;
    }

    let stream = StreamDescriptor::new(stream_url, title);
    Some(match duration.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => {
            stream.with_duration(Duration::from_secs_f64(secs))
        }
        _ => stream,
    })
}

fn parse_playlist_ids(stdout: &str, prefix: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != "NA")
        .map(|id| format!("{}{}", prefix, id))
        .collect()
}

/// Una línea por resultado: `id|duración|autor|título`. El título va al
/// final porque puede traer `|`.
fn parse_search_results(stdout: &str) -> Vec<SearchResult> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().splitn(4, '|');
            let id = fields.next().filter(|id| !id.is_empty() && *id != "NA")?;
            let duration = fields.next()?;
            let uploader = fields.next()?;
            let title = fields.next()?.trim();

            Some(SearchResult {
                title: title.to_string(),
                url: format!("{}{}", YOUTUBE_WATCH, id),
                uploader: (uploader != "NA" && !uploader.is_empty()).then(|| uploader.to_string()),
                duration: duration
                    .parse::<f64>()
                    .ok()
                    .filter(|secs| secs.is_finite() && *secs > 0.0)
                    .map(Duration::from_secs_f64),
            })
        })
        .collect()
}

/// Busca archivo de cookies disponible
fn find_cookies_file() -> Option<String> {
    let cookies_paths = [
        format!(
            "{}/.config/yt-dlp/cookies.txt",
            std::env::var("HOME").unwrap_or_default()
        ),
        "/home/openmusic/.config/yt-dlp/cookies.txt".to_string(),
        "/app/.config/yt-dlp/cookies.txt".to_string(),
        "./cookies.txt".to_string(),
    ];

    let found = cookies_paths.into_iter().find(|path| Path::new(path).exists());
    match &found {
        Some(path) => info!("🍪 Cookies encontradas en: {}", path),
        None => warn!("🍪 No se encontraron cookies - algunas funcionalidades pueden estar limitadas"),
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_resolved_output() {
        let stdout = "Daft Punk - Around the World\n428.0\nhttps://rr3.googlevideo.com/videoplayback?expire=1900000000&x=1\n";
        let stream = parse_resolved(stdout).unwrap();

        assert_eq!(stream.title, "Daft Punk - Around the World");
        assert_eq!(stream.duration, Some(Duration::from_secs(428)));
        assert!(stream.expiry_hint.is_some());
    }

    #[test]
    fn test_parse_resolved_without_duration() {
        let stream = parse_resolved("Radio en vivo\nNA\nhttps://cdn.example.com/live\n").unwrap();
        assert_eq!(stream.duration, None);

        assert!(parse_resolved("").is_none());
        assert!(parse_resolved("Título\n12\nNA\n").is_none());
    }

    #[test]
    fn test_playlist_ids_become_watch_urls() {
        let links = parse_playlist_ids("abc123def45\n\nNA\nzyx987wvu65\n", YOUTUBE_MUSIC_WATCH);
        assert_eq!(
            links,
            vec![
                "https://music.youtube.com/watch?v=abc123def45".to_string(),
                "https://music.youtube.com/watch?v=zyx987wvu65".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_search_results() {
        let stdout = "dQw4w9WgXcQ|213.0|Rick Astley|Never Gonna Give You Up\n\
                      abc123def45|NA|NA|Live | Session\n\
                      NA|10|x|sin id\n";
        let results = parse_search_results(stdout);

        assert_eq!(
            results,
            vec![
                SearchResult {
                    title: "Never Gonna Give You Up".to_string(),
                    url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
                    uploader: Some("Rick Astley".to_string()),
                    duration: Some(Duration::from_secs(213)),
                },
                SearchResult {
                    title: "Live | Session".to_string(),
                    url: "https://www.youtube.com/watch?v=abc123def45".to_string(),
                    uploader: None,
                    duration: None,
                },
            ]
        );
        assert!(parse_search_results("").is_empty());
    }

    #[test]
    fn test_playlist_detection() {
        let resolver = YtDlpResolver {
            cookies: None,
            socket_timeout: Duration::from_secs(1),
        };

        assert!(resolver.is_playlist("https://www.youtube.com/playlist?list=PL123"));
        assert!(resolver.is_playlist("https://music.youtube.com/watch?v=abc&list=RDabc"));
        assert!(!resolver.is_playlist("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(!resolver.is_playlist("lofi playlist para estudiar"));
        assert!(!resolver.is_playlist("https://example.com/playlist"));
    }
}
