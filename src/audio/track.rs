use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::LazyLock,
    time::Duration,
};
use url::Url;

static YOUTUBE_VIDEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("regex de video ID válida"));

/// Identidad normalizada de una referencia.
///
/// Dos referencias con la misma identidad son el mismo track para la lista
/// negra, aunque el usuario las haya escrito distinto (`youtu.be/x` vs
/// `www.youtube.com/watch?v=x`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackIdentity(String);

impl TrackIdentity {
    pub fn from_query(query: &str) -> Self {
        let trimmed = query.trim();

        match Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::from_url(&url),
            _ => {
                let words: Vec<&str> = trimmed.split_whitespace().collect();
                Self(format!("search:{}", words.join(" ").to_lowercase()))
            }
        }
    }

    fn from_url(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default();
        let host = host.strip_prefix("www.").unwrap_or(host);

        if let Some(video_id) = youtube_video_id(host, url) {
            return Self(format!("youtube:{}", video_id));
        }

        let path = url.path().trim_end_matches('/');
        match url.query() {
            Some(query) => Self(format!("{}{}?{}", host, path, query)),
            None => Self(format!("{}{}", host, path)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn youtube_video_id(host: &str, url: &Url) -> Option<String> {
    let candidate = match host {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        "youtube.com" | "m.youtube.com" | "music.youtube.com" => {
            if url.path() == "/watch" {
                url.query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned())
            } else {
                let mut segments = url.path_segments()?;
                match segments.next() {
                    Some("shorts") | Some("embed") | Some("live") => {
                        segments.next().map(str::to_string)
                    }
                    _ => None,
                }
            }
        }
        _ => None,
    }?;

    YOUTUBE_VIDEO_ID.is_match(&candidate).then_some(candidate)
}

/// Referencia a un track todavía sin resolver.
///
/// Inmutable una vez encolada. La igualdad es por [`TrackIdentity`], no por
/// quién la pidió ni cuándo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRef {
    query: String,
    requested_by: UserId,
    enqueued_at: DateTime<Utc>,
}

impl TrackRef {
    pub fn new(query: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            query: query.into().trim().to_string(),
            requested_by,
            enqueued_at: Utc::now(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn identity(&self) -> TrackIdentity {
        TrackIdentity::from_query(&self.query)
    }

    pub fn is_url(&self) -> bool {
        self.query.starts_with("http://") || self.query.starts_with("https://")
    }
}

impl PartialEq for TrackRef {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for TrackRef {}

impl Hash for TrackRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for TrackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query)
    }
}

/// Stream reproducible devuelto por el extractor.
///
/// Las URLs de stream caducan en pocas horas, por eso nunca se persisten.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub stream_url: String,
    pub title: String,
    pub duration: Option<Duration>,
    pub expiry_hint: Option<DateTime<Utc>>,
}

impl StreamDescriptor {
    pub fn new(stream_url: impl Into<String>, title: impl Into<String>) -> Self {
        let stream_url = stream_url.into();
        let expiry_hint = expiry_from_url(&stream_url);

        Self {
            stream_url,
            title: title.into(),
            duration: None,
            expiry_hint,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_hint.is_some_and(|expiry| expiry <= now)
    }
}

/// Las URLs de googlevideo llevan `expire=<unix>` en la query.
fn expiry_from_url(stream_url: &str) -> Option<DateTime<Utc>> {
    let url = Url::parse(stream_url).ok()?;
    let expire = url
        .query_pairs()
        .find(|(key, _)| key == "expire")
        .and_then(|(_, value)| value.parse::<i64>().ok())?;

    Utc.timestamp_opt(expire, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new(42)
    }

    #[test]
    fn test_youtube_variants_share_identity() {
        let canonical = TrackIdentity::from_query("https://www.youtube.com/watch?v=dQw4w9WgXcQ");

        assert_eq!(canonical.as_str(), "youtube:dQw4w9WgXcQ");
        assert_eq!(TrackIdentity::from_query("https://youtu.be/dQw4w9WgXcQ"), canonical);
        assert_eq!(
            TrackIdentity::from_query("https://music.youtube.com/watch?v=dQw4w9WgXcQ&list=RD"),
            canonical
        );
        assert_eq!(
            TrackIdentity::from_query("  https://youtube.com/shorts/dQw4w9WgXcQ "),
            canonical
        );
    }

    #[test]
    fn test_generic_urls_drop_www_and_trailing_slash() {
        assert_eq!(
            TrackIdentity::from_query("https://WWW.Example.com/song.mp3/").as_str(),
            "example.com/song.mp3"
        );
        assert_eq!(
            TrackIdentity::from_query("https://example.com/a?b=1#frag").as_str(),
            "example.com/a?b=1"
        );
    }

    #[test]
    fn test_search_queries_are_case_and_space_insensitive() {
        let a = TrackRef::new("Never  Gonna Give   You Up", user());
        let b = TrackRef::new("never gonna give you up", UserId::new(7));

        assert_eq!(a, b);
        assert_eq!(a.identity().as_str(), "search:never gonna give you up");
        assert!(!a.is_url());
    }

    #[test]
    fn test_playlist_url_is_not_a_video() {
        let identity =
            TrackIdentity::from_query("https://www.youtube.com/playlist?list=PL1234567890");
        assert_eq!(identity.as_str(), "youtube.com/playlist?list=PL1234567890");
    }

    #[test]
    fn test_expiry_hint_parsed_from_googlevideo_url() {
        let stream = StreamDescriptor::new(
            "https://rr1.googlevideo.com/videoplayback?expire=1700000000&id=abc",
            "Song",
        );
        let expiry = Utc.timestamp_opt(1_700_000_000, 0).single();

        assert_eq!(stream.expiry_hint, expiry);
        assert!(stream.is_expired(Utc::now()));
        assert!(!StreamDescriptor::new("https://cdn.example.com/a.mp3", "A").is_expired(Utc::now()));
    }
}
