#![forbid(unsafe_code)]

//! Resolution of TikTok URLs into fetchable media links.
//!
//! The backend never talks to TikTok itself. A third-party extraction API
//! receives the page URL and answers with descriptive metadata plus a list of
//! downloadable variants; we pick one according to the requested format and
//! stream it to disk. Everything here is blocking `ureq` I/O, so callers on
//! the async runtime must go through `spawn_blocking`.

use std::{
    fs::File,
    io::{self, BufWriter},
    path::Path,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::jobs::MediaFormat;

/// Descriptive metadata returned alongside a resolved media link.
#[derive(Clone, Debug, Default)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration_seconds: Option<u64>,
    pub thumbnail: Option<String>,
}

/// A fetchable media URL plus whatever metadata the upstream offered.
#[derive(Clone, Debug)]
pub struct ResolvedMedia {
    pub media_url: String,
    pub metadata: MediaMetadata,
}

/// Seam between the orchestrator and the extraction mechanism. Production
/// uses [`RapidApiResolver`]; tests substitute a stub.
pub trait MediaResolver: Send + Sync {
    /// Resolves a TikTok page URL into a downloadable variant for `format`.
    fn resolve(&self, url: &str, format: MediaFormat) -> Result<ResolvedMedia>;

    /// Streams the resolved media URL into `dest` and returns the byte count.
    fn fetch(&self, media_url: &str, dest: &Path) -> Result<u64>;

    /// Fetches preview metadata without committing to a download.
    fn preview(&self, url: &str) -> Result<MediaMetadata>;
}

/// Accepts the URL shapes TikTok hands out: the full www host and the short
/// share host. Anything else is rejected before a job ever exists.
pub fn is_tiktok_url(url: &str) -> bool {
    let rest = if let Some(rest) = url.strip_prefix("https://") {
        rest
    } else if let Some(rest) = url.strip_prefix("http://") {
        rest
    } else {
        return false;
    };

    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = host.to_ascii_lowercase();
    matches!(
        host.as_str(),
        "tiktok.com" | "www.tiktok.com" | "vm.tiktok.com"
    )
}

/// Upstream response shape. Only the fields we read are listed; the API
/// returns plenty more that we ignore.
#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    success: bool,
    title: Option<String>,
    author: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    links: Vec<VariantLink>,
}

#[derive(Debug, Deserialize)]
struct VariantLink {
    #[serde(default)]
    quality: String,
    link: Option<String>,
    #[serde(rename = "renderLink")]
    render_link: Option<String>,
}

/// Picks the variant to download for the requested format.
///
/// Video prefers the HD original, then plain HD, then any video variant.
/// Audio prefers the dedicated audio link (or its render link) and falls back
/// to the combined video when the post carries no separate audio stream.
fn pick_media_link(links: &[VariantLink], format: MediaFormat) -> Option<String> {
    let best_video = || {
        links
            .iter()
            .find(|link| link.quality == "video_hd_original")
            .or_else(|| links.iter().find(|link| link.quality == "video_hd"))
            .or_else(|| links.iter().find(|link| link.quality.contains("video")))
            .and_then(|link| link.link.clone())
    };

    match format {
        MediaFormat::Video => best_video(),
        MediaFormat::Audio => links
            .iter()
            .find(|link| link.quality == "audio")
            .and_then(|link| link.link.clone().or_else(|| link.render_link.clone()))
            .or_else(best_video),
    }
}

fn metadata_from_payload(payload: &ExtractionPayload) -> MediaMetadata {
    MediaMetadata {
        title: payload.title.clone(),
        author: payload.author.clone(),
        duration_seconds: payload.duration.map(|seconds| seconds.max(0.0) as u64),
        thumbnail: payload.thumbnail.clone(),
    }
}

/// Percent-encodes a query component. RFC 3986 unreserved characters pass
/// through untouched.
fn encode_query_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Resolver backed by the hosted social-media extraction API.
pub struct RapidApiResolver {
    agent: ureq::Agent,
    api_host: String,
    api_key: String,
}

impl RapidApiResolver {
    pub fn new(api_host: String, api_key: String) -> Self {
        Self {
            agent: ureq::agent(),
            api_host,
            api_key,
        }
    }

    fn request_payload(&self, url: &str) -> Result<ExtractionPayload> {
        let endpoint = format!(
            "https://{}/smvd/get/tiktok?url={}",
            self.api_host,
            encode_query_component(url)
        );
        let response = self
            .agent
            .get(&endpoint)
            .set("x-rapidapi-host", &self.api_host)
            .set("x-rapidapi-key", &self.api_key)
            .call()
            .context("calling extraction API")?;

        let payload: ExtractionPayload = response
            .into_json()
            .context("parsing extraction API response")?;
        if !payload.success {
            bail!("extraction API reported failure for {url}");
        }
        Ok(payload)
    }
}

impl MediaResolver for RapidApiResolver {
    fn resolve(&self, url: &str, format: MediaFormat) -> Result<ResolvedMedia> {
        let payload = self.request_payload(url)?;
        if payload.links.is_empty() {
            bail!("extraction API returned no media links");
        }
        let media_url = pick_media_link(&payload.links, format)
            .with_context(|| format!("no {} variant available", format.as_str()))?;

        Ok(ResolvedMedia {
            media_url,
            metadata: metadata_from_payload(&payload),
        })
    }

    fn fetch(&self, media_url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .agent
            .get(media_url)
            .call()
            .context("fetching resolved media")?;

        // Bytes are copied straight from the socket into the file; the whole
        // payload is never held in memory.
        let mut reader = response.into_reader();
        let file = File::create(dest)
            .with_context(|| format!("creating {}", dest.display()))?;
        let mut writer = BufWriter::new(file);
        let written = io::copy(&mut reader, &mut writer)
            .with_context(|| format!("writing {}", dest.display()))?;
        writer
            .into_inner()
            .map_err(|err| err.into_error())
            .and_then(|file| file.sync_all())
            .with_context(|| format!("flushing {}", dest.display()))?;
        Ok(written)
    }

    fn preview(&self, url: &str) -> Result<MediaMetadata> {
        let payload = self.request_payload(url)?;
        Ok(metadata_from_payload(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links_from_json(raw: &str) -> Vec<VariantLink> {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn accepts_tiktok_urls() {
        assert!(is_tiktok_url("https://www.tiktok.com/@user/video/123"));
        assert!(is_tiktok_url("https://tiktok.com/@user/video/123"));
        assert!(is_tiktok_url("https://vm.tiktok.com/ZMabcdef/"));
        assert!(is_tiktok_url("http://www.tiktok.com/@user/video/123"));
        assert!(is_tiktok_url("https://WWW.TikTok.com/@user/video/123"));
    }

    #[test]
    fn rejects_foreign_urls() {
        assert!(!is_tiktok_url("https://example.com/x"));
        assert!(!is_tiktok_url("https://nottiktok.com/@user/video/123"));
        assert!(!is_tiktok_url("https://tiktok.com.evil.net/video"));
        assert!(!is_tiktok_url("ftp://www.tiktok.com/@user"));
        assert!(!is_tiktok_url("www.tiktok.com/@user/video/123"));
        assert!(!is_tiktok_url(""));
    }

    #[test]
    fn video_prefers_hd_original() {
        let links = links_from_json(
            r#"[
                {"quality": "video_sd", "link": "https://cdn.test/sd"},
                {"quality": "video_hd", "link": "https://cdn.test/hd"},
                {"quality": "video_hd_original", "link": "https://cdn.test/orig"},
                {"quality": "audio", "link": "https://cdn.test/audio"}
            ]"#,
        );
        assert_eq!(
            pick_media_link(&links, MediaFormat::Video).as_deref(),
            Some("https://cdn.test/orig")
        );
    }

    #[test]
    fn video_falls_back_through_qualities() {
        let links = links_from_json(
            r#"[
                {"quality": "audio", "link": "https://cdn.test/audio"},
                {"quality": "video_sd_watermark", "link": "https://cdn.test/sd"}
            ]"#,
        );
        assert_eq!(
            pick_media_link(&links, MediaFormat::Video).as_deref(),
            Some("https://cdn.test/sd")
        );
    }

    #[test]
    fn audio_prefers_dedicated_track() {
        let links = links_from_json(
            r#"[
                {"quality": "video_hd", "link": "https://cdn.test/hd"},
                {"quality": "audio", "link": "https://cdn.test/audio"}
            ]"#,
        );
        assert_eq!(
            pick_media_link(&links, MediaFormat::Audio).as_deref(),
            Some("https://cdn.test/audio")
        );
    }

    #[test]
    fn audio_uses_render_link_when_direct_link_missing() {
        let links = links_from_json(
            r#"[
                {"quality": "audio", "renderLink": "https://cdn.test/render"}
            ]"#,
        );
        assert_eq!(
            pick_media_link(&links, MediaFormat::Audio).as_deref(),
            Some("https://cdn.test/render")
        );
    }

    #[test]
    fn audio_falls_back_to_video_variant() {
        let links = links_from_json(
            r#"[
                {"quality": "video_hd", "link": "https://cdn.test/hd"}
            ]"#,
        );
        assert_eq!(
            pick_media_link(&links, MediaFormat::Audio).as_deref(),
            Some("https://cdn.test/hd")
        );
    }

    #[test]
    fn no_matching_variant_is_none() {
        let links = links_from_json(r#"[{"quality": "thumbnail", "link": "https://cdn.test/t"}]"#);
        assert!(pick_media_link(&links, MediaFormat::Video).is_none());
    }

    #[test]
    fn payload_parses_metadata() {
        let payload: ExtractionPayload = serde_json::from_str(
            r#"{
                "success": true,
                "title": "Dance clip",
                "author": "creator",
                "duration": 14.7,
                "thumbnail": "https://cdn.test/thumb.jpg",
                "links": []
            }"#,
        )
        .unwrap();
        let metadata = metadata_from_payload(&payload);
        assert_eq!(metadata.title.as_deref(), Some("Dance clip"));
        assert_eq!(metadata.author.as_deref(), Some("creator"));
        assert_eq!(metadata.duration_seconds, Some(14));
        assert_eq!(metadata.thumbnail.as_deref(), Some("https://cdn.test/thumb.jpg"));
    }

    #[test]
    fn query_component_encoding() {
        assert_eq!(
            encode_query_component("https://www.tiktok.com/@user/video/123?x=1"),
            "https%3A%2F%2Fwww.tiktok.com%2F%40user%2Fvideo%2F123%3Fx%3D1"
        );
        assert_eq!(encode_query_component("plain-text_1.0~ok"), "plain-text_1.0~ok");
    }
}
