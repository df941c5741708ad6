//! Media attachments declared with `imeta` tags (NIP-92).
//!
//! An `imeta` tag carries space-delimited `key value` entries:
//! `["imeta", "url https://...", "m image/jpeg", "dim 640x480", "x <sha256>"]`.
//! Classification works on the parsed entries, preferring the declared MIME
//! type and falling back to the URL's file extension.

/// Broad class of a media attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Image,
    Video,
    Audio,
    Other,
}

/// One parsed `imeta` tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaAttachment {
    pub url: String,
    pub mime_type: Option<String>,
    pub dimensions: Option<(u32, u32)>,
    pub sha256: Option<String>,
    pub blurhash: Option<String>,
    pub alt: Option<String>,
    pub fallbacks: Vec<String>,
}

impl MediaAttachment {
    /// Parse an `imeta` tag. Returns `None` when the tag is not `imeta` or has
    /// no `url` entry.
    pub fn from_tag(tag: &[String]) -> Option<Self> {
        let (name, entries) = tag.split_first()?;
        if name != "imeta" {
            return None;
        }

        let mut attachment = MediaAttachment::default();
        for entry in entries {
            let Some((key, value)) = entry.split_once(' ') else {
                continue;
            };
            let value = value.trim();
            match key {
                "url" => attachment.url = value.to_string(),
                "m" => attachment.mime_type = Some(value.to_ascii_lowercase()),
                "dim" => attachment.dimensions = parse_dimensions(value),
                "x" => attachment.sha256 = Some(value.to_string()),
                "blurhash" => attachment.blurhash = Some(value.to_string()),
                "alt" => attachment.alt = Some(value.to_string()),
                "fallback" => attachment.fallbacks.push(value.to_string()),
                _ => {}
            }
        }

        (!attachment.url.is_empty()).then_some(attachment)
    }

    pub fn class(&self) -> MediaClass {
        match self.mime_type.as_deref() {
            Some(mime) => class_from_mime(mime),
            None => class_from_url(&self.url),
        }
    }
}

/// Parse every `imeta` tag of an event's tag list.
pub fn media_attachments(tags: &[Vec<String>]) -> Vec<MediaAttachment> {
    tags.iter()
        .filter_map(|tag| MediaAttachment::from_tag(tag))
        .collect()
}

fn parse_dimensions(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Classify a MIME type such as `video/mp4`.
pub fn class_from_mime(mime: &str) -> MediaClass {
    match mime.split('/').next() {
        Some("image") => MediaClass::Image,
        Some("video") => MediaClass::Video,
        Some("audio") => MediaClass::Audio,
        _ => MediaClass::Other,
    }
}

/// Classify a URL by the extension of its path, ignoring query and fragment.
pub fn class_from_url(url: &str) -> MediaClass {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or_default();
    let Some((_, ext)) = file.rsplit_once('.') else {
        return MediaClass::Other;
    };

    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif" | "apng" | "svg" => MediaClass::Image,
        "mp4" | "webm" | "mov" | "m4v" | "m3u8" | "ogv" => MediaClass::Video,
        "mp3" | "ogg" | "wav" | "flac" | "m4a" | "aac" => MediaClass::Audio,
        _ => MediaClass::Other,
    }
}
