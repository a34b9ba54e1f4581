//! Binary format detection.
//!
//! Magic bytes are trusted first, the declared content type second and the
//! reference's file extension last. Each format maps to one canonical
//! extension.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Svg,
    Pdf,
    Unknown,
}

impl AssetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AssetFormat::Png => "png",
            AssetFormat::Jpeg => "jpg",
            AssetFormat::Gif => "gif",
            AssetFormat::Webp => "webp",
            AssetFormat::Svg => "svg",
            AssetFormat::Pdf => "pdf",
            AssetFormat::Unknown => "bin",
        }
    }

    /// Raster formats that survive decode, resize and re-encode without
    /// losing animation, vectors or unsupported features.
    pub fn is_reencodable(self) -> bool {
        matches!(self, AssetFormat::Png | AssetFormat::Jpeg)
    }

    pub fn from_magic(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(AssetFormat::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(AssetFormat::Jpeg);
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some(AssetFormat::Gif);
        }
        if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(AssetFormat::Webp);
        }
        if bytes.starts_with(b"%PDF-") {
            return Some(AssetFormat::Pdf);
        }
        if looks_like_svg(bytes) {
            return Some(AssetFormat::Svg);
        }
        None
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "image/png" => Some(AssetFormat::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(AssetFormat::Jpeg),
            "image/gif" => Some(AssetFormat::Gif),
            "image/webp" => Some(AssetFormat::Webp),
            "image/svg+xml" => Some(AssetFormat::Svg),
            "application/pdf" => Some(AssetFormat::Pdf),
            _ => None,
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "png" => Some(AssetFormat::Png),
            "jpg" | "jpeg" | "jpe" => Some(AssetFormat::Jpeg),
            "gif" => Some(AssetFormat::Gif),
            "webp" => Some(AssetFormat::Webp),
            "svg" => Some(AssetFormat::Svg),
            "pdf" => Some(AssetFormat::Pdf),
            _ => None,
        }
    }
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}

/// Extension of the last path segment of `reference`, ignoring query and fragment.
fn reference_extension(reference: &str) -> Option<String> {
    let url = reqwest::Url::parse(reference).ok()?;
    let last = url.path_segments()?.next_back()?.to_string();
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_string())
}

pub fn detect_format(bytes: &[u8], content_type: Option<&str>, reference: &str) -> AssetFormat {
    AssetFormat::from_magic(bytes)
        .or_else(|| content_type.and_then(AssetFormat::from_content_type))
        .or_else(|| reference_extension(reference).and_then(|e| AssetFormat::from_extension(&e)))
        .unwrap_or(AssetFormat::Unknown)
}
