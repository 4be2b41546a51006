use anyhow::{Result, anyhow};
use std::path::Path;

pub const PDF_MIME: &str = "application/pdf";
pub const JPEG_MIME: &str = "image/jpeg";
pub const PNG_MIME: &str = "image/png";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Image,
}

/// Sniffs the bytes first and falls back to the file extension.
pub fn resolve_mime(bytes: &[u8], path: Option<&Path>) -> Result<String> {
    if let Some(detected) = sniff_mime(bytes) {
        return Ok(detected.to_string());
    }
    if let Some(mime) = extension_lower(path).and_then(|ext| mime_from_extension(&ext)) {
        return Ok(mime.to_string());
    }
    Err(anyhow!(
        "unsupported file type for '{}' (expected pdf or image)",
        path.map(|value| value.display().to_string())
            .unwrap_or_else(|| "input".to_string())
    ))
}

pub fn source_kind(mime: &str) -> Option<SourceKind> {
    if mime == PDF_MIME {
        Some(SourceKind::Pdf)
    } else if mime.starts_with("image/") {
        Some(SourceKind::Image)
    } else {
        None
    }
}

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    let kind = infer::get(bytes)?;
    let detected = kind.mime_type();
    if detected == PDF_MIME || detected.starts_with("image/") {
        Some(detected)
    } else {
        None
    }
}

fn extension_lower(path: Option<&Path>) -> Option<String> {
    path.and_then(|path| path.extension())
        .and_then(|value| value.to_str())
        .map(|value| value.to_lowercase())
}

fn mime_from_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "pdf" => Some(PDF_MIME),
        "png" => Some(PNG_MIME),
        "jpg" | "jpeg" => Some(JPEG_MIME),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tiff" | "tif" => Some("image/tiff"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[test]
    fn sniffs_magic_bytes_before_extension() {
        let mime = resolve_mime(PNG_HEADER, Some(Path::new("scan.pdf"))).unwrap();
        assert_eq!(mime, PNG_MIME);
        let mime = resolve_mime(b"%PDF-1.7\n", None).unwrap();
        assert_eq!(mime, PDF_MIME);
    }

    #[test]
    fn falls_back_to_extension() {
        let mime = resolve_mime(b"not magic", Some(Path::new("page.JPG"))).unwrap();
        assert_eq!(mime, JPEG_MIME);
        assert!(resolve_mime(b"plain text", Some(Path::new("notes.txt"))).is_err());
    }

    #[test]
    fn classifies_source_kind() {
        assert_eq!(source_kind(PDF_MIME), Some(SourceKind::Pdf));
        assert_eq!(source_kind("image/webp"), Some(SourceKind::Image));
        assert_eq!(source_kind("text/plain"), None);
    }
}
