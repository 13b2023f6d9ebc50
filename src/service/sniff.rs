//! Content-type detection from leading bytes and from file extensions

use std::collections::HashMap;
use std::path::Path;

use lazy_static::lazy_static;

use crate::error::{VaultError, VaultResult};

/// Number of leading bytes examined when sniffing
pub const SNIFF_LEN: usize = 512;

pub const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain";
const ZIP: &str = "application/zip";

lazy_static! {
    static ref EXTENSION_TYPES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("txt", "text/plain");
        m.insert("log", "text/plain");
        m.insert("md", "text/markdown");
        m.insert("csv", "text/csv");
        m.insert("html", "text/html");
        m.insert("htm", "text/html");
        m.insert("css", "text/css");
        m.insert("js", "text/javascript");
        m.insert("xml", "text/xml");
        m.insert("json", "application/json");
        m.insert("svg", "image/svg+xml");
        m.insert("pdf", "application/pdf");
        m.insert("png", "image/png");
        m.insert("jpg", "image/jpeg");
        m.insert("jpeg", "image/jpeg");
        m.insert("gif", "image/gif");
        m.insert("webp", "image/webp");
        m.insert("bmp", "image/bmp");
        m.insert("zip", "application/zip");
        m.insert("gz", "application/gzip");
        m.insert("mp3", "audio/mpeg");
        m.insert("ogg", "application/ogg");
        m.insert("wav", "audio/wav");
        m.insert("mp4", "video/mp4");
        m.insert("webm", "video/webm");
        m.insert("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document");
        m.insert("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet");
        m.insert("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation");
        m.insert("odt", "application/vnd.oasis.opendocument.text");
        m.insert("epub", "application/epub+zip");
        m.insert("jar", "application/java-archive");
        m
    };
}

/// Types whose payload is a zip archive and therefore sniffs as one
const ZIP_CONTAINERS: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.oasis.opendocument.text",
    "application/epub+zip",
    "application/java-archive",
];

/// Textual types that carry no magic number of their own
const TEXTUAL: &[&str] = &["application/json", "image/svg+xml"];

const HTML_PREFIXES: &[&[u8]] = &[
    b"<!doctype html",
    b"<html",
    b"<head",
    b"<body",
    b"<script",
    b"<title",
    b"<!--",
];

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

/// Detect the media type of `head`, the first bytes of a payload.
/// Always returns a type; unrecognized binary data is `application/octet-stream`.
pub fn sniff(head: &[u8]) -> &'static str {
    let head = &head[..head.len().min(SNIFF_LEN)];

    if head.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if head.starts_with(b"\xFF\xD8\xFF") {
        return "image/jpeg";
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") {
        match &head[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wav",
            _ => {}
        }
    }
    if head.starts_with(b"BM") && head.len() >= 14 {
        return "image/bmp";
    }
    if head.starts_with(b"PK\x03\x04") {
        return ZIP;
    }
    if head.starts_with(b"\x1F\x8B\x08") {
        return "application/gzip";
    }
    if head.starts_with(b"ID3") {
        return "audio/mpeg";
    }
    if head.starts_with(b"OggS\x00") {
        return "application/ogg";
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return "video/mp4";
    }
    if head.starts_with(b"\x1A\x45\xDF\xA3") {
        return "video/webm";
    }

    if head.starts_with(b"\xEF\xBB\xBF")
        || head.starts_with(b"\xFE\xFF")
        || head.starts_with(b"\xFF\xFE")
    {
        return TEXT_PLAIN;
    }

    let trimmed = match head.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &head[start..],
        None => &head[head.len()..],
    };
    if HTML_PREFIXES.iter().any(|p| starts_with_ignore_case(trimmed, p)) {
        return "text/html";
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml";
    }

    if head.iter().any(|&b| is_binary_byte(b)) {
        OCTET_STREAM
    } else {
        TEXT_PLAIN
    }
}

/// Media type implied by the extension of `filename`, if known
pub fn type_for_extension(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
    EXTENSION_TYPES.get(ext.as_str()).copied()
}

/// Whether content sniffed as `sniffed` may carry an extension implying `declared`
pub fn is_compatible(declared: &str, sniffed: &str) -> bool {
    if declared == sniffed {
        return true;
    }
    if sniffed == TEXT_PLAIN && (declared.starts_with("text/") || TEXTUAL.contains(&declared)) {
        return true;
    }
    if sniffed == "text/xml" && declared == "image/svg+xml" {
        return true;
    }
    sniffed == ZIP && ZIP_CONTAINERS.contains(&declared)
}

/// Decide the stored media type for an upload. A sniffed type that
/// contradicts the extension is rejected, as is a type outside a non-empty
/// allow list.
pub fn resolve_type(filename: &str, head: &[u8], allowed: &[String]) -> VaultResult<String> {
    let sniffed = sniff(head);
    let resolved = match type_for_extension(filename) {
        Some(declared) if is_compatible(declared, sniffed) => declared,
        Some(declared) => {
            return Err(VaultError::Validation(format!(
                "content of {} looks like {} but its extension implies {}",
                filename, sniffed, declared
            )))
        }
        None => sniffed,
    };

    if !allowed.is_empty() && !allowed.iter().any(|t| t == resolved || t == sniffed) {
        return Err(VaultError::Validation(format!("file type {} is not allowed", resolved)));
    }
    Ok(resolved.to_string())
}
