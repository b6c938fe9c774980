//! E-book cover discovery.
//!
//! EPUB archives declare their cover in the OPF package manifest, but plenty
//! of real files don't. Discovery runs in priority order: the manifest's
//! declared cover item, then conventional cover filenames, then any archive
//! entry whose name contains "cover" with an image extension. The first
//! candidate that actually decodes as an image wins.
//!
//! Everything here is synchronous; callers run it on a blocking worker.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::io::{Cursor, Read};
use tracing::debug;
use zip::ZipArchive;

const CONVENTIONAL_COVER_NAMES: [&str; 4] =
    ["cover.jpg", "cover.jpeg", "cover.png", "cover.webp"];

const IMAGE_EXTENSIONS: [&str; 6] = [".jpg", ".jpeg", ".png", ".webp", ".gif", ".bmp"];

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// Extract the cover image bytes from an EPUB archive, if any.
pub fn extract_cover(data: &[u8]) -> Option<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(data)).ok()?;

    let mut candidates: Vec<String> = Vec::new();
    if let Some(declared) = manifest_cover_href(&mut archive) {
        candidates.push(declared);
    }

    let names: Vec<String> = archive.file_names().map(String::from).collect();
    for conventional in CONVENTIONAL_COVER_NAMES {
        let suffix = format!("/{conventional}");
        for name in &names {
            let lower = name.to_ascii_lowercase();
            if lower == conventional || lower.ends_with(&suffix) {
                candidates.push(name.clone());
            }
        }
    }
    for name in &names {
        let lower = name.to_ascii_lowercase();
        if lower.contains("cover") && IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            candidates.push(name.clone());
        }
    }

    candidates.dedup();
    for candidate in candidates {
        let Some(bytes) = read_entry(&mut archive, &candidate) else {
            continue;
        };
        if image::load_from_memory(&bytes).is_ok() {
            debug!(entry = %candidate, "cover candidate accepted");
            return Some(bytes);
        }
        debug!(entry = %candidate, "cover candidate did not decode, trying next");
    }
    None
}

/// Follow container.xml to the OPF package document and pull the declared
/// cover item's href, resolved relative to the OPF location.
fn manifest_cover_href(archive: &mut Archive<'_>) -> Option<String> {
    let container = read_entry_string(archive, "META-INF/container.xml")?;
    let opf_path = find_rootfile(&container)?;
    let opf = read_entry_string(archive, &opf_path)?;
    let href = find_cover_in_opf(&opf)?;

    let base_dir = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    Some(resolve_relative(base_dir, &href))
}

fn find_rootfile(container_xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(container_xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(event)) | Ok(Event::Empty(event)) => {
                if event.local_name().as_ref() == b"rootfile"
                    && let Some(path) = attr_value(&event, b"full-path")
                {
                    return Some(path);
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Scan an OPF document for the cover item: an EPUB 3 `cover-image` property
/// wins, then the EPUB 2 `<meta name="cover">` id reference.
fn find_cover_in_opf(opf_xml: &str) -> Option<String> {
    struct ManifestItem {
        id: Option<String>,
        href: Option<String>,
        properties: Option<String>,
    }

    let mut items: Vec<ManifestItem> = Vec::new();
    let mut cover_meta_id: Option<String> = None;

    let mut reader = Reader::from_str(opf_xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(event)) | Ok(Event::Empty(event)) => {
                match event.local_name().as_ref() {
                    b"item" => items.push(ManifestItem {
                        id: attr_value(&event, b"id"),
                        href: attr_value(&event, b"href"),
                        properties: attr_value(&event, b"properties"),
                    }),
                    b"meta" => {
                        if attr_value(&event, b"name").as_deref() == Some("cover") {
                            cover_meta_id = attr_value(&event, b"content");
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    if let Some(item) = items.iter().find(|item| {
        item.properties
            .as_deref()
            .is_some_and(|props| props.split_whitespace().any(|p| p == "cover-image"))
    }) {
        return item.href.clone();
    }

    let cover_id = cover_meta_id?;
    items
        .iter()
        .find(|item| item.id.as_deref() == Some(cover_id.as_str()))
        .and_then(|item| item.href.clone())
}

fn attr_value(event: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    event
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.into_owned())
}

/// Lexically join `href` onto `base_dir`, resolving `..` segments.
fn resolve_relative(base_dir: &str, href: &str) -> String {
    let mut parts: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Option<Vec<u8>> {
    let mut file = archive.by_name(name).ok()?;
    let mut buf = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buf).ok()?;
    Some(buf)
}

fn read_entry_string(archive: &mut Archive<'_>, name: &str) -> Option<String> {
    read_entry(archive, name).and_then(|bytes| String::from_utf8(bytes).ok())
}
