//! EPUB package model: container lookup, OPF manifest/spine, resource files.
//!
//! A [`DocumentPackage`] is parsed once from an archive buffer, mutated by
//! the optimizer stages and turned back into [`ArchiveEntry`]s. The OPF text
//! is only rewritten when the manifest actually changed; the rewrite splices
//! the original document (removing `<item>` elements and appending new ones
//! before `</manifest>`) so everything else in it survives byte for byte.

use crate::archive::{read_zip_entries, ArchiveEntry};
use crate::error::OptimizationError;
use crate::output::BookMetadata;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const CONTAINER_PATH: &str = "META-INF/container.xml";
const MIMETYPE_PATH: &str = "mimetype";
const EPUB_MIMETYPE: &[u8] = b"application/epub+zip";

const FONT_EXTENSIONS: &[&str] = &["ttf", "otf", "woff", "woff2", "eot"];

fn extension_of(href: &str) -> String {
    let path = strip_fragment(href);
    let file = path.rsplit('/').next().unwrap_or(path);
    file.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Archive path with a font file extension.
pub fn is_font_path(path: &str) -> bool {
    FONT_EXTENSIONS.contains(&extension_of(path).as_str())
}

/// Archive path with a `.css` extension.
pub fn is_stylesheet_path(path: &str) -> bool {
    extension_of(path) == "css"
}

/// One `<item>` of the OPF manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    /// Href as written in the OPF, relative to the OPF directory.
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

impl ManifestItem {
    pub fn new(id: impl Into<String>, href: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            href: href.into(),
            media_type: media_type.into(),
            properties: None,
        }
    }

    /// Embedded font, by media type or file extension.
    pub fn is_font(&self) -> bool {
        self.media_type.to_ascii_lowercase().contains("font")
            || is_font_path(&self.href)
    }

    pub fn is_stylesheet(&self) -> bool {
        self.media_type.eq_ignore_ascii_case("text/css") || is_stylesheet_path(&self.href)
    }

    pub fn is_raster_image(&self) -> bool {
        let mt = self.media_type.to_ascii_lowercase();
        mt.starts_with("image/") && mt != "image/svg+xml"
    }

    pub fn is_content_document(&self) -> bool {
        let mt = self.media_type.to_ascii_lowercase();
        mt == "application/xhtml+xml" || mt == "text/html"
    }
}

/// A parsed EPUB, owned by one optimizer run.
#[derive(Debug, Clone)]
pub struct DocumentPackage {
    opf_path: String,
    opf_dir: String,
    opf_source: String,
    metadata: BookMetadata,
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
    mimetype: Vec<u8>,
    /// Every archive file except `mimetype`, keyed by full path.
    files: BTreeMap<String, Vec<u8>>,
    original_ids: BTreeSet<String>,
    manifest_changed: bool,
}

impl DocumentPackage {
    /// Parse a zip buffer into a package.
    pub fn parse(bytes: &[u8]) -> Result<Self, OptimizationError> {
        let entries = read_zip_entries(bytes).map_err(OptimizationError::MalformedPackage)?;

        let mut mimetype = EPUB_MIMETYPE.to_vec();
        let mut files = BTreeMap::new();
        for (name, data) in entries {
            if name == MIMETYPE_PATH {
                mimetype = data;
            } else {
                files.insert(name, data);
            }
        }

        let opf_path = files
            .get(CONTAINER_PATH)
            .and_then(|data| find_opf_path(data))
            .filter(|path| files.contains_key(path))
            .or_else(|| files.keys().find(|k| k.ends_with(".opf")).cloned())
            .ok_or(OptimizationError::MissingPackageDocument)?;
        let opf_dir = parent_dir(&opf_path).to_string();

        let raw = files
            .get(&opf_path)
            .ok_or(OptimizationError::MissingPackageDocument)?;
        let opf_source = String::from_utf8(raw.clone())
            .map_err(|e| OptimizationError::MalformedPackage(format!("{opf_path}: {e}")))?;

        let opf = parse_opf(&opf_source)
            .map_err(|e| OptimizationError::MalformedPackage(format!("{opf_path}: {e}")))?;
        debug!(
            "Package {}: {} manifest items, {} spine entries",
            opf_path,
            opf.manifest.len(),
            opf.spine.len()
        );

        Ok(Self {
            original_ids: opf.manifest.iter().map(|i| i.id.clone()).collect(),
            opf_path,
            opf_dir,
            opf_source,
            metadata: opf.metadata,
            manifest: opf.manifest,
            spine: opf.spine,
            mimetype,
            files,
            manifest_changed: false,
        })
    }

    pub fn opf_path(&self) -> &str {
        &self.opf_path
    }

    /// Directory holding the OPF (empty at the archive root).
    pub fn opf_dir(&self) -> &str {
        &self.opf_dir
    }

    pub fn metadata(&self) -> &BookMetadata {
        &self.metadata
    }

    pub fn manifest(&self) -> &[ManifestItem] {
        &self.manifest
    }

    pub fn spine(&self) -> &[String] {
        &self.spine
    }

    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|i| i.id == id)
    }

    /// Archive path of a manifest href.
    pub fn full_path(&self, href: &str) -> String {
        resolve_href(&self.opf_dir, href)
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn set_file(&mut self, path: impl Into<String>, data: Vec<u8>) {
        self.files.insert(path.into(), data);
    }

    /// Drop a manifest item and the file it points at.
    pub fn remove_item(&mut self, id: &str) -> Option<ManifestItem> {
        let pos = self.manifest.iter().position(|i| i.id == id)?;
        let item = self.manifest.remove(pos);
        let path = self.full_path(&item.href);
        self.files.remove(&path);
        self.manifest_changed = true;
        Some(item)
    }

    /// Drop a file that no manifest item points at.
    pub fn remove_unlisted_file(&mut self, path: &str) -> Option<Vec<u8>> {
        if self.is_listed(path) || path == self.opf_path {
            return None;
        }
        self.files.remove(path)
    }

    /// Whether some manifest item resolves to archive `path`.
    pub fn is_listed(&self, path: &str) -> bool {
        self.manifest.iter().any(|i| self.full_path(&i.href) == path)
    }

    /// Add a manifest item together with its file.
    pub fn add_item(&mut self, item: ManifestItem, data: Vec<u8>) {
        let path = self.full_path(&item.href);
        self.files.insert(path, data);
        self.manifest.push(item);
        self.manifest_changed = true;
    }

    /// Check referential integrity between manifest, spine and files.
    pub fn validate(&self) -> Result<(), OptimizationError> {
        for item in &self.manifest {
            let path = self.full_path(&item.href);
            if !self.files.contains_key(&path) {
                return Err(OptimizationError::DanglingManifestEntry {
                    id: item.id.clone(),
                    href: item.href.clone(),
                });
            }
        }
        for idref in &self.spine {
            if self.item(idref).is_none() {
                return Err(OptimizationError::SpineEntryMissing {
                    idref: idref.clone(),
                });
            }
        }
        Ok(())
    }

    /// Archive entries in EPUB order: `mimetype` first and stored, then every
    /// other file sorted by path.
    pub fn to_entries(&self) -> Result<Vec<ArchiveEntry>, OptimizationError> {
        let opf = if self.manifest_changed {
            Some(self.rewrite_opf()?)
        } else {
            None
        };

        let mut entries = Vec::with_capacity(self.files.len() + 1);
        entries.push(ArchiveEntry::stored(MIMETYPE_PATH, self.mimetype.clone()));
        for (path, data) in &self.files {
            let data = match (&opf, path == &self.opf_path) {
                (Some(text), true) => text.clone().into_bytes(),
                _ => data.clone(),
            };
            entries.push(ArchiveEntry::deflated(path.clone(), data));
        }
        Ok(entries)
    }

    /// OPF text with removed items cut out and added items appended to the manifest.
    fn rewrite_opf(&self) -> Result<String, OptimizationError> {
        let current: BTreeSet<&str> = self.manifest.iter().map(|i| i.id.as_str()).collect();
        let src = self.opf_source.as_str();

        let mut reader = Reader::from_str(src);
        let mut cuts: Vec<(usize, usize)> = Vec::new();
        let mut insert_at: Option<(usize, String)> = None;
        let mut open_item: Option<(usize, String)> = None;
        let mut item_depth = 0usize;

        loop {
            let before = reader.buffer_position() as usize;
            let event = reader
                .read_event()
                .map_err(|e| OptimizationError::Serialization(e.to_string()))?;
            let after = reader.buffer_position() as usize;
            match event {
                Event::Empty(e) if local_name(e.name().as_ref()) == b"item" => {
                    if let Some(id) = attr(&e, b"id") {
                        if !current.contains(id.as_str()) {
                            cuts.push((line_start(src, before), after));
                        }
                    }
                }
                Event::Start(e) if local_name(e.name().as_ref()) == b"item" => {
                    if item_depth == 0 {
                        if let Some(id) = attr(&e, b"id") {
                            open_item = Some((before, id));
                        }
                    }
                    item_depth += 1;
                }
                Event::End(e) if local_name(e.name().as_ref()) == b"item" => {
                    item_depth = item_depth.saturating_sub(1);
                    if item_depth == 0 {
                        if let Some((start, id)) = open_item.take() {
                            if !current.contains(id.as_str()) {
                                cuts.push((line_start(src, start), after));
                            }
                        }
                    }
                }
                Event::End(e) if local_name(e.name().as_ref()) == b"manifest" => {
                    let qname = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let prefix = qname
                        .rsplit_once(':')
                        .map(|(p, _)| format!("{p}:"))
                        .unwrap_or_default();
                    insert_at = Some((before, prefix));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let (insert_pos, prefix) = insert_at.ok_or_else(|| {
            OptimizationError::Serialization("package document has no </manifest>".into())
        })?;

        let mut additions = String::new();
        for item in self
            .manifest
            .iter()
            .filter(|i| !self.original_ids.contains(&i.id))
        {
            additions.push_str(&format!(
                "  <{prefix}item id=\"{}\" href=\"{}\" media-type=\"{}\"/>\n  ",
                escape(item.id.as_str()),
                escape(item.href.as_str()),
                escape(item.media_type.as_str())
            ));
        }

        let mut out = String::with_capacity(src.len() + additions.len());
        let mut pos = 0;
        for (start, end) in cuts {
            if start < pos || end > insert_pos {
                continue;
            }
            out.push_str(&src[pos..start]);
            pos = end;
        }
        out.push_str(&src[pos..insert_pos]);
        out.push_str(&additions);
        out.push_str(&src[insert_pos..]);
        Ok(out)
    }
}

// ── OPF parsing ───────────────────────────────────────────────────────────

struct OpfData {
    metadata: BookMetadata,
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
}

fn parse_opf(content: &str) -> Result<OpfData, quick_xml::Error> {
    // Untrimmed: titles like "Salt &amp; Iron" arrive as text, ref, text.
    let mut reader = Reader::from_str(content);

    let mut metadata = BookMetadata::default();
    let mut manifest = Vec::new();
    let mut spine = Vec::new();
    let mut in_metadata = false;
    let mut current: Option<&'static str> = None;
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"metadata" => in_metadata = true,
                b"title" if in_metadata && metadata.title.is_empty() => {
                    current = Some("title");
                    text.clear();
                }
                b"creator" if in_metadata && metadata.author.is_empty() => {
                    current = Some("creator");
                    text.clear();
                }
                b"item" => manifest.extend(manifest_item(&e)),
                _ => {}
            },
            Event::Empty(e) => match local_name(e.name().as_ref()) {
                b"item" => manifest.extend(manifest_item(&e)),
                b"itemref" => spine.extend(attr(&e, b"idref")),
                _ => {}
            },
            Event::Text(e) if current.is_some() => {
                text.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Event::GeneralRef(e) if current.is_some() => {
                let entity: &[u8] = e.as_ref();
                let entity = String::from_utf8_lossy(entity);
                if let Ok(resolved) = unescape(&format!("&{entity};")) {
                    text.push_str(&resolved);
                }
            }
            Event::End(e) => match local_name(e.name().as_ref()) {
                b"metadata" => in_metadata = false,
                b"title" | b"creator" => {
                    match current.take() {
                        Some("title") => metadata.title = text.trim().to_string(),
                        Some("creator") => metadata.author = text.trim().to_string(),
                        _ => {}
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(OpfData {
        metadata,
        manifest,
        spine,
    })
}

fn manifest_item(e: &quick_xml::events::BytesStart<'_>) -> Option<ManifestItem> {
    let id = attr(e, b"id")?;
    let href = attr(e, b"href")?;
    let mut item = ManifestItem::new(id, href, attr(e, b"media-type").unwrap_or_default());
    item.properties = attr(e, b"properties");
    Some(item)
}

fn attr(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| {
            let raw = String::from_utf8_lossy(&a.value).into_owned();
            unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw)
        })
}

fn find_opf_path(container: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(container).ok()?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if local_name(e.name().as_ref()) == b"rootfile" =>
            {
                if let Some(path) = attr(&e, b"full-path") {
                    return Some(path);
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

/// Start of the line holding `pos` when only indentation precedes it.
fn line_start(src: &str, pos: usize) -> usize {
    let head = &src[..pos];
    let indent = head.len() - head.trim_end_matches([' ', '\t']).len();
    let start = pos - indent;
    if src[..start].ends_with('\n') {
        start - 1
    } else {
        start
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────

fn strip_fragment(href: &str) -> &str {
    href.split(['#', '?']).next().unwrap_or(href)
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Archive path for `href` relative to `base_dir`: percent-decoded, fragment
/// stripped, `.` and `..` segments folded.
pub fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = strip_fragment(href);
    let decoded = percent_encoding::percent_decode_str(href).decode_utf8_lossy();
    let mut segments: Vec<&str> = if decoded.starts_with('/') {
        Vec::new()
    } else {
        base_dir.split('/').filter(|s| !s.is_empty()).collect()
    };
    for seg in decoded.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// Href that reaches archive path `target` from a document at archive path `from`.
pub fn relative_href(from: &str, target: &str) -> String {
    let from_dir: Vec<&str> = parent_dir(from).split('/').filter(|s| !s.is_empty()).collect();
    let target_parts: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
    let (target_dir, file) = target_parts.split_at(target_parts.len().saturating_sub(1));

    let common = from_dir
        .iter()
        .zip(target_dir)
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<&str> = std::iter::repeat("..").take(from_dir.len() - common).collect();
    parts.extend(&target_dir[common..]);
    parts.extend(file);
    parts.join("/")
}
