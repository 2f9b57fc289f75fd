//! EPUB package extraction.

use super::style::ClassRules;
use crate::error::ConvertError;
use encoding_rs::Encoding;
use roxmltree::{Document, ParsingOptions};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use zip::ZipArchive;

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// Bibliographic data from the package document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMetadata {
    /// `dc:title`.
    pub title: Option<String>,
    /// First `dc:creator`.
    pub author: Option<String>,
    /// `dc:language`.
    pub language: Option<String>,
}

/// One decoded content document in reading order.
#[derive(Debug, Clone)]
pub struct ContentDocument {
    /// Index in the spine.
    pub position: usize,
    /// Normalized archive path.
    pub path: String,
    /// Markup decoded with `encoding`.
    pub markup: String,
    /// Resolved character encoding.
    pub encoding: &'static Encoding,
}

/// Kind of binary resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Raster or vector image.
    Image,
    /// Embedded font.
    Font,
}

/// A binary resource listed in the manifest.
#[derive(Clone)]
pub struct Resource {
    /// Manifest media type.
    pub media_type: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Raw bytes.
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("media_type", &self.media_type)
            .field("kind", &self.kind)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Binary resources keyed by normalized archive path.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    items: HashMap<String, Resource>,
}

impl Resources {
    /// Add a resource.
    pub fn insert(&mut self, path: impl Into<String>, resource: Resource) {
        self.items.insert(path.into(), resource);
    }

    /// Image stored at `path`.
    pub fn image(&self, path: &str) -> Option<&Resource> {
        self.items
            .get(path)
            .filter(|r| r.kind == ResourceKind::Image)
    }

    /// The only image whose file name is `file_name`, if exactly one exists.
    pub fn image_by_file_name(&self, file_name: &str) -> Option<&Resource> {
        let mut matches = self.items.iter().filter(|(path, r)| {
            r.kind == ResourceKind::Image && file_name_of(path) == file_name
        });
        let (_, first) = matches.next()?;
        matches.next().is_none().then_some(first)
    }

    /// Font resources ordered by path.
    pub fn fonts(&self) -> Vec<(&str, &Resource)> {
        let mut fonts: Vec<_> = self
            .items
            .iter()
            .filter(|(_, r)| r.kind == ResourceKind::Font)
            .map(|(path, r)| (path.as_str(), r))
            .collect();
        fonts.sort_by(|a, b| a.0.cmp(b.0));
        fonts
    }

    /// Number of resources of `kind`.
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.items.values().filter(|r| r.kind == kind).count()
    }
}

/// Everything the pipeline needs from an EPUB archive.
#[derive(Debug)]
pub struct Package {
    /// Package metadata.
    pub metadata: PackageMetadata,
    /// Decoded content documents in spine order.
    pub documents: Vec<ContentDocument>,
    /// Images and fonts.
    pub resources: Resources,
    /// Class rules from the package stylesheets.
    pub class_rules: ClassRules,
    /// Number of spine entries, including skipped ones.
    pub spine_len: usize,
}

/// Manifest entry.
#[derive(Debug, Clone)]
struct ManifestItem {
    path: String,
    media_type: String,
}

/// Parsed package document.
#[derive(Debug, Default)]
struct Opf {
    metadata: PackageMetadata,
    /// Manifest in document order, as (id, item).
    manifest: Vec<(String, ManifestItem)>,
    spine: Vec<String>,
}

/// Open an EPUB archive held in memory.
///
/// Fails with [`ConvertError::MalformedPackage`] when the archive or its
/// package document is unusable or when no spine entry resolves to a
/// manifest item. Individual entries that are missing or cannot be decoded
/// are skipped with a warning.
pub fn extract(bytes: &[u8]) -> Result<Package, ConvertError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let opf_path = find_opf_path(&mut archive)?;
    let opf_dir = parent_dir(&opf_path).to_string();

    let opf_bytes = read_entry(&mut archive, &opf_path).ok_or_else(|| {
        ConvertError::MalformedPackage(format!("Package document missing: {}", opf_path))
    })?;
    let opf_text = decode_text(&opf_bytes).ok_or_else(|| {
        ConvertError::MalformedPackage(format!("Package document is not decodable: {}", opf_path))
    })?;
    let opf = parse_opf(&opf_text, &opf_dir)?;

    if opf.spine.is_empty() {
        return Err(ConvertError::MalformedPackage(
            "Package spine is empty".into(),
        ));
    }

    let manifest: HashMap<&str, &ManifestItem> = opf
        .manifest
        .iter()
        .map(|(id, item)| (id.as_str(), item))
        .collect();

    let mut resolved = 0usize;
    let mut documents = Vec::new();

    for (position, idref) in opf.spine.iter().enumerate() {
        let Some(item) = manifest.get(idref.as_str()) else {
            tracing::warn!(idref = %idref, "Spine entry references a missing manifest item, skipping");
            continue;
        };
        resolved += 1;

        if !is_content_document(item) {
            tracing::debug!(path = %item.path, media_type = %item.media_type, "Skipping non-document spine item");
            continue;
        }

        let Some(raw) = read_entry(&mut archive, &item.path) else {
            tracing::warn!(path = %item.path, "Content document missing from archive, skipping");
            continue;
        };

        let encoding = match resolve_encoding(&raw) {
            Ok(encoding) => encoding,
            Err(label) => {
                tracing::warn!(path = %item.path, encoding = %label, "Unknown declared encoding, skipping");
                continue;
            }
        };

        let Some(markup) = decode_with(&raw, encoding) else {
            tracing::warn!(path = %item.path, encoding = encoding.name(), "Content document failed to decode, skipping");
            continue;
        };

        documents.push(ContentDocument {
            position,
            path: item.path.clone(),
            markup,
            encoding,
        });
    }

    if resolved == 0 {
        return Err(ConvertError::MalformedPackage(
            "No spine entry references an existing manifest item".into(),
        ));
    }

    let mut resources = Resources::default();
    let mut class_rules = ClassRules::default();

    for (_, item) in &opf.manifest {
        let kind = if item.media_type.starts_with("image/") {
            ResourceKind::Image
        } else if is_font(&item.media_type) {
            ResourceKind::Font
        } else if item.media_type == "text/css" {
            if let Some(css) = read_entry(&mut archive, &item.path) {
                class_rules.add_stylesheet(&String::from_utf8_lossy(&css));
            }
            continue;
        } else {
            continue;
        };

        match read_entry(&mut archive, &item.path) {
            Some(data) => resources.insert(
                item.path.clone(),
                Resource {
                    media_type: item.media_type.clone(),
                    kind,
                    data,
                },
            ),
            None => tracing::warn!(path = %item.path, "Manifest resource missing from archive"),
        }
    }

    tracing::info!(
        spine = opf.spine.len(),
        documents = documents.len(),
        images = resources.count(ResourceKind::Image),
        fonts = resources.count(ResourceKind::Font),
        class_rules = class_rules.len(),
        "Extracted EPUB package"
    );

    Ok(Package {
        metadata: opf.metadata,
        documents,
        resources,
        class_rules,
        spine_len: opf.spine.len(),
    })
}

/// Find the package document path from container.xml.
fn find_opf_path(archive: &mut Archive<'_>) -> Result<String, ConvertError> {
    if let Some(container) = read_entry(archive, "META-INF/container.xml") {
        let text = decode_text(&container).unwrap_or_default();
        if let Ok(doc) = parse_xml(&text)
            && let Some(path) = doc
                .descendants()
                .find(|n| n.has_tag_name("rootfile"))
                .and_then(|n| n.attribute("full-path"))
        {
            return Ok(normalize_path(path));
        }
        tracing::warn!("container.xml names no rootfile, searching for a package document");
    }

    archive
        .file_names()
        .find(|name| name.to_ascii_lowercase().ends_with(".opf"))
        .map(String::from)
        .ok_or_else(|| ConvertError::MalformedPackage("No package document (.opf) found".into()))
}

/// Parse the package document.
fn parse_opf(content: &str, opf_dir: &str) -> Result<Opf, ConvertError> {
    let doc = parse_xml(content)?;
    let mut opf = Opf::default();

    for node in doc.descendants().filter(|n| n.is_element()) {
        match node.tag_name().name() {
            "title" if opf.metadata.title.is_none() => {
                opf.metadata.title = non_empty(node_text(&node));
            }
            "creator" if opf.metadata.author.is_none() => {
                opf.metadata.author = non_empty(node_text(&node));
            }
            "language" if opf.metadata.language.is_none() => {
                opf.metadata.language = non_empty(node_text(&node));
            }
            "item" => {
                let (Some(id), Some(href)) = (node.attribute("id"), node.attribute("href")) else {
                    continue;
                };
                opf.manifest.push((
                    id.to_string(),
                    ManifestItem {
                        path: resolve_href(opf_dir, href),
                        media_type: node
                            .attribute("media-type")
                            .unwrap_or_default()
                            .trim()
                            .to_ascii_lowercase(),
                    },
                ));
            }
            "itemref" => {
                if let Some(idref) = node.attribute("idref") {
                    opf.spine.push(idref.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(opf)
}

fn node_text(node: &roxmltree::Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn is_content_document(item: &ManifestItem) -> bool {
    if item.media_type.is_empty() {
        let lower = item.path.to_ascii_lowercase();
        return lower.ends_with(".xhtml") || lower.ends_with(".html") || lower.ends_with(".htm");
    }
    item.media_type.contains("html")
}

fn is_font(media_type: &str) -> bool {
    media_type.starts_with("font/")
        || media_type.starts_with("application/font-")
        || media_type.starts_with("application/x-font-")
        || media_type == "application/vnd.ms-opentype"
}

/// Read a whole archive entry; `None` when absent or unreadable.
fn read_entry(archive: &mut Archive<'_>, name: &str) -> Option<Vec<u8>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return None,
        Err(e) => {
            tracing::warn!(path = %name, error = %e, "Failed to open archive entry");
            return None;
        }
    };

    let mut data = Vec::with_capacity(file.size() as usize);
    if let Err(e) = file.read_to_end(&mut data) {
        tracing::warn!(path = %name, error = %e, "Failed to read archive entry");
        return None;
    }
    Some(data)
}

/// Parse XML that may carry a DOCTYPE.
pub(crate) fn parse_xml(text: &str) -> Result<Document<'_>, roxmltree::Error> {
    Document::parse_with_options(
        text,
        ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        },
    )
}

/// Resolve the encoding of a markup document.
///
/// Byte-order mark first, then the XML declaration, then a `<meta>`
/// charset, then UTF-8. `Err` carries an unknown declared label.
pub fn resolve_encoding(bytes: &[u8]) -> Result<&'static Encoding, String> {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return Ok(encoding);
    }

    match declared_charset(bytes) {
        Some(label) => Encoding::for_label(label.trim().as_bytes()).ok_or(label),
        None => Ok(encoding_rs::UTF_8),
    }
}

/// Strictly decode `bytes`; `None` on malformed input.
pub fn decode_with(bytes: &[u8], encoding: &'static Encoding) -> Option<String> {
    let body = match Encoding::for_bom(bytes) {
        Some((_, bom_len)) => &bytes[bom_len..],
        None => bytes,
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(Cow::into_owned)
}

fn decode_text(bytes: &[u8]) -> Option<String> {
    let encoding = resolve_encoding(bytes).ok()?;
    decode_with(bytes, encoding)
}

/// Encoding label declared in the document prologue.
fn declared_charset(bytes: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]);

    if head.trim_start().starts_with("<?xml")
        && let Some(end) = head.find("?>")
        && let Some(label) = attribute_value(&head[..end], "encoding=")
    {
        return Some(label);
    }

    let lower = head.to_ascii_lowercase();
    let start = lower.find("charset=")? + "charset=".len();
    let label: String = lower[start..]
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| !matches!(c, '"' | '\'' | ';' | '>' | '/') && !c.is_whitespace())
        .collect();
    (!label.is_empty()).then_some(label)
}

fn attribute_value(text: &str, key: &str) -> Option<String> {
    let start = text.find(key)? + key.len();
    let rest = &text[start..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &rest[1..];
    let end = value.find(quote)?;
    Some(value[..end].to_string())
}

/// Directory part of an archive path (no trailing slash).
pub(crate) fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// File name part of an archive path.
pub(crate) fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Resolve an href against a directory into a normalized archive path.
pub(crate) fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split(['#', '?']).next().unwrap_or_default();
    let decoded = urlencoding::decode(href)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| href.to_string());

    if let Some(absolute) = decoded.strip_prefix('/') {
        normalize_path(absolute)
    } else if base_dir.is_empty() {
        normalize_path(&decoded)
    } else {
        normalize_path(&format!("{}/{}", base_dir, decoded))
    }
}

/// Remove `.` and `..` segments from an archive path.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}
