//! Font discovery and text measurement.
//!
//! Faces come from the EPUB's own font resources and from configured
//! TrueType files. Each character is drawn with the first family that has
//! a glyph for it, so Latin text stays in the body face while CJK falls
//! through to a face that covers it. With no usable face at all the
//! built-in Helvetica is used, which only covers Windows-1252.

use super::extract::Resources;
use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;
use ttf_parser::{Face as TtfFace, FaceParsingError, GlyphId, name_id};

/// Font files tried when the configuration names none.
pub const DEFAULT_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Oblique.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-BoldOblique.ttf",
    "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
    "/usr/share/fonts/truetype/wqy/wqy-zenhei.ttc",
];

#[derive(Debug, thiserror::Error)]
pub enum FontError {
    #[error("failed to read font: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse font: {0}")]
    Parse(#[from] FaceParsingError),

    #[error("font has no TrueType outlines")]
    NoOutlines,
}

/// Weight and slant of a face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Style {
    Regular,
    Bold,
    Italic,
    BoldItalic,
}

impl Style {
    pub const ALL: [Style; 4] = [Style::Regular, Style::Bold, Style::Italic, Style::BoldItalic];

    /// Style for a bold/italic combination.
    pub fn from_flags(bold: bool, italic: bool) -> Self {
        match (bold, italic) {
            (false, false) => Style::Regular,
            (true, false) => Style::Bold,
            (false, true) => Style::Italic,
            (true, true) => Style::BoldItalic,
        }
    }

    pub fn is_bold(self) -> bool {
        matches!(self, Style::Bold | Style::BoldItalic)
    }

    pub fn is_italic(self) -> bool {
        matches!(self, Style::Italic | Style::BoldItalic)
    }
}

/// One TrueType face, validated on load. Collections use their first face.
#[derive(Clone)]
pub struct FontFile {
    label: String,
    family: String,
    style: Style,
    data: Arc<[u8]>,
}

impl std::fmt::Debug for FontFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontFile")
            .field("label", &self.label)
            .field("family", &self.family)
            .field("style", &self.style)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl FontFile {
    /// Parse font bytes; `label` names the source in logs.
    pub fn from_bytes(label: impl Into<String>, data: Vec<u8>) -> Result<Self, FontError> {
        let label = label.into();
        let (family, style) = {
            let face = TtfFace::parse(&data, 0)?;
            // Embedded as FontFile2, which needs glyf outlines.
            if face.tables().glyf.is_none() {
                return Err(FontError::NoOutlines);
            }
            let style = Style::from_flags(face.is_bold(), face.is_italic() || face.is_oblique());
            (family_name(&face), style)
        };
        Ok(Self {
            family: family.unwrap_or_else(|| label.clone()),
            label,
            style,
            data: data.into(),
        })
    }

    /// Read and parse a font file.
    pub fn open(path: &Path) -> Result<Self, FontError> {
        Self::from_bytes(path.display().to_string(), std::fs::read(path)?)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn style(&self) -> Style {
        self.style
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

fn family_name(face: &TtfFace<'_>) -> Option<String> {
    [name_id::TYPOGRAPHIC_FAMILY, name_id::FAMILY]
        .into_iter()
        .find_map(|id| {
            face.names()
                .into_iter()
                .find(|name| name.name_id == id && name.is_unicode())
                .and_then(|name| name.to_string())
        })
        .filter(|name| !name.trim().is_empty())
}

#[derive(Debug, Clone)]
struct Family {
    name: String,
    faces: Vec<FontFile>,
}

impl Family {
    /// Closest face: exact style, then same weight, then regular.
    fn face(&self, style: Style) -> &FontFile {
        self.faces
            .iter()
            .find(|f| f.style == style)
            .or_else(|| self.faces.iter().find(|f| f.style.is_bold() == style.is_bold()))
            .or_else(|| self.faces.iter().find(|f| f.style == Style::Regular))
            .unwrap_or(&self.faces[0])
    }
}

/// Ordered font families; earlier families win.
#[derive(Debug, Clone, Default)]
pub struct FontSet {
    families: Vec<Family>,
}

impl FontSet {
    /// Load font files, skipping missing and unusable ones.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mut set = Self::default();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                tracing::debug!(path = %path.display(), "Font file not found");
                continue;
            }
            match FontFile::open(path) {
                Ok(file) => set.push(file),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping font"),
            }
        }
        if set.is_empty() {
            tracing::warn!("No TrueType font found, text outside Windows-1252 will be dropped");
        } else {
            tracing::debug!(families = ?set.family_names(), "Loaded fonts");
        }
        set
    }

    /// Faces shipped inside the package.
    ///
    /// Obfuscated or CFF-flavoured fonts do not parse as TrueType and are
    /// skipped.
    pub fn from_resources(resources: &Resources) -> Self {
        let mut set = Self::default();
        for (path, resource) in resources.fonts() {
            match FontFile::from_bytes(path, resource.data.clone()) {
                Ok(file) => set.push(file),
                Err(e) => tracing::debug!(path, error = %e, "Package font not usable"),
            }
        }
        set
    }

    /// Add a face to its family, creating the family when new.
    pub fn push(&mut self, file: FontFile) {
        match self.families.iter_mut().find(|f| f.name == file.family) {
            Some(family) => family.faces.push(file),
            None => self.families.push(Family {
                name: file.family.clone(),
                faces: vec![file],
            }),
        }
    }

    /// Families of `self` followed by those of `fallback`.
    pub fn chain(&self, fallback: &FontSet) -> FontSet {
        let mut set = self.clone();
        for family in &fallback.families {
            for face in &family.faces {
                set.push(face.clone());
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn family_names(&self) -> Vec<&str> {
        self.families.iter().map(|f| f.name.as_str()).collect()
    }
}

/// Face used for a run of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FaceId {
    /// Index into [`FontBook::file`].
    Embedded(usize),
    /// Standard Helvetica in the given style.
    Builtin(Style),
}

struct Parsed<'a> {
    file: &'a FontFile,
    face: TtfFace<'a>,
    units_per_em: f32,
}

impl Parsed<'_> {
    fn glyph(&self, c: char) -> Option<GlyphId> {
        self.face.glyph_index(c).filter(|g| g.0 != 0)
    }
}

/// Faces of a [`FontSet`] parsed for one render.
pub struct FontBook<'a> {
    faces: Vec<Parsed<'a>>,
    /// Face index per family and style.
    slots: Vec<[usize; 4]>,
    missing: Cell<usize>,
}

impl<'a> FontBook<'a> {
    pub fn new(set: &'a FontSet) -> Self {
        let mut faces: Vec<Parsed<'a>> = Vec::new();
        let mut slots = Vec::with_capacity(set.families.len());

        'families: for family in &set.families {
            let mut slot = [0; 4];
            for style in Style::ALL {
                let file = family.face(style);
                let index = match faces.iter().position(|p| std::ptr::eq(p.file, file)) {
                    Some(index) => index,
                    None => match TtfFace::parse(file.data(), 0) {
                        Ok(face) => {
                            faces.push(Parsed {
                                file,
                                units_per_em: f32::from(face.units_per_em().max(1)),
                                face,
                            });
                            faces.len() - 1
                        }
                        Err(e) => {
                            tracing::warn!(font = file.label(), error = %e, "Dropping font family");
                            continue 'families;
                        }
                    },
                };
                slot[style as usize] = index;
            }
            slots.push(slot);
        }

        Self {
            faces,
            slots,
            missing: Cell::new(0),
        }
    }

    /// Split `text` into runs that each use one face.
    pub fn runs(&self, text: &str, style: Style) -> Vec<(FaceId, String)> {
        let mut runs: Vec<(FaceId, String)> = Vec::new();
        for c in text.chars() {
            let face = match runs.last() {
                Some((last, _)) if c.is_whitespace() => *last,
                _ => self.face_for(c, style),
            };
            match runs.last_mut() {
                Some((last, run)) if *last == face => run.push(c),
                _ => runs.push((face, c.to_string())),
            }
        }
        runs
    }

    fn face_for(&self, c: char, style: Style) -> FaceId {
        let Some(first) = self.slots.first() else {
            return FaceId::Builtin(style);
        };
        let covering = self
            .slots
            .iter()
            .map(|slot| slot[style as usize])
            .find(|&index| self.faces[index].glyph(c).is_some());
        match covering {
            Some(index) => FaceId::Embedded(index),
            None => {
                if !c.is_whitespace() && !c.is_control() {
                    self.missing.set(self.missing.get() + 1);
                }
                FaceId::Embedded(first[style as usize])
            }
        }
    }

    /// Advance width of `text` at `size` points.
    pub fn width(&self, face: FaceId, text: &str, size: f32) -> f32 {
        match face {
            FaceId::Embedded(index) => {
                let parsed = &self.faces[index];
                let units: f32 = text
                    .chars()
                    .filter_map(|c| parsed.glyph(c))
                    .filter_map(|g| parsed.face.glyph_hor_advance(g))
                    .map(f32::from)
                    .sum();
                units * size / parsed.units_per_em
            }
            FaceId::Builtin(style) => {
                text.chars().map(|c| builtin_advance(c, style)).sum::<f32>() * size
            }
        }
    }

    /// Font file behind an embedded face.
    pub fn file(&self, index: usize) -> &'a FontFile {
        self.faces[index].file
    }

    /// Characters seen so far that no face covers.
    pub fn missing(&self) -> usize {
        self.missing.get()
    }
}

/// Rough Helvetica advance in em, for the no-font fallback.
fn builtin_advance(c: char, style: Style) -> f32 {
    let base = match c {
        ' ' | 'i' | 'j' | 'l' | 'f' | 't' | '.' | ',' | ':' | ';' | '\'' | '!' | '|' => 0.278,
        'm' | 'w' | 'M' | 'W' => 0.833,
        'A'..='Z' => 0.667,
        _ => 0.556,
    };
    if style.is_bold() { base * 1.05 } else { base }
}
