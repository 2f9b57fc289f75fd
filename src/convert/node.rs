//! Uniform document model produced by the normalizer.

use std::fmt;

/// An RGB foreground color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

impl Rgb {
    /// Create a color from its channels.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse a `#rgb` / `#rrggbb` hex notation.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        match digits.len() {
            3 => {
                let mut channels = digits
                    .chars()
                    .map(|c| c.to_digit(16).map(|d| (d * 17) as u8));
                Some(Self::new(
                    channels.next()??,
                    channels.next()??,
                    channels.next()??,
                ))
            }
            6 => Some(Self::new(
                u8::from_str_radix(&digits[0..2], 16).ok()?,
                u8::from_str_radix(&digits[2..4], 16).ok()?,
                u8::from_str_radix(&digits[4..6], 16).ok()?,
            )),
            _ => None,
        }
    }

    /// Channels as PDF color components in `0.0..=1.0`.
    pub fn components(&self) -> [f32; 3] {
        [
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
        ]
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Horizontal alignment of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Alignment {
    /// Left edge in left-to-right text.
    #[default]
    Start,
    /// Centered.
    Center,
    /// Right edge in left-to-right text.
    End,
    /// Stretched to both edges.
    Justify,
}

impl Alignment {
    /// Parse a CSS `text-align` value or an HTML `align` attribute.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "left" | "start" => Some(Alignment::Start),
            "center" | "middle" => Some(Alignment::Center),
            "right" | "end" => Some(Alignment::End),
            "justify" => Some(Alignment::Justify),
            _ => None,
        }
    }

    /// CSS `text-align` keyword.
    pub fn as_css(&self) -> &'static str {
        match self {
            Alignment::Start => "left",
            Alignment::Center => "center",
            Alignment::End => "right",
            Alignment::Justify => "justify",
        }
    }
}

/// Style carried by a block-level node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStyle {
    /// Default foreground color for the block's text.
    pub color: Option<Rgb>,
    /// Horizontal alignment.
    pub alignment: Alignment,
    /// Whether the first line is indented.
    pub indent: bool,
}

/// A span of text sharing one inline style.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextRun {
    /// Text content. A lone `"\n"` is a forced line break.
    pub text: String,
    /// Bold weight.
    pub bold: bool,
    /// Italic style.
    pub italic: bool,
    /// Foreground color overriding the block color.
    pub color: Option<Rgb>,
}

impl TextRun {
    /// Create an unstyled run.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Whether this run is a forced line break.
    pub fn is_line_break(&self) -> bool {
        self.text == "\n"
    }

    /// Whether two runs can be merged into one.
    pub(crate) fn same_style(&self, other: &TextRun) -> bool {
        self.bold == other.bold && self.italic == other.italic && self.color == other.color
    }
}

/// Concatenated text of a run sequence.
pub fn runs_text(runs: &[TextRun]) -> String {
    runs.iter().map(|r| r.text.as_str()).collect()
}

/// Marker of a list item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMarker {
    /// Bulleted item.
    Unordered,
    /// Numbered item with its ordinal.
    Ordered(u32),
}

/// An embedded raster image, resolved from the package resources.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    /// Encoded image bytes.
    pub data: Vec<u8>,
    /// MIME type of `data`.
    pub media_type: String,
    /// Intrinsic width in pixels.
    pub width: u32,
    /// Intrinsic height in pixels.
    pub height: u32,
    /// Alternative text.
    pub alt: String,
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("bytes", &self.data.len())
            .field("media_type", &self.media_type)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("alt", &self.alt)
            .finish()
    }
}

/// One structural node of a normalized content document.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentNode {
    /// Heading of level 1 to 6.
    Heading {
        /// Heading level.
        level: u8,
        /// Heading text.
        text: String,
        /// Block style.
        style: BlockStyle,
    },
    /// Body paragraph.
    Paragraph {
        /// Styled content.
        runs: Vec<TextRun>,
        /// Block style.
        style: BlockStyle,
    },
    /// Item of a bulleted or numbered list.
    ListItem {
        /// Bullet or ordinal.
        marker: ListMarker,
        /// Styled content.
        runs: Vec<TextRun>,
        /// Block style.
        style: BlockStyle,
    },
    /// Embedded image.
    Image(ImageData),
    /// Quotation block.
    BlockQuote {
        /// Styled content.
        runs: Vec<TextRun>,
        /// Block style.
        style: BlockStyle,
    },
}

/// Ordered nodes of one content document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedDocument {
    /// Spine position of the source document.
    pub position: usize,
    /// Nodes in document order.
    pub nodes: Vec<ContentNode>,
}

impl NormalizedDocument {
    /// Number of image nodes.
    pub fn image_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, ContentNode::Image(_)))
            .count()
    }
}
