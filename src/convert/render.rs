//! PDF rendering of the synthesized document.
//!
//! The XHTML is read back into a flat list of layout blocks, broken into
//! lines with TrueType metrics, paginated, and drawn with printpdf. The
//! saved file is then normalized with lopdf: a content-derived trailer ID,
//! a plain information dictionary, and one XObject per distinct image.
//! Nothing is returned until the whole file is serialized.

use super::extract::parse_xml;
use super::fonts::{DEFAULT_FONT_PATHS, FaceId, FontBook, FontSet, Style};
use super::node::{Alignment, Rgb};
use super::normalize::decode_data_uri;
use super::scale::{RenderedImage, pixels_to_inches, scale_image};
use super::style::Declarations;
use super::synth::{Stylesheet, SynthesizedDocument};
use crate::error::ConvertError;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader, RgbImage};
use lopdf::{Dictionary, Object, ObjectId, StringFormat};
use printpdf::{
    BuiltinFont, Color, ColorBits, ColorSpace, Image, ImageFilter, ImageTransform, ImageXObject,
    IndirectFontRef, Mm, PdfConformance, PdfDocument, PdfDocumentReference, PdfLayerReference, Pt,
    Px, TextMatrix,
};
use roxmltree::Node;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;

/// Points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Default JPEG quality for re-encoded images.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Gap between a list marker and the item text, in points.
const MARKER_GAP: f32 = 6.0;

const PRODUCER: &str = concat!("epub2pdf ", env!("CARGO_PKG_VERSION"));

/// Renders synthesized documents to PDF.
#[derive(Debug, Clone)]
pub struct Renderer {
    stylesheet: Stylesheet,
    jpeg_quality: u8,
    fonts: FontSet,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(Stylesheet::default()).with_fonts(FontSet::load(DEFAULT_FONT_PATHS))
    }
}

impl Renderer {
    /// Create a renderer laying out with `stylesheet` and no TrueType fonts.
    pub fn new(stylesheet: Stylesheet) -> Self {
        Self {
            stylesheet,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            fonts: FontSet::default(),
        }
    }

    /// Set the JPEG quality of re-encoded images (1-100).
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Set the fonts tried after those shipped with a package.
    pub fn with_fonts(mut self, fonts: FontSet) -> Self {
        self.fonts = fonts;
        self
    }

    /// Render a synthesized document to PDF bytes.
    pub fn render(&self, document: &SynthesizedDocument) -> Result<Vec<u8>, ConvertError> {
        self.render_markup_with_fonts(&document.markup, &FontSet::default())
    }

    /// Render a synthesized document, preferring `package_fonts`.
    pub fn render_with_fonts(
        &self,
        document: &SynthesizedDocument,
        package_fonts: &FontSet,
    ) -> Result<Vec<u8>, ConvertError> {
        self.render_markup_with_fonts(&document.markup, package_fonts)
    }

    /// Render synthesized XHTML markup to PDF bytes.
    pub fn render_markup(&self, markup: &str) -> Result<Vec<u8>, ConvertError> {
        self.render_markup_with_fonts(markup, &FontSet::default())
    }

    fn render_markup_with_fonts(
        &self,
        markup: &str,
        package_fonts: &FontSet,
    ) -> Result<Vec<u8>, ConvertError> {
        let xml = parse_xml(markup)
            .map_err(|e| ConvertError::Render(format!("synthesized markup is not well-formed: {}", e)))?;
        let root = xml.root_element();

        let title = element_text(&root, "title");
        let author = root
            .descendants()
            .find(|n| n.has_tag_name("meta") && n.attribute("name") == Some("author"))
            .and_then(|n| n.attribute("content"))
            .map(str::to_string);

        let body = root
            .descendants()
            .find(|n| n.has_tag_name("body"))
            .ok_or_else(|| ConvertError::Render("synthesized markup has no body".to_string()))?;

        let mut reader = BlockReader {
            sheet: &self.stylesheet,
            blocks: Vec::new(),
            images: Vec::new(),
            by_source: HashMap::new(),
            jpeg_quality: self.jpeg_quality,
        };
        reader.read_children(body, Context::default())?;

        let fonts = package_fonts.chain(&self.fonts);
        let book = FontBook::new(&fonts);
        let mut layout = Layout::new(&self.stylesheet, &book);
        for block in &reader.blocks {
            layout.place(block);
        }
        let pages = layout.finish();
        if book.missing() > 0 {
            tracing::warn!(
                characters = book.missing(),
                "Some characters have no glyph in any available font"
            );
        }

        let meta = DocumentInfo {
            title: title.as_deref(),
            author: author.as_deref(),
            seed: markup,
        };
        let pdf = assemble(&self.stylesheet, &book, &pages, &reader.images, &meta)?;
        tracing::info!(
            bytes = pdf.len(),
            pages = pages.len(),
            images = reader.images.len(),
            "Rendered PDF"
        );
        Ok(pdf)
    }
}

/// Inherited layout context while reading the markup.
#[derive(Debug, Clone, Copy, Default)]
struct Context {
    alignment: Alignment,
    color: Option<Rgb>,
    left: f32,
    right: f32,
    italic: bool,
}

/// Piece of inline text in a single style and color.
#[derive(Debug, Clone)]
struct Span {
    text: String,
    style: Style,
    color: Option<Rgb>,
}

/// A run of text laid out as one paragraph.
#[derive(Debug, Clone)]
struct TextFlow {
    spans: Vec<Span>,
    size: f32,
    alignment: Alignment,
    color: Option<Rgb>,
    left: f32,
    right: f32,
    first_indent: f32,
    marker: Option<String>,
    space_before: f32,
    space_after: f32,
}

#[derive(Debug, Clone)]
enum Block {
    Text(TextFlow),
    Image {
        index: usize,
        width: f32,
        height: f32,
    },
    PageBreak,
}

struct BlockReader<'s> {
    sheet: &'s Stylesheet,
    blocks: Vec<Block>,
    images: Vec<ImageXObject>,
    /// Image index per data URI, so repeated images are prepared once.
    by_source: HashMap<String, usize>,
    jpeg_quality: u8,
}

impl BlockReader<'_> {
    fn read_children(&mut self, node: Node<'_, '_>, ctx: Context) -> Result<(), ConvertError> {
        let mut loose: Vec<Span> = Vec::new();

        for child in node.children() {
            if child.is_text() {
                if let Some(text) = child.text() {
                    push_span(&mut loose, text, Style::from_flags(false, ctx.italic), None);
                }
                continue;
            }
            if !child.is_element() {
                continue;
            }
            let tag = child.tag_name().name().to_ascii_lowercase();
            if is_inline(&tag) {
                collect_spans(child, false, ctx.italic, None, &mut loose);
                continue;
            }
            self.flush_loose(&mut loose, ctx);
            self.read_block(child, &tag, ctx)?;
        }

        self.flush_loose(&mut loose, ctx);
        Ok(())
    }

    fn flush_loose(&mut self, loose: &mut Vec<Span>, ctx: Context) {
        let spans = trim_spans(std::mem::take(loose));
        if !spans.is_empty() {
            self.blocks.push(Block::Text(self.flow(spans, self.sheet.body_size, ctx)));
        }
    }

    fn read_block(&mut self, node: Node<'_, '_>, tag: &str, ctx: Context) -> Result<(), ConvertError> {
        let class = node.attribute("class").unwrap_or_default();
        let decls = node
            .attribute("style")
            .map(Declarations::parse)
            .unwrap_or_default();
        let style = node.attribute("style").unwrap_or_default();

        let mut inner = ctx;
        if let Some(alignment) = decls.alignment {
            inner.alignment = alignment;
        }
        if let Some(color) = decls.color {
            inner.color = Some(color);
        }

        if has_class(class, "page-break") || style.contains("page-break-before: always") {
            self.blocks.push(Block::PageBreak);
            return Ok(());
        }

        match tag {
            "head" | "script" | "style" | "title" => Ok(()),
            "img" => self.read_image(node),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = tag[1..].parse::<u8>().unwrap_or(1);
                let spans = self.inline_spans(node, true, inner.italic);
                if !spans.is_empty() {
                    let size = self.sheet.heading_size(level);
                    let mut flow = self.flow(spans, size, inner);
                    flow.space_before = self.sheet.paragraph_spacing * 2.0;
                    self.blocks.push(Block::Text(flow));
                }
                Ok(())
            }
            "p" => {
                let spans = self.inline_spans(node, false, inner.italic);
                if !spans.is_empty() {
                    let mut flow = self.flow(spans, self.sheet.body_size, inner);
                    if has_class(class, "indent") {
                        flow.first_indent = self.sheet.indent;
                    }
                    self.blocks.push(Block::Text(flow));
                }
                Ok(())
            }
            "ul" | "ol" => self.read_list(node, tag == "ol", inner),
            "li" => {
                self.read_list_item(node, "\u{2022}".to_string(), inner);
                Ok(())
            }
            "blockquote" => {
                inner.left += self.sheet.quote_indent;
                inner.right += self.sheet.quote_indent;
                inner.italic = true;
                self.read_children(node, inner)
            }
            _ => {
                if has_class(class, "title-block") || has_class(class, "figure") {
                    inner.alignment = Alignment::Center;
                }
                self.read_children(node, inner)
            }
        }
    }

    fn read_list(&mut self, list: Node<'_, '_>, ordered: bool, ctx: Context) -> Result<(), ConvertError> {
        let mut inner = ctx;
        inner.left += self.sheet.list_indent;
        let mut ordinal = list
            .attribute("start")
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(1);

        for item in list.children().filter(|n| n.is_element()) {
            match item.tag_name().name() {
                "li" => {
                    if let Some(value) = item.attribute("value").and_then(|s| s.trim().parse().ok()) {
                        ordinal = value;
                    }
                    let marker = if ordered {
                        format!("{}.", ordinal)
                    } else {
                        "\u{2022}".to_string()
                    };
                    ordinal = ordinal.saturating_add(1);
                    self.read_list_item(item, marker, inner);
                }
                "ul" | "ol" => {
                    let nested = item.tag_name().name() == "ol";
                    self.read_list(item, nested, inner)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn read_list_item(&mut self, item: Node<'_, '_>, marker: String, ctx: Context) {
        let mut inner = ctx;
        if let Some(decls) = item.attribute("style").map(Declarations::parse) {
            if let Some(alignment) = decls.alignment {
                inner.alignment = alignment;
            }
            if let Some(color) = decls.color {
                inner.color = Some(color);
            }
        }
        let spans = self.inline_spans(item, false, inner.italic);
        let mut flow = self.flow(spans, self.sheet.body_size, inner);
        flow.marker = Some(marker);
        flow.space_after = self.sheet.paragraph_spacing / 3.0;
        self.blocks.push(Block::Text(flow));
    }

    fn read_image(&mut self, node: Node<'_, '_>) -> Result<(), ConvertError> {
        let Some(src) = node.attribute("src") else {
            return Ok(());
        };
        let index = match self.by_source.get(src) {
            Some(&index) => index,
            None => {
                let (_, data) = decode_data_uri(src).ok_or_else(|| {
                    ConvertError::Render("image is not an inline data URI".to_string())
                })?;
                self.images.push(prepare_image(data, self.jpeg_quality)?);
                let index = self.images.len() - 1;
                self.by_source.insert(src.to_string(), index);
                index
            }
        };

        let style = node.attribute("style").unwrap_or_default();
        let (width, height) = match (css_inches(style, "width"), css_inches(style, "height")) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                let image = &self.images[index];
                let (w, h) = pixels_to_inches(image.width.0 as u32, image.height.0 as u32);
                let RenderedImage { width, height } =
                    scale_image(w, h, &self.sheet.page.content_box());
                (width, height)
            }
        };

        self.blocks.push(Block::Image {
            index,
            width: width * POINTS_PER_INCH,
            height: height * POINTS_PER_INCH,
        });
        Ok(())
    }

    fn inline_spans(&self, node: Node<'_, '_>, bold: bool, italic: bool) -> Vec<Span> {
        let mut spans = Vec::new();
        collect_spans_children(node, bold, italic, None, &mut spans);
        trim_spans(spans)
    }

    fn flow(&self, spans: Vec<Span>, size: f32, ctx: Context) -> TextFlow {
        TextFlow {
            spans,
            size,
            alignment: ctx.alignment,
            color: ctx.color,
            left: ctx.left,
            right: ctx.right,
            first_indent: 0.0,
            marker: None,
            space_before: 0.0,
            space_after: self.sheet.paragraph_spacing,
        }
    }
}

/// Turn image bytes into an XObject.
///
/// Baseline and progressive JPEGs in gray or RGB are embedded as they are.
/// Everything else is decoded, flattened on white and re-encoded as JPEG.
fn prepare_image(data: Vec<u8>, jpeg_quality: u8) -> Result<ImageXObject, ConvertError> {
    let reader = ImageReader::new(Cursor::new(&data))
        .with_guessed_format()
        .map_err(|e| ConvertError::Render(format!("failed to read image: {}", e)))?;

    if reader.format() == Some(ImageFormat::Jpeg)
        && let Some(color_space) = jpeg_color_space(&data)
    {
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| ConvertError::Render(format!("failed to read JPEG header: {}", e)))?;
        return Ok(dct_image(data, width, height, color_space));
    }

    let decoded = reader
        .decode()
        .map_err(|e| ConvertError::Render(format!("failed to decode image: {}", e)))?;
    let rgb = flatten_on_white(&decoded);
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality)
        .encode_image(&rgb)
        .map_err(|e| ConvertError::Render(format!("failed to encode JPEG: {}", e)))?;
    Ok(dct_image(jpeg, rgb.width(), rgb.height(), ColorSpace::Rgb))
}

fn dct_image(data: Vec<u8>, width: u32, height: u32, color_space: ColorSpace) -> ImageXObject {
    ImageXObject {
        width: Px(width as usize),
        height: Px(height as usize),
        color_space,
        bits_per_component: ColorBits::Bit8,
        interpolate: true,
        image_data: data,
        image_filter: Some(ImageFilter::DCT),
        smask: None,
        clipping_bbox: None,
    }
}

/// Color space of a JPEG that DCTDecode reads unchanged: Huffman-coded,
/// 8-bit, one or three components. CMYK and arithmetic coding give `None`.
fn jpeg_color_space(data: &[u8]) -> Option<ColorSpace> {
    if data.get(..2)? != [0xFF, 0xD8] {
        return None;
    }
    let mut i = 2;
    while i + 4 <= data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];
        if marker == 0xFF {
            i += 1;
            continue;
        }
        let length = usize::from(u16::from_be_bytes([data[i + 2], data[i + 3]]));
        match marker {
            0xC0..=0xC2 => {
                let precision = *data.get(i + 4)?;
                let components = *data.get(i + 9)?;
                return match (precision, components) {
                    (8, 1) => Some(ColorSpace::Greyscale),
                    (8, 3) => Some(ColorSpace::Rgb),
                    _ => None,
                };
            }
            0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF | 0xD9 | 0xDA => return None,
            _ => i += 2 + length,
        }
    }
    None
}

fn is_inline(tag: &str) -> bool {
    matches!(tag, "b" | "strong" | "i" | "em" | "span" | "br" | "a" | "u" | "small" | "sub" | "sup")
}

fn has_class(class_attr: &str, name: &str) -> bool {
    class_attr.split_ascii_whitespace().any(|c| c == name)
}

fn collect_spans_children(
    node: Node<'_, '_>,
    bold: bool,
    italic: bool,
    color: Option<Rgb>,
    out: &mut Vec<Span>,
) {
    for child in node.children() {
        if child.is_text() {
            if let Some(text) = child.text() {
                push_span(out, text, Style::from_flags(bold, italic), color);
            }
        } else if child.is_element() {
            collect_spans(child, bold, italic, color, out);
        }
    }
}

fn collect_spans(node: Node<'_, '_>, bold: bool, italic: bool, color: Option<Rgb>, out: &mut Vec<Span>) {
    let (mut bold, mut italic, mut color) = (bold, italic, color);
    match node.tag_name().name() {
        "br" => {
            out.push(Span {
                text: "\n".to_string(),
                style: Style::Regular,
                color: None,
            });
            return;
        }
        "b" | "strong" => bold = true,
        "i" | "em" => italic = true,
        _ => {}
    }
    if let Some(decls) = node.attribute("style").map(Declarations::parse) {
        bold = decls.bold.unwrap_or(bold);
        italic = decls.italic.unwrap_or(italic);
        color = decls.color.or(color);
    }
    collect_spans_children(node, bold, italic, color, out);
}

/// Append text with collapsed whitespace, merging into the previous span
/// when the style matches.
fn push_span(out: &mut Vec<Span>, text: &str, style: Style, color: Option<Rgb>) {
    let mut collapsed = String::with_capacity(text.len());
    let mut after_space = out
        .last()
        .is_some_and(|s| s.text.ends_with(' ') || s.text == "\n");
    for c in text.chars() {
        if c.is_ascii_whitespace() {
            if !after_space {
                collapsed.push(' ');
                after_space = true;
            }
        } else {
            collapsed.push(c);
            after_space = false;
        }
    }
    if collapsed.is_empty() {
        return;
    }
    match out.last_mut() {
        Some(last) if last.text != "\n" && last.style == style && last.color == color => {
            last.text.push_str(&collapsed)
        }
        _ => out.push(Span {
            text: collapsed,
            style,
            color,
        }),
    }
}

/// Drop leading and trailing whitespace of a span sequence.
fn trim_spans(mut spans: Vec<Span>) -> Vec<Span> {
    while let Some(first) = spans.first_mut() {
        let trimmed = first.text.trim_start_matches(' ').to_string();
        if trimmed.is_empty() || trimmed == "\n" {
            spans.remove(0);
        } else {
            first.text = trimmed;
            break;
        }
    }
    while let Some(last) = spans.last_mut() {
        let trimmed_len = last.text.trim_end_matches(' ').len();
        if trimmed_len == 0 || last.text == "\n" {
            spans.pop();
        } else {
            last.text.truncate(trimmed_len);
            break;
        }
    }
    spans
}

/// Read `name: X.XXin` from an inline style.
fn css_inches(style: &str, name: &str) -> Option<f32> {
    style.split(';').find_map(|declaration| {
        let (property, value) = declaration.split_once(':')?;
        if property.trim() != name {
            return None;
        }
        value.trim().strip_suffix("in")?.trim().parse::<f32>().ok()
    })
}

/// Composite transparent pixels over white; JPEG has no alpha channel.
fn flatten_on_white(image: &image::DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha)) / 255) as u8;
        rgb.put_pixel(x, y, image::Rgb([blend(r), blend(g), blend(b)]));
    }
    rgb
}

fn element_text(root: &Node<'_, '_>, tag: &str) -> Option<String> {
    root.descendants()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Scripts whose lines may break between any two characters.
fn breaks_anywhere(c: char) -> bool {
    matches!(
        u32::from(c),
        0x2E80..=0x303F | 0x3040..=0x9FFF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF | 0xFF00..=0xFFEF | 0x20000..=0x2FFFF
    )
}

/// A word: consecutive fragments with no break opportunity between them.
#[derive(Debug, Clone, Default)]
struct Word {
    fragments: Vec<Fragment>,
    width: f32,
    /// Width of the space before the word; zero when glued to the previous one.
    space: f32,
    glued: bool,
}

#[derive(Debug, Clone)]
struct Fragment {
    text: String,
    face: FaceId,
    color: Option<Rgb>,
    width: f32,
}

impl Word {
    fn push(&mut self, text: String, face: FaceId, color: Option<Rgb>, size: f32, book: &FontBook<'_>) {
        if self.fragments.is_empty() && !self.glued {
            self.space = book.width(face, " ", size);
        }
        let width = book.width(face, &text, size);
        self.width += width;
        self.fragments.push(Fragment {
            text,
            face,
            color,
            width,
        });
    }
}

enum Token {
    Word(Word),
    Break,
}

struct Tokenizer<'b, 'f> {
    book: &'b FontBook<'f>,
    size: f32,
    tokens: Vec<Token>,
    word: Word,
}

impl Tokenizer<'_, '_> {
    /// End the current word; the next one starts glued or after a space.
    /// A pending space is never undone by a later glue.
    fn end_word(&mut self, glued: bool) {
        if self.word.fragments.is_empty() {
            self.word.glued &= glued;
            return;
        }
        self.tokens.push(Token::Word(std::mem::take(&mut self.word)));
        self.word.glued = glued;
    }

    fn push(&mut self, text: String, face: FaceId, color: Option<Rgb>) {
        self.word.push(text, face, color, self.size, self.book);
    }
}

fn tokenize(spans: &[Span], size: f32, book: &FontBook<'_>) -> Vec<Token> {
    let mut tokenizer = Tokenizer {
        book,
        size,
        tokens: Vec::new(),
        word: Word::default(),
    };

    for span in spans {
        if span.text == "\n" {
            tokenizer.end_word(false);
            tokenizer.tokens.push(Token::Break);
            continue;
        }
        let mut pieces = span.text.split(' ').peekable();
        while let Some(piece) = pieces.next() {
            for (face, run) in book.runs(piece, span.style) {
                let mut pending = String::new();
                for c in run.chars() {
                    if breaks_anywhere(c) {
                        if !pending.is_empty() {
                            tokenizer.push(std::mem::take(&mut pending), face, span.color);
                        }
                        tokenizer.end_word(true);
                        tokenizer.push(c.to_string(), face, span.color);
                        tokenizer.end_word(true);
                    } else {
                        pending.push(c);
                    }
                }
                if !pending.is_empty() {
                    tokenizer.push(pending, face, span.color);
                }
            }
            if pieces.peek().is_some() {
                tokenizer.end_word(false);
            }
        }
    }
    tokenizer.end_word(false);
    tokenizer.tokens
}

/// Split a word wider than `max_width` into pieces that fit.
fn split_word(word: Word, max_width: f32, size: f32, book: &FontBook<'_>) -> Vec<Word> {
    let mut pieces = Vec::new();
    let mut current = Word {
        glued: word.glued,
        ..Word::default()
    };

    for fragment in word.fragments {
        for c in fragment.text.chars() {
            let mut buf = [0u8; 4];
            let text: &str = c.encode_utf8(&mut buf);
            let width = book.width(fragment.face, text, size);
            if current.width + width > max_width && !current.fragments.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current.glued = true;
            }
            match current.fragments.last_mut() {
                Some(last) if last.face == fragment.face && last.color == fragment.color => {
                    last.text.push(c);
                    last.width += width;
                    current.width += width;
                }
                _ => current.push(text.to_string(), fragment.face, fragment.color, size, book),
            }
        }
    }
    if !current.fragments.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[derive(Default)]
struct Line {
    words: Vec<Word>,
    width: f32,
    /// Last line of the paragraph or ended by a forced break.
    last: bool,
}

impl Line {
    /// Width of the line with `word` appended.
    fn width_with(&self, word: &Word) -> f32 {
        if self.words.is_empty() {
            word.width
        } else {
            self.width + word.space + word.width
        }
    }
}

fn break_lines(tokens: Vec<Token>, first_width: f32, width: f32, size: f32, book: &FontBook<'_>) -> Vec<Line> {
    let mut lines: Vec<Line> = Vec::new();
    let mut current = Line::default();
    let available = |lines: &Vec<Line>| if lines.is_empty() { first_width } else { width };

    for token in tokens {
        match token {
            Token::Break => {
                current.last = true;
                lines.push(std::mem::take(&mut current));
            }
            Token::Word(word) => {
                let max = available(&lines).max(size);
                let words = if word.width > max {
                    split_word(word, max, size, book)
                } else {
                    vec![word]
                };
                for word in words {
                    let max = available(&lines).max(size);
                    let needed = current.width_with(&word);
                    if needed > max && !current.words.is_empty() {
                        lines.push(std::mem::take(&mut current));
                        current.width = word.width;
                    } else {
                        current.width = needed;
                    }
                    current.words.push(word);
                }
            }
        }
    }

    if !current.words.is_empty() {
        current.last = true;
        lines.push(current);
    } else if let Some(last) = lines.last_mut() {
        last.last = true;
    }
    lines
}

/// Text drawn from an absolute position on the baseline.
struct Piece {
    x: f32,
    face: FaceId,
    color: [f32; 3],
    text: String,
}

enum Draw {
    Line {
        baseline: f32,
        size: f32,
        pieces: Vec<Piece>,
    },
    Image {
        index: usize,
        x: f32,
        bottom: f32,
        width: f32,
        height: f32,
    },
}

/// Content of one page.
#[derive(Default)]
struct PageContent {
    draws: Vec<Draw>,
}

struct Layout<'s, 'b, 'f> {
    sheet: &'s Stylesheet,
    book: &'b FontBook<'f>,
    page_width: f32,
    page_height: f32,
    margin: f32,
    pages: Vec<PageContent>,
    current: PageContent,
    /// Top of the free area on the current page.
    y: f32,
    /// Nothing placed on the current page yet.
    fresh: bool,
}

impl<'s, 'b, 'f> Layout<'s, 'b, 'f> {
    fn new(sheet: &'s Stylesheet, book: &'b FontBook<'f>) -> Self {
        let page_height = sheet.page.height * POINTS_PER_INCH;
        let margin = sheet.page.margin * POINTS_PER_INCH;
        Self {
            sheet,
            book,
            page_width: sheet.page.width * POINTS_PER_INCH,
            page_height,
            margin,
            pages: Vec::new(),
            current: PageContent::default(),
            y: page_height - margin,
            fresh: true,
        }
    }

    fn content_width(&self) -> f32 {
        self.page_width - 2.0 * self.margin
    }

    fn new_page(&mut self) {
        self.pages.push(std::mem::take(&mut self.current));
        self.y = self.page_height - self.margin;
        self.fresh = true;
    }

    fn place(&mut self, block: &Block) {
        match block {
            // Always a new page, even after an empty chapter.
            Block::PageBreak => self.new_page(),
            Block::Image {
                index,
                width,
                height,
            } => self.place_image(*index, *width, *height),
            Block::Text(flow) => self.place_text(flow),
        }
    }

    fn place_image(&mut self, index: usize, width: f32, height: f32) {
        let width = width.min(self.content_width());
        let height = height.min(self.page_height - 2.0 * self.margin);
        let spacing = self.sheet.paragraph_spacing;

        if self.y - height < self.margin && !self.fresh {
            self.new_page();
        }

        let x = self.margin + (self.content_width() - width) / 2.0;
        let bottom = self.y - height;
        self.current.draws.push(Draw::Image {
            index,
            x,
            bottom,
            width,
            height,
        });
        self.y = bottom - spacing;
        self.fresh = false;
    }

    fn place_text(&mut self, flow: &TextFlow) {
        let size = flow.size;
        let leading = size * self.sheet.line_height;
        let width = (self.content_width() - flow.left - flow.right).max(size);
        let lines = break_lines(
            tokenize(&flow.spans, size, self.book),
            (width - flow.first_indent).max(size),
            width,
            size,
            self.book,
        );
        let block_color = flow.color.map(|c| c.components()).unwrap_or([0.0; 3]);

        if !self.fresh {
            self.y -= flow.space_before;
        }

        for (number, line) in lines.iter().enumerate() {
            if self.y - leading < self.margin && !self.fresh {
                self.new_page();
            }
            let baseline = self.y - leading + (leading - size) / 2.0 + size * 0.2;
            let indent = if number == 0 { flow.first_indent } else { 0.0 };
            let available = width - indent;
            let slack = (available - line.width).max(0.0);

            let mut x = self.margin + flow.left + indent;
            let mut stretch = 0.0;
            match flow.alignment {
                Alignment::Start => {}
                Alignment::Center => x += slack / 2.0,
                Alignment::End => x += slack,
                Alignment::Justify => {
                    let gaps = line.words.iter().skip(1).filter(|w| !w.glued).count();
                    if !line.last && gaps > 0 {
                        stretch = slack / gaps as f32;
                    }
                }
            }

            let mut pieces = Vec::new();
            if number == 0
                && let Some(marker) = &flow.marker
            {
                let runs = self.book.runs(marker, Style::Regular);
                let marker_width: f32 = runs
                    .iter()
                    .map(|(face, text)| self.book.width(*face, text, size))
                    .sum();
                let mut marker_x = self.margin + flow.left - marker_width - MARKER_GAP;
                for (face, text) in runs {
                    let advance = self.book.width(face, &text, size);
                    pieces.push(Piece {
                        x: marker_x,
                        face,
                        color: block_color,
                        text,
                    });
                    marker_x += advance;
                }
            }

            self.line_pieces(line, x, stretch, block_color, &mut pieces);
            self.current.draws.push(Draw::Line {
                baseline,
                size,
                pieces,
            });
            self.y -= leading;
            self.fresh = false;
        }

        self.y -= flow.space_after;
    }

    /// Position every fragment of a line. A word after a gap carries its
    /// space as leading text so extracted text keeps word boundaries.
    fn line_pieces(&self, line: &Line, x: f32, stretch: f32, block_color: [f32; 3], out: &mut Vec<Piece>) {
        let mut cursor = x;
        for (index, word) in line.words.iter().enumerate() {
            let spaced = index > 0 && !word.glued;
            if spaced {
                cursor += stretch;
            }
            for (position, fragment) in word.fragments.iter().enumerate() {
                let color = fragment.color.map(|c| c.components()).unwrap_or(block_color);
                if spaced && position == 0 {
                    out.push(Piece {
                        x: cursor,
                        face: fragment.face,
                        color,
                        text: format!(" {}", fragment.text),
                    });
                    cursor += word.space + fragment.width;
                } else {
                    out.push(Piece {
                        x: cursor,
                        face: fragment.face,
                        color,
                        text: fragment.text.clone(),
                    });
                    cursor += fragment.width;
                }
            }
        }
    }

    /// Pages in order; a page opened by a break is kept even when empty.
    fn finish(mut self) -> Vec<PageContent> {
        self.pages.push(self.current);
        self.pages
    }
}

struct DocumentInfo<'a> {
    title: Option<&'a str>,
    author: Option<&'a str>,
    /// Text the trailer ID is derived from.
    seed: &'a str,
}

fn builtin_font(style: Style) -> BuiltinFont {
    match style {
        Style::Regular => BuiltinFont::Helvetica,
        Style::Bold => BuiltinFont::HelveticaBold,
        Style::Italic => BuiltinFont::HelveticaOblique,
        Style::BoldItalic => BuiltinFont::HelveticaBoldOblique,
    }
}

/// Add every face the pages draw with to the document.
fn embed_fonts(
    doc: &PdfDocumentReference,
    book: &FontBook<'_>,
    pages: &[PageContent],
) -> Result<HashMap<FaceId, IndirectFontRef>, ConvertError> {
    let used: BTreeSet<FaceId> = pages
        .iter()
        .flat_map(|page| &page.draws)
        .filter_map(|draw| match draw {
            Draw::Line { pieces, .. } => Some(pieces.iter().map(|p| p.face)),
            Draw::Image { .. } => None,
        })
        .flatten()
        .collect();

    let mut fonts = HashMap::with_capacity(used.len());
    for face in used {
        let font = match face {
            FaceId::Embedded(index) => {
                let file = book.file(index);
                tracing::debug!(font = file.label(), family = file.family(), "Embedding font");
                doc.add_external_font(file.data())
            }
            FaceId::Builtin(style) => doc.add_builtin_font(builtin_font(style)),
        }
        .map_err(|e| ConvertError::Render(format!("failed to add font: {}", e)))?;
        fonts.insert(face, font);
    }
    Ok(fonts)
}

fn draw_line(
    layer: &PdfLayerReference,
    fonts: &HashMap<FaceId, IndirectFontRef>,
    baseline: f32,
    size: f32,
    pieces: &[Piece],
) {
    layer.begin_text_section();
    let mut face: Option<FaceId> = None;
    let mut color: Option<[f32; 3]> = None;
    for piece in pieces {
        let Some(font) = fonts.get(&piece.face) else {
            continue;
        };
        if face != Some(piece.face) {
            layer.set_font(font, size);
            face = Some(piece.face);
        }
        if color != Some(piece.color) {
            let [r, g, b] = piece.color;
            layer.set_fill_color(Color::Rgb(printpdf::Rgb::new(r, g, b, None)));
            color = Some(piece.color);
        }
        layer.set_text_matrix(TextMatrix::Translate(Pt(piece.x), Pt(baseline)));
        layer.write_text(piece.text.as_str(), font);
    }
    layer.end_text_section();
}

fn draw_image(layer: &PdfLayerReference, image: &ImageXObject, x: f32, bottom: f32, width: f32, height: f32) {
    let scale_x = width / image.width.0.max(1) as f32;
    let scale_y = height / image.height.0.max(1) as f32;
    Image::from(image.clone()).add_to_layer(
        layer.clone(),
        ImageTransform {
            translate_x: Some(Mm::from(Pt(x))),
            translate_y: Some(Mm::from(Pt(bottom))),
            scale_x: Some(scale_x),
            scale_y: Some(scale_y),
            // One pixel is one point before scaling.
            dpi: Some(POINTS_PER_INCH),
            ..Default::default()
        },
    );
}

fn assemble(
    sheet: &Stylesheet,
    book: &FontBook<'_>,
    pages: &[PageContent],
    images: &[ImageXObject],
    info: &DocumentInfo<'_>,
) -> Result<Vec<u8>, ConvertError> {
    let page_width = Mm::from(Pt(sheet.page.width * POINTS_PER_INCH));
    let page_height = Mm::from(Pt(sheet.page.height * POINTS_PER_INCH));

    let doc = PdfDocument::empty(info.title.unwrap_or_default())
        .with_conformance(PdfConformance::default());
    let fonts = embed_fonts(&doc, book, pages)?;

    for page in pages {
        let (page_index, layer_index) = doc.add_page(page_width, page_height, "Content");
        let layer = doc.get_page(page_index).get_layer(layer_index);
        for draw in &page.draws {
            match draw {
                Draw::Line {
                    baseline,
                    size,
                    pieces,
                } => draw_line(&layer, &fonts, *baseline, *size, pieces),
                Draw::Image {
                    index,
                    x,
                    bottom,
                    width,
                    height,
                } => {
                    if let Some(image) = images.get(*index) {
                        draw_image(&layer, image, *x, *bottom, *width, *height);
                    }
                }
            }
        }
    }

    let pdf = doc
        .save_to_bytes()
        .map_err(|e| ConvertError::Render(format!("failed to save PDF: {}", e)))?;
    finalize(&pdf, info)
}

/// PDF text string: literal for ASCII, UTF-16BE with a byte order mark otherwise.
fn text_string(text: &str) -> Object {
    if text.is_ascii() {
        return Object::string_literal(text);
    }
    let mut bytes = vec![0xFE, 0xFF];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    Object::String(bytes, StringFormat::Hexadecimal)
}

/// Rewrite the saved file so equal input gives equal bytes: images merged
/// and numbered by first use, a fixed information dictionary, and a trailer
/// ID derived from the markup.
fn finalize(pdf: &[u8], info: &DocumentInfo<'_>) -> Result<Vec<u8>, ConvertError> {
    let mut doc = lopdf::Document::load_mem(pdf)
        .map_err(|e| ConvertError::Render(format!("failed to reload PDF: {}", e)))?;

    merge_images(&mut doc);

    let mut dictionary = Dictionary::new();
    dictionary.set("Producer", Object::string_literal(PRODUCER));
    if let Some(title) = info.title {
        dictionary.set("Title", text_string(title));
    }
    if let Some(author) = info.author {
        dictionary.set("Author", text_string(author));
    }
    let info_id = doc.add_object(dictionary);
    doc.trailer.set("Info", Object::Reference(info_id));

    let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, info.seed.as_bytes());
    let id = Object::String(id.as_bytes().to_vec(), StringFormat::Hexadecimal);
    doc.trailer.set("ID", Object::Array(vec![id.clone(), id]));

    doc.prune_objects();
    doc.renumber_objects();
    doc.compress();

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| ConvertError::Render(format!("failed to save PDF: {}", e)))?;
    Ok(out)
}

fn same_image(a: &Object, b: &Object) -> bool {
    match (a, b) {
        (Object::Stream(a), Object::Stream(b)) => {
            let dimension = |s: &lopdf::Stream, key: &[u8]| s.dict.get(key).and_then(Object::as_i64).ok();
            a.content == b.content
                && dimension(a, b"Width") == dimension(b, b"Width")
                && dimension(a, b"Height") == dimension(b, b"Height")
        }
        _ => false,
    }
}

/// Point every use of an identical image at one object, and lay image
/// objects out in order of first use.
fn merge_images(doc: &mut lopdf::Document) {
    // (resources id, name, image id), pages in order and names sorted.
    let mut uses: Vec<(ObjectId, Vec<u8>, ObjectId)> = Vec::new();
    for page_id in doc.get_pages().into_values() {
        let Ok(resources_id) = doc
            .get_dictionary(page_id)
            .and_then(|page| page.get(b"Resources"))
            .and_then(Object::as_reference)
        else {
            continue;
        };
        let Ok(xobjects) = doc
            .get_dictionary(resources_id)
            .and_then(|resources| resources.get(b"XObject"))
            .and_then(Object::as_dict)
        else {
            continue;
        };
        let mut entries: Vec<(Vec<u8>, ObjectId)> = xobjects
            .iter()
            .filter_map(|(name, object)| object.as_reference().ok().map(|id| (name.clone(), id)))
            .collect();
        entries.sort();
        uses.extend(entries.into_iter().map(|(name, id)| (resources_id, name, id)));
    }
    if uses.is_empty() {
        return;
    }

    // Reuse the writer's object numbers, sorted, as slots.
    let mut slots: Vec<ObjectId> = uses.iter().map(|(_, _, id)| *id).collect();
    slots.sort();
    slots.dedup();
    let mut originals: BTreeMap<ObjectId, Object> = slots
        .iter()
        .filter_map(|id| doc.objects.remove(id).map(|object| (*id, object)))
        .collect();

    let mut distinct: Vec<(Object, ObjectId)> = Vec::new();
    let mut assigned: HashMap<ObjectId, ObjectId> = HashMap::new();
    for (_, _, old) in &uses {
        if assigned.contains_key(old) {
            continue;
        }
        let Some(object) = originals.remove(old) else {
            continue;
        };
        let slot = match distinct.iter().find(|(seen, _)| same_image(seen, &object)) {
            Some((_, slot)) => *slot,
            None => {
                let slot = slots[distinct.len()];
                distinct.push((object, slot));
                slot
            }
        };
        assigned.insert(*old, slot);
    }
    for (object, slot) in distinct {
        doc.objects.insert(slot, object);
    }

    let mut rebuilt: BTreeMap<ObjectId, Dictionary> = BTreeMap::new();
    for (resources_id, name, old) in uses {
        if let Some(slot) = assigned.get(&old) {
            rebuilt
                .entry(resources_id)
                .or_default()
                .set(name, Object::Reference(*slot));
        }
    }
    for (resources_id, xobjects) in rebuilt {
        if let Ok(resources) = doc.get_dictionary_mut(resources_id) {
            resources.set("XObject", Object::Dictionary(xobjects));
        }
    }
}
