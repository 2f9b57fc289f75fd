//! Document synthesis.
//!
//! Combines the normalized chapters of a book into one self-contained
//! XHTML document: a fixed stylesheet, an optional title block, then every
//! chapter in reading order separated by page-break directives.

use super::extract::PackageMetadata;
use super::node::{BlockStyle, ContentNode, ImageData, ListMarker, NormalizedDocument, TextRun};
use super::scale::{ContentBox, RenderedImage, pixels_to_inches, scale_image};
use crate::error::ConvertError;
use base64::Engine;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::io::Cursor;

/// Page-break directive emitted before every chapter but the first.
pub const PAGE_BREAK: &str = r#"<div class="page-break" style="page-break-before: always;"></div>"#;

/// Page size and margins, in inches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    /// Page width.
    pub width: f32,
    /// Page height.
    pub height: f32,
    /// Margin on every side.
    pub margin: f32,
}

impl Default for PageGeometry {
    /// US Letter, half-inch margins.
    fn default() -> Self {
        Self {
            width: 8.5,
            height: 11.0,
            margin: 0.5,
        }
    }
}

impl PageGeometry {
    /// Area images are scaled into.
    pub fn content_box(&self) -> ContentBox {
        ContentBox {
            max_width: self.width - 2.0 * self.margin,
            max_height: self.height - 2.0 * self.margin,
            ..ContentBox::default()
        }
    }
}

/// Layout numbers shared by the synthesized CSS and the PDF renderer.
///
/// Font sizes and offsets are in points.
#[derive(Debug, Clone, PartialEq)]
pub struct Stylesheet {
    /// Page geometry.
    pub page: PageGeometry,
    /// CSS font stack.
    pub font_family: String,
    /// Body text size.
    pub body_size: f32,
    /// Line height as a multiple of the font size.
    pub line_height: f32,
    /// Sizes of `h1` to `h6`.
    pub heading_sizes: [f32; 6],
    /// Space below paragraphs.
    pub paragraph_spacing: f32,
    /// First-line indentation of indented paragraphs.
    pub indent: f32,
    /// Left offset of list items.
    pub list_indent: f32,
    /// Left and right offset of quotations.
    pub quote_indent: f32,
}

impl Default for Stylesheet {
    fn default() -> Self {
        Self {
            page: PageGeometry::default(),
            font_family: "Helvetica, Arial, sans-serif".to_string(),
            body_size: 11.0,
            line_height: 1.4,
            heading_sizes: [24.0, 20.0, 16.0, 14.0, 12.0, 11.0],
            paragraph_spacing: 6.0,
            indent: 18.0,
            list_indent: 18.0,
            quote_indent: 24.0,
        }
    }
}

impl Stylesheet {
    /// Font size of a heading level; out-of-range levels are clamped.
    pub fn heading_size(&self, level: u8) -> f32 {
        let index = usize::from(level.clamp(1, 6)) - 1;
        self.heading_sizes[index]
    }

    /// CSS text of the stylesheet.
    pub fn to_css(&self) -> String {
        let mut css = String::new();
        css.push_str(&format!(
            "@page {{ size: {}in {}in; margin: {}in; }}\n",
            self.page.width, self.page.height, self.page.margin
        ));
        css.push_str(&format!(
            "body {{ font-family: {}; font-size: {}pt; line-height: {}; }}\n",
            self.font_family, self.body_size, self.line_height
        ));
        for level in 1..=6u8 {
            css.push_str(&format!(
                "h{} {{ font-size: {}pt; font-weight: bold; margin: {}pt 0; }}\n",
                level,
                self.heading_size(level),
                self.paragraph_spacing
            ));
        }
        css.push_str(&format!(
            "p {{ margin: 0 0 {}pt 0; }}\n",
            self.paragraph_spacing
        ));
        css.push_str(&format!("p.indent {{ text-indent: {}pt; }}\n", self.indent));
        css.push_str(&format!(
            "ul, ol {{ margin: 0 0 {}pt {}pt; }}\n",
            self.paragraph_spacing, self.list_indent
        ));
        css.push_str(&format!(
            "blockquote {{ margin: 0 {0}pt {1}pt {0}pt; font-style: italic; }}\n",
            self.quote_indent, self.paragraph_spacing
        ));
        css.push_str(".page-break { page-break-before: always; }\n");
        css.push_str(&format!(
            ".figure {{ text-align: center; margin: {}pt 0; }}\n",
            self.paragraph_spacing
        ));
        css.push_str(".title-block { text-align: center; }\n");
        css
    }
}

/// Synthesis options.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthOptions {
    /// Layout numbers.
    pub stylesheet: Stylesheet,
    /// Emit a title/author block at the top of the first page.
    pub title_block: bool,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            stylesheet: Stylesheet::default(),
            title_block: true,
        }
    }
}

/// The single document handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedDocument {
    /// XHTML markup.
    pub markup: String,
    /// Number of chapters.
    pub chapters: usize,
    /// Number of inlined images.
    pub images: usize,
}

impl SynthesizedDocument {
    /// Number of page-break directives in the markup.
    pub fn page_breaks(&self) -> usize {
        self.markup.matches(PAGE_BREAK).count()
    }
}

/// Combine normalized chapters, in the given order, into one document.
///
/// Fails only when `documents` is empty.
pub fn synthesize(
    documents: &[NormalizedDocument],
    metadata: &PackageMetadata,
    options: &SynthOptions,
) -> Result<SynthesizedDocument, ConvertError> {
    if documents.is_empty() {
        return Err(ConvertError::Synthesis(
            "no content document could be extracted or normalized".to_string(),
        ));
    }

    let mut out = Markup::new(options.stylesheet.page.content_box());

    out.raw("<!DOCTYPE html>\n");
    let mut html_attributes = vec![("xmlns", "http://www.w3.org/1999/xhtml")];
    if let Some(language) = &metadata.language {
        html_attributes.push(("lang", language.as_str()));
    }
    out.start("html", &html_attributes);
    out.start("head", &[]);
    out.empty("meta", &[("charset", "utf-8")]);
    out.text_element("title", metadata.title.as_deref().unwrap_or("Untitled"), &[]);
    if let Some(author) = &metadata.author {
        out.empty("meta", &[("name", "author"), ("content", author.as_str())]);
    }
    out.text_element("style", &options.stylesheet.to_css(), &[]);
    out.end("head");
    out.start("body", &[]);

    if options.title_block && (metadata.title.is_some() || metadata.author.is_some()) {
        out.start("header", &[("class", "title-block")]);
        if let Some(title) = &metadata.title {
            out.text_element("h1", title, &[]);
        }
        if let Some(author) = &metadata.author {
            out.text_element("p", author, &[("class", "author")]);
        }
        out.end("header");
    }

    for (index, document) in documents.iter().enumerate() {
        if index > 0 {
            out.raw(PAGE_BREAK);
            out.raw("\n");
        }
        out.start("section", &[("class", "chapter")]);
        out.nodes(&document.nodes);
        out.end("section");
    }

    out.end("body");
    out.end("html");

    let images = out.images;
    let markup = out.finish()?;

    tracing::info!(
        chapters = documents.len(),
        images,
        bytes = markup.len(),
        "Synthesized document"
    );

    Ok(SynthesizedDocument {
        markup,
        chapters: documents.len(),
        images,
    })
}

/// XHTML writer with the node translations.
struct Markup {
    writer: Writer<Cursor<Vec<u8>>>,
    content_box: ContentBox,
    images: usize,
}

impl Markup {
    fn new(content_box: ContentBox) -> Self {
        Self {
            writer: Writer::new(Cursor::new(Vec::new())),
            content_box,
            images: 0,
        }
    }

    // Writes go to memory and cannot fail
    fn start(&mut self, name: &str, attributes: &[(&str, &str)]) {
        let mut elem = BytesStart::new(name);
        for attribute in attributes {
            elem.push_attribute(*attribute);
        }
        let _ = self.writer.write_event(Event::Start(elem));
    }

    fn end(&mut self, name: &str) {
        let _ = self.writer.write_event(Event::End(BytesEnd::new(name)));
        self.raw("\n");
    }

    fn empty(&mut self, name: &str, attributes: &[(&str, &str)]) {
        let mut elem = BytesStart::new(name);
        for attribute in attributes {
            elem.push_attribute(*attribute);
        }
        let _ = self.writer.write_event(Event::Empty(elem));
    }

    fn text(&mut self, text: &str) {
        let _ = self.writer.write_event(Event::Text(BytesText::new(text)));
    }

    fn raw(&mut self, markup: &str) {
        let _ = self
            .writer
            .write_event(Event::Text(BytesText::from_escaped(markup)));
    }

    fn text_element(&mut self, name: &str, text: &str, attributes: &[(&str, &str)]) {
        let mut elem = BytesStart::new(name);
        for attribute in attributes {
            elem.push_attribute(*attribute);
        }
        let _ = self.writer.write_event(Event::Start(elem));
        self.text(text);
        self.end(name);
    }

    fn nodes(&mut self, nodes: &[ContentNode]) {
        let mut index = 0;
        while index < nodes.len() {
            match &nodes[index] {
                ContentNode::Heading { level, text, style } => {
                    let tag = format!("h{}", (*level).clamp(1, 6));
                    let css = block_css(style);
                    self.text_element(&tag, text, &style_attribute(&css));
                }
                ContentNode::Paragraph { runs, style } => {
                    let css = block_css(style);
                    let mut attributes = style_attribute(&css);
                    if style.indent {
                        attributes.insert(0, ("class", "indent"));
                    }
                    self.start("p", &attributes);
                    self.runs(runs);
                    self.end("p");
                }
                ContentNode::ListItem { marker, .. } => {
                    let ordered = matches!(marker, ListMarker::Ordered(_));
                    let group = nodes[index..]
                        .iter()
                        .take_while(|n| match n {
                            ContentNode::ListItem { marker, .. } => {
                                matches!(marker, ListMarker::Ordered(_)) == ordered
                            }
                            _ => false,
                        })
                        .count();
                    self.list(&nodes[index..index + group], ordered);
                    index += group;
                    continue;
                }
                ContentNode::Image(image) => self.image(image),
                ContentNode::BlockQuote { runs, style } => {
                    let css = block_css(style);
                    self.start("blockquote", &style_attribute(&css));
                    self.start("p", &[]);
                    self.runs(runs);
                    self.end("p");
                    self.end("blockquote");
                }
            }
            index += 1;
        }
    }

    fn list(&mut self, items: &[ContentNode], ordered: bool) {
        let tag = if ordered { "ol" } else { "ul" };
        let start = match items.first() {
            Some(ContentNode::ListItem {
                marker: ListMarker::Ordered(n),
                ..
            }) => n.to_string(),
            _ => "1".to_string(),
        };
        if ordered {
            self.start(tag, &[("start", start.as_str())]);
        } else {
            self.start(tag, &[]);
        }

        for item in items {
            let ContentNode::ListItem { marker, runs, style } = item else {
                continue;
            };
            let css = block_css(style);
            let mut attributes = style_attribute(&css);
            let value = match marker {
                ListMarker::Ordered(n) => Some(n.to_string()),
                ListMarker::Unordered => None,
            };
            if let Some(value) = &value {
                attributes.insert(0, ("value", value.as_str()));
            }
            self.start("li", &attributes);
            self.runs(runs);
            self.end("li");
        }

        self.end(tag);
    }

    fn runs(&mut self, runs: &[TextRun]) {
        for run in runs {
            if run.is_line_break() {
                self.empty("br", &[]);
                continue;
            }

            let color = run.color.map(|c| format!("color: {};", c));
            if let Some(color) = &color {
                self.start("span", &[("style", color.as_str())]);
            }
            if run.bold {
                self.start("b", &[]);
            }
            if run.italic {
                self.start("i", &[]);
            }
            self.text(&run.text);
            if run.italic {
                let _ = self.writer.write_event(Event::End(BytesEnd::new("i")));
            }
            if run.bold {
                let _ = self.writer.write_event(Event::End(BytesEnd::new("b")));
            }
            if color.is_some() {
                let _ = self.writer.write_event(Event::End(BytesEnd::new("span")));
            }
        }
    }

    fn image(&mut self, image: &ImageData) {
        let (width, height) = pixels_to_inches(image.width, image.height);
        let RenderedImage { width, height } = scale_image(width, height, &self.content_box);

        let src = format!(
            "data:{};base64,{}",
            image.media_type,
            base64::engine::general_purpose::STANDARD.encode(&image.data)
        );
        let size = format!("width: {:.2}in; height: {:.2}in;", width, height);

        self.start("div", &[("class", "figure")]);
        self.empty(
            "img",
            &[
                ("src", src.as_str()),
                ("alt", image.alt.as_str()),
                ("style", size.as_str()),
            ],
        );
        self.end("div");
        self.images += 1;
    }

    fn finish(self) -> Result<String, ConvertError> {
        String::from_utf8(self.writer.into_inner().into_inner())
            .map_err(|e| ConvertError::Synthesis(format!("invalid UTF-8 in markup: {}", e)))
    }
}

/// Inline CSS for a block style; empty when everything is default.
fn block_css(style: &BlockStyle) -> String {
    let mut css = String::new();
    if style.alignment != Default::default() {
        css.push_str(&format!("text-align: {};", style.alignment.as_css()));
    }
    if let Some(color) = style.color {
        if !css.is_empty() {
            css.push(' ');
        }
        css.push_str(&format!("color: {};", color));
    }
    css
}

fn style_attribute(css: &str) -> Vec<(&'static str, &str)> {
    if css.is_empty() {
        Vec::new()
    } else {
        vec![("style", css)]
    }
}
