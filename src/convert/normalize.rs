//! Content document normalization.
//!
//! Walks the element tree of one content document and flattens it into
//! the block-level [`ContentNode`] sequence the synthesizer consumes.

use super::dom::{Dom, NodeRef};
use super::extract::{ContentDocument, Resources, file_name_of, parent_dir, resolve_href};
use super::heading::{HeadingPolicy, TextBlock, ends_sentence};
use super::node::{
    Alignment, BlockStyle, ContentNode, ImageData, ListMarker, NormalizedDocument, Rgb, TextRun,
    runs_text,
};
use super::style::{ClassRules, Declarations, class_marks_bold, class_marks_center, parse_color};
use base64::Engine;
use std::io::Cursor;

/// Elements whose content never reaches the page.
const SKIPPED: &[&str] = &["head", "script", "style", "noscript", "template", "title"];

/// Elements laid out as blocks.
const BLOCK_LEVEL: &[&str] = &[
    "address", "article", "aside", "blockquote", "body", "caption", "center", "dd", "details",
    "div", "dl", "dt", "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3",
    "h4", "h5", "h6", "header", "hgroup", "hr", "html", "li", "main", "nav", "ol", "p", "pre",
    "section", "summary", "table", "tbody", "td", "tfoot", "th", "thead", "tr", "ul",
];

/// Turns content documents into [`NormalizedDocument`]s.
pub struct Normalizer<'a> {
    resources: &'a Resources,
    class_rules: &'a ClassRules,
    heading_policy: &'a dyn HeadingPolicy,
}

impl<'a> Normalizer<'a> {
    /// Create a normalizer over the resources of one package.
    pub fn new(
        resources: &'a Resources,
        class_rules: &'a ClassRules,
        heading_policy: &'a dyn HeadingPolicy,
    ) -> Self {
        Self {
            resources,
            class_rules,
            heading_policy,
        }
    }

    /// Normalize one content document.
    ///
    /// Markup that is not well-formed XML is recovered by the HTML parser;
    /// unresolvable images and unsupported styling are dropped with a log
    /// entry.
    pub fn normalize(&self, doc: &ContentDocument) -> NormalizedDocument {
        let (dom, syntax) = Dom::parse(&doc.markup);

        let root = dom.root_element();
        let body = root
            .descendants()
            .find(|n| n.tag() == "body")
            .unwrap_or(root);

        let has_headings = body
            .descendants()
            .any(|n| heading_level(n.tag()).is_some());

        let mut walker = Walker {
            normalizer: self,
            doc_dir: parent_dir(&doc.path),
            doc_path: &doc.path,
            use_heuristic: !has_headings,
            nodes: Vec::new(),
        };

        let body_style = walker.container_style(&body, BlockStyle::default());
        walker.walk_blocks(body, body_style);

        tracing::debug!(
            path = %doc.path,
            syntax = ?syntax,
            nodes = walker.nodes.len(),
            "Normalized content document"
        );

        NormalizedDocument {
            position: doc.position,
            nodes: walker.nodes,
        }
    }

    /// Style declarations of one element, lowest precedence first:
    /// class-name heuristics, stylesheet class rules, presentational
    /// attributes, inline `style`.
    fn declarations(&self, node: &NodeRef<'_>) -> Declarations {
        let tag = node.tag();
        let mut decls = Declarations::default();

        if let Some(class) = node.attribute("class") {
            if class_marks_bold(class) {
                decls.bold = Some(true);
            }
            if class_marks_center(class) {
                decls.alignment = Some(Alignment::Center);
            }
            decls.merge(&self.class_rules.lookup(tag, class));
        }

        if let Some(alignment) = node.attribute("align").and_then(Alignment::parse) {
            decls.alignment = Some(alignment);
        }
        if tag == "center" {
            decls.alignment = Some(Alignment::Center);
        }
        if tag == "font"
            && let Some(color) = node.attribute("color").and_then(parse_color)
        {
            decls.color = Some(color);
        }

        if let Some(style) = node.attribute("style") {
            decls.merge(&Declarations::parse(style));
        }

        decls
    }
}

/// Inline formatting in effect while collecting text.
#[derive(Debug, Clone, Copy, Default)]
struct InlineState {
    bold: bool,
    italic: bool,
    color: Option<Rgb>,
    preserve_whitespace: bool,
}

impl InlineState {
    fn apply(mut self, decls: &Declarations) -> Self {
        if let Some(bold) = decls.bold {
            self.bold = bold;
        }
        if let Some(italic) = decls.italic {
            self.italic = italic;
        }
        if let Some(color) = decls.color {
            self.color = Some(color);
        }
        self
    }
}

/// Piece of a text block: styled text, or an image that interrupts it.
enum Segment {
    Runs(Vec<TextRun>),
    Image(ImageData),
}

/// Accumulates inline content with HTML whitespace collapsing.
struct Collector<'a> {
    segments: Vec<Segment>,
    runs: Vec<TextRun>,
    /// Last emitted character was collapsible space, or nothing emitted yet.
    after_space: bool,
    /// Lists found inside inline content, processed after the block.
    deferred_lists: Vec<NodeRef<'a>>,
}

impl<'a> Collector<'a> {
    fn new() -> Self {
        Self {
            segments: Vec::new(),
            runs: Vec::new(),
            after_space: true,
            deferred_lists: Vec::new(),
        }
    }

    fn push_text(&mut self, text: &str, state: &InlineState) {
        let mut out = String::with_capacity(text.len());

        for c in text.chars() {
            if state.preserve_whitespace {
                match c {
                    '\r' => {}
                    '\n' => {
                        self.push_run(std::mem::take(&mut out), state);
                        self.line_break();
                    }
                    c => {
                        out.push(c);
                        self.after_space = false;
                    }
                }
            } else if c.is_ascii_whitespace() {
                if !self.after_space {
                    out.push(' ');
                    self.after_space = true;
                }
            } else {
                out.push(c);
                self.after_space = false;
            }
        }

        self.push_run(out, state);
    }

    fn push_run(&mut self, text: String, state: &InlineState) {
        if text.is_empty() {
            return;
        }
        let run = TextRun {
            text,
            bold: state.bold,
            italic: state.italic,
            color: state.color,
        };
        match self.runs.last_mut() {
            Some(last) if !last.is_line_break() && last.same_style(&run) => {
                last.text.push_str(&run.text)
            }
            _ => self.runs.push(run),
        }
    }

    fn line_break(&mut self) {
        self.trim_trailing_space();
        self.runs.push(TextRun::plain("\n"));
        self.after_space = true;
    }

    /// Make sure the next text starts a new word.
    fn separate(&mut self) {
        if !self.after_space {
            self.push_text(" ", &InlineState::default());
        }
    }

    fn push_image(&mut self, image: ImageData) {
        self.close_runs();
        self.segments.push(Segment::Image(image));
    }

    fn trim_trailing_space(&mut self) {
        while let Some(last) = self.runs.last_mut() {
            if last.is_line_break() {
                break;
            }
            let trimmed_len = last.text.trim_end_matches(' ').len();
            last.text.truncate(trimmed_len);
            if last.text.is_empty() {
                self.runs.pop();
            } else {
                break;
            }
        }
    }

    fn close_runs(&mut self) {
        self.trim_trailing_space();
        // Drop leading/trailing forced breaks
        while self.runs.last().is_some_and(TextRun::is_line_break) {
            self.runs.pop();
        }
        let start = self
            .runs
            .iter()
            .position(|r| !r.is_line_break())
            .unwrap_or(self.runs.len());
        self.runs.drain(..start);

        if !self.runs.is_empty() {
            self.segments
                .push(Segment::Runs(std::mem::take(&mut self.runs)));
        }
        self.after_space = true;
    }

    fn is_empty(&self) -> bool {
        self.segments.is_empty()
            && self.runs.iter().all(|r| r.text.trim().is_empty())
            && self.deferred_lists.is_empty()
    }

    fn finish(mut self) -> (Vec<Segment>, Vec<NodeRef<'a>>) {
        self.close_runs();
        (self.segments, self.deferred_lists)
    }
}

/// Per-document traversal state.
struct Walker<'n, 'd> {
    normalizer: &'n Normalizer<'n>,
    doc_dir: &'d str,
    doc_path: &'d str,
    use_heuristic: bool,
    nodes: Vec<ContentNode>,
}

impl<'n, 'd> Walker<'n, 'd> {
    /// Style a container passes down: color and alignment, never indent.
    fn container_style(&self, node: &NodeRef<'_>, inherited: BlockStyle) -> BlockStyle {
        let decls = self.normalizer.declarations(node);
        BlockStyle {
            color: decls.color.or(inherited.color),
            alignment: decls.alignment.unwrap_or(inherited.alignment),
            indent: false,
        }
    }

    fn block_style(decls: &Declarations, inherited: BlockStyle) -> BlockStyle {
        BlockStyle {
            color: decls.color.or(inherited.color),
            alignment: decls.alignment.unwrap_or(inherited.alignment),
            indent: decls.indent.unwrap_or(false),
        }
    }

    /// Walk the children of a container, emitting one node per block.
    fn walk_blocks(&mut self, parent: NodeRef<'_>, inherited: BlockStyle) {
        let mut loose = Collector::new();
        let loose_state = InlineState::default();

        for child in parent.children() {
            if child.is_text() {
                if let Some(text) = child.text() {
                    loose.push_text(text, &loose_state);
                }
                continue;
            }
            if !child.is_element() {
                continue;
            }

            let tag = child.tag();
            if SKIPPED.contains(&tag) {
                continue;
            }

            if !BLOCK_LEVEL.contains(&tag) {
                self.collect_node(child, loose_state, &mut loose);
                continue;
            }

            // A block ends the anonymous paragraph before it
            let pending = std::mem::replace(&mut loose, Collector::new());
            self.emit_text_block(pending, inherited, true);

            self.walk_block(child, tag, inherited);
        }

        self.emit_text_block(loose, inherited, true);
    }

    fn walk_block(&mut self, node: NodeRef<'_>, tag: &str, inherited: BlockStyle) {
        let decls = self.normalizer.declarations(&node);
        let style = Self::block_style(&decls, inherited);

        if let Some(level) = heading_level(tag) {
            self.emit_heading(node, level, &decls, style);
            return;
        }

        match tag {
            "hr" => {}
            "ul" | "ol" => self.walk_list(node, inherited),
            "li" => {
                let list_style = self.container_style(&node, inherited);
                self.emit_list_item(node, ListMarker::Unordered, list_style);
            }
            "blockquote" => self.emit_blockquote(node, &decls, style),
            "pre" => {
                let state = InlineState {
                    preserve_whitespace: true,
                    ..InlineState::default()
                }
                .apply(&decls);
                let mut collector = Collector::new();
                self.collect_children(node, state, &mut collector);
                self.emit_text_block(collector, style, false);
            }
            _ if has_block_children(&node) => {
                let container = self.container_style(&node, inherited);
                self.walk_blocks(node, container);
            }
            _ => {
                let state = InlineState::default().apply(&decls);
                let mut collector = Collector::new();
                self.collect_children(node, state, &mut collector);
                let candidate = matches!(tag, "p" | "div" | "center");
                self.emit_text_block(collector, style, candidate);
            }
        }
    }

    fn emit_heading(&mut self, node: NodeRef<'_>, level: u8, decls: &Declarations, style: BlockStyle) {
        let mut collector = Collector::new();
        let state = InlineState::default().apply(decls);
        self.collect_children(node, state, &mut collector);
        let (segments, lists) = collector.finish();

        let mut text = String::new();
        let mut images = Vec::new();
        for segment in segments {
            match segment {
                Segment::Runs(runs) => {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(&runs_text(&runs).replace('\n', " "));
                }
                Segment::Image(image) => images.push(image),
            }
        }

        if !text.is_empty() {
            self.nodes.push(ContentNode::Heading { level, text, style });
        }
        self.nodes.extend(images.into_iter().map(ContentNode::Image));
        for list in lists {
            self.walk_list(list, style);
        }
    }

    fn emit_blockquote(&mut self, node: NodeRef<'_>, decls: &Declarations, style: BlockStyle) {
        let mut collector = Collector::new();
        let state = InlineState::default().apply(decls);
        self.collect_children(node, state, &mut collector);
        let (segments, lists) = collector.finish();

        for segment in segments {
            match segment {
                Segment::Runs(runs) => self.nodes.push(ContentNode::BlockQuote { runs, style }),
                Segment::Image(image) => self.nodes.push(ContentNode::Image(image)),
            }
        }
        for list in lists {
            self.walk_list(list, style);
        }
    }

    fn walk_list(&mut self, list: NodeRef<'_>, inherited: BlockStyle) {
        let ordered = list.tag() == "ol";
        let style = self.container_style(&list, inherited);
        let mut ordinal = list
            .attribute("start")
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(1);

        for child in list.children().filter(|n| n.is_element()) {
            match child.tag() {
                "li" => {
                    if let Some(value) = child
                        .attribute("value")
                        .and_then(|s| s.trim().parse::<u32>().ok())
                    {
                        ordinal = value;
                    }
                    let marker = if ordered {
                        ListMarker::Ordered(ordinal)
                    } else {
                        ListMarker::Unordered
                    };
                    ordinal = ordinal.saturating_add(1);
                    self.emit_list_item(child, marker, style);
                }
                "ul" | "ol" => self.walk_list(child, style),
                _ => {}
            }
        }
    }

    fn emit_list_item(&mut self, item: NodeRef<'_>, marker: ListMarker, inherited: BlockStyle) {
        let decls = self.normalizer.declarations(&item);
        let style = Self::block_style(&decls, inherited);
        let mut collector = Collector::new();
        self.collect_children(item, InlineState::default().apply(&decls), &mut collector);
        let (segments, lists) = collector.finish();

        let mut marker = Some(marker);
        for segment in segments {
            match segment {
                Segment::Runs(runs) => match marker.take() {
                    Some(marker) => self.nodes.push(ContentNode::ListItem {
                        marker,
                        runs,
                        style,
                    }),
                    // Text after an image inside the same item
                    None => self.nodes.push(ContentNode::Paragraph {
                        runs,
                        style: BlockStyle {
                            indent: false,
                            ..style
                        },
                    }),
                },
                Segment::Image(image) => self.nodes.push(ContentNode::Image(image)),
            }
        }
        for list in lists {
            self.walk_list(list, style);
        }
    }

    /// Emit paragraphs (or heuristic headings) and images of a text block.
    fn emit_text_block(&mut self, collector: Collector<'_>, style: BlockStyle, candidate: bool) {
        if collector.is_empty() {
            return;
        }
        let (segments, lists) = collector.finish();

        let mut first = true;
        for segment in segments {
            match segment {
                Segment::Runs(runs) => {
                    let style = if first {
                        style
                    } else {
                        BlockStyle {
                            indent: false,
                            ..style
                        }
                    };
                    first = false;

                    if candidate
                        && self.use_heuristic
                        && let Some(heading) = self.classify(&runs, style)
                    {
                        self.nodes.push(heading);
                        continue;
                    }
                    self.nodes.push(ContentNode::Paragraph { runs, style });
                }
                Segment::Image(image) => self.nodes.push(ContentNode::Image(image)),
            }
        }
        for list in lists {
            self.walk_list(list, style);
        }
    }

    fn classify(&self, runs: &[TextRun], style: BlockStyle) -> Option<ContentNode> {
        if runs.iter().any(TextRun::is_line_break) {
            return None;
        }
        let text = runs_text(runs);
        let block = TextBlock {
            text: &text,
            continues_paragraph: self.continues_paragraph(),
        };
        let level = self.normalizer.heading_policy.classify(&block)?;
        Some(ContentNode::Heading {
            level,
            text: text.trim().to_string(),
            style,
        })
    }

    fn continues_paragraph(&self) -> bool {
        match self.nodes.last() {
            Some(ContentNode::Paragraph { runs, .. }) => !ends_sentence(&runs_text(runs)),
            _ => false,
        }
    }

    fn collect_children<'a>(
        &self,
        node: NodeRef<'a>,
        state: InlineState,
        collector: &mut Collector<'a>,
    ) {
        for child in node.children() {
            self.collect_node(child, state, collector);
        }
    }

    fn collect_node<'a>(
        &self,
        node: NodeRef<'a>,
        state: InlineState,
        collector: &mut Collector<'a>,
    ) {
        if node.is_text() {
            if let Some(text) = node.text() {
                collector.push_text(text, &state);
            }
            return;
        }
        if !node.is_element() {
            return;
        }

        let tag = node.tag();
        match tag {
            t if SKIPPED.contains(&t) => {}
            "br" => collector.line_break(),
            "img" | "image" => {
                if let Some(image) = self.resolve_image(&node) {
                    collector.push_image(image);
                }
            }
            "ul" | "ol" => collector.deferred_lists.push(node),
            _ => {
                let decls = self.normalizer.declarations(&node);
                let mut inner = state;
                match tag {
                    "b" | "strong" => inner.bold = true,
                    "i" | "em" | "cite" | "var" | "dfn" => inner.italic = true,
                    "pre" => inner.preserve_whitespace = true,
                    _ => {}
                }
                let inner = inner.apply(&decls);

                let is_block = BLOCK_LEVEL.contains(&tag);
                if is_block {
                    collector.separate();
                }
                self.collect_children(node, inner, collector);
                if is_block {
                    collector.separate();
                }
            }
        }
    }

    fn resolve_image(&self, node: &NodeRef<'_>) -> Option<ImageData> {
        let src = node
            .attribute("src")
            .or_else(|| node.attribute("href"))?
            .trim();
        let alt = node.attribute("alt").unwrap_or_default().trim().to_string();

        let (media_type, data) = if src.starts_with("data:") {
            match decode_data_uri(src) {
                Some(decoded) => decoded,
                None => {
                    tracing::warn!(document = %self.doc_path, "Undecodable data URI image dropped");
                    return None;
                }
            }
        } else if src.contains("://") {
            tracing::warn!(document = %self.doc_path, src = %src, "Remote image dropped");
            return None;
        } else {
            let path = resolve_href(self.doc_dir, src);
            let resources = self.normalizer.resources;
            let Some(resource) = resources
                .image(&path)
                .or_else(|| resources.image_by_file_name(file_name_of(&path)))
            else {
                tracing::warn!(document = %self.doc_path, src = %src, "Image not found in EPUB resources");
                return None;
            };
            (resource.media_type.clone(), resource.data.clone())
        };

        let dimensions = image::ImageReader::new(Cursor::new(&data))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_dimensions().ok());

        match dimensions {
            Some((width, height)) if width > 0 && height > 0 => Some(ImageData {
                data,
                media_type,
                width,
                height,
                alt,
            }),
            _ => {
                tracing::warn!(document = %self.doc_path, src = %src, "Unreadable or empty image dropped");
                None
            }
        }
    }
}

fn heading_level(tag: &str) -> Option<u8> {
    match tag {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn has_block_children(node: &NodeRef<'_>) -> bool {
    node.children()
        .filter(|c| c.is_element())
        .any(|c| BLOCK_LEVEL.contains(&c.tag()))
}

/// Decode a base64 `data:` URI into (media type, bytes).
pub(crate) fn decode_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let (header, payload) = uri.strip_prefix("data:")?.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let data = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .ok()?;
    let media_type = if media_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        media_type.to_ascii_lowercase()
    };
    Some((media_type, data))
}
