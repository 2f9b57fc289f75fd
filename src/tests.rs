use crate::config::Config;
use crate::convert::heading::ends_sentence;
use crate::convert::node::{
    Alignment, BlockStyle, ContentNode, ImageData, ListMarker, NormalizedDocument, Rgb, TextRun,
    runs_text,
};
use crate::convert::scale::{ContentBox, pixels_to_inches, scale_image};
use crate::convert::{
    ClassRules, ContentDocument, Converter, Declarations, FaceId, FileSnapshot, FontBook,
    FontFile, FontSet, HeadingPolicy, MemorySnapshot, NoHeadings, Normalizer, PAGE_BREAK,
    PackageMetadata, Renderer, Resource, ResourceKind, Resources, ShortUppercaseBlocks,
    SnapshotSink, Style, SynthOptions, TextBlock, class_marks_bold, class_marks_center, extract,
    parse_color, resolve_encoding, synthesize,
};
use crate::error::{AppError, ConvertError};
use crate::server::{AppState, create_router};
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use std::io::{Cursor, Write};
use tower::ServiceExt;

// ============================================================================
// FIXTURES
// ============================================================================

const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Package document with `(id, href, media type)` manifest items.
fn opf(title: &str, author: &str, manifest: &[(&str, &str, &str)], spine: &[&str]) -> String {
    let items: String = manifest
        .iter()
        .map(|(id, href, media)| {
            format!(r#"    <item id="{}" href="{}" media-type="{}"/>"#, id, href, media) + "\n"
        })
        .collect();
    let itemrefs: String = spine
        .iter()
        .map(|id| format!(r#"    <itemref idref="{}"/>"#, id) + "\n")
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:uuid:test</dc:identifier>
    <dc:title>{}</dc:title>
    <dc:creator>{}</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>
{}  </manifest>
  <spine>
{}  </spine>
</package>"#,
        title, author, items, itemrefs
    )
}

/// XHTML content document around `body`.
fn xhtml(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>Chapter</title></head>
<body>{}</body>
</html>"#,
        body
    )
}

/// Zip an EPUB from archive entries (the mimetype and container are added).
fn build_epub(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let stored = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    let deflated = zip::write::SimpleFileOptions::default();

    writer.start_file("mimetype", stored).unwrap();
    writer.write_all(b"application/epub+zip").unwrap();
    writer.start_file("META-INF/container.xml", deflated).unwrap();
    writer.write_all(CONTAINER.as_bytes()).unwrap();

    for (name, data) in entries {
        writer.start_file(*name, deflated).unwrap();
        writer.write_all(data).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

/// Two-chapter book with headings and paragraphs.
fn sample_epub() -> Vec<u8> {
    let package = opf(
        "Sample Book",
        "Jane Writer",
        &[
            ("ch1", "ch1.xhtml", "application/xhtml+xml"),
            ("ch2", "ch2.xhtml", "application/xhtml+xml"),
        ],
        &["ch1", "ch2"],
    );
    let ch1 = xhtml(
        "<h1>Chapter One</h1><p>The first chapter begins here.</p><p>It has <b>bold</b> and <i>italic</i> words.</p>",
    );
    let ch2 = xhtml("<h1>Chapter Two</h1><p>The second chapter follows.</p>");
    build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/ch1.xhtml", ch1.as_bytes()),
        ("OEBPS/ch2.xhtml", ch2.as_bytes()),
    ])
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn content_document(path: &str, body: &str) -> ContentDocument {
    ContentDocument {
        position: 0,
        path: path.to_string(),
        markup: xhtml(body),
        encoding: encoding_rs::UTF_8,
    }
}

fn normalize_with(
    body: &str,
    resources: &Resources,
    rules: &ClassRules,
    policy: &dyn HeadingPolicy,
) -> NormalizedDocument {
    let doc = content_document("OEBPS/text/ch1.xhtml", body);
    Normalizer::new(resources, rules, policy).normalize(&doc)
}

/// Normalize a whole document given as raw markup.
fn normalize_markup(markup: &str, resources: &Resources) -> NormalizedDocument {
    let doc = ContentDocument {
        position: 0,
        path: "OEBPS/chapter.html".to_string(),
        markup: markup.to_string(),
        encoding: encoding_rs::UTF_8,
    };
    Normalizer::new(resources, &ClassRules::default(), &NoHeadings).normalize(&doc)
}

fn normalize(body: &str) -> NormalizedDocument {
    normalize_with(
        body,
        &Resources::default(),
        &ClassRules::default(),
        &ShortUppercaseBlocks::default(),
    )
}

fn normalize_plain(body: &str) -> NormalizedDocument {
    normalize_with(body, &Resources::default(), &ClassRules::default(), &NoHeadings)
}

fn image_resources(path: &str, data: Vec<u8>) -> Resources {
    let mut resources = Resources::default();
    resources.insert(
        path,
        Resource {
            media_type: "image/png".to_string(),
            kind: ResourceKind::Image,
            data,
        },
    );
    resources
}

fn paragraph_text(node: &ContentNode) -> String {
    match node {
        ContentNode::Paragraph { runs, .. }
        | ContentNode::ListItem { runs, .. }
        | ContentNode::BlockQuote { runs, .. } => runs_text(runs),
        ContentNode::Heading { text, .. } => text.clone(),
        ContentNode::Image(_) => String::new(),
    }
}

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-4,
        "expected {} to be close to {}",
        actual,
        expected
    );
}

// ============================================================================
// IMAGE SCALING
// ============================================================================

#[test]
fn scale_wide_image_to_max_width() {
    let scaled = scale_image(15.0, 5.0, &ContentBox::default());
    assert_close(scaled.width, 7.5);
    assert_close(scaled.height, 2.5);
}

#[test]
fn scale_tall_image_to_max_height() {
    let scaled = scale_image(5.0, 20.0, &ContentBox::default());
    assert_close(scaled.width, 2.5);
    assert_close(scaled.height, 10.0);
}

#[test]
fn scale_applies_width_then_height() {
    let scaled = scale_image(30.0, 60.0, &ContentBox::default());
    assert_close(scaled.width, 5.0);
    assert_close(scaled.height, 10.0);
}

#[test]
fn scale_leaves_conforming_image_alone() {
    let scaled = scale_image(3.0, 2.0, &ContentBox::default());
    assert_close(scaled.width, 3.0);
    assert_close(scaled.height, 2.0);
}

#[test]
fn scale_widens_small_image_keeping_aspect() {
    let scaled = scale_image(0.5, 0.25, &ContentBox::default());
    assert_close(scaled.width, 1.0);
    assert_close(scaled.height, 0.5);
}

#[test]
fn scale_thin_image_distorts_at_height_cap() {
    let scaled = scale_image(0.5, 20.0, &ContentBox::default());
    assert_close(scaled.width, 1.0);
    assert_close(scaled.height, 10.0);
}

#[test]
fn scale_results_stay_in_bounds() {
    let bounds = ContentBox::default();
    let sizes = [
        (1.2, 0.8),
        (8.0, 1.0),
        (20.0, 30.0),
        (7.5, 10.0),
        (100.0, 3.0),
        (2.0, 11.0),
    ];

    for (width, height) in sizes {
        let scaled = scale_image(width, height, &bounds);
        assert!(scaled.width <= bounds.max_width, "{}x{}", width, height);
        assert!(scaled.height <= bounds.max_height, "{}x{}", width, height);
        assert!(scaled.width >= bounds.min_width, "{}x{}", width, height);

        let before = height / width;
        let after = scaled.height / scaled.width;
        assert!((before - after).abs() / before < 1e-3, "{}x{}", width, height);

        // Already within bounds: scaling again changes nothing
        let again = scale_image(scaled.width, scaled.height, &bounds);
        assert_close(again.width, scaled.width);
        assert_close(again.height, scaled.height);
    }
}

#[test]
fn scale_pixels_to_inches() {
    let (width, height) = pixels_to_inches(960, 480);
    assert_close(width, 10.0);
    assert_close(height, 5.0);
}

// ============================================================================
// HEADING DETECTION
// ============================================================================

fn block(text: &str) -> TextBlock<'_> {
    TextBlock {
        text,
        continues_paragraph: false,
    }
}

#[test]
fn heading_short_uppercase_block() {
    let policy = ShortUppercaseBlocks::default();
    assert_eq!(policy.classify(&block("Chapter One")), Some(2));
    assert_eq!(policy.classify(&block("chapter one")), None);
    assert_eq!(policy.classify(&block("   ")), None);
    assert_eq!(policy.classify(&block(&"A".repeat(100))), None);
    assert_eq!(policy.classify(&block(&"A".repeat(99))), Some(2));
}

#[test]
fn heading_continuation_stays_paragraph() {
    let policy = ShortUppercaseBlocks::default();
    let continued = TextBlock {
        text: "Continued Text",
        continues_paragraph: true,
    };
    assert_eq!(policy.classify(&continued), None);
}

#[test]
fn heading_level_is_clamped() {
    let policy = ShortUppercaseBlocks {
        max_chars: 50,
        level: 9,
    };
    assert_eq!(policy.classify(&block("Prologue")), Some(6));
}

#[test]
fn heading_disabled_policy() {
    assert_eq!(NoHeadings.classify(&block("Chapter One")), None);
}

#[test]
fn heading_sentence_endings() {
    assert!(ends_sentence("It ended."));
    assert!(ends_sentence("Did it?\u{201d}"));
    assert!(ends_sentence("終わり。"));
    assert!(ends_sentence(""));
    assert!(!ends_sentence("and then"));
    assert!(!ends_sentence("a list,"));
}

// ============================================================================
// STYLES
// ============================================================================

#[test]
fn style_class_name_heuristics() {
    for class in ["mybold", "fw-bold", "strongtext", "x BOLD y"] {
        assert!(class_marks_bold(class), "{}", class);
    }
    for class in ["text-large", "x1", ""] {
        assert!(!class_marks_bold(class), "{}", class);
    }
    for class in ["centered", "center-aligned", "TextCenter"] {
        assert!(class_marks_center(class), "{}", class);
    }
    assert!(!class_marks_center("middle"));
}

#[test]
fn style_declarations_parse() {
    let decls = Declarations::parse(
        "color: #FF0000; text-align: Center; text-indent: 2em; font-weight: 700; font-style: italic; unknown: 1",
    );
    assert_eq!(decls.color, Some(Rgb::new(255, 0, 0)));
    assert_eq!(decls.alignment, Some(Alignment::Center));
    assert_eq!(decls.indent, Some(true));
    assert_eq!(decls.bold, Some(true));
    assert_eq!(decls.italic, Some(true));
}

#[test]
fn style_declarations_explicit_defaults() {
    let decls = Declarations::parse("text-indent: 0; font-weight: normal; margin-left: auto");
    assert_eq!(decls.indent, Some(false));
    assert_eq!(decls.bold, Some(false));
    assert_eq!(decls.color, None);

    assert!(Declarations::parse("").is_empty());
    assert!(Declarations::parse("margin: 1em; font-family: serif").is_empty());
}

#[test]
fn style_parse_color() {
    assert_eq!(parse_color("#0f0"), Some(Rgb::new(0, 255, 0)));
    assert_eq!(parse_color("#1A2b3C"), Some(Rgb::new(0x1a, 0x2b, 0x3c)));
    assert_eq!(parse_color("rgb(0, 128, 255)"), Some(Rgb::new(0, 128, 255)));
    assert_eq!(parse_color("rgba(10 20 30 / 50%)"), Some(Rgb::new(10, 20, 30)));
    assert_eq!(parse_color("Navy"), Some(Rgb::new(0, 0, 128)));
    assert_eq!(parse_color("#12345"), None);
    assert_eq!(parse_color("rgb(1, 2)"), None);
    assert_eq!(parse_color("chartreuse"), None);
    assert_eq!(Rgb::new(255, 0, 16).to_string(), "#ff0010");
}

#[test]
fn style_class_rules() {
    let rules = ClassRules::parse(
        r#"
        /* chapter styles { not a rule } */
        .note { font-weight: bold; text-align: right }
        p.lead, .shout { color: red }
        @media print { .note { color: blue } }
        .empty { margin: 0 }
        div .nested { color: green }
        "#,
    );
    assert_eq!(rules.len(), 3);

    // The rule nested in @media comes later and adds its color
    let note = rules.lookup("p", "note");
    assert_eq!(note.bold, Some(true));
    assert_eq!(note.alignment, Some(Alignment::End));
    assert_eq!(note.color, Some(Rgb::new(0, 0, 255)));

    assert_eq!(rules.lookup("p", "lead").color, Some(Rgb::new(255, 0, 0)));
    assert!(rules.lookup("span", "lead").is_empty());
    assert_eq!(rules.lookup("span", "other shout").color, Some(Rgb::new(255, 0, 0)));
    assert!(rules.lookup("div", "nested").is_empty());
}

#[test]
fn style_class_rules_inside_conditional_groups() {
    let rules = ClassRules::parse(
        r#"
        @charset "utf-8";
        @import url("base.css");
        @font-face { font-family: "Body"; src: url("fonts/body.ttf"); }
        @media screen and (min-width: 20em) {
            .wide { text-align: center }
            @supports (display: grid) { span.deep { font-style: italic } }
        }
        h1 + p.after, a:hover, .ok::before { color: red }
        "#,
    );
    assert_eq!(rules.len(), 2);
    assert_eq!(rules.lookup("div", "wide").alignment, Some(Alignment::Center));
    assert_eq!(rules.lookup("span", "deep").italic, Some(true));
    assert!(rules.lookup("p", "deep").is_empty());
    assert!(rules.lookup("p", "after").is_empty());
    assert!(rules.lookup("p", "ok").is_empty());
}

#[test]
fn style_declarations_with_strings_and_urls() {
    let decls = Declarations::parse(
        r#"font-family: "A; B"; background: url(data:image/png;base64,AAAA); color: rgb(0, 0, 255) !important; text-align: right"#,
    );
    assert_eq!(decls.color, Some(Rgb::new(0, 0, 255)));
    assert_eq!(decls.alignment, Some(Alignment::End));

    let rules = ClassRules::parse(
        r#".quote { content: "}"; font-weight: bold } .next { text-align: justify }"#,
    );
    assert_eq!(rules.lookup("p", "quote").bold, Some(true));
    assert_eq!(rules.lookup("p", "next").alignment, Some(Alignment::Justify));
}

// ============================================================================
// NORMALIZER
// ============================================================================

#[test]
fn normalize_explicit_headings() {
    let doc = normalize("<h1>Title</h1><p>Short Caps</p><h3>Sub <i>part</i></h3>");
    assert_eq!(doc.nodes.len(), 3);
    assert!(matches!(&doc.nodes[0], ContentNode::Heading { level: 1, text, .. } if text == "Title"));
    // Heuristic is off once the document has real headings
    assert!(matches!(&doc.nodes[1], ContentNode::Paragraph { .. }));
    assert!(matches!(&doc.nodes[2], ContentNode::Heading { level: 3, text, .. } if text == "Sub part"));
}

#[test]
fn normalize_heuristic_headings() {
    let long = "The rain fell on the sleeping town. ".repeat(4);
    let body = format!(
        "<p>Chapter One</p><p>{}</p><p>Short Tail</p>",
        long.trim()
    );
    let doc = normalize(&body);
    assert_eq!(doc.nodes.len(), 3);
    assert!(matches!(&doc.nodes[0], ContentNode::Heading { level: 2, text, .. } if text == "Chapter One"));
    assert!(matches!(&doc.nodes[1], ContentNode::Paragraph { .. }));
    assert!(matches!(&doc.nodes[2], ContentNode::Heading { level: 2, text, .. } if text == "Short Tail"));
}

#[test]
fn normalize_heuristic_keeps_continuations() {
    let long = "the road went on and on past the hills ".repeat(4);
    let body = format!("<p>{}</p><p>Continued here</p>", long.trim());
    let doc = normalize(&body);
    assert_eq!(doc.nodes.len(), 2);
    assert!(doc.nodes.iter().all(|n| matches!(n, ContentNode::Paragraph { .. })));
}

#[test]
fn normalize_inline_styles() {
    let doc = normalize_plain(
        r#"<p>Plain <b>bold</b> <i>italic</i> <span style="color: #ff0000">red</span></p>"#,
    );
    assert_eq!(doc.nodes.len(), 1);
    let ContentNode::Paragraph { runs, .. } = &doc.nodes[0] else {
        panic!("expected a paragraph, got {:?}", doc.nodes[0]);
    };
    assert_eq!(runs_text(runs), "Plain bold italic red");

    let find = |text: &str| runs.iter().find(|r| r.text == text).unwrap();
    assert!(find("bold").bold);
    assert!(!find("bold").italic);
    assert!(find("italic").italic);
    assert_eq!(find("red").color, Some(Rgb::new(255, 0, 0)));
    assert_eq!(runs[0], TextRun::plain("Plain "));
}

#[test]
fn normalize_center_sources() {
    let doc = normalize_plain(
        r#"<center>Centered with center tag</center>
<p align="center">Centered with align</p>
<p style="text-align: center">Centered with style</p>
<p class="text-center">Centered with class</p>"#,
    );
    assert_eq!(doc.nodes.len(), 4);
    for node in &doc.nodes {
        let ContentNode::Paragraph { style, .. } = node else {
            panic!("expected a paragraph, got {:?}", node);
        };
        assert_eq!(style.alignment, Alignment::Center);
    }
}

#[test]
fn normalize_collapses_whitespace() {
    let doc = normalize_plain("<p>  Hello \n   world&nbsp;again  </p>");
    assert_eq!(paragraph_text(&doc.nodes[0]), "Hello world\u{a0}again");
}

#[test]
fn normalize_line_breaks() {
    let doc = normalize_plain("<p>one<br/>two</p><pre>line one\n  line two</pre>");
    assert_eq!(doc.nodes.len(), 2);

    let ContentNode::Paragraph { runs, .. } = &doc.nodes[0] else {
        panic!("expected a paragraph");
    };
    assert!(runs[1].is_line_break());
    assert_eq!(runs_text(runs), "one\ntwo");
    assert_eq!(paragraph_text(&doc.nodes[1]), "line one\n  line two");
}

#[test]
fn normalize_lists() {
    let doc = normalize(
        r#"<ul><li>Alpha</li><li>Beta<ul><li>Nested</li></ul></li></ul>
<ol start="3"><li>Three</li><li value="7">Seven</li><li>Eight</li></ol>"#,
    );

    let items: Vec<(ListMarker, String)> = doc
        .nodes
        .iter()
        .map(|n| match n {
            ContentNode::ListItem { marker, runs, .. } => (*marker, runs_text(runs)),
            other => panic!("expected a list item, got {:?}", other),
        })
        .collect();

    assert_eq!(
        items,
        vec![
            (ListMarker::Unordered, "Alpha".to_string()),
            (ListMarker::Unordered, "Beta".to_string()),
            (ListMarker::Unordered, "Nested".to_string()),
            (ListMarker::Ordered(3), "Three".to_string()),
            (ListMarker::Ordered(7), "Seven".to_string()),
            (ListMarker::Ordered(8), "Eight".to_string()),
        ]
    );
}

#[test]
fn normalize_blockquote_is_one_node() {
    let doc = normalize("<blockquote><p>First line.</p><p>Second line.</p></blockquote>");
    assert_eq!(doc.nodes.len(), 1);
    assert!(matches!(&doc.nodes[0], ContentNode::BlockQuote { .. }));
    assert_eq!(paragraph_text(&doc.nodes[0]), "First line. Second line.");
}

#[test]
fn normalize_inherits_color_not_indent() {
    let doc = normalize_plain(
        r#"<div style="color: #0000ff"><p style="text-indent: 2em">Indented text</p><p>Plain text</p></div>"#,
    );
    let styles: Vec<BlockStyle> = doc
        .nodes
        .iter()
        .map(|n| match n {
            ContentNode::Paragraph { style, .. } => *style,
            other => panic!("expected a paragraph, got {:?}", other),
        })
        .collect();

    let blue = Some(Rgb::new(0, 0, 255));
    assert_eq!(styles.len(), 2);
    assert_eq!(styles[0].color, blue);
    assert!(styles[0].indent);
    assert_eq!(styles[1].color, blue);
    assert!(!styles[1].indent);
}

#[test]
fn normalize_skips_scripts() {
    let doc = normalize_plain("<script>var x = 1;</script><style>p { color: red }</style><p>Visible</p>");
    assert_eq!(doc.nodes.len(), 1);
    assert_eq!(paragraph_text(&doc.nodes[0]), "Visible");
}

#[test]
fn normalize_applies_class_rules() {
    let rules = ClassRules::parse(".note { font-weight: bold; text-align: right }");
    let doc = normalize_with(
        r#"<p class="note">Note text</p>"#,
        &Resources::default(),
        &rules,
        &NoHeadings,
    );
    let ContentNode::Paragraph { runs, style } = &doc.nodes[0] else {
        panic!("expected a paragraph");
    };
    assert_eq!(style.alignment, Alignment::End);
    assert!(runs[0].bold);
}

#[test]
fn normalize_entities_and_cjk() {
    let doc = normalize_plain("<p>Caf&eacute; &bogus; &amp; more</p><p>Hello 世界, mixed テキスト.</p>");
    assert_eq!(paragraph_text(&doc.nodes[0]), "Café &bogus; & more");
    assert_eq!(paragraph_text(&doc.nodes[1]), "Hello 世界, mixed テキスト.");
}

#[test]
fn normalize_html_named_entities() {
    let doc = normalize_plain(
        "<p>I &hearts; tea&nbsp;&mdash; &laquo;really&raquo; &rarr; &alpha;&beta;</p>",
    );
    assert_eq!(
        paragraph_text(&doc.nodes[0]),
        "I \u{2665} tea\u{a0}\u{2014} \u{ab}really\u{bb} \u{2192} \u{3b1}\u{3b2}"
    );
}

#[test]
fn normalize_recovers_unclosed_markup() {
    let doc = normalize_markup(
        "<html><body><p>unclosed<p>second</body></html>",
        &Resources::default(),
    );
    let texts: Vec<String> = doc.nodes.iter().map(paragraph_text).collect();
    assert_eq!(texts, ["unclosed", "second"]);
}

#[test]
fn normalize_html_void_elements() {
    let resources = image_resources("OEBPS/pic.png", png_bytes(40, 20));
    let doc = normalize_markup(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Chapter</title></head>
<body>
<p>Line one<br>Line two</p>
<hr>
<p>Before <img src="pic.png" alt="Pic"> after</p>
</body></html>"#,
        &resources,
    );

    assert_eq!(doc.nodes.len(), 4);
    let ContentNode::Paragraph { runs, .. } = &doc.nodes[0] else {
        panic!("expected a paragraph, got {:?}", doc.nodes[0]);
    };
    assert!(runs[1].is_line_break());
    assert_eq!(runs_text(runs), "Line one\nLine two");

    assert_eq!(paragraph_text(&doc.nodes[1]), "Before");
    let ContentNode::Image(image) = &doc.nodes[2] else {
        panic!("expected an image, got {:?}", doc.nodes[2]);
    };
    assert_eq!((image.width, image.height), (40, 20));
    assert_eq!(paragraph_text(&doc.nodes[3]), "after");
}

#[test]
fn normalize_resolves_relative_image() {
    let resources = image_resources("OEBPS/images/pic.png", png_bytes(192, 96));
    let doc = normalize_with(
        r#"<p>Before text.</p><img src="../images/pic.png" alt="A picture"/><p>After text.</p>"#,
        &resources,
        &ClassRules::default(),
        &NoHeadings,
    );

    assert_eq!(doc.nodes.len(), 3);
    let ContentNode::Image(image) = &doc.nodes[1] else {
        panic!("expected an image, got {:?}", doc.nodes[1]);
    };
    assert_eq!((image.width, image.height), (192, 96));
    assert_eq!(image.alt, "A picture");
    assert_eq!(image.media_type, "image/png");
}

#[test]
fn normalize_image_splits_paragraph() {
    let resources = image_resources("OEBPS/images/pic.png", png_bytes(10, 10));
    let doc = normalize_with(
        r#"<p>Text before <img src="../images/pic.png"/> text after</p>"#,
        &resources,
        &ClassRules::default(),
        &NoHeadings,
    );

    assert_eq!(doc.nodes.len(), 3);
    assert_eq!(paragraph_text(&doc.nodes[0]), "Text before");
    assert!(matches!(doc.nodes[1], ContentNode::Image(_)));
    assert_eq!(paragraph_text(&doc.nodes[2]), "text after");
}

#[test]
fn normalize_image_file_name_fallback() {
    let resources = image_resources("OEBPS/images/pic.png", png_bytes(20, 10));
    let doc = normalize_with(
        r#"<p><img src="wrong/dir/pic.png"/></p>"#,
        &resources,
        &ClassRules::default(),
        &NoHeadings,
    );
    assert_eq!(doc.image_count(), 1);
}

#[test]
fn normalize_drops_unresolvable_images() {
    let mut resources = image_resources("OEBPS/a/pic.png", png_bytes(20, 10));
    resources.insert(
        "OEBPS/b/pic.png",
        Resource {
            media_type: "image/png".to_string(),
            kind: ResourceKind::Image,
            data: png_bytes(20, 10),
        },
    );

    let doc = normalize_with(
        r#"<p>Kept text.</p><img src="missing.png"/><img src="c/pic.png"/><img src="http://example.com/remote.png"/>"#,
        &resources,
        &ClassRules::default(),
        &NoHeadings,
    );
    assert_eq!(doc.image_count(), 0);
    assert_eq!(doc.nodes.len(), 1);
}

#[test]
fn normalize_data_uri_image() {
    let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes(4, 8));
    let body = format!(r#"<p><img src="data:image/png;base64,{}" alt=""/></p>"#, encoded);
    let doc = normalize_with(&body, &Resources::default(), &ClassRules::default(), &NoHeadings);

    let ContentNode::Image(image) = &doc.nodes[0] else {
        panic!("expected an image");
    };
    assert_eq!((image.width, image.height), (4, 8));
    assert_eq!(image.media_type, "image/png");
}

// ============================================================================
// EXTRACTION
// ============================================================================

#[test]
fn extract_follows_spine_order() {
    let package = opf(
        "Ordered",
        "Someone",
        &[
            ("ch2", "text/ch2.xhtml", "application/xhtml+xml"),
            ("ch1", "text/ch1.xhtml", "application/xhtml+xml"),
        ],
        &["ch1", "ch2"],
    );
    let ch1 = xhtml("<p>One</p>");
    let ch2 = xhtml("<p>Two</p>");
    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/text/ch2.xhtml", ch2.as_bytes()),
        ("OEBPS/text/ch1.xhtml", ch1.as_bytes()),
    ]);

    let package = extract(&epub).unwrap();
    let paths: Vec<&str> = package.documents.iter().map(|d| d.path.as_str()).collect();
    assert_eq!(paths, vec!["OEBPS/text/ch1.xhtml", "OEBPS/text/ch2.xhtml"]);
    let positions: Vec<usize> = package.documents.iter().map(|d| d.position).collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(package.spine_len, 2);
    assert_eq!(
        package.metadata,
        PackageMetadata {
            title: Some("Ordered".to_string()),
            author: Some("Someone".to_string()),
            language: Some("en".to_string()),
        }
    );
}

#[test]
fn extract_skips_missing_manifest_item() {
    let package = opf(
        "Gaps",
        "Someone",
        &[("ch1", "ch1.xhtml", "application/xhtml+xml")],
        &["ghost", "ch1"],
    );
    let ch1 = xhtml("<p>Present</p>");
    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/ch1.xhtml", ch1.as_bytes()),
    ]);

    let package = extract(&epub).unwrap();
    assert_eq!(package.documents.len(), 1);
    assert_eq!(package.documents[0].position, 1);
    assert_eq!(package.spine_len, 2);
}

#[test]
fn extract_fails_when_no_spine_item_resolves() {
    let package = opf("Empty", "Someone", &[], &["ghost"]);
    let epub = build_epub(&[("OEBPS/content.opf", package.as_bytes())]);
    assert!(matches!(extract(&epub), Err(ConvertError::MalformedPackage(_))));
}

#[test]
fn extract_rejects_broken_archives() {
    assert!(matches!(
        extract(b"definitely not a zip archive"),
        Err(ConvertError::MalformedPackage(_))
    ));

    // Container points at a package document that is not there
    let epub = build_epub(&[]);
    assert!(matches!(extract(&epub), Err(ConvertError::MalformedPackage(_))));
}

#[test]
fn extract_honors_declared_encoding() {
    let package = opf(
        "Latin",
        "Someone",
        &[("ch1", "ch1.xhtml", "application/xhtml+xml")],
        &["ch1"],
    );
    let mut ch1 = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n<html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>Caf".to_vec();
    ch1.push(0xE9);
    ch1.extend_from_slice(b"</p></body></html>");

    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/ch1.xhtml", ch1.as_slice()),
    ]);

    let package = extract(&epub).unwrap();
    assert_eq!(package.documents.len(), 1);
    assert!(package.documents[0].markup.contains("Café"));
    assert_eq!(package.documents[0].encoding.name(), "windows-1252");
}

#[test]
fn extract_skips_undecodable_documents() {
    let package = opf(
        "Mixed",
        "Someone",
        &[
            ("bad", "bad.xhtml", "application/xhtml+xml"),
            ("alien", "alien.xhtml", "application/xhtml+xml"),
            ("good", "good.xhtml", "application/xhtml+xml"),
        ],
        &["bad", "alien", "good"],
    );
    let bad: &[u8] = b"<html><body><p>broken \xC3\x28 bytes</p></body></html>";
    let alien: &[u8] = b"<?xml version=\"1.0\" encoding=\"x-klingon\"?><html><body/></html>";
    let good = xhtml("<p>Fine</p>");

    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/bad.xhtml", bad),
        ("OEBPS/alien.xhtml", alien),
        ("OEBPS/good.xhtml", good.as_bytes()),
    ]);

    let package = extract(&epub).unwrap();
    assert_eq!(package.documents.len(), 1);
    assert_eq!(package.documents[0].path, "OEBPS/good.xhtml");
    assert_eq!(package.spine_len, 3);
}

#[test]
fn extract_collects_resources_and_stylesheets() {
    let package = opf(
        "Resources",
        "Someone",
        &[
            ("ch1", "ch1.xhtml", "application/xhtml+xml"),
            ("pic", "images/pic.png", "image/png"),
            ("css", "style.css", "text/css"),
        ],
        &["ch1"],
    );
    let ch1 = xhtml(r#"<p><img src="images/pic.png"/></p>"#);
    let png = png_bytes(8, 8);
    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/ch1.xhtml", ch1.as_bytes()),
        ("OEBPS/images/pic.png", png.as_slice()),
        ("OEBPS/style.css", b".bold-ish { font-weight: bold }".as_slice()),
    ]);

    let package = extract(&epub).unwrap();
    assert!(package.resources.image("OEBPS/images/pic.png").is_some());
    assert_eq!(package.resources.count(ResourceKind::Image), 1);
    assert_eq!(package.class_rules.len(), 1);
}

#[test]
fn extract_resolves_encoding_sources() {
    assert_eq!(resolve_encoding(b"\xEF\xBB\xBF<p/>").unwrap(), encoding_rs::UTF_8);
    assert_eq!(resolve_encoding(b"<html/>").unwrap(), encoding_rs::UTF_8);
    assert_eq!(
        resolve_encoding(b"<html><head><meta charset=\"windows-1251\"/></head></html>").unwrap(),
        encoding_rs::WINDOWS_1251
    );
    assert_eq!(
        resolve_encoding(b"<html><head><meta charset=\"x-klingon\"/></head></html>").unwrap_err(),
        "x-klingon"
    );
}

// ============================================================================
// SYNTHESIS
// ============================================================================

fn chapter(position: usize, text: &str) -> NormalizedDocument {
    NormalizedDocument {
        position,
        nodes: vec![ContentNode::Paragraph {
            runs: vec![TextRun::plain(text)],
            style: BlockStyle::default(),
        }],
    }
}

fn sample_metadata() -> PackageMetadata {
    PackageMetadata {
        title: Some("Sample Book".to_string()),
        author: Some("Jane Writer".to_string()),
        language: None,
    }
}

#[test]
fn synth_breaks_between_chapters() {
    let chapters = [
        chapter(0, "First chapter."),
        chapter(1, "Second chapter."),
        chapter(2, "Third chapter."),
    ];
    let doc = synthesize(&chapters, &sample_metadata(), &SynthOptions::default()).unwrap();

    assert_eq!(doc.chapters, 3);
    assert_eq!(doc.page_breaks(), 2);
    assert_eq!(doc.markup.matches(PAGE_BREAK).count(), 2);
    assert_eq!(doc.markup.matches(r#"<section class="chapter">"#).count(), 3);

    let first = doc.markup.find("First chapter.").unwrap();
    let second = doc.markup.find("Second chapter.").unwrap();
    let third = doc.markup.find("Third chapter.").unwrap();
    assert!(first < second && second < third);
}

#[test]
fn synth_single_chapter_has_no_break() {
    let doc = synthesize(&[chapter(0, "Alone.")], &sample_metadata(), &SynthOptions::default())
        .unwrap();
    assert_eq!(doc.page_breaks(), 0);
}

#[test]
fn synth_requires_a_chapter() {
    let result = synthesize(&[], &sample_metadata(), &SynthOptions::default());
    assert!(matches!(result, Err(ConvertError::Synthesis(_))));
}

#[test]
fn synth_title_block() {
    let doc = synthesize(&[chapter(0, "Body.")], &sample_metadata(), &SynthOptions::default())
        .unwrap();
    assert!(doc.markup.contains(r#"<header class="title-block">"#));
    assert!(doc.markup.contains(r#"<p class="author">Jane Writer</p>"#));
    assert!(doc.markup.contains("<title>Sample Book</title>"));

    let options = SynthOptions {
        title_block: false,
        ..SynthOptions::default()
    };
    let doc = synthesize(&[chapter(0, "Body.")], &PackageMetadata::default(), &options).unwrap();
    assert!(!doc.markup.contains(r#"class="title-block""#));
    assert!(doc.markup.contains("<title>Untitled</title>"));
}

#[test]
fn synth_escapes_text() {
    let metadata = PackageMetadata {
        title: Some("Tom & Jerry <3".to_string()),
        ..PackageMetadata::default()
    };
    let doc = synthesize(&[chapter(0, "a < b & c")], &metadata, &SynthOptions::default()).unwrap();
    assert!(doc.markup.contains("Tom &amp; Jerry &lt;3"));
    assert!(doc.markup.contains("a &lt; b &amp; c"));
    assert!(!doc.markup.contains("Tom & Jerry"));
}

#[test]
fn synth_translates_nodes() {
    let red = Some(Rgb::new(255, 0, 0));
    let document = NormalizedDocument {
        position: 0,
        nodes: vec![
            ContentNode::Heading {
                level: 2,
                text: "Part".to_string(),
                style: BlockStyle {
                    alignment: Alignment::Center,
                    ..BlockStyle::default()
                },
            },
            ContentNode::Paragraph {
                runs: vec![
                    TextRun::plain("Start "),
                    TextRun {
                        text: "loud".to_string(),
                        bold: true,
                        italic: true,
                        color: red,
                    },
                ],
                style: BlockStyle {
                    indent: true,
                    ..BlockStyle::default()
                },
            },
            ContentNode::ListItem {
                marker: ListMarker::Ordered(3),
                runs: vec![TextRun::plain("Three")],
                style: BlockStyle::default(),
            },
            ContentNode::ListItem {
                marker: ListMarker::Ordered(4),
                runs: vec![TextRun::plain("Four")],
                style: BlockStyle::default(),
            },
            ContentNode::BlockQuote {
                runs: vec![TextRun::plain("Quoted")],
                style: BlockStyle::default(),
            },
        ],
    };
    let doc = synthesize(&[document], &sample_metadata(), &SynthOptions::default()).unwrap();

    assert!(doc.markup.contains(r#"<h2 style="text-align: center;">Part</h2>"#));
    assert!(doc.markup.contains(r#"<p class="indent">"#));
    assert!(doc.markup.contains(r#"<span style="color: #ff0000;"><b><i>loud</i></b></span>"#));
    assert!(doc.markup.contains(r#"<ol start="3">"#));
    assert!(doc.markup.contains(r#"<li value="4">Four</li>"#));
    assert_eq!(doc.markup.matches("<ol").count(), 1);
    assert!(doc.markup.contains("<blockquote>"));
}

#[test]
fn synth_inlines_images() {
    let image = ImageData {
        data: png_bytes(192, 96),
        media_type: "image/png".to_string(),
        width: 192,
        height: 96,
        alt: "Figure".to_string(),
    };
    let document = NormalizedDocument {
        position: 0,
        nodes: vec![ContentNode::Image(image)],
    };
    let doc = synthesize(&[document], &sample_metadata(), &SynthOptions::default()).unwrap();

    assert_eq!(doc.images, 1);
    assert!(doc.markup.contains(r#"src="data:image/png;base64,"#));
    assert!(doc.markup.contains(r#"style="width: 2.00in; height: 1.00in;""#));
    assert!(!doc.markup.contains(r#"src="images/"#));
}

// ============================================================================
// FONTS AND RENDERING
// ============================================================================

const DEJAVU_SANS: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";
const WQY_MICROHEI: &str = "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc";

fn font_installed(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

#[test]
fn fonts_style_flags() {
    assert_eq!(Style::from_flags(false, false), Style::Regular);
    assert_eq!(Style::from_flags(true, true), Style::BoldItalic);
    assert!(Style::from_flags(false, true).is_italic());
    assert!(!Style::Italic.is_bold());
}

#[test]
fn fonts_skip_missing_and_invalid_files() {
    let dir = tempfile::tempdir().unwrap();
    let junk = dir.path().join("junk.ttf");
    std::fs::write(&junk, b"not a font at all").unwrap();

    let set = FontSet::load(&[dir.path().join("missing.ttf"), junk]);
    assert!(set.is_empty());
    assert!(FontFile::from_bytes("junk", vec![0; 16]).is_err());
}

#[test]
fn fonts_builtin_fallback_without_files() {
    let set = FontSet::default();
    let book = FontBook::new(&set);
    assert_eq!(
        book.runs("plain text", Style::Bold),
        vec![(FaceId::Builtin(Style::Bold), "plain text".to_string())]
    );
    assert_close(book.width(FaceId::Builtin(Style::Regular), "  ", 10.0), 5.56);
}

#[test]
fn fonts_truetype_runs_and_widths() {
    if !font_installed(DEJAVU_SANS) {
        return;
    }
    let set = FontSet::load(&[DEJAVU_SANS]);
    assert!(set.family_names()[0].starts_with("DejaVu"));

    let book = FontBook::new(&set);
    let runs = book.runs("Привет, café", Style::Regular);
    assert_eq!(runs, vec![(FaceId::Embedded(0), "Привет, café".to_string())]);
    assert_eq!(book.missing(), 0);

    let narrow = book.width(FaceId::Embedded(0), "ii", 12.0);
    let wide = book.width(FaceId::Embedded(0), "WW", 12.0);
    assert!(narrow > 0.0 && narrow < wide);
    assert_close(book.width(FaceId::Embedded(0), "ii", 24.0), narrow * 2.0);
}

#[test]
fn fonts_fall_through_to_covering_family() {
    if !font_installed(DEJAVU_SANS) || !font_installed(WQY_MICROHEI) {
        return;
    }
    let set = FontSet::load(&[DEJAVU_SANS, WQY_MICROHEI]);
    let book = FontBook::new(&set);
    let runs = book.runs("hi 世界", Style::Regular);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].1, "hi ");
    assert_eq!(runs[1].1, "世界");
    assert_ne!(runs[0].0, runs[1].0);
    assert_eq!(book.missing(), 0);
}

fn pdf_pages(pdf: &[u8]) -> usize {
    lopdf::Document::load_mem(pdf).unwrap().get_pages().len()
}

fn pdf_has_image(pdf: &[u8]) -> bool {
    let doc = lopdf::Document::load_mem(pdf).unwrap();
    doc.objects.values().any(|object| match object {
        lopdf::Object::Stream(stream) => stream
            .dict
            .get(b"Subtype")
            .and_then(|o| o.as_name())
            .is_ok_and(|name| name == b"Image".as_slice()),
        _ => false,
    })
}

fn pdf_images(pdf: &[u8]) -> Vec<lopdf::Stream> {
    let doc = lopdf::Document::load_mem(pdf).unwrap();
    doc.objects
        .into_values()
        .filter_map(|object| match object {
            lopdf::Object::Stream(stream)
                if stream
                    .dict
                    .get(b"Subtype")
                    .and_then(|o| o.as_name())
                    .is_ok_and(|name| name == b"Image".as_slice()) =>
            {
                Some(stream)
            }
            _ => None,
        })
        .collect()
}

fn is_dct(stream: &lopdf::Stream) -> bool {
    match stream.dict.get(b"Filter") {
        Ok(lopdf::Object::Name(name)) => name == b"DCTDecode",
        Ok(lopdf::Object::Array(filters)) => filters
            .iter()
            .any(|f| f.as_name().is_ok_and(|name| name == b"DCTDecode".as_slice())),
        _ => false,
    }
}

fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([30, 90, 200]));
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
        .encode_image(&img)
        .unwrap();
    out
}

fn image_node(data: Vec<u8>, media_type: &str, width: u32, height: u32) -> ContentNode {
    ContentNode::Image(ImageData {
        data,
        media_type: media_type.to_string(),
        width,
        height,
        alt: String::new(),
    })
}

fn chapters_pdf(chapters: &[&str], title_block: bool) -> Vec<u8> {
    let documents: Vec<NormalizedDocument> = chapters
        .iter()
        .enumerate()
        .map(|(position, text)| NormalizedDocument {
            position,
            nodes: if text.is_empty() {
                Vec::new()
            } else {
                vec![ContentNode::Paragraph {
                    runs: vec![TextRun::plain(*text)],
                    style: BlockStyle::default(),
                }]
            },
        })
        .collect();
    let options = SynthOptions {
        title_block,
        ..SynthOptions::default()
    };
    let synthesized = synthesize(&documents, &sample_metadata(), &options).unwrap();
    Renderer::default().render(&synthesized).unwrap()
}

#[test]
fn render_sample_book() {
    let pdf = Converter::default().convert(&sample_epub(), None).unwrap();
    assert!(pdf.starts_with(b"%PDF-"));
    assert!(pdf_pages(&pdf) >= 2);

    let doc = lopdf::Document::load_mem(&pdf).unwrap();
    let info_id = doc.trailer.get(b"Info").unwrap().as_reference().unwrap();
    let info = doc.get_dictionary(info_id).unwrap();
    match info.get(b"Title").unwrap() {
        lopdf::Object::String(title, _) => assert_eq!(title.as_slice(), b"Sample Book"),
        other => panic!("unexpected title object {:?}", other),
    }
}

#[test]
fn render_is_deterministic() {
    let converter = Converter::default();
    let epub = sample_epub();
    assert_eq!(
        converter.convert(&epub, None).unwrap(),
        converter.convert(&epub, None).unwrap()
    );
}

#[test]
fn render_long_text_paginates() {
    let doc = NormalizedDocument {
        position: 0,
        nodes: (0..200)
            .map(|i| ContentNode::Paragraph {
                runs: vec![TextRun::plain(format!(
                    "Paragraph {} has enough words to wrap across the width of the page at least once.",
                    i
                ))],
                style: BlockStyle::default(),
            })
            .collect(),
    };
    let synthesized = synthesize(&[doc], &sample_metadata(), &SynthOptions::default()).unwrap();
    let pdf = Renderer::default().render(&synthesized).unwrap();
    assert!(pdf_pages(&pdf) > 2);
}

#[test]
fn render_rejects_malformed_markup() {
    let renderer = Renderer::default();
    assert!(matches!(
        renderer.render_markup("<html><body><p>oops</body></html>"),
        Err(ConvertError::Render(_))
    ));
    assert!(matches!(
        renderer.render_markup("<html><head/></html>"),
        Err(ConvertError::Render(_))
    ));
}

#[test]
fn render_embeds_images() {
    let doc = NormalizedDocument {
        position: 0,
        nodes: vec![image_node(png_bytes(64, 32), "image/png", 64, 32)],
    };
    let synthesized = synthesize(&[doc], &sample_metadata(), &SynthOptions::default()).unwrap();
    let pdf = Renderer::default().render(&synthesized).unwrap();
    assert!(pdf_has_image(&pdf));

    let images = pdf_images(&pdf);
    assert_eq!(images.len(), 1);
    assert!(is_dct(&images[0]));
    assert_eq!(images[0].dict.get(b"Width").unwrap().as_i64().unwrap(), 64);
}

#[test]
fn render_passes_jpeg_through_and_shares_repeats() {
    let jpeg = jpeg_bytes(40, 20);
    let doc = NormalizedDocument {
        position: 0,
        nodes: vec![
            image_node(jpeg.clone(), "image/jpeg", 40, 20),
            image_node(png_bytes(16, 16), "image/png", 16, 16),
            image_node(jpeg.clone(), "image/jpeg", 40, 20),
        ],
    };
    let synthesized = synthesize(&[doc], &sample_metadata(), &SynthOptions::default()).unwrap();
    let pdf = Renderer::default().render(&synthesized).unwrap();

    let images = pdf_images(&pdf);
    assert_eq!(images.len(), 2);
    assert!(images.iter().all(is_dct));
    assert!(images.iter().any(|image| image.content == jpeg));
}

#[test]
fn render_every_chapter_starts_a_page() {
    assert_eq!(pdf_pages(&chapters_pdf(&["", "Second chapter text."], false)), 2);
    assert_eq!(pdf_pages(&chapters_pdf(&["First.", "Second.", ""], false)), 3);
    assert_eq!(pdf_pages(&chapters_pdf(&["Only chapter."], false)), 1);
}

// ============================================================================
// PIPELINE
// ============================================================================

fn single_chapter_epub(body: &str) -> Vec<u8> {
    let package = opf(
        "One Chapter",
        "Someone",
        &[("ch1", "ch1.xhtml", "application/xhtml+xml")],
        &["ch1"],
    );
    let ch1 = xhtml(body);
    build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/ch1.xhtml", ch1.as_bytes()),
    ])
}

#[test]
fn pipeline_keeps_non_latin_text() {
    let epub = single_chapter_epub(
        "<p>Привет мир and καλημέρα with café.</p><p>Chinese: 你好世界</p>",
    );
    let converter = Converter::default();

    let doc = converter.synthesize(&epub).unwrap();
    assert!(doc.markup.contains("Привет мир and καλημέρα with café."));
    assert!(doc.markup.contains("你好世界"));

    let pdf = converter.convert(&epub, None).unwrap();
    assert!(pdf.starts_with(b"%PDF-"));

    let text = lopdf::Document::load_mem(&pdf)
        .unwrap()
        .extract_text(&[1])
        .unwrap();
    if font_installed(DEJAVU_SANS) {
        assert!(text.contains("Привет"), "{}", text);
        assert!(text.contains("мир"), "{}", text);
        assert!(text.contains("καλημέρα"), "{}", text);
        assert!(text.contains("café"), "{}", text);
    }
    if font_installed(WQY_MICROHEI) {
        for c in "你好世界".chars() {
            assert!(text.contains(c), "{}", text);
        }
    }
}

#[test]
fn pipeline_fails_without_usable_documents() {
    let converter = Converter::default();

    let package = opf(
        "Pictures Only",
        "Someone",
        &[("cover", "cover.png", "image/png")],
        &["cover"],
    );
    let cover = png_bytes(4, 4);
    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/cover.png", cover.as_slice()),
    ]);
    assert!(matches!(
        converter.convert(&epub, None),
        Err(ConvertError::Synthesis(_))
    ));

    let package = opf(
        "Undecodable",
        "Someone",
        &[("ch1", "ch1.xhtml", "application/xhtml+xml")],
        &["ch1"],
    );
    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/ch1.xhtml", b"<html><body>\xFF\xFE\xFD</body></html>".as_slice()),
    ]);
    assert!(matches!(
        converter.convert(&epub, None),
        Err(ConvertError::Synthesis(_))
    ));
}

#[test]
fn pipeline_accepts_html_chapters() {
    let package = opf(
        "Plain HTML",
        "Someone",
        &[
            ("ch1", "ch1.html", "text/html"),
            ("ch2", "ch2.xhtml", "application/xhtml+xml"),
        ],
        &["ch1", "ch2"],
    );
    let ch1 = "<!DOCTYPE html><html><head><title>One</title></head><body><h1>One</h1><p>Line one<br>Line two &hellip; &hearts;</p></body></html>";
    let ch2 = xhtml("<h1>Two</h1><p>Well-formed text.</p>");
    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/ch1.html", ch1.as_bytes()),
        ("OEBPS/ch2.xhtml", ch2.as_bytes()),
    ]);

    let converter = Converter::default();
    let doc = converter.synthesize(&epub).unwrap();
    assert_eq!(doc.chapters, 2);
    assert!(doc.markup.contains("Line one"));
    assert!(doc.markup.contains("Line two \u{2026} \u{2665}"));
    assert!(doc.markup.contains("Well-formed text."));

    let pdf = converter.convert(&epub, None).unwrap();
    assert!(pdf.starts_with(b"%PDF-"));
}

#[test]
fn pipeline_heading_policy() {
    let epub = single_chapter_epub("<p>Chapter One</p>");

    let doc = Converter::default().synthesize(&epub).unwrap();
    assert!(doc.markup.contains("<h2>Chapter One</h2>"));

    let doc = Converter::default()
        .with_heading_policy(NoHeadings)
        .synthesize(&epub)
        .unwrap();
    assert!(!doc.markup.contains("<h2>"));
    assert!(doc.markup.contains("Chapter One"));
}

#[test]
fn pipeline_images_reach_the_pdf() {
    let package = opf(
        "Pictures",
        "Someone",
        &[
            ("ch1", "text/ch1.xhtml", "application/xhtml+xml"),
            ("pic", "images/pic.png", "image/png"),
        ],
        &["ch1"],
    );
    let ch1 = xhtml(r#"<p>A figure follows.</p><img src="../images/pic.png" alt="Pic"/>"#);
    let png = png_bytes(300, 150);
    let epub = build_epub(&[
        ("OEBPS/content.opf", package.as_bytes()),
        ("OEBPS/text/ch1.xhtml", ch1.as_bytes()),
        ("OEBPS/images/pic.png", png.as_slice()),
    ]);

    let converter = Converter::default();
    assert_eq!(converter.synthesize(&epub).unwrap().images, 1);
    assert!(pdf_has_image(&converter.convert(&epub, None).unwrap()));
}

#[test]
fn pipeline_memory_snapshot() {
    let converter = Converter::default();
    let epub = sample_epub();
    let sink = MemorySnapshot::new();
    assert!(sink.get().is_none());

    converter.convert(&epub, Some(&sink)).unwrap();
    let markup = sink.get().unwrap();
    assert_eq!(markup, converter.synthesize(&epub).unwrap().markup);

    sink.write("replaced").unwrap();
    assert_eq!(sink.get().as_deref(), Some("replaced"));
}

#[test]
fn pipeline_file_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = FileSnapshot::new(dir.path().join("nested").join("debug.html"));
    assert!(snapshot.read().unwrap().is_none());
    assert!(snapshot.inspect(10).unwrap().is_none());

    Converter::default()
        .convert(&sample_epub(), Some(&snapshot))
        .unwrap();

    let markup = snapshot.read().unwrap().unwrap();
    assert!(markup.contains("Chapter Two"));

    let info = snapshot.inspect(20).unwrap().unwrap();
    assert_eq!(info.size, markup.len() as u64);
    assert_eq!(info.preview.chars().count(), 20);
    assert!(markup.starts_with(&info.preview));
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn config_defaults() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 7860);
    assert_eq!(config.upload.max_size_mb, 50);
    assert_eq!(config.upload.max_size_bytes(), 50 * 1024 * 1024);
    assert_eq!(config.convert.heading_max_chars, 100);
    assert!(config.convert.heading_heuristic);
    assert!(config.debug.snapshot);
    assert_eq!(
        config.debug.snapshot_path,
        std::path::PathBuf::from("/tmp/debug.html")
    );
}

#[test]
fn config_parse_partial() {
    let config = Config::parse(
        r#"
[upload]
max_size_mb = 5

[convert]
heading_heuristic = false
"#,
    )
    .unwrap();

    assert_eq!(config.upload.max_size_mb, 5);
    assert!(!config.convert.heading_heuristic);
    assert_eq!(config.convert.heading_level, 2);
    assert_eq!(config.server.title, "EPUB to PDF Converter");
}

#[test]
fn config_generated_default_parses() {
    let config = Config::parse(&Config::generate_default()).unwrap();
    let defaults = Config::default();
    assert_eq!(config.server.bind, defaults.server.bind);
    assert_eq!(config.upload.allowed_extensions, defaults.upload.allowed_extensions);
    assert_eq!(config.convert.jpeg_quality, defaults.convert.jpeg_quality);
    assert_eq!(config.convert.fonts, defaults.convert.fonts);
    assert_eq!(config.debug.preview_chars, defaults.debug.preview_chars);
}

#[test]
fn config_load_and_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[server]\ntitle = \"Books\"\n").unwrap();
    assert_eq!(Config::load(&path).unwrap().server.title, "Books");

    assert!(matches!(
        Config::parse("[server]\nbind = 42"),
        Err(AppError::Config(_))
    ));
    assert!(matches!(
        Config::load(&dir.path().join("missing.toml")),
        Err(AppError::Config(_))
    ));
}

#[test]
fn config_upload_checks() {
    let upload = Config::default().upload;
    assert!(upload.extension_allowed("Book.EPUB"));
    assert!(!upload.extension_allowed("book.pdf"));
    assert!(upload.mime_allowed("application/epub+zip; charset=binary"));
    assert!(!upload.mime_allowed("text/plain"));
}

// ============================================================================
// SERVER
// ============================================================================

const BOUNDARY: &str = "epub2pdf-test-boundary";

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.debug.snapshot_path = dir.path().join("debug.html");
    config
}

fn multipart_request(field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
    let mut body = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/epub+zip\r\n\r\n",
        BOUNDARY, field, file_name
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/convert")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn server_health_and_index() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(AppState::new(test_config(&dir)));

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");

    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(page.contains("EPUB to PDF Converter"));
    assert!(page.contains(r#"action="/api/convert""#));
}

#[tokio::test]
async fn server_debug_before_any_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(AppState::new(test_config(&dir)));

    let response = app.clone().oneshot(get("/api/debug-info")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["file_exists"], false);

    let response = app.clone().oneshot(get("/api/debug-html")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/api/download-debug")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn server_state_reads_snapshot_off_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(test_config(&dir));
    assert!(state.snapshot_enabled());
    assert_eq!(state.snapshot_markup().await.unwrap(), None);
    assert_eq!(state.snapshot_info(10).await.unwrap(), None);

    std::fs::write(dir.path().join("debug.html"), "<html>snapshot body</html>").unwrap();
    assert_eq!(
        state.snapshot_markup().await.unwrap().as_deref(),
        Some("<html>snapshot body</html>")
    );
    let info = state.snapshot_info(6).await.unwrap().unwrap();
    assert_eq!(info.size, 26);
    assert_eq!(info.preview, "<html>");

    let mut config = test_config(&dir);
    config.debug.snapshot = false;
    let disabled = AppState::new(config);
    assert!(!disabled.snapshot_enabled());
    assert_eq!(disabled.snapshot_markup().await.unwrap(), None);
}

#[tokio::test]
async fn server_converts_upload() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(AppState::new(test_config(&dir)));

    let response = app
        .clone()
        .oneshot(multipart_request("file", "sample.epub", &sample_epub()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/pdf"
    );
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("attachment"));
    assert!(disposition.contains("sample.pdf"));
    assert!(body_bytes(response).await.starts_with(b"%PDF-"));

    let response = app.clone().oneshot(get("/api/debug-info")).await.unwrap();
    let info = body_json(response).await;
    assert_eq!(info["file_exists"], true);
    assert!(info["file_size"].as_u64().unwrap() > 0);
    assert_eq!(info["view_url"], "/api/debug-html");
    assert_eq!(info["download_url"], "/api/download-debug");

    let response = app.clone().oneshot(get("/api/debug-html")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let markup = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(markup.contains("Chapter One"));

    let response = app.oneshot(get("/api/download-debug")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("debug.html")
    );
}

#[tokio::test]
async fn server_rejects_bad_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(AppState::new(test_config(&dir)));

    let response = app
        .clone()
        .oneshot(multipart_request("file", "notes.txt", b"plain text"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await["error"].as_str().unwrap().to_string();
    assert!(error.contains("File type not allowed"));

    let response = app
        .clone()
        .oneshot(multipart_request("file", "broken.epub", b"not a zip at all"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(multipart_request("file", "empty.epub", b""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(multipart_request("other", "sample.epub", &sample_epub()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(multipart_request("file", "", &sample_epub()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn server_enforces_size_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.upload.max_size_mb = 0;
    let app = create_router(AppState::new(config));

    let response = app
        .oneshot(multipart_request("file", "sample.epub", &sample_epub()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn server_snapshot_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.debug.snapshot = false;
    let app = create_router(AppState::new(config));

    let response = app
        .clone()
        .oneshot(multipart_request("file", "sample.epub", &sample_epub()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!dir.path().join("debug.html").exists());

    let response = app.oneshot(get("/api/debug-info")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
