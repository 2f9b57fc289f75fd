//! EPUB to PDF conversion pipeline.
//!
//! `extract` → `normalize` (per content document) → `synthesize` →
//! `render`. Each conversion is independent; the only shared state is an
//! optional snapshot sink supplied by the caller.

mod dom;
mod extract;
mod fonts;
pub mod heading;
pub mod node;
mod normalize;
mod render;
pub mod scale;
pub mod snapshot;
mod style;
mod synth;

pub use extract::{
    ContentDocument, Package, PackageMetadata, Resource, ResourceKind, Resources, decode_with,
    extract, resolve_encoding,
};
pub use fonts::{DEFAULT_FONT_PATHS, FaceId, FontBook, FontError, FontFile, FontSet, Style};
pub use heading::{HeadingPolicy, NoHeadings, ShortUppercaseBlocks, TextBlock};
pub use normalize::Normalizer;
pub use render::Renderer;
pub use snapshot::{FileSnapshot, MemorySnapshot, SnapshotInfo, SnapshotSink};
pub use style::{ClassRules, Declarations, class_marks_bold, class_marks_center, parse_color};
pub use synth::{
    PAGE_BREAK, PageGeometry, Stylesheet, SynthOptions, SynthesizedDocument, synthesize,
};

use crate::config::ConvertConfig;
use crate::error::ConvertError;

/// Runs the whole pipeline with one set of options.
///
/// `Send + Sync`; one instance serves concurrent conversions.
pub struct Converter {
    heading_policy: Box<dyn HeadingPolicy>,
    synth: SynthOptions,
    renderer: Renderer,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new(&ConvertConfig::default())
    }
}

impl Converter {
    /// Create a converter from configuration.
    pub fn new(config: &ConvertConfig) -> Self {
        let heading_policy: Box<dyn HeadingPolicy> = if config.heading_heuristic {
            Box::new(ShortUppercaseBlocks {
                max_chars: config.heading_max_chars,
                level: config.heading_level,
            })
        } else {
            Box::new(NoHeadings)
        };

        let synth = SynthOptions {
            stylesheet: Stylesheet::default(),
            title_block: config.title_block,
        };
        let renderer = Renderer::new(synth.stylesheet.clone())
            .with_jpeg_quality(config.jpeg_quality)
            .with_fonts(FontSet::load(&config.fonts));

        Self {
            heading_policy,
            synth,
            renderer,
        }
    }

    /// Replace the heading detection policy.
    pub fn with_heading_policy(mut self, policy: impl HeadingPolicy + 'static) -> Self {
        self.heading_policy = Box::new(policy);
        self
    }

    /// Synthesis options in use.
    pub fn synth_options(&self) -> &SynthOptions {
        &self.synth
    }

    /// Extract, normalize and synthesize an EPUB without rendering it.
    pub fn synthesize(&self, epub: &[u8]) -> Result<SynthesizedDocument, ConvertError> {
        self.prepare(epub).map(|(_, document)| document)
    }

    fn prepare(&self, epub: &[u8]) -> Result<(Package, SynthesizedDocument), ConvertError> {
        let package = extract(epub)?;
        let normalizer = Normalizer::new(
            &package.resources,
            &package.class_rules,
            self.heading_policy.as_ref(),
        );

        let documents: Vec<_> = package
            .documents
            .iter()
            .map(|document| normalizer.normalize(document))
            .collect();

        if documents.len() < package.spine_len {
            tracing::info!(
                spine = package.spine_len,
                converted = documents.len(),
                "Some spine entries were skipped"
            );
        }

        let document = synthesize(&documents, &package.metadata, &self.synth)?;
        Ok((package, document))
    }

    /// Convert an EPUB held in memory to PDF bytes.
    ///
    /// When `snapshot` is given, the synthesized markup is written to it
    /// before rendering; a failed write is logged and otherwise ignored.
    pub fn convert(
        &self,
        epub: &[u8],
        snapshot: Option<&dyn SnapshotSink>,
    ) -> Result<Vec<u8>, ConvertError> {
        let (package, document) = self.prepare(epub)?;

        if let Some(sink) = snapshot
            && let Err(e) = sink.write(&document.markup)
        {
            tracing::warn!(error = %e, "Failed to write debug snapshot");
        }

        let package_fonts = FontSet::from_resources(&package.resources);
        self.renderer.render_with_fonts(&document, &package_fonts)
    }
}
