//! Heading detection for documents without explicit heading markup.

/// A top-level text block offered to a [`HeadingPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct TextBlock<'a> {
    /// Collapsed text of the block.
    pub text: &'a str,
    /// Whether the block continues the preceding paragraph.
    pub continues_paragraph: bool,
}

/// Decides whether an unmarked text block is a heading.
///
/// Only consulted for documents that contain no `h1`–`h6` element.
pub trait HeadingPolicy: Send + Sync {
    /// Heading level for the block, or `None` to keep it a paragraph.
    fn classify(&self, block: &TextBlock<'_>) -> Option<u8>;
}

/// Never promotes a block.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeadings;

impl HeadingPolicy for NoHeadings {
    fn classify(&self, _block: &TextBlock<'_>) -> Option<u8> {
        None
    }
}

/// Short blocks starting with an uppercase letter are headings.
///
/// Misclassifies short sentences in heading-less documents; that is the
/// price of recovering structure from informally marked-up books.
#[derive(Debug, Clone, Copy)]
pub struct ShortUppercaseBlocks {
    /// Blocks with this many characters or more stay paragraphs.
    pub max_chars: usize,
    /// Level given to detected headings.
    pub level: u8,
}

impl Default for ShortUppercaseBlocks {
    fn default() -> Self {
        Self {
            max_chars: 100,
            level: 2,
        }
    }
}

impl HeadingPolicy for ShortUppercaseBlocks {
    fn classify(&self, block: &TextBlock<'_>) -> Option<u8> {
        if block.continues_paragraph {
            return None;
        }
        let text = block.text.trim();
        if text.is_empty() || text.chars().count() >= self.max_chars {
            return None;
        }
        let first = text.chars().next()?;
        first.is_uppercase().then_some(self.level.clamp(1, 6))
    }
}

/// Whether `text` ends a sentence, so a following block starts a new one.
pub fn ends_sentence(text: &str) -> bool {
    let trimmed = text.trim_end_matches(|c: char| {
        c.is_whitespace() || matches!(c, '"' | '\'' | '\u{201d}' | '\u{2019}' | ')' | ']')
    });
    match trimmed.chars().last() {
        None => true,
        Some(c) => matches!(
            c,
            '.' | '!' | '?' | ':' | ';' | '\u{2026}' | '\u{3002}' | '\u{ff01}' | '\u{ff1f}'
        ),
    }
}
