//! Inline style declarations and package stylesheet class rules.
//!
//! Stylesheets and `style` attributes are tokenized with `cssparser`. Only
//! the handful of properties the document model carries are recognized;
//! everything else is skipped without error.

use super::node::{Alignment, Rgb};
use cssparser::{
    AtRuleParser, CowRcStr, DeclarationParser, ParseError, Parser, ParserInput, ParserState,
    QualifiedRuleParser, RuleBodyItemParser, RuleBodyParser, StyleSheetParser, Token,
};
use std::collections::HashMap;

type CssError<'i> = ParseError<'i, ()>;

/// Style properties recognized on an element.
///
/// `None` means the property was not specified and the inherited or
/// default value applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Declarations {
    /// `color`.
    pub color: Option<Rgb>,
    /// `text-align`.
    pub alignment: Option<Alignment>,
    /// Positive `text-indent`, `margin-left` or `padding-left`.
    pub indent: Option<bool>,
    /// `font-weight`.
    pub bold: Option<bool>,
    /// `font-style`.
    pub italic: Option<bool>,
}

/// One recognized declaration.
#[derive(Debug, Clone, Copy)]
enum Property {
    Color(Rgb),
    Alignment(Alignment),
    Indent(bool),
    Bold(bool),
    Italic(bool),
}

impl Declarations {
    /// Parse a declaration block such as the content of a `style` attribute.
    pub fn parse(block: &str) -> Self {
        let mut input = ParserInput::new(block);
        let mut parser = Parser::new(&mut input);
        parse_declaration_list(&mut parser)
    }

    fn apply(&mut self, property: Property) {
        match property {
            Property::Color(color) => self.color = Some(color),
            Property::Alignment(alignment) => self.alignment = Some(alignment),
            // Any positive offset wins over a zero one
            Property::Indent(positive) => {
                self.indent = Some(self.indent.unwrap_or(false) || positive)
            }
            Property::Bold(bold) => self.bold = Some(bold),
            Property::Italic(italic) => self.italic = Some(italic),
        }
    }

    /// Override fields with the ones `other` specifies.
    pub fn merge(&mut self, other: &Declarations) {
        if other.color.is_some() {
            self.color = other.color;
        }
        if other.alignment.is_some() {
            self.alignment = other.alignment;
        }
        if other.indent.is_some() {
            self.indent = other.indent;
        }
        if other.bold.is_some() {
            self.bold = other.bold;
        }
        if other.italic.is_some() {
            self.italic = other.italic;
        }
    }

    /// Whether no property is specified.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn parse_declaration_list(input: &mut Parser<'_, '_>) -> Declarations {
    let mut decls = Declarations::default();
    let mut parser = DeclarationCollector;
    for property in RuleBodyParser::new(input, &mut parser).flatten() {
        decls.apply(property);
    }
    decls
}

/// Declaration-only body parser.
struct DeclarationCollector;

impl<'i> DeclarationParser<'i> for DeclarationCollector {
    type Declaration = Property;
    type Error = ();

    fn parse_value<'t>(
        &mut self,
        name: CowRcStr<'i>,
        input: &mut Parser<'i, 't>,
        _start: &ParserState,
    ) -> Result<Property, CssError<'i>> {
        let property = match name.to_ascii_lowercase().as_str() {
            "color" => Property::Color(parse_color_value(input)?),
            "text-align" => {
                let location = input.current_source_location();
                let alignment = Alignment::parse(input.expect_ident()?);
                Property::Alignment(alignment.ok_or_else(|| location.new_custom_error(()))?)
            }
            "text-indent" | "margin-left" | "padding-left" => {
                Property::Indent(parse_offset_is_positive(input)?)
            }
            "font-weight" => Property::Bold(parse_font_weight(input)?),
            "font-style" => Property::Italic(parse_font_style(input)?),
            _ => return Err(input.new_custom_error(())),
        };
        // `!important` and trailing values are ignored
        while input.next().is_ok() {}
        Ok(property)
    }
}

impl<'i> AtRuleParser<'i> for DeclarationCollector {
    type Prelude = ();
    type AtRule = Property;
    type Error = ();
}

impl<'i> QualifiedRuleParser<'i> for DeclarationCollector {
    type Prelude = ();
    type QualifiedRule = Property;
    type Error = ();
}

impl<'i> RuleBodyItemParser<'i, Property, ()> for DeclarationCollector {
    fn parse_declarations(&self) -> bool {
        true
    }

    fn parse_qualified(&self) -> bool {
        false
    }
}

fn parse_offset_is_positive<'i>(input: &mut Parser<'i, '_>) -> Result<bool, CssError<'i>> {
    let location = input.current_source_location();
    match *input.next()? {
        Token::Number { value, .. } | Token::Dimension { value, .. } => Ok(value > 0.0),
        Token::Percentage { unit_value, .. } => Ok(unit_value > 0.0),
        _ => Err(location.new_custom_error(())),
    }
}

fn parse_font_weight<'i>(input: &mut Parser<'i, '_>) -> Result<bool, CssError<'i>> {
    let location = input.current_source_location();
    let bold = match *input.next()? {
        Token::Ident(ref keyword) => match keyword.to_ascii_lowercase().as_str() {
            "bold" | "bolder" => Some(true),
            "normal" | "lighter" => Some(false),
            _ => None,
        },
        Token::Number { value, .. } => Some(value >= 600.0),
        _ => None,
    };
    bold.ok_or_else(|| location.new_custom_error(()))
}

fn parse_font_style<'i>(input: &mut Parser<'i, '_>) -> Result<bool, CssError<'i>> {
    let location = input.current_source_location();
    let keyword = input.expect_ident()?.to_ascii_lowercase();
    match keyword.as_str() {
        "italic" | "oblique" => Ok(true),
        "normal" => Ok(false),
        _ => Err(location.new_custom_error(())),
    }
}

/// Parse a CSS color value.
///
/// Supports hex notation, `rgb()`/`rgba()` and the basic named colors.
pub fn parse_color(value: &str) -> Option<Rgb> {
    let mut input = ParserInput::new(value);
    let mut parser = Parser::new(&mut input);
    parser
        .parse_entirely(|input| {
            let color = parse_color_value(input)?;
            let _ = input.try_parse(cssparser::parse_important);
            Ok(color)
        })
        .ok()
}

fn parse_color_value<'i>(input: &mut Parser<'i, '_>) -> Result<Rgb, CssError<'i>> {
    let location = input.current_source_location();
    let token = input.next()?.clone();
    let rgb = match token {
        Token::Hash(ref hex) | Token::IDHash(ref hex) => Rgb::from_hex(&format!("#{}", hex)),
        Token::Ident(ref name) => named_color(&name.to_ascii_lowercase()),
        Token::Function(ref name)
            if name.eq_ignore_ascii_case("rgb") || name.eq_ignore_ascii_case("rgba") =>
        {
            Some(input.parse_nested_block(parse_rgb_channels)?)
        }
        _ => None,
    };
    rgb.ok_or_else(|| location.new_custom_error(()))
}

/// Red, green and blue from the arguments of `rgb()`; alpha is ignored.
fn parse_rgb_channels<'i>(input: &mut Parser<'i, '_>) -> Result<Rgb, CssError<'i>> {
    let mut channels = [0u8; 3];
    for (position, channel) in channels.iter_mut().enumerate() {
        if position > 0 {
            let _ = input.try_parse(|p| p.expect_comma());
        }
        let location = input.current_source_location();
        *channel = match *input.next()? {
            Token::Number { value, .. } => value.clamp(0.0, 255.0).round() as u8,
            Token::Percentage { unit_value, .. } => {
                (unit_value.clamp(0.0, 1.0) * 255.0).round() as u8
            }
            _ => return Err(location.new_custom_error(())),
        };
    }
    while input.next().is_ok() {}
    Ok(Rgb::new(channels[0], channels[1], channels[2]))
}

fn named_color(name: &str) -> Option<Rgb> {
    let rgb = match name {
        "black" => Rgb::new(0, 0, 0),
        "white" => Rgb::new(255, 255, 255),
        "red" => Rgb::new(255, 0, 0),
        "green" => Rgb::new(0, 128, 0),
        "lime" => Rgb::new(0, 255, 0),
        "blue" => Rgb::new(0, 0, 255),
        "navy" => Rgb::new(0, 0, 128),
        "yellow" => Rgb::new(255, 255, 0),
        "orange" => Rgb::new(255, 165, 0),
        "purple" => Rgb::new(128, 0, 128),
        "fuchsia" | "magenta" => Rgb::new(255, 0, 255),
        "aqua" | "cyan" => Rgb::new(0, 255, 255),
        "teal" => Rgb::new(0, 128, 128),
        "olive" => Rgb::new(128, 128, 0),
        "maroon" => Rgb::new(128, 0, 0),
        "brown" => Rgb::new(165, 42, 42),
        "gray" | "grey" => Rgb::new(128, 128, 128),
        "silver" => Rgb::new(192, 192, 192),
        "darkgray" | "darkgrey" => Rgb::new(169, 169, 169),
        "darkred" => Rgb::new(139, 0, 0),
        "darkblue" => Rgb::new(0, 0, 139),
        "darkgreen" => Rgb::new(0, 100, 0),
        _ => return None,
    };
    Some(rgb)
}

/// Whether a `class` attribute names a bold style.
pub fn class_marks_bold(class_attr: &str) -> bool {
    class_tokens(class_attr).any(|t| {
        let t = t.to_ascii_lowercase();
        t.contains("bold") || t.contains("strong")
    })
}

/// Whether a `class` attribute names a centered style.
pub fn class_marks_center(class_attr: &str) -> bool {
    class_tokens(class_attr).any(|t| t.to_ascii_lowercase().contains("center"))
}

fn class_tokens(class_attr: &str) -> impl Iterator<Item = &str> {
    class_attr.split_ascii_whitespace()
}

#[derive(Debug, Clone)]
struct ClassRule {
    /// Tag the rule is restricted to (`p.note`).
    tag: Option<String>,
    declarations: Declarations,
}

/// Class rules collected from the package's stylesheets.
///
/// Only simple `.class` and `tag.class` selectors are recorded, including
/// those nested in `@media` and `@supports` blocks.
#[derive(Debug, Clone, Default)]
pub struct ClassRules {
    rules: HashMap<String, Vec<ClassRule>>,
}

impl ClassRules {
    /// Parse a stylesheet.
    pub fn parse(css: &str) -> Self {
        let mut rules = Self::default();
        rules.add_stylesheet(css);
        rules
    }

    /// Add the rules of another stylesheet; later rules win.
    pub fn add_stylesheet(&mut self, css: &str) {
        let mut input = ParserInput::new(css);
        let mut parser = Parser::new(&mut input);
        let mut collector = RuleCollector { rules: self };
        for result in StyleSheetParser::new(&mut parser, &mut collector) {
            if let Err((_, rule)) = result {
                tracing::trace!(rule = %rule.trim(), "Skipping unsupported CSS rule");
            }
        }
    }

    fn insert(&mut self, selectors: Vec<(Option<String>, String)>, declarations: Declarations) {
        for (tag, class) in selectors {
            self.rules.entry(class).or_default().push(ClassRule {
                tag,
                declarations,
            });
        }
    }

    /// Declarations applying to an element with `tag` and `class_attr`.
    pub fn lookup(&self, tag: &str, class_attr: &str) -> Declarations {
        let mut decls = Declarations::default();
        for token in class_tokens(class_attr) {
            let Some(rules) = self.rules.get(token) else {
                continue;
            };
            for rule in rules {
                let applies = rule
                    .tag
                    .as_deref()
                    .is_none_or(|t| t.eq_ignore_ascii_case(tag));
                if applies {
                    decls.merge(&rule.declarations);
                }
            }
        }
        decls
    }

    /// Number of recorded class names.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rule was recorded.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Top-level and conditional-group rule parser.
struct RuleCollector<'r> {
    rules: &'r mut ClassRules,
}

impl<'i> QualifiedRuleParser<'i> for RuleCollector<'_> {
    type Prelude = Vec<(Option<String>, String)>;
    type QualifiedRule = ();
    type Error = ();

    fn parse_prelude<'t>(
        &mut self,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::Prelude, CssError<'i>> {
        Ok(parse_selector_list(input))
    }

    fn parse_block<'t>(
        &mut self,
        selectors: Self::Prelude,
        _start: &ParserState,
        input: &mut Parser<'i, 't>,
    ) -> Result<(), CssError<'i>> {
        let declarations = parse_declaration_list(input);
        if !selectors.is_empty() && !declarations.is_empty() {
            self.rules.insert(selectors, declarations);
        }
        Ok(())
    }
}

impl<'i> AtRuleParser<'i> for RuleCollector<'_> {
    type Prelude = ();
    type AtRule = ();
    type Error = ();

    fn parse_prelude<'t>(
        &mut self,
        name: CowRcStr<'i>,
        input: &mut Parser<'i, 't>,
    ) -> Result<(), CssError<'i>> {
        if name.eq_ignore_ascii_case("media") || name.eq_ignore_ascii_case("supports") {
            // Conditions are not evaluated
            while input.next().is_ok() {}
            Ok(())
        } else {
            Err(input.new_custom_error(()))
        }
    }

    fn parse_block<'t>(
        &mut self,
        _prelude: (),
        _start: &ParserState,
        input: &mut Parser<'i, 't>,
    ) -> Result<(), CssError<'i>> {
        for result in StyleSheetParser::new(input, self) {
            if let Err((_, rule)) = result {
                tracing::trace!(rule = %rule.trim(), "Skipping unsupported nested CSS rule");
            }
        }
        Ok(())
    }
}

/// Simple class selectors of a comma-separated list; others are dropped.
fn parse_selector_list(input: &mut Parser<'_, '_>) -> Vec<(Option<String>, String)> {
    let mut selectors = Vec::new();
    let mut current = SelectorScan::default();
    while let Ok(token) = input.next_including_whitespace() {
        match token {
            Token::Comma => selectors.extend(std::mem::take(&mut current).finish()),
            Token::WhiteSpace(_) => current.gap = current.started,
            Token::Ident(name) => current.ident(name),
            Token::Delim('.') => current.dot(),
            _ => current.invalid = true,
        }
    }
    selectors.extend(current.finish());
    selectors
}

/// State of one compound selector being scanned.
#[derive(Default)]
struct SelectorScan {
    tag: Option<String>,
    class: Option<String>,
    after_dot: bool,
    started: bool,
    gap: bool,
    invalid: bool,
}

impl SelectorScan {
    fn ident(&mut self, name: &str) {
        if self.gap {
            self.invalid = true;
        } else if self.after_dot {
            self.invalid |= self.class.is_some();
            self.class = Some(name.to_string());
            self.after_dot = false;
        } else if self.started {
            self.invalid = true;
        } else {
            self.tag = Some(name.to_ascii_lowercase());
        }
        self.started = true;
    }

    fn dot(&mut self) {
        if self.gap || self.after_dot || self.class.is_some() {
            self.invalid = true;
        }
        self.after_dot = true;
        self.started = true;
    }

    fn finish(self) -> Option<(Option<String>, String)> {
        if self.invalid || self.after_dot {
            return None;
        }
        self.class.map(|class| (self.tag, class))
    }
}
