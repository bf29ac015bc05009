//! Stylesheet sanitizer.
//!
//! Every declaration is classified into a [`PropertyCategory`]. Declarations
//! whose category is switched on in the profile are dropped; rules left with
//! no declarations disappear with them. `@media` and `@supports` blocks are
//! sanitized recursively, `@font-face` is removed when fonts are stripped,
//! and every other at-rule is copied verbatim.
//!
//! Parsing is rule-by-rule: a malformed rule is skipped without affecting its
//! neighbours. When nothing needs dropping the original text is returned
//! untouched, so a second pass over sanitized output is a no-op.

use crate::config::OptimizationProfile;
use cssparser::{
    AtRuleParser, CowRcStr, DeclarationParser, ParseError, Parser, ParserInput, ParserState,
    QualifiedRuleParser, RuleBodyItemParser, RuleBodyParser, StyleSheetParser,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What a declaration does to layout, as far as an e-paper reader cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyCategory {
    Float,
    Flexbox,
    Grid,
    Positioning,
    Columns,
    FixedDimension,
    Margin,
    TextIndent,
    FontFamily,
    Other,
}

impl PropertyCategory {
    /// Whether `profile` removes declarations of this category.
    pub fn is_stripped_by(self, profile: &OptimizationProfile) -> bool {
        let css = &profile.css;
        match self {
            PropertyCategory::Float => css.floats,
            PropertyCategory::Flexbox => css.flexbox,
            PropertyCategory::Grid => css.grid,
            PropertyCategory::Positioning => css.positioning,
            PropertyCategory::Columns => css.columns,
            PropertyCategory::FixedDimension => css.fixed_dimensions,
            PropertyCategory::Margin => css.margins,
            PropertyCategory::TextIndent => css.text_indent,
            PropertyCategory::FontFamily => profile.strip_fonts,
            PropertyCategory::Other => false,
        }
    }
}

static RE_ABSOLUTE_LENGTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(?:\d+(?:\.\d*)?|\.\d+)(?:px|pt|pc|cm|mm|in)$").unwrap()
});

static RE_LEADING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(?:\d+(?:\.\d*)?|\.\d+)").unwrap());

static RE_IMPORTANT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s*!\s*important\s*$").unwrap());

/// Generic families `font-family` may be reduced to.
const GENERIC_FAMILIES: &[&str] = &[
    "serif",
    "sans-serif",
    "monospace",
    "cursive",
    "fantasy",
    "system-ui",
];

fn split_important(value: &str) -> (&str, bool) {
    match RE_IMPORTANT.find(value) {
        Some(m) => (value[..m.start()].trim(), true),
        None => (value.trim(), false),
    }
}

/// Classify one declaration by property name and value.
pub fn classify(name: &str, value: &str) -> PropertyCategory {
    let name = name.trim().to_ascii_lowercase();
    let (value, _) = split_important(value);
    let value = value.to_ascii_lowercase();

    match name.as_str() {
        "float" if value != "none" => PropertyCategory::Float,
        "display" => match value.as_str() {
            "flex" | "inline-flex" => PropertyCategory::Flexbox,
            "grid" | "inline-grid" => PropertyCategory::Grid,
            _ => PropertyCategory::Other,
        },
        n if n.starts_with("flex") => PropertyCategory::Flexbox,
        n if n.starts_with("grid") => PropertyCategory::Grid,
        "position" if value == "absolute" || value == "fixed" => PropertyCategory::Positioning,
        "column-count" | "columns" | "column-width" if value != "auto" => {
            PropertyCategory::Columns
        }
        "width" | "height" if RE_ABSOLUTE_LENGTH.is_match(&value) => {
            PropertyCategory::FixedDimension
        }
        "margin" | "margin-left" | "margin-right" => PropertyCategory::Margin,
        "text-indent" => match RE_LEADING_NUMBER
            .find(&value)
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            Some(n) if n.abs() >= 10.0 => PropertyCategory::TextIndent,
            _ => PropertyCategory::Other,
        },
        "font-family" => PropertyCategory::FontFamily,
        _ => PropertyCategory::Other,
    }
}

/// The generic family named in a `font-family` list, if any.
fn generic_family(value: &str) -> Option<&'static str> {
    value.split(',').find_map(|family| {
        let family = family
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .to_ascii_lowercase();
        GENERIC_FAMILIES.iter().copied().find(|g| *g == family)
    })
}

// ── Model ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    /// Raw value text, including any `!important`.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CssRule {
    /// `selectors { declarations }`
    Style {
        selectors: String,
        declarations: Vec<Declaration>,
    },
    /// `@media` / `@supports` with nested rules.
    Group {
        name: String,
        prelude: String,
        rules: Vec<CssRule>,
    },
    /// Any other at-rule with a block, kept verbatim.
    Block {
        name: String,
        prelude: String,
        body: String,
    },
    /// Block-less at-rule such as `@import` or `@charset`.
    Statement { name: String, prelude: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stylesheet {
    pub rules: Vec<CssRule>,
}

impl Stylesheet {
    /// Parse a stylesheet, skipping malformed rules.
    pub fn parse(css: &str) -> Self {
        let mut input = ParserInput::new(css);
        let mut parser = Parser::new(&mut input);
        let mut rule_parser = TopLevelRuleParser;

        let rules = StyleSheetParser::new(&mut parser, &mut rule_parser)
            .filter_map(Result::ok)
            .collect();
        Self { rules }
    }

    pub fn to_css(&self) -> String {
        let mut out = String::new();
        for rule in &self.rules {
            write_rule(&mut out, rule, 0);
        }
        out
    }
}

fn write_rule(out: &mut String, rule: &CssRule, depth: usize) {
    let indent = "  ".repeat(depth);
    match rule {
        CssRule::Style {
            selectors,
            declarations,
        } => {
            out.push_str(&format!("{indent}{selectors} {{\n"));
            for d in declarations {
                out.push_str(&format!("{indent}  {}: {};\n", d.name, d.value));
            }
            out.push_str(&format!("{indent}}}\n"));
        }
        CssRule::Group {
            name,
            prelude,
            rules,
        } => {
            out.push_str(&format!("{indent}@{name} {prelude} {{\n"));
            for r in rules {
                write_rule(out, r, depth + 1);
            }
            out.push_str(&format!("{indent}}}\n"));
        }
        CssRule::Block {
            name,
            prelude,
            body,
        } => {
            let head = if prelude.is_empty() {
                format!("@{name}")
            } else {
                format!("@{name} {prelude}")
            };
            out.push_str(&format!("{indent}{head} {{{body}}}\n"));
        }
        CssRule::Statement { name, prelude } => {
            out.push_str(&format!("{indent}@{name} {prelude};\n"));
        }
    }
}

// ── cssparser glue ───────────────────────────────────────────────────────

/// Consume the rest of `input` and return the text it covered.
fn rest_of<'i>(input: &mut Parser<'i, '_>) -> &'i str {
    let start = input.position();
    while input.next_including_whitespace_and_comments().is_ok() {}
    input.slice_from(start)
}

struct TopLevelRuleParser;

struct AtPrelude {
    name: String,
    prelude: String,
}

impl<'i> AtRuleParser<'i> for TopLevelRuleParser {
    type Prelude = AtPrelude;
    type AtRule = CssRule;
    type Error = ();

    fn parse_prelude<'t>(
        &mut self,
        name: CowRcStr<'i>,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::Prelude, ParseError<'i, Self::Error>> {
        Ok(AtPrelude {
            name: name.to_ascii_lowercase(),
            prelude: rest_of(input).trim().to_string(),
        })
    }

    fn rule_without_block(
        &mut self,
        prelude: Self::Prelude,
        _start: &ParserState,
    ) -> Result<Self::AtRule, ()> {
        Ok(CssRule::Statement {
            name: prelude.name,
            prelude: prelude.prelude,
        })
    }

    fn parse_block<'t>(
        &mut self,
        prelude: Self::Prelude,
        _start: &ParserState,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::AtRule, ParseError<'i, Self::Error>> {
        let body = rest_of(input);
        Ok(match prelude.name.as_str() {
            "media" | "supports" => CssRule::Group {
                name: prelude.name,
                prelude: prelude.prelude,
                rules: Stylesheet::parse(body).rules,
            },
            _ => CssRule::Block {
                name: prelude.name,
                prelude: prelude.prelude,
                body: body.to_string(),
            },
        })
    }
}

impl<'i> QualifiedRuleParser<'i> for TopLevelRuleParser {
    type Prelude = String;
    type QualifiedRule = CssRule;
    type Error = ();

    fn parse_prelude<'t>(
        &mut self,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::Prelude, ParseError<'i, Self::Error>> {
        let selectors = rest_of(input).trim();
        if selectors.is_empty() {
            return Err(input.new_custom_error(()));
        }
        Ok(selectors.to_string())
    }

    fn parse_block<'t>(
        &mut self,
        prelude: Self::Prelude,
        _start: &ParserState,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::QualifiedRule, ParseError<'i, Self::Error>> {
        let mut decl_parser = DeclarationListParser;
        let declarations = RuleBodyParser::new(input, &mut decl_parser)
            .filter_map(Result::ok)
            .collect();
        Ok(CssRule::Style {
            selectors: prelude,
            declarations,
        })
    }
}

struct DeclarationListParser;

impl<'i> DeclarationParser<'i> for DeclarationListParser {
    type Declaration = Declaration;
    type Error = ();

    fn parse_value<'t>(
        &mut self,
        name: CowRcStr<'i>,
        input: &mut Parser<'i, 't>,
        _start: &ParserState,
    ) -> Result<Self::Declaration, ParseError<'i, Self::Error>> {
        let value = rest_of(input).trim();
        if value.is_empty() {
            return Err(input.new_custom_error(()));
        }
        Ok(Declaration {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

impl<'i> AtRuleParser<'i> for DeclarationListParser {
    type Prelude = ();
    type AtRule = Declaration;
    type Error = ();
}

impl<'i> QualifiedRuleParser<'i> for DeclarationListParser {
    type Prelude = ();
    type QualifiedRule = Declaration;
    type Error = ();
}

impl<'i> RuleBodyItemParser<'i, Declaration, ()> for DeclarationListParser {
    fn parse_declarations(&self) -> bool {
        true
    }
    fn parse_qualified(&self) -> bool {
        false
    }
}

// ── Sanitizing ───────────────────────────────────────────────────────────

/// Result of sanitizing one stylesheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedCss {
    /// Rewritten text, or `None` when the input needed no change.
    pub css: Option<String>,
    pub declarations_dropped: usize,
    pub font_families_rewritten: usize,
    pub font_faces_removed: usize,
    pub rules_removed: usize,
}

impl SanitizedCss {
    pub fn changed(&self) -> bool {
        self.css.is_some()
    }
}

#[derive(Debug, Default)]
struct Tally {
    declarations_dropped: usize,
    font_families_rewritten: usize,
    font_faces_removed: usize,
    rules_removed: usize,
}

impl Tally {
    fn any(&self) -> bool {
        self.declarations_dropped
            + self.font_families_rewritten
            + self.font_faces_removed
            + self.rules_removed
            > 0
    }
}

/// Sanitize stylesheet text according to `profile`.
pub fn sanitize_stylesheet(css: &str, profile: &OptimizationProfile) -> SanitizedCss {
    let sheet = Stylesheet::parse(css);
    let mut tally = Tally::default();
    let rules = sanitize_rules(sheet.rules, profile, &mut tally);

    SanitizedCss {
        css: tally.any().then(|| Stylesheet { rules }.to_css()),
        declarations_dropped: tally.declarations_dropped,
        font_families_rewritten: tally.font_families_rewritten,
        font_faces_removed: tally.font_faces_removed,
        rules_removed: tally.rules_removed,
    }
}

fn sanitize_rules(
    rules: Vec<CssRule>,
    profile: &OptimizationProfile,
    tally: &mut Tally,
) -> Vec<CssRule> {
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        match rule {
            CssRule::Style {
                selectors,
                declarations,
            } => {
                let before = declarations.len();
                let kept = sanitize_declarations(declarations, profile, tally);
                if kept.is_empty() && before > 0 {
                    tally.rules_removed += 1;
                    continue;
                }
                out.push(CssRule::Style {
                    selectors,
                    declarations: kept,
                });
            }
            CssRule::Group {
                name,
                prelude,
                rules,
            } => {
                let before = rules.len();
                let inner = sanitize_rules(rules, profile, tally);
                if inner.is_empty() && before > 0 {
                    tally.rules_removed += 1;
                    continue;
                }
                out.push(CssRule::Group {
                    name,
                    prelude,
                    rules: inner,
                });
            }
            CssRule::Block { ref name, .. } if name == "font-face" && profile.strip_fonts => {
                tally.font_faces_removed += 1;
            }
            other => out.push(other),
        }
    }
    out
}

fn sanitize_declarations(
    declarations: Vec<Declaration>,
    profile: &OptimizationProfile,
    tally: &mut Tally,
) -> Vec<Declaration> {
    let mut kept = Vec::with_capacity(declarations.len());
    for mut decl in declarations {
        let category = classify(&decl.name, &decl.value);
        if !category.is_stripped_by(profile) {
            kept.push(decl);
            continue;
        }
        if category == PropertyCategory::FontFamily {
            let (value, important) = split_important(&decl.value);
            if let Some(generic) = generic_family(value) {
                if !value.eq_ignore_ascii_case(generic) {
                    decl.value = if important {
                        format!("{generic} !important")
                    } else {
                        generic.to_string()
                    };
                    tally.font_families_rewritten += 1;
                }
                kept.push(decl);
                continue;
            }
        }
        tally.declarations_dropped += 1;
    }
    kept
}
