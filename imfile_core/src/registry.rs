//! Compression method registry and command templates.
//!
//! The registry is read from a line-oriented config:
//!
//! ```text
//! # name:compress-template:decompress-template
//! gzip:gzip -c %i:gunzip -c > %o
//! zstd:zstd -q -c:unzstd -q -c
//! ```
//!
//! Template placeholders:
//!
//! | token | expands to                                  |
//! |-------|---------------------------------------------|
//! | `%d`  | `-d <dimCount> <e0> <e1> ... ` (trailing space) |
//! | `%t`  | `-t <formatCode> `                          |
//! | `%i`  | input path                                  |
//! | `%o`  | output path                                 |
//! | `%%`  | a literal `%`                               |
//!
//! Any other `%x` pair expands to nothing.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{ImageError, Result};

/// At most this many methods are loaded from a config.
pub const MAX_METHODS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionMethod {
    pub name: String,
    pub compress: String,
    pub decompress: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionRegistry {
    methods: Vec<CompressionMethod>,
}

impl CompressionRegistry {
    pub fn from_methods(mut methods: Vec<CompressionMethod>) -> Result<Self> {
        if methods.is_empty() {
            return Err(ImageError::compression("no compression methods defined"));
        }
        methods.truncate(MAX_METHODS);
        Ok(Self { methods })
    }

    /// Parse config text. Lines starting with `#` and blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut methods = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if methods.len() == MAX_METHODS {
                warn!(line = lineno + 1, "compression method limit reached, rest ignored");
                break;
            }
            let mut parts = line.splitn(3, ':');
            let (Some(name), Some(compress), Some(decompress)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(ImageError::compression(format!(
                    "malformed compression config line {}: expected name:compress:decompress",
                    lineno + 1
                )));
            };
            methods.push(CompressionMethod {
                name: name.to_string(),
                compress: compress.to_string(),
                decompress: decompress.to_string(),
            });
        }
        let registry = Self::from_methods(methods)
            .map_err(|_| ImageError::compression("could not read any compression methods"))?;
        debug!(methods = registry.len(), "compression registry parsed");
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            ImageError::compression(format!(
                "could not open the compression config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CompressionMethod> {
        self.methods.get(index)
    }

    pub fn methods(&self) -> &[CompressionMethod] {
        &self.methods
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }
}

// ── Templates ──────────────────────────────────────────────────────────────

/// Values substituted into a command template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub extents: &'a [usize],
    pub format_code: i32,
    pub input: &'a str,
    pub output: &'a str,
}

pub fn fill_template(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('d') => {
                out.push_str(&format!("-d {} ", vars.extents.len()));
                for e in vars.extents {
                    out.push_str(&format!("{} ", e));
                }
            }
            Some('t') => out.push_str(&format!("-t {} ", vars.format_code)),
            Some('i') => out.push_str(vars.input),
            Some('o') => out.push_str(vars.output),
            Some('%') => out.push('%'),
            _ => {}
        }
    }
    out
}

/// Whether `template` contains the `%<token>` placeholder.
pub fn uses_placeholder(template: &str, token: char) -> bool {
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c == '%' && chars.next() == Some(token) {
            return true;
        }
    }
    false
}
