//! Bootloader configuration templates.
//!
//! Templates use `${name}` placeholders and `$$` for a literal dollar sign.
//! A placeholder without a value is a `KeyError`, a `$` that starts neither
//! form is a `ValueError`. Both surface as [`Error::Template`].

pub mod grub2;
pub mod isolinux;
pub mod systemd_boot;
pub mod zipl;

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Placeholder values for one rendering.
pub type Values<'a> = BTreeMap<&'a str, String>;

/// A template assembled from text fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    text: String,
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Append a fragment.
    pub fn push(&mut self, fragment: &str) -> &mut Self {
        self.text.push_str(fragment);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn substitute(&self, values: &Values) -> Result<String> {
        let mut out = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos + 1..];
            if let Some(after) = tail.strip_prefix('$') {
                out.push('$');
                rest = after;
            } else if let Some(body) = tail.strip_prefix('{') {
                let end = body
                    .find('}')
                    .ok_or_else(|| invalid_placeholder(&self.text, pos))?;
                let name = &body[..end];
                if !is_identifier(name) {
                    return Err(invalid_placeholder(&self.text, pos));
                }
                let value = values.get(name).ok_or_else(|| Error::Template {
                    kind: "KeyError".to_string(),
                    message: format!("'{}'", name),
                })?;
                out.push_str(value);
                rest = &body[end + 1..];
            } else {
                return Err(invalid_placeholder(&self.text, pos));
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid_placeholder(text: &str, offset: usize) -> Error {
    let line = text[..offset].matches('\n').count() + 1;
    Error::Template {
        kind: "ValueError".to_string(),
        message: format!("Invalid placeholder in string: line {}", line),
    }
}
