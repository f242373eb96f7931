//! Named string annotations stored in the variable-length info region.
//!
//! On disk the region is a flat run of NUL-terminated strings: name, value,
//! name, value, ... closed by one empty string.

use tracing::warn;

use crate::error::{ImageError, Result};

/// Maximum number of info fields per image.
pub const MAX_INFO_FIELDS: usize = 100;

/// Ordered list of `(name, value)` pairs.
///
/// Insertion order is kept until a field is removed: removal moves the last
/// entry into the freed slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoFields {
    entries: Vec<(String, String)>,
}

impl InfoFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of the first field called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace `name`. An empty `value` removes the field instead.
    ///
    /// When the list is full a new name is dropped without error.
    pub fn put(&mut self, name: &str, value: &str) -> Result<()> {
        validate_name(name)?;
        if value.is_empty() {
            self.remove(name);
            return Ok(());
        }
        if value.as_bytes().contains(&0) {
            return Err(ImageError::param("Info value contains a NUL byte"));
        }

        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
        } else if self.entries.len() < MAX_INFO_FIELDS {
            self.entries.push((name.to_string(), value.to_string()));
        } else {
            warn!(name, "info field list full, field dropped");
        }
        Ok(())
    }

    /// Remove the first field called `name`. Returns whether one was found.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.entries.iter().position(|(n, _)| n == name) {
            Some(index) => {
                self.entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Replace this list with a duplicate of `other`, preserving order.
    pub fn copy_from(&mut self, other: &InfoFields) {
        self.entries.clone_from(&other.entries);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Serialize to the on-disk region, including the final empty string.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (name, value) in &self.entries {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(value.as_bytes());
            buf.push(0);
        }
        buf.push(0);
        buf
    }

    /// Parse an info region. Reading stops at the first empty name, at the
    /// end of the buffer, or once the list is full.
    ///
    /// Duplicate names are kept as-is.
    pub fn parse(buf: &[u8]) -> Self {
        let mut strings = buf.split(|b| *b == 0);
        let mut entries = Vec::new();
        while entries.len() < MAX_INFO_FIELDS {
            let name = match strings.next() {
                Some(name) if !name.is_empty() => name,
                _ => break,
            };
            let value = strings.next().unwrap_or_default();
            entries.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ));
        }
        Self { entries }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ImageError::param("Empty info field name"));
    }
    if name.as_bytes().contains(&0) {
        return Err(ImageError::param("Info field name contains a NUL byte"));
    }
    Ok(())
}
