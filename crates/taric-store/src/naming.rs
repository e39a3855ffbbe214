//! Mapping between sequence ids and storage keys.
//!
//! Layout under the configured folder:
//! - `{folder}/{seq}.xml` -- canonical, published delta file
//! - `{folder}/TEMP_{seq}.xml` -- staged upload awaiting validation
//!
//! Anything else found under the folder is [`KeyClass::Unrecognized`] and
//! must be left alone.

use taric_types::Seq;

/// Folder used when none is configured.
pub const DEFAULT_FOLDER: &str = "taricfiles";

/// File-name prefix that marks a staging object.
pub const TEMP_PREFIX: &str = "TEMP_";

/// Extension carried by every delta file key.
pub const EXTENSION: &str = ".xml";

/// Classification of a listed key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyClass {
    /// A staging object for this seq.
    Temp(Seq),
    /// A published delta file for this seq.
    Canonical(Seq),
    /// Not produced by this service; ignore it.
    Unrecognized,
}

/// Pure key mapping rooted at a folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingScheme {
    folder: String,
}

impl NamingScheme {
    /// Create a scheme rooted at `folder`. Surrounding slashes are ignored;
    /// an empty folder places keys at the backend root.
    pub fn new(folder: impl Into<String>) -> Self {
        let folder: String = folder.into();
        Self {
            folder: folder.trim_matches('/').to_string(),
        }
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    fn qualify(&self, name: &str) -> String {
        if self.folder.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.folder, name)
        }
    }

    pub fn canonical_key(&self, seq: Seq) -> String {
        self.qualify(&format!("{seq}{EXTENSION}"))
    }

    pub fn temp_key(&self, seq: Seq) -> String {
        self.qualify(&format!("{TEMP_PREFIX}{seq}{EXTENSION}"))
    }

    /// Prefix to list every key this scheme can produce.
    pub fn list_prefix(&self) -> String {
        if self.folder.is_empty() {
            String::new()
        } else {
            format!("{}/", self.folder)
        }
    }

    /// Classify a key found in a listing.
    ///
    /// Only keys sitting directly in the folder are considered; keys in
    /// nested folders are unrecognized.
    pub fn classify(&self, key: &str) -> KeyClass {
        let name = match key.rsplit_once('/') {
            Some((parent, name)) if parent == self.folder => name,
            None if self.folder.is_empty() => key,
            _ => return KeyClass::Unrecognized,
        };

        let Some(stem) = name.strip_suffix(EXTENSION) else {
            return KeyClass::Unrecognized;
        };

        match stem.strip_prefix(TEMP_PREFIX) {
            Some(id) => Seq::parse(id).map_or(KeyClass::Unrecognized, KeyClass::Temp),
            None => Seq::parse(stem).map_or(KeyClass::Unrecognized, KeyClass::Canonical),
        }
    }
}

impl Default for NamingScheme {
    fn default() -> Self {
        Self::new(DEFAULT_FOLDER)
    }
}
