//! Suppression of synthetic directory entries.
//!
//! Some platforms inject entries into every directory they touch,
//! such as the `._name` AppleDouble files written by macOS. A
//! [NameFilter] hides them: hidden names are never found by lookup
//! and never listed.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

pub trait NameFilter: Send + Sync {
    /// Return true if entries called `name` must not be exposed.
    fn is_hidden(&self, name: &OsStr) -> bool;
}

/// Filter that hides nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShowAll;

impl NameFilter for ShowAll {
    fn is_hidden(&self, _name: &OsStr) -> bool {
        false
    }
}

/// Filter that hides names starting with any of the given prefixes.
#[derive(Clone, Debug, Default)]
pub struct HidePrefixes {
    prefixes: Vec<OsString>,
}

impl HidePrefixes {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &OsString| !p.is_empty())
                .collect(),
        }
    }

    /// Prefixes the current platform is known to inject.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            HidePrefixes::new(["._"])
        } else {
            HidePrefixes::default()
        }
    }

    /// Hide additional prefixes.
    pub fn with<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.prefixes.extend(HidePrefixes::new(prefixes).prefixes);

        self
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl NameFilter for HidePrefixes {
    fn is_hidden(&self, name: &OsStr) -> bool {
        self.prefixes
            .iter()
            .any(|p| name.as_bytes().starts_with(p.as_bytes()))
    }
}

/// The filter to use when nothing else is configured.
pub fn platform_default() -> Arc<dyn NameFilter> {
    let filter = HidePrefixes::platform_default();
    if filter.is_empty() {
        return Arc::new(ShowAll);
    }

    Arc::new(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_all() {
        assert!(!ShowAll.is_hidden(OsStr::new("._foo")));
    }

    #[test]
    fn hide_prefixes() {
        let filter = HidePrefixes::new(["._", ".nfs"]);

        assert!(filter.is_hidden(OsStr::new("._foo")));
        assert!(filter.is_hidden(OsStr::new(".nfs0001")));
        assert!(filter.is_hidden(OsStr::new("._")));
        assert!(!filter.is_hidden(OsStr::new("foo._")));
        assert!(!filter.is_hidden(OsStr::new(".foo")));
    }

    #[test]
    fn empty_prefix_is_ignored() {
        let filter = HidePrefixes::new([""]);

        assert!(filter.is_empty());
        assert!(!filter.is_hidden(OsStr::new("anything")));
    }

    #[test]
    fn with_extends() {
        let filter = HidePrefixes::default().with(["~$"]);

        assert!(filter.is_hidden(OsStr::new("~$doc.docx")));
    }

    #[test]
    #[cfg(target_os = "macos")]
    fn macos_default_hides_appledouble() {
        assert!(platform_default().is_hidden(OsStr::new("._foo")));
    }

    #[test]
    #[cfg(not(target_os = "macos"))]
    fn default_hides_nothing() {
        assert!(!platform_default().is_hidden(OsStr::new("._foo")));
    }
}
