use crate::fs::Validity;
use crate::fs::filter::{self, HidePrefixes, NameFilter};
use crate::trace::TraceFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of the trace queue.
pub const DEFAULT_TRACE_QUEUE: usize = 4096;

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mount: MountConfig,
    pub trace: TraceConfig,
    pub cache: CacheConfig,
    pub filter: FilterConfig,
}

impl Config {
    /// Read a TOML configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let content = std::fs::read_to_string(path)?;

        Ok(toml::from_str(&content)?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    /// Let users other than the one that mounted the filesystem
    /// access it.
    ///
    /// Requires `user_allow_other` in `/etc/fuse.conf` when not
    /// running as root.
    pub allow_other: bool,

    /// Name shown as the source of the mount.
    pub fsname: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            allow_other: false,
            fsname: "shadowtrace".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    /// File trace records are appended to. Records go to stdout if
    /// unset.
    pub output: Option<PathBuf>,

    pub format: TraceFormat,

    /// Maximum number of records waiting to be written. Records
    /// beyond that are dropped.
    pub queue: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            output: None,
            format: TraceFormat::default(),
            queue: DEFAULT_TRACE_QUEUE,
        }
    }
}

/// How long the kernel may keep what it was told.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub attr_valid: HumanDuration,
    pub entry_valid: HumanDuration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let validity = Validity::default();

        Self {
            attr_valid: HumanDuration(validity.attr),
            entry_valid: HumanDuration(validity.entry),
        }
    }
}

impl CacheConfig {
    pub fn validity(&self) -> Validity {
        Validity {
            attr: self.attr_valid.0,
            entry: self.entry_valid.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// Name prefixes hidden on top of the platform default.
    pub hide_prefixes: Vec<String>,
}

impl FilterConfig {
    /// Build the name filter this configuration describes.
    pub fn build(&self) -> Arc<dyn NameFilter> {
        if self.hide_prefixes.is_empty() {
            return filter::platform_default();
        }

        Arc::new(HidePrefixes::platform_default().with(self.hide_prefixes.iter()))
    }
}

/// A duration written the way humans do, "1s" or "500ms".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl<'de> serde::Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};
        use std::fmt;

        struct HumanDurationVisitor;

        impl<'de> Visitor<'de> for HumanDurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration with units (e.g. \"1s\", \"500ms\")")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                humantime::parse_duration(value.trim())
                    .map(HumanDuration)
                    .map_err(|e| de::Error::custom(format!("invalid duration {value:?}: {e}")))
            }
        }

        deserializer.deserialize_str(HumanDurationVisitor)
    }
}

impl serde::Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}
