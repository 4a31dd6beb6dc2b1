//! Configuration for raster transfers and warping.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Resampling algorithms understood by band transfers and the warp engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    #[default]
    Nearest,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
    Mode,
    Gauss,
    Max,
    Min,
    Med,
    Q1,
    Q3,
    Sum,
    Rms,
}

impl Resampling {
    /// Parse from string (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let resampling = match name.to_lowercase().as_str() {
            "nearest" | "near" => Self::Nearest,
            "bilinear" => Self::Bilinear,
            "cubic" => Self::Cubic,
            "cubic_spline" | "cubicspline" => Self::CubicSpline,
            "lanczos" => Self::Lanczos,
            "average" => Self::Average,
            "mode" => Self::Mode,
            "gauss" => Self::Gauss,
            "max" => Self::Max,
            "min" => Self::Min,
            "med" => Self::Med,
            "q1" => Self::Q1,
            "q3" => Self::Q3,
            "sum" => Self::Sum,
            "rms" => Self::Rms,
            _ => return None,
        };
        Some(resampling)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::Cubic => "cubic",
            Self::CubicSpline => "cubic_spline",
            Self::Lanczos => "lanczos",
            Self::Average => "average",
            Self::Mode => "mode",
            Self::Gauss => "gauss",
            Self::Max => "max",
            Self::Min => "min",
            Self::Med => "med",
            Self::Q1 => "q1",
            Self::Q3 => "q3",
            Self::Sum => "sum",
            Self::Rms => "rms",
        }
    }

    /// Whether band transfers can decimate with this algorithm.
    pub fn supports_transfer(&self) -> bool {
        matches!(
            self,
            Self::Nearest
                | Self::Bilinear
                | Self::Cubic
                | Self::CubicSpline
                | Self::Lanczos
                | Self::Average
                | Self::Mode
                | Self::Gauss
                | Self::Rms
        )
    }

    /// Whether the warp engine can resample with this algorithm.
    pub fn supports_warp(&self) -> bool {
        !matches!(self, Self::Gauss)
    }
}

impl std::fmt::Display for Resampling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Ordered `KEY=VALUE` options forwarded to the native layer.
///
/// Keys are uppercased on insertion and replace an existing entry with the
/// same key. Keys are never validated here: unknown keys are forwarded and the
/// receiving layer decides what to do with them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionList {
    entries: Vec<(String, String)>,
}

impl OptionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let key = key.to_uppercase();
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Sets a boolean option, rendered as `TRUE`/`FALSE`.
    pub fn set_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.set(key, if value { "TRUE" } else { "FALSE" })
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_uppercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Reads an option as a boolean (`YES`/`TRUE`/`ON`/`1` are true).
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(parse_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Copies every entry of `other` into this list, `other` winning on conflicts.
    pub fn merge(&mut self, other: &OptionList) -> &mut Self {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the list as `KEY=VALUE` strings.
    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

impl<K: AsRef<str>, V: ToString> FromIterator<(K, V)> for OptionList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = OptionList::new();
        for (key, value) in iter {
            list.set(key.as_ref(), value);
        }
        list
    }
}

pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_uppercase().as_str(),
        "YES" | "TRUE" | "ON" | "1"
    )
}

/// Configuration of a single warp call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarpConfig {
    /// Number of warp worker threads (>= 1).
    pub threads: usize,

    /// Initialize the destination with its nodata value before warping.
    pub init_dest_nodata: bool,

    /// Working memory budget in megabytes, forwarded to the engine.
    pub warp_memory_limit: Option<usize>,

    /// Extra options forwarded verbatim to the transformer and the warp engine.
    pub options: OptionList,
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            init_dest_nodata: true,
            warp_memory_limit: None,
            options: OptionList::new(),
        }
    }
}

impl WarpConfig {
    /// Seeds a warp configuration from engine-wide defaults.
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            threads: config.num_threads,
            warp_memory_limit: config.warp_memory_limit_mb,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::Configuration("threads must be >= 1".to_string()));
        }
        if self.warp_memory_limit == Some(0) {
            return Err(Error::Configuration(
                "warp_memory_limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Engine-wide defaults, typically loaded from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default warp thread count.
    pub num_threads: usize,

    /// Verify projected points by transforming them back.
    pub check_with_invert_proj: bool,

    /// Warp working memory budget in megabytes.
    pub warp_memory_limit_mb: Option<usize>,

    /// Default resampling algorithm.
    pub resampling: Resampling,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            check_with_invert_proj: false,
            warp_memory_limit_mb: None,
            resampling: Resampling::Nearest,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RASTERBRIDGE_NUM_THREADS") {
            if let Ok(threads) = val.parse() {
                config.num_threads = threads;
            }
        }

        if let Ok(val) = std::env::var("RASTERBRIDGE_CHECK_WITH_INVERT_PROJ") {
            config.check_with_invert_proj = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("RASTERBRIDGE_WARP_MEMORY_LIMIT") {
            if let Ok(limit) = val.parse() {
                config.warp_memory_limit_mb = Some(limit);
            }
        }

        if let Ok(val) = std::env::var("RASTERBRIDGE_RESAMPLING") {
            if let Some(resampling) = Resampling::from_name(&val) {
                config.resampling = resampling;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::Configuration("num_threads must be >= 1".to_string()));
        }
        if self.warp_memory_limit_mb == Some(0) {
            return Err(Error::Configuration(
                "warp_memory_limit_mb must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Config options this configuration installs on an engine.
    pub fn to_options(&self) -> OptionList {
        let mut options = OptionList::new();
        options.set(
            "CHECK_WITH_INVERT_PROJ",
            if self.check_with_invert_proj { "YES" } else { "NO" },
        );
        if let Some(limit) = self.warp_memory_limit_mb {
            options.set("WARP_MEMORY_LIMIT", limit);
        }
        options
    }
}
