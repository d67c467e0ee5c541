use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Number of post-processing slots a chain can describe.
pub const SLOT_COUNT: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to serialise configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Semantic role of a post-processing slot; decides which scalar uniform the
/// slot's value is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotRole {
    Saturation,
    Distortion,
    Delay,
    Pixelate,
    Vignette,
    Custom,
}

impl SlotRole {
    /// Uniform name the role writes its value to unless overridden.
    pub fn default_uniform(self) -> Option<&'static str> {
        match self {
            SlotRole::Saturation => Some("u_saturation"),
            SlotRole::Distortion => Some("u_distortion"),
            SlotRole::Delay => Some("u_feedback_amount"),
            SlotRole::Pixelate => Some("u_pixelate"),
            SlotRole::Vignette => Some("u_darkness"),
            SlotRole::Custom => None,
        }
    }

    pub fn default_value(self) -> f32 {
        match self {
            SlotRole::Saturation => 1.0,
            SlotRole::Distortion => 0.25,
            SlotRole::Delay => 0.85,
            SlotRole::Pixelate => 0.3,
            SlotRole::Vignette => 0.5,
            SlotRole::Custom => 0.5,
        }
    }
}

impl fmt::Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotRole::Saturation => "saturation",
            SlotRole::Distortion => "distortion",
            SlotRole::Delay => "delay",
            SlotRole::Pixelate => "pixelate",
            SlotRole::Vignette => "vignette",
            SlotRole::Custom => "custom",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainConfig {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_dir: Option<PathBuf>,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        serialize_with = "serialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub reload_poll: Option<Duration>,
    #[serde(default)]
    pub slots: Vec<SlotEntry>,
}

/// One `[[slots]]` table. An empty `file` marks the slot as unused.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct SlotEntry {
    #[serde(default)]
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<SlotRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
    #[serde(default)]
    pub active: bool,
}

impl SlotEntry {
    fn builtin(file: &str, role: SlotRole) -> Self {
        Self {
            file: file.to_string(),
            role: Some(role),
            uniform: None,
            value: None,
            active: false,
        }
    }

    pub fn is_unused(&self) -> bool {
        self.file.trim().is_empty()
    }

    pub fn role(&self) -> SlotRole {
        self.role.unwrap_or(SlotRole::Custom)
    }

    /// Uniform receiving the slot value: explicit override first, role default second.
    pub fn uniform_name(&self) -> Option<&str> {
        self.uniform
            .as_deref()
            .or_else(|| self.role().default_uniform())
    }

    pub fn initial_value(&self) -> f32 {
        self.value
            .unwrap_or_else(|| self.role().default_value())
            .clamp(0.0, 1.0)
    }
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn serialize_duration_opt<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(duration) => {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }
        None => serializer.serialize_none(),
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ChainConfig {
    /// The stock slot mapping shipped with the host.
    pub fn builtin() -> Self {
        Self {
            version: 1,
            post_dir: None,
            reload_poll: None,
            slots: vec![
                SlotEntry::builtin("saturation.frag", SlotRole::Saturation),
                SlotEntry::builtin("distortion.frag", SlotRole::Distortion),
                SlotEntry::builtin("delay.frag", SlotRole::Delay),
                SlotEntry::builtin("pixelate.frag", SlotRole::Pixelate),
                SlotEntry::builtin("vignette.frag", SlotRole::Vignette),
                SlotEntry::default(),
            ],
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: ChainConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Returns the slot entry at `index`, or `None` when the index is out of
    /// range or the slot is unused.
    pub fn slot(&self, index: usize) -> Option<&SlotEntry> {
        self.slots.get(index).filter(|entry| !entry.is_unused())
    }

    /// Index of the slot carrying the temporal-delay role, if any.
    pub fn feedback_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|entry| !entry.is_unused() && entry.role() == SlotRole::Delay)
    }

    /// Resolves `post_dir` against `base` when it is relative.
    pub fn post_dir_from(&self, base: &Path) -> Option<PathBuf> {
        self.post_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                base.join(dir)
            }
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.slots.len() > SLOT_COUNT {
            return Err(ConfigError::Invalid(format!(
                "chain defines {} slots; at most {SLOT_COUNT} are supported",
                self.slots.len()
            )));
        }

        if let Some(poll) = self.reload_poll {
            if poll.is_zero() {
                return Err(ConfigError::Invalid(
                    "reload_poll must be greater than zero".into(),
                ));
            }
        }

        let mut delay_slots = 0;
        for (index, entry) in self.slots.iter().enumerate() {
            if entry.is_unused() {
                if entry.active {
                    return Err(ConfigError::Invalid(format!(
                        "slot {index} has no file but is marked active"
                    )));
                }
                continue;
            }

            if entry.file.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "slot {index} file '{}' must be a bare file name inside post_dir",
                    entry.file
                )));
            }

            if let Some(value) = entry.value {
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::Invalid(format!(
                        "slot {index} value {value} must lie within [0, 1]"
                    )));
                }
            }

            if entry.uniform_name().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "slot {index} uses role 'custom' and must name a uniform"
                )));
            }

            if entry.role() == SlotRole::Delay {
                delay_slots += 1;
            }
        }

        if delay_slots > 1 {
            return Err(ConfigError::Invalid(format!(
                "only one delay slot is supported; found {delay_slots}"
            )));
        }

        Ok(())
    }
}
