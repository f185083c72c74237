/// Read preferences attached to read operations
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{RutaError, RutaResult};

/// Smallest accepted max staleness regardless of heartbeat frequency
pub const MIN_MAX_STALENESS: Duration = Duration::from_secs(90);

/// Tag set matched against node tags; empty matches every node
pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::Secondary => "secondary",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
            ReadPreferenceMode::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadPreferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadPreferenceMode {
    type Err = RutaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(ReadPreferenceMode::Primary),
            "primarypreferred" => Ok(ReadPreferenceMode::PrimaryPreferred),
            "secondary" => Ok(ReadPreferenceMode::Secondary),
            "secondarypreferred" => Ok(ReadPreferenceMode::SecondaryPreferred),
            "nearest" => Ok(ReadPreferenceMode::Nearest),
            other => Err(RutaError::invalid_argument(format!(
                "unknown read preference mode: {}",
                other
            ))),
        }
    }
}

/// Mode, ordered tag sets and an optional staleness bound
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPreference {
    mode: ReadPreferenceMode,
    tag_sets: Vec<TagSet>,
    max_staleness: Option<Duration>,
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self::primary()
    }
}

impl ReadPreference {
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
            max_staleness: None,
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadPreferenceMode::Primary)
    }

    pub fn primary_preferred() -> Self {
        Self::new(ReadPreferenceMode::PrimaryPreferred)
    }

    pub fn secondary() -> Self {
        Self::new(ReadPreferenceMode::Secondary)
    }

    pub fn secondary_preferred() -> Self {
        Self::new(ReadPreferenceMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::new(ReadPreferenceMode::Nearest)
    }

    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    pub fn mode(&self) -> ReadPreferenceMode {
        self.mode
    }

    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness
    }

    /// Reject combinations no node could satisfy
    pub fn validate(&self, heartbeat_frequency: Duration) -> RutaResult<()> {
        if self.mode == ReadPreferenceMode::Primary
            && (!self.tag_sets.is_empty() || self.max_staleness.is_some())
        {
            return Err(RutaError::invalid_argument(
                "read preference primary cannot be combined with tag sets or max staleness",
            ));
        }

        if let Some(max_staleness) = self.max_staleness {
            let floor = MIN_MAX_STALENESS.max(heartbeat_frequency + Duration::from_secs(10));
            if max_staleness < floor {
                return Err(RutaError::invalid_argument(format!(
                    "max staleness {}s is below the minimum of {}s",
                    max_staleness.as_secs(),
                    floor.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// `$readPreference` document sent to routers
    pub fn to_document(&self) -> Document {
        let mut document = doc! { "mode": self.mode.as_str() };
        if !self.tag_sets.is_empty() {
            let tags: Vec<Document> = self
                .tag_sets
                .iter()
                .map(|set| {
                    set.iter()
                        .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
                        .collect()
                })
                .collect();
            document.insert("tags", tags);
        }
        if let Some(max_staleness) = self.max_staleness {
            document.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
        }
        document
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode)?;
        if !self.tag_sets.is_empty() {
            write!(f, " tags={:?}", self.tag_sets)?;
        }
        if let Some(max_staleness) = self.max_staleness {
            write!(f, " maxStalenessSeconds={}", max_staleness.as_secs())?;
        }
        Ok(())
    }
}

/// Parse `dc:east,rack:1` into a tag set. An empty string is the empty set.
pub fn parse_tag_set(input: &str) -> RutaResult<TagSet> {
    let mut tags = TagSet::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                tags.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => {
                return Err(RutaError::invalid_argument(format!(
                    "invalid tag '{}', expected key:value",
                    pair
                )))
            }
        }
    }
    Ok(tags)
}
