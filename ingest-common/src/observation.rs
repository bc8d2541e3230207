use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorCode};

/// Free-form, source-specific attributes of an entity. Stored as JSONB.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Platforms observations can originate from.
/// The upper-case name is part of the identity of every entity, so variants must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Telegram,
    Instagram,
    Vk,
    Facebook,
    Linkedin,
    DarkForum,
    TorHiddenService,
    BitcoinBlockchain,
    EthereumBlockchain,
    LeakDatabase,
    InternalManual,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Telegram => "TELEGRAM",
            Source::Instagram => "INSTAGRAM",
            Source::Vk => "VK",
            Source::Facebook => "FACEBOOK",
            Source::Linkedin => "LINKEDIN",
            Source::DarkForum => "DARK_FORUM",
            Source::TorHiddenService => "TOR_HIDDEN_SERVICE",
            Source::BitcoinBlockchain => "BITCOIN_BLOCKCHAIN",
            Source::EthereumBlockchain => "ETHEREUM_BLOCKCHAIN",
            Source::LeakDatabase => "LEAK_DATABASE",
            Source::InternalManual => "INTERNAL_MANUAL",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Allow casting `Source` from strings, as read back from the database.
impl FromStr for Source {
    type Err = ClassifiedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TELEGRAM" => Ok(Source::Telegram),
            "INSTAGRAM" => Ok(Source::Instagram),
            "VK" => Ok(Source::Vk),
            "FACEBOOK" => Ok(Source::Facebook),
            "LINKEDIN" => Ok(Source::Linkedin),
            "DARK_FORUM" => Ok(Source::DarkForum),
            "TOR_HIDDEN_SERVICE" => Ok(Source::TorHiddenService),
            "BITCOIN_BLOCKCHAIN" => Ok(Source::BitcoinBlockchain),
            "ETHEREUM_BLOCKCHAIN" => Ok(Source::EthereumBlockchain),
            "LEAK_DATABASE" => Ok(Source::LeakDatabase),
            "INTERNAL_MANUAL" => Ok(Source::InternalManual),
            invalid => Err(ClassifiedError::fatal(
                ErrorCode::SerializationError,
                format!("{invalid} is not a valid Source"),
            )),
        }
    }
}

/// Traffic Light Protocol sharing level of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TlpLevel {
    /// Public OSINT data.
    White,
    Green,
    /// Sensitive. Default for anything a collector does not label.
    #[default]
    Amber,
    /// No sharing.
    Red,
}

/// Structured geo-data attached to an observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<i32>,
}

impl GeoLocation {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// A fact about one entity as reported by one source at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub source: Source,
    pub external_id: String,
    pub observed_at: DateTime<Utc>,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub url: Option<String>,
    pub attributes: Attributes,
    pub location: Option<GeoLocation>,
    /// Pointer to the immutable archived copy of the original payload.
    pub raw_data_reference: String,
    /// Trace of the delivery that carried this observation.
    pub trace_id: Uuid,
}

impl Observation {
    /// Create an `Observation` with no descriptive fields.
    /// The raw-data reference is what makes an observation traceable, so a blank one is rejected.
    /// `observed_at` is truncated to the microsecond precision of the store, otherwise a replay
    /// would always look newer than the stored copy of itself.
    pub fn new(
        source: Source,
        external_id: &str,
        raw_data_reference: &str,
        trace_id: Uuid,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, ClassifiedError> {
        if raw_data_reference.trim().is_empty() {
            return Err(ClassifiedError::fatal(
                ErrorCode::ValidationError,
                "observation is missing its raw data reference",
            )
            .with_context("source", source.as_str())
            .with_context("external_id", external_id));
        }

        Ok(Self {
            source,
            external_id: external_id.to_owned(),
            observed_at: observed_at.trunc_subsecs(6),
            username: None,
            display_name: None,
            url: None,
            attributes: Attributes::new(),
            location: None,
            raw_data_reference: raw_data_reference.to_owned(),
            trace_id,
        })
    }

    /// The location of this observation, only if it is complete enough to be stored.
    pub fn storable_location(&self) -> Option<&GeoLocation> {
        self.location
            .as_ref()
            .filter(|location| location.has_coordinates())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_round_trips_through_str() {
        for source in [Source::Telegram, Source::DarkForum, Source::LeakDatabase] {
            assert_eq!(Source::from_str(source.as_str()).unwrap(), source);
        }
        assert!(Source::from_str("telegram").is_err());
    }

    #[test]
    fn test_source_serde_matches_as_str() {
        let json = serde_json::to_string(&Source::TorHiddenService).unwrap();
        assert_eq!(json, "\"TOR_HIDDEN_SERVICE\"");
    }

    #[test]
    fn test_has_coordinates_requires_both() {
        let only_latitude = GeoLocation {
            latitude: Some(55.75),
            ..GeoLocation::default()
        };
        let complete = GeoLocation {
            latitude: Some(55.75),
            longitude: Some(37.61),
            ..GeoLocation::default()
        };

        assert!(!only_latitude.has_coordinates());
        assert!(complete.has_coordinates());
    }

    #[test]
    fn test_observation_requires_raw_data_reference() {
        let error = Observation::new(Source::Telegram, "durov", "  ", Uuid::nil(), Utc::now())
            .unwrap_err();

        assert_eq!(error.code(), ErrorCode::ValidationError);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_observed_at_is_truncated_to_microseconds() {
        let observed_at = "2024-03-01T12:00:00.123456789Z".parse::<DateTime<Utc>>().unwrap();

        let observation =
            Observation::new(Source::Telegram, "durov", "s3://raw/1", Uuid::nil(), observed_at)
                .unwrap();

        assert_eq!(
            observation.observed_at,
            "2024-03-01T12:00:00.123456Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_partial_location_is_not_storable() {
        let mut observation =
            Observation::new(Source::Vk, "id1", "s3://raw/1", Uuid::nil(), Utc::now()).unwrap();
        observation.location = Some(GeoLocation {
            place_name: Some("Moscow".to_owned()),
            longitude: Some(37.61),
            ..GeoLocation::default()
        });

        assert_eq!(observation.storable_location(), None);
    }
}
