use chrono::Weekday;
use chrono_tz::Tz;
use serde::Deserialize;

use crate::model::Ms;

use super::timezone::{local_weekday_and_minute, parse_time_of_day};

pub const STANDARD_TIER_NAME: &str = "Standard";

/// One day-of-week + time-of-day band, `[start_minute, end_minute)` local.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRateTier")]
pub struct RateTier {
    pub name: String,
    pub level: u8,
    pub day_of_week: Weekday,
    pub start_minute: u16,
    pub end_minute: u16,
    pub multiplier: f64,
    pub color: Option<String>,
}

/// Config file shape: times as `"HH:MM"`.
#[derive(Deserialize)]
struct RawRateTier {
    name: String,
    level: u8,
    day_of_week: Weekday,
    start: String,
    end: String,
    multiplier: f64,
    #[serde(default)]
    color: Option<String>,
}

impl TryFrom<RawRateTier> for RateTier {
    type Error = String;

    fn try_from(raw: RawRateTier) -> Result<Self, Self::Error> {
        let start_minute = parse_time_of_day(&raw.start, false).map_err(|e| e.to_string())?;
        let end_minute = parse_time_of_day(&raw.end, true).map_err(|e| e.to_string())?;
        Ok(RateTier {
            name: raw.name,
            level: raw.level,
            day_of_week: raw.day_of_week,
            start_minute,
            end_minute,
            multiplier: raw.multiplier,
            color: raw.color,
        })
    }
}

/// Resolved tier for an instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TierInfo {
    pub name: String,
    pub level: u8,
    pub multiplier: f64,
    pub color: Option<String>,
}

impl TierInfo {
    pub fn standard() -> Self {
        Self {
            name: STANDARD_TIER_NAME.to_string(),
            level: 0,
            multiplier: 1.0,
            color: None,
        }
    }
}

/// Requested tier for slot suggestions. Matching is by exact level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TierPreference {
    #[default]
    Any,
    Standard,
    Premium,
    Emergency,
}

impl TierPreference {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "any" => Some(TierPreference::Any),
            "standard" => Some(TierPreference::Standard),
            "premium" => Some(TierPreference::Premium),
            "emergency" => Some(TierPreference::Emergency),
            _ => None,
        }
    }

    /// `None` for `Any`.
    pub fn level(self) -> Option<u8> {
        match self {
            TierPreference::Any => None,
            TierPreference::Standard => Some(0),
            TierPreference::Premium => Some(1),
            TierPreference::Emergency => Some(2),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TierPreference::Any => "any",
            TierPreference::Standard => "standard",
            TierPreference::Premium => "premium",
            TierPreference::Emergency => "emergency",
        }
    }

    pub fn matches(self, tier: &TierInfo) -> bool {
        self.level().is_none_or(|level| tier.level == level)
    }
}

/// Configured bands, kept in lookup order: level descending, then start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateTable {
    bands: Vec<RateTier>,
}

impl RateTable {
    /// Rejects empty/inverted bands and same-level bands that overlap on the
    /// same day (lookup order could not tell them apart).
    pub fn new(mut bands: Vec<RateTier>) -> Result<Self, String> {
        for band in &bands {
            if band.start_minute >= band.end_minute || band.end_minute > 24 * 60 {
                return Err(format!(
                    "tier {} on {}: empty or inverted band",
                    band.name, band.day_of_week
                ));
            }
            if !band.multiplier.is_finite() || band.multiplier <= 0.0 {
                return Err(format!("tier {}: multiplier must be positive", band.name));
            }
        }
        bands.sort_by(|a, b| {
            b.level
                .cmp(&a.level)
                .then(a.start_minute.cmp(&b.start_minute))
        });
        for (i, a) in bands.iter().enumerate() {
            for b in &bands[i + 1..] {
                if a.level == b.level
                    && a.day_of_week == b.day_of_week
                    && a.start_minute < b.end_minute
                    && b.start_minute < a.end_minute
                {
                    return Err(format!(
                        "tiers {} and {} overlap on {} at level {}",
                        a.name, b.name, a.day_of_week, a.level
                    ));
                }
            }
        }
        Ok(Self { bands })
    }

    pub fn bands(&self) -> &[RateTier] {
        &self.bands
    }

    /// First matching band for the local weekday/time of `at`, or Standard.
    pub fn resolve(&self, at: Ms, tz: Tz) -> TierInfo {
        let Some((weekday, minute)) = local_weekday_and_minute(at, tz) else {
            return TierInfo::standard();
        };
        self.bands
            .iter()
            .find(|b| b.day_of_week == weekday && b.start_minute <= minute && minute < b.end_minute)
            .map(|b| TierInfo {
                name: b.name.clone(),
                level: b.level,
                multiplier: b.multiplier,
                color: b.color.clone(),
            })
            .unwrap_or_else(TierInfo::standard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::timezone::parse_instant;

    const NEW_YORK: Tz = chrono_tz::America::New_York;

    fn band(name: &str, level: u8, day: Weekday, start: u16, end: u16, multiplier: f64) -> RateTier {
        RateTier {
            name: name.into(),
            level,
            day_of_week: day,
            start_minute: start * 60,
            end_minute: end * 60,
            multiplier,
            color: None,
        }
    }

    fn at(s: &str) -> Ms {
        parse_instant(s).unwrap()
    }

    #[test]
    fn no_band_falls_back_to_standard() {
        let table = RateTable::default();
        let tier = table.resolve(at("2025-11-01T12:00:00Z"), NEW_YORK);
        assert_eq!(tier, TierInfo::standard());
        assert_eq!(tier.multiplier, 1.0);
    }

    #[test]
    fn band_lookup_uses_business_local_time() {
        let table = RateTable::new(vec![band("Premium", 1, Weekday::Sat, 17, 22, 1.5)]).unwrap();
        // 2025-11-01 17:00 EDT = 21:00Z
        assert_eq!(table.resolve(at("2025-11-01T21:00:00Z"), NEW_YORK).name, "Premium");
        // 16:59 local is still standard
        assert_eq!(table.resolve(at("2025-11-01T20:59:00Z"), NEW_YORK).level, 0);
        // 22:00 local is outside the half-open band
        assert_eq!(table.resolve(at("2025-11-02T02:00:00Z"), NEW_YORK).level, 0);
    }

    #[test]
    fn higher_level_wins_where_bands_overlap() {
        let table = RateTable::new(vec![
            band("Premium", 1, Weekday::Mon, 17, 24, 1.5),
            band("Emergency", 2, Weekday::Mon, 20, 24, 2.0),
        ])
        .unwrap();
        // Monday 2025-11-03 21:00 EST = 02:00Z Tuesday
        let tier = table.resolve(at("2025-11-04T02:00:00Z"), NEW_YORK);
        assert_eq!(tier.name, "Emergency");
        assert_eq!(tier.multiplier, 2.0);
        let tier = table.resolve(at("2025-11-03T23:00:00Z"), NEW_YORK);
        assert_eq!(tier.name, "Premium");
    }

    #[test]
    fn resolution_is_deterministic() {
        let table = RateTable::new(vec![band("Premium", 1, Weekday::Sat, 17, 22, 1.5)]).unwrap();
        let t = at("2025-11-01T21:30:00Z");
        assert_eq!(table.resolve(t, NEW_YORK), table.resolve(t, NEW_YORK));
    }

    #[test]
    fn ambiguous_same_level_bands_rejected() {
        let err = RateTable::new(vec![
            band("Evening", 1, Weekday::Fri, 17, 21, 1.5),
            band("Late", 1, Weekday::Fri, 20, 23, 1.6),
        ])
        .unwrap_err();
        assert!(err.contains("overlap"));
        assert!(RateTable::new(vec![band("Broken", 1, Weekday::Fri, 18, 17, 1.5)]).is_err());
    }

    #[test]
    fn preference_matches_exact_level() {
        let premium = TierInfo { name: "Premium".into(), level: 1, multiplier: 1.5, color: None };
        assert!(TierPreference::Premium.matches(&premium));
        assert!(!TierPreference::Emergency.matches(&premium));
        assert!(!TierPreference::Standard.matches(&premium));
        assert!(TierPreference::Any.matches(&premium));
        assert_eq!(TierPreference::parse("PREMIUM"), Some(TierPreference::Premium));
        assert_eq!(TierPreference::parse("gold"), None);
    }

    #[test]
    fn bands_deserialize_from_config_shape() {
        let json = r##"{"name":"Premium","level":1,"day_of_week":"Sat","start":"17:00","end":"22:00","multiplier":1.5,"color":"#f59e0b"}"##;
        let tier: RateTier = serde_json::from_str(json).unwrap();
        assert_eq!(tier.start_minute, 17 * 60);
        assert_eq!(tier.end_minute, 22 * 60);
        assert_eq!(tier.color.as_deref(), Some("#f59e0b"));

        let bad = r#"{"name":"X","level":1,"day_of_week":"Sat","start":"5pm","end":"22:00","multiplier":1.5}"#;
        assert!(serde_json::from_str::<RateTier>(bad).is_err());
    }
}
