//! Rows returned by the backend RPCs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Aggregates come back as `null` until a variant has data.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub username: String,
    #[serde(alias = "best_time")]
    pub best_time_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonalBestRow {
    #[serde(alias = "best_time")]
    pub best_time_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comparison {
    #[serde(default, deserialize_with = "null_as_default")]
    pub variant_a_avg: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variant_a_completions: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variant_b_avg: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variant_b_completions: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub percentage_difference: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantStats {
    pub variant: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub avg_completion_time: f64,
    #[serde(default)]
    pub completions: Option<u64>,
}

/// `comparison` and `stats` are optional on the wire so a half-populated
/// response can be rejected explicitly instead of failing to decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VariantOverview {
    #[serde(default)]
    pub comparison: Option<Comparison>,
    #[serde(default)]
    pub stats: Option<Vec<VariantStats>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunnelRow {
    pub variant: String,
    pub stage: String,
    pub stage_order: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecentCompletion {
    #[serde(rename = "Variant", default)]
    pub variant: Option<String>,
    #[serde(rename = "Username", default)]
    pub username: Option<String>,
    #[serde(rename = "Time to Complete", default)]
    pub time_to_complete: Option<f64>,
    #[serde(rename = "Total Guesses", default)]
    pub total_guesses: Option<u32>,
    #[serde(rename = "When", default)]
    pub when: Option<String>,
    #[serde(rename = "City", default)]
    pub city: Option<String>,
    #[serde(rename = "Country", default)]
    pub country: Option<String>,
}

/// Raw completion times in seconds for each arm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Distribution {
    #[serde(default)]
    pub variant_a_times: Option<Vec<f64>>,
    #[serde(default)]
    pub variant_b_times: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    pub variant: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completions: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub avg_time_ms: f64,
    #[serde(default)]
    pub last_completion_at: Option<String>,
}

impl GeoPoint {
    pub fn last_completion(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_completion_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    /// Zero coordinates are treated as "unknown", as the map layer does.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0 => Some((lat, lon)),
            _ => None,
        }
    }

    /// Identity of the completion this point last saw: city plus timestamp.
    pub fn recency_key(&self) -> String {
        format!(
            "{}-{}",
            self.city.as_deref().unwrap_or(""),
            self.last_completion_at.as_deref().unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaderboard_accepts_either_time_field() {
        let a: LeaderboardEntry =
            serde_json::from_str(r#"{"username":"x","best_time":12.5}"#).unwrap();
        let b: LeaderboardEntry =
            serde_json::from_str(r#"{"username":"x","best_time_seconds":12.5}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn overview_missing_fields_still_decodes() {
        let overview: VariantOverview = serde_json::from_str(r#"{"stats":[]}"#).unwrap();
        assert!(overview.comparison.is_none());
        assert_eq!(overview.stats, Some(Vec::new()));
    }

    #[test]
    fn recent_rows_use_display_column_names() {
        let row: RecentCompletion = serde_json::from_str(
            r#"{"Variant":"B","Username":"Quiet Fox","Time to Complete":14.2,"Total Guesses":6}"#,
        )
        .unwrap();
        assert_eq!(row.variant.as_deref(), Some("B"));
        assert_eq!(row.total_guesses, Some(6));
        assert_eq!(row.city, None);
    }

    #[test]
    fn geo_point_timestamp_and_coordinates() {
        let point: GeoPoint = serde_json::from_str(
            r#"{"lat":52.52,"lon":13.4,"city":"Berlin","country":"DE","variant":"A",
                "completions":3,"avg_time_ms":21000,"last_completion_at":"2025-03-01T10:00:00+00:00"}"#,
        )
        .unwrap();
        assert!(point.last_completion().is_some());
        assert_eq!(point.coordinates(), Some((52.52, 13.4)));
        assert_eq!(point.recency_key(), "Berlin-2025-03-01T10:00:00+00:00");
    }

    #[test]
    fn comparison_without_variant_b_data_decodes() {
        let overview: VariantOverview = serde_json::from_str(
            r#"{"comparison":{"variant_a_avg":21.5,"variant_a_completions":4,
                "variant_b_avg":null,"variant_b_completions":null,"percentage_difference":null},
                "stats":[{"variant":"A","avg_completion_time":21.5},
                         {"variant":"B","avg_completion_time":null}]}"#,
        )
        .unwrap();
        let comparison = overview.comparison.unwrap();
        assert_eq!(comparison.variant_a_avg, 21.5);
        assert_eq!(comparison.variant_b_avg, 0.0);
        assert_eq!(comparison.variant_b_completions, 0);
        assert_eq!(overview.stats.unwrap()[1].avg_completion_time, 0.0);
    }

    #[test]
    fn geo_row_with_null_aggregates_decodes() {
        let point: GeoPoint = serde_json::from_str(
            r#"{"lat":null,"lon":null,"city":null,"country":null,"variant":"B",
                "completions":null,"avg_time_ms":null,"last_completion_at":null}"#,
        )
        .unwrap();
        assert_eq!(point.completions, 0);
        assert_eq!(point.avg_time_ms, 0.0);
        assert_eq!(point.coordinates(), None);
    }

    #[test]
    fn funnel_row_with_null_count_decodes() {
        let row: FunnelRow = serde_json::from_str(
            r#"{"variant":"A","stage":"Started","stage_order":1,"event_count":null}"#,
        )
        .unwrap();
        assert_eq!(row.event_count, 0);
    }

    #[test]
    fn distribution_with_null_arms_decodes() {
        let distribution: Distribution =
            serde_json::from_str(r#"{"variant_a_times":[12.0,14.5],"variant_b_times":null}"#)
                .unwrap();
        assert_eq!(distribution.variant_a_times, Some(vec![12.0, 14.5]));
        assert_eq!(distribution.variant_b_times, None);
    }
}
