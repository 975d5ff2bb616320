//! One successful poll of the aggregate views, and the view models the
//! dashboard renders from it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::kde::{compute_kde, KdeCurve};
use crate::error::{Result, SimError};
use crate::remote::{
    Comparison, Distribution, FunnelRow, GeoPoint, RecentCompletion, VariantOverview,
    VariantStats,
};

/// Everything one poll cycle fetched. Only built from a complete, valid
/// fetch, so a previous snapshot is never partially overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSnapshot {
    pub comparison: Comparison,
    pub stats: Vec<VariantStats>,
    pub funnel: Vec<FunnelRow>,
    pub recent: Vec<RecentCompletion>,
    pub distribution: Distribution,
    pub geo: Vec<GeoPoint>,
    pub fetched_at: DateTime<Utc>,
}

impl DashboardSnapshot {
    pub fn from_fetch(
        overview: VariantOverview,
        funnel: Vec<FunnelRow>,
        recent: Vec<RecentCompletion>,
        distribution: Distribution,
        geo: Vec<GeoPoint>,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self> {
        let (Some(comparison), Some(stats)) = (overview.comparison, overview.stats) else {
            return Err(SimError::Validation("Overview data missing".into()));
        };
        Ok(Self {
            comparison,
            stats,
            funnel,
            recent,
            distribution,
            geo,
            fetched_at,
        })
    }

    pub fn comparison_view(&self) -> ComparisonView {
        ComparisonView::from(&self.comparison)
    }

    /// `None` until both variants have a stats row.
    pub fn average_time_view(&self) -> Option<AverageTimeView> {
        if self.stats.len() < 2 {
            return None;
        }
        let by_name = |name: &str| {
            self.stats
                .iter()
                .find(|row| row.variant.eq_ignore_ascii_case(name))
        };
        let (a, b) = match (by_name("A"), by_name("B")) {
            (Some(a), Some(b)) => (a, b),
            _ => (&self.stats[0], &self.stats[1]),
        };
        Some(AverageTimeView {
            variant_a_avg: a.avg_completion_time,
            variant_b_avg: b.avg_completion_time,
        })
    }

    pub fn funnel_view(&self) -> FunnelView {
        FunnelView {
            variant_a: funnel_stages(&self.funnel, "A"),
            variant_b: funnel_stages(&self.funnel, "B"),
        }
    }

    /// `None` unless both variants reported their completion times.
    pub fn distribution_view(&self, resolution: usize) -> Option<DistributionView> {
        let a = self.distribution.variant_a_times.as_deref()?;
        let b = self.distribution.variant_b_times.as_deref()?;
        Some(DistributionView {
            variant_a: compute_kde(a, resolution),
            variant_b: compute_kde(b, resolution),
        })
    }

    pub fn recent_view(&self) -> RecentView {
        RecentView {
            rows: self.recent.clone(),
        }
    }

    pub fn geo_view(&self) -> GeoView {
        GeoView {
            markers: self.geo.iter().filter_map(GeoMarker::from_point).collect(),
            most_recent: most_recent(&self.geo).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Verdict {
    VariantAHarder,
    VariantBHarder,
    Equal,
}

impl Verdict {
    pub fn from_difference(percentage_difference: f64) -> Self {
        if percentage_difference > 0.0 {
            Verdict::VariantAHarder
        } else if percentage_difference < 0.0 {
            Verdict::VariantBHarder
        } else {
            Verdict::Equal
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Verdict::VariantAHarder => "5-pineapples variant seems to be harder",
            Verdict::VariantBHarder => "4-pineapples variant seems to be harder",
            Verdict::Equal => "Both variants are equal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonView {
    pub variant_a_avg: f64,
    pub variant_a_completions: u64,
    pub variant_b_avg: f64,
    pub variant_b_completions: u64,
    pub percentage_difference: f64,
    pub verdict: Verdict,
}

impl ComparisonView {
    /// Signed difference as shown, e.g. `+12.5%`.
    pub fn difference_label(&self) -> String {
        let sign = if self.percentage_difference > 0.0 { "+" } else { "" };
        format!("{sign}{}%", self.percentage_difference)
    }
}

impl From<&Comparison> for ComparisonView {
    fn from(c: &Comparison) -> Self {
        Self {
            variant_a_avg: c.variant_a_avg,
            variant_a_completions: c.variant_a_completions,
            variant_b_avg: c.variant_b_avg,
            variant_b_completions: c.variant_b_completions,
            percentage_difference: c.percentage_difference,
            verdict: Verdict::from_difference(c.percentage_difference),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AverageTimeView {
    pub variant_a_avg: f64,
    pub variant_b_avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStage {
    pub stage: String,
    pub event_count: u64,
    /// Share of this variant's first stage, 0..=100.
    pub percent_of_first: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelView {
    pub variant_a: Vec<FunnelStage>,
    pub variant_b: Vec<FunnelStage>,
}

impl FunnelView {
    pub fn is_empty(&self) -> bool {
        self.variant_a.is_empty() && self.variant_b.is_empty()
    }
}

fn funnel_stages(rows: &[FunnelRow], variant: &str) -> Vec<FunnelStage> {
    let mut rows: Vec<&FunnelRow> = rows.iter().filter(|row| row.variant == variant).collect();
    rows.sort_by_key(|row| row.stage_order);

    // A zero first stage would divide by zero; treat it as one.
    let first = rows
        .first()
        .map(|row| row.event_count)
        .filter(|count| *count > 0)
        .unwrap_or(1) as f64;

    rows.into_iter()
        .map(|row| FunnelStage {
            stage: row.stage.clone(),
            event_count: row.event_count,
            percent_of_first: (row.event_count as f64 / first * 100.0).round(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionView {
    pub variant_a: KdeCurve,
    pub variant_b: KdeCurve,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentView {
    pub rows: Vec<RecentCompletion>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoMarker {
    pub lat: f64,
    pub lon: f64,
    pub label: String,
    pub variant: String,
    pub completions: u64,
    pub avg_time_seconds: f64,
}

impl GeoMarker {
    fn from_point(point: &GeoPoint) -> Option<Self> {
        let (lat, lon) = point.coordinates()?;
        Some(Self {
            lat,
            lon,
            label: format!(
                "{}, {}",
                point.city.as_deref().unwrap_or("Unknown City"),
                point.country.as_deref().unwrap_or("")
            ),
            variant: point.variant.clone(),
            completions: point.completions,
            avg_time_seconds: point.avg_time_ms / 1000.0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoView {
    pub markers: Vec<GeoMarker>,
    pub most_recent: Option<GeoPoint>,
}

/// The point with the latest parseable `last_completion_at`.
pub fn most_recent(points: &[GeoPoint]) -> Option<&GeoPoint> {
    points
        .iter()
        .filter_map(|point| point.last_completion().map(|at| (at, point)))
        .max_by_key(|(at, _)| *at)
        .map(|(_, point)| point)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overview() -> VariantOverview {
        VariantOverview {
            comparison: Some(Comparison {
                variant_a_avg: 24.1,
                variant_a_completions: 40,
                variant_b_avg: 19.8,
                variant_b_completions: 38,
                percentage_difference: 21.7,
            }),
            stats: Some(vec![
                VariantStats {
                    variant: "B".into(),
                    avg_completion_time: 19.8,
                    completions: Some(38),
                },
                VariantStats {
                    variant: "A".into(),
                    avg_completion_time: 24.1,
                    completions: Some(40),
                },
            ]),
        }
    }

    fn funnel_row(variant: &str, stage: &str, order: i32, count: u64) -> FunnelRow {
        FunnelRow {
            variant: variant.into(),
            stage: stage.into(),
            stage_order: order,
            event_count: count,
        }
    }

    fn geo(city: &str, at: &str, lat: f64) -> GeoPoint {
        GeoPoint {
            lat: Some(lat),
            lon: Some(10.0),
            city: Some(city.into()),
            country: Some("DE".into()),
            variant: "A".into(),
            completions: 1,
            avg_time_ms: 20_000.0,
            last_completion_at: Some(at.into()),
        }
    }

    fn snapshot() -> DashboardSnapshot {
        DashboardSnapshot::from_fetch(
            overview(),
            vec![
                funnel_row("A", "Completed", 2, 40),
                funnel_row("A", "Started", 1, 80),
                funnel_row("B", "Started", 1, 0),
            ],
            Vec::new(),
            Distribution {
                variant_a_times: Some(vec![20.0, 22.0, 30.0]),
                variant_b_times: Some(vec![15.0, 18.0, 19.0]),
            },
            vec![
                geo("Berlin", "2025-03-01T10:00:00Z", 52.5),
                geo("Hamburg", "2025-03-01T11:00:00Z", 53.5),
                geo("Nowhere", "not a date", 1.0),
            ],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn missing_overview_parts_fail_validation() {
        let mut partial = overview();
        partial.stats = None;
        let err = DashboardSnapshot::from_fetch(
            partial,
            Vec::new(),
            Vec::new(),
            Distribution::default(),
            Vec::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, SimError::Validation(_)));
    }

    #[test]
    fn verdict_follows_sign_of_difference() {
        assert_eq!(Verdict::from_difference(3.0), Verdict::VariantAHarder);
        assert_eq!(Verdict::from_difference(-0.5), Verdict::VariantBHarder);
        assert_eq!(Verdict::from_difference(0.0), Verdict::Equal);
        assert_eq!(snapshot().comparison_view().difference_label(), "+21.7%");
    }

    #[test]
    fn average_time_matches_rows_by_variant() {
        let view = snapshot().average_time_view().unwrap();
        assert_eq!(view.variant_a_avg, 24.1);
        assert_eq!(view.variant_b_avg, 19.8);
    }

    #[test]
    fn average_time_needs_two_rows() {
        let mut snap = snapshot();
        snap.stats.truncate(1);
        assert!(snap.average_time_view().is_none());
    }

    #[test]
    fn funnel_sorted_with_share_of_first_stage() {
        let view = snapshot().funnel_view();
        let stages: Vec<_> = view.variant_a.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, ["Started", "Completed"]);
        assert_eq!(view.variant_a[1].percent_of_first, 50.0);
        assert_eq!(view.variant_b[0].percent_of_first, 0.0);
    }

    #[test]
    fn distribution_requires_both_variants() {
        let mut snap = snapshot();
        assert_eq!(snap.distribution_view(150).unwrap().variant_a.x.len(), 151);
        snap.distribution.variant_b_times = None;
        assert!(snap.distribution_view(150).is_none());
    }

    #[test]
    fn geo_picks_latest_completion() {
        let view = snapshot().geo_view();
        assert_eq!(view.markers.len(), 3);
        assert_eq!(
            view.most_recent.and_then(|p| p.city).as_deref(),
            Some("Hamburg")
        );
    }
}
