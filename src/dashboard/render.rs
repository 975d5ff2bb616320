use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::snapshot::{
    most_recent, AverageTimeView, ComparisonView, DashboardSnapshot, DistributionView,
    FunnelView, GeoView, RecentView,
};
use crate::remote::GeoPoint;

const ENABLE_LOGS: bool = false;

use crate::log_debug;

pub const CITY_ZOOM: u8 = 10;
pub const GLOBAL_CENTER: (f64, f64) = (25.0, 0.0);
pub const GLOBAL_ZOOM: u8 = 2;

/// Where the geo map should be centred.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MapFocus {
    Point { lat: f64, lon: f64, zoom: u8 },
    Global,
}

/// Output side of the dashboard. Each method is only called when its view
/// actually changed.
pub trait DashboardRenderer: Send {
    fn updating(&mut self) {}

    fn comparison(&mut self, view: &ComparisonView);

    fn average_time(&mut self, view: &AverageTimeView);

    fn funnel(&mut self, view: &FunnelView);

    fn distribution(&mut self, view: &DistributionView);

    fn recent(&mut self, view: &RecentView);

    fn geo(&mut self, view: &GeoView);

    fn focus(&mut self, focus: MapFocus);

    fn last_updated(&mut self, at: DateTime<Utc>);

    fn error(&mut self, message: &str, retry_in: Duration);

    fn clear_error(&mut self) {}
}

/// Remembers the serialized form of what each view last rendered.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    last: HashMap<&'static str, String>,
}

impl ChangeTracker {
    /// True (and remembered) when `value` differs from the last one seen for
    /// `view`. A value that cannot be serialized always counts as changed.
    pub fn changed<T: Serialize>(&mut self, view: &'static str, value: &T) -> bool {
        let Ok(encoded) = serde_json::to_string(value) else {
            return true;
        };
        if self.last.get(view) == Some(&encoded) {
            log_debug!("{view} unchanged, skipping render");
            return false;
        }
        self.last.insert(view, encoded);
        true
    }
}

/// "Follow latest" state of the geo map.
#[derive(Debug, Default)]
pub struct GeoFollow {
    enabled: bool,
    last_key: Option<String>,
    latest: Option<(f64, f64)>,
}

impl GeoFollow {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records the most recent point of a new cycle. Returns a focus only when
    /// following and the most recent completion is one not seen before.
    pub fn observe(&mut self, points: &[GeoPoint]) -> Option<MapFocus> {
        let latest = most_recent(points)?;
        self.latest = latest.coordinates();

        let key = latest.recency_key();
        if self.last_key.as_deref() == Some(key.as_str()) {
            return None;
        }
        self.last_key = Some(key);

        if !self.enabled {
            return None;
        }
        self.latest.map(|(lat, lon)| MapFocus::Point {
            lat,
            lon,
            zoom: CITY_ZOOM,
        })
    }

    /// Turning follow on jumps to the latest known point; turning it off goes
    /// back to the global view.
    pub fn set_enabled(&mut self, enabled: bool) -> Option<MapFocus> {
        self.enabled = enabled;
        if !enabled {
            return Some(MapFocus::Global);
        }
        self.latest.map(|(lat, lon)| MapFocus::Point {
            lat,
            lon,
            zoom: CITY_ZOOM,
        })
    }
}

/// Turns snapshots into renderer calls, skipping views whose input did not
/// change since the last cycle.
pub struct DashboardPresenter {
    renderer: Box<dyn DashboardRenderer>,
    tracker: ChangeTracker,
    follow: GeoFollow,
    kde_resolution: usize,
    error_shown: bool,
}

impl DashboardPresenter {
    pub fn new(renderer: Box<dyn DashboardRenderer>, kde_resolution: usize) -> Self {
        Self {
            renderer,
            tracker: ChangeTracker::default(),
            follow: GeoFollow::default(),
            kde_resolution,
            error_shown: false,
        }
    }

    pub fn updating(&mut self) {
        self.renderer.updating();
    }

    pub fn render(&mut self, snapshot: &DashboardSnapshot) {
        let comparison = snapshot.comparison_view();
        if self.tracker.changed("comparison", &comparison) {
            self.renderer.comparison(&comparison);
        }

        if let Some(average) = snapshot.average_time_view() {
            if self.tracker.changed("average_time", &average) {
                self.renderer.average_time(&average);
            }
        }

        let funnel = snapshot.funnel_view();
        if !funnel.is_empty() && self.tracker.changed("funnel", &funnel) {
            self.renderer.funnel(&funnel);
        }

        // The KDE is only recomputed when the raw samples moved.
        if self.tracker.changed("distribution", &snapshot.distribution) {
            if let Some(distribution) = snapshot.distribution_view(self.kde_resolution) {
                self.renderer.distribution(&distribution);
            }
        }

        let recent = snapshot.recent_view();
        if self.tracker.changed("recent", &recent) {
            self.renderer.recent(&recent);
        }

        if !snapshot.geo.is_empty() && self.tracker.changed("geo", &snapshot.geo) {
            self.renderer.geo(&snapshot.geo_view());
        }
        if let Some(focus) = self.follow.observe(&snapshot.geo) {
            self.renderer.focus(focus);
        }

        self.renderer.last_updated(snapshot.fetched_at);
        self.dismiss_error();
    }

    pub fn render_error(&mut self, message: &str, retry_in: Duration) {
        self.renderer.error(message, retry_in);
        self.error_shown = true;
    }

    pub fn dismiss_error(&mut self) {
        if self.error_shown {
            self.renderer.clear_error();
            self.error_shown = false;
        }
    }

    pub fn follow_enabled(&self) -> bool {
        self.follow.is_enabled()
    }

    pub fn set_follow(&mut self, enabled: bool) {
        if let Some(focus) = self.follow.set_enabled(enabled) {
            self.renderer.focus(focus);
        }
    }
}
