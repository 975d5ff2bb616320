//! Product analytics: event capture and experiment flag lookup.
//!
//! Capture is fire-and-forget. Nothing here may fail a caller; delivery errors
//! are logged and dropped.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::settings::PostHogSettings;

pub type Properties = Map<String, Value>;

pub trait Analytics: Send + Sync {
    fn capture(&self, event: &str, properties: Properties);

    fn identify(&self, distinct_id: &str);
}

/// Outcome of asking the flag service for the experiment arm.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagResolution {
    Resolved(String),
    Pending,
    Error(String),
}

#[async_trait]
pub trait FlagSource: Send + Sync {
    async fn resolve_flag(&self, flag_key: &str) -> FlagResolution;
}

/// Stand-in used when no analytics key is configured.
#[derive(Debug, Default, Clone)]
pub struct DisabledAnalytics;

impl Analytics for DisabledAnalytics {
    fn capture(&self, event: &str, properties: Properties) {
        debug!("analytics disabled, dropping {event}: {}", Value::Object(properties));
    }

    fn identify(&self, _distinct_id: &str) {}
}

#[derive(Clone)]
pub struct PostHogClient {
    http: reqwest::Client,
    host: String,
    api_key: String,
    distinct_id: Arc<Mutex<String>>,
}

#[derive(Deserialize)]
struct DecideResponse {
    #[serde(default, rename = "featureFlags")]
    feature_flags: Map<String, Value>,
}

impl PostHogClient {
    pub fn new(settings: &PostHogSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: settings.host.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            distinct_id: Arc::new(Mutex::new(format!("anon_{}", uuid::Uuid::new_v4()))),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.api_key.is_empty()
    }

    fn distinct_id(&self) -> String {
        self.distinct_id
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Analytics for PostHogClient {
    fn capture(&self, event: &str, properties: Properties) {
        if !self.is_configured() {
            debug!("PostHog not configured, dropping {event}");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, dropping {event}");
            return;
        };

        let body = json!({
            "api_key": self.api_key,
            "event": event,
            "distinct_id": self.distinct_id(),
            "properties": Value::Object(properties),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let request = self.http.post(format!("{}/capture/", self.host)).json(&body);
        let event = event.to_string();

        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("captured {event}");
                }
                Ok(response) => warn!("PostHog rejected {event}: {}", response.status()),
                Err(err) => warn!("PostHog error while sending {event}: {err}"),
            }
        });
    }

    fn identify(&self, distinct_id: &str) {
        match self.distinct_id.lock() {
            Ok(mut guard) => *guard = distinct_id.to_string(),
            Err(poisoned) => *poisoned.into_inner() = distinct_id.to_string(),
        }
    }
}

#[async_trait]
impl FlagSource for PostHogClient {
    async fn resolve_flag(&self, flag_key: &str) -> FlagResolution {
        if !self.is_configured() {
            return FlagResolution::Error("PostHog not initialized".into());
        }

        let body = json!({ "api_key": self.api_key, "distinct_id": self.distinct_id() });
        let response = match self
            .http
            .post(format!("{}/decide/?v=3", self.host))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return FlagResolution::Error(err.to_string()),
        };
        if !response.status().is_success() {
            return FlagResolution::Error(format!("decide returned {}", response.status()));
        }
        let decided: DecideResponse = match response.json().await {
            Ok(decided) => decided,
            Err(err) => return FlagResolution::Error(err.to_string()),
        };

        match decided.feature_flags.get(flag_key) {
            Some(Value::String(value)) => FlagResolution::Resolved(value.clone()),
            Some(Value::Bool(true)) => FlagResolution::Resolved("true".into()),
            _ => FlagResolution::Pending,
        }
    }
}
