use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::types::{
    Distribution, FunnelRow, GeoPoint, LeaderboardEntry, PersonalBestRow, RecentCompletion,
    VariantOverview,
};
use super::Backend;
use crate::error::{Result, SimError};
use crate::game::Variant;
use crate::settings::SupabaseSettings;

/// Calls the Postgres functions exposed through Supabase's REST endpoint.
#[derive(Clone)]
pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(settings: &SupabaseSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: settings.url.trim_end_matches('/').to_string(),
            anon_key: settings.anon_key.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.anon_key.is_empty()
    }

    async fn rpc<T: DeserializeOwned>(&self, function: &str, body: Value) -> Result<T> {
        let payload = self.call(function, body).await?;
        decode(function, payload)
    }

    /// For views that may legitimately be empty: a `null` body decodes as
    /// the empty value instead of failing the cycle.
    async fn rpc_or_default<T: DeserializeOwned + Default>(
        &self,
        function: &str,
        body: Value,
    ) -> Result<T> {
        let payload = self.call(function, body).await?;
        decode_or_default(function, payload)
    }

    async fn call(&self, function: &str, body: Value) -> Result<Value> {
        if !self.is_configured() {
            return Err(SimError::TransientFetch(
                "Supabase API not initialized".into(),
            ));
        }

        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        debug!("POST {url}");
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SimError::TransientFetch(format!(
                "{function} returned {status}: {detail}"
            )));
        }

        Ok(response.json().await?)
    }
}

fn decode<T: DeserializeOwned>(function: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|err| SimError::Validation(format!("{function}: {err}")))
}

fn decode_or_default<T: DeserializeOwned + Default>(function: &str, payload: Value) -> Result<T> {
    if payload.is_null() {
        debug!("{function} returned null, using an empty result");
        return Ok(T::default());
    }
    decode(function, payload)
}

#[async_trait]
impl Backend for SupabaseClient {
    async fn leaderboard(&self, variant: Variant, limit: u32) -> Result<Vec<LeaderboardEntry>> {
        self.rpc(
            "get_leaderboard",
            json!({ "p_variant": variant.as_str(), "p_limit": limit }),
        )
        .await
    }

    async fn personal_best(&self, variant: Variant, username: &str) -> Result<Option<f64>> {
        let rows: Vec<PersonalBestRow> = self
            .rpc(
                "get_personal_best",
                json!({ "p_variant": variant.as_str(), "p_username": username }),
            )
            .await?;
        Ok(rows.into_iter().find_map(|row| row.best_time_seconds))
    }

    async fn variant_overview(&self) -> Result<VariantOverview> {
        self.rpc("get_variant_overview", json!({})).await
    }

    async fn funnel(&self) -> Result<Vec<FunnelRow>> {
        self.rpc_or_default("get_funnel", json!({})).await
    }

    async fn recent(&self, limit: u32) -> Result<Vec<RecentCompletion>> {
        self.rpc_or_default("get_recent_completions", json!({ "p_limit": limit }))
            .await
    }

    async fn distribution(&self) -> Result<Distribution> {
        self.rpc_or_default("get_completion_distribution", json!({})).await
    }

    async fn geo_completions(&self) -> Result<Vec<GeoPoint>> {
        self.rpc_or_default("get_geo_completions", json!({})).await
    }
}
