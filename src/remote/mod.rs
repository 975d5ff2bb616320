//! Remote data the simulator reads: the leaderboard and the aggregate views
//! behind the dashboard.

mod supabase;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;
use crate::game::Variant;

pub use supabase::SupabaseClient;
pub use types::{
    Comparison, Distribution, FunnelRow, GeoPoint, LeaderboardEntry, PersonalBestRow,
    RecentCompletion, VariantOverview, VariantStats,
};

#[async_trait]
pub trait Backend: Send + Sync {
    /// Ordered fastest first.
    async fn leaderboard(&self, variant: Variant, limit: u32) -> Result<Vec<LeaderboardEntry>>;

    /// Best time in seconds, `None` when the user has no completion yet.
    async fn personal_best(&self, variant: Variant, username: &str) -> Result<Option<f64>>;

    async fn variant_overview(&self) -> Result<VariantOverview>;

    async fn funnel(&self) -> Result<Vec<FunnelRow>>;

    async fn recent(&self, limit: u32) -> Result<Vec<RecentCompletion>>;

    async fn distribution(&self) -> Result<Distribution>;

    async fn geo_completions(&self) -> Result<Vec<GeoPoint>>;
}
