use serde::Serialize;

use crate::remote::LeaderboardEntry;

const VISIBLE_ROWS: usize = 5;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub rank: usize,
    pub username: String,
    pub best_time_seconds: f64,
    pub is_current_user: bool,
}

/// Hall of fame for one variant as shown next to the puzzle.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardView {
    pub top: Vec<LeaderboardRow>,
    /// The player's own row when they rank below the visible rows.
    pub current_user: Option<LeaderboardRow>,
    /// Set when this is a last-known view shown because the fetch failed.
    pub stale: bool,
}

impl LeaderboardView {
    pub fn build(entries: &[LeaderboardEntry], username: &str) -> Self {
        let rows: Vec<LeaderboardRow> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| LeaderboardRow {
                rank: i + 1,
                username: entry.username.clone(),
                best_time_seconds: entry.best_time_seconds,
                is_current_user: entry.username == username,
            })
            .collect();

        let current_user = rows
            .iter()
            .find(|row| row.is_current_user && row.rank > VISIBLE_ROWS)
            .cloned();

        Self {
            top: rows.into_iter().take(VISIBLE_ROWS).collect(),
            current_user,
            stale: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_empty()
    }

    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }
}
