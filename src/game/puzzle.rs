use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SimError};

/// Experiment arm assigned to a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Variant {
    A,
    B,
}

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::A, Variant::B];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::A => "A",
            Variant::B => "B",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "A" | "a" => Some(Variant::A),
            "B" | "b" => Some(Variant::B),
            _ => None,
        }
    }

    /// Maps the experiment flag response onto an arm. Unknown responses mean
    /// the flag has not resolved yet.
    pub fn from_flag_response(response: &str) -> Option<Self> {
        match response {
            "control" => Some(Variant::A),
            "4-words" => Some(Variant::B),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const TARGET: &str = "🍍";

/// Fixed layout of one puzzle: what sits in each cell, and which cells count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PuzzleConfig {
    pub id: String,
    pub difficulty: u8,
    pub grid: Vec<Vec<String>>,
    pub target_count: usize,
}

impl PuzzleConfig {
    /// Builds a puzzle from a grid of symbols. Every cell holding [`TARGET`]
    /// is a hidden target.
    pub fn new(id: impl Into<String>, difficulty: u8, grid: Vec<Vec<String>>) -> Result<Self> {
        let cols = grid.first().map(Vec::len).unwrap_or(0);
        if grid.is_empty() || cols == 0 {
            return Err(SimError::Configuration("puzzle grid is empty".into()));
        }
        if grid.iter().any(|row| row.len() != cols) {
            return Err(SimError::Configuration("puzzle grid rows differ in length".into()));
        }

        let target_count = count_targets(&grid);
        if target_count == 0 {
            return Err(SimError::Configuration("puzzle has no targets".into()));
        }

        Ok(Self {
            id: id.into(),
            difficulty,
            grid,
            target_count,
        })
    }

    pub fn for_variant(variant: Variant) -> Self {
        let (id, difficulty, layout) = match variant {
            Variant::A => ("fruit-grid-5", 6, VARIANT_A_LAYOUT),
            Variant::B => ("fruit-grid-4", 4, VARIANT_B_LAYOUT),
        };
        let grid: Vec<Vec<String>> = layout
            .iter()
            .map(|row| row.iter().map(|cell| (*cell).to_string()).collect())
            .collect();
        // Square constant layouts, so only the target count needs computing.
        let target_count = count_targets(&grid);
        Self {
            id: id.into(),
            difficulty,
            grid,
            target_count,
        }
    }

    pub fn rows(&self) -> usize {
        self.grid.len()
    }

    pub fn cols(&self) -> usize {
        self.grid.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_target(&self, row: usize, col: usize) -> bool {
        self.symbol(row, col).map(|s| s == TARGET).unwrap_or(false)
    }

    pub fn symbol(&self, row: usize, col: usize) -> Option<&str> {
        self.grid.get(row)?.get(col).map(String::as_str)
    }

    pub fn targets(&self) -> Vec<(usize, usize)> {
        let mut cells = Vec::with_capacity(self.target_count);
        for (r, row) in self.grid.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if cell == TARGET {
                    cells.push((r, c));
                }
            }
        }
        cells
    }
}

fn count_targets(grid: &[Vec<String>]) -> usize {
    grid.iter().flatten().filter(|cell| *cell == TARGET).count()
}

const VARIANT_A_LAYOUT: [[&str; 5]; 5] = [
    ["🍎", "🍍", "🍌", "🍇", "🍓"],
    ["🍇", "🍓", "🍎", "🍍", "🍌"],
    ["🍍", "🍌", "🍇", "🍓", "🍎"],
    ["🍓", "🍎", "🍍", "🍌", "🍇"],
    ["🍌", "🍇", "🍓", "🍎", "🍍"],
];

const VARIANT_B_LAYOUT: [[&str; 5]; 5] = [
    ["🍎", "🍌", "🍍", "🍇", "🍓"],
    ["🍇", "🍍", "🍎", "🍓", "🍌"],
    ["🍓", "🍌", "🍇", "🍎", "🍍"],
    ["🍌", "🍎", "🍓", "🍇", "🍎"],
    ["🍇", "🍓", "🍌", "🍍", "🍎"],
];

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn built_in_puzzles_differ_in_target_count() {
        let a = PuzzleConfig::for_variant(Variant::A);
        let b = PuzzleConfig::for_variant(Variant::B);
        assert_eq!(a.target_count, 5);
        assert_eq!(b.target_count, 4);
        assert_eq!((a.rows(), a.cols()), (5, 5));
        assert_eq!(a.targets().len(), a.target_count);
    }

    #[test]
    fn built_in_layouts_pass_validation() {
        for variant in Variant::ALL {
            let built = PuzzleConfig::for_variant(variant);
            let validated =
                PuzzleConfig::new(built.id.clone(), built.difficulty, built.grid.clone()).unwrap();
            assert_eq!(validated, built);
        }
    }

    #[test]
    fn flag_responses_map_to_variants() {
        assert_eq!(Variant::from_flag_response("control"), Some(Variant::A));
        assert_eq!(Variant::from_flag_response("4-words"), Some(Variant::B));
        assert_eq!(Variant::from_flag_response(""), None);
        assert_eq!(Variant::from_flag_response("test"), None);
    }

    #[test]
    fn rejects_ragged_or_targetless_grids() {
        assert!(PuzzleConfig::new("x", 1, grid(&[&["🍍", "🍎"], &["🍎"]])).is_err());
        assert!(PuzzleConfig::new("x", 1, grid(&[&["🍎"]])).is_err());
        assert!(PuzzleConfig::new("x", 1, Vec::new()).is_err());
    }

    #[test]
    fn target_lookup_is_bounds_safe() {
        let puzzle = PuzzleConfig::new("x", 1, grid(&[&["🍍", "🍎"]])).unwrap();
        assert!(puzzle.is_target(0, 0));
        assert!(!puzzle.is_target(0, 1));
        assert!(!puzzle.is_target(3, 3));
    }
}
