//! Pure state machine for one puzzle attempt.
//!
//! Nothing in here sleeps, spawns or talks to the network. Callers feed in
//! commands and clock readings and get back the events they must render or
//! forward; [`super::GameController`] owns the timers that drive it.
//!
//! Every timer-driven input carries the epoch it was scheduled under. Each
//! start and reset bumps the epoch, so a timer that fires after the session it
//! belonged to is gone is ignored.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::personal_best::PersonalBests;
use super::puzzle::{PuzzleConfig, Variant};
use crate::error::{Result, SimError};
use crate::settings::GameSettings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Memorizing,
    Hunting,
    Resolved,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Memorizing => "memorizing",
            Phase::Hunting => "hunting",
            Phase::Resolved => "resolved",
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Idle
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Timeout,
}

/// What a cell currently shows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CellMark {
    Neutral,
    Revealed,
    Hit,
    Miss,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    PhaseChanged {
        phase: Phase,
    },
    Started {
        session_id: String,
        puzzle_id: String,
        difficulty: u8,
    },
    TargetsRevealed {
        cells: Vec<(usize, usize)>,
    },
    TargetsHidden,
    CountdownTick {
        remaining: u32,
    },
    CountdownGo,
    TimerTick {
        remaining_ms: u64,
    },
    CellHit {
        row: usize,
        col: usize,
        found: usize,
        target: usize,
    },
    CellMissed {
        row: usize,
        col: usize,
    },
    CellReverted {
        row: usize,
        col: usize,
    },
    Resolved {
        outcome: Outcome,
        completion_ms: u64,
        found: usize,
        attempts: u32,
        personal_best: bool,
    },
    Reset {
        repeat: bool,
    },
}

/// Serializable view of the current session for front ends.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub variant: Variant,
    pub puzzle_id: String,
    pub phase: Phase,
    pub session_id: Option<String>,
    pub found_count: usize,
    pub target_count: usize,
    pub total_attempts: u32,
    pub countdown_remaining: u32,
    pub remaining_ms: u64,
    pub completion_ms: Option<u64>,
    pub outcome: Option<Outcome>,
    pub is_personal_best: bool,
    pub best_ms: Option<f64>,
    pub cells: Vec<Vec<CellMark>>,
}

#[derive(Debug, Clone)]
pub struct GameState {
    pub variant: Variant,
    pub puzzle: PuzzleConfig,
    pub phase: Phase,
    pub session_id: Option<String>,
    pub started_at: Option<Instant>,
    pub found_count: usize,
    pub total_attempts: u32,
    pub cell_states: Vec<Vec<bool>>,
    pub cell_marks: Vec<Vec<CellMark>>,
    pub countdown_remaining: u32,
    pub completion_ms: Option<u64>,
    pub outcome: Option<Outcome>,
    pub is_personal_best: bool,
    pub bests: PersonalBests,
    settings: GameSettings,
    epoch: u64,
}

impl GameState {
    pub fn new(variant: Variant, puzzle: PuzzleConfig, settings: GameSettings) -> Self {
        let (rows, cols) = (puzzle.rows(), puzzle.cols());
        Self {
            variant,
            phase: Phase::Idle,
            session_id: None,
            started_at: None,
            found_count: 0,
            total_attempts: 0,
            cell_states: vec![vec![false; cols]; rows],
            cell_marks: vec![vec![CellMark::Neutral; cols]; rows],
            countdown_remaining: settings.countdown_secs,
            completion_ms: None,
            outcome: None,
            is_personal_best: false,
            bests: PersonalBests::new(),
            puzzle,
            settings,
            epoch: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    /// Idle -> Memorizing. Clears every session field and reveals the targets.
    pub fn start(&mut self, session_id: String) -> Result<Vec<GameEvent>> {
        if self.phase != Phase::Idle {
            return Err(SimError::InvalidPhase {
                action: "start",
                phase: self.phase.as_str(),
            });
        }

        self.clear_session();
        self.epoch += 1;
        self.phase = Phase::Memorizing;
        self.session_id = Some(session_id.clone());
        let targets = self.puzzle.targets();
        for row in self.cell_marks.iter_mut() {
            row.fill(CellMark::Revealed);
        }

        Ok(vec![
            GameEvent::PhaseChanged {
                phase: Phase::Memorizing,
            },
            GameEvent::TargetsRevealed { cells: targets },
            GameEvent::CountdownTick {
                remaining: self.countdown_remaining,
            },
            GameEvent::Started {
                session_id,
                puzzle_id: self.puzzle.id.clone(),
                difficulty: self.puzzle.difficulty,
            },
        ])
    }

    /// One second of the memorize countdown has passed.
    pub fn countdown_tick(&mut self, epoch: u64) -> Vec<GameEvent> {
        if epoch != self.epoch || self.phase != Phase::Memorizing || self.countdown_remaining == 0
        {
            return Vec::new();
        }
        self.countdown_remaining -= 1;
        if self.countdown_remaining > 0 {
            vec![GameEvent::CountdownTick {
                remaining: self.countdown_remaining,
            }]
        } else {
            vec![GameEvent::CountdownGo]
        }
    }

    /// Memorizing -> Hunting, once the countdown has run out.
    pub fn begin_hunt(&mut self, epoch: u64, now: Instant) -> Vec<GameEvent> {
        if epoch != self.epoch
            || self.phase != Phase::Memorizing
            || self.countdown_remaining > 0
            || self.started_at.is_some()
        {
            return Vec::new();
        }
        self.phase = Phase::Hunting;
        self.started_at = Some(now);
        for row in self.cell_marks.iter_mut() {
            row.fill(CellMark::Neutral);
        }
        vec![
            GameEvent::TargetsHidden,
            GameEvent::PhaseChanged {
                phase: Phase::Hunting,
            },
        ]
    }

    /// Round timer tick. Resolves as a timeout once the round duration is up.
    pub fn round_tick(&mut self, epoch: u64, now: Instant) -> Vec<GameEvent> {
        if epoch != self.epoch || self.phase != Phase::Hunting {
            return Vec::new();
        }
        if self.elapsed(now) >= self.settings.round_duration() {
            return self.resolve(Outcome::Timeout, now);
        }
        vec![GameEvent::TimerTick {
            remaining_ms: self.remaining_ms(now),
        }]
    }

    /// A click on a cell. Outside the hunt this is ignored, not an error.
    pub fn click(&mut self, row: usize, col: usize, now: Instant) -> Result<Vec<GameEvent>> {
        if self.phase != Phase::Hunting {
            return Ok(Vec::new());
        }
        if row >= self.puzzle.rows() || col >= self.puzzle.cols() {
            return Err(SimError::CellOutOfBounds {
                row,
                col,
                rows: self.puzzle.rows(),
                cols: self.puzzle.cols(),
            });
        }
        // The round timer may not have ticked yet; time is already up.
        if self.elapsed(now) >= self.settings.round_duration() {
            return Ok(self.resolve(Outcome::Timeout, now));
        }
        if self.cell_states[row][col] {
            return Ok(Vec::new());
        }

        self.cell_states[row][col] = true;
        self.total_attempts += 1;

        if !self.puzzle.is_target(row, col) {
            self.cell_marks[row][col] = CellMark::Miss;
            return Ok(vec![GameEvent::CellMissed { row, col }]);
        }

        self.found_count = (self.found_count + 1).min(self.puzzle.target_count);
        self.cell_marks[row][col] = CellMark::Hit;
        let mut events = vec![GameEvent::CellHit {
            row,
            col,
            found: self.found_count,
            target: self.puzzle.target_count,
        }];
        if self.found_count == self.puzzle.target_count {
            events.extend(self.resolve(Outcome::Success, now));
        }
        Ok(events)
    }

    /// Returns a missed cell to neutral and makes it clickable again.
    pub fn revert_miss(&mut self, epoch: u64, row: usize, col: usize) -> Vec<GameEvent> {
        if epoch != self.epoch || !matches!(self.phase, Phase::Hunting | Phase::Resolved) {
            return Vec::new();
        }
        match self.cell_marks.get(row).and_then(|r| r.get(col)) {
            Some(CellMark::Miss) => {}
            _ => return Vec::new(),
        }
        self.cell_marks[row][col] = CellMark::Neutral;
        self.cell_states[row][col] = false;
        vec![GameEvent::CellReverted { row, col }]
    }

    /// Back to Idle without starting a new attempt. From Memorizing or Hunting
    /// this abandons the attempt.
    pub fn reset(&mut self, repeat: bool) -> Vec<GameEvent> {
        if self.phase == Phase::Idle {
            return Vec::new();
        }
        self.clear_session();
        self.epoch += 1;
        vec![
            GameEvent::PhaseChanged { phase: Phase::Idle },
            GameEvent::Reset { repeat },
        ]
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    pub fn remaining_ms(&self, now: Instant) -> u64 {
        match self.phase {
            Phase::Idle | Phase::Memorizing => self.settings.round_duration_ms,
            Phase::Hunting => self
                .settings
                .round_duration()
                .saturating_sub(self.elapsed(now))
                .as_millis() as u64,
            Phase::Resolved => 0,
        }
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            variant: self.variant,
            puzzle_id: self.puzzle.id.clone(),
            phase: self.phase,
            session_id: self.session_id.clone(),
            found_count: self.found_count,
            target_count: self.puzzle.target_count,
            total_attempts: self.total_attempts,
            countdown_remaining: self.countdown_remaining,
            remaining_ms: self.remaining_ms(now),
            completion_ms: self.completion_ms,
            outcome: self.outcome,
            is_personal_best: self.is_personal_best,
            best_ms: self.bests.get(self.variant),
            cells: self.cell_marks.clone(),
        }
    }

    fn resolve(&mut self, outcome: Outcome, now: Instant) -> Vec<GameEvent> {
        let completion_ms = match outcome {
            Outcome::Success => self.elapsed(now).as_millis() as u64,
            Outcome::Timeout => self.settings.round_duration_ms,
        };
        let personal_best = match outcome {
            Outcome::Success => self.bests.record(self.variant, completion_ms),
            Outcome::Timeout => false,
        };

        self.phase = Phase::Resolved;
        self.completion_ms = Some(completion_ms);
        self.outcome = Some(outcome);
        self.is_personal_best = personal_best;

        vec![
            GameEvent::PhaseChanged {
                phase: Phase::Resolved,
            },
            GameEvent::Resolved {
                outcome,
                completion_ms,
                found: self.found_count,
                attempts: self.total_attempts,
                personal_best,
            },
        ]
    }

    fn clear_session(&mut self) {
        self.phase = Phase::Idle;
        self.session_id = None;
        self.started_at = None;
        self.found_count = 0;
        self.total_attempts = 0;
        for row in self.cell_states.iter_mut() {
            row.fill(false);
        }
        for row in self.cell_marks.iter_mut() {
            row.fill(CellMark::Neutral);
        }
        self.countdown_remaining = self.settings.countdown_secs;
        self.completion_ms = None;
        self.outcome = None;
        self.is_personal_best = false;
    }
}
