//! Terminal front end: `play` runs one puzzle controller off stdin,
//! `dashboard` runs the live poller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::analytics::{Analytics, DisabledAnalytics, FlagSource, PostHogClient};
use crate::dashboard::snapshot::{
    AverageTimeView, ComparisonView, DistributionView, FunnelView, GeoView, RecentView,
};
use crate::dashboard::render::{GLOBAL_CENTER, GLOBAL_ZOOM};
use crate::dashboard::{DashboardPoller, DashboardRenderer, MapFocus};
use crate::game::{
    ControllerDeps, ControllerEvent, ControllerOptions, GameController, GameEvent, LeaderboardView,
    Outcome, PuzzleConfig, Variant,
};
use crate::identity::{resolve_identity, FixedVariant};
use crate::remote::{Backend, SupabaseClient};
use crate::settings::{self, SettingsStore, SimulatorSettings};
use crate::store::DeviceStore;

#[derive(Parser, Debug)]
#[command(name = "ab-simulator", about = "A/B simulator puzzle and live dashboard", version)]
pub struct Cli {
    /// Directory holding settings.json and the device store.
    #[arg(long, global = true, env = "AB_SIM_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Verbose logging, same as AB_SIM_DEBUG=1.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play the puzzle in this terminal
    Play(PlayArgs),
    /// Follow the experiment's live aggregate views
    Dashboard,
    /// Show or change the saved timings
    Config(ConfigArgs),
}

#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    #[arg(long)]
    pub countdown_secs: Option<u32>,
    #[arg(long)]
    pub round_duration_ms: Option<u64>,
    #[arg(long)]
    pub poll_floor_ms: Option<u64>,
    #[arg(long)]
    pub poll_ceiling_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct PlayArgs {
    /// Skip the flag service and play this arm (A or B).
    #[arg(long, value_parser = parse_variant)]
    pub variant: Option<Variant>,

    /// Keep the device store in memory only.
    #[arg(long)]
    pub ephemeral: bool,
}

fn parse_variant(value: &str) -> std::result::Result<Variant, String> {
    Variant::parse(value).ok_or_else(|| format!("unknown variant {value:?}, expected A or B"))
}

pub async fn execute(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(settings::data_dir);
    let store = SettingsStore::new(data_dir.join("settings.json"))?;

    match cli.command {
        Command::Config(args) => configure(&store, &args),
        Command::Play(args) => {
            let settings = store.current();
            let backend = supabase(&settings);
            play(args, settings, backend, data_dir).await
        }
        Command::Dashboard => {
            let settings = store.current();
            let backend = supabase(&settings);
            dashboard(settings, backend).await
        }
    }
}

fn supabase(settings: &SimulatorSettings) -> Arc<dyn Backend> {
    let client = SupabaseClient::new(&settings.supabase);
    if !client.is_configured() {
        log::warn!("Supabase URL or anon key not set, remote data unavailable");
    }
    Arc::new(client)
}

fn configure(store: &SettingsStore, args: &ConfigArgs) -> Result<()> {
    anyhow::ensure!(
        args.poll_floor_ms != Some(0),
        "--poll-floor-ms must be at least 1"
    );
    if args.countdown_secs.is_some() || args.round_duration_ms.is_some() {
        let mut game = store.game();
        game.countdown_secs = args.countdown_secs.unwrap_or(game.countdown_secs);
        game.round_duration_ms = args.round_duration_ms.unwrap_or(game.round_duration_ms);
        store.update_game(game)?;
    }
    if args.poll_floor_ms.is_some() || args.poll_ceiling_ms.is_some() {
        let mut dashboard = store.dashboard();
        dashboard.floor_ms = args.poll_floor_ms.unwrap_or(dashboard.floor_ms);
        dashboard.ceiling_ms = args.poll_ceiling_ms.unwrap_or(dashboard.ceiling_ms);
        store.update_dashboard(dashboard)?;
    }

    let current = store.current();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "game": current.game,
            "dashboard": current.dashboard,
        }))?
    );
    Ok(())
}

/// One line typed by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayCommand {
    Start,
    Click(usize, usize),
    Reset,
    Again,
    Quit,
}

impl PlayCommand {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            Some("start" | "s") => PlayCommand::Start,
            Some("click" | "c") => {
                let mut coordinate = |name: &str| {
                    words
                        .next()
                        .ok_or_else(|| format!("missing {name}"))?
                        .parse::<usize>()
                        .map_err(|_| format!("{name} must be a number"))
                };
                let row = coordinate("row")?;
                let col = coordinate("column")?;
                PlayCommand::Click(row, col)
            }
            Some("reset") => PlayCommand::Reset,
            Some("again" | "a") => PlayCommand::Again,
            Some("quit" | "q" | "exit") => PlayCommand::Quit,
            Some(other) => return Err(format!("unknown command {other:?}")),
            None => return Err("empty command".into()),
        };
        match words.next() {
            Some(extra) => Err(format!("unexpected argument {extra:?}")),
            None => Ok(command),
        }
    }
}

const PLAY_HELP: &str = "commands: start | click ROW COL | reset | again | quit";

async fn play(
    args: PlayArgs,
    settings: SimulatorSettings,
    backend: Arc<dyn Backend>,
    data_dir: PathBuf,
) -> Result<()> {
    let store = if args.ephemeral {
        DeviceStore::in_memory()?
    } else {
        DeviceStore::new(data_dir.join("device.sqlite3"))?
    };

    let posthog = PostHogClient::new(&settings.posthog);
    let analytics: Arc<dyn Analytics> = if posthog.is_configured() {
        Arc::new(posthog.clone())
    } else {
        log::warn!("PostHog key not set, analytics disabled");
        Arc::new(DisabledAnalytics)
    };
    let flags: Box<dyn FlagSource> = match args.variant {
        Some(variant) => Box::new(FixedVariant(variant)),
        None => Box::new(posthog),
    };

    let flag_key = settings.posthog.flag_key.clone();
    let identity = resolve_identity(
        flags.as_ref(),
        analytics.as_ref(),
        &store,
        &flag_key,
        Duration::from_millis(settings.identity.retry_delay_ms),
    )
    .await;

    let puzzle = identity
        .as_ref()
        .ok()
        .map(|identity| PuzzleConfig::for_variant(identity.variant));
    let controller = GameController::new(
        identity,
        ControllerDeps {
            backend,
            analytics,
            store,
        },
        ControllerOptions {
            settings: settings.game.clone(),
            flag_key,
            puzzle: puzzle.clone(),
        },
    );

    let mut events = controller.subscribe();
    let printer = tokio::spawn(async move {
        let mut printer = EventPrinter::new(puzzle);
        while let Some(event) = events.recv().await {
            for line in printer.lines(&event) {
                println!("{line}");
            }
        }
    });

    if let Some(identity) = controller.identity() {
        println!(
            "Playing as {} (variant {})",
            identity.username, identity.variant
        );
    }
    controller.initialize().await;
    println!("{PLAY_HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let outcome = match PlayCommand::parse(&line) {
            Ok(PlayCommand::Start) => controller.start().await.map(|_| ()),
            Ok(PlayCommand::Click(row, col)) => controller.click(row, col).await.map(|_| ()),
            Ok(PlayCommand::Reset) => controller.reset(false).await.map(|_| ()),
            Ok(PlayCommand::Again) => controller.reset(true).await.map(|_| ()),
            Ok(PlayCommand::Quit) => break,
            Err(message) => {
                println!("{message}. {PLAY_HELP}");
                continue;
            }
        };
        if let Err(err) = outcome {
            println!("! {err}");
        }
    }

    drop(controller);
    printer.abort();
    Ok(())
}

/// Formats controller events as terminal lines.
pub struct EventPrinter {
    puzzle: Option<PuzzleConfig>,
    last_announced_secs: Option<u64>,
}

impl EventPrinter {
    pub fn new(puzzle: Option<PuzzleConfig>) -> Self {
        Self {
            puzzle,
            last_announced_secs: None,
        }
    }

    pub fn lines(&mut self, event: &ControllerEvent) -> Vec<String> {
        match event {
            ControllerEvent::Game { event } => self.game_lines(event),
            ControllerEvent::Leaderboard { view } => leaderboard_lines(view),
            ControllerEvent::ConfigurationError { message } => {
                vec![format!("Configuration error: {message}. The puzzle is disabled.")]
            }
        }
    }

    fn game_lines(&mut self, event: &GameEvent) -> Vec<String> {
        match event {
            GameEvent::TargetsRevealed { .. } => self.grid(true),
            GameEvent::CountdownTick { remaining } => vec![format!("Memorize... {remaining}")],
            GameEvent::CountdownGo => vec!["Go!".into()],
            GameEvent::TargetsHidden => {
                self.last_announced_secs = None;
                let mut lines = self.grid(false);
                lines.push("Find the pineapples: click ROW COL".into());
                lines
            }
            GameEvent::TimerTick { remaining_ms } => {
                let secs = remaining_ms / 1000;
                if secs % 10 == 0 && self.last_announced_secs != Some(secs) {
                    self.last_announced_secs = Some(secs);
                    vec![format!("{secs}s left")]
                } else {
                    Vec::new()
                }
            }
            GameEvent::CellHit { found, target, .. } => {
                vec![format!("Hit! {found}/{target}")]
            }
            GameEvent::CellMissed { row, col } => vec![format!("Miss at {row} {col}")],
            GameEvent::Resolved {
                outcome: Outcome::Success,
                completion_ms,
                attempts,
                personal_best,
                ..
            } => {
                let mut line = format!(
                    "Solved in {:.3}s with {attempts} clicks",
                    *completion_ms as f64 / 1000.0
                );
                if *personal_best {
                    line.push_str(" - new personal best!");
                }
                vec![line, "Type `again` to try again.".into()]
            }
            GameEvent::Resolved {
                outcome: Outcome::Timeout,
                found,
                ..
            } => vec![
                format!("Time's up! Found {found}."),
                "Type `again` to try again.".into(),
            ],
            GameEvent::Reset { .. } => vec!["Ready. Type `start`.".into()],
            GameEvent::PhaseChanged { .. }
            | GameEvent::Started { .. }
            | GameEvent::CellReverted { .. } => Vec::new(),
        }
    }

    fn grid(&self, reveal: bool) -> Vec<String> {
        let Some(puzzle) = &self.puzzle else {
            return Vec::new();
        };
        let header: String = (0..puzzle.cols()).map(|col| format!("  {col} ")).collect();
        let mut lines = vec![format!("   {header}")];
        for row in 0..puzzle.rows() {
            let cells: String = (0..puzzle.cols())
                .map(|col| match (reveal, puzzle.symbol(row, col)) {
                    (true, Some(symbol)) => format!(" {symbol} "),
                    _ => " ▢  ".to_string(),
                })
                .collect();
            lines.push(format!("{row}  {cells}"));
        }
        lines
    }
}

fn leaderboard_lines(view: &LeaderboardView) -> Vec<String> {
    let mut lines = vec![if view.stale {
        "Leaderboard (offline, last known):".to_string()
    } else {
        "Leaderboard:".to_string()
    }];
    if view.is_empty() {
        lines.push("  no completions yet".into());
        return lines;
    }
    for row in view.top.iter().chain(view.current_user.as_ref()) {
        let you = if row.is_current_user { "  (you)" } else { "" };
        lines.push(format!(
            "  {:>2}. {:<20} {:>7.2}s{you}",
            row.rank, row.username, row.best_time_seconds
        ));
    }
    lines
}

async fn dashboard(settings: SimulatorSettings, backend: Arc<dyn Backend>) -> Result<()> {
    let poller = DashboardPoller::new(backend, Box::new(TerminalRenderer), &settings.dashboard);
    let mut handle = poller.spawn();
    println!("keys: r = refresh now | f = toggle follow | d = dismiss error | q = quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        match line.trim() {
            "r" => handle.refresh_now(),
            "f" => {
                let enabled = handle.toggle_follow().await;
                println!("follow latest: {}", if enabled { "on" } else { "off" });
            }
            "d" => handle.dismiss_error().await,
            "q" => break,
            _ => {}
        }
    }

    handle.stop().await
}

/// Prints each view that changed as a plain text block.
struct TerminalRenderer;

impl DashboardRenderer for TerminalRenderer {
    fn updating(&mut self) {
        log::debug!("dashboard updating");
    }

    fn comparison(&mut self, view: &ComparisonView) {
        println!(
            "A: {}s avg over {} | B: {}s avg over {} | {} ({})",
            view.variant_a_avg,
            view.variant_a_completions,
            view.variant_b_avg,
            view.variant_b_completions,
            view.difference_label(),
            view.verdict.describe()
        );
    }

    fn average_time(&mut self, view: &AverageTimeView) {
        println!(
            "Average completion time: A {:.2}s | B {:.2}s",
            view.variant_a_avg, view.variant_b_avg
        );
    }

    fn funnel(&mut self, view: &FunnelView) {
        println!("Funnel:");
        for (name, stages) in [("A", &view.variant_a), ("B", &view.variant_b)] {
            let row: Vec<String> = stages
                .iter()
                .map(|s| format!("{} {} ({:.0}%)", s.stage, s.event_count, s.percent_of_first))
                .collect();
            println!("  {name}: {}", row.join(" -> "));
        }
    }

    fn distribution(&mut self, view: &DistributionView) {
        for (name, curve) in [("A", &view.variant_a), ("B", &view.variant_b)] {
            let peak = curve
                .points()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(x, _)| format!("{x:.1}s"))
                .unwrap_or_else(|| "n/a".into());
            println!("Distribution {name}: mode near {peak}");
        }
    }

    fn recent(&mut self, view: &RecentView) {
        if view.rows.is_empty() {
            println!("No completions yet");
            return;
        }
        println!("Recent completions:");
        for row in view.rows.iter().take(10) {
            println!(
                "  [{}] {:<20} {:>7}s {:>3} guesses  {} {}",
                row.variant.as_deref().unwrap_or("-"),
                row.username.as_deref().unwrap_or("-"),
                row.time_to_complete
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".into()),
                row.total_guesses
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "-".into()),
                row.city.as_deref().unwrap_or(""),
                row.country.as_deref().unwrap_or("")
            );
        }
    }

    fn geo(&mut self, view: &GeoView) {
        println!("Map: {} locations", view.markers.len());
    }

    fn focus(&mut self, focus: MapFocus) {
        match focus {
            MapFocus::Point { lat, lon, zoom } => {
                println!("Map centred on {lat:.2}, {lon:.2} (zoom {zoom})")
            }
            MapFocus::Global => {
                let (lat, lon) = GLOBAL_CENTER;
                println!("Map reset to global view {lat:.0}, {lon:.0} (zoom {GLOBAL_ZOOM})")
            }
        }
    }

    fn last_updated(&mut self, at: DateTime<Utc>) {
        println!(
            "Last updated: {}",
            at.with_timezone(&Local).format("%H:%M:%S")
        );
    }

    fn error(&mut self, message: &str, retry_in: Duration) {
        println!(
            "Error loading dashboard: {message}. Retrying in {}s...",
            retry_in.as_secs()
        );
    }
}
