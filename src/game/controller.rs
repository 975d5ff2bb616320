use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use uuid::Uuid;

use super::{
    leaderboard::LeaderboardView,
    personal_best::{load_local, save_local},
    GameEvent, GameState, Outcome, PuzzleConfig, SessionSnapshot,
};
use crate::{
    analytics::{Analytics, Properties},
    error::{Result, SimError},
    identity::Identity,
    remote::Backend,
    settings::{GameSettings, DEFAULT_FLAG_KEY},
    store::DeviceStore,
};

// The round ticker logs on every resolution; flip off when it gets noisy.
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Everything a front end needs to render, in the order it happened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ControllerEvent {
    Game { event: GameEvent },
    Leaderboard { view: LeaderboardView },
    ConfigurationError { message: String },
}

/// Lossless fan-out to every subscribed renderer.
#[derive(Clone, Default)]
struct EventBus {
    subscribers: Arc<StdMutex<Vec<mpsc::UnboundedSender<ControllerEvent>>>>,
}

impl EventBus {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ControllerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut guard) => guard.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    fn emit(&self, event: ControllerEvent) {
        let mut guard = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

pub struct ControllerDeps {
    pub backend: Arc<dyn Backend>,
    pub analytics: Arc<dyn Analytics>,
    pub store: DeviceStore,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub settings: GameSettings,
    pub flag_key: String,
    /// Overrides the built-in puzzle for the resolved variant.
    pub puzzle: Option<PuzzleConfig>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            settings: GameSettings::default(),
            flag_key: DEFAULT_FLAG_KEY.into(),
            puzzle: None,
        }
    }
}

/// Side effects of state machine output: analytics, leaderboard, persistence
/// and fan-out to renderers. None of these can fail the caller.
#[derive(Clone)]
struct Dispatcher {
    identity: Option<Identity>,
    flag_key: String,
    backend: Arc<dyn Backend>,
    analytics: Arc<dyn Analytics>,
    store: DeviceStore,
    bus: EventBus,
    leaderboard: Arc<StdMutex<Option<LeaderboardView>>>,
    leaderboard_limit: u32,
}

impl Dispatcher {
    fn dispatch(&self, events: Vec<GameEvent>, session_id: Option<&str>) {
        for event in events {
            self.track(&event, session_id);

            if let GameEvent::Resolved {
                outcome: Outcome::Success,
                completion_ms,
                personal_best,
                ..
            } = &event
            {
                let this = self.clone();
                let (completion_ms, personal_best) = (*completion_ms, *personal_best);
                tokio::spawn(async move {
                    if personal_best {
                        this.persist_best(completion_ms).await;
                    }
                    this.refresh_leaderboard().await;
                });
            }

            self.bus.emit(ControllerEvent::Game { event });
        }
    }

    fn track(&self, event: &GameEvent, session_id: Option<&str>) {
        let (name, extra) = match event {
            GameEvent::Started {
                puzzle_id,
                difficulty,
                ..
            } => (
                "puzzle_started",
                json!({ "difficulty": difficulty, "puzzle_id": puzzle_id }),
            ),
            GameEvent::Resolved {
                outcome: Outcome::Success,
                completion_ms,
                found,
                attempts,
                ..
            } => (
                "puzzle_completed",
                json!({
                    "completion_time_seconds": seconds_3dp(*completion_ms),
                    "correct_words_count": found,
                    "total_guesses_count": attempts,
                }),
            ),
            GameEvent::Resolved {
                outcome: Outcome::Timeout,
                found,
                attempts,
                ..
            } => (
                "puzzle_failed",
                json!({ "correct_words_count": found, "total_guesses_count": attempts }),
            ),
            GameEvent::Reset { repeat: true } => ("puzzle_repeated", json!({})),
            _ => return,
        };

        let mut properties = self.base_properties(session_id);
        if let Value::Object(extra) = extra {
            properties.extend(extra);
        }
        self.analytics.capture(name, properties);
    }

    fn base_properties(&self, session_id: Option<&str>) -> Properties {
        let mut properties = Properties::new();
        let identity = self.identity.as_ref();
        properties.insert(
            "variant".into(),
            json!(identity.map(|id| id.variant.as_str())),
        );
        properties.insert("username".into(), json!(identity.map(|id| &id.username)));
        properties.insert("user_id".into(), json!(identity.map(|id| &id.user_id)));
        properties.insert("game_session_id".into(), json!(session_id));
        properties.insert("$feature_flag".into(), json!(self.flag_key));
        properties.insert(
            "$feature_flag_response".into(),
            json!(identity.map(|id| &id.flag_response)),
        );
        properties
    }

    async fn persist_best(&self, completion_ms: u64) {
        if let Some(identity) = &self.identity {
            save_local(&self.store, identity.variant, completion_ms).await;
        }
    }

    /// Fetches and publishes the leaderboard. On failure the last-known view
    /// (or an empty one) is published instead.
    async fn refresh_leaderboard(&self) -> LeaderboardView {
        let Some(identity) = &self.identity else {
            return LeaderboardView::default();
        };

        let view = match self
            .backend
            .leaderboard(identity.variant, self.leaderboard_limit)
            .await
        {
            Ok(entries) => {
                let view = LeaderboardView::build(&entries, &identity.username);
                self.set_cached_leaderboard(view.clone());
                view
            }
            Err(err) => {
                log_warn!("Leaderboard fetch error: {err}");
                self.cached_leaderboard().unwrap_or_default().into_stale()
            }
        };

        self.bus
            .emit(ControllerEvent::Leaderboard { view: view.clone() });
        view
    }

    fn cached_leaderboard(&self) -> Option<LeaderboardView> {
        match self.leaderboard.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_cached_leaderboard(&self, view: LeaderboardView) {
        match self.leaderboard.lock() {
            Ok(mut guard) => *guard = Some(view),
            Err(poisoned) => *poisoned.into_inner() = Some(view),
        }
    }
}

/// Whole milliseconds, so three decimals is exact.
fn seconds_3dp(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

/// Drives one [`GameState`] with real timers.
///
/// At most one ticker task runs per controller: it counts down the memorize
/// phase and then becomes the round timer. Starting or resetting a session
/// aborts the previous ticker before anything else happens. The handle is
/// stored with the epoch it was spawned for, so a resolution only ever
/// aborts its own session's ticker.
#[derive(Clone)]
pub struct GameController {
    state: Arc<Mutex<Option<GameState>>>,
    dispatcher: Dispatcher,
    ticker: Arc<Mutex<Option<(u64, JoinHandle<()>)>>>,
    config_error: Option<String>,
}

impl GameController {
    pub fn new(identity: Result<Identity>, deps: ControllerDeps, options: ControllerOptions) -> Self {
        let leaderboard_limit = options.settings.leaderboard_limit;
        let (state, identity, config_error) = match identity {
            Ok(identity) => {
                let puzzle = options
                    .puzzle
                    .unwrap_or_else(|| PuzzleConfig::for_variant(identity.variant));
                let state = GameState::new(identity.variant, puzzle, options.settings);
                (Some(state), Some(identity), None)
            }
            Err(err) => {
                log_error!("Game disabled: {err}");
                (None, None, Some(err.to_string()))
            }
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            dispatcher: Dispatcher {
                identity,
                flag_key: options.flag_key,
                backend: deps.backend,
                analytics: deps.analytics,
                store: deps.store,
                bus: EventBus::default(),
                leaderboard: Arc::new(StdMutex::new(None)),
                leaderboard_limit,
            },
            ticker: Arc::new(Mutex::new(None)),
            config_error,
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ControllerEvent> {
        self.dispatcher.bus.subscribe()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.dispatcher.identity.as_ref()
    }

    pub fn configuration_error(&self) -> Option<&str> {
        self.config_error.as_deref()
    }

    /// Primes the personal-best cache and publishes the first leaderboard,
    /// or publishes the configuration error when there is no variant.
    pub async fn initialize(&self) {
        if let Some(message) = &self.config_error {
            self.dispatcher.bus.emit(ControllerEvent::ConfigurationError {
                message: message.clone(),
            });
            return;
        }
        let Some(identity) = self.dispatcher.identity.clone() else {
            return;
        };

        let remote_ms = match self
            .dispatcher
            .backend
            .personal_best(identity.variant, &identity.username)
            .await
        {
            Ok(best) => best.map(|seconds| seconds * 1000.0),
            Err(err) => {
                log_warn!("Personal best fetch failed: {err}");
                None
            }
        };
        let local_ms = load_local(&self.dispatcher.store, identity.variant).await;

        if let Some(game) = self.state.lock().await.as_mut() {
            game.bests.prime(identity.variant, remote_ms, local_ms);
        }

        self.dispatcher.refresh_leaderboard().await;
    }

    pub async fn can_start(&self) -> bool {
        matches!(
            self.state.lock().await.as_ref().map(|game| game.phase),
            Some(super::Phase::Idle)
        )
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let guard = self.state.lock().await;
        let game = guard.as_ref().ok_or_else(|| self.not_configured())?;
        Ok(game.snapshot(now()))
    }

    pub async fn start(&self) -> Result<SessionSnapshot> {
        let session_id = Uuid::new_v4().to_string();
        let (events, epoch, settings, snapshot) = {
            let mut guard = self.state.lock().await;
            let game = guard.as_mut().ok_or_else(|| self.not_configured())?;
            let events = game.start(session_id.clone())?;
            (events, game.epoch(), game.settings().clone(), game.snapshot(now()))
        };

        log_info!("Session {session_id} started");
        self.dispatcher.dispatch(events, Some(&session_id));
        self.spawn_ticker(epoch, settings).await;
        Ok(snapshot)
    }

    pub async fn click(&self, row: usize, col: usize) -> Result<SessionSnapshot> {
        let at = now();
        let (events, epoch, session_id, miss_revert, snapshot) = {
            let mut guard = self.state.lock().await;
            let game = guard.as_mut().ok_or_else(|| self.not_configured())?;
            let session_id = game.session_id.clone();
            let events = game.click(row, col, at)?;
            (
                events,
                game.epoch(),
                session_id,
                game.settings().miss_revert(),
                game.snapshot(at),
            )
        };

        if events
            .iter()
            .any(|event| matches!(event, GameEvent::Resolved { .. }))
        {
            self.cancel_ticker_for(epoch).await;
        }
        for event in &events {
            if let GameEvent::CellMissed { row, col } = event {
                self.spawn_miss_revert(epoch, *row, *col, miss_revert);
            }
        }

        self.dispatcher.dispatch(events, session_id.as_deref());
        Ok(snapshot)
    }

    /// Back to idle. `repeat` marks a "try again" rather than a plain reset.
    pub async fn reset(&self, repeat: bool) -> Result<SessionSnapshot> {
        self.cancel_ticker().await;
        let (events, snapshot) = {
            let mut guard = self.state.lock().await;
            let game = guard.as_mut().ok_or_else(|| self.not_configured())?;
            let events = game.reset(repeat);
            (events, game.snapshot(now()))
        };
        self.dispatcher.dispatch(events, None);
        Ok(snapshot)
    }

    pub async fn refresh_leaderboard(&self) -> LeaderboardView {
        self.dispatcher.refresh_leaderboard().await
    }

    fn not_configured(&self) -> SimError {
        SimError::Configuration(
            self.config_error
                .clone()
                .unwrap_or_else(|| "variant not resolved".into()),
        )
    }

    fn spawn_miss_revert(&self, epoch: u64, row: usize, col: usize, delay: Duration) {
        let state = self.state.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let (events, session_id) = {
                let mut guard = state.lock().await;
                let Some(game) = guard.as_mut() else {
                    return;
                };
                (game.revert_miss(epoch, row, col), game.session_id.clone())
            };
            dispatcher.dispatch(events, session_id.as_deref());
        });
    }

    async fn spawn_ticker(&self, epoch: u64, settings: GameSettings) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some((_, handle)) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let dispatcher = self.dispatcher.clone();

        let handle = tokio::spawn(async move {
            if !run_countdown(&state, &dispatcher, epoch).await {
                return;
            }
            time::sleep(settings.go_delay()).await;
            run_round(&state, &dispatcher, epoch, settings.tick_interval()).await;
        });

        *ticker_guard = Some((epoch, handle));
    }

    async fn cancel_ticker(&self) {
        if let Some((_, handle)) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    async fn cancel_ticker_for(&self, epoch: u64) {
        let mut ticker_guard = self.ticker.lock().await;
        if matches!(ticker_guard.as_ref(), Some((owner, _)) if *owner == epoch) {
            if let Some((_, handle)) = ticker_guard.take() {
                handle.abort();
            }
        }
    }
}

/// Counts the memorize phase down one second at a time. Returns false when
/// the session it was started for is gone.
async fn run_countdown(
    state: &Arc<Mutex<Option<GameState>>>,
    dispatcher: &Dispatcher,
    epoch: u64,
) -> bool {
    {
        let guard = state.lock().await;
        match guard.as_ref() {
            Some(game) if game.epoch() == epoch => {
                if game.countdown_remaining == 0 {
                    return true;
                }
            }
            _ => return false,
        }
    }

    let period = Duration::from_secs(1);
    let mut interval = time::interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        let (events, session_id) = {
            let mut guard = state.lock().await;
            let Some(game) = guard.as_mut() else {
                return false;
            };
            (game.countdown_tick(epoch), game.session_id.clone())
        };
        if events.is_empty() {
            return false;
        }
        let go = events.contains(&GameEvent::CountdownGo);
        dispatcher.dispatch(events, session_id.as_deref());
        if go {
            return true;
        }
    }
}

/// Enters the hunt and checks the round clock every `tick` until resolved.
async fn run_round(
    state: &Arc<Mutex<Option<GameState>>>,
    dispatcher: &Dispatcher,
    epoch: u64,
    tick: Duration,
) {
    let (events, session_id) = {
        let mut guard = state.lock().await;
        let Some(game) = guard.as_mut() else {
            return;
        };
        (game.begin_hunt(epoch, now()), game.session_id.clone())
    };
    if events.is_empty() {
        return;
    }
    dispatcher.dispatch(events, session_id.as_deref());

    let mut interval = time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let (events, session_id) = {
            let mut guard = state.lock().await;
            let Some(game) = guard.as_mut() else {
                return;
            };
            (game.round_tick(epoch, now()), game.session_id.clone())
        };
        if events.is_empty() {
            return;
        }
        let resolved = events
            .iter()
            .any(|event| matches!(event, GameEvent::Resolved { .. }));
        dispatcher.dispatch(events, session_id.as_deref());
        if resolved {
            log_info!("Round timer stopped for session {:?}", session_id);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::DisabledAnalytics;
    use crate::game::{Phase, Variant};
    use crate::remote::{
        Distribution, FunnelRow, GeoPoint, LeaderboardEntry, RecentCompletion, VariantOverview,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Offline except for a leaderboard that can be switched on.
    #[derive(Default)]
    struct OfflineBackend {
        leaderboard_up: AtomicBool,
    }

    #[async_trait]
    impl Backend for OfflineBackend {
        async fn leaderboard(&self, _: Variant, _: u32) -> Result<Vec<LeaderboardEntry>> {
            if !self.leaderboard_up.load(Ordering::SeqCst) {
                return Err(SimError::TransientFetch("offline".into()));
            }
            Ok(vec![
                LeaderboardEntry {
                    username: "Swift Fox".into(),
                    best_time_seconds: 9.5,
                },
                LeaderboardEntry {
                    username: "Lucky Lynx".into(),
                    best_time_seconds: 12.25,
                },
            ])
        }
        async fn personal_best(&self, _: Variant, _: &str) -> Result<Option<f64>> {
            Err(SimError::TransientFetch("offline".into()))
        }
        async fn variant_overview(&self) -> Result<VariantOverview> {
            Err(SimError::TransientFetch("offline".into()))
        }
        async fn funnel(&self) -> Result<Vec<FunnelRow>> {
            Err(SimError::TransientFetch("offline".into()))
        }
        async fn recent(&self, _: u32) -> Result<Vec<RecentCompletion>> {
            Err(SimError::TransientFetch("offline".into()))
        }
        async fn distribution(&self) -> Result<Distribution> {
            Err(SimError::TransientFetch("offline".into()))
        }
        async fn geo_completions(&self) -> Result<Vec<GeoPoint>> {
            Err(SimError::TransientFetch("offline".into()))
        }
    }

    fn identity() -> Identity {
        Identity {
            username: "Lucky Lynx".into(),
            user_id: "user_abcdefghi".into(),
            variant: Variant::A,
            flag_response: "control".into(),
        }
    }

    fn controller(identity: Result<Identity>) -> GameController {
        controller_with(identity, Arc::new(OfflineBackend::default()))
    }

    fn controller_with(
        identity: Result<Identity>,
        backend: Arc<OfflineBackend>,
    ) -> GameController {
        GameController::new(
            identity,
            ControllerDeps {
                backend,
                analytics: Arc::new(DisabledAnalytics),
                store: DeviceStore::in_memory().unwrap(),
            },
            ControllerOptions::default(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ControllerEvent>) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_then_hunt_on_schedule() {
        let controller = controller(Ok(identity()));
        controller.start().await.unwrap();

        time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(controller.snapshot().await.unwrap().phase, Phase::Memorizing);

        // 5 s countdown plus the 400 ms "Go!" pause.
        time::sleep(Duration::from_millis(600)).await;
        let snapshot = controller.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, Phase::Hunting);
        assert!(snapshot.remaining_ms <= 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_during_countdown_silences_old_timers() {
        let controller = controller(Ok(identity()));
        let mut rx = controller.subscribe();
        controller.start().await.unwrap();
        time::sleep(Duration::from_millis(2_500)).await;
        controller.reset(false).await.unwrap();
        drain(&mut rx);

        time::sleep(Duration::from_secs(90)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(controller.snapshot().await.unwrap().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn miss_reverts_after_delay() {
        let controller = controller(Ok(identity()));
        controller.start().await.unwrap();
        time::sleep(Duration::from_millis(5_500)).await;

        // (0, 0) is not a target in the built-in variant A layout.
        controller.click(0, 0).await.unwrap();
        let snapshot = controller.snapshot().await.unwrap();
        assert_eq!(snapshot.cells[0][0], crate::game::CellMark::Miss);

        time::sleep(Duration::from_millis(1_050)).await;
        let snapshot = controller.snapshot().await.unwrap();
        assert_eq!(snapshot.cells[0][0], crate::game::CellMark::Neutral);
        assert_eq!(snapshot.total_attempts, 1);
    }

    #[tokio::test]
    async fn configuration_error_blocks_start() {
        let controller = controller(Err(SimError::Configuration("flag missing".into())));
        let mut rx = controller.subscribe();
        controller.initialize().await;

        assert!(!controller.can_start().await);
        assert!(matches!(
            controller.start().await,
            Err(SimError::Configuration(_))
        ));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ControllerEvent::ConfigurationError { .. }]
        ));
    }

    #[tokio::test]
    async fn offline_leaderboard_degrades_to_empty_stale_view() {
        let controller = controller(Ok(identity()));
        let view = controller.refresh_leaderboard().await;
        assert!(view.is_empty());
        assert!(view.stale);
    }

    #[tokio::test]
    async fn failed_leaderboard_fetch_shows_last_known_rows() {
        let backend = Arc::new(OfflineBackend::default());
        backend.leaderboard_up.store(true, Ordering::SeqCst);
        let controller = controller_with(Ok(identity()), backend.clone());

        let fresh = controller.refresh_leaderboard().await;
        assert!(!fresh.stale);
        assert_eq!(fresh.top.len(), 2);
        assert!(fresh.top[1].is_current_user);

        backend.leaderboard_up.store(false, Ordering::SeqCst);
        let mut rx = controller.subscribe();
        let fallback = controller.refresh_leaderboard().await;
        assert!(fallback.stale);
        assert_eq!(fallback.top, fresh.top);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ControllerEvent::Leaderboard { view }] if view.stale && view.top == fresh.top
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn resolving_an_old_session_keeps_the_new_ticker() {
        let controller = controller(Ok(identity()));
        controller.start().await.unwrap();
        let old_epoch = controller.state.lock().await.as_ref().unwrap().epoch();
        controller.reset(true).await.unwrap();
        controller.start().await.unwrap();

        // A resolution from the abandoned session lands after the restart.
        controller.cancel_ticker_for(old_epoch).await;

        time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(controller.snapshot().await.unwrap().phase, Phase::Hunting);
    }

    #[test]
    fn completion_seconds_round_to_milliseconds() {
        assert_eq!(seconds_3dp(12_345), 12.345);
        assert_eq!(seconds_3dp(60_000), 60.0);
    }
}
