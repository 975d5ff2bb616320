use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::PollBackoff;
use super::render::{DashboardPresenter, DashboardRenderer};
use super::snapshot::DashboardSnapshot;
use crate::error::{Result, SimError};
use crate::remote::Backend;
use crate::settings::DashboardSettings;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Result of a single poll cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub next_delay: Duration,
    pub error: Option<SimError>,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Fetches the five aggregate views, renders them and decides when to poll
/// next. The last good snapshot survives failed cycles.
pub struct DashboardPoller {
    backend: Arc<dyn Backend>,
    presenter: Arc<Mutex<DashboardPresenter>>,
    latest: Arc<StdMutex<Option<DashboardSnapshot>>>,
    backoff: PollBackoff,
    recent_limit: u32,
}

impl DashboardPoller {
    pub fn new(
        backend: Arc<dyn Backend>,
        renderer: Box<dyn DashboardRenderer>,
        settings: &DashboardSettings,
    ) -> Self {
        Self {
            backend,
            presenter: Arc::new(Mutex::new(DashboardPresenter::new(
                renderer,
                settings.kde_resolution,
            ))),
            latest: Arc::new(StdMutex::new(None)),
            backoff: PollBackoff::from_settings(settings),
            recent_limit: settings.recent_limit,
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.backoff.current()
    }

    pub fn latest(&self) -> Option<DashboardSnapshot> {
        read_latest(&self.latest)
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.presenter.lock().await.updating();

        match self.fetch().await {
            Ok(snapshot) => {
                let next_delay = self.backoff.on_success();
                self.presenter.lock().await.render(&snapshot);
                match self.latest.lock() {
                    Ok(mut guard) => *guard = Some(snapshot),
                    Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
                }
                log_debug!("Dashboard updated, next poll in {next_delay:?}");
                CycleReport {
                    next_delay,
                    error: None,
                }
            }
            Err(err) => {
                let next_delay = self.backoff.on_failure();
                log_warn!(
                    "Dashboard fetch failed, retrying in {}s: {err}",
                    next_delay.as_secs()
                );
                self.presenter
                    .lock()
                    .await
                    .render_error(&err.to_string(), next_delay);
                CycleReport {
                    next_delay,
                    error: Some(err),
                }
            }
        }
    }

    async fn fetch(&self) -> Result<DashboardSnapshot> {
        let backend = &self.backend;
        let (overview, funnel, recent, distribution, geo) = tokio::try_join!(
            backend.variant_overview(),
            backend.funnel(),
            backend.recent(self.recent_limit),
            backend.distribution(),
            backend.geo_completions(),
        )?;
        DashboardSnapshot::from_fetch(overview, funnel, recent, distribution, geo, Utc::now())
    }

    /// Runs the poll loop on its own task: one cycle right away, then one
    /// every backoff delay, or sooner when a refresh is requested.
    pub fn spawn(self) -> PollerHandle {
        let cancel_token = CancellationToken::new();
        let refresh = Arc::new(Notify::new());
        let presenter = self.presenter.clone();
        let latest = self.latest.clone();

        let handle = tokio::spawn(poll_loop(self, cancel_token.clone(), refresh.clone()));

        PollerHandle {
            handle: Some(handle),
            cancel_token,
            refresh,
            presenter,
            latest,
        }
    }
}

async fn poll_loop(mut poller: DashboardPoller, cancel_token: CancellationToken, refresh: Arc<Notify>) {
    loop {
        tokio::select! {
            report = poller.run_cycle() => {
                if let Some(err) = report.error.filter(|err| !err.is_recoverable()) {
                    log_warn!("Dashboard error is not transient: {err}");
                }
            }
            _ = cancel_token.cancelled() => break,
        }

        let delay = poller.current_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = refresh.notified() => {
                log_debug!("Dashboard refresh requested");
            }
            _ = cancel_token.cancelled() => break,
        }
    }
    log_info!("Dashboard poller shutting down");
}

/// Control surface for a running poller.
pub struct PollerHandle {
    handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
    refresh: Arc<Notify>,
    presenter: Arc<Mutex<DashboardPresenter>>,
    latest: Arc<StdMutex<Option<DashboardSnapshot>>>,
}

impl PollerHandle {
    /// Skips the pending wait and polls immediately.
    pub fn refresh_now(&self) {
        self.refresh.notify_one();
    }

    pub async fn set_follow(&self, enabled: bool) {
        self.presenter.lock().await.set_follow(enabled);
    }

    pub async fn toggle_follow(&self) -> bool {
        let mut presenter = self.presenter.lock().await;
        let enabled = !presenter.follow_enabled();
        presenter.set_follow(enabled);
        enabled
    }

    pub async fn dismiss_error(&self) {
        self.presenter.lock().await.dismiss_error();
    }

    pub fn latest(&self) -> Option<DashboardSnapshot> {
        read_latest(&self.latest)
    }

    pub async fn stop(&mut self) -> anyhow::Result<()> {
        self.cancel_token.cancel();

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("dashboard poller task failed to join")
        } else {
            Ok(())
        }
    }
}

fn read_latest(latest: &StdMutex<Option<DashboardSnapshot>>) -> Option<DashboardSnapshot> {
    match latest.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}
