//! Event replay
//!
//! `EventReplayer` reads events back from an [`EventStore`] and re-drives a
//! handler with them, one session at a time. A session can be paused,
//! resumed and stopped from another task while `replay*` is awaiting.

use crate::config::duration_ms;
use crate::error::{EventError, HandlerError, Result};
use crate::handler::{invoke, EventHandler};
use crate::store::{EventStore, StoredEvent};
use crate::types::{Event, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Called with a status snapshot after every replayed event
pub type ProgressHandler = Arc<dyn Fn(&ReplayStatus) + Send + Sync>;

/// Called for every handler failure, skipped or not
pub type ErrorHandler = Arc<dyn Fn(&HandlerError, &Event) + Send + Sync>;

/// Replay tuning and filtering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplayOptions {
    /// Pacing multiplier; 2.0 replays twice as fast. Must be > 0.
    pub speed: f64,

    /// Page size used when reading from the store; 0 reads everything at once
    pub batch_size: usize,

    /// Cap on events read from the store (0 = no cap)
    pub max_events: usize,

    /// Skip events with a timestamp before this instant
    pub start_from: Option<DateTime<Utc>>,

    /// Skip events with a timestamp after this instant
    pub stop_at: Option<DateTime<Utc>>,

    /// Only replay these types (empty = all)
    pub event_types: Vec<EventType>,

    /// Only replay events from these sources (empty = all)
    pub sources: Vec<String>,

    /// Keep going after a handler failure
    pub skip_errors: bool,

    /// Reproduce the recorded gaps between events, scaled by `speed`
    pub real_time: bool,

    /// Replay newest first
    pub reverse: bool,

    /// Number of full passes; 0 or negative loops until stopped
    pub loop_count: i32,

    /// Delay between events when not replaying in real time, scaled by `speed`
    #[serde(rename = "baseIntervalMs", with = "duration_ms")]
    pub base_interval: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            batch_size: 100,
            max_events: 0,
            start_from: None,
            stop_at: None,
            event_types: Vec::new(),
            sources: Vec::new(),
            skip_errors: false,
            real_time: false,
            reverse: false,
            loop_count: 1,
            base_interval: Duration::from_millis(10),
        }
    }
}

impl ReplayOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(EventError::Config(format!(
                "replay speed must be a positive number, got {}",
                self.speed
            )));
        }
        if Duration::try_from_secs_f64(self.base_interval.as_secs_f64() / self.speed).is_err() {
            return Err(EventError::Config(format!(
                "replay speed {} makes the {:?} base interval unrepresentable",
                self.speed, self.base_interval
            )));
        }
        Ok(())
    }

    fn accepts(&self, event: &Event) -> bool {
        if self.start_from.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.stop_at.is_some_and(|stop| event.timestamp > stop) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        self.sources.is_empty() || self.sources.contains(&event.source)
    }

    /// `interval / speed`, saturating at `Duration::MAX`
    fn scaled(&self, interval: Duration) -> Duration {
        Duration::try_from_secs_f64(interval.as_secs_f64() / self.speed).unwrap_or(Duration::MAX)
    }
}

/// Lifecycle of a replay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl ReplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Running or paused
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the current (or last) replay session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatus {
    pub state: ReplayState,

    /// Events per pass after filtering
    pub total_events: usize,

    /// Events handled in the current pass
    pub processed_events: usize,

    pub current_event_id: Option<String>,

    pub started_at: Option<DateTime<Utc>>,

    #[serde(rename = "elapsedMs", with = "duration_ms")]
    pub elapsed: Duration,

    /// Remaining time for the current pass at the observed rate
    #[serde(rename = "estimatedRemainingMs", with = "duration_ms")]
    pub estimated_remaining: Duration,

    pub error_count: u64,

    pub last_error: Option<String>,

    pub loops_completed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

enum Flow {
    Continue,
    Stop,
}

enum Selection {
    All,
    Range(DateTime<Utc>, DateTime<Utc>),
    Type(EventType),
    Source(String),
}

#[derive(Default)]
struct Handlers {
    event: Option<Arc<dyn EventHandler>>,
    progress: Option<ProgressHandler>,
    error: Option<ErrorHandler>,
}

/// Re-drives stored events through a handler
pub struct EventReplayer {
    store: Arc<dyn EventStore>,
    status: Mutex<ReplayStatus>,
    started: Mutex<Option<Instant>>,
    control: watch::Sender<Control>,
    handlers: RwLock<Handlers>,
}

/// Marks an abandoned session as stopped when the replay future is dropped
struct SessionGuard<'a> {
    replayer: &'a EventReplayer,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mut status = self.replayer.lock_status();
        if status.state.is_active() {
            status.state = ReplayState::Stopped;
        }
    }
}

impl EventReplayer {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        let (control, _) = watch::channel(Control::Run);
        Self {
            store,
            status: Mutex::new(ReplayStatus::default()),
            started: Mutex::new(None),
            control,
            handlers: RwLock::new(Handlers::default()),
        }
    }

    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.write_handlers().event = Some(handler);
    }

    pub fn set_progress_handler(&self, handler: impl Fn(&ReplayStatus) + Send + Sync + 'static) {
        self.write_handlers().progress = Some(Arc::new(handler));
    }

    pub fn set_error_handler(
        &self,
        handler: impl Fn(&HandlerError, &Event) + Send + Sync + 'static,
    ) {
        self.write_handlers().error = Some(Arc::new(handler));
    }

    /// Current session status
    pub fn status(&self) -> ReplayStatus {
        let mut status = self.lock_status().clone();
        if status.state.is_active() {
            if let Some(started) = *self.started.lock().unwrap_or_else(PoisonError::into_inner) {
                status.elapsed = started.elapsed();
            }
        }
        status
    }

    // ─── Replay entry points ────────────────────────────────────────

    /// Replay everything in the store, oldest first
    pub async fn replay(&self, ctx: &CancellationToken, options: ReplayOptions) -> Result<()> {
        self.run(ctx, Selection::All, options).await
    }

    /// Replay events with `start <= timestamp <= end`
    pub async fn replay_range(
        &self,
        ctx: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: ReplayOptions,
    ) -> Result<()> {
        self.run(ctx, Selection::Range(start, end), options).await
    }

    pub async fn replay_by_type(
        &self,
        ctx: &CancellationToken,
        event_type: impl Into<EventType>,
        options: ReplayOptions,
    ) -> Result<()> {
        self.run(ctx, Selection::Type(event_type.into()), options)
            .await
    }

    pub async fn replay_by_source(
        &self,
        ctx: &CancellationToken,
        source: impl Into<String>,
        options: ReplayOptions,
    ) -> Result<()> {
        self.run(ctx, Selection::Source(source.into()), options)
            .await
    }

    // ─── Session control ────────────────────────────────────────────

    /// Pause a running session before its next event
    pub fn pause(&self) -> Result<()> {
        self.transition("pause", ReplayState::Running, ReplayState::Paused, Control::Pause)?;
        tracing::info!("Event replay paused");
        Ok(())
    }

    /// Resume a paused session where it left off
    pub fn resume(&self) -> Result<()> {
        self.transition("resume", ReplayState::Paused, ReplayState::Running, Control::Run)?;
        tracing::info!("Event replay resumed");
        Ok(())
    }

    /// Stop a running or paused session
    pub fn stop(&self) -> Result<()> {
        let mut status = self.lock_status();
        if !status.state.is_active() {
            return Err(EventError::InvalidState {
                operation: "stop replay",
                state: status.state.to_string(),
            });
        }
        status.state = ReplayState::Stopped;
        self.control.send_replace(Control::Stop);
        tracing::info!("Event replay stopped");
        Ok(())
    }

    fn transition(
        &self,
        operation: &'static str,
        from: ReplayState,
        to: ReplayState,
        signal: Control,
    ) -> Result<()> {
        let mut status = self.lock_status();
        if status.state != from {
            return Err(EventError::InvalidState {
                operation,
                state: status.state.to_string(),
            });
        }
        status.state = to;
        self.control.send_replace(signal);
        Ok(())
    }

    // ─── Session ────────────────────────────────────────────────────

    async fn run(
        &self,
        ctx: &CancellationToken,
        selection: Selection,
        options: ReplayOptions,
    ) -> Result<()> {
        options.validate()?;
        if self.lock_status().state.is_active() {
            return Err(EventError::ReplayInProgress);
        }

        let fetched = self.fetch(&selection, &options).await?;
        let mut events: Vec<StoredEvent> = fetched
            .into_iter()
            .filter(|stored| options.accepts(&stored.event))
            .collect();
        if events.is_empty() {
            return Err(EventError::NoEventsToReplay);
        }
        if options.reverse {
            events.reverse();
        }
        let events: Vec<Arc<Event>> = events
            .into_iter()
            .map(|stored| Arc::new(stored.event))
            .collect();

        let mut control = self.begin(events.len())?;
        let _guard = SessionGuard { replayer: self };

        tracing::info!(
            events = events.len(),
            speed = options.speed,
            loop_count = options.loop_count,
            reverse = options.reverse,
            "Event replay started"
        );

        let mut pass = 0u32;
        let outcome = loop {
            if options.loop_count > 0 && pass >= options.loop_count as u32 {
                break Ok(());
            }
            match self.replay_pass(ctx, &mut control, &events, &options).await {
                Ok(Flow::Continue) => {
                    pass += 1;
                    self.lock_status().loops_completed = pass;
                }
                Ok(Flow::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let mut status = self.lock_status();
        match &outcome {
            Ok(()) if status.state == ReplayState::Running => {
                status.state = ReplayState::Completed;
            }
            Err(EventError::Cancelled) => status.state = ReplayState::Stopped,
            _ => {}
        }
        status.estimated_remaining = Duration::ZERO;
        tracing::info!(
            state = %status.state,
            loops = status.loops_completed,
            errors = status.error_count,
            "Event replay finished"
        );
        outcome
    }

    /// Claim the session; fails if another caller got there first
    fn begin(&self, total: usize) -> Result<watch::Receiver<Control>> {
        let mut status = self.lock_status();
        if status.state.is_active() {
            return Err(EventError::ReplayInProgress);
        }
        *status = ReplayStatus {
            state: ReplayState::Running,
            total_events: total,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.control.send_replace(Control::Run);
        Ok(self.control.subscribe())
    }

    async fn fetch(&self, selection: &Selection, options: &ReplayOptions) -> Result<Vec<StoredEvent>> {
        let mut fetched = Vec::new();
        loop {
            let offset = fetched.len();
            let limit = options.batch_size;
            let page = match selection {
                Selection::All => {
                    self.store
                        .get_by_time_range(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC, limit, offset)
                        .await?
                }
                Selection::Range(start, end) => {
                    self.store
                        .get_by_time_range(*start, *end, limit, offset)
                        .await?
                }
                Selection::Type(event_type) => {
                    self.store.get_by_type(event_type, limit, offset).await?
                }
                Selection::Source(source) => {
                    self.store.get_by_source(source, limit, offset).await?
                }
            };
            if page.is_empty() {
                break;
            }
            fetched.extend(page);
            if options.max_events > 0 && fetched.len() >= options.max_events {
                fetched.truncate(options.max_events);
                break;
            }
            if limit == 0 {
                break;
            }
        }
        Ok(fetched)
    }

    async fn replay_pass(
        &self,
        ctx: &CancellationToken,
        control: &mut watch::Receiver<Control>,
        events: &[Arc<Event>],
        options: &ReplayOptions,
    ) -> Result<Flow> {
        let (handler, progress, on_error) = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            (
                handlers.event.clone(),
                handlers.progress.clone(),
                handlers.error.clone(),
            )
        };
        let pass_started = Instant::now();
        self.lock_status().processed_events = 0;

        let mut previous: Option<DateTime<Utc>> = None;
        for (index, event) in events.iter().enumerate() {
            if let Flow::Stop = checkpoint(ctx, control).await? {
                return Ok(Flow::Stop);
            }

            let delay = if options.real_time {
                previous
                    .and_then(|prev| (event.timestamp - prev).to_std().ok())
                    .map(|gap| options.scaled(gap))
            } else if index > 0 {
                Some(options.scaled(options.base_interval))
            } else {
                None
            };
            if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                if let Flow::Stop = pace(ctx, control, delay).await? {
                    return Ok(Flow::Stop);
                }
                if let Flow::Stop = checkpoint(ctx, control).await? {
                    return Ok(Flow::Stop);
                }
            } else {
                // unpaced sessions still let stop() and other tasks run
                tokio::task::yield_now().await;
            }
            previous = Some(event.timestamp);

            self.lock_status().current_event_id = Some(event.id.clone());

            let result = match &handler {
                Some(handler) => invoke(handler.as_ref(), event.clone()).await,
                None => Ok(()),
            };

            if let Err(e) = result {
                tracing::error!(event_id = %event.id, error = %e, "Replay handler failed");
                {
                    let mut status = self.lock_status();
                    status.error_count += 1;
                    status.last_error = Some(e.to_string());
                }
                if let Some(on_error) = &on_error {
                    on_error(&e, event);
                }
                if !options.skip_errors {
                    self.lock_status().state = ReplayState::Error;
                    return Err(EventError::Replay {
                        event_id: event.id.clone(),
                        source: e,
                    });
                }
            }

            let snapshot = {
                let mut status = self.lock_status();
                let done = index + 1;
                status.processed_events = done;
                let per_event = pass_started.elapsed() / done as u32;
                status.estimated_remaining = per_event * (events.len() - done) as u32;
                progress.as_ref().map(|_| status.clone())
            };
            if let (Some(progress), Some(snapshot)) = (&progress, snapshot) {
                progress(&snapshot);
            }
        }
        Ok(Flow::Continue)
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, ReplayStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Block while paused; report a stop
async fn checkpoint(ctx: &CancellationToken, control: &mut watch::Receiver<Control>) -> Result<Flow> {
    loop {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        let signal = *control.borrow_and_update();
        match signal {
            Control::Run => return Ok(Flow::Continue),
            Control::Stop => return Ok(Flow::Stop),
            Control::Pause => {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(EventError::Cancelled),
                    changed = control.changed() => {
                        if changed.is_err() {
                            return Ok(Flow::Stop);
                        }
                    }
                }
            }
        }
    }
}

/// Sleep for `delay`, waking early on stop or cancel
async fn pace(
    ctx: &CancellationToken,
    control: &mut watch::Receiver<Control>,
    delay: Duration,
) -> Result<Flow> {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Ok(Flow::Continue),
            _ = ctx.cancelled() => return Err(EventError::Cancelled),
            changed = control.changed() => {
                if changed.is_err() || *control.borrow() == Control::Stop {
                    return Ok(Flow::Stop);
                }
            }
        }
    }
}
