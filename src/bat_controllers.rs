// Polling controller: owns the refresh lifecycle, the two cache tiers and
// the session state. Frontends (GUI and console) drive it by calling pump()
// and tick() from their own loops and read rows() back out.

use crate::bat_models::{
    default_route, global_alert, process, route_by_id, BatError, CancelToken, DataFetcher,
    DisplayRow, DurableStore, GeoPoint, MemoryStore, RenderFilters, Result, Route, Snapshot,
    SnapshotStore, ROUTES,
};
use crate::bat_views::BatViews;
use log::{debug, info, warn};
use poll_promise::Promise;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

pub const POLL_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Refresh Lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Startup,
    Poll,
    Manual,
    RouteChange,
}

impl RefreshTrigger {
    // Manual refreshes and route switches are user actions; their failures
    // surface as a notice. Startup and background polls fail silently.
    fn notifies_user(self) -> bool {
        matches!(self, RefreshTrigger::Manual | RefreshTrigger::RouteChange)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Idle,
    Fetching,
    Rendered,
    Failed,
}

struct InFlight {
    generation: u64,
    trigger: RefreshTrigger,
    promise: Promise<Result<Snapshot>>,
}

type SnapshotCallback = Box<dyn FnMut(&Snapshot)>;
type FailureCallback = Box<dyn FnMut(&BatError)>;

// ============================================================================
// Polling Controller
// ============================================================================

pub struct PollingController {
    fetcher: DataFetcher,
    memory: MemoryStore,
    durable: DurableStore,
    selected_route: Route,
    user_loc: Option<GeoPoint>,
    latest: Option<Snapshot>,
    snapshot_serial: u64,
    phase: FetchPhase,
    generation: u64,
    token: Option<CancelToken>,
    in_flight: Option<InFlight>,
    poll_interval: Duration,
    last_started: Option<Instant>,
    last_success: Option<Instant>,
    notice: Option<String>,
    on_snapshot_ready: Vec<SnapshotCallback>,
    on_fetch_failed: Vec<FailureCallback>,
}

impl PollingController {
    /// Restores the previously selected route from the durable tier, falling
    /// back to the first configured route when the saved id is unknown.
    pub fn new(fetcher: DataFetcher, durable: DurableStore) -> Self {
        let selected_route = durable
            .load_route_id()
            .and_then(|id| route_by_id(&id))
            .cloned()
            .unwrap_or_else(|| default_route().clone());
        info!("Starting with route {} ({})", selected_route.id, selected_route.label);

        PollingController {
            fetcher,
            memory: MemoryStore::default(),
            durable,
            selected_route,
            user_loc: None,
            latest: None,
            snapshot_serial: 0,
            phase: FetchPhase::Idle,
            generation: 0,
            token: None,
            in_flight: None,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            last_started: None,
            last_success: None,
            notice: None,
            on_snapshot_ready: Vec::new(),
            on_fetch_failed: Vec::new(),
        }
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn set_user_location(&mut self, loc: Option<GeoPoint>) {
        self.user_loc = loc;
    }

    pub fn selected_route(&self) -> &Route {
        &self.selected_route
    }

    pub fn routes(&self) -> &'static [Route] {
        &ROUTES
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// Bumped every time the displayed snapshot is replaced. Frontends use it
    /// to decide when to re-render or re-run the auto-scroll.
    pub fn snapshot_serial(&self) -> u64 {
        self.snapshot_serial
    }

    pub fn phase(&self) -> FetchPhase {
        self.phase
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn last_success_age(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }

    /// One-shot user-facing notice (set when a user-initiated fetch fails).
    pub fn take_notice(&mut self) -> Option<String> {
        self.notice.take()
    }

    pub fn on_snapshot_ready(&mut self, cb: impl FnMut(&Snapshot) + 'static) {
        self.on_snapshot_ready.push(Box::new(cb));
    }

    pub fn on_fetch_failed(&mut self, cb: impl FnMut(&BatError) + 'static) {
        self.on_fetch_failed.push(Box::new(cb));
    }

    /// Rows for the current snapshot under the given display options, with the
    /// session's user location applied.
    pub fn rows(&self, keyword: &str, only_active: bool, nearby_first: bool) -> Vec<DisplayRow> {
        let Some(snapshot) = &self.latest else {
            return Vec::new();
        };
        let filters = RenderFilters {
            keyword: keyword.to_string(),
            only_active,
            nearby_first,
            user_loc: self.user_loc,
        };
        process(snapshot, &filters)
    }

    pub fn alert(&self) -> Option<String> {
        self.latest.as_ref().and_then(global_alert)
    }

    // --- triggers ---

    pub fn start(&mut self) {
        self.begin_fetch(RefreshTrigger::Startup);
    }

    /// Starts a poll-triggered fetch once the interval has elapsed since the
    /// last one started, regardless of how that one ended. Call every frame.
    pub fn tick(&mut self) {
        let due = match self.last_started {
            Some(t) => t.elapsed() >= self.poll_interval,
            None => false,
        };
        if due {
            self.begin_fetch(RefreshTrigger::Poll);
        }
    }

    pub fn refresh(&mut self) {
        self.begin_fetch(RefreshTrigger::Manual);
    }

    /// Switches the displayed route and refetches. Returns false for an
    /// unknown id. Before the first fetch this only records the selection.
    pub fn select_route(&mut self, id: &str) -> bool {
        let Some(route) = route_by_id(id) else {
            warn!("Unknown route id {:?}", id);
            return false;
        };
        if route.id == self.selected_route.id {
            return true;
        }
        self.selected_route = route.clone();
        if let Err(e) = self.durable.save_route_id(&route.id) {
            warn!("Failed to persist route selection: {}", e);
        }
        if self.generation > 0 {
            self.begin_fetch(RefreshTrigger::RouteChange);
        }
        true
    }

    /// Collects a finished in-flight fetch, if any. Call every frame.
    pub fn pump(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let InFlight {
            generation,
            trigger,
            promise,
        } = in_flight;
        match promise.try_take() {
            Ok(result) => self.commit(generation, trigger, result),
            Err(promise) => {
                self.in_flight = Some(InFlight {
                    generation,
                    trigger,
                    promise,
                });
            }
        }
    }

    // --- internals ---

    /// Every trigger cancels whatever is in flight and claims a fresh
    /// generation; only the newest generation may commit.
    fn begin_fetch(&mut self, trigger: RefreshTrigger) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.generation += 1;
        let token = CancelToken::new();
        self.token = Some(token.clone());
        self.last_started = Some(Instant::now());
        self.phase = FetchPhase::Fetching;

        let fetcher = self.fetcher.clone();
        let route = self.selected_route.clone();
        debug!(
            "Fetch started for {} ({:?}, generation {})",
            route.id, trigger, self.generation
        );
        let promise = Promise::spawn_thread("bat-fetch", move || fetcher.fetch(&route, &token));
        self.in_flight = Some(InFlight {
            generation: self.generation,
            trigger,
            promise,
        });
    }

    fn commit(&mut self, generation: u64, trigger: RefreshTrigger, result: Result<Snapshot>) {
        if generation != self.generation {
            debug!(
                "Discarding stale fetch result (generation {} superseded by {})",
                generation, self.generation
            );
            return;
        }

        match result {
            Ok(snapshot) => {
                let _ = self.memory.set(&snapshot);
                if let Err(e) = self.durable.set(&snapshot) {
                    warn!("Failed to persist snapshot: {}", e);
                }
                self.last_success = Some(Instant::now());
                self.phase = FetchPhase::Rendered;
                self.replace_snapshot(snapshot);
                debug!("Snapshot committed (generation {})", generation);
                if let Some(snapshot) = &self.latest {
                    for cb in self.on_snapshot_ready.iter_mut() {
                        cb(snapshot);
                    }
                }
            }
            Err(BatError::Cancelled) => {
                // The newer fetch owns the phase now.
                debug!("Fetch cancelled (generation {})", generation);
            }
            Err(err) => {
                warn!("Fetch failed ({:?}): {}", trigger, err);
                self.phase = FetchPhase::Failed;
                // Fallback chain: session tier, then durable tier, then the
                // synthetic offline payload.
                let cached = self
                    .memory
                    .get()
                    .ok_or(BatError::EmptyCache)
                    .or_else(|_| self.durable.fallback());
                match cached {
                    Ok(snapshot) => {
                        info!("Serving cached snapshot after fetch failure");
                        let _ = self.memory.set(&snapshot);
                        self.replace_snapshot(snapshot);
                    }
                    Err(_) => {
                        self.replace_snapshot(Snapshot::offline_placeholder());
                    }
                }
                if trigger.notifies_user() {
                    self.notice = Some("讀取失敗，已使用上次資料（若有）。".to_string());
                }
                for cb in self.on_fetch_failed.iter_mut() {
                    cb(&err);
                }
            }
        }
    }

    fn replace_snapshot(&mut self, snapshot: Snapshot) {
        self.latest = Some(snapshot);
        self.snapshot_serial += 1;
    }
}

// ============================================================================
// Console Mode
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ConsoleOptions {
    pub keyword: String,
    pub only_active: bool,
    pub nearby_first: bool,
}

/// Headless loop: renders the timeline on every new snapshot, polls on the
/// controller's interval, and reads stdin for manual refresh ("q" quits).
pub fn run_console(mut controller: PollingController, options: ConsoleOptions) {
    BatViews::show_welcome(controller.selected_route());

    let stdin_rx = spawn_stdin_reader();
    let mut rendered_serial = 0u64;

    controller.start();
    loop {
        controller.pump();
        controller.tick();

        if controller.snapshot_serial() != rendered_serial {
            rendered_serial = controller.snapshot_serial();
            let rows = controller.rows(
                &options.keyword,
                options.only_active,
                options.nearby_first,
            );
            if let Some(snapshot) = controller.latest() {
                BatViews::show_timeline(
                    controller.selected_route(),
                    snapshot,
                    &rows,
                    controller.alert().as_deref(),
                );
            }
        }
        if let Some(notice) = controller.take_notice() {
            BatViews::show_notice(&notice);
        }

        match stdin_rx.try_recv() {
            Ok(line) if line.trim().eq_ignore_ascii_case("q") => break,
            Ok(line) if route_by_id(line.trim()).is_some() => {
                controller.select_route(line.trim());
            }
            Ok(_) => controller.refresh(),
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => break,
        }

        thread::sleep(Duration::from_millis(200));
    }

    BatViews::goodbye_message();
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        loop {
            line.clear();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(line.clone()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bat_models::RawStop;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn snapshot_with(name: &str) -> Snapshot {
        Snapshot {
            time: Some("10:00:00".to_string()),
            data: vec![RawStop {
                sid: "1".to_string(),
                na: name.to_string(),
                sequence: Some(1.0),
                ptime: Some("進站".to_string()),
                ..Default::default()
            }],
            stop: Vec::new(),
            offline: false,
        }
    }

    fn controller() -> (PollingController, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = DataFetcher::new("http://127.0.0.1:9/exec").unwrap();
        let durable = DurableStore::at(dir.path());
        (PollingController::new(fetcher, durable), dir)
    }

    #[test]
    fn successful_commit_updates_session_and_both_tiers() {
        let (mut c, dir) = controller();
        c.generation = 1;

        let fired = Rc::new(RefCell::new(0));
        let fired_in_cb = Rc::clone(&fired);
        c.on_snapshot_ready(move |snap| {
            assert_eq!(snap.data[0].na, "文化公園");
            *fired_in_cb.borrow_mut() += 1;
        });

        c.commit(1, RefreshTrigger::Startup, Ok(snapshot_with("文化公園")));

        assert_eq!(c.phase(), FetchPhase::Rendered);
        assert_eq!(c.latest().unwrap().data[0].na, "文化公園");
        assert_eq!(*fired.borrow(), 1);
        assert!(c.memory.get().is_some());
        let durable = DurableStore::at(dir.path());
        assert_eq!(durable.fallback().unwrap().data[0].na, "文化公園");
    }

    #[test]
    fn stale_generation_result_is_discarded() {
        let (mut c, _dir) = controller();
        c.generation = 5;
        c.commit(4, RefreshTrigger::Poll, Ok(snapshot_with("old")));
        assert!(c.latest().is_none());
        assert_eq!(c.phase(), FetchPhase::Idle);
        assert_eq!(c.snapshot_serial(), 0);
    }

    #[test]
    fn cancelled_result_leaves_state_untouched() {
        let (mut c, _dir) = controller();
        c.generation = 2;
        c.phase = FetchPhase::Fetching;
        c.commit(2, RefreshTrigger::Poll, Err(BatError::Cancelled));
        assert_eq!(c.phase(), FetchPhase::Fetching);
        assert!(c.latest().is_none());
        assert!(c.take_notice().is_none());
    }

    #[test]
    fn failure_falls_back_to_durable_snapshot() {
        let (mut c, _dir) = controller();
        c.durable.set(&snapshot_with("cached")).unwrap();
        c.generation = 1;

        c.commit(
            1,
            RefreshTrigger::Poll,
            Err(BatError::Network("boom".to_string())),
        );

        assert_eq!(c.phase(), FetchPhase::Failed);
        assert_eq!(c.latest().unwrap().data[0].na, "cached");
        // Background failures do not raise the user-facing notice.
        assert!(c.take_notice().is_none());
    }

    #[test]
    fn failure_with_empty_cache_degrades_to_offline_placeholder() {
        let (mut c, _dir) = controller();
        c.generation = 1;

        let failures = Rc::new(RefCell::new(0));
        let failures_in_cb = Rc::clone(&failures);
        c.on_fetch_failed(move |err| {
            assert!(matches!(err, BatError::Network(_)));
            *failures_in_cb.borrow_mut() += 1;
        });

        c.commit(
            1,
            RefreshTrigger::Poll,
            Err(BatError::Network("boom".to_string())),
        );

        let snap = c.latest().unwrap();
        assert!(snap.offline);
        assert!(snap.data.is_empty());
        assert_eq!(*failures.borrow(), 1);
    }

    #[test]
    fn failure_never_clobbers_a_live_snapshot() {
        let (mut c, _dir) = controller();
        c.generation = 1;
        c.commit(1, RefreshTrigger::Startup, Ok(snapshot_with("live")));
        c.durable.clear().unwrap();

        c.generation = 2;
        c.commit(
            2,
            RefreshTrigger::Poll,
            Err(BatError::Network("boom".to_string())),
        );

        assert_eq!(c.latest().unwrap().data[0].na, "live");
        assert_eq!(c.phase(), FetchPhase::Failed);
    }

    #[test]
    fn manual_failure_raises_one_shot_notice() {
        let (mut c, _dir) = controller();
        c.generation = 1;
        c.commit(
            1,
            RefreshTrigger::Manual,
            Err(BatError::Network("boom".to_string())),
        );

        let notice = c.take_notice().unwrap();
        assert!(notice.contains("讀取失敗"));
        assert!(c.take_notice().is_none());
    }

    #[test]
    fn route_change_failure_also_raises_notice() {
        let (mut c, _dir) = controller();
        c.generation = 1;
        c.commit(
            1,
            RefreshTrigger::RouteChange,
            Err(BatError::Network("boom".to_string())),
        );
        assert!(c.take_notice().is_some());

        // Startup failures stay silent, like background polls.
        c.generation = 2;
        c.commit(
            2,
            RefreshTrigger::Startup,
            Err(BatError::Network("boom".to_string())),
        );
        assert!(c.take_notice().is_none());
    }

    #[test]
    fn failure_prefers_session_tier_over_durable() {
        let (mut c, _dir) = controller();
        c.memory.set(&snapshot_with("session")).unwrap();
        c.durable.set(&snapshot_with("disk")).unwrap();
        c.generation = 1;
        c.commit(
            1,
            RefreshTrigger::Poll,
            Err(BatError::Network("boom".to_string())),
        );
        assert_eq!(c.latest().unwrap().data[0].na, "session");
    }

    #[test]
    fn select_route_persists_and_restores() {
        let (mut c, dir) = controller();
        assert_eq!(c.selected_route().id, "r1");
        assert!(c.select_route("r3"));
        assert!(!c.select_route("bogus"));
        assert_eq!(c.selected_route().id, "r3");
        // No fetch before start().
        assert!(!c.is_fetching());

        let fetcher = DataFetcher::new("http://127.0.0.1:9/exec").unwrap();
        let reopened = PollingController::new(fetcher, DurableStore::at(dir.path()));
        assert_eq!(reopened.selected_route().id, "r3");
    }

    #[test]
    fn unknown_persisted_route_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let durable = DurableStore::at(dir.path());
        durable.save_route_id("gone").unwrap();
        let fetcher = DataFetcher::new("http://127.0.0.1:9/exec").unwrap();
        let c = PollingController::new(fetcher, durable);
        assert_eq!(c.selected_route().id, "r1");
    }

    #[test]
    fn new_trigger_cancels_the_previous_token() {
        let (mut c, _dir) = controller();
        c.start();
        let first = c.token.clone().unwrap();
        assert!(!first.is_cancelled());
        c.refresh();
        assert!(first.is_cancelled());
        assert!(!c.token.as_ref().unwrap().is_cancelled());
        assert_eq!(c.generation, 2);
    }

    #[test]
    fn tick_fires_only_after_interval_since_last_start() {
        let (mut c, _dir) = controller();
        // Never started: tick must not fetch.
        c.tick();
        assert!(!c.is_fetching());

        c.set_poll_interval(Duration::from_millis(0));
        c.start();
        let gen_after_start = c.generation;
        c.tick();
        assert_eq!(c.generation, gen_after_start + 1);
    }

    #[test]
    fn rows_are_empty_before_any_snapshot() {
        let (c, _dir) = controller();
        assert!(c.rows("", false, false).is_empty());
        assert!(c.alert().is_none());
    }
}
