//! Persistent schedule engine: drives dosing/irrigation loops from durable
//! start/stop jobs, with an independent failsafe layer.
//!
//! Each loop alternates strictly between a `Start` and a `Stop` job, both
//! stored as plain rows keyed by id.  A handler schedules its successor only
//! after its relay action is applied, so a crash never leaves a loop with
//! two pending jobs in the same direction.
//!
//! ## Per-loop job chain
//!
//! ```text
//! Start ──[pumps ON]──▶ Stop (+on_duration) ──[pumps OFF]──▶ Start (+wait_duration)
//!   │
//!   └──[no dose needed]──▶ Start (+wait_duration)
//! ```
//!
//! Every executed Start also arms a failsafe timer that forces the loop's
//! pumps off after `on_duration` plus a grace period, even if the store or
//! the primary scheduler path is broken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{Config, LoopEntry};
use crate::policy::{self, CyclePlan, ReloadAction};
use crate::relay::RelayController;
use crate::state::SharedState;
use crate::store::{Job, JobKind, JobStore};

/// How often the engine checks for due jobs.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Extra time the failsafe waits past `on_duration` so the primary stop
/// path always gets the first shot.
const FAILSAFE_GRACE: Duration = Duration::from_secs(5);

/// Retry delay after a failed stop write.
const STOP_RETRY_SECS: i64 = 5;

pub struct Engine {
    store: JobStore,
    relays: Arc<Mutex<RelayController>>,
    shared: SharedState,
    config: Config,
    reload_rx: mpsc::Receiver<Config>,
    /// Armed failsafe timers, one per loop.  Re-arming aborts the previous
    /// timer so a stale deadline cannot cut a fresh cycle short.
    failsafes: HashMap<String, JoinHandle<()>>,
}

enum StartDecision {
    /// Activate these (name, channel) pairs.
    Run(Vec<(String, u8)>),
    /// No actuation this cycle.
    Skip(String),
}

impl Engine {
    pub fn new(
        store: JobStore,
        relays: Arc<Mutex<RelayController>>,
        shared: SharedState,
        config: Config,
        reload_rx: mpsc::Receiver<Config>,
    ) -> Self {
        Engine {
            store,
            relays,
            shared,
            config,
            reload_rx,
            failsafes: HashMap::new(),
        }
    }

    /// Run the engine loop.  Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self) {
        self.schedule_startup().await;

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            loops = self.config.loops.len(),
            durable = self.store.is_durable(),
            "schedule engine started"
        );

        loop {
            ticker.tick().await;

            // Reloads are rare; picking them up on the next tick is plenty.
            while let Ok(new_config) = self.reload_rx.try_recv() {
                self.apply_config(new_config).await;
            }

            let due = match self.store.due(now_unix()).await {
                Ok(due) => due,
                Err(e) => {
                    error!("failed to query due jobs: {e:#}");
                    continue;
                }
            };
            for job in due {
                self.execute_job(&job).await;
            }
        }
    }

    // -- Startup -----------------------------------------------------------

    /// Reconcile persisted jobs with the current config: drop jobs for
    /// unknown or disabled loops, resume surviving ones, and give every
    /// enabled loop without pending work an immediate first cycle.
    async fn schedule_startup(&mut self) {
        let pending = match self.store.all().await {
            Ok(pending) => pending,
            Err(e) => {
                error!("failed to list persisted jobs: {e:#}");
                Vec::new()
            }
        };

        let mut resumed: Vec<&str> = Vec::new();
        for job in &pending {
            let enabled = self
                .config
                .loops
                .get(&job.loop_id)
                .map(|lp| lp.plan().enabled())
                .unwrap_or(false);
            if enabled {
                resumed.push(&job.loop_id);
            } else {
                info!(job = %job.id, "dropping persisted job for unknown or disabled loop");
                if let Err(e) = self.store.remove(&job.id).await {
                    error!(job = %job.id, "failed to drop job: {e:#}");
                }
            }
        }

        let loop_ids: Vec<String> = self.config.loops.keys().cloned().collect();
        for id in loop_ids {
            if !self.config.loops[&id].plan().enabled() {
                continue;
            }
            if resumed.iter().any(|r| *r == id) {
                info!(loop_id = %id, "resuming persisted schedule");
                continue;
            }
            // First cycle runs right away.
            self.schedule_or_log(Job::new(JobKind::Start, &id, now_unix()))
                .await;
        }
    }

    // -- Job execution -----------------------------------------------------

    async fn execute_job(&mut self, job: &Job) {
        match job.kind {
            JobKind::Start => self.execute_start(job).await,
            JobKind::Stop => self.execute_stop(job).await,
        }
    }

    async fn execute_start(&mut self, job: &Job) {
        let Some(lp) = self.config.loops.get(&job.loop_id).cloned() else {
            let _ = self.store.remove(&job.id).await;
            return;
        };
        let plan = lp.plan();
        let (Some(on), Some(wait)) = (plan.on, plan.wait) else {
            if let Err(e) = self.store.remove_loop(&job.loop_id).await {
                error!(loop_id = %job.loop_id, "failed to clear disabled loop: {e:#}");
            }
            return;
        };

        match self.start_decision(&lp).await {
            StartDecision::Skip(reason) => {
                info!(loop_id = %job.loop_id, %reason, "cycle skipped");
                self.shared
                    .write()
                    .await
                    .record_scheduler(format!("{}: cycle skipped ({reason})", job.loop_id));
                // Same id: the pending row is replaced, not duplicated.
                self.schedule_or_log(Job::new(
                    JobKind::Start,
                    &job.loop_id,
                    now_unix() + wait.as_secs() as i64,
                ))
                .await;
            }
            StartDecision::Run(active) => {
                let channels: Vec<u8> = active.iter().map(|(_, ch)| *ch).collect();
                let result = self.relays.lock().await.set_channels(&channels, true).await;
                if let Err(e) = result {
                    error!(loop_id = %job.loop_id, "failed to start cycle: {e:#}");
                    let mut st = self.shared.write().await;
                    st.record_error(format!("{}: cycle start failed: {e:#}", job.loop_id));
                    drop(st);
                    // Make sure nothing is left half-on, then try again next
                    // cycle.
                    let _ = self.relays.lock().await.set_channels(&channels, false).await;
                    self.schedule_or_log(Job::new(
                        JobKind::Start,
                        &job.loop_id,
                        now_unix() + wait.as_secs() as i64,
                    ))
                    .await;
                    return;
                }

                info!(
                    loop_id = %job.loop_id,
                    on_secs = on.as_secs(),
                    pumps = ?active.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
                    "cycle started"
                );
                {
                    let mut st = self.shared.write().await;
                    for (name, _) in &active {
                        st.record_relay(name, true);
                    }
                    st.record_scheduler(format!(
                        "{}: cycle started for {}s",
                        job.loop_id,
                        on.as_secs()
                    ));
                }

                // Successor first, then retire the executed row.
                self.schedule_or_log(Job::new(
                    JobKind::Stop,
                    &job.loop_id,
                    now_unix() + on.as_secs() as i64,
                ))
                .await;
                if let Err(e) = self.store.remove(&job.id).await {
                    error!(job = %job.id, "failed to retire start job: {e:#}");
                }

                // Failsafe covers every pump the loop owns, gated or not.
                let all_channels: Vec<u8> = self
                    .loop_channels(&lp.pumps)
                    .await
                    .into_iter()
                    .map(|(_, ch)| ch)
                    .collect();
                self.arm_failsafe(&job.loop_id, all_channels, on + FAILSAFE_GRACE);
            }
        }
    }

    async fn execute_stop(&mut self, job: &Job) {
        let Some(lp) = self.config.loops.get(&job.loop_id).cloned() else {
            let _ = self.store.remove(&job.id).await;
            return;
        };

        let named = self.loop_channels(&lp.pumps).await;
        let channels: Vec<u8> = named.iter().map(|(_, ch)| *ch).collect();
        let result = self.relays.lock().await.set_channels(&channels, false).await;
        if let Err(e) = result {
            error!(loop_id = %job.loop_id, "failed to stop cycle, retrying: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("{}: cycle stop failed: {e:#}", job.loop_id));
            // Same id: replace the row with a near-future retry.  The armed
            // failsafe remains the backstop.
            self.schedule_or_log(Job::new(
                JobKind::Stop,
                &job.loop_id,
                now_unix() + STOP_RETRY_SECS,
            ))
            .await;
            return;
        }

        // Pumps are verifiably off; the failsafe for this cycle is moot.
        if let Some(handle) = self.failsafes.remove(&job.loop_id) {
            handle.abort();
        }

        {
            let mut st = self.shared.write().await;
            for (name, _) in &named {
                st.record_relay(name, false);
            }
        }

        if let Err(e) = self.store.remove(&job.id).await {
            error!(job = %job.id, "failed to retire stop job: {e:#}");
        }

        let plan = lp.plan();
        match plan.wait {
            Some(wait) if plan.enabled() => {
                info!(
                    loop_id = %job.loop_id,
                    next_in_secs = wait.as_secs(),
                    "cycle complete"
                );
                self.shared.write().await.record_scheduler(format!(
                    "{}: cycle complete, next start in {}s",
                    job.loop_id,
                    wait.as_secs()
                ));
                self.schedule_or_log(Job::new(
                    JobKind::Start,
                    &job.loop_id,
                    now_unix() + wait.as_secs() as i64,
                ))
                .await;
            }
            _ => {
                if let Err(e) = self.store.remove_loop(&job.loop_id).await {
                    error!(loop_id = %job.loop_id, "failed to clear disabled loop: {e:#}");
                }
            }
        }
    }

    /// Decide what a Start actually actuates.  Cycle loops always run;
    /// nutrient loops consult their sensor, setpoint, and ratio gate.
    async fn start_decision(&self, lp: &LoopEntry) -> StartDecision {
        let Some(ratio) = &lp.ratio else {
            return StartDecision::Run(self.loop_channels(&lp.pumps).await);
        };

        let (Some(sensor_id), Some(setpoint_id)) = (&lp.sensor, &lp.setpoint) else {
            return StartDecision::Skip("nutrient loop missing sensor or setpoint".into());
        };
        let Some(sp) = self.config.setpoints.get(setpoint_id) else {
            return StartDecision::Skip(format!("setpoint '{setpoint_id}' not configured"));
        };

        let poll = Duration::from_secs(self.config.ports.poll_interval_secs);
        let reading = {
            let st = self.shared.read().await;
            st.reading(sensor_id)
        };
        let value = match reading {
            Some((m, age)) if !policy::is_stale(age, poll) => Some(m.primary()),
            Some((_, age)) => {
                warn!(sensor = %sensor_id, age_secs = age.as_secs(), "stale reading treated as absent");
                None
            }
            None => None,
        };

        if !policy::dose_needed(value, sp.target.operational, sp.deadband.operational) {
            return StartDecision::Skip(match value {
                Some(v) => format!(
                    "reading {v:.2} within deadband of target {:.2}",
                    sp.target.operational
                ),
                None => "no usable reading".into(),
            });
        }

        let gates = ratio.operational.gates();
        let active: Vec<(String, u8)> = self
            .loop_channels(&lp.pumps)
            .await
            .into_iter()
            .zip(gates)
            .filter(|(_, gate)| *gate)
            .map(|(pair, _)| pair)
            .collect();
        if active.is_empty() {
            return StartDecision::Skip("ratio activates no pumps".into());
        }
        StartDecision::Run(active)
    }

    // -- Config reload -----------------------------------------------------

    /// Reconcile every loop against the incoming config, then swap it in.
    async fn apply_config(&mut self, new: Config) {
        let removed: Vec<String> = self
            .config
            .loops
            .keys()
            .filter(|id| !new.loops.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            let pumps = self.config.loops[&id].pumps.clone();
            self.disable_loop(&id, &pumps).await;
        }

        let loop_ids: Vec<String> = new.loops.keys().cloned().collect();
        for id in loop_ids {
            let old_plan = self
                .config
                .loops
                .get(&id)
                .map(|lp| lp.plan())
                .unwrap_or(CyclePlan {
                    on: None,
                    wait: None,
                });
            let new_lp = &new.loops[&id];
            match policy::reconcile(old_plan, new_lp.plan()) {
                ReloadAction::Disable => {
                    // Turn off whatever the old definition was driving.
                    let pumps = self
                        .config
                        .loops
                        .get(&id)
                        .map(|lp| lp.pumps.clone())
                        .unwrap_or_else(|| new_lp.pumps.clone());
                    self.disable_loop(&id, &pumps).await;
                }
                ReloadAction::ImmediateRun => {
                    info!(loop_id = %id, "config change requests more output; restarting cycle");
                    if let Err(e) = self.store.remove_loop(&id).await {
                        error!(loop_id = %id, "failed to clear loop jobs: {e:#}");
                    }
                    self.schedule_or_log(Job::new(JobKind::Start, &id, now_unix()))
                        .await;
                    self.shared
                        .write()
                        .await
                        .record_scheduler(format!("{id}: rescheduled immediately after reload"));
                }
                ReloadAction::RescheduleOnly => {
                    // Pending jobs stand; handlers read the new timings from
                    // the swapped-in config at execution time.
                }
            }
        }

        self.config = new;
        self.shared
            .write()
            .await
            .record_system("config reloaded".to_string());
        info!(loops = self.config.loops.len(), "config reloaded");
    }

    async fn disable_loop(&mut self, id: &str, pumps: &[String]) {
        warn!(loop_id = %id, "loop disabled; stopping pumps and clearing jobs");
        if let Err(e) = self.store.remove_loop(id).await {
            error!(loop_id = %id, "failed to clear loop jobs: {e:#}");
        }
        if let Some(handle) = self.failsafes.remove(id) {
            handle.abort();
        }
        let named = self.loop_channels(pumps).await;
        let channels: Vec<u8> = named.iter().map(|(_, ch)| *ch).collect();
        match self.relays.lock().await.set_channels(&channels, false).await {
            Ok(()) => {
                let mut st = self.shared.write().await;
                for (name, _) in &named {
                    st.record_relay(name, false);
                }
                st.record_scheduler(format!("{id}: loop disabled"));
            }
            Err(e) => {
                error!(loop_id = %id, "failed to stop pumps of disabled loop: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("{id}: disable failed: {e:#}"));
            }
        }
    }

    // -- Helpers -----------------------------------------------------------

    async fn loop_channels(&self, pumps: &[String]) -> Vec<(String, u8)> {
        let relays = self.relays.lock().await;
        pumps
            .iter()
            .filter_map(|name| relays.channel_for(name).map(|ch| (name.clone(), ch)))
            .collect()
    }

    async fn schedule_or_log(&self, job: Job) {
        if let Err(e) = self.store.schedule(&job).await {
            error!(job = %job.id, "failed to schedule job: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("scheduling '{}' failed: {e:#}", job.id));
        }
    }

    /// Arm the independent stop timer for a loop, replacing any previous
    /// one.  The timer needs nothing from the store: even with persistence
    /// broken, pumps go off.
    fn arm_failsafe(&mut self, loop_id: &str, channels: Vec<u8>, after: Duration) {
        if let Some(previous) = self.failsafes.remove(loop_id) {
            previous.abort();
        }
        let relays = self.relays.clone();
        let shared = self.shared.clone();
        let id = loop_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!(loop_id = %id, "failsafe deadline reached; forcing pumps off");
            match relays.lock().await.set_channels(&channels, false).await {
                Ok(()) => {
                    shared
                        .write()
                        .await
                        .record_scheduler(format!("{id}: failsafe stop applied"));
                }
                Err(e) => {
                    shared
                        .write()
                        .await
                        .record_error(format!("{id}: failsafe stop failed: {e:#}"));
                }
            }
        });
        self.failsafes.insert(loop_id.to_string(), handle);
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "serial")))]
mod tests {
    use super::*;
    use crate::config::PortSettings;
    use crate::protocol::{self, crc16};
    use crate::sensor::Measurement;
    use crate::state::{self, SystemState};
    use crate::transport::TransportMux;
    use std::time::Instant;

    const RELAY_PORT: &str = "/dev/ttyUSB1";

    const CONFIG: &str = r#"
[ports]
settle_ms = 0
spacing_ms = 0
poll_interval_secs = 60

[[sensors]]
id = "ec-main"
kind = "ec"
port = "/dev/ttyUSB0"
address = 2
baud = 9600

[relay]
port = "/dev/ttyUSB1"
address = 16
baud = 9600

[relay.channels]
sprinkler = 0
pump_a = 1
pump_b = 2
pump_c = 3

[loops.sprinkler]
on_duration = "00:05:00,00:05:00"
wait_duration = "00:30:00,00:30:00"
pumps = ["sprinkler"]

[loops.nutrient]
on_duration = "00:00:45,00:00:45"
wait_duration = "01:00:00,01:00:00"
pumps = ["pump_a", "pump_b", "pump_c"]
ratio = "1:1:0,1:1:0"
sensor = "ec-main"
setpoint = "ec"

[setpoints.ec]
target = "1.2,1.2"
deadband = "0.1,0.1"
min = "0.5,0.5"
max = "3.0,3.0"
"#;

    fn test_config() -> Config {
        let cfg: Config = toml::from_str(CONFIG).unwrap();
        cfg.validate().unwrap();
        cfg
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut raw = body.to_vec();
        let crc = crc16(body);
        raw.push((crc & 0xFF) as u8);
        raw.push((crc >> 8) as u8);
        raw
    }

    fn coil_echo(channel: u16, on: bool) -> Vec<u8> {
        protocol::write_single_coil(0x10, channel, on)
    }

    fn multi_echo(start: u16, count: u16) -> Vec<u8> {
        framed(&[
            0x10,
            0x10,
            (start >> 8) as u8,
            (start & 0xFF) as u8,
            (count >> 8) as u8,
            (count & 0xFF) as u8,
        ])
    }

    async fn test_engine() -> (Engine, Arc<TransportMux>) {
        test_engine_with(test_config()).await
    }

    async fn test_engine_with(config: Config) -> (Engine, Arc<TransportMux>) {
        let store = JobStore::open_memory().await.unwrap();
        test_engine_on(store, config).await
    }

    async fn test_engine_on(store: JobStore, config: Config) -> (Engine, Arc<TransportMux>) {
        let mux = TransportMux::new(PortSettings {
            settle_ms: 0,
            spacing_ms: 0,
            ..PortSettings::default()
        });
        let relays = RelayController::new(mux.clone(), &config.relay);
        let channels: Vec<(String, u8)> = config
            .relay
            .channels
            .iter()
            .map(|(n, &c)| (n.clone(), c))
            .collect();
        let shared = state::shared(SystemState::new(&channels));
        let (_tx, rx) = mpsc::channel(1);
        let engine = Engine::new(store, Arc::new(Mutex::new(relays)), shared, config, rx);
        (engine, mux)
    }

    async fn record_ec(engine: &Engine, ec: f64) {
        engine.shared.write().await.record_measurement(
            "ec-main",
            Measurement::Ec {
                ec,
                resistance: 0.0,
                temperature: 25.0,
                tds: 0.0,
                salinity: 0.0,
                coefficient: 0.0,
            },
        );
    }

    // -- Startup -----------------------------------------------------------

    #[tokio::test]
    async fn startup_schedules_immediate_first_cycles() {
        let (mut engine, _mux) = test_engine().await;
        engine.schedule_startup().await;

        let due = engine.store.due(now_unix()).await.unwrap();
        let loops: Vec<&str> = due.iter().map(|j| j.loop_id.as_str()).collect();
        assert!(loops.contains(&"sprinkler"));
        assert!(loops.contains(&"nutrient"));
        assert!(due.iter().all(|j| j.kind == JobKind::Start));
    }

    #[tokio::test]
    async fn startup_resumes_surviving_jobs_without_duplicating() {
        let (mut engine, _mux) = test_engine().await;
        engine
            .store
            .schedule(&Job::new(JobKind::Stop, "sprinkler", now_unix() + 100))
            .await
            .unwrap();

        engine.schedule_startup().await;

        let sprinkler_jobs: Vec<Job> = engine
            .store
            .all()
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.loop_id == "sprinkler")
            .collect();
        assert_eq!(sprinkler_jobs.len(), 1, "survivor must not be joined by a new start");
        assert_eq!(sprinkler_jobs[0].kind, JobKind::Stop);
    }

    #[tokio::test]
    async fn startup_drops_jobs_of_disabled_loops() {
        let mut config = test_config();
        config.loops.get_mut("sprinkler").unwrap().wait_duration =
            "00:30:00,99:99:99".parse().unwrap();
        let (mut engine, _mux) = test_engine_with(config).await;
        engine
            .store
            .schedule(&Job::new(JobKind::Start, "sprinkler", now_unix()))
            .await
            .unwrap();

        engine.schedule_startup().await;

        assert!(engine
            .store
            .all()
            .await
            .unwrap()
            .iter()
            .all(|j| j.loop_id != "sprinkler"));
    }

    #[tokio::test]
    async fn scheduler_starts_even_with_a_corrupted_store_file() {
        let mut path = std::env::temp_dir();
        path.push(format!("fertigation-sched-corrupt-{}.db", std::process::id()));
        std::fs::write(&path, b"garbage, not sqlite").unwrap();

        let store = JobStore::open(&path).await.unwrap();
        let (mut engine, _mux) = test_engine_on(store, test_config()).await;
        engine.schedule_startup().await;

        assert!(!engine.store.due(now_unix()).await.unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }

    // -- Start execution ---------------------------------------------------

    #[tokio::test]
    async fn start_actuates_and_schedules_stop() {
        let (mut engine, mux) = test_engine().await;
        mux.script_response(RELAY_PORT, coil_echo(0, true));

        let job = Job::new(JobKind::Start, "sprinkler", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        // One ON write for channel 0.
        let sent = mux.sent_frames(RELAY_PORT);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..6], &[0x10, 0x05, 0x00, 0x00, 0xFF, 0x00]);

        // Start row retired, Stop pending at now + 300s.
        let all = engine.store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, JobKind::Stop);
        assert!(all[0].due_unix >= now_unix() + 299);
        // Failsafe armed.
        assert!(engine.failsafes.contains_key("sprinkler"));
    }

    #[tokio::test]
    async fn start_failure_skips_to_next_cycle() {
        let (mut engine, mux) = test_engine().await;
        // No scripted echo: the ON write fails.

        let job = Job::new(JobKind::Start, "sprinkler", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        let all = engine.store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, JobKind::Start, "retry is a future start, not a stop");
        assert!(all[0].due_unix >= now_unix() + 1799);
        assert!(mux.sent_frames(RELAY_PORT).len() >= 1);
    }

    // -- Stop execution ----------------------------------------------------

    #[tokio::test]
    async fn stop_actuates_and_chains_next_start() {
        let (mut engine, mux) = test_engine().await;
        mux.script_response(RELAY_PORT, coil_echo(0, false));

        let job = Job::new(JobKind::Stop, "sprinkler", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        let sent = mux.sent_frames(RELAY_PORT);
        assert_eq!(&sent[0][..6], &[0x10, 0x05, 0x00, 0x00, 0x00, 0x00]);

        let all = engine.store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, JobKind::Start);
        assert!(all[0].due_unix >= now_unix() + 1799, "next start after wait_duration");
    }

    #[tokio::test]
    async fn stop_failure_retries_instead_of_chaining() {
        let (mut engine, _mux) = test_engine().await;
        // No scripted echo: the OFF write fails.

        let job = Job::new(JobKind::Stop, "sprinkler", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        let all = engine.store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, JobKind::Stop, "failed stop must be retried");
        assert!(all[0].due_unix <= now_unix() + STOP_RETRY_SECS);
    }

    // -- Nutrient dosing ---------------------------------------------------

    #[tokio::test]
    async fn nutrient_doses_below_threshold_with_gated_pumps() {
        let (mut engine, mux) = test_engine().await;
        record_ec(&engine, 0.8).await; // below 1.2 - 0.1
        mux.script_response(RELAY_PORT, multi_echo(1, 2));

        let job = Job::new(JobKind::Start, "nutrient", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        // Ratio 1:1:0 gates pump_a and pump_b (channels 1, 2); pump_c stays off.
        let sent = mux.sent_frames(RELAY_PORT);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..6], &[0x10, 0x10, 0x00, 0x01, 0x00, 0x02]);

        let all = engine.store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, JobKind::Stop);
    }

    #[tokio::test]
    async fn nutrient_at_threshold_skips() {
        let (mut engine, mux) = test_engine().await;
        record_ec(&engine, 1.1).await; // exactly target - deadband

        let job = Job::new(JobKind::Start, "nutrient", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        assert!(mux.sent_frames(RELAY_PORT).is_empty(), "no actuation at threshold");
        let all = engine.store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, JobKind::Start, "chain continues with a future start");
    }

    #[tokio::test]
    async fn nutrient_without_reading_never_doses() {
        let (mut engine, mux) = test_engine().await;

        let job = Job::new(JobKind::Start, "nutrient", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        assert!(mux.sent_frames(RELAY_PORT).is_empty());
        assert_eq!(engine.store.all().await.unwrap()[0].kind, JobKind::Start);
    }

    #[tokio::test]
    async fn nutrient_with_stale_reading_never_doses() {
        let mut config = test_config();
        config.ports.poll_interval_secs = 1; // staleness threshold: 3s
        let (mut engine, mux) = test_engine_with(config).await;
        record_ec(&engine, 0.8).await;
        {
            let mut st = engine.shared.write().await;
            let sensor = st.sensors.get_mut("ec-main").unwrap();
            sensor.taken_at = Instant::now() - Duration::from_secs(10);
        }

        let job = Job::new(JobKind::Start, "nutrient", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        assert!(mux.sent_frames(RELAY_PORT).is_empty());
    }

    #[tokio::test]
    async fn all_zero_ratio_skips() {
        let mut config = test_config();
        config.loops.get_mut("nutrient").unwrap().ratio = Some("0:0:0,0:0:0".parse().unwrap());
        let (mut engine, mux) = test_engine_with(config).await;
        record_ec(&engine, 0.8).await;

        let job = Job::new(JobKind::Start, "nutrient", now_unix());
        engine.store.schedule(&job).await.unwrap();
        engine.execute_job(&job).await;

        assert!(mux.sent_frames(RELAY_PORT).is_empty());
    }

    // -- Failsafe ----------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failsafe_forces_pumps_off() {
        let (mut engine, mux) = test_engine().await;
        mux.script_response(RELAY_PORT, coil_echo(0, false));

        engine.arm_failsafe("sprinkler", vec![0], Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;

        let sent = mux.sent_frames(RELAY_PORT);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..6], &[0x10, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rearming_aborts_the_previous_failsafe() {
        let (mut engine, mux) = test_engine().await;
        mux.script_response(RELAY_PORT, coil_echo(0, false));

        engine.arm_failsafe("sprinkler", vec![0], Duration::from_millis(20));
        engine.arm_failsafe("sprinkler", vec![0], Duration::from_millis(60));
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Only the second timer fired.
        assert_eq!(mux.sent_frames(RELAY_PORT).len(), 1);
    }

    // -- Config reload -----------------------------------------------------

    #[tokio::test]
    async fn reload_disable_clears_jobs_and_stops_pumps() {
        let (mut engine, mux) = test_engine().await;
        mux.script_response(RELAY_PORT, coil_echo(0, false));
        engine
            .store
            .schedule(&Job::new(JobKind::Stop, "sprinkler", now_unix() + 100))
            .await
            .unwrap();

        let mut new = test_config();
        new.loops.get_mut("sprinkler").unwrap().on_duration = "00:05:00,99:99:99".parse().unwrap();
        engine.apply_config(new).await;

        assert!(engine
            .store
            .all()
            .await
            .unwrap()
            .iter()
            .all(|j| j.loop_id != "sprinkler"));
        let sent = mux.sent_frames(RELAY_PORT);
        assert_eq!(&sent[0][..6], &[0x10, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn reload_on_increase_restarts_immediately() {
        let (mut engine, _mux) = test_engine().await;
        engine
            .store
            .schedule(&Job::new(JobKind::Start, "sprinkler", now_unix() + 1000))
            .await
            .unwrap();

        let mut new = test_config();
        new.loops.get_mut("sprinkler").unwrap().on_duration = "00:05:00,00:10:00".parse().unwrap();
        engine.apply_config(new).await;

        let jobs: Vec<Job> = engine
            .store
            .all()
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.loop_id == "sprinkler")
            .collect();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Start);
        assert!(jobs[0].due_unix <= now_unix(), "restart is immediate");
    }

    #[tokio::test]
    async fn reload_wait_decrease_restarts_immediately() {
        let (mut engine, _mux) = test_engine().await;

        let mut new = test_config();
        new.loops.get_mut("sprinkler").unwrap().wait_duration = "00:30:00,00:15:00".parse().unwrap();
        engine.apply_config(new).await;

        let jobs = engine.store.due(now_unix()).await.unwrap();
        assert!(jobs.iter().any(|j| j.loop_id == "sprinkler" && j.kind == JobKind::Start));
    }

    #[tokio::test]
    async fn reload_on_decrease_keeps_pending_jobs() {
        let (mut engine, mux) = test_engine().await;
        let pending = Job::new(JobKind::Stop, "sprinkler", now_unix() + 100);
        engine.store.schedule(&pending).await.unwrap();

        let mut new = test_config();
        new.loops.get_mut("sprinkler").unwrap().on_duration = "00:05:00,00:02:00".parse().unwrap();
        engine.apply_config(new).await;

        let all = engine.store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], pending, "pending job untouched");
        assert!(mux.sent_frames(RELAY_PORT).is_empty());
    }
}
