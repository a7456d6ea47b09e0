//! Shared fixtures for engine tests: a scriptable gateway, a recording
//! notifier, and a harness wiring the whole engine onto an in-memory
//! database with a manual clock.

use crate::{AbuseBreaker, Dispatcher, EngineConfig, JobCoordinator, RecoverySweeper};
use async_trait::async_trait;
use courier_database::{
    queries, AsyncDatabase, DatabaseError, Job, JobCounters, NewChannel, NewEntry, NewJob,
};
use courier_gateway::{
    Alert, Clock, GatewayResult, ManualClock, Notifier, OutboundMessage, SendGateway, SendOutcome,
};
use courier_rate::{RateConfig, RateController};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Gateway stub. Unscripted entries are delivered with a deterministic
/// provider id (`ext-<entry id>`); scripted outcomes are consumed in
/// order, after which the entry delivers normally.
pub(crate) struct MockGateway {
    scripted: Mutex<HashMap<String, VecDeque<SendOutcome>>>,
    calls: Mutex<Vec<String>>,
    call_times: Mutex<Vec<Instant>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            call_times: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, entry_id: &str, outcomes: Vec<SendOutcome>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(entry_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, entry_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == entry_id)
            .count()
    }

    /// Wall-clock instants of every send, in call order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl SendGateway for MockGateway {
    async fn send(&self, message: OutboundMessage<'_>) -> GatewayResult<SendOutcome> {
        self.calls.lock().unwrap().push(message.entry_id.to_string());
        self.call_times.lock().unwrap().push(Instant::now());
        if let Some(queue) = self.scripted.lock().unwrap().get_mut(message.entry_id) {
            if let Some(outcome) = queue.pop_front() {
                return Ok(outcome);
            }
        }
        Ok(SendOutcome::Delivered {
            external_message_id: format!("ext-{}", message.entry_id),
        })
    }
}

/// Notifier that records alerts instead of delivering them.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// Fully wired engine on an in-memory database.
pub(crate) struct Harness {
    pub db: AsyncDatabase,
    pub gateway: Arc<MockGateway>,
    pub rates: Arc<RateController>,
    pub breaker: Arc<AbuseBreaker>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: EngineConfig,
}

pub(crate) async fn harness(config: EngineConfig) -> Harness {
    let db = AsyncDatabase::open_in_memory().await.unwrap();
    let gateway = Arc::new(MockGateway::new());
    let rates = Arc::new(RateController::new(RateConfig::default()));
    let breaker = Arc::new(AbuseBreaker::new(
        config.abuse_window_secs,
        config.abuse_threshold,
    ));
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        gateway.clone(),
        rates.clone(),
        breaker.clone(),
        notifier.clone(),
        clock.clone(),
        config.clone(),
    ));

    Harness {
        db,
        gateway,
        rates,
        breaker,
        notifier,
        clock,
        dispatcher,
        config,
    }
}

impl Harness {
    /// Insert the shared test channel (rate 1000 so batch pacing stays
    /// negligible) plus a released job with `per_group` entries per
    /// group. Entry ids follow `e-<group>-<i>`.
    pub async fn seed(&self, job_id: &str, groups: &[&str], per_group: usize) -> Job {
        let channel = self
            .db
            .call(|conn| {
                if let Some(channel) = queries::get_channel(conn, "ch-1")? {
                    return Ok(channel);
                }
                queries::insert_channel(
                    conn,
                    &NewChannel {
                        id: "ch-1".to_string(),
                        label: "test channel".to_string(),
                        current_rate: 1000,
                    },
                )
            })
            .await
            .unwrap();

        let job_id_owned = job_id.to_string();
        let groups_owned: Vec<String> = groups.iter().map(|s| s.to_string()).collect();
        let job = self
            .db
            .call(move |conn| {
                let mut entries = Vec::new();
                for group in &groups_owned {
                    for i in 0..per_group {
                        entries.push(NewEntry {
                            id: format!("e-{}-{}", group, i),
                            group_id: group.clone(),
                            recipient: format!("+1555{:07}", i),
                            payload: serde_json::json!({ "body": "hello" }),
                        });
                    }
                }
                queries::insert_job(
                    conn,
                    &NewJob {
                        id: job_id_owned.clone(),
                        channel_id: "ch-1".to_string(),
                        template_groups: groups_owned.clone(),
                    },
                    &entries,
                )?;
                queries::release_entries(conn, &job_id_owned)?;
                queries::get_job(conn, &job_id_owned)?
                    .ok_or_else(|| DatabaseError::NotFound("job".to_string()))
            })
            .await
            .unwrap();

        self.rates.touch_channel(&channel, self.clock.now());
        job
    }

    pub async fn job(&self, job_id: &str) -> Job {
        let job_id = job_id.to_string();
        self.db
            .call(move |conn| queries::get_job(conn, &job_id))
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn counters(&self, job_id: &str) -> JobCounters {
        let job_id = job_id.to_string();
        self.db
            .call(move |conn| queries::job_counters(conn, &job_id))
            .await
            .unwrap()
    }

    pub fn coordinator(&self) -> JobCoordinator {
        JobCoordinator::new(
            self.db.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.rates),
            Arc::clone(&self.breaker),
            self.clock.clone() as Arc<dyn Clock>,
            self.config.clone(),
        )
    }

    pub fn sweeper(&self) -> RecoverySweeper {
        RecoverySweeper::new(
            self.db.clone(),
            self.clock.clone() as Arc<dyn Clock>,
            self.config.clone(),
        )
    }
}
