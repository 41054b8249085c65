//! Minute-resolution cron scheduling for services that declare a `schedule`.
//!
//! One timing task sleeps to each wall-clock minute boundary and fires every
//! binding whose expression matches that minute. A firing that finds its
//! instance still running is skipped, with a notice appended to the
//! instance's stderr stream.

use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, Timelike as _};
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::sm::asyncutil::TaskTracker;
use crate::sm::events::sm_event;
use crate::sm::service::ServiceInstance;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept standard 5-field cron ("m h dom mon dow") by prepending seconds=0.
/// Expressions that already carry 6+ fields pass through unchanged.
pub fn normalize_cron_expr(expr: &str) -> String {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&normalize_cron_expr(expr))
}

struct Entry {
    schedule: Schedule,
    expr: String,
    instance: Arc<ServiceInstance>,
}

pub struct CronScheduler {
    entries: Mutex<HashMap<String, Entry>>,
    stop: CancellationToken,
    firings: TaskTracker,
}

impl CronScheduler {
    pub fn new() -> Arc<Self> {
        let scheduler = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
            firings: TaskTracker::new(),
        });
        Self::spawn_timing_task(&scheduler);
        scheduler
    }

    pub fn bind(
        &self,
        name: &str,
        expr: &str,
        instance: Arc<ServiceInstance>,
    ) -> anyhow::Result<()> {
        let schedule = parse_schedule(expr)
            .map_err(|e| anyhow::anyhow!("failed to parse cron schedule {expr:?}: {e}"))?;
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            name.to_string(),
            Entry {
                schedule,
                expr: expr.to_string(),
                instance,
            },
        );
        Ok(())
    }

    /// Idempotent: unbinding an unknown name is a no-op.
    pub fn unbind(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(name);
    }

    pub fn next_run_time(&self, name: &str) -> Option<DateTime<Local>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(name)?.schedule.upcoming(Local).next()
    }

    /// Cancel the timing task and drain in-flight firings.
    pub async fn stop(&self) {
        self.stop.cancel();
        if !self.firings.wait_idle(DRAIN_TIMEOUT).await {
            sm_event(
                "schedule",
                None,
                format!(
                    "in-flight scheduled runs did not drain active={}",
                    self.firings.active_count()
                ),
            );
        }
    }

    fn spawn_timing_task(scheduler: &Arc<Self>) {
        let scheduler = Arc::clone(scheduler);
        tokio::spawn(async move {
            // Avoid double-firing if we ever wake twice within one minute.
            let mut last_fired_minute = Local::now().timestamp() / 60;
            loop {
                let now_ms = Local::now().timestamp_millis();
                let next_minute_ms = (now_ms / 60_000 + 1) * 60_000;
                let sleep_ms = (next_minute_ms - now_ms).clamp(1, 60_000) as u64;

                tokio::select! {
                    _ = scheduler.stop.cancelled() => {
                        sm_event("schedule", None, "exit reason=stopped");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                }

                let now = Local::now();
                let minute_key = now.timestamp() / 60;
                if minute_key == last_fired_minute {
                    continue;
                }
                last_fired_minute = minute_key;
                scheduler.fire_due(truncate_to_minute(now));
            }
        });
    }

    /// Run every binding whose schedule matches `target` (a minute boundary).
    pub(crate) fn fire_due(&self, target: DateTime<Local>) {
        let due: Vec<(String, Arc<ServiceInstance>, String)> = {
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries
                .iter()
                .filter(|(_, e)| occurs_at(&e.schedule, target))
                .map(|(name, e)| (name.clone(), Arc::clone(&e.instance), e.expr.clone()))
                .collect()
        };

        for (name, instance, expr) in due {
            if instance.is_running() {
                sm_event(
                    "schedule",
                    Some(&name),
                    format!("skip schedule={expr:?} reason=still_running"),
                );
                instance
                    .write_stderr_event("scheduled run skipped: previous instance still running");
                continue;
            }

            sm_event("schedule", Some(&name), format!("due schedule={expr:?}"));
            self.firings.spawn(async move {
                if let Err(e) = instance.start().await {
                    sm_event(
                        "schedule",
                        Some(&name),
                        format!("scheduled start failed err={e}"),
                    );
                }
            });
        }
    }
}

fn truncate_to_minute(t: DateTime<Local>) -> DateTime<Local> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn occurs_at(schedule: &Schedule, target: DateTime<Local>) -> bool {
    let prev = target - chrono::Duration::seconds(1);
    schedule
        .after(&prev)
        .next()
        .map(|dt| dt == target)
        .unwrap_or(false)
}
