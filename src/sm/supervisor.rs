//! Drives the live process set toward the desired state emitted by the
//! config store, and owns the cron scheduler and the failure notifier.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};

use crate::sm::asyncutil::TaskTracker;
use crate::sm::config::{ConfigListener, GlobalSettings, ServiceSpec};
use crate::sm::events::sm_event;
use crate::sm::scheduler::CronScheduler;
use crate::sm::service::{RESTART_DELAY, ServiceInstance, ServiceStatus};
use crate::sm::webhook::{FailurePayload, Notifier};

const SHUTDOWN_WEBHOOK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("service {0} not found")]
    NotFound(String),
    #[error("service {0} is scheduled; restart is not supported")]
    RestartScheduled(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct Inner {
    instances: HashMap<String, Arc<ServiceInstance>>,
    /// Mirrors the document order of the desired state.
    order: Vec<String>,
    /// Per-service webhook suppression; cleared only by a zero exit.
    notified: HashSet<String>,
}

pub struct Supervisor {
    self_ref: Weak<Supervisor>,
    settings: GlobalSettings,
    inner: RwLock<Inner>,
    scheduler: Arc<CronScheduler>,
    notifier: Arc<Notifier>,
    notifications: TaskTracker,
    stopped: AtomicBool,
    logs_dir: PathBuf,
    restart_delay: Duration,
}

impl Supervisor {
    /// Must be called from within a tokio runtime: the scheduler's timing
    /// task starts with the supervisor.
    pub fn new(settings: GlobalSettings) -> Arc<Self> {
        Self::with_logs_dir(settings, PathBuf::from("logs"))
    }

    pub fn with_logs_dir(settings: GlobalSettings, logs_dir: PathBuf) -> Arc<Self> {
        Self::with_settings(settings, logs_dir, RESTART_DELAY)
    }

    pub(crate) fn with_settings(
        settings: GlobalSettings,
        logs_dir: PathBuf,
        restart_delay: Duration,
    ) -> Arc<Self> {
        let notifier = Arc::new(Notifier::new(settings.failure_webhook_url.clone()));
        Arc::new_cyclic(|weak| Supervisor {
            self_ref: weak.clone(),
            settings,
            inner: RwLock::new(Inner {
                instances: HashMap::new(),
                order: Vec::new(),
                notified: HashSet::new(),
            }),
            scheduler: CronScheduler::new(),
            notifier,
            notifications: TaskTracker::new(),
            stopped: AtomicBool::new(false),
            logs_dir,
            restart_delay,
        })
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn next_run_time(&self, name: &str) -> Option<DateTime<Local>> {
        self.scheduler.next_run_time(name)
    }

    pub fn status_of(&self, name: &str) -> Result<ServiceStatus, ControlError> {
        Ok(self.get_instance(name)?.status())
    }

    /// All statuses in document order.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner
            .order
            .iter()
            .filter_map(|name| inner.instances.get(name))
            .map(|inst| inst.status())
            .collect()
    }

    pub fn get_instance(&self, name: &str) -> Result<Arc<ServiceInstance>, ControlError> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(name.to_string()))
    }

    /// Runtime start. A previously stopped instance is replaced with a fresh
    /// one first; a stopped instance can never run again by design.
    pub async fn start_service(&self, name: &str) -> Result<(), ControlError> {
        let mut inst = self.get_instance(name)?;
        if inst.stop_requested() && !inst.is_running() {
            inst = self.replace_instance(name)?;
        }
        inst.start().await.map_err(ControlError::Other)
    }

    pub async fn stop_service(&self, name: &str) -> Result<(), ControlError> {
        let inst = self.get_instance(name)?;
        inst.stop().await.map_err(ControlError::Other)
    }

    /// Restart = stop, brief settle, then run a *fresh* instance. Reusing the
    /// old instance and re-arming its stop flag is the double-start race this
    /// design rules out.
    pub async fn restart_service(&self, name: &str) -> Result<(), ControlError> {
        let inst = self.get_instance(name)?;
        if inst.spec().is_scheduled() {
            return Err(ControlError::RestartScheduled(name.to_string()));
        }
        inst.stop().await.map_err(ControlError::Other)?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let fresh = self.replace_instance(name)?;
        fresh.start().await.map_err(ControlError::Other)
    }

    /// Stop everything: scheduler first (draining in-flight firings), then
    /// each instance, then a bounded wait for pending webhook sends.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        sm_event("shutdown", None, "stopping scheduler and services");
        self.scheduler.stop().await;

        let instances: Vec<Arc<ServiceInstance>> = {
            let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
            inner.instances.values().cloned().collect()
        };
        for inst in instances {
            if let Err(e) = inst.stop().await {
                sm_event("shutdown", Some(inst.name()), format!("stop failed err={e}"));
            }
        }

        if !self.notifications.wait_idle(SHUTDOWN_WEBHOOK_WAIT).await {
            sm_event(
                "shutdown",
                None,
                format!(
                    "timed out waiting for pending webhooks active={}",
                    self.notifications.active_count()
                ),
            );
        }
        sm_event("shutdown", None, "complete");
    }

    fn create_instance(&self, spec: ServiceSpec) -> Arc<ServiceInstance> {
        let inst =
            ServiceInstance::with_settings(spec, self.logs_dir.clone(), self.restart_delay);
        let weak = self.self_ref.clone();
        inst.set_exit_callback(Arc::new(move |name, consecutive, exit_code, err| {
            if let Some(sup) = weak.upgrade() {
                sup.handle_service_exit(name, consecutive, exit_code, err);
            }
        }));
        inst
    }

    /// Build a fresh instance (fresh stop token) for `name` from its current
    /// spec, swap it into the map, and rebind the scheduler if needed.
    fn replace_instance(&self, name: &str) -> Result<Arc<ServiceInstance>, ControlError> {
        let spec = self.get_instance(name)?.spec();
        let fresh = self.create_instance(spec.clone());
        {
            let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
            inner.instances.insert(name.to_string(), Arc::clone(&fresh));
        }
        if spec.is_scheduled() && spec.is_enabled() {
            if let Some(expr) = spec.schedule.as_deref() {
                if let Err(e) = self.scheduler.bind(name, expr, Arc::clone(&fresh)) {
                    sm_event("supervisor", Some(name), format!("failed to reschedule err={e}"));
                }
            }
        }
        Ok(fresh)
    }

    /// Invoked by every instance on every exit. Exit 0 lifts webhook
    /// suppression; a run of failures at or past the threshold notifies once.
    fn handle_service_exit(
        &self,
        name: &str,
        consecutive_failures: u32,
        exit_code: i32,
        err: Option<String>,
    ) {
        {
            let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
            if exit_code == 0 {
                inner.notified.remove(name);
                return;
            }
            if consecutive_failures < self.settings.failure_retries {
                return;
            }
            if !inner.notified.insert(name.to_string()) {
                return;
            }
        }

        let payload = FailurePayload {
            service_name: name.to_string(),
            timestamp: Utc::now(),
            failure_count: consecutive_failures,
            last_exit_code: exit_code,
            error_message: err.unwrap_or_default(),
            consecutive_errors: consecutive_failures,
        };
        let notifier = Arc::clone(&self.notifier);
        let service = name.to_string();
        self.notifications.spawn(async move {
            if let Err(e) = notifier.notify_failure(payload).await {
                sm_event("webhook", Some(&service), format!("send failed err={e}"));
            }
        });
    }

    async fn reconcile(&self, services: Vec<ServiceSpec>, to_evict: Vec<String>) {
        sm_event(
            "supervisor",
            None,
            format!("reconcile services={} to_evict={to_evict:?}", services.len()),
        );
        let new_names: HashSet<String> = services.iter().map(|s| s.name.clone()).collect();

        // Evictions named by the store, plus anything live that fell out of
        // the desired state entirely.
        let victims: Vec<String> = {
            let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
            let mut victims: Vec<String> = to_evict
                .iter()
                .filter(|n| inner.instances.contains_key(*n))
                .cloned()
                .collect();
            for name in inner.instances.keys() {
                if !new_names.contains(name) && !victims.contains(name) {
                    victims.push(name.clone());
                }
            }
            victims
        };

        for name in victims {
            let inst = {
                let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
                inner.instances.get(&name).cloned()
            };
            let Some(inst) = inst else { continue };
            sm_event("supervisor", Some(&name), "evicting");
            // Unbind before stopping so no firing can hit a dying instance.
            self.scheduler.unbind(&name);
            // stop() on a not-running instance still cancels its stop token,
            // which is what aborts a restart pending in the backoff window.
            if let Err(e) = inst.stop().await {
                sm_event("supervisor", Some(&name), format!("stop failed err={e}"));
            }
            let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
            inner.instances.remove(&name);
            if !new_names.contains(&name) {
                inner.notified.remove(&name);
            }
        }

        let mut created = 0usize;
        for spec in &services {
            let existing = {
                let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
                inner.instances.get(&spec.name).cloned()
            };
            if let Some(inst) = existing {
                // Unchanged (or non-materially changed) service: refresh the
                // spec reference only. Material changes arrived as evictions.
                inst.update_spec(spec.clone());
                continue;
            }

            created += 1;
            let inst = self.create_instance(spec.clone());
            {
                let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
                inner.instances.insert(spec.name.clone(), Arc::clone(&inst));
            }

            if !spec.is_enabled() {
                continue;
            }
            if spec.is_scheduled() {
                let expr = spec.schedule.as_deref().unwrap_or_default();
                match self.scheduler.bind(&spec.name, expr, Arc::clone(&inst)) {
                    Ok(()) => sm_event(
                        "supervisor",
                        Some(&spec.name),
                        format!("scheduled schedule={expr:?}"),
                    ),
                    Err(e) => sm_event(
                        "supervisor",
                        Some(&spec.name),
                        format!("failed to schedule err={e}"),
                    ),
                }
            } else if let Err(e) = inst.start().await {
                sm_event("supervisor", Some(&spec.name), format!("failed to start err={e}"));
            }
        }

        {
            let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
            inner.order = services.iter().map(|s| s.name.clone()).collect();
        }
        let total = {
            let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
            inner.instances.len()
        };
        sm_event(
            "supervisor",
            None,
            format!("reconcile complete created={created} total={total}"),
        );
    }
}

#[async_trait]
impl ConfigListener for Supervisor {
    async fn on_services_updated(&self, services: Vec<ServiceSpec>, to_evict: Vec<String>) {
        self.reconcile(services, to_evict).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn spec(name: &str, command: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            command: command.to_string(),
            workdir: None,
            env: BTreeMap::new(),
            enabled: None,
            schedule: None,
        }
    }

    fn test_supervisor(dir: &std::path::Path) -> Arc<Supervisor> {
        Supervisor::with_settings(
            GlobalSettings::default(),
            dir.to_path_buf(),
            Duration::from_millis(300),
        )
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if cond() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reconcile_creates_starts_and_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path());

        sup.on_services_updated(vec![spec("a", "sleep 30")], vec![]).await;
        let inst = sup.get_instance("a").unwrap();
        assert!(wait_until(|| inst.is_running(), Duration::from_secs(5)).await);
        assert_eq!(sup.statuses().len(), 1);

        sup.on_services_updated(vec![], vec!["a".to_string()]).await;
        assert!(matches!(sup.get_instance("a"), Err(ControlError::NotFound(_))));
        assert!(!inst.is_running());
        assert!(inst.stop_requested());

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn enabled_flip_recreates_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path());

        sup.on_services_updated(vec![spec("a", "sleep 30")], vec![]).await;
        let old = sup.get_instance("a").unwrap();
        assert!(wait_until(|| old.is_running(), Duration::from_secs(5)).await);

        let mut disabled = spec("a", "sleep 30");
        disabled.enabled = Some(false);
        sup.on_services_updated(vec![disabled], vec!["a".to_string()]).await;

        let fresh = sup.get_instance("a").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!old.is_running());
        assert!(old.stop_requested());
        assert!(!fresh.is_running());
        assert!(!fresh.stop_requested());

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disable_during_backoff_aborts_the_pending_restart() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path());

        sup.on_services_updated(vec![spec("flappy", "sh -c 'exit 3'")], vec![]).await;
        let old = sup.get_instance("flappy").unwrap();

        // First crash recorded; the instance now sits in its backoff window.
        assert!(
            wait_until(|| old.status().last_run_time.is_some(), Duration::from_secs(5)).await
        );

        let mut disabled = spec("flappy", "sh -c 'exit 3'");
        disabled.enabled = Some(false);
        sup.on_services_updated(vec![disabled], vec!["flappy".to_string()]).await;

        let fresh = sup.get_instance("flappy").unwrap();
        assert!(old.stop_requested());
        let restarts_at_evict = old.status().restarts;

        // Well past the backoff delay: zero additional crash-restart cycles.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(old.status().restarts, restarts_at_evict);
        assert!(!old.is_running());
        assert!(!fresh.is_running());

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn webhook_suppression_fires_once_until_a_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path());

        // Below threshold: nothing.
        sup.handle_service_exit("x", 1, 9, None);
        sup.handle_service_exit("x", 2, 9, None);
        assert_eq!(sup.notifications.total_spawned(), 0);

        // Threshold crossed: one send, then suppressed.
        sup.handle_service_exit("x", 3, 9, Some("boom".to_string()));
        assert_eq!(sup.notifications.total_spawned(), 1);
        sup.handle_service_exit("x", 4, 9, None);
        sup.handle_service_exit("x", 5, 9, None);
        assert_eq!(sup.notifications.total_spawned(), 1);

        // Clean exit clears the flag; next run of failures notifies again.
        sup.handle_service_exit("x", 0, 0, None);
        sup.handle_service_exit("x", 3, 7, None);
        assert_eq!(sup.notifications.total_spawned(), 2);

        // Independent per service.
        sup.handle_service_exit("y", 3, 1, None);
        assert_eq!(sup.notifications.total_spawned(), 3);

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_recreates_the_instance_and_rejects_scheduled() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path());

        let mut cron_spec = spec("job", "sh -c 'echo hi'");
        cron_spec.schedule = Some("* * * * *".to_string());
        sup.on_services_updated(vec![spec("a", "sleep 30"), cron_spec], vec![]).await;

        assert!(matches!(
            sup.restart_service("job").await,
            Err(ControlError::RestartScheduled(_))
        ));
        assert!(matches!(
            sup.restart_service("ghost").await,
            Err(ControlError::NotFound(_))
        ));

        let old = sup.get_instance("a").unwrap();
        assert!(wait_until(|| old.is_running(), Duration::from_secs(5)).await);
        sup.restart_service("a").await.unwrap();
        let fresh = sup.get_instance("a").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.is_running());
        assert_eq!(fresh.status().restarts, 0);

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn manual_start_after_stop_replaces_the_stopped_instance() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path());

        sup.on_services_updated(vec![spec("a", "sleep 30")], vec![]).await;
        let old = sup.get_instance("a").unwrap();
        assert!(wait_until(|| old.is_running(), Duration::from_secs(5)).await);

        sup.stop_service("a").await.unwrap();
        assert!(!old.is_running());

        sup.start_service("a").await.unwrap();
        let fresh = sup.get_instance("a").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.is_running());

        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_is_idempotent_and_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path());

        sup.on_services_updated(vec![spec("a", "sleep 30")], vec![]).await;
        let inst = sup.get_instance("a").unwrap();
        assert!(wait_until(|| inst.is_running(), Duration::from_secs(5)).await);

        sup.shutdown().await;
        assert!(!inst.is_running());
        sup.shutdown().await;
    }

    // Everything below wires a real ConfigStore to the supervisor, the same
    // paths the HTTP surface and external editors drive.

    use crate::sm::config::ConfigStore;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    #[cfg(unix)]
    #[tokio::test]
    async fn external_edit_is_picked_up_by_the_poller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        fs::write(&path, "services: []\n").unwrap();

        let store = Arc::new(ConfigStore::with_intervals(
            &path,
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        let sup = test_supervisor(dir.path());
        Arc::clone(&store)
            .start_watcher(Arc::clone(&sup) as Arc<dyn ConfigListener>)
            .unwrap();

        // Let the initial snapshot settle past filesystem mtime granularity,
        // then edit the document out from under the daemon.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        fs::write(&path, "services:\n  - name: x\n    command: sleep 30\n").unwrap();

        assert!(
            wait_until(
                || sup.get_instance("x").map(|i| i.is_running()).unwrap_or(false),
                Duration::from_secs(5)
            )
            .await,
            "externally added service never started"
        );

        store.stop();
        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disabling_via_the_store_reaches_a_backing_off_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        fs::write(
            &path,
            "services:\n  - name: flappy\n    command: sh -c 'exit 3'\n",
        )
        .unwrap();

        // Quiet ticker: only the mutation-triggered reload path is in play.
        let store = Arc::new(ConfigStore::with_intervals(
            &path,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ));
        let sup = Supervisor::with_settings(
            GlobalSettings::default(),
            dir.path().join("logs"),
            Duration::from_secs(2),
        );
        Arc::clone(&store)
            .start_watcher(Arc::clone(&sup) as Arc<dyn ConfigListener>)
            .unwrap();

        // First crash recorded; the instance is inside its 2 s backoff.
        assert!(
            wait_until(
                || {
                    sup.get_instance("flappy")
                        .map(|i| i.status().last_run_time.is_some())
                        .unwrap_or(false)
                },
                Duration::from_secs(5)
            )
            .await
        );
        let old = sup.get_instance("flappy").unwrap();

        store.set_enabled("flappy", false).unwrap();
        assert!(
            wait_until(|| old.stop_requested(), Duration::from_millis(2500)).await,
            "eviction did not reach the backing-off instance in time"
        );
        let restarts_at_evict = old.status().restarts;

        // Past the backoff deadline: no further child may have been spawned.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(old.status().restarts, restarts_at_evict);
        assert!(!old.is_running());
        assert!(!sup.get_instance("flappy").unwrap().is_running());

        store.stop();
        sup.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn repeated_crashes_post_the_webhook_exactly_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let server_hits = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let hits = Arc::clone(&server_hits);
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 8192];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let settings = GlobalSettings {
            failure_webhook_url: Some(format!("http://{addr}/hook")),
            ..GlobalSettings::default()
        };
        let sup = Supervisor::with_settings(
            settings,
            dir.path().to_path_buf(),
            Duration::from_millis(50),
        );

        sup.on_services_updated(vec![spec("flappy", "sh -c 'exit 1'")], vec![]).await;

        // Three consecutive failures cross the default threshold.
        assert!(
            wait_until(|| hits.load(Ordering::SeqCst) >= 1, Duration::from_secs(10)).await,
            "webhook never fired"
        );
        // Further crashes stay suppressed.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sup.shutdown().await;
    }
}
