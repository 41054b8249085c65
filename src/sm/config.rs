//! The services.yaml store: the single source of truth for desired state.
//!
//! Mutation APIs never touch the committed in-memory snapshot. They validate
//! against it, persist an edited copy of the document, and wake the reload
//! path. Only the reload path diffs disk against the committed snapshot and
//! installs a new one, so API edits and external edits surface to the
//! listener through the same code path.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc as tokio_mpsc;
use tokio_util::sync::CancellationToken;

use crate::sm::events::sm_event;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_RELOAD_COOLDOWN: Duration = Duration::from_secs(2);

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4321
}
fn default_failure_retries() -> u32 {
    3
}

/// Top-level daemon settings, stored inline at the root of services.yaml.
/// Loaded once at startup; not editable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_webhook_url: Option<String>,
    /// Consecutive failures before the webhook fires.
    #[serde(default = "default_failure_retries")]
    pub failure_retries: u32,
    /// BasicAuth credentials, either "user:password" or a bare password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            failure_webhook_url: None,
            failure_retries: default_failure_retries(),
            authorization: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: Option<String>,
    pub password: String,
}

impl GlobalSettings {
    pub fn basic_auth(&self) -> Option<BasicAuth> {
        let raw = self.authorization.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once(':') {
            Some((user, pass)) => Some(BasicAuth {
                username: Some(user.to_string()),
                password: pass.to_string(),
            }),
            None => Some(BasicAuth {
                username: None,
                password: raw.to_string(),
            }),
        }
    }
}

/// Declarative description of one managed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Full command line, word-split with POSIX shell rules at start time.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Absent means enabled; absence must round-trip as absence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// 5-field cron expression; present means the service is scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl ServiceSpec {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// The whole document: global settings inline plus the ordered service list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(flatten)]
    pub global: GlobalSettings,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("service {0} not found")]
    NotFound(String),
    #[error("service {0} already exists")]
    DuplicateName(String),
    #[error("service name must not be empty")]
    EmptyName,
    #[error("service {0}: command must not be empty")]
    EmptyCommand(String),
    #[error("service {0}: invalid cron schedule {1:?}: {2}")]
    BadSchedule(String, String, String),
    #[error("watcher already running")]
    WatcherRunning,
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Parse(String),
}

/// Receives configuration change events. Events are delivered one at a time;
/// the watcher awaits each delivery before emitting the next.
#[async_trait]
pub trait ConfigListener: Send + Sync {
    /// `services` is the complete new ordered desired state; `to_evict` names
    /// every service whose live instance must be torn down (deleted from the
    /// document, or structurally changed in it).
    async fn on_services_updated(&self, services: Vec<ServiceSpec>, to_evict: Vec<String>);
}

struct Committed {
    services: Vec<ServiceSpec>,
    last_mtime: Option<SystemTime>,
    last_digest: Option<String>,
    last_reload: Option<Instant>,
}

pub struct ConfigStore {
    path: PathBuf,
    check_interval: Duration,
    reload_cooldown: Duration,
    inner: RwLock<Committed>,
    reload_tx: tokio_mpsc::Sender<()>,
    reload_rx: Mutex<Option<tokio_mpsc::Receiver<()>>>,
    stop: CancellationToken,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_intervals(path, DEFAULT_CHECK_INTERVAL, DEFAULT_RELOAD_COOLDOWN)
    }

    pub fn with_intervals(
        path: impl Into<PathBuf>,
        check_interval: Duration,
        reload_cooldown: Duration,
    ) -> Self {
        let (reload_tx, reload_rx) = tokio_mpsc::channel(1);
        Self {
            path: path.into(),
            check_interval,
            reload_cooldown,
            inner: RwLock::new(Committed {
                services: Vec::new(),
                last_mtime: None,
                last_digest: None,
                last_reload: None,
            }),
            reload_tx,
            reload_rx: Mutex::new(Some(reload_rx)),
            stop: CancellationToken::new(),
        }
    }

    /// Load the committed snapshot from disk (creating an empty document if
    /// the file does not exist yet), emit the initial change event, and spawn
    /// the background poller. The poller task keeps the passed Arc alive.
    pub fn start_watcher(
        self: Arc<Self>,
        listener: Arc<dyn ConfigListener>,
    ) -> Result<(), StoreError> {
        self.load_from_disk()?;

        let mut reload_rx = self
            .reload_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(StoreError::WatcherRunning)?;

        let store = self;
        tokio::spawn(async move {
            let initial = {
                let inner = store.inner.read().unwrap_or_else(|p| p.into_inner());
                inner.services.clone()
            };
            listener.on_services_updated(initial, Vec::new()).await;

            let mut ticker = tokio::time::interval(store.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = store.stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.check_and_reload(&listener, false).await {
                            sm_event("watcher", None, format!("reload check failed err={e}"));
                        }
                    }
                    Some(()) = reload_rx.recv() => {
                        if let Err(e) = store.check_and_reload(&listener, true).await {
                            sm_event("watcher", None, format!("reload after edit failed err={e}"));
                        }
                    }
                }
            }
            sm_event("watcher", None, "exit reason=stopped");
        });

        Ok(())
    }

    /// Halt the poller. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn list(&self) -> Vec<ServiceSpec> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.services.clone()
    }

    pub fn get(&self, name: &str) -> Option<ServiceSpec> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.services.iter().find(|s| s.name == name).cloned()
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.services.len()
    }

    pub fn add(&self, spec: ServiceSpec) -> Result<(), StoreError> {
        validate_spec(&spec)?;
        let inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if inner.services.iter().any(|s| s.name == spec.name) {
            return Err(StoreError::DuplicateName(spec.name));
        }
        self.persist_with(|doc| doc.append_entry(&spec))?;
        drop(inner);
        self.trigger_reload();
        Ok(())
    }

    pub fn update(&self, name: &str, spec: ServiceSpec) -> Result<(), StoreError> {
        validate_spec(&spec)?;
        let inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if !inner.services.iter().any(|s| s.name == name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        if spec.name != name && inner.services.iter().any(|s| s.name == spec.name) {
            return Err(StoreError::DuplicateName(spec.name));
        }
        self.persist_with(|doc| doc.replace_entry(name, &spec))?;
        drop(inner);
        self.trigger_reload();
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if !inner.services.iter().any(|s| s.name == name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.persist_with(|doc| doc.delete_entry(name))?;
        drop(inner);
        self.trigger_reload();
        Ok(())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if !inner.services.iter().any(|s| s.name == name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.persist_with(|doc| doc.set_enabled_entry(name, enabled))?;
        drop(inner);
        self.trigger_reload();
        Ok(())
    }

    fn trigger_reload(&self) {
        // Capacity 1: a pending signal already covers this edit.
        let _ = self.reload_tx.try_send(());
    }

    fn load_from_disk(&self) -> Result<(), StoreError> {
        if !self.path.exists() {
            atomic_write(&self.path, "services: []\n")?;
        }
        let raw = fs::read_to_string(&self.path)?;
        let root = parse_root(&raw)
            .map_err(|e| StoreError::Parse(format!("failed to parse {}: {e}", self.path.display())))?;
        let mtime = fs::metadata(&self.path)?.modified()?;
        let digest = sha256_hex(raw.as_bytes());

        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        inner.services = root.services;
        inner.last_mtime = Some(mtime);
        inner.last_digest = Some(digest);
        Ok(())
    }

    /// One reload attempt. `forced` reloads come from the mutation APIs: they
    /// bypass the cooldown and the mtime fast-path (the content digest still
    /// filters out no-op writes).
    async fn check_and_reload(
        &self,
        listener: &Arc<dyn ConfigListener>,
        forced: bool,
    ) -> Result<(), StoreError> {
        let Some((mtime, digest, raw)) = self.detect_change(forced)? else {
            return Ok(());
        };

        if !forced {
            let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
            if let Some(last) = inner.last_reload {
                if last.elapsed() < self.reload_cooldown {
                    return Ok(());
                }
            }
        }

        let root = match parse_root(&raw) {
            Ok(root) => root,
            Err(e) => {
                sm_event(
                    "watcher",
                    None,
                    format!("parse failed; keeping previous config err={e}"),
                );
                return Ok(());
            }
        };

        let (services, to_evict) = {
            let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
            let to_evict = compute_evictions(&inner.services, &root.services);
            inner.services = root.services.clone();
            inner.last_mtime = Some(mtime);
            inner.last_digest = Some(digest);
            inner.last_reload = Some(Instant::now());
            (root.services, to_evict)
        };

        sm_event(
            "watcher",
            None,
            format!("config reloaded services={} to_evict={to_evict:?}", services.len()),
        );
        listener.on_services_updated(services, to_evict).await;
        Ok(())
    }

    /// Returns (mtime, digest, raw) when the file content changed, None otherwise.
    fn detect_change(
        &self,
        skip_mtime_check: bool,
    ) -> Result<Option<(SystemTime, String, String)>, StoreError> {
        let mtime = fs::metadata(&self.path)?.modified()?;

        if !skip_mtime_check {
            let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
            if let Some(last) = inner.last_mtime {
                if mtime <= last {
                    return Ok(None);
                }
            }
        }

        let raw = fs::read_to_string(&self.path)?;
        let digest = sha256_hex(raw.as_bytes());

        {
            let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
            if inner.last_digest.as_deref() == Some(digest.as_str()) {
                drop(inner);
                // Touched but identical: only advance the mtime watermark.
                let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
                inner.last_mtime = Some(mtime);
                return Ok(None);
            }
        }

        Ok(Some((mtime, digest, raw)))
    }

    fn persist_with<F>(&self, edit: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut RawDocument) -> Result<(), StoreError>,
    {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut doc = RawDocument::parse(&raw);
        edit(&mut doc)?;
        atomic_write(&self.path, &doc.render())
    }
}

pub fn load_global(path: &Path) -> Result<GlobalSettings, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(GlobalSettings::default());
        }
        Err(e) => return Err(e.into()),
    };
    let root = parse_root(&raw)
        .map_err(|e| StoreError::Parse(format!("failed to parse {}: {e}", path.display())))?;
    Ok(root.global)
}

/// An empty document is a valid document with no services.
fn parse_root(raw: &str) -> Result<RootConfig, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(RootConfig {
            global: GlobalSettings::default(),
            services: Vec::new(),
        });
    }
    serde_yaml::from_str(raw)
}

fn validate_spec(spec: &ServiceSpec) -> Result<(), StoreError> {
    if spec.name.trim().is_empty() {
        return Err(StoreError::EmptyName);
    }
    if spec.command.trim().is_empty() {
        return Err(StoreError::EmptyCommand(spec.name.clone()));
    }
    if let Some(expr) = spec.schedule.as_deref() {
        if let Err(e) = crate::sm::scheduler::parse_schedule(expr) {
            return Err(StoreError::BadSchedule(
                spec.name.clone(),
                expr.to_string(),
                e.to_string(),
            ));
        }
    }
    Ok(())
}

/// Structural equality for eviction purposes. `enabled` compares by its
/// effective value, so absent and explicit true are the same spec.
pub fn specs_equal(a: &ServiceSpec, b: &ServiceSpec) -> bool {
    a.name == b.name
        && a.command == b.command
        && a.workdir == b.workdir
        && a.schedule == b.schedule
        && a.is_enabled() == b.is_enabled()
        && a.env == b.env
}

/// Names present in `old` that are deleted or structurally changed in `new`,
/// in `old` order.
pub fn compute_evictions(old: &[ServiceSpec], new: &[ServiceSpec]) -> Vec<String> {
    let new_map: HashMap<&str, &ServiceSpec> =
        new.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut out = Vec::new();
    for svc in old {
        match new_map.get(svc.name.as_str()) {
            None => out.push(svc.name.clone()),
            Some(n) if !specs_equal(svc, n) => out.push(svc.name.clone()),
            _ => {}
        }
    }
    out
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn atomic_write(path: &Path, contents: &str) -> Result<(), StoreError> {
    let mut tmp_os = path.as_os_str().to_owned();
    tmp_os.push(".tmp");
    let tmp = PathBuf::from(tmp_os);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::Io(e)
    })
}

// ---------------------------------------------------------------------------
// Raw document editing
//
// Writes are splices on the raw text rather than a re-marshal of the model,
// so comments and formatting on the global section and on untouched service
// entries survive every edit. Each RawDocument supports a single edit; the
// persist path parses a fresh one per mutation.
// ---------------------------------------------------------------------------

struct ItemSpan {
    /// First line of the entry including the comment/blank lines directly above it.
    lead: usize,
    /// Line holding the `- ` marker.
    dash: usize,
    /// Exclusive end of the entry.
    end: usize,
    name: Option<String>,
}

struct SequenceLayout {
    services_line: usize,
    /// `services: []` style empty sequence.
    inline_empty: bool,
    /// Any other inline (flow) value; such a sequence cannot be spliced.
    flow_style: bool,
    region_end: usize,
    dash_indent: usize,
    items: Vec<ItemSpan>,
}

struct RawDocument {
    lines: Vec<String>,
    layout: Option<SequenceLayout>,
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn is_dash(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("- ") || t == "-"
}

impl RawDocument {
    fn parse(raw: &str) -> Self {
        let lines: Vec<String> = raw.lines().map(|l| l.to_string()).collect();

        let mut services_line = None;
        for (i, l) in lines.iter().enumerate() {
            if indent_of(l) == 0 && !is_blank(l) && !is_comment(l) && l.starts_with("services:") {
                services_line = Some(i);
                break;
            }
        }
        let Some(sl) = services_line else {
            return Self { lines, layout: None };
        };

        let after_key = lines[sl]["services:".len()..].trim();
        let value = match after_key.find('#') {
            Some(pos) => after_key[..pos].trim(),
            None => after_key,
        };
        let inline_empty = value == "[]";
        let flow_style = !value.is_empty() && !inline_empty;

        let mut region_end = lines.len();
        for (i, l) in lines.iter().enumerate().skip(sl + 1) {
            if is_blank(l) || is_comment(l) {
                continue;
            }
            if indent_of(l) == 0 && !is_dash(l) {
                region_end = i;
                break;
            }
        }

        let dash_indent = lines[sl + 1..region_end]
            .iter()
            .find(|l| is_dash(l))
            .map(|l| indent_of(l))
            .unwrap_or(2);

        let dashes: Vec<usize> = (sl + 1..region_end)
            .filter(|&i| indent_of(&lines[i]) == dash_indent && is_dash(&lines[i]))
            .collect();

        let mut items = Vec::with_capacity(dashes.len());
        for (k, &d) in dashes.iter().enumerate() {
            let floor = if k == 0 { sl + 1 } else { dashes[k - 1] + 1 };
            let mut lead = d;
            while lead > floor && (is_blank(&lines[lead - 1]) || is_comment(&lines[lead - 1])) {
                lead -= 1;
            }
            items.push(ItemSpan {
                lead,
                dash: d,
                end: region_end,
                name: None,
            });
        }
        for k in 0..items.len() {
            if k + 1 < items.len() {
                items[k].end = items[k + 1].lead;
            }
        }
        for item in &mut items {
            item.name = parse_item_name(&lines, item, dash_indent);
        }

        Self {
            lines,
            layout: Some(SequenceLayout {
                services_line: sl,
                inline_empty,
                flow_style,
                region_end,
                dash_indent,
                items,
            }),
        }
    }

    fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }

    fn append_entry(&mut self, spec: &ServiceSpec) -> Result<(), StoreError> {
        match &self.layout {
            None => {
                let rendered = render_item(spec, 2)?;
                self.lines.push("services:".to_string());
                self.lines.extend(rendered);
                Ok(())
            }
            Some(layout) if layout.flow_style => Err(StoreError::Parse(
                "services sequence uses flow style; cannot edit in place".to_string(),
            )),
            Some(layout) => {
                let rendered = render_item(spec, layout.dash_indent)?;
                if layout.inline_empty {
                    let at = layout.services_line;
                    self.lines[at] = "services:".to_string();
                    self.lines.splice(at + 1..at + 1, rendered);
                } else {
                    let at = layout.region_end;
                    self.lines.splice(at..at, rendered);
                }
                Ok(())
            }
        }
    }

    fn replace_entry(&mut self, name: &str, spec: &ServiceSpec) -> Result<(), StoreError> {
        let (dash_indent, item) = self.find_item(name)?;
        let rendered = render_item(spec, dash_indent)?;
        // Comment lines above the entry stay; the entry body is replaced.
        self.lines.splice(item.dash..item.end, rendered);
        Ok(())
    }

    fn delete_entry(&mut self, name: &str) -> Result<(), StoreError> {
        let (_, item) = self.find_item(name)?;
        self.lines.splice(item.lead..item.end, std::iter::empty());
        Ok(())
    }

    fn set_enabled_entry(&mut self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let (dash_indent, item) = self.find_item(name)?;
        let key_indent = dash_indent + 2;
        let pad = " ".repeat(key_indent);

        for i in item.dash..item.end {
            let l = &self.lines[i];
            let on_dash_line = i == item.dash && l.trim_start().starts_with("- enabled:");
            let on_key_line = i != item.dash
                && indent_of(l) == key_indent
                && l.trim_start().starts_with("enabled:");
            if !(on_dash_line || on_key_line) {
                continue;
            }
            let comment = l.find(" #").map(|p| l[p..].to_string()).unwrap_or_default();
            self.lines[i] = if on_dash_line {
                format!("{}- enabled: {enabled}{comment}", " ".repeat(dash_indent))
            } else {
                format!("{pad}enabled: {enabled}{comment}")
            };
            return Ok(());
        }

        // No enabled line yet: insert one after the last content line of the entry.
        let mut at = item.end;
        while at > item.dash + 1 && (is_blank(&self.lines[at - 1]) || is_comment(&self.lines[at - 1])) {
            at -= 1;
        }
        self.lines.insert(at, format!("{pad}enabled: {enabled}"));
        Ok(())
    }

    fn find_item(&self, name: &str) -> Result<(usize, ItemSpan), StoreError> {
        let layout = self.layout.as_ref().ok_or_else(|| {
            StoreError::Parse("document has no services sequence".to_string())
        })?;
        if layout.flow_style {
            return Err(StoreError::Parse(
                "services sequence uses flow style; cannot edit in place".to_string(),
            ));
        }
        layout
            .items
            .iter()
            .find(|i| i.name.as_deref() == Some(name))
            .map(|i| {
                (
                    layout.dash_indent,
                    ItemSpan {
                        lead: i.lead,
                        dash: i.dash,
                        end: i.end,
                        name: i.name.clone(),
                    },
                )
            })
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}

fn item_text(lines: &[String], item: &ItemSpan, dash_indent: usize) -> String {
    let strip = dash_indent + 2;
    let mut out = String::new();
    for (i, l) in lines[item.dash..item.end].iter().enumerate() {
        if i == 0 {
            out.push_str(&l[strip.min(l.len())..]);
        } else {
            let ws = l.chars().take_while(|c| *c == ' ').count();
            out.push_str(&l[strip.min(ws)..]);
        }
        out.push('\n');
    }
    out
}

fn parse_item_name(lines: &[String], item: &ItemSpan, dash_indent: usize) -> Option<String> {
    serde_yaml::from_str::<ServiceSpec>(&item_text(lines, item, dash_indent))
        .ok()
        .map(|s| s.name)
}

fn render_item(spec: &ServiceSpec, dash_indent: usize) -> Result<Vec<String>, StoreError> {
    let body = serde_yaml::to_string(spec)
        .map_err(|e| StoreError::Parse(format!("failed to serialize service entry: {e}")))?;
    let pad = " ".repeat(dash_indent);
    Ok(body
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i == 0 {
                format!("{pad}- {l}")
            } else {
                format!("{pad}  {l}")
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

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

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<(Vec<ServiceSpec>, Vec<String>)>>,
    }

    impl RecordingListener {
        fn count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
        fn nth(&self, n: usize) -> (Vec<ServiceSpec>, Vec<String>) {
            self.events.lock().unwrap()[n].clone()
        }
    }

    #[async_trait]
    impl ConfigListener for RecordingListener {
        async fn on_services_updated(&self, services: Vec<ServiceSpec>, to_evict: Vec<String>) {
            self.events.lock().unwrap().push((services, to_evict));
        }
    }

    async fn wait_for_events(listener: &RecordingListener, n: usize) {
        for _ in 0..200 {
            if listener.count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("listener never saw {n} events (got {})", listener.count());
    }

    #[test]
    fn global_defaults_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        fs::write(&path, "services: []\n").unwrap();
        let g = load_global(&path).unwrap();
        assert_eq!(g.host, "127.0.0.1");
        assert_eq!(g.port, 4321);
        assert_eq!(g.failure_retries, 3);
        assert!(g.failure_webhook_url.is_none());
    }

    #[test]
    fn global_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let g = load_global(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(g.port, 4321);
    }

    #[test]
    fn global_parse_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        fs::write(&path, "services: [ oops\n").unwrap();
        assert!(matches!(load_global(&path), Err(StoreError::Parse(_))));
    }

    #[test]
    fn basic_auth_forms() {
        let mut g = GlobalSettings::default();
        assert_eq!(g.basic_auth(), None);

        g.authorization = Some("alice:s3cret".to_string());
        assert_eq!(
            g.basic_auth(),
            Some(BasicAuth {
                username: Some("alice".to_string()),
                password: "s3cret".to_string()
            })
        );

        g.authorization = Some("s3cret".to_string());
        assert_eq!(
            g.basic_auth(),
            Some(BasicAuth {
                username: None,
                password: "s3cret".to_string()
            })
        );
    }

    #[test]
    fn eviction_diff_covers_deletes_and_edits() {
        let mut old = vec![spec("a", "sleep 1"), spec("b", "sleep 1"), spec("c", "sleep 1")];
        old[0].enabled = Some(true);

        // a: enabled flips absent->true is NOT a change (effective equality)
        let mut new = vec![spec("a", "sleep 1"), spec("c", "sleep 2")];
        new[0].enabled = None;

        let evicted = compute_evictions(&old, &new);
        // b deleted, c modified; a untouched.
        assert_eq!(evicted, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn eviction_diff_sees_enabled_and_env_changes() {
        let old = vec![spec("a", "sleep 1")];

        let mut disabled = spec("a", "sleep 1");
        disabled.enabled = Some(false);
        assert_eq!(compute_evictions(&old, &[disabled]), vec!["a".to_string()]);

        let mut env_changed = spec("a", "sleep 1");
        env_changed.env.insert("K".to_string(), "v".to_string());
        assert_eq!(compute_evictions(&old, &[env_changed]), vec!["a".to_string()]);

        assert!(compute_evictions(&old, &[spec("a", "sleep 1")]).is_empty());
    }

    #[test]
    fn validation_rejects_bad_specs() {
        let store = ConfigStore::new("/nonexistent/services.yaml");
        assert!(matches!(store.add(spec("", "x")), Err(StoreError::EmptyName)));
        assert!(matches!(
            store.add(spec("a", "   ")),
            Err(StoreError::EmptyCommand(_))
        ));
        let mut bad = spec("a", "sleep 1");
        bad.schedule = Some("not a cron".to_string());
        assert!(matches!(store.add(bad), Err(StoreError::BadSchedule(..))));
    }

    #[test]
    fn add_update_delete_round_trip_preserves_comments_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        fs::write(
            &path,
            "\
# fleet configuration
host: 127.0.0.1
port: 4321

services:
  # frontline
  - name: web
    command: sleep 30
    # toggled by the on-call
    enabled: true
  - name: worker
    command: sleep 10
",
        )
        .unwrap();

        let store = ConfigStore::new(&path);
        store.load_from_disk().unwrap();
        assert_eq!(store.count(), 2);

        // set_enabled edits exactly one line.
        store.set_enabled("web", false).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("# fleet configuration"));
        assert!(raw.contains("# frontline"));
        assert!(raw.contains("# toggled by the on-call"));
        assert!(raw.contains("enabled: false"));
        assert!(!raw.contains("enabled: true"));

        // add appends at the end of the sequence.
        let mut batch = spec("batch", "true");
        batch.schedule = Some("*/5 * * * *".to_string());
        store.add(batch).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        let root: RootConfig = serde_yaml::from_str(&raw).unwrap();
        let names: Vec<&str> = root.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["web", "worker", "batch"]);

        // set_enabled on an entry without the key inserts one.
        store.set_enabled("worker", false).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        let root: RootConfig = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(root.services[1].enabled, Some(false));

        // update replaces the entry body, keeps its lead comment.
        store.update("web", spec("web", "sleep 60")).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("# frontline"));
        assert!(raw.contains("command: sleep 60"));

        // delete removes the entry, global comments stay.
        store.delete("worker").unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("worker"));
        assert!(raw.contains("# fleet configuration"));
        let root: RootConfig = serde_yaml::from_str(&raw).unwrap();
        let names: Vec<&str> = root.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["web", "batch"]);

        // No temp file left behind.
        assert!(!dir.path().join("services.yaml.tmp").exists());
    }

    #[test]
    fn absent_enabled_round_trips_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        let store = ConfigStore::new(&path);
        store.load_from_disk().unwrap();

        store.add(spec("quiet", "sleep 5")).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("enabled"));
        let root: RootConfig = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(root.services[0].enabled, None);
        assert!(root.services[0].is_enabled());
    }

    #[test]
    fn duplicate_and_rename_collisions_leave_the_document_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        let store = ConfigStore::new(&path);
        store.load_from_disk().unwrap();
        store.add(spec("a", "sleep 1")).unwrap();
        store.add(spec("b", "sleep 1")).unwrap();
        // Mutations only commit through the reload path; refresh manually here.
        store.load_from_disk().unwrap();
        let before = fs::read_to_string(&path).unwrap();

        assert!(matches!(
            store.add(spec("a", "sleep 2")),
            Err(StoreError::DuplicateName(_))
        ));
        assert!(matches!(
            store.update("a", spec("b", "sleep 2")),
            Err(StoreError::DuplicateName(_))
        ));
        assert!(matches!(
            store.update("ghost", spec("ghost", "sleep 2")),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.delete("ghost"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.set_enabled("ghost", true),
            Err(StoreError::NotFound(_))
        ));

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn watcher_emits_initial_state_then_api_edits_bypass_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        fs::write(&path, "services:\n  - name: web\n    command: sleep 30\n").unwrap();

        // Long ticker and long cooldown: only forced reloads can get through.
        let store = Arc::new(ConfigStore::with_intervals(
            &path,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ));
        let listener = Arc::new(RecordingListener::default());
        Arc::clone(&store)
            .start_watcher(listener.clone() as Arc<dyn ConfigListener>)
            .unwrap();

        wait_for_events(&listener, 1).await;
        let (services, evict) = listener.nth(0);
        assert_eq!(services.len(), 1);
        assert!(evict.is_empty());

        // The documented regression: an enabled-only edit must evict.
        store.set_enabled("web", false).unwrap();
        wait_for_events(&listener, 2).await;
        let (services, evict) = listener.nth(1);
        assert_eq!(evict, vec!["web".to_string()]);
        assert_eq!(services[0].enabled, Some(false));

        store.stop();
        store.stop();
    }

    #[tokio::test]
    async fn ticker_reload_respects_cooldown_api_reload_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        fs::write(&path, "services: []\n").unwrap();

        let store = Arc::new(ConfigStore::with_intervals(
            &path,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ));
        store.load_from_disk().unwrap();
        let recording = Arc::new(RecordingListener::default());
        let listener: Arc<dyn ConfigListener> = recording.clone();

        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(&path, "services:\n  - name: a\n    command: sleep 1\n").unwrap();
        store.check_and_reload(&listener, false).await.unwrap();
        assert_eq!(recording.count(), 1);

        // Second change within the cooldown window: the ticker path is suppressed.
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(&path, "services:\n  - name: b\n    command: sleep 1\n").unwrap();
        store.check_and_reload(&listener, false).await.unwrap();
        assert_eq!(recording.count(), 1);

        // The forced path is not.
        store.check_and_reload(&listener, true).await.unwrap();
        assert_eq!(recording.count(), 2);
        let (services, evict) = recording.nth(1);
        assert_eq!(services[0].name, "b");
        assert_eq!(evict, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn reload_parse_failure_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        fs::write(&path, "services:\n  - name: a\n    command: sleep 1\n").unwrap();

        let store = Arc::new(ConfigStore::new(&path));
        store.load_from_disk().unwrap();
        let listener: Arc<dyn ConfigListener> = Arc::new(RecordingListener::default());

        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(&path, "services: [ broken\n").unwrap();
        store.check_and_reload(&listener, true).await.unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.get("a").unwrap().command, "sleep 1");

        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(&path, "services:\n  - name: a\n    command: sleep 2\n").unwrap();
        store.check_and_reload(&listener, true).await.unwrap();
        assert_eq!(store.get("a").unwrap().command, "sleep 2");
    }

    #[tokio::test]
    async fn identical_rewrite_does_not_emit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        let body = "services:\n  - name: a\n    command: sleep 1\n";
        fs::write(&path, body).unwrap();

        let store = Arc::new(ConfigStore::new(&path));
        store.load_from_disk().unwrap();
        let recording = Arc::new(RecordingListener::default());
        let listener: Arc<dyn ConfigListener> = recording.clone();

        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(&path, body).unwrap();
        store.check_and_reload(&listener, true).await.unwrap();
        assert_eq!(recording.count(), 0);
    }
}
