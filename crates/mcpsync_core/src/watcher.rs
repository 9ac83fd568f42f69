//! Change notifications for individual files.
//!
//! Native watches are placed on the file's directory and filtered by path,
//! so editors and tools that save by writing a temp file and renaming it
//! over the original keep being observed. A path that does not exist yet is
//! followed through its nearest existing ancestor until it appears.
//!
//! All callbacks run on one delivery thread, never on the thread that
//! installed the watch.

use crate::error::{McpSyncError, McpSyncResult};
use mcpsync_shared::diagnostics;
use mcpsync_shared::paths::nearest_existing_ancestor;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Wait after a delete/rename before looking at the path again.
const REATTACH_DELAY: Duration = Duration::from_millis(500);
/// Retry interval while not even an ancestor directory exists.
const ORPHAN_RETRY_DELAY: Duration = Duration::from_secs(5);
const COALESCE_WINDOW: Duration = Duration::from_millis(50);
const IDLE_WAIT: Duration = Duration::from_secs(60);

pub type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// The file exists and its directory is watched
    Direct,
    /// The file is missing; the closest existing ancestor is watched
    Ancestor,
    /// Nothing to attach to right now; a retry is scheduled
    Orphaned,
}

impl WatchMode {
    fn label(self) -> &'static str {
        match self {
            WatchMode::Direct => "direct",
            WatchMode::Ancestor => "ancestor",
            WatchMode::Orphaned => "orphaned",
        }
    }
}

enum Signal {
    Changed { path: PathBuf, generation: u64 },
    Detached { path: PathBuf, generation: u64, was_direct: bool },
    Reevaluate { path: PathBuf, generation: u64 },
    Shutdown,
}

#[derive(Clone, Copy)]
enum SignalKind {
    Changed,
    Detached,
    Reevaluate,
}

struct WatchEntry {
    generation: u64,
    callback: ChangeCallback,
    mode: WatchMode,
    anchor: Option<PathBuf>,
    handle: Option<RecommendedWatcher>,
}

struct Attachment {
    mode: WatchMode,
    anchor: Option<PathBuf>,
    handle: Option<RecommendedWatcher>,
}

struct Retry {
    path: PathBuf,
    generation: u64,
    due: Instant,
    notify: bool,
}

struct Shared {
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
    sender: Sender<Signal>,
    next_generation: AtomicU64,
}

/// Callbacks due after one pass, one per path.
#[derive(Default)]
struct Ready {
    seen: HashSet<PathBuf>,
    calls: Vec<(PathBuf, ChangeCallback)>,
}

impl Ready {
    fn push(&mut self, path: &Path, callback: &ChangeCallback) {
        if self.seen.insert(path.to_path_buf()) {
            self.calls.push((path.to_path_buf(), callback.clone()));
        }
    }
}

pub struct FileWatcher {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl FileWatcher {
    pub fn new() -> McpSyncResult<Self> {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            sender,
            next_generation: AtomicU64::new(1),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("mcpsync-watch".to_string())
            .spawn(move || delivery_loop(worker_shared, receiver))
            .map_err(|e| McpSyncError::WatchError(format!("spawn delivery thread: {}", e)))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Watch `path`, replacing any previous watch on it.
    pub fn watch<F>(&self, path: impl Into<PathBuf>, on_change: F) -> McpSyncResult<()>
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(McpSyncError::InvalidInput("empty watch path".to_string()));
        }
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        // Hold the map while attaching so the delivery thread cannot see
        // signals for this generation before the entry exists.
        let mut entries = self.shared.entries.lock();
        let attachment = attach(&self.shared.sender, &path, generation);
        let mode = attachment.mode;
        let replaced = entries.insert(
            path.clone(),
            WatchEntry {
                generation,
                callback: Arc::new(on_change),
                mode,
                anchor: attachment.anchor,
                handle: attachment.handle,
            },
        );
        drop(entries);
        drop(replaced);

        diagnostics::log(format!(
            "watch_start path={} mode={} generation={}",
            path.display(),
            mode.label(),
            generation
        ));
        if mode == WatchMode::Orphaned {
            let _ = self.shared.sender.send(Signal::Detached {
                path,
                generation,
                was_direct: false,
            });
        }
        Ok(())
    }

    pub fn stop_watching(&self, path: &Path) {
        let removed = self.shared.entries.lock().remove(path);
        if removed.is_some() {
            diagnostics::log(format!("watch_stop path={}", path.display()));
        }
    }

    pub fn stop_all(&self) {
        let removed: Vec<(PathBuf, WatchEntry)> = self.shared.entries.lock().drain().collect();
        if !removed.is_empty() {
            diagnostics::log(format!("watch_stop_all count={}", removed.len()));
        }
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.shared.entries.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn mode(&self, path: &Path) -> Option<WatchMode> {
        self.shared.entries.lock().get(path).map(|entry| entry.mode)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop_all();
        let _ = self.shared.sender.send(Signal::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Where a watch for `path` should be anchored right now.
fn locate(path: &Path) -> Option<(WatchMode, PathBuf)> {
    if path.exists() {
        let anchor = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty() && parent.is_dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.to_path_buf());
        return Some((WatchMode::Direct, anchor));
    }
    nearest_existing_ancestor(path).map(|ancestor| (WatchMode::Ancestor, ancestor))
}

fn attach(sender: &Sender<Signal>, path: &Path, generation: u64) -> Attachment {
    let orphaned = Attachment {
        mode: WatchMode::Orphaned,
        anchor: None,
        handle: None,
    };
    let Some((mode, anchor)) = locate(path) else {
        return orphaned;
    };
    match native_watch(sender, path, &anchor, mode, generation) {
        Ok(handle) => {
            // The file may have appeared before the ancestor watch was live.
            if mode == WatchMode::Ancestor && path.exists() {
                let _ = sender.send(Signal::Reevaluate {
                    path: path.to_path_buf(),
                    generation,
                });
            }
            Attachment {
                mode,
                anchor: Some(anchor),
                handle: Some(handle),
            }
        }
        Err(e) => {
            log::warn!("failed to watch {}: {}", anchor.display(), e);
            orphaned
        }
    }
}

fn native_watch(
    sender: &Sender<Signal>,
    target: &Path,
    anchor: &Path,
    mode: WatchMode,
    generation: u64,
) -> notify::Result<RecommendedWatcher> {
    let sender = sender.clone();
    let path = target.to_path_buf();
    // Backends may report canonical paths (/private/var on macOS).
    let mut aliases = vec![path.clone()];
    if let (Ok(canonical), Ok(relative)) = (anchor.canonicalize(), target.strip_prefix(anchor)) {
        let alias = canonical.join(relative);
        if alias != path {
            aliases.push(alias);
        }
    }

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let kind = match result {
            Ok(event) => classify(&aliases, mode, &event),
            Err(e) => {
                diagnostics::log(format!("watch_error path={} error={}", path.display(), e));
                Some(SignalKind::Reevaluate)
            }
        };
        let signal = match kind {
            Some(SignalKind::Changed) => Signal::Changed {
                path: path.clone(),
                generation,
            },
            Some(SignalKind::Detached) => Signal::Detached {
                path: path.clone(),
                generation,
                was_direct: true,
            },
            Some(SignalKind::Reevaluate) => Signal::Reevaluate {
                path: path.clone(),
                generation,
            },
            None => return,
        };
        let _ = sender.send(signal);
    })?;
    watcher.watch(anchor, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn classify(aliases: &[PathBuf], mode: WatchMode, event: &Event) -> Option<SignalKind> {
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {}
        EventKind::Access(_) => return None,
        _ => {}
    }

    let names_target = event
        .paths
        .iter()
        .any(|p| aliases.iter().any(|alias| alias == p));
    let names_ancestor = event
        .paths
        .iter()
        .any(|p| aliases.iter().any(|alias| alias.starts_with(p)));

    match mode {
        WatchMode::Direct if names_target => match event.kind {
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                Some(SignalKind::Detached)
            }
            _ => Some(SignalKind::Changed),
        },
        WatchMode::Direct if event.need_rescan() => Some(SignalKind::Changed),
        _ if names_ancestor || event.need_rescan() => Some(SignalKind::Reevaluate),
        _ => None,
    }
}

fn current<'a>(
    entries: &'a mut HashMap<PathBuf, WatchEntry>,
    path: &Path,
    generation: u64,
) -> Option<&'a mut WatchEntry> {
    entries
        .get_mut(path)
        .filter(|entry| entry.generation == generation)
}

fn schedule(retries: &mut Vec<Retry>, path: PathBuf, generation: u64, delay: Duration, notify: bool) {
    retries.retain(|retry| retry.path != path);
    retries.push(Retry {
        path,
        generation,
        due: Instant::now() + delay,
        notify,
    });
}

fn process(shared: &Shared, signal: Signal, retries: &mut Vec<Retry>, ready: &mut Ready) {
    let mut entries = shared.entries.lock();
    match signal {
        Signal::Changed { path, generation } => {
            if let Some(entry) = current(&mut entries, &path, generation) {
                if entry.mode == WatchMode::Direct {
                    ready.push(&path, &entry.callback);
                }
            }
        }
        Signal::Detached {
            path,
            generation,
            was_direct,
        } => {
            let Some(entry) = current(&mut entries, &path, generation) else {
                return;
            };
            if was_direct && entry.mode != WatchMode::Direct {
                return;
            }
            entry.handle = None;
            entry.anchor = None;
            entry.mode = WatchMode::Orphaned;
            let delay = if was_direct {
                REATTACH_DELAY
            } else {
                ORPHAN_RETRY_DELAY
            };
            schedule(retries, path, generation, delay, was_direct);
        }
        Signal::Reevaluate { path, generation } => {
            let Some(entry) = current(&mut entries, &path, generation) else {
                return;
            };
            if entry.mode == WatchMode::Orphaned {
                return;
            }
            let desired = locate(&path);
            if desired.as_ref().map(|(mode, anchor)| (*mode, Some(anchor)))
                == Some((entry.mode, entry.anchor.as_ref()))
            {
                return;
            }
            let was_direct = entry.mode == WatchMode::Direct;
            let attachment = attach(&shared.sender, &path, generation);
            entry.mode = attachment.mode;
            entry.anchor = attachment.anchor;
            entry.handle = attachment.handle;
            diagnostics::log(format!(
                "watch_reattach path={} mode={}",
                path.display(),
                entry.mode.label()
            ));
            let is_direct = entry.mode == WatchMode::Direct;
            if was_direct != is_direct {
                ready.push(&path, &entry.callback);
            }
            if entry.mode == WatchMode::Orphaned {
                schedule(retries, path, generation, ORPHAN_RETRY_DELAY, was_direct);
            }
        }
        Signal::Shutdown => {}
    }
}

fn run_due_retries(shared: &Shared, retries: &mut Vec<Retry>, ready: &mut Ready) {
    let now = Instant::now();
    let (due, waiting): (Vec<Retry>, Vec<Retry>) =
        retries.drain(..).partition(|retry| retry.due <= now);
    *retries = waiting;

    let mut entries = shared.entries.lock();
    for retry in due {
        let Some(entry) = current(&mut entries, &retry.path, retry.generation) else {
            continue;
        };
        if entry.mode != WatchMode::Orphaned {
            continue;
        }
        let attachment = attach(&shared.sender, &retry.path, retry.generation);
        entry.mode = attachment.mode;
        entry.anchor = attachment.anchor;
        entry.handle = attachment.handle;
        diagnostics::log(format!(
            "watch_reattach path={} mode={}",
            retry.path.display(),
            entry.mode.label()
        ));

        if entry.mode == WatchMode::Orphaned {
            retries.push(Retry {
                due: now + ORPHAN_RETRY_DELAY,
                ..retry
            });
            continue;
        }
        if retry.notify || entry.mode == WatchMode::Direct {
            ready.push(&retry.path, &entry.callback);
        }
    }
}

fn delivery_loop(shared: Arc<Shared>, receiver: Receiver<Signal>) {
    let mut retries: Vec<Retry> = Vec::new();

    loop {
        let timeout = retries
            .iter()
            .map(|retry| retry.due.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(IDLE_WAIT);

        let mut batch = Vec::new();
        let mut stopping = false;
        match receiver.recv_timeout(timeout) {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(signal) => {
                batch.push(signal);
                let window_end = Instant::now() + COALESCE_WINDOW;
                loop {
                    let remaining = window_end.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match receiver.recv_timeout(remaining) {
                        Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            stopping = true;
                            break;
                        }
                        Ok(signal) => batch.push(signal),
                        Err(RecvTimeoutError::Timeout) => break,
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if stopping {
            break;
        }

        let mut ready = Ready::default();
        for signal in batch {
            process(&shared, signal, &mut retries, &mut ready);
        }
        run_due_retries(&shared, &mut retries, &mut ready);

        for (path, callback) in ready.calls {
            callback(&path);
        }
    }

    diagnostics::log("watch_delivery_stopped");
}
