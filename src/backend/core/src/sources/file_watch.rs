//! Filesystem change source backed by `notify`.

use async_trait::async_trait;
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use super::event::Payload;
use super::lifecycle::{SourceCore, SourceKind};
use super::polling::{PollHandle, PollOutcome, PollWorker};
use super::EventSource;
use crate::error::{Result, TributaryError};

/// Back-off after a watcher error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
pub struct FileWatchConfig {
    #[serde(default)]
    pub watch_path: PathBuf,

    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

impl FileWatchConfig {
    pub fn new(watch_path: impl Into<PathBuf>) -> Self {
        Self {
            watch_path: watch_path.into(),
            recursive: default_recursive(),
        }
    }
}

fn default_recursive() -> bool {
    true
}

fn change(event_type: &str, path: &Path, is_directory: bool) -> Payload {
    let mut payload = Payload::new();
    payload.insert("event_type".into(), json!(event_type));
    payload.insert("src_path".into(), json!(path.to_string_lossy()));
    payload.insert("is_directory".into(), Value::Bool(is_directory));
    payload
}

/// Normalize one notification into zero or more change payloads.
///
/// Renames with both ends known become a single `moved` change; a rename
/// seen from only one side is reported as `deleted` or `created`. Access
/// and other metadata-free notifications produce nothing.
pub fn translate_event(event: &notify::Event) -> Vec<Payload> {
    let folder_hint = matches!(
        event.kind,
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder)
    );
    let is_dir = |path: &Path| folder_hint || path.is_dir();

    let event_type = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            let (from, to) = (&event.paths[0], &event.paths[1]);
            let mut payload = change("moved", from, is_dir(to));
            payload.insert("dest_path".into(), json!(to.to_string_lossy()));
            return vec![payload];
        }
        EventKind::Create(_) => "created",
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => "deleted",
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => "created",
        EventKind::Modify(_) => "modified",
        EventKind::Remove(_) => "deleted",
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event
        .paths
        .iter()
        .map(|path| change(event_type, path, is_dir(path)))
        .collect()
}

struct ActiveWatch {
    // Dropping the watcher closes the notification channel.
    watcher: RecommendedWatcher,
    poller: PollHandle,
}

/// Event source reporting filesystem changes under a path.
pub struct FileWatchSource {
    core: SourceCore,
    config: FileWatchConfig,
    active: parking_lot::Mutex<Option<ActiveWatch>>,
}

impl FileWatchSource {
    pub fn new(id: impl Into<String>, config: FileWatchConfig) -> Self {
        Self {
            core: SourceCore::new(id, SourceKind::FileWatch),
            config,
            active: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core = self.core.renamed(name);
        self
    }

    pub fn config(&self) -> &FileWatchConfig {
        &self.config
    }
}

struct WatchWorker {
    core: SourceCore,
    rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

#[async_trait]
impl PollWorker for WatchWorker {
    async fn poll_once(&mut self) -> Result<PollOutcome> {
        let event = match self.rx.recv().await {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(PollOutcome::Idle),
        };

        let mut first_error = None;
        for payload in translate_event(&event) {
            let mut metadata = Payload::new();
            metadata.insert("notify_kind".into(), json!(format!("{:?}", event.kind)));
            if let Err(e) = self.core.emit(payload, metadata).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(PollOutcome::Continue),
        }
    }
}

#[async_trait]
impl EventSource for FileWatchSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn validate_config(&self) -> Result<()> {
        if self.config.watch_path.as_os_str().is_empty() {
            return Err(TributaryError::missing_configuration("File watch", "watch_path"));
        }
        if !self.config.watch_path.exists() {
            return Err(TributaryError::invalid_configuration(format!(
                "Watch path '{}' does not exist",
                self.config.watch_path.display()
            )));
        }
        Ok(())
    }

    async fn start_acquisition(&self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The receiver is gone only while the source is shutting down.
            let _ = tx.send(res);
        })?;

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&self.config.watch_path, mode)?;

        let worker = WatchWorker {
            core: self.core.clone(),
            rx,
        };
        let poller = PollHandle::spawn(self.core.id(), ERROR_BACKOFF, worker);
        *self.active.lock() = Some(ActiveWatch { watcher, poller });

        tracing::info!(
            source_id = %self.core.id(),
            path = %self.config.watch_path.display(),
            recursive = self.config.recursive,
            "Watching filesystem"
        );
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        let active = self.active.lock().take();
        if let Some(ActiveWatch { watcher, poller }) = active {
            drop(watcher);
            poller.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sources::event::ChannelSubscriber;
    use crate::sources::lifecycle::SourceStatus;
    use notify::event::{AccessKind, DataChange};

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        paths
            .iter()
            .fold(notify::Event::new(kind), |ev, p| ev.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_translate_basic_kinds() {
        let created = translate_event(&event(EventKind::Create(CreateKind::File), &["/tmp/a.txt"]));
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["event_type"], json!("created"));
        assert_eq!(created[0]["src_path"], json!("/tmp/a.txt"));

        let modified = translate_event(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/tmp/a.txt"],
        ));
        assert_eq!(modified[0]["event_type"], json!("modified"));

        let deleted = translate_event(&event(EventKind::Remove(RemoveKind::Folder), &["/tmp/gone"]));
        assert_eq!(deleted[0]["event_type"], json!("deleted"));
        assert_eq!(deleted[0]["is_directory"], json!(true));
    }

    #[test]
    fn test_translate_renames() {
        let moved = translate_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/tmp/old.txt", "/tmp/new.txt"],
        ));
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0]["event_type"], json!("moved"));
        assert_eq!(moved[0]["src_path"], json!("/tmp/old.txt"));
        assert_eq!(moved[0]["dest_path"], json!("/tmp/new.txt"));

        let from = translate_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/tmp/old.txt"],
        ));
        assert_eq!(from[0]["event_type"], json!("deleted"));

        let to = translate_event(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/tmp/new.txt"],
        ));
        assert_eq!(to[0]["event_type"], json!("created"));
        assert!(to[0].get("dest_path").is_none());
    }

    #[test]
    fn test_access_events_are_ignored() {
        let access = event(EventKind::Access(AccessKind::Any), &["/tmp/a.txt"]);
        assert!(translate_event(&access).is_empty());
    }

    #[tokio::test]
    async fn test_missing_path_is_invalid() {
        let source = FileWatchSource::new("fs", FileWatchConfig::new("/definitely/not/here"));
        let err = source.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
        assert_eq!(source.status(), SourceStatus::Error);

        let source = FileWatchSource::new("fs", FileWatchConfig::new(""));
        let err = source.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }

    #[tokio::test]
    async fn test_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileWatchSource::new("fs", FileWatchConfig::new(dir.path()));
        let (subscriber, mut events) = ChannelSubscriber::channel();
        source.on_event(subscriber);
        source.start().await.unwrap();

        let target = dir.path().join("report.csv");
        std::fs::write(&target, b"a,b\n").unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                let path = event.payload["src_path"].as_str().unwrap_or_default().to_string();
                if path.ends_with("report.csv") && event.payload["event_type"] == json!("created") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        source.stop().await.unwrap();
        assert!(found, "expected a created event for report.csv");
    }
}
