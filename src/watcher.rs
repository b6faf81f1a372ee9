//! Poll loop: list the folder, skip what was already seen, classify the rest
//! and forward whales.
//!
//! Each entry moves through download → temp file → classification → either
//! save + notify or delete. Failures are categorized so the loop can decide
//! per category whether to retry the entry, skip it, or abort the iteration.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::classifier::WhaleDetector;
use crate::drive::{DriveError, ImageStore, RemoteImage};
use crate::telegram::{Notifier, TelegramError};

/// Identifiers already taken up for processing during this process lifetime.
#[derive(Debug, Default)]
pub struct SeenSet {
    ids: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns false if the id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_owned())
    }

    pub fn forget(&mut self, id: &str) {
        self.ids.remove(id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Notified,
    Discarded,
}

#[derive(Debug)]
pub enum EntryError {
    Download(DriveError),
    Classification(anyhow::Error),
    Filesystem(io::Error),
    Notification(TelegramError),
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryError::Download(err) => write!(f, "download failed: {err}"),
            EntryError::Classification(err) => write!(f, "classification failed: {err:#}"),
            EntryError::Filesystem(err) => write!(f, "filesystem error: {err}"),
            EntryError::Notification(err) => write!(f, "notification failed: {err}"),
        }
    }
}

impl std::error::Error for EntryError {}

/// Failures that end an iteration early.
#[derive(Debug)]
pub enum PollError {
    Listing(DriveError),
    Auth(DriveError),
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Listing(err) => write!(f, "listing folder failed: {err}"),
            PollError::Auth(err) => write!(f, "Drive authorization failed: {err}"),
        }
    }
}

impl std::error::Error for PollError {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub listed: usize,
    pub skipped: usize,
    pub notified: usize,
    pub discarded: usize,
    pub failed: usize,
}

impl PollSummary {
    pub fn processed(&self) -> usize {
        self.notified + self.discarded + self.failed
    }
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub folder_id: String,
    pub save_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub alert_text: String,
}

pub struct Watcher {
    store: Box<dyn ImageStore>,
    detector: Box<dyn WhaleDetector>,
    notifier: Box<dyn Notifier>,
    settings: WatchSettings,
    seen: SeenSet,
}

impl Watcher {
    /// Creates the save and temp directories if needed.
    pub fn new(
        settings: WatchSettings,
        store: Box<dyn ImageStore>,
        detector: Box<dyn WhaleDetector>,
        notifier: Box<dyn Notifier>,
    ) -> io::Result<Self> {
        fs::create_dir_all(&settings.save_dir)?;
        fs::create_dir_all(&settings.temp_dir)?;

        Ok(Self {
            store,
            detector,
            notifier,
            settings,
            seen: SeenSet::new(),
        })
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Polls forever, sleeping `interval` between iterations.
    pub fn run(&mut self, interval: Duration) -> ! {
        info!(
            "Watching Drive folder {} every {}s",
            self.settings.folder_id,
            interval.as_secs()
        );
        loop {
            match self.poll_once() {
                Ok(summary) if summary.processed() > 0 => info!(
                    "Poll complete: {} whales, {} discarded, {} failed ({} already seen)",
                    summary.notified, summary.discarded, summary.failed, summary.skipped
                ),
                Ok(summary) => debug!("Nothing new ({} images listed)", summary.listed),
                Err(err) => error!("Poll failed: {err}"),
            }
            thread::sleep(interval);
        }
    }

    pub fn poll_once(&mut self) -> Result<PollSummary, PollError> {
        let entries = self
            .store
            .list_images(&self.settings.folder_id)
            .map_err(PollError::Listing)?;

        let mut summary = PollSummary {
            listed: entries.len(),
            ..PollSummary::default()
        };

        for entry in entries {
            if !self.seen.insert(&entry.id) {
                summary.skipped += 1;
                continue;
            }
            info!("New image found: {}", entry.name);

            match self.process(&entry) {
                Ok(EntryOutcome::Notified) => summary.notified += 1,
                Ok(EntryOutcome::Discarded) => summary.discarded += 1,
                Err(EntryError::Download(err)) if err.is_auth() => {
                    self.seen.forget(&entry.id);
                    return Err(PollError::Auth(err));
                }
                Err(EntryError::Download(err)) if err.is_transient() => {
                    // Nothing was inspected yet, so let the next poll retry it.
                    self.seen.forget(&entry.id);
                    warn!("Download of {} failed, retrying next poll: {err}", entry.name);
                    summary.failed += 1;
                }
                Err(err) => {
                    error!("Processing {} failed: {err}", entry.name);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    fn process(&self, entry: &RemoteImage) -> Result<EntryOutcome, EntryError> {
        let bytes = self.store.download(&entry.id).map_err(EntryError::Download)?;

        let file_name = local_file_name(entry);
        let temp_path = self.settings.temp_dir.join(format!("temp_{file_name}"));
        if let Err(err) = fs::write(&temp_path, &bytes) {
            discard(&temp_path);
            return Err(EntryError::Filesystem(err));
        }

        let verdict = match self.detector.score(&bytes) {
            Ok(verdict) => verdict,
            Err(err) => {
                discard(&temp_path);
                return Err(EntryError::Classification(err));
            }
        };

        if !verdict.is_whale() {
            info!("No whale in {}, deleting", entry.name);
            fs::remove_file(&temp_path).map_err(EntryError::Filesystem)?;
            return Ok(EntryOutcome::Discarded);
        }

        info!("Whale detected in {}, sending to Telegram", entry.name);
        let save_path = self.settings.save_dir.join(&file_name);
        if let Err(err) = move_file(&temp_path, &save_path) {
            discard(&temp_path);
            return Err(EntryError::Filesystem(err));
        }

        self.notifier
            .notify(&self.settings.alert_text, &bytes, &file_name)
            .map_err(EntryError::Notification)?;
        Ok(EntryOutcome::Notified)
    }
}

/// Remote names may contain path separators; keep only the final component.
fn local_file_name(entry: &RemoteImage) -> String {
    Path::new(&entry.name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| entry.id.clone())
}

/// `rename` cannot cross filesystems, so fall back to copy + delete.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("Failed to delete {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Verdict;
    use crate::credentials::CredentialError;
    use anyhow::anyhow;
    use reqwest::StatusCode;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// Shared state behind the fakes: the remote folder plus a call log.
    #[derive(Default)]
    struct World {
        entries: Vec<RemoteImage>,
        contents: HashMap<String, Vec<u8>>,
        listing_fails: bool,
        failing_downloads: HashMap<String, StatusCode>,
        auth_broken: bool,
        notify_fails: bool,
        downloads: Vec<String>,
        scored: usize,
        messages: Vec<String>,
        photos: Vec<(String, Vec<u8>)>,
    }

    impl World {
        fn upload(&mut self, id: &str, name: &str, bytes: &[u8]) {
            self.entries.push(RemoteImage {
                id: id.into(),
                name: name.into(),
            });
            self.contents.insert(id.into(), bytes.to_vec());
        }
    }

    type Shared = Rc<RefCell<World>>;

    struct FakeStore(Shared);

    impl ImageStore for FakeStore {
        fn list_images(&self, _folder_id: &str) -> Result<Vec<RemoteImage>, DriveError> {
            let world = self.0.borrow();
            if world.listing_fails {
                return Err(DriveError::UnexpectedStatus {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: "backend error".into(),
                });
            }
            Ok(world.entries.clone())
        }

        fn download(&self, id: &str) -> Result<Vec<u8>, DriveError> {
            let mut world = self.0.borrow_mut();
            world.downloads.push(id.to_owned());
            if world.auth_broken {
                return Err(DriveError::Auth(CredentialError::NoRefreshToken));
            }
            if let Some(status) = world.failing_downloads.get(id) {
                return Err(DriveError::UnexpectedStatus {
                    status: *status,
                    body: String::new(),
                });
            }
            Ok(world.contents.get(id).cloned().unwrap_or_default())
        }
    }

    /// Bytes starting with `whale` are whales, `tie` is an exact tie and
    /// `broken` cannot be classified.
    struct FakeDetector(Shared);

    impl WhaleDetector for FakeDetector {
        fn score(&self, image: &[u8]) -> anyhow::Result<Verdict> {
            self.0.borrow_mut().scored += 1;
            if image.starts_with(b"broken") {
                return Err(anyhow!("unsupported image format"));
            }
            let verdict = if image.starts_with(b"whale") {
                Verdict { whale: 0.83, no_whale: 0.17 }
            } else if image.starts_with(b"tie") {
                Verdict { whale: 0.5, no_whale: 0.5 }
            } else {
                Verdict { whale: 0.12, no_whale: 0.88 }
            };
            Ok(verdict)
        }
    }

    struct FakeNotifier(Shared);

    impl Notifier for FakeNotifier {
        fn notify(&self, caption: &str, image: &[u8], file_name: &str) -> Result<(), TelegramError> {
            let mut world = self.0.borrow_mut();
            if world.notify_fails {
                return Err(TelegramError::Api {
                    status: StatusCode::BAD_REQUEST,
                    description: "chat not found".into(),
                });
            }
            world.messages.push(caption.to_owned());
            world.photos.push((file_name.to_owned(), image.to_vec()));
            Ok(())
        }
    }

    struct Harness {
        watcher: Watcher,
        world: Shared,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let world: Shared = Rc::default();
            let settings = WatchSettings {
                folder_id: "folder-1".into(),
                save_dir: dir.path().join("whales"),
                temp_dir: dir.path().join("tmp"),
                alert_text: "🐋 Whale spotted!".into(),
            };
            let watcher = Watcher::new(
                settings,
                Box::new(FakeStore(Rc::clone(&world))),
                Box::new(FakeDetector(Rc::clone(&world))),
                Box::new(FakeNotifier(Rc::clone(&world))),
            )
            .expect("watcher");
            Self { watcher, world, dir }
        }

        fn saved(&self, name: &str) -> Option<Vec<u8>> {
            fs::read(self.dir.path().join("whales").join(name)).ok()
        }

        fn saved_count(&self) -> usize {
            fs::read_dir(self.dir.path().join("whales")).expect("save dir").count()
        }

        fn temp_files(&self) -> usize {
            fs::read_dir(self.dir.path().join("tmp")).expect("temp dir").count()
        }
    }

    #[test]
    fn whale_is_saved_and_announced_once() {
        let mut h = Harness::new();
        h.world.borrow_mut().upload("A", "orca.jpg", b"whale-bytes");

        let summary = h.watcher.poll_once().expect("poll");

        assert_eq!(summary.notified, 1);
        assert!(h.watcher.seen().contains("A"));
        assert_eq!(h.saved("orca.jpg").as_deref(), Some(&b"whale-bytes"[..]));
        assert_eq!(h.temp_files(), 0);
        let world = h.world.borrow();
        assert_eq!(world.messages, vec!["🐋 Whale spotted!".to_string()]);
        assert_eq!(world.photos, vec![("orca.jpg".to_string(), b"whale-bytes".to_vec())]);
    }

    #[test]
    fn non_whale_is_deleted_silently() {
        let mut h = Harness::new();
        h.world.borrow_mut().upload("B", "beach.png", b"sand-bytes");

        let summary = h.watcher.poll_once().expect("poll");

        assert_eq!(summary.discarded, 1);
        assert!(h.watcher.seen().contains("B"));
        assert_eq!(h.saved_count(), 0);
        assert_eq!(h.temp_files(), 0);
        assert!(h.world.borrow().messages.is_empty());
        assert!(h.world.borrow().photos.is_empty());
    }

    #[test]
    fn exact_tie_is_not_a_whale() {
        let mut h = Harness::new();
        h.world.borrow_mut().upload("T", "blurry.jpg", b"tie");

        let summary = h.watcher.poll_once().expect("poll");

        assert_eq!(summary.discarded, 1);
        assert_eq!(h.saved_count(), 0);
        assert!(h.world.borrow().messages.is_empty());
    }

    #[test]
    fn seen_images_are_not_fetched_again() {
        let mut h = Harness::new();
        h.world.borrow_mut().upload("A", "orca.jpg", b"whale-bytes");
        h.watcher.poll_once().expect("first poll");

        let summary = h.watcher.poll_once().expect("second poll");

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed(), 0);
        let world = h.world.borrow();
        assert_eq!(world.downloads, vec!["A".to_string()]);
        assert_eq!(world.scored, 1);
        assert_eq!(world.messages.len(), 1);
        assert_eq!(world.photos.len(), 1);
    }

    #[test]
    fn mixed_folder_handles_each_entry() {
        let mut h = Harness::new();
        {
            let mut world = h.world.borrow_mut();
            world.upload("A", "orca.jpg", b"whale-1");
            world.upload("B", "beach.png", b"sand");
            world.upload("C", "humpback.jpg", b"whale-2");
        }

        let summary = h.watcher.poll_once().expect("poll");

        assert_eq!(
            summary,
            PollSummary {
                listed: 3,
                skipped: 0,
                notified: 2,
                discarded: 1,
                failed: 0,
            }
        );
        assert_eq!(h.saved_count(), 2);
        assert_eq!(h.world.borrow().messages.len(), 2);
        assert_eq!(h.watcher.seen().len(), 3);
    }

    #[test]
    fn listing_failure_aborts_without_marking_entries() {
        let mut h = Harness::new();
        {
            let mut world = h.world.borrow_mut();
            world.upload("A", "orca.jpg", b"whale-bytes");
            world.listing_fails = true;
        }

        let err = h.watcher.poll_once().expect_err("listing should fail");

        assert!(matches!(err, PollError::Listing(_)));
        assert_eq!(h.watcher.seen().len(), 0);
        assert!(h.world.borrow().downloads.is_empty());

        h.world.borrow_mut().listing_fails = false;
        let summary = h.watcher.poll_once().expect("retry poll");
        assert_eq!(summary.notified, 1);
    }

    #[test]
    fn transient_download_failure_is_retried_next_poll() {
        let mut h = Harness::new();
        {
            let mut world = h.world.borrow_mut();
            world.upload("A", "orca.jpg", b"whale-bytes");
            world
                .failing_downloads
                .insert("A".into(), StatusCode::SERVICE_UNAVAILABLE);
        }

        let summary = h.watcher.poll_once().expect("poll");
        assert_eq!(summary.failed, 1);
        assert!(!h.watcher.seen().contains("A"));
        assert_eq!(h.temp_files(), 0);

        h.world.borrow_mut().failing_downloads.clear();
        let summary = h.watcher.poll_once().expect("retry poll");
        assert_eq!(summary.notified, 1);
        assert_eq!(h.world.borrow().downloads.len(), 2);
    }

    #[test]
    fn permanent_download_failure_is_not_retried() {
        let mut h = Harness::new();
        {
            let mut world = h.world.borrow_mut();
            world.upload("L", "locked.jpg", b"whale-bytes");
            world.upload("B", "beach.png", b"sand");
            world.failing_downloads.insert("L".into(), StatusCode::FORBIDDEN);
        }

        let summary = h.watcher.poll_once().expect("poll");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.discarded, 1);
        assert!(h.watcher.seen().contains("L"));

        let summary = h.watcher.poll_once().expect("second poll");
        assert_eq!(summary.skipped, 2);
        assert_eq!(h.world.borrow().downloads, vec!["L".to_string(), "B".to_string()]);
    }

    #[test]
    fn empty_image_is_classified_once() {
        let mut h = Harness::new();
        h.world.borrow_mut().upload("E", "empty.jpg", b"");

        h.watcher.poll_once().expect("poll");
        h.watcher.poll_once().expect("second poll");

        assert!(h.watcher.seen().contains("E"));
        assert_eq!(h.world.borrow().downloads.len(), 1);
        assert_eq!(h.temp_files(), 0);
    }

    #[test]
    fn auth_failure_stops_the_iteration() {
        let mut h = Harness::new();
        {
            let mut world = h.world.borrow_mut();
            world.upload("A", "orca.jpg", b"whale-1");
            world.upload("B", "beach.png", b"sand");
            world.auth_broken = true;
        }

        let err = h.watcher.poll_once().expect_err("auth should fail");

        assert!(matches!(err, PollError::Auth(_)));
        assert_eq!(h.world.borrow().downloads, vec!["A".to_string()]);
        assert_eq!(h.watcher.seen().len(), 0);
    }

    #[test]
    fn classification_failure_cleans_up_and_is_not_retried() {
        let mut h = Harness::new();
        h.world.borrow_mut().upload("X", "corrupt.heic", b"broken");

        let summary = h.watcher.poll_once().expect("poll");
        assert_eq!(summary.failed, 1);
        assert!(h.watcher.seen().contains("X"));
        assert_eq!(h.temp_files(), 0);
        assert!(h.world.borrow().messages.is_empty());

        h.watcher.poll_once().expect("second poll");
        assert_eq!(h.world.borrow().downloads.len(), 1);
    }

    #[test]
    fn notification_failure_keeps_the_saved_image() {
        let mut h = Harness::new();
        {
            let mut world = h.world.borrow_mut();
            world.upload("A", "orca.jpg", b"whale-bytes");
            world.notify_fails = true;
        }

        let summary = h.watcher.poll_once().expect("poll");

        assert_eq!(summary.failed, 1);
        assert!(h.watcher.seen().contains("A"));
        assert!(h.saved("orca.jpg").is_some());
        assert_eq!(h.temp_files(), 0);
    }

    #[test]
    fn remote_names_cannot_escape_the_save_dir() {
        let mut h = Harness::new();
        h.world
            .borrow_mut()
            .upload("A", "../../outside/orca.jpg", b"whale-bytes");

        h.watcher.poll_once().expect("poll");

        assert!(h.saved("orca.jpg").is_some());
        assert!(!h.dir.path().join("outside").exists());
    }

    #[test]
    fn unusable_name_falls_back_to_id() {
        let entry = RemoteImage {
            id: "1xYz".into(),
            name: "..".into(),
        };
        assert_eq!(local_file_name(&entry), "1xYz");
    }

    #[test]
    fn seen_set_tracks_and_forgets() {
        let mut seen = SeenSet::new();
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.contains("a"));
        seen.forget("a");
        assert!(!seen.contains("a"));
        assert_eq!(seen.len(), 0);
    }
}
