//! Writes one batch into its metric's archive file.
//!
//! Every failure here is contained: a missing policy, an I/O error or a
//! panic inside the archive append is logged and the batch is dropped, and
//! the worker moves on to the next batch.

use std::panic::{self, AssertUnwindSafe};
use std::path::{MAIN_SEPARATOR_STR, Path, PathBuf};
use std::sync::Arc;

use crate::archive::{ArchiveFactory, ArchiveHandle};
use crate::points::Points;
use crate::schema::MetricRouter;
use crate::stats::Stats;

/// File extension of archive files.
pub const ARCHIVE_EXTENSION: &str = "wsp";

/// Maps a metric name to its archive path under `root`.
///
/// # Examples
///
/// ```rust
/// use carbide::writer::archive_path;
/// use std::path::Path;
///
/// let path = archive_path(Path::new("/var/lib/carbide"), "servers.web1.cpu");
/// assert_eq!(path, Path::new("/var/lib/carbide/servers/web1/cpu.wsp"));
/// ```
pub fn archive_path(root: &Path, metric: &str) -> PathBuf {
    let relative = metric.replace('.', MAIN_SEPARATOR_STR);
    root.join(format!("{relative}.{ARCHIVE_EXTENSION}"))
}

/// Opens or creates archives and appends batches to them.
pub struct StoreWriter {
    root: PathBuf,
    router: Arc<dyn MetricRouter>,
    factory: Arc<dyn ArchiveFactory>,
    stats: Arc<Stats>,
}

impl StoreWriter {
    /// Creates a writer rooted at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        router: Arc<dyn MetricRouter>,
        factory: Arc<dyn ArchiveFactory>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            root: root.into(),
            router,
            factory,
            stats,
        }
    }

    /// Root directory of the archive tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Counters updated by this writer.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Stores one batch. Never fails and never panics outward.
    ///
    /// The write counters are bumped before the append is attempted, so a
    /// failed or panicking append still shows up as a committed write.
    pub fn store(&self, points: &Points) {
        let path = archive_path(&self.root, &points.metric);

        let mut archive = match self.factory.open(&path) {
            Ok(archive) => archive,
            Err(_) => match self.create(&path, &points.metric) {
                Some(archive) => archive,
                None => return,
            },
        };

        self.stats.record_write(points.len());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| archive.update_many(&points.data)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(path = %path.display(), "update failed: {e}");
            }
            Err(fault) => {
                tracing::error!(
                    path = %path.display(),
                    "update recovered from panic: {}",
                    panic_message(fault.as_ref())
                );
            }
        }

        if let Err(e) = archive.close() {
            tracing::warn!(path = %path.display(), "close failed: {e}");
        }
    }

    /// Creates the archive for a metric seen for the first time.
    fn create(&self, path: &Path, metric: &str) -> Option<Box<dyn ArchiveHandle>> {
        let Some(schema) = self.router.storage_policy(metric) else {
            tracing::error!(metric, "no storage schema defined");
            return None;
        };

        let Some(aggregation) = self.router.aggregation_policy(metric) else {
            tracing::error!(metric, "no storage aggregation defined");
            return None;
        };

        tracing::debug!(
            path = %path.display(),
            schema = %schema.name,
            retention = %schema.retentions_text,
            aggregation = %aggregation.name,
            x_files_factor = aggregation.x_files_factor,
            method = %aggregation.method,
            "creating archive"
        );

        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::error!(path = %parent.display(), "failed to create directory: {e}");
            return None;
        }

        match self.factory.create(
            path,
            &schema.retentions,
            aggregation.method,
            aggregation.x_files_factor,
        ) {
            Ok(archive) => {
                self.stats.record_created();
                Some(archive)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), "failed to create archive: {e}");
                None
            }
        }
    }
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn panic_message(fault: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = fault.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = fault.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingArchives;
    use super::*;
    use crate::archive::{ArchiveFile, DiskArchives};
    use crate::schema::{AggregationRule, SchemaRouter, StorageRule};

    fn router() -> Arc<dyn MetricRouter> {
        Arc::new(
            SchemaRouter::from_rules(
                &[StorageRule::new("servers", "^servers\\.", "10s:1h,1m:1d")],
                &[AggregationRule::default()],
            )
            .unwrap(),
        )
    }

    fn writer(root: &Path, factory: Arc<dyn ArchiveFactory>) -> StoreWriter {
        StoreWriter::new(root, router(), factory, Arc::new(Stats::new()))
    }

    #[test]
    fn test_archive_path() {
        let root = Path::new("/data");
        assert_eq!(archive_path(root, "a"), Path::new("/data/a.wsp"));
        assert_eq!(archive_path(root, "a.b.c"), Path::new("/data/a/b/c.wsp"));
    }

    #[test]
    fn test_first_write_creates_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let archives = RecordingArchives::default();
        let w = writer(temp_dir.path(), Arc::new(archives.clone()));

        w.store(&Points::one_point("servers.web1.cpu", 1.0, 100));
        w.store(&Points::new("servers.web1.cpu").add(2.0, 110).add(3.0, 120));

        let journal = archives.journal();
        assert_eq!(journal.creates, vec![temp_dir.path().join("servers/web1/cpu.wsp")]);
        assert_eq!(journal.opens.len(), 1);
        assert_eq!(journal.updates.len(), 2);
        assert_eq!(journal.closes, 2);
        drop(journal);

        let snapshot = w.stats().peek();
        assert_eq!(snapshot.created_files, 1);
        assert_eq!(snapshot.committed_writes, 2);
        assert_eq!(snapshot.committed_points, 3);
    }

    #[test]
    fn test_missing_policy_touches_nothing() {
        let archives = RecordingArchives::default();
        let temp_dir = tempfile::tempdir().unwrap();
        let w = writer(temp_dir.path(), Arc::new(archives.clone()));

        w.store(&Points::one_point("unmatched.metric", 1.0, 100));

        let journal = archives.journal();
        assert!(journal.creates.is_empty());
        assert!(journal.updates.is_empty());
        assert_eq!(journal.closes, 0);
        assert_eq!(w.stats().peek(), crate::stats::Checkpoint::default());
        assert!(!temp_dir.path().join("unmatched").exists());
    }

    #[test]
    fn test_missing_aggregation_touches_nothing() {
        let archives = RecordingArchives::default();
        let router = SchemaRouter::from_rules(
            &[StorageRule::new("all", ".*", "60:100")],
            &[AggregationRule {
                pattern: "^only\\.this$".to_string(),
                ..AggregationRule::default()
            }],
        )
        .unwrap();
        let w = StoreWriter::new(
            "/data",
            Arc::new(router),
            Arc::new(archives.clone()),
            Arc::new(Stats::new()),
        );

        w.store(&Points::one_point("servers.web1.cpu", 1.0, 100));
        assert!(archives.journal().creates.is_empty());
        assert_eq!(w.stats().peek(), crate::stats::Checkpoint::default());
    }

    #[test]
    fn test_panicking_append_is_contained_and_counted() {
        let archives = RecordingArchives::default();
        archives.panic_on("bad.wsp");
        let temp_dir = tempfile::tempdir().unwrap();
        let w = writer(temp_dir.path(), Arc::new(archives.clone()));

        w.store(&Points::new("servers.bad").add(1.0, 100).add(2.0, 110));
        w.store(&Points::one_point("servers.good", 1.0, 100));

        assert!(archives.updates_for("bad.wsp").is_empty());
        assert_eq!(archives.updates_for("good.wsp").len(), 1);
        // The handle of the panicking append was still closed
        assert_eq!(archives.journal().closes, 2);

        let snapshot = w.stats().peek();
        assert_eq!(snapshot.committed_writes, 2);
        assert_eq!(snapshot.committed_points, 3);
    }

    #[test]
    fn test_failed_append_is_counted_and_closed() {
        let archives = RecordingArchives::default();
        archives.fail_on("broken.wsp");
        let temp_dir = tempfile::tempdir().unwrap();
        let w = writer(temp_dir.path(), Arc::new(archives.clone()));

        w.store(&Points::new("servers.broken").add(1.0, 100).add(2.0, 110));
        w.store(&Points::one_point("servers.broken", 3.0, 120));
        w.store(&Points::one_point("servers.good", 1.0, 100));

        assert!(archives.updates_for("broken.wsp").is_empty());
        assert_eq!(archives.updates_for("good.wsp").len(), 1);

        let journal = archives.journal();
        assert_eq!(journal.creates.len(), 2);
        // The failing archive is reopened, not recreated, on its second batch
        assert_eq!(journal.opens, vec![temp_dir.path().join("servers/broken.wsp")]);
        assert_eq!(journal.closes, 3);
        drop(journal);

        let snapshot = w.stats().peek();
        assert_eq!(snapshot.committed_writes, 3);
        assert_eq!(snapshot.committed_points, 4);
        assert_eq!(snapshot.created_files, 2);
    }

    #[test]
    fn test_disk_archives_end_to_end() {
        let temp_dir = tempfile::tempdir().unwrap();
        let w = writer(temp_dir.path(), Arc::new(DiskArchives));

        w.store(&Points::new("servers.web1.cpu").add(1.0, 1_700_000_000).add(2.0, 1_700_000_010));
        w.store(&Points::one_point("servers.web1.cpu", 3.0, 1_700_000_020));

        let path = temp_dir.path().join("servers/web1/cpu.wsp");
        let file = ArchiveFile::open(&path).unwrap();
        assert_eq!(file.archives().len(), 2);
        assert_eq!(file.fetch_archive(0).unwrap().len(), 3);
        assert_eq!(w.stats().peek().created_files, 1);
    }

    #[test]
    fn test_create_failure_drops_batch() {
        let temp_dir = tempfile::tempdir().unwrap();
        // A plain file where the metric's directory should be
        std::fs::write(temp_dir.path().join("servers"), b"").unwrap();
        let w = writer(temp_dir.path(), Arc::new(DiskArchives));

        w.store(&Points::one_point("servers.web1.cpu", 1.0, 1_700_000_000));
        assert_eq!(w.stats().peek(), crate::stats::Checkpoint::default());
    }

    #[test]
    fn test_corrupt_existing_file_is_not_overwritten() {
        let temp_dir = tempfile::tempdir().unwrap();
        let w = writer(temp_dir.path(), Arc::new(DiskArchives));
        let path = temp_dir.path().join("servers/web1/cpu.wsp");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        w.store(&Points::one_point("servers.web1.cpu", 1.0, 1_700_000_000));

        assert_eq!(std::fs::read(&path).unwrap(), b"garbage");
        assert_eq!(w.stats().peek().committed_writes, 0);
    }
}
