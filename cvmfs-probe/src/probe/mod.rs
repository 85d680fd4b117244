//! The probe engine: one measurement pass per invocation.
//!
//! For every configured repository the engine times a directory listing of
//! the mount point under a hard wall-clock bound, verifies the mount through
//! the `user.fqrn` attribute, reads the driver process memory via
//! `user.pid`, and samples the configured `user.<name>` counters. A failing
//! measurement is logged and degrades to a sentinel sample or a skip; it
//! never stops the cycle or touches sibling repositories.

pub mod inspect;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use tokio::task;
use tokio::time::timeout;

use crate::config::ProbeConfig;
use crate::telemetry::{MetricSink, PLUGIN_NAME, Sample};
use inspect::{MemoryUsage, MountInspector, SystemInspector};

/// Root under which every repository is expected to be mounted.
pub const CVMFS_ROOT: &str = "/cvmfs";

pub struct ProbeEngine {
    inspector: Arc<dyn MountInspector>,
}

impl Default for ProbeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeEngine {
    pub fn new() -> Self {
        Self::with_inspector(Arc::new(SystemInspector))
    }

    pub fn with_inspector(inspector: Arc<dyn MountInspector>) -> Self {
        Self { inspector }
    }

    /// One measurement pass over every repository in `config`. Failures are
    /// logged and converted to sentinel samples; nothing escapes this call.
    pub async fn read(&self, config: &ProbeConfig, sink: &dyn MetricSink) {
        if config.verbose {
            info!("{PLUGIN_NAME} plugin: probing config: {config}");
        }
        for repo in &config.repos {
            self.probe_repo(repo, config, sink).await;
        }
    }

    async fn probe_repo(&self, repo: &str, config: &ProbeConfig, sink: &dyn MetricSink) {
        let mountpoint = Path::new(CVMFS_ROOT).join(repo);
        let interval = config.interval;

        if config.mounttime {
            match self.read_mounttime(&mountpoint, config.mount_timeout).await {
                Ok(elapsed) => {
                    sink.dispatch(Sample::new(
                        repo,
                        "mounttime",
                        elapsed.as_secs_f64(),
                        interval,
                    ));
                    sink.dispatch(Sample::new(repo, "mountok", 1.0, interval));
                }
                Err(e) => {
                    warn!("{PLUGIN_NAME}: failed to get MountTime for repo {repo}: {e:#}");
                    sink.dispatch(Sample::new(repo, "mountok", 0.0, interval));
                    return;
                }
            }
        }

        if config.memory {
            match self.read_memory(&mountpoint) {
                Ok(mem) => {
                    sink.dispatch(Sample::with_instance(
                        repo,
                        "memory",
                        "rss",
                        mem.rss as f64,
                        interval,
                    ));
                    sink.dispatch(Sample::with_instance(
                        repo,
                        "memory",
                        "vms",
                        mem.vms as f64,
                        interval,
                    ));
                }
                Err(e) => {
                    warn!("{PLUGIN_NAME}: failed to get Memory for repo {repo}: {e:#}");
                    sink.dispatch(Sample::with_instance(repo, "memory", "rss", 0.0, interval));
                    sink.dispatch(Sample::with_instance(repo, "memory", "vms", 0.0, interval));
                    return;
                }
            }
        }

        for attribute in &config.attributes {
            match self.read_attribute(&mountpoint, attribute) {
                Ok(value) => sink.dispatch(Sample::new(repo, attribute, value, interval)),
                Err(e) => warn!(
                    "{PLUGIN_NAME}: failed to inspect attribute \"user.{attribute}\" in repo \"{}\": {e:#}",
                    mountpoint.display()
                ),
            }
        }
    }

    /// Time a directory listing of the mount point, bounded by `bound`.
    ///
    /// The listing runs on a blocking worker that is abandoned, not
    /// cancelled, when the bound expires; the worker cannot be preempted
    /// mid-syscall, so the engine just stops waiting. A completed listing is
    /// only trusted once `user.fqrn` reads back, which distinguishes a live
    /// mount from a stale directory under the mount root.
    async fn read_mounttime(&self, mountpoint: &Path, bound: Duration) -> Result<Duration> {
        let inspector = Arc::clone(&self.inspector);
        let path: PathBuf = mountpoint.to_path_buf();
        let start = Instant::now();
        let listing = task::spawn_blocking(move || inspector.scan_dir(&path));

        match timeout(bound, listing).await {
            Err(_) => bail!("listing timed out after {} seconds", bound.as_secs_f64()),
            Ok(Err(join_error)) => bail!("listing worker failed: {join_error}"),
            Ok(Ok(Err(e))) => return Err(e).context("listing failed"),
            Ok(Ok(Ok(_entries))) => {}
        }
        let elapsed = start.elapsed();

        self.inspector
            .read_xattr(mountpoint, "user.fqrn")
            .context("repository was not mounted correctly")?;

        Ok(elapsed)
    }

    fn read_memory(&self, mountpoint: &Path) -> Result<MemoryUsage> {
        let raw = self.inspector.read_xattr(mountpoint, "user.pid")?;
        let pid: i32 = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid pid attribute {raw:?}"))?;
        self.inspector.process_memory(pid)
    }

    fn read_attribute(&self, mountpoint: &Path, attribute: &str) -> Result<f64> {
        let name = format!("user.{attribute}");
        let raw = self.inspector.read_xattr(mountpoint, &name)?;
        raw.trim()
            .parse()
            .with_context(|| format!("attribute value {raw:?} is not numeric"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::testing::RecordingSink;
    use inspect::testing::{MOCK_RSS, MOCK_VMS, MockInspector};
    use std::sync::atomic::Ordering;

    fn config_for(repos: &[&str], attributes: &[&str]) -> ProbeConfig {
        ProbeConfig {
            repos: repos.iter().map(|r| r.to_string()).collect(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            ..ProbeConfig::default()
        }
    }

    fn types_of(samples: &[Sample]) -> Vec<(String, Option<String>)> {
        samples
            .iter()
            .map(|s| (s.type_name.clone(), s.type_instance.clone()))
            .collect()
    }

    #[tokio::test]
    async fn all_stages_emit_for_healthy_repo() {
        let inspector =
            MockInspector::default().with_repo("atlas.cern.ch", 42).with_xattr(
                "atlas.cern.ch",
                "nioerr",
                "2",
            );
        let engine = ProbeEngine::with_inspector(Arc::new(inspector));
        let sink = RecordingSink::default();

        engine
            .read(&config_for(&["atlas.cern.ch"], &["nioerr"]), &sink)
            .await;

        let samples = sink.samples();
        assert_eq!(
            types_of(&samples),
            vec![
                ("mounttime".to_string(), None),
                ("mountok".to_string(), None),
                ("memory".to_string(), Some("rss".to_string())),
                ("memory".to_string(), Some("vms".to_string())),
                ("nioerr".to_string(), None),
            ]
        );
        assert!(samples[0].value >= 0.0);
        assert_eq!(samples[1].value, 1.0);
        assert_eq!(samples[2].value, MOCK_RSS as f64);
        assert_eq!(samples[3].value, MOCK_VMS as f64);
        assert_eq!(samples[4].value, 2.0);
        assert!(samples.iter().all(|s| s.plugin_instance == "atlas.cern.ch"));
    }

    #[tokio::test]
    async fn empty_repo_list_emits_nothing_and_touches_nothing() {
        let inspector = Arc::new(MockInspector::default());
        let engine = ProbeEngine::with_inspector(inspector.clone());
        let sink = RecordingSink::default();

        engine.read(&config_for(&[], &["nioerr"]), &sink).await;

        assert!(sink.samples().is_empty());
        assert_eq!(inspector.scan_calls.load(Ordering::SeqCst), 0);
        assert_eq!(inspector.xattr_calls.load(Ordering::SeqCst), 0);
        assert_eq!(inspector.memory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mounttime_disabled_skips_liveness_but_runs_later_stages() {
        let inspector = Arc::new(MockInspector::default().with_repo("atlas.cern.ch", 42));
        let engine = ProbeEngine::with_inspector(inspector.clone());
        let sink = RecordingSink::default();

        let config = ProbeConfig {
            mounttime: false,
            ..config_for(&["atlas.cern.ch"], &[])
        };
        engine.read(&config, &sink).await;

        let samples = sink.samples();
        assert_eq!(
            types_of(&samples),
            vec![
                ("memory".to_string(), Some("rss".to_string())),
                ("memory".to_string(), Some("vms".to_string())),
            ]
        );
        assert_eq!(inspector.scan_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn memory_disabled_skips_memory_stage() {
        let inspector = Arc::new(
            MockInspector::default()
                .with_repo("atlas.cern.ch", 42)
                .with_xattr("atlas.cern.ch", "usedfd", "7"),
        );
        let engine = ProbeEngine::with_inspector(inspector.clone());
        let sink = RecordingSink::default();

        let config = ProbeConfig {
            memory: false,
            ..config_for(&["atlas.cern.ch"], &["usedfd"])
        };
        engine.read(&config, &sink).await;

        let samples = sink.samples();
        assert_eq!(
            types_of(&samples),
            vec![
                ("mounttime".to_string(), None),
                ("mountok".to_string(), None),
                ("usedfd".to_string(), None),
            ]
        );
        assert_eq!(inspector.memory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_listing_emits_mountok_zero_and_spares_siblings() {
        let inspector = MockInspector::default()
            .with_repo("alice.cern.ch", 10)
            .with_repo("atlas.cern.ch", 42)
            .with_failing_scan("alice.cern.ch");
        let engine = ProbeEngine::with_inspector(Arc::new(inspector));
        let sink = RecordingSink::default();

        engine
            .read(&config_for(&["alice.cern.ch", "atlas.cern.ch"], &[]), &sink)
            .await;

        let samples = sink.samples();
        let alice: Vec<_> = samples
            .iter()
            .filter(|s| s.plugin_instance == "alice.cern.ch")
            .collect();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].type_name, "mountok");
        assert_eq!(alice[0].value, 0.0);

        let atlas: Vec<_> = samples
            .iter()
            .filter(|s| s.plugin_instance == "atlas.cern.ch")
            .collect();
        assert_eq!(atlas.len(), 4);
        assert_eq!(atlas[1].type_name, "mountok");
        assert_eq!(atlas[1].value, 1.0);
    }

    #[tokio::test]
    async fn missing_fqrn_counts_as_not_mounted() {
        let inspector = MockInspector::default()
            .with_repo("atlas.cern.ch", 42)
            .without_xattr("atlas.cern.ch", "fqrn");
        let engine = ProbeEngine::with_inspector(Arc::new(inspector));
        let sink = RecordingSink::default();

        engine.read(&config_for(&["atlas.cern.ch"], &[]), &sink).await;

        let samples = sink.samples();
        assert_eq!(types_of(&samples), vec![("mountok".to_string(), None)]);
        assert_eq!(samples[0].value, 0.0);
    }

    #[tokio::test]
    async fn memory_failure_emits_zero_sentinels_and_skips_attributes() {
        let inspector = MockInspector::default()
            .with_repo("atlas.cern.ch", 42)
            .without_xattr("atlas.cern.ch", "pid")
            .with_xattr("atlas.cern.ch", "nioerr", "2");
        let engine = ProbeEngine::with_inspector(Arc::new(inspector));
        let sink = RecordingSink::default();

        engine
            .read(&config_for(&["atlas.cern.ch"], &["nioerr"]), &sink)
            .await;

        let samples = sink.samples();
        assert_eq!(
            types_of(&samples),
            vec![
                ("mounttime".to_string(), None),
                ("mountok".to_string(), None),
                ("memory".to_string(), Some("rss".to_string())),
                ("memory".to_string(), Some("vms".to_string())),
            ]
        );
        assert_eq!(samples[2].value, 0.0);
        assert_eq!(samples[3].value, 0.0);
    }

    #[tokio::test]
    async fn unparseable_pid_is_a_memory_failure() {
        let inspector = MockInspector::default()
            .with_repo("atlas.cern.ch", 42)
            .with_xattr("atlas.cern.ch", "pid", "not-a-pid");
        let engine = ProbeEngine::with_inspector(Arc::new(inspector));
        let sink = RecordingSink::default();

        engine.read(&config_for(&["atlas.cern.ch"], &[]), &sink).await;

        let samples = sink.samples();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[2].value, 0.0);
        assert_eq!(samples[3].value, 0.0);
    }

    #[tokio::test]
    async fn one_bad_attribute_does_not_block_the_others() {
        let inspector = MockInspector::default()
            .with_repo("atlas.cern.ch", 42)
            .with_xattr("atlas.cern.ch", "ndownload", "5")
            .with_xattr("atlas.cern.ch", "usedfd", "17.5");
        let engine = ProbeEngine::with_inspector(Arc::new(inspector));
        let sink = RecordingSink::default();

        engine
            .read(
                &config_for(&["atlas.cern.ch"], &["ndownload", "nioerr", "usedfd"]),
                &sink,
            )
            .await;

        let attribute_samples: Vec<_> = sink
            .samples()
            .into_iter()
            .filter(|s| s.type_name != "mounttime" && s.type_name != "mountok" && s.type_name != "memory")
            .collect();
        assert_eq!(attribute_samples.len(), 2);
        assert_eq!(attribute_samples[0].type_name, "ndownload");
        assert_eq!(attribute_samples[0].value, 5.0);
        assert_eq!(attribute_samples[1].type_name, "usedfd");
        assert_eq!(attribute_samples[1].value, 17.5);
    }

    #[tokio::test]
    async fn non_numeric_attribute_is_skipped() {
        let inspector = MockInspector::default()
            .with_repo("atlas.cern.ch", 42)
            .with_xattr("atlas.cern.ch", "version", "2.11.0-1");
        let engine = ProbeEngine::with_inspector(Arc::new(inspector));
        let sink = RecordingSink::default();

        engine
            .read(&config_for(&["atlas.cern.ch"], &["version"]), &sink)
            .await;

        assert!(sink.samples().iter().all(|s| s.type_name != "version"));
    }

    #[tokio::test]
    async fn hung_listing_is_abandoned_at_the_timeout() {
        let inspector = MockInspector::default()
            .with_repo("alice.cern.ch", 10)
            .with_repo("atlas.cern.ch", 42)
            .with_scan_delay(Duration::from_millis(600));
        let engine = ProbeEngine::with_inspector(Arc::new(inspector));
        let sink = RecordingSink::default();

        let config = ProbeConfig {
            mount_timeout: Duration::from_millis(100),
            ..config_for(&["alice.cern.ch", "atlas.cern.ch"], &[])
        };

        let start = Instant::now();
        engine.read(&config, &sink).await;
        let elapsed = start.elapsed();

        // Two repositories, each bounded at 100ms; well under the 600ms the
        // listings themselves take.
        assert!(
            elapsed < Duration::from_millis(450),
            "cycle took {elapsed:?}"
        );

        let samples = sink.samples();
        assert_eq!(samples.len(), 2);
        for (sample, repo) in samples.iter().zip(["alice.cern.ch", "atlas.cern.ch"]) {
            assert_eq!(sample.plugin_instance, repo);
            assert_eq!(sample.type_name, "mountok");
            assert_eq!(sample.value, 0.0);
        }
    }
}
