//! OS boundary consumed by the probe engine: directory listing, extended
//! attributes, process memory. Kept behind a trait so the engine can be
//! exercised without live mounts.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};

/// Memory footprint of the filesystem driver process, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub rss: u64,
    pub vms: u64,
}

/// The lookups a probe cycle performs against one mount point.
///
/// `scan_dir` may block indefinitely on a dead mount; the engine runs it on
/// a dedicated worker and bounds the wait itself. The xattr and process
/// lookups have no such bound and are expected to be fast local operations.
pub trait MountInspector: Send + Sync {
    /// Blocking directory listing. Returns the number of entries.
    fn scan_dir(&self, path: &Path) -> io::Result<usize>;

    /// Read an extended attribute as a UTF-8 string. An absent attribute is
    /// an error.
    fn read_xattr(&self, path: &Path, name: &str) -> Result<String>;

    /// Resident and virtual memory of the given process.
    fn process_memory(&self, pid: i32) -> Result<MemoryUsage>;
}

/// Production inspector backed by the real filesystem and /proc.
pub struct SystemInspector;

impl MountInspector for SystemInspector {
    fn scan_dir(&self, path: &Path) -> io::Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn read_xattr(&self, path: &Path, name: &str) -> Result<String> {
        let raw = xattr::get(path, name)
            .with_context(|| format!("failed to read {name} from {}", path.display()))?
            .with_context(|| format!("attribute {name} not present on {}", path.display()))?;
        let value = String::from_utf8(raw)
            .with_context(|| format!("attribute {name} on {} is not valid UTF-8", path.display()))?;
        Ok(value.trim().to_string())
    }

    fn process_memory(&self, pid: i32) -> Result<MemoryUsage> {
        let process =
            procfs::process::Process::new(pid).with_context(|| format!("no such process: {pid}"))?;
        let stat = process
            .stat()
            .with_context(|| format!("failed to stat process {pid}"))?;
        Ok(MemoryUsage {
            rss: stat.rss * procfs::page_size(),
            vms: stat.vsize,
        })
    }
}
