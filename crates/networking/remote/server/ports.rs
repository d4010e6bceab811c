use crate::error::RemoteError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const LOCK_SUFFIX: &str = ".lock";
const LOCK_RETRIES: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// One leased data port.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Lease {
    port: u16,
    pid: u32,
    leased_at: u64,
}

/// An on-disk list of leased data ports, shared by every server process on
/// the host.
///
/// A lease is never released by its owner; instead `reap` drops leases
/// whose process has been gone for longer than the grace period, which
/// makes crashed workers harmless. The file is a line-per-lease text
/// format guarded by a lock file.
pub struct AvailablePortList {
    path: PathBuf,
    start: u16,
    count: u16,
}

impl AvailablePortList {
    pub fn new(path: impl Into<PathBuf>, start: u16, count: u16) -> Self {
        Self {
            path: path.into(),
            start,
            count,
        }
    }

    /// Leases the lowest free port in the range.
    pub fn acquire(&self) -> Result<u16, RemoteError> {
        let _lock = ListLock::acquire(&self.path)?;
        let mut leases = self.read_leases()?;
        let taken: Vec<u16> = leases.iter().map(|l| l.port).collect();
        let port = (self.start..self.start.saturating_add(self.count))
            .find(|p| !taken.contains(p))
            .ok_or(RemoteError::PortsExhausted)?;
        leases.push(Lease {
            port,
            pid: std::process::id(),
            leased_at: now(),
        });
        self.write_leases(&leases)?;
        debug!(port, "leased data port");
        Ok(port)
    }

    /// Drops leases held by processes dead for longer than `grace`.
    pub fn reap(&self, grace: Duration) -> Result<usize, RemoteError> {
        let _lock = ListLock::acquire(&self.path)?;
        let leases = self.read_leases()?;
        let cutoff = now().saturating_sub(grace.as_secs());
        let before = leases.len();
        let kept: Vec<Lease> = leases
            .into_iter()
            .filter(|lease| process_alive(lease.pid) || lease.leased_at > cutoff)
            .collect();
        let reaped = before - kept.len();
        if reaped > 0 {
            self.write_leases(&kept)?;
            debug!(reaped, "reaped dead port leases");
        }
        Ok(reaped)
    }

    fn read_leases(&self) -> Result<Vec<Lease>, RemoteError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut leases = Vec::new();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(port), Some(pid), Some(at)) => {
                    match (port.parse(), pid.parse(), at.parse()) {
                        (Ok(port), Ok(pid), Ok(leased_at)) => leases.push(Lease {
                            port,
                            pid,
                            leased_at,
                        }),
                        _ => warn!(line, "skipping malformed port lease"),
                    }
                }
                _ => warn!(line, "skipping malformed port lease"),
            }
        }
        Ok(leases)
    }

    fn write_leases(&self, leases: &[Lease]) -> Result<(), RemoteError> {
        let mut text = String::new();
        for lease in leases {
            text.push_str(&format!("{} {} {}\n", lease.port, lease.pid, lease.leased_at));
        }
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes existence without touching the process.
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

struct ListLock {
    path: PathBuf,
}

impl ListLock {
    fn acquire(list_path: &Path) -> Result<Self, RemoteError> {
        let mut os_string = list_path.as_os_str().to_os_string();
        os_string.push(LOCK_SUFFIX);
        let path = PathBuf::from(os_string);
        for _ in 0..LOCK_RETRIES {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RemoteError::transport(
            path.display().to_string(),
            "port list lock busy",
        ))
    }
}

impl Drop for ListLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
