/// Alarm daemon: consumes due entries from the file alarm store and delivers
/// them to the host.
///
/// A live host (the pid that armed the entry) gets the kind's signal. A dead
/// one is relaunched with the fire attached in `REVIVE_ALARM`, which is what
/// lets a crashed or hung host come back after it terminated itself. A pid
/// that is alive but started after the entry was armed has been reused by
/// another process and counts as dead.
use crate::actuator::RESPAWN_ENV;
use crate::alarm_store::{AlarmEntry, FileAlarmStore};
use crate::config::AlarmdConfig;
use crate::data_dir::DataDir;
use crate::delivery::{signal_for, ALARM_ENV};
use crate::timer::{AlarmError, TimerKind};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{sysconf, Pid, SysconfVar};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Fires arriving this soon after a relaunch are dropped: the child has not
/// installed its signal handlers yet and re-arms its own timers on start.
const LAUNCH_GRACE: Duration = Duration::from_secs(2);

/// Slack on the start-time comparison; `btime` has one-second resolution.
const START_TOLERANCE_MS: i64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("an alarm daemon already holds {}", path.display())]
    AlreadyRunning { path: PathBuf },
    #[error("failed to open daemon lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] AlarmError),
    #[error("failed to install shutdown signal handler: {0}")]
    Signal(std::io::Error),
}

/// What happened to one due entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Signalled { kind: TimerKind, pid: u32 },
    Relaunched { kind: TimerKind, pid: u32 },
    Dropped { kind: TimerKind },
}

/// A host process this daemon relaunched.
struct LaunchedChild {
    pid: u32,
    launched_at: Instant,
    exited: Arc<AtomicBool>,
}

impl LaunchedChild {
    fn is_running(&self) -> bool {
        !self.exited.load(Ordering::Acquire)
    }
}

pub struct AlarmDaemon {
    store: FileAlarmStore,
    config: AlarmdConfig,
    child: Option<LaunchedChild>,
    _lock: File,
}

impl AlarmDaemon {
    /// Take the singleton lock for `data_dir` and open its alarm store.
    pub fn acquire(data_dir: DataDir, config: AlarmdConfig) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(data_dir.root()).map_err(|e| DaemonError::Lock {
            path: data_dir.root().to_path_buf(),
            source: e,
        })?;
        let path = data_dir.daemon_lock();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| DaemonError::Lock {
                path: path.clone(),
                source: e,
            })?;
        if lock.try_lock_exclusive().is_err() {
            return Err(DaemonError::AlreadyRunning { path });
        }
        let store = FileAlarmStore::open(data_dir)?;
        Ok(Self {
            store,
            config,
            child: None,
            _lock: lock,
        })
    }

    /// Poll until Ctrl-C or SIGTERM.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            data_dir = %self.store.data_dir().root().display(),
            poll_ms = self.config.poll_interval_ms,
            command = ?self.config.command,
            "alarm daemon started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()) {
                        tracing::error!(error = %e, "alarm poll failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
                _ = term.recv() => break,
            }
        }
        tracing::info!("alarm daemon stopping");
        Ok(())
    }

    /// Deliver every entry due at `now`. Must run inside a tokio runtime.
    pub fn poll_once(&mut self, now: DateTime<Utc>) -> Result<Vec<Delivery>, DaemonError> {
        let due = self.store.take_due(now)?;
        Ok(due.iter().map(|entry| self.deliver(entry)).collect())
    }

    fn deliver(&mut self, entry: &AlarmEntry) -> Delivery {
        let kind = entry.kind;
        if is_arming_process(entry) {
            return self.signal(kind, entry.pid);
        }

        if let Some(child) = self.child.as_ref().filter(|c| c.is_running()) {
            if child.launched_at.elapsed() < LAUNCH_GRACE {
                tracing::debug!(%kind, pid = child.pid, "fire dropped: host is still starting");
                return Delivery::Dropped { kind };
            }
            let pid = child.pid;
            return self.signal(kind, pid);
        }

        match self.relaunch(kind) {
            Some(pid) => Delivery::Relaunched { kind, pid },
            None => Delivery::Dropped { kind },
        }
    }

    fn signal(&self, kind: TimerKind, pid: u32) -> Delivery {
        let sig = signal_for(kind);
        match to_pid(pid).map(|p| kill(p, sig)) {
            Some(Ok(())) => {
                tracing::debug!(%kind, pid, signal = %sig, "alarm delivered");
                Delivery::Signalled { kind, pid }
            }
            Some(Err(e)) => {
                tracing::warn!(%kind, pid, error = %e, "failed to signal host");
                Delivery::Dropped { kind }
            }
            None => Delivery::Dropped { kind },
        }
    }

    fn relaunch(&mut self, kind: TimerKind) -> Option<u32> {
        let Some(command) = &self.config.command else {
            tracing::warn!(%kind, "host is gone and no launch command is configured; fire dropped");
            return None;
        };

        let mut child = match Command::new(command)
            .args(&self.config.args)
            .env(ALARM_ENV, kind.as_str())
            .env(RESPAWN_ENV, "1")
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command = %command, error = %e, "failed to relaunch host");
                return None;
            }
        };
        let pid = child.id().unwrap_or(0);
        tracing::info!(%kind, pid, command = %command, "host relaunched for alarm");

        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(pid, exit_code = ?status.code(), "relaunched host exited"),
                Err(e) => tracing::warn!(pid, error = %e, "failed to wait for relaunched host"),
            }
            flag.store(true, Ordering::Release);
        });

        self.child = Some(LaunchedChild {
            pid,
            launched_at: Instant::now(),
            exited,
        });
        Some(pid)
    }
}

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups, never a single host.
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// True when `pid` names an existing process (permission denial counts).
pub fn is_alive(pid: u32) -> bool {
    match to_pid(pid) {
        Some(pid) => matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM)),
        None => false,
    }
}

/// True when the entry's pid is alive and still the process that armed it.
/// An unknown start time gives the pid the benefit of the doubt.
fn is_arming_process(entry: &AlarmEntry) -> bool {
    if !is_alive(entry.pid) {
        return false;
    }
    let Some(started) = started_at(entry.pid) else {
        return true;
    };
    let latest = entry
        .armed_at
        .checked_add_signed(ChronoDuration::milliseconds(START_TOLERANCE_MS))
        .unwrap_or(entry.armed_at);
    if started > latest {
        tracing::warn!(
            pid = entry.pid,
            %started,
            armed_at = %entry.armed_at,
            "pid reused since the alarm was armed"
        );
        return false;
    }
    true
}

/// Wall-clock start time of `pid`, read from procfs.
fn started_at(pid: u32) -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parens; fields resume after the last ')'.
    let (_, fields) = stat.rsplit_once(')')?;
    // Field 22, `starttime`, in clock ticks since boot.
    let ticks: i64 = fields.split_whitespace().nth(19)?.parse().ok()?;
    let boot: i64 = std::fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;
    let hz = i64::from(sysconf(SysconfVar::CLK_TCK).ok()??);
    if hz <= 0 {
        return None;
    }
    let since_boot_ms = ticks.checked_mul(1000)? / hz;
    DateTime::<Utc>::from_timestamp(boot, 0)?
        .checked_add_signed(ChronoDuration::milliseconds(since_boot_ms))
}
