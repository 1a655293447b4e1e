/// Restart actuator: brings the supervised process's primary entry point back
/// to the foreground on behalf of the watchdog.
use std::process::{Command, Stdio};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Environment variable carrying the respawn flag into a relaunched process.
pub const RESPAWN_ENV: &str = "REVIVE_RESPAWN";

/// Flag attached to a relaunch request.
///
/// Distinguishes a forced respawn by the watchdog from a normal user launch.
/// Read once at startup for logging; it never changes control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartSignal {
    pub respawn: bool,
}

impl RestartSignal {
    pub const RESPAWN: RestartSignal = RestartSignal { respawn: true };

    /// Read the flag placed in the environment by [`CommandActuator`].
    pub fn from_env() -> Self {
        let respawn = std::env::var(RESPAWN_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self { respawn }
    }
}

pub trait RestartActuator: Send + Sync {
    /// Bring the primary entry point forward as the only instance, clearing
    /// any intermediate navigation state, and forward `signal` to it.
    fn bring_to_front(&self, signal: RestartSignal);
}

/// Launches a configured command, without waiting for it.
///
/// The command is expected to raise (or start) the primary UI of the host,
/// e.g. a window-manager activation script.
#[derive(Debug, Clone)]
pub struct CommandActuator {
    command: String,
    args: Vec<String>,
}

impl CommandActuator {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl CommandActuator {
    /// Spawn the command and return its pid. The child is waited on from a
    /// reaper thread so it never lingers as a zombie.
    pub fn launch(&self, signal: RestartSignal) -> Option<u32> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if signal.respawn {
            cmd.env(RESPAWN_ENV, "1");
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    command = %self.command,
                    error = %e,
                    "restart actuator failed to launch"
                );
                return None;
            }
        };
        let pid = child.id();
        tracing::info!(
            command = %self.command,
            pid,
            respawn = signal.respawn,
            "restart actuator launched"
        );
        let reaper = std::thread::Builder::new()
            .name("actuator-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => tracing::debug!(pid, code = ?status.code(), "restart actuator exited"),
                Err(e) => tracing::warn!(pid, error = %e, "restart actuator not reaped"),
            });
        if let Err(e) = reaper {
            tracing::warn!(pid, error = %e, "could not start reaper thread");
        }
        Some(pid)
    }
}

impl RestartActuator for CommandActuator {
    fn bring_to_front(&self, signal: RestartSignal) {
        self.launch(signal);
    }
}

/// Forwards restart requests to the host's own main loop.
///
/// Used when the host can raise its primary unit in-process.
#[derive(Debug, Clone)]
pub struct ChannelActuator {
    tx: mpsc::UnboundedSender<RestartSignal>,
}

impl ChannelActuator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RestartSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RestartActuator for ChannelActuator {
    fn bring_to_front(&self, signal: RestartSignal) {
        if self.tx.send(signal).is_err() {
            tracing::warn!("restart requested but the host main loop is gone");
        }
    }
}

/// Hands every request to each inner actuator in order.
pub struct FanoutActuator {
    targets: Vec<Arc<dyn RestartActuator>>,
}

impl FanoutActuator {
    pub fn new(targets: Vec<Arc<dyn RestartActuator>>) -> Self {
        Self { targets }
    }
}

impl RestartActuator for FanoutActuator {
    fn bring_to_front(&self, signal: RestartSignal) {
        for target in &self.targets {
            target.bring_to_front(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_actuator_forwards_signal() {
        let (actuator, mut rx) = ChannelActuator::new();
        actuator.bring_to_front(RestartSignal::RESPAWN);
        assert_eq!(rx.try_recv().unwrap(), RestartSignal { respawn: true });
    }

    #[test]
    fn test_channel_actuator_closed_receiver_does_not_panic() {
        let (actuator, rx) = ChannelActuator::new();
        drop(rx);
        actuator.bring_to_front(RestartSignal::RESPAWN);
    }

    #[test]
    fn test_command_actuator_spawns_with_respawn_env() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("respawn");
        let actuator = CommandActuator::new(
            "sh",
            vec![
                "-c".to_string(),
                format!("printf \"$REVIVE_RESPAWN\" > {}", marker.display()),
            ],
        );
        actuator.bring_to_front(RestartSignal::RESPAWN);

        // Fire-and-forget: poll briefly for the child's output.
        let mut contents = String::new();
        for _ in 0..50 {
            if let Ok(c) = std::fs::read_to_string(&marker) {
                if !c.is_empty() {
                    contents = c;
                    break;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(contents, "1");
    }

    #[test]
    fn test_command_actuator_missing_binary_does_not_panic() {
        let actuator = CommandActuator::new("nonexistent-binary-xyz", vec![]);
        actuator.bring_to_front(RestartSignal::RESPAWN);
        assert_eq!(actuator.launch(RestartSignal::RESPAWN), None);
    }

    #[test]
    fn test_command_actuator_reaps_finished_children() {
        let actuator = CommandActuator::new("true", vec![]);
        let pids: Vec<u32> = (0..20)
            .filter_map(|_| actuator.launch(RestartSignal::RESPAWN))
            .collect();
        assert_eq!(pids.len(), 20);

        // A reaped child disappears from /proc; a zombie stays with state Z.
        let lingering = || {
            pids.iter()
                .filter(|pid| std::path::Path::new(&format!("/proc/{pid}")).exists())
                .count()
        };
        for _ in 0..100 {
            if lingering() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(lingering(), 0);
    }

    #[test]
    fn test_fanout_reaches_every_target() {
        let (first, mut rx1) = ChannelActuator::new();
        let (second, mut rx2) = ChannelActuator::new();
        let fanout = FanoutActuator::new(vec![Arc::new(first), Arc::new(second)]);
        fanout.bring_to_front(RestartSignal::RESPAWN);
        assert_eq!(rx1.try_recv().unwrap(), RestartSignal::RESPAWN);
        assert_eq!(rx2.try_recv().unwrap(), RestartSignal::RESPAWN);
    }

    #[test]
    fn test_default_signal_is_not_respawn() {
        assert!(!RestartSignal::default().respawn);
    }
}
