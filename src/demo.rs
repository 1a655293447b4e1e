/// Demo host for `revive demo`.
///
/// A stand-in application whose "UI units" are driven by line commands on
/// stdin. It wires the real collaborators together (file alarm store, process
/// hooks, signal listener, registry) so the whole resurrection loop can be
/// exercised by hand: crash it, hang it, background everything, and watch
/// `revive alarmd` bring it back.
use crate::actuator::{
    ChannelActuator, CommandActuator, FanoutActuator, RestartActuator, RestartSignal,
};
use crate::alarm_store::FileAlarmStore;
use crate::clock::SystemClock;
use crate::config::ReviveConfig;
use crate::data_dir::DataDir;
use crate::delivery::{spawn_signal_listener, take_cold_start_fire};
use crate::interceptor::ProcessHooks;
use crate::process::SystemExit;
use crate::registry::Registry;
use crate::timer::{AlarmFacility, TimerReceiver};
use crate::watchdog::{Collaborators, Watchdog};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Name of the unit shown at launch and on every forced restart.
pub const PRIMARY_UNIT: &str = "main";

const HEARTBEAT_TICK: Duration = Duration::from_millis(500);

const HELP: &str = "\
commands:
  start <unit>    show a unit
  stop <unit>     hide a unit
  rotate <unit>   tear a unit down and recreate it (transient stop)
  crash           panic on the main loop
  hang <ms>       block the main loop
  back            exit the sanctioned way
  backup          enter backup mode
  pause | resume  suspend or restore liveness checks
  status          print mode and visible units
  quit            leave with timers still armed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoCommand {
    Start(String),
    Stop(String),
    Rotate(String),
    Crash,
    Hang(Duration),
    Back,
    Backup,
    Pause,
    Resume,
    Status,
    Help,
    Quit,
}

/// Parse one stdin line. Unit commands default to the primary unit.
pub fn parse_command(line: &str) -> Result<DemoCommand, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments for '{verb}'"));
    }
    let unit = || arg.unwrap_or(PRIMARY_UNIT).to_string();

    let command = match verb {
        "start" => DemoCommand::Start(unit()),
        "stop" => DemoCommand::Stop(unit()),
        "rotate" => DemoCommand::Rotate(unit()),
        "hang" => {
            let ms = arg.ok_or("hang needs a duration in ms")?;
            let ms: u64 = ms.parse().map_err(|_| format!("invalid duration '{ms}'"))?;
            DemoCommand::Hang(Duration::from_millis(ms))
        }
        "crash" | "back" | "backup" | "pause" | "resume" | "status" | "help" | "quit" | "exit"
            if arg.is_some() =>
        {
            return Err(format!("'{verb}' takes no argument"));
        }
        "crash" => DemoCommand::Crash,
        "back" => DemoCommand::Back,
        "backup" => DemoCommand::Backup,
        "pause" => DemoCommand::Pause,
        "resume" => DemoCommand::Resume,
        "status" => DemoCommand::Status,
        "help" => DemoCommand::Help,
        "quit" | "exit" => DemoCommand::Quit,
        other => return Err(format!("unknown command '{other}' (try 'help')")),
    };
    Ok(command)
}

/// Units the demo currently shows.
#[derive(Debug, Default)]
struct Screen {
    visible: BTreeSet<String>,
}

impl Screen {
    fn show(&mut self, watchdog: &Watchdog, unit: &str) {
        if self.visible.insert(unit.to_string()) {
            watchdog.unit_started(unit);
        } else {
            println!("{unit} is already visible");
        }
    }

    fn hide(&mut self, watchdog: &Watchdog, unit: &str) {
        if self.visible.remove(unit) {
            watchdog.unit_stopped(unit, false);
        } else {
            println!("{unit} is not visible");
        }
    }

    /// Bring the primary unit forward as the only one.
    fn bring_to_front(&mut self, watchdog: &Watchdog) {
        for unit in std::mem::take(&mut self.visible) {
            watchdog.unit_stopped(&unit, false);
        }
        self.visible.insert(PRIMARY_UNIT.to_string());
        watchdog.unit_started(PRIMARY_UNIT);
    }
}

/// Run the demo host until stdin closes, `quit`, or Ctrl-C.
///
/// Leaving this way keeps the alarms armed, so `revive alarmd` relaunches the
/// host when the next one falls due.
pub async fn run(config: ReviveConfig) -> std::io::Result<()> {
    let registry = Registry::global();
    // Handlers go in before any alarm can name this pid.
    let listener = spawn_signal_listener(Arc::clone(&registry))?;

    let alarms = match FileAlarmStore::open(DataDir::new(&config.storage.data_dir)) {
        Ok(store) => Some(Arc::new(store) as Arc<dyn AlarmFacility>),
        Err(e) => {
            tracing::error!(error = %e, "alarm store unavailable");
            None
        }
    };
    let exit = Arc::new(SystemExit);
    let hooks = Arc::new(ProcessHooks::new(config.hang.clone(), exit.clone()));
    let heartbeat = hooks.heartbeat();
    let (channel, mut restarts) = ChannelActuator::new();
    // A configured command (e.g. a window raise) runs alongside the in-process one.
    let actuator: Arc<dyn RestartActuator> = match &config.actuator.command {
        Some(command) => Arc::new(FanoutActuator::new(vec![
            Arc::new(channel),
            Arc::new(CommandActuator::new(command, config.actuator.args.clone())),
        ])),
        None => Arc::new(channel),
    };

    let watchdog = Watchdog::start(
        &config,
        Collaborators {
            alarms,
            actuator,
            exit,
            hooks,
            clock: Arc::new(SystemClock),
        },
    );
    registry.install(Arc::clone(&watchdog));

    watchdog.app_started(RestartSignal::from_env());
    let mut screen = Screen::default();
    screen.bring_to_front(&watchdog);
    if let Some(kind) = take_cold_start_fire() {
        tracing::info!(%kind, "delivering alarm that launched this process");
        watchdog.on_timer_fired(kind);
    }

    println!("revive demo (pid {}); type 'help'", std::process::id());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(HEARTBEAT_TICK);

    loop {
        tokio::select! {
            _ = ticker.tick() => heartbeat.beat(),
            Some(signal) = restarts.recv() => {
                println!("forced restart: {PRIMARY_UNIT} brought to front");
                watchdog.app_started(signal);
                screen.bring_to_front(&watchdog);
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(DemoCommand::Quit) => break,
                    Ok(command) => execute(&watchdog, &mut screen, command),
                    Err(e) => println!("{e}"),
                }
                heartbeat.beat();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    listener.abort();
    tracing::info!("demo host leaving; alarms stay armed");
    Ok(())
}

fn execute(watchdog: &Arc<Watchdog>, screen: &mut Screen, command: DemoCommand) {
    match command {
        DemoCommand::Start(unit) => screen.show(watchdog, &unit),
        DemoCommand::Stop(unit) => screen.hide(watchdog, &unit),
        DemoCommand::Rotate(unit) => {
            if screen.visible.contains(&unit) {
                watchdog.unit_stopped(&unit, true);
                watchdog.unit_started(&unit);
            } else {
                println!("{unit} is not visible");
            }
        }
        DemoCommand::Crash => panic!("deliberate crash requested"),
        // Blocks the main loop on purpose so the heartbeat goes stale.
        DemoCommand::Hang(d) => std::thread::sleep(d),
        DemoCommand::Back => watchdog.on_back_pressed(),
        DemoCommand::Backup => watchdog.start_backup_mode(),
        DemoCommand::Pause => watchdog.pause(),
        DemoCommand::Resume => watchdog.resume(),
        DemoCommand::Status => {
            let units: Vec<&str> = screen.visible.iter().map(String::as_str).collect();
            println!(
                "mode: {:?}, active units: {}, visible: [{}]",
                watchdog.mode(),
                watchdog.active_units(),
                units.join(", ")
            );
        }
        DemoCommand::Help => println!("{HELP}"),
        DemoCommand::Quit => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{CountingHooks, RecordingActuator, RecordingAlarms, RecordingExit};
    use chrono::Utc;

    #[test]
    fn test_parse_unit_commands() {
        assert_eq!(
            parse_command("start settings"),
            Ok(DemoCommand::Start("settings".to_string()))
        );
        assert_eq!(
            parse_command("  stop  "),
            Ok(DemoCommand::Stop(PRIMARY_UNIT.to_string()))
        );
        assert_eq!(
            parse_command("rotate main"),
            Ok(DemoCommand::Rotate("main".to_string()))
        );
    }

    #[test]
    fn test_parse_hang_duration() {
        assert_eq!(
            parse_command("hang 6000"),
            Ok(DemoCommand::Hang(Duration::from_millis(6000)))
        );
        assert!(parse_command("hang").is_err());
        assert!(parse_command("hang soon").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_command("").is_err());
        assert!(parse_command("fly").is_err());
        assert!(parse_command("back now").is_err());
        assert!(parse_command("start a b").is_err());
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("crash"), Ok(DemoCommand::Crash));
        assert_eq!(parse_command("backup"), Ok(DemoCommand::Backup));
        assert_eq!(parse_command("exit"), Ok(DemoCommand::Quit));
        assert_eq!(parse_command("status"), Ok(DemoCommand::Status));
    }

    #[test]
    fn test_bring_to_front_leaves_only_primary() {
        let watchdog = Watchdog::start(
            &ReviveConfig::default(),
            Collaborators {
                alarms: Some(Arc::new(RecordingAlarms::default()) as Arc<dyn AlarmFacility>),
                actuator: Arc::new(RecordingActuator::default()),
                exit: Arc::new(RecordingExit::default()),
                hooks: Arc::new(CountingHooks::default()),
                clock: Arc::new(ManualClock::new(Utc::now())),
            },
        );
        let mut screen = Screen::default();
        screen.show(&watchdog, "settings");
        screen.show(&watchdog, "about");
        assert_eq!(watchdog.active_units(), 2);

        screen.bring_to_front(&watchdog);
        assert_eq!(watchdog.active_units(), 1);
        assert_eq!(
            screen.visible.iter().collect::<Vec<_>>(),
            vec![&PRIMARY_UNIT.to_string()]
        );
    }
}
