use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use regex::Regex;
use tracing::{info, warn};

use tapfarm_core::controller::Runtime;
use tapfarm_core::detect::{CommandDetector, Detector, StubDetector};
use tapfarm_core::logger::{self, LogOptions};
use tapfarm_core::lua_rt::LuaGame;
use tapfarm_core::macros::{CommandMacroPlayer, MacroPlayer, StubMacroPlayer};
use tapfarm_core::orchestrator::{self, Orchestrator};
use tapfarm_core::platform::create_platform;
use tapfarm_core::settings::{RunConfig, Settings};
use tapfarm_core::sink::{JsonStatusSink, LogNotifier, LogStatusSink, SharedStatus};
use tapfarm_core::types::Command;

/// Run one game's automation on several Android devices at once.
#[derive(Parser, Debug)]
#[command(name = "tapfarm", version)]
struct Cli {
    /// Game to run (directory name under the games dir); defaults to the last one used
    game: Option<String>,

    /// Speed multiplier applied to waits, timeouts and macros (>= 0.1)
    #[arg(long)]
    speed: Option<f64>,

    /// Maximum number of devices to drive
    #[arg(short = 'n', long)]
    instances: Option<usize>,

    /// Cycles per session, overriding the game's default
    #[arg(long)]
    cycles: Option<u32>,

    /// Device serial to use; repeat for several. Skips discovery.
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Only use discovered devices whose serial matches this regex
    #[arg(long)]
    device_pattern: Option<String>,

    /// Seconds to wait after each macro playback
    #[arg(long)]
    delay: Option<f64>,

    /// Simulated devices and random detections
    #[arg(long)]
    stub: bool,

    /// Plain log output and stdin commands instead of the TUI
    #[arg(long)]
    headless: bool,

    /// Restart the app on every device before the first state
    #[arg(long)]
    restart_first: bool,

    /// Also write each status snapshot to this JSON file
    #[arg(long)]
    status_file: Option<PathBuf>,

    #[arg(long)]
    list_games: bool,

    #[arg(long, default_value = "settings.json")]
    settings: PathBuf,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn validate(&self) -> Result<()> {
        if let Some(speed) = self.speed {
            if speed.is_nan() || speed < 0.1 {
                bail!("--speed must be at least 0.1");
            }
        }
        if self.instances == Some(0) {
            bail!("--instances must be at least 1");
        }
        if let Some(delay) = self.delay {
            if delay.is_nan() || delay < 0.0 {
                bail!("--delay must not be negative");
            }
        }
        Ok(())
    }
}

/// Parse one headless command line: `q`, `s`, `p N`, `r N`, `start`, `stop`,
/// `pause`, `resume`. Instance numbers are 1-based.
fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    let index = words.next().and_then(|w| w.parse::<usize>().ok()).and_then(|n| n.checked_sub(1));
    match verb {
        "q" | "quit" => Some(Command::Quit),
        "s" | "status" => Some(Command::Status),
        "p" => index.map(Command::Toggle),
        "r" => index.map(Command::Restart),
        "start" => Some(Command::StartAll),
        "stop" => Some(Command::StopAll),
        "pause" => Some(Command::PauseAll),
        "resume" => Some(Command::ResumeAll),
        _ => None,
    }
}

fn list_games(games_dir: &Path) {
    let games = orchestrator::list_games(games_dir);
    if games.is_empty() {
        println!("no games found in {}", games_dir.display());
    }
    for (_, info) in games {
        println!("{:<20} {}  {}", info.name, info.display_name, info.description);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.validate()?;

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut settings = Settings::load(&cli.settings);
    let games_dir = cwd.join(&settings.games_dir);

    if cli.list_games {
        list_games(&games_dir);
        return Ok(());
    }

    let Some(game_name) = cli.game.clone().or_else(|| settings.last_game.clone()) else {
        bail!("no game given; run with --list-games to see what is available");
    };
    let script = orchestrator::game_script(&games_dir, &game_name)?;
    let game_dir = script.parent().unwrap_or(&games_dir).to_path_buf();

    let (log_tx, log_rx) = mpsc::channel::<String>();
    logger::init(
        &cwd.join("logs"),
        LogOptions { verbose: cli.verbose, stdout: cli.headless, tui: (!cli.headless).then_some(log_tx) },
    )?;

    let instances = cli.instances.unwrap_or(settings.max_instances).max(1);
    let platform = create_platform(cli.stub, instances, &settings.adb_path);

    let detector: Arc<dyn Detector> = if cli.stub {
        Arc::new(StubDetector::new(0.9))
    } else {
        match &settings.detector_command {
            Some(cmd) => Arc::new(CommandDetector::new(cmd.as_str(), game_dir.join("templates"))),
            None => bail!("detector_command is not set in {}", cli.settings.display()),
        }
    };

    let game = Arc::new(LuaGame::load(&script, Arc::clone(&detector))?);

    let inter_macro_delay = cli.delay.unwrap_or(settings.inter_macro_delay);
    let macros: Arc<dyn MacroPlayer> = if cli.stub {
        Arc::new(StubMacroPlayer)
    } else {
        let command = settings.macro_command.clone().unwrap_or_else(|| {
            warn!("macro_command is not set; macro actions will fail");
            String::new()
        });
        Arc::new(
            CommandMacroPlayer::new(&command, &game_dir, &cwd.join("macros"))
                .with_resolution(settings.macro_resolution.0, settings.macro_resolution.1)
                .with_inter_macro_delay(inter_macro_delay),
        )
    };

    let mut config = RunConfig::from_settings(&settings);
    if let Some(speed) = cli.speed {
        config.speed = speed;
    }
    config.cycles = cli.cycles;
    config.restart_on_start = cli.restart_first;
    config.exit_when_idle = cli.headless;
    config.validate()?;

    let pattern = match cli.device_pattern.as_ref().or(settings.device_pattern.as_ref()) {
        Some(p) => Some(Regex::new(p).with_context(|| format!("bad device pattern '{}'", p))?),
        None => None,
    };
    let devices = orchestrator::resolve_devices(platform.as_ref(), &cli.devices, pattern.as_ref(), instances)?;
    info!("devices: {}", devices.join(", "));

    let runtime = Arc::new(Runtime::new(game, detector, macros, Arc::new(LogNotifier), config));
    let status = SharedStatus::new();
    let mut orch = Orchestrator::new(runtime, platform.as_ref(), &devices)?.with_sink(Arc::new(status.clone()));
    if cli.headless {
        orch = orch.with_sink(Arc::new(LogStatusSink));
    }
    if let Some(path) = &cli.status_file {
        orch = orch.with_sink(Arc::new(JsonStatusSink::new(path.clone())));
    }

    settings.last_game = Some(game_name);
    if let Err(e) = settings.save(&cli.settings) {
        warn!("could not save settings: {}", e);
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
    let orch_thread = thread::Builder::new().name("orchestrator".into()).spawn(move || {
        orch.start_all();
        orch.run(cmd_rx)
    })?;

    if cli.headless {
        let stdin_tx = cmd_tx.clone();
        thread::Builder::new().name("stdin".into()).spawn(move || {
            for line in io::stdin().lock().lines().map_while(|l| l.ok()) {
                match parse_command(&line) {
                    Some(cmd) => {
                        let quit = cmd == Command::Quit;
                        if stdin_tx.send(cmd).is_err() || quit {
                            return;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => warn!("unknown command '{}' (q, s, p N, r N, start, stop, pause, resume)", line.trim()),
                }
            }
            stdin_tx.send(Command::Quit).ok();
        })?;
    } else {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

        let mut app = tapfarm_tui::App::new(status, log_rx, cmd_tx.clone());
        let result = tapfarm_tui::event::run(&mut terminal, &mut app);

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
        terminal.show_cursor()?;
        cmd_tx.send(Command::Quit).ok();
        result?;
    }

    match orch_thread.join() {
        Ok(last) => {
            if !cli.headless {
                println!(
                    "{}: {} sessions in {}",
                    last.game,
                    last.total_sessions,
                    orchestrator::format_duration(std::time::Duration::from_secs_f64(last.elapsed))
                );
            }
            Ok(())
        }
        Err(_) => bail!("orchestrator thread panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headless_commands() {
        assert_eq!(parse_command("q"), Some(Command::Quit));
        assert_eq!(parse_command(" s "), Some(Command::Status));
        assert_eq!(parse_command("p 2"), Some(Command::Toggle(1)));
        assert_eq!(parse_command("r 1"), Some(Command::Restart(0)));
        assert_eq!(parse_command("r 0"), None);
        assert_eq!(parse_command("p"), None);
        assert_eq!(parse_command("dance"), None);
    }

    #[test]
    fn test_cli_validation() {
        let cli = Cli::parse_from(["tapfarm", "demo", "--speed", "0.05"]);
        assert!(cli.validate().is_err());
        let cli = Cli::parse_from(["tapfarm", "demo", "-n", "0"]);
        assert!(cli.validate().is_err());
        let cli = Cli::parse_from(["tapfarm", "demo", "--delay=-1"]);
        assert!(cli.validate().is_err());
        let cli = Cli::parse_from(["tapfarm", "demo", "--speed", "1.5", "--device", "a", "--device", "b"]);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.devices, vec!["a", "b"]);
    }
}
