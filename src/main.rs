use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gomoku_assist::board::{Pos, Stone};
use gomoku_assist::cache::ChessManualStore;
use gomoku_assist::capture::{FrameSource, ReplaySource, ScreenCapture};
use gomoku_assist::config::{Config, DEFAULT_CONFIG_PATH};
use gomoku_assist::engine::{EngineHandle, EngineSession, ProcessLauncher};
use gomoku_assist::recognizer::{BoardRecognizer, Classified};
use gomoku_assist::report::ConsoleReport;
use gomoku_assist::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let matches = Command::new("gomoku-assist")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Watches a gomoku board on screen and suggests moves from a GTP engine")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Config file, created with defaults if missing")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_name("DIR")
                .help("Read board images from a directory instead of the screen"),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .value_name("FILTER")
                .help("Log filter such as `debug` or `gomoku_assist=trace` (overrides RUST_LOG)"),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .action(ArgAction::SetTrue)
                .help("Recognize a single frame, print it and exit (calibration check)"),
        )
        .get_matches();

    init_logging(matches.get_one::<String>("log").map(String::as_str));

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load_or_init(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let mut source: Box<dyn FrameSource> = match matches.get_one::<String>("replay") {
        Some(dir) => Box::new(ReplaySource::open(Path::new(dir), &config.board)?),
        None => Box::new(ScreenCapture::new(&config.board)),
    };

    if matches.get_flag("once") {
        return check_once(source.as_mut(), &config);
    }

    info!(
        rule = %config.board.rule,
        size = config.board.grid_size,
        engine = %config.engine.program.display(),
        "gomoku-assist starting"
    );

    let cache = Arc::new(ChessManualStore::load(
        config.cache.chess_manual_size,
        &config.cache.chess_manual_path,
        config.board.grid_size,
        config.board.rule,
    ));
    let launcher = ProcessLauncher::new(&config.engine, config.board.rule);
    let session = EngineSession::new(
        config.engine.clone(),
        config.board.grid_size,
        Box::new(launcher),
    );
    let (engine, engine_task) = EngineHandle::spawn(session, config.scheduler.queue_depth);

    let mut scheduler = Scheduler::new(&config, cache.clone(), engine.clone());
    let report = tokio::spawn(ConsoleReport::new().run(scheduler.subscribe()));

    println!("gomoku-assist running. Press Ctrl+C to stop.");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    scheduler.run(source, shutdown).await?;

    // Closes the snapshot channel, which ends the reporter.
    drop(scheduler);
    engine.shutdown().await;
    if let Err(e) = engine_task.await {
        warn!("Engine worker ended abnormally: {}", e);
    }

    match cache.flush() {
        Ok(()) => {
            let stats = cache.stats();
            info!(
                entries = cache.len(),
                hits = stats.hits,
                misses = stats.misses,
                hit_rate = stats.hit_rate(),
                "chess manual saved"
            );
        }
        Err(e) => warn!("Failed to save chess manual: {:#}", e),
    }
    let _ = report.await;
    Ok(())
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Captures one frame and prints what the recognizer makes of it.
fn check_once(source: &mut dyn FrameSource, config: &Config) -> Result<()> {
    let frame = source.capture().context("Failed to capture frame")?;
    let recognizer = BoardRecognizer::new(config.board.clone());
    let reading = recognizer.read(&frame.image)?;
    let size = reading.size();

    match reading.to_board() {
        Some(board) => {
            println!("{}", board);
            match board.to_move() {
                Some(stone) => println!(
                    "{} black, {} white, {} to play",
                    board.count(Stone::Black),
                    board.count(Stone::White),
                    stone
                ),
                None => println!("Stone counts do not alternate; this board cannot be adopted"),
            }
        }
        None => {
            println!("{} cell(s) could not be classified:", reading.unknown_count());
            for row in 0..size {
                for col in 0..size {
                    if reading.get(row, col) == Classified::Unknown {
                        println!(
                            "  {} (confidence {:.2})",
                            Pos::new(row, col).to_gtp(size),
                            reading.confidence(row, col)
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
