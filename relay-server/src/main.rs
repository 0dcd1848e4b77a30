mod config;

use std::fs::File;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use config::Config;
use relay_net::{LogObserver, RelayServer};

fn init_logging(verbose: bool) {
    use simplelog::*;

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let log_path = crate::config::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay.log");

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        log_level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];
    match File::create(&log_path) {
        Ok(file) => loggers.push(WriteLogger::new(log_level, simplelog::Config::default(), file)),
        Err(e) => eprintln!("relay: cannot write {}: {}", log_path.display(), e),
    }

    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("relay: logger already initialized: {}", e);
    }

    log::info!("relay starting (log level: {:?})", log_level);
}

fn main() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_logging(verbose);

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);
    let bind_addr = args
        .iter()
        .position(|a| a == "--bind")
        .and_then(|i| args.get(i + 1).cloned());

    let mut config = match config_path {
        Some(path) => Config::load_from(Some(path.as_path())),
        None => Config::load(),
    };
    if let Some(addr) = bind_addr {
        config.set_bind(addr);
    }

    let server = RelayServer::bind(&config.bind(), config.limits(), Arc::new(LogObserver))?;
    let mut running = server.spawn()?;
    eprintln!("type 'quit' or close stdin to stop");

    for line in io::stdin().lock().lines() {
        match line {
            Ok(line) if line.trim() == "quit" => break,
            Ok(line) if line.trim() == "who" => {
                eprintln!("{} connected: {:?}", running.connection_count(), running.members())
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("stdin read failed: {}", e);
                break;
            }
        }
    }

    running.shutdown();
    log::info!("relay stopped");
    Ok(())
}
