//! shardcache
//!
//! ```text
//! shardcache [config.toml]
//! ```

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use ftlog::{error, info};
use shardcache::config::{Config, Role};
use shardcache::server::{self, setup_signal_handler};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let _guard = match ftlog::Builder::new().try_init() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logger init error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Config load error ({}): {}", config_path.display(), e);
            eprintln!("Config load error ({}): {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting as {} ({})", config.role.as_str(), config_path.display());

    // Graceful Shutdown用のシグナルハンドラを設定
    setup_signal_handler();

    let result = match config.role {
        Role::Node => server::node::run(config),
        Role::Router => server::router::run(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Startup error: {}", e);
            eprintln!("Startup error: {}", e);
            ExitCode::FAILURE
        }
    }
}
