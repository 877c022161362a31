use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::select;

use crate::commons::error::Error;
use crate::commons::util::file;
use crate::constants::{TOKENSIGNER_SERVER_APP, TOKENSIGNER_VERSION};
use crate::daemon::config::Config;
use crate::signer::TokenManager;
use crate::signer::verify::PermissiveVerifier;

/// Runs the token signer until it receives a stop signal.
///
/// Tokens are refreshed once at startup and then on every tick of the
/// module update interval. On shutdown all token workers are stopped and
/// their sessions closed.
pub async fn start_tokensigner_daemon(config: Arc<Config>) -> Result<(), Error> {
    test_data_dirs_or_die(&config);

    info!("Starting {} v{}", TOKENSIGNER_SERVER_APP, TOKENSIGNER_VERSION);

    let manager = Arc::new(TokenManager::build(config.clone(), Arc::new(PermissiveVerifier))?);
    if let Err(e) = manager.refresh().await {
        warn!("Initial token refresh failed: {}", e);
    }

    let mut interval = tokio::time::interval(config.module_update_interval());
    // The first tick completes immediately and the refresh above covers it.
    interval.tick().await;

    loop {
        select! {
            _ = interval.tick() => {
                if let Err(e) = manager.refresh().await {
                    warn!("Token refresh failed: {}", e);
                }
            }
            res = stop_signal() => {
                if let Err(e) = res {
                    error!("Cannot listen for stop signals: {}", e);
                }
                break;
            }
        }
    }

    info!("Stopping {}", TOKENSIGNER_SERVER_APP);
    manager.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn stop_signal() -> Result<(), Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())
        .map_err(|e| Error::io("cannot install SIGTERM handler", e))?;
    select! {
        res = tokio::signal::ctrl_c() => {
            res.map_err(|e| Error::io("cannot listen for ctrl-c", e))
        }
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn stop_signal() -> Result<(), Error> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::io("cannot listen for ctrl-c", e))
}

fn test_data_dirs_or_die(config: &Config) {
    test_data_dir_or_die("data_dir", &config.data_dir, config);
    test_data_dir_or_die("data_dir", &config.soft_token_dir(), config);
    test_data_dir_or_die("data_dir", &config.locks_dir(), config);
}

fn test_data_dir_or_die(config_item: &str, dir: &Path, config: &Config) {
    let test_file = dir.join("test");

    if let Err(e) = file::create_dir(dir).and_then(|_| file::create_dir(&config.tmp_dir())) {
        print_write_error_hint_and_die(format!(
            "Cannot create dir '{}' for configuration setting '{}', Error: {}",
            dir.display(),
            config_item,
            e
        ));
    } else if let Err(e) = file::save_atomic(b"test", &test_file, &config.tmp_dir()) {
        print_write_error_hint_and_die(format!(
            "Cannot write to dir '{}' for configuration setting '{}', Error: {}",
            dir.display(),
            config_item,
            e
        ));
    } else if let Err(e) = file::delete_if_exists(&test_file) {
        print_write_error_hint_and_die(format!(
            "Cannot delete test file '{}' in dir for configuration setting '{}', Error: {}",
            test_file.display(),
            config_item,
            e
        ));
    }
}

fn print_write_error_hint_and_die(error_msg: String) {
    eprintln!("{}", error_msg);
    eprintln!();
    eprintln!("Hint: if you use systemd you may need to override the allowed");
    eprintln!("ReadWritePaths, the easiest way may be by doing ");
    eprintln!("'systemctl edit tokensigner' and add a section like:");
    eprintln!();
    eprintln!("[Service]");
    eprintln!("ReadWritePaths=/local/path1 /local/path2 ...");
    std::process::exit(1);
}
