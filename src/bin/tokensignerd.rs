use std::sync::Arc;

use tokensigner::daemon::config::Config;
use tokensigner::daemon::start::start_tokensigner_daemon;

fn main() {
    let config = match Config::create() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Cannot start the async runtime: {}", e);
            ::std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(start_tokensigner_daemon(config)) {
        eprintln!("Token signer failed: {}", e);
        ::std::process::exit(1);
    }
}
