//! socks5-proxy: a concurrent SOCKSv5 proxy (RFC 1928) with RFC 1929
//! username/password authentication.
//!
//! Single-threaded, readiness-driven event loop built on `mio`. See
//! `runtime` for the per-connection protocol engine and `mgmt` for the
//! UDP management protocol shared with the `sockctl` binary.

mod access_log;
mod buffer;
mod config;
mod metrics;
mod mgmt;
mod runtime;
mod server;
mod users;
mod wire;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        mgmt_listen = %config.mgmt_listen,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        "starting socks5-proxy"
    );

    if let Err(e) = runtime::run(config) {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
