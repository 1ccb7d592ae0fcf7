//! this binary runs a standalone store daemon until the process is killed
//! to see the list of options, type: `rendez-server --help`

use std::net::{SocketAddr, TcpListener};
use std::process::exit;

use clap::{crate_version, App, Arg};
use rendez::{Daemon, Result, StoreError};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:29500";

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    let matches = App::new("rendez-server")
        .version(crate_version!())
        .about("a rendezvous key-value store daemon")
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help("sets the IP_ADDR:PORT that the daemon listens on")
                .default_value(DEFAULT_ADDRESS),
        )
        .get_matches();

    let addr = matches.value_of("addr").unwrap();
    if let Err(e) = run(addr) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr.parse().map_err(|_| {
        StoreError::Parsing(format!(
            "could not parse {} into an IP address and port",
            addr
        ))
    })?;

    info!("rendez-server {}", env!("CARGO_PKG_VERSION"));
    let listener = TcpListener::bind(addr)?;
    info!("listening on {}", listener.local_addr()?);

    // the daemon serves on its own thread; this one just waits to be killed
    let daemon = Daemon::spawn(listener)?;
    daemon.join();
    Ok(())
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
