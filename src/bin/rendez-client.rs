//! The rendez-client executable supports the following command line arguments:
//!
//! `rendez-client set <KEY> <VALUE> [--addr IP-PORT]`
//!
//!     Set the value of a key.
//!
//! `rendez-client get <KEY> [--addr IP-PORT]`
//!
//!     Get the value of a key, blocking until someone sets it.
//!
//! `rendez-client add <KEY> <DELTA> [--addr IP-PORT]`
//!
//!     Add DELTA to the integer counter stored under KEY and print the new total.
//!
//! `rendez-client rm <KEY> [--addr IP-PORT]`
//!
//!     Remove a key; prints whether it existed.
//!
//! `rendez-client check <KEY>... [--addr IP-PORT]`
//!
//!     Print "ready" if every listed key has a value, "not ready" otherwise.
//!
//! `rendez-client numkeys [--addr IP-PORT]`
//!
//!     Print the number of keys in the store.
//!
//! `rendez-client watch <KEY> [--addr IP-PORT]`
//!
//!     Subscribe to KEY and print every update until interrupted.
//!
//! --addr accepts an IP address and port with the format IP:PORT; the
//! default is 127.0.0.1:29500. A parse failure or a store error prints an
//! error and returns a non-zero exit code.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use clap::{crate_version, App, Arg, ArgMatches, SubCommand};
use rendez::{Result, Store, StoreConfig, StoreError};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:29500";

/// the request types this binary can run against a daemon
#[derive(Debug)]
enum Request {
    Set { key: String, value: String },
    Get { key: String },
    Add { key: String, delta: i64 },
    Remove { key: String },
    Check { keys: Vec<String> },
    NumKeys,
    Watch { key: String },
}

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    /// the daemon's ip:port
    addr: SocketAddr,
    req: Request,
}

impl Opt {
    fn new(addr: SocketAddr, req: Request) -> Self {
        Self { addr, req }
    }

    /// validates the `addr` parameter is a valid IP address and PORT
    /// # Errors
    /// returns [`StoreError::Parsing`] if one of the parameters is invalid
    fn build(addr: &str, req: Request) -> Result<Opt> {
        let addr: SocketAddr = addr.parse().map_err(|_| {
            StoreError::Parsing(format!(
                "could not parse {} into an IP address and port",
                addr
            ))
        })?;

        Ok(Opt::new(addr, req))
    }
}

fn main() -> Result<()> {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("rendez-client")
        .version(crate_version!())
        .about("command line client for a rendezvous key-value store daemon")
        .subcommands(vec![
            SubCommand::with_name("set")
                .about("Set the value of a key")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(Arg::with_name("VALUE").required(true).index(2)),
            SubCommand::with_name("get")
                .about("Get the value of a key, blocking until it is set")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("add")
                .about("Add an integer delta to a counter key")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(Arg::with_name("DELTA").required(true).index(2)),
            SubCommand::with_name("rm")
                .about("Removes a given key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("check")
                .about("Report whether every listed key has a value")
                .arg(Arg::with_name("KEY").required(true).multiple(true)),
            SubCommand::with_name("numkeys").about("Print the number of keys in the store"),
            SubCommand::with_name("watch")
                .about("Print every update of a key until interrupted")
                .arg(Arg::with_name("KEY").required(true).index(1)),
        ])
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help("sets the IP_ADDR:PORT of the daemon to connect to")
                .default_value(DEFAULT_ADDRESS),
        )
        .get_matches();

    match parse_options(matches) {
        Ok(opt) => run(opt),
        Err(e) => Err(e),
    }
}

/// connects to the daemon and runs the requested operation
fn run(opt: Opt) -> Result<()> {
    let config = StoreConfig::new(opt.addr.ip().to_string(), opt.addr.port());
    let mut store = Store::connect(config)?;

    match opt.req {
        Request::Set { key, value } => {
            store.set(&key, value.as_bytes())?;
        }
        Request::Get { key } => {
            let value = store.get(&key)?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Request::Add { key, delta } => {
            println!("{}", store.add(&key, delta)?);
        }
        Request::Remove { key } => {
            if store.delete_key(&key)? {
                println!("removed");
            } else {
                println!("Key not found");
            }
        }
        Request::Check { keys } => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            if store.check(&keys)? {
                println!("ready");
            } else {
                println!("not ready");
            }
        }
        Request::NumKeys => {
            println!("{}", store.get_num_keys()?);
        }
        Request::Watch { key } => {
            store.watch_key(&key, move |old, new| {
                println!(
                    "{} -> {}",
                    String::from_utf8_lossy(&old),
                    String::from_utf8_lossy(&new)
                );
            })?;
            // updates arrive on the listener thread; sleep until interrupted
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    }
    Ok(())
}

/// parses the matches from the command line into an [`Opt`] struct
fn parse_options(matches: ArgMatches) -> Result<Opt> {
    let addr = matches.value_of("addr").unwrap();
    match matches.subcommand() {
        ("set", Some(args)) => {
            let key = args.value_of("KEY").map(String::from).unwrap();
            let value = args.value_of("VALUE").map(String::from).unwrap();
            Opt::build(addr, Request::Set { key, value })
        }
        ("get", Some(args)) => {
            let key = args.value_of("KEY").map(String::from).unwrap();
            Opt::build(addr, Request::Get { key })
        }
        ("add", Some(args)) => {
            let key = args.value_of("KEY").map(String::from).unwrap();
            let raw = args.value_of("DELTA").unwrap();
            let delta: i64 = raw.parse().map_err(|_| {
                StoreError::Parsing(format!("could not parse {} into an integer", raw))
            })?;
            Opt::build(addr, Request::Add { key, delta })
        }
        ("rm", Some(args)) => {
            let key = args.value_of("KEY").map(String::from).unwrap();
            Opt::build(addr, Request::Remove { key })
        }
        ("check", Some(args)) => {
            let keys = args
                .values_of("KEY")
                .map(|keys| keys.map(String::from).collect())
                .unwrap();
            Opt::build(addr, Request::Check { keys })
        }
        ("numkeys", Some(_)) => Opt::build(addr, Request::NumKeys),
        ("watch", Some(args)) => {
            let key = args.value_of("KEY").map(String::from).unwrap();
            Opt::build(addr, Request::Watch { key })
        }
        _ => panic!("unknown command received"),
    }
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
