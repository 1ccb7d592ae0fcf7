//! The client side of the store: a synchronous request socket for the
//! caller, plus a second socket on which the daemon pushes watch
//! notifications to a background listener thread.

use std::convert::TryFrom;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::daemon::Daemon;
use crate::frame;
use crate::listener::WatchListener;
use crate::protocol::{CheckResponse, Opcode, WaitResponse};
use crate::{Result, StoreError};

/// prefix applied to every user-supplied key, so user keys can never
/// collide with the reserved rendezvous counter
const KEY_PREFIX: &str = "/";
/// the reserved, unprefixed key holding the worker rendezvous counter
const INIT_KEY: &str = "init/";
/// how long the server sleeps between polls of the rendezvous counter
const RENDEZVOUS_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// how long to sleep between connection attempts while the server comes up
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
/// receive timeout used when the configuration does not override it
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for [`Store::connect`].
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use rendez::{Store, StoreConfig};
/// # fn main() -> rendez::Result<()> {
/// // the process hosting the daemon, expecting three workers
/// let server = Store::connect(
///     StoreConfig::new("127.0.0.1", 29500)
///         .server()
///         .num_workers(3)
///         .timeout(Some(Duration::from_secs(30))),
/// )?;
/// # Ok(())
/// # }
/// ```
///
/// [`Store::connect`]: ./struct.Store.html#method.connect
#[derive(Debug, Clone)]
pub struct StoreConfig {
    host: String,
    port: u16,
    num_workers: Option<usize>,
    is_server: bool,
    timeout: Option<Duration>,
    wait_workers: bool,
}

impl StoreConfig {
    /// creates a configuration for the daemon at `host`:`port` with the
    /// defaults: not the server, no worker count, a 300 second receive
    /// timeout, and waiting for workers enabled
    pub fn new(host: impl Into<String>, port: u16) -> StoreConfig {
        StoreConfig {
            host: host.into(),
            port,
            num_workers: None,
            is_server: false,
            timeout: Some(DEFAULT_TIMEOUT),
            wait_workers: true,
        }
    }

    /// this process hosts the daemon; it will bind `port` (0 picks an
    /// ephemeral port) and run the event loop on a background thread
    pub fn server(mut self) -> StoreConfig {
        self.is_server = true;
        self
    }

    /// the number of participants in the job. When set (and waiting is not
    /// disabled) every participant checks in at construction, and the
    /// server blocks until all of them have.
    pub fn num_workers(mut self, count: usize) -> StoreConfig {
        self.num_workers = Some(count);
        self
    }

    /// the receive timeout for blocking calls; `None` waits forever
    pub fn timeout(mut self, timeout: Option<Duration>) -> StoreConfig {
        self.timeout = timeout;
        self
    }

    /// whether construction performs the worker check-in round; defaults to
    /// true, only meaningful together with a worker count
    pub fn wait_workers(mut self, wait: bool) -> StoreConfig {
        self.wait_workers = wait;
        self
    }
}

/// A client handle on the rendezvous store.
///
/// Every participant of a job holds one; the participant configured with
/// [`server`] additionally hosts the daemon that owns the data. Values are
/// opaque byte strings. [`wait`] blocks until keys exist, [`get`] is a
/// wait-then-fetch, and [`watch_key`] subscribes a callback to every later
/// mutation of a key.
///
/// # Example
/// ```no_run
/// use rendez::{Store, StoreConfig};
/// # fn main() -> rendez::Result<()> {
/// let mut store = Store::connect(StoreConfig::new("127.0.0.1", 29500))?;
/// store.set("rank0/endpoint", b"10.0.0.7:41000")?;
/// let peer = store.get("rank1/endpoint")?; // blocks until rank1 sets it
/// # Ok(())
/// # }
/// ```
///
/// [`server`]: ./struct.StoreConfig.html#method.server
/// [`wait`]: #method.wait
/// [`get`]: #method.get
/// [`watch_key`]: #method.watch_key
pub struct Store {
    host: String,
    port: u16,
    timeout: Option<Duration>,
    request: TcpStream,
    watch_requests: TcpStream,
    listener: WatchListener,
    _daemon: Option<Daemon>,
}

impl Store {
    /// connects to the store described by `config`, starting the daemon
    /// first if this process is the server, and spawning the watch listener
    ///
    /// # Errors
    /// returns [`StoreError::Io`] if the daemon port cannot be bound or the
    /// daemon cannot be reached before the configured timeout
    ///
    /// [`StoreError::Io`]: ./enum.StoreError.html
    pub fn connect(config: StoreConfig) -> Result<Store> {
        let StoreConfig {
            host,
            port,
            num_workers,
            is_server,
            timeout,
            wait_workers,
        } = config;

        let (daemon, port) = if is_server {
            let listener = TcpListener::bind((host.as_str(), port))?;
            let port = listener.local_addr()?.port();
            (Some(Daemon::spawn(listener)?), port)
        } else {
            (None, port)
        };

        let mut request = connect_with_retry(&host, port, timeout)?;
        if let (Some(expected), true) = (num_workers, wait_workers) {
            wait_for_workers(&mut request, is_server, expected, timeout)?;
        }

        // second connection: the daemon pushes watch notifications here,
        // read by a dedicated thread over its own clone of the socket
        let watch_requests = connect_with_retry(&host, port, timeout)?;
        let listener = WatchListener::spawn(watch_requests.try_clone()?)?;

        Ok(Store {
            host,
            port,
            timeout,
            request,
            watch_requests,
            listener,
            _daemon: daemon,
        })
    }

    /// stores `value` under `key`, overwriting any previous value and
    /// unblocking anyone waiting on the key; does not wait for the daemon
    /// to apply it
    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        frame::write_u8(&mut self.request, Opcode::Set as u8)?;
        frame::write_key(&mut self.request, &prefixed(key))?;
        frame::write_bytes(&mut self.request, value)
    }

    /// retrieves the value of `key`, blocking until the key exists or the
    /// configured timeout fires
    pub fn get(&mut self, key: &str) -> Result<Vec<u8>> {
        get_helper(&mut self.request, self.timeout, &prefixed(key))
    }

    /// atomically replaces the value of `key` with `desired` if it
    /// currently equals `expected`, returning the value stored after the
    /// call.
    ///
    /// If the key does not exist the reply is `expected` itself and nothing
    /// is stored; a caller comparing the reply against `expected` will read
    /// that as success. Longstanding protocol behavior, so it is kept.
    pub fn compare_set(
        &mut self,
        key: &str,
        expected: &[u8],
        desired: &[u8],
    ) -> Result<Vec<u8>> {
        frame::write_u8(&mut self.request, Opcode::CompareSet as u8)?;
        frame::write_key(&mut self.request, &prefixed(key))?;
        frame::write_bytes(&mut self.request, expected)?;
        frame::write_bytes(&mut self.request, desired)?;
        frame::read_bytes(&mut self.request)
    }

    /// adds `delta` to the integer counter stored under `key` (a missing
    /// key counts as 0) and returns the new total. The value must hold a
    /// decimal string; only ever ADD to keys maintained by ADD.
    pub fn add(&mut self, key: &str, delta: i64) -> Result<i64> {
        add_helper(&mut self.request, &prefixed(key), delta)
    }

    /// removes `key`, returning whether it existed. Watchers of the key are
    /// dropped without a notification; waiters are left blocked.
    pub fn delete_key(&mut self, key: &str) -> Result<bool> {
        frame::write_u8(&mut self.request, Opcode::DeleteKey as u8)?;
        frame::write_key(&mut self.request, &prefixed(key))?;
        Ok(frame::read_i64(&mut self.request)? == 1)
    }

    /// reports whether every one of `keys` currently has a value, without
    /// blocking
    pub fn check(&mut self, keys: &[&str]) -> Result<bool> {
        frame::write_u8(&mut self.request, Opcode::Check as u8)?;
        frame::write_u64(&mut self.request, keys.len() as u64)?;
        for key in keys {
            frame::write_key(&mut self.request, &prefixed(key))?;
        }
        match CheckResponse::try_from(frame::read_u8(&mut self.request)?)? {
            CheckResponse::Ready => Ok(true),
            CheckResponse::NotReady => Ok(false),
        }
    }

    /// blocks until every one of `keys` has a value, or the configured
    /// timeout fires
    pub fn wait(&mut self, keys: &[&str]) -> Result<()> {
        self.wait_with_timeout(keys, self.timeout)
    }

    /// like [`wait`], with a per-call timeout override
    ///
    /// [`wait`]: #method.wait
    pub fn wait_with_timeout(
        &mut self,
        keys: &[&str],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let keys: Vec<String> = keys.iter().map(|key| prefixed(key)).collect();
        wait_helper(&mut self.request, timeout, &keys)
    }

    /// returns the number of keys in the store, counting the rendezvous
    /// counter if the job used one
    pub fn get_num_keys(&mut self) -> Result<i64> {
        frame::write_u8(&mut self.request, Opcode::GetNumKeys as u8)?;
        frame::read_i64(&mut self.request)
    }

    /// subscribes `callback` to every later mutation of `key` by a set, a
    /// successful compare-set, or an add. The callback receives the old and
    /// new values and runs on the listener thread; it must not call back
    /// into this store. Deleting the key silently ends the subscription.
    pub fn watch_key(
        &mut self,
        key: &str,
        callback: impl FnMut(Vec<u8>, Vec<u8>) + Send + 'static,
    ) -> Result<()> {
        let key = prefixed(key);
        // the callback is published before the request goes out, so the
        // first notification cannot beat it to the table
        self.listener.add_callback(key.clone(), Box::new(callback));
        frame::write_u8(&mut self.watch_requests, Opcode::WatchKey as u8)?;
        frame::write_key(&mut self.watch_requests, &key)
    }

    /// the host this store is connected to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// the daemon's actual port; useful when the server was configured with
    /// port 0
    pub fn port(&self) -> u16 {
        self.port
    }
}

fn prefixed(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

/// connects to the daemon, retrying while its port is not accepting yet.
/// Workers routinely start before the server process has bound its socket,
/// so connection-refused is retried until the timeout elapses; any other
/// failure surfaces immediately.
#[instrument]
fn connect_with_retry(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let deadline = timeout.map(|limit| Instant::now() + limit);
    loop {
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!("connected to {}:{}", host, port);
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Io {
                            source: io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("timed out connecting to {}:{}", host, port),
                            ),
                        });
                    }
                }
                thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// every participant bumps the rendezvous counter; the server additionally
/// polls it until the whole job has checked in, which keeps the daemon
/// process alive until the slowest worker has connected. A server that
/// times out here gives up quietly rather than erroring; stragglers will
/// time out on their own first waits.
fn wait_for_workers(
    stream: &mut TcpStream,
    is_server: bool,
    expected: usize,
    timeout: Option<Duration>,
) -> Result<()> {
    add_helper(stream, INIT_KEY, 1)?;
    if !is_server {
        return Ok(());
    }
    let start = Instant::now();
    loop {
        let raw = get_helper(stream, timeout, INIT_KEY)?;
        let text = String::from_utf8(raw)?;
        let checked_in: usize = text.parse().map_err(|_| {
            StoreError::Parsing(format!("rendezvous counter {:?} is not a number", text))
        })?;
        if checked_in >= expected {
            debug!("all {} workers checked in", expected);
            return Ok(());
        }
        if let Some(limit) = timeout {
            if start.elapsed() > limit {
                debug!(
                    "gave up waiting for workers: {} of {} checked in",
                    checked_in, expected
                );
                return Ok(());
            }
        }
        thread::sleep(RENDEZVOUS_POLL_INTERVAL);
    }
}

/// a WAIT round-trip: the receive timeout is armed on the socket just
/// before the request, and firing it leaves the connection unusable
fn wait_helper(
    stream: &mut TcpStream,
    timeout: Option<Duration>,
    keys: &[String],
) -> Result<()> {
    stream.set_read_timeout(timeout)?;
    frame::write_u8(stream, Opcode::Wait as u8)?;
    frame::write_u64(stream, keys.len() as u64)?;
    for key in keys {
        frame::write_key(stream, key)?;
    }
    match WaitResponse::try_from(frame::read_u8(stream)?)? {
        WaitResponse::StopWaiting => Ok(()),
    }
}

/// the canonical read path: WAIT for the key so a concurrent set cannot be
/// half-observed, then GET its value
fn get_helper(
    stream: &mut TcpStream,
    timeout: Option<Duration>,
    key: &str,
) -> Result<Vec<u8>> {
    wait_helper(stream, timeout, &[key.to_string()])?;
    frame::write_u8(stream, Opcode::Get as u8)?;
    frame::write_key(stream, key)?;
    frame::read_bytes(stream)
}

fn add_helper(stream: &mut TcpStream, key: &str, delta: i64) -> Result<i64> {
    frame::write_u8(stream, Opcode::Add as u8)?;
    frame::write_key(stream, key)?;
    frame::write_i64(stream, delta)?;
    frame::read_i64(stream)
}
