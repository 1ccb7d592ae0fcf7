//! The store daemon: a single-threaded TCP event loop that owns the
//! key-value map and the per-client coordination state layered on top of it.
//!
//! One poller watches the listening socket, a shutdown signal, and every
//! accepted client socket. Requests are handled to completion, in arrival
//! order, on the one loop thread; nothing here is locked because nothing
//! here is shared. Clients that die mid-operation are reaped: their socket
//! is closed and every trace of them is removed from the wait and watch
//! records, so a SET can never try to wake a ghost.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread::{self, JoinHandle};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info};

use crate::frame;
use crate::protocol::{CheckResponse, Opcode, WaitResponse, WatchResponse};
use crate::{Result, StoreError};

/// token reserved for the listening socket
const LISTENER: Token = Token(0);
/// token reserved for the shutdown waker
const SHUTDOWN: Token = Token(1);
/// the first token handed out to an accepted client socket
const FIRST_CLIENT: usize = 2;

/// A handle to a running store daemon.
///
/// The daemon runs on its own thread and owns every piece of server state;
/// this handle can only signal it to stop. Dropping the handle shuts the
/// daemon down and joins its thread.
///
/// # Example
/// ```no_run
/// use std::net::TcpListener;
/// use rendez::Daemon;
/// # fn main() -> rendez::Result<()> {
/// let listener = TcpListener::bind("127.0.0.1:0")?;
/// let daemon = Daemon::spawn(listener)?;
/// // ... clients connect and talk to it over TCP ...
/// drop(daemon); // stops the event loop and joins the thread
/// # Ok(())
/// # }
/// ```
pub struct Daemon {
    waker: Waker,
    handle: Option<JoinHandle<()>>,
}

impl Daemon {
    /// starts the event loop on a new thread, serving connections accepted
    /// from the given `listener`
    ///
    /// # Errors
    /// returns [`StoreError::Io`] if the poller could not be created or the
    /// thread could not be spawned
    ///
    /// [`StoreError::Io`]: ./enum.StoreError.html
    pub fn spawn(listener: TcpListener) -> Result<Daemon> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), SHUTDOWN)?;
        let mut inner = DaemonLoop::new(listener, poll)?;
        let handle = thread::Builder::new()
            .name("rendez-daemon".to_string())
            .spawn(move || {
                if let Err(e) = inner.run() {
                    error!("store daemon exited with an error: {:?}", e);
                }
            })?;
        Ok(Daemon {
            waker,
            handle: Some(handle),
        })
    }

    /// signals the event loop to stop after it finishes the current poll
    /// round; signaling more than once is harmless
    pub fn shutdown(&self) {
        let _ = self.waker.wake();
    }

    /// blocks the calling thread until the daemon exits on its own; used by
    /// the standalone server binary, which runs until killed
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// the event loop and all the state it owns: the key-value map, the sockets
/// blocked in WAIT, and the sockets subscribed to key updates
struct DaemonLoop {
    poll: Poll,
    listener: TcpListener,
    next_token: usize,
    /// every accepted, not-yet-reaped client socket
    clients: HashMap<Token, TcpStream>,
    /// the key-value map itself
    store: HashMap<String, Vec<u8>>,
    /// key -> sockets blocked until that key appears
    waiting: HashMap<String, Vec<Token>>,
    /// blocked socket -> how many of its keys are still missing
    pending: HashMap<Token, usize>,
    /// key -> sockets subscribed to updates of that key
    watchers: HashMap<String, Vec<Token>>,
}

impl DaemonLoop {
    fn new(listener: TcpListener, poll: Poll) -> Result<DaemonLoop> {
        // the listener must not block the loop when a client vanishes
        // between the readiness report and the accept
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER, Interest::READABLE)?;
        Ok(DaemonLoop {
            poll,
            listener,
            next_token: FIRST_CLIENT,
            clients: HashMap::new(),
            store: HashMap::new(),
            waiting: HashMap::new(),
            pending: HashMap::new(),
            watchers: HashMap::new(),
        })
    }

    fn run(&mut self) -> Result<()> {
        info!("store daemon listening on {}", self.listener.local_addr()?);
        let mut events = Events::with_capacity(128);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            if events.iter().any(|event| event.token() == SHUTDOWN) {
                debug!("shutdown signal received, stopping the daemon");
                return Ok(());
            }

            let mut dead = Vec::new();
            for event in events.iter() {
                match event.token() {
                    SHUTDOWN => {}
                    LISTENER => self.accept_ready()?,
                    token => {
                        // any failure while serving a client means its socket
                        // is gone or it is speaking garbage; either way the
                        // connection is closed and its state reaped
                        if let Err(e) = self.serve_ready(token) {
                            debug!("closing client {:?}: {:?}", token, e);
                            dead.push(token);
                        }
                    }
                }
            }
            for token in dead {
                self.reap(token);
            }
        }
    }

    /// accepts every connection queued on the listening socket
    fn accept_ready(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let fd = stream.as_raw_fd();
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
                    debug!("accepted connection from {} as {:?}", peer, token);
                    self.clients.insert(token, stream);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// serves every request already buffered on a ready socket.
    ///
    /// The poller's notifications are edge style, so one readable event must
    /// drain everything the kernel has queued for this socket; a request
    /// left half-buffered would otherwise sit unserved until the client
    /// happened to send more bytes.
    fn serve_ready(&mut self, token: Token) -> Result<()> {
        loop {
            self.dispatch(token)?;
            let stream = self.stream_mut(token)?;
            if !has_buffered_data(stream)? {
                return Ok(());
            }
        }
    }

    /// reads one request off the socket and runs its handler to completion
    fn dispatch(&mut self, token: Token) -> Result<()> {
        let op = {
            let stream = self.stream_mut(token)?;
            Opcode::try_from(frame::read_u8(stream)?)?
        };
        debug!("request {:?} from {:?}", op, token);
        match op {
            Opcode::Set => self.set(token),
            Opcode::CompareSet => self.compare_set(token),
            Opcode::Get => self.get(token),
            Opcode::Add => self.add(token),
            Opcode::Check => self.check(token),
            Opcode::Wait => self.wait(token),
            Opcode::GetNumKeys => self.get_num_keys(token),
            Opcode::WatchKey => self.watch_key(token),
            Opcode::DeleteKey => self.delete_key(token),
        }
    }

    fn set(&mut self, token: Token) -> Result<()> {
        let (key, new) = {
            let stream = self.stream_mut(token)?;
            (frame::read_key(stream)?, frame::read_bytes(stream)?)
        };
        let old = self.store.get(&key).cloned().unwrap_or_default();
        self.store.insert(key.clone(), new.clone());
        self.wake_waiting(&key)?;
        self.push_key_update(&key, &old, &new)
    }

    fn compare_set(&mut self, token: Token) -> Result<()> {
        let (key, expected, desired) = {
            let stream = self.stream_mut(token)?;
            (
                frame::read_key(stream)?,
                frame::read_bytes(stream)?,
                frame::read_bytes(stream)?,
            )
        };
        let reply = match self.store.get(&key).cloned() {
            // a missing key answers with the caller's own expected value,
            // without storing anything; longstanding wire behavior that
            // callers rely on, kept as is
            None => expected,
            Some(ref current) if *current == expected => {
                self.store.insert(key.clone(), desired.clone());
                self.push_key_update(&key, &expected, &desired)?;
                desired
            }
            Some(current) => current,
        };
        let stream = self.stream_mut(token)?;
        frame::write_bytes(stream, &reply)
    }

    fn get(&mut self, token: Token) -> Result<()> {
        let key = frame::read_key(self.stream_mut(token)?)?;
        // clients WAIT before they GET, so a miss here is a broken client
        let value = self.store.get(&key).cloned().ok_or(StoreError::KeyNotFound)?;
        frame::write_bytes(self.stream_mut(token)?, &value)
    }

    fn add(&mut self, token: Token) -> Result<()> {
        let (key, delta) = {
            let stream = self.stream_mut(token)?;
            (frame::read_key(stream)?, frame::read_i64(stream)?)
        };
        let old = self.store.get(&key).cloned();
        let total = match &old {
            Some(current) => parse_counter(current)? + delta,
            None => delta,
        };
        let new = total.to_string().into_bytes();
        self.store.insert(key.clone(), new.clone());
        frame::write_i64(self.stream_mut(token)?, total)?;
        self.wake_waiting(&key)?;
        self.push_key_update(&key, &old.unwrap_or_default(), &new)
    }

    fn check(&mut self, token: Token) -> Result<()> {
        let keys = self.read_key_list(token)?;
        let tag = if self.all_present(&keys) {
            CheckResponse::Ready
        } else {
            CheckResponse::NotReady
        };
        frame::write_u8(self.stream_mut(token)?, tag as u8)
    }

    fn wait(&mut self, token: Token) -> Result<()> {
        let keys = self.read_key_list(token)?;
        if self.all_present(&keys) {
            return frame::write_u8(self.stream_mut(token)?, WaitResponse::StopWaiting as u8);
        }
        // park the socket under every key it is missing; the reply is sent
        // by whichever SET or ADD fills in the last one
        let mut missing = 0;
        for key in keys {
            if !self.store.contains_key(&key) {
                self.waiting.entry(key).or_default().push(token);
                missing += 1;
            }
        }
        self.pending.insert(token, missing);
        Ok(())
    }

    fn get_num_keys(&mut self, token: Token) -> Result<()> {
        let count = self.store.len() as i64;
        frame::write_i64(self.stream_mut(token)?, count)
    }

    fn watch_key(&mut self, token: Token) -> Result<()> {
        let key = frame::read_key(self.stream_mut(token)?)?;
        self.watchers.entry(key).or_default().push(token);
        Ok(())
    }

    fn delete_key(&mut self, token: Token) -> Result<()> {
        let key = frame::read_key(self.stream_mut(token)?)?;
        let removed = self.store.remove(&key).is_some();
        frame::write_i64(self.stream_mut(token)?, removed as i64)?;
        // a deleted key takes its watchers with it; sockets waiting on the
        // key stay parked until their own receive timeout fires
        self.watchers.remove(&key);
        Ok(())
    }

    /// reads the `{count, keys[count]}` argument list of CHECK and WAIT
    fn read_key_list(&mut self, token: Token) -> Result<Vec<String>> {
        let stream = self.stream_mut(token)?;
        let count = frame::read_u64(stream)?;
        let mut keys = Vec::new();
        for _ in 0..count {
            keys.push(frame::read_key(stream)?);
        }
        Ok(keys)
    }

    fn all_present(&self, keys: &[String]) -> bool {
        keys.iter().all(|key| self.store.contains_key(key))
    }

    /// a key just got a value: count it off for every socket parked on it,
    /// and reply STOP_WAITING to those that now have a complete set
    fn wake_waiting(&mut self, key: &str) -> Result<()> {
        let parked = match self.waiting.remove(key) {
            Some(parked) => parked,
            None => return Ok(()),
        };
        for token in parked {
            let remaining = match self.pending.get_mut(&token) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => continue,
            };
            if remaining == 0 {
                self.pending.remove(&token);
                if let Some(stream) = self.clients.get_mut(&token) {
                    frame::write_u8(stream, WaitResponse::StopWaiting as u8)?;
                }
            }
        }
        Ok(())
    }

    /// pushes a KEY_UPDATED notification to every socket watching `key`
    fn push_key_update(&mut self, key: &str, old: &[u8], new: &[u8]) -> Result<()> {
        let subscribed = match self.watchers.get(key) {
            Some(subscribed) => subscribed.clone(),
            None => return Ok(()),
        };
        for token in subscribed {
            if let Some(stream) = self.clients.get_mut(&token) {
                frame::write_u8(stream, WatchResponse::KeyUpdated as u8)?;
                frame::write_key(stream, key)?;
                frame::write_bytes(stream, old)?;
                frame::write_bytes(stream, new)?;
            }
        }
        Ok(())
    }

    /// closes a dead client's socket and removes every trace of it from the
    /// wait and watch records, dropping list buckets that become empty
    fn reap(&mut self, token: Token) {
        if let Some(stream) = self.clients.remove(&token) {
            let fd = stream.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        self.waiting.retain(|_, parked| {
            parked.retain(|t| *t != token);
            !parked.is_empty()
        });
        self.pending.remove(&token);
        self.watchers.retain(|_, subscribed| {
            subscribed.retain(|t| *t != token);
            !subscribed.is_empty()
        });
    }

    fn stream_mut(&mut self, token: Token) -> Result<&mut TcpStream> {
        self.clients.get_mut(&token).ok_or_else(|| {
            StoreError::Protocol(format!("no connection registered for {:?}", token))
        })
    }
}

/// values written by ADD are decimal strings; anything else under an ADD is
/// a client error that costs it the connection
fn parse_counter(raw: &[u8]) -> Result<i64> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| StoreError::Parsing("counter value is not valid UTF-8".to_string()))?;
    text.parse::<i64>()
        .map_err(|_| StoreError::Parsing(format!("counter value {:?} is not a decimal integer", text)))
}

/// peeks for already-buffered request bytes without blocking the loop.
/// A zero-byte peek means the peer closed; report it as buffered data so the
/// next dispatch hits end-of-stream and the client gets reaped.
fn has_buffered_data(stream: &TcpStream) -> Result<bool> {
    stream.set_nonblocking(true)?;
    let mut peeked = [0u8; 1];
    let res = stream.peek(&mut peeked);
    stream.set_nonblocking(false)?;
    match res {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.into()),
    }
}
