//! The watch-listener: a background thread, one per client, that drains
//! KEY_UPDATED notifications off the client's dedicated listen socket and
//! hands them to the callbacks registered with [`Store::watch_key`].
//!
//! Callbacks run serially on this thread, in the order the daemon pushed
//! the updates. A callback must not call back into the same store: the
//! store's request socket belongs to the thread that owns the store, and a
//! blocking call from here would deadlock the notification stream it is
//! being fed by.
//!
//! [`Store::watch_key`]: ../struct.Store.html#method.watch_key

use std::collections::HashMap;
use std::convert::TryFrom;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, warn};

use crate::frame;
use crate::protocol::WatchResponse;
use crate::Result;

/// the function invoked when a watched key changes, with the key's old and
/// new values; an insert reports an empty old value
pub type WatchCallback = Box<dyn FnMut(Vec<u8>, Vec<u8>) + Send>;

/// token for the listen socket carrying pushed notifications
const NOTIFY: Token = Token(0);
/// token for the shutdown waker
const SHUTDOWN: Token = Token(1);
/// how long the between-frames peek waits before handing control back to
/// the poller
const PEEK_TIMEOUT: Duration = Duration::from_millis(10);

/// key -> callback table, written by the store's thread and read here
type CallbackTable = Arc<Mutex<HashMap<String, WatchCallback>>>;

/// owns the reading half of the listen socket and the thread that drains it
pub(crate) struct WatchListener {
    callbacks: CallbackTable,
    waker: Waker,
    handle: Option<JoinHandle<()>>,
}

impl WatchListener {
    /// spawns the listener thread over its own clone of the listen socket
    pub(crate) fn spawn(stream: TcpStream) -> Result<WatchListener> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), SHUTDOWN)?;
        let callbacks: CallbackTable = Arc::new(Mutex::new(HashMap::new()));
        let table = Arc::clone(&callbacks);
        let handle = thread::Builder::new()
            .name("rendez-watch".to_string())
            .spawn(move || {
                if let Err(e) = listen(poll, stream, table) {
                    error!("watch listener exited with an error: {:?}", e);
                }
            })?;
        Ok(WatchListener {
            callbacks,
            waker,
            handle: Some(handle),
        })
    }

    /// publishes a callback under `key`. The entry is visible to the
    /// listener thread as soon as this returns, so it must be called before
    /// the matching WATCH_KEY request is sent: a notification can then never
    /// arrive ahead of its callback.
    pub(crate) fn add_callback(&self, key: String, callback: WatchCallback) {
        self.callbacks
            .lock()
            .expect("watch callback table poisoned")
            .insert(key, callback);
    }
}

impl Drop for WatchListener {
    fn drop(&mut self) {
        let _ = self.waker.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn listen(mut poll: Poll, mut stream: TcpStream, callbacks: CallbackTable) -> Result<()> {
    let fd = stream.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), NOTIFY, Interest::READABLE)?;
    let mut events = Events::with_capacity(8);
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }
        if events.iter().any(|event| event.token() == SHUTDOWN) {
            debug!("watch listener stopping");
            return Ok(());
        }
        if events.iter().any(|event| event.token() == NOTIFY) {
            drain_notifications(&mut stream, &callbacks)?;
        }
    }
}

/// dispatches every notification already buffered on the socket. A zero
/// byte peek means the daemon side closed; that is ignored, and the thread
/// keeps running until its own shutdown signal fires.
///
/// The peek carries a short receive timeout instead of flipping the socket
/// into non-blocking mode: the store's thread writes WATCH_KEY requests on
/// another handle of this same socket, and a receive timeout is the one
/// piece of socket state the write path can never observe.
fn drain_notifications(stream: &mut TcpStream, callbacks: &CallbackTable) -> Result<()> {
    loop {
        stream.set_read_timeout(Some(PEEK_TIMEOUT))?;
        let mut peeked = [0u8; 1];
        let res = stream.peek(&mut peeked);
        stream.set_read_timeout(None)?;
        match res {
            Ok(0) => return Ok(()),
            Ok(_) => dispatch_notification(stream, callbacks)?,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// reads one KEY_UPDATED frame and invokes the callback registered for its
/// key with the old and new values
fn dispatch_notification(stream: &mut TcpStream, callbacks: &CallbackTable) -> Result<()> {
    WatchResponse::try_from(frame::read_u8(stream)?)?;
    let key = frame::read_key(stream)?;
    let old = frame::read_bytes(stream)?;
    let new = frame::read_bytes(stream)?;
    let mut table = callbacks.lock().expect("watch callback table poisoned");
    match table.get_mut(&key) {
        Some(callback) => callback(old, new),
        None => warn!("update for {} arrived with no registered callback", key),
    }
    Ok(())
}
