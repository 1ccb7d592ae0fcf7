//! End-to-end tests that run a real daemon on an ephemeral localhost port
//! and drive it through [`Store`] clients, the way a distributed job would.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use rendez::{Store, StoreConfig};

/// a store hosting its own daemon on an ephemeral port
fn server() -> Store {
    Store::connect(StoreConfig::new("127.0.0.1", 0).server()).expect("server store")
}

/// a plain client of the daemon at `port`
fn client(port: u16) -> Store {
    Store::connect(StoreConfig::new("127.0.0.1", port)).expect("client store")
}

#[test]
fn set_then_get_round_trips() {
    let mut store = server();
    store.set("greeting", b"hello").unwrap();
    assert_eq!(store.get("greeting").unwrap(), b"hello".to_vec());

    // overwrite
    store.set("greeting", b"goodbye").unwrap();
    assert_eq!(store.get("greeting").unwrap(), b"goodbye".to_vec());
}

#[test]
fn values_may_be_empty_or_contain_zero_bytes() {
    let mut store = server();

    store.set("empty", b"").unwrap();
    assert_eq!(store.get("empty").unwrap(), Vec::<u8>::new());

    let binary = vec![0u8, 1, 0, 2, 0];
    store.set("binary", &binary).unwrap();
    assert_eq!(store.get("binary").unwrap(), binary);
}

#[test]
fn three_clients_share_a_counter() {
    let mut store = server();
    let port = store.port();

    let (tx, rx) = channel::unbounded();
    let mut workers = Vec::new();
    for _ in 0..3 {
        let tx = tx.clone();
        workers.push(thread::spawn(move || {
            let mut store = client(port);
            tx.send(store.add("c", 1).unwrap()).unwrap();
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let mut totals: Vec<i64> = rx.try_iter().collect();
    totals.sort_unstable();
    assert_eq!(totals, vec![1, 2, 3]);
    assert_eq!(store.get("c").unwrap(), b"3".to_vec());
}

#[test]
fn add_replies_with_the_running_total() {
    let mut store = server();
    assert_eq!(store.add("total", 5).unwrap(), 5);
    assert_eq!(store.add("total", -2).unwrap(), 3);
    assert_eq!(store.add("total", 0).unwrap(), 3);
    assert_eq!(store.get("total").unwrap(), b"3".to_vec());
}

#[test]
fn wait_returns_once_the_key_is_set() {
    let mut store = server();
    let port = store.port();

    let waiter = thread::spawn(move || {
        let mut store = client(port);
        store
            .wait_with_timeout(&["k"], Some(Duration::from_secs(5)))
            .unwrap();
        store.get("k").unwrap()
    });

    thread::sleep(Duration::from_millis(300));
    store.set("k", &[0xab]).unwrap();
    assert_eq!(waiter.join().unwrap(), vec![0xab]);
}

#[test]
fn wait_on_several_keys_needs_all_of_them() {
    let mut store = server();
    let port = store.port();
    store.set("already-there", b"1").unwrap();

    let (done_tx, done_rx) = channel::bounded(1);
    let waiter = thread::spawn(move || {
        let mut store = client(port);
        store
            .wait_with_timeout(&["already-there", "a", "b"], Some(Duration::from_secs(5)))
            .unwrap();
        done_tx.send(()).unwrap();
    });

    thread::sleep(Duration::from_millis(200));
    store.set("a", b"1").unwrap();
    // only one of the two missing keys is in; the waiter must still block
    assert!(done_rx.recv_timeout(Duration::from_millis(300)).is_err());

    store.set("b", b"1").unwrap();
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    waiter.join().unwrap();
}

#[test]
fn wait_times_out_when_nobody_sets_the_key() {
    let store = server();
    let port = store.port();

    let mut doomed = client(port);
    let err = doomed
        .wait_with_timeout(&["missing"], Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(err.is_timeout(), "expected a timeout, got {:?}", err);
    drop(doomed);

    // the daemon shrugged the dead connection off and serves new clients
    let mut fresh = client(port);
    fresh.set("other", b"fine").unwrap();
    assert_eq!(fresh.get("other").unwrap(), b"fine".to_vec());
}

#[test]
fn a_dead_waiter_leaves_no_trace_behind() {
    let mut store = server();
    let port = store.port();

    // park a waiter on the key, then let its connection die
    let mut doomed = client(port);
    let _ = doomed.wait_with_timeout(&["gate"], Some(Duration::from_millis(100)));
    drop(doomed);
    thread::sleep(Duration::from_millis(200));

    // a fresh waiter on the same key behaves as if the dead one never was
    let waiter = thread::spawn(move || {
        let mut store = client(port);
        store
            .wait_with_timeout(&["gate"], Some(Duration::from_secs(5)))
            .unwrap();
    });
    thread::sleep(Duration::from_millis(200));
    store.set("gate", b"open").unwrap();
    waiter.join().unwrap();

    // and the setter's connection survived waking it
    assert_eq!(store.get("gate").unwrap(), b"open".to_vec());
}

#[test]
fn watchers_see_every_mutation_in_order() {
    let mut watcher = server();
    let port = watcher.port();
    let mut writer = client(port);

    let (tx, rx) = channel::unbounded();
    watcher
        .watch_key("k", move |old, new| {
            tx.send((old, new)).unwrap();
        })
        .unwrap();
    // registration has no acknowledgement; give it a moment to land
    thread::sleep(Duration::from_millis(200));

    writer.set("k", &[1]).unwrap();
    writer.set("k", &[2]).unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(rx.recv_timeout(timeout).unwrap(), (vec![], vec![1]));
    assert_eq!(rx.recv_timeout(timeout).unwrap(), (vec![1], vec![2]));

    // deletion must not notify
    assert!(writer.delete_key("k").unwrap());
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn watchers_hear_adds_and_successful_compare_sets() {
    let mut watcher = server();
    let port = watcher.port();
    let mut writer = client(port);

    let (tx, rx) = channel::unbounded();
    watcher
        .watch_key("n", move |old, new| {
            tx.send((old, new)).unwrap();
        })
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    writer.add("n", 7).unwrap();
    writer.compare_set("n", b"7", b"8").unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(rx.recv_timeout(timeout).unwrap(), (vec![], b"7".to_vec()));
    assert_eq!(
        rx.recv_timeout(timeout).unwrap(),
        (b"7".to_vec(), b"8".to_vec())
    );
}

#[test]
fn compare_set_fixed_points() {
    let mut store = server();

    // a missing key echoes the expected value back and stores nothing
    assert_eq!(
        store.compare_set("k", b"expected", b"desired").unwrap(),
        b"expected".to_vec()
    );
    assert!(!store.check(&["k"]).unwrap());

    // a mismatch leaves the stored value alone
    store.set("k", &[1]).unwrap();
    assert_eq!(store.compare_set("k", &[9], &[2]).unwrap(), vec![1]);
    assert_eq!(store.get("k").unwrap(), vec![1]);

    // a match swaps the value in
    assert_eq!(store.compare_set("k", &[1], &[2]).unwrap(), vec![2]);
    assert_eq!(store.get("k").unwrap(), vec![2]);
}

#[test]
fn compare_set_miss_does_not_notify_watchers() {
    let mut watcher = server();
    let port = watcher.port();
    let mut writer = client(port);
    writer.set("k", &[1]).unwrap();

    let (tx, rx) = channel::unbounded();
    watcher
        .watch_key("k", move |old, new| {
            tx.send((old, new)).unwrap();
        })
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    assert_eq!(writer.compare_set("k", &[9], &[2]).unwrap(), vec![1]);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn delete_reports_whether_the_key_existed() {
    let mut store = server();
    store.set("k", &[0]).unwrap();
    assert!(store.delete_key("k").unwrap());
    assert!(!store.delete_key("k").unwrap());
}

#[test]
fn check_and_num_keys_observe_the_map() {
    let mut store = server();
    assert_eq!(store.get_num_keys().unwrap(), 0);
    assert!(!store.check(&["a", "b"]).unwrap());

    store.set("a", b"1").unwrap();
    assert!(!store.check(&["a", "b"]).unwrap());

    store.set("b", b"2").unwrap();
    assert!(store.check(&["a", "b"]).unwrap());
    assert_eq!(store.get_num_keys().unwrap(), 2);

    store.delete_key("a").unwrap();
    assert_eq!(store.get_num_keys().unwrap(), 1);
}

#[test]
fn the_server_gives_up_on_missing_workers_quietly() {
    let start = Instant::now();
    let store = Store::connect(
        StoreConfig::new("127.0.0.1", 0)
            .server()
            .num_workers(2)
            .timeout(Some(Duration::from_millis(200))),
    )
    .expect("server store");
    assert!(start.elapsed() >= Duration::from_millis(200));
    drop(store);
}

#[test]
fn a_full_job_rendezvouses_through_the_counter() {
    // reserve an ephemeral port for the job to agree on
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let server = thread::spawn(move || {
        Store::connect(
            StoreConfig::new("127.0.0.1", port)
                .server()
                .num_workers(3)
                .timeout(Some(Duration::from_secs(10))),
        )
        .expect("server store")
    });
    let mut workers = Vec::new();
    for _ in 0..2 {
        workers.push(thread::spawn(move || {
            Store::connect(
                StoreConfig::new("127.0.0.1", port)
                    .num_workers(3)
                    .timeout(Some(Duration::from_secs(10))),
            )
            .expect("worker store")
        }));
    }

    let mut server = server.join().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }

    // the only key so far is the check-in counter itself
    assert_eq!(server.get_num_keys().unwrap(), 1);
}

#[test]
fn a_client_store_reports_the_daemons_port() {
    let store = server();
    assert!(store.port() != 0);
    assert_eq!(store.host(), "127.0.0.1");

    let peer = client(store.port());
    assert_eq!(peer.port(), store.port());
}

#[test]
fn waiting_on_a_present_key_returns_at_once() {
    let mut store = server();
    store.set("here", b"1").unwrap();
    store
        .wait_with_timeout(&["here"], Some(Duration::from_millis(500)))
        .unwrap();
}

#[test]
fn a_short_default_timeout_applies_to_get() {
    let mut store = Store::connect(
        StoreConfig::new("127.0.0.1", 0)
            .server()
            .timeout(Some(Duration::from_millis(100))),
    )
    .expect("server store");
    let err = store.get("never-set").unwrap_err();
    assert!(err.is_timeout(), "expected a timeout, got {:?}", err);
}
