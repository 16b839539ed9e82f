use eddy_net::{ConnState, EventLoop, LoopHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn spawn_loop(name: &str) -> (thread::JoinHandle<()>, LoopHandle) {
    let name = name.to_string();
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut event_loop = EventLoop::with_name(&name);
        tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    (join, rx.recv().unwrap())
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn failed_connect_fires_only_the_fail_callback() {
    let (join, handle) = spawn_loop("cfail");

    let fails = Arc::new(Mutex::new(Vec::<(String, u16)>::new()));
    let new_conns = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));

    // Port 1 is assumed closed (binding it needs privileges).
    let fail_log = fails.clone();
    let connected = new_conns.clone();
    let dropped = disconnects.clone();
    let probe = handle.clone();
    let conn = handle
        .execute(move || {
            let conn = probe
                .connect(
                    "127.0.0.1",
                    1,
                    move |_| {
                        connected.fetch_add(1, Ordering::Relaxed);
                    },
                    move |_, ip, port| {
                        fail_log.lock().unwrap().push((ip.to_string(), port));
                    },
                )
                .expect("initiating the connect must succeed locally");
            conn.set_on_disconnect(move |_| {
                dropped.fetch_add(1, Ordering::Relaxed);
            });
            conn
        })
        .wait()
        .unwrap();

    wait_for("connect failure", || !fails.lock().unwrap().is_empty());

    // Give any spurious callbacks time to misfire.
    thread::sleep(Duration::from_millis(200));

    let fails = fails.lock().unwrap();
    assert_eq!(
        *fails,
        vec![("127.0.0.1".to_string(), 1)],
        "fail callback must fire exactly once with the peer address"
    );
    assert_eq!(
        new_conns.load(Ordering::Relaxed),
        0,
        "a failed connect must never report a new connection"
    );
    assert_eq!(
        disconnects.load(Ordering::Relaxed),
        0,
        "a failed connect must never report a disconnect"
    );
    assert_eq!(conn.state(), ConnState::Failed, "Failed is terminal");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn idle_connection_is_closed_within_the_timeout_window() {
    let (join, handle) = spawn_loop("idle");

    let accepted_at = Arc::new(Mutex::new(None::<Instant>));
    let (disc_tx, disc_rx) = crossbeam_channel::unbounded::<Instant>();

    let stamp = accepted_at.clone();
    let probe = handle.clone();
    let port = handle
        .execute(move || {
            let listener = probe
                .listen("127.0.0.1", 0, move |conn| {
                    *stamp.lock().unwrap() = Some(Instant::now());
                    conn.set_idle_timeout(Duration::from_millis(500));
                    conn.set_message_callback(|_, data| data.len() as isize);
                    let disc_tx = disc_tx.clone();
                    conn.set_on_disconnect(move |_| {
                        disc_tx.send(Instant::now()).unwrap();
                    });
                })
                .expect("listen on ephemeral port");
            listener.local_addr().unwrap().port()
        })
        .wait()
        .unwrap();

    // Client connects and then stays silent.
    let probe = handle.clone();
    handle
        .execute(move || {
            probe
                .connect(
                    "127.0.0.1",
                    port,
                    |_| {},
                    |_, ip, port| panic!("connect to {}:{} failed", ip, port),
                )
                .expect("initiate connect")
        })
        .wait()
        .unwrap();

    let disconnected_at = disc_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("idle connection must be dropped");
    let accepted_at = accepted_at.lock().unwrap().expect("connection accepted");

    let idle_for = disconnected_at.duration_since(accepted_at);
    assert!(
        idle_for >= Duration::from_millis(450),
        "closed too early: {:?}",
        idle_for
    );
    assert!(
        idle_for <= Duration::from_millis(900),
        "closed too late: {:?}",
        idle_for
    );

    handle.stop();
    join.join().unwrap();
}

#[test]
fn fatal_message_callback_return_disconnects() {
    let (join, handle) = spawn_loop("fatal");

    let server_disconnects = Arc::new(AtomicUsize::new(0));
    let dropped = server_disconnects.clone();
    let probe = handle.clone();
    let port = handle
        .execute(move || {
            let listener = probe
                .listen("127.0.0.1", 0, move |conn| {
                    // Any inbound byte is a protocol violation.
                    conn.set_message_callback(|_, _| -1);
                    let dropped = dropped.clone();
                    conn.set_on_disconnect(move |_| {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    });
                })
                .expect("listen on ephemeral port");
            listener.local_addr().unwrap().port()
        })
        .wait()
        .unwrap();

    let client_disconnects = Arc::new(AtomicUsize::new(0));
    let dropped = client_disconnects.clone();
    let probe = handle.clone();
    handle
        .execute(move || {
            probe
                .connect(
                    "127.0.0.1",
                    port,
                    move |conn| {
                        let dropped = dropped.clone();
                        conn.set_on_disconnect(move |_| {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        });
                        assert!(conn.send_packet(b"garbage"));
                    },
                    |_, ip, port| panic!("connect to {}:{} failed", ip, port),
                )
                .expect("initiate connect")
        })
        .wait()
        .unwrap();

    wait_for("server-side disconnect", || {
        server_disconnects.load(Ordering::Relaxed) == 1
    });
    wait_for("client-side disconnect", || {
        client_disconnects.load(Ordering::Relaxed) == 1
    });

    handle.stop();
    join.join().unwrap();
}

#[test]
fn accepted_connections_can_land_on_a_selected_loop() {
    let (accept_join, accept_handle) = spawn_loop("acceptor");
    let (worker_join, worker_handle) = spawn_loop("worker");

    let (loop_tx, loop_rx) = crossbeam_channel::unbounded::<(u64, bool)>();
    let worker = worker_handle.clone();
    let probe = accept_handle.clone();
    let port = accept_handle
        .execute(move || {
            let listener = probe
                .listen("127.0.0.1", 0, move |conn| {
                    // Runs on the loop that owns the connection.
                    loop_tx
                        .send((conn.loop_handle().id(), conn.loop_handle().is_current()))
                        .unwrap();
                })
                .expect("listen on ephemeral port");
            let worker = worker.clone();
            listener.set_loop_selector(move || worker.clone());
            listener.local_addr().unwrap().port()
        })
        .wait()
        .unwrap();

    let probe = accept_handle.clone();
    accept_handle
        .execute(move || {
            probe
                .connect(
                    "127.0.0.1",
                    port,
                    |_| {},
                    |_, ip, port| panic!("connect to {}:{} failed", ip, port),
                )
                .expect("initiate connect")
        })
        .wait()
        .unwrap();

    let (owner_id, on_owner_thread) = loop_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("accepted connection must come up");
    assert_eq!(
        owner_id,
        worker_handle.id(),
        "the loop selector must decide the owning loop"
    );
    assert!(
        on_owner_thread,
        "new-connection callback must run on the owning loop thread"
    );

    accept_handle.stop();
    worker_handle.stop();
    accept_join.join().unwrap();
    worker_join.join().unwrap();
}

#[test]
fn context_round_trips_through_the_connection() {
    let (join, handle) = spawn_loop("context");

    let (seen_tx, seen_rx) = crossbeam_channel::unbounded::<Option<String>>();
    let probe = handle.clone();
    let port = handle
        .execute(move || {
            let listener = probe
                .listen("127.0.0.1", 0, move |conn| {
                    conn.set_context(Arc::new("session-7".to_string()));
                    let seen_tx = seen_tx.clone();
                    conn.set_message_callback(move |conn, data| {
                        seen_tx
                            .send(conn.context::<String>().map(|s| (*s).clone()))
                            .unwrap();
                        data.len() as isize
                    });
                })
                .expect("listen on ephemeral port");
            listener.local_addr().unwrap().port()
        })
        .wait()
        .unwrap();

    let probe = handle.clone();
    handle
        .execute(move || {
            probe
                .connect(
                    "127.0.0.1",
                    port,
                    |conn| {
                        assert!(conn.send_packet(b"hi"));
                    },
                    |_, ip, port| panic!("connect to {}:{} failed", ip, port),
                )
                .expect("initiate connect")
        })
        .wait()
        .unwrap();

    let seen = seen_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("message with context");
    assert_eq!(
        seen.as_deref(),
        Some("session-7"),
        "context must round-trip through the connection"
    );

    handle.stop();
    join.join().unwrap();
}
