use eddy_net::{ConnState, EventLoop, LoopHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

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
fn echo_round_trip_and_synchronous_close() {
    let (join, handle) = spawn_loop("echo");

    let server_disconnects = Arc::new(AtomicUsize::new(0));
    let client_disconnects = Arc::new(AtomicUsize::new(0));

    // Echo server on an ephemeral port.
    let server_disc = server_disconnects.clone();
    let probe = handle.clone();
    let port = handle
        .execute(move || {
            let listener = probe
                .listen("127.0.0.1", 0, move |conn| {
                    let server_disc = server_disc.clone();
                    conn.set_message_callback(|conn, data| {
                        conn.send_packet(data);
                        data.len() as isize
                    });
                    conn.set_on_disconnect(move |_| {
                        server_disc.fetch_add(1, Ordering::Relaxed);
                    });
                })
                .expect("listen on ephemeral port");
            listener.local_addr().unwrap().port()
        })
        .wait()
        .unwrap();

    // Client on the same loop.
    let (reply_tx, reply_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let client_disc = client_disconnects.clone();
    let probe = handle.clone();
    let conn = handle
        .execute(move || {
            probe
                .connect(
                    "127.0.0.1",
                    port,
                    move |conn| {
                        let reply_tx = reply_tx.clone();
                        conn.set_message_callback(move |_, data| {
                            reply_tx.send(data.to_vec()).unwrap();
                            data.len() as isize
                        });
                        let client_disc = client_disc.clone();
                        conn.set_on_disconnect(move |_| {
                            client_disc.fetch_add(1, Ordering::Relaxed);
                        });
                        assert!(conn.send_packet(b"PING\r\n"), "send on fresh connection");
                    },
                    |_, ip, port| panic!("connect to {}:{} failed", ip, port),
                )
                .expect("initiate connect")
        })
        .wait()
        .unwrap();

    let mut reply = Vec::new();
    while reply.len() < 6 {
        let chunk = reply_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("echo reply");
        reply.extend_from_slice(&chunk);
    }
    assert_eq!(reply, b"PING\r\n", "client must get its bytes echoed back");

    // Synchronous close from a foreign thread.
    conn.active_close(true);
    assert_eq!(conn.state(), ConnState::Disconnected);
    assert_eq!(
        client_disconnects.load(Ordering::Relaxed),
        1,
        "client side must observe exactly one disconnect"
    );

    wait_for("server-side disconnect", || {
        server_disconnects.load(Ordering::Relaxed) == 1
    });

    // A second close must not re-fire callbacks.
    conn.active_close(true);
    assert_eq!(client_disconnects.load(Ordering::Relaxed), 1);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn message_callback_frames_fixed_size_messages() {
    let (join, handle) = spawn_loop("framed");

    let (chunk_tx, chunk_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let probe = handle.clone();
    let port = handle
        .execute(move || {
            let listener = probe
                .listen("127.0.0.1", 0, move |conn| {
                    let chunk_tx = chunk_tx.clone();
                    // Consume exactly three bytes per invocation.
                    conn.set_message_callback(move |_, data| {
                        if data.len() < 3 {
                            return 0;
                        }
                        chunk_tx.send(data[..3].to_vec()).unwrap();
                        3
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
                        assert!(conn.send_packet(b"ABCDEF"));
                    },
                    |_, ip, port| panic!("connect to {}:{} failed", ip, port),
                )
                .expect("initiate connect")
        })
        .wait()
        .unwrap();

    let first = chunk_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("first frame");
    let second = chunk_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("second frame");
    assert_eq!(first, b"ABC");
    assert_eq!(second, b"DEF");
    assert!(
        chunk_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "exactly two frames expected from ABCDEF"
    );

    handle.stop();
    join.join().unwrap();
}

#[test]
fn empty_send_is_a_noop_success() {
    let (join, handle) = spawn_loop("empty");

    let server_bytes = Arc::new(AtomicUsize::new(0));
    let counted = server_bytes.clone();
    let probe = handle.clone();
    let port = handle
        .execute(move || {
            let listener = probe
                .listen("127.0.0.1", 0, move |conn| {
                    let counted = counted.clone();
                    conn.set_message_callback(move |_, data| {
                        counted.fetch_add(data.len(), Ordering::Relaxed);
                        data.len() as isize
                    });
                })
                .expect("listen on ephemeral port");
            listener.local_addr().unwrap().port()
        })
        .wait()
        .unwrap();

    let (sent_tx, sent_rx) = crossbeam_channel::unbounded::<bool>();
    let probe = handle.clone();
    handle
        .execute(move || {
            probe
                .connect(
                    "127.0.0.1",
                    port,
                    move |conn| {
                        sent_tx.send(conn.send_packet(&[])).unwrap();
                    },
                    |_, ip, port| panic!("connect to {}:{} failed", ip, port),
                )
                .expect("initiate connect")
        })
        .wait()
        .unwrap();

    assert!(
        sent_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        "empty payload must report success"
    );
    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        server_bytes.load(Ordering::Relaxed),
        0,
        "empty payload must produce no observable I/O"
    );

    handle.stop();
    join.join().unwrap();
}
