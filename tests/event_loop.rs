use eddy_net::{EventLoop, EventObject, LoopHandle, EVENT_READ};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
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

#[test]
fn concurrent_execute_runs_every_task_in_the_loop_thread() {
    let (join, handle) = spawn_loop("exec");
    let counter = Arc::new(AtomicUsize::new(0));

    let mut submitters = Vec::new();
    for _ in 0..4 {
        let handle = handle.clone();
        let counter = counter.clone();
        submitters.push(thread::spawn(move || {
            for _ in 0..1000 {
                let counter = counter.clone();
                let probe = handle.clone();
                handle.execute(move || {
                    assert!(probe.is_current(), "tasks must run in the loop thread");
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
        }));
    }
    for submitter in submitters {
        submitter.join().unwrap();
    }

    // A barrier task queued after every submitter joined runs last.
    handle.execute(|| {}).wait().unwrap();
    assert_eq!(
        counter.load(Ordering::Relaxed),
        4000,
        "each execute must run exactly once"
    );

    handle.stop();
    join.join().unwrap();
}

#[test]
fn tasks_from_one_thread_run_in_submission_order() {
    let (join, handle) = spawn_loop("order");
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100usize {
        let seen = seen.clone();
        handle.execute(move || seen.lock().unwrap().push(i));
    }
    handle.execute(|| {}).wait().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        (0..100).collect::<Vec<_>>(),
        "single-thread submissions must execute FIFO"
    );

    handle.stop();
    join.join().unwrap();
}

#[test]
fn execute_on_the_loop_thread_is_inline() {
    let (join, handle) = spawn_loop("inline");

    let probe = handle.clone();
    let nested = handle
        .execute(move || probe.execute(|| 7).try_wait())
        .wait()
        .unwrap();
    assert_eq!(
        nested,
        Some(7),
        "execute from the loop thread must resolve synchronously"
    );

    handle.stop();
    join.join().unwrap();
}

#[test]
fn stop_before_run_returns_promptly() {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut event_loop = EventLoop::new();
        event_loop.handle().stop();
        event_loop.run();
        tx.send(()).unwrap();
    });

    rx.recv_timeout(Duration::from_secs(1))
        .expect("run must return after a pre-run stop");
    join.join().unwrap();
}

#[test]
fn panicking_task_resolves_as_error_and_loop_survives() {
    let (join, handle) = spawn_loop("panic");

    let fut = handle.execute(|| panic!("boom"));
    assert!(
        fut.wait().is_err(),
        "a panicking task must surface as an error"
    );
    assert_eq!(
        handle.execute(|| 5).wait().unwrap(),
        5,
        "the loop must keep running after a task panic"
    );

    handle.stop();
    join.join().unwrap();
}

struct TestObj {
    sock: UnixStream,
    id: AtomicU64,
}

impl TestObj {
    fn new() -> (Arc<Self>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (
            Arc::new(Self {
                sock: a,
                id: AtomicU64::new(0),
            }),
            b,
        )
    }
}

impl EventObject for TestObj {
    fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
    fn unique_id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }
    fn set_unique_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }
    fn handle_readable(&self) -> bool {
        true
    }
    fn handle_error(&self) {}
}

#[test]
fn register_then_unregister_leaves_the_object_set_unchanged() {
    let (join, handle) = spawn_loop("reg");

    let probe = handle.clone();
    let baseline = handle
        .execute(move || probe.object_count())
        .wait()
        .unwrap();

    let (obj, _peer) = TestObj::new();
    let probe = handle.clone();
    let (during, after) = handle
        .execute(move || {
            let obj: Arc<dyn EventObject> = obj;
            assert!(probe.register(&obj, EVENT_READ), "register must succeed");
            let during = probe.object_count();
            probe.unregister(&obj);
            (during, probe.object_count())
        })
        .wait()
        .unwrap();

    assert_eq!(during, baseline + 1, "registration must add one entry");
    assert_eq!(after, baseline, "unregistration must restore the set");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn object_ids_are_distinct_and_nonzero() {
    let (join, handle) = spawn_loop("ids");

    let (first, _peer_a) = TestObj::new();
    let (second, _peer_b) = TestObj::new();
    let probe = handle.clone();
    let (id_a, id_b) = handle
        .execute(move || {
            let first: Arc<dyn EventObject> = first;
            let second: Arc<dyn EventObject> = second;
            assert!(probe.register(&first, EVENT_READ));
            assert!(probe.register(&second, EVENT_READ));
            let ids = (first.unique_id(), second.unique_id());
            probe.unregister(&first);
            probe.unregister(&second);
            ids
        })
        .wait()
        .unwrap();

    assert_ne!(id_a, 0, "assigned ids must be nonzero");
    assert_ne!(id_b, 0, "assigned ids must be nonzero");
    assert_ne!(id_a, id_b, "live ids must be pairwise distinct");

    handle.stop();
    join.join().unwrap();
}
