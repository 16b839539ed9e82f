use clap::Parser;
use eddy_net::{Config, EventLoop, LoopHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Number of worker event loops (0 = number of CPUs)
    #[arg(short, long, default_value_t = 0)]
    loops: usize,

    /// Close connections idle longer than this many milliseconds (0 = never)
    #[arg(long, default_value_t = 0)]
    idle_timeout_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("eddy_net={}", log_level))
        .init();

    let config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)?
    } else {
        Config {
            bind_addr: args.bind,
            port: args.port,
            loops: if args.loops == 0 {
                num_cpus::get()
            } else {
                args.loops
            },
            idle_timeout_ms: args.idle_timeout_ms,
            ..Default::default()
        }
    };
    config.validate()?;

    info!(
        "starting eddy-echo v{} on {}:{} with {} worker loops",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr,
        config.port,
        config.loops
    );

    // Worker loops, one thread each; accepted connections are distributed
    // across them round-robin.
    let mut workers: Vec<LoopHandle> = Vec::new();
    let mut joins = Vec::new();
    for i in 0..config.loops {
        let (tx, rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name(format!("worker-{}", i))
            .spawn(move || {
                let mut worker = EventLoop::with_name(&format!("worker-{}", i));
                tx.send(worker.handle()).expect("report worker handle");
                worker.run();
            })?;
        workers.push(rx.recv()?);
        joins.push(join);
    }

    let mut main_loop = EventLoop::with_name("main");
    let main_handle = main_loop.handle();

    {
        let handles: Vec<LoopHandle> = workers
            .iter()
            .cloned()
            .chain([main_handle.clone()])
            .collect();
        ctrlc::set_handler(move || {
            info!("received shutdown signal, stopping loops");
            for handle in &handles {
                handle.stop();
            }
        })?;
    }

    let idle_timeout = Duration::from_millis(config.idle_timeout_ms);
    let nodelay = config.tcp_nodelay;
    let listener = main_handle.listen(&config.bind_addr, config.port, move |conn| {
        info!("new client {}:{}", conn.peer_ip(), conn.peer_port());
        conn.set_nodelay(nodelay);
        if !idle_timeout.is_zero() {
            conn.set_idle_timeout(idle_timeout);
        }
        conn.set_message_callback(|conn, data| {
            conn.send_packet(data);
            data.len() as isize
        });
        conn.set_on_disconnect(|conn| {
            info!("client {}:{} disconnected", conn.peer_ip(), conn.peer_port());
        });
    })?;

    if !workers.is_empty() {
        let pool = workers.clone();
        let next = AtomicUsize::new(0);
        listener.set_loop_selector(move || {
            let i = next.fetch_add(1, Ordering::Relaxed) % pool.len();
            pool[i].clone()
        });
    }

    main_loop.run();

    for handle in &workers {
        handle.stop();
    }
    for join in joins {
        let _ = join.join();
    }

    info!("server shutdown complete");
    Ok(())
}
