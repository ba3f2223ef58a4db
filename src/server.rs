use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

use crate::backend::{BackendPool, HealthState};
use crate::config::{AppConfig, BackendConfig, ServerConfig, TlsConfig};
use crate::error::{EngineError, Result};
use crate::tls;
use crate::worker::Worker;
use halcyon_log::{info, warn};

/// Server-wide lifecycle (spec §4.12). Transitions are one-directional;
/// `Suspending`/`Suspended` exist for a future graceful-reload RPC and are
/// not yet driven by anything but `Server::new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycle {
    Init,
    Warmup,
    Running,
    Suspending,
    Suspended,
    Stopping,
    Down,
}

type ListenPlanEntry = (SocketAddr, Vec<Arc<ServerConfig>>, Option<Arc<rustls::ServerConfig>>);

pub struct Server {
    config: AppConfig,
    lifecycle: ServerLifecycle,
    worker: Worker,
    listen_plan: Vec<ListenPlanEntry>,
    backend_health: HashMap<String, Arc<Mutex<HealthState>>>,
    worker_count: usize,
    stop_flag: Arc<AtomicBool>,
    worker_counts: Vec<Arc<AtomicUsize>>,
    background: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: AppConfig) -> Result<Self> {
        let worker_count = config.worker_threads.max(1);
        let worker = Worker::new(0, Duration::from_secs(config.io_timeout_secs))?;
        Ok(Self {
            config,
            lifecycle: ServerLifecycle::Init,
            worker,
            listen_plan: Vec::new(),
            backend_health: HashMap::new(),
            worker_count,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker_counts: vec![Arc::new(AtomicUsize::new(0))],
            background: Vec::new(),
        })
    }

    /// Binds every configured `host:port` pair with `SO_REUSEPORT`
    /// (spec §4.12 warmup step), grouping server blocks that share a
    /// listen address behind the same listener and building that
    /// listener's TLS config (single-cert, or SNI-keyed when more than
    /// one virtual host on the address carries a certificate). Worker 0's
    /// listeners and backend pools are wired up here directly; the rest
    /// of the fleet repeats the same binding independently once
    /// `run_until` spawns them, so every worker ends up with its own copy
    /// of each `SO_REUSEPORT` listener and its own backend sockets.
    pub fn warmup(&mut self) -> Result<()> {
        self.lifecycle = ServerLifecycle::Warmup;

        for server in &self.config.servers {
            if let Some(backend) = &server.backend {
                self.backend_health
                    .entry(backend.name.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(HealthState::default())));
            }
        }

        let mut by_addr: HashMap<SocketAddr, Vec<Arc<ServerConfig>>> = HashMap::new();
        for server in &self.config.servers {
            let server = Arc::new(server.clone());
            for port in &server.ports {
                let addr: SocketAddr = format!("{}:{}", server.host, port).parse().map_err(|_| {
                    EngineError::Config(halcyon_yaml::YamlError::Generic(format!(
                        "invalid listen address {}:{}",
                        server.host, port
                    )))
                })?;
                by_addr.entry(addr).or_default().push(Arc::clone(&server));
            }
        }

        let mut listen_plan = Vec::new();
        for (addr, servers) in by_addr {
            let tls_entries: Vec<(String, TlsConfig)> = servers
                .iter()
                .filter_map(|s| s.tls.clone().map(|t| (s.server_name.clone(), t)))
                .collect();
            let tls_config = match tls_entries.len() {
                0 => None,
                1 => Some(tls::build_server_config(&tls_entries[0].1)?),
                _ => Some(tls::build_sni_config(&tls_entries)?),
            };
            listen_plan.push((addr, servers, tls_config));
        }

        for (addr, servers, tls_config) in &listen_plan {
            let listener = bind_reuseport(*addr)?;
            info!("listening on {}", addr);
            self.worker.add_listener(listener, servers.clone(), tls_config.clone())?;
        }
        self.worker.set_backend_pools(self.build_pools());
        self.listen_plan = listen_plan;

        Ok(())
    }

    fn build_pools(&self) -> Rc<RefCell<HashMap<String, BackendPool>>> {
        let mut pools = HashMap::new();
        for server in &self.config.servers {
            let Some(backend) = &server.backend else { continue };
            if pools.contains_key(&backend.name) {
                continue;
            }
            let health = Arc::clone(&self.backend_health[&backend.name]);
            pools.insert(backend.name.clone(), BackendPool::new(backend, health));
        }
        Rc::new(RefCell::new(pools))
    }

    /// Runs worker 0's event loop on the calling thread until
    /// `should_stop` returns true, having first spawned the rest of the
    /// worker fleet (spec §4.12/§5: an N-worker process behind one
    /// `SO_REUSEPORT` address set). `should_stop` stays on this thread
    /// since it's typically a closure over non-`Send` test state.
    pub fn run_until(&mut self, mut should_stop: impl FnMut() -> bool) -> Result<()> {
        self.lifecycle = ServerLifecycle::Running;
        self.spawn_background_workers();

        while !should_stop() && !self.stop_flag.load(Ordering::Relaxed) {
            self.worker.tick()?;
            self.worker_counts[0].store(self.worker.connection_count(), Ordering::Relaxed);
        }
        self.stop_flag.store(true, Ordering::Relaxed);

        for handle in self.background.drain(..) {
            let _ = handle.join();
        }

        self.lifecycle = ServerLifecycle::Stopping;
        self.lifecycle = ServerLifecycle::Down;
        Ok(())
    }

    fn spawn_background_workers(&mut self) {
        for id in 1..self.worker_count {
            let listen_plan = self.listen_plan.clone();
            let io_timeout = Duration::from_secs(self.config.io_timeout_secs);
            let backend_configs: Vec<(String, BackendConfig, Arc<Mutex<HealthState>>)> = self
                .config
                .servers
                .iter()
                .filter_map(|s| s.backend.as_ref())
                .map(|b| (b.name.clone(), b.clone(), Arc::clone(&self.backend_health[&b.name])))
                .collect();
            let stop_flag = Arc::clone(&self.stop_flag);
            let counter = Arc::new(AtomicUsize::new(0));
            self.worker_counts.push(Arc::clone(&counter));

            let handle = thread::Builder::new()
                .name(format!("halcyon-worker-{}", id))
                .spawn(move || {
                    if let Err(e) = run_background_worker(id, io_timeout, listen_plan, backend_configs, stop_flag, counter) {
                        warn!("worker {} exited: {}", id, e);
                    }
                })
                .expect("spawn worker thread");
            self.background.push(handle);
        }
    }

    pub fn lifecycle(&self) -> ServerLifecycle {
        self.lifecycle
    }

    /// Cross-worker stats collection (spec §4.12 collect RPC): sums each
    /// worker's last-observed connection count.
    pub fn collect_connection_count(&self) -> usize {
        self.worker_counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

fn run_background_worker(
    id: usize,
    io_timeout: Duration,
    listen_plan: Vec<ListenPlanEntry>,
    backend_configs: Vec<(String, BackendConfig, Arc<Mutex<HealthState>>)>,
    stop_flag: Arc<AtomicBool>,
    counter: Arc<AtomicUsize>,
) -> Result<()> {
    let mut worker = Worker::new(id, io_timeout)?;

    let mut pools = HashMap::new();
    for (name, backend, health) in backend_configs {
        pools.entry(name).or_insert_with(|| BackendPool::new(&backend, health));
    }
    worker.set_backend_pools(Rc::new(RefCell::new(pools)));

    for (addr, servers, tls_config) in listen_plan {
        let listener = bind_reuseport(addr)?;
        worker.add_listener(listener, servers, tls_config)?;
    }

    while !stop_flag.load(Ordering::Relaxed) {
        worker.tick()?;
        counter.store(worker.connection_count(), Ordering::Relaxed);
    }
    Ok(())
}

/// Binds one `SO_REUSEPORT` listener on `addr` so every worker in the
/// fleet can hold its own socket on the same address and let the kernel
/// spread accepted connections across them (spec §4.12/§5).
fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(EngineError::Io)?;
    socket.set_reuse_address(true).map_err(EngineError::Io)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(EngineError::Io)?;
    socket.set_nonblocking(true).map_err(EngineError::Io)?;
    socket.bind(&addr.into()).map_err(EngineError::Io)?;
    socket.listen(1024).map_err(EngineError::Io)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}
