use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::client;
use crate::config::{BackendConfig, RouteConfig};
use crate::error::{EngineError, Result};
use crate::http::{HttpRequest, HttpResponse};

const UNHEALTHY_THRESHOLD: u32 = 3;
const UNHEALTHY_COOLDOWN: Duration = Duration::from_secs(10);

/// Consecutive-failure circuit breaker for one backend, shared across
/// every worker thread's own `BackendPool` for that backend name (spec
/// §4.9 health gating). This is the one piece of backend state that
/// genuinely crosses worker threads; the sockets themselves stay
/// thread-local.
#[derive(Default)]
pub struct HealthState {
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
}

impl HealthState {
    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.disabled_until = None;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_THRESHOLD {
            self.disabled_until = Some(Instant::now() + UNHEALTHY_COOLDOWN);
        }
    }

    fn is_disabled(&self) -> bool {
        self.disabled_until.map(|t| Instant::now() < t).unwrap_or(false)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    Disabled,
}

struct Job {
    id: u64,
    route: RouteConfig,
    request: HttpRequest,
    body: Vec<u8>,
}

/// Pool of background worker threads dispatching FastCGI requests to one
/// backend (spec §4.9/§4.11). Each thread owns one persistent socket and
/// pulls jobs off a shared channel, so a slow or stalled upstream never
/// blocks the mio event loop that submitted the job -- only the owning
/// background thread. `submit` is non-blocking; `take_result` polls for
/// a finished job.
pub struct BackendPool {
    pub name: String,
    job_tx: mpsc::Sender<Job>,
    results: Arc<Mutex<HashMap<u64, Result<HttpResponse, String>>>>,
    next_job_id: AtomicU64,
    health: Arc<Mutex<HealthState>>,
}

impl BackendPool {
    pub fn new(config: &BackendConfig, health: Arc<Mutex<HealthState>>) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let results = Arc::new(Mutex::new(HashMap::new()));

        let thread_count = config.max_connections.clamp(1, 4);
        let address = config.address.clone();
        let backend = config.clone();
        let timeout = Duration::from_millis(config.connect_timeout_ms).max(Duration::from_millis(100));

        for _ in 0..thread_count {
            let job_rx = Arc::clone(&job_rx);
            let results = Arc::clone(&results);
            let health = Arc::clone(&health);
            let address = address.clone();
            let backend = backend.clone();
            std::thread::spawn(move || run_worker_thread(address, backend, timeout, job_rx, results, health));
        }

        Self {
            name: config.name.clone(),
            job_tx,
            results,
            next_job_id: AtomicU64::new(1),
            health,
        }
    }

    /// Queues a job for a background thread to pick up. Refuses
    /// immediately while the circuit breaker has this backend disabled,
    /// rather than piling work onto a backend known to be down.
    pub fn submit(&self, route: &RouteConfig, request: &HttpRequest, body: &[u8]) -> std::result::Result<u64, PoolError> {
        if self.health.lock().unwrap().is_disabled() {
            return Err(PoolError::Disabled);
        }
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            id,
            route: route.clone(),
            request: request.clone(),
            body: body.to_vec(),
        };
        // A send error means every worker thread died; the caller sees
        // this as "never completes" and the connection eventually times
        // out, same as a backend that stopped responding.
        let _ = self.job_tx.send(job);
        Ok(id)
    }

    pub fn take_result(&self, job_id: u64) -> Option<std::result::Result<HttpResponse, String>> {
        self.results.lock().unwrap().remove(&job_id)
    }
}

fn run_worker_thread(
    address: String,
    backend: BackendConfig,
    timeout: Duration,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    results: Arc<Mutex<HashMap<u64, std::result::Result<HttpResponse, String>>>>,
    health: Arc<Mutex<HealthState>>,
) {
    let mut conn: Option<TcpStream> = None;
    loop {
        let job = {
            let rx = job_rx.lock().unwrap();
            match rx.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };
        let outcome = run_one(&mut conn, &address, &backend, timeout, &job);
        match &outcome {
            Ok(_) => health.lock().unwrap().record_success(),
            Err(_) => {
                health.lock().unwrap().record_failure();
                conn = None;
            }
        }
        results.lock().unwrap().insert(job.id, outcome.map_err(|e| e.to_string()));
    }
}

/// Runs one FastCGI round trip, reconnecting lazily if the persistent
/// connection from a previous job was dropped or never established.
fn run_one(conn: &mut Option<TcpStream>, address: &str, backend: &BackendConfig, timeout: Duration, job: &Job) -> Result<HttpResponse> {
    if conn.is_none() {
        let stream = TcpStream::connect(address).map_err(EngineError::Io)?;
        stream.set_read_timeout(Some(timeout)).map_err(EngineError::Io)?;
        *conn = Some(stream);
    }
    let stream = conn.as_mut().expect("connection established above");

    let wire = client::encode_request(backend, &job.route, &job.request, &job.body);
    if let Err(e) = stream.write_all(&wire) {
        *conn = None;
        return Err(EngineError::Io(e));
    }

    let mut stdout = Vec::new();
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                *conn = None;
                return Err(EngineError::Io(e));
            }
        };
        if n == 0 {
            *conn = None;
            return Err(EngineError::Upstream("backend closed connection before EndRequest".to_string()));
        }
        raw.extend_from_slice(&buf[..n]);
        if client::drain_records(&mut raw, &mut stdout)? {
            return Ok(client::parse_cgi_response(&stdout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_state_disables_after_threshold_failures() {
        let mut health = HealthState::default();
        for _ in 0..UNHEALTHY_THRESHOLD {
            health.record_failure();
        }
        assert!(health.is_disabled());
    }

    #[test]
    fn health_state_recovers_on_success() {
        let mut health = HealthState::default();
        health.record_failure();
        health.record_failure();
        health.record_success();
        assert!(!health.is_disabled());
    }
}
