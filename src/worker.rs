use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use mio::net::TcpListener;

use crate::backend::BackendPool;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnState};
use crate::error::Result;

const LISTENER_TOKEN_BASE: usize = 0;
const CONN_TOKEN_BASE: usize = 1_000_000;

/// One worker's event loop: a `mio::Poll` plus the connection table it
/// owns (spec §4 Worker row, §5). Workers never share connections; each
/// owns its own backend pools too -- only a backend's `HealthState` is
/// shared across the fleet, threaded in by `Server`.
pub struct Worker {
    pub id: usize,
    poll: Poll,
    listeners: HashMap<Token, TcpListener>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    io_timeout: Duration,
    servers_by_listener: HashMap<Token, Vec<Arc<ServerConfig>>>,
    tls_configs: HashMap<Token, Arc<rustls::ServerConfig>>,
    backend_pools: Rc<RefCell<HashMap<String, BackendPool>>>,
}

impl Worker {
    pub fn new(id: usize, io_timeout: Duration) -> Result<Self> {
        Ok(Self {
            id,
            poll: Poll::new()?,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            next_token: CONN_TOKEN_BASE,
            io_timeout,
            servers_by_listener: HashMap::new(),
            tls_configs: HashMap::new(),
            backend_pools: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    pub fn set_backend_pools(&mut self, pools: Rc<RefCell<HashMap<String, BackendPool>>>) {
        self.backend_pools = pools;
    }

    pub fn add_listener(
        &mut self,
        mut listener: TcpListener,
        servers: Vec<Arc<ServerConfig>>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<()> {
        let token = Token(LISTENER_TOKEN_BASE + self.listeners.len());
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        self.listeners.insert(token, listener);
        self.servers_by_listener.insert(token, servers);
        if let Some(tls) = tls {
            self.tls_configs.insert(token, tls);
        }
        Ok(())
    }

    fn next_conn_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Blocks on `poll` once, then dispatches every ready event plus any
    /// connection whose backend job has since resolved. Returns the
    /// number of connections still open, for diagnostics/tests.
    pub fn tick(&mut self) -> Result<usize> {
        let mut events = Events::with_capacity(1024);
        self.poll.poll(&mut events, Some(self.io_timeout))?;

        let ready: Vec<Token> = events.iter().map(|e| e.token()).collect();
        for token in ready {
            if self.listeners.contains_key(&token) {
                self.accept_loop(token)?;
            } else {
                self.service_connection(token)?;
            }
        }

        self.poll_backends()?;
        self.reap_idle();
        Ok(self.connections.len())
    }

    fn accept_loop(&mut self, listener_token: Token) -> Result<()> {
        loop {
            let accepted = {
                let listener = self.listeners.get(&listener_token).unwrap();
                listener.accept()
            };
            match accepted {
                Ok((mut stream, _addr)) => {
                    let token = self.next_conn_token();
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    let servers = self
                        .servers_by_listener
                        .get(&listener_token)
                        .cloned()
                        .unwrap_or_default();
                    let mut conn = Connection::new(stream, token, servers)
                        .with_backend_pools(Rc::clone(&self.backend_pools));
                    if let Some(tls_config) = self.tls_configs.get(&listener_token) {
                        conn = conn.with_tls(Arc::clone(tls_config))?;
                    }
                    self.connections.insert(token, conn);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(_) => return Ok(()),
            }
        }
    }

    fn service_connection(&mut self, token: Token) -> Result<()> {
        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return Ok(());
            };
            conn.touch();
            if conn.state != ConnState::Writing && conn.state != ConnState::AwaitingBackend {
                let eof = conn.read_socket();
                if eof {
                    conn.state = ConnState::Closing;
                } else {
                    conn.process()?;
                }
            }
        }
        self.drive_write(token)
    }

    /// Sweeps connections parked on an upstream dispatch; any whose job
    /// has resolved are moved back into the normal write cycle.
    fn poll_backends(&mut self) -> Result<()> {
        let awaiting: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == ConnState::AwaitingBackend)
            .map(|(t, _)| *t)
            .collect();

        for token in awaiting {
            let resolved = match self.connections.get_mut(&token) {
                Some(conn) => conn.try_complete_backend(),
                None => false,
            };
            if resolved {
                self.drive_write(token)?;
            }
        }
        Ok(())
    }

    fn drive_write(&mut self, token: Token) -> Result<()> {
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };

        if conn.state == ConnState::Writing {
            let fatal = conn.write_socket();
            if fatal {
                conn.state = ConnState::Closing;
            } else if conn.output_is_empty() {
                conn.on_write_drained();
            }
        }

        let interest = match conn.state {
            ConnState::Writing => Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        if conn.state != ConnState::Closing || !conn.should_close() {
            let _ = self
                .poll
                .registry()
                .reregister(conn.registry_source(), token, interest);
        }

        if conn.should_close() {
            self.connections.remove(&token);
        }
        Ok(())
    }

    fn reap_idle(&mut self) {
        let now = Instant::now();
        let timeout = self.io_timeout;
        let stale: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_activity) > timeout)
            .map(|(t, _)| *t)
            .collect();
        for token in stale {
            self.connections.remove(&token);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
