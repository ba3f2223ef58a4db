use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use mio::Token;
use mio::net::TcpStream;

use crate::action::{self, Action, Condition};
use crate::backend::BackendPool;
use crate::chunkqueue::ChunkQueue;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::http::{HttpVersion, ParseProgress, RequestParser, handle_error};
use crate::iostream::{IoStream, ReadOutcome, WriteOutcome};
use crate::router::{self, RouteMatch};
use crate::stream::{self, Stream, StreamRef};
use crate::tls::TlsSession;
use crate::vr::{VRequest, VRState};

use halcyon_log::warn;

/// Connection lifecycle (spec §4.8). `ReadingRequest`/`ReadingBody` cover
/// the request half; `AwaitingBackend` covers a request handed to an
/// upstream and not yet answered; `Writing` covers the response half;
/// `Closing` marks a connection to be torn down once its write buffer
/// drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingRequest,
    ReadingBody,
    AwaitingBackend,
    Writing,
    Closing,
}

/// Either side of the socket a connection pumps bytes through (spec
/// §4.4/§4.10). Both variants feed plaintext into the same `raw` stream
/// node and drain the same `resp_node` on write, so everything above this
/// layer is transport-agnostic.
pub enum Transport {
    Plain(IoStream<TcpStream>),
    Tls(TlsSession),
}

pub struct Connection {
    pub transport: Transport,
    pub token: Token,
    pub servers: Vec<Arc<ServerConfig>>,
    pub state: ConnState,
    pub parser: RequestParser,
    vr: Option<VRequest>,
    pending_vr: Option<(u64, String, VRequest)>,
    pub keep_alive: bool,
    pub last_activity: Instant,
    backend_pools: Rc<RefCell<HashMap<String, BackendPool>>>,
    raw: StreamRef,
    resp_node: StreamRef,
}

impl Connection {
    pub fn new(stream: TcpStream, token: Token, servers: Vec<Arc<ServerConfig>>) -> Self {
        let raw = Stream::new();
        let resp_node = Stream::new();
        stream::connect(&resp_node, &raw);
        let io = IoStream::new(Rc::clone(&raw), stream);

        Self {
            transport: Transport::Plain(io),
            token,
            servers,
            state: ConnState::ReadingRequest,
            parser: RequestParser::new(),
            vr: None,
            pending_vr: None,
            keep_alive: true,
            last_activity: Instant::now(),
            backend_pools: Rc::new(RefCell::new(HashMap::new())),
            raw,
            resp_node,
        }
    }

    pub fn with_backend_pools(mut self, pools: Rc<RefCell<HashMap<String, BackendPool>>>) -> Self {
        self.backend_pools = pools;
        self
    }

    /// Swaps the plain transport for a TLS session over the same socket
    /// (spec §4.10). A no-op if TLS is already installed.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let sock = match self.transport {
            Transport::Plain(io) => io.sock,
            Transport::Tls(_) => return Ok(self),
        };
        let session = TlsSession::new(sock, config, Rc::clone(&self.raw))?;
        self.transport = Transport::Tls(session);
        Ok(self)
    }

    /// The socket mio polls on, regardless of transport.
    pub fn registry_source(&mut self) -> &mut TcpStream {
        match &mut self.transport {
            Transport::Plain(io) => &mut io.sock,
            Transport::Tls(tls) => tls.socket_mut(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn should_close(&self) -> bool {
        self.state == ConnState::Closing && self.resp_node.borrow().out.is_empty()
    }

    pub fn output_is_empty(&self) -> bool {
        self.resp_node.borrow().out.is_empty()
    }

    /// Drains the socket through its transport into the stream graph
    /// (spec §4.4 read phase), respecting whatever CQLimit backpressure
    /// the raw node carries. Returns `true` once the peer has closed the
    /// connection.
    pub fn read_socket(&mut self) -> bool {
        loop {
            let outcome = match &mut self.transport {
                Transport::Plain(io) => io.do_read(),
                Transport::Tls(tls) => tls.do_read(),
            };
            match outcome {
                Ok(ReadOutcome::Eof) => return true,
                Ok(ReadOutcome::WouldBlock) => return false,
                Ok(ReadOutcome::Read(_)) => continue,
                Err(_) => return true,
            }
        }
    }

    /// Flushes whatever the response stream has queued; returns `true` on
    /// a fatal write error that should close the connection.
    pub fn write_socket(&mut self) -> bool {
        loop {
            let outcome = match &mut self.transport {
                Transport::Plain(io) => io.do_write(),
                Transport::Tls(tls) => tls.do_write(),
            };
            match outcome {
                Ok(WriteOutcome::Wrote(0)) => return false,
                Ok(WriteOutcome::Wrote(_)) => continue,
                Ok(WriteOutcome::WouldBlock) => return false,
                Ok(WriteOutcome::Aborted) => return true,
                Err(_) => return true,
            }
        }
    }

    /// Advances the request/response pipeline as far as buffered data
    /// allows, resetting for a pipelined request on completion. Returns
    /// an error only on an internal invariant violation; protocol errors
    /// are turned into error responses rather than propagated.
    pub fn process(&mut self) -> Result<()> {
        loop {
            match self.state {
                ConnState::ReadingRequest => {
                    if !self.advance_request_line_and_headers()? {
                        return Ok(());
                    }
                }
                ConnState::ReadingBody => {
                    if !self.drain_body() {
                        return Ok(());
                    }
                    let Some(vr) = self.vr.take() else { return Ok(()) };
                    self.finish_request(vr);
                }
                ConnState::AwaitingBackend | ConnState::Writing | ConnState::Closing => return Ok(()),
            }
        }
    }

    fn advance_request_line_and_headers(&mut self) -> Result<bool> {
        let progress = {
            let mut raw = self.raw.borrow_mut();
            self.parser.parse(&mut raw.out)?
        };
        match progress {
            ParseProgress::NeedMore => Ok(false),
            ParseProgress::Error(code) => {
                self.queue_error_response(code, false);
                self.state = ConnState::Writing;
                self.keep_alive = false;
                Ok(false)
            }
            ParseProgress::Done(req) => {
                self.keep_alive = req.keep_alive;
                let framing = req.framing;
                let mut vr = VRequest::new(req);
                vr.install_input_framing(framing);
                vr.advance(); // Clean -> HandleRequestHeaders
                self.route_and_act(&mut vr)?;
                self.vr = Some(vr);
                self.parser = RequestParser::new();
                self.state = ConnState::ReadingBody;
                Ok(true)
            }
        }
    }

    /// Runs the matched route's action list against `vr` (spec §9):
    /// static routes install a handler that serves straight from disk,
    /// upstream routes record the backend name and leave dispatch to
    /// `begin_upstream_dispatch` once the body has fully arrived.
    fn route_and_act(&mut self, vr: &mut VRequest) -> Result<()> {
        let host_header = vr.request.header("host").map(str::to_string);
        let servers = self.servers_as_refs();
        let Some(server) = router::select_server(&servers, host_header.as_deref()).cloned() else {
            vr.fail(500);
            return Ok(());
        };

        let actions: Vec<Action> = match router::route(&server, &vr.request.uri, &vr.request.method) {
            None => {
                vr.fail(404);
                Vec::new()
            }
            Some(RouteMatch::MethodNotAllowed(_)) => {
                vr.fail(405);
                Vec::new()
            }
            Some(RouteMatch::Static(route)) => {
                let route = route.clone();
                vec![
                    Action::Setting {
                        key: "route_kind".to_string(),
                        value: "static".to_string(),
                    },
                    Action::Condition {
                        cond: Condition::HostEquals(server.server_name.clone()),
                        then_branch: vec![Action::Setting {
                            key: "vhost".to_string(),
                            value: server.server_name.clone(),
                        }],
                        else_branch: vec![],
                    },
                    Action::Function(Rc::new(move |vr: &mut VRequest| {
                        vr.direct = true;
                        vr.matched_route = Some(route.clone());
                        vr.response = crate::handlers::serve_static(&route, &vr.request.method, &vr.request.uri);
                        Ok(())
                    })),
                ]
            }
            Some(RouteMatch::Upstream { route, backend }) => {
                let route = route.clone();
                let backend_cfg = server.backend.clone().filter(|b| b.name == backend);
                vec![
                    Action::Setting {
                        key: "route_kind".to_string(),
                        value: "upstream".to_string(),
                    },
                    Action::Setting {
                        key: "backend".to_string(),
                        value: backend.clone(),
                    },
                    Action::Function(Rc::new(move |vr: &mut VRequest| {
                        vr.direct = false;
                        vr.matched_route = Some(route.clone());
                        vr.matched_backend = backend_cfg.clone();
                        Ok(())
                    })),
                ]
            }
        };

        action::run_list(&actions, vr)
    }

    /// Feeds newly-arrived bytes through the VR's input filter chain
    /// (spec §4.6). Returns `true` once the body (or its terminator) is
    /// fully consumed.
    fn drain_body(&mut self) -> bool {
        let Some(vr) = self.vr.as_mut() else { return true };
        let mut raw = self.raw.borrow_mut();
        let fed = vr.feed_input(&mut raw.out);
        drop(raw);
        if fed.is_err() {
            self.keep_alive = false;
            return true;
        }
        vr.input_complete()
    }

    fn queue_error_response(&mut self, code: u16, keep_alive: bool) {
        let mut res = handle_error(code, None, None);
        let head = res.render_head(HttpVersion::Http11, keep_alive, true);
        let mut resp = self.resp_node.borrow_mut();
        resp.out.append_mem(&head);
        ChunkQueue::steal_all(&mut resp.out, &mut res.body);
    }

    fn finish_request(&mut self, mut vr: VRequest) {
        if vr.state == VRState::HandleRequestHeaders {
            vr.advance(); // -> ReadContent
            vr.advance(); // -> HandleResponseHeaders
        }
        if vr.direct {
            if vr.state != VRState::WriteContent {
                vr.advance(); // -> WriteContent
            }
            self.finalize_response(vr);
        } else {
            self.begin_upstream_dispatch(vr);
        }
    }

    /// Runs the VR's output filters (installing the chunked encoder when
    /// framing resolves to chunked, spec §4.6) and queues the rendered
    /// head plus body onto the response stream.
    fn finalize_response(&mut self, mut vr: VRequest) {
        let version = vr.request.version;
        let keep_alive = self.keep_alive;

        if vr.response.resolve_framing(version, keep_alive) == crate::http::ResponseBodyFraming::Chunked {
            vr.filters_out.push(Box::new(crate::http::ChunkedEncoder::default()));
        }
        if let Err(e) = vr.run_output_filters() {
            warn!("response output filter failed: {}", e);
        }

        let head = vr.response.render_head(version, keep_alive, true);
        let mut resp = self.resp_node.borrow_mut();
        resp.out.append_mem(&head);
        ChunkQueue::steal_all(&mut resp.out, &mut vr.response.body);
        drop(resp);

        self.state = ConnState::Writing;
    }

    /// Hands a request's drained body to a backend pool's job queue
    /// without blocking this worker (spec §4.9/§4.11): the pool's
    /// background threads own the actual upstream socket, so this just
    /// records a job id and parks the connection in `AwaitingBackend`
    /// until `try_complete_backend` sees a result.
    fn begin_upstream_dispatch(&mut self, mut vr: VRequest) {
        let backend_name = vr.settings.get("backend").cloned();
        let route = vr.matched_route.clone();
        let (Some(backend_name), Some(route)) = (backend_name, route) else {
            vr.fail(502);
            self.finalize_response(vr);
            return;
        };

        let body = vr.vr_in.extract_to(vr.vr_in.length).unwrap_or_default();

        let pools = self.backend_pools.borrow();
        let Some(pool) = pools.get(&backend_name) else {
            drop(pools);
            vr.fail(502);
            self.finalize_response(vr);
            return;
        };

        match pool.submit(&route, &vr.request, &body) {
            Ok(job_id) => {
                drop(pools);
                self.pending_vr = Some((job_id, backend_name, vr));
                self.state = ConnState::AwaitingBackend;
            }
            Err(_) => {
                drop(pools);
                vr.fail(503);
                self.finalize_response(vr);
            }
        }
    }

    /// Polls for the result of a previously-submitted backend job.
    /// Returns `true` once the request has been resolved (either way)
    /// and the connection has moved on to `Writing`.
    pub fn try_complete_backend(&mut self) -> bool {
        let Some((job_id, backend_name, _)) = self.pending_vr.as_ref() else {
            return false;
        };
        let job_id = *job_id;
        let backend_name = backend_name.clone();

        let result = {
            let pools = self.backend_pools.borrow();
            pools.get(&backend_name).and_then(|p| p.take_result(job_id))
        };
        let Some(result) = result else { return false };

        let (_, _, mut vr) = self.pending_vr.take().expect("checked above");
        match result {
            Ok(response) => vr.response = response,
            Err(e) => {
                warn!("upstream {} dispatch failed: {}", backend_name, e);
                vr.fail(502);
            }
        }
        if vr.state != VRState::WriteContent {
            vr.advance(); // HandleResponseHeaders -> WriteContent
        }
        self.finalize_response(vr);
        true
    }

    fn servers_as_refs(&self) -> Vec<ServerConfig> {
        self.servers.iter().map(|s| (**s).clone()).collect()
    }

    /// Call once the write buffer has fully drained: either resets for a
    /// pipelined request or marks the connection for teardown (spec §4.8
    /// post-write step).
    pub fn on_write_drained(&mut self) {
        if !self.keep_alive {
            self.state = ConnState::Closing;
            return;
        }
        self.state = ConnState::ReadingRequest;
        let pipelined = !self.raw.borrow().out.is_empty();
        if pipelined {
            let _ = self.process();
        }
    }
}
