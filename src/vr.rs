use std::collections::HashMap;

use crate::chunkqueue::ChunkQueue;
use crate::config::{BackendConfig, RouteConfig};
use crate::error::Result;
use crate::http::{HttpRequest, HttpResponse};

/// Virtual request lifecycle (spec §4.7). Each request owned by a
/// connection walks these states in order; errors jump straight to
/// `WriteContent` with an error response already set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VRState {
    Clean,
    HandleRequestHeaders,
    ReadContent,
    HandleResponseHeaders,
    WriteContent,
    Done,
}

/// A stream-edge transform a VR installs on its body: the chunked codec
/// and the length-limited passthrough both implement this (spec §4.6).
/// `process` consumes only what's fully available from `input`, appending
/// decoded/encoded bytes to `output` and leaving any remainder in `input`.
pub trait Filter {
    fn process(&mut self, input: &mut ChunkQueue, output: &mut ChunkQueue) -> Result<()>;
    fn is_complete(&self) -> bool;
}

/// Passes exactly `remaining` bytes through untouched, for
/// `Content-Length`-framed request bodies: the VR's filter chain treats
/// byte-counted and chunked bodies the same way.
pub struct LengthLimited {
    remaining: u64,
}

impl LengthLimited {
    pub fn new(remaining: u64) -> Self {
        Self { remaining }
    }
}

impl Filter for LengthLimited {
    fn process(&mut self, input: &mut ChunkQueue, output: &mut ChunkQueue) -> Result<()> {
        let take = input.length.min(self.remaining);
        if take > 0 {
            ChunkQueue::steal_len(output, input, take);
            self.remaining -= take;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// One request's worth of routing context: the parsed request, the
/// response under construction, ad-hoc key/value settings accumulated by
/// the action list (spec §9), the current lifecycle state, and the
/// input/output filter chains that sit on the body's stream edges
/// (spec §4.6/§4.7).
pub struct VRequest {
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub settings: HashMap<String, String>,
    pub state: VRState,
    /// Decoded request body, filled by `feed_input` as bytes arrive.
    pub vr_in: ChunkQueue,
    pub filters_in: Vec<Box<dyn Filter>>,
    pub filters_out: Vec<Box<dyn Filter>>,
    /// `true` for a route served directly by this worker (static files);
    /// `false` once an action hands the request to an upstream backend
    /// (spec §4.7 direct-vs-indirect dispatch).
    pub direct: bool,
    pub matched_route: Option<RouteConfig>,
    pub matched_backend: Option<BackendConfig>,
}

impl VRequest {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            response: HttpResponse::new(200),
            settings: HashMap::new(),
            state: VRState::Clean,
            vr_in: ChunkQueue::new(),
            filters_in: Vec::new(),
            filters_out: Vec::new(),
            direct: true,
            matched_route: None,
            matched_backend: None,
        }
    }

    /// Installs the input filter matching the request's body framing,
    /// decided once headers are complete (spec §4.5/§4.6).
    pub fn install_input_framing(&mut self, framing: crate::http::RequestBodyFraming) {
        self.filters_in.clear();
        match framing {
            crate::http::RequestBodyFraming::None => {}
            crate::http::RequestBodyFraming::ContentLength(0) => {}
            crate::http::RequestBodyFraming::ContentLength(n) => {
                self.filters_in.push(Box::new(LengthLimited::new(n)));
            }
            crate::http::RequestBodyFraming::Chunked => {
                self.filters_in.push(Box::new(crate::http::chunked::ChunkedDecoder::new()));
            }
        }
    }

    /// Feeds newly-arrived raw bytes through the installed input filter
    /// (if any) into `vr_in`. A request with no body framing has no
    /// filter installed and is immediately complete.
    pub fn feed_input(&mut self, raw: &mut ChunkQueue) -> Result<()> {
        if let Some(filter) = self.filters_in.first_mut() {
            filter.process(raw, &mut self.vr_in)
        } else {
            Ok(())
        }
    }

    pub fn input_complete(&self) -> bool {
        self.filters_in.first().map(|f| f.is_complete()).unwrap_or(true)
    }

    /// Runs the response body through `filters_out` in place (spec §4.6
    /// output side) once a direct handler or backend has filled
    /// `response.body`. The whole body is always buffered here, so it's
    /// marked closed before filtering so a terminating filter (e.g. the
    /// chunked encoder) emits its trailer.
    pub fn run_output_filters(&mut self) -> Result<()> {
        if self.filters_out.is_empty() {
            return Ok(());
        }
        self.response.body.is_closed = true;
        let mut stage = std::mem::take(&mut self.response.body);
        for filter in self.filters_out.iter_mut() {
            let mut next = ChunkQueue::new();
            filter.process(&mut stage, &mut next)?;
            stage = next;
        }
        self.response.body = stage;
        Ok(())
    }

    /// Advances to the next state in the normal (non-error) sequence.
    pub fn advance(&mut self) {
        self.state = match self.state {
            VRState::Clean => VRState::HandleRequestHeaders,
            VRState::HandleRequestHeaders => VRState::ReadContent,
            VRState::ReadContent => VRState::HandleResponseHeaders,
            VRState::HandleResponseHeaders => VRState::WriteContent,
            VRState::WriteContent => VRState::Done,
            VRState::Done => VRState::Done,
        };
    }

    /// Short-circuits to response writing, used when a handler or the
    /// parser rejects the request outright (spec §4.7 error path).
    pub fn fail(&mut self, status: u16) {
        self.response = crate::http::handle_error(status, self.matched_route.as_ref(), None);
        self.direct = true;
        self.state = VRState::WriteContent;
    }

    pub fn is_done(&self) -> bool {
        self.state == VRState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpVersion, Method, RequestBodyFraming};

    fn sample_request() -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            uri: "/".to_string(),
            version: HttpVersion::Http11,
            headers: Vec::new(),
            framing: RequestBodyFraming::None,
            expect_continue: false,
            keep_alive: true,
        }
    }

    #[test]
    fn advances_through_full_lifecycle() {
        let mut vr = VRequest::new(sample_request());
        let order = [
            VRState::HandleRequestHeaders,
            VRState::ReadContent,
            VRState::HandleResponseHeaders,
            VRState::WriteContent,
            VRState::Done,
        ];
        for expected in order {
            vr.advance();
            assert_eq!(vr.state, expected);
        }
    }

    #[test]
    fn fail_jumps_straight_to_write_content() {
        let mut vr = VRequest::new(sample_request());
        vr.fail(404);
        assert_eq!(vr.state, VRState::WriteContent);
        assert_eq!(vr.response.status_code, 404);
    }

    #[test]
    fn content_length_filter_passes_exact_byte_count_and_completes() {
        let mut vr = VRequest::new(sample_request());
        vr.install_input_framing(RequestBodyFraming::ContentLength(5));
        let mut raw = ChunkQueue::new();
        raw.append_mem(b"hello");
        vr.feed_input(&mut raw).unwrap();
        assert!(vr.input_complete());
        assert_eq!(vr.vr_in.extract_to(5).unwrap(), b"hello");
    }

    #[test]
    fn chunked_filter_decodes_body_into_vr_in() {
        let mut vr = VRequest::new(sample_request());
        vr.install_input_framing(RequestBodyFraming::Chunked);
        let mut raw = ChunkQueue::new();
        raw.append_mem(b"5\r\nhello\r\n0\r\n\r\n");
        vr.feed_input(&mut raw).unwrap();
        assert!(vr.input_complete());
        assert_eq!(vr.vr_in.extract_to(5).unwrap(), b"hello");
    }

    #[test]
    fn no_body_framing_is_complete_with_no_filter() {
        let mut vr = VRequest::new(sample_request());
        vr.install_input_framing(RequestBodyFraming::None);
        assert!(vr.input_complete());
    }
}
