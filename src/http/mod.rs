pub mod chunked;
pub mod request;
pub mod response;

pub use chunked::{ChunkedDecoder, ChunkedEncoder, encode_available};
pub use request::{
    BodyFraming as RequestBodyFraming, HeaderLine as RequestHeaderLine, HttpRequest, HttpVersion,
    Method, ParseProgress, RequestParser,
};
pub use response::{
    BodyFraming as ResponseBodyFraming, HeaderLine as ResponseHeaderLine, HttpResponse,
    generate_autoindex, handle_error, mime_type_for, status_text,
};
