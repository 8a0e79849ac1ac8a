pub mod repair;
pub mod request;
pub mod response;
pub mod streaming;
pub mod thinking;
pub mod tools;

pub use request::{prepare_request, PreparedRequest, RequestContext};
pub use response::{process_buffered_response, BufferedOutcome};
pub use streaming::transform_sse_stream;
