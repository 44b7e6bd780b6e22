//! HTTP/1.1 connection handling.
//!
//! One [`HttpConn`] per accepted socket: a line-oriented parse state
//! machine over a fixed read buffer, request dispatch to static files
//! (mmap) or the login/registration path, and a scatter/gather write
//! pipeline that stitches the header buffer and the mapped file together.

mod conn;

pub use conn::HttpConn;

/// Per-connection read buffer capacity.
pub const READ_BUFFER_SIZE: usize = 2048;
/// Response header/error-body buffer capacity.
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Request method. Anything else is rejected while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Position of the parser within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Header,
    Content,
}

/// Outcome of a parse or dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Incomplete request; keep reading.
    NoRequest,
    /// Request fully parsed.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    /// Target resolved and mapped; ready for response assembly.
    FileRequest,
    InternalError,
    /// The socket was already closed underneath the task.
    ClosedConnection,
}

/// Result of scanning for one `\r\n`-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// Complete line extracted.
    Ok,
    /// Malformed line terminator.
    Bad,
    /// Need more bytes.
    Open,
}

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str =
    "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str =
    "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_FORM: &str =
    "There was an unusual problem serving the request file.\n";

/// Body served for a zero-length file.
pub const EMPTY_PAGE_BODY: &str = "<html><body></body></html>";
