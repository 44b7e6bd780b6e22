//! Per-connection HTTP state machine.
//!
//! The parser walks the fixed read buffer with two cursors: `read_idx`
//! marks how far the socket has filled it, `checked_idx` how far parsing
//! has consumed it. Lines are yielded as ranges between `start_line` and
//! the terminator found by the line sub-FSM. The response is a fixed
//! header buffer plus, for file requests, a read-only mmap of the target;
//! both drain through one vectored write.
//!
//! Connection fds are registered one-shot, so after every handled event
//! exactly one `rearm` call re-expresses interest. That discipline is
//! what keeps at most one task per connection in flight without a lock
//! held across threads.

use std::fmt;
use std::fs;
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::ops::Range;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;
use mysql::Conn;
use tracing::{debug, info};

use crate::db::{RegisterOutcome, UserStore};
use crate::runtime::{Interest, Poller, TriggerMode};

use super::{
    CheckState, HttpCode, LineStatus, Method, EMPTY_PAGE_BODY, ERROR_403_FORM,
    ERROR_403_TITLE, ERROR_404_FORM, ERROR_404_TITLE, ERROR_500_FORM, ERROR_500_TITLE,
    OK_200_TITLE, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE,
};

pub struct HttpConn {
    stream: Option<TcpStream>,
    fd: RawFd,
    peer: SocketAddr,
    token: u64,
    poller: Arc<Poller>,
    trigger: TriggerMode,
    doc_root: Arc<PathBuf>,

    read_buf: Box<[u8; READ_BUFFER_SIZE]>,
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
    line_end: usize,

    write_buf: Vec<u8>,

    check_state: CheckState,
    method: Method,
    url: String,
    version: String,
    host: String,
    content_length: usize,
    linger: bool,
    cgi: bool,
    body: String,

    real_file: PathBuf,
    file_len: usize,
    file_map: Option<Mmap>,
    iov_count: usize,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl HttpConn {
    /// Wrap an accepted socket. The caller registers the fd with the
    /// poller; this connection only rearms it.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        doc_root: Arc<PathBuf>,
        trigger: TriggerMode,
        token: u64,
        poller: Arc<Poller>,
    ) -> Self {
        let fd = stream.as_raw_fd();
        let mut conn = Self {
            stream: Some(stream),
            fd,
            peer,
            token,
            poller,
            trigger,
            doc_root,
            read_buf: Box::new([0u8; READ_BUFFER_SIZE]),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            line_end: 0,
            write_buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            check_state: CheckState::RequestLine,
            method: Method::Get,
            url: String::new(),
            version: String::new(),
            host: String::new(),
            content_length: 0,
            linger: false,
            cgi: false,
            body: String::new(),
            real_file: PathBuf::new(),
            file_len: 0,
            file_map: None,
            iov_count: 0,
            bytes_to_send: 0,
            bytes_have_send: 0,
        };
        conn.init_request();
        conn
    }

    /// Reset per-request state. The socket, document root, trigger mode
    /// and poller registration survive across kept-alive requests.
    fn init_request(&mut self) {
        self.read_buf.fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.line_end = 0;
        self.write_buf.clear();
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.version.clear();
        self.host.clear();
        self.content_length = 0;
        self.linger = false;
        self.cgi = false;
        self.body.clear();
        self.real_file = PathBuf::new();
        self.file_len = 0;
        self.file_map = None;
        self.iov_count = 0;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Release the mmap and hand the socket back to the caller, leaving
    /// the connection inert. Any task still holding the slot sees the
    /// missing stream and bails out.
    pub fn take_stream(&mut self) -> Option<TcpStream> {
        self.file_map = None;
        self.stream.take()
    }

    // ---- reading ----------------------------------------------------

    /// Pull whatever the socket has. Level-triggered mode does a single
    /// read; edge-triggered mode must drain until `WouldBlock`. Returns
    /// false on EOF, error, or a full read buffer.
    pub fn read_once(&mut self) -> bool {
        if self.read_idx >= READ_BUFFER_SIZE {
            return false;
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        match self.trigger {
            TriggerMode::Level => match stream.read(&mut self.read_buf[self.read_idx..]) {
                Ok(0) => false,
                Ok(n) => {
                    self.read_idx += n;
                    true
                }
                Err(_) => false,
            },
            TriggerMode::Edge => loop {
                match stream.read(&mut self.read_buf[self.read_idx..]) {
                    Ok(0) => return false,
                    Ok(n) => self.read_idx += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return false,
                }
            },
        }
    }

    // ---- line sub-FSM ------------------------------------------------

    /// Scan from `checked_idx` toward `read_idx` for a `\r\n` terminator.
    fn parse_line(&mut self) -> LineStatus {
        while self.checked_idx < self.read_idx {
            match self.read_buf[self.checked_idx] {
                b'\r' => {
                    if self.checked_idx + 1 == self.read_idx {
                        // Terminator may complete on the next read.
                        return LineStatus::Open;
                    }
                    if self.read_buf[self.checked_idx + 1] == b'\n' {
                        self.line_end = self.checked_idx;
                        self.checked_idx += 2;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.checked_idx > 1 && self.read_buf[self.checked_idx - 1] == b'\r' {
                        self.line_end = self.checked_idx - 1;
                        self.checked_idx += 1;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked_idx += 1,
            }
        }
        LineStatus::Open
    }

    /// Range of the line just completed by [`parse_line`], advancing
    /// `start_line` to the next one.
    fn take_line(&mut self) -> Range<usize> {
        let range = self.start_line..self.line_end;
        self.start_line = self.checked_idx;
        range
    }

    // ---- request parsing ---------------------------------------------

    fn parse_request_line(&mut self, text: &str) -> HttpCode {
        let Some(sp) = text.find([' ', '\t']) else {
            return HttpCode::BadRequest;
        };
        let method = &text[..sp];
        let rest = text[sp + 1..].trim_start_matches([' ', '\t']);

        if method.eq_ignore_ascii_case("GET") {
            self.method = Method::Get;
        } else if method.eq_ignore_ascii_case("POST") {
            self.method = Method::Post;
            self.cgi = true;
        } else {
            return HttpCode::BadRequest;
        }

        let Some(sp) = rest.find([' ', '\t']) else {
            return HttpCode::BadRequest;
        };
        let mut url = &rest[..sp];
        let version = rest[sp + 1..].trim_start_matches([' ', '\t']);
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return HttpCode::BadRequest;
        }
        self.version = version.to_string();

        for scheme in ["http://", "https://"] {
            if url.len() >= scheme.len() && url[..scheme.len()].eq_ignore_ascii_case(scheme) {
                match url[scheme.len()..].find('/') {
                    Some(i) => url = &url[scheme.len() + i..],
                    None => return HttpCode::BadRequest,
                }
            }
        }
        if !url.starts_with('/') {
            return HttpCode::BadRequest;
        }

        self.url = if url == "/" {
            "/judge.html".to_string()
        } else {
            url.to_string()
        };
        self.check_state = CheckState::Header;
        HttpCode::NoRequest
    }

    fn parse_headers(&mut self, text: &str) -> HttpCode {
        if text.is_empty() {
            if self.content_length != 0 {
                // The whole body must fit the remaining buffer space.
                if self.content_length > READ_BUFFER_SIZE - self.checked_idx {
                    return HttpCode::BadRequest;
                }
                self.check_state = CheckState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        if let Some(value) = strip_prefix_ci(text, "Connection:") {
            if value
                .trim_start_matches([' ', '\t'])
                .eq_ignore_ascii_case("keep-alive")
            {
                self.linger = true;
            }
        } else if let Some(value) = strip_prefix_ci(text, "Content-length:") {
            self.content_length = parse_content_length(value.trim_start_matches([' ', '\t']));
        } else if let Some(value) = strip_prefix_ci(text, "Host:") {
            self.host = value.trim_start_matches([' ', '\t']).to_string();
        } else {
            info!(header = %text, "unrecognized header");
        }
        HttpCode::NoRequest
    }

    /// The body is complete once the socket has delivered
    /// `content_length` bytes past the header terminator.
    fn parse_content(&mut self) -> HttpCode {
        if self.read_idx >= self.content_length + self.checked_idx {
            let range = self.checked_idx..self.checked_idx + self.content_length;
            self.body = String::from_utf8_lossy(&self.read_buf[range]).into_owned();
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }

    /// Drive the parse FSM over the buffered bytes.
    fn process_read(&mut self, sql: Option<&mut Conn>, users: &UserStore) -> HttpCode {
        if self.stream.is_none() {
            return HttpCode::ClosedConnection;
        }
        let mut line_status = LineStatus::Ok;
        loop {
            if !(self.check_state == CheckState::Content && line_status == LineStatus::Ok) {
                line_status = self.parse_line();
                if line_status != LineStatus::Ok {
                    break;
                }
            }

            if self.check_state == CheckState::Content {
                match self.parse_content() {
                    HttpCode::GetRequest => return self.do_request(sql, users),
                    _ => {
                        line_status = LineStatus::Open;
                        continue;
                    }
                }
            }

            let range = self.take_line();
            let Ok(text) = std::str::from_utf8(&self.read_buf[range]) else {
                return HttpCode::BadRequest;
            };
            let text = text.to_owned();
            debug!(line = %text, "request line");

            match self.check_state {
                CheckState::RequestLine => {
                    if self.parse_request_line(&text) == HttpCode::BadRequest {
                        return HttpCode::BadRequest;
                    }
                }
                CheckState::Header => match self.parse_headers(&text) {
                    HttpCode::BadRequest => return HttpCode::BadRequest,
                    HttpCode::GetRequest => return self.do_request(sql, users),
                    _ => {}
                },
                CheckState::Content => return HttpCode::InternalError,
            }
        }
        HttpCode::NoRequest
    }

    // ---- dispatch ----------------------------------------------------

    /// Character after the last `/` of the current URL, which selects the
    /// CGI behavior.
    fn route_flag(&self) -> Option<u8> {
        let pos = self.url.rfind('/')?;
        self.url.as_bytes().get(pos + 1).copied()
    }

    /// Resolve the parsed request: run the login/registration path when
    /// it is a CGI submit, then map the target file.
    fn do_request(&mut self, sql: Option<&mut Conn>, users: &UserStore) -> HttpCode {
        debug!(
            method = ?self.method,
            url = %self.url,
            version = %self.version,
            host = %self.host,
            "dispatching request"
        );
        let flag = self.route_flag();

        if self.cgi && matches!(flag, Some(b'2') | Some(b'3')) {
            match parse_credentials(&self.body) {
                Some((name, password)) => {
                    if flag == Some(b'3') {
                        self.url = match users.register(sql, &name, &password) {
                            RegisterOutcome::Registered => "/log.html".to_string(),
                            RegisterOutcome::Duplicate | RegisterOutcome::SqlError => {
                                "/registerError.html".to_string()
                            }
                        };
                    } else if users.verify(&name, &password) {
                        self.url = "/welcome.html".to_string();
                    } else {
                        self.url = "/logError.html".to_string();
                    }
                }
                None => {
                    self.url = if flag == Some(b'3') {
                        "/registerError.html".to_string()
                    } else {
                        "/logError.html".to_string()
                    };
                }
            }
        }

        // The CGI branch rewrites the URL, so the page shortcut table
        // keys off the rewritten one.
        let target = match self.route_flag() {
            Some(b'0') => "/register.html",
            Some(b'1') => "/log.html",
            Some(b'5') => "/picture.html",
            Some(b'6') => "/video.html",
            Some(b'7') => "/fans.html",
            _ => self.url.as_str(),
        };
        self.real_file = self.doc_root.join(&target[1..]);

        let meta = match fs::metadata(&self.real_file) {
            Ok(meta) => meta,
            Err(_) => return HttpCode::NoResource,
        };
        if meta.permissions().mode() & (libc::S_IROTH as u32) == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }

        self.file_len = meta.len() as usize;
        if self.file_len > 0 {
            let file = match fs::File::open(&self.real_file) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    return HttpCode::ForbiddenRequest;
                }
                Err(_) => return HttpCode::NoResource,
            };
            match unsafe { Mmap::map(&file) } {
                Ok(map) => self.file_map = Some(map),
                Err(_) => return HttpCode::NoResource,
            }
        }
        HttpCode::FileRequest
    }

    // ---- response assembly -------------------------------------------

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        if self.write_buf.len() >= WRITE_BUFFER_SIZE {
            return false;
        }
        let text = args.to_string();
        if text.len() >= WRITE_BUFFER_SIZE - 1 - self.write_buf.len() {
            return false;
        }
        self.write_buf.extend_from_slice(text.as_bytes());
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {status} {title}\r\n"))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        self.add_response(format_args!("Content-Length:{content_len}\r\n"))
            && self.add_response(format_args!(
                "Connection:{}\r\n",
                if self.linger { "keep-alive" } else { "close" }
            ))
            && self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{content}"))
    }

    fn add_error_page(&mut self, status: u16, title: &str, form: &str) -> bool {
        // Error responses always close after sending.
        self.linger = false;
        self.add_status_line(status, title) && self.add_headers(form.len()) && self.add_content(form)
    }

    /// Build the response for `code` into the write buffer and set up the
    /// scatter/gather state.
    fn process_write(&mut self, code: HttpCode) -> bool {
        match code {
            HttpCode::InternalError => {
                if !self.add_error_page(500, ERROR_500_TITLE, ERROR_500_FORM) {
                    return false;
                }
            }
            HttpCode::BadRequest | HttpCode::NoResource => {
                if !self.add_error_page(404, ERROR_404_TITLE, ERROR_404_FORM) {
                    return false;
                }
            }
            HttpCode::ForbiddenRequest => {
                if !self.add_error_page(403, ERROR_403_TITLE, ERROR_403_FORM) {
                    return false;
                }
            }
            HttpCode::FileRequest => {
                if !self.add_status_line(200, OK_200_TITLE) {
                    return false;
                }
                if self.file_len != 0 {
                    if !self.add_headers(self.file_len) {
                        return false;
                    }
                    self.iov_count = 2;
                    self.bytes_to_send = self.write_buf.len() + self.file_len;
                    debug!(
                        response = %String::from_utf8_lossy(&self.write_buf),
                        "response headers"
                    );
                    return true;
                }
                if !self.add_headers(EMPTY_PAGE_BODY.len()) || !self.add_content(EMPTY_PAGE_BODY) {
                    return false;
                }
            }
            _ => return false,
        }
        self.iov_count = 1;
        self.bytes_to_send = self.write_buf.len();
        debug!(
            response = %String::from_utf8_lossy(&self.write_buf),
            "response headers"
        );
        true
    }

    // ---- writing -----------------------------------------------------

    /// Drain the pending response. `WouldBlock` rearms for writable and
    /// reports success; completion rearms for readable and, on
    /// keep-alive, resets for the next request. False tells the caller to
    /// close.
    pub fn write(&mut self) -> bool {
        if self.bytes_to_send == 0 {
            self.rearm(Interest::Read);
            self.init_request();
            return true;
        }

        loop {
            let header_len = self.write_buf.len();
            let mut slices: [IoSlice<'_>; 2] = [IoSlice::new(&[]), IoSlice::new(&[])];
            let mut count = 0;
            if self.bytes_have_send < header_len {
                slices[count] = IoSlice::new(&self.write_buf[self.bytes_have_send..]);
                count += 1;
            }
            if self.iov_count == 2 {
                if let Some(map) = self.file_map.as_ref() {
                    let offset = self.bytes_have_send.saturating_sub(header_len);
                    slices[count] = IoSlice::new(&map[offset..]);
                    count += 1;
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                self.file_map = None;
                return false;
            };
            match stream.write_vectored(&slices[..count]) {
                Ok(0) => {
                    self.file_map = None;
                    return false;
                }
                Ok(n) => {
                    self.bytes_have_send += n;
                    self.bytes_to_send -= n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.rearm(Interest::Write);
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.file_map = None;
                    return false;
                }
            }

            if self.bytes_to_send == 0 {
                self.file_map = None;
                self.rearm(Interest::Read);
                if self.linger {
                    self.init_request();
                    return true;
                }
                return false;
            }
        }
    }

    // ---- top-level task ----------------------------------------------

    /// Parse whatever has been read and stage the response. Returns false
    /// when the connection must be closed by the caller.
    pub fn process(&mut self, sql: Option<&mut Conn>, users: &UserStore) -> bool {
        let read_ret = self.process_read(sql, users);
        match read_ret {
            HttpCode::NoRequest => {
                self.rearm(Interest::Read);
                true
            }
            HttpCode::ClosedConnection => false,
            _ => {
                if !self.process_write(read_ret) {
                    return false;
                }
                self.rearm(Interest::Write);
                true
            }
        }
    }

    /// Re-express one-shot interest for the next event on this fd.
    fn rearm(&self, interest: Interest) {
        if self.stream.is_none() {
            return;
        }
        if let Err(e) = self.poller.rearm(self.fd, self.token, interest, self.trigger) {
            debug!(fd = self.fd, error = %e, "rearm failed");
        }
    }
}

/// Case-insensitive prefix strip for header matching.
fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

/// Leading-digits parse of a Content-Length value; signs and garbage
/// degrade to zero rather than to a bogus body window.
fn parse_content_length(value: &str) -> usize {
    let digits = value.trim();
    if digits.starts_with('-') {
        return 0;
    }
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().unwrap_or(0)
}

/// Split a `user=<name>&passwd=<pwd>` form body. The name ends at the
/// first `&`; trailing NULs on the password are dropped.
fn parse_credentials(body: &str) -> Option<(String, String)> {
    let rest = body.strip_prefix("user=")?;
    let (name, rest) = rest.split_once('&')?;
    let password = rest.strip_prefix("passwd=")?;
    Some((
        name.to_string(),
        password.trim_end_matches('\0').to_string(),
    ))
}
