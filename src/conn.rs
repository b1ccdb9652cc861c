use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::os::unix::io::RawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::Pid;

use crate::fsmap::FileMap;
use crate::log::LogSink;

pub const SERVER_SOFTWARE: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub const INDEX_NAMES: &[&str] = &[
    "index.html",
    "index.htm",
    "index.xhtml",
    "index.xht",
    "Default.htm",
    "index.cgi",
];

pub const DEFAULT_CHARSET: &str = "UTF-8";
pub const DEFAULT_CGI_LIMIT: usize = 50;

/// A CGI child that gets SIGINT at its deadline and SIGKILL five seconds
/// after that if it ignores the hint.
#[derive(Debug)]
pub struct Watchdog {
    pub pid: Pid,
    pub deadline: libc::time_t,
    pub sigint_sent: bool,
}

/// Process-wide configuration and resources.  Built once at startup;
/// nothing here mutates afterwards except the CGI tracker, the watchdog
/// queue, the clock, and the counters.
#[derive(Debug)]
pub struct Server {
    pub hostname: Option<String>,
    pub port: u16,
    pub bindaddr: Option<String>,
    pub listen4: RawFd,
    pub listen6: RawFd,
    pub wwwroot: String,
    pub cwd: String,
    pub chdir_dir: Option<String>,
    pub cgi_pattern: Option<String>,
    pub cgi_limit: usize,
    pub cgi_tracker: Vec<libc::pid_t>,
    pub cgi_count: usize,
    pub cgi_watchdog: Vec<Watchdog>,
    pub charset: String,
    pub max_age: Option<i64>,
    pub url_pattern: Option<String>,
    pub local_pattern: Option<String>,
    pub no_empty_referers: bool,
    pub no_symlink_check: bool,
    pub vhost: bool,
    pub global_passwd: bool,
    pub list_dotfiles: bool,
    pub no_log: bool,
    pub tilde_map: Option<String>,
    pub log_sink: LogSink,
    pub timeout_secs: i64,
    pub now: libc::time_t,
    pub start_time: libc::time_t,
    pub want_daemon: bool,
    pub want_chroot: bool,
    pub pidfile_name: Option<String>,
    pub drop_uid: libc::uid_t,
    pub drop_gid: libc::gid_t,
    pub accepting: bool,
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

pub const INVALID_UID: libc::uid_t = libc::uid_t::MAX;
pub const INVALID_GID: libc::gid_t = libc::gid_t::MAX;

impl Server {
    pub fn new() -> Self {
        Self {
            hostname: None,
            port: 8080, /* or 80 if running as root */
            bindaddr: None,
            listen4: -1,
            listen6: -1,
            wwwroot: String::new(),
            cwd: String::new(),
            chdir_dir: None,
            cgi_pattern: None,
            cgi_limit: DEFAULT_CGI_LIMIT,
            cgi_tracker: vec![0; DEFAULT_CGI_LIMIT],
            cgi_count: 0,
            cgi_watchdog: Vec::new(),
            charset: DEFAULT_CHARSET.to_string(),
            max_age: None,
            url_pattern: None,
            local_pattern: None,
            no_empty_referers: false,
            no_symlink_check: false,
            vhost: false,
            global_passwd: false,
            list_dotfiles: false,
            no_log: false,
            tilde_map: None,
            log_sink: LogSink::Stdout,
            timeout_secs: 60,
            now: 0,
            start_time: 0,
            want_daemon: true,
            want_chroot: false,
            pidfile_name: None,
            drop_uid: INVALID_UID,
            drop_gid: INVALID_GID,
            accepting: true,
            num_requests: 0,
            total_in: 0,
            total_out: 0,
        }
    }

    /// Record a spawned CGI child in the first free tracker slot.
    /// Returns false when every slot is taken; the caller logs and moves on.
    pub fn cgi_track(&mut self, pid: libc::pid_t) -> bool {
        for slot in self.cgi_tracker.iter_mut() {
            if *slot == 0 {
                *slot = pid;
                self.cgi_count += 1;
                return true;
            }
        }
        false
    }

    /// Clear the tracker slot of a reaped child.
    pub fn cgi_untrack(&mut self, pid: libc::pid_t) -> bool {
        for slot in self.cgi_tracker.iter_mut() {
            if *slot == pid {
                *slot = 0;
                self.cgi_count -= 1;
                return true;
            }
        }
        false
    }

    pub fn unlisten(&mut self) {
        if self.listen4 != -1 {
            nix::unistd::close(self.listen4).ok();
            self.listen4 = -1;
        }
        if self.listen6 != -1 {
            nix::unistd::close(self.listen6).ok();
            self.listen6 = -1;
        }
    }
}

/// The pieces of a stat record the pipeline cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStat {
    pub size: i64,
    pub mtime: libc::time_t,
    pub mode: libc::mode_t,
    pub is_dir: bool,
    pub is_reg: bool,
}

impl FileStat {
    pub fn from_metadata(md: &std::fs::Metadata) -> FileStat {
        use std::os::unix::fs::MetadataExt;
        FileStat {
            size: md.len() as i64,
            mtime: md.mtime() as libc::time_t,
            mode: md.mode() as libc::mode_t,
            is_dir: md.is_dir(),
            is_reg: md.is_file(),
        }
    }

    /// Synthetic stat for content served from memory.
    pub fn builtin(len: usize, mtime: libc::time_t) -> FileStat {
        FileStat {
            size: len as i64,
            mtime,
            mode: 0o444,
            is_dir: false,
            is_reg: true,
        }
    }

    pub fn world_accessible(&self) -> bool {
        self.mode & (libc::S_IROTH | libc::S_IXOTH) != 0
    }

    pub fn world_readable(&self) -> bool {
        self.mode & libc::S_IROTH != 0
    }

    pub fn world_executable(&self) -> bool {
        self.mode & libc::S_IXOTH != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Method {
    Unknown,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Method> {
        const KNOWN: &[Method] = &[
            Method::Get,
            Method::Head,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Connect,
            Method::Options,
            Method::Trace,
        ];
        KNOWN
            .iter()
            .copied()
            .find(|m| s.eq_ignore_ascii_case(m.as_str()))
    }
}

/// Request recognizer states; see the state machine in request.rs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChState {
    FirstWord,
    FirstWs,
    SecondWord,
    SecondWs,
    ThirdWord,
    ThirdWs,
    Line,
    Lf,
    Cr,
    CrLf,
    CrLfCr,
    Bogus,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnState {
    ReceiveRequest,
    SendResponse,
    SendBody,
    Linger,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompressionType {
    None,
    Gzip,
}

/// Where the response body bytes come from.  Generated bodies (error
/// pages, listings) live in the response buffer instead.
#[derive(Debug)]
pub enum BodySource {
    None,
    Map(FileMap),
    Builtin(&'static [u8]),
    Gzip(Vec<u8>),
}

impl BodySource {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            BodySource::None => None,
            BodySource::Map(map) => Some(map.bytes()),
            BodySource::Builtin(bytes) => Some(bytes),
            BodySource::Gzip(bytes) => Some(bytes),
        }
    }
}

/// Per-connection state.  Owned string fields are cleared, not dropped,
/// between keep-alive requests so their buffers only ever grow.
pub struct Connection {
    pub socket: Option<TcpStream>,
    pub client: IpAddr,
    pub real_ip: String,
    pub last_active: libc::time_t,
    pub state: ConnState,

    // read side
    pub read_buf: Vec<u8>,
    pub checked_idx: usize,
    pub checked_state: ChState,

    // parsed request
    pub method: Method,
    pub protocol: String,
    pub encodedurl: String,
    pub decodedurl: String,
    pub origfilename: String,
    pub expnfilename: String,
    pub indexname: String,
    pub pathinfo: String,
    pub query: String,
    pub referer: String,
    pub useragent: String,
    pub accept: String,
    pub accepte: String,
    pub acceptl: String,
    pub cookie: String,
    pub contenttype: String,
    pub reqhost: String,
    pub hdrhost: String,
    pub hostdir: String,
    pub hostname: Option<String>,
    pub authorization: String,
    pub remoteuser: String,
    pub contentlength: i64,
    pub if_modified_since: Option<libc::time_t>,
    pub range_if: Option<libc::time_t>,

    // range state
    pub got_range: bool,
    pub first_byte_index: i64,
    pub last_byte_index: i64,

    // protocol state
    pub one_one: bool,
    pub mime_flag: bool,
    pub keep_alive: bool,
    pub do_keep_alive: bool,
    pub should_linger: bool,
    pub tildemapped: bool,

    // resolution state
    pub sb: FileStat,
    pub mtype: &'static str,
    pub encodings: String,
    pub compression: CompressionType,

    // response state
    pub response: Vec<u8>,
    pub response_sent: usize,
    pub file: BodySource,
    pub status: u16,
    pub bytes_to_send: i64,
    pub bytes_sent: i64,
    pub linger_deadline: libc::time_t,

    // single-entry auth cache
    pub prevauthpath: String,
    pub prevmtime: libc::time_t,
    pub prevuser: String,
    pub prevcryp: String,
}

impl Connection {
    pub fn new(socket: Option<TcpStream>, client: IpAddr, now: libc::time_t) -> Connection {
        let mut conn = Connection {
            socket,
            client,
            real_ip: String::new(),
            last_active: now,
            state: ConnState::ReceiveRequest,
            read_buf: Vec::new(),
            checked_idx: 0,
            checked_state: ChState::FirstWord,
            method: Method::Unknown,
            protocol: String::new(),
            encodedurl: String::new(),
            decodedurl: String::new(),
            origfilename: String::new(),
            expnfilename: String::new(),
            indexname: String::new(),
            pathinfo: String::new(),
            query: String::new(),
            referer: String::new(),
            useragent: String::new(),
            accept: String::new(),
            accepte: String::new(),
            acceptl: String::new(),
            cookie: String::new(),
            contenttype: String::new(),
            reqhost: String::new(),
            hdrhost: String::new(),
            hostdir: String::new(),
            hostname: None,
            authorization: String::new(),
            remoteuser: String::new(),
            contentlength: 0,
            if_modified_since: None,
            range_if: None,
            got_range: false,
            first_byte_index: 0,
            last_byte_index: -1,
            one_one: false,
            mime_flag: true,
            keep_alive: false,
            do_keep_alive: false,
            should_linger: false,
            tildemapped: false,
            sb: FileStat::default(),
            mtype: "",
            encodings: String::new(),
            compression: CompressionType::None,
            response: Vec::new(),
            response_sent: 0,
            file: BodySource::None,
            status: 0,
            bytes_to_send: 0,
            bytes_sent: 0,
            linger_deadline: 0,
            prevauthpath: String::new(),
            prevmtime: 0,
            prevuser: String::new(),
            prevcryp: String::new(),
        };
        conn.real_ip = client.to_string();
        conn
    }

    /// Reset the content-layer fields for the next request on a kept-alive
    /// connection.  Consumed request bytes are dropped; any pipelined tail
    /// stays.  The auth cache and the buffers themselves survive.
    pub fn reset_content(&mut self) {
        let consumed = self.checked_idx.min(self.read_buf.len());
        self.read_buf.drain(..consumed);
        self.checked_idx = 0;
        self.checked_state = ChState::FirstWord;
        self.method = Method::Unknown;
        self.protocol.clear();
        self.encodedurl.clear();
        self.decodedurl.clear();
        self.origfilename.clear();
        self.expnfilename.clear();
        self.indexname.clear();
        self.pathinfo.clear();
        self.query.clear();
        self.referer.clear();
        self.useragent.clear();
        self.accept.clear();
        self.accepte.clear();
        self.acceptl.clear();
        self.cookie.clear();
        self.contenttype.clear();
        self.reqhost.clear();
        self.hdrhost.clear();
        self.hostdir.clear();
        self.hostname = None;
        self.authorization.clear();
        self.remoteuser.clear();
        self.contentlength = 0;
        self.if_modified_since = None;
        self.range_if = None;
        self.got_range = false;
        self.first_byte_index = 0;
        self.last_byte_index = -1;
        self.one_one = false;
        self.mime_flag = true;
        self.keep_alive = false;
        self.do_keep_alive = false;
        self.should_linger = false;
        self.tildemapped = false;
        self.sb = FileStat::default();
        self.mtype = "";
        self.encodings.clear();
        self.compression = CompressionType::None;
        self.response.clear();
        self.response_sent = 0;
        self.file = BodySource::None;
        self.status = 0;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.linger_deadline = 0;
        self.real_ip = self.client.to_string();
        self.state = ConnState::ReceiveRequest;
    }

    pub fn fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    /// Client address as an IPv4 address, when it is one.
    pub fn client_v4(&self) -> Option<Ipv4Addr> {
        match self.client {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => ip.to_ipv4(),
        }
    }
}

/// Set or clear non-blocking mode on a descriptor.  Sub-processes clear it
/// so their writes run to completion.
pub fn set_ndelay(fd: RawFd, on: bool) {
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let mut flags = OFlag::from_bits_truncate(flags);
        flags.set(OFlag::O_NONBLOCK, on);
        fcntl(fd, FcntlArg::F_SETFL(flags)).ok();
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cgi_tracker_bounded() {
        let mut server = Server::new();
        server.cgi_limit = 3;
        server.cgi_tracker = vec![0; 3];
        assert!(server.cgi_track(11));
        assert!(server.cgi_track(22));
        assert!(server.cgi_track(33));
        assert!(!server.cgi_track(44), "tracker must refuse past cgi_limit");
        assert_eq!(server.cgi_count, 3);
        assert!(server.cgi_tracker.iter().filter(|&&p| p != 0).count() <= 3);

        assert!(server.cgi_untrack(22));
        assert_eq!(server.cgi_count, 2);
        assert!(!server.cgi_untrack(22));
        assert!(server.cgi_track(44));
    }

    #[test]
    fn reset_content_keeps_pipelined_tail() {
        let client = "127.0.0.1".parse().unwrap();
        let mut conn = Connection::new(None, client, 0);
        conn.read_buf = b"GET / HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n".to_vec();
        conn.checked_idx = 18;
        conn.origfilename = "index.html".to_string();
        let cap = conn.origfilename.capacity();
        conn.reset_content();
        assert_eq!(conn.read_buf, b"GET /next HTTP/1.1\r\n\r\n");
        assert_eq!(conn.checked_idx, 0);
        assert!(conn.origfilename.is_empty());
        assert_eq!(conn.origfilename.capacity(), cap, "buffers are retained");
    }

    #[test]
    fn method_parse_works() {
        assert_eq!(Method::parse("get"), Some(Method::Get));
        assert_eq!(Method::parse("OPTIONS"), Some(Method::Options));
        assert_eq!(Method::parse("BREW"), None);
    }
}
