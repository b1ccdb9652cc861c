use std::fs::{remove_file, File, OpenOptions};
use std::io::{Read, Write};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::socket;
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{
    chdir, chroot, close, dup2, fork, getpid, getuid, pipe, read, setgid, setgroups, setsid,
    setuid, ForkResult, Gid, Pid, Uid, User,
};

mod auth;
mod cgi;
mod conn;
mod dirlist;
mod expand;
mod fsmap;
mod log;
mod mime;
mod pattern;
mod request;
mod resolve;
mod response;
mod url;

use conn::{
    set_ndelay, ConnState, Connection, Method, Server, INVALID_GID, INVALID_UID, SERVER_SOFTWARE,
};
use log::{LogEncoded, LogSink};
use request::GotRequest;
use response::{send_err, status_title, ERR400FORM};

// To prevent a malformed request from eating up too much memory, die once
// the request exceeds this many bytes.
const MAX_REQUEST_LENGTH: usize = 16384;

// Bounded post-close drain for rejected POSTs and keep-alive handoff.
const LINGER_SECS: libc::time_t = 2;

const LISTEN_BACKLOG: usize = 1024;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

extern "C" fn child_exited(_signal: libc::c_int) {
    // Nothing to do here; the signal interrupts select() so the main loop
    // gets to reap.
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Prints message to standard error and exits with code 1.
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_PKG_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} [flags] [WEBROOT] [HOSTNAME]\n\n\
        flags:\t-c pattern\n\
        \t\tWildcard pattern for CGI programs, e.g. \"**.cgi|cgi-bin/*\".\n\
        \t-d dir\n\
        \t\tDirectory to change to after chrooting.\n\
        \t-g\n\
        \t\tConsult a global .htpasswd/.htaccess at the top of the tree first.\n\
        \t-h\n\
        \t\tShow this help and exit.\n\
        \t-i pidfile\n\
        \t\tWrite the process id to the given file.\n\
        \t-l level\n\
        \t\tLog level: none, error, notice, info or debug.\n\
        \t-n\n\
        \t\tStay in the foreground, do not daemonize.\n\
        \t-p port\n\
        \t\tPort to listen on, default 8080 (80 when started as root).\n\
        \t-r\n\
        \t\tChroot into the web root for added security.\n\
        \t-s\n\
        \t\tAlways expand symlinks, even when chrooted.\n\
        \t-t file\n\
        \t\tThrottle file (accepted but not supported by this build).\n\
        \t-u user\n\
        \t\tDrop privileges to this user after initialization.\n\
        \t-v\n\
        \t\tEnable name-based virtual hosting.\n\
        \t-V\n\
        \t\tShow version and exit.\n\
        \t-T charset\n\
        \t\tCharset announced with text responses, default {}.\n\
        \t-M seconds\n\
        \t\tSend Cache-Control: max-age with every response.\n",
        argv0,
        conn::DEFAULT_CHARSET,
    );
}

/// Strip the leading slashes CGI patterns tend to be written with.
fn normalize_cgi_pattern(pattern: &str) -> String {
    let mut pattern = pattern.strip_prefix('/').unwrap_or(pattern).to_string();
    while let Some(pos) = pattern.find("|/") {
        pattern.remove(pos + 1);
    }
    pattern
}

fn parse_commandline(server: &mut Server) -> Result<log::Level> {
    let mut args = std::env::args();
    let name = args
        .next()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    let mut level = log::Level::Info;
    let mut positional: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" => {
                let pattern = args.next().context("missing pattern after -c")?;
                server.cgi_pattern = Some(normalize_cgi_pattern(&pattern));
            }
            "-d" => {
                server.chdir_dir = Some(args.next().context("missing dir after -d")?);
            }
            "-g" => server.global_passwd = true,
            "-h" => {
                usage(&name);
                std::process::exit(0);
            }
            "-i" => {
                server.pidfile_name = Some(args.next().context("missing filename after -i")?);
            }
            "-l" => {
                let value = args.next().context("missing level after -l")?;
                if value == "none" {
                    server.no_log = true;
                } else {
                    level = log::Level::parse(&value)
                        .with_context(|| format!("unknown log level `{}'", value))?;
                }
            }
            "-n" => server.want_daemon = false,
            "-p" => {
                let number = args.next().context("missing number after -p")?;
                server.port = number
                    .parse()
                    .with_context(|| format!("port number {} is invalid", number))?;
            }
            "-r" => {
                server.want_chroot = true;
                // A chrooted tree cannot be escaped, so the per-component
                // walk is skipped unless -s asks for it.
                server.no_symlink_check = true;
            }
            "-s" => server.no_symlink_check = false,
            "-t" => {
                let _throttle_file = args.next().context("missing filename after -t")?;
                eprintln!(
                    "{}: throttling is not supported by this build, ignoring -t",
                    env!("CARGO_PKG_NAME")
                );
            }
            "-u" => {
                let user = args.next().context("missing user after -u")?;
                let entry1 = User::from_name(&user).context("getpwnam failed")?;
                let entry2 = user
                    .parse()
                    .ok()
                    .and_then(|uid| User::from_uid(Uid::from_raw(uid)).transpose())
                    .transpose()
                    .context("getpwuid failed")?;
                let entry = entry1
                    .or(entry2)
                    .with_context(|| format!("no such user: `{}'", user))?;
                server.drop_uid = entry.uid.as_raw();
                server.drop_gid = entry.gid.as_raw();
            }
            "-v" => server.vhost = true,
            "-V" => {
                println!("{}", SERVER_SOFTWARE);
                std::process::exit(0);
            }
            "-T" => {
                server.charset = args.next().context("missing charset after -T")?;
            }
            "-M" => {
                let number = args.next().context("missing number after -M")?;
                server.max_age = Some(
                    number
                        .parse()
                        .with_context(|| format!("max-age {} is invalid", number))?,
                );
            }
            _ if !arg.starts_with('-') => positional.push(arg),
            _ => return Err(anyhow!("unknown option `{}'", arg)),
        }
    }

    let mut positional = positional.into_iter();
    if let Some(webroot) = positional.next() {
        server.wwwroot = webroot;
        // Strip ending slash.
        if server.wwwroot.ends_with('/') {
            server.wwwroot.pop();
        }
    } else {
        server.wwwroot = ".".to_string();
    }
    if let Some(hostname) = positional.next() {
        server.hostname = Some(hostname);
    }

    Ok(level)
}

const PIDFILE_MODE: u32 = 0o600;

#[derive(Debug)]
struct PidFile {
    name: String,
    file: File,
}

impl PidFile {
    fn create(pidfile_name: String) -> Result<Self> {
        // Create the pidfile, failing if it already exists.
        let mut pidfile_file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_CREAT | libc::O_EXCL)
            .mode(PIDFILE_MODE)
            .open(&pidfile_name)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    match Self::read(&pidfile_name) {
                        Ok(pid) => anyhow!("daemon already running with pid {}", pid),
                        Err(e) => e,
                    }
                } else {
                    anyhow::Error::new(e)
                        .context(format!("failed to create pidfile {}", pidfile_name))
                }
            })?;

        // Write pid to the pidfile.
        if let Err(e) = write!(pidfile_file, "{}", getpid()) {
            Self::remove_raw(&pidfile_name, pidfile_file).ok();
            return Err(e).with_context(|| format!("failed to write to pidfile {}", pidfile_name));
        };

        Ok(Self {
            name: pidfile_name,
            file: pidfile_file,
        })
    }

    fn read(pidfile_name: &str) -> Result<Pid> {
        let mut pidfile = File::open(pidfile_name)
            .with_context(|| format!("failed to open pidfile {}", pidfile_name))?;
        let mut buf = String::new();
        pidfile
            .read_to_string(&mut buf)
            .with_context(|| format!("failed to read pidfile {}", pidfile_name))?;
        Ok(Pid::from_raw(
            buf.parse().context("invalid pidfile contents")?,
        ))
    }

    fn remove(self) -> Result<()> {
        Self::remove_raw(&self.name, self.file)
    }

    fn remove_raw(pidfile_name: &str, pidfile_file: File) -> Result<()> {
        remove_file(pidfile_name)
            .with_context(|| format!("failed to remove pidfile {}", pidfile_name))?;
        drop(pidfile_file);
        Ok(())
    }
}

const PATH_DEVNULL: &str = "/dev/null";

fn daemonize_start(
    lifeline_read: &mut libc::c_int,
    lifeline_write: &mut libc::c_int,
    fd_null: &mut libc::c_int,
) -> Result<()> {
    // create lifeline pipe
    let pipe_fds = pipe().context("failed to create pipe")?;
    *lifeline_read = pipe_fds.0;
    *lifeline_write = pipe_fds.1;

    // populate fd_null
    *fd_null = {
        use std::os::unix::io::IntoRawFd;
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(PATH_DEVNULL)
            .with_context(|| format!("failed to open {}", PATH_DEVNULL))?
            .into_raw_fd()
    };

    if let ForkResult::Parent { child } = unsafe { fork() }.context("failed to fork process")? {
        // wait for the child
        if let Err(e) = close(*lifeline_write) {
            eprintln!("warning: failed to close lifeline in parent: {}", e);
        }
        let mut buf = [0; 1];
        if let Err(e) = read(*lifeline_read, &mut buf) {
            eprintln!("warning: failed read lifeline in parent: {}", e);
        }
        // exit with status depending on child status
        match waitpid(child, Some(WaitPidFlag::WNOHANG))
            .with_context(|| format!("failed to wait for process {}", child))?
        {
            WaitStatus::StillAlive => std::process::exit(0),
            WaitStatus::Exited(_, status) => std::process::exit(status),
            _ => return Err(anyhow!("waitpid returned unknown status")),
        }
    }
    Ok(())
}

fn daemonize_finish(
    lifeline_read: &mut libc::c_int,
    lifeline_write: &mut libc::c_int,
    fd_null: &mut libc::c_int,
) -> Result<()> {
    setsid().context("failed to create session")?;
    if let Err(e) = close(*lifeline_read) {
        eprintln!(
            "warning: failed to close read end of lifeline in child: {}",
            e
        );
    }
    if let Err(e) = close(*lifeline_write) {
        eprintln!("warning: failed to cut the lifeline: {}", e);
    }

    // close all our std fds
    if let Err(e) = dup2(*fd_null, libc::STDIN_FILENO) {
        eprintln!("warning: failed to close stdin: {}", e);
    }
    if let Err(e) = dup2(*fd_null, libc::STDOUT_FILENO) {
        eprintln!("warning: failed to close stdout: {}", e);
    }
    if let Err(e) = dup2(*fd_null, libc::STDERR_FILENO) {
        eprintln!("warning: failed to close stderr: {}", e);
    }
    if *fd_null > 2 {
        close(*fd_null).ok();
    }
    Ok(())
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> std::io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

fn listen_socket_addr(server: &Server, inet6: bool) -> Result<SocketAddr> {
    let addr = match &server.bindaddr {
        Some(bindaddr) => {
            let ip = IpAddr::from_str(bindaddr).context("malformed bind address")?;
            match (ip, inet6) {
                (IpAddr::V6(ip), true) => SocketAddr::V6(SocketAddrV6::new(ip, server.port, 0, 0)),
                (IpAddr::V4(ip), false) => SocketAddr::V4(SocketAddrV4::new(ip, server.port)),
                _ => return Err(anyhow!("bind address family not requested")),
            }
        }
        None => {
            if inet6 {
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, server.port, 0, 0))
            } else {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, server.port))
            }
        }
    };
    Ok(addr)
}

fn create_listen_socket(server: &Server, inet6: bool) -> Result<RawFd> {
    let domain = if inet6 {
        socket::AddressFamily::Inet6
    } else {
        socket::AddressFamily::Inet
    };

    let fd = socket::socket(
        domain,
        socket::SockType::Stream,
        socket::SockFlag::empty(),
        socket::SockProtocol::Tcp,
    )
    .context("failed to create listening socket")?;

    socket::setsockopt(fd, socket::sockopt::ReuseAddr, &true)
        .context("failed to set SO_REUSEADDR")?;
    if inet6 {
        // Keep the v6 socket v6-only so the separate v4 bind succeeds.
        // nix 0.20 has no sockopt::Ipv6V6Only wrapper, so set IPV6_V6ONLY via libc directly.
        let on: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &on as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    let addr = listen_socket_addr(server, inet6)?;
    if let Err(e) = socket::bind(fd, &socket::SockAddr::Inet(socket::InetAddr::from_std(&addr))) {
        close(fd).ok();
        return Err(anyhow!("failed to bind {}: {}", addr, e));
    }

    set_ndelay(fd, true);

    if let Err(e) = socket::listen(fd, LISTEN_BACKLOG) {
        close(fd).ok();
        return Err(anyhow!("failed to listen on {}: {}", addr, e));
    }

    Ok(fd)
}

/// Bind both families; v6 first because Linux refuses the v4 bind when a
/// dual-stack v6 socket got there first.
fn init_listen_sockets(server: &mut Server) {
    match create_listen_socket(server, true) {
        Ok(fd) => server.listen6 = fd,
        Err(e) => log::notice(&format!("not listening on IPv6: {:#}", e)),
    }
    match create_listen_socket(server, false) {
        Ok(fd) => server.listen4 = fd,
        Err(e) => log::notice(&format!("not listening on IPv4: {:#}", e)),
    }
    if server.listen4 == -1 && server.listen6 == -1 {
        abort!("failed to bind any listening socket on port {}", server.port);
    }
}

fn main() -> Result<()> {
    let mut server = Server::new();

    if getuid().is_root() {
        server.port = 80;
    }

    let level = parse_commandline(&mut server)?;
    log::init(server.want_daemon, level);

    init_listen_sockets(&mut server);

    let mut lifeline_read = -1;
    let mut lifeline_write = -1;
    let mut fd_null = -1;
    if server.want_daemon {
        daemonize_start(&mut lifeline_read, &mut lifeline_write, &mut fd_null)
            .context("failed to daemonize")?;
        server.log_sink = LogSink::Syslog;
    }

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;
    // A child exit interrupts select() so CGI children get reaped promptly.
    unsafe { signal(Signal::SIGCHLD, SigHandler::Handler(child_exited)) }
        .context("failed to set SIGCHLD handler")?;

    chdir(server.wwwroot.as_str())
        .with_context(|| format!("failed to change working directory to {}", server.wwwroot))?;

    if server.want_chroot {
        // Force reading the local timezone before chroot makes this
        // impossible.
        Local::now();

        chroot(".").context("failed to change root directory")?;
        log::notice(&format!("chrooted to `{}'", server.wwwroot));
    }

    if let Some(dir) = server.chdir_dir.clone() {
        chdir(dir.as_str())
            .with_context(|| format!("failed to change data directory to {}", dir))?;
    }

    // The resolver compares absolute expansions against this.
    let cwd = std::env::current_dir().context("failed to get working directory")?;
    server.cwd = cwd.to_string_lossy().into_owned();
    if !server.cwd.ends_with('/') {
        server.cwd.push('/');
    }

    if server.drop_gid != INVALID_GID {
        let gid = Gid::from_raw(server.drop_gid);
        setgroups(&[gid])
            .with_context(|| format!("failed to set supplementary group IDs to [{}]", gid))?;
        setgid(gid).with_context(|| format!("failed to set group ID to {}", gid))?;
    }

    if server.drop_uid != INVALID_UID {
        let uid = Uid::from_raw(server.drop_uid);
        setuid(uid).with_context(|| format!("failed to set user ID to {}", uid))?;
    }

    let pidfile = server
        .pidfile_name
        .take()
        .map(PidFile::create)
        .transpose()?;

    if server.want_daemon {
        daemonize_finish(&mut lifeline_read, &mut lifeline_write, &mut fd_null)
            .context("failed to daemonize")?;
    }

    server.now = log::unix_now();
    server.start_time = server.now;
    log::notice(&format!(
        "{} starting on port {}, vhost: {}",
        SERVER_SOFTWARE, server.port, server.vhost
    ));

    let mut connections: Vec<Connection> = Vec::new();

    // main loop
    while is_running() {
        httpd_poll(&mut server, &mut connections);
    }

    // clean exit
    server.unlisten();

    pidfile.map(|pidfile| pidfile.remove()).transpose()?;

    for mut conn in connections.drain(..) {
        free_connection(&mut server, &mut conn);
    }

    if let Ok(rusage) = getrusage() {
        log::notice(&format!(
            "exiting; CPU time used: {}.{:02} user, {}.{:02} system; {} requests, {} in, {} out",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
            server.num_requests,
            server.total_in,
            server.total_out,
        ));
    }
    Ok(())
}

/// Add a connection's details to the access log.
fn log_connection(server: &mut Server, conn: &Connection) {
    if server.no_log || conn.status == 0 {
        return;
    }
    let user = if conn.remoteuser.is_empty() {
        "-"
    } else {
        &conn.remoteuser
    };
    // When vhosting, the hostname becomes part of the logged URL.
    let url = if server.vhost && !conn.tildemapped {
        format!(
            "/{}{}",
            response::get_hostname(server, conn),
            conn.encodedurl
        )
    } else {
        conn.encodedurl.clone()
    };
    let protocol = if conn.protocol.is_empty() {
        "UNKNOWN"
    } else {
        &conn.protocol
    };
    let line = format!(
        "{} - {} \"{} {} {}\" {} {} \"{}\" \"{}\"",
        conn.real_ip,
        user,
        conn.method.as_str(),
        LogEncoded(&url),
        protocol,
        conn.status,
        conn.bytes_sent,
        LogEncoded(&conn.referer),
        LogEncoded(&conn.useragent),
    );
    server.log_sink.log(server.now, &line);
}

/// Log, then let the connection drop.
fn free_connection(server: &mut Server, conn: &mut Connection) {
    log_connection(server, conn);
    server.accepting = true; // try to resume accepting if we ran out of fds
}

/// Recycle a finished connection for keep-alive.
fn recycle_connection(server: &mut Server, conn: &mut Connection) {
    log_connection(server, conn);
    conn.reset_content();
    conn.last_active = server.now;
}

/// Process a complete request: parse, resolve, queue the response.
fn process_request(server: &mut Server, conn: &mut Connection) {
    server.num_requests += 1;

    if request::parse_request(server, conn).is_ok() {
        let _ = resolve::start_request(server, conn);
    }

    conn.state = ConnState::SendResponse;
}

/// Run the recognizer over whatever is buffered and move on when a full
/// request (or garbage) has arrived.
fn advance_request(server: &mut Server, conn: &mut Connection) {
    if conn.read_buf.len() > MAX_REQUEST_LENGTH {
        conn.do_keep_alive = false;
        send_err(
            server,
            conn,
            413,
            status_title(413),
            "",
            "Your request was dropped because it was too long.\n",
            "",
        );
        conn.state = ConnState::SendResponse;
        return;
    }
    match request::got_request(conn) {
        GotRequest::Got => process_request(server, conn),
        GotRequest::Bad => {
            conn.do_keep_alive = false;
            send_err(server, conn, 400, status_title(400), "", ERR400FORM, "");
            conn.state = ConnState::SendResponse;
        }
        GotRequest::No => {}
    }
}

/// Receiving request.
fn poll_recv_request(server: &mut Server, conn: &mut Connection) {
    debug_assert_eq!(conn.state, ConnState::ReceiveRequest);
    let mut buf = [0; 1 << 13];
    let recvd = match socket::recv(conn.fd(), &mut buf, socket::MsgFlags::empty()) {
        Ok(recvd) if recvd > 0 => recvd,
        Err(nix::Error::Sys(Errno::EAGAIN)) => {
            // would block
            return;
        }
        _ => {
            // closure or other error
            conn.do_keep_alive = false;
            conn.should_linger = false;
            conn.state = ConnState::Done;
            return;
        }
    };
    conn.last_active = server.now;
    conn.read_buf.extend_from_slice(&buf[..recvd]);
    server.total_in += recvd as u64;

    advance_request(server, conn);

    // If we've moved on, try to send right away instead of going through
    // another iteration of the select() loop.
    if conn.state == ConnState::SendResponse {
        poll_send_response(server, conn);
    }
}

/// Sending the buffered response (status line, headers, any generated
/// body).
fn poll_send_response(server: &mut Server, conn: &mut Connection) {
    debug_assert_eq!(conn.state, ConnState::SendResponse);

    if conn.response_sent < conn.response.len() {
        let sent = match socket::send(
            conn.fd(),
            &conn.response[conn.response_sent..],
            socket::MsgFlags::empty(),
        ) {
            Ok(sent) if sent > 0 => sent,
            Err(nix::Error::Sys(Errno::EAGAIN)) => {
                // would block
                return;
            }
            _ => {
                // closure or other error
                conn.do_keep_alive = false;
                conn.should_linger = false;
                conn.state = ConnState::Done;
                return;
            }
        };
        conn.response_sent += sent;
        conn.last_active = server.now;
        server.total_out += sent as u64;
    }

    if conn.response_sent >= conn.response.len() {
        if conn.file.bytes().is_some() && conn.method != Method::Head {
            conn.state = ConnState::SendBody;
            // go straight on to the body
            poll_send_body(server, conn);
        } else {
            conn.state = ConnState::Done;
        }
    }
}

/// Sending the file body from the map (or deflated buffer), honoring the
/// range window.
fn poll_send_body(server: &mut Server, conn: &mut Connection) {
    debug_assert_eq!(conn.state, ConnState::SendBody);

    let bytes = match conn.file.bytes() {
        Some(bytes) => bytes,
        None => {
            conn.state = ConnState::Done;
            return;
        }
    };

    let window_start = conn.first_byte_index.max(0) as usize;
    let window_len = conn.bytes_to_send.max(0) as usize;
    let window_end = window_start.saturating_add(window_len).min(bytes.len());
    let offset = window_start.saturating_add(conn.bytes_sent.max(0) as usize);

    if offset >= window_end {
        conn.state = ConnState::Done;
        return;
    }

    let sent = match socket::send(
        conn.fd(),
        &bytes[offset..window_end],
        socket::MsgFlags::empty(),
    ) {
        Ok(sent) if sent > 0 => sent,
        Err(nix::Error::Sys(Errno::EAGAIN)) => {
            // would block
            return;
        }
        _ => {
            // closure or other error
            conn.do_keep_alive = false;
            conn.should_linger = false;
            conn.state = ConnState::Done;
            return;
        }
    };
    conn.bytes_sent += sent as i64;
    conn.last_active = server.now;
    server.total_out += sent as u64;

    if conn.bytes_sent >= conn.bytes_to_send {
        conn.state = ConnState::Done;
    }
}

/// Closing with a lingering drain: shut down the write side and discard
/// whatever the client still sends, briefly.
fn begin_linger(server: &Server, conn: &mut Connection) {
    socket::shutdown(conn.fd(), socket::Shutdown::Write).ok();
    conn.should_linger = false;
    conn.linger_deadline = server.now + LINGER_SECS;
    conn.state = ConnState::Linger;
}

fn poll_linger(conn: &mut Connection) {
    let mut buf = [0; 1 << 10];
    match socket::recv(conn.fd(), &mut buf, socket::MsgFlags::empty()) {
        Ok(recvd) if recvd > 0 => {} // discard
        Err(nix::Error::Sys(Errno::EAGAIN)) => {}
        _ => {
            // drained or error: really close now
            conn.do_keep_alive = false;
            conn.state = ConnState::Done;
        }
    }
}

/// Idle connections and expired lingers get closed off.
fn poll_check_timeout(server: &Server, conn: &mut Connection) {
    match conn.state {
        ConnState::Linger => {
            if server.now >= conn.linger_deadline {
                conn.do_keep_alive = false;
                conn.state = ConnState::Done;
            }
        }
        _ => {
            if server.timeout_secs > 0 && server.now - conn.last_active >= server.timeout_secs {
                conn.do_keep_alive = false;
                conn.should_linger = false;
                conn.state = ConnState::Done;
            }
        }
    }
}

/// Accept a connection and add it to the connection list.
fn accept_connection(server: &mut Server, connections: &mut Vec<Connection>, listen_fd: RawFd) {
    let fd = match socket::accept(listen_fd) {
        Ok(fd) => fd,
        Err(e) => {
            // Failed to accept, but keep serving existing connections.
            if e.as_errno() == Some(Errno::EMFILE) || e.as_errno() == Some(Errno::ENFILE) {
                server.accepting = false;
            }
            if e.as_errno() != Some(Errno::EAGAIN) {
                log::error(&format!("accept: {}", e));
            }
            return;
        }
    };

    let addr = match socket::getpeername(fd) {
        Ok(socket::SockAddr::Inet(addr)) => addr,
        Ok(_) => {
            log::error("unknown sockaddr family on accepted socket");
            close(fd).ok();
            return;
        }
        Err(e) => {
            log::error(&format!("getpeername: {}", e));
            close(fd).ok();
            return;
        }
    };

    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    if let Err(e) = stream.set_nonblocking(true) {
        log::error(&format!("failed to set O_NONBLOCK: {}", e));
        return;
    }

    // Strip the v6 mapping from v4 clients.
    let mut client = addr.ip().to_std();
    if let IpAddr::V6(v6) = client {
        let octets = v6.octets();
        let mapped = octets[..10].iter().all(|&b| b == 0)
            && octets[10] == 0xff
            && octets[11] == 0xff;
        if mapped {
            if let Some(v4) = v6.to_ipv4() {
                client = IpAddr::V4(v4);
            }
        }
    }

    let conn = Connection::new(Some(stream), client, server.now);
    connections.push(conn);
    let index = connections.len() - 1;

    // Try to read straight away rather than going through another
    // iteration of the select() loop.
    poll_recv_request(server, &mut connections[index]);
}

/// Reap finished CGI children and clear their tracker slots.
fn reap_cgi(server: &mut Server) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => match status.pid() {
                Some(pid) => {
                    server.cgi_untrack(pid.as_raw());
                    server.cgi_watchdog.retain(|w| w.pid != pid);
                }
                None => break,
            },
        }
    }
}

/// Two-stage kill for CGI children that overstay their welcome.
fn run_watchdogs(server: &mut Server) {
    let now = server.now;
    let mut index = 0;
    while index < server.cgi_watchdog.len() {
        if now < server.cgi_watchdog[index].deadline {
            index += 1;
            continue;
        }
        let watchdog = &mut server.cgi_watchdog[index];
        if !watchdog.sigint_sent {
            if kill(watchdog.pid, Signal::SIGINT).is_ok() {
                log::error(&format!("killed CGI process {}", watchdog.pid));
            }
            watchdog.sigint_sent = true;
            watchdog.deadline = now + cgi::CGI_KILL_GRACE;
            index += 1;
        } else {
            if kill(watchdog.pid, Signal::SIGKILL).is_ok() {
                log::error(&format!("hard-killed CGI process {}", watchdog.pid));
            }
            server.cgi_watchdog.remove(index);
        }
    }
}

/// Main loop: a select() and then delegation to accept connections, handle
/// receiving of requests, and sending of replies.
fn httpd_poll(server: &mut Server, connections: &mut Vec<Connection>) {
    let mut recv_set = FdSet::new();
    let mut send_set = FdSet::new();
    let mut timeout_required = !server.cgi_watchdog.is_empty();

    if server.accepting {
        if server.listen4 != -1 {
            recv_set.insert(server.listen4);
        }
        if server.listen6 != -1 {
            recv_set.insert(server.listen6);
        }
    }

    for conn in connections.iter() {
        match conn.state {
            ConnState::Done => {}
            ConnState::ReceiveRequest | ConnState::Linger => {
                recv_set.insert(conn.fd());
                timeout_required = true;
            }
            ConnState::SendResponse | ConnState::SendBody => {
                send_set.insert(conn.fd());
                timeout_required = true;
            }
        }
    }

    let timeout_secs = if server.cgi_watchdog.is_empty() {
        server.timeout_secs
    } else {
        1
    };
    let mut timeout = Some(TimeVal::from(libc::timeval {
        tv_sec: timeout_secs as libc::time_t,
        tv_usec: 0,
    }))
    .filter(|_| timeout_required);

    match select(
        None,
        Some(&mut recv_set),
        Some(&mut send_set),
        None,
        timeout.as_mut(),
    ) {
        Ok(_) => {}
        Err(e) => {
            if e.as_errno() == Some(Errno::EINTR) {
                // interrupted, e.g. by SIGCHLD or SIGTERM
                server.now = log::unix_now();
                reap_cgi(server);
                return;
            }
            abort!("select() failed: {}", e);
        }
    }

    // update time
    server.now = log::unix_now();

    reap_cgi(server);
    run_watchdogs(server);

    let listen4 = server.listen4;
    let listen6 = server.listen6;
    if listen4 != -1 && recv_set.contains(listen4) {
        accept_connection(server, connections, listen4);
    }
    if listen6 != -1 && recv_set.contains(listen6) {
        accept_connection(server, connections, listen6);
    }

    let mut index = 0;
    while index < connections.len() {
        let conn = &mut connections[index];

        poll_check_timeout(server, conn);

        match conn.state {
            ConnState::ReceiveRequest => {
                if recv_set.contains(conn.fd()) {
                    poll_recv_request(server, conn);
                }
            }
            ConnState::SendResponse => {
                if send_set.contains(conn.fd()) {
                    poll_send_response(server, conn);
                }
            }
            ConnState::SendBody => {
                if send_set.contains(conn.fd()) {
                    poll_send_body(server, conn);
                }
            }
            ConnState::Linger => {
                if recv_set.contains(conn.fd()) {
                    poll_linger(conn);
                }
            }
            ConnState::Done => {}
        };

        if conn.state == ConnState::Done {
            if conn.do_keep_alive {
                recycle_connection(server, conn);
                // A pipelined request may already be buffered.
                advance_request(server, conn);
                if conn.state == ConnState::SendResponse {
                    poll_send_response(server, conn);
                }
                index += 1;
            } else if conn.should_linger && conn.socket.is_some() {
                log_connection(server, conn);
                conn.status = 0; // logged; don't log again on free
                begin_linger(server, conn);
                index += 1;
            } else {
                free_connection(server, conn);
                connections.remove(index);
            }
        } else {
            index += 1;
        }
    }
}
