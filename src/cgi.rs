use std::cmp::min;
use std::env;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::process::exit;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::socket::{shutdown, Shutdown};
use nix::unistd::{chdir, close, dup, dup2, execve, fork, pipe, read, write, ForkResult};

use crate::conn::{set_ndelay, Connection, Method, Server, Watchdog, SERVER_SOFTWARE};
use crate::log;
use crate::response::{send_err, status_title, ERR500FORM, ERR501FORM};
use crate::url::strdecode;

// Seconds a CGI program may run before the watchdog SIGINTs it; the
// SIGKILL follows five seconds later.
pub const CGI_TIMELIMIT: libc::time_t = 30;
pub const CGI_KILL_GRACE: libc::time_t = 5;

const CGI_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Service a CGI request: fork, wire the child up, track it, schedule the
/// watchdog.  The connection is finished as far as the parent goes.
pub fn cgi(server: &mut Server, conn: &mut Connection) -> Result<(), ()> {
    // Not going to keep the socket open after a CGI, too difficult.
    conn.do_keep_alive = false;

    match conn.method {
        Method::Get | Method::Post | Method::Put | Method::Delete => {}
        method => {
            let arg = method.as_str();
            send_err(server, conn, 501, status_title(501), "", ERR501FORM, arg);
            return Err(());
        }
    }

    if server.cgi_limit != 0 && server.cgi_count >= server.cgi_limit {
        let url = conn.encodedurl.clone();
        send_err(
            server,
            conn,
            503,
            status_title(503),
            "",
            crate::response::ERR503FORM,
            &url,
        );
        return Err(());
    }

    set_ndelay(conn.fd(), false);

    match unsafe { fork() } {
        Err(e) => {
            log::error(&format!("fork: {}", e));
            let url = conn.encodedurl.clone();
            send_err(server, conn, 500, status_title(500), "", ERR500FORM, &url);
            Err(())
        }
        Ok(ForkResult::Child) => {
            // Sub-process from here on: the listen sockets belong to the
            // parent.
            server.unlisten();
            cgi_child(server, conn)
        }
        Ok(ForkResult::Parent { child }) => {
            log::info(&format!(
                "{}: CGI[{}] /{} \"{}\" \"{}\"",
                conn.real_ip, child, conn.expnfilename, conn.referer, conn.useragent
            ));

            if !server.cgi_track(child.as_raw()) {
                log::error(&format!("CGI tracker full, not tracking pid {}", child));
            }
            server.cgi_watchdog.push(Watchdog {
                pid: child,
                deadline: server.now + CGI_TIMELIMIT,
                sigint_sent: false,
            });

            conn.status = 200;
            conn.should_linger = false;
            Ok(())
        }
    }
}

/// Write all of `buf`, retrying interrupted writes.
fn write_fully(fd: RawFd, mut buf: &[u8]) -> Result<(), ()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(0) => return Err(()),
            Ok(n) => buf = &buf[n..],
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Err(_) => return Err(()),
        }
    }
    Ok(())
}

fn env_entry(name: &str, value: &str) -> CString {
    CString::new(format!("{}={}", name, value).replace('\0', "")).unwrap()
}

/// Set up the CGI/1.1 environment.  Careful to pass along only what the
/// request actually carried.
fn make_envp(server: &Server, conn: &Connection) -> Vec<CString> {
    let mut envp = Vec::with_capacity(24);

    envp.push(env_entry("PATH", CGI_PATH));
    envp.push(env_entry("SERVER_SOFTWARE", SERVER_SOFTWARE));
    let hostname = crate::response::get_hostname(server, conn);
    if !hostname.is_empty() {
        envp.push(env_entry("SERVER_NAME", &hostname));
    }
    envp.push(env_entry("GATEWAY_INTERFACE", "CGI/1.1"));
    envp.push(env_entry("SERVER_PROTOCOL", &conn.protocol));
    envp.push(env_entry("SERVER_PORT", &server.port.to_string()));
    envp.push(env_entry("REQUEST_METHOD", conn.method.as_str()));
    if !conn.pathinfo.is_empty() {
        envp.push(env_entry("PATH_INFO", &format!("/{}", conn.pathinfo)));
        envp.push(env_entry(
            "PATH_TRANSLATED",
            &format!("{}{}", server.cwd, conn.pathinfo),
        ));
    }
    envp.push(env_entry(
        "SCRIPT_NAME",
        &format!(
            "/{}",
            if conn.origfilename == "." {
                ""
            } else {
                &conn.origfilename
            }
        ),
    ));
    let script_filename = if conn.expnfilename.starts_with('/') {
        conn.expnfilename.clone()
    } else {
        format!("{}{}", server.cwd, conn.expnfilename)
    };
    envp.push(env_entry("SCRIPT_FILENAME", &script_filename));
    if !conn.query.is_empty() {
        envp.push(env_entry("QUERY_STRING", &conn.query));
    }
    envp.push(env_entry("REMOTE_ADDR", &conn.real_ip));
    if !conn.referer.is_empty() {
        envp.push(env_entry("HTTP_REFERER", &conn.referer));
    }
    if !conn.useragent.is_empty() {
        envp.push(env_entry("HTTP_USER_AGENT", &conn.useragent));
    }
    if !conn.accept.is_empty() {
        envp.push(env_entry("HTTP_ACCEPT", &conn.accept));
    }
    if !conn.accepte.is_empty() {
        envp.push(env_entry("HTTP_ACCEPT_ENCODING", &conn.accepte));
    }
    if !conn.acceptl.is_empty() {
        envp.push(env_entry("HTTP_ACCEPT_LANGUAGE", &conn.acceptl));
    }
    if !conn.cookie.is_empty() {
        envp.push(env_entry("HTTP_COOKIE", &conn.cookie));
    }
    if !conn.contenttype.is_empty() {
        envp.push(env_entry("CONTENT_TYPE", &conn.contenttype));
    }
    if !conn.hdrhost.is_empty() {
        envp.push(env_entry("HTTP_HOST", &conn.hdrhost));
    }
    if conn.contentlength > 0 {
        envp.push(env_entry("CONTENT_LENGTH", &conn.contentlength.to_string()));
    }
    if !conn.remoteuser.is_empty() {
        envp.push(env_entry("REMOTE_USER", &conn.remoteuser));
    }
    if !conn.authorization.is_empty() {
        // Only Basic is supported.
        envp.push(env_entry("AUTH_TYPE", "Basic"));
    }
    if let Ok(tz) = env::var("TZ") {
        envp.push(env_entry("TZ", &tz));
    }
    envp.push(env_entry(
        "CGI_PATTERN",
        server.cgi_pattern.as_deref().unwrap_or(""),
    ));

    envp
}

/// Build the argument vector: argv[0] is the binary's basename; when the
/// query contains no '=' it is split on '+' into decoded extra arguments
/// (the old isindex convention).
fn make_argp(conn: &Connection) -> (Option<String>, String, Vec<CString>) {
    let (directory, binary) = match conn.expnfilename.rfind('/') {
        Some(pos) => (
            Some(conn.expnfilename[..pos].to_string()),
            conn.expnfilename[pos + 1..].to_string(),
        ),
        None => (None, conn.expnfilename.clone()),
    };

    let mut argp = Vec::new();
    argp.push(CString::new(binary.replace('\0', "")).unwrap());
    if !conn.query.contains('=') {
        for piece in conn.query.split('+') {
            if piece.is_empty() {
                continue;
            }
            argp.push(CString::new(strdecode(piece).replace('\0', "")).unwrap());
        }
    }
    (directory, binary, argp)
}

/// This process reads the pre-buffered request body and then the rest of
/// the declared Content-Length from the socket, feeding the CGI's stdin.
/// It only exists because part of the body may already sit in our buffer.
fn cgi_interpose_input(conn: &Connection, wfd: RawFd) {
    let sock = conn.fd();
    let pre = &conn.read_buf[min(conn.checked_idx, conn.read_buf.len())..];
    if !pre.is_empty() && write_fully(wfd, pre).is_err() {
        return;
    }

    let mut count = pre.len() as i64;
    let mut buf = [0u8; 1024];
    while count < conn.contentlength {
        let want = min(buf.len() as i64, conn.contentlength - count) as usize;
        match read(sock, &mut buf[..want]) {
            Err(nix::Error::Sys(Errno::EINTR)) | Err(nix::Error::Sys(Errno::EAGAIN)) => {
                std::thread::sleep(Duration::from_secs(1));
            }
            Ok(0) | Err(_) => return,
            Ok(r) => {
                if write_fully(wfd, &buf[..r]).is_err() {
                    return;
                }
                count += r as i64;
            }
        }
    }
    post_post_garbage_hack(conn);
}

/// Some broken browsers send a stray LF or CRLF after POST data; reading
/// up to two bytes avoids a TCP reset on close.
fn post_post_garbage_hack(conn: &Connection) {
    let sock = conn.fd();
    set_ndelay(sock, true);
    let mut buf = [0u8; 2];
    read(sock, &mut buf).ok();
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_header_start(headers: &[u8], needle: &[u8], limit: usize) -> Option<usize> {
    (0..limit.min(headers.len()))
        .find(|&pos| headers[pos..].starts_with(needle) && (pos == 0 || headers[pos - 1] == b'\n'))
}

fn atoi_bytes(bytes: &[u8]) -> u16 {
    let mut bytes = bytes;
    while let Some((&b, rest)) = bytes.split_first() {
        if b == b' ' || b == b'\t' {
            bytes = rest;
        } else {
            break;
        }
    }
    let mut value: u32 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value * 10 + (b - b'0') as u32;
        if value > 999 {
            break;
        }
    }
    value.min(u16::MAX as u32) as u16
}

/// Figure the response status from accumulated CGI headers: an `HTTP/`
/// first line is overridden by `Status:`; a bare `Location:` means 302;
/// everything else defaults to 200.
fn parse_cgi_status(headers: &[u8], terminator: usize) -> u16 {
    let mut status = 200;
    if headers.starts_with(b"HTTP/") {
        if let Some(pos) = headers.iter().position(|&b| b == b' ' || b == b'\t') {
            status = atoi_bytes(&headers[pos..]);
        }
    }
    if let Some(pos) = find_header_start(headers, b"Status:", terminator) {
        status = atoi_bytes(&headers[pos + 7..]);
    } else if find_header_start(headers, b"Location:", terminator).is_some() {
        status = 302;
    }
    status
}

/// This process parses headers from a non-nph CGI so special ones like
/// `Status:` and `Location:` can pick the status line, which has to be
/// written out first.  Headers are accumulated, the synthesized status
/// line and the saved headers go out, then the rest is streamed.
fn cgi_interpose_output(conn: &Connection, rfd: RawFd) {
    let sock = conn.fd();

    // Make sure the socket is in blocking mode; the whole response must be
    // written.
    set_ndelay(sock, false);

    // Slurp in all headers.
    let mut headers: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    let mut terminator = None;
    loop {
        match read(rfd, &mut buf) {
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Ok(0) | Err(_) => break,
            Ok(r) => {
                headers.extend_from_slice(&buf[..r]);
                if let Some(pos) = find(&headers, b"\r\n\r\n").or_else(|| find(&headers, b"\n\n")) {
                    terminator = Some(pos);
                    break;
                }
            }
        }
    }

    // If there were no headers, bail.
    if headers.is_empty() {
        return;
    }
    let terminator = terminator.unwrap_or(headers.len());

    let status = parse_cgi_status(&headers, terminator);
    let line = format!("HTTP/1.0 {} {}\r\n", status, status_title(status));
    if write_fully(sock, line.as_bytes()).is_err() {
        return;
    }
    if write_fully(sock, &headers).is_err() {
        return;
    }

    // Echo the rest of the output.
    loop {
        match read(rfd, &mut buf) {
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Ok(0) | Err(_) => break,
            Ok(r) => {
                if write_fully(sock, &buf[..r]).is_err() {
                    break;
                }
            }
        }
    }

    shutdown(sock, Shutdown::Write).ok();
}

fn child_error_500(server: &Server, conn: &mut Connection, conn_fd: RawFd) -> ! {
    let url = conn.encodedurl.clone();
    send_err(server, conn, 500, status_title(500), "", ERR500FORM, &url);
    let response = conn.response.clone();
    set_ndelay(conn_fd, false);
    write_fully(conn_fd, &response).ok();
    exit(1)
}

/// The forked CGI process: build env and argv, wire stdin from the input
/// interposer or the socket, stdout/stderr through the output interposer
/// unless the script is nph-, chdir to the binary's directory, exec.
fn cgi_child(server: &mut Server, conn: &mut Connection) -> ! {
    let mut conn_fd = conn.fd();

    // If the socket landed on a stdio descriptor, move it up so the dup2
    // calls below can't collide with it.
    if conn_fd >= 0 && conn_fd <= 2 {
        if let Ok(newfd) = dup(conn_fd) {
            conn_fd = newfd;
        }
    }

    let envp = make_envp(server, conn);
    let (directory, binary, argp) = make_argp(conn);

    // stdin: for POST/PUT an interposer feeds the pre-buffered body plus
    // whatever is still on the socket.
    if conn.method == Method::Post || conn.method == Method::Put {
        let (prd, pwr) = match pipe() {
            Ok(p) => p,
            Err(e) => {
                log::error(&format!("pipe: {}", e));
                child_error_500(server, conn, conn_fd)
            }
        };
        match unsafe { fork() } {
            Err(e) => {
                log::error(&format!("fork: {}", e));
                child_error_500(server, conn, conn_fd)
            }
            Ok(ForkResult::Child) => {
                // Input interposer process.
                close(prd).ok();
                cgi_interpose_input(conn, pwr);
                exit(0);
            }
            Ok(ForkResult::Parent { .. }) => {
                close(pwr).ok();
                if prd != libc::STDIN_FILENO {
                    dup2(prd, libc::STDIN_FILENO).ok();
                    close(prd).ok();
                }
            }
        }
    } else {
        // Otherwise the request socket is stdin.
        if conn_fd != libc::STDIN_FILENO {
            dup2(conn_fd, libc::STDIN_FILENO).ok();
        }
    }

    // stdout/stderr: header parsing needs an output interposer, except for
    // nph- scripts which own the whole response.
    if !binary.starts_with("nph-") && conn.mime_flag {
        let (prd, pwr) = match pipe() {
            Ok(p) => p,
            Err(e) => {
                log::error(&format!("pipe: {}", e));
                child_error_500(server, conn, conn_fd)
            }
        };
        match unsafe { fork() } {
            Err(e) => {
                log::error(&format!("fork: {}", e));
                child_error_500(server, conn, conn_fd)
            }
            Ok(ForkResult::Child) => {
                // Output interposer process.
                close(pwr).ok();
                cgi_interpose_output(conn, prd);
                exit(0);
            }
            Ok(ForkResult::Parent { .. }) => {
                close(prd).ok();
                if pwr != libc::STDOUT_FILENO {
                    dup2(pwr, libc::STDOUT_FILENO).ok();
                }
                if pwr != libc::STDERR_FILENO {
                    dup2(pwr, libc::STDERR_FILENO).ok();
                }
                if pwr != libc::STDOUT_FILENO && pwr != libc::STDERR_FILENO {
                    close(pwr).ok();
                }
            }
        }
    } else {
        // Otherwise the request socket is stdout/stderr.
        if conn_fd != libc::STDOUT_FILENO {
            dup2(conn_fd, libc::STDOUT_FILENO).ok();
        }
        if conn_fd != libc::STDERR_FILENO {
            dup2(conn_fd, libc::STDERR_FILENO).ok();
        }
    }

    // chdir to the program's own directory; not in the CGI spec but it's
    // what other HTTP servers do.
    if let Some(directory) = &directory {
        chdir(directory.as_str()).ok();
    }

    // Default behavior for SIGPIPE.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }.ok();

    let exec_path = CString::new(binary.replace('\0', "")).unwrap();
    let err = execve(&exec_path, &argp, &envp);

    log::error(&format!(
        "execve {}({}): {:?}",
        binary, conn.expnfilename, err
    ));
    child_error_500(server, conn, conn_fd)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::IpAddr;

    fn env_lookup<'a>(envp: &'a [CString], name: &str) -> Option<&'a str> {
        let prefix = format!("{}=", name);
        envp.iter()
            .filter_map(|e| e.to_str().ok())
            .find(|e| e.starts_with(&prefix))
            .map(|e| &e[prefix.len()..])
    }

    fn test_conn() -> Connection {
        let client: IpAddr = "127.0.0.1".parse().unwrap();
        let mut conn = Connection::new(None, client, 0);
        conn.protocol = "HTTP/1.1".to_string();
        conn.method = Method::Post;
        conn.origfilename = "cgi-bin/app".to_string();
        conn.expnfilename = "cgi-bin/app".to_string();
        conn.query = "a=1".to_string();
        conn.contenttype = "text/plain".to_string();
        conn.contentlength = 10;
        conn.hdrhost = "example.com".to_string();
        conn.pathinfo = "extra/path".to_string();
        conn.remoteuser = "ali".to_string();
        conn.authorization = "Basic xyz".to_string();
        conn
    }

    #[test]
    fn envp_carries_cgi_vars() {
        let mut server = Server::new();
        server.cwd = "/web/".to_string();
        server.port = 8080;
        server.cgi_pattern = Some("cgi-bin/*".to_string());
        let conn = test_conn();
        let envp = make_envp(&server, &conn);

        assert_eq!(env_lookup(&envp, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(env_lookup(&envp, "REQUEST_METHOD"), Some("POST"));
        assert_eq!(env_lookup(&envp, "SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(env_lookup(&envp, "SERVER_PORT"), Some("8080"));
        assert_eq!(env_lookup(&envp, "SCRIPT_NAME"), Some("/cgi-bin/app"));
        assert_eq!(env_lookup(&envp, "SCRIPT_FILENAME"), Some("/web/cgi-bin/app"));
        assert_eq!(env_lookup(&envp, "PATH_INFO"), Some("/extra/path"));
        assert_eq!(env_lookup(&envp, "PATH_TRANSLATED"), Some("/web/extra/path"));
        assert_eq!(env_lookup(&envp, "QUERY_STRING"), Some("a=1"));
        assert_eq!(env_lookup(&envp, "CONTENT_LENGTH"), Some("10"));
        assert_eq!(env_lookup(&envp, "CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(env_lookup(&envp, "HTTP_HOST"), Some("example.com"));
        assert_eq!(env_lookup(&envp, "REMOTE_USER"), Some("ali"));
        assert_eq!(env_lookup(&envp, "AUTH_TYPE"), Some("Basic"));
        assert_eq!(env_lookup(&envp, "CGI_PATTERN"), Some("cgi-bin/*"));
        assert_eq!(env_lookup(&envp, "REMOTE_ADDR"), Some("127.0.0.1"));
    }

    #[test]
    fn envp_omits_absent_fields() {
        let server = Server::new();
        let client: IpAddr = "127.0.0.1".parse().unwrap();
        let mut conn = Connection::new(None, client, 0);
        conn.method = Method::Get;
        conn.expnfilename = "cgi-bin/app".to_string();
        conn.origfilename = "cgi-bin/app".to_string();
        let envp = make_envp(&server, &conn);
        assert_eq!(env_lookup(&envp, "PATH_INFO"), None);
        assert_eq!(env_lookup(&envp, "QUERY_STRING"), None);
        assert_eq!(env_lookup(&envp, "CONTENT_LENGTH"), None);
        assert_eq!(env_lookup(&envp, "REMOTE_USER"), None);
        assert_eq!(env_lookup(&envp, "AUTH_TYPE"), None);
    }

    #[test]
    fn argp_basename_and_isindex() {
        let mut conn = test_conn();
        conn.query = "word1+word2%21".to_string();
        let (directory, binary, argp) = make_argp(&conn);
        assert_eq!(directory.as_deref(), Some("cgi-bin"));
        assert_eq!(binary, "app");
        let args: Vec<&str> = argp.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(args, vec!["app", "word1", "word2!"]);
    }

    #[test]
    fn argp_skips_isindex_with_equals() {
        let conn = test_conn(); // query is a=1
        let (_directory, _binary, argp) = make_argp(&conn);
        assert_eq!(argp.len(), 1);
    }

    #[test]
    fn cgi_status_parsing() {
        let headers = b"Content-Type: text/html\r\n\r\nbody";
        assert_eq!(parse_cgi_status(headers, 23), 200);

        let headers = b"Status: 201 Created\r\n\r\nok";
        assert_eq!(parse_cgi_status(headers, 19), 201);

        let headers = b"Location: http://x/\r\n\r\n";
        assert_eq!(parse_cgi_status(headers, 19), 302);

        let headers = b"HTTP/1.0 404 Not Found\r\nX: y\r\n\r\n";
        assert_eq!(parse_cgi_status(headers, 28), 404);

        // Status: beats both HTTP/ and Location:
        let headers = b"HTTP/1.0 200 OK\r\nStatus: 503\r\nLocation: /x\r\n\r\n";
        assert_eq!(parse_cgi_status(headers, 44), 503);

        // Location: must start a line
        let headers = b"X-Location: Location: http://x/\r\n\r\n";
        assert_eq!(parse_cgi_status(headers, 31), 200);
    }

    #[test]
    fn find_works() {
        assert_eq!(find(b"abc\r\n\r\ndef", b"\r\n\r\n"), Some(3));
        assert_eq!(find(b"abc", b"\r\n\r\n"), None);
    }
}
