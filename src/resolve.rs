use std::fs;
use std::io::Write;

use crate::auth::{access_check, auth_check};
use crate::cgi;
use crate::conn::{
    BodySource, CompressionType, Connection, FileStat, Method, Server, INDEX_NAMES,
    SERVER_SOFTWARE,
};
use crate::expand::expand_symlinks;
use crate::fsmap::{icon_check, FileMap};
use crate::log;
use crate::mime::figure_mime;
use crate::pattern::matches;
use crate::response::{
    add_response, send_dirredirect, send_err, send_mime, status_title, HttpDate, ERR404FORM,
    ERR500FORM,
};

/// Map a ~user/whatever URL into <prefix>/user/whatever.
pub fn tilde_map(server: &Server, conn: &mut Connection) -> bool {
    let prefix = match &server.tilde_map {
        Some(prefix) => prefix,
        None => return false,
    };
    let rest = conn.expnfilename[1..].to_string();
    conn.expnfilename.clear();
    if !prefix.is_empty() {
        conn.expnfilename.push_str(prefix);
        conn.expnfilename.push('/');
    }
    conn.expnfilename.push_str(&rest);
    true
}

/// Top-level directories every virtual host may fall through to.
pub fn is_vhost_shared(path: &str) -> bool {
    path.starts_with("icons/") || path.starts_with("cgi-bin/")
}

/// Virtual host mapping: pick the host name from the absolute-form URI or
/// the Host header, lowercase it, and prefix the filename with the host
/// directory.
pub fn vhost_map(conn: &mut Connection) -> bool {
    let host = if !conn.reqhost.is_empty() {
        conn.reqhost.clone()
    } else if !conn.hdrhost.is_empty() {
        conn.hdrhost.clone()
    } else {
        match conn.socket.as_ref().and_then(|s| s.local_addr().ok()) {
            Some(addr) => addr.ip().to_string(),
            None => {
                log::error("getsockname failed for vhost mapping");
                return false;
            }
        }
    };
    let host = host.to_lowercase();
    conn.hostname = Some(host.clone());

    if conn.tildemapped {
        return true;
    }

    // The host directory is the hostname without any port number.
    let hostdir = match host.rfind(':') {
        Some(pos) => host[..pos].to_string(),
        None => host,
    };
    conn.hostdir = hostdir;

    // Prepend hostdir to the filename.
    let rest = conn.expnfilename.clone();
    conn.expnfilename.clear();
    let hostdir = conn.hostdir.clone();
    conn.expnfilename.push_str(&hostdir);
    conn.expnfilename.push('/');
    conn.expnfilename.push_str(&rest);

    true
}

/// Does the expanded filename land in the CGI area?  The vhost prefix is
/// stripped before matching.
pub fn is_cgi(server: &Server, conn: &Connection) -> bool {
    let pattern = match &server.cgi_pattern {
        Some(pattern) => pattern,
        None => return false,
    };

    let mut fname = conn.expnfilename.as_str();
    if server.vhost && !conn.hostdir.is_empty() {
        let prefix_pattern = format!("{}/**", conn.hostdir);
        if matches(&prefix_pattern, fname) {
            fname = &fname[conn.hostdir.len() + 1..];
        }
    }

    matches(pattern, fname)
}

/// Returns true when it is ok to serve the url, false after queueing the
/// 403 for a referer-policy violation.
pub fn check_referer(server: &Server, conn: &mut Connection) -> bool {
    // Not doing referer checking at all?
    if server.url_pattern.is_none() {
        return true;
    }

    if really_check_referer(server, conn) {
        return true;
    }

    let hostname = crate::response::get_hostname(server, conn);
    log::info(&format!(
        "{} non-local referer \"{}{}\" \"{}\"",
        conn.real_ip, hostname, conn.encodedurl, conn.referer
    ));
    let url = conn.encodedurl.clone();
    send_err(
        server,
        conn,
        403,
        status_title(403),
        "",
        "You must supply a local referer to get URL '%s' from this server.\n",
        &url,
    );
    false
}

fn really_check_referer(server: &Server, conn: &Connection) -> bool {
    let url_pattern = server.url_pattern.as_deref().unwrap_or("");

    // Check for an empty referer.
    let host_start = conn.referer.find("//");
    if conn.referer.is_empty() || host_start.is_none() {
        // Disallow if empty referers are banned and the url matches.
        if server.no_empty_referers && matches(url_pattern, &conn.origfilename) {
            return false;
        }
        return true;
    }

    // Extract the referer host.
    let after = &conn.referer[host_start.unwrap() + 2..];
    let end = after
        .find(|c| c == '/' || c == ':')
        .unwrap_or_else(|| after.len());
    let refhost = after[..end].to_lowercase();

    // Local pattern, or our own hostname.
    let local: String = match &server.local_pattern {
        Some(local) => local.clone(),
        None => {
            if !server.vhost {
                match &server.hostname {
                    Some(hostname) => hostname.clone(),
                    // Couldn't figure out the local hostname - give up.
                    None => return true,
                }
            } else {
                match &conn.hostname {
                    Some(hostname) => hostname.clone(),
                    // Old browser without a Host header; not worth it.
                    None => return true,
                }
            }
        }
    };

    if !matches(&local, &refhost) && matches(url_pattern, &conn.origfilename) {
        return false;
    }
    true
}

/// The compression decision table, run once per request.  A fresh-enough
/// world-readable .gz sibling is served directly; otherwise on-the-fly
/// gzip stays enabled only for sizable text and javascript.  Also decides
/// whether the response varies on Accept-Encoding.
pub fn mod_headers(conn: &mut Connection) -> &'static str {
    if conn.compression == CompressionType::Gzip {
        let sibling = format!("{}.gz", conn.expnfilename);
        let mut dotgz: Option<FileStat> = None;
        if let Ok(md) = fs::metadata(&sibling) {
            let st = FileStat::from_metadata(&md);
            if st.world_accessible() && st.mtime >= conn.sb.mtime {
                dotgz = Some(st);
            }
        }
        if let Some(st) = dotgz {
            if conn.encodings.is_empty() {
                conn.expnfilename = sibling;
                conn.sb.size = st.size;
                // Compressed already, no need to deflate.
                conn.compression = CompressionType::None;
                conn.encodings = "gzip".to_string();
            }
        }
    }

    if conn.compression == CompressionType::Gzip {
        let texty =
            conn.mtype.starts_with("text/") || conn.mtype == "application/javascript";
        if !texty || conn.sb.size < 256 {
            conn.compression = CompressionType::None;
        }
    }

    const VARY_EXTS: &[&str] = &[".js", ".css", ".xml", ".gz", ".html"];
    let vary = conn
        .expnfilename
        .rfind('.')
        .map(|pos| &conn.expnfilename[pos..])
        .map_or(false, |ext| VARY_EXTS.contains(&ext));
    if vary {
        "Vary: Accept-Encoding\r\n"
    } else {
        ""
    }
}

fn options_response(server: &Server, conn: &mut Connection) {
    let allow_post = if is_cgi(server, conn) { "POST," } else { "" };
    let cache = match server.max_age {
        Some(age) => format!("Cache-Control: max-age={}\r\n", age),
        None => String::new(),
    };
    let protocol = if conn.protocol.is_empty() {
        "HTTP/1.0"
    } else {
        conn.protocol.as_str()
    };
    let buf = format!(
        "{} 200 OK\r\n\
         Date: {}\r\n\
         Server: {}\r\n\
         Allow: {}OPTIONS,GET,HEAD\r\n\
         {}\
         Content-Length: 0\r\n\
         Content-Type: text/html\r\n\
         \r\n",
        protocol,
        HttpDate(server.now),
        SERVER_SOFTWARE,
        allow_post,
        cache,
    );
    add_response(conn, &buf);
    conn.status = 200;
}

fn err500(server: &Server, conn: &mut Connection) -> Result<(), ()> {
    let url = conn.encodedurl.clone();
    send_err(server, conn, 500, status_title(500), "", ERR500FORM, &url);
    Err(())
}

fn err404(server: &Server, conn: &mut Connection) -> Result<(), ()> {
    let url = conn.encodedurl.clone();
    send_err(server, conn, 404, status_title(404), "", ERR404FORM, &url);
    Err(())
}

fn err403(server: &Server, conn: &mut Connection, form: &str) -> Result<(), ()> {
    let url = conn.encodedurl.clone();
    send_err(server, conn, 403, status_title(403), "", form, &url);
    Err(())
}

/// Resolve the parsed request to a disposition and queue the response (or
/// hand off to the indexer or CGI).  On Err a response has been queued.
pub fn start_request(server: &mut Server, conn: &mut Connection) -> Result<(), ()> {
    match conn.method {
        Method::Get | Method::Head | Method::Post | Method::Options | Method::Put
        | Method::Delete => {}
        method => {
            let arg = method.as_str().to_string();
            send_err(
                server,
                conn,
                501,
                status_title(501),
                "",
                crate::response::ERR501FORM,
                &arg,
            );
            return Err(());
        }
    }

    // Requests for the built-in icons are served from memory; they only
    // trigger when the path never resolved on disk.
    if let Some(bytes) = icon_check(&conn.pathinfo) {
        conn.expnfilename = std::mem::take(&mut conn.pathinfo);
        conn.sb = FileStat::builtin(bytes.len(), server.start_time);

        if !check_referer(server, conn) {
            return Err(());
        }
        conn.file = BodySource::Builtin(bytes);
        return dispatch(server, conn, true);
    }

    // Stat the file.
    match fs::metadata(&conn.expnfilename) {
        Ok(md) => conn.sb = FileStat::from_metadata(&md),
        Err(_) => return err500(server, conn),
    }

    // World-readable or world-executable?  Checked explicitly so nobody is
    // surprised by a file that's readable by the server but not the world.
    if !conn.sb.world_accessible() {
        log::info(&format!(
            "{} URL \"{}\" resolves to a non world-readable file",
            conn.real_ip, conn.encodedurl
        ));
        return err403(
            server,
            conn,
            "The requested URL '%s' resolves to a file that is not world-readable.\n",
        );
    }

    if conn.sb.is_dir {
        // With pathinfo it's just a non-existent file.
        if !conn.pathinfo.is_empty() {
            return err404(server, conn);
        }

        // Directory URLs that don't end in a slash get an explicit
        // redirect.
        if !conn.origfilename.is_empty()
            && conn.origfilename != "."
            && !conn.origfilename.ends_with('/')
        {
            send_dirredirect(server, conn);
            return Err(());
        }

        // Check for an index file.
        let mut found_index = false;
        for index_name in INDEX_NAMES {
            let mut indexname = conn.expnfilename.clone();
            if !indexname.is_empty() && !indexname.ends_with('/') {
                indexname.push('/');
            }
            if indexname == "./" {
                indexname.clear();
            }
            indexname.push_str(index_name);
            if let Ok(md) = fs::metadata(&indexname) {
                conn.sb = FileStat::from_metadata(&md);
                conn.indexname = indexname;
                found_index = true;
                break;
            }
        }

        if !found_index {
            // No index file, so it's an actual directory request.
            if !conn.sb.world_readable() {
                log::info(&format!(
                    "{} URL \"{}\" tried to index a directory with indexing disabled",
                    conn.real_ip, conn.encodedurl
                ));
                return err403(
                    server,
                    conn,
                    "The requested URL '%s' resolves to a directory that has indexing disabled.\n",
                );
            }
            let dir = conn.expnfilename.clone();
            if access_check(server, conn, Some(&dir)) == -1 {
                return Err(());
            }
            if auth_check(server, conn, Some(&dir)) == -1 {
                return Err(());
            }
            if !check_referer(server, conn) {
                return Err(());
            }
            return crate::dirlist::ls(server, conn);
        }

        // Got an index file.  Expand symlinks again; more pathinfo means
        // something went wrong.
        let expanded = expand_symlinks(
            &conn.indexname,
            server.no_symlink_check,
            conn.tildemapped,
        );
        let (checked, trailer) = match expanded {
            Some(parts) => parts,
            None => return err500(server, conn),
        };
        if !trailer.is_empty() {
            return err500(server, conn);
        }
        conn.expnfilename = checked;

        // Is the index version world-readable?
        if !conn.sb.world_accessible() {
            log::info(&format!(
                "{} URL \"{}\" resolves to a non-world-readable index file",
                conn.real_ip, conn.encodedurl
            ));
            return err403(
                server,
                conn,
                "The requested URL '%s' resolves to an index file that is not world-readable.\n",
            );
        }
    } else if !conn.sb.is_reg {
        // Not a regular file and not a directory?
        return err404(server, conn);
    }

    // Access and auth checks on the containing directory.
    if access_check(server, conn, None) == -1 {
        return Err(());
    }
    if auth_check(server, conn, None) == -1 {
        return Err(());
    }

    // Referer check.
    if !check_referer(server, conn) {
        return Err(());
    }

    if conn.method == Method::Options {
        options_response(server, conn);
        return Ok(());
    }

    // World-executable and in the CGI area?
    if is_cgi(server, conn) {
        if conn.sb.world_executable() {
            return cgi::cgi(server, conn);
        }
        log::debug(&format!(
            "{} URL \"{}\" is a CGI but not executable, rejecting",
            conn.real_ip, conn.encodedurl
        ));
        return err403(
            server,
            conn,
            "The requested URL '%s' resolves to a file which matches a CGI but is not executable; retrieving it is forbidden.\n",
        );
    }

    if !conn.pathinfo.is_empty() {
        log::info(&format!(
            "{} URL \"{}\" has pathinfo but isn't CGI",
            conn.real_ip, conn.encodedurl
        ));
        return err403(
            server,
            conn,
            "The requested URL '%s' resolves to a file plus CGI-style pathinfo, but the file is not a valid CGI file.\n",
        );
    }

    dispatch(server, conn, false)
}

/// Final static-file disposition: range clamping, MIME decision,
/// compression, then headers only (HEAD), 304, or map-and-send.
fn dispatch(server: &Server, conn: &mut Connection, is_icon: bool) -> Result<(), ()> {
    // Fill in last_byte_index, if necessary.
    if conn.got_range && (conn.last_byte_index == -1 || conn.last_byte_index >= conn.sb.size) {
        conn.last_byte_index = conn.sb.size - 1;
    }

    let (mtype, encodings) = figure_mime(&conn.expnfilename);
    conn.mtype = mtype;
    conn.encodings = encodings;

    let mtime = conn.sb.mtime;

    if conn.method == Method::Head {
        let extra = mod_headers(conn);
        let encodings = conn.encodings.clone();
        let size = conn.sb.size;
        send_mime(
            server, conn, 200, status_title(200), &encodings, extra, mtype, size, mtime,
        );
        return Ok(());
    }

    if conn.if_modified_since.map_or(false, |t| t >= mtime) {
        // No body follows a 304.
        conn.file = BodySource::None;
        let encodings = conn.encodings.clone();
        send_mime(
            server,
            conn,
            304,
            status_title(304),
            &encodings,
            "",
            mtype,
            -1,
            mtime,
        );
        return Ok(());
    }

    let extra = mod_headers(conn);

    if !is_icon {
        match FileMap::open(&conn.expnfilename) {
            Ok(map) => conn.file = BodySource::Map(map),
            Err(e) => {
                log::error(&format!("mmap {}: {}", conn.expnfilename, e));
                return err500(server, conn);
            }
        }
    }

    // A deflated stream has no Content-Length; the client needs EOF.
    if conn.compression == CompressionType::Gzip {
        conn.do_keep_alive = false;
    }

    let encodings = conn.encodings.clone();
    let size = conn.sb.size;
    let mtype = conn.mtype;
    send_mime(
        server,
        conn,
        200,
        status_title(200),
        &encodings,
        extra,
        mtype,
        size,
        mtime,
    );

    if conn.status == 206 {
        conn.bytes_to_send = conn.last_byte_index - conn.first_byte_index + 1;
    } else {
        conn.first_byte_index = 0;
        conn.bytes_to_send = size;
        if conn.compression == CompressionType::Gzip {
            let bytes = conn.file.bytes().unwrap_or(&[]);
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            let deflated = encoder
                .write_all(bytes)
                .and_then(|_| encoder.finish())
                .unwrap_or_default();
            conn.bytes_to_send = deflated.len() as i64;
            conn.file = BodySource::Gzip(deflated);
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::{create_dir, File};
    use std::net::IpAddr;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use crate::conn::testutil::with_cwd;

    fn test_conn(url: &str, filename: &str) -> Connection {
        let client: IpAddr = "127.0.0.1".parse().unwrap();
        let mut conn = Connection::new(None, client, 0);
        conn.protocol = "HTTP/1.1".to_string();
        conn.method = Method::Get;
        conn.encodedurl = url.to_string();
        conn.origfilename = filename.to_string();
        conn.expnfilename = filename.to_string();
        conn
    }

    fn write_file(name: &str, contents: &[u8]) {
        let mut file = File::create(name).unwrap();
        file.write_all(contents).unwrap();
    }

    fn chmod(name: &str, mode: u32) {
        let perms = std::fs::Permissions::from_mode(mode);
        fs::set_permissions(name, perms).unwrap();
    }

    fn headers_of(conn: &Connection) -> String {
        String::from_utf8_lossy(&conn.response).into_owned()
    }

    #[test]
    fn serves_regular_file() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            server.now = 1000;
            write_file("hello.txt", b"hello world");

            let mut conn = test_conn("/hello.txt", "hello.txt");
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 200);
            assert_eq!(conn.bytes_to_send, 11);
            assert_eq!(conn.file.bytes(), Some(&b"hello world"[..]));
            let headers = headers_of(&conn);
            assert!(headers.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
            assert!(headers.contains("Content-Length: 11\r\n"));
        });
    }

    #[test]
    fn directory_without_slash_redirects() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            create_dir("dir").unwrap();

            let mut conn = test_conn("/dir", "dir");
            assert!(start_request(&mut server, &mut conn).is_err());
            assert_eq!(conn.status, 302);
            assert!(headers_of(&conn).contains("Location: /dir/\r\n"));
        });
    }

    #[test]
    fn index_file_is_probed() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            create_dir("dir").unwrap();
            write_file("dir/index.html", b"<html>index</html>");

            let mut conn = test_conn("/dir/", "dir/");
            conn.expnfilename = "dir".to_string();
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 200);
            assert_eq!(conn.expnfilename, "dir/index.html");
            assert!(headers_of(&conn).contains("Content-Type: text/html; charset=UTF-8\r\n"));
        });
    }

    #[test]
    fn listing_when_no_index() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            create_dir("dir").unwrap();
            write_file("dir/a.txt", b"x");

            let mut conn = test_conn("/dir/", "dir/");
            conn.expnfilename = "dir".to_string();
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 200);
            let out = headers_of(&conn);
            assert!(out.contains("a.txt"));
        });
    }

    #[test]
    fn missing_file_is_404() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            // expansion leaves the whole name as pathinfo; the resolver
            // sees the root directory plus pathinfo on a non-CGI.
            let mut conn = test_conn("/absent.txt", "absent.txt");
            conn.expnfilename = ".".to_string();
            conn.pathinfo = "absent.txt".to_string();
            conn.origfilename = "".to_string();
            assert!(start_request(&mut server, &mut conn).is_err());
            assert_eq!(conn.status, 404);
        });
    }

    #[test]
    fn non_world_readable_is_403() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("private.txt", b"secret");
            chmod("private.txt", 0o600);

            let mut conn = test_conn("/private.txt", "private.txt");
            assert!(start_request(&mut server, &mut conn).is_err());
            assert_eq!(conn.status, 403);
        });
    }

    #[test]
    fn range_clamps_and_sends_206() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("data.bin", &[0u8; 100]);

            let mut conn = test_conn("/data.bin", "data.bin");
            conn.got_range = true;
            conn.first_byte_index = 0;
            conn.last_byte_index = 4;
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 206);
            assert_eq!(conn.bytes_to_send, 5);
            let out = headers_of(&conn);
            assert!(out.contains("Content-Range: bytes 0-4/100\r\n"));
            assert!(out.contains("Content-Length: 5\r\n"));

            // open-ended ranges clamp to the file size
            let mut conn = test_conn("/data.bin", "data.bin");
            conn.got_range = true;
            conn.first_byte_index = 90;
            conn.last_byte_index = -1;
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 206);
            assert_eq!(conn.bytes_to_send, 10);
            assert!(headers_of(&conn).contains("Content-Range: bytes 90-99/100\r\n"));
        });
    }

    #[test]
    fn if_modified_since_sends_304() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("page.html", b"<html></html>");
            let mtime = fs::metadata("page.html").unwrap();
            let mtime = FileStat::from_metadata(&mtime).mtime;

            let mut conn = test_conn("/page.html", "page.html");
            conn.if_modified_since = Some(mtime);
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 304);
            assert!(matches!(conn.file, BodySource::None));

            let mut conn = test_conn("/page.html", "page.html");
            conn.if_modified_since = Some(mtime - 10);
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 200);
        });
    }

    #[test]
    fn head_gets_headers_only() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("hello.txt", b"hello");

            let mut conn = test_conn("/hello.txt", "hello.txt");
            conn.method = Method::Head;
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 200);
            assert!(matches!(conn.file, BodySource::None));
            assert!(headers_of(&conn).contains("Content-Length: 5\r\n"));
        });
    }

    #[test]
    fn cgi_without_execute_bit_is_403() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            server.cgi_pattern = Some("cgi-bin/*".to_string());
            create_dir("cgi-bin").unwrap();
            write_file("cgi-bin/echo", b"#!/bin/sh\n");
            chmod("cgi-bin/echo", 0o644);

            let mut conn = test_conn("/cgi-bin/echo", "cgi-bin/echo");
            assert!(start_request(&mut server, &mut conn).is_err());
            assert_eq!(conn.status, 403);
        });
    }

    #[test]
    fn pathinfo_on_non_cgi_is_403() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("plain.txt", b"x");

            let mut conn = test_conn("/plain.txt/extra", "plain.txt");
            conn.pathinfo = "extra".to_string();
            assert!(start_request(&mut server, &mut conn).is_err());
            assert_eq!(conn.status, 403);
        });
    }

    #[test]
    fn options_synthesizes_allow() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("hello.txt", b"hello");

            let mut conn = test_conn("/hello.txt", "hello.txt");
            conn.method = Method::Options;
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 200);
            let out = headers_of(&conn);
            assert!(out.contains("Allow: OPTIONS,GET,HEAD\r\n"));
            assert!(out.contains("Content-Length: 0\r\n"));
        });
    }

    #[test]
    fn options_on_cgi_allows_post() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            server.cgi_pattern = Some("cgi-bin/*".to_string());
            create_dir("cgi-bin").unwrap();
            write_file("cgi-bin/app", b"#!/bin/sh\n");
            chmod("cgi-bin/app", 0o755);

            let mut conn = test_conn("/cgi-bin/app", "cgi-bin/app");
            conn.method = Method::Options;
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert!(headers_of(&conn).contains("Allow: POST,OPTIONS,GET,HEAD\r\n"));
        });
    }

    #[test]
    fn builtin_icon_is_served() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            let mut conn = test_conn("/icons/folder.gif", "");
            conn.expnfilename = ".".to_string();
            conn.pathinfo = "icons/folder.gif".to_string();
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.status, 200);
            assert!(conn.file.bytes().unwrap().starts_with(b"GIF8"));
            assert!(headers_of(&conn).contains("Content-Type: image/gif\r\n"));
        });
    }

    #[test]
    fn gz_sibling_is_served() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("style.css", &[b'a'; 400]);
            write_file("style.css.gz", b"fake gzip bytes");

            let mut conn = test_conn("/style.css", "style.css");
            conn.compression = CompressionType::Gzip;
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert_eq!(conn.expnfilename, "style.css.gz");
            assert_eq!(conn.file.bytes(), Some(&b"fake gzip bytes"[..]));
            let out = headers_of(&conn);
            assert!(out.contains("Content-Encoding: gzip\r\n"));
            assert!(out.contains("Content-Length: 15\r\n"));
            assert!(out.contains("Vary: Accept-Encoding\r\n"));
        });
    }

    #[test]
    fn runtime_gzip_for_large_text() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("big.txt", &[b'a'; 1000]);

            let mut conn = test_conn("/big.txt", "big.txt");
            conn.compression = CompressionType::Gzip;
            assert!(start_request(&mut server, &mut conn).is_ok());
            let out = headers_of(&conn);
            assert!(out.contains("Content-Encoding: gzip\r\n"));
            assert!(!out.contains("Content-Length"));
            assert!(!conn.do_keep_alive);
            // the body is a valid gzip stream of the original
            let bytes = conn.file.bytes().unwrap().to_vec();
            let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
            let mut plain = Vec::new();
            std::io::Read::read_to_end(&mut decoder, &mut plain).unwrap();
            assert_eq!(plain, vec![b'a'; 1000]);
        });
    }

    #[test]
    fn small_or_binary_files_not_gzipped() {
        let root = tempdir().unwrap();
        with_cwd(root.path(), || {
            chmod(".", 0o755);
            let mut server = Server::new();
            write_file("small.txt", b"tiny");
            write_file("image.png", &[b'x'; 1000]);

            let mut conn = test_conn("/small.txt", "small.txt");
            conn.compression = CompressionType::Gzip;
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert!(!headers_of(&conn).contains("Content-Encoding"));

            let mut conn = test_conn("/image.png", "image.png");
            conn.compression = CompressionType::Gzip;
            assert!(start_request(&mut server, &mut conn).is_ok());
            assert!(!headers_of(&conn).contains("Content-Encoding"));
        });
    }

    #[test]
    fn referer_policy() {
        let mut server = Server::new();
        server.url_pattern = Some("protected/*".to_string());
        server.hostname = Some("myhost".to_string());

        // matching referer host passes
        let mut conn = test_conn("/protected/x", "protected/x");
        conn.referer = "http://myhost/page".to_string();
        assert!(really_check_referer(&server, &conn));

        // foreign referer on a protected path fails
        let mut conn2 = test_conn("/protected/x", "protected/x");
        conn2.referer = "http://evil.example/page".to_string();
        assert!(!really_check_referer(&server, &conn2));

        // foreign referer on an unprotected path passes
        let mut conn3 = test_conn("/open/x", "open/x");
        conn3.referer = "http://evil.example/page".to_string();
        assert!(really_check_referer(&server, &conn3));

        // empty referer passes unless banned
        let mut conn4 = test_conn("/protected/x", "protected/x");
        assert!(really_check_referer(&server, &conn4));
        server.no_empty_referers = true;
        assert!(!really_check_referer(&server, &conn4));
    }

    #[test]
    fn vhost_mapping() {
        let mut conn = test_conn("/x", "x");
        conn.hdrhost = "Example.COM:8080".to_string();
        assert!(vhost_map(&mut conn));
        assert_eq!(conn.hostname.as_deref(), Some("example.com:8080"));
        assert_eq!(conn.hostdir, "example.com");
        assert_eq!(conn.expnfilename, "example.com/x");
    }

    #[test]
    fn vhost_shared_directories() {
        assert!(is_vhost_shared("icons/folder.gif"));
        assert!(is_vhost_shared("cgi-bin/app"));
        assert!(!is_vhost_shared("other/file"));
    }

    #[test]
    fn cgi_match_strips_vhost_prefix() {
        let mut server = Server::new();
        server.cgi_pattern = Some("cgi-bin/*".to_string());
        server.vhost = true;

        let mut conn = test_conn("/cgi-bin/app", "example.com/cgi-bin/app");
        conn.hostdir = "example.com".to_string();
        assert!(is_cgi(&server, &conn));

        conn.expnfilename = "example.com/static/file".to_string();
        assert!(!is_cgi(&server, &conn));
    }

    #[test]
    fn tilde_mapping() {
        let mut server = Server::new();
        server.tilde_map = Some("users".to_string());
        let mut conn = test_conn("/~ali/x", "~ali/x");
        assert!(tilde_map(&server, &mut conn));
        assert_eq!(conn.expnfilename, "users/ali/x");
    }
}
