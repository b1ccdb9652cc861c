use crate::conn::{ChState, CompressionType, Connection, Method, Server};
use crate::expand::expand_symlinks;
use crate::log;
use crate::resolve::{is_vhost_shared, tilde_map, vhost_map};
use crate::response::{self, parse_http_date, send_err, status_title, ERR400FORM, ERR404FORM, ERR500FORM};
use crate::url::{de_dotdot, path_escapes, strdecode};

/// Outcome of feeding bytes to the request recognizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GotRequest {
    Got,
    Bad,
    No,
}

// Concatenated Accept/Accept-Encoding data beyond this is discarded.
const ACCEPT_CAP: usize = 5000;

/// Checks the read buffer to see whether a complete request has arrived so
/// far; either the first line has two words (an HTTP/0.9 request), or the
/// first line has three words and a blank line terminates the header block.
///
/// `checked_idx` is how much has been checked so far and `checked_state`
/// is the current state of the finite state machine, so the recognizer is
/// restartable as more bytes arrive.  No bytes are copied.
pub fn got_request(conn: &mut Connection) -> GotRequest {
    while conn.checked_idx < conn.read_buf.len() {
        let c = conn.read_buf[conn.checked_idx];
        conn.checked_idx += 1;
        match conn.checked_state {
            ChState::FirstWord => match c {
                b' ' | b'\t' => conn.checked_state = ChState::FirstWs,
                b'\n' | b'\r' => {
                    conn.checked_state = ChState::Bogus;
                    return GotRequest::Bad;
                }
                _ => {}
            },
            ChState::FirstWs => match c {
                b' ' | b'\t' => {}
                b'\n' | b'\r' => {
                    conn.checked_state = ChState::Bogus;
                    return GotRequest::Bad;
                }
                _ => conn.checked_state = ChState::SecondWord,
            },
            ChState::SecondWord => match c {
                b' ' | b'\t' => conn.checked_state = ChState::SecondWs,
                // The first line has only two words - an HTTP/0.9 request.
                b'\n' | b'\r' => return GotRequest::Got,
                _ => {}
            },
            ChState::SecondWs => match c {
                b' ' | b'\t' => {}
                b'\n' | b'\r' => {
                    conn.checked_state = ChState::Bogus;
                    return GotRequest::Bad;
                }
                _ => conn.checked_state = ChState::ThirdWord,
            },
            ChState::ThirdWord => match c {
                b' ' | b'\t' => conn.checked_state = ChState::ThirdWs,
                b'\n' => conn.checked_state = ChState::Lf,
                b'\r' => conn.checked_state = ChState::Cr,
                _ => {}
            },
            ChState::ThirdWs => match c {
                b' ' | b'\t' => {}
                b'\n' => conn.checked_state = ChState::Lf,
                b'\r' => conn.checked_state = ChState::Cr,
                _ => {
                    conn.checked_state = ChState::Bogus;
                    return GotRequest::Bad;
                }
            },
            ChState::Line => match c {
                b'\n' => conn.checked_state = ChState::Lf,
                b'\r' => conn.checked_state = ChState::Cr,
                _ => {}
            },
            ChState::Lf => match c {
                // Two newlines in a row - a blank line - end of request.
                b'\n' => return GotRequest::Got,
                b'\r' => conn.checked_state = ChState::Cr,
                _ => conn.checked_state = ChState::Line,
            },
            ChState::Cr => match c {
                b'\n' => conn.checked_state = ChState::CrLf,
                // Two returns in a row - end of request.
                b'\r' => return GotRequest::Got,
                _ => conn.checked_state = ChState::Line,
            },
            ChState::CrLf => match c {
                // Two newlines in a row - end of request.
                b'\n' => return GotRequest::Got,
                b'\r' => conn.checked_state = ChState::CrLfCr,
                _ => conn.checked_state = ChState::Line,
            },
            ChState::CrLfCr => match c {
                // Two CRLFs or two CRs in a row - end of request.
                b'\n' | b'\r' => return GotRequest::Got,
                _ => conn.checked_state = ChState::Line,
            },
            ChState::Bogus => return GotRequest::Bad,
        }
    }
    GotRequest::No
}

/// Return the next line of the request, advancing `checked_idx` past it.
fn bufgets(conn: &mut Connection) -> Option<String> {
    let start = conn.checked_idx;
    let mut i = start;
    while i < conn.read_buf.len() {
        let c = conn.read_buf[i];
        if c == b'\n' || c == b'\r' {
            let line = String::from_utf8_lossy(&conn.read_buf[start..i]).into_owned();
            i += 1;
            if c == b'\r' && conn.read_buf.get(i) == Some(&b'\n') {
                i += 1;
            }
            conn.checked_idx = i;
            return Some(line);
        }
        i += 1;
    }
    None
}

/// Leading part of `s` as a non-negative number, the way atoll reads it.
fn atoi_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

fn err400(server: &Server, conn: &mut Connection, arg: &str) -> Result<(), ()> {
    send_err(server, conn, 400, status_title(400), "", ERR400FORM, arg);
    Err(())
}

/// Parse the terminated request: request line, headers of interest, then
/// the name resolution that needs the whole request (tilde map, virtual
/// host prefix, symlink expansion, containment check).
pub fn parse_request(server: &Server, conn: &mut Connection) -> Result<(), ()> {
    conn.checked_idx = 0; /* reset */
    let line = match bufgets(conn) {
        Some(line) => line,
        None => return err400(server, conn, "1"),
    };

    let mut words = line
        .split(|c| matches!(c, ' ' | '\t'))
        .filter(|w| !w.is_empty());
    let method_str = match words.next() {
        Some(w) => w.to_string(),
        None => return err400(server, conn, "1"),
    };
    let mut url = match words.next() {
        Some(w) => w.to_string(),
        None => return err400(server, conn, "1"),
    };
    match words.next() {
        None => {
            conn.protocol = "HTTP/0.9".to_string();
            conn.mime_flag = false;
        }
        Some(protocol) => {
            if !protocol.eq_ignore_ascii_case("HTTP/1.0") {
                conn.one_one = true;
            }
            conn.protocol = protocol.to_string();
        }
    }

    // Check for HTTP/1.1 absolute URL.
    if url.get(..7).map_or(false, |p| p.eq_ignore_ascii_case("http://")) {
        if !conn.one_one {
            return err400(server, conn, "2");
        }
        let after = url[7..].to_string();
        let slash = match after.find('/') {
            Some(slash) => slash,
            None => return err400(server, conn, "3"),
        };
        let reqhost = &after[..slash];
        if reqhost.contains('/') || reqhost.starts_with('.') {
            return err400(server, conn, "4");
        }
        conn.reqhost = reqhost.to_string();
        url = after[slash..].to_string();
    }

    if !url.starts_with('/') {
        return err400(server, conn, "5");
    }

    conn.method = match Method::parse(&method_str) {
        Some(method) => method,
        None => {
            send_err(
                server,
                conn,
                501,
                status_title(501),
                "",
                response::ERR501FORM,
                &method_str,
            );
            return Err(());
        }
    };

    conn.encodedurl = url;
    conn.decodedurl = strdecode(&conn.encodedurl);

    conn.origfilename = conn.decodedurl[1..].to_string();
    // Special case for top-level URL.
    if conn.origfilename.is_empty() {
        conn.origfilename = ".".to_string();
    }

    // Extract query string from encoded URL.
    if let Some(pos) = conn.encodedurl.find('?') {
        conn.query = conn.encodedurl[pos + 1..].to_string();
        // Remove query from (decoded) origfilename.
        if let Some(pos) = conn.origfilename.find('?') {
            conn.origfilename.truncate(pos);
        }
    }

    let escapes = path_escapes(&conn.origfilename);
    de_dotdot(&mut conn.origfilename);
    if escapes
        || conn.origfilename.starts_with('/')
        || conn.origfilename == ".."
        || conn.origfilename.starts_with("../")
    {
        return err400(server, conn, "6");
    }

    if conn.mime_flag {
        // Read the MIME headers.
        while let Some(buf) = bufgets(conn) {
            if buf.is_empty() {
                break;
            }
            if let Some(value) = header_value(&buf, "Referer:") {
                conn.referer = value.to_string();
            } else if let Some(value) = header_value(&buf, "User-Agent:") {
                conn.useragent = value.to_string();
            } else if let Some(value) = header_value(&buf, "Host:") {
                conn.hdrhost = value.to_string();
                if conn.hdrhost.contains('/') || conn.hdrhost.starts_with('.') {
                    return err400(server, conn, "7");
                }
            } else if let Some(value) = header_value(&buf, "Accept:") {
                if !conn.accept.is_empty() {
                    if conn.accept.len() > ACCEPT_CAP {
                        log::error(&format!("{} way too much Accept: data", conn.real_ip));
                        continue;
                    }
                    conn.accept.push_str(", ");
                }
                conn.accept.push_str(value);
            } else if let Some(value) = header_value(&buf, "Accept-Encoding:") {
                if !conn.accepte.is_empty() {
                    if conn.accepte.len() > ACCEPT_CAP {
                        log::error(&format!(
                            "{} way too much Accept-Encoding: data",
                            conn.real_ip
                        ));
                        continue;
                    }
                    conn.accepte.push_str(", ");
                }
                conn.accepte.push_str(value);
            } else if let Some(value) = header_value(&buf, "Accept-Language:") {
                conn.acceptl = value.to_string();
            } else if let Some(value) = header_value(&buf, "If-Modified-Since:") {
                conn.if_modified_since = parse_http_date(value);
                if conn.if_modified_since.is_none() {
                    log::debug(&format!("unparsable time: {}", value));
                }
            } else if let Some(value) = header_value(&buf, "Cookie:") {
                conn.cookie = value.to_string();
            } else if buf.get(..6).map_or(false, |p| p.eq_ignore_ascii_case("Range:")) {
                // Only support %d- and %d-%d, not %d-%d,%d-%d or -%d.
                parse_range(conn, &buf);
            } else if let Some(value) = header_value(&buf, "Range-If:")
                .or_else(|| header_value(&buf, "If-Range:"))
            {
                conn.range_if = parse_http_date(value);
                if conn.range_if.is_none() {
                    log::debug(&format!("unparsable time: {}", value));
                }
            } else if let Some(value) = header_value(&buf, "Content-Type:") {
                conn.contenttype = value.to_string();
            } else if let Some(value) = header_value(&buf, "Content-Length:") {
                conn.contentlength = atoi_prefix(value);
            } else if let Some(value) = header_value(&buf, "Authorization:") {
                conn.authorization = value.to_string();
            } else if let Some(value) = header_value(&buf, "Connection:") {
                if value.eq_ignore_ascii_case("keep-alive") {
                    conn.keep_alive = true; /* client signaling */
                    conn.do_keep_alive = true; /* our intention, may change */
                }
            } else if let Some(value) = header_value(&buf, "X-Forwarded-For:") {
                // Syntax: X-Forwarded-For: client[, proxy1, proxy2, ...]
                let client = value
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .next()
                    .unwrap_or("");
                if !client.is_empty() {
                    conn.real_ip = client.to_string();
                }
            }
        }
    }

    if conn.one_one {
        // HTTP/1.1 requests must identify a host.
        if conn.reqhost.is_empty() && conn.hdrhost.is_empty() {
            return err400(server, conn, "8");
        }

        // A keep-alive client might be pipelining; there is no way to tell,
        // so closing needs a lingering drain.
        if conn.keep_alive {
            conn.should_linger = true;
        }
    }

    // Look for a gzip accept-encoding.
    if let Some(gz) = conn.accepte.find("gzip") {
        let tail = &conn.accepte[gz..];
        let comma = tail.find(',');
        let q = tail.find("q=");
        let accepted = match q {
            None => true,
            Some(qpos) => match comma {
                // The q-value belongs to a later entry.
                Some(cpos) if cpos < qpos => true,
                _ => tail[qpos + 2..]
                    .trim_start()
                    .split(|c: char| !(c.is_ascii_digit() || c == '.'))
                    .next()
                    .and_then(|v| v.parse::<f32>().ok())
                    .map_or(false, |qval| qval > 0.0),
            },
        };
        if accepted {
            conn.compression = CompressionType::Gzip;
        }
    }

    // Disable keep-alive for known-broken browsers; list taken from
    // Apache 1.3.19.
    if conn.do_keep_alive
        && (conn.useragent.contains("Mozilla/2") || conn.useragent.contains("MSIE 4.0b2;"))
    {
        conn.do_keep_alive = false;
    }

    // The request has been parsed; now resolve the parts that may need
    // the entire request.

    conn.expnfilename = conn.origfilename.clone();

    // Tilde mapping.
    if conn.expnfilename.starts_with('~') && server.tilde_map.is_some() {
        if !tilde_map(server, conn) {
            let url = conn.encodedurl.clone();
            send_err(server, conn, 404, status_title(404), "", ERR404FORM, &url);
            return Err(());
        }
    }

    // Virtual host mapping.
    if server.vhost {
        if !vhost_map(conn) {
            let url = conn.encodedurl.clone();
            send_err(server, conn, 500, status_title(500), "", ERR500FORM, &url);
            return Err(());
        }
    }

    // Expand all symbolic links in the filename.  This also gives us any
    // trailing non-existing components, for pathinfo.
    let expanded = expand_symlinks(&conn.expnfilename, server.no_symlink_check, conn.tildemapped);
    let (checked, trailer) = match expanded {
        Some(parts) => parts,
        None => {
            let url = conn.encodedurl.clone();
            send_err(server, conn, 500, status_title(500), "", ERR500FORM, &url);
            return Err(());
        }
    };

    // Fall back to shared (restricted) top-level directories for files
    // missing from a virtual host.
    if server.vhost && is_vhost_shared(&trailer) {
        conn.expnfilename = trailer;
        conn.pathinfo.clear();
    } else {
        conn.expnfilename = checked;
        conn.pathinfo = trailer;
    }

    // Remove the pathinfo from the original filename too.
    if !conn.pathinfo.is_empty() {
        let of = conn.origfilename.len();
        let pl = conn.pathinfo.len();
        if of >= pl && conn.origfilename.get(of - pl..) == Some(conn.pathinfo.as_str()) {
            if of == pl {
                conn.origfilename.clear();
            } else {
                conn.origfilename.truncate(of - pl - 1);
            }
        }
    }

    // An absolute expanded filename must still be within the tree.
    if conn.expnfilename.starts_with('/') {
        if conn.expnfilename.starts_with(&server.cwd) {
            conn.expnfilename.replace_range(..server.cwd.len(), "");
        } else if server.no_symlink_check {
            let url = conn.encodedurl.clone();
            send_err(server, conn, 404, status_title(404), "", ERR404FORM, &url);
            return Err(());
        } else {
            log::notice(&format!(
                "{} URL \"{}\" goes outside the web tree",
                conn.real_ip, conn.encodedurl
            ));
            let url = conn.encodedurl.clone();
            send_err(
                server,
                conn,
                403,
                status_title(403),
                "",
                "The requested URL '%s' resolves to a file outside the permitted web server directory tree.\n",
                &url,
            );
            return Err(());
        }
    }

    Ok(())
}

/// Case-insensitive header prefix match; returns the value with leading
/// blanks stripped.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let prefix = line.get(..name.len())?;
    if prefix.eq_ignore_ascii_case(name) {
        Some(line[name.len()..].trim_start_matches(|c| c == ' ' || c == '\t'))
    } else {
        None
    }
}

fn parse_range(conn: &mut Connection, buf: &str) {
    if buf.contains(',') {
        return;
    }
    let eq = match buf.find('=') {
        Some(eq) => eq,
        None => return,
    };
    let spec = &buf[eq + 1..];
    let dash = match spec.find('-') {
        Some(dash) if dash > 0 => dash,
        // Suffix ranges (bytes=-N) are not parsed; the whole file is sent.
        _ => return,
    };
    conn.got_range = true;
    conn.first_byte_index = atoi_prefix(&spec[..dash]);
    if spec[dash + 1..].starts_with(|c: char| c.is_ascii_digit()) {
        conn.last_byte_index = atoi_prefix(&spec[dash + 1..]);
    }
}
