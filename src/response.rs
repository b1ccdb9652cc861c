use std::fs;

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::conn::{CompressionType, Connection, Method, Server, SERVER_SOFTWARE};
use crate::url::defang;

// On-disk error pages are looked for here, vhost directory first.
const ERR_DIR: &str = "errors";

pub const ERR400FORM: &str =
    "Your request has bad syntax(%s) or is inherently impossible to satisfy.\n";
pub const ERR401FORM: &str = "Authorization required for the URL '%s'.\n";
pub const ERR403FORM: &str = "You do not have permission to get URL '%s' from this server.\n";
pub const ERR404FORM: &str = "The requested URL '%s' was not found on this server.\n";
pub const ERR500FORM: &str = "There was an unusual problem serving the requested URL '%s'.\n";
pub const ERR501FORM: &str = "The requested method '%s' is not implemented by this server.\n";
pub const ERR503FORM: &str =
    "The requested URL '%s' is temporarily overloaded.  Please try again later.\n";
pub const ERR302FORM: &str = "The actual URL is '%s'.\n";

pub fn status_title(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Request Entity Too Large",
        500 => "Internal Error",
        501 => "Not Implemented",
        503 => "Service Temporarily Overloaded",
        _ => "Something",
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub libc::time_t);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Utc.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Parse the date formats clients actually send: RFC 1123, RFC 850 and
/// asctime.  Unparsable dates are simply ignored by the callers.
pub fn parse_http_date(s: &str) -> Option<libc::time_t> {
    let s = s.trim();
    const FORMATS: &[&str] = &[
        "%a, %d %b %Y %H:%M:%S GMT",
        "%a, %d %b %Y %H:%M:%S %z",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    for fmt in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.timestamp() as libc::time_t);
        }
    }
    None
}

/// Append a string to the buffer waiting to be sent as response.
pub fn add_response(conn: &mut Connection, s: &str) {
    conn.response.extend_from_slice(s.as_bytes());
}

pub fn add_response_bytes(conn: &mut Connection, s: &[u8]) {
    conn.response.extend_from_slice(s);
}

/// Default style for generated pages.
pub fn css_default() -> &'static str {
    "  <style type=\"text/css\">\n\
     \x20   body { background-color:#f2f1f0; font-family: sans-serif;}\n\
     \x20   h2 { border-bottom: 1px solid #f2f1f0; font-weight: normal;}\n\
     \x20   address { border-top: 1px solid #f2f1f0; margin-top: 1em; padding-top: 5px; color:#c8c5c2; }\n\
     \x20   table { table-layout: fixed; border-collapse: collapse;}\n\
     \x20   table tr td { text-align: left; padding: 0 5px 0 0px; }\n\
     \x20   table tr th { text-align: left; padding: 0 5px 0 0px; }\n\
     \x20   table tr td.right { text-align: right; padding-right: 20px; }\n\
     \x20   #wrapper {\n\
     \x20    background-color:white; width:1024px;\n\
     \x20    padding:1.5em; margin:4em auto; position:absolute;\n\
     \x20    top:0; left:0; right:0;\n\
     \x20    border-radius: 10px; border: 1px solid #c8c5c2;\n\
     \x20   }\n\
     \x20 </style>\n"
}

pub fn get_hostname(server: &Server, conn: &Connection) -> String {
    if server.vhost {
        if let Some(hostname) = &conn.hostname {
            return hostname.clone();
        }
    }
    server.hostname.clone().unwrap_or_default()
}

/// Compose the status line and standard headers into the response buffer.
/// Elects a 206 when a usable range survives the If-Range check.
pub fn send_mime(
    server: &Server,
    conn: &mut Connection,
    status: u16,
    title: &str,
    encodings: &str,
    extraheads: &str,
    mtype: &str,
    length: i64,
    modified: libc::time_t,
) {
    let mut status = status;
    let mut title = title;

    if status != 200 {
        conn.compression = CompressionType::None;
    }
    conn.status = status;
    conn.bytes_to_send = length;

    if !conn.mime_flag {
        return;
    }

    let partial = status == 200
        && conn.got_range
        && conn.last_byte_index >= conn.first_byte_index
        && (conn.last_byte_index != length - 1 || conn.first_byte_index != 0)
        && conn.range_if.map_or(true, |t| t == modified);
    if partial {
        status = 206;
        conn.status = 206;
        title = status_title(206);
        conn.compression = CompressionType::None;
    } else {
        conn.got_range = false;
    }

    let now = server.now;
    let modified = if modified == 0 { now } else { modified };
    let fixed_type = mtype.replace("%s", &server.charset);
    let protocol = if conn.protocol.is_empty() {
        "HTTP/1.0"
    } else if conn.protocol.len() > 20 {
        conn.protocol.get(..20).unwrap_or("HTTP/1.0")
    } else {
        conn.protocol.as_str()
    };

    let buf = format!(
        "{} {} {}\r\n\
         Date: {}\r\n\
         Server: {}\r\n\
         Last-Modified: {}\r\n\
         Accept-Ranges: bytes\r\n",
        protocol,
        status,
        title,
        HttpDate(now),
        SERVER_SOFTWARE,
        HttpDate(modified),
    );
    add_response(conn, &buf);

    if partial {
        let buf = format!(
            "Content-Range: bytes {}-{}/{}\r\n\
             Content-Length: {}\r\n",
            conn.first_byte_index,
            conn.last_byte_index,
            length,
            conn.last_byte_index - conn.first_byte_index + 1,
        );
        add_response(conn, &buf);
    } else if length >= 0 {
        // No Content-Length on content we deflate; the length isn't known
        // until the stream ends.
        if conn.compression == CompressionType::None {
            add_response(conn, &format!("Content-Length: {}\r\n", length));
        }
    } else {
        // Unknown length means the client finds the end by EOF.
        conn.do_keep_alive = false;
    }

    add_response(conn, &format!("Content-Type: {}\r\n", fixed_type));

    let gz = conn.compression == CompressionType::Gzip;
    if !encodings.is_empty() {
        let addgz = gz && !encodings.contains("gzip");
        add_response(
            conn,
            &format!(
                "Content-Encoding: {}{}\r\n",
                encodings,
                if addgz { ", gzip" } else { "" }
            ),
        );
    } else if gz {
        add_response(conn, "Content-Encoding: gzip\r\n");
    }

    let s100 = status / 100;
    if s100 != 2 && s100 != 3 {
        add_response(conn, "Cache-Control: no-cache,no-store\r\n");
    }

    if let Some(max_age) = server.max_age {
        let etag = conn
            .file
            .bytes()
            .map(|bytes| format!("ETag: \"{:x}\"\r\n", md5::compute(bytes)))
            .unwrap_or_default();
        add_response(conn, &format!("Cache-Control: max-age={}\r\n{}", max_age, etag));
    }

    if conn.do_keep_alive {
        add_response(conn, "Connection: keep-alive\r\n");
    } else {
        add_response(conn, "Connection: close\r\n");
    }

    if !extraheads.is_empty() {
        add_response(conn, extraheads);
    }
    add_response(conn, "\r\n");
}

fn send_response_tail(server: &Server, conn: &mut Connection) {
    let buf = format!(
        " <address>{} httpd at {} port {}</address>\n\
         </div>\n\
         </body>\n\
         </html>\n",
        SERVER_SOFTWARE,
        get_hostname(server, conn),
        server.port,
    );
    add_response(conn, &buf);
}

/// Built-in HTML error/redirect page.
pub fn send_response(
    server: &Server,
    conn: &mut Connection,
    status: u16,
    title: &str,
    extraheads: &str,
    form: &str,
    arg: &str,
) {
    send_mime(
        server,
        conn,
        status,
        title,
        "",
        extraheads,
        "text/html; charset=%s",
        -1,
        0,
    );
    let buf = format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         \x20<head>\n\
         \x20 <title>{} {}</title>\n\
         \x20 <link rel=\"icon\" type=\"image/x-icon\" href=\"/icons/favicon.ico\">\n\
         {}\
         \x20</head>\n\
         \x20<body>\n\
         <div id=\"wrapper\" tabindex=\"-1\">\n\
         <h2>{} {}</h2>\n\
         <p>\n",
        status,
        title,
        css_default(),
        status,
        title,
    );
    add_response(conn, &buf);
    let defanged = defang(arg, 1000);
    add_response(conn, &form.replace("%s", &defanged));
    add_response(conn, "</p>");
    send_response_tail(server, conn);
}

fn send_err_file(
    server: &Server,
    conn: &mut Connection,
    status: u16,
    title: &str,
    extraheads: &str,
    filename: &str,
) -> bool {
    let contents = match fs::read(filename) {
        Ok(contents) => contents,
        Err(_) => return false,
    };
    send_mime(
        server,
        conn,
        status,
        title,
        "",
        extraheads,
        "text/html; charset=%s",
        -1,
        0,
    );
    add_response_bytes(conn, &contents);
    true
}

/// Error reply: an on-disk err<code>.html page (vhost-specific first, then
/// server-wide) replaces the built-in body when present.
pub fn send_err(
    server: &Server,
    conn: &mut Connection,
    status: u16,
    title: &str,
    extraheads: &str,
    form: &str,
    arg: &str,
) {
    if server.vhost && !conn.hostdir.is_empty() {
        let filename = format!("{}/{}/err{}.html", conn.hostdir, ERR_DIR, status);
        if send_err_file(server, conn, status, title, extraheads, &filename) {
            return;
        }
    }

    let filename = format!("{}/err{}.html", ERR_DIR, status);
    if send_err_file(server, conn, status, title, extraheads, &filename) {
        return;
    }

    send_response(server, conn, status, title, extraheads, form, arg);
}

/// Directory URLs that lack their trailing slash get an explicit redirect;
/// many clients can't build relative URLs without it.
pub fn send_dirredirect(server: &Server, conn: &mut Connection) {
    let location = if !conn.query.is_empty() {
        let base = conn.encodedurl.split('?').next().unwrap_or("");
        format!("{}/?{}", base, conn.query)
    } else {
        format!("{}/", conn.encodedurl)
    };
    let header = format!("Location: {}\r\n", location);
    send_response(server, conn, 302, status_title(302), &header, ERR302FORM, &location);
}

pub fn send_authenticate(server: &Server, conn: &mut Connection, realm: &str) {
    let header = format!("WWW-Authenticate: Basic realm=\"{}\"\r\n", realm);
    let url = conn.encodedurl.clone();
    send_err(server, conn, 401, status_title(401), &header, ERR401FORM, &url);
    // A rejected POST may still have body bytes in flight; drain them
    // before closing or the client sees a reset.
    if conn.method == Method::Post || conn.method == Method::Put {
        conn.should_linger = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::conn::{BodySource, FileStat};

    fn test_conn() -> Connection {
        let mut conn = Connection::new(None, "127.0.0.1".parse().unwrap(), 0);
        conn.protocol = "HTTP/1.1".to_string();
        conn
    }

    fn response_str(conn: &Connection) -> String {
        String::from_utf8_lossy(&conn.response).into_owned()
    }

    #[test]
    fn http_date_works() {
        assert_eq!(
            HttpDate(1622040683).to_string(),
            "Wed, 26 May 2021 14:51:23 GMT"
        );
    }

    #[test]
    fn parse_http_date_works() {
        let t = parse_http_date("Wed, 26 May 2021 14:51:23 GMT");
        assert_eq!(t, Some(1622040683));
        assert_eq!(parse_http_date(" Wed, 26 May 2021 14:51:23 GMT"), t);
        assert_eq!(parse_http_date("not a date"), None);
    }

    #[test]
    fn parse_http_date_roundtrips() {
        let stamp = 1622040683;
        assert_eq!(parse_http_date(&HttpDate(stamp).to_string()), Some(stamp));
    }

    #[test]
    fn plain_200_headers() {
        let mut server = Server::new();
        server.now = 1622040683;
        let mut conn = test_conn();
        conn.do_keep_alive = true;
        send_mime(&server, &mut conn, 200, "OK", "", "", "text/html; charset=%s", 10, 1000);
        let out = response_str(&conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Date: Wed, 26 May 2021 14:51:23 GMT\r\n"));
        assert!(out.contains("Content-Length: 10\r\n"));
        assert!(out.contains("Content-Type: text/html; charset=UTF-8\r\n"));
        assert!(out.contains("Accept-Ranges: bytes\r\n"));
        assert!(out.contains("Connection: keep-alive\r\n"));
        assert!(!out.contains("Cache-Control"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn range_elects_206() {
        let server = Server::new();
        let mut conn = test_conn();
        conn.got_range = true;
        conn.first_byte_index = 0;
        conn.last_byte_index = 4;
        send_mime(&server, &mut conn, 200, "OK", "", "", "text/plain; charset=%s", 100, 1000);
        let out = response_str(&conn);
        assert_eq!(conn.status, 206);
        assert!(out.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(out.contains("Content-Range: bytes 0-4/100\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        // invariant: length == last - first + 1 and bounds hold
        assert!(conn.first_byte_index <= conn.last_byte_index);
        assert!(conn.last_byte_index < 100);
    }

    #[test]
    fn full_range_is_plain_200() {
        let server = Server::new();
        let mut conn = test_conn();
        conn.got_range = true;
        conn.first_byte_index = 0;
        conn.last_byte_index = 99;
        send_mime(&server, &mut conn, 200, "OK", "", "", "text/plain; charset=%s", 100, 1000);
        assert_eq!(conn.status, 200);
        assert!(!conn.got_range, "range must be cleared when not partial");
    }

    #[test]
    fn if_range_mismatch_disables_206() {
        let server = Server::new();
        let mut conn = test_conn();
        conn.got_range = true;
        conn.first_byte_index = 0;
        conn.last_byte_index = 4;
        conn.range_if = Some(555);
        send_mime(&server, &mut conn, 200, "OK", "", "", "text/plain; charset=%s", 100, 1000);
        assert_eq!(conn.status, 200);
        assert!(!conn.got_range);
    }

    #[test]
    fn error_status_gets_no_cache() {
        let server = Server::new();
        let mut conn = test_conn();
        send_mime(&server, &mut conn, 404, "Not Found", "", "", "text/html; charset=%s", -1, 0);
        let out = response_str(&conn);
        assert!(out.contains("Cache-Control: no-cache,no-store\r\n"));
        assert!(out.contains("Connection: close\r\n"));
    }

    #[test]
    fn etag_comes_with_max_age() {
        let mut server = Server::new();
        server.max_age = Some(60);
        let mut conn = test_conn();
        conn.file = BodySource::Builtin(b"hello");
        send_mime(&server, &mut conn, 200, "OK", "", "", "text/plain; charset=%s", 5, 1000);
        let out = response_str(&conn);
        assert!(out.contains("Cache-Control: max-age=60\r\n"));
        let expected = format!("ETag: \"{:x}\"\r\n", md5::compute(b"hello"));
        assert!(out.contains(&expected));
    }

    #[test]
    fn gzip_omits_content_length() {
        let server = Server::new();
        let mut conn = test_conn();
        conn.compression = CompressionType::Gzip;
        send_mime(&server, &mut conn, 200, "OK", "", "", "text/html; charset=%s", 1000, 1000);
        let out = response_str(&conn);
        assert!(!out.contains("Content-Length"));
        assert!(out.contains("Content-Encoding: gzip\r\n"));
    }

    #[test]
    fn intrinsic_encodings_are_composed() {
        let server = Server::new();
        let mut conn = test_conn();
        conn.compression = CompressionType::Gzip;
        send_mime(
            &server,
            &mut conn,
            200,
            "OK",
            "x-uuencode",
            "",
            "text/plain; charset=%s",
            1000,
            1000,
        );
        let out = response_str(&conn);
        assert!(out.contains("Content-Encoding: x-uuencode, gzip\r\n"));
    }

    #[test]
    fn http09_sends_no_headers() {
        let server = Server::new();
        let mut conn = test_conn();
        conn.mime_flag = false;
        send_mime(&server, &mut conn, 200, "OK", "", "", "text/plain; charset=%s", 10, 0);
        assert!(conn.response.is_empty());
        assert_eq!(conn.status, 200);
    }

    #[test]
    fn dirredirect_preserves_query() {
        let server = Server::new();
        let mut conn = test_conn();
        conn.encodedurl = "/dir?a=1".to_string();
        conn.query = "a=1".to_string();
        send_dirredirect(&server, &mut conn);
        let out = response_str(&conn);
        assert!(out.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(out.contains("Location: /dir/?a=1\r\n"));
    }

    #[test]
    fn authenticate_sets_linger_for_post() {
        let server = Server::new();
        let mut conn = test_conn();
        conn.method = Method::Post;
        conn.encodedurl = "/secret".to_string();
        send_authenticate(&server, &mut conn, "secret");
        let out = response_str(&conn);
        assert!(out.contains("WWW-Authenticate: Basic realm=\"secret\"\r\n"));
        assert!(conn.should_linger);
    }

    #[test]
    fn defanged_error_body() {
        let server = Server::new();
        let mut conn = test_conn();
        send_err(
            &server,
            &mut conn,
            404,
            "Not Found",
            "",
            ERR404FORM,
            "/<script>alert(1)</script>",
        );
        let out = response_str(&conn);
        assert!(!out.contains("<script>"));
        assert!(out.contains("&lt;script&gt;"));
    }

    #[test]
    fn stat_helpers() {
        let stat = FileStat {
            size: 1,
            mtime: 0,
            mode: 0o644,
            is_dir: false,
            is_reg: true,
        };
        assert!(stat.world_readable());
        assert!(!stat.world_executable());
    }
}
