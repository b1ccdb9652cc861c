use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;

use crate::conn::{Connection, Server};
use crate::log;
use crate::response::{send_authenticate, send_err, status_title, ERR403FORM};

pub const AUTH_FILE: &str = ".htpasswd";
pub const ACCESS_FILE: &str = ".htaccess";

/// Walk up from `dir` towards `topdir` and return the first directory that
/// holds `htfile`.  The top directory itself is probed last.
fn find_htfile_dir(topdir: &str, dir: &str, htfile: &str) -> Option<String> {
    let mut d = if dir.is_empty() {
        ".".to_string()
    } else {
        dir.to_string()
    };
    loop {
        let candidate = format!("{}/{}", d, htfile);
        if fs::symlink_metadata(&candidate).is_ok() {
            return Some(d);
        }
        if d == topdir {
            return None;
        }
        match d.rfind('/') {
            Some(pos) => d.truncate(pos),
            None => d = topdir.to_string(),
        }
    }
}

fn topdir(server: &Server, conn: &Connection) -> String {
    if server.vhost && !conn.hostdir.is_empty() {
        conn.hostdir.clone()
    } else {
        ".".to_string()
    }
}

fn containing_dir(conn: &Connection) -> String {
    match conn.expnfilename.rfind('/') {
        Some(pos) => conn.expnfilename[..pos].to_string(),
        None => ".".to_string(),
    }
}

/// Address-based access control.  Returns -1 when the request was refused
/// (a response has been queued), 0 when no access file applies, 1 when a
/// rule explicitly allowed the client.
pub fn access_check(server: &Server, conn: &mut Connection, dir: Option<&str>) -> i32 {
    let dir = match dir {
        Some(dir) => dir.to_string(),
        None => {
            if conn.expnfilename.contains(ACCESS_FILE) {
                log::notice(&format!(
                    "{} URL \"{}\" tried to retrieve access file",
                    conn.real_ip, conn.encodedurl
                ));
                let url = conn.encodedurl.clone();
                send_err(server, conn, 403, status_title(403), "", ERR403FORM, &url);
                return -1;
            }
            containing_dir(conn)
        }
    };

    let topdir = topdir(server, conn);

    if server.global_passwd {
        let rc = access_check2(server, conn, &topdir);
        if rc != 0 {
            return rc;
        }
    }

    match find_htfile_dir(&topdir, &dir, ACCESS_FILE) {
        Some(found) => access_check2(server, conn, &found),
        None => 0,
    }
}

fn denied_by_access_file(server: &Server, conn: &mut Connection, detail: &str) -> i32 {
    let url = conn.encodedurl.clone();
    send_err(
        server,
        conn,
        403,
        status_title(403),
        "",
        &format!(
            "The requested URL '%s' is protected by an {}.\n",
            detail
        ),
        &url,
    );
    -1
}

/// Evaluate one directory's access file.  allow lines accept immediately;
/// deny lines fall through and the end of the file denies.
fn access_check2(server: &Server, conn: &mut Connection, dir: &str) -> i32 {
    let accesspath = format!("{}/{}", dir, ACCESS_FILE);

    // Does this directory have an access file?
    if fs::symlink_metadata(&accesspath).is_err() {
        // Nope, let the request go through.
        return 0;
    }

    let file = match File::open(&accesspath) {
        Ok(file) => file,
        Err(e) => {
            // The file exists but we can't open it?  Disallow access.
            log::error(&format!(
                "{} access file {} could not be opened: {}",
                conn.real_ip, accesspath, e
            ));
            return denied_by_access_file(server, conn, "access file");
        }
    };

    let client = conn.client_v4();
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let (rule, addrspec) = match parse_access_line(&line) {
            Some(parts) => parts,
            None => {
                log::error(&format!(
                    "{} access file {}: invalid line: {}",
                    conn.real_ip, accesspath, line
                ));
                return denied_by_access_file(server, conn, "access file");
            }
        };
        let (addr, mask) = addrspec;

        if let Some(client) = client {
            if u32::from(client) & mask == addr & mask {
                match rule {
                    AccessRule::Deny => {} // keep scanning
                    AccessRule::Allow => return 1,
                }
            }
        }
    }

    denied_by_access_file(server, conn, "address restriction")
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AccessRule {
    Allow,
    Deny,
}

/// Lines look like `(allow|deny)[ \t]+<IPv4>[/<masklen|netmask>]`.
fn parse_access_line(line: &str) -> Option<(AccessRule, (u32, u32))> {
    let rule = match line.chars().next() {
        Some('a') | Some('A') => AccessRule::Allow,
        Some('d') | Some('D') => AccessRule::Deny,
        _ => return None,
    };

    let addrspec = line
        .rfind(|c| c == ' ' || c == '\t')
        .map(|pos| &line[pos + 1..])?;
    if addrspec.is_empty() {
        return None;
    }

    let (addr, mask) = match addrspec.split_once('/') {
        None => (addrspec, u32::MAX),
        Some((addr, mask)) if !mask.is_empty() => {
            let maskbits = if mask.contains('.') {
                u32::from(mask.parse::<Ipv4Addr>().ok()?)
            } else {
                let len: u32 = mask.parse().ok()?;
                if len > 32 {
                    return None;
                }
                u32::MAX.checked_shl(32 - len).unwrap_or(0)
            };
            (addr, maskbits)
        }
        Some(_) => return None,
    };

    let addr = u32::from(addr.parse::<Ipv4Addr>().ok()?);
    Some((rule, (addr, mask)))
}

/// Basic authentication against a .htpasswd file.  Returns -1 when the
/// request was refused (a 401 or 403 has been queued), 0 when no auth file
/// applies, 1 when the credentials checked out.
pub fn auth_check(server: &Server, conn: &mut Connection, dir: Option<&str>) -> i32 {
    let dir = match dir {
        Some(dir) => dir.to_string(),
        None => {
            if conn.expnfilename.contains(AUTH_FILE) {
                log::notice(&format!(
                    "{} URL \"{}\" tried to retrieve auth file",
                    conn.real_ip, conn.encodedurl
                ));
                let url = conn.encodedurl.clone();
                send_err(server, conn, 403, status_title(403), "", ERR403FORM, &url);
                return -1;
            }
            containing_dir(conn)
        }
    };

    let topdir = topdir(server, conn);

    if server.global_passwd {
        let rc = auth_check2(server, conn, &topdir);
        if rc != 0 {
            return rc;
        }
    }

    match find_htfile_dir(&topdir, &dir, AUTH_FILE) {
        Some(found) => auth_check2(server, conn, &found),
        None => 0,
    }
}

fn auth_check2(server: &Server, conn: &mut Connection, dir: &str) -> i32 {
    let authpath = format!("{}/{}", dir, AUTH_FILE);

    // Does this directory have an auth file?
    let mtime = match fs::symlink_metadata(&authpath) {
        Ok(md) => {
            use std::os::unix::fs::MetadataExt;
            md.mtime() as libc::time_t
        }
        // Nope, let the request go through.
        Err(_) => return 0,
    };

    // Does this request carry basic authorization info?
    if !conn.authorization.starts_with("Basic ") {
        send_authenticate(server, conn, dir);
        return -1;
    }

    let decoded = match b64_decode(conn.authorization[6..].trim()) {
        Some(decoded) => decoded,
        None => {
            send_authenticate(server, conn, dir);
            return -1;
        }
    };
    let authinfo = String::from_utf8_lossy(&decoded).into_owned();

    // Split into user and password; trailing fields are cut off.
    let (user, authpass) = match authinfo.split_once(':') {
        Some(parts) => parts,
        None => {
            send_authenticate(server, conn, dir);
            return -1;
        }
    };
    let authpass = authpass.split(':').next().unwrap_or("");

    // A matching cache entry skips the file scan.
    if !conn.prevauthpath.is_empty()
        && conn.prevauthpath == authpath
        && conn.prevmtime == mtime
        && conn.prevuser == user
    {
        if pwhash::unix::verify(authpass, &conn.prevcryp) {
            conn.remoteuser.clear();
            conn.remoteuser.push_str(user);
            return 1;
        }
        send_authenticate(server, conn, dir);
        return -1;
    }

    let file = match File::open(&authpath) {
        Ok(file) => file,
        Err(e) => {
            // The file exists but we can't open it?  Disallow access.
            log::error(&format!(
                "{} auth file {} could not be opened: {}",
                conn.real_ip, authpath, e
            ));
            let url = conn.encodedurl.clone();
            send_err(
                server,
                conn,
                403,
                status_title(403),
                "",
                "The requested URL '%s' is protected by an authentication file, but the authentication file cannot be opened.\n",
                &url,
            );
            return -1;
        }
    };

    // The last matching entry in the file wins.
    let mut cryp: Option<String> = None;
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if let Some((entry_user, entry_cryp)) = line.split_once(':') {
            if entry_user == user {
                cryp = Some(entry_cryp.to_string());
            }
        }
    }

    match cryp {
        Some(cryp) if pwhash::unix::verify(authpass, &cryp) => {
            conn.remoteuser.clear();
            conn.remoteuser.push_str(user);

            // Cache this user's info for next time.
            conn.prevmtime = mtime;
            conn.prevauthpath = authpath;
            conn.prevuser = user.to_string();
            conn.prevcryp = cryp;
            1
        }
        _ => {
            send_authenticate(server, conn, dir);
            -1
        }
    }
}

/// Decode base64, ignoring whitespace, stopping at '='.
fn b64_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut acc: u32 = 0;
    let mut nbits = 0;
    for &b in s.as_bytes() {
        let v = match b {
            b'A'..=b'Z' => b - b'A',
            b'a'..=b'z' => b - b'a' + 26,
            b'0'..=b'9' => b - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            b'=' => break,
            b' ' | b'\t' | b'\r' | b'\n' => continue,
            _ => return None,
        };
        acc = (acc << 6) | v as u32;
        nbits += 6;
        if nbits >= 8 {
            nbits -= 8;
            out.push((acc >> nbits) as u8);
        }
    }
    Some(out)
}
