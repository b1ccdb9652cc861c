use std::fs;

use chrono::{Local, TimeZone};

use crate::auth::{ACCESS_FILE, AUTH_FILE};
use crate::conn::{CompressionType, Connection, FileStat, Method, Server, SERVER_SOFTWARE};
use crate::log;
use crate::response::{
    add_response, css_default, get_hostname, send_err, send_mime, status_title, ERR404FORM,
    ERR501FORM,
};
use crate::url::{defang, strencode};

/// Convert byte size to decimal k/M/G/T/P form.
fn humane_size(stat: &FileStat) -> String {
    if stat.is_dir {
        return "  - ".to_string();
    }
    let mult = ["", "k", "M", "G", "T", "P"];
    let mut bytes = stat.size;
    let mut i = 0;
    while bytes > 1000 && i < mult.len() - 1 {
        bytes /= 1000;
        i += 1;
    }
    format!("  {}{}", bytes, mult[i])
}

fn is_reserved_htfile(name: &str) -> bool {
    name == AUTH_FILE || name == ACCESS_FILE
}

struct Entry {
    name: String,
    stat: FileStat,
}

/// Collect the listable names: no dot/dotdot, no unreadable entries.
fn read_names(conn: &Connection) -> std::io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for dirent in fs::read_dir(&conn.expnfilename)? {
        let dirent = match dirent {
            Ok(dirent) => dirent,
            Err(_) => continue,
        };
        let name = dirent.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        let stat = match dirent.path().metadata() {
            Ok(md) => FileStat::from_metadata(&md),
            Err(_) => continue,
        };
        if !stat.world_accessible() {
            continue;
        }
        entries.push(Entry { name, stat });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn emit_row(body: &mut String, conn: &Connection, entry: &Entry) {
    let rname = if conn.origfilename.is_empty() || conn.origfilename == "." {
        entry.name.clone()
    } else {
        format!("{}{}", conn.origfilename, entry.name)
    };
    let (icon, alt) = if entry.stat.is_dir {
        ("/icons/folder.gif", "&#128193;")
    } else {
        ("/icons/generic.gif", "&#128196;")
    };
    let timestr = Local
        .timestamp(entry.stat.mtime, 0)
        .format("%F&nbsp;&nbsp;%R")
        .to_string();
    body.push_str(&format!(
        " <tr>\n\
         \x20 <td class=\"icon\"><img src=\"{}\" alt=\"{}\" width=\"20\" height=\"22\"></td>\n\
         \x20 <td><a href=\"/{}{}\">{}</a></td>\n\
         \x20 <td class=\"right\">{}</td>\n\
         \x20 <td>{}</td>\n\
         \x20</tr>\n",
        icon,
        alt,
        strencode(&rname),
        if entry.stat.is_dir { "/" } else { "" },
        defang(&entry.name, 256),
        humane_size(&entry.stat),
        timestr,
    ));
}

/// Generate an HTML index for the directory in `expnfilename` into the
/// response buffer: directories first, then files, both alphabetic.
pub fn ls(server: &Server, conn: &mut Connection) -> Result<(), ()> {
    conn.compression = CompressionType::None;
    conn.got_range = false;

    let entries = match read_names(conn) {
        Ok(entries) => entries,
        Err(e) => {
            log::error(&format!("opendir {}: {}", conn.expnfilename, e));
            let url = conn.encodedurl.clone();
            send_err(server, conn, 404, status_title(404), "", ERR404FORM, &url);
            return Err(());
        }
    };

    match conn.method {
        Method::Head => {
            let mtime = conn.sb.mtime;
            send_mime(
                server,
                conn,
                200,
                status_title(200),
                "",
                "",
                "text/html; charset=%s",
                -1,
                mtime,
            );
            return Ok(());
        }
        Method::Get => {}
        method => {
            send_err(
                server,
                conn,
                501,
                status_title(501),
                "",
                ERR501FORM,
                method.as_str(),
            );
            return Err(());
        }
    }

    let hostname = get_hostname(server, conn);
    let mut body = format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         \x20<head>\n\
         \x20 <title>Index of http://{}{}</title>\n\
         \x20 <link rel=\"icon\" type=\"image/x-icon\" href=\"/icons/favicon.ico\">\n\
         {}\
         \x20</head>\n\
         \x20<body>\n\
         <div id=\"wrapper\" tabindex=\"-1\">\n\
         <h2>Index of http://{}{}</h2>\n\
         <div id=\"table\">\
         <table width=\"100%\">\n\
         \x20<tr>\
         \x20 <th class=\"icon\" style=\"width:20px;\"><img src=\"/icons/blank.gif\" alt=\"&#8195;\" width=\"20\" height=\"22\"></th>\n\
         \x20 <th style=\"width:35em;\">Name</th>\n\
         \x20 <th class=\"right\" style=\"width: 3em;\">Size</th>\n\
         \x20 <th style=\"width: 7em;\">Last modified</th>\n\
         \x20</tr>\n",
        hostname, conn.encodedurl, css_default(), hostname, conn.encodedurl,
    );

    // Parent link, except at the top.
    if conn.encodedurl != "/" {
        body.push_str(
            " <tr>\n\
             \x20 <td class=\"icon\"><img src=\"/icons/back.gif\" alt=\"&#8617;\" width=\"20\" height=\"22\"></td>\n\
             \x20 <td><a href=\"..\">Parent Directory</a></td>\n\
             \x20 <td class=\"right\">&nbsp;</td>\n\
             \x20 <td>&nbsp;</td>\n\
             \x20</tr>\n",
        );
    }

    // Directories first, then everything else.
    for pass_dirs in &[true, false] {
        for entry in &entries {
            if entry.stat.is_dir != *pass_dirs {
                continue;
            }
            // Dotfiles are hidden unless enabled; short names like ".x"
            // always show.
            if !server.list_dotfiles && entry.name.starts_with('.') && entry.name.len() > 2 {
                continue;
            }
            if is_reserved_htfile(&entry.name) {
                continue;
            }
            emit_row(&mut body, conn, entry);
        }
    }

    body.push_str(" </table></div>\n");
    body.push_str(&format!(
        " <address>{} httpd at {} port {}</address>\n",
        SERVER_SOFTWARE, hostname, server.port
    ));
    body.push_str("</div></body>\n</html>\n");

    let mtime = conn.sb.mtime;
    send_mime(
        server,
        conn,
        200,
        status_title(200),
        "",
        "",
        "text/html; charset=%s",
        body.len() as i64,
        mtime,
    );
    add_response(conn, &body);
    Ok(())
}
