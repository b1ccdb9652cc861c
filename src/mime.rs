use std::cmp::Ordering;

use once_cell::sync::Lazy;

/// The type handed back when no extension matches; "%s" is replaced with
/// the configured charset when headers are written.
pub const DEFAULT_TYPE: &str = "text/plain; charset=%s";

struct MimeEntry {
    ext: &'static str,
    val: &'static str,
}

const ENC_TAB_RAW: &[(&str, &str)] = &[
    ("Z", "compress"),
    ("gz", "gzip"),
    ("uu", "x-uuencode"),
];

const TYP_TAB_RAW: &[(&str, &str)] = &[
    ("a", "application/octet-stream"),
    ("aac", "audio/aac"),
    ("ai", "application/postscript"),
    ("aif", "audio/x-aiff"),
    ("aiff", "audio/x-aiff"),
    ("asc", "text/plain; charset=%s"),
    ("au", "audio/basic"),
    ("avi", "video/x-msvideo"),
    ("bin", "application/octet-stream"),
    ("bmp", "image/bmp"),
    ("bz2", "application/x-bzip2"),
    ("c", "text/plain; charset=%s"),
    ("cpio", "application/x-cpio"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("doc", "application/msword"),
    ("dtd", "application/xml-dtd"),
    ("dvi", "application/x-dvi"),
    ("eps", "application/postscript"),
    ("flac", "audio/flac"),
    ("gif", "image/gif"),
    ("h", "text/plain; charset=%s"),
    ("htm", "text/html; charset=%s"),
    ("html", "text/html; charset=%s"),
    ("ico", "image/x-icon"),
    ("jar", "application/java-archive"),
    ("jpe", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("latex", "application/x-latex"),
    ("m3u", "audio/x-mpegurl"),
    ("md", "text/plain; charset=%s"),
    ("mid", "audio/midi"),
    ("midi", "audio/midi"),
    ("mov", "video/quicktime"),
    ("mp2", "audio/mpeg"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("mpe", "video/mpeg"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("mpga", "audio/mpeg"),
    ("oga", "audio/ogg"),
    ("ogg", "application/ogg"),
    ("ogv", "video/ogg"),
    ("pbm", "image/x-portable-bitmap"),
    ("pdf", "application/pdf"),
    ("pgm", "image/x-portable-graymap"),
    ("png", "image/png"),
    ("pnm", "image/x-portable-anymap"),
    ("ppm", "image/x-portable-pixmap"),
    ("ps", "application/postscript"),
    ("qt", "video/quicktime"),
    ("ra", "audio/x-realaudio"),
    ("ram", "audio/x-pn-realaudio"),
    ("rss", "application/rss+xml"),
    ("rtf", "text/rtf"),
    ("sh", "text/plain; charset=%s"),
    ("shar", "application/x-shar"),
    ("snd", "audio/basic"),
    ("svg", "image/svg+xml"),
    ("tar", "application/x-tar"),
    ("tcl", "application/x-tcl"),
    ("tex", "application/x-tex"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("txt", "text/plain; charset=%s"),
    ("wasm", "application/wasm"),
    ("wav", "audio/x-wav"),
    ("webm", "video/webm"),
    ("webp", "image/webp"),
    ("xbm", "image/x-xbitmap"),
    ("xht", "application/xhtml+xml"),
    ("xhtml", "application/xhtml+xml"),
    ("xml", "application/xml"),
    ("xpm", "image/x-xpixmap"),
    ("xsl", "application/xml"),
    ("xslt", "application/xslt+xml"),
    ("xwd", "image/x-xwindowdump"),
    ("zip", "application/zip"),
];

fn sorted(raw: &'static [(&'static str, &'static str)]) -> Vec<MimeEntry> {
    let mut tab: Vec<MimeEntry> = raw
        .iter()
        .map(|&(ext, val)| MimeEntry { ext, val })
        .collect();
    tab.sort_by(|a, b| a.ext.cmp(b.ext));
    tab
}

// Sorted once so type lookups can binary search.
static ENC_TAB: Lazy<Vec<MimeEntry>> = Lazy::new(|| sorted(ENC_TAB_RAW));
static TYP_TAB: Lazy<Vec<MimeEntry>> = Lazy::new(|| sorted(TYP_TAB_RAW));

/// Case-insensitive comparison of `ext` against the first `ext.len()` bytes
/// of `entry`, with a shorter entry ordering low.
fn cmp_prefix(ext: &str, entry: &str) -> Ordering {
    let ext = ext.as_bytes();
    let entry = entry.as_bytes();
    for i in 0..ext.len() {
        let a = ext[i].to_ascii_lowercase();
        let b = entry.get(i).map(|c| c.to_ascii_lowercase()).unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Binary search the type table; prefix ties break on extension length so
/// only an exact-length match wins.
fn type_lookup(ext: &str) -> Option<&'static str> {
    let tab = &*TYP_TAB;
    let mut bot = 0i32;
    let mut top = tab.len() as i32 - 1;
    while top >= bot {
        let mid = ((top + bot) / 2) as usize;
        match cmp_prefix(ext, tab[mid].ext) {
            Ordering::Less => top = mid as i32 - 1,
            Ordering::Greater => bot = mid as i32 + 1,
            Ordering::Equal => {
                if ext.len() < tab[mid].ext.len() {
                    top = mid as i32 - 1;
                } else if ext.len() > tab[mid].ext.len() {
                    bot = mid as i32 + 1;
                } else {
                    return Some(tab[mid].val);
                }
            }
        }
    }
    None
}

/// Linear search is fine here, there are only a few entries.
fn enc_lookup(ext: &str) -> Option<&'static str> {
    ENC_TAB
        .iter()
        .find(|e| e.ext.len() == ext.len() && e.ext.eq_ignore_ascii_case(ext))
        .map(|e| e.val)
}

/// Figure out MIME encodings and type based on the filename.  Extensions
/// are peeled from the right; the first type hit ends the scan.  Multiple
/// encodings are comma separated, listed in the order they were applied to
/// the file.
pub fn figure_mime(filename: &str) -> (&'static str, String) {
    let bytes = filename.as_bytes();
    let mut mtype = DEFAULT_TYPE;
    let mut applied: Vec<&'static str> = Vec::new();

    let mut prev_dot = bytes.len();
    loop {
        let dot = match bytes[..prev_dot].iter().rposition(|&c| c == b'.') {
            Some(dot) => dot,
            None => break,
        };
        let ext = &filename[dot + 1..prev_dot];
        if let Some(val) = enc_lookup(ext) {
            applied.push(val);
        }
        if let Some(val) = type_lookup(ext) {
            mtype = val;
            break;
        }
        prev_dot = dot;
    }

    let mut encodings = String::new();
    for val in applied.iter().rev() {
        if !encodings.is_empty() {
            encodings.push(',');
        }
        encodings.push_str(val);
    }
    (mtype, encodings)
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("index.html", "text/html; charset=%s", "" ; "html")]
    #[test_case("logo.PNG", "image/png", "" ; "case insensitive")]
    #[test_case("archive.tar.gz", "application/x-tar", "gzip" ; "gzipped tar")]
    #[test_case("notes.txt.uu.gz", "text/plain; charset=%s", "x-uuencode,gzip" ; "stacked encodings")]
    #[test_case("README", "text/plain; charset=%s", "" ; "no extension")]
    #[test_case("backup.html.bak", "text/html; charset=%s", "" ; "unknown outer extension peels")]
    #[test_case("data.gz", "text/plain; charset=%s", "gzip" ; "bare gz")]
    #[test_case("trailing.", "text/plain; charset=%s", "" ; "trailing dot")]
    fn figure_mime_works(filename: &str, mtype: &str, encodings: &str) {
        assert_eq!(figure_mime(filename), (mtype, encodings.to_string()));
    }

    #[test]
    fn binary_search_agrees_with_linear_scan() {
        let linear = |ext: &str| {
            TYP_TAB
                .iter()
                .find(|e| e.ext.len() == ext.len() && e.ext.eq_ignore_ascii_case(ext))
                .map(|e| e.val)
        };
        for entry in TYP_TAB.iter() {
            assert_eq!(type_lookup(entry.ext), linear(entry.ext), "{}", entry.ext);
            let upper = entry.ext.to_ascii_uppercase();
            assert_eq!(type_lookup(&upper), linear(&upper), "{}", upper);
        }
        for miss in &["", "zzz", "ht", "htmlx", "q", "jpgx", "x"] {
            assert_eq!(type_lookup(miss), linear(miss), "{}", miss);
        }
    }
}
