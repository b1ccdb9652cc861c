use std::fs;

use crate::log;

// Symlink chains longer than this are treated as hostile.
const MAX_LINKS: usize = 32;

/// Expands all symlinks in the given filename one component at a time,
/// eliding `..`s and leading slashes so the result can never climb above
/// the starting directory.  Returns the expanded path plus any trailing
/// path components that do not exist (the CGI PATH_INFO), or `None` on
/// errors worth a 500.
///
/// With `no_symlink_check` a single stat of the whole path short-circuits
/// the walk; chrooted servers cannot escape the tree anyway and only the
/// pathinfo split is still needed.  `tildemapped` paths keep their leading
/// slash, they point at an already-vetted directory.
pub fn expand_symlinks(
    path: &str,
    no_symlink_check: bool,
    tildemapped: bool,
) -> Option<(String, String)> {
    if no_symlink_check && fs::metadata(path).is_ok() {
        let mut checked = path.to_string();
        while checked.ends_with('/') {
            checked.pop();
        }
        return Some((checked, String::new()));
    }

    // Start out with nothing in checked and the whole filename in rest.
    let mut checked = String::new();
    let mut rest = path.to_string();
    if !tildemapped {
        while rest.starts_with('/') {
            rest.remove(0);
        }
    }

    let mut r = 0;
    let mut nlinks = 0;

    // While there are still components to check...
    while rest.len() - r > 0 {
        // Save the positions in case this component is a symlink or does
        // not exist.
        let prev_checked_len = checked.len();
        let prev_r = r;

        // Grab one component from rest and transfer it to checked.
        match rest[r..].find('/') {
            Some(0) => {
                // Special case for absolute paths.
                checked.push('/');
                r += 1;
            }
            Some(i) => {
                let comp = &rest[r..r + i];
                if comp == ".." {
                    pop_component(&mut checked);
                } else {
                    if !checked.is_empty() && !checked.ends_with('/') {
                        checked.push('/');
                    }
                    checked.push_str(comp);
                }
                r += i + 1;
            }
            None => {
                let comp = &rest[r..];
                if comp == ".." {
                    pop_component(&mut checked);
                } else {
                    if !checked.is_empty() && !checked.ends_with('/') {
                        checked.push('/');
                    }
                    checked.push_str(comp);
                }
                r = rest.len();
            }
        }

        if checked.is_empty() {
            continue;
        }

        // Try reading the current prefix as a symlink.
        let target = match fs::read_link(&checked) {
            Ok(target) => target,
            Err(e) => match e.raw_os_error() {
                Some(libc::EINVAL) => continue, // not a symlink
                Some(libc::EACCES) | Some(libc::ENOENT) | Some(libc::ENOTDIR) => {
                    // That last component was bogus.  Restore and return
                    // the unresolved tail as the trailer.
                    let trailer = rest[prev_r..].to_string();
                    if prev_checked_len == 0 {
                        checked = ".".to_string();
                    } else {
                        checked.truncate(prev_checked_len);
                    }
                    return Some((checked, trailer));
                }
                _ => {
                    log::error(&format!("readlink {}: {}", checked, e));
                    return None;
                }
            },
        };

        nlinks += 1;
        if nlinks > MAX_LINKS {
            log::error(&format!("too many symlinks in {}", path));
            return None;
        }

        let mut link = target.to_string_lossy().into_owned();
        if link.ends_with('/') {
            link.pop();
        }

        // Insert the link contents in front of the rest of the filename.
        if r < rest.len() {
            rest = format!("{}/{}", link, &rest[r..]);
        } else {
            rest = link;
        }
        r = 0;

        if rest.starts_with('/') {
            // An absolute symlink - start checking over.
            checked.clear();
        } else {
            // Re-check this component.
            checked.truncate(prev_checked_len);
        }
    }

    if checked.is_empty() {
        checked = ".".to_string();
    }
    Some((checked, rest[r..].to_string()))
}

/// `..` may never reduce checked below empty.
fn pop_component(checked: &mut String) {
    if checked.is_empty() {
        return;
    }
    match checked.rfind('/') {
        None => checked.clear(),
        Some(0) => checked.truncate(1),
        Some(pos) => checked.truncate(pos),
    }
}
