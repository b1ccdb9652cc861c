use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::slice;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

/// A read-only memory map of a served file.  The connection borrows the
/// bytes for the lifetime of the response; the map is torn down when the
/// connection lets go of it.
#[derive(Debug)]
pub struct FileMap {
    addr: *mut libc::c_void,
    len: usize,
}

impl FileMap {
    pub fn open(path: &str) -> io::Result<FileMap> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(FileMap {
                addr: ptr::null_mut(),
                len: 0,
            });
        }
        let addr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|e| {
            io::Error::from_raw_os_error(e.as_errno().map(|e| e as i32).unwrap_or(libc::EIO))
        })?;
        Ok(FileMap { addr, len })
    }

    pub fn bytes(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.addr as *const u8, self.len) }
        }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            unsafe { munmap(self.addr, self.len) }.ok();
        }
    }
}

// Minimal 1x1 transparent GIF, enough for listing decoration when no
// icons/ directory exists on disk.
const BUILTIN_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

const BUILTIN_ICONS: &[&str] = &[
    "icons/blank.gif",
    "icons/back.gif",
    "icons/folder.gif",
    "icons/generic.gif",
    "icons/favicon.ico",
];

/// The built-in icons are consulted only for paths that did not resolve on
/// disk, so a real icons/ directory always wins.
pub fn icon_check(pathinfo: &str) -> Option<&'static [u8]> {
    if BUILTIN_ICONS.contains(&pathinfo) {
        Some(BUILTIN_GIF)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    use tempfile::tempdir;

    #[test]
    fn file_map_reads_contents() {
        let root = tempdir().unwrap();
        let path = root.path().join("data.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"mapped contents").unwrap();
        drop(file);

        let map = FileMap::open(path.to_str().unwrap()).unwrap();
        assert_eq!(map.bytes(), b"mapped contents");
    }

    #[test]
    fn empty_file_maps_empty() {
        let root = tempdir().unwrap();
        let path = root.path().join("empty");
        File::create(&path).unwrap();
        let map = FileMap::open(path.to_str().unwrap()).unwrap();
        assert_eq!(map.bytes(), b"");
    }

    #[test]
    fn missing_file_errors() {
        assert!(FileMap::open("/no/such/file/anywhere").is_err());
    }

    #[test]
    fn icon_check_works() {
        assert!(icon_check("icons/folder.gif").is_some());
        assert!(icon_check("icons/nope.gif").is_none());
        assert!(icon_check("folder.gif").is_none());
    }
}
