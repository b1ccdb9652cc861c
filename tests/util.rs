use std::collections::HashMap;
use std::fs::{create_dir, File};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    /// Spawn the built binary against a fresh document root, in the
    /// foreground, on an unused port.
    pub fn with_args(args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");

        // tempdirs are created 0700, but the server insists on
        // world-readable trees.
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(root.path(), perms).expect("failed to chmod root");

        // Get an unused port. Assumes the port won't be reused before the
        // server starts.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_minihttpd"))
            .arg("-n")
            .args(&["-p", &format!("{}", port)])
            .args(args)
            .arg(root.path().to_str().expect("path is not valid UTF-8"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn minihttpd");

        let server = Self {
            _child: ScopedChild(child),
            port,
            root,
        };

        // Wait until the socket is open.
        assert!(wait_for_port(server.port), "failed to connect to minihttpd");

        server
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    pub fn create_dir(&self, name: &str) {
        create_dir(self.path(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, contents: &[u8]) {
        let mut file = File::create(self.path(name)).expect("failed to create file");
        file.write_all(contents).expect("failed to write file");
    }

    pub fn chmod(&self, name: &str, mode: u32) {
        let perms = std::fs::Permissions::from_mode(mode);
        std::fs::set_permissions(self.path(name), perms).expect("failed to chmod");
    }

    /// Write an executable shell script, for CGI tests.
    pub fn create_script(&self, name: &str, body: &str) {
        self.create_file(name, format!("#!/bin/sh\n{}\n", body).as_bytes());
        self.chmod(name, 0o755);
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to minihttpd");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send one request and read until the server closes the connection.
    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Vec<u8> {
        let mut stream = self.stream();
        write!(stream, "{} {} HTTP/1.0\r\n", method, path).unwrap();
        for (name, value) in headers {
            write!(stream, "{}: {}\r\n", name, value).unwrap();
        }
        write!(stream, "\r\n").unwrap();
        if let Some(body) = body {
            stream.write_all(body).unwrap();
        }
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }

    pub fn request11(&self, method: &str, path: &str, headers: &[(&str, &str)]) -> Vec<u8> {
        let mut stream = self.stream();
        write!(stream, "{} {} HTTP/1.1\r\n", method, path).unwrap();
        let mut has_host = false;
        for (name, value) in headers {
            has_host |= name.eq_ignore_ascii_case("Host");
            write!(stream, "{}: {}\r\n", name, value).unwrap();
        }
        if !has_host {
            write!(stream, "Host: localhost\r\n").unwrap();
        }
        write!(stream, "\r\n").unwrap();
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }

    pub fn get(&self, path: &str) -> Vec<u8> {
        self.request("GET", path, &[], None)
    }
}

/// Split a raw response into status line, headers and body.
pub fn parse(response: &[u8]) -> (String, HashMap<String, String>, Vec<u8>) {
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");
    let head = String::from_utf8_lossy(&response[..split]).into_owned();
    let body = response[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap().to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some(pos) = line.find(": ") {
            headers.insert(line[..pos].to_string(), line[pos + 2..].to_string());
        }
    }
    (status_line, headers, body)
}

/// Read one framed response off a keep-alive stream: headers, then
/// Content-Length body bytes.
pub fn read_response(stream: &mut TcpStream) -> (String, HashMap<String, String>, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("eof in headers");
        head.push(byte[0]);
    }
    head.truncate(head.len() - 4);
    let head = String::from_utf8_lossy(&head).into_owned();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap().to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some(pos) = line.find(": ") {
            headers.insert(line[..pos].to_string(), line[pos + 2..].to_string());
        }
    }

    let length: usize = headers
        .get("Content-Length")
        .map(|v| v.parse().expect("bad Content-Length"))
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).expect("eof in body");

    (status_line, headers, body)
}
