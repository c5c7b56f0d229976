use std::{
    borrow::Cow,
    collections::BTreeMap,
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use url::Url;

use crate::fetch::Transport;

/// Blocking HTTP/1.1 client speaking plain TCP or TLS.
pub struct Client {
    tls_config: Arc<rustls::ClientConfig>,
}

impl Client {
    pub fn new() -> Self {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            tls_config: Arc::new(config),
        }
    }

    /// Sends a single `GET` request. Connecting, reading and writing are each
    /// bounded by `timeout`.
    pub fn get(&self, url: &Url, timeout: Duration) -> Result<Response> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("Given URL does not contain a host"))?;
        let port = url.port().unwrap_or(match url.scheme() {
            "http" => 80,
            "https" => 443,
            _ => bail!("Unknown scheme: {}", url.scheme()),
        });

        let mut headers = Headers::default();
        match url.port() {
            Some(port) => headers.insert("Host", format!("{host}:{port}")),
            None => headers.insert("Host", host),
        }
        headers.insert(
            "User-Agent",
            format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        );
        headers.insert("Accept", "*/*");
        headers.insert("Connection", "close");

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path = format!("{path}?{query}");
        }
        let req = Request {
            method: "GET",
            path,
            headers,
        };

        let mut request_bytes = Vec::new();
        req.write_to(&mut request_bytes)?;

        tracing::debug!(bytes = request_bytes.len(), "sending request");
        tracing::trace!(
            "\n{}",
            prefix_lines(&String::from_utf8_lossy(&request_bytes), ">>> "),
        );

        let mut stream = connect(format!("{host}:{port}").to_socket_addrs()?, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut response_bytes = Vec::new();
        if url.scheme() == "https" {
            let server_name = host.to_owned().try_into()?;
            let mut conn = rustls::ClientConnection::new(self.tls_config.clone(), server_name)?;
            let stream = rustls::Stream::new(&mut conn, &mut stream);

            // Some servers close the socket without sending close_notify.
            let result = do_read_write(stream, &request_bytes, &mut response_bytes);
            if let Err(error) = &result {
                if error.kind() != io::ErrorKind::UnexpectedEof || response_bytes.is_empty() {
                    result?;
                }
            }
        } else {
            do_read_write(stream, &request_bytes, &mut response_bytes)?;
        }

        tracing::debug!(bytes = response_bytes.len(), "received response");
        tracing::trace!(
            "\n{}",
            prefix_lines(&String::from_utf8_lossy(&response_bytes), "<<< "),
        );

        Response::parse(&response_bytes)
    }
}

impl Transport for Client {
    fn get(&self, url: &Url, timeout: Duration) -> Result<Response> {
        Client::get(self, url, timeout)
    }
}

/// Tries each resolved address in turn and returns the first connection that
/// succeeds, or the last error.
fn connect(addrs: impl IntoIterator<Item = SocketAddr>, timeout: Duration) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        tracing::debug!(%addr, "connecting");
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                tracing::debug!(%addr, %error, "connect failed");
                last_error = Some(error);
            }
        }
    }
    match last_error {
        Some(error) => Err(error.into()),
        None => bail!("Failed to resolve given address"),
    }
}

fn do_read_write<S>(
    mut stream: S,
    request_bytes: &[u8],
    response_bytes: &mut Vec<u8>,
) -> io::Result<()>
where
    S: Read + Write,
{
    stream.write_all(request_bytes)?;
    stream.flush()?;
    stream.read_to_end(response_bytes)?;
    Ok(())
}

/// Header map with case-insensitive names.
#[derive(Clone, Default)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn insert(&mut self, key: impl ToString, val: impl ToString) {
        self.0
            .insert(key.to_string().to_lowercase(), val.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(&key.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

struct Request {
    method: &'static str,
    path: String,
    headers: Headers,
}

impl Request {
    fn write_to(self, mut writer: impl Write) -> Result<()> {
        writeln!(writer, "{} {} HTTP/1.1\r", self.method, self.path)?;

        for (key, value) in self.headers.iter() {
            writeln!(writer, "{key}: {value}\r")?;
        }

        writer.write_all(b"\r\n")?;

        Ok(())
    }
}

pub struct Response {
    status_code: u16,
    status_message: String,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    /// Parses a complete response as read off a closed connection.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut state = ResponseParserState::Status;

        let mut status_code = 0u16;
        let mut status_message = String::new();
        let mut headers = Headers::default();
        let mut content_length = None;
        let mut is_chunked = false;
        let mut head_complete = false;

        let mut pos = 0;
        for mut line in bytes.split(|&c| c == b'\n') {
            pos += line.len() + 1;
            if pos > bytes.len() {
                // Last fragment had no line terminator.
                break;
            }

            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }

            match state {
                ResponseParserState::Status => {
                    let line = std::str::from_utf8(line)?;
                    let mut parts = line.splitn(3, ' ');
                    let version = parts.next().unwrap_or_default();
                    if !version.starts_with("HTTP/") {
                        bail!("Invalid status line: {line:?}");
                    }
                    status_code = parts
                        .next()
                        .ok_or_else(|| anyhow!("Invalid status line: {line:?}"))?
                        .parse()
                        .with_context(|| format!("Invalid status code in {line:?}"))?;
                    status_message = parts.next().unwrap_or_default().to_owned();
                    state = ResponseParserState::Header;
                }
                ResponseParserState::Header => {
                    if line.is_empty() {
                        head_complete = true;
                        break;
                    }

                    let line = std::str::from_utf8(line)?;
                    let (key, value) = line
                        .split_once(':')
                        .ok_or_else(|| anyhow!("Invalid header: {line:?}"))?;
                    let value = value.trim();
                    headers.insert(key, value);
                    match key.to_lowercase().as_str() {
                        "content-length" => {
                            content_length = Some(
                                value
                                    .parse::<usize>()
                                    .with_context(|| format!("Invalid content-length: {value}"))?,
                            )
                        }
                        "transfer-encoding" => {
                            if !value.eq_ignore_ascii_case("chunked") {
                                bail!("Unknown transfer-encoding value: {value}");
                            }

                            is_chunked = true;
                        }
                        _ => {}
                    }
                }
            }
        }

        if !head_complete {
            bail!("Incomplete response head");
        }

        let remaining = &bytes[pos..];
        let body = if is_chunked {
            decode_chunked(remaining)?
        } else if let Some(length) = content_length {
            if remaining.len() < length {
                bail!(
                    "Truncated body: expected {length} bytes, got {}",
                    remaining.len()
                );
            }
            remaining[..length].to_vec()
        } else {
            remaining.to_vec()
        };

        Ok(Response {
            status_code,
            status_message,
            headers,
            body,
        })
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

enum ResponseParserState {
    Status,
    Header,
}

fn decode_chunked(mut remaining: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end =
            find_crlf(remaining).ok_or_else(|| anyhow!("Invalid chunk: missing size line"))?;
        let size_line = std::str::from_utf8(&remaining[..line_end])?;
        let octets = size_line
            .split_once(';')
            .map_or(size_line, |(size, _)| size)
            .trim();
        let length = usize::from_str_radix(octets, 16)
            .with_context(|| format!("Invalid chunk size: {octets:?}"))?;
        remaining = &remaining[line_end + 2..];

        // Trailers after the last chunk are ignored.
        if length == 0 {
            break;
        }

        if remaining.len().saturating_sub(2) < length {
            bail!("Truncated chunk: expected {length} bytes");
        }
        body.extend_from_slice(&remaining[..length]);

        if &remaining[length..length + 2] != b"\r\n" {
            bail!("Invalid chunk: missing terminator");
        }
        remaining = &remaining[length + 2..];
    }
    Ok(body)
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|window| window == b"\r\n")
}

fn prefix_lines(str: &str, prefix: &str) -> String {
    str.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<String>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use super::*;

    fn serve_once(response: &'static [u8]) -> (Url, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response).unwrap();
            String::from_utf8(head).unwrap()
        });
        let url = Url::parse(&format!("http://127.0.0.1:{port}/api/v2/pokemon?limit=3")).unwrap();
        (url, handle)
    }

    #[test]
    fn parses_content_length_body() {
        let response =
            Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: a\r\n\r\nhello").unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.status_message(), "OK");
        assert_eq!(response.headers().get("x-test").map(String::as_str), Some("a"));
        assert_eq!(response.body(), b"hello");
    }

    #[test]
    fn parses_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nTrailer: x\r\n\r\n";
        let response = Response::parse(raw).unwrap();
        assert_eq!(response.text(), "Wikipedia");
    }

    #[test]
    fn reads_body_until_close_without_length() {
        let response = Response::parse(b"HTTP/1.0 404 Not Found\r\n\r\nnot found").unwrap();
        assert_eq!(response.status_code(), 404);
        assert_eq!(response.text(), "not found");
    }

    #[test]
    fn status_line_without_reason() {
        let response = Response::parse(b"HTTP/1.1 204\r\n\r\n").unwrap();
        assert_eq!(response.status_code(), 204);
        assert_eq!(response.status_message(), "");
        assert!(response.body().is_empty());
    }

    #[test]
    fn rejects_malformed_responses() {
        let cases: &[&[u8]] = &[
            b"",
            b"garbage\r\n\r\n",
            b"HTTP/1.1 abc OK\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nno-colon\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWikiXX0\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab\r\n0\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nfffffffffffffffe\r\nab\r\n0\r\n\r\n",
        ];
        for raw in cases {
            assert!(
                Response::parse(raw).is_err(),
                "accepted {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn sends_get_request_and_reads_response() {
        let (url, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        let response = Client::new().get(&url, Duration::from_secs(5)).unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text(), "ok");

        let head = server.join().unwrap();
        let port = url.port().unwrap();
        assert!(head.starts_with("GET /api/v2/pokemon?limit=3 HTTP/1.1\r\n"));
        assert!(head.contains(&format!("host: 127.0.0.1:{port}\r\n")));
        assert!(head.contains("connection: close\r\n"));
        assert!(head.contains(&format!("user-agent: {}/", env!("CARGO_PKG_NAME"))));
    }

    #[test]
    fn connect_falls_back_to_next_address() {
        let refused = TcpListener::bind("127.0.0.1:0").unwrap();
        let refused_addr = refused.local_addr().unwrap();
        drop(refused);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live_addr = listener.local_addr().unwrap();

        let stream = connect([refused_addr, live_addr], Duration::from_secs(5)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), live_addr);
    }

    #[test]
    fn connect_reports_last_error_when_all_fail() {
        let refused = TcpListener::bind("127.0.0.1:0").unwrap();
        let refused_addr = refused.local_addr().unwrap();
        drop(refused);

        let err = connect([refused_addr], Duration::from_secs(5)).unwrap_err();
        let io_err = err.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionRefused);

        let err = connect(Vec::<SocketAddr>::new(), Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("Failed to resolve"));
    }

    #[test]
    fn error_status_is_not_an_error() {
        let (url, server) =
            serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found");

        let response = Client::new().get(&url, Duration::from_secs(5)).unwrap();
        assert_eq!(response.status_code(), 404);
        assert_eq!(response.text(), "not found");
        server.join().unwrap();
    }

    #[test]
    fn stalled_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let _stream = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
        });

        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let err = Client::new()
            .get(&url, Duration::from_millis(100))
            .err()
            .expect("request should time out");
        let io_err = err
            .chain()
            .find_map(|e| e.downcast_ref::<io::Error>())
            .expect("timeout should surface as an I/O error");
        assert!(matches!(
            io_err.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        ));

        server.join().unwrap();
    }

    #[test]
    fn rejects_unknown_scheme() {
        let url = Url::parse("ftp://example.com/file").unwrap();
        let err = Client::new().get(&url, Duration::from_secs(1)).err().unwrap();
        assert!(err.to_string().contains("Unknown scheme"));
    }
}
