//! Loopback stand-in for the orchestrator's build API.
//!
//! Serves one request per connection: the JSON control calls, the streamed
//! bits upload and the build's websocket event stream. The event stream sends
//! the version handshake and one log line, then holds until the test calls
//! [`AtcDouble::finish_build`] and reports `errored`.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

pub const BUILD_ID: u64 = 128;
pub const AFFINITY_COOKIE: &str = "Some-Cookie=some-cookie-data";
const PIPE_ID: &str = "some-pipe-id";

#[derive(Default)]
struct Shared {
    aborts: Mutex<Vec<(u64, Option<String>)>>,
    events_connected: Notify,
    abort_arrived: Notify,
    finish: Notify,
}

pub struct AtcDouble {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl AtcDouble {
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());
        let serving = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = Arc::clone(&serving);
                tokio::spawn(async move {
                    if let Err(err) = serve(stream, addr, &connection).await {
                        eprintln!("orchestrator double: {err}");
                    }
                });
            }
        });
        Ok(Self { addr, shared })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Resolves once the event stream has delivered its log line.
    pub async fn events_connected(&self) {
        self.shared.events_connected.notified().await;
    }

    pub async fn abort_arrived(&self) {
        self.shared.abort_arrived.notified().await;
    }

    /// Lets the event stream report the terminal status.
    pub fn finish_build(&self) {
        self.shared.finish.notify_one();
    }

    /// Returns `(build id, cookie)` for every abort request received.
    pub fn aborts(&self) -> Vec<(u64, Option<String>)> {
        self.shared
            .aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct HttpRequest {
    method: String,
    path: String,
    cookie: Option<String>,
}

async fn serve(stream: TcpStream, addr: SocketAddr, shared: &Shared) -> io::Result<()> {
    if opens_websocket(&stream).await? {
        return stream_events(stream, shared).await;
    }
    let mut reader = BufReader::new(stream);
    let request = read_request(&mut reader).await?;
    let response = respond(&request, addr, shared);
    let connection = reader.get_mut();
    connection.write_all(response.as_bytes()).await?;
    connection.shutdown().await
}

/// Websocket upgrades are the only `GET` requests the client sends.
async fn opens_websocket(stream: &TcpStream) -> io::Result<bool> {
    let mut method = [0_u8; 4];
    loop {
        let peeked = stream.peek(&mut method).await?;
        if peeked == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if peeked == method.len() {
            return Ok(&method == b"GET ");
        }
        tokio::task::yield_now().await;
    }
}

async fn read_line(reader: &mut BufReader<TcpStream>, line: &mut String) -> io::Result<()> {
    line.clear();
    if reader.read_line(line).await? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

async fn read_request(reader: &mut BufReader<TcpStream>) -> io::Result<HttpRequest> {
    let mut line = String::new();
    read_line(reader, &mut line).await?;
    let mut request_line = line.split_whitespace();
    let method = request_line.next().unwrap_or_default().to_owned();
    let path = request_line.next().unwrap_or_default().to_owned();

    let mut cookie = None;
    let mut content_length = 0_usize;
    let mut chunked = false;
    loop {
        read_line(reader, &mut line).await?;
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        let Some((name, raw_value)) = header.split_once(':') else {
            continue;
        };
        let value = raw_value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "cookie" => cookie = Some(value.to_owned()),
            "content-length" => {
                content_length = value
                    .parse()
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            }
            "transfer-encoding" => chunked = value.eq_ignore_ascii_case("chunked"),
            _ => {}
        }
    }

    if chunked {
        drain_chunked(reader).await?;
    } else {
        let mut body = vec![0_u8; content_length];
        reader.read_exact(&mut body).await?;
    }
    Ok(HttpRequest {
        method,
        path,
        cookie,
    })
}

async fn drain_chunked(reader: &mut BufReader<TcpStream>) -> io::Result<()> {
    let mut line = String::new();
    loop {
        read_line(reader, &mut line).await?;
        let size_field = line.trim().split(';').next().unwrap_or_default();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if size == 0 {
            // Trailers, if any, end with a blank line.
            loop {
                read_line(reader, &mut line).await?;
                if line.trim().is_empty() {
                    return Ok(());
                }
            }
        }
        let mut chunk = vec![0_u8; size + 2];
        reader.read_exact(&mut chunk).await?;
    }
}

fn respond(request: &HttpRequest, addr: SocketAddr, shared: &Shared) -> String {
    let upload_path = format!("/api/v1/pipes/{PIPE_ID}");
    let abort_path = format!("/api/v1/builds/{BUILD_ID}/abort");
    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/api/v1/pipes") => http_response(
            "201 Created",
            &[],
            &format!(r#"{{"id":"{PIPE_ID}","peer_addr":"{addr}"}}"#),
        ),
        ("PUT", path) if path == upload_path => http_response("200 OK", &[], ""),
        ("POST", "/api/v1/builds") => http_response(
            "201 Created",
            &[format!("Set-Cookie: {AFFINITY_COOKIE}; Path=/")],
            &format!(r#"{{"id":{BUILD_ID}}}"#),
        ),
        ("POST", path) if path == abort_path => {
            shared
                .aborts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((BUILD_ID, request.cookie.clone()));
            shared.abort_arrived.notify_one();
            http_response("200 OK", &[], "")
        }
        _ => http_response("404 Not Found", &[], ""),
    }
}

fn http_response(status: &str, headers: &[String], body: &str) -> String {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        body.len()
    );
    for header in headers {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

async fn stream_events(stream: TcpStream, shared: &Shared) -> io::Result<()> {
    let mut socket = accept_hdr_async(stream, |_request: &Request, response: Response| {
        Ok(response)
    })
    .await
    .map_err(io::Error::other)?;

    for frame in [
        r#"{"version":"1.0"}"#,
        r#"{"type":"log","event":{"payload":"sup"}}"#,
    ] {
        socket
            .send(Message::Text(frame.to_owned()))
            .await
            .map_err(io::Error::other)?;
    }
    shared.events_connected.notify_one();

    shared.finish.notified().await;
    socket
        .send(Message::Text(
            r#"{"type":"status","event":{"status":"errored"}}"#.to_owned(),
        ))
        .await
        .map_err(io::Error::other)?;
    socket.close(None).await.map_err(io::Error::other)
}
