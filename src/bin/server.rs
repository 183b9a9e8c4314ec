//! HTTP server for the tabletalk service.
//! Simple HTTP handling built directly on tokio, no framework.

use clap::Parser;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use tabletalk::answer::answer_question;
use tabletalk::error::AppError;
use tabletalk::ingest::apply_upload;
use tabletalk::llm::LlmClient;
use tabletalk::table_store::TableStore;

/// Uploads larger than this are rejected outright.
const MAX_REQUEST_BYTES: usize = 20 * 1024 * 1024;

lazy_static::lazy_static! {
    // Single shared slot for the most recently uploaded table.
    static ref TABLE_STORE: Arc<TableStore> = Arc::new(TableStore::new());
}

#[derive(Parser)]
#[command(name = "tabletalk-server")]
#[command(about = "Chat with an uploaded spreadsheet or CSV file")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Directory with the landing page and frontend assets
    #[arg(long, default_value = "static")]
    static_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if std::env::var("OPENAI_API_KEY").is_ok() {
        info!("OpenAI API key found");
    } else {
        warn!("OPENAI_API_KEY not set; /ask requests will fail until it is provided");
    }

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = args.port, "server listening");

    let static_dir = Arc::new(args.static_dir);
    loop {
        let (stream, addr) = listener.accept().await?;
        let static_dir = Arc::clone(&static_dir);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &static_dir).await {
                warn!(client = %addr, error = %e, "connection error");
            }
        });
    }
}

struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn handle_connection(mut stream: TcpStream, static_dir: &Path) -> std::io::Result<()> {
    use tokio::time::{timeout, Duration};

    let request = match timeout(Duration::from_secs(10), read_request(&mut stream)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            warn!("request read timeout");
            return Ok(());
        }
    };

    let response = handle_request(&request, static_dir).await;
    stream.write_all(&response).await?;
    stream.flush().await
}

/// Read one request: headers, then exactly Content-Length body bytes. The
/// body stays raw since uploads carry binary spreadsheet data.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<HttpRequest>> {
    let mut buffer = Vec::new();
    let mut temp_buf = [0u8; 8192];

    let headers_end = loop {
        if let Some(pos) = find_subslice(&buffer, b"\r\n\r\n", 0) {
            break pos + 4;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }
        match stream.read(&mut temp_buf).await? {
            0 => return Ok(None),
            n => buffer.extend_from_slice(&temp_buf[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buffer[..headers_end]).into_owned();
    let mut lines = head.lines();
    let request_line = match lines.next() {
        Some(line) => line,
        None => return Ok(None),
    };
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(m), Some(p)) => (m.to_string(), p.to_string()),
        _ => return Ok(None),
    };

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Ok(None);
    }

    while buffer.len() < headers_end + content_length {
        match stream.read(&mut temp_buf).await? {
            0 => break,
            n => buffer.extend_from_slice(&temp_buf[..n]),
        }
    }

    let body = buffer[headers_end..(headers_end + content_length).min(buffer.len())].to_vec();
    Ok(Some(HttpRequest {
        method,
        path,
        headers,
        body,
    }))
}

async fn handle_request(request: &HttpRequest, static_dir: &Path) -> Vec<u8> {
    // Strip query string and trailing slash before routing.
    let path = request.path.split('?').next().unwrap_or("/");
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };

    info!(method = %request.method, path, "request");

    match (request.method.as_str(), path) {
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("GET", "/") => serve_static_file(static_dir, "index.html").await,
        ("GET", _) if path.starts_with("/static/") => {
            serve_static_file(static_dir, &path["/static/".len()..]).await
        }
        ("POST", "/upload") => handle_upload(request).await,
        ("POST", "/ask") => handle_ask(request).await,
        _ => create_response(404, "Not Found", r#"{"error":"Not found"}"#),
    }
}

async fn handle_upload(request: &HttpRequest) -> Vec<u8> {
    let content_type = request
        .headers
        .get("content-type")
        .map(String::as_str)
        .unwrap_or("");

    let (filename, file_bytes) = match parse_multipart_file(content_type, &request.body) {
        Some(part) => part,
        None => {
            return create_response(400, "Bad Request", r#"{"error":"No file provided."}"#);
        }
    };

    match apply_upload(&TABLE_STORE, &filename, &file_bytes) {
        Ok(message) => {
            let body = serde_json::json!({ "message": message });
            create_response(200, "OK", &body.to_string())
        }
        Err(e) => error_response(&e),
    }
}

async fn handle_ask(request: &HttpRequest) -> Vec<u8> {
    let question = serde_json::from_slice::<serde_json::Value>(&request.body)
        .ok()
        .and_then(|v| v.get("question").and_then(|q| q.as_str()).map(String::from))
        .unwrap_or_default();

    let llm = match LlmClient::from_env() {
        Ok(llm) => llm,
        Err(e) => return error_response(&e),
    };

    match answer_question(&TABLE_STORE, &llm, &question).await {
        Ok(response) => match serde_json::to_string(&response) {
            Ok(body) => create_response(200, "OK", &body),
            Err(e) => {
                error!(error = %e, "failed to serialize response");
                create_response(
                    500,
                    "Internal Server Error",
                    r#"{"error":"Failed to serialize response"}"#,
                )
            }
        },
        Err(e) => error_response(&e),
    }
}

async fn serve_static_file(static_dir: &Path, name: &str) -> Vec<u8> {
    // Only plain relative segments: an absolute name or a `..`/`.` component
    // would let join() step outside the static directory.
    let relative = Path::new(name);
    let is_plain = !name.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    if !is_plain {
        return create_response(404, "Not Found", r#"{"error":"Not found"}"#);
    }

    let path = static_dir.join(relative);
    match tokio::fs::read(&path).await {
        Ok(contents) => create_file_response(content_type_for(&path), &contents),
        Err(_) => create_response(404, "Not Found", r#"{"error":"Not found"}"#),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// First file part of a multipart/form-data body: (filename, content bytes).
fn parse_multipart_file(content_type: &str, body: &[u8]) -> Option<(String, Vec<u8>)> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))?
        .trim_matches('"');
    let delimiter = format!("--{}", boundary).into_bytes();

    let mut cursor = find_subslice(body, &delimiter, 0)? + delimiter.len();
    loop {
        // A part starts after the delimiter's CRLF; "--" instead means the end.
        if body[cursor..].starts_with(b"--") {
            return None;
        }
        let part_start = cursor + 2; // skip \r\n
        let part_end = find_subslice(body, &delimiter, part_start)?;
        let part = &body[part_start..part_end];

        let headers_end = find_subslice(part, b"\r\n\r\n", 0)?;
        let part_headers = String::from_utf8_lossy(&part[..headers_end]);
        // Content ends with the CRLF that precedes the next delimiter.
        let content = &part[headers_end + 4..];
        let content = content.strip_suffix(b"\r\n").unwrap_or(content);

        if let Some(filename) = extract_filename(&part_headers) {
            return Some((filename, content.to_vec()));
        }
        cursor = part_end + delimiter.len();
    }
}

fn extract_filename(part_headers: &str) -> Option<String> {
    for line in part_headers.lines() {
        if !line.to_ascii_lowercase().starts_with("content-disposition:") {
            continue;
        }
        for attr in line.split(';').map(str::trim) {
            if let Some(value) = attr.strip_prefix("filename=") {
                let value = value.trim_matches('"');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn error_response(e: &AppError) -> Vec<u8> {
    let status = e.http_status();
    let status_text = match status {
        400 => "Bad Request",
        _ => "Internal Server Error",
    };
    let body = serde_json::json!({ "error": e.to_string() });
    create_response(status, status_text, &body.to_string())
}

fn create_response(status: u16, status_text: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
    .into_bytes()
}

fn create_file_response(content_type: &str, contents: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Content-Length: {}\r\n\
         \r\n",
        content_type,
        contents.len()
    )
    .into_bytes();
    response.extend_from_slice(contents);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart_body(boundary: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        body
    }

    #[test]
    fn parses_single_file_part() {
        let body = multipart_body("XBOUND", "sales.csv", b"a,b\n1,2\n");
        let (filename, content) =
            parse_multipart_file("multipart/form-data; boundary=XBOUND", &body).unwrap();
        assert_eq!(filename, "sales.csv");
        assert_eq!(content, b"a,b\n1,2\n");
    }

    #[test]
    fn skips_non_file_parts() {
        let boundary = "XBOUND";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"comment\"\r\n\r\nhello\r\n",
        );
        body.extend_from_slice(&multipart_body(boundary, "data.csv", b"x\n1\n"));
        let (filename, content) =
            parse_multipart_file("multipart/form-data; boundary=XBOUND", &body).unwrap();
        assert_eq!(filename, "data.csv");
        assert_eq!(content, b"x\n1\n");
    }

    #[test]
    fn missing_file_part_is_none() {
        let boundary = "XBOUND";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"comment\"\r\n\r\nhello\r\n",
        );
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        assert!(parse_multipart_file("multipart/form-data; boundary=XBOUND", &body).is_none());
    }

    #[test]
    fn binary_content_survives_multipart_parsing() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let body = multipart_body("B", "data.xlsx", &payload);
        let (_, content) = parse_multipart_file("multipart/form-data; boundary=B", &body).unwrap();
        assert_eq!(content, payload);
    }

    #[tokio::test]
    async fn static_requests_cannot_escape_the_static_dir() {
        for name in [
            "/etc/passwd",
            "../Cargo.toml",
            "css/../../Cargo.toml",
            "./index.html",
            "",
        ] {
            let response = serve_static_file(Path::new("static"), name).await;
            let head = String::from_utf8_lossy(&response);
            assert!(
                head.starts_with("HTTP/1.1 404"),
                "{:?} was served: {}",
                name,
                head.lines().next().unwrap_or_default()
            );
        }
    }

    #[tokio::test]
    async fn plain_static_names_are_still_served() {
        let response = serve_static_file(Path::new("static"), "index.html").await;
        let head = String::from_utf8_lossy(&response);
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(head.contains("Content-Type: text/html"));
    }

    #[test]
    fn find_subslice_basics() {
        assert_eq!(find_subslice(b"abcdef", b"cd", 0), Some(2));
        assert_eq!(find_subslice(b"abcdef", b"cd", 3), None);
        assert_eq!(find_subslice(b"abcdef", b"zz", 0), None);
    }
}
