//! wardgate/src/http.rs
//! Streaming HTTP/1.x codec and the message-granularity handler.
//!
//! Deliberately partial: fixed-length bodies only, no chunked transfer,
//! no trailers.

use crate::error::ProxyError;
use crate::handler::{DirectionReader, DirectionWriter, Handler};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

lazy_static! {
    static ref REQUEST_LINE_RE: Regex = Regex::new(r"^(\w+)\s+(\S+)\s+HTTP/(\d\.\d)$").unwrap();
    static ref RESPONSE_LINE_RE: Regex = Regex::new(r"^HTTP/(\d\.\d)\s+(\d+)\s+(.+)$").unwrap();
    static ref HEADER_RE: Regex = Regex::new(r"^([^:]+):\s+(.+)$").unwrap();
}

/// Insertion-ordered header map. Lookups are case-insensitive, iteration
/// and serialisation keep the spelling the header arrived with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        HttpHeaders::default()
    }

    /// Replaces an existing header (matched case-insensitively) in place,
    /// adopting the new spelling; appends otherwise.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => *entry = (key, value),
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (key, value) in self.iter() {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: f32,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub version: f32,
    pub code: u16,
    pub message: String,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

/// Reads one line and trims it. Returns an empty string both at EOF and on
/// a blank line; start-line parsers treat that as end of message stream,
/// the header loop as end of headers.
async fn read_line_trimmed<R>(reader: &mut R) -> Result<String, ProxyError>
where
    R: AsyncBufRead + Unpin + Send + ?Sized,
{
    let mut line = String::new();
    reader.read_line(&mut line).await.map_err(|e| {
        if e.kind() == ErrorKind::InvalidData {
            ProxyError::Decode(e.to_string())
        } else {
            ProxyError::Io(e)
        }
    })?;
    Ok(line.trim().to_string())
}

async fn parse_headers<R>(reader: &mut R) -> Result<HttpHeaders, ProxyError>
where
    R: AsyncBufRead + Unpin + Send + ?Sized,
{
    let mut headers = HttpHeaders::new();
    loop {
        let line = read_line_trimmed(reader).await?;
        if line.is_empty() {
            break;
        }
        let caps = HEADER_RE
            .captures(&line)
            .ok_or_else(|| ProxyError::MalformedHeader(line.clone()))?;
        debug!(key = &caps[1], value = &caps[2], "found header");
        headers.insert(&caps[1], &caps[2]);
    }
    Ok(headers)
}

/// Headers plus the fixed-length body they announce. A missing
/// Content-Length means an empty body, not an error.
async fn parse_payload<R>(reader: &mut R) -> Result<(HttpHeaders, Vec<u8>), ProxyError>
where
    R: AsyncBufRead + Unpin + Send + ?Sized,
{
    let headers = parse_headers(reader).await?;
    let length = match headers.get("Content-Length") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| ProxyError::Decode(format!("bad Content-Length {value:?}")))?,
        None => {
            warn!("missing Content-Length header");
            0
        }
    };
    let mut body = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut body).await?;
    }
    Ok((headers, body))
}

impl HttpRequest {
    /// `Ok(None)` when the stream ends before a request starts.
    pub async fn parse<R>(reader: &mut R) -> Result<Option<HttpRequest>, ProxyError>
    where
        R: AsyncBufRead + Unpin + Send + ?Sized,
    {
        let line = read_line_trimmed(reader).await?;
        if line.is_empty() {
            return Ok(None);
        }
        let caps = REQUEST_LINE_RE
            .captures(&line)
            .ok_or_else(|| ProxyError::MalformedRequestLine(line.clone()))?;
        let method = caps[1].to_string();
        let path = caps[2].to_string();
        let version: f32 = caps[3]
            .parse()
            .map_err(|_| ProxyError::Decode(format!("bad HTTP version in {line:?}")))?;
        debug!(%method, %path, version, "got request line");
        let (headers, body) = parse_payload(reader).await?;
        Ok(Some(HttpRequest {
            method,
            path,
            version,
            headers,
            body,
        }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("{} {} HTTP/{:.1}\r\n", self.method, self.path, self.version).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(&self.body);
        out
    }
}

impl HttpResponse {
    /// `Ok(None)` when the stream ends before a response starts.
    pub async fn parse<R>(reader: &mut R) -> Result<Option<HttpResponse>, ProxyError>
    where
        R: AsyncBufRead + Unpin + Send + ?Sized,
    {
        let line = read_line_trimmed(reader).await?;
        if line.is_empty() {
            return Ok(None);
        }
        let caps = RESPONSE_LINE_RE
            .captures(&line)
            .ok_or_else(|| ProxyError::MalformedResponseLine(line.clone()))?;
        let version: f32 = caps[1]
            .parse()
            .map_err(|_| ProxyError::Decode(format!("bad HTTP version in {line:?}")))?;
        let code: u16 = caps[2]
            .parse()
            .map_err(|_| ProxyError::Decode(format!("bad status code in {line:?}")))?;
        let message = caps[3].to_string();
        debug!(version, code, %message, "got response line");
        let (headers, body) = parse_payload(reader).await?;
        Ok(Some(HttpResponse {
            version,
            code,
            message,
            headers,
            body,
        }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("HTTP/{:.1} {} {}\r\n", self.version, self.code, self.message).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(&self.body);
        out
    }
}

/// HTTP message granularity: one call per parsed request or response.
/// `None` drops the connection.
pub trait HttpHandler: Send {
    fn request(&mut self, request: HttpRequest) -> Option<HttpRequest>;
    fn response(&mut self, response: HttpResponse) -> Option<HttpResponse>;
}

/// Pass-through handler.
pub struct NoHttpHandler;

impl HttpHandler for NoHttpHandler {
    fn request(&mut self, request: HttpRequest) -> Option<HttpRequest> {
        Some(request)
    }

    fn response(&mut self, response: HttpResponse) -> Option<HttpResponse> {
        Some(response)
    }
}

/// Drives an [`HttpHandler`]: parse a message, hand it to the callback for
/// the direction, forward the re-serialised form.
pub struct HttpPump<H> {
    handler: Mutex<H>,
}

impl<H: HttpHandler + 'static> HttpPump<H> {
    pub fn new(handler: H) -> Arc<Self> {
        Arc::new(HttpPump {
            handler: Mutex::new(handler),
        })
    }
}

#[async_trait]
impl<H: HttpHandler + 'static> Handler for HttpPump<H> {
    async fn handle(
        &self,
        reader: &mut DirectionReader,
        writer: &mut DirectionWriter,
        inbound: bool,
    ) -> Result<(), ProxyError> {
        loop {
            let forward = if inbound {
                match HttpRequest::parse(reader).await? {
                    None => break,
                    Some(request) => self
                        .handler
                        .lock()
                        .await
                        .request(request)
                        .map(|r| r.to_bytes()),
                }
            } else {
                match HttpResponse::parse(reader).await? {
                    None => break,
                    Some(response) => self
                        .handler
                        .lock()
                        .await
                        .response(response)
                        .map(|r| r.to_bytes()),
                }
            };
            match forward {
                Some(bytes) => writer.write_all(&bytes).await?,
                None => {
                    info!(inbound, "dropping HTTP connection");
                    break;
                }
            }
        }
        debug!(inbound, "end of HTTP message stream");
        Ok(())
    }
}
