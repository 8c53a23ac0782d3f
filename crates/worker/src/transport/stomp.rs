// STOMP 1.2 control channel: the worker subscribes to its action and config
// destinations and answers action messages with fragmented replies.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use mlworker_core::ReplyEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{error::TransportError, router::RequestRouter};

pub const REPLY_SIZE_CONFIG: &str = "MAX_STOMP_ML_WORKER_REPLY_SIZE";

const SUBSCRIPTIONS: [&str; 2] = ["action", "config"];

// command and header lines
const MAX_LINE_BYTES: usize = 64 * 1024;

// a single STOMP frame; header order is kept and on repeated headers the
// first one wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let raw = escapes_disabled(&self.command);
        let mut out = Vec::with_capacity(self.body.len() + 64);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            push_header(&mut out, name, value, raw);
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            push_header(&mut out, "content-length", &self.body.len().to_string(), raw);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    // decodes one complete frame, skipping any heart-beat newlines before it
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut rest = bytes;
        let command = loop {
            let line = next_line(&mut rest).ok_or(TransportError::Closed)?;
            if !line.is_empty() {
                break utf8(line)?.to_string();
            }
        };

        let mut frame = StompFrame::new(command);
        loop {
            let line = next_line(&mut rest).ok_or(TransportError::Closed)?;
            if line.is_empty() {
                break;
            }
            let header = parse_header(&frame.command, utf8(line)?)?;
            frame.headers.push(header);
        }

        let end = match content_length(&frame)? {
            Some(len) => {
                if rest.get(len) != Some(&0) {
                    return Err(TransportError::Stomp("body does not match content-length".into()));
                }
                len
            }
            None => rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(TransportError::Closed)?,
        };
        frame.body = rest[..end].to_vec();
        Ok(frame)
    }
}

fn escapes_disabled(command: &str) -> bool {
    command == "CONNECT" || command == "CONNECTED"
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str, raw: bool) {
    if raw {
        out.extend_from_slice(name.as_bytes());
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
    } else {
        out.extend_from_slice(escape(name).as_bytes());
        out.push(b':');
        out.extend_from_slice(escape(value).as_bytes());
    }
    out.push(b'\n');
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(TransportError::Stomp(format!(
                    "invalid escape sequence '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

fn parse_header(command: &str, line: &str) -> Result<(String, String), TransportError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| TransportError::Stomp(format!("malformed header '{line}'")))?;
    if escapes_disabled(command) {
        Ok((name.to_string(), value.to_string()))
    } else {
        Ok((unescape(name)?, unescape(value)?))
    }
}

fn content_length(frame: &StompFrame) -> Result<Option<usize>, TransportError> {
    frame
        .header("content-length")
        .map(|len| {
            len.trim()
                .parse()
                .map_err(|_| TransportError::Stomp(format!("invalid content-length '{len}'")))
        })
        .transpose()
}

fn next_line<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    let pos = rest.iter().position(|&b| b == b'\n')?;
    let line = &rest[..pos];
    *rest = &rest[pos + 1..];
    Some(line.strip_suffix(b"\r").unwrap_or(line))
}

fn utf8(bytes: &[u8]) -> Result<&str, TransportError> {
    std::str::from_utf8(bytes).map_err(|e| TransportError::Stomp(e.to_string()))
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<bool, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut limited = (&mut *reader).take(MAX_LINE_BYTES as u64 + 1);
    if limited.read_until(b'\n', line).await? == 0 {
        return Ok(false);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() > MAX_LINE_BYTES {
        return Err(TransportError::FrameTooLarge {
            size: line.len(),
            limit: MAX_LINE_BYTES,
        });
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(true)
}

// reads the next frame; `None` when the stream ends between frames. bodies
// above `max_size` bytes are refused before they are buffered
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<StompFrame>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    // leading newlines are heart-beats
    loop {
        if !read_line(reader, &mut line).await? {
            return Ok(None);
        }
        if !line.is_empty() {
            break;
        }
    }

    let mut frame = StompFrame::new(utf8(&line)?);
    loop {
        if !read_line(reader, &mut line).await? {
            return Err(TransportError::Closed);
        }
        if line.is_empty() {
            break;
        }
        let header = parse_header(&frame.command, utf8(&line)?)?;
        frame.headers.push(header);
    }

    match content_length(&frame)? {
        Some(len) => {
            let too_large = TransportError::FrameTooLarge {
                size: len,
                limit: max_size,
            };
            if len > max_size {
                return Err(too_large);
            }
            let mut body = vec![0u8; len.checked_add(1).ok_or(too_large)?];
            reader.read_exact(&mut body).await?;
            if body.pop() != Some(0) {
                return Err(TransportError::Stomp("body does not match content-length".into()));
            }
            frame.body = body;
        }
        None => {
            let limit = max_size.saturating_add(1);
            let mut body = Vec::new();
            (&mut *reader).take(limit as u64).read_until(0, &mut body).await?;
            if body.last() != Some(&0) {
                if body.len() >= limit {
                    return Err(TransportError::FrameTooLarge {
                        size: body.len(),
                        limit: max_size,
                    });
                }
                return Err(TransportError::Closed);
            }
            body.pop();
            frame.body = body;
        }
    }
    Ok(Some(frame))
}

pub async fn write_frame<W>(writer: &mut W, frame: &StompFrame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub fn action_destination(worker_id: &str) -> String {
    format!("/ml-worker/{worker_id}/action")
}

pub fn config_destination(worker_id: &str) -> String {
    format!("/ml-worker/{worker_id}/config")
}

pub fn reply_destination(worker_id: &str) -> String {
    format!("/app/ml-worker/{worker_id}/rep")
}

// one slice of a serialized reply, as sent to the reply destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFragment {
    pub id: String,
    pub action: String,
    pub f_index: usize,
    pub f_count: usize,
    pub payload: String,
}

// splits the serialized reply into fragment bodies whose payload slices are
// at most `max_size` bytes, cut on char boundaries
pub fn fragment_reply(reply: &ReplyEnvelope, max_size: usize) -> Result<Vec<Vec<u8>>, TransportError> {
    let text = serde_json::to_string(reply)?;
    let max_size = max_size.max(1);

    let mut slices = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max_size).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // a single char wider than the limit
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        slices.push(&text[start..end]);
        start = end;
    }

    let f_count = slices.len();
    slices
        .into_iter()
        .enumerate()
        .map(|(f_index, payload)| {
            let fragment = ReplyFragment {
                id: reply.id.clone(),
                action: reply.action.clone(),
                f_index,
                f_count,
                payload: payload.to_string(),
            };
            Ok(serde_json::to_vec(&fragment)?)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ConfigMessage {
    config: String,
    value: Value,
}

fn apply_config(body: &[u8], reply_size: &AtomicUsize) {
    let message: ConfigMessage = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "ignoring malformed config message");
            return;
        }
    };
    match (message.config.as_str(), message.value.as_u64()) {
        (REPLY_SIZE_CONFIG, Some(size)) if size > 0 => {
            reply_size.store(size as usize, Ordering::Relaxed);
            info!(size, "reply fragment size updated");
        }
        (name, _) => warn!(config = name, value = %message.value, "ignoring config message"),
    }
}

// credentials presented on CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAuth {
    // api key of a bridged worker
    Jwt(String),
    // shared token of a co-located worker
    Token(String),
}

impl ControlAuth {
    fn header(&self) -> (&'static str, &str) {
        match self {
            ControlAuth::Jwt(key) => ("jwt", key),
            ControlAuth::Token(token) => ("token", token),
        }
    }
}

pub struct ControlChannel {
    worker_id: String,
    outgoing: mpsc::Sender<StompFrame>,
    writer: JoinHandle<Result<(), TransportError>>,
    reader: JoinHandle<()>,
    stop: oneshot::Sender<()>,
    reply_size: Arc<AtomicUsize>,
}

impl ControlChannel {
    pub async fn connect(
        addr: &str,
        worker_id: &str,
        auth: ControlAuth,
        timeout: Duration,
        reply_size: usize,
        router: Arc<RequestRouter>,
    ) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout("control channel connection"))??;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let max_size = router.settings().max_receive_bytes();
        let grace = router.settings().shutdown_grace;

        let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
        let (auth_name, auth_value) = auth.header();
        let connect = StompFrame::new("CONNECT")
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", "0,0")
            .with_header(auth_name, auth_value);
        write_frame(&mut write_half, &connect).await?;

        let answer = tokio::time::timeout(timeout, read_frame(&mut reader, max_size))
            .await
            .map_err(|_| TransportError::Timeout("CONNECTED"))??
            .ok_or(TransportError::Closed)?;
        match answer.command.as_str() {
            "CONNECTED" => {}
            "ERROR" => {
                let reason = answer
                    .header("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| String::from_utf8_lossy(&answer.body).into_owned());
                return Err(TransportError::Refused(reason));
            }
            other => return Err(TransportError::Stomp(format!("expected CONNECTED, got {other}"))),
        }
        info!(%addr, worker_id, version = answer.header("version").unwrap_or("1.2"), "control channel connected");

        for (n, kind) in SUBSCRIPTIONS.iter().enumerate() {
            let destination = format!("/ml-worker/{worker_id}/{kind}");
            let subscribe = StompFrame::new("SUBSCRIBE")
                .with_header("id", format!("sub-{n}"))
                .with_header("destination", destination)
                .with_header("ack", "auto");
            write_frame(&mut write_half, &subscribe).await?;
        }

        let reply_size = Arc::new(AtomicUsize::new(reply_size));
        let (outgoing, queue) = mpsc::channel(64);
        let (stop, stopped) = oneshot::channel();
        let span = info_span!("control", worker_id);
        let writer = tokio::spawn(write_loop(write_half, queue).instrument(span.clone()));
        let reader = tokio::spawn(
            read_loop(
                ReadLoop {
                    reader,
                    outgoing: outgoing.clone(),
                    router,
                    worker_id: worker_id.to_string(),
                    reply_size: Arc::clone(&reply_size),
                    max_size,
                    grace,
                },
                stopped,
            )
            .instrument(span),
        );

        Ok(Self {
            worker_id: worker_id.to_string(),
            outgoing,
            writer,
            reader,
            stop,
            reply_size,
        })
    }

    pub fn reply_size(&self) -> usize {
        self.reply_size.load(Ordering::Relaxed)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    // stops reading new messages and lets in-flight ones reply within the
    // shutdown grace, then unsubscribes, disconnects and waits for queued
    // frames to be written
    pub async fn close(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.reader.await {
            warn!(error = %e, "control channel reader panicked");
        }

        for n in 0..SUBSCRIPTIONS.len() {
            let unsubscribe = StompFrame::new("UNSUBSCRIBE").with_header("id", format!("sub-{n}"));
            let _ = self.outgoing.send(unsubscribe).await;
        }
        let _ = self.outgoing.send(StompFrame::new("DISCONNECT")).await;
        drop(self.outgoing);

        match self.writer.await {
            Ok(Ok(())) => info!(worker_id = %self.worker_id, "control channel closed"),
            Ok(Err(e)) => warn!(error = %e, "control channel close failed"),
            Err(e) => warn!(error = %e, "control channel writer panicked"),
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<StompFrame>) -> Result<(), TransportError> {
    while let Some(frame) = queue.recv().await {
        write_frame(&mut writer, &frame).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

struct ReadLoop {
    reader: BufReader<OwnedReadHalf>,
    outgoing: mpsc::Sender<StompFrame>,
    router: Arc<RequestRouter>,
    worker_id: String,
    reply_size: Arc<AtomicUsize>,
    // largest frame body accepted from the control plane
    max_size: usize,
    // how long in-flight requests may take to reply once reading stops
    grace: Duration,
}

async fn read_loop(state: ReadLoop, mut stopped: oneshot::Receiver<()>) {
    let ReadLoop {
        mut reader,
        outgoing,
        router,
        worker_id,
        reply_size,
        max_size,
        grace,
    } = state;
    let actions = action_destination(&worker_id);
    let configs = config_destination(&worker_id);
    let replies = reply_destination(&worker_id);

    let mut in_flight = JoinSet::new();
    loop {
        while in_flight.try_join_next().is_some() {}

        let frame = tokio::select! {
            biased;
            _ = &mut stopped => {
                debug!("control channel stopped reading");
                break;
            }
            read = read_frame(&mut reader, max_size) => match read {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("control channel closed by the server");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "control channel read failed");
                    break;
                }
            },
        };

        match frame.command.as_str() {
            "MESSAGE" => {
                let destination = frame.header("destination").unwrap_or_default().to_string();
                if destination == actions {
                    let router = Arc::clone(&router);
                    let outgoing = outgoing.clone();
                    let replies = replies.clone();
                    let fragment_size = reply_size.load(Ordering::Relaxed);
                    in_flight.spawn(async move {
                        let reply = router.handle_frame(&frame.body).await;
                        let fragments = match fragment_reply(&reply, fragment_size) {
                            Ok(fragments) => fragments,
                            Err(e) => {
                                warn!(id = %reply.id, error = %e, "failed to encode reply");
                                return;
                            }
                        };
                        debug!(id = %reply.id, fragments = fragments.len(), "sending reply");
                        for body in fragments {
                            let send = StompFrame::new("SEND")
                                .with_header("destination", replies.as_str())
                                .with_header("content-type", "application/json")
                                .with_body(body);
                            if outgoing.send(send).await.is_err() {
                                break;
                            }
                        }
                    });
                } else if destination == configs {
                    apply_config(&frame.body, &reply_size);
                } else {
                    debug!(%destination, "ignoring message");
                }
            }
            "ERROR" => warn!(message = frame.header("message").unwrap_or_default(), "control plane error"),
            "RECEIPT" => debug!(receipt = frame.header("receipt-id").unwrap_or_default(), "receipt"),
            other => debug!(command = other, "ignoring frame"),
        }
    }

    if in_flight.is_empty() {
        return;
    }
    debug!(pending = in_flight.len(), "waiting for in-flight requests");
    let drained = tokio::time::timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(dropped = in_flight.len(), "in-flight requests outlived the shutdown grace");
        in_flight.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifacts::ArtifactResolver,
        error::RequestError,
        interceptor::{Interceptor, RequestContext},
        registry::ArtifactRegistry,
        transport::test_router,
        WorkerSettings,
    };
    use mlworker_core::{
        messages::{EchoMsg, EchoParam},
        RequestEnvelope, WorkerRequest,
    };
    use serde_json::json;
    use tokio::{
        net::TcpListener,
        sync::{oneshot, Notify},
    };

    const FRAME_LIMIT: usize = 1024 * 1024;

    fn reassemble(fragments: &[ReplyFragment]) -> ReplyEnvelope {
        let mut ordered: Vec<&ReplyFragment> = fragments.iter().collect();
        ordered.sort_by_key(|f| f.f_index);
        let text: String = ordered.iter().map(|f| f.payload.as_str()).collect();
        serde_json::from_str(&text).expect("reply")
    }

    #[test]
    fn frames_encode_and_decode() {
        let frame = StompFrame::new("SEND")
            .with_header("destination", "/app/ml-worker/w/rep")
            .with_body(b"{\"a\":1}".to_vec());
        let bytes = frame.encode();
        assert!(bytes.ends_with(b"}\0"));
        assert!(String::from_utf8_lossy(&bytes).contains("content-length:7\n"));

        let mut with_heartbeats = b"\n\r\n".to_vec();
        with_heartbeats.extend_from_slice(&bytes);
        let decoded = StompFrame::decode(&with_heartbeats).expect("decode");
        assert_eq!(decoded.command, "SEND");
        assert_eq!(decoded.header("destination"), Some("/app/ml-worker/w/rep"));
        assert_eq!(decoded.body, b"{\"a\":1}");
    }

    #[test]
    fn header_values_are_escaped_outside_connect() {
        let frame = StompFrame::new("MESSAGE").with_header("note", "a:b\nc\\d");
        let text = String::from_utf8(frame.encode()).expect("utf8");
        assert!(text.contains("note:a\\cb\\nc\\\\d\n"));
        assert_eq!(StompFrame::decode(text.as_bytes()).expect("decode").header("note"), Some("a:b\nc\\d"));

        let connect = StompFrame::new("CONNECT").with_header("host", "a:b");
        let text = String::from_utf8(connect.encode()).expect("utf8");
        assert!(text.contains("host:a:b\n"));
        assert_eq!(StompFrame::decode(text.as_bytes()).expect("decode").header("host"), Some("a:b"));
    }

    #[test]
    fn first_repeated_header_wins() {
        let decoded = StompFrame::decode(b"MESSAGE\nfoo:1\nfoo:2\n\n\0").expect("decode");
        assert_eq!(decoded.header("foo"), Some("1"));
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn bad_escapes_are_rejected() {
        assert!(StompFrame::decode(b"MESSAGE\nfoo:a\\tb\n\n\0").is_err());
        assert!(StompFrame::decode(b"MESSAGE\ncontent-length:5\n\nab\0").is_err());
    }

    #[tokio::test]
    async fn frames_are_read_from_a_stream() {
        let mut bytes = StompFrame::new("MESSAGE").with_body(b"x\0y".to_vec()).encode();
        bytes.extend_from_slice(b"\n\n");
        bytes.extend_from_slice(&StompFrame::new("RECEIPT").with_header("receipt-id", "7").encode());
        let mut reader = BufReader::new(&bytes[..]);

        let first = read_frame(&mut reader, FRAME_LIMIT).await.expect("read").expect("frame");
        assert_eq!(first.body, b"x\0y");
        let second = read_frame(&mut reader, FRAME_LIMIT).await.expect("read").expect("frame");
        assert_eq!(second.command, "RECEIPT");
        assert_eq!(second.header("receipt-id"), Some("7"));
        assert!(read_frame(&mut reader, FRAME_LIMIT).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_before_buffering() {
        let huge = b"MESSAGE\ncontent-length:18446744073709551615\n\n\0";
        let mut reader = BufReader::new(&huge[..]);
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { limit: 1024, .. }), "{err}");

        let declared = StompFrame::new("MESSAGE").with_body(vec![b'a'; 2048]).encode();
        let mut reader = BufReader::new(&declared[..]);
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 2048, .. }));
    }

    #[tokio::test]
    async fn unterminated_bodies_stop_at_the_limit() {
        let mut bytes = b"MESSAGE\ndestination:/x\n\n".to_vec();
        bytes.extend(std::iter::repeat(b'a').take(4096));
        let mut reader = BufReader::new(&bytes[..]);
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { limit: 1024, .. }), "{err}");

        // a body that fits but never ends is a closed stream
        let mut reader = BufReader::new(&b"MESSAGE\n\nabc"[..]);
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));

        let mut at_limit = b"MESSAGE\n\n".to_vec();
        at_limit.extend(std::iter::repeat(b'a').take(1024));
        at_limit.push(0);
        let mut reader = BufReader::new(&at_limit[..]);
        let frame = read_frame(&mut reader, 1024).await.expect("read").expect("frame");
        assert_eq!(frame.body.len(), 1024);
    }

    #[tokio::test]
    async fn endless_header_lines_are_refused() {
        let mut bytes = b"MESSAGE\nnote:".to_vec();
        bytes.extend(std::iter::repeat(b'x').take(MAX_LINE_BYTES + 10));
        bytes.extend_from_slice(b"\n\n\0");
        let mut reader = BufReader::new(&bytes[..]);
        let err = read_frame(&mut reader, FRAME_LIMIT).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { limit: MAX_LINE_BYTES, .. }));
    }

    #[test]
    fn replies_are_fragmented_on_char_boundaries() {
        let reply = ReplyEnvelope {
            id: "9".into(),
            action: "echo".into(),
            version: 1,
            is_error: false,
            payload: Some(json!({"msg": "héllo wörld ünïcode"})),
            error: None,
        };
        let fragments: Vec<ReplyFragment> = fragment_reply(&reply, 7)
            .expect("fragments")
            .iter()
            .map(|body| serde_json::from_slice(body).expect("fragment"))
            .collect();

        assert!(fragments.len() > 1);
        for (n, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.f_index, n);
            assert_eq!(fragment.f_count, fragments.len());
            assert_eq!(fragment.id, "9");
            assert!(fragment.payload.len() <= 7);
        }
        assert_eq!(reassemble(&fragments), reply);
    }

    #[test]
    fn config_messages_update_the_reply_size() {
        let size = AtomicUsize::new(100);
        apply_config(br#"{"config":"MAX_STOMP_ML_WORKER_REPLY_SIZE","value":42}"#, &size);
        assert_eq!(size.load(Ordering::Relaxed), 42);
        apply_config(br#"{"config":"SOMETHING_ELSE","value":1}"#, &size);
        apply_config(br#"{"config":"MAX_STOMP_ML_WORKER_REPLY_SIZE","value":0}"#, &size);
        apply_config(b"not json", &size);
        assert_eq!(size.load(Ordering::Relaxed), 42);
    }

    #[tokio::test]
    async fn control_channel_routes_actions() {
        let home = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (replied, replies_done) = oneshot::channel();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            let connect = read_frame(&mut reader, FRAME_LIMIT).await.expect("read").expect("CONNECT");
            assert_eq!(connect.command, "CONNECT");
            assert_eq!(connect.header("token"), Some("secret"));
            assert_eq!(connect.header("accept-version"), Some("1.2"));
            write_frame(&mut write_half, &StompFrame::new("CONNECTED").with_header("version", "1.2"))
                .await
                .expect("CONNECTED");

            let mut subscribed = Vec::new();
            for _ in 0..2 {
                let frame = read_frame(&mut reader, FRAME_LIMIT).await.expect("read").expect("SUBSCRIBE");
                assert_eq!(frame.command, "SUBSCRIBE");
                subscribed.push(frame.header("destination").expect("destination").to_string());
            }

            let config = StompFrame::new("MESSAGE")
                .with_header("destination", config_destination("w1"))
                .with_body(format!(r#"{{"config":"{REPLY_SIZE_CONFIG}","value":40}}"#));
            write_frame(&mut write_half, &config).await.expect("config");

            let request = WorkerRequest::Echo(EchoParam { msg: "over stomp".into() });
            let envelope = RequestEnvelope::new("s-1", &request).expect("envelope");
            let message = StompFrame::new("MESSAGE")
                .with_header("destination", action_destination("w1"))
                .with_body(serde_json::to_vec(&envelope).expect("encode"));
            write_frame(&mut write_half, &message).await.expect("message");

            let mut fragments = Vec::new();
            loop {
                let frame = read_frame(&mut reader, FRAME_LIMIT).await.expect("read").expect("SEND");
                assert_eq!(frame.command, "SEND");
                assert_eq!(frame.header("destination"), Some("/app/ml-worker/w1/rep"));
                let fragment: ReplyFragment = serde_json::from_slice(&frame.body).expect("fragment");
                assert!(fragment.payload.len() <= 40);
                let count = fragment.f_count;
                fragments.push(fragment);
                if fragments.len() == count {
                    break;
                }
            }
            let _ = replied.send(());

            let mut closing = Vec::new();
            while let Some(frame) = read_frame(&mut reader, FRAME_LIMIT).await.expect("read") {
                closing.push(frame.command);
            }
            (subscribed, fragments, closing)
        });

        let channel = ControlChannel::connect(
            &addr,
            "w1",
            ControlAuth::Token("secret".into()),
            Duration::from_secs(5),
            8192,
            test_router(home.path()),
        )
        .await
        .expect("connect");

        replies_done.await.expect("replies");
        assert_eq!(channel.reply_size(), 40);
        channel.close().await;

        let (subscribed, fragments, closing) = server.await.expect("server");
        assert_eq!(subscribed, vec!["/ml-worker/w1/action", "/ml-worker/w1/config"]);
        assert!(fragments.len() > 1);
        let reply = reassemble(&fragments);
        assert_eq!(reply.id, "s-1");
        let echo: EchoMsg = reply.payload_as().expect("payload").expect("decode");
        assert_eq!(echo.msg, "over stomp");
        assert_eq!(closing, vec!["UNSUBSCRIBE", "UNSUBSCRIBE", "DISCONNECT"]);
    }

    // stalls every request on a blocking sleep once it has been received
    struct HoldRequests {
        entered: Arc<Notify>,
        hold: Duration,
    }

    impl Interceptor for HoldRequests {
        fn name(&self) -> &'static str {
            "hold_requests"
        }

        fn before(&self, _ctx: &RequestContext, _envelope: &RequestEnvelope) -> Result<(), RequestError> {
            self.entered.notify_one();
            std::thread::sleep(self.hold);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_answers_in_flight_actions_before_disconnecting() {
        let home = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            read_frame(&mut reader, FRAME_LIMIT).await.expect("read").expect("CONNECT");
            write_frame(&mut write_half, &StompFrame::new("CONNECTED"))
                .await
                .expect("CONNECTED");
            for _ in 0..2 {
                read_frame(&mut reader, FRAME_LIMIT).await.expect("read").expect("SUBSCRIBE");
            }

            let request = WorkerRequest::Echo(EchoParam { msg: "slow".into() });
            let envelope = RequestEnvelope::new("slow-1", &request).expect("envelope");
            let message = StompFrame::new("MESSAGE")
                .with_header("destination", action_destination("w4"))
                .with_body(serde_json::to_vec(&envelope).expect("encode"));
            write_frame(&mut write_half, &message).await.expect("message");

            let mut frames = Vec::new();
            while let Some(frame) = read_frame(&mut reader, FRAME_LIMIT).await.expect("read") {
                frames.push(frame);
            }
            frames
        });

        let entered = Arc::new(Notify::new());
        let settings = WorkerSettings {
            home: home.path().to_path_buf(),
            shutdown_grace: Duration::from_secs(5),
            ..WorkerSettings::default()
        };
        let registry = Arc::new(ArtifactRegistry::new(ArtifactResolver::new(settings.projects_dir())));
        let router = RequestRouter::new(settings, registry).with_interceptor(Arc::new(HoldRequests {
            entered: Arc::clone(&entered),
            hold: Duration::from_millis(300),
        }));
        let channel = ControlChannel::connect(
            &addr,
            "w4",
            ControlAuth::Token("t".into()),
            Duration::from_secs(5),
            8192,
            Arc::new(router),
        )
        .await
        .expect("connect");

        entered.notified().await;
        channel.close().await;

        let frames = server.await.expect("server");
        let commands: Vec<&str> = frames.iter().map(|f| f.command.as_str()).collect();
        assert_eq!(commands, vec!["SEND", "UNSUBSCRIBE", "UNSUBSCRIBE", "DISCONNECT"]);
        let fragment: ReplyFragment = serde_json::from_slice(&frames[0].body).expect("fragment");
        assert_eq!(fragment.f_count, 1);
        let reply = reassemble(&[fragment]);
        assert_eq!(reply.id, "slow-1");
        assert!(!reply.is_error);
    }

    #[tokio::test]
    async fn refused_connections_fail_startup() {
        let home = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _ = read_frame(&mut reader, FRAME_LIMIT).await;
            let error = StompFrame::new("ERROR").with_header("message", "bad credentials");
            let _ = write_frame(&mut write_half, &error).await;
        });

        let result = ControlChannel::connect(
            &addr,
            "w2",
            ControlAuth::Jwt("nope".into()),
            Duration::from_secs(5),
            8192,
            test_router(home.path()),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Refused(reason)) if reason == "bad credentials"));
    }

    #[tokio::test]
    async fn silent_servers_time_out() {
        let home = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let result = ControlChannel::connect(
            &addr,
            "w3",
            ControlAuth::Token("t".into()),
            Duration::from_millis(200),
            8192,
            test_router(home.path()),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        hold.abort();
    }
}
