// rpc listener: accepts connections on tcp (co-located workers) or a unix
// socket (behind the bridge) and serves framed requests on each one.
// requests on a connection run concurrently; replies go out as they finish.

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use mlworker_core::ReplyEnvelope;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, info, info_span, warn, Instrument};

#[cfg(unix)]
use tokio::net::UnixListener;

use super::frame::{Frame, FrameCodec};
use crate::{
    error::{RequestError, TransportError},
    router::RequestRouter,
};

pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub enum RpcListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl RpcListener {
    // port `None` binds an ephemeral port
    pub async fn bind_tcp(host: &str, port: Option<u16>) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port.unwrap_or(0))).await?;
        Ok(Self::Tcp(listener))
    }

    #[cfg(unix)]
    pub fn bind_unix(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // stale socket from a previous run
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self::Unix(listener, path))
    }

    // address handed to the control plane: host:port or the socket path
    pub fn local_address(&self) -> io::Result<String> {
        match self {
            Self::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            #[cfg(unix)]
            Self::Unix(_, path) => Ok(path.display().to_string()),
        }
    }

    pub async fn accept(&self) -> io::Result<(Box<dyn Connection>, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Self::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        match self {
            Self::Tcp(_) => {}
            #[cfg(unix)]
            Self::Unix(_, path) => {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

// resolves once the shutdown flag is set or its sender is gone
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub async fn serve_connection<S>(
    stream: S,
    router: Arc<RequestRouter>,
    codec: FrameCodec,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (replies, mut outgoing) = mpsc::channel::<Vec<u8>>(32);

    let writer_task = tokio::spawn(async move {
        while let Some(body) = outgoing.recv().await {
            codec.write_frame(&mut writer, &body).await?;
        }
        writer.shutdown().await?;
        Ok::<_, TransportError>(())
    });

    let mut in_flight = JoinSet::new();
    let mut result = Ok(());
    loop {
        while in_flight.try_join_next().is_some() {}

        let frame = tokio::select! {
            _ = stopped(&mut shutdown) => {
                debug!("shutdown requested, no longer reading");
                break;
            }
            frame = codec.read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(Frame::Data(body))) => {
                let router = Arc::clone(&router);
                let replies = replies.clone();
                in_flight.spawn(async move {
                    let reply = router.handle_frame(&body).await;
                    send_reply(&codec, &replies, &reply).await;
                });
            }
            Ok(Some(Frame::Oversized(size))) => {
                // the body was dropped unread, so the request id is unknown
                let err = RequestError::PayloadTooLarge {
                    size,
                    limit: codec.max_receive(),
                };
                warn!(size, "dropped oversized frame");
                send_reply(&codec, &replies, &ReplyEnvelope::error("", "", err.detail())).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "connection read failed");
                result = Err(e);
                break;
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    drop(replies);

    let written = match writer_task.await {
        Ok(written) => written,
        Err(e) => Err(TransportError::Io(io::Error::other(e))),
    };
    result.and(written)
}

async fn send_reply(codec: &FrameCodec, replies: &mpsc::Sender<Vec<u8>>, reply: &ReplyEnvelope) {
    match codec.encode_reply(reply) {
        Ok(body) => {
            if replies.send(body).await.is_err() {
                debug!(id = %reply.id, "connection closed before the reply was sent");
            }
        }
        Err(e) => warn!(id = %reply.id, error = %e, "failed to encode reply"),
    }
}

pub struct RpcServer {
    listener: RpcListener,
    router: Arc<RequestRouter>,
    codec: FrameCodec,
    grace: Duration,
}

impl RpcServer {
    pub fn new(listener: RpcListener, router: Arc<RequestRouter>) -> Self {
        let settings = router.settings();
        let codec = FrameCodec::new(settings.max_receive_bytes(), settings.max_send_bytes());
        let grace = settings.shutdown_grace;
        Self {
            listener,
            router,
            codec,
            grace,
        }
    }

    pub fn local_address(&self) -> io::Result<String> {
        self.listener.local_address()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let address = self.listener.local_address()?;
        info!(%address, "rpc listener ready");

        let mut connections = JoinSet::new();
        loop {
            while let Some(done) = connections.try_join_next() {
                if let Ok(Err(e)) = done {
                    debug!(error = %e, "connection ended with an error");
                }
            }

            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let span = info_span!("connection", %peer);
                        connections.spawn(
                            serve_connection(stream, Arc::clone(&self.router), self.codec, shutdown.clone())
                                .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!(connections = connections.len(), grace_ms = self.grace.as_millis() as u64, "draining rpc connections");
        let drained = tokio::time::timeout(self.grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "grace period elapsed, aborting requests");
            connections.abort_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_router;
    use mlworker_core::{
        messages::{EchoMsg, EchoParam},
        RequestEnvelope, WorkerRequest,
    };

    fn echo(id: &str, msg: &str) -> Vec<u8> {
        let request = WorkerRequest::Echo(EchoParam { msg: msg.into() });
        serde_json::to_vec(&RequestEnvelope::new(id, &request).expect("envelope")).expect("encode")
    }

    #[tokio::test]
    async fn serves_requests_until_the_peer_closes() {
        let home = tempfile::tempdir().expect("tempdir");
        let codec = FrameCodec::new(1024, 1024 * 1024);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let (_stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(serve_connection(server, test_router(home.path()), codec, shutdown));

        codec.write_frame(&mut client, &echo("a", "one")).await.expect("write");
        codec.write_frame(&mut client, &echo("b", "two")).await.expect("write");

        let mut seen = Vec::new();
        for _ in 0..2 {
            let Some(Frame::Data(body)) = codec.read_frame(&mut client).await.expect("read") else {
                panic!("expected a reply frame");
            };
            let reply: ReplyEnvelope = serde_json::from_slice(&body).expect("reply");
            let echo: EchoMsg = reply.payload_as().expect("payload").expect("decode");
            seen.push((reply.id, echo.msg));
        }
        seen.sort();
        assert_eq!(seen, vec![("a".to_string(), "one".to_string()), ("b".to_string(), "two".to_string())]);

        client.shutdown().await.expect("shutdown");
        drop(client);
        assert!(task.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn oversized_requests_get_an_error_reply() {
        let home = tempfile::tempdir().expect("tempdir");
        let server_codec = FrameCodec::new(16, 1024 * 1024);
        let client_codec = FrameCodec::new(1024 * 1024, 1024 * 1024);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(serve_connection(server, test_router(home.path()), server_codec, shutdown));

        client_codec
            .write_frame(&mut client, &echo("big", &"x".repeat(100)))
            .await
            .expect("write");
        let Some(Frame::Data(body)) = client_codec.read_frame(&mut client).await.expect("read") else {
            panic!("expected a reply frame");
        };
        let reply: ReplyEnvelope = serde_json::from_slice(&body).expect("reply");
        assert!(reply.is_error);
        assert_eq!(reply.error.expect("error").code, "payload_too_large");
    }

    #[tokio::test]
    async fn shutdown_stops_reading() {
        let home = tempfile::tempdir().expect("tempdir");
        let codec = FrameCodec::new(1024, 1024);
        let (_client, server) = tokio::io::duplex(1024);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(serve_connection(server, test_router(home.path()), codec, shutdown));

        stop.send(true).expect("signal");
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.expect("stopped");
        assert!(result.expect("join").is_ok());
    }

    #[tokio::test]
    async fn tcp_server_answers_and_drains() {
        let home = tempfile::tempdir().expect("tempdir");
        let listener = RpcListener::bind_tcp("127.0.0.1", None).await.expect("bind");
        let address = listener.local_address().expect("address");
        let server = RpcServer::new(listener, test_router(home.path()));
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(server.run(shutdown));

        let mut stream = tokio::net::TcpStream::connect(&address).await.expect("connect");
        let codec = FrameCodec::new(1024 * 1024, 1024 * 1024);
        codec.write_frame(&mut stream, &echo("t", "tcp")).await.expect("write");
        let Some(Frame::Data(body)) = codec.read_frame(&mut stream).await.expect("read") else {
            panic!("expected a reply frame");
        };
        let reply: ReplyEnvelope = serde_json::from_slice(&body).expect("reply");
        assert_eq!(reply.id, "t");

        stop.send(true).expect("signal");
        let result = tokio::time::timeout(Duration::from_secs(10), running).await.expect("stopped");
        assert!(result.expect("join").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_is_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run").join("w.sock");
        let listener = RpcListener::bind_unix(&path).expect("bind");
        assert!(path.exists());
        assert_eq!(listener.local_address().expect("address"), path.display().to_string());
        drop(listener);
        assert!(!path.exists());
    }
}
