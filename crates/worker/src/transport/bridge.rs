// bridge tunnel: keeps an outbound service connection to the remote control
// plane and pipes each session it opens to the local rpc listener.
//
// service protocol (newline-terminated lines):
//   worker -> service  WORKER <worker-id> <api-key>
//   service -> worker  OK | ERR <reason>
//   service -> worker  OPEN <session>       (repeated)
// each OPEN is answered by a new connection starting with DATA <session>.

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::rpc::stopped;
use crate::error::TransportError;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

// service lines are short control words
const MAX_LINE_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTarget {
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl LocalTarget {
    // target for a listener address as reported by `RpcListener::local_address`
    pub fn from_address(address: &str) -> Self {
        #[cfg(unix)]
        {
            if address.starts_with('/') {
                return LocalTarget::Unix(PathBuf::from(address));
            }
        }
        LocalTarget::Tcp(address.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    // service address (host:port)
    pub remote: String,
    pub worker_id: String,
    pub api_key: String,
    pub local: LocalTarget,
    pub max_backoff: Duration,
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

// reads one service line into `line`; false at end of stream
async fn read_service_line<R>(reader: &mut R, line: &mut String) -> Result<bool, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut limited = (&mut *reader).take(MAX_LINE_BYTES as u64 + 1);
    if limited.read_line(line).await? == 0 {
        return Ok(false);
    }
    if !line.ends_with('\n') && line.len() > MAX_LINE_BYTES {
        return Err(TransportError::FrameTooLarge {
            size: line.len(),
            limit: MAX_LINE_BYTES,
        });
    }
    Ok(true)
}

pub async fn handshake<S>(stream: &mut BufReader<S>, worker_id: &str, api_key: &str) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("WORKER {worker_id} {api_key}\n").as_bytes())
        .await?;
    stream.flush().await?;

    let mut line = String::new();
    if !read_service_line(stream, &mut line).await? {
        return Err(TransportError::Closed);
    }
    let answer = line.trim_end();
    match answer.split_once(' ') {
        _ if answer == "OK" => Ok(()),
        Some(("ERR", reason)) => Err(TransportError::Handshake(reason.to_string())),
        _ if answer == "ERR" => Err(TransportError::Handshake("rejected".to_string())),
        _ => Err(TransportError::Handshake(format!("unexpected answer '{answer}'"))),
    }
}

// runs until shutdown; a rejected handshake stops the bridge for good
pub async fn run_bridge(config: BridgeConfig, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
    let config = Arc::new(config);
    let mut sessions = JoinSet::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let attempt = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            attempt = serve_tunnel(&config, &mut sessions, &mut backoff) => attempt,
        };
        match attempt {
            Ok(()) => info!("bridge connection closed by the service"),
            Err(TransportError::Handshake(reason)) => {
                error!(%reason, "bridge handshake rejected");
                sessions.abort_all();
                return Err(TransportError::Handshake(reason));
            }
            Err(e) => warn!(error = %e, "bridge connection lost"),
        }

        let delay = backoff;
        backoff = next_backoff(backoff, config.max_backoff);
        info!(delay_ms = delay.as_millis() as u64, "reconnecting bridge");
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(sessions = sessions.len(), "bridge stopped");
    sessions.abort_all();
    Ok(())
}

async fn serve_tunnel(
    config: &Arc<BridgeConfig>,
    sessions: &mut JoinSet<()>,
    backoff: &mut Duration,
) -> Result<(), TransportError> {
    let stream = TcpStream::connect(&config.remote).await?;
    let mut service = BufReader::new(stream);
    handshake(&mut service, &config.worker_id, &config.api_key).await?;
    info!(remote = %config.remote, "bridge connected");
    *backoff = INITIAL_BACKOFF;

    let mut line = String::new();
    loop {
        while sessions.try_join_next().is_some() {}

        if !read_service_line(&mut service, &mut line).await? {
            return Ok(());
        }
        match line.trim_end().split_once(' ') {
            Some(("OPEN", session)) if !session.is_empty() => {
                let session = session.to_string();
                let span = info_span!("session", %session);
                sessions.spawn(open_session(Arc::clone(config), session).instrument(span));
            }
            _ => debug!(line = line.trim_end(), "ignoring bridge line"),
        }
    }
}

async fn open_session(config: Arc<BridgeConfig>, session: String) {
    match pipe_session(&config, &session).await {
        Ok((up, down)) => debug!(up, down, "session closed"),
        Err(e) => warn!(error = %e, "session failed"),
    }
}

async fn pipe_session(config: &BridgeConfig, session: &str) -> io::Result<(u64, u64)> {
    let mut remote = TcpStream::connect(&config.remote).await?;
    remote.write_all(format!("DATA {session}\n").as_bytes()).await?;

    match &config.local {
        LocalTarget::Tcp(addr) => {
            let mut local = TcpStream::connect(addr).await?;
            tokio::io::copy_bidirectional(&mut remote, &mut local).await
        }
        #[cfg(unix)]
        LocalTarget::Unix(path) => {
            let mut local = tokio::net::UnixStream::connect(path).await?;
            tokio::io::copy_bidirectional(&mut remote, &mut local).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_secs(30);
        let mut delay = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay, max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn local_targets_follow_the_listener_address() {
        assert_eq!(LocalTarget::from_address("127.0.0.1:4000"), LocalTarget::Tcp("127.0.0.1:4000".into()));
        #[cfg(unix)]
        assert_eq!(
            LocalTarget::from_address("/tmp/run/ml-worker-x.sock"),
            LocalTarget::Unix(PathBuf::from("/tmp/run/ml-worker-x.sock"))
        );
    }

    async fn answer_handshake(answer: &'static str) -> (String, Result<(), TransportError>) {
        let (client, server) = tokio::io::duplex(1024);
        let service = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            server.read_line(&mut line).await.expect("hello");
            server.write_all(answer.as_bytes()).await.expect("answer");
            line
        });
        let mut client = BufReader::new(client);
        let result = handshake(&mut client, "w1", "key-1").await;
        (service.await.expect("service"), result)
    }

    #[tokio::test]
    async fn handshake_accepts_ok() {
        let (hello, result) = answer_handshake("OK\n").await;
        assert_eq!(hello, "WORKER w1 key-1\n");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn handshake_reports_the_refusal() {
        let (_, result) = answer_handshake("ERR unknown api key\n").await;
        assert!(matches!(result, Err(TransportError::Handshake(reason)) if reason == "unknown api key"));

        let (_, result) = answer_handshake("HELLO\n").await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn endless_service_lines_are_refused() {
        let (client, server) = tokio::io::duplex(1024);
        let service = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            server.read_line(&mut line).await.expect("hello");
            let flood = vec![b'A'; 4 * MAX_LINE_BYTES];
            let _ = server.write_all(&flood).await;
        });
        let mut client = BufReader::new(client);
        let result = handshake(&mut client, "w1", "key-1").await;
        assert!(matches!(
            result,
            Err(TransportError::FrameTooLarge { limit: MAX_LINE_BYTES, .. })
        ));
        drop(client);
        let _ = service.await;
    }

    #[tokio::test]
    async fn sessions_are_piped_to_the_local_listener() {
        // local side: echoes whatever it receives
        let local = TcpListener::bind("127.0.0.1:0").await.expect("bind local");
        let local_addr = local.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (mut stream, _) = local.accept().await.expect("accept local");
            let (mut rd, mut wr) = stream.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });

        let service = TcpListener::bind("127.0.0.1:0").await.expect("bind service");
        let remote = service.local_addr().expect("addr").to_string();

        let (stop, shutdown) = watch::channel(false);
        let bridge = tokio::spawn(run_bridge(
            BridgeConfig {
                remote,
                worker_id: "w9".into(),
                api_key: "k".into(),
                local: LocalTarget::Tcp(local_addr),
                max_backoff: Duration::from_secs(2),
            },
            shutdown,
        ));

        let (control, _) = service.accept().await.expect("accept control");
        let mut control = BufReader::new(control);
        let mut line = String::new();
        control.read_line(&mut line).await.expect("hello");
        assert_eq!(line, "WORKER w9 k\n");
        control.write_all(b"OK\nOPEN s-1\n").await.expect("open");

        let (data, _) = service.accept().await.expect("accept data");
        let mut data = BufReader::new(data);
        line.clear();
        data.read_line(&mut line).await.expect("data line");
        assert_eq!(line, "DATA s-1\n");

        data.write_all(b"ping").await.expect("write");
        let mut echoed = [0u8; 4];
        data.read_exact(&mut echoed).await.expect("echo");
        assert_eq!(&echoed, b"ping");

        stop.send(true).expect("stop");
        let result = tokio::time::timeout(Duration::from_secs(5), bridge).await.expect("stopped");
        assert!(result.expect("join").is_ok());
    }
}
