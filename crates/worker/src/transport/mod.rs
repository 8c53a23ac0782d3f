// worker transport: the rpc listener, the STOMP control channel and, for
// bridged workers, the tunnel to the remote control plane.

pub mod bridge;
pub mod frame;
pub mod rpc;
pub mod stomp;

use std::{io, sync::Arc};

use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    config::WorkerSettings,
    error::{TransportError, WorkerError},
    registry::ArtifactRegistry,
    router::RequestRouter,
};

pub use bridge::{run_bridge, BridgeConfig, LocalTarget};
pub use frame::{Frame, FrameCodec};
pub use rpc::{serve_connection, RpcListener, RpcServer};
pub use stomp::{fragment_reply, ControlAuth, ControlChannel, ReplyFragment, StompFrame};

pub const INTERNAL_WORKER_ID: &str = "INTERNAL";
pub const EXTERNAL_WORKER_ID: &str = "EXTERNAL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMode {
    // runs next to the control plane, listening on host:port
    CoLocated,
    // reached through the bridge tunnel of a remote control plane
    Bridged { remote: String, api_key: String },
}

impl WorkerMode {
    pub fn worker_id(&self) -> &'static str {
        match self {
            WorkerMode::CoLocated => INTERNAL_WORKER_ID,
            WorkerMode::Bridged { .. } => EXTERNAL_WORKER_ID,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, WorkerMode::Bridged { .. })
    }
}

// requests an orderly shutdown of a started worker
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

pub struct Worker {
    settings: WorkerSettings,
    mode: WorkerMode,
    router: Arc<RequestRouter>,
    stop: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub fn new(settings: WorkerSettings, mode: WorkerMode, registry: Arc<ArtifactRegistry>) -> Self {
        let router = RequestRouter::new(settings.clone(), registry).with_remote(mode.is_remote());
        Self::with_router(settings, mode, router)
    }

    pub fn with_router(settings: WorkerSettings, mode: WorkerMode, router: RequestRouter) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            settings,
            mode,
            router: Arc::new(router),
            stop: Arc::new(stop),
        }
    }

    pub fn worker_id(&self) -> &'static str {
        self.mode.worker_id()
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    async fn bind(&self) -> io::Result<RpcListener> {
        match self.mode {
            WorkerMode::CoLocated => RpcListener::bind_tcp(&self.settings.host, self.settings.port).await,
            WorkerMode::Bridged { .. } => {
                #[cfg(unix)]
                let listener = RpcListener::bind_unix(self.settings.socket_path(self.worker_id()));
                #[cfg(not(unix))]
                let listener = RpcListener::bind_tcp("127.0.0.1", None).await;
                listener
            }
        }
    }

    // runs until Ctrl-C, a stop request from the control plane, or a
    // `StopHandle::stop`
    pub async fn start(self) -> Result<(), WorkerError> {
        let worker_id = self.worker_id();
        let span = info_span!("worker", worker_id);
        self.run(worker_id).instrument(span).await
    }

    async fn run(self, worker_id: &'static str) -> Result<(), WorkerError> {
        let listener = self.bind().await?;
        let address = listener.local_address()?;
        self.router.set_internal_address(address.clone());

        let (rpc_stop, rpc_shutdown) = watch::channel(false);
        let rpc = tokio::spawn(RpcServer::new(listener, Arc::clone(&self.router)).run(rpc_shutdown));

        let auth = match &self.mode {
            WorkerMode::CoLocated => ControlAuth::Token(self.settings.internal_token.clone()),
            WorkerMode::Bridged { api_key, .. } => ControlAuth::Jwt(api_key.clone()),
        };
        let connected = ControlChannel::connect(
            &self.settings.control_addr,
            worker_id,
            auth,
            self.settings.connect_timeout,
            self.settings.stomp_reply_size,
            Arc::clone(&self.router),
        )
        .await;
        let control = match connected {
            Ok(control) => control,
            Err(e) => {
                error!(addr = %self.settings.control_addr, error = %e, "failed to connect the control channel");
                rpc_stop.send_replace(true);
                let _ = rpc.await;
                return Err(e.into());
            }
        };

        let (bridge_stop, bridge_shutdown) = watch::channel(false);
        let mut bridge = match &self.mode {
            WorkerMode::Bridged { remote, api_key } => {
                let config = BridgeConfig {
                    remote: remote.clone(),
                    worker_id: worker_id.to_string(),
                    api_key: api_key.clone(),
                    local: LocalTarget::from_address(&address),
                    max_backoff: self.settings.bridge_max_backoff,
                };
                Some(tokio::spawn(run_bridge(config, bridge_shutdown).in_current_span()))
            }
            WorkerMode::CoLocated => None,
        };
        info!(%address, "worker started");

        let stop_requested = self.router.stop_signal();
        let mut stop = self.stop.subscribe();
        let mut failure = None;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = stop_requested.notified() => info!("stop requested by the control plane"),
            _ = rpc::stopped(&mut stop) => info!("stop requested"),
            ended = async {
                match bridge.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            } => {
                bridge = None;
                match ended {
                    Ok(Ok(())) => warn!("bridge ended unexpectedly"),
                    Ok(Err(e)) => failure = Some(e),
                    Err(e) => failure = Some(TransportError::Io(io::Error::other(e))),
                }
            }
        }

        info!("shutting down");
        if let Some(handle) = bridge {
            bridge_stop.send_replace(true);
            if let Ok(Err(e)) = handle.await {
                warn!(error = %e, "bridge stopped with an error");
            }
        }
        control.close().await;

        rpc_stop.send_replace(true);
        match rpc.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "rpc server stopped with an error"),
            Err(e) => warn!(error = %e, "rpc server panicked"),
        }
        info!("worker stopped");

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_router(home: &std::path::Path) -> Arc<RequestRouter> {
    use crate::artifacts::ArtifactResolver;

    let settings = WorkerSettings {
        home: home.to_path_buf(),
        ..WorkerSettings::default()
    };
    let registry = Arc::new(ArtifactRegistry::new(ArtifactResolver::new(settings.projects_dir())));
    Arc::new(RequestRouter::new(settings, registry))
}
