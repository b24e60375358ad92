//! Recorder lifecycle: bind (or fall back in-process), serve on a dedicated thread,
//! stop with a bounded join.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::client::CommProxyClient;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::registry::InProcessRegistry;
use crate::server::serve;
use crate::service::ActionService;
use crate::trace::{CommTraceWriter, TraceRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Http(SocketAddr),
    InProcess { host: String, port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Graceful,
    /// Graceful shutdown missed the join timeout and the runtime was torn down.
    Forced,
}

pub struct CommProxyRecorder;

impl CommProxyRecorder {
    pub fn start(config: ProxyConfig, registry: InProcessRegistry) -> ProxyResult<RecorderHandle> {
        let trace = Arc::new(CommTraceWriter::open(&config.trace_path)?);
        let service = Arc::new(ActionService::new(
            &config.action_endpoint,
            config.max_body_bytes,
            trace,
        ));

        if config.force_in_process {
            return start_in_process(config, registry, service, "forced");
        }

        let addr = format!("{}:{}", config.host, config.port);
        let listener = match std::net::TcpListener::bind(addr.as_str()) {
            Ok(l) => l,
            Err(e) if matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::AddrNotAvailable) => {
                tracing::warn!(
                    target: "droidaudit.proxy",
                    %addr,
                    error = %e,
                    "socket bind refused, falling back to in-process transport"
                );
                return start_in_process(config, registry, service, "bind_refused");
            }
            Err(source) => return Err(ProxyError::Bind { addr, source }),
        };
        listener
            .set_nonblocking(true)
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("droidaudit-proxy")
            .enable_all()
            .build()
            .map_err(|e| ProxyError::Runtime(e.to_string()))?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let join_timeout = Duration::from_millis(config.stop_join_timeout_ms);
        let serve_service = service.clone();
        let thread = std::thread::Builder::new()
            .name("droidaudit-proxy-main".to_string())
            .spawn(move || run_server(runtime, listener, serve_service, stop_rx, join_timeout))
            .map_err(|e| ProxyError::Runtime(e.to_string()))?;

        tracing::info!(
            target: "droidaudit.proxy",
            addr = %local,
            trace = %config.trace_path.display(),
            "recorder started"
        );
        Ok(RecorderHandle {
            config,
            transport: Transport::Http(local),
            service,
            registry,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            stopped: false,
        })
    }
}

fn start_in_process(
    config: ProxyConfig,
    registry: InProcessRegistry,
    service: Arc<ActionService>,
    reason: &str,
) -> ProxyResult<RecorderHandle> {
    registry.register(&config.host, config.port, service.clone())?;
    tracing::info!(
        target: "droidaudit.proxy",
        host = %config.host,
        port = config.port,
        reason,
        "recorder started in-process"
    );
    Ok(RecorderHandle {
        transport: Transport::InProcess {
            host: config.host.clone(),
            port: config.port,
        },
        config,
        service,
        registry,
        stop_tx: None,
        thread: None,
        stopped: false,
    })
}

fn run_server(
    runtime: tokio::runtime::Runtime,
    listener: std::net::TcpListener,
    service: Arc<ActionService>,
    stop_rx: oneshot::Receiver<()>,
    join_timeout: Duration,
) -> StopOutcome {
    let outcome = runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(target: "droidaudit.proxy", error = %e, "listener setup failed");
                return StopOutcome::Graceful;
            }
        };
        let (graceful_tx, graceful_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(serve(listener, service, async move {
            let _ = graceful_rx.await;
        }));
        tokio::select! {
            res = &mut server => {
                if let Ok(Err(e)) = res {
                    tracing::error!(target: "droidaudit.proxy", error = %e, "server exited");
                }
                return StopOutcome::Graceful;
            }
            _ = stop_rx => {}
        }
        let _ = graceful_tx.send(());
        match tokio::time::timeout(join_timeout, server).await {
            Ok(_) => StopOutcome::Graceful,
            Err(_) => StopOutcome::Forced,
        }
    });
    runtime.shutdown_timeout(Duration::ZERO);
    outcome
}

pub struct RecorderHandle {
    config: ProxyConfig,
    transport: Transport,
    service: Arc<ActionService>,
    registry: InProcessRegistry,
    stop_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<StopOutcome>>,
    stopped: bool,
}

impl RecorderHandle {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self.transport, Transport::InProcess { .. })
    }

    /// Host and port callers should target; for HTTP this is the bound address.
    pub fn endpoint(&self) -> (String, u16) {
        match &self.transport {
            Transport::Http(addr) => (addr.ip().to_string(), addr.port()),
            Transport::InProcess { host, port } => (host.clone(), *port),
        }
    }

    pub fn client(&self) -> ProxyResult<CommProxyClient> {
        let (host, port) = self.endpoint();
        CommProxyClient::new(&host, port, &self.config.action_endpoint, self.registry.clone())
    }

    /// Appends a `message` line, e.g. a harness annotation between actions.
    pub fn record_message(&self, endpoint: &str, payload: Value) -> ProxyResult<()> {
        self.service
            .trace()
            .append(&TraceRecord::message(endpoint, payload))
    }

    pub fn stop(mut self) -> ProxyResult<StopOutcome> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> ProxyResult<StopOutcome> {
        if self.stopped {
            return Ok(StopOutcome::Graceful);
        }
        self.stopped = true;
        if let Transport::InProcess { host, port } = &self.transport {
            self.registry.unregister(host, *port);
            tracing::info!(target: "droidaudit.proxy", %host, port, "in-process recorder stopped");
            return Ok(StopOutcome::Graceful);
        }
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(StopOutcome::Graceful);
        };
        let outcome = thread
            .join()
            .map_err(|_| ProxyError::Runtime("recorder thread panicked".to_string()))?;
        match outcome {
            StopOutcome::Graceful => {
                tracing::info!(target: "droidaudit.proxy", "recorder stopped")
            }
            StopOutcome::Forced => tracing::warn!(
                target: "droidaudit.proxy",
                timeout_ms = self.config.stop_join_timeout_ms,
                "graceful shutdown timed out, runtime forced down"
            ),
        }
        Ok(outcome)
    }
}

impl Drop for RecorderHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
