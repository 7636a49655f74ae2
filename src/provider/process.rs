//! Out-of-process provider plugins.
//!
//! A plugin is an executable that speaks the framed JSON protocol from
//! [`codec`](super::codec) over its stdin and stdout. Calls are multiplexed:
//! each request carries an id, a background task reads responses and hands
//! each one to the caller waiting on that id. When the plugin's output
//! closes, every waiting call fails with [`ProviderError::Crashed`]; a frame
//! that is not a valid response fails them with [`ProviderError::Protocol`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::ProviderError;
use crate::resource::PropertyMap;

use super::capability::Provider;
use super::codec::{read_frame, write_json, RequestFrame, ResponseFrame};
use super::types::{
    CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest, DiffRequest,
    DiffResponse, InvokeRequest, InvokeResponse, ProviderInfo, ReadRequest, ReadResponse,
    UpdateRequest, UpdateResponse,
};

/// How long a plugin gets to exit after `shutdown`.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = Result<Value, ProviderError>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Serialize)]
struct ConfigureParams<'a> {
    config: &'a PropertyMap,
}

/// Calls awaiting a response, and why the plugin stopped if it has.
#[derive(Default)]
struct Pending {
    waiting: HashMap<u64, (&'static str, oneshot::Sender<Reply>)>,
    closed: Option<String>,
}

/// A provider running as a child process.
pub struct ProcessProvider {
    package: String,
    info: ProviderInfo,
    writer: Mutex<Option<Writer>>,
    pending: Arc<StdMutex<Pending>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for ProcessProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProvider")
            .field("package", &self.package)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl ProcessProvider {
    /// Starts the plugin at `path` and performs the `info` handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Crashed`] if the process cannot be started
    /// or exits during the handshake, or [`ProviderError::Protocol`] if it
    /// reports a different package.
    pub async fn spawn(package: &str, path: &Path) -> Result<Self, ProviderError> {
        info!("Starting provider plugin: {}", path.display());

        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Crashed {
                package: package.to_string(),
                message: format!("failed to start {}: {e}", path.display()),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ProviderError::Crashed {
                package: package.to_string(),
                message: "plugin stdio was not captured".to_string(),
            });
        };

        if let Some(stderr) = child.stderr.take() {
            let package = package.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin = %package, "{}", line);
                }
            });
        }

        Self::connect(package, stdout, stdin, Some(child)).await
    }

    /// Speaks the plugin protocol over an arbitrary transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the `info` handshake fails.
    pub async fn connect<R, W>(
        package: &str,
        reader: R,
        writer: W,
        child: Option<Child>,
    ) -> Result<Self, ProviderError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(StdMutex::new(Pending::default()));
        let reader = tokio::spawn(read_responses(
            package.to_string(),
            reader,
            Arc::clone(&pending),
        ));

        let mut provider = Self {
            package: package.to_string(),
            info: ProviderInfo::new(package),
            writer: Mutex::new(Some(Box::new(writer))),
            pending,
            next_id: AtomicU64::new(1),
            reader,
            child: Mutex::new(child),
        };

        let info: ProviderInfo = provider.call("info", &json!({})).await?;
        if info.package != package {
            return Err(ProviderError::protocol(
                package,
                format!("plugin serves package '{}'", info.package),
            ));
        }
        debug!(
            "Provider {} ready (version {})",
            package,
            info.version.as_deref().unwrap_or("unknown")
        );
        provider.info = info;
        Ok(provider)
    }

    async fn call<P, R>(&self, method: &'static str, params: &P) -> Result<R, ProviderError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| ProviderError::protocol(&self.package, format!("encode {method}: {e}")))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(reason) = &pending.closed {
                return Err(self.crashed(reason.clone()));
            }
            pending.waiting.insert(id, (method, tx));
        }

        let frame = RequestFrame {
            id,
            method: method.to_string(),
            params,
        };
        trace!("-> {} #{} {}", self.package, id, method);

        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => write_json(writer, &frame).await.map_err(|e| e.to_string()),
                None => Err("plugin input is closed".to_string()),
            }
        };
        if let Err(message) = sent {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .waiting
                .remove(&id);
            return Err(self.crashed(message));
        }

        let value = rx
            .await
            .map_err(|_| self.crashed("response reader stopped".to_string()))??;
        serde_json::from_value(value)
            .map_err(|e| ProviderError::protocol(&self.package, format!("decode {method}: {e}")))
    }

    fn crashed(&self, message: String) -> ProviderError {
        ProviderError::Crashed {
            package: self.package.clone(),
            message,
        }
    }
}

/// Why the response reader stopped.
enum Stopped {
    /// The plugin's output ended or could not be read.
    Closed(String),
    /// The plugin sent a frame that is not a response; the stream can no
    /// longer be trusted.
    Malformed(String),
}

async fn read_responses<R>(package: String, mut reader: R, pending: Arc<StdMutex<Pending>>)
where
    R: AsyncRead + Unpin,
{
    let stopped = loop {
        let payload = match read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break Stopped::Closed("plugin closed its output".to_string()),
            Err(e) => break Stopped::Closed(format!("failed to read from plugin: {e}")),
        };

        let frame: ResponseFrame = match serde_json::from_slice(&payload) {
            Ok(frame) => frame,
            Err(e) => break Stopped::Malformed(format!("malformed response frame: {e}")),
        };
        trace!("<- {} #{}", package, frame.id);

        let waiter = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .remove(&frame.id);
        let Some((operation, tx)) = waiter else {
            warn!("Provider {} answered unknown request #{}", package, frame.id);
            continue;
        };

        let reply = match (frame.error, frame.result) {
            (Some(error), _) => Err(error.into_error(&package, operation)),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        let _ = tx.send(reply);
    };

    let reason = match &stopped {
        Stopped::Closed(reason) => {
            debug!("Provider {} stopped: {}", package, reason);
            reason.clone()
        }
        Stopped::Malformed(reason) => {
            warn!("Provider {} sent a {}", package, reason);
            reason.clone()
        }
    };
    let waiting = {
        let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.closed = Some(reason.clone());
        std::mem::take(&mut pending.waiting)
    };
    for (_, (_, tx)) in waiting {
        let error = match &stopped {
            Stopped::Closed(_) => ProviderError::Crashed {
                package: package.clone(),
                message: reason.clone(),
            },
            Stopped::Malformed(_) => ProviderError::protocol(&package, reason.clone()),
        };
        let _ = tx.send(Err(error));
    }
}

impl Drop for ProcessProvider {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Provider for ProcessProvider {
    fn info(&self) -> ProviderInfo {
        self.info.clone()
    }

    async fn configure(&self, config: &PropertyMap) -> Result<(), ProviderError> {
        let _: Value = self.call("configure", &ConfigureParams { config }).await?;
        Ok(())
    }

    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, ProviderError> {
        self.call("check", &request).await
    }

    async fn diff(&self, request: DiffRequest) -> Result<DiffResponse, ProviderError> {
        self.call("diff", &request).await
    }

    async fn create(&self, request: CreateRequest) -> Result<CreateResponse, ProviderError> {
        self.call("create", &request).await
    }

    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, ProviderError> {
        self.call("update", &request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<(), ProviderError> {
        let _: Value = self.call("delete", &request).await?;
        Ok(())
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResponse, ProviderError> {
        self.call("read", &request).await
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        self.call("invoke", &request).await
    }

    async fn shutdown(&self) {
        if let Err(e) = self.call::<_, Value>("shutdown", &json!({})).await {
            debug!("Provider {} shutdown request failed: {}", self.package, e);
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!("Provider {} exited with status: {}", self.package, status),
            Ok(Err(e)) => warn!("Error waiting for provider {}: {}", self.package, e),
            Err(_) => {
                warn!("Provider {} did not exit in time, killing", self.package);
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::codec::{write_frame, write_json, ErrorFrame};
    use crate::resource::Urn;
    use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

    type ServerIo = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

    async fn next_request(io: &mut ServerIo) -> Option<RequestFrame> {
        let payload = read_frame(&mut io.0).await.expect("read")?;
        Some(serde_json::from_slice(&payload).expect("request"))
    }

    async fn answer_info(io: &mut ServerIo) {
        let request = next_request(io).await.expect("info request");
        assert_eq!(request.method, "info");
        let info = ProviderInfo::new("fake").with_version("1.2.3");
        write_json(&mut io.1, &ResponseFrame::ok(request.id, serde_json::to_value(info).unwrap()))
            .await
            .expect("write");
    }

    fn pipe() -> (ProcessProviderIo, ServerIo) {
        let (engine, plugin) = tokio::io::duplex(4096);
        let (reader, writer) = split(engine);
        ((reader, writer), split(plugin))
    }

    type ProcessProviderIo = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

    fn urn() -> Urn {
        Urn::parse("urn:converge:dev::app::fake:Thing::a").unwrap()
    }

    #[tokio::test]
    async fn test_handshake_reads_info() {
        let ((reader, writer), mut server) = pipe();
        let plugin = tokio::spawn(async move { answer_info(&mut server).await });

        let provider = ProcessProvider::connect("fake", reader, writer, None)
            .await
            .expect("connect");
        plugin.await.expect("plugin");

        assert_eq!(provider.info().version.as_deref(), Some("1.2.3"));
    }

    #[tokio::test]
    async fn test_responses_are_matched_by_id() {
        let ((reader, writer), mut server) = pipe();
        let plugin = tokio::spawn(async move {
            answer_info(&mut server).await;
            let first = next_request(&mut server).await.expect("first");
            let second = next_request(&mut server).await.expect("second");
            // Answer out of order.
            for request in [second, first] {
                let name = request.params["urn"].as_str().unwrap().rsplit("::").next().unwrap().to_string();
                let response = json!({"id": format!("id-{name}"), "outputs": {}});
                write_json(&mut server.1, &ResponseFrame::ok(request.id, response))
                    .await
                    .expect("write");
            }
            server
        });

        let provider = ProcessProvider::connect("fake", reader, writer, None)
            .await
            .expect("connect");

        let a = CreateRequest {
            urn: urn(),
            inputs: PropertyMap::new(),
        };
        let b = CreateRequest {
            urn: Urn::parse("urn:converge:dev::app::fake:Thing::b").unwrap(),
            inputs: PropertyMap::new(),
        };
        let (ra, rb) = tokio::join!(provider.create(a), provider.create(b));
        let _server = plugin.await.expect("plugin");

        assert_eq!(ra.expect("a").id, "id-a");
        assert_eq!(rb.expect("b").id, "id-b");
    }

    #[tokio::test]
    async fn test_error_frames_become_provider_errors() {
        let ((reader, writer), mut server) = pipe();
        let plugin = tokio::spawn(async move {
            answer_info(&mut server).await;
            let request = next_request(&mut server).await.expect("create");
            let error = ErrorFrame::Partial {
                urn: Urn::parse("urn:converge:dev::app::fake:Thing::a").unwrap(),
                id: Some("half".to_string()),
                outputs: PropertyMap::new(),
                reasons: vec!["not ready".to_string()],
            };
            write_json(&mut server.1, &ResponseFrame::err(request.id, error))
                .await
                .expect("write");
            server
        });

        let provider = ProcessProvider::connect("fake", reader, writer, None)
            .await
            .expect("connect");
        let err = provider
            .create(CreateRequest {
                urn: urn(),
                inputs: PropertyMap::new(),
            })
            .await
            .unwrap_err();
        let _server = plugin.await.expect("plugin");

        match err {
            ProviderError::Partial { id, reasons, .. } => {
                assert_eq!(id.as_deref(), Some("half"));
                assert_eq!(reasons, vec!["not ready".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_plugin_exit_fails_waiting_calls() {
        let ((reader, writer), mut server) = pipe();
        let plugin = tokio::spawn(async move {
            answer_info(&mut server).await;
            let _ = next_request(&mut server).await.expect("check");
            drop(server);
        });

        let provider = ProcessProvider::connect("fake", reader, writer, None)
            .await
            .expect("connect");
        let err = provider
            .check(CheckRequest {
                urn: urn(),
                olds: PropertyMap::new(),
                news: PropertyMap::new(),
            })
            .await
            .unwrap_err();
        plugin.await.expect("plugin");

        assert!(matches!(err, ProviderError::Crashed { .. }));

        let again = provider
            .read(ReadRequest {
                urn: urn(),
                id: "x".to_string(),
                inputs: PropertyMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(again, ProviderError::Crashed { .. }));
    }

    #[tokio::test]
    async fn test_malformed_response_fails_waiting_calls_promptly() {
        let ((reader, writer), mut server) = pipe();
        let plugin = tokio::spawn(async move {
            answer_info(&mut server).await;
            let _ = next_request(&mut server).await.expect("check");
            write_frame(&mut server.1, b"{\"not\": \"a response\"}")
                .await
                .expect("write");
            server
        });

        let provider = ProcessProvider::connect("fake", reader, writer, None)
            .await
            .expect("connect");
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            provider.check(CheckRequest {
                urn: urn(),
                olds: PropertyMap::new(),
                news: PropertyMap::new(),
            }),
        )
        .await
        .expect("call should fail without waiting for a deadline")
        .unwrap_err();
        let _server = plugin.await.expect("plugin");

        assert!(matches!(err, ProviderError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_wrong_package_is_a_protocol_error() {
        let ((reader, writer), mut server) = pipe();
        let plugin = tokio::spawn(async move {
            answer_info(&mut server).await;
            server
        });

        let err = ProcessProvider::connect("other", reader, writer, None)
            .await
            .unwrap_err();
        let _server = plugin.await.expect("plugin");
        assert!(matches!(err, ProviderError::Protocol { .. }));
    }
}
