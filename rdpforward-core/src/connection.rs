use crate::classifier::{Classifier, Verdict};
use rdpforward_config::Config;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info_span};

/// Copy buffer for each splice direction.
const COPY_BUF_SIZE: usize = 4096;

/// Longest hex preview emitted for a packet in debug mode.
const PREVIEW_BYTES: usize = 32;

/// Terminal outcome of one splice direction.
///
/// `Rejected` is the classifier's sentinel: it has already been logged at
/// WARN when the verdict was reached, so teardown suppresses it instead of
/// reporting a second error.
#[derive(Debug)]
pub enum CopyError {
    Rejected,
    ClientRead(std::io::Error),
    TargetWrite(std::io::Error),
    TargetRead(std::io::Error),
    ClientWrite(std::io::Error),
}

impl CopyError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, CopyError::Rejected)
    }
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Rejected => write!(f, "连接被白名单策略拒绝"),
            CopyError::ClientRead(e) => write!(f, "客户端读取错误: {}", e),
            CopyError::TargetWrite(e) => write!(f, "写入服务器错误: {}", e),
            CopyError::TargetRead(e) => write!(f, "服务器读取错误: {}", e),
            CopyError::ClientWrite(e) => write!(f, "写入客户端错误: {}", e),
        }
    }
}

impl std::error::Error for CopyError {}

/// Per-connection handler: dials the upstream, runs the classifier over the
/// client-to-server direction, and splices both directions until one ends.
#[derive(Clone)]
pub struct ConnectionHandler {
    config: Arc<Config>,
}

impl ConnectionHandler {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub async fn handle_connection(&self, client: TcpStream, client_addr: SocketAddr, conn_id: u64) {
        let span = info_span!("conn", id = conn_id, peer = %client_addr);
        self.process_connection(client)
            .instrument(span)
            .await;
    }

    async fn process_connection(&self, client: TcpStream) {
        debug!("新连接");

        // The target is dialed before any client byte is read; on failure
        // the client socket is dropped without starting either copy task.
        let target = match self.dial_target().await {
            Ok(target) => target,
            Err(e) => {
                error!("连接目标失败: {}", e);
                return;
            }
        };
        debug!("已连接到目标 {}", self.config.target);

        let classifier = Classifier::new(self.config.clone());
        splice(client, target, classifier).await;

        debug!("连接关闭");
    }

    async fn dial_target(&self) -> std::io::Result<TcpStream> {
        let addr = lookup_host(self.config.target.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "无法解析目标地址")
            })?;
        TcpStream::connect(addr).await
    }
}

/// Bidirectional splice with deterministic teardown.
///
/// Both directions run as independent tasks posting their outcome onto a
/// rendezvous channel of capacity two. The first outcome settles the
/// connection: both tasks are aborted (a no-op for the finished one), which
/// drops their socket halves and thereby closes each socket exactly once;
/// both tasks are then joined and the channel drained before the connection
/// context is released. Only the first outcome is reported, and only when it
/// is neither EOF nor the classifier's rejection sentinel.
async fn splice(client: TcpStream, target: TcpStream, classifier: Classifier) {
    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target.into_split();
    let (done_tx, mut done_rx) = mpsc::channel::<Result<(), CopyError>>(2);

    let client_to_target = tokio::spawn(
        {
            let done_tx = done_tx.clone();
            async move {
                let outcome = copy_client_to_target(client_read, target_write, classifier).await;
                let _ = done_tx.send(outcome).await;
            }
        }
        .in_current_span(),
    );
    let target_to_client = tokio::spawn(
        async move {
            let outcome = copy_target_to_client(target_read, client_write).await;
            let _ = done_tx.send(outcome).await;
        }
        .in_current_span(),
    );

    // Capacity two keeps both sends non-blocking, so the first receive is
    // the first direction to terminate.
    let first = done_rx.recv().await;

    client_to_target.abort();
    target_to_client.abort();
    let _ = client_to_target.await;
    let _ = target_to_client.await;
    let _ = done_rx.try_recv();

    if let Some(Err(err)) = first
        && !err.is_rejection()
    {
        error!("{}", err);
    }
}

async fn copy_client_to_target(
    mut client: OwnedReadHalf,
    mut target: OwnedWriteHalf,
    mut classifier: Classifier,
) -> Result<(), CopyError> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut packet_index: u64 = 0;

    loop {
        let n = match client.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Err(CopyError::ClientRead(e)),
        };

        packet_index += 1;
        debug!("[包#{}] 客户端->服务器: {} 字节", packet_index, n);
        debug!("  前{}字节: {}", n.min(PREVIEW_BYTES), hex_preview(&buf[..n]));

        if !classifier.is_settled() {
            match classifier.observe(&buf[..n]) {
                Verdict::Rejected => return Err(CopyError::Rejected),
                Verdict::Admitted | Verdict::Continue => {}
            }
        }

        target
            .write_all(&buf[..n])
            .await
            .map_err(CopyError::TargetWrite)?;
    }

    Ok(())
}

async fn copy_target_to_client(
    mut target: OwnedReadHalf,
    mut client: OwnedWriteHalf,
) -> Result<(), CopyError> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut packet_index: u64 = 0;

    loop {
        let n = match target.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Err(CopyError::TargetRead(e)),
        };

        packet_index += 1;
        debug!("[响应#{}] 服务器->客户端: {} 字节", packet_index, n);
        debug!("  前{}字节: {}", n.min(PREVIEW_BYTES), hex_preview(&buf[..n]));

        client
            .write_all(&buf[..n])
            .await
            .map_err(CopyError::ClientWrite)?;
    }

    Ok(())
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(PREVIEW_BYTES)
        .fold(String::new(), |mut out, b| {
            let _ = write!(out, "{:02x}", b);
            out
        })
}
