pub mod classifier;
pub mod connection;
pub mod rdp;

use connection::ConnectionHandler;
use rdpforward_config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Runs the forwarding server with the given configuration.
///
/// Binds the configured listen endpoint, logs the startup summary, and
/// accepts connections until a shutdown signal arrives. Each connection is
/// handled in its own task; in-flight connections run to natural completion
/// after shutdown.
///
/// # Arguments
///
/// * `config` - The frozen runtime configuration
/// * `shutdown_rx` - Broadcast receiver closing the accept loop
///
/// # Returns
///
/// Returns `Ok(())` on clean shutdown (via Ctrl+C or the shutdown channel),
/// or an error if the listener cannot be created.
///
/// # Examples
///
/// ```no_run
/// use rdpforward_config::Config;
/// use rdpforward_core::run_forwarder;
/// use tokio::sync::broadcast;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let config = Config {
///     target: "10.0.0.2:3389".to_string(),
///     ..Config::default()
/// };
/// let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
/// run_forwarder(config, shutdown_rx).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_forwarder(
    config: Config,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(config.bind_addr()).await?;

    info!("监听端口: {}", config.listen);
    info!("转发目标: {}", config.target);
    if !config.sni_whitelist.is_empty() {
        info!("SNI白名单（TLS目标域名/IP）: {}", config.sni_whitelist);
    } else {
        info!("SNI白名单: 未设置");
    }
    if !config.client_whitelist.is_empty() {
        info!("客户端白名单（计算机名）: {}", config.client_whitelist);
    } else {
        info!("客户端白名单: 未设置");
    }
    if config.sni_whitelist.is_empty() && config.client_whitelist.is_empty() {
        info!("访问控制: 允许所有连接");
    }
    if config.debug {
        info!("调试模式: 已启用");
    }

    serve(listener, config, shutdown_rx).await
}

/// Accept loop over an already-bound listener.
///
/// Split out of [`run_forwarder`] so tests can bind an ephemeral port and
/// learn the address before serving. Connection ids are assigned here, by the
/// single accept task, strictly increasing in accept order.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);
    let handler = ConnectionHandler::new(config);
    let mut conn_id: u64 = 0;
    let mut connection_handles = Vec::new();

    info!("等待连接...");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("服务正在停止...");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("服务正在停止...");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        conn_id += 1;
                        let handler = handler.clone();
                        let handle = tokio::spawn(async move {
                            handler.handle_connection(socket, addr, conn_id).await;
                        });
                        connection_handles.push(handle);

                        // Cleanup completed handles to prevent unbounded growth
                        connection_handles.retain(|h| !h.is_finished());
                    }
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                    }
                }
            }
        }
    }

    // In-flight connections are not forcibly terminated; wait for them.
    for handle in connection_handles {
        let _ = handle.await;
    }

    Ok(())
}

const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;

/// Minimum bytes before the ClientHello fixed part can even be addressed:
/// 5-byte record header, 4-byte handshake header, 2-byte version, 32-byte random.
const CLIENT_HELLO_FIXED_END: usize = 43;

/// Errors that rule a buffer out as an SNI-bearing TLS ClientHello.
#[derive(Debug, PartialEq, Eq)]
pub enum SniError {
    /// The buffer is too short to hold a ClientHello prefix
    TooShort,
    /// The TLS record type is not 0x16 (Handshake)
    NotTlsHandshake,
    /// The handshake message is not ClientHello (0x01)
    NotClientHello,
}

impl std::fmt::Display for SniError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SniError::TooShort => write!(f, "data too short"),
            SniError::NotTlsHandshake => write!(f, "not a TLS handshake"),
            SniError::NotClientHello => write!(f, "not a ClientHello"),
        }
    }
}

impl std::error::Error for SniError {}

/// Extracts the Server Name Indication (SNI) from a TLS ClientHello record.
///
/// Performs a bounded walk over the record and handshake layers of a single
/// buffer. `Ok(None)` means the buffer is a plausible ClientHello without a
/// recoverable SNI value (missing extension, truncated field, non-hostname
/// name type); an error means the buffer is not a ClientHello at all. The
/// parser never reassembles across TCP segments: a ClientHello split over
/// multiple reads yields `Ok(None)` for the fragment seen here.
///
/// Total for arbitrary input: every field access is bounds-checked and the
/// walk is linear in the extensions block.
///
/// # Examples
///
/// ```
/// use rdpforward_core::extract_sni;
///
/// let mut record = vec![
///     0x16, 0x03, 0x01, 0x00, 0x30,  // TLS record
///     0x01, 0x00, 0x00, 0x2C,        // ClientHello
///     0x03, 0x03,                    // Version
/// ];
/// record.extend_from_slice(&[0; 32]); // Random
/// record.extend_from_slice(&[
///     0x00,                          // Session ID
///     0x00, 0x02, 0x00, 0x00,        // Cipher suites
///     0x01, 0x00,                    // Compression
///     0x00, 0x10,                    // Extensions length
///     0x00, 0x00,                    // SNI type
///     0x00, 0x0C,                    // SNI length
///     0x00, 0x0A,                    // SNI list length
///     0x00,                          // hostname type
///     0x00, 0x07,                    // name length
///     // "example" in ASCII
///     0x65, 0x78, 0x61, 0x6D, 0x70, 0x6C, 0x65,
/// ]);
///
/// assert_eq!(extract_sni(&record).unwrap(), Some("example".to_string()));
/// ```
pub fn extract_sni(data: &[u8]) -> Result<Option<String>, SniError> {
    if data.len() < CLIENT_HELLO_FIXED_END {
        return Err(SniError::TooShort);
    }

    if data[0] != TLS_HANDSHAKE {
        return Err(SniError::NotTlsHandshake);
    }

    if data[5] != CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }

    let mut pos = CLIENT_HELLO_FIXED_END;

    // Session ID
    if pos >= data.len() {
        return Ok(None);
    }
    let session_id_len = data[pos] as usize;
    pos += 1 + session_id_len;

    // Cipher suites
    if pos + 2 > data.len() {
        return Ok(None);
    }
    let cipher_suites_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    // Compression methods
    if pos >= data.len() {
        return Ok(None);
    }
    let compression_methods_len = data[pos] as usize;
    pos += 1 + compression_methods_len;

    // Extensions
    if pos + 2 > data.len() {
        return Ok(None);
    }
    let extensions_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;

    let extensions_end = pos + extensions_len;
    while pos + 4 <= extensions_end && pos + 4 <= data.len() {
        let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > data.len() {
            break;
        }

        if ext_type == SNI_EXTENSION {
            if ext_len < 2 {
                break;
            }
            // Server name list length
            pos += 2;
            if ext_len - 2 < 3 {
                break;
            }
            // Name type 0x00 is host_name; anything else is not an admission key.
            if data[pos] != 0x00 {
                break;
            }
            pos += 1;
            let name_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if pos + name_len > data.len() {
                break;
            }
            return Ok(Some(
                String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned(),
            ));
        }

        pos += ext_len;
    }

    Ok(None)
}
