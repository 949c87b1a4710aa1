//! Listen-socket allocation and chunked copy over direct peer sockets.
//!
//! All copy work runs on a bounded pool: a job acquires a permit before it
//! touches the network and holds it until the copy ends. Jobs beyond the
//! pool capacity wait for a permit instead of failing, so saturation shows
//! up only as latency.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rendezvous_shared::constants::{
    CONNECT_TIMEOUT_SECS, MAX_CONCURRENT_TRANSFERS, TRANSFER_CHUNK_SIZE,
};
use rendezvous_shared::{read_frame, write_frame};

use crate::error::TransferError;
use crate::job::{TransferJob, TransferMetadata, TransferMetrics, TransferReport};
use crate::naming::create_destination;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Directory inbound files are written to.
    pub download_dir: PathBuf,
    /// Local address transfer listen sockets bind to.
    pub bind_ip: IpAddr,
    /// Bound on the peer connect attempt.
    pub connect_timeout: Duration,
    /// Number of jobs allowed to do I/O at once.
    pub max_concurrent: usize,
    /// Size of one read/write chunk.
    pub chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            max_concurrent: MAX_CONCURRENT_TRANSFERS,
            chunk_size: TRANSFER_CHUNK_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A running (or queued) job.
pub struct TransferHandle {
    metrics: Arc<TransferMetrics>,
    task: JoinHandle<Result<TransferReport, TransferError>>,
}

impl TransferHandle {
    /// Live progress counters. Stay readable after the job ends.
    pub fn metrics(&self) -> Arc<TransferMetrics> {
        self.metrics.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abandon the job by dropping its socket.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the job to end.
    pub async fn wait(self) -> Result<TransferReport, TransferError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Aborted(e.to_string())),
        }
    }
}

/// A listen socket waiting for exactly one inbound transfer.
pub struct InboundTransfer {
    /// Port the socket is bound to; advertise this in the accept response.
    pub port: u16,
    pub handle: TransferHandle,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Owns the worker pool shared by every inbound and outbound job.
#[derive(Clone)]
pub struct TransferService {
    config: Arc<TransportConfig>,
    pool: Arc<Semaphore>,
}

impl TransferService {
    pub fn new(config: TransportConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config: Arc::new(config),
            pool,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Number of pool slots not currently held by a job.
    pub fn available_slots(&self) -> usize {
        self.pool.available_permits()
    }

    /// Open a listen socket for one inbound transfer.
    ///
    /// `preferred_port` 0 picks an ephemeral port. The bound port is known
    /// when this returns; the accept and the copy happen in the background.
    /// Waiting for the peer to connect does not hold a pool slot.
    pub async fn start_transfer_server(
        &self,
        preferred_port: u16,
    ) -> Result<InboundTransfer, TransferError> {
        let listener =
            TcpListener::bind(SocketAddr::new(self.config.bind_ip, preferred_port)).await?;
        let port = listener.local_addr()?.port();
        info!(port, "Transfer server listening");

        let metrics = Arc::new(TransferMetrics::default());
        let task_metrics = metrics.clone();
        let pool = self.pool.clone();
        let config = self.config.clone();

        let task = tokio::spawn(accept_one(listener, port, pool, config, task_metrics));

        Ok(InboundTransfer {
            port,
            handle: TransferHandle { metrics, task },
        })
    }

    /// Connect to the negotiated endpoint and stream `path` to it.
    pub fn send_file(&self, job: TransferJob, path: PathBuf) -> TransferHandle {
        let metrics = Arc::new(TransferMetrics::default());
        let task_metrics = metrics.clone();
        let pool = self.pool.clone();
        let config = self.config.clone();

        let task = tokio::spawn(run_outbound(job, path, pool, config, task_metrics));

        TransferHandle { metrics, task }
    }
}

// ---------------------------------------------------------------------------
// Copy loops
// ---------------------------------------------------------------------------

async fn accept_one(
    listener: TcpListener,
    port: u16,
    pool: Arc<Semaphore>,
    config: Arc<TransportConfig>,
    metrics: Arc<TransferMetrics>,
) -> Result<TransferReport, TransferError> {
    let (mut stream, peer) = listener.accept().await?;
    // One connection per listen socket.
    drop(listener);
    debug!(port, peer = %peer, "Inbound transfer connected");

    let _permit = pool
        .acquire_owned()
        .await
        .map_err(|_| TransferError::PoolClosed)?;

    let result = receive_file(&mut stream, &config.download_dir, config.chunk_size, &metrics).await;
    match &result {
        Ok(report) => info!(
            transfer = %report.transfer_id,
            from = %report.peer,
            file = %report.file_name,
            bytes = report.bytes,
            path = %report.path.display(),
            "File received"
        ),
        Err(e) => warn!(port, peer = %peer, error = %e, "Inbound transfer failed"),
    }
    result
}

async fn run_outbound(
    job: TransferJob,
    path: PathBuf,
    pool: Arc<Semaphore>,
    config: Arc<TransportConfig>,
    metrics: Arc<TransferMetrics>,
) -> Result<TransferReport, TransferError> {
    let _permit = pool
        .acquire_owned()
        .await
        .map_err(|_| TransferError::PoolClosed)?;

    let result = send_job(&job, &path, &config, &metrics).await;
    match &result {
        Ok(report) => info!(
            transfer = %job.transfer_id,
            to = %job.receiver,
            file = %job.file_name,
            bytes = report.bytes,
            "File sent"
        ),
        Err(e) => warn!(
            transfer = %job.transfer_id,
            to = %job.receiver,
            addr = %job.peer_address,
            port = job.peer_port,
            error = %e,
            "Outbound transfer failed"
        ),
    }
    result
}

async fn connect_with_timeout(
    address: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, TransferError> {
    match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransferError::ConnectTimeout {
            address: address.to_string(),
            port,
            timeout,
        }),
    }
}

async fn send_job(
    job: &TransferJob,
    path: &Path,
    config: &TransportConfig,
    metrics: &TransferMetrics,
) -> Result<TransferReport, TransferError> {
    let mut file = File::open(path).await?;
    let file_size = file.metadata().await?.len();
    if file_size != job.file_size {
        warn!(
            transfer = %job.transfer_id,
            offered = job.file_size,
            actual = file_size,
            "File size changed since the offer"
        );
    }

    let mut stream =
        connect_with_timeout(&job.peer_address, job.peer_port, config.connect_timeout).await?;
    debug!(
        transfer = %job.transfer_id,
        addr = %job.peer_address,
        port = job.peer_port,
        "Connected to receiver"
    );

    let metadata = TransferMetadata {
        transfer_id: job.transfer_id,
        sender: job.sender.clone(),
        file_name: job.file_name.clone(),
        file_size,
    };
    let sent = send_stream(&mut stream, &metadata, &mut file, config.chunk_size, metrics).await?;

    Ok(TransferReport {
        transfer_id: job.transfer_id,
        peer: job.receiver.clone(),
        file_name: job.file_name.clone(),
        bytes: sent,
        path: path.to_path_buf(),
    })
}

/// Write the metadata record, then exactly `metadata.file_size` bytes of
/// `source` in chunks.
pub async fn send_stream<W, R>(
    writer: &mut W,
    metadata: &TransferMetadata,
    source: &mut R,
    chunk_size: usize,
    metrics: &TransferMetrics,
) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    write_frame(writer, metadata).await?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent: u64 = 0;
    while sent < metadata.file_size {
        let want = (metadata.file_size - sent).min(buf.len() as u64) as usize;
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::InvalidFile(format!(
                "source ended after {sent} of {} bytes",
                metadata.file_size
            )));
        }
        writer.write_all(&buf[..n]).await?;
        sent += n as u64;
        metrics.record_chunk(n);
    }

    writer.flush().await?;
    writer.shutdown().await?;
    Ok(sent)
}

async fn receive_file<R>(
    reader: &mut R,
    download_dir: &Path,
    chunk_size: usize,
    metrics: &TransferMetrics,
) -> Result<TransferReport, TransferError>
where
    R: AsyncRead + Unpin,
{
    let metadata: TransferMetadata = read_frame(reader).await?;
    info!(
        transfer = %metadata.transfer_id,
        from = %metadata.sender,
        file = %metadata.file_name,
        size = metadata.file_size,
        "Receiving file"
    );

    let (path, mut file) = create_destination(download_dir, &metadata.file_name).await?;
    let received =
        receive_stream(reader, &mut file, metadata.file_size, chunk_size, metrics).await?;

    Ok(TransferReport {
        transfer_id: metadata.transfer_id,
        peer: metadata.sender,
        file_name: metadata.file_name,
        bytes: received,
        path,
    })
}

/// Copy exactly `file_size` bytes from `reader` into `sink`.
///
/// Reads never ask for more than what is still owed, so anything the peer
/// writes past `file_size` is left unread.
pub async fn receive_stream<R, W>(
    reader: &mut R,
    sink: &mut W,
    file_size: u64,
    chunk_size: usize,
    metrics: &TransferMetrics,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut received: u64 = 0;
    while received < file_size {
        let want = (file_size - received).min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::Incomplete {
                expected: file_size,
                received,
            });
        }
        sink.write_all(&buf[..n]).await?;
        received += n as u64;
        metrics.record_chunk(n);
    }

    sink.flush().await?;
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn loopback_config(dir: &Path) -> TransportConfig {
        TransportConfig {
            download_dir: dir.to_path_buf(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        }
    }

    fn job_for(port: u16, file_name: &str, file_size: u64) -> TransferJob {
        TransferJob {
            transfer_id: Uuid::new_v4(),
            sender: "alice".into(),
            receiver: "bob".into(),
            file_name: file_name.into(),
            file_size,
            peer_address: "127.0.0.1".into(),
            peer_port: port,
        }
    }

    #[tokio::test]
    async fn test_round_trip_unaligned_size() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();

        // Deliberately not a multiple of the chunk size.
        let data = patterned(TRANSFER_CHUNK_SIZE * 3 + 123);
        let src = src_dir.path().join("photo.jpg");
        tokio::fs::write(&src, &data).await.unwrap();

        let service = TransferService::new(loopback_config(dst_dir.path()));
        let inbound = service.start_transfer_server(0).await.unwrap();
        assert_ne!(inbound.port, 0);

        let job = job_for(inbound.port, "photo.jpg", data.len() as u64);
        let outbound = service.send_file(job, src);

        let sent = outbound.wait().await.unwrap();
        let received = inbound.handle.wait().await.unwrap();

        assert_eq!(sent.bytes, data.len() as u64);
        assert_eq!(received.bytes, data.len() as u64);
        assert_eq!(received.peer, "alice");
        assert_eq!(received.path, dst_dir.path().join("received_photo.jpg"));
        assert_eq!(tokio::fs::read(&received.path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("empty");
        tokio::fs::write(&src, b"").await.unwrap();

        let service = TransferService::new(loopback_config(dst_dir.path()));
        let inbound = service.start_transfer_server(0).await.unwrap();
        service
            .send_file(job_for(inbound.port, "empty", 0), src)
            .wait()
            .await
            .unwrap();

        let report = inbound.handle.wait().await.unwrap();
        assert_eq!(report.bytes, 0);
        assert!(tokio::fs::read(&report.path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_stops_at_declared_size() {
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let data = patterned(1000);

        let mut wire = data.clone();
        wire.extend_from_slice(b"TRAILING GARBAGE");
        tx.write_all(&wire).await.unwrap();

        let mut sink = Vec::new();
        let metrics = TransferMetrics::default();
        let n = receive_stream(&mut rx, &mut sink, 1000, 64, &metrics)
            .await
            .unwrap();

        assert_eq!(n, 1000);
        assert_eq!(sink, data);
        assert_eq!(metrics.bytes(), 1000);

        // The trailing bytes are still unread.
        let mut rest = vec![0u8; 16];
        rx.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"TRAILING GARBAGE");
    }

    #[tokio::test]
    async fn test_truncated_stream_is_incomplete() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&patterned(100)).await.unwrap();
        drop(tx);

        let mut sink = Vec::new();
        let err = receive_stream(&mut rx, &mut sink, 500, 32, &TransferMetrics::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Incomplete {
                expected: 500,
                received: 100
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let dst_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("a.txt");
        tokio::fs::write(&src, b"hello").await.unwrap();

        // Grab a free port and release it so nothing is listening there.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let service = TransferService::new(loopback_config(dst_dir.path()));
        let started = std::time::Instant::now();
        let err = service
            .send_file(job_for(port, "a.txt", 5), src)
            .wait()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::Io(_) | TransferError::ConnectTimeout { .. }
        ));
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert_eq!(service.available_slots(), MAX_CONCURRENT_TRANSFERS);
    }

    #[tokio::test]
    async fn test_saturated_pool_queues_jobs() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let config = TransportConfig {
            max_concurrent: 1,
            ..loopback_config(dst_dir.path())
        };
        let service = TransferService::new(config);

        let mut pairs = Vec::new();
        for i in 0..3 {
            let data = patterned(5000 + i);
            let name = format!("file{i}.bin");
            let src = src_dir.path().join(&name);
            tokio::fs::write(&src, &data).await.unwrap();

            let inbound = service.start_transfer_server(0).await.unwrap();
            let outbound = service.send_file(job_for(inbound.port, &name, data.len() as u64), src);
            pairs.push((data, inbound, outbound));
        }

        for (data, inbound, outbound) in pairs {
            outbound.wait().await.unwrap();
            let report = inbound.handle.wait().await.unwrap();
            assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
        }
        assert_eq!(service.available_slots(), 1);
    }
}
