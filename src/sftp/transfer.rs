//! Chunked transfers with progress tracking and cancellation
//!
//! A transfer occupies one queue entry (and therefore one session lease) for its
//! whole duration. The file moves chunk by chunk; progress is published after
//! every chunk and cancellation is honoured between chunks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channel::SftpChannel;
use super::error::SftpError;

const MIB: u64 = 1024 * 1024;

/// 速度取最近几次采样的平均值
const SPEED_SAMPLES: usize = 5;

/// Chunk size for a file of `total` bytes
pub fn chunk_size_for(total: u64) -> usize {
    let size = if total > 1024 * MIB {
        4 * MIB
    } else if total > 100 * MIB {
        2 * MIB
    } else {
        MIB
    };
    size as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Waiting in the tab's queue
    Queued,
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// Point-in-time view of a transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub transfer_id: String,
    pub direction: TransferDirection,
    pub path: String,
    pub transferred: u64,
    pub total: u64,
    /// 0 to 100
    pub percent: f64,
    /// Bytes per second
    pub speed: f64,
    pub eta_secs: u64,
    pub status: TransferStatus,
    pub error: Option<String>,
}

impl TransferSnapshot {
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed
        )
    }
}

struct SpeedMeter {
    last_at: Instant,
    last_bytes: u64,
    samples: VecDeque<f64>,
}

impl SpeedMeter {
    fn new() -> Self {
        Self {
            last_at: Instant::now(),
            last_bytes: 0,
            samples: VecDeque::with_capacity(SPEED_SAMPLES),
        }
    }

    /// Feed the running byte count; returns the averaged speed
    fn sample(&mut self, transferred: u64) -> Option<f64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let delta = transferred.saturating_sub(self.last_bytes) as f64;
        if self.samples.len() == SPEED_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(delta / elapsed);
        self.last_at = now;
        self.last_bytes = transferred;
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}

/// Cancellation signal shared by the caller and the running transfer
#[derive(Debug)]
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self { cancel_tx }
    }

    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// One tracked transfer
pub struct TransferTask {
    id: String,
    path: String,
    control: TransferControl,
    progress: watch::Sender<TransferSnapshot>,
    meter: Mutex<SpeedMeter>,
}

impl TransferTask {
    fn new(id: &str, direction: TransferDirection, path: &str) -> Self {
        let (progress, _) = watch::channel(TransferSnapshot {
            transfer_id: id.to_string(),
            direction,
            path: path.to_string(),
            transferred: 0,
            total: 0,
            percent: 0.0,
            speed: 0.0,
            eta_secs: 0,
            status: TransferStatus::Queued,
            error: None,
        });
        Self {
            id: id.to_string(),
            path: path.to_string(),
            control: TransferControl::new(),
            progress,
            meter: Mutex::new(SpeedMeter::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.progress.borrow().clone()
    }

    /// Progress updates, starting with the current state
    pub fn subscribe(&self) -> watch::Receiver<TransferSnapshot> {
        self.progress.subscribe()
    }

    pub fn control(&self) -> &TransferControl {
        &self.control
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.control.cancelled().await
    }

    fn check(&self) -> Result<(), SftpError> {
        if self.control.is_cancelled() {
            return Err(SftpError::TransferCancelled);
        }
        Ok(())
    }

    fn begin(&self, total: u64) {
        *self.meter.lock() = SpeedMeter::new();
        self.progress.send_modify(|p| {
            p.status = TransferStatus::Active;
            p.total = total;
            p.transferred = 0;
        });
    }

    fn advance(&self, transferred: u64) {
        let speed = self.meter.lock().sample(transferred);
        self.progress.send_modify(|p| {
            p.transferred = transferred;
            p.percent = if p.total > 0 {
                (transferred as f64 / p.total as f64 * 100.0).min(100.0)
            } else {
                0.0
            };
            if let Some(speed) = speed {
                p.speed = speed;
            }
            let remaining = p.total.saturating_sub(transferred);
            p.eta_secs = if p.speed > 0.0 {
                (remaining as f64 / p.speed).ceil() as u64
            } else {
                0
            };
        });
    }

    fn finish<T>(&self, result: &Result<T, SftpError>) {
        self.progress.send_modify(|p| match result {
            Ok(_) => {
                p.status = TransferStatus::Completed;
                p.percent = 100.0;
                p.eta_secs = 0;
            }
            Err(SftpError::TransferCancelled) => p.status = TransferStatus::Cancelled,
            Err(e) => {
                p.status = TransferStatus::Failed;
                p.error = Some(e.to_string());
            }
        });
    }
}

/// Read `task.path()` chunk by chunk
pub async fn download(channel: &dyn SftpChannel, task: &TransferTask) -> Result<Vec<u8>, SftpError> {
    let result = download_chunks(channel, task).await;
    task.finish(&result);
    match &result {
        Ok(data) => info!("Download {} finished ({} bytes)", task.id, data.len()),
        Err(e) => debug!("Download {} stopped: {}", task.id, e),
    }
    result
}

async fn download_chunks(channel: &dyn SftpChannel, task: &TransferTask) -> Result<Vec<u8>, SftpError> {
    task.check()?;
    let total = channel.stat(&task.path).await?.size;
    task.begin(total);

    let chunk = chunk_size_for(total);
    let mut data = Vec::with_capacity(total as usize);
    loop {
        task.check()?;
        let part = channel
            .read_chunk(&task.path, data.len() as u64, chunk)
            .await?;
        if part.is_empty() {
            break;
        }
        data.extend_from_slice(&part);
        task.advance(data.len() as u64);
    }
    Ok(data)
}

/// Write `content` to `task.path()` chunk by chunk. A cancelled upload removes
/// the partial remote file.
pub async fn upload(
    channel: &dyn SftpChannel,
    task: &TransferTask,
    content: &[u8],
) -> Result<u64, SftpError> {
    let result = upload_chunks(channel, task, content).await;
    if matches!(result, Err(SftpError::TransferCancelled)) && task.snapshot().transferred > 0 {
        if let Err(e) = channel.remove_file(&task.path).await {
            warn!("Failed to remove partial upload {}: {}", task.path, e);
        }
    }
    task.finish(&result);
    match &result {
        Ok(written) => info!("Upload {} finished ({} bytes)", task.id, written),
        Err(e) => debug!("Upload {} stopped: {}", task.id, e),
    }
    result
}

async fn upload_chunks(
    channel: &dyn SftpChannel,
    task: &TransferTask,
    content: &[u8],
) -> Result<u64, SftpError> {
    task.check()?;
    let total = content.len() as u64;
    task.begin(total);

    if content.is_empty() {
        channel.write_chunk(&task.path, 0, &[]).await?;
        return Ok(0);
    }

    let mut offset = 0u64;
    for part in content.chunks(chunk_size_for(total)) {
        task.check()?;
        channel.write_chunk(&task.path, offset, part).await?;
        offset += part.len() as u64;
        task.advance(offset);
    }
    Ok(offset)
}

/// Registry of running transfers, keyed by caller-chosen id
pub struct TransferManager {
    transfers: RwLock<HashMap<String, Arc<TransferTask>>>,
}

impl TransferManager {
    pub fn new() -> Self {
        Self {
            transfers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        transfer_id: &str,
        direction: TransferDirection,
        path: &str,
    ) -> Result<Arc<TransferTask>, SftpError> {
        let mut transfers = self.transfers.write();
        if transfers.contains_key(transfer_id) {
            return Err(SftpError::DuplicateTransfer(transfer_id.to_string()));
        }
        let task = Arc::new(TransferTask::new(transfer_id, direction, path));
        transfers.insert(transfer_id.to_string(), task.clone());
        info!("Registered transfer: {} ({:?} {})", transfer_id, direction, path);
        Ok(task)
    }

    pub fn get(&self, transfer_id: &str) -> Option<Arc<TransferTask>> {
        self.transfers.read().get(transfer_id).cloned()
    }

    pub fn progress(&self, transfer_id: &str) -> Option<TransferSnapshot> {
        self.get(transfer_id).map(|t| t.snapshot())
    }

    pub fn list(&self) -> Vec<TransferSnapshot> {
        let mut list: Vec<TransferSnapshot> =
            self.transfers.read().values().map(|t| t.snapshot()).collect();
        list.sort_by(|a, b| a.transfer_id.cmp(&b.transfer_id));
        list
    }

    pub fn unregister(&self, transfer_id: &str) {
        self.transfers.write().remove(transfer_id);
        debug!("Unregistered transfer: {}", transfer_id);
    }

    pub fn cancel(&self, transfer_id: &str) -> bool {
        match self.transfers.read().get(transfer_id) {
            Some(task) => {
                task.cancel();
                info!("Cancelled transfer: {}", transfer_id);
                true
            }
            None => {
                warn!("Transfer not found for cancel: {}", transfer_id);
                false
            }
        }
    }

    /// Returns the number of transfers signalled
    pub fn cancel_all(&self) -> usize {
        let transfers = self.transfers.read();
        for task in transfers.values() {
            task.cancel();
        }
        transfers.len()
    }

    pub fn active_count(&self) -> usize {
        self.transfers.read().len()
    }
}

impl Default for TransferManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters the transfer when dropped, on every exit path
pub struct TransferGuard {
    manager: Arc<TransferManager>,
    transfer_id: String,
}

impl TransferGuard {
    pub fn new(manager: Arc<TransferManager>, transfer_id: &str) -> Self {
        Self {
            manager,
            transfer_id: transfer_id.to_string(),
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.transfer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;
    use std::time::Duration;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_size_grows_with_file() {
        assert_eq!(chunk_size_for(0), MIB as usize);
        assert_eq!(chunk_size_for(100 * MIB), MIB as usize);
        assert_eq!(chunk_size_for(100 * MIB + 1), 2 * MIB as usize);
        assert_eq!(chunk_size_for(2048 * MIB), 4 * MIB as usize);
    }

    #[tokio::test]
    async fn test_download_in_chunks() {
        let channel = MockChannel::new();
        let data = payload(3 * MIB as usize + 100);
        channel.add_file("/big.bin", &data);

        let task = TransferTask::new("dl-1", TransferDirection::Download, "/big.bin");
        let mut rx = task.subscribe();
        let got = download(&channel, &task).await.unwrap();

        assert_eq!(got, data);
        // stat + 4 个非空块 + 1 次读到末尾
        assert_eq!(channel.calls(), 6);
        let last = rx.borrow_and_update().clone();
        assert_eq!(last.status, TransferStatus::Completed);
        assert_eq!(last.transferred, data.len() as u64);
        assert_eq!(last.total, data.len() as u64);
        assert_eq!(last.percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_between_chunks() {
        let channel = MockChannel::new();
        channel.add_file("/big.bin", &payload(4 * MIB as usize));
        channel.set_latency(Duration::from_millis(10));

        let task = Arc::new(TransferTask::new("dl-2", TransferDirection::Download, "/big.bin"));
        let worker = {
            let channel = channel.clone();
            let task = task.clone();
            tokio::spawn(async move { download(&channel, &task).await })
        };

        // stat 结束于 10ms，第一个块结束于 20ms
        tokio::time::sleep(Duration::from_millis(25)).await;
        task.cancel();

        assert_eq!(worker.await.unwrap(), Err(SftpError::TransferCancelled));
        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TransferStatus::Cancelled);
        assert!(snapshot.transferred > 0);
        assert!(snapshot.transferred < snapshot.total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_upload_removes_partial_file() {
        let channel = MockChannel::new();
        channel.set_latency(Duration::from_millis(10));

        let task = Arc::new(TransferTask::new("up-1", TransferDirection::Upload, "/up.bin"));
        let worker = {
            let channel = channel.clone();
            let task = task.clone();
            tokio::spawn(async move { upload(&channel, &task, &payload(3 * MIB as usize)).await })
        };

        tokio::time::sleep(Duration::from_millis(15)).await;
        task.cancel();

        assert_eq!(worker.await.unwrap(), Err(SftpError::TransferCancelled));
        assert!(matches!(
            channel.stat("/up.bin").await,
            Err(SftpError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let channel = MockChannel::new();
        let data = payload(2 * MIB as usize + 7);

        let up = TransferTask::new("up-2", TransferDirection::Upload, "/copy.bin");
        assert_eq!(upload(&channel, &up, &data).await.unwrap(), data.len() as u64);
        assert_eq!(up.snapshot().status, TransferStatus::Completed);

        let down = TransferTask::new("dl-3", TransferDirection::Download, "/copy.bin");
        assert_eq!(download(&channel, &down).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_failed_download_keeps_error() {
        let channel = MockChannel::new();
        let task = TransferTask::new("dl-4", TransferDirection::Download, "/missing");

        assert!(download(&channel, &task).await.is_err());
        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert!(snapshot.error.unwrap().contains("/missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_and_eta() {
        let task = TransferTask::new("dl-5", TransferDirection::Download, "/f");
        task.begin(1000);

        tokio::time::advance(Duration::from_secs(1)).await;
        task.advance(100);
        let snapshot = task.snapshot();
        assert_eq!(snapshot.speed, 100.0);
        assert_eq!(snapshot.eta_secs, 9);
        assert_eq!(snapshot.percent, 10.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        task.advance(400);
        // (100 + 300) / 2
        assert_eq!(task.snapshot().speed, 200.0);
        assert_eq!(task.snapshot().eta_secs, 3);
    }

    #[test]
    fn test_manager_rejects_duplicate_and_guard_unregisters() {
        let manager = Arc::new(TransferManager::new());
        let task = manager
            .register("t-1", TransferDirection::Upload, "/a")
            .unwrap();
        assert_eq!(
            manager.register("t-1", TransferDirection::Upload, "/a").err(),
            Some(SftpError::DuplicateTransfer("t-1".into()))
        );

        {
            let _guard = TransferGuard::new(manager.clone(), "t-1");
            assert!(manager.cancel("t-1"));
            assert!(task.is_cancelled());
            assert_eq!(manager.list().len(), 1);
        }
        assert!(manager.progress("t-1").is_none());
        assert!(!manager.cancel("t-1"));
        assert_eq!(manager.active_count(), 0);
    }
}
