//! In-memory transport and SFTP doubles shared by the unit tests

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::sftp::{FileInfo, FileType, SftpChannel, SftpError};
use crate::ssh::{PingResult, SshConfig, SshError, Transport, TransportFactory};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Default)]
struct Behaviour {
    latency: Mutex<Duration>,
    failure: Mutex<Option<SftpError>>,
    hang: AtomicBool,
    calls: AtomicUsize,
    read_dir_calls: AtomicUsize,
    closes: AtomicUsize,
}

/// Filesystem-backed [`SftpChannel`]. Siblings share the tree and the
/// injected behaviour, so a test can steer channels opened later.
#[derive(Clone)]
pub struct MockChannel {
    fs: Arc<Mutex<BTreeMap<String, Node>>>,
    behaviour: Arc<Behaviour>,
    closed: Arc<AtomicBool>,
}

impl MockChannel {
    pub fn new() -> Self {
        let mut fs = BTreeMap::new();
        fs.insert("/".to_string(), Node::Dir);
        Self {
            fs: Arc::new(Mutex::new(fs)),
            behaviour: Arc::new(Behaviour::default()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// New channel over the same tree and behaviour
    pub fn sibling(&self) -> Self {
        Self {
            fs: self.fs.clone(),
            behaviour: self.behaviour.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_dir(&self, path: &str) {
        self.fs.lock().insert(path.to_string(), Node::Dir);
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.fs
            .lock()
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.behaviour.latency.lock() = latency;
    }

    /// Every subsequent call fails with `err` until cleared with `None`
    pub fn set_failure(&self, err: Option<SftpError>) {
        *self.behaviour.failure.lock() = err;
    }

    /// Calls never complete while set
    pub fn set_hang(&self, hang: bool) {
        self.behaviour.hang.store(hang, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.behaviour.calls.load(Ordering::SeqCst)
    }

    pub fn read_dir_calls(&self) -> usize {
        self.behaviour.read_dir_calls.load(Ordering::SeqCst)
    }

    /// Close calls across all siblings
    pub fn closes(&self) -> usize {
        self.behaviour.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), SftpError> {
        self.behaviour.calls.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let latency = *self.behaviour.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SftpError::ChannelError("channel closed".into()));
        }
        match self.behaviour.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn info(path: &str, node: &Node) -> FileInfo {
        let (file_type, size) = match node {
            Node::Dir => (FileType::Directory, 0),
            Node::File(data) => (FileType::File, data.len() as u64),
        };
        FileInfo {
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            path: path.to_string(),
            file_type,
            size,
            modified: 0,
            permissions: "644".to_string(),
        }
    }

    fn parent(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &path[..i],
        }
    }

    fn children(fs: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
        fs.keys()
            .filter(|p| p.as_str() != "/" && p.as_str() != path && Self::parent(p) == path)
            .cloned()
            .collect()
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SftpChannel for MockChannel {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        self.behaviour.read_dir_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let fs = self.fs.lock();
        match fs.get(path) {
            Some(Node::Dir) => Ok(Self::children(&fs, path)
                .iter()
                .filter_map(|p| fs.get(p).map(|n| Self::info(p, n)))
                .collect()),
            _ => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        self.enter().await?;
        self.fs
            .lock()
            .get(path)
            .map(|n| Self::info(path, n))
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        self.enter().await?;
        match self.fs.lock().get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            _ => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SftpError> {
        self.enter().await?;
        self.add_file(path, content);
        Ok(())
    }

    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, SftpError> {
        self.enter().await?;
        match self.fs.lock().get(path) {
            Some(Node::File(data)) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            _ => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    async fn write_chunk(&self, path: &str, offset: u64, chunk: &[u8]) -> Result<(), SftpError> {
        self.enter().await?;
        let mut fs = self.fs.lock();
        let mut data = match fs.remove(path) {
            Some(Node::File(data)) if offset > 0 => data,
            Some(Node::Dir) => {
                fs.insert(path.to_string(), Node::Dir);
                return Err(SftpError::WriteError(format!("{} is a directory", path)));
            }
            _ => Vec::new(),
        };
        let offset = offset as usize;
        if data.len() < offset + chunk.len() {
            data.resize(offset + chunk.len(), 0);
        }
        data[offset..offset + chunk.len()].copy_from_slice(chunk);
        fs.insert(path.to_string(), Node::File(data));
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        self.enter().await?;
        let mut fs = self.fs.lock();
        let node = fs
            .remove(old_path)
            .ok_or_else(|| SftpError::FileNotFound(old_path.to_string()))?;
        fs.insert(new_path.to_string(), node);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.enter().await?;
        self.add_dir(path);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.enter().await?;
        match self.fs.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.enter().await?;
        let mut fs = self.fs.lock();
        if !Self::children(&fs, path).is_empty() {
            return Err(SftpError::ProtocolError(format!("{} not empty", path)));
        }
        match fs.remove(path) {
            Some(_) => Ok(()),
            None => Err(SftpError::FileNotFound(path.to_string())),
        }
    }

    async fn set_permissions(&self, path: &str, _mode: u32) -> Result<(), SftpError> {
        self.enter().await?;
        if self.fs.lock().contains_key(path) {
            Ok(())
        } else {
            Err(SftpError::FileNotFound(path.to_string()))
        }
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.behaviour.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport that hands out [`MockChannel`] siblings
pub struct MockTransport {
    channel: MockChannel,
    connected: AtomicBool,
    ping: Mutex<PingResult>,
    open_failure: Mutex<Option<SshError>>,
    open_delay: Mutex<Duration>,
    opens: AtomicUsize,
}

impl MockTransport {
    pub fn new(channel: MockChannel) -> Self {
        Self {
            channel,
            connected: AtomicBool::new(true),
            ping: Mutex::new(PingResult::Ok),
            open_failure: Mutex::new(None),
            open_delay: Mutex::new(Duration::ZERO),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn set_ping(&self, result: PingResult) {
        *self.ping.lock() = result;
    }

    pub fn set_open_failure(&self, err: Option<SshError>) {
        *self.open_failure.lock() = err;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_sftp(&self) -> Result<Arc<dyn SftpChannel>, SshError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.open_failure.lock().clone() {
            return Err(err);
        }
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        Ok(Arc::new(self.channel.sibling()))
    }

    async fn ping(&self) -> PingResult {
        *self.ping.lock()
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Factory recording every negotiation
pub struct MockFactory {
    channel: MockChannel,
    delay: Mutex<Duration>,
    failures: Mutex<VecDeque<SshError>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    connects: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            channel: MockChannel::new(),
            delay: Mutex::new(delay),
            failures: Mutex::new(VecDeque::new()),
            transports: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        })
    }

    /// Queue a failure for the next negotiation
    pub fn fail_next(&self, err: SshError) {
        self.failures.lock().push_back(err);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Transport returned by the `n`th successful negotiation
    pub fn transport(&self, n: usize) -> Arc<MockTransport> {
        self.transports.lock()[n].clone()
    }

    /// Template channel; its tree and behaviour are shared by every session
    pub fn channel(&self) -> &MockChannel {
        &self.channel
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, _config: &SshConfig) -> Result<Arc<dyn Transport>, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        let transport = Arc::new(MockTransport::new(self.channel.sibling()));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}
