//! Asset download state machine.
//!
//! Drives one transfer at a time, either over the game channel in
//! sequential chunks or through an external web fetcher behind the
//! [`WebTransfer`] trait. Data accumulates in a temp file that only
//! replaces the target after the size and CRC32 both check out.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use wiresync_core::Millis;

/// Where a transfer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// No transfer in flight.
    Idle,
    /// Request sent, waiting for the server to accept.
    Requested,
    /// Transferring over the game channel in sequential chunks.
    ServerChannel,
    /// Transferring through a web fetcher.
    Web,
    /// Finished and promoted to the target path.
    Complete,
    /// Gave up; the temp file is gone.
    Failed,
    /// Cancelled locally; the temp file is gone.
    Cancelled,
}

/// What a file is being fetched for; gates the permitted extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPurpose {
    /// Game data packages.
    GameData,
    /// Recorded demo logs.
    Demo,
}

impl DownloadPurpose {
    fn permitted_extensions(self) -> &'static [&'static str] {
        match self {
            DownloadPurpose::GameData => &["pak"],
            DownloadPurpose::Demo => &["demo"],
        }
    }
}

/// Locally detected download failures.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Only one transfer runs at a time.
    #[error("a download is already in flight")]
    AlreadyActive,
    /// The name would escape the download directory.
    #[error("unsafe download path {0:?}")]
    UnsafePath(String),
    /// The target file already exists.
    #[error("{0:?} already exists")]
    TargetExists(String),
    /// The extension is not permitted for the purpose.
    #[error("extension of {0:?} not permitted")]
    BadExtension(String),
    /// The received byte count disagrees with the announced size.
    #[error("size mismatch: expected {expected}, received {received}")]
    SizeMismatch {
        /// Announced size.
        expected: u64,
        /// Bytes received.
        received: u64,
    },
    /// The received data fails the announced checksum.
    #[error("checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Announced CRC32.
        expected: u32,
        /// CRC32 of the received data.
        computed: u32,
    },
    /// Chunk retries exhausted.
    #[error("download timed out after {0} retries")]
    RetriesExhausted(u32),
    /// Web fetcher failure with no fallback URL left.
    #[error("web transfer failed: {0}")]
    WebFailed(String),
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One step of an external web fetch.
pub enum WebPoll {
    /// Nothing available yet.
    Pending,
    /// A chunk of the file body, in order.
    Data(Vec<u8>),
    /// The body is complete.
    Done,
}

/// Narrow interface to the external HTTP machinery.
pub trait WebTransfer {
    /// Start fetching a URL, discarding any transfer in progress.
    fn begin(&mut self, url: &str) -> anyhow::Result<()>;
    /// Poll for the next chunk.
    fn poll(&mut self) -> anyhow::Result<WebPoll>;
}

struct Transfer {
    name: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    expected_size: u64,
    expected_checksum: u32,
    received: u64,
    file: File,
    hasher: crc32fast::Hasher,
    retries: u32,
    deadline: Millis,
    web_urls: Vec<String>,
}

/// Single-transfer download orchestrator.
pub struct DownloadManager {
    base_dir: PathBuf,
    state: DownloadState,
    transfer: Option<Transfer>,
    retry_cap: u32,
    chunk_timeout_ms: u32,
    success_count: u64,
    /// A disconnect arrived mid-transfer; teardown is deferred until the
    /// transfer winds down.
    pending_disconnect: bool,
}

impl DownloadManager {
    /// Manager rooted at `base_dir` (all targets resolve under it).
    pub fn new(base_dir: PathBuf, retry_cap: u32, chunk_timeout_ms: u32) -> Self {
        Self {
            base_dir,
            state: DownloadState::Idle,
            transfer: None,
            retry_cap,
            chunk_timeout_ms,
            success_count: 0,
            pending_disconnect: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Completed downloads this session.
    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    /// Name of the transfer in flight.
    pub fn active_name(&self) -> Option<&str> {
        self.transfer.as_ref().map(|t| t.name.as_str())
    }

    /// Whether a transfer is currently holding off disconnect teardown.
    pub fn in_flight(&self) -> bool {
        matches!(
            self.state,
            DownloadState::Requested | DownloadState::ServerChannel | DownloadState::Web
        )
    }

    /// Vet and stage a request. Every rejection here is local; the server
    /// is never contacted for a name that fails vetting.
    pub fn request(&mut self, name: &str, purpose: DownloadPurpose) -> Result<(), DownloadError> {
        if self.in_flight() {
            return Err(DownloadError::AlreadyActive);
        }
        let relative = vet_name(name, purpose)?;
        let final_path = self.base_dir.join(&relative);
        if final_path.exists() {
            return Err(DownloadError::TargetExists(name.to_string()));
        }
        let temp_path = final_path.with_extension("tmp");
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&temp_path)?;

        self.transfer = Some(Transfer {
            name: name.to_string(),
            temp_path,
            final_path,
            expected_size: 0,
            expected_checksum: 0,
            received: 0,
            file,
            hasher: crc32fast::Hasher::new(),
            retries: 0,
            deadline: 0,
            web_urls: Vec::new(),
        });
        self.state = DownloadState::Requested;
        info!(name, "download requested");
        Ok(())
    }

    /// Server accepted the request for in-channel transfer.
    pub fn accept_channel(&mut self, size: u64, checksum: u32, now: Millis) {
        if let Some(t) = self.transfer.as_mut() {
            t.expected_size = size;
            t.expected_checksum = checksum;
            t.deadline = now + i64::from(self.chunk_timeout_ms);
            self.state = DownloadState::ServerChannel;
        }
    }

    /// Server accepted the request for web transfer; `urls` is tried in
    /// order (official mirror first, server-provided fallback after).
    pub fn accept_web(
        &mut self,
        size: u64,
        checksum: u32,
        urls: Vec<String>,
        fetcher: &mut dyn WebTransfer,
    ) -> Result<(), DownloadError> {
        let Some(t) = self.transfer.as_mut() else {
            return Ok(());
        };
        t.expected_size = size;
        t.expected_checksum = checksum;
        t.web_urls = urls;
        self.state = DownloadState::Web;
        self.begin_next_url(fetcher)
    }

    fn begin_next_url(&mut self, fetcher: &mut dyn WebTransfer) -> Result<(), DownloadError> {
        loop {
            let Some(t) = self.transfer.as_mut() else {
                return Ok(());
            };
            if t.web_urls.is_empty() {
                let err = DownloadError::WebFailed("no URL left to try".into());
                self.fail();
                return Err(err);
            }
            let url = t.web_urls.remove(0);
            match fetcher.begin(&url) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(url, "web transfer failed to start: {err:#}");
                    // Fall through to the next URL.
                }
            }
        }
    }

    /// Byte offset the next in-channel chunk should start at.
    pub fn next_offset(&self) -> u64 {
        self.transfer.as_ref().map_or(0, |t| t.received)
    }

    /// Accept one in-channel chunk. Out-of-sequence chunks (a resend of
    /// data already written, or data past the expected offset after a
    /// lost chunk) are ignored; the timeout path re-requests.
    pub fn chunk(&mut self, offset: u64, data: &[u8], now: Millis) -> Result<(), DownloadError> {
        if self.state != DownloadState::ServerChannel {
            return Ok(());
        }
        let Some(t) = self.transfer.as_mut() else {
            return Ok(());
        };
        if offset != t.received {
            warn!(
                offset,
                expected = t.received,
                "out-of-sequence download chunk ignored"
            );
            return Ok(());
        }
        t.file.write_all(data)?;
        t.hasher.update(data);
        t.received += data.len() as u64;
        t.retries = 0;
        t.deadline = now + i64::from(self.chunk_timeout_ms);
        if t.received >= t.expected_size {
            return self.finish();
        }
        Ok(())
    }

    /// Feed the web transfer. Returns `Ok(true)` while more polling is
    /// needed.
    pub fn pump_web(&mut self, fetcher: &mut dyn WebTransfer) -> Result<bool, DownloadError> {
        if self.state != DownloadState::Web {
            return Ok(false);
        }
        loop {
            let Some(t) = self.transfer.as_mut() else {
                return Ok(false);
            };
            match fetcher.poll() {
                Ok(WebPoll::Pending) => return Ok(true),
                Ok(WebPoll::Data(data)) => {
                    t.file.write_all(&data)?;
                    t.hasher.update(&data);
                    t.received += data.len() as u64;
                }
                Ok(WebPoll::Done) => {
                    self.finish()?;
                    return Ok(false);
                }
                Err(err) => {
                    warn!("web transfer failed: {err:#}");
                    // Truncate the temp file and fall back to the next URL.
                    t.file = File::create(&t.temp_path)?;
                    t.hasher = crc32fast::Hasher::new();
                    t.received = 0;
                    self.begin_next_url(fetcher)?;
                }
            }
        }
    }

    /// Check the chunk deadline. Returns `true` when the caller should
    /// re-request the chunk at [`next_offset`](Self::next_offset).
    pub fn check_timeout(&mut self, now: Millis) -> Result<bool, DownloadError> {
        if self.state != DownloadState::ServerChannel {
            return Ok(false);
        }
        let Some(t) = self.transfer.as_mut() else {
            return Ok(false);
        };
        if now < t.deadline {
            return Ok(false);
        }
        t.retries += 1;
        if t.retries > self.retry_cap {
            let retries = t.retries;
            self.fail();
            return Err(DownloadError::RetriesExhausted(retries));
        }
        warn!(
            name = %t.name,
            retry = t.retries,
            "download chunk timed out, re-requesting"
        );
        t.deadline = now + i64::from(self.chunk_timeout_ms);
        Ok(true)
    }

    fn finish(&mut self) -> Result<(), DownloadError> {
        let Some(mut t) = self.transfer.take() else {
            return Ok(());
        };
        t.file.flush()?;
        drop(t.file);

        let computed = t.hasher.finalize();
        if t.received != t.expected_size {
            let _ = fs::remove_file(&t.temp_path);
            self.state = DownloadState::Idle;
            return Err(DownloadError::SizeMismatch {
                expected: t.expected_size,
                received: t.received,
            });
        }
        if computed != t.expected_checksum {
            let _ = fs::remove_file(&t.temp_path);
            self.state = DownloadState::Idle;
            return Err(DownloadError::ChecksumMismatch {
                expected: t.expected_checksum,
                computed,
            });
        }
        fs::rename(&t.temp_path, &t.final_path)?;
        self.success_count += 1;
        self.state = DownloadState::Complete;
        info!(name = %t.name, bytes = t.received, "download complete");
        Ok(())
    }

    fn fail(&mut self) {
        if let Some(t) = self.transfer.take() {
            let _ = fs::remove_file(&t.temp_path);
        }
        self.state = DownloadState::Failed;
    }

    /// Cancel whatever is in flight.
    pub fn cancel(&mut self) {
        if let Some(t) = self.transfer.take() {
            let _ = fs::remove_file(&t.temp_path);
            info!(name = %t.name, "download cancelled");
            self.state = DownloadState::Cancelled;
        }
    }

    /// Note a disconnect request; actual teardown is deferred while a
    /// transfer is in flight so the session drop stays reentrancy-safe.
    pub fn defer_disconnect(&mut self) -> bool {
        if self.in_flight() {
            self.pending_disconnect = true;
            true
        } else {
            false
        }
    }

    /// Whether a deferred disconnect is waiting, clearing the flag.
    pub fn take_pending_disconnect(&mut self) -> bool {
        std::mem::take(&mut self.pending_disconnect)
    }

    /// Back to idle, dropping any transfer.
    pub fn reset(&mut self) {
        self.cancel();
        self.state = DownloadState::Idle;
        self.pending_disconnect = false;
    }
}

/// Reject names that are absolute, walk upward, or carry a forbidden
/// extension. Returns the vetted relative path.
fn vet_name(name: &str, purpose: DownloadPurpose) -> Result<PathBuf, DownloadError> {
    if name.is_empty() || name.contains('\\') {
        return Err(DownloadError::UnsafePath(name.to_string()));
    }
    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(DownloadError::UnsafePath(name.to_string())),
        }
    }
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if !purpose
        .permitted_extensions()
        .iter()
        .any(|e| extension.eq_ignore_ascii_case(e))
    {
        return Err(DownloadError::BadExtension(name.to_string()));
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> DownloadManager {
        DownloadManager::new(dir.to_path_buf(), 3, 1000)
    }

    fn crc(data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    #[test]
    fn test_path_escapes_are_rejected_locally() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = manager(dir.path());
        assert!(matches!(
            dl.request("../secrets.pak", DownloadPurpose::GameData),
            Err(DownloadError::UnsafePath(_))
        ));
        assert!(matches!(
            dl.request("/etc/passwd.pak", DownloadPurpose::GameData),
            Err(DownloadError::UnsafePath(_))
        ));
        assert!(matches!(
            dl.request("tool.exe", DownloadPurpose::GameData),
            Err(DownloadError::BadExtension(_))
        ));
        assert_eq!(dl.state(), DownloadState::Idle);
    }

    #[test]
    fn test_existing_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("maps.pak"), b"old").unwrap();
        let mut dl = manager(dir.path());
        assert!(matches!(
            dl.request("maps.pak", DownloadPurpose::GameData),
            Err(DownloadError::TargetExists(_))
        ));
    }

    #[test]
    fn test_channel_transfer_completes_and_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = manager(dir.path());
        let body = b"chunked download body".to_vec();
        dl.request("maps.pak", DownloadPurpose::GameData).unwrap();
        dl.accept_channel(body.len() as u64, crc(&body), 0);

        dl.chunk(0, &body[..8], 10).unwrap();
        assert_eq!(dl.next_offset(), 8);
        dl.chunk(8, &body[8..], 20).unwrap();

        assert_eq!(dl.state(), DownloadState::Complete);
        assert_eq!(dl.success_count(), 1);
        assert_eq!(fs::read(dir.path().join("maps.pak")).unwrap(), body);
        assert!(!dir.path().join("maps.tmp").exists());
    }

    #[test]
    fn test_checksum_mismatch_discards_temp_and_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = manager(dir.path());
        let body = b"corrupted in transit".to_vec();
        dl.request("maps.pak", DownloadPurpose::GameData).unwrap();
        dl.accept_channel(body.len() as u64, 0xDEAD_BEEF, 0);

        let result = dl.chunk(0, &body, 10);
        assert!(matches!(
            result,
            Err(DownloadError::ChecksumMismatch { .. })
        ));
        assert_eq!(dl.state(), DownloadState::Idle);
        assert_eq!(dl.success_count(), 0);
        assert!(!dir.path().join("maps.pak").exists());
        assert!(!dir.path().join("maps.tmp").exists());
    }

    #[test]
    fn test_out_of_sequence_chunk_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = manager(dir.path());
        let body = b"sequential only".to_vec();
        dl.request("maps.pak", DownloadPurpose::GameData).unwrap();
        dl.accept_channel(body.len() as u64, crc(&body), 0);

        dl.chunk(8, &body[8..], 10).unwrap();
        assert_eq!(dl.next_offset(), 0);
        dl.chunk(0, &body[..8], 20).unwrap();
        dl.chunk(8, &body[8..], 30).unwrap();
        assert_eq!(dl.state(), DownloadState::Complete);
    }

    #[test]
    fn test_timeout_requests_resend_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = manager(dir.path());
        dl.request("maps.pak", DownloadPurpose::GameData).unwrap();
        dl.accept_channel(100, 0, 0);

        // Three timeouts re-request; the fourth exhausts the cap.
        assert!(dl.check_timeout(1000).unwrap());
        assert!(dl.check_timeout(2500).unwrap());
        assert!(dl.check_timeout(4000).unwrap());
        assert!(matches!(
            dl.check_timeout(5500),
            Err(DownloadError::RetriesExhausted(_))
        ));
        assert_eq!(dl.state(), DownloadState::Failed);
    }

    #[test]
    fn test_second_request_while_active_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = manager(dir.path());
        dl.request("a.pak", DownloadPurpose::GameData).unwrap();
        assert!(matches!(
            dl.request("b.pak", DownloadPurpose::GameData),
            Err(DownloadError::AlreadyActive)
        ));
    }

    struct ScriptedWeb {
        fail_first: bool,
        begun: Vec<String>,
        chunks: Vec<Vec<u8>>,
    }

    impl WebTransfer for ScriptedWeb {
        fn begin(&mut self, url: &str) -> anyhow::Result<()> {
            self.begun.push(url.to_string());
            if self.fail_first && self.begun.len() == 1 {
                anyhow::bail!("mirror unreachable");
            }
            Ok(())
        }

        fn poll(&mut self) -> anyhow::Result<WebPoll> {
            match self.chunks.is_empty() {
                true => Ok(WebPoll::Done),
                false => Ok(WebPoll::Data(self.chunks.remove(0))),
            }
        }
    }

    #[test]
    fn test_web_transfer_falls_back_to_second_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = manager(dir.path());
        let body = b"served over http".to_vec();
        let mut web = ScriptedWeb {
            fail_first: true,
            begun: Vec::new(),
            chunks: vec![body[..6].to_vec(), body[6..].to_vec()],
        };

        dl.request("maps.pak", DownloadPurpose::GameData).unwrap();
        dl.accept_web(
            body.len() as u64,
            crc(&body),
            vec!["http://mirror/maps.pak".into(), "http://server/maps.pak".into()],
            &mut web,
        )
        .unwrap();
        assert_eq!(web.begun.len(), 2);

        while dl.pump_web(&mut web).unwrap() {}
        assert_eq!(dl.state(), DownloadState::Complete);
        assert_eq!(fs::read(dir.path().join("maps.pak")).unwrap(), body);
    }

    #[test]
    fn test_disconnect_is_deferred_while_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = manager(dir.path());
        dl.request("maps.pak", DownloadPurpose::GameData).unwrap();
        assert!(dl.defer_disconnect());
        assert!(dl.take_pending_disconnect());
        assert!(!dl.take_pending_disconnect());
        dl.reset();
        assert!(!dl.defer_disconnect());
    }
}
