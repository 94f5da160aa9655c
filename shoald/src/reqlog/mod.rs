//! Request log manager.
//!
//! A durable, ordered log of every accepted write request. Fixed-size headers
//! are appended contiguously to `head.req.log` while payloads are concatenated
//! into bucket files, one per 100,000 ids, addressed by `(offset, len)` in the
//! header. Heads are strictly ordered by `inc_id`, which makes random access a
//! binary search over the head file.
//!
//! A single in-memory prepared slot holds the request currently being voted on
//! by the two-phase write protocol: empty means no in-flight write at this
//! node.
//!
//! All operations serialize on one manager-wide lock. Readers open their own
//! file handles, and the head file is append-only, so readers and writers
//! never interleave destructively.

#[cfg(test)]
mod mod_test;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use shoal_core::LogError;

/// The size in bytes of an encoded `ReqLogHead`. Identical on every node of a
/// cluster.
pub const HEAD_SIZE: u64 = 40;
/// The number of ids sharing one payload bucket file.
pub const BUCKET_SPAN: u32 = 100_000;
/// The name of the head file within the log directory.
const HEAD_LOG_NAME: &str = "head.req.log";

const METRIC_REQLOG_LAST_WRITTEN: &str = "shoal_reqlog_last_written_id";

/// A result type for request log operations.
pub type LogResult<T> = std::result::Result<T, LogError>;

/// The envelope of a write request as staged through the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommonReqData {
    /// The cluster-unique monotonic id; `0` until stamped by a primary.
    pub inc_id: u32,
    /// The numeric write request type code.
    pub reqtype: u16,
    /// The packed request payload.
    pub payload: Vec<u8>,
}

impl CommonReqData {
    pub fn new(reqtype: u16, payload: Vec<u8>) -> Self {
        Self { inc_id: 0, reqtype, payload }
    }
}

/// One fixed-size record of the head file (little-endian, packed).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReqLogHead {
    pub inc_id: u32,
    pub reqtype: u32,
    pub req_data_offset: u64,
    pub req_data_len: u32,
    pub req_data_crc: u32,
    /// Reserved for a UTC timestamp string; zero-filled.
    pub reserved: [u8; 16],
}

impl ReqLogHead {
    pub fn encode(&self) -> [u8; HEAD_SIZE as usize] {
        let mut buf = [0u8; HEAD_SIZE as usize];
        buf[0..4].copy_from_slice(&self.inc_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.reqtype.to_le_bytes());
        buf[8..16].copy_from_slice(&self.req_data_offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.req_data_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.req_data_crc.to_le_bytes());
        buf[24..40].copy_from_slice(&self.reserved);
        buf
    }

    pub fn decode(buf: &[u8; HEAD_SIZE as usize]) -> Self {
        let mut reserved = [0u8; 16];
        reserved.copy_from_slice(&buf[24..40]);
        Self {
            inc_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            reqtype: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            req_data_offset: u64::from_le_bytes([buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15]]),
            req_data_len: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            req_data_crc: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            reserved,
        }
    }
}

/// A log entry materialized for a reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReqLogEntry {
    pub head: ReqLogHead,
    /// The byte offset of the head record within the head file.
    pub head_offset: u64,
    pub payload: Vec<u8>,
}

/// The request log state of one node.
pub struct RequestLog {
    base_path: PathBuf,
    head_path: PathBuf,
    inc_id_next: u32,
    last_written_id: u32,
    prepared: Option<CommonReqData>,
}

impl RequestLog {
    /// Open the request log at the given directory, creating it as needed.
    ///
    /// The prepared slot is always empty after open; a crash between prepare
    /// and commit leaves no residue beyond fully appended entries.
    pub fn open(base: impl AsRef<Path>) -> LogResult<Self> {
        let base_path = base.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        let head_path = base_path.join(HEAD_LOG_NAME);
        let head_file = OpenOptions::new().create(true).append(true).open(&head_path)?;
        let len = head_file.metadata()?.len();

        let mut log = Self {
            base_path,
            head_path,
            inc_id_next: 1,
            last_written_id: 0,
            prepared: None,
        };
        if len > 0 {
            if len < HEAD_SIZE || len % HEAD_SIZE != 0 {
                return Err(LogError::Corrupt(format!(
                    "head file length {} is not a whole multiple of the {} byte header size",
                    len, HEAD_SIZE
                )));
            }
            let mut reader = File::open(&log.head_path)?;
            let last = Self::read_head_at(&mut reader, len - HEAD_SIZE)?;
            log.last_written_id = last.inc_id;
            log.inc_id_next = last.inc_id + 1;
        }
        Ok(log)
    }

    /// The id the next primary-stamped write will receive.
    pub fn next_inc_id(&self) -> u32 {
        self.inc_id_next
    }

    /// The id of the last entry fully appended to this log.
    pub fn last_written_id(&self) -> u32 {
        self.last_written_id
    }

    /// Stage a write request in the prepared slot.
    ///
    /// A primary stamps the request with the next id; a replica adopts the
    /// primary's id, which must not fall behind this log.
    pub fn prepare(&mut self, mut req: CommonReqData, is_primary: bool) -> LogResult<CommonReqData> {
        if self.prepared.is_some() {
            return Err(LogError::AlreadyPrepared);
        }
        if is_primary {
            req.inc_id = self.inc_id_next;
            self.inc_id_next += 1;
        } else {
            if req.inc_id < self.inc_id_next {
                return Err(LogError::Stale { given: req.inc_id, expected: self.inc_id_next });
            }
            self.inc_id_next = req.inc_id + 1;
        }
        self.prepared = Some(req.clone());
        Ok(req)
    }

    /// The request currently staged in the prepared slot, if any.
    pub fn prepared(&self) -> Option<&CommonReqData> {
        self.prepared.as_ref()
    }

    /// Clear the prepared slot.
    pub fn discard_prepared(&mut self) {
        self.prepared = None;
    }

    /// Append the prepared request's payload durably to the log.
    ///
    /// The prepared slot is left in place; callers discard it once the
    /// surrounding protocol commits.
    pub fn append(&mut self, payload: &[u8]) -> LogResult<ReqLogHead> {
        let prepared = self.prepared.as_ref().ok_or(LogError::NotPrepared)?;
        if prepared.inc_id < self.last_written_id {
            return Err(LogError::Stale { given: prepared.inc_id, expected: self.last_written_id });
        }
        let mut bucket = OpenOptions::new().create(true).append(true).open(self.bucket_path(prepared.inc_id))?;
        let head = ReqLogHead {
            inc_id: prepared.inc_id,
            reqtype: prepared.reqtype as u32,
            req_data_offset: bucket.metadata()?.len(),
            req_data_len: payload.len() as u32,
            req_data_crc: crc32fast::hash(payload),
            reserved: [0u8; 16],
        };
        bucket.write_all(payload)?;
        let mut head_file = OpenOptions::new().create(true).append(true).open(&self.head_path)?;
        head_file.write_all(&head.encode())?;
        self.last_written_id = head.inc_id;
        metrics::gauge!(METRIC_REQLOG_LAST_WRITTEN, self.last_written_id as f64);
        Ok(head)
    }

    /// Fetch the entry with the given id, or the entry with the smallest id
    /// greater than it (lower-bound semantics).
    pub fn get_by_id(&self, inc_id: u32) -> LogResult<ReqLogEntry> {
        let (head, head_offset) = self.head_offset_of(inc_id)?;
        let payload = self.read_payload(&head)?;
        Ok(ReqLogEntry { head, head_offset, payload })
    }

    /// Read the entry whose head sits at the given head-file offset, returning
    /// the offset of the next head. `None` once the offset passes the end.
    ///
    /// Drives sequential replay.
    pub fn get_by_head_offset(&self, head_offset: u64) -> LogResult<Option<(ReqLogEntry, u64)>> {
        if head_offset % HEAD_SIZE != 0 {
            return Err(LogError::Corrupt(format!("head offset {} is not aligned to the header size", head_offset)));
        }
        let mut reader = File::open(&self.head_path)?;
        let len = reader.metadata()?.len();
        if len < HEAD_SIZE || head_offset > len - HEAD_SIZE {
            return Ok(None);
        }
        let head = Self::read_head_at(&mut reader, head_offset)?;
        let payload = self.read_payload(&head)?;
        Ok(Some((ReqLogEntry { head, head_offset, payload }, head_offset + HEAD_SIZE)))
    }

    /// List entry ids starting from the lower bound of `start`, at most `max`
    /// of them, optionally materializing payloads.
    pub fn list_ids(&self, start: u32, max: usize, want_payload: bool) -> LogResult<(Vec<u32>, Vec<Vec<u8>>)> {
        let (mut ids, mut payloads) = (Vec::new(), Vec::new());
        let mut offset = match self.head_offset_of(start) {
            Ok((_, offset)) => offset,
            Err(LogError::NotFound) => return Ok((ids, payloads)),
            Err(err) => return Err(err),
        };
        while ids.len() < max {
            match self.get_by_head_offset(offset)? {
                Some((entry, next_offset)) => {
                    ids.push(entry.head.inc_id);
                    if want_payload {
                        payloads.push(entry.payload);
                    }
                    offset = next_offset;
                }
                None => break,
            }
        }
        Ok((ids, payloads))
    }

    /// Binary search the head file for the lower bound of the given id.
    fn head_offset_of(&self, wanted: u32) -> LogResult<(ReqLogHead, u64)> {
        let mut reader = File::open(&self.head_path)?;
        let len = reader.metadata()?.len();
        if len < HEAD_SIZE {
            return Err(LogError::NotFound);
        }
        if len % HEAD_SIZE != 0 {
            return Err(LogError::Corrupt(format!(
                "head file length {} is not a whole multiple of the {} byte header size",
                len, HEAD_SIZE
            )));
        }
        let count = len / HEAD_SIZE;
        let last = Self::read_head_at(&mut reader, (count - 1) * HEAD_SIZE)?;
        if wanted > last.inc_id {
            return Err(LogError::NotFound);
        }

        let (mut lo, mut hi) = (0u64, count);
        let mut found = (last, (count - 1) * HEAD_SIZE);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let cur = Self::read_head_at(&mut reader, mid * HEAD_SIZE)?;
            if cur.inc_id >= wanted {
                found = (cur, mid * HEAD_SIZE);
                if cur.inc_id == wanted {
                    break;
                }
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(found)
    }

    /// Read and verify the payload addressed by the given head.
    fn read_payload(&self, head: &ReqLogHead) -> LogResult<Vec<u8>> {
        let mut bucket = File::open(self.bucket_path(head.inc_id))?;
        bucket.seek(SeekFrom::Start(head.req_data_offset))?;
        let mut payload = vec![0u8; head.req_data_len as usize];
        bucket.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != head.req_data_crc {
            return Err(LogError::Corrupt(format!("crc mismatch for request log entry {}", head.inc_id)));
        }
        Ok(payload)
    }

    fn read_head_at(reader: &mut File, offset: u64) -> LogResult<ReqLogHead> {
        let mut buf = [0u8; HEAD_SIZE as usize];
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut buf)?;
        Ok(ReqLogHead::decode(&buf))
    }

    fn bucket_path(&self, inc_id: u32) -> PathBuf {
        self.base_path.join(format!("{}.req.log", inc_id / BUCKET_SPAN))
    }
}

/// A cloneable, thread-safe handle to a node's request log.
///
/// Every operation holds the manager-wide lock and runs on the blocking pool.
#[derive(Clone)]
pub struct RequestLogMgr {
    inner: Arc<Mutex<RequestLog>>,
}

impl RequestLogMgr {
    /// Open the request log at the given directory.
    pub async fn open(base: PathBuf) -> LogResult<Self> {
        metrics::register_gauge!(METRIC_REQLOG_LAST_WRITTEN, metrics::Unit::Count, "the id of the last entry written to the request log");
        let log = tokio::task::spawn_blocking(move || RequestLog::open(base)).await.map_err(join_error)??;
        Ok(Self { inner: Arc::new(Mutex::new(log)) })
    }

    async fn with<F, R>(&self, f: F) -> LogResult<R>
    where
        F: FnOnce(&mut RequestLog) -> LogResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut log = inner.lock().expect("request log lock poisoned");
            f(&mut log)
        })
        .await
        .map_err(join_error)?
    }

    pub async fn prepare(&self, req: CommonReqData, is_primary: bool) -> LogResult<CommonReqData> {
        self.with(move |log| log.prepare(req, is_primary)).await
    }

    pub async fn get_prepared(&self) -> LogResult<Option<CommonReqData>> {
        self.with(|log| Ok(log.prepared().cloned())).await
    }

    pub async fn discard_prepared(&self) -> LogResult<()> {
        self.with(|log| {
            log.discard_prepared();
            Ok(())
        })
        .await
    }

    pub async fn append(&self, payload: Vec<u8>) -> LogResult<ReqLogHead> {
        self.with(move |log| log.append(&payload)).await
    }

    pub async fn get_by_id(&self, inc_id: u32) -> LogResult<ReqLogEntry> {
        self.with(move |log| log.get_by_id(inc_id)).await
    }

    pub async fn list_ids(&self, start: u32, max: usize, want_payload: bool) -> LogResult<(Vec<u32>, Vec<Vec<u8>>)> {
        self.with(move |log| log.list_ids(start, max, want_payload)).await
    }

    pub async fn next_inc_id(&self) -> LogResult<u32> {
        self.with(|log| Ok(log.next_inc_id())).await
    }

    pub async fn last_written_id(&self) -> LogResult<u32> {
        self.with(|log| Ok(log.last_written_id())).await
    }
}

fn join_error(err: tokio::task::JoinError) -> LogError {
    LogError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}
