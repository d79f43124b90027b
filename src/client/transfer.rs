//! Client transfer engine
//!
//! Uploads and downloads are cut into chunks according to the session's
//! chunk length. Each chunk is an independent request. When a chunk fails
//! on a transport error (or the transfer is cancelled) the transfer is
//! marked interrupted; repeating the same call on the same session
//! continues with the first chunk the server has not acknowledged.

use crate::client::{FilePart, HttpRequest, RequestBody, Session};
use crate::codec::{to_wire, RequestParameter};
use crate::error::{FilegateError, IoResultExt, Result};
use crate::protocol::{param, Action};
use crate::transfer::{
    ChunkPlan, FileSource, ResumePoint, StreamSource, TransferChunk, TransferDirection, TransferKey,
    UploadSource,
};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observer of transfer progress
///
/// Called from the thread running the transfer.
pub trait TransferListener: Send + Sync {
    /// A transfer is starting; `resumed_at` bytes were already acknowledged
    fn started(&self, _remote: &str, _direction: TransferDirection, _total: u64, _resumed_at: u64) {}

    /// A chunk of `bytes` was acknowledged
    fn advanced(&self, bytes: u64);

    /// The transfer ended, successfully or not
    fn finished(&self, _remote: &str, _succeeded: bool) {}
}

impl Session {
    /// Install a progress listener
    pub fn set_listener(&mut self, listener: Arc<dyn TransferListener>) {
        self.listener = Some(listener);
    }

    /// Flag polled between chunks; setting it interrupts the running transfer
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Upload a local file
    pub fn upload_file(&mut self, local: impl AsRef<Path>, remote: &str) -> Result<()> {
        let mut source = FileSource::open(local)?;
        self.upload(&mut source, remote)
    }

    /// Upload `length` bytes read from `reader`
    pub fn upload_stream<R: Read>(&mut self, reader: R, length: u64, remote: &str) -> Result<()> {
        let mut source = StreamSource::new(reader, length);
        self.upload(&mut source, remote)
    }

    /// Upload from any source
    ///
    /// Call again with the same source after a resumable failure to continue
    /// where the transfer stopped.
    pub fn upload(&mut self, source: &mut dyn UploadSource, remote: &str) -> Result<()> {
        let remote = require_remote(remote)?;
        let plan = ChunkPlan::new(source.total_length(), self.options().chunk_length);
        let key = TransferKey::upload(remote, plan.total_length(), plan.wire_chunk_length());

        self.run_chunks(&key, plan, |session, chunk| session.send_chunk(source, remote, chunk))
    }

    /// Download into a writer; returns the number of bytes written
    ///
    /// Nothing is written for a chunk until it has been received in full,
    /// so after a resumable failure the same writer can be passed again.
    pub fn download(&mut self, remote: &str, writer: &mut dyn Write) -> Result<u64> {
        self.download_with(remote, |_| Ok(writer))
    }

    /// Download into a local file
    ///
    /// After a resumable failure, calling again with the same arguments
    /// truncates the file to the last acknowledged chunk boundary and
    /// fetches the rest.
    pub fn download_file(&mut self, remote: &str, local: impl AsRef<Path>) -> Result<u64> {
        let local = local.as_ref();
        self.download_with(remote, |offset| {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(local)
                .with_path(local)?;
            file.set_len(offset).with_path(local)?;
            file.seek(SeekFrom::Start(offset)).with_path(local)?;
            Ok(BufWriter::new(file))
        })
    }

    /// Download into an anonymous temporary file and return it rewound
    pub fn download_stream(&mut self, remote: &str) -> Result<File> {
        let mut spool = tempfile::tempfile()?;
        self.download(remote, &mut spool)?;
        spool.seek(SeekFrom::Start(0))?;
        Ok(spool)
    }

    fn download_with<W, F>(&mut self, remote: &str, open: F) -> Result<u64>
    where
        W: Write,
        F: FnOnce(u64) -> Result<W>,
    {
        let remote = require_remote(remote)?;
        let total = self.file_length(remote)?;
        let plan = ChunkPlan::new(total, self.options().chunk_length);
        let key = TransferKey::download(remote, total, plan.wire_chunk_length());

        let mut open = Some(open);
        let mut writer: Option<W> = None;
        self.run_chunks(&key, plan, |session, chunk| {
            if writer.is_none() {
                let open = open
                    .take()
                    .ok_or_else(|| FilegateError::protocol("download sink opened twice"))?;
                writer = Some(open(chunk.offset)?);
            }
            let out = writer
                .as_mut()
                .ok_or_else(|| FilegateError::protocol("download sink missing"))?;
            session.fetch_chunk(remote, chunk, out)
        })?;

        if let Some(mut out) = writer {
            out.flush()?;
        }
        Ok(total)
    }

    /// Drive a transfer chunk by chunk with recovery bookkeeping
    fn run_chunks<F>(&mut self, key: &TransferKey, plan: ChunkPlan, mut step: F) -> Result<()>
    where
        F: FnMut(&mut Session, TransferChunk) -> Result<()>,
    {
        let ResumePoint {
            resumed,
            next_chunk,
            bytes_skipped,
        } = self.recovery.begin(key, plan.chunk_count());
        if resumed {
            info!(
                "Resuming {} of {} at chunk {}/{}",
                match key.direction {
                    TransferDirection::Upload => "upload",
                    TransferDirection::Download => "download",
                },
                key.remote,
                next_chunk + 1,
                plan.chunk_count()
            );
        }
        if let Some(listener) = &self.listener {
            listener.started(&key.remote, key.direction, plan.total_length(), bytes_skipped);
        }

        let outcome = self.run_remaining(key, plan, next_chunk, &mut step);
        match &outcome {
            Ok(()) => self.recovery.complete(key),
            Err(e) if e.is_resumable() => {
                warn!("Transfer of {} interrupted: {}", key.remote, e);
                self.recovery.interrupt(key);
            }
            Err(_) => self.recovery.fail(key),
        }
        if let Some(listener) = &self.listener {
            listener.finished(&key.remote, outcome.is_ok());
        }
        outcome
    }

    fn run_remaining<F>(
        &mut self,
        key: &TransferKey,
        plan: ChunkPlan,
        first: u64,
        step: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&mut Session, TransferChunk) -> Result<()>,
    {
        for chunk in plan.chunks_from(first) {
            if self.cancel.swap(false, Ordering::SeqCst) {
                return Err(FilegateError::Cancelled);
            }

            debug!(
                "Chunk {}/{} of {} ({} bytes at {})",
                chunk.index + 1,
                plan.chunk_count(),
                key.remote,
                chunk.length,
                chunk.offset
            );
            step(self, chunk)?;

            self.recovery.acknowledge(key, chunk.index, chunk.length);
            if let Some(listener) = &self.listener {
                listener.advanced(chunk.length);
            }
        }
        Ok(())
    }

    fn send_chunk(
        &mut self,
        source: &mut dyn UploadSource,
        remote: &str,
        chunk: TransferChunk,
    ) -> Result<()> {
        let count = ChunkPlan::new(chunk.total_length, chunk.chunk_length).chunk_count();
        let params = self.with_identity(
            Action::Upload,
            vec![
                RequestParameter::new(param::FILENAME, remote),
                RequestParameter::new(param::CHUNK_LENGTH, chunk.chunk_length.to_string()),
                RequestParameter::new(param::CHUNK_INDEX, chunk.index.to_string()),
                RequestParameter::new(param::CHUNK_COUNT, count.to_string()),
            ],
        )?;

        let file_name = Path::new(remote)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| remote.to_string());
        let request = HttpRequest {
            url: self.url().clone(),
            body: RequestBody::Multipart {
                fields: to_wire(params),
                file: FilePart {
                    file_name,
                    length: chunk.length,
                    content: source.open_range(chunk.offset, chunk.length)?,
                },
            },
            idempotent: false,
        };

        let payload = self.execute(request)?.into_envelope()?.into_payload()?;
        self.check_session_payload(&payload)
    }

    fn fetch_chunk(&mut self, remote: &str, chunk: TransferChunk, out: &mut dyn Write) -> Result<()> {
        let reply = self.send_form(
            Action::Download,
            vec![
                RequestParameter::new(param::FILENAME, remote),
                RequestParameter::new(param::CHUNK_LENGTH, chunk.chunk_length.to_string()),
                RequestParameter::new(param::CHUNK_INDEX, chunk.index.to_string()),
            ],
        )?;

        let mut content = reply.into_binary()?;

        // A rejected token comes back as a short text payload, possibly of
        // exactly the expected length, so short replies are checked first
        if chunk.length <= SHORT_REPLY_LIMIT {
            let mut short = Vec::new();
            (&mut content).take(SHORT_REPLY_LIMIT + 1).read_to_end(&mut short)?;
            if let Ok(text) = std::str::from_utf8(&short) {
                self.check_session_payload(text)?;
            }
            if short.len() as u64 != chunk.length {
                return Err(FilegateError::protocol(format!(
                    "expected {} bytes for chunk {}, got {}",
                    chunk.length,
                    chunk.index,
                    short.len()
                )));
            }
            out.write_all(&short)?;
            out.flush()?;
            return Ok(());
        }

        let copied = io::copy(&mut content, out)?;
        if copied != chunk.length {
            return Err(FilegateError::protocol(format!(
                "expected {} bytes for chunk {}, got {}",
                chunk.length, chunk.index, copied
            )));
        }
        out.flush()?;
        Ok(())
    }
}

const SHORT_REPLY_LIMIT: u64 = 64;

fn require_remote(remote: &str) -> Result<&str> {
    if remote.trim().is_empty() {
        Err(FilegateError::invalid("remote path is empty"))
    } else {
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SessionOptions;

    struct Counting {
        started: std::sync::Mutex<Vec<(u64, u64)>>,
        bytes: std::sync::atomic::AtomicU64,
    }

    impl TransferListener for Counting {
        fn started(&self, _remote: &str, _direction: TransferDirection, total: u64, resumed_at: u64) {
            self.started.lock().unwrap().push((total, resumed_at));
        }

        fn advanced(&self, bytes: u64) {
            self.bytes.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listener_default_methods() {
        let listener = Counting {
            started: Default::default(),
            bytes: Default::default(),
        };
        listener.started("a", TransferDirection::Upload, 10, 0);
        listener.advanced(4);
        listener.finished("a", true);
        assert_eq!(listener.bytes.load(Ordering::SeqCst), 4);
        assert_eq!(listener.started.lock().unwrap()[0], (10, 0));
    }

    #[test]
    fn test_empty_remote_rejected_locally() {
        assert!(require_remote(" ").is_err());
        assert_eq!(SessionOptions::default().chunk_length, 10 * 1024 * 1024);
    }
}
