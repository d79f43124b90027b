//! Upload sources
//!
//! The transfer engine asks a source for one byte range at a time and
//! streams it into the request. A failed chunk is asked for again on resume,
//! so sources must be able to hand out the same range twice.

use crate::error::{FilegateError, IoResultExt, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A boxed, owned chunk reader
pub type ChunkReader = Box<dyn Read + Send>;

/// Content to upload
pub trait UploadSource {
    /// Total length in bytes
    fn total_length(&self) -> u64;

    /// Reader over `length` bytes starting at `offset`
    fn open_range(&mut self, offset: u64, length: u64) -> Result<ChunkReader>;
}

/// Local file, re-opened and seeked for every range
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    length: u64,
}

impl FileSource {
    /// Open a file source
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FilegateError::NotFound(path.clone()),
            _ => FilegateError::io(&path, e),
        })?;
        if !metadata.is_file() {
            return Err(FilegateError::invalid(format!("{} is not a file", path.display())));
        }

        Ok(Self {
            path,
            length: metadata.len(),
        })
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UploadSource for FileSource {
    fn total_length(&self) -> u64 {
        self.length
    }

    fn open_range(&mut self, offset: u64, length: u64) -> Result<ChunkReader> {
        let mut file = File::open(&self.path).with_path(&self.path)?;
        file.seek(SeekFrom::Start(offset)).with_path(&self.path)?;
        Ok(Box::new(file.take(length)))
    }
}

/// Forward-only reader of declared length
///
/// Each range is spooled into an anonymous temporary file before it is
/// sent, so the most recent range can be handed out again without holding
/// it in memory. Ranges must be requested in order.
pub struct StreamSource<R> {
    reader: R,
    length: u64,
    position: u64,
    spooled: Option<(u64, u64, File)>,
}

impl<R: Read> StreamSource<R> {
    /// Wrap a reader that will yield exactly `length` bytes
    pub fn new(reader: R, length: u64) -> Self {
        Self {
            reader,
            length,
            position: 0,
            spooled: None,
        }
    }

    fn spool(&mut self, length: u64) -> Result<File> {
        let mut spool = tempfile::tempfile()?;
        let copied = io::copy(&mut (&mut self.reader).take(length), &mut spool)?;
        if copied != length {
            return Err(FilegateError::invalid(format!(
                "stream ended after {} bytes, {} declared",
                self.position + copied,
                self.length
            )));
        }
        self.position += copied;
        Ok(spool)
    }
}

impl<R: Read> UploadSource for StreamSource<R> {
    fn total_length(&self) -> u64 {
        self.length
    }

    fn open_range(&mut self, offset: u64, length: u64) -> Result<ChunkReader> {
        let reuse = matches!(&self.spooled, Some((o, l, _)) if *o == offset && *l == length);
        if !reuse {
            if offset != self.position {
                return Err(FilegateError::invalid(format!(
                    "stream source cannot seek to {} (at {})",
                    offset, self.position
                )));
            }
            let spool = self.spool(length)?;
            self.spooled = Some((offset, length, spool));
        }

        let (_, _, spool) = self
            .spooled
            .as_ref()
            .ok_or_else(|| FilegateError::protocol("spooled chunk vanished"))?;
        let mut handle = spool.try_clone()?;
        handle.seek(SeekFrom::Start(0))?;
        Ok(Box::new(handle.take(length)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn read_all(mut reader: ChunkReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_file_source_ranges() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut source = FileSource::open(&path).unwrap();
        assert_eq!(source.total_length(), 10);
        assert_eq!(read_all(source.open_range(3, 4).unwrap()), b"3456");
        assert_eq!(read_all(source.open_range(8, 4).unwrap()), b"89");
        // Same range twice
        assert_eq!(read_all(source.open_range(3, 4).unwrap()), b"3456");
    }

    #[test]
    fn test_file_source_missing() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FileSource::open(dir.path().join("nope")),
            Err(FilegateError::NotFound(_))
        ));
        assert!(FileSource::open(dir.path()).is_err());
    }

    #[test]
    fn test_stream_source_replays_last_range() {
        let mut source = StreamSource::new(Cursor::new(b"abcdefghij".to_vec()), 10);
        assert_eq!(read_all(source.open_range(0, 4).unwrap()), b"abcd");
        assert_eq!(read_all(source.open_range(4, 4).unwrap()), b"efgh");
        assert_eq!(read_all(source.open_range(4, 4).unwrap()), b"efgh");
        assert_eq!(read_all(source.open_range(8, 2).unwrap()), b"ij");
        assert!(source.open_range(0, 4).is_err());
    }

    #[test]
    fn test_stream_source_short_input() {
        let mut source = StreamSource::new(Cursor::new(b"abc".to_vec()), 10);
        assert!(source.open_range(0, 10).is_err());
    }
}
