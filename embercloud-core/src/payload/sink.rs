//! Destinations for decoded payload bytes.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for decoded bytes.
pub trait ByteSink {
    /// Accept a run of bytes; all of them or an error.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Finish writing.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: ByteSink + ?Sized> ByteSink for Box<S> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl ByteSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Growable in-memory buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemorySink {
    buf: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl ByteSink for MemorySink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

/// How a [`FileSink`] opens its file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Create or truncate.
    #[default]
    Write,
    /// Create or append.
    Append,
}

/// Buffered file destination.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl FileSink {
    /// Open `path` in the given mode.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            OpenMode::Write => options.write(true).truncate(true),
            OpenMode::Append => options.append(true),
        };
        let file = options.open(&path)?;
        tracing::debug!("Opened {} for decoded payload", path.display());
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    /// Target path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl ByteSink for FileSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("file sink already closed"))?;
        writer.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}

/// Firmware update collaborator.
pub trait FirmwareUpdater: Send {
    /// Prepare the inactive partition; `size` is the image size when known.
    fn begin(&mut self, size: Option<usize>) -> io::Result<()>;

    /// Write image bytes. Returns the number of bytes accepted.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Finalise and validate the image.
    fn end(&mut self) -> io::Result<()>;
}

/// Sink that streams decoded bytes into a [`FirmwareUpdater`].
///
/// The update is started on the first write and finalised on close.
pub struct OtaSink<U: FirmwareUpdater> {
    updater: U,
    expected_size: Option<usize>,
    started: bool,
    written: usize,
}

impl<U: FirmwareUpdater> OtaSink<U> {
    pub fn new(updater: U) -> Self {
        Self {
            updater,
            expected_size: None,
            started: false,
            written: 0,
        }
    }

    /// Announce the decoded image size to the updater.
    pub fn with_expected_size(mut self, size: usize) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> U {
        self.updater
    }
}

impl<U: FirmwareUpdater> ByteSink for OtaSink<U> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.started {
            self.updater.begin(self.expected_size)?;
            self.started = true;
        }
        let accepted = self.updater.write(bytes)?;
        if accepted != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("updater accepted {accepted} of {} bytes", bytes.len()),
            ));
        }
        self.written += accepted;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.started {
            self.updater.begin(self.expected_size)?;
            self.started = true;
        }
        tracing::info!("Finalising firmware image ({} bytes)", self.written);
        self.updater.end()
    }
}

/// Caller-selected destination for a downloaded inline value.
pub enum DownloadTarget {
    Memory,
    File { path: PathBuf, mode: OpenMode },
    Firmware(Box<dyn FirmwareUpdater>),
}

impl DownloadTarget {
    /// Open the selected sink.
    pub fn open(self) -> io::Result<OpenSink> {
        Ok(match self {
            Self::Memory => OpenSink::Memory(MemorySink::new()),
            Self::File { path, mode } => OpenSink::File(FileSink::open(path, mode)?),
            Self::Firmware(updater) => OpenSink::Firmware(OtaSink::new(updater)),
        })
    }
}

/// A sink opened from a [`DownloadTarget`].
pub enum OpenSink {
    Memory(MemorySink),
    File(FileSink),
    Firmware(OtaSink<Box<dyn FirmwareUpdater>>),
}

impl OpenSink {
    /// The decoded bytes, for a memory target.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Memory(sink) => Some(sink.into_inner()),
            Self::File(_) | Self::Firmware(_) => None,
        }
    }
}

impl std::fmt::Debug for OpenSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(sink) => f.debug_tuple("Memory").field(sink).finish(),
            Self::File(sink) => f.debug_tuple("File").field(sink).finish(),
            Self::Firmware(sink) => f.debug_struct("Firmware").field("written", &sink.written()).finish(),
        }
    }
}

impl ByteSink for OpenSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Self::Memory(sink) => sink.write(bytes),
            Self::File(sink) => sink.write(bytes),
            Self::Firmware(sink) => sink.write(bytes),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            Self::Memory(sink) => sink.close(),
            Self::File(sink) => sink.close(),
            Self::Firmware(sink) => sink.close(),
        }
    }
}

impl FirmwareUpdater for Box<dyn FirmwareUpdater> {
    fn begin(&mut self, size: Option<usize>) -> io::Result<()> {
        (**self).begin(size)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn end(&mut self) -> io::Result<()> {
        (**self).end()
    }
}

impl std::fmt::Debug for DownloadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::File { path, mode } => f
                .debug_struct("File")
                .field("path", path)
                .field("mode", mode)
                .finish(),
            Self::Firmware(_) => f.write_str("Firmware"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::decode_base64_stream;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Default, Clone)]
    struct RecordingUpdater {
        log: Arc<Mutex<Vec<String>>>,
        image: Arc<Mutex<Vec<u8>>>,
        short_writes: bool,
    }

    impl FirmwareUpdater for RecordingUpdater {
        fn begin(&mut self, size: Option<usize>) -> io::Result<()> {
            self.log.lock().push(format!("begin {size:?}"));
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            if self.short_writes {
                return Ok(bytes.len() / 2);
            }
            self.image.lock().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn end(&mut self) -> io::Result<()> {
            self.log.lock().push("end".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_file_sink_writes_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.bin");

        let mut sink = FileSink::open(&path, OpenMode::Write).unwrap();
        decode_base64_stream(b"\"file,base64,AQID\"", &mut sink).unwrap();
        sink.close().unwrap();
        assert_eq!(sink.written(), 3);

        let mut sink = FileSink::open(&path, OpenMode::Append).unwrap();
        sink.write(&[4]).unwrap();
        drop(sink);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_closed_file_sink_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::open(dir.path().join("x"), OpenMode::Write).unwrap();
        sink.close().unwrap();
        assert!(sink.write(b"late").is_err());
    }

    #[test]
    fn test_ota_sink_lifecycle() {
        let updater = RecordingUpdater::default();
        let mut sink = OtaSink::new(updater.clone()).with_expected_size(5);
        decode_base64_stream(b"\"blob,base64,SGVsbG8=\"", &mut sink).unwrap();
        sink.close().unwrap();

        assert_eq!(updater.image.lock().as_slice(), b"Hello");
        assert_eq!(*updater.log.lock(), vec!["begin Some(5)", "end"]);
    }

    #[test]
    fn test_ota_short_write_is_an_error() {
        let updater = RecordingUpdater {
            short_writes: true,
            ..Default::default()
        };
        let mut sink = OtaSink::new(updater);
        let result = decode_base64_stream(b"\"blob,base64,SGVsbG8h\"", &mut sink);
        assert!(matches!(
            result,
            Err(crate::payload::Base64Error::Sink { .. })
        ));
    }

    #[test]
    fn test_download_target_selection() {
        let mut sink = DownloadTarget::Memory.open().unwrap();
        sink.write(b"abc").unwrap();
        assert_eq!(sink.into_bytes().unwrap(), b"abc");

        let dir = tempfile::tempdir().unwrap();
        let target = DownloadTarget::File {
            path: dir.path().join("out"),
            mode: OpenMode::Write,
        };
        let mut sink = target.open().unwrap();
        sink.write(b"xyz").unwrap();
        sink.close().unwrap();
        assert_eq!(std::fs::read(dir.path().join("out")).unwrap(), b"xyz");
        assert_eq!(sink.into_bytes(), None);

        let updater = RecordingUpdater::default();
        let mut sink = DownloadTarget::Firmware(Box::new(updater.clone()))
            .open()
            .unwrap();
        sink.write(b"fw").unwrap();
        sink.close().unwrap();
        assert_eq!(updater.image.lock().as_slice(), b"fw");
    }

    #[test]
    fn test_memory_target_returns_decoded_payload() {
        let mut sink = DownloadTarget::Memory.open().unwrap();
        decode_base64_stream(b"\"blob,base64,SGVsbG8sIHdvcmxkIQ==\"", &mut sink).unwrap();
        sink.close().unwrap();
        assert_eq!(sink.into_bytes().unwrap(), b"Hello, world!");
    }
}
