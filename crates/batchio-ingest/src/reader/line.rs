//! Newline-delimited framer

use batchio_common::types::{FileFragment, Record};
use batchio_common::Result;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::FragmentReader;

const BUFFER_SIZE: usize = 64 * 1024;

/// Whether `path` is read through the gzip decoder
pub(crate) fn is_gzip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Counts bytes pulled through the inner reader
pub(crate) struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

enum LineSource {
    Plain(BufReader<File>),
    Gzip(BufReader<MultiGzDecoder<CountingReader<File>>>),
}

impl LineSource {
    fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            LineSource::Plain(r) => r.read_until(b'\n', buf),
            LineSource::Gzip(r) => r.read_until(b'\n', buf),
        }
    }
}

/// One record per line; the key is the line without its terminator.
///
/// A fragment owns every line that starts inside `[start, end]`. When `start`
/// is not zero the bytes up to and including the first newline are skipped
/// since the previous fragment reads that line.
///
/// Gzip files are never split: the fragment at offset 0 reads the whole
/// decompressed stream and any other fragment is empty.
pub struct LineReader {
    path: PathBuf,
    source: Option<LineSource>,
    start: u64,
    end: u64,
    pos: u64,
    compressed_len: u64,
    done: bool,
}

impl LineReader {
    fn open_plain(fragment: &FileFragment) -> Result<Self> {
        let mut file = File::open(&fragment.path)?;
        let mut start = fragment.start;
        if start != 0 {
            file.seek(SeekFrom::Start(start))?;
        }
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);

        if start != 0 {
            let mut discard = Vec::new();
            start += reader.read_until(b'\n', &mut discard)? as u64;
        }

        Ok(Self {
            path: fragment.path.clone(),
            source: Some(LineSource::Plain(reader)),
            start,
            end: fragment.end(),
            pos: start,
            compressed_len: 0,
            done: false,
        })
    }

    fn open_gzip(fragment: &FileFragment) -> Result<Self> {
        let mut reader = Self {
            path: fragment.path.clone(),
            source: None,
            start: fragment.start,
            end: fragment.end(),
            pos: fragment.start,
            compressed_len: fragment.length,
            done: true,
        };

        if fragment.start != 0 || fragment.length == 0 {
            debug!(fragment = %fragment, "Compressed input is only read from offset 0");
            return Ok(reader);
        }

        let file = File::open(&fragment.path)?;
        let decoder = MultiGzDecoder::new(CountingReader::new(file));
        reader.source = Some(LineSource::Gzip(BufReader::with_capacity(BUFFER_SIZE, decoder)));
        reader.done = false;
        Ok(reader)
    }
}

impl FragmentReader for LineReader {
    type Options = ();

    fn open(fragment: &FileFragment, _options: &()) -> Result<Self> {
        if is_gzip(&fragment.path) {
            Self::open_gzip(fragment)
        } else {
            Self::open_plain(fragment)
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        let Some(source) = self.source.as_mut() else {
            self.done = true;
            return Ok(None);
        };

        if matches!(source, LineSource::Plain(_)) && self.pos > self.end {
            self.done = true;
            return Ok(None);
        }

        let mut line = Vec::new();
        let consumed = source.read_line(&mut line)?;
        if consumed == 0 {
            self.done = true;
            return Ok(None);
        }
        self.pos += consumed as u64;

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        Ok(Some(Record::key_only(line)))
    }

    fn progress(&self) -> f32 {
        if self.done {
            return 1.0;
        }
        match &self.source {
            Some(LineSource::Gzip(r)) => {
                if self.compressed_len == 0 {
                    return 0.0;
                }
                let read = r.get_ref().get_ref().count();
                (read as f32 / self.compressed_len as f32).min(1.0)
            },
            _ => {
                if self.end <= self.start {
                    return 0.0;
                }
                ((self.pos - self.start) as f32 / (self.end - self.start) as f32).min(1.0)
            },
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.source.take().is_some() {
            debug!(path = %self.path.display(), "Closed line fragment");
        }
        self.done = true;
        Ok(())
    }
}
