//! Streams handed to the transport for sending.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A readable upload source, limited to the granted byte range.
#[derive(Debug)]
pub enum UploadStream {
    /// A slice of a regular file.
    File {
        /// Open handle, positioned at the slice start.
        file: File,
        /// Bytes remaining in the slice.
        remaining: u64,
    },
    /// An in-memory document (file lists, TTH leaf data, bloom bits).
    Memory {
        /// Document bytes.
        data: Vec<u8>,
        /// Read cursor.
        pos: usize,
    },
}

impl UploadStream {
    /// Open a file slice `[start, start + len)`.
    ///
    /// # Errors
    ///
    /// Open or seek failures.
    pub fn open_file(path: &Path, start: u64, len: u64) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(UploadStream::File {
            file,
            remaining: len,
        })
    }

    /// Wrap an in-memory document.
    #[must_use]
    pub fn memory(data: Vec<u8>) -> Self {
        UploadStream::Memory { data, pos: 0 }
    }

    /// Bytes still to be sent.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        match self {
            UploadStream::File { remaining, .. } => *remaining,
            UploadStream::Memory { data, pos } => (data.len() - pos) as u64,
        }
    }

    /// Reposition a file stream for resume. Memory streams restart.
    ///
    /// # Errors
    ///
    /// Seek failures on file streams.
    pub fn reposition(&mut self, start: u64, len: u64) -> io::Result<()> {
        match self {
            UploadStream::File { file, remaining } => {
                file.seek(SeekFrom::Start(start))?;
                *remaining = len;
            }
            UploadStream::Memory { pos, .. } => {
                *pos = start as usize;
            }
        }
        Ok(())
    }
}

impl Read for UploadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            UploadStream::File { file, remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let cap = (*remaining).min(buf.len() as u64) as usize;
                let read = file.read(&mut buf[..cap])?;
                *remaining -= read as u64;
                Ok(read)
            }
            UploadStream::Memory { data, pos } => {
                let cap = (data.len() - *pos).min(buf.len());
                buf[..cap].copy_from_slice(&data[*pos..*pos + cap]);
                *pos += cap;
                Ok(cap)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_slice_respects_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, (0u8..100).collect::<Vec<_>>()).unwrap();

        let mut s = UploadStream::open_file(&path, 10, 20).unwrap();
        assert_eq!(s.remaining(), 20);
        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 20);
        assert_eq!(out[0], 10);
        assert_eq!(out[19], 29);
    }

    #[test]
    fn memory_stream_reads_out() {
        let mut s = UploadStream::memory(vec![1, 2, 3]);
        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(s.remaining(), 0);
    }
}
