//! Raw vector files: headerless, row-major binary32.
//!
//! A base file holds `total_vectors × dimension` floats, a query file holds
//! `dimension` floats. Vector count and dimension travel out of band.

use crate::error::{CxlError, Result};
use cxl_chip::fixed::SAMPLE_BYTES;
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Shape of a vector corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorpusShape {
    /// Vectors in the corpus
    pub total_vectors: u64,
    /// Samples per vector
    pub dimension: u32,
}

impl CorpusShape {
    /// New shape.
    pub const fn new(total_vectors: u64, dimension: u32) -> Self {
        Self {
            total_vectors,
            dimension,
        }
    }

    /// `dimension × 4`.
    pub const fn bytes_per_vector(&self) -> usize {
        self.dimension as usize * SAMPLE_BYTES
    }

    /// Size of the whole corpus in bytes.
    pub const fn total_bytes(&self) -> u64 {
        self.total_vectors * self.bytes_per_vector() as u64
    }
}

/// A vector file read front to back in exact-length chunks.
#[derive(Debug)]
pub struct VectorFile {
    file: File,
    path: PathBuf,
    offset: u64,
}

impl VectorFile {
    /// Open `path` for reading at offset 0.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` if the file does not exist, `Io` otherwise.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => CxlError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => CxlError::from(e),
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            offset: 0,
        })
    }

    /// Fill `dst` from the current offset and advance past it.
    ///
    /// # Errors
    ///
    /// Returns `ShortRead` if the file ends first; the offset is left unchanged.
    pub fn read_next(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < dst.len() {
            match self.file.read_at(&mut dst[done..], self.offset + done as u64) {
                Ok(0) => {
                    return Err(CxlError::ShortRead {
                        path: self.path.clone(),
                        offset: self.offset,
                        expected: dst.len(),
                        got: done,
                    })
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.offset += done as u64;
        Ok(())
    }

    /// Bytes consumed so far.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_consecutive_chunks() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&(0u8..=255).collect::<Vec<_>>()).unwrap();

        let mut v = VectorFile::open(f.path()).unwrap();
        let mut a = [0u8; 100];
        let mut b = [0u8; 100];
        v.read_next(&mut a).unwrap();
        v.read_next(&mut b).unwrap();
        assert_eq!(a[99], 99);
        assert_eq!(b[0], 100);
        assert_eq!(v.offset(), 200);
    }

    #[test]
    fn short_read_reports_counts() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 300]).unwrap();

        let mut v = VectorFile::open(f.path()).unwrap();
        v.read_next(&mut [0u8; 256]).unwrap();
        match v.read_next(&mut [0u8; 256]) {
            Err(CxlError::ShortRead { offset, expected, got, .. }) => {
                assert_eq!((offset, expected, got), (256, 256, 44));
            }
            other => panic!("expected short read, got {other:?}"),
        }
        assert_eq!(v.offset(), 256);
    }

    #[test]
    fn missing_file() {
        let err = VectorFile::open(Path::new("/nonexistent/base.bin")).unwrap_err();
        assert!(matches!(err, CxlError::FileNotFound { .. }));
    }

    #[test]
    fn shape_sizes() {
        let s = CorpusShape::new(10_000, 128);
        assert_eq!(s.bytes_per_vector(), 512);
        assert_eq!(s.total_bytes(), 5_120_000);
    }
}
