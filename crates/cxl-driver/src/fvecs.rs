//! `.fvecs` → raw `.bin` conversion.
//!
//! `.fvecs` (the TEXMEX/SIFT layout) prefixes every vector with its
//! dimension as a little-endian `i32`. The streaming engine wants the
//! headerless row-major layout instead, with count and dimension kept
//! aside; they go to a `.meta` file next to the output:
//!
//! ```text
//! vectors=10000
//! dimension=128
//! bytes=5120000
//! size_MB=4.88
//! ```

use crate::error::{CxlError, Result};
use cxl_chip::fixed::SAMPLE_BYTES;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Progress is logged every this many vectors.
const PROGRESS_EVERY: u64 = 100_000;

/// What a conversion produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FvecsSummary {
    /// Vectors written
    pub vectors: u64,
    /// Samples per vector
    pub dimension: u32,
    /// Bytes written to the `.bin`
    pub bytes: u64,
    /// Sidecar path
    pub meta_path: PathBuf,
}

impl FvecsSummary {
    /// Sidecar contents.
    pub fn meta(&self) -> String {
        #[allow(clippy::cast_precision_loss)]
        let mb = self.bytes as f64 / (1024.0 * 1024.0);
        format!(
            "vectors={}\ndimension={}\nbytes={}\nsize_MB={mb:.2}\n",
            self.vectors, self.dimension, self.bytes
        )
    }
}

/// Fill `buf` or report how many bytes were available.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match r.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

/// Convert `input` (`.fvecs`) to `output` (raw f32), stopping after `limit` vectors if given.
///
/// Every record must carry `expected_dim`. The `.meta` sidecar is written
/// next to `output` with the same stem.
///
/// # Errors
///
/// Returns `FileNotFound` if `input` is missing, `Format` for a record with
/// the wrong dimension or a truncated record, `Io` otherwise.
pub fn convert_fvecs(
    input: &Path,
    output: &Path,
    expected_dim: u32,
    limit: Option<u64>,
) -> Result<FvecsSummary> {
    if expected_dim == 0 {
        return Err(CxlError::invalid_config("dimension must be non-zero"));
    }
    let src = File::open(input).map_err(|e| match e.kind() {
        ErrorKind::NotFound => CxlError::FileNotFound {
            path: input.to_path_buf(),
        },
        _ => CxlError::from(e),
    })?;
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let mut reader = BufReader::new(src);
    let mut writer = BufWriter::new(File::create(output)?);
    let mut record = vec![0u8; expected_dim as usize * SAMPLE_BYTES];
    let mut vectors = 0u64;
    let mut bytes = 0u64;

    tracing::info!("Converting {} -> {}", input.display(), output.display());

    while limit.map_or(true, |l| vectors < l) {
        let mut prefix = [0u8; 4];
        match read_full(&mut reader, &mut prefix)? {
            0 => break,
            4 => {}
            _ => {
                return Err(CxlError::format(format!(
                    "{}: incomplete dimension prefix at vector {vectors}",
                    input.display()
                )))
            }
        }

        let dim = i32::from_le_bytes(prefix);
        if u32::try_from(dim).ok() != Some(expected_dim) {
            return Err(CxlError::format(format!(
                "{}: vector {vectors} has dim={dim}, expected {expected_dim}",
                input.display()
            )));
        }

        if read_full(&mut reader, &mut record)? != record.len() {
            return Err(CxlError::format(format!(
                "{}: incomplete data for vector {vectors}",
                input.display()
            )));
        }
        writer.write_all(&record)?;
        vectors += 1;
        bytes += record.len() as u64;

        if vectors % PROGRESS_EVERY == 0 {
            tracing::info!("Converted {vectors} vectors...");
        }
    }
    if limit.is_some_and(|l| vectors >= l) {
        tracing::info!("Reached limit ({vectors}), stopping early");
    }
    writer.flush()?;

    let summary = FvecsSummary {
        vectors,
        dimension: expected_dim,
        bytes,
        meta_path: output.with_extension("meta"),
    };
    std::fs::write(&summary.meta_path, summary.meta())?;
    tracing::info!(
        "Wrote {vectors} vectors ({bytes} bytes) to {}, meta {}",
        output.display(),
        summary.meta_path.display()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fvecs(vectors: &[Vec<f32>]) -> Vec<u8> {
        let mut out = Vec::new();
        for v in vectors {
            out.extend_from_slice(&(v.len() as i32).to_le_bytes());
            out.extend_from_slice(bytemuck::cast_slice(v.as_slice()));
        }
        out
    }

    #[test]
    fn strips_prefixes_and_writes_meta() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("base.fvecs");
        let output = dir.path().join("out/base.bin");
        let data = vec![vec![1.0f32, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]];
        std::fs::write(&input, fvecs(&data)).unwrap();

        let s = convert_fvecs(&input, &output, 4, None).unwrap();
        assert_eq!((s.vectors, s.bytes), (2, 32));

        let raw = std::fs::read(&output).unwrap();
        let floats: Vec<f32> = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let meta = std::fs::read_to_string(dir.path().join("out/base.meta")).unwrap();
        assert_eq!(meta, "vectors=2\ndimension=4\nbytes=32\nsize_MB=0.00\n");
    }

    #[test]
    fn honours_limit() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("q.fvecs");
        std::fs::write(&input, fvecs(&vec![vec![0.5f32; 8]; 5])).unwrap();

        let s = convert_fvecs(&input, &dir.path().join("q.bin"), 8, Some(3)).unwrap();
        assert_eq!(s.vectors, 3);
        assert_eq!(std::fs::metadata(dir.path().join("q.bin")).unwrap().len(), 96);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.fvecs");
        std::fs::write(&input, fvecs(&[vec![0.0f32; 4], vec![0.0; 3]])).unwrap();

        let err = convert_fvecs(&input, &dir.path().join("bad.bin"), 4, None).unwrap_err();
        assert!(
            matches!(err, CxlError::Format { ref reason } if reason.contains("vector 1 has dim=3"))
        );
    }

    #[test]
    fn rejects_truncated_record() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cut.fvecs");
        let mut bytes = fvecs(&[vec![0.0f32; 4]]);
        bytes.truncate(bytes.len() - 2);
        std::fs::write(&input, bytes).unwrap();

        let err = convert_fvecs(&input, &dir.path().join("cut.bin"), 4, None).unwrap_err();
        assert!(matches!(err, CxlError::Format { .. }));
    }

    #[test]
    fn meta_reports_megabytes() {
        let s = FvecsSummary {
            vectors: 1_000_000,
            dimension: 128,
            bytes: 512_000_000,
            meta_path: PathBuf::from("base.meta"),
        };
        assert!(s.meta().ends_with("size_MB=488.28\n"));
    }
}
