//! Raw-image export.
//!
//! Streams the composed logical disk into a raw image. Chunks flow through
//! a bounded channel to a dedicated writer thread so reading the next
//! chunk overlaps writing the previous one; the whole stream is hashed
//! with SHA-256 for out-of-band verification.

use std::io::{Read, Seek, Write};

use crossbeam_channel::bounded;
use sha2::{Digest, Sha256};

use crate::disk::DiskContent;
use crate::error::{Error, Result};

/// Default chunk size for export (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Chunks buffered between the reader and the writer thread.
const PIPELINE_DEPTH: usize = 4;

/// Options for the export process.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Size of chunks to stream, in bytes.
    pub chunk_size: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Progress information for the export process.
#[derive(Debug, Clone, Copy)]
pub struct ExportProgress {
    /// Bytes written so far.
    pub bytes_processed: u64,
    /// Total bytes to write.
    pub bytes_total: u64,
}

impl ExportProgress {
    /// Overall percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_processed as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send>;

/// Result of a completed export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    /// Bytes written to the output.
    pub bytes_written: u64,
    /// SHA-256 digest of the exported content.
    pub sha256: [u8; 32],
}

impl ExportSummary {
    /// The digest as a lowercase hex string.
    pub fn sha256_hex(&self) -> String {
        self.sha256.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Export the composed disk content as a raw image.
///
/// Returns the writer together with the byte count and content digest.
pub fn export_raw<S, W>(
    content: &mut DiskContent<S>,
    mut writer: W,
    options: &ExportOptions,
    progress: Option<ProgressCallback>,
) -> Result<(W, ExportSummary)>
where
    S: Read + Write + Seek,
    W: Write + Send,
{
    if options.chunk_size == 0 {
        return Err(Error::format("export chunk size must be positive"));
    }
    let total = content.len_bytes();

    std::thread::scope(|scope| -> Result<(W, ExportSummary)> {
        let (tx, rx) = bounded::<Vec<u8>>(PIPELINE_DEPTH);

        let writer_handle = scope.spawn(move || -> Result<(W, ExportSummary)> {
            let mut hasher = Sha256::new();
            let mut written = 0u64;
            for chunk in rx.iter() {
                writer.write_all(&chunk)?;
                hasher.update(&chunk);
                written += chunk.len() as u64;
                if let Some(callback) = &progress {
                    callback(ExportProgress {
                        bytes_processed: written,
                        bytes_total: total,
                    });
                }
            }
            writer.flush()?;
            Ok((
                writer,
                ExportSummary {
                    bytes_written: written,
                    sha256: hasher.finalize().into(),
                },
            ))
        });

        let mut offset = 0u64;
        let mut read_error = None;
        while offset < total {
            let n = (total - offset).min(options.chunk_size as u64) as usize;
            let mut chunk = vec![0u8; n];
            if let Err(e) = content.read_at(offset, &mut chunk) {
                read_error = Some(e);
                break;
            }
            // A closed channel means the writer already failed; its error
            // surfaces from the join below.
            if tx.send(chunk).is_err() {
                break;
            }
            offset += n as u64;
        }
        drop(tx);

        let writer_result = writer_handle
            .join()
            .map_err(|_| Error::format("export writer thread panicked"))?;
        if let Some(e) = read_error {
            return Err(e);
        }
        writer_result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AccessMode;
    use crate::disk::ExtentStream;
    use std::io::Cursor;

    fn expected_sha256(data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn test_export_zero_disk() {
        let mut content = DiskContent::new(vec![ExtentStream::<Cursor<Vec<u8>>>::zero(8192)]);
        let (out, summary) =
            export_raw(&mut content, Vec::new(), &ExportOptions::default(), None).unwrap();

        assert_eq!(out.len(), 8192);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(summary.bytes_written, 8192);
        assert_eq!(summary.sha256, expected_sha256(&vec![0u8; 8192]));
    }

    #[test]
    fn test_export_chunking_preserves_content() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 257) as u8).collect();
        let mut content = DiskContent::new(vec![ExtentStream::flat(
            Cursor::new(data.clone()),
            0,
            data.len() as u64,
            AccessMode::ReadOnly,
        )]);

        let options = ExportOptions { chunk_size: 777 };
        let (out, summary) = export_raw(&mut content, Vec::new(), &options, None).unwrap();
        assert_eq!(out, data);
        assert_eq!(summary.sha256, expected_sha256(&data));
    }

    #[test]
    fn test_export_reports_progress() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let mut content = DiskContent::new(vec![ExtentStream::<Cursor<Vec<u8>>>::zero(4096)]);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let callback: ProgressCallback = Box::new(move |p: ExportProgress| {
            seen_clone.store(p.bytes_processed, Ordering::SeqCst);
        });

        let options = ExportOptions { chunk_size: 1024 };
        export_raw(&mut content, Vec::new(), &options, Some(callback)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4096);
    }

    #[test]
    fn test_export_rejects_zero_chunk_size() {
        let mut content = DiskContent::new(vec![ExtentStream::<Cursor<Vec<u8>>>::zero(512)]);
        let options = ExportOptions { chunk_size: 0 };
        assert!(export_raw(&mut content, Vec::new(), &options, None).is_err());
    }

    #[test]
    fn test_percent_complete() {
        let progress = ExportProgress {
            bytes_processed: 500,
            bytes_total: 1000,
        };
        assert_eq!(progress.percent_complete(), 50.0);

        let empty = ExportProgress {
            bytes_processed: 0,
            bytes_total: 0,
        };
        assert_eq!(empty.percent_complete(), 100.0);
    }
}
