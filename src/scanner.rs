use std::cmp;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::{pin_mut, Stream, StreamExt};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use crate::address;
use crate::membership::MembershipSet;
use crate::shared_types::{ByteCount, ChunkRange};

pub(crate) const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

#[derive(Error, Debug)]
pub(crate) enum ScanError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to seek {path} to byte {offset}: {source}")]
    Seek {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path} at byte {offset}: {source}")]
    Read {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeStats {
    pub(crate) lines: u64,
    pub(crate) bytes: ByteCount,
}

/// Reads `range` of the file at `path` as a stream of blocks no larger than
/// `block_size`, using a file handle of its own.
pub(crate) fn stream_range(
    path: PathBuf,
    range: ChunkRange,
    block_size: usize,
) -> impl Stream<Item = Result<Bytes, ScanError>> {
    try_stream! {
        let mut file = File::open(&path)
            .await
            .map_err(|source| ScanError::Open { path: path.clone(), source })?;
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(|source| ScanError::Seek { path: path.clone(), offset: range.start, source })?;

        let mut offset = range.start;
        let mut buffer = BytesMut::with_capacity(block_size);
        while offset < range.end {
            let want = cmp::min(block_size as u64, range.end - offset) as usize;
            buffer.resize(want, 0);
            file.read_exact(&mut buffer)
                .await
                .map_err(|source| ScanError::Read { path: path.clone(), offset, source })?;
            offset += want as u64;
            yield buffer.split().freeze();
        }
    }
}

/// Reassembles lines from arbitrarily split blocks.
///
/// `\r` is dropped wherever it appears. Empty lines are skipped rather than
/// decoded, so a blank line does not mark `0.0.0.0`; every other line is
/// handed on as is, however malformed.
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    line: BytesMut,
}

impl LineAssembler {
    pub(crate) fn feed(&mut self, block: &[u8], mut on_line: impl FnMut(&[u8])) {
        for &b in block {
            match b {
                b'\n' => self.flush(&mut on_line),
                b'\r' => {}
                _ => self.line.extend_from_slice(&[b]),
            }
        }
    }

    /// Emits a final line that had no trailing newline.
    pub(crate) fn finish(mut self, mut on_line: impl FnMut(&[u8])) {
        self.flush(&mut on_line);
    }

    fn flush(&mut self, on_line: &mut impl FnMut(&[u8])) {
        if !self.line.is_empty() {
            on_line(&self.line);
            self.line.clear();
        }
    }
}

/// Marks every address found in `range` of the file at `path` into `set`.
///
/// Stops at the first I/O error; addresses already marked stay marked.
pub(crate) async fn scan_range(
    path: &Path,
    range: ChunkRange,
    block_size: usize,
    set: &MembershipSet,
    s_progress: Option<mpsc::Sender<ByteCount>>,
) -> Result<RangeStats, ScanError> {
    let mut stats = RangeStats::default();
    if range.is_empty() {
        return Ok(stats);
    }

    let blocks = stream_range(path.to_owned(), range, block_size);
    pin_mut!(blocks);

    let mut assembler = LineAssembler::default();
    let mut mark = |line: &[u8]| {
        let addr = address::encode(line);
        if stats.lines == 0 {
            trace!("first address at byte {}: {}", range.start, address::decode(addr));
        }
        set.mark(addr);
        stats.lines += 1;
    };
    let mut bytes = 0;
    while let Some(block) = blocks.next().await {
        let block = block?;
        assembler.feed(&block, &mut mark);
        bytes += block.len() as ByteCount;
        if let Some(s_progress) = &s_progress {
            s_progress.try_send(block.len() as ByteCount).ok();
        }
    }
    assembler.finish(&mut mark);
    debug_assert_eq!(bytes, range.len());
    stats.bytes = bytes;

    trace!(
        "scanned bytes {}..{}: {} lines",
        range.start,
        range.end,
        stats.lines
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn whole(data: &[u8]) -> ChunkRange {
        ChunkRange {
            start: 0,
            end: data.len() as u64,
        }
    }

    fn lines_of(blocks: &[&[u8]]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut assembler = LineAssembler::default();
        for block in blocks {
            assembler.feed(block, |l| lines.push(String::from_utf8_lossy(l).into_owned()));
        }
        assembler.finish(|l| lines.push(String::from_utf8_lossy(l).into_owned()));
        lines
    }

    #[test]
    fn assembler_joins_lines_across_blocks() {
        assert_eq!(
            lines_of(&[&b"1.2."[..], b"3.4\n5.6", b".7.8\n"]),
            vec!["1.2.3.4", "5.6.7.8"]
        );
    }

    #[test]
    fn assembler_drops_carriage_returns_and_blank_lines() {
        assert_eq!(
            lines_of(&[&b"1.1.1.1\r"[..], b"\n\r\n\n2.2.\r2.2\r\n"]),
            vec!["1.1.1.1", "2.2.2.2"]
        );
    }

    #[test]
    fn assembler_emits_unterminated_last_line() {
        assert_eq!(lines_of(&[&b"1.1.1.1\n9.9.9.9"[..]]), vec!["1.1.1.1", "9.9.9.9"]);
        assert!(lines_of(&[]).is_empty());
    }

    #[tokio::test]
    async fn blocks_respect_block_size_and_range() {
        let data = b"0123456789abcdef";
        let file = file_with(data);
        let range = ChunkRange { start: 3, end: 14 };
        let blocks: Vec<Bytes> = stream_range(file.path().to_owned(), range, 4)
            .map(|b| b.unwrap())
            .collect()
            .await;
        let lens: Vec<usize> = blocks.iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![4, 4, 3]);
        assert_eq!(blocks.concat(), &data[3..14]);
    }

    #[tokio::test]
    async fn scan_marks_every_line() {
        let data = b"0.0.1.1\n0.0.1.2\r\n0.0.1.1\n0.0.2.0";
        let file = file_with(data);
        let set = MembershipSet::small(1 << 16);
        for block_size in [1, 3, 7, DEFAULT_BLOCK_SIZE] {
            let stats = scan_range(file.path(), whole(data), block_size, &set, None)
                .await
                .unwrap();
            assert_eq!(stats.lines, 4);
            assert_eq!(stats.bytes, data.len() as u64);
        }
        assert_eq!(set.count(), 3);
        assert!(set.contains(0x0000_0200));
    }

    #[tokio::test]
    async fn scan_reports_progress() {
        let data = b"0.0.0.1\n0.0.0.2\n";
        let file = file_with(data);
        let set = MembershipSet::small(1 << 16);
        let (s_progress, mut r_progress) = mpsc::channel(16);
        scan_range(file.path(), whole(data), 5, &set, Some(s_progress))
            .await
            .unwrap();
        let mut total = 0;
        while let Some(n) = r_progress.recv().await {
            total += n;
        }
        assert_eq!(total, data.len() as u64);
    }

    #[tokio::test]
    async fn empty_range_reads_nothing() {
        let set = MembershipSet::small(64);
        let range = ChunkRange { start: 5, end: 5 };
        let stats = scan_range(Path::new("/nonexistent/ips.txt"), range, 16, &set, None)
            .await
            .unwrap();
        assert_eq!(stats, RangeStats::default());
        assert_eq!(set.count(), 0);
    }

    #[tokio::test]
    async fn missing_file_is_an_open_error() {
        let set = MembershipSet::small(64);
        let range = ChunkRange { start: 0, end: 8 };
        let err = scan_range(Path::new("/nonexistent/ips.txt"), range, 16, &set, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Open { .. }), "{err}");
    }

    #[tokio::test]
    async fn truncated_file_is_a_read_error() {
        let data = b"0.0.0.1\n";
        let file = file_with(data);
        let set = MembershipSet::small(1 << 16);
        let range = ChunkRange { start: 0, end: 64 };
        let err = scan_range(file.path(), range, 16, &set, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Read { offset: 0, .. }), "{err}");
    }
}
