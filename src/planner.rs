use std::io::{self, SeekFrom};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncSeek, AsyncSeekExt, BufReader};

use crate::shared_types::ChunkRange;

/// Computes `chunks + 1` boundaries splitting `file_size` bytes of `file`
/// into line-aligned chunks.
///
/// Every interior boundary sits right after a `\n`, so no line straddles two
/// chunks. Boundaries never decrease; a cut with no newline after it
/// collapses to `file_size`, leaving empty trailing chunks.
pub(crate) async fn plan_chunks<R>(file: R, file_size: u64, chunks: u32) -> io::Result<Vec<u64>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let chunks = chunks.max(1);
    let mut boundaries = vec![0u64; chunks as usize + 1];
    boundaries[chunks as usize] = file_size;

    let mut reader = BufReader::new(file);
    let mut skipped = Vec::new();
    for i in 1..chunks {
        let approx = (u128::from(file_size) * u128::from(i) / u128::from(chunks)) as u64;
        reader.seek(SeekFrom::Start(approx)).await?;

        skipped.clear();
        let read = reader.read_until(b'\n', &mut skipped).await?;
        boundaries[i as usize] = if skipped.last() == Some(&b'\n') {
            approx + read as u64
        } else {
            file_size
        };
    }
    trace!("chunk boundaries: {:?}", boundaries);
    Ok(boundaries)
}

/// Opens `path` and plans `chunks` line-aligned chunks over it.
pub(crate) async fn plan_file(
    path: &std::path::Path,
    file_size: u64,
    chunks: u32,
) -> io::Result<Vec<ChunkRange>> {
    let file = File::open(path).await?;
    let boundaries = plan_chunks(file, file_size, chunks).await?;
    Ok(ranges(&boundaries))
}

pub(crate) fn ranges(boundaries: &[u64]) -> Vec<ChunkRange> {
    boundaries
        .windows(2)
        .map(|pair| ChunkRange {
            start: pair[0],
            end: pair[1],
        })
        .collect()
}
