//! Reading staged chunks.
//!
//! Staged chunks are normally gzip, possibly with several concatenated
//! members, but plain text is accepted too. Every stage that needs the
//! decompressed content opens the file afresh through [`open`].

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::MultiGzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Open a staged chunk and return a reader over its decompressed bytes.
pub fn open(path: &Path, buffer_size: usize) -> io::Result<Box<dyn Read + Send>> {
    let mut file = File::open(path)?;
    let compressed = is_gzip(&mut file)?;
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::with_capacity(buffer_size, file);
    if compressed {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Read one `\n`-terminated line into `buf`, holding at most `max_line` bytes
/// of it in memory.
///
/// Returns the number of bytes read, `0` at end of input. A line longer than
/// `max_line` (terminator excluded) fails with [`io::ErrorKind::InvalidData`].
pub fn read_line_capped<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_line: usize,
) -> io::Result<usize> {
    let limit = max_line as u64 + 1;
    let n = reader.by_ref().take(limit).read_until(b'\n', buf)?;

    if n as u64 == limit && buf.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", max_line),
        ));
    }
    Ok(n)
}

/// Check for the gzip magic bytes. Leaves the file position unspecified.
fn is_gzip(file: &mut File) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
