use std::io::Read;

use anyhow::{bail, Context, Result};
use pytail_common::python::PythonVersion;
use regex::bytes::Regex;

const BUFSIZ: usize = 8192;

/// Find the full MAJOR.MINOR.PATCH version of Python somewhere in the
/// binary, given the partial version from the mapped filename (usually
/// "3.8", sometimes just "3").
///
/// Searching happens in a "sliding buffer" of two consecutive blocks so a
/// match that starts at the end of one block and ends at the beginning of
/// the next is not missed:
/// 1. Read a block after the leading block; it becomes the trailing block.
/// 2. Search the whole buffer up to the end of the trailing block.
/// 3. Slide the trailing block to the front and go again.
pub fn scan_python_version(mut file: impl Read, filever: &str) -> Result<PythonVersion> {
    let pattern = format!(r"{}\.[0-9]+\b", regex::escape(filever));
    let re = Regex::new(&pattern).context("bad version pattern")?;

    let mut buf = vec![0u8; BUFSIZ * 2];
    let mut read1 = 0usize;
    loop {
        // Read
        let read2 = read_block(&mut file, &mut buf[read1..read1 + BUFSIZ])?;
        if read2 != BUFSIZ {
            break;
        }
        // Search
        if let Some(m) = re.find(&buf[..read1 + read2]) {
            return parse_version(m.as_bytes());
        }
        // Slide
        buf.copy_within(read1..read1 + read2, 0);
        read1 = read2;
    }

    bail!("no version string matching {pattern:?} found")
}

fn read_block(file: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Parse "X.Y.Z" or "X.Y" (when the filename only gave us the major).
fn parse_version(text: &[u8]) -> Result<PythonVersion> {
    let text = std::str::from_utf8(text)?;
    let mut parts = text.split('.');
    let major = parts.next().context("empty version")?.parse()?;
    let minor = parts.next().context("version without minor")?.parse()?;
    let patch = match parts.next() {
        Some(p) => p.parse()?,
        None => 0,
    };
    Ok(PythonVersion {
        major,
        minor,
        patch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Version strings in a real binary are NUL-terminated; zero filler gives
    // the trailing \b something to anchor on, like the real thing.
    fn filler(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn finds_version_in_first_block() {
        let mut data = filler(BUFSIZ * 3);
        data[100..106].copy_from_slice(b"3.8.17");
        let v = scan_python_version(Cursor::new(data), "3.8").unwrap();
        assert_eq!(v, PythonVersion::new(3, 8, 17));
    }

    #[test]
    fn finds_version_straddling_block_boundary() {
        let mut data = filler(BUFSIZ * 3);
        // match starts in block 1 and ends in block 2
        data[BUFSIZ - 3..BUFSIZ + 3].copy_from_slice(b"3.6.15");
        let v = scan_python_version(Cursor::new(data), "3.6").unwrap();
        assert_eq!(v, PythonVersion::new(3, 6, 15));
    }

    #[test]
    fn first_match_wins() {
        let mut data = filler(BUFSIZ * 2);
        data[100..105].copy_from_slice(b"3.8.1");
        data[200..206].copy_from_slice(b"3.8.99");
        let v = scan_python_version(Cursor::new(data), "3.8").unwrap();
        assert_eq!(v, PythonVersion::new(3, 8, 1));
    }

    #[test]
    fn major_only_hint_accepts_two_components() {
        let mut data = filler(BUFSIZ * 2);
        data[50..54].copy_from_slice(b"3.11");
        let v = scan_python_version(Cursor::new(data), "3").unwrap();
        assert_eq!(v, PythonVersion::new(3, 11, 0));
    }

    #[test]
    fn fails_without_a_match() {
        let data = filler(BUFSIZ * 2);
        assert!(scan_python_version(Cursor::new(data), "3.8").is_err());
    }

    #[test]
    fn a_letter_does_not_terminate_the_match() {
        // "2.7a1" is not a full release version
        let mut data = filler(BUFSIZ * 2);
        data[10..15].copy_from_slice(b"2.7a1");
        assert!(scan_python_version(Cursor::new(data), "2.7").is_err());
    }
}
