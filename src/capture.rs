use anyhow::{Context, Result};
use std::io::BufRead;

/// Reads a hex capture: one received chunk per line.
///
/// Whitespace inside a line is ignored, so both `DD0400` and `DD 04 00` work.
/// Empty lines and lines starting with `#` are skipped.
pub fn read_chunks(reader: impl BufRead) -> Result<Vec<Vec<u8>>> {
    let mut chunks = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Cannot read capture line {}", index + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let digits: String = trimmed.split_whitespace().collect();
        let chunk = hex::decode(&digits)
            .with_context(|| format!("Invalid hex on capture line {}", index + 1))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn parses_spaced_and_packed_lines() {
        let capture = "# status reply\nDD 04 00 04\n\n0d050d06ffd777\n";
        let chunks = read_chunks(Cursor::new(capture)).unwrap();
        assert_eq!(
            chunks,
            vec![
                vec![0xDD, 0x04, 0x00, 0x04],
                vec![0x0D, 0x05, 0x0D, 0x06, 0xFF, 0xD7, 0x77]
            ]
        );
    }

    #[test]
    fn reports_bad_line_number() {
        let err = read_chunks(Cursor::new("DD04\nXYZ\n")).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "DD A5 03 00 FF FD 77").unwrap();
        let reader = std::io::BufReader::new(std::fs::File::open(file.path()).unwrap());
        assert_eq!(read_chunks(reader).unwrap().len(), 1);
    }
}
