//! Handles the file (json) to Rust record retrieval and the reverse,
//! writing records to a file, one json object per line.

use std::{
    fs::File,
    io::{BufRead, BufReader, Write},
    path::Path,
};

use anyhow::{anyhow, Result};

use super::TraceRecord;

/// File records factory retrieving and unmarshaling records written by
/// `FileRecordsWriter`.
pub struct FileRecordsFactory {
    reader: BufReader<File>,
}

impl FileRecordsFactory {
    pub fn new<P>(file: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Ok(FileRecordsFactory {
            reader: BufReader::new(
                File::open(&file)
                    .map_err(|e| anyhow!("Could not open {}: {e}", file.as_ref().display()))?,
            ),
        })
    }

    /// Retrieve the next record or None if we've reached the end of the file.
    pub fn next_record(&mut self) -> Result<Option<TraceRecord>> {
        let mut line = String::new();

        match self.reader.read_line(&mut line) {
            Err(e) => Err(e.into()),
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(TraceRecord::from_json(&line)?)),
        }
    }
}

/// Writes records to an output, one json object per line.
pub struct FileRecordsWriter<W: Write> {
    writer: W,
}

impl<W: Write> FileRecordsWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write(&mut self, record: &TraceRecord) -> Result<()> {
        writeln!(self.writer, "{}", record.to_json()?)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HookKind;

    #[test]
    fn write_then_parse() {
        let mut writer = FileRecordsWriter::new(Vec::new());

        for seq in 0..3 {
            writer
                .write(&TraceRecord {
                    handler: "my_kretprobe".to_string(),
                    kind: HookKind::Return,
                    seq,
                    timestamp: 1000 + seq,
                    message: "[return] my_kretprobe: GLOBAL_u8=0x00".to_string(),
                })
                .unwrap();
        }
        writer.flush().unwrap();

        let out = String::from_utf8(writer.writer).unwrap();
        let records: Vec<TraceRecord> = out
            .lines()
            .map(|l| TraceRecord::from_json(l).unwrap())
            .collect();

        assert_eq!(records.len(), 3);
        assert_eq!(records[2].seq, 2);
        assert_eq!(records[2].kind, HookKind::Return);
    }
}
