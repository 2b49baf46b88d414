//! JSON-lines event files and path handling.

use super::*;
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Lines, Write},
    path::{Path, PathBuf},
};

/// Expand `~` and environment variables in a user-supplied path.
pub fn expand_path(file_path: &str) -> SsdlResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(file_path)?))
}

fn canonicalize_source_path(file_path: &str) -> SsdlResult<PathBuf> {
    Ok(expand_path(file_path)?.canonicalize()?)
}

/// Streams [`EventRecord`]s from a file holding one JSON object per line.
///
/// Blank lines are skipped. A malformed line is returned as an error and the stream continues
/// with the next line.
pub struct JsonLinesSource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl JsonLinesSource {
    pub fn open(file_path: &str) -> SsdlResult<Self> {
        let path = canonicalize_source_path(file_path)?;
        let file = File::open(&path)?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for JsonLinesSource {
    type Item = SsdlResult<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(Into::into));
        }
    }
}

/// Write events to a JSON-lines file.
pub fn write_json_lines(file_path: &str, events: &[EventRecord]) -> SsdlResult<()> {
    let path = expand_path(file_path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
