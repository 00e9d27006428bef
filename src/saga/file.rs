use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::saga::{check_compaction, Replay, SagaEntry, SagaLog, SagaLogError, SagaRecord};

/// Saga log stored as one JSON document per line.
///
/// Every append is written and `sync_data`'d before returning. On open, a
/// trailing partial line (a crash mid-append) is truncated; any other
/// undecodable line fails with [`SagaLogError::Corrupt`].
#[derive(Debug)]
pub struct FileSagaLog {
    path: PathBuf,
    inner: Mutex<Writer>,
}

#[derive(Debug)]
struct Writer {
    file: File,
    next_seq: u64,
    len: u64,
}

impl FileSagaLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SagaLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let (len, next_seq) = scan_and_repair(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::info!(path = %path.display(), entries = len, "Opened saga log");

        Ok(Self {
            path,
            inner: Mutex::new(Writer {
                file,
                next_seq,
                len,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".compact");
        PathBuf::from(name)
    }
}

/// Validate every complete line, truncate a torn tail, and return
/// `(entry_count, next_seq)`.
fn scan_and_repair(path: &Path) -> Result<(u64, u64), SagaLogError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };

    let mut len = 0u64;
    let mut next_seq = 0u64;
    let mut offset = 0usize;
    let mut line_no = 0u64;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(end) = rest.iter().position(|&b| b == b'\n') else {
            tracing::warn!(
                path = %path.display(),
                line = line_no,
                dropped_bytes = rest.len(),
                "Truncating partial trailing saga log entry"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset as u64)?;
            file.sync_all()?;
            break;
        };

        let line = &rest[..end];
        offset += end + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let entry: SagaEntry =
            serde_json::from_slice(line).map_err(|e| SagaLogError::Corrupt {
                line: line_no,
                reason: e.to_string(),
            })?;
        if entry.seq < next_seq {
            return Err(SagaLogError::Corrupt {
                line: line_no,
                reason: format!("sequence {} after {}", entry.seq, next_seq - 1),
            });
        }
        next_seq = entry.seq + 1;
        len += 1;
    }

    Ok((len, next_seq))
}

fn write_entry(file: &mut File, entry: &SagaEntry) -> Result<(), SagaLogError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(())
}

impl SagaLog for FileSagaLog {
    fn append(&self, record: SagaRecord) -> Result<SagaEntry, SagaLogError> {
        let mut writer = self.inner.lock().map_err(|_| SagaLogError::Poisoned)?;
        let entry = record.sequence(writer.next_seq);
        write_entry(&mut writer.file, &entry)?;
        writer.file.sync_data()?;
        writer.next_seq += 1;
        writer.len += 1;
        Ok(entry)
    }

    fn replay(&self) -> Result<Replay, SagaLogError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Box::new(std::iter::empty()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::new(FileReplay {
            lines: BufReader::new(file).lines(),
            line_no: 0,
        }))
    }

    fn len(&self) -> u64 {
        self.inner.lock().map(|w| w.len).unwrap_or(0)
    }

    fn compact(&self, entries: Vec<SagaEntry>) -> Result<(), SagaLogError> {
        let mut writer = self.inner.lock().map_err(|_| SagaLogError::Poisoned)?;
        check_compaction(&entries, writer.next_seq)?;
        let tmp_path = self.compact_path();

        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in &entries {
                write_entry(&mut tmp, entry)?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }

        writer.file = OpenOptions::new().append(true).open(&self.path)?;
        writer.len = entries.len() as u64;

        tracing::info!(
            path = %self.path.display(),
            entries = writer.len,
            next_seq = writer.next_seq,
            "Compacted saga log"
        );
        Ok(())
    }
}

struct FileReplay {
    lines: Lines<BufReader<File>>,
    line_no: u64,
}

impl Iterator for FileReplay {
    type Item = Result<SagaEntry, SagaLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&line).map_err(|e| SagaLogError::Corrupt {
                    line: self.line_no,
                    reason: e.to_string(),
                }),
            );
        }
    }
}
