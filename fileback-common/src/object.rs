//! Objects a back-end discovers while operating, reported to the caller.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Back-end specific metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendObject {
    Local(LocalEntry),
    Remote(RemoteEntry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub len: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl LocalEntry {
    pub fn from_metadata(path: PathBuf, metadata: &std::fs::Metadata) -> Self {
        Self {
            path,
            len: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Dir,
    Link,
    Other,
}

/// One MLST/MLSD fact line, e.g. `type=file;size=1024;modify=20240102030405; a99/93e/d`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: RemoteKind,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn is_file(&self) -> bool {
        self.kind == RemoteKind::File
    }

    /// Parse an MLST reply. Status lines (`250-...`, `250 End`) are skipped;
    /// the first line carrying facts wins.
    pub fn from_mlst(reply: &str) -> Option<Self> {
        reply
            .lines()
            .map(str::trim_start)
            .find(|line| line.contains('=') && line.contains(';'))
            .and_then(Self::from_facts)
    }

    fn from_facts(line: &str) -> Option<Self> {
        let (facts, name) = line.split_once(' ')?;
        let mut kind = RemoteKind::Other;
        let mut size = None;
        let mut modified = None;
        for fact in facts.split(';').filter(|f| !f.is_empty()) {
            let Some((key, value)) = fact.split_once('=') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "type" => {
                    kind = match value.to_ascii_lowercase().as_str() {
                        "file" => RemoteKind::File,
                        "dir" | "cdir" | "pdir" => RemoteKind::Dir,
                        v if v.starts_with("os.unix=slink") || v.starts_with("os.unix=symlink") => {
                            RemoteKind::Link
                        }
                        _ => RemoteKind::Other,
                    }
                }
                "size" => size = value.parse().ok(),
                "modify" => {
                    // Fractional seconds are allowed after a dot.
                    let whole = value.split('.').next().unwrap_or(value);
                    modified = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S")
                        .ok()
                        .map(|naive| naive.and_utc());
                }
                _ => {}
            }
        }
        Some(Self {
            name: name.trim().to_string(),
            kind,
            size,
            modified,
        })
    }
}
