//! Utterance manifest (`wav.scp`) parsing.
//!
//! Each non-blank line is `<utterance_id> <path> [ignored...]`, separated by
//! any whitespace. Paths are kept as written; relative paths resolve against
//! the working directory.
//!
//! Ids become output file stems, so they may not contain `/` or `\` and may
//! not be `.` or `..`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::error::CatalogError;

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub id: String,
    pub path: PathBuf,
}

/// Utterances keyed by id, iterated in id order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, PathBuf>,
}

impl Catalog {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open manifest {}", path.display()))?;
        let catalog = Self::parse(BufReader::new(file))
            .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
        info!("loaded {} utterances", catalog.len());
        Ok(catalog)
    }

    /// Parse manifest lines. A repeated id replaces the earlier entry.
    pub fn parse<R: BufRead>(reader: R) -> std::result::Result<Self, CatalogError> {
        let mut entries = BTreeMap::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let mut tokens = line.split_whitespace();
            let Some(id) = tokens.next() else {
                continue;
            };
            let Some(path) = tokens.next() else {
                return Err(CatalogError::MalformedLine {
                    line: index + 1,
                    content: line.trim().to_string(),
                });
            };
            if !is_file_stem(id) {
                return Err(CatalogError::InvalidId {
                    line: index + 1,
                    id: id.to_string(),
                });
            }

            if let Some(previous) = entries.insert(id.to_string(), PathBuf::from(path)) {
                warn!(
                    id,
                    previous = %previous.display(),
                    "duplicate utterance id, keeping the later entry"
                );
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Path> {
        self.entries.get(id).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = Utterance> + '_ {
        self.entries.iter().map(|(id, path)| Utterance {
            id: id.clone(),
            path: path.clone(),
        })
    }
}

fn is_file_stem(id: &str) -> bool {
    id != "." && id != ".." && !id.contains(['/', '\\'])
}
