//! Crash-safe persistence of the node set.
//!
//! The checkpoint is written to a uniquely named temporary file in the state
//! directory, synced, then renamed over the previous checkpoint. A reader
//! therefore sees either the old or the new file, never a partial one.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::NODES_FILENAME;
use crate::error::CheckpointError;
use crate::types::{Node, Source};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize)]
struct CheckpointRef<'a> {
    version: u32,
    nodes: &'a [Node],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CheckpointFile {
    Versioned { version: u32, nodes: Vec<Node> },
    /// Bare array written before the envelope existed.
    Legacy(Vec<Node>),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    path: PathBuf,
}

impl Checkpointer {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let dir = state_dir.into();
        let path = dir.join(NODES_FILENAME);
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prepare(&self) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::StateDir {
            path: self.dir.clone(),
            source,
        })
    }

    /// Atomically replaces the checkpoint with `nodes`.
    pub fn write(&self, nodes: &[Node]) -> Result<(), CheckpointError> {
        let tmp = self
            .dir
            .join(format!("{NODES_FILENAME}.{}.tmp", Uuid::now_v7()));
        debug!(path = %self.path.display(), nodes = nodes.len(), "writing node checkpoint to disk");

        let result = self.write_to(&tmp, nodes);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn write_to(&self, tmp: &Path, nodes: &[Node]) -> Result<(), CheckpointError> {
        let file = File::create(tmp).map_err(io_error(tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(
            &mut writer,
            &CheckpointRef {
                version: CHECKPOINT_VERSION,
                nodes,
            },
        )
        .map_err(CheckpointError::Encode)?;
        writer.flush().map_err(io_error(tmp))?;
        let file = writer
            .into_inner()
            .map_err(|e| io_error(tmp)(e.into_error()))?;
        file.sync_all().map_err(io_error(tmp))?;
        drop(file);

        fs::rename(tmp, &self.path).map_err(io_error(&self.path))?;

        #[cfg(unix)]
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(io_error(&self.dir))?;

        Ok(())
    }

    /// Reads the checkpoint back, tagging every node as restored. A missing
    /// file is an empty checkpoint.
    pub fn restore(&self) -> Result<Vec<Node>, CheckpointError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(
                    path = %self.path.display(),
                    "no node checkpoint found, cannot replay deletions of nodes that disappeared during downtime"
                );
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let decoded: CheckpointFile = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            CheckpointError::Decode {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut nodes = match decoded {
            CheckpointFile::Versioned { version, nodes } => {
                if version > CHECKPOINT_VERSION {
                    return Err(CheckpointError::UnsupportedVersion {
                        found: version,
                        supported: CHECKPOINT_VERSION,
                    });
                }
                nodes
            }
            CheckpointFile::Legacy(nodes) => nodes,
        };

        for node in &mut nodes {
            node.source = Source::Restored;
        }
        Ok(nodes)
    }
}
