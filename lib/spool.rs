//! Loads exported blocks spooled to disk into a [`MemoryBlockLog`].
//!
//! A spool directory holds, per table, `<TABLE>.schema.json` mapping generation ids to
//! column lists, and per source `<TABLE>-<partition>.blocks`: a run of little-endian
//! frames `i64 seq, i64 committed_seq (-1 = none), u32 generation, u32 row_count,
//! u32 len, payload`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{ColumnInfo, Schema};
use crate::config::normalize_table_name;
use crate::source::{Block, BlockLogError, MemoryBlockLog, SourceDescriptor};

const SCHEMA_SUFFIX: &str = ".schema.json";
const BLOCKS_SUFFIX: &str = ".blocks";

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("failed to read spool path {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid schema file {path}: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no schema for table {table} generation {generation}")]
    MissingSchema { table: String, generation: u64 },

    #[error("truncated block frame in {path} at offset {offset}")]
    Truncated { path: PathBuf, offset: u64 },

    #[error("block file name {0} is not <TABLE>-<partition>.blocks")]
    InvalidFileName(PathBuf),

    #[error(transparent)]
    Log(#[from] BlockLogError),
}

/// What a spool load put into the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolSummary {
    pub sources: usize,
    pub blocks: usize,
}

type TableSchemas = BTreeMap<String, BTreeMap<u64, Arc<Schema>>>;

/// Reads every schema and block file in `dir` into `log`. Each loaded source is closed
/// after its last block so its pump ends once the spool is drained.
pub fn load_spool_dir(dir: &Path, log: &MemoryBlockLog) -> Result<SpoolSummary, SpoolError> {
    let io_err = |source| SpoolError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<_, _>>()
        .map_err(io_err)?;
    paths.sort();

    let mut schemas = TableSchemas::new();
    for path in &paths {
        if let Some(table) = file_name(path).and_then(|name| name.strip_suffix(SCHEMA_SUFFIX)) {
            let table = normalize_table_name(table);
            let generations = read_schema_file(path, &table)?;
            schemas.insert(table, generations);
        }
    }

    let mut summary = SpoolSummary::default();
    for path in &paths {
        let Some(stem) = file_name(path).and_then(|name| name.strip_suffix(BLOCKS_SUFFIX)) else {
            continue;
        };
        let (table, partition_id) = stem
            .rsplit_once('-')
            .and_then(|(table, partition)| Some((table, partition.parse::<i32>().ok()?)))
            .ok_or_else(|| SpoolError::InvalidFileName(path.clone()))?;
        let table = normalize_table_name(table);

        let blocks = read_blocks_file(path, &table, &schemas)?;
        let generation = blocks
            .first()
            .map(Block::generation)
            .or_else(|| schemas.get(&table)?.keys().next_back().copied())
            .unwrap_or_default();
        let descriptor = SourceDescriptor::new(table, partition_id, generation);
        let key = descriptor.key();
        log.add_source(descriptor);

        let count = blocks.len();
        for block in blocks {
            log.push_block(&key, block)?;
        }
        log.close_source(&key);
        debug!(event = "spool_source_loaded", source = %key, blocks = count, "spooled source loaded");

        summary.sources += 1;
        summary.blocks += count;
    }

    info!(
        event = "spool_loaded",
        dir = %dir.display(),
        sources = summary.sources,
        blocks = summary.blocks,
        "spool directory loaded"
    );
    Ok(summary)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn read_schema_file(path: &Path, table: &str) -> Result<BTreeMap<u64, Arc<Schema>>, SpoolError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SpoolError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let generations: BTreeMap<u64, Vec<ColumnInfo>> =
        serde_json::from_str(&raw).map_err(|source| SpoolError::Schema {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(generations
        .into_iter()
        .map(|(generation, columns)| (generation, Arc::new(Schema::new(table, generation, columns))))
        .collect())
}

fn read_blocks_file(path: &Path, table: &str, schemas: &TableSchemas) -> Result<Vec<Block>, SpoolError> {
    let data = std::fs::read(path).map_err(|source| SpoolError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let length = data.len() as u64;
    let mut cursor = Cursor::new(data);
    let mut blocks = Vec::new();

    while cursor.position() < length {
        let offset = cursor.position();
        let truncated = |_| SpoolError::Truncated {
            path: path.to_path_buf(),
            offset,
        };
        let seq = cursor.read_i64::<LittleEndian>().map_err(truncated)?;
        let committed_seq = cursor.read_i64::<LittleEndian>().map_err(truncated)?;
        let generation = u64::from(cursor.read_u32::<LittleEndian>().map_err(truncated)?);
        let row_count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let payload_len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let mut payload = vec![0u8; payload_len];
        cursor.read_exact(&mut payload).map_err(truncated)?;

        let schema = schemas
            .get(table)
            .and_then(|generations| generations.get(&generation))
            .ok_or_else(|| SpoolError::MissingSchema {
                table: table.to_string(),
                generation,
            })?;
        let committed_seq = (committed_seq >= 0).then_some(committed_seq);
        blocks.push(Block::new(seq, schema.clone(), payload, row_count, committed_seq));
    }
    Ok(blocks)
}

/// Appends `block` to a spool blocks file in the format [`load_spool_dir`] reads.
pub fn write_block_frame<W: Write>(writer: &mut W, block: &Block) -> io::Result<()> {
    let generation = u32::try_from(block.generation())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "generation exceeds u32"))?;
    let payload = block.payload();
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32"))?;

    writer.write_i64::<LittleEndian>(block.seq())?;
    writer.write_i64::<LittleEndian>(block.committed_seq().unwrap_or(-1))?;
    writer.write_u32::<LittleEndian>(generation)?;
    writer.write_u32::<LittleEndian>(block.row_count())?;
    writer.write_u32::<LittleEndian>(payload_len)?;
    writer.write_all(payload)
}
