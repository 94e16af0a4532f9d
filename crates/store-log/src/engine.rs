// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use latticedb_core::Error;
use tracing::debug;

use latticedb_kv::TxnId;

/// Engine-internal failure codes. The session layer funnels every one of
/// them through [`translate`], the backend's single mapping into the
/// shared taxonomy.
#[derive(Debug)]
pub(crate) enum EngineCode {
    /// The operation lost to a concurrent writer and must be retried
    /// after rolling back.
    Rollback(String),
    /// The transaction write buffer outgrew the engine cache.
    CacheFull(String),
    PrepareConflict(String),
    Corrupt(String),
    Io(std::io::Error),
}

pub(crate) fn translate(code: EngineCode) -> Error {
    match code {
        EngineCode::Rollback(m) => Error::Locked(m),
        EngineCode::CacheFull(m) => Error::NoMem(m),
        EngineCode::PrepareConflict(m) => Error::Other(m),
        EngineCode::Corrupt(m) => Error::Corrupt(m),
        EngineCode::Io(e) => match e.kind() {
            std::io::ErrorKind::StorageFull => Error::Full(e.to_string()),
            std::io::ErrorKind::UnexpectedEof => Error::Corrupt(e.to_string()),
            _ => Error::Other(e.to_string()),
        },
    }
}

type EngineResult<T> = std::result::Result<T, EngineCode>;

fn io_err(e: std::io::Error) -> EngineCode {
    EngineCode::Io(e)
}

/// Where a committed value lives.
pub(crate) enum ValueRef {
    Inline(Vec<u8>),
    Stored { offset: u64, len: u32 },
}

/// The append-only log file. Entries are
/// `[key_len u32 BE][value_len i32 BE][key][value]`, a negative value
/// length marking a tombstone. Live positions are kept in the in-memory
/// key directory; the log is rewritten without garbage every open.
pub(crate) struct LogFile {
    file: std::fs::File,
    path: PathBuf,
}

impl LogFile {
    pub(crate) fn open(path: &Path) -> std::io::Result<(LogFile, BTreeMap<Vec<u8>, (u64, u32)>)> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.try_lock_exclusive()?;
        let len = file.metadata()?.len();
        let mut keydir = BTreeMap::new();
        let mut reader = BufReader::new(&file);
        let mut offset = 0u64;
        while offset < len {
            let mut header = [0u8; 8];
            reader.read_exact(&mut header)?;
            let key_len = u32::from_be_bytes(header[0..4].try_into().expect("4 bytes"));
            let value_len = i32::from_be_bytes(header[4..8].try_into().expect("4 bytes"));
            let mut key = vec![0; key_len as usize];
            reader.read_exact(&mut key)?;
            let value_offset = offset + 8 + key_len as u64;
            if value_len >= 0 {
                reader.seek_relative(value_len as i64)?;
                keydir.insert(key, (value_offset, value_len as u32));
                offset = value_offset + value_len as u64;
            } else {
                keydir.remove(&key);
                offset = value_offset;
            }
        }
        Ok((LogFile { file, path: path.to_path_buf() }, keydir))
    }

    pub(crate) fn read_value(&mut self, offset: u64, len: u32) -> std::io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; len as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Append one entry, returning the offset and length of its value.
    pub(crate) fn append(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> std::io::Result<(u64, u32)> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        let key_len = key.len() as u32;
        let value_len = value.map(|v| v.len() as i32).unwrap_or(-1);
        self.file.write_all(&key_len.to_be_bytes())?;
        self.file.write_all(&value_len.to_be_bytes())?;
        self.file.write_all(key)?;
        if let Some(v) = value {
            self.file.write_all(v)?;
        }
        Ok((offset + 8 + key_len as u64, value_len.max(0) as u32))
    }

    pub(crate) fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    /// Rewrite the log with only live entries and swap it into place.
    pub(crate) fn compact(
        mut self,
        keydir: BTreeMap<Vec<u8>, (u64, u32)>,
    ) -> std::io::Result<(LogFile, BTreeMap<Vec<u8>, (u64, u32)>)> {
        let path = self.path.clone();
        let tmp = path.with_file_name("store.log.compact");
        {
            let mut fresh = LogFile {
                file: OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp)?,
                path: tmp.clone(),
            };
            for (key, (offset, len)) in &keydir {
                let value = self.read_value(*offset, *len)?;
                fresh.append(key, Some(&value))?;
            }
            fresh.sync()?;
        }
        drop(self); // release the lock before the swap
        std::fs::rename(&tmp, &path)?;
        let (log, rebuilt) = LogFile::open(&path)?;
        debug!(path = %path.display(), entries = rebuilt.len(), "log compacted");
        Ok((log, rebuilt))
    }
}

/// Persistent side of the engine.
pub(crate) enum Backing {
    Memory,
    File { log: LogFile, meta_path: PathBuf },
}

/// The single physical write transaction and its logical handle stack.
/// Nested begins push handles; only the outermost commit applies the
/// buffer, and an abort of any handle discards it whole.
pub(crate) struct WriteTxn {
    pub session: u64,
    pub handles: Vec<TxnId>,
    pub writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pub buffered: usize,
    pub prepared: Option<u64>,
    #[allow(dead_code)]
    pub read_ts: u64,
}

pub(crate) struct Engine {
    pub backing: Backing,
    pub keydir: BTreeMap<Vec<u8>, ValueRef>,
    pub meta: u32,
    pub writer: Option<WriteTxn>,
    pub next_txn: u64,
    pub cache_limit: usize,
}

pub(crate) type Overlay<'a> = Option<&'a BTreeMap<Vec<u8>, Option<Vec<u8>>>>;

impl Engine {
    pub(crate) fn memory(cache_limit: usize) -> Self {
        Engine {
            backing: Backing::Memory,
            keydir: BTreeMap::new(),
            meta: 0,
            writer: None,
            next_txn: 1,
            cache_limit,
        }
    }

    pub(crate) fn file(dir: &Path, cache_limit: usize) -> EngineResult<Self> {
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let log_path = dir.join("store.log");
        let meta_path = dir.join("meta");
        let (log, raw) = LogFile::open(&log_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock => {
                EngineCode::Rollback("store is locked by another process".into())
            }
            _ => io_err(e),
        })?;
        let (log, raw) = log.compact(raw).map_err(io_err)?;
        let keydir = raw
            .into_iter()
            .map(|(k, (offset, len))| (k, ValueRef::Stored { offset, len }))
            .collect();
        let meta = match std::fs::read(&meta_path) {
            Ok(bytes) if bytes.len() == 4 => {
                u32::from_le_bytes(bytes.try_into().expect("4 bytes"))
            }
            Ok(_) => return Err(EngineCode::Corrupt("meta slot has a bad size".into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(io_err(e)),
        };
        Ok(Engine {
            backing: Backing::File { log, meta_path },
            keydir,
            meta,
            writer: None,
            next_txn: 1,
            cache_limit,
        })
    }

    pub(crate) fn alloc_txn_id(&mut self) -> TxnId {
        let id = self.next_txn;
        self.next_txn += 1;
        id
    }

    /// First live key inside `range`, scanning committed state overlaid
    /// with the write buffer (whose tombstones hide committed entries).
    pub(crate) fn first_live(
        &self,
        overlay: Overlay,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
        rev: bool,
    ) -> Option<Vec<u8>> {
        let base: Box<dyn Iterator<Item = &Vec<u8>> + '_> = if rev {
            Box::new(self.keydir.range(range.clone()).map(|(k, _)| k).rev())
        } else {
            Box::new(self.keydir.range(range.clone()).map(|(k, _)| k))
        };
        let over: Box<dyn Iterator<Item = (&Vec<u8>, bool)> + '_> = match overlay {
            Some(writes) => {
                if rev {
                    Box::new(writes.range(range).map(|(k, v)| (k, v.is_some())).rev())
                } else {
                    Box::new(writes.range(range).map(|(k, v)| (k, v.is_some())))
                }
            }
            None => Box::new(std::iter::empty()),
        };
        enum Src {
            Base,
            Over,
            Both,
        }
        let mut base = base.peekable();
        let mut over = over.peekable();
        loop {
            let src = match (base.peek(), over.peek()) {
                (None, None) => return None,
                (Some(_), None) => Src::Base,
                (None, Some(_)) => Src::Over,
                (Some(b), Some((o, _))) => match b.cmp(o) {
                    std::cmp::Ordering::Equal => Src::Both,
                    std::cmp::Ordering::Less => {
                        if rev {
                            Src::Over
                        } else {
                            Src::Base
                        }
                    }
                    std::cmp::Ordering::Greater => {
                        if rev {
                            Src::Base
                        } else {
                            Src::Over
                        }
                    }
                },
            };
            match src {
                Src::Base => return base.next().map(|k| k.clone()),
                Src::Over | Src::Both => {
                    if matches!(src, Src::Both) {
                        base.next();
                    }
                    let (k, live) = over.next().expect("peeked above");
                    if live {
                        return Some(k.clone());
                    }
                }
            }
        }
    }

    /// Apply the physical write transaction to the log and key directory.
    pub(crate) fn commit_physical(&mut self, writer: WriteTxn) -> EngineResult<()> {
        match &mut self.backing {
            Backing::Memory => {
                for (key, value) in writer.writes {
                    match value {
                        Some(v) => {
                            self.keydir.insert(key, ValueRef::Inline(v));
                        }
                        None => {
                            self.keydir.remove(&key);
                        }
                    }
                }
            }
            Backing::File { log, .. } => {
                for (key, value) in writer.writes {
                    let (offset, len) = log.append(&key, value.as_deref()).map_err(io_err)?;
                    match value {
                        Some(_) => {
                            self.keydir.insert(key, ValueRef::Stored { offset, len });
                        }
                        None => {
                            self.keydir.remove(&key);
                        }
                    }
                }
                log.sync().map_err(io_err)?;
            }
        }
        Ok(())
    }

    pub(crate) fn persist_meta(&mut self, value: u32) -> EngineResult<()> {
        self.meta = value;
        if let Backing::File { meta_path, .. } = &self.backing {
            std::fs::write(meta_path, value.to_le_bytes()).map_err(io_err)?;
        }
        Ok(())
    }
}

/// Committed-or-buffered value for `key`. `Ok(None)` means the key is
/// absent or tombstoned.
pub(crate) fn live_value(
    backing: &mut Backing,
    keydir: &BTreeMap<Vec<u8>, ValueRef>,
    overlay: Overlay,
    key: &[u8],
) -> EngineResult<Option<Vec<u8>>> {
    if let Some(writes) = overlay {
        if let Some(buffered) = writes.get(key) {
            return Ok(buffered.clone());
        }
    }
    match keydir.get(key) {
        Some(ValueRef::Inline(v)) => Ok(Some(v.clone())),
        Some(&ValueRef::Stored { offset, len }) => match backing {
            Backing::File { log, .. } => log.read_value(offset, len).map(Some).map_err(io_err),
            Backing::Memory => Err(EngineCode::Corrupt("stored ref in memory backing".into())),
        },
        None => Ok(None),
    }
}
