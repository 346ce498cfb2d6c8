//! # File Indexing & Chunk Store
//!
//! Files are split into fixed 8192-byte chunks. Each chunk is stored
//! content-addressed under the hex of its SHA-256 digest; the metafile —
//! the concatenation of all chunk digests — is stored the same way under
//! its own digest. [`FileMetadata`] tracks which chunk indices are locally
//! present; its size is set exactly once, when the file is reconstructed
//! (size zero therefore means "not yet fully owned", which the search
//! layer relies on).

use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{NodeConfig, CHANNEL_CAPACITY, FILE_CHUNK_SIZE};
use crate::packet::DataReply;

/// Errors of the file layer.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("failed to read {name}: {source}")]
    Read { name: String, source: io::Error },
    #[error("failed to write {name}: {source}")]
    Write { name: String, source: io::Error },
}

/// SHA-256 convenience.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Validates a data reply: the payload must hash to the claimed value.
pub fn hash_matches(claimed: &[u8], data: &[u8]) -> bool {
    claimed == sha256(data)
}

/// Catalog entry for one (metafile hash, name) pair.
///
/// The chunk map and size are the only mutable parts: the map grows as
/// chunks arrive, and the size flips from zero to the real value exactly
/// once on reconstruction.
pub struct FileMetadata {
    pub file_name: String,
    pub metafile_hash: Vec<u8>,
    pub chunk_count: u64,
    chunk_map: RwLock<BTreeSet<u64>>,
    size: AtomicI64,
}

impl FileMetadata {
    fn new(file_name: String, metafile_hash: Vec<u8>, chunk_count: u64, size: i64) -> Self {
        Self {
            file_name,
            metafile_hash,
            chunk_count,
            chunk_map: RwLock::new(BTreeSet::new()),
            size: AtomicI64::new(size),
        }
    }

    /// 1-based sorted unique indices of locally present chunks.
    pub fn chunk_map(&self) -> Vec<u64> {
        self.chunk_map.read().iter().copied().collect()
    }

    /// Records that the 1-based chunk `index` is locally present.
    pub fn add_chunk(&self, index: u64) {
        self.chunk_map.write().insert(index);
    }

    /// Number of locally present chunks.
    pub fn chunks_present(&self) -> u64 {
        self.chunk_map.read().len() as u64
    }

    /// File size in bytes; zero until the file is fully reconstructed.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Sets the size on reconstruction. Only the first call takes effect.
    pub fn set_size(&self, size: i64) {
        let _ = self
            .size
            .compare_exchange(0, size, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Composite catalog key: hex of the metafile hash plus the name, so
    /// the same content under two names keeps two entries.
    pub fn key(&self) -> String {
        metadata_key(&self.metafile_hash, &self.file_name)
    }
}

pub(crate) fn metadata_key(metafile_hash: &[u8], file_name: &str) -> String {
    format!("{}{}", hex::encode(metafile_hash), file_name)
}

/// The content-addressed store plus the file catalog, chunk ownership map
/// and in-flight reply listeners.
pub struct FileEngine {
    config: Arc<NodeConfig>,
    /// hex(SHA-256) → chunk or metafile bytes.
    chunks: DashMap<String, Arc<Vec<u8>>>,
    /// Catalog keyed by `hex(metahash) + name`.
    catalog: DashMap<String, Arc<FileMetadata>>,
    /// chunk hex hash → origins known to hold it.
    owners: RwLock<HashMap<String, BTreeSet<String>>>,
    /// (hex hash, peer origin) → channel of the waiting downloader.
    reply_listeners: DashMap<(String, String), mpsc::Sender<DataReply>>,
}

impl FileEngine {
    pub fn new(config: Arc<NodeConfig>) -> Self {
        Self {
            config,
            chunks: DashMap::new(),
            catalog: DashMap::new(),
            owners: RwLock::new(HashMap::new()),
            reply_listeners: DashMap::new(),
        }
    }

    // -- indexing -----------------------------------------------------------

    /// Indexes a file from the share directory: chunks it, stores every
    /// chunk and the metafile, and creates the catalog entry.
    ///
    /// Returns the metadata and whether the entry already existed.
    pub async fn index_file(&self, file_name: &str) -> Result<(Arc<FileMetadata>, bool), FileError> {
        let path = self.config.share_dir.join(file_name);
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|source| FileError::Read {
                name: file_name.to_string(),
                source,
            })?;

        let (metadata, existed) = self.index_bytes(file_name, &contents);
        debug!(
            file = file_name,
            metahash = %hex::encode(&metadata.metafile_hash),
            "file indexed"
        );
        Ok((metadata, existed))
    }

    /// Chunking and storage for in-memory contents. Split out of
    /// [`FileEngine::index_file`] so tests can index without a share
    /// directory.
    pub fn index_bytes(&self, file_name: &str, contents: &[u8]) -> (Arc<FileMetadata>, bool) {
        let chunk_count = contents.len().div_ceil(FILE_CHUNK_SIZE) as u64;
        let mut metafile = Vec::with_capacity(chunk_count as usize * 32);

        for chunk in contents.chunks(FILE_CHUNK_SIZE) {
            let digest = sha256(chunk);
            metafile.extend_from_slice(&digest);
            self.chunks
                .entry(hex::encode(digest))
                .or_insert_with(|| Arc::new(chunk.to_vec()));
        }

        let metafile_hash = sha256(&metafile).to_vec();
        self.chunks
            .entry(hex::encode(&metafile_hash))
            .or_insert_with(|| Arc::new(metafile));

        let key = metadata_key(&metafile_hash, file_name);
        let mut existed = true;
        let metadata = self
            .catalog
            .entry(key)
            .or_insert_with(|| {
                existed = false;
                let metadata = FileMetadata::new(
                    file_name.to_string(),
                    metafile_hash,
                    chunk_count,
                    contents.len() as i64,
                );
                for index in 1..=chunk_count {
                    metadata.add_chunk(index);
                }
                Arc::new(metadata)
            })
            .clone();
        (metadata, existed)
    }

    // -- content-addressed store --------------------------------------------

    /// The bytes stored under a hash, if present.
    pub fn data_for(&self, hash: &[u8]) -> Option<Arc<Vec<u8>>> {
        self.chunks.get(&hex::encode(hash)).map(|e| e.value().clone())
    }

    /// Stores validated bytes under their hash.
    pub fn store_data(&self, hash: &[u8], data: Vec<u8>) {
        self.chunks
            .entry(hex::encode(hash))
            .or_insert_with(|| Arc::new(data));
    }

    // -- catalog ------------------------------------------------------------

    /// Load-or-create a catalog entry learned from the network (size
    /// unknown, no chunks yet). Returns the entry and whether it existed.
    pub fn catalog_entry(
        &self,
        file_name: &str,
        metafile_hash: &[u8],
        chunk_count: u64,
    ) -> (Arc<FileMetadata>, bool) {
        let key = metadata_key(metafile_hash, file_name);
        let mut existed = true;
        let metadata = self
            .catalog
            .entry(key)
            .or_insert_with(|| {
                existed = false;
                Arc::new(FileMetadata::new(
                    file_name.to_string(),
                    metafile_hash.to_vec(),
                    chunk_count,
                    0,
                ))
            })
            .clone();
        (metadata, existed)
    }

    /// Every catalog entry, for search matching.
    pub fn catalog_snapshot(&self) -> Vec<Arc<FileMetadata>> {
        self.catalog.iter().map(|e| e.value().clone()).collect()
    }

    /// Refreshes a metadata's chunk map from the locally present chunks.
    pub fn refresh_chunk_map(&self, metadata: &FileMetadata, metafile: &[u8]) {
        for index in 0..metadata.chunk_count {
            let digest = chunk_hash(metafile, index);
            if self.chunks.contains_key(&hex::encode(digest)) {
                metadata.add_chunk(index + 1);
            }
        }
    }

    // -- chunk ownership ----------------------------------------------------

    /// Records that `origin` holds the chunks listed in `chunk_map`
    /// (1-based indices into `metafile`).
    pub fn record_owner(&self, origin: &str, chunk_map: &[u64], metafile: &[u8]) {
        let mut owners = self.owners.write();
        for &index in chunk_map {
            if index == 0 || index > metafile.len() as u64 / 32 {
                continue;
            }
            let digest = chunk_hash(metafile, index - 1);
            owners
                .entry(hex::encode(digest))
                .or_default()
                .insert(origin.to_string());
        }
    }

    /// Records a single owner for a chunk hash.
    pub fn record_chunk_owner(&self, origin: &str, chunk_hash: &[u8]) {
        self.owners
            .write()
            .entry(hex::encode(chunk_hash))
            .or_default()
            .insert(origin.to_string());
    }

    /// The origins known to hold a chunk.
    pub fn owners_of(&self, chunk_hash: &[u8]) -> Vec<String> {
        self.owners
            .read()
            .get(&hex::encode(chunk_hash))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when every chunk of the file has at least one known owner.
    pub fn all_chunks_located(&self, metadata: &FileMetadata) -> bool {
        let Some(metafile) = self.data_for(&metadata.metafile_hash) else {
            return false;
        };
        let owners = self.owners.read();
        (0..metadata.chunk_count).all(|index| {
            let digest = chunk_hash(&metafile, index);
            owners
                .get(&hex::encode(digest))
                .is_some_and(|set| !set.is_empty())
        })
    }

    // -- reply routing ------------------------------------------------------

    /// Registers the reply listener for (hash, peer) and returns its
    /// receiving end. An existing listener for the same pair is replaced.
    pub fn register_reply_listener(
        &self,
        hash: &[u8],
        peer: &str,
    ) -> mpsc::Receiver<DataReply> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.reply_listeners
            .insert((hex::encode(hash), peer.to_string()), tx);
        rx
    }

    /// Drops the reply listener for (hash, peer).
    pub fn remove_reply_listener(&self, hash: &[u8], peer: &str) {
        self.reply_listeners
            .remove(&(hex::encode(hash), peer.to_string()));
    }

    /// Routes a validated reply to the waiting downloader, if any.
    /// Replies failing the hash check or carrying no data are discarded —
    /// the waiter keeps retrying until its hard stop.
    pub fn dispatch_reply(&self, reply: DataReply) {
        if reply.data.is_empty() || !hash_matches(&reply.hash_value, &reply.data) {
            debug!(
                origin = %reply.origin,
                hash = %hex::encode(&reply.hash_value),
                "discarding empty or corrupt data reply"
            );
            return;
        }
        let key = (hex::encode(&reply.hash_value), reply.origin.clone());
        if let Some(listener) = self.reply_listeners.get(&key) {
            let _ = listener.value().try_send(reply);
        }
    }

    // -- disk ---------------------------------------------------------------

    /// Writes a reconstructed file into the download directory.
    pub async fn save_to_downloads(&self, file_name: &str, data: &[u8]) -> Result<(), FileError> {
        write_file(&self.config.download_dir, file_name, data).await
    }

    /// Serves a duplicate-content download by copying the existing file.
    pub async fn copy_download(&self, from: &str, to: &str) -> Result<(), FileError> {
        let source = self.config.download_dir.join(from);
        let target = self.config.download_dir.join(to);
        tokio::fs::copy(&source, &target)
            .await
            .map_err(|source| FileError::Write {
                name: to.to_string(),
                source,
            })?;
        Ok(())
    }
}

/// The `index`-th (0-based) chunk digest recorded in a metafile.
pub fn chunk_hash(metafile: &[u8], index: u64) -> [u8; 32] {
    let start = index as usize * 32;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&metafile[start..start + 32]);
    digest
}

async fn write_file(dir: &Path, file_name: &str, data: &[u8]) -> Result<(), FileError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| FileError::Write {
            name: file_name.to_string(),
            source,
        })?;
    tokio::fs::write(dir.join(file_name), data)
        .await
        .map_err(|source| FileError::Write {
            name: file_name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_HOP_LIMIT, DEFAULT_STUBBORN_TIMEOUT_SECS};
    use std::path::PathBuf;

    fn make_engine(base: PathBuf) -> FileEngine {
        FileEngine::new(Arc::new(NodeConfig::new(
            "local".to_string(),
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
            vec![],
            1,
            false,
            false,
            false,
            false,
            false,
            DEFAULT_HOP_LIMIT,
            0,
            0,
            DEFAULT_STUBBORN_TIMEOUT_SECS,
            base,
        )))
    }

    #[test]
    fn indexing_splits_into_expected_chunks() {
        let engine = make_engine(PathBuf::from("."));
        let contents = vec![7u8; 20_000];
        let (metadata, existed) = engine.index_bytes("big.bin", &contents);

        assert!(!existed);
        assert_eq!(metadata.chunk_count, 3); // ceil(20000 / 8192)
        assert_eq!(metadata.size(), 20_000);
        assert_eq!(metadata.chunk_map(), vec![1, 2, 3]);
    }

    #[test]
    fn every_stored_chunk_matches_its_key() {
        let engine = make_engine(PathBuf::from("."));
        let contents: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        engine.index_bytes("data.bin", &contents);

        for entry in engine.chunks.iter() {
            let digest = sha256(entry.value());
            assert_eq!(hex::encode(digest), *entry.key());
        }
    }

    #[test]
    fn metafile_is_concatenated_chunk_hashes() {
        let engine = make_engine(PathBuf::from("."));
        let contents = vec![1u8; FILE_CHUNK_SIZE + 10];
        let (metadata, _) = engine.index_bytes("two.bin", &contents);

        let metafile = engine.data_for(&metadata.metafile_hash).expect("metafile");
        assert_eq!(metafile.len(), 64);
        assert_eq!(chunk_hash(&metafile, 0), sha256(&contents[..FILE_CHUNK_SIZE]));
        assert_eq!(chunk_hash(&metafile, 1), sha256(&contents[FILE_CHUNK_SIZE..]));
        assert_eq!(sha256(&metafile).to_vec(), metadata.metafile_hash);
    }

    #[test]
    fn reindexing_is_idempotent() {
        let engine = make_engine(PathBuf::from("."));
        let contents = vec![3u8; 100];
        let (_, first) = engine.index_bytes("same.bin", &contents);
        let (_, second) = engine.index_bytes("same.bin", &contents);
        assert!(!first);
        assert!(second);
    }

    #[test]
    fn size_is_set_exactly_once() {
        let engine = make_engine(PathBuf::from("."));
        let (metadata, _) = engine.catalog_entry("f.bin", &[0xaa; 32], 2);
        assert_eq!(metadata.size(), 0);
        metadata.set_size(100);
        metadata.set_size(999);
        assert_eq!(metadata.size(), 100);
    }

    #[test]
    fn ownership_tracks_per_chunk_origins() {
        let engine = make_engine(PathBuf::from("."));
        let contents = vec![9u8; 2 * FILE_CHUNK_SIZE];
        let (metadata, _) = engine.index_bytes("owned.bin", &contents);
        let metafile = engine.data_for(&metadata.metafile_hash).unwrap();

        engine.record_owner("B", &[1], &metafile);
        engine.record_owner("C", &[1, 2], &metafile);

        let first = chunk_hash(&metafile, 0);
        let second = chunk_hash(&metafile, 1);
        assert_eq!(engine.owners_of(&first), vec!["B", "C"]);
        assert_eq!(engine.owners_of(&second), vec!["C"]);
    }

    #[test]
    fn all_chunks_located_requires_every_chunk() {
        let engine = make_engine(PathBuf::from("."));
        let contents = vec![5u8; 2 * FILE_CHUNK_SIZE];
        let (metadata, _) = engine.index_bytes("loc.bin", &contents);
        let metafile = engine.data_for(&metadata.metafile_hash).unwrap();

        engine.record_owner("B", &[1], &metafile);
        assert!(!engine.all_chunks_located(&metadata));

        engine.record_owner("B", &[2], &metafile);
        assert!(engine.all_chunks_located(&metadata));
    }

    #[test]
    fn dispatch_rejects_corrupt_replies() {
        let engine = make_engine(PathBuf::from("."));
        let data = vec![1, 2, 3];
        let good_hash = sha256(&data).to_vec();
        let mut rx = engine.register_reply_listener(&good_hash, "B");

        // Corrupt payload: hash does not match.
        engine.dispatch_reply(DataReply {
            origin: "B".into(),
            destination: "local".into(),
            hop_limit: 10,
            hash_value: good_hash.clone(),
            data: vec![9, 9, 9],
        });
        assert!(rx.try_recv().is_err());

        // Negative reply: empty payload.
        engine.dispatch_reply(DataReply {
            origin: "B".into(),
            destination: "local".into(),
            hop_limit: 10,
            hash_value: good_hash.clone(),
            data: Vec::new(),
        });
        assert!(rx.try_recv().is_err());

        // Valid reply is delivered.
        engine.dispatch_reply(DataReply {
            origin: "B".into(),
            destination: "local".into(),
            hop_limit: 10,
            hash_value: good_hash,
            data,
        });
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn index_and_save_round_trip_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = make_engine(dir.path().to_path_buf());

        tokio::fs::create_dir_all(dir.path().join(crate::config::SHARE_DIR))
            .await
            .unwrap();
        let contents = vec![0xabu8; 12_345];
        tokio::fs::write(
            dir.path().join(crate::config::SHARE_DIR).join("orig.bin"),
            &contents,
        )
        .await
        .unwrap();

        let (metadata, _) = engine.index_file("orig.bin").await.expect("index");
        assert_eq!(metadata.size(), 12_345);

        engine
            .save_to_downloads("copy.bin", &contents)
            .await
            .expect("save");
        let written = tokio::fs::read(
            dir.path().join(crate::config::DOWNLOAD_DIR).join("copy.bin"),
        )
        .await
        .unwrap();
        assert_eq!(sha256(&written), sha256(&contents));
    }
}
