//! Content-addressed file cache.
//!
//! Every payload lives at `<root>/<sha256>/<file>`. New payloads are written
//! under `<root>/.staging/` first and renamed into place in one step, so
//! readers and the evictor only ever observe complete entries.

use std::io;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut, stream};
use metrics::counter;
use sha2::{Digest, Sha256};
use slug::slugify;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::cache::{CacheEntry, ContentEncoding, ContentHash, extension_of};
use crate::domain::error::DomainError;

const SOURCE: &str = "infra::file_cache";
const HASH_CHUNK_BYTES: usize = 64 * 1024;

/// Directory under the cache root holding in-progress writes.
pub const STAGING_DIR: &str = ".staging";
pub const METRIC_WRITE_TOTAL: &str = "docgen_file_cache_write_total";

/// Coarse classification of [`FileCacheError`] used by callers and handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Corrupt,
    Io,
}

#[derive(Debug, Error)]
pub enum FileCacheError {
    #[error("{message}")]
    Validation { message: String },
    #[error("hash '{hash}' not found")]
    NotFound { hash: ContentHash },
    #[error("file already cached; hash '{hash}'")]
    Conflict { hash: ContentHash },
    #[error("hash '{hash}' found but holds {files} payload files instead of one")]
    Corrupt { hash: ContentHash, files: usize },
    #[error("{op} failed for {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileCacheError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Status code a route handler should answer with.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 405,
            ErrorKind::Corrupt | ErrorKind::Io => 500,
        }
    }
}

impl From<DomainError> for FileCacheError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation { message } => Self::Validation { message },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Replace an existing entry with the same hash instead of failing.
    pub overwrite: bool,
}

impl WriteOptions {
    pub const OVERWRITE: Self = Self { overwrite: true };
}

/// How an overwrite resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Swap {
    /// Our staged entry now occupies the slot.
    Replaced,
    /// A concurrent writer of the same hash filled the slot instead.
    Settled,
}

/// Outcome of a successful `write` or `move_in`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub hash: ContentHash,
    pub name: String,
    pub path: PathBuf,
    /// Whether an existing entry was replaced.
    pub replaced: bool,
}

#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    staging: PathBuf,
}

impl FileCache {
    /// Open the cache rooted at `root`, creating it if necessary.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FileCacheError> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging).map_err(|source| {
            error!(
                target = SOURCE,
                directory = %root.display(),
                error = %source,
                "could not access cache directory"
            );
            FileCacheError::io("create cache directory", &staging, source)
        })?;
        Ok(Self { root, staging })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hash directory for `hash`.
    pub fn entry_dir(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    /// Decode `content` and store it as `<uuid>.<file_type>`.
    pub async fn write(
        &self,
        content: &[u8],
        file_type: &str,
        encoding: ContentEncoding,
        options: WriteOptions,
    ) -> Result<StoredFile, FileCacheError> {
        if content.is_empty() {
            return Err(FileCacheError::validation(
                "Cannot write file; content parameter is required.",
            ));
        }
        let ext: String = file_type
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        if ext.is_empty() {
            return Err(FileCacheError::validation(
                "Cannot write file; fileType parameter is required.",
            ));
        }

        let decoded = encoding.decode(content)?;
        let name = format!("{}.{}", Uuid::new_v4(), ext.to_ascii_lowercase());
        let payload = stream::once(async move { Ok::<_, FileCacheError>(Bytes::from(decoded)) });
        let stored = self.write_stream(&name, payload, options).await?;

        info!(
            target = SOURCE,
            hash = %stored.hash,
            name = %stored.name,
            encoding = encoding.as_str(),
            "template cached"
        );
        Ok(stored)
    }

    /// Stream a payload into the cache under `name`.
    ///
    /// The payload is hashed while it is written to the staging area, so large
    /// uploads never need to be buffered in memory.
    pub async fn write_stream<S>(
        &self,
        name: &str,
        payload: S,
        options: WriteOptions,
    ) -> Result<StoredFile, FileCacheError>
    where
        S: Stream<Item = Result<Bytes, FileCacheError>>,
    {
        let file_name = sanitize_filename(name);
        let staged = self.stage_dir().await?;

        let hash = match write_hashed(&staged.join(&file_name), payload).await {
            Ok(hash) => hash,
            Err(err) => {
                self.discard(&staged).await;
                record_write("error");
                return Err(err);
            }
        };

        self.commit(staged, file_name, hash, options).await
    }

    /// Hash `source` in place and relocate it into the cache as `name`.
    ///
    /// When an entry with the same hash exists and `overwrite` is off, the
    /// source file is deleted and a conflict is reported.
    pub async fn move_in(
        &self,
        source: &Path,
        name: &str,
        options: WriteOptions,
    ) -> Result<StoredFile, FileCacheError> {
        if source.as_os_str().is_empty() {
            return Err(FileCacheError::validation(
                "Cannot move file; source parameter is required.",
            ));
        }
        if name.trim().is_empty() {
            return Err(FileCacheError::validation(
                "Cannot move file; file name parameter is required.",
            ));
        }

        let hash = hash_file(source).await?;

        if !options.overwrite && path_exists(&self.entry_dir(&hash)).await {
            if let Err(err) = fs::remove_file(source).await {
                warn!(
                    target = SOURCE,
                    path = %source.display(),
                    error = %err,
                    "failed to remove source of duplicate upload"
                );
            }
            record_write("conflict");
            return Err(FileCacheError::Conflict { hash });
        }

        let file_name = sanitize_filename(name);
        let staged = self.stage_dir().await?;
        if let Err(err) = relocate(source, &staged.join(&file_name)).await {
            self.discard(&staged).await;
            record_write("error");
            return Err(err);
        }

        self.commit(staged, file_name, hash, options).await
    }

    /// Locate the entry for `hash`.
    pub async fn find(&self, hash: &str) -> Result<CacheEntry, FileCacheError> {
        let hash: ContentHash = hash.parse()?;
        let dir = self.entry_dir(&hash);

        let mut listing = match fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                return Err(FileCacheError::NotFound { hash });
            }
            Err(source) => {
                error!(
                    target = SOURCE,
                    hash = %hash,
                    error = %source,
                    "unknown error reading cache entry"
                );
                return Err(FileCacheError::io("read entry", &dir, source));
            }
        };

        let mut files = Vec::new();
        while let Some(item) = listing
            .next_entry()
            .await
            .map_err(|source| FileCacheError::io("read entry", &dir, source))?
        {
            files.push(item);
        }

        if files.len() != 1 {
            return Err(corrupt(hash, files.len()));
        }
        let Some(item) = files.pop() else {
            return Err(corrupt(hash, 0));
        };

        let path = item.path();
        let metadata = item
            .metadata()
            .await
            .map_err(|source| FileCacheError::io("stat entry", &path, source))?;
        if !metadata.is_file() {
            return Err(corrupt(hash, 0));
        }

        let name = item.file_name().to_string_lossy().into_owned();
        let modified_at = metadata
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        Ok(CacheEntry {
            ext: extension_of(&name),
            hash,
            name,
            dir,
            path,
            size_bytes: metadata.len(),
            modified_at,
        })
    }

    /// Read the payload for `hash`.
    pub async fn read(&self, hash: &str) -> Result<Bytes, FileCacheError> {
        let entry = self.find(hash).await?;
        let data = fs::read(&entry.path)
            .await
            .map_err(|source| FileCacheError::io("read payload", &entry.path, source))?;
        Ok(Bytes::from(data))
    }

    /// Delete the whole entry directory for `hash`.
    pub async fn remove(&self, hash: &str) -> Result<(), FileCacheError> {
        let hash: ContentHash = hash.parse()?;
        let dir = self.entry_dir(&hash);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(target = SOURCE, hash = %hash, "cache entry removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(FileCacheError::NotFound { hash })
            }
            Err(source) => {
                error!(
                    target = SOURCE,
                    hash = %hash,
                    error = %source,
                    "failed to remove cache entry"
                );
                Err(FileCacheError::io("remove entry", &dir, source))
            }
        }
    }

    async fn stage_dir(&self) -> Result<PathBuf, FileCacheError> {
        let dir = self.staging.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| FileCacheError::io("create staging directory", &dir, source))?;
        Ok(dir)
    }

    async fn discard(&self, staged: &Path) {
        if let Err(err) = fs::remove_dir_all(staged).await
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(
                target = SOURCE,
                path = %staged.display(),
                error = %err,
                "failed to discard staged payload"
            );
        }
    }

    /// Move a staged directory into its hash slot.
    async fn commit(
        &self,
        staged: PathBuf,
        file_name: String,
        hash: ContentHash,
        options: WriteOptions,
    ) -> Result<StoredFile, FileCacheError> {
        let target = self.entry_dir(&hash);

        if !path_exists(&target).await {
            match fs::rename(&staged, &target).await {
                Ok(()) => return Ok(self.stored(hash, file_name, false)),
                // A concurrent writer claimed the slot first.
                Err(err) if slot_taken(&err) || path_exists(&target).await => {}
                Err(source) => {
                    self.discard(&staged).await;
                    record_write("error");
                    error!(
                        target = SOURCE,
                        hash = %hash,
                        error = %source,
                        "error moving file to cache"
                    );
                    return Err(FileCacheError::io("commit entry", &target, source));
                }
            }
        }

        if !options.overwrite {
            self.discard(&staged).await;
            record_write("conflict");
            debug!(target = SOURCE, hash = %hash, "file already cached");
            return Err(FileCacheError::Conflict { hash });
        }

        match self.replace(&staged, &target).await? {
            Swap::Replaced => Ok(self.stored(hash, file_name, true)),
            Swap::Settled => {
                // Same hash, same bytes: the concurrent writer's entry stands.
                let name = settled_name(&target).await.unwrap_or(file_name);
                debug!(
                    target = SOURCE,
                    hash = %hash,
                    name = %name,
                    "concurrent overwrite settled the entry"
                );
                Ok(self.stored(hash, name, true))
            }
        }
    }

    /// Swap `staged` in for the existing `target`, keeping the old entry
    /// recoverable until the new one is in place.
    ///
    /// Readers may see `NotFound` between the two renames. A concurrent
    /// writer of the same hash can move the slot at any point; when it does
    /// the slot ends up holding its entry and ours is dropped.
    async fn replace(&self, staged: &Path, target: &Path) -> Result<Swap, FileCacheError> {
        let retired = self.staging.join(format!("{}-replaced", Uuid::new_v4()));

        match fs::rename(target, &retired).await {
            Ok(()) => {}
            // Another writer retired the entry first; race it for the empty slot.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return match fs::rename(staged, target).await {
                    Ok(()) => Ok(Swap::Replaced),
                    Err(err) if slot_taken(&err) || path_exists(target).await => {
                        self.discard(staged).await;
                        Ok(Swap::Settled)
                    }
                    Err(source) => {
                        self.discard(staged).await;
                        record_write("error");
                        Err(FileCacheError::io("commit entry", target, source))
                    }
                };
            }
            Err(source) => {
                self.discard(staged).await;
                record_write("error");
                return Err(FileCacheError::io("retire entry", target, source));
            }
        }

        let source = match fs::rename(staged, target).await {
            Ok(()) => {
                self.discard(&retired).await;
                return Ok(Swap::Replaced);
            }
            Err(source) => source,
        };

        self.discard(staged).await;
        if slot_taken(&source) || path_exists(target).await {
            self.discard(&retired).await;
            return Ok(Swap::Settled);
        }

        if let Err(restore) = fs::rename(&retired, target).await {
            if slot_taken(&restore) || path_exists(target).await {
                self.discard(&retired).await;
                return Ok(Swap::Settled);
            }
            error!(
                target = SOURCE,
                path = %target.display(),
                error = %restore,
                "failed to restore replaced cache entry"
            );
            self.discard(&retired).await;
        }
        record_write("error");
        Err(FileCacheError::io("commit entry", target, source))
    }

    fn stored(&self, hash: ContentHash, name: String, replaced: bool) -> StoredFile {
        record_write(if replaced { "replaced" } else { "stored" });
        let path = self.entry_dir(&hash).join(&name);
        StoredFile {
            hash,
            name,
            path,
            replaced,
        }
    }
}

fn corrupt(hash: ContentHash, files: usize) -> FileCacheError {
    error!(
        target = SOURCE,
        hash = %hash,
        files,
        "hash found; could not read file from cache"
    );
    FileCacheError::Corrupt { hash, files }
}

fn record_write(result: &'static str) {
    counter!(METRIC_WRITE_TOTAL, "result" => result).increment(1);
}

async fn path_exists(path: &Path) -> bool {
    matches!(fs::try_exists(path).await, Ok(true))
}

/// Whether a rename failed because another entry already occupies the slot.
///
/// Whoever empties a slot refills it, so an occupied slot is always a
/// complete entry with the same bytes.
fn slot_taken(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::DirectoryNotEmpty | io::ErrorKind::AlreadyExists
    )
}

/// File name held by the entry directory `dir`.
async fn settled_name(dir: &Path) -> Option<String> {
    let mut listing = fs::read_dir(dir).await.ok()?;
    let item = listing.next_entry().await.ok()??;
    Some(item.file_name().to_string_lossy().into_owned())
}

async fn write_hashed<S>(path: &Path, payload: S) -> Result<ContentHash, FileCacheError>
where
    S: Stream<Item = Result<Bytes, FileCacheError>>,
{
    let mut file = fs::File::create(path)
        .await
        .map_err(|source| FileCacheError::io("create staged file", path, source))?;
    let mut hasher = Sha256::new();
    let mut saw_payload = false;

    pin_mut!(payload);
    while let Some(chunk) = payload.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        saw_payload = true;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|source| FileCacheError::io("write staged file", path, source))?;
    }

    file.flush()
        .await
        .map_err(|source| FileCacheError::io("write staged file", path, source))?;

    if !saw_payload {
        return Err(FileCacheError::validation(
            "Cannot write file; content parameter is required.",
        ));
    }

    let digest = hasher.finalize();
    Ok(ContentHash::from_digest(&digest[..]))
}

async fn hash_file(path: &Path) -> Result<ContentHash, FileCacheError> {
    let hash_error = |source| FileCacheError::io("hash source", path, source);
    let mut file = fs::File::open(path).await.map_err(hash_error)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; HASH_CHUNK_BYTES];

    loop {
        let read = file.read(&mut buffer).await.map_err(hash_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let digest = hasher.finalize();
    Ok(ContentHash::from_digest(&digest[..]))
}

/// Rename `source` to `dest`, copying when they live on different filesystems.
async fn relocate(source: &Path, dest: &Path) -> Result<(), FileCacheError> {
    if fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }

    fs::copy(source, dest)
        .await
        .map_err(|err| FileCacheError::io("move source", source, err))?;
    if let Err(err) = fs::remove_file(source).await {
        warn!(
            target = SOURCE,
            path = %source.display(),
            error = %err,
            "failed to remove source after copying into cache"
        );
    }
    Ok(())
}

/// Reduce a caller-supplied name to a single safe path component.
pub fn sanitize_filename(original: &str) -> String {
    let leaf = Path::new(original)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .next_back()
        .unwrap_or_default();
    let path = Path::new(leaf);

    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("upload");
    let mut base = slugify(stem);
    if base.is_empty() {
        base = "upload".to_string();
    }

    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.trim_matches('.').to_ascii_lowercase())
        .filter(|value| !value.is_empty());

    match extension {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn cache() -> (TempDir, FileCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path().join("cache")).expect("cache");
        (dir, cache)
    }

    async fn staging_is_empty(cache: &FileCache) -> bool {
        let mut listing = fs::read_dir(cache.root().join(STAGING_DIR))
            .await
            .expect("staging");
        listing.next_entry().await.expect("entry").is_none()
    }

    #[test]
    fn sanitizes_names_to_one_component() {
        assert_eq!(sanitize_filename("Quarterly Report.DOCX"), "quarterly-report.docx");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("noext"), "noext");
    }

    #[test]
    fn error_kinds_map_to_http_status() {
        let hash = ContentHash::digest(b"x");
        assert_eq!(FileCacheError::validation("bad").http_status(), 400);
        assert_eq!(FileCacheError::NotFound { hash: hash.clone() }.http_status(), 404);
        assert_eq!(FileCacheError::Conflict { hash: hash.clone() }.http_status(), 405);
        assert_eq!(FileCacheError::Corrupt { hash, files: 2 }.http_status(), 500);
    }

    #[tokio::test]
    async fn write_then_find_and_read() {
        let (_dir, cache) = cache();

        let stored = cache
            .write(b"aGVsbG8=", ".txt", ContentEncoding::Base64, WriteOptions::default())
            .await
            .expect("write");
        assert_eq!(stored.hash, ContentHash::digest(b"hello"));
        assert!(stored.name.ends_with(".txt"));
        assert!(!stored.replaced);

        let entry = cache.find(stored.hash.as_str()).await.expect("find");
        assert_eq!(entry.ext, "txt");
        assert_eq!(entry.name, stored.name);
        assert_eq!(entry.size_bytes, 5);
        assert_eq!(entry.content_type(), "text/plain");

        let bytes = cache.read(stored.hash.as_str()).await.expect("read");
        assert_eq!(&bytes[..], b"hello");
        assert!(staging_is_empty(&cache).await);
    }

    #[tokio::test]
    async fn duplicate_write_is_a_conflict() {
        let (_dir, cache) = cache();
        let first = cache
            .write(b"payload", "pdf", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect("first");

        let err = cache
            .write(b"payload", "pdf", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect_err("second write conflicts");

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(err, FileCacheError::Conflict { ref hash } if *hash == first.hash));

        let entry = cache.find(first.hash.as_str()).await.expect("find");
        assert_eq!(entry.name, first.name);
        assert!(staging_is_empty(&cache).await);
    }

    #[tokio::test]
    async fn overwrite_replaces_the_entry() {
        let (_dir, cache) = cache();
        let first = cache
            .write(b"payload", "pdf", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect("first");
        let second = cache
            .write(b"payload", "pdf", ContentEncoding::Binary, WriteOptions::OVERWRITE)
            .await
            .expect("second");

        assert_eq!(first.hash, second.hash);
        assert!(second.replaced);

        let entry = cache.find(second.hash.as_str()).await.expect("find");
        assert_eq!(entry.name, second.name);
        assert!(staging_is_empty(&cache).await);
    }

    #[tokio::test]
    async fn concurrent_identical_writes_converge() {
        let (_dir, cache) = cache();
        let (a, b) = tokio::join!(
            cache.write(b"same", "txt", ContentEncoding::Binary, WriteOptions::default()),
            cache.write(b"same", "txt", ContentEncoding::Binary, WriteOptions::default()),
        );

        let outcomes = [a, b];
        let stored: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        let conflicts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(err) if err.kind() == ErrorKind::Conflict))
            .count();
        assert_eq!(stored.len(), 1);
        assert_eq!(conflicts, 1);

        let entry = cache.find(stored[0].hash.as_str()).await.expect("find");
        assert_eq!(entry.name, stored[0].name);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_overwrites_all_succeed_and_leave_no_staging() {
        let (_dir, cache) = cache();
        let first = cache
            .write(b"shared", "txt", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect("seed");

        for round in 0..200 {
            let writers: Vec<_> = (0..3)
                .map(|_| {
                    let cache = cache.clone();
                    tokio::spawn(async move {
                        cache
                            .write(b"shared", "txt", ContentEncoding::Binary, WriteOptions::OVERWRITE)
                            .await
                    })
                })
                .collect();

            for writer in writers {
                let stored = writer
                    .await
                    .expect("join")
                    .unwrap_or_else(|err| panic!("round {round}: overwrite failed: {err}"));
                assert_eq!(stored.hash, first.hash);
            }

            let entry = cache.find(first.hash.as_str()).await.expect("find");
            assert_eq!(entry.size_bytes, 6);
            assert!(staging_is_empty(&cache).await, "round {round}: staging not empty");
        }
    }

    #[tokio::test]
    async fn write_validates_inputs() {
        let (_dir, cache) = cache();

        let empty = cache
            .write(b"", "txt", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect_err("empty content");
        assert_eq!(empty.kind(), ErrorKind::Validation);

        let no_type = cache
            .write(b"x", ".", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect_err("missing type");
        assert_eq!(no_type.kind(), ErrorKind::Validation);

        let bad_hex = cache
            .write(b"zz", "txt", ContentEncoding::Hex, WriteOptions::default())
            .await
            .expect_err("bad hex");
        assert_eq!(bad_hex.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn find_rejects_malformed_and_unknown_hashes() {
        let (_dir, cache) = cache();

        let malformed = cache.find("not-a-hash").await.expect_err("malformed");
        assert_eq!(malformed.kind(), ErrorKind::Validation);

        let missing = ContentHash::digest(b"never stored");
        let err = cache.find(missing.as_str()).await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let read = cache.read(missing.as_str()).await.expect_err("read missing");
        assert_eq!(read.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn entry_with_extra_files_is_corrupt() {
        let (_dir, cache) = cache();
        let stored = cache
            .write(b"data", "txt", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect("write");
        fs::write(cache.entry_dir(&stored.hash).join("extra.txt"), b"x")
            .await
            .expect("extra");

        let err = cache.find(stored.hash.as_str()).await.expect_err("corrupt");
        assert!(matches!(err, FileCacheError::Corrupt { files: 2, .. }));
        assert_eq!(err.http_status(), 500);
    }

    #[tokio::test]
    async fn remove_is_reported_once() {
        let (_dir, cache) = cache();
        let stored = cache
            .write(b"data", "txt", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect("write");

        cache.remove(stored.hash.as_str()).await.expect("remove");
        let again = cache.remove(stored.hash.as_str()).await.expect_err("gone");
        assert_eq!(again.kind(), ErrorKind::NotFound);
        assert_eq!(
            cache.find(stored.hash.as_str()).await.expect_err("find").kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn move_in_consumes_source() {
        let (dir, cache) = cache();
        let source = dir.path().join("upload.tmp");
        fs::write(&source, b"template bytes").await.expect("source");

        let stored = cache
            .move_in(&source, "Invoice Template.docx", WriteOptions::default())
            .await
            .expect("move");

        assert_eq!(stored.hash, ContentHash::digest(b"template bytes"));
        assert_eq!(stored.name, "invoice-template.docx");
        assert!(!path_exists(&source).await);
        assert_eq!(
            fs::read(&stored.path).await.expect("stored"),
            b"template bytes"
        );
    }

    #[tokio::test]
    async fn move_in_conflict_removes_source() {
        let (dir, cache) = cache();
        let first = dir.path().join("first.tmp");
        let second = dir.path().join("second.tmp");
        fs::write(&first, b"same").await.expect("first");
        fs::write(&second, b"same").await.expect("second");

        let stored = cache
            .move_in(&first, "a.txt", WriteOptions::default())
            .await
            .expect("first move");
        let err = cache
            .move_in(&second, "b.txt", WriteOptions::default())
            .await
            .expect_err("conflict");

        assert!(matches!(err, FileCacheError::Conflict { ref hash } if *hash == stored.hash));
        assert!(!path_exists(&second).await);
        assert_eq!(cache.find(stored.hash.as_str()).await.expect("find").name, "a.txt");
    }

    #[tokio::test]
    async fn move_in_reports_missing_source() {
        let (dir, cache) = cache();
        let err = cache
            .move_in(&dir.path().join("absent"), "a.txt", WriteOptions::default())
            .await
            .expect_err("missing source");
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
