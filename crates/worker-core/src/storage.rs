//! Object addresses and bundled storage backends

use crate::traits::ObjectStorage;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Object address of the form `scheme://bucket/key`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectUrl {
    scheme: String,
    bucket: String,
    key: String,
}

impl ObjectUrl {
    /// Parse an address, splitting bucket and key on the first `/` after the scheme
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::invalid_argument(format!("missing scheme in '{}'", url)))?;
        if scheme.is_empty() {
            return Err(Error::invalid_argument(format!("empty scheme in '{}'", url)));
        }
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(Error::invalid_argument(format!("missing bucket in '{}'", url)));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Key with a trailing `/`, suitable as a listing prefix
    pub fn dir_key(&self) -> String {
        if self.key.is_empty() || self.key.ends_with('/') {
            self.key.clone()
        } else {
            format!("{}/", self.key)
        }
    }

    /// Address of `segment` below this one
    pub fn join(&self, segment: &str) -> Self {
        let segment = segment.trim_matches('/');
        Self {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key: format!("{}{}/", self.dir_key(), segment),
        }
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

impl FromStr for ObjectUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectUrl {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ObjectUrl> for String {
    fn from(url: ObjectUrl) -> Self {
        url.to_string()
    }
}

/// Path of `key` relative to `prefix`, rejecting parent traversal
fn relative_key(prefix: &str, key: &str) -> Result<PathBuf> {
    let rel = key.strip_prefix(prefix).unwrap_or(key).trim_start_matches('/');
    if rel.is_empty() || rel.split('/').any(|part| part == "..") {
        return Err(Error::invalid_argument(format!(
            "object key '{}' is not below '{}'",
            key, prefix
        )));
    }
    Ok(PathBuf::from(rel))
}

/// Regular files under `dir`, as `/`-separated paths relative to `base`
async fn walk_files(base: &Path, dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let path = entry.path();
                let rel = path
                    .strip_prefix(base)
                    .map_err(|e| Error::internal(e.to_string()))?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(key);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Filesystem-backed storage: each bucket is a directory below `root`
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn list(&self, prefix: &ObjectUrl) -> Result<Vec<String>> {
        let base = self.bucket_dir(prefix.bucket());
        let dir = base.join(prefix.key());
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        walk_files(&base, &dir)
            .await
            .with_context_fn(|| format!("listing {}", prefix))
    }

    async fn download(
        &self,
        bucket: &str,
        prefix: &str,
        keys: &[String],
        dest_dir: &Path,
    ) -> Result<()> {
        let base = self.bucket_dir(bucket);
        for key in keys {
            let dest = dest_dir.join(relative_key(prefix, key)?);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(base.join(key), &dest)
                .await
                .map_err(|e| Error::upstream(format!("download {}/{}: {}", bucket, key, e)))?;
            debug!(bucket, key = %key, dest = %dest.display(), "Downloaded object");
        }
        Ok(())
    }

    async fn upload(
        &self,
        local_dir: &Path,
        file_names: &[String],
        bucket: &str,
        prefix: &str,
    ) -> Result<()> {
        let target = self.bucket_dir(bucket).join(prefix);
        tokio::fs::create_dir_all(&target).await?;
        for name in file_names {
            tokio::fs::copy(local_dir.join(name), target.join(name))
                .await
                .map_err(|e| Error::upstream(format!("upload {} to {}: {}", name, bucket, e)))?;
        }
        Ok(())
    }
}

/// In-memory storage with call counters, for single-process setups and tests
#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    list_calls: AtomicUsize,
    download_calls: AtomicUsize,
    downloaded_objects: AtomicUsize,
    upload_calls: AtomicUsize,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys in `bucket` starting with `prefix`
    pub fn keys(&self, bucket: &str, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn downloaded_objects(&self) -> usize {
        self.downloaded_objects.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn list(&self, prefix: &ObjectUrl) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.keys(prefix.bucket(), prefix.key()))
    }

    async fn download(
        &self,
        bucket: &str,
        prefix: &str,
        keys: &[String],
        dest_dir: &Path,
    ) -> Result<()> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        for key in keys {
            let data = self
                .get(bucket, key)
                .ok_or_else(|| Error::upstream(format!("no such object {}/{}", bucket, key)))?;
            let dest = dest_dir.join(relative_key(prefix, key)?);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, data).await?;
            self.downloaded_objects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn upload(
        &self,
        local_dir: &Path,
        file_names: &[String],
        bucket: &str,
        prefix: &str,
    ) -> Result<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let prefix = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{}/", prefix)
        };
        for name in file_names {
            let data = tokio::fs::read(local_dir.join(name)).await?;
            self.put(bucket, &format!("{}{}", prefix, name), data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_parsing() {
        let url = ObjectUrl::parse("s3://models/resnet50_4/1/model.pt").unwrap();
        assert_eq!(url.scheme(), "s3");
        assert_eq!(url.bucket(), "models");
        assert_eq!(url.key(), "resnet50_4/1/model.pt");

        let bare = ObjectUrl::parse("local://inputs").unwrap();
        assert_eq!(bare.key(), "");
        assert_eq!(bare.join("job").key(), "job/");
        assert_eq!(bare.join("job").to_string(), "local://inputs/job/");

        assert!(ObjectUrl::parse("models/resnet").is_err());
        assert!(ObjectUrl::parse("s3:///key").is_err());
    }

    #[test]
    fn test_relative_key() {
        assert_eq!(
            relative_key("resnet/", "resnet/1/model.pt").unwrap(),
            PathBuf::from("1/model.pt")
        );
        assert!(relative_key("resnet/", "resnet/../etc/passwd").is_err());
        assert!(relative_key("resnet/", "resnet/").is_err());
    }

    #[tokio::test]
    async fn test_local_storage_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(root.path());
        let model_dir = root.path().join("models/resnet50_4/1");
        tokio::fs::create_dir_all(&model_dir).await.unwrap();
        tokio::fs::write(model_dir.join("model.pt"), b"weights").await.unwrap();
        tokio::fs::write(root.path().join("models/resnet50_4/config"), b"cfg")
            .await
            .unwrap();

        let prefix = ObjectUrl::parse("local://models/resnet50_4/").unwrap();
        let keys = storage.list(&prefix).await.unwrap();
        assert_eq!(keys, vec!["resnet50_4/1/model.pt", "resnet50_4/config"]);

        let dest = tempfile::tempdir().unwrap();
        storage
            .download("models", prefix.key(), &keys, dest.path())
            .await
            .unwrap();
        assert_eq!(
            tokio::fs::read(dest.path().join("1/model.pt")).await.unwrap(),
            b"weights"
        );

        storage
            .upload(dest.path(), &["config".to_string()], "outputs", "job")
            .await
            .unwrap();
        assert!(root.path().join("outputs/job/config").exists());

        let missing = ObjectUrl::parse("local://models/absent/").unwrap();
        assert!(storage.list(&missing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_storage_counts_calls() {
        let storage = InMemoryObjectStorage::new();
        storage.put("inputs", "job/a.jpg", b"a".to_vec());
        storage.put("inputs", "job/b.jpg", b"b".to_vec());
        storage.put("inputs", "other/c.jpg", b"c".to_vec());

        let keys = storage
            .list(&ObjectUrl::parse("mem://inputs/job/").unwrap())
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);

        let dest = tempfile::tempdir().unwrap();
        storage
            .download("inputs", "job/", &keys, dest.path())
            .await
            .unwrap();
        assert_eq!(storage.download_calls(), 1);
        assert_eq!(storage.downloaded_objects(), 2);
        assert!(dest.path().join("b.jpg").exists());

        storage
            .upload(dest.path(), &["a.jpg".to_string()], "outputs", "job")
            .await
            .unwrap();
        assert_eq!(storage.get("outputs", "job/a.jpg").unwrap(), b"a");
    }
}
