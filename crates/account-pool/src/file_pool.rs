//! Directory-scan strategy
//!
//! Every `.xml` file under the root (recursively) is one account whose ID is
//! the file stem. The resource count comes from an `_<N>P` segment of the
//! stem, e.g. `20240101_42P_main.xml` has 42 packs.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::account::Account;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::pool::{AccountSource, BoxFuture, Pool};

/// Pool over a directory of data files.
pub type FileAccountPool = Pool<FileSource>;

impl Pool<FileSource> {
    pub async fn open(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        Pool::start(name, FileSource::new(root), config).await
    }
}

#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
    extension: String,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "xml".to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Breadth-first walk; entries are visited in name order so the winner of
    /// a duplicate ID is stable across runs.
    async fn scan(&self) -> Result<Vec<Account>> {
        let mut found: HashMap<String, Account> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut pending = VecDeque::from([self.root.clone()]);

        while let Some(dir) = pending.pop_front() {
            let entries = match read_sorted(&dir).await {
                Ok(entries) => entries,
                Err(e) if dir == self.root => {
                    return Err(Error::Discovery(format!(
                        "reading {}: {e}",
                        self.root.display()
                    )));
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };

            for path in entries {
                let metadata = match tokio::fs::metadata(&path).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                if metadata.is_dir() {
                    pending.push_back(path);
                    continue;
                }
                if !metadata.is_file() || !self.is_data_file(&path) {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                else {
                    continue;
                };

                if let Some(existing) = found.get(&id) {
                    warn!(
                        account_id = %id,
                        kept = %existing.file_path.display(),
                        ignored = %path.display(),
                        "duplicate account file"
                    );
                    continue;
                }

                let mut account = Account::new(id.clone(), path);
                account.packs = packs_from_name(&id);
                account.last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);
                order.push(id.clone());
                found.insert(id, account);
            }
        }

        debug!(root = %self.root.display(), accounts = order.len(), "directory scan complete");
        Ok(order
            .into_iter()
            .filter_map(|id| found.remove(&id))
            .collect())
    }

    fn is_data_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }
}

impl AccountSource for FileSource {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn discover(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(self.scan())
    }
}

async fn read_sorted(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Pack count from the first `_<N>P` segment of a file stem, 0 if none.
pub(crate) fn packs_from_name(stem: &str) -> u32 {
    stem.split('_')
        .skip(1)
        .find_map(|segment| {
            let digits = segment.strip_suffix(['P', 'p'])?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        })
        .unwrap_or(0)
}
