use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// One block file kept on this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBlock {
    pub file_name: String,
    pub block_index: u64,
    pub size: u64,
}

/// Block files live flat in one directory as `{block}_{escaped file name}`.
#[derive(Clone, Debug)]
pub(crate) struct BlockStore {
    root: PathBuf,
}

impl BlockStore {
    pub(crate) fn new(root: PathBuf) -> Self {
        BlockStore { root }
    }

    pub(crate) fn path(&self, file_name: &str, block_index: u64) -> PathBuf {
        self.root.join(format!("{}_{}", block_index, flat_name(file_name)))
    }

    /// Size of a stored block, `None` if this node does not have it.
    pub(crate) async fn block_size(&self, path: &Path) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove a block file. A block that is already gone counts as removed.
    pub(crate) async fn remove(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub(crate) async fn list(&self) -> io::Result<Vec<LocalBlock>> {
        let mut blocks = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let parsed = name.to_str().and_then(parse_block_file_name);
            if let Some((block_index, file_name)) = parsed {
                let size = entry.metadata().await?.len();
                blocks.push(LocalBlock {
                    file_name,
                    block_index,
                    size,
                });
            }
        }
        blocks.sort_by(|a, b| (&a.file_name, a.block_index).cmp(&(&b.file_name, b.block_index)));

        Ok(blocks)
    }
}

/// `file_name` made safe to use as a single path component.
pub(crate) fn flat_name(file_name: &str) -> String {
    file_name.replace('%', "%25").replace('/', "%2F")
}

fn unescape(escaped: &str) -> String {
    escaped.replace("%2F", "/").replace("%25", "%")
}

fn parse_block_file_name(name: &str) -> Option<(u64, String)> {
    let (block, escaped) = name.split_once('_')?;
    Some((block.parse().ok()?, unescape(escaped)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn names_with_slashes_stay_in_the_root() {
        let store = BlockStore::new(PathBuf::from("/data"));

        assert_eq!(store.path("a/b%2F.txt", 3), PathBuf::from("/data/3_a%2Fb%252F.txt"));
        assert_eq!(
            parse_block_file_name("3_a%2Fb%252F.txt"),
            Some((3, "a/b%2F.txt".to_string()))
        );
        assert_eq!(parse_block_file_name("notes.txt"), None);
    }

    #[tokio::test]
    async fn list_and_remove() {
        // -- setup --
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path().to_path_buf());
        tokio::fs::write(store.path("x/y", 1), b"12345").await.unwrap();
        tokio::fs::write(store.path("x/y", 0), b"").await.unwrap();
        tokio::fs::write(dir.path().join("stray"), b"?").await.unwrap();

        // -- execute --
        let listed = store.list().await.unwrap();
        store.remove(&store.path("x/y", 1)).await.unwrap();
        store.remove(&store.path("x/y", 1)).await.unwrap();

        // -- verify --
        assert_eq!(
            listed,
            vec![
                LocalBlock {
                    file_name: "x/y".to_string(),
                    block_index: 0,
                    size: 0
                },
                LocalBlock {
                    file_name: "x/y".to_string(),
                    block_index: 1,
                    size: 5
                },
            ]
        );
        assert_eq!(store.block_size(&store.path("x/y", 1)).await.unwrap(), None);
        assert_eq!(store.block_size(&store.path("x/y", 0)).await.unwrap(), Some(0));
    }
}
