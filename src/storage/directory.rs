use crate::membership::NodeId;
use crate::storage::block_table::{self, BlockTable, Cell, WriteRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A (block index, file name) pair hosted by some replica.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockRef {
    pub(crate) block: usize,
    pub(crate) file_name: String,
}

/// Where the blocks of one file live, as returned to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocations {
    pub file_size: u64,
    /// Row `i` lists the replicas that acknowledged block `i`.
    pub rows: Vec<Vec<NodeId>>,
    /// Replica slots still waiting for a write or delete to be acknowledged.
    pub pending_cells: usize,
}

/// A block that lost a replica, and the replicas that still hold it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Orphan {
    pub(crate) block: BlockRef,
    pub(crate) file_size: u64,
    pub(crate) holders: Vec<NodeId>,
}

/// Outcome of evicting a down replica from the directory.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Eviction {
    /// Blocks that still have a holder to copy from.
    pub(crate) orphans: Vec<Orphan>,
    /// Files whose last replica was the evicted node.
    pub(crate) lost_files: Vec<String>,
}

/// File name to block location table, the reverse index of what each replica hosts, and the
/// size of every file. `tables` is always locked before `hosted` or `file_sizes`.
pub(crate) struct BlockDirectory {
    block_size: u64,
    replication_factor: usize,
    tables: DashMap<String, BlockTable>,
    hosted: DashMap<NodeId, Vec<BlockRef>>,
    file_sizes: DashMap<String, u64>,
}

impl BlockDirectory {
    pub(crate) fn new(block_size: u64, replication_factor: usize) -> Self {
        BlockDirectory {
            block_size,
            replication_factor,
            tables: DashMap::new(),
            hosted: DashMap::new(),
            file_sizes: DashMap::new(),
        }
    }

    /// Record that `node` holds `block` of `file_name`. A full row normally drops the ack; if
    /// `is_gone` names a replica in that row, its cell is handed over instead.
    pub(crate) fn apply_write_ack<F>(
        &self,
        file_name: &str,
        block: usize,
        file_size: u64,
        node: &NodeId,
        is_gone: F,
    ) -> WriteRecord
    where
        F: Fn(&NodeId) -> bool,
    {
        let num_blocks = block_table::num_blocks(file_size, self.block_size);
        if num_blocks > block_table::MAX_BLOCKS_PER_FILE {
            return WriteRecord::Oversized;
        }
        let mut table = self
            .tables
            .entry(file_name.to_string())
            .or_insert_with(|| BlockTable::new(num_blocks as usize, self.replication_factor));

        let mut record = table.record_write(block, node);
        if record == WriteRecord::CapacityOverrun {
            let departed = table.holders(block).into_iter().find(|holder| is_gone(holder));
            if let Some(departed) = departed {
                table.release(block, &departed);
                self.unhost(&departed, block, file_name);
                record = table.record_write(block, node);
            }
        }
        if record == WriteRecord::Recorded {
            self.file_sizes.insert(file_name.to_string(), file_size);
            self.hosted.entry(node.clone()).or_default().push(BlockRef {
                block,
                file_name: file_name.to_string(),
            });
        }

        record
    }

    /// Record that `node` dropped `block` of `file_name`. Returns true when this removed the
    /// last replica and with it the whole entry.
    pub(crate) fn apply_delete_ack(&self, file_name: &str, block: usize, node: &NodeId) -> bool {
        let mut table = match self.tables.get_mut(file_name) {
            Some(table) => table,
            None => return false,
        };
        if table.record_delete(block, node) {
            self.unhost(node, block, file_name);
        }
        if !table.is_vacated() {
            return false;
        }
        drop(table);

        self.remove_if_vacated(file_name)
    }

    // Another ack may have landed since the caller looked; only remove a table that is still
    // vacated.
    fn remove_if_vacated(&self, file_name: &str) -> bool {
        let removed = self
            .tables
            .remove_if(file_name, |_, table| table.is_vacated())
            .is_some();
        if removed {
            self.file_sizes.remove(file_name);
        }
        removed
    }

    pub(crate) fn locate(&self, file_name: &str) -> Option<BlockLocations> {
        let table = self.tables.get(file_name)?;
        let file_size = self.file_sizes.get(file_name).map_or(0, |size| *size);

        Some(BlockLocations {
            file_size,
            rows: table.stripped(),
            pending_cells: table.pending_cells(),
        })
    }

    pub(crate) fn list_by_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn size_by_prefix(&self, prefix: &str) -> u64 {
        self.file_sizes
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| *entry.value())
            .sum()
    }

    pub(crate) fn hosted_by(&self, node: &NodeId) -> Vec<BlockRef> {
        self.hosted.get(node).map(|refs| refs.clone()).unwrap_or_default()
    }

    /// Forget `down` as a replica. Each of its cells becomes a write sentinel and the blocks it
    /// held are returned along with their surviving holders. A file left without any replica
    /// cannot be served or recovered, so its entry is dropped and reported as lost.
    pub(crate) fn evict(&self, down: &NodeId) -> Eviction {
        let mut eviction = Eviction::default();
        let refs = match self.hosted.remove(down) {
            Some((_, refs)) => refs,
            None => return eviction,
        };

        for block_ref in refs {
            let mut table = match self.tables.get_mut(&block_ref.file_name) {
                Some(table) => table,
                None => continue,
            };
            if !table.release(block_ref.block, down) {
                continue;
            }
            if table.is_vacated() {
                drop(table);
                if self.remove_if_vacated(&block_ref.file_name) {
                    eviction.lost_files.push(block_ref.file_name);
                }
                continue;
            }
            let holders = table.holders(block_ref.block);
            drop(table);

            let file_size = self.file_sizes.get(&block_ref.file_name).map_or(0, |size| *size);
            eviction.orphans.push(Orphan {
                block: block_ref,
                file_size,
                holders,
            });
        }

        let lost = &eviction.lost_files;
        eviction
            .orphans
            .retain(|orphan| !lost.contains(&orphan.block.file_name));
        eviction
    }

    fn unhost(&self, node: &NodeId, block: usize, file_name: &str) {
        if let Entry::Occupied(mut entry) = self.hosted.entry(node.clone()) {
            entry
                .get_mut()
                .retain(|r| !(r.block == block && r.file_name == file_name));
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cells(&self, file_name: &str, block: usize) -> Option<Vec<Cell>> {
        self.tables
            .get(file_name)
            .and_then(|table| table.row(block).map(<[Cell]>::to_vec))
    }
}
