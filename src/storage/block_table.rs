use crate::membership::NodeId;
use serde::{Deserialize, Serialize};

/// One replica slot of one block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Cell {
    Replica(NodeId),
    PendingWrite,
    PendingDelete,
}

impl Cell {
    fn is_sentinel(&self) -> bool {
        !matches!(self, Cell::Replica(_))
    }

    fn holds(&self, node: &NodeId) -> bool {
        matches!(self, Cell::Replica(id) if id == node)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteRecord {
    Recorded,
    AlreadyPresent,
    CapacityOverrun,
    OutOfRange,
    /// The advertised file size needs more than `MAX_BLOCKS_PER_FILE` blocks.
    Oversized,
}

/// Largest block count the directory will allocate a table for.
pub(crate) const MAX_BLOCKS_PER_FILE: u64 = 1 << 20;

/// Blocks needed to hold `file_size` bytes. An empty file still gets one (empty) block.
pub(crate) fn num_blocks(file_size: u64, block_size: u64) -> u64 {
    let blocks = file_size / block_size + u64::from(file_size % block_size != 0);
    blocks.max(1)
}

/// Block location table of one file: a row per block, a cell per replica slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BlockTable {
    rows: Vec<Vec<Cell>>,
}

impl BlockTable {
    pub(crate) fn new(num_blocks: usize, replication_factor: usize) -> Self {
        BlockTable {
            rows: vec![vec![Cell::PendingWrite; replication_factor]; num_blocks],
        }
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.rows.len()
    }

    /// Put `node` into the first sentinel cell of `block`.
    pub(crate) fn record_write(&mut self, block: usize, node: &NodeId) -> WriteRecord {
        let row = match self.rows.get_mut(block) {
            Some(row) => row,
            None => return WriteRecord::OutOfRange,
        };
        if row.iter().any(|cell| cell.holds(node)) {
            return WriteRecord::AlreadyPresent;
        }
        match row.iter_mut().find(|cell| cell.is_sentinel()) {
            Some(cell) => {
                *cell = Cell::Replica(node.clone());
                WriteRecord::Recorded
            }
            None => WriteRecord::CapacityOverrun,
        }
    }

    /// Turn `node`'s cell in `block` into a delete sentinel. Returns whether it held one.
    pub(crate) fn record_delete(&mut self, block: usize, node: &NodeId) -> bool {
        self.replace(block, node, Cell::PendingDelete)
    }

    /// Turn `node`'s cell in `block` back into a write sentinel. Returns whether it held one.
    pub(crate) fn release(&mut self, block: usize, node: &NodeId) -> bool {
        self.replace(block, node, Cell::PendingWrite)
    }

    fn replace(&mut self, block: usize, node: &NodeId, with: Cell) -> bool {
        match self.rows.get_mut(block).and_then(|row| row.iter_mut().find(|c| c.holds(node))) {
            Some(cell) => {
                *cell = with;
                true
            }
            None => false,
        }
    }

    /// No replica holds any block of this file any more.
    pub(crate) fn is_vacated(&self) -> bool {
        self.rows.iter().flatten().all(Cell::is_sentinel)
    }

    pub(crate) fn holders(&self, block: usize) -> Vec<NodeId> {
        self.rows
            .get(block)
            .map(|row| {
                row.iter()
                    .filter_map(|cell| match cell {
                        Cell::Replica(id) => Some(id.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The table as a client sees it: replicas only, sentinels stripped.
    pub(crate) fn stripped(&self) -> Vec<Vec<NodeId>> {
        (0..self.rows.len()).map(|block| self.holders(block)).collect()
    }

    pub(crate) fn pending_cells(&self) -> usize {
        self.rows.iter().flatten().filter(|cell| cell.is_sentinel()).count()
    }

    pub(crate) fn row(&self, block: usize) -> Option<&[Cell]> {
        self.rows.get(block).map(Vec::as_slice)
    }
}
