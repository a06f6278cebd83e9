use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::protocol::BlockMetadata;

/// One block stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DownloadedBlock {
    pub(crate) number: u32,
    pub(crate) path: PathBuf,
    pub(crate) metadata: BlockMetadata,
}

/// A contiguous run of blocks forming one image.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AssembledImage {
    pub(crate) first: u32,
    pub(crate) last: u32,
    /// Metadata of the first block.
    pub(crate) metadata: BlockMetadata,
    /// Part files in block order.
    pub(crate) parts: Vec<PathBuf>,
}

/// Orders downloaded blocks into complete images.
///
/// An image starts at the lowest block not yet emitted and ends at the first
/// block whose part marker closes the file. Nothing is emitted past a gap.
#[derive(Debug, Default)]
pub(crate) struct BlockAssembler {
    outstanding: BTreeSet<u32>,
    downloaded: BTreeMap<u32, DownloadedBlock>,
}

impl BlockAssembler {
    /// Records a block number as expected.
    pub(crate) fn expect(&mut self, number: u32) {
        self.outstanding.insert(number);
    }

    /// Adds a downloaded block and returns every image it completes.
    pub(crate) fn insert(&mut self, block: DownloadedBlock) -> Vec<AssembledImage> {
        if !self.outstanding.contains(&block.number) {
            return Vec::new();
        }
        self.downloaded.insert(block.number, block);

        let mut images = Vec::new();
        while let Some(image) = self.take_next_image() {
            images.push(image);
        }
        images
    }

    /// Block numbers that are downloaded but not yet part of an image.
    #[cfg(test)]
    pub(crate) fn held_blocks(&self) -> impl Iterator<Item = &DownloadedBlock> {
        self.downloaded.values()
    }

    fn take_next_image(&mut self) -> Option<AssembledImage> {
        let first = *self.outstanding.first()?;
        let mut last = first;
        loop {
            let block = self.downloaded.get(&last)?;
            if block.metadata.more_parts().ends_image() {
                break;
            }
            last = last.checked_add(1)?;
        }

        let mut blocks = Vec::new();
        for number in first..=last {
            self.outstanding.remove(&number);
            if let Some(block) = self.downloaded.remove(&number) {
                blocks.push(block);
            }
        }
        let metadata = blocks.first()?.metadata.clone();
        Some(AssembledImage {
            first,
            last,
            metadata,
            parts: blocks.into_iter().map(|block| block.path).collect(),
        })
    }
}
