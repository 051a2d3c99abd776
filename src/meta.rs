//! The metadata page (page 0): magic, version, page accounting, free-list head,
//! tree root and the committed transaction counter. Packed and unpacked by
//! hand at fixed byte offsets.

use crate::config::{PageId, PAGE_SIZE};

pub const METADATA_SIZE: usize = 4 + 4 + 4 + 4 + 4 + 4 + 8;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_PAGE_COUNT: usize = 12;
const OFF_FREE_LIST_HEAD: usize = 16;
const OFF_ROOT_PAGE: usize = 20;
const OFF_TX_ID: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub free_list_head: PageId,
    pub root_page: PageId,
    pub tx_id: u64,
}

impl Metadata {
    pub fn fresh(page_count: u32) -> Self {
        Metadata {
            magic: crate::config::MAGIC,
            version: crate::config::VERSION,
            page_size: PAGE_SIZE as u32,
            page_count,
            free_list_head: 0,
            root_page: 0,
            tx_id: 0,
        }
    }

    pub fn write_into(&self, page: &mut [u8]) {
        debug_assert!(page.len() >= METADATA_SIZE);
        page[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic.to_le_bytes());
        page[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        page[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_le_bytes());
        page[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].copy_from_slice(&self.page_count.to_le_bytes());
        page[OFF_FREE_LIST_HEAD..OFF_FREE_LIST_HEAD + 4]
            .copy_from_slice(&self.free_list_head.to_le_bytes());
        page[OFF_ROOT_PAGE..OFF_ROOT_PAGE + 4].copy_from_slice(&self.root_page.to_le_bytes());
        page[OFF_TX_ID..OFF_TX_ID + 8].copy_from_slice(&self.tx_id.to_le_bytes());
    }

    pub fn read_from(page: &[u8]) -> Self {
        debug_assert!(page.len() >= METADATA_SIZE);
        Metadata {
            magic: u32::from_le_bytes(page[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap()),
            version: u32::from_le_bytes(page[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap()),
            page_size: u32::from_le_bytes(
                page[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].try_into().unwrap(),
            ),
            page_count: u32::from_le_bytes(
                page[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].try_into().unwrap(),
            ),
            free_list_head: u32::from_le_bytes(
                page[OFF_FREE_LIST_HEAD..OFF_FREE_LIST_HEAD + 4]
                    .try_into()
                    .unwrap(),
            ),
            root_page: u32::from_le_bytes(
                page[OFF_ROOT_PAGE..OFF_ROOT_PAGE + 4].try_into().unwrap(),
            ),
            tx_id: u64::from_le_bytes(page[OFF_TX_ID..OFF_TX_ID + 8].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let meta = Metadata {
            magic: crate::config::MAGIC,
            version: 1,
            page_size: 4096,
            page_count: 16,
            free_list_head: 7,
            root_page: 3,
            tx_id: 42,
        };
        let mut buf = [0u8; PAGE_SIZE];
        meta.write_into(&mut buf);
        assert_eq!(Metadata::read_from(&buf), meta);
    }
}
