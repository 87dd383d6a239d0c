use super::error::{HeaderError, HeaderResult};
use serde::{Deserialize, Serialize};

/// Block geometry of a journal, recorded in the header envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalParameters {
    /// Pages whose per-page headers are grouped into one set.
    pub pages_per_set: u32,
    /// Blocks in one page.
    pub blocks_per_page: u32,
    /// Size of one block in bytes.
    pub block_size: u32,
    /// Free blocks below which a page stops taking new records.
    pub free_block_threshold: u32,
}

impl JournalParameters {
    pub fn validate(&self) -> HeaderResult<()> {
        if self.pages_per_set == 0 {
            return Err(HeaderError::InvalidParameters(
                "pages_per_set must be non-zero".to_string(),
            ));
        }
        if self.blocks_per_page == 0 || self.block_size == 0 {
            return Err(HeaderError::InvalidParameters(format!(
                "empty page geometry: {} blocks of {} bytes",
                self.blocks_per_page, self.block_size
            )));
        }
        if self.free_block_threshold > self.blocks_per_page {
            return Err(HeaderError::InvalidParameters(format!(
                "free_block_threshold {} exceeds blocks_per_page {}",
                self.free_block_threshold, self.blocks_per_page
            )));
        }
        Ok(())
    }

    /// Bytes of record data one page holds.
    pub fn page_data_size(&self) -> u32 {
        self.blocks_per_page * self.block_size
    }
}

impl Default for JournalParameters {
    fn default() -> Self {
        JournalParameters {
            pages_per_set: 256,
            blocks_per_page: 64,
            block_size: 128,
            free_block_threshold: 2,
        }
    }
}
