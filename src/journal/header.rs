//! In-memory controller of the double-buffered journal header.
//!
//! One state slot is always the working copy that callers mutate; the other
//! holds the last committed state. [`JournalHeader::commit_active_state`]
//! publishes the working copy and [`JournalHeader::rollback`] throws it away.
//! Nothing here is synchronized: callers serialize commits, rollbacks and
//! readers themselves.

use super::error::{HeaderError, HeaderResult};
use super::layout::{
    self, Envelope, HeaderState, ListDescriptor, Seal, FORMAT_VERSION, USER_DATA_OFFSET,
};
use super::params::JournalParameters;
use log::{debug, warn};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of [`JournalHeader::recover_transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Recovered {
        committed_slot: usize,
        committed_transaction_id: u64,
    },
    /// Neither slot carries a valid committed seal.
    NoValidState,
}

#[derive(Debug, Clone)]
pub struct JournalHeader {
    envelope: Envelope,
    user_data: Vec<u8>,
    states: [HeaderState; 2],
    active: usize,
    current_transaction_id: u64,
    last_committed_transaction_id: u64,
    /// Whether the committed slot has been written since the last commit.
    committed_persisted: bool,
}

impl JournalHeader {
    /// Smallest header size that fits the fixed layout plus `user_data_size`
    /// bytes, rounded up to `alignment`.
    pub fn required_header_size(user_data_size: u32, alignment: u32) -> usize {
        let raw = USER_DATA_OFFSET + user_data_size as usize;
        let alignment = alignment.max(1) as usize;
        raw.div_ceil(alignment) * alignment
    }

    /// Lays out a fresh header. Both slots start empty with slot 0 active.
    pub fn init(
        header_size: u32,
        page_header_size: u32,
        page_data_size: u32,
        alignment: u32,
        user_data_size: u32,
        params: &JournalParameters,
    ) -> HeaderResult<Self> {
        params.validate()?;
        if alignment == 0 {
            return Err(HeaderError::InvalidParameters(
                "alignment must be non-zero".to_string(),
            ));
        }
        let required = Self::required_header_size(user_data_size, alignment);
        if (header_size as usize) < required {
            return Err(HeaderError::HeaderTooSmall {
                header_size,
                required,
            });
        }

        let envelope = Envelope {
            version: FORMAT_VERSION,
            header_size,
            pages_per_set: params.pages_per_set,
            blocks_per_page: params.blocks_per_page,
            block_size: params.block_size,
            free_block_threshold: params.free_block_threshold,
            page_header_size,
            page_data_size,
            alignment,
            creation_time: unix_now(),
            user_data_size,
        };
        debug!(
            "initialized journal header: {} bytes, {} pages per set",
            header_size, params.pages_per_set
        );

        Ok(Self {
            envelope,
            user_data: vec![0; user_data_size as usize],
            states: [HeaderState::default(); 2],
            active: 0,
            current_transaction_id: 1,
            last_committed_transaction_id: 0,
            committed_persisted: false,
        })
    }

    /// Loads a persisted header and recovers its last committed state.
    pub fn open(buf: &[u8]) -> HeaderResult<Self> {
        let envelope = layout::decode_envelope(buf)?;
        validate_envelope(&envelope)?;
        let required = Self::required_header_size(envelope.user_data_size, 1);
        if (envelope.header_size as usize) < required {
            return Err(HeaderError::HeaderTooSmall {
                header_size: envelope.header_size,
                required,
            });
        }
        layout::check_len(buf, required)?;

        let mut header = Self {
            user_data: buf[layout::user_data_range(envelope.user_data_size)].to_vec(),
            envelope,
            states: [HeaderState::default(); 2],
            active: 0,
            current_transaction_id: 1,
            last_committed_transaction_id: 0,
            committed_persisted: false,
        };
        match header.recover_transaction(buf)? {
            RecoveryStatus::Recovered { .. } => Ok(header),
            RecoveryStatus::NoValidState => Err(HeaderError::NoCommittedState),
        }
    }

    /// Picks the last fully committed slot of a persisted header and makes
    /// the other slot the working copy.
    ///
    /// A slot counts only if its committed seal verifies; among those the
    /// highest committed transaction id wins, and slot 0 wins a tie. Recovery
    /// never writes to `buf`, so running it again yields the same answer.
    pub fn recover_transaction(&mut self, buf: &[u8]) -> HeaderResult<RecoveryStatus> {
        layout::check_len(buf, USER_DATA_OFFSET)?;

        // Keep the sealed slot with the highest transaction id
        let mut best: Option<(usize, HeaderState)> = None;
        for slot in 0..2 {
            let (state, sealed) = layout::decode_state(&buf[layout::state_range(slot)])?;
            if !sealed {
                debug!("header slot {} is not sealed", slot);
                continue;
            }
            let newer = best.as_ref().map_or(true, |(_, current)| {
                state.committed_transaction_id > current.committed_transaction_id
            });
            if newer {
                best = Some((slot, state));
            }
        }

        let Some((committed_slot, state)) = best else {
            warn!("no committed header state found");
            return Ok(RecoveryStatus::NoValidState);
        };

        // Both copies restart from the commit; the other slot becomes working
        self.states = [state; 2];
        self.active = 1 - committed_slot;
        self.committed_persisted = true;
        self.last_committed_transaction_id = state.committed_transaction_id;
        self.current_transaction_id = state.committed_transaction_id + 1;
        debug!(
            "recovered transaction {} from header slot {}",
            state.committed_transaction_id, committed_slot
        );

        Ok(RecoveryStatus::Recovered {
            committed_slot,
            committed_transaction_id: state.committed_transaction_id,
        })
    }

    /// Publishes the working slot as the new committed state and continues
    /// with a fresh working copy of it.
    pub fn commit_active_state(&mut self) {
        let id = self.current_transaction_id;
        self.states[self.active].committed_transaction_id = id;
        self.states[1 - self.active] = self.states[self.active];
        self.active = 1 - self.active;
        self.last_committed_transaction_id = id;
        self.current_transaction_id += 1;
        self.committed_persisted = false;
        debug!("committed transaction {} (slot {} now active)", id, self.active);
    }

    /// Discards every change made to the working slot since the last commit.
    pub fn rollback(&mut self) {
        self.states[self.active] = self.states[1 - self.active];
        debug!(
            "rolled back transaction {} to {}",
            self.current_transaction_id, self.last_committed_transaction_id
        );
        self.current_transaction_id += 1;
    }

    /// Persists the whole header. The committed slot is written before the
    /// working slot.
    pub fn write_to(&mut self, buf: &mut [u8]) -> HeaderResult<()> {
        layout::check_len(buf, USER_DATA_OFFSET + self.user_data.len())?;
        layout::encode_envelope(&self.envelope, buf)?;
        self.write_committed_state(buf)?;
        self.write_working_state(buf)?;

        buf[layout::user_data_range(self.envelope.user_data_size)].copy_from_slice(&self.user_data);
        Ok(())
    }

    /// Persists the working slot.
    ///
    /// After a commit the working slot sits where the previous commit was
    /// written, so the new committed slot goes out first unless a
    /// [`write_to`](Self::write_to) already wrote it. All writes are assumed
    /// to target the same persisted copy.
    pub fn write_active_state(&mut self, buf: &mut [u8]) -> HeaderResult<()> {
        layout::check_len(buf, USER_DATA_OFFSET)?;
        if !self.committed_persisted {
            debug!(
                "writing committed slot {} ahead of the working slot",
                self.committed_index()
            );
            self.write_committed_state(buf)?;
        }
        self.write_working_state(buf)
    }

    fn write_committed_state(&mut self, buf: &mut [u8]) -> HeaderResult<()> {
        let committed = self.committed_index();
        layout::encode_state(
            &self.states[committed],
            Seal::Committed,
            &mut buf[layout::state_range(committed)],
        )?;
        self.committed_persisted = true;
        Ok(())
    }

    fn write_working_state(&self, buf: &mut [u8]) -> HeaderResult<()> {
        layout::encode_state(
            &self.states[self.active],
            Seal::Working,
            &mut buf[layout::state_range(self.active)],
        )
    }

    /// Total file size for `num_pages` pages: the header, two copies of the
    /// page header region per set, and the page data.
    pub fn calculate_file_size(&self, num_pages: u32) -> u64 {
        let envelope = &self.envelope;
        let pages_per_set = envelope.pages_per_set as u64;
        let sets = (num_pages as u64).div_ceil(pages_per_set);
        envelope.header_size as u64
            + sets * envelope.page_header_size as u64 * pages_per_set * 2
            + num_pages as u64 * envelope.page_data_size as u64
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn header_size(&self) -> u32 {
        self.envelope.header_size
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    fn committed_index(&self) -> usize {
        1 - self.active
    }

    pub fn current_transaction_id(&self) -> u64 {
        self.current_transaction_id
    }

    pub fn last_committed_transaction_id(&self) -> u64 {
        self.last_committed_transaction_id
    }

    pub fn active_state(&self) -> &HeaderState {
        &self.states[self.active]
    }

    pub fn active_state_mut(&mut self) -> &mut HeaderState {
        &mut self.states[self.active]
    }

    pub fn committed_state(&self) -> &HeaderState {
        &self.states[self.committed_index()]
    }

    pub fn num_pages(&self) -> u32 {
        self.active_state().num_pages
    }

    pub fn set_num_pages(&mut self, num_pages: u32) {
        self.active_state_mut().num_pages = num_pages;
    }

    pub fn modification_time(&self) -> i64 {
        self.active_state().modification_time
    }

    pub fn set_modification_time(&mut self, time: i64) {
        self.active_state_mut().modification_time = time;
    }

    pub fn fill_pages(&self) -> &ListDescriptor {
        &self.active_state().fill_pages
    }

    pub fn fill_pages_mut(&mut self) -> &mut ListDescriptor {
        &mut self.active_state_mut().fill_pages
    }

    pub fn pre_fill_pages(&self) -> &ListDescriptor {
        &self.active_state().pre_fill_pages
    }

    pub fn pre_fill_pages_mut(&mut self) -> &mut ListDescriptor {
        &mut self.active_state_mut().pre_fill_pages
    }

    pub fn confirmed_records(&self) -> &ListDescriptor {
        &self.active_state().confirmed_records
    }

    pub fn confirmed_records_mut(&mut self) -> &mut ListDescriptor {
        &mut self.active_state_mut().confirmed_records
    }

    pub fn unconfirmed_records(&self) -> &ListDescriptor {
        &self.active_state().unconfirmed_records
    }

    pub fn unconfirmed_records_mut(&mut self) -> &mut ListDescriptor {
        &mut self.active_state_mut().unconfirmed_records
    }

    pub fn user_data(&self) -> &[u8] {
        &self.user_data
    }

    pub fn user_data_mut(&mut self) -> &mut [u8] {
        &mut self.user_data
    }
}

/// Rejects persisted geometry that the header could never have been
/// initialized with.
fn validate_envelope(envelope: &Envelope) -> HeaderResult<()> {
    JournalParameters {
        pages_per_set: envelope.pages_per_set,
        blocks_per_page: envelope.blocks_per_page,
        block_size: envelope.block_size,
        free_block_threshold: envelope.free_block_threshold,
    }
    .validate()?;
    if envelope.alignment == 0 {
        return Err(HeaderError::InvalidParameters(
            "alignment must be non-zero".to_string(),
        ));
    }
    Ok(())
}

/// Seconds since the Unix epoch, or zero if the clock is before it.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
