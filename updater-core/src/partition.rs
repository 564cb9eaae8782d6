//! Dual-bank partition table abstraction
//!
//! On the device this is backed by the ESP-IDF OTA API. A write goes through
//! a [`WriteSession`], which owns the open transaction and aborts it when
//! dropped before [`WriteSession::finish`] runs, so no error path can leave a
//! half-open transaction behind.

use crate::error::PartitionError;

/// `ESP_ERR_INVALID_SIZE`
pub const ERR_INVALID_SIZE: i32 = 0x104;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPartition {
    pub label: String,
    /// Base offset in flash
    pub address: u32,
    /// Capacity in bytes
    pub size: u32,
}

impl FlashPartition {
    pub fn new(label: impl Into<String>, address: u32, size: u32) -> Self {
        Self {
            label: label.into(),
            address,
            size,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.size as u64
    }
}

impl std::fmt::Display for FlashPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (offset 0x{:x}, size {})", self.label, self.address, self.size)
    }
}

pub trait PartitionTable {
    /// Open flash write transaction, `esp_ota_handle_t` on the device
    type Transaction;

    fn running_partition(&self) -> Option<FlashPartition>;

    fn next_update_partition(&self) -> Option<FlashPartition>;

    fn begin_write(
        &mut self,
        partition: &FlashPartition,
        size: u64,
    ) -> Result<Self::Transaction, PartitionError>;

    fn write(&mut self, tx: &mut Self::Transaction, data: &[u8]) -> Result<(), PartitionError>;

    /// Ends the transaction and validates the written image
    fn finalize(&mut self, tx: Self::Transaction) -> Result<(), PartitionError>;

    fn abort(&mut self, tx: Self::Transaction);

    fn commit_boot_target(&mut self, partition: &FlashPartition) -> Result<(), PartitionError>;
}

/// One flash write attempt against a selected partition
pub struct WriteSession<'a, P: PartitionTable> {
    table: &'a mut P,
    tx: Option<P::Transaction>,
    partition: FlashPartition,
    expected: u64,
    written: u64,
}

impl<'a, P: PartitionTable> WriteSession<'a, P> {
    pub fn begin(
        table: &'a mut P,
        partition: FlashPartition,
        expected: u64,
    ) -> Result<Self, PartitionError> {
        if expected > partition.capacity() {
            return Err(PartitionError::new(ERR_INVALID_SIZE, "ESP_ERR_INVALID_SIZE"));
        }
        let tx = table.begin_write(&partition, expected)?;

        Ok(Self {
            table,
            tx: Some(tx),
            partition,
            expected,
            written: 0,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), PartitionError> {
        let end = self.written + data.len() as u64;
        if end > self.expected || end > self.partition.capacity() {
            return Err(PartitionError::new(ERR_INVALID_SIZE, "ESP_ERR_INVALID_SIZE"));
        }

        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| PartitionError::new(ERR_INVALID_SIZE, "transaction closed"))?;
        self.table.write(tx, data)?;
        self.written = end;
        Ok(())
    }

    /// Finalize the transaction, returning the number of bytes written
    pub fn finish(mut self) -> Result<u64, PartitionError> {
        match self.tx.take() {
            Some(tx) => {
                self.table.finalize(tx)?;
                Ok(self.written)
            }
            None => Err(PartitionError::new(ERR_INVALID_SIZE, "transaction closed")),
        }
    }

    pub fn abort(mut self) {
        self.abort_in_place();
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    fn abort_in_place(&mut self) {
        if let Some(tx) = self.tx.take() {
            log::warn!(
                "Aborting write to {} after {} / {} bytes",
                self.partition.label,
                self.written,
                self.expected
            );
            self.table.abort(tx);
        }
    }
}

impl<P: PartitionTable> Drop for WriteSession<'_, P> {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}
