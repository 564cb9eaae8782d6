//! In-memory fakes for the installer's collaborators
//!
//! All fakes can share one [`Journal`] so tests can assert the order in which
//! storage, flash and restart operations happened.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::rc::Rc;

use crate::error::{PartitionError, StorageError};
use crate::partition::{FlashPartition, PartitionTable};
use crate::restart::Restart;
use crate::storage::{RemovableStorage, UpdateImage};

/// `ESP_FAIL`
pub const ERR_FAIL: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin { label: String, size: u64 },
    Write { offset: u64, len: usize },
    Finalize,
    Abort,
    Commit { label: String },
    Remove { path: String },
    Rename { from: String, to: String },
    Restart,
}

/// Shared, ordered record of collaborator calls
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<Event>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.0.borrow().iter().filter(|e| pred(e)).count()
    }

    /// Events with consecutive writes collapsed into one, for order checks
    pub fn milestones(&self) -> Vec<Event> {
        let mut out: Vec<Event> = Vec::new();
        for event in self.0.borrow().iter() {
            if let (Event::Write { .. }, Some(Event::Write { .. })) = (event, out.last()) {
                continue;
            }
            out.push(event.clone());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFault {
    /// Reader returns `Ok(0)` although bytes remain
    ShortRead,
    /// Reader returns an I/O error
    Io,
}

/// Removable storage held in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: BTreeMap<String, Vec<u8>>,
    read_fault: Option<(u64, ReadFault)>,
    fail_open: bool,
    fail_rename: bool,
    fail_remove: bool,
    mutations: usize,
    journal: Journal,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }

    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Readers stop delivering data once they reach `offset`
    pub fn fail_reads_at(&mut self, offset: u64, fault: ReadFault) {
        self.read_fault = Some((offset, fault));
    }

    pub fn fail_opens(&mut self) {
        self.fail_open = true;
    }

    pub fn fail_renames(&mut self) {
        self.fail_rename = true;
    }

    pub fn fail_removes(&mut self) {
        self.fail_remove = true;
    }

    /// Number of successful renames and removes
    pub fn mutations(&self) -> usize {
        self.mutations
    }
}

impl RemovableStorage for MemoryStorage {
    type Reader = MemoryReader;

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn open_read(&self, path: &str) -> Result<UpdateImage<MemoryReader>, StorageError> {
        let not_found = || io::Error::new(io::ErrorKind::NotFound, "no such file");
        if self.fail_open {
            return Err(StorageError::new(
                "open",
                path,
                io::Error::new(io::ErrorKind::PermissionDenied, "open refused"),
            ));
        }
        let data = self
            .files
            .get(path)
            .ok_or_else(|| StorageError::new("open", path, not_found()))?;

        Ok(UpdateImage {
            path: path.to_string(),
            len: data.len() as u64,
            reader: MemoryReader {
                data: data.clone(),
                pos: 0,
                fault: self.read_fault,
            },
        })
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        if self.fail_rename {
            return Err(StorageError::new(
                "rename",
                from,
                io::Error::new(io::ErrorKind::Other, "rename refused"),
            ));
        }
        if self.files.contains_key(to) {
            return Err(StorageError::new(
                "rename",
                from,
                io::Error::new(io::ErrorKind::AlreadyExists, "target exists"),
            ));
        }
        let data = self.files.remove(from).ok_or_else(|| {
            StorageError::new("rename", from, io::Error::new(io::ErrorKind::NotFound, "no such file"))
        })?;
        self.files.insert(to.to_string(), data);
        self.mutations += 1;
        self.journal.push(Event::Rename {
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        if self.fail_remove {
            return Err(StorageError::new(
                "remove",
                path,
                io::Error::new(io::ErrorKind::Other, "remove refused"),
            ));
        }
        self.files.remove(path).ok_or_else(|| {
            StorageError::new("remove", path, io::Error::new(io::ErrorKind::NotFound, "no such file"))
        })?;
        self.mutations += 1;
        self.journal.push(Event::Remove {
            path: path.to_string(),
        });
        Ok(())
    }
}

pub struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
    fault: Option<(u64, ReadFault)>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut end = self.data.len();
        if let Some((offset, fault)) = self.fault {
            let offset = offset as usize;
            if self.pos >= offset {
                return match fault {
                    ReadFault::ShortRead => Ok(0),
                    ReadFault::Io => Err(io::Error::new(io::ErrorKind::Other, "card read failed")),
                };
            }
            end = end.min(offset);
        }

        let n = buf.len().min(end - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Debug)]
pub struct FakeTransaction {
    index: usize,
    written: u64,
}

/// Two-bank partition table with `ota_0` running
#[derive(Debug)]
pub struct FakePartitionTable {
    partitions: Vec<FlashPartition>,
    flash: Vec<Vec<u8>>,
    running: usize,
    boot: usize,
    no_update_partition: bool,
    update_is_running: bool,
    write_fault_at: Option<u64>,
    fail_begin: bool,
    fail_finalize: bool,
    fail_commit: bool,
    journal: Journal,
}

impl FakePartitionTable {
    pub fn new(capacity: u32) -> Self {
        let base = 0x10000;
        Self {
            partitions: vec![
                FlashPartition::new("ota_0", base, capacity),
                FlashPartition::new("ota_1", base + capacity, capacity),
            ],
            flash: vec![Vec::new(), Vec::new()],
            running: 0,
            boot: 0,
            no_update_partition: false,
            update_is_running: false,
            write_fault_at: None,
            fail_begin: false,
            fail_finalize: false,
            fail_commit: false,
            journal: Journal::new(),
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn without_update_partition(&mut self) {
        self.no_update_partition = true;
    }

    /// Selection hands back the running partition
    pub fn select_running(&mut self) {
        self.update_is_running = true;
    }

    /// Any write extending past `offset` fails
    pub fn fail_writes_after(&mut self, offset: u64) {
        self.write_fault_at = Some(offset);
    }

    pub fn fail_begin(&mut self) {
        self.fail_begin = true;
    }

    pub fn fail_finalize(&mut self) {
        self.fail_finalize = true;
    }

    pub fn fail_commit(&mut self) {
        self.fail_commit = true;
    }

    pub fn calls(&self) -> Vec<Event> {
        self.journal.events()
    }

    pub fn begins(&self) -> usize {
        self.journal.count(|e| matches!(e, Event::Begin { .. }))
    }

    pub fn aborts(&self) -> usize {
        self.journal.count(|e| matches!(e, Event::Abort))
    }

    pub fn finalizes(&self) -> usize {
        self.journal.count(|e| matches!(e, Event::Finalize))
    }

    pub fn commits(&self) -> usize {
        self.journal.count(|e| matches!(e, Event::Commit { .. }))
    }

    /// Bytes physically written to the update partition
    pub fn written_bytes(&self) -> u64 {
        self.flash[self.update_index()].len() as u64
    }

    pub fn flash_contents(&self, label: &str) -> Option<&[u8]> {
        self.partitions
            .iter()
            .position(|p| p.label == label)
            .map(|i| self.flash[i].as_slice())
    }

    pub fn boot_partition(&self) -> &FlashPartition {
        &self.partitions[self.boot]
    }

    fn update_index(&self) -> usize {
        if self.update_is_running {
            self.running
        } else {
            1 - self.running
        }
    }

    fn index_of(&self, partition: &FlashPartition) -> Option<usize> {
        self.partitions.iter().position(|p| p == partition)
    }
}

impl PartitionTable for FakePartitionTable {
    type Transaction = FakeTransaction;

    fn running_partition(&self) -> Option<FlashPartition> {
        Some(self.partitions[self.running].clone())
    }

    fn next_update_partition(&self) -> Option<FlashPartition> {
        if self.no_update_partition {
            return None;
        }
        Some(self.partitions[self.update_index()].clone())
    }

    fn begin_write(
        &mut self,
        partition: &FlashPartition,
        size: u64,
    ) -> Result<FakeTransaction, PartitionError> {
        self.journal.push(Event::Begin {
            label: partition.label.clone(),
            size,
        });
        if self.fail_begin {
            return Err(PartitionError::new(ERR_FAIL, "ESP_FAIL"));
        }
        let index = self
            .index_of(partition)
            .ok_or_else(|| PartitionError::new(0x105, "ESP_ERR_NOT_FOUND"))?;
        self.flash[index].clear();
        Ok(FakeTransaction { index, written: 0 })
    }

    fn write(&mut self, tx: &mut FakeTransaction, data: &[u8]) -> Result<(), PartitionError> {
        let end = tx.written + data.len() as u64;
        if matches!(self.write_fault_at, Some(limit) if end > limit) {
            return Err(PartitionError::new(0x1503, "ESP_ERR_FLASH_OP_FAIL"));
        }
        self.journal.push(Event::Write {
            offset: tx.written,
            len: data.len(),
        });
        self.flash[tx.index].extend_from_slice(data);
        tx.written = end;
        Ok(())
    }

    fn finalize(&mut self, _tx: FakeTransaction) -> Result<(), PartitionError> {
        self.journal.push(Event::Finalize);
        if self.fail_finalize {
            return Err(PartitionError::new(0x1503, "ESP_ERR_OTA_VALIDATE_FAILED"));
        }
        Ok(())
    }

    fn abort(&mut self, _tx: FakeTransaction) {
        self.journal.push(Event::Abort);
    }

    fn commit_boot_target(&mut self, partition: &FlashPartition) -> Result<(), PartitionError> {
        self.journal.push(Event::Commit {
            label: partition.label.clone(),
        });
        if self.fail_commit {
            return Err(PartitionError::new(ERR_FAIL, "ESP_FAIL"));
        }
        self.boot = self
            .index_of(partition)
            .ok_or_else(|| PartitionError::new(0x105, "ESP_ERR_NOT_FOUND"))?;
        Ok(())
    }
}

/// Restart that records the request and returns
#[derive(Debug, Default)]
pub struct RecordingRestart {
    requests: usize,
    journal: Journal,
}

impl RecordingRestart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn requests(&self) -> usize {
        self.requests
    }
}

impl Restart for RecordingRestart {
    fn restart(&mut self) {
        self.requests += 1;
        self.journal.push(Event::Restart);
    }
}
