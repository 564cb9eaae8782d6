//! SD card firmware installer
//!
//! Streams a staged image from removable storage into the next OTA
//! partition, switches the boot partition, marks the image as consumed and
//! restarts. Every step gates the next one; any failure before the boot
//! partition is switched leaves the staged image in place for a later boot
//! to retry.

use std::error::Error as StdError;
use std::io::{self, Read};

use crate::config::InstallerConfig;
use crate::error::InstallError;
use crate::marker;
use crate::partition::{FlashPartition, PartitionTable, WriteSession};
use crate::restart::Restart;
use crate::storage::{RemovableStorage, UpdateImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Idle,
    Scanning,
    NoUpdate,
    OpenSource,
    SelectPartition,
    SizeCheck,
    BeginWrite,
    Streaming { progress: u8 },
    Finalize,
    Commit,
    MarkComplete,
    Restart,
    Failed,
}

impl InstallStage {
    pub fn description(&self) -> &'static str {
        match self {
            InstallStage::Idle => "Idle",
            InstallStage::Scanning => "Checking SD card",
            InstallStage::NoUpdate => "No update",
            InstallStage::OpenSource => "Opening image",
            InstallStage::SelectPartition => "Selecting partition",
            InstallStage::SizeCheck => "Checking size",
            InstallStage::BeginWrite => "Preparing flash",
            InstallStage::Streaming { .. } => "Writing firmware",
            InstallStage::Finalize => "Validating image",
            InstallStage::Commit => "Setting boot partition",
            InstallStage::MarkComplete => "Marking image done",
            InstallStage::Restart => "Restarting",
            InstallStage::Failed => "Update failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub written: u64,
    pub total: u64,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.written.min(self.total) * 100) / self.total) as u8
    }
}

/// Outcome of a run that reached the restart request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub partition: FlashPartition,
    pub bytes_written: u64,
    /// False when the image could not be renamed and will be seen again
    pub marker_written: bool,
}

type ProgressFn = Box<dyn FnMut(Progress)>;

pub struct Installer<S, P, R> {
    config: InstallerConfig,
    storage: S,
    partitions: P,
    restart: R,
    stage: InstallStage,
    on_progress: Option<ProgressFn>,
}

impl<S, P, R> Installer<S, P, R>
where
    S: RemovableStorage,
    P: PartitionTable,
    R: Restart,
{
    pub fn new(
        config: InstallerConfig,
        storage: S,
        partitions: P,
        restart: R,
    ) -> Result<Self, InstallError> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            partitions,
            restart,
            stage: InstallStage::Idle,
            on_progress: None,
        })
    }

    /// Receive progress alongside the progress log lines
    pub fn on_progress(mut self, f: impl FnMut(Progress) + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn has_update(&self) -> bool {
        self.storage.exists(&self.config.firmware_path)
    }

    /// Install the staged image. Returns false on any failure; on the device
    /// a successful install restarts and never returns.
    pub fn install_update(&mut self) -> bool {
        self.install().is_ok()
    }

    pub fn install(&mut self) -> Result<InstallReport, InstallError> {
        let result = self.run();
        if let Err(e) = &result {
            if e.is_not_found() {
                self.stage = InstallStage::NoUpdate;
                log::debug!("No {} found on SD card", self.config.firmware_path);
            } else {
                self.stage = InstallStage::Failed;
                log::error!("SD card update failed: {}", error_chain(e));
            }
        }
        result
    }

    pub fn stage(&self) -> InstallStage {
        self.stage
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn partitions(&self) -> &P {
        &self.partitions
    }

    pub fn restart_handle(&self) -> &R {
        &self.restart
    }

    fn set_stage(&mut self, stage: InstallStage) {
        log::debug!("Install stage: {}", stage.description());
        self.stage = stage;
    }

    fn run(&mut self) -> Result<InstallReport, InstallError> {
        self.set_stage(InstallStage::Scanning);
        let firmware_path = self.config.firmware_path.clone();
        if !self.has_update() {
            return Err(InstallError::NotFound {
                path: firmware_path,
            });
        }
        log::info!("Found {} on SD card, starting update...", firmware_path);

        self.set_stage(InstallStage::OpenSource);
        let image = self
            .storage
            .open_read(&firmware_path)
            .map_err(|source| InstallError::OpenFailed {
                path: firmware_path.clone(),
                source,
            })?;
        if image.len == 0 {
            return Err(InstallError::EmptyImage {
                path: firmware_path,
            });
        }
        log::info!("Firmware size: {} bytes", image.len);

        self.set_stage(InstallStage::SelectPartition);
        let target = self.select_partition()?;
        log::info!("Writing to partition: {}", target);

        self.set_stage(InstallStage::SizeCheck);
        let capacity = target.capacity();
        if image.len > capacity {
            return Err(InstallError::CapacityExceeded {
                label: target.label,
                image: image.len,
                capacity,
            });
        }

        let bytes_written = self.stream(image, target.clone())?;

        self.set_stage(InstallStage::Commit);
        self.partitions
            .commit_boot_target(&target)
            .map_err(InstallError::CommitError)?;
        log::info!("Update successful! Boot partition set to {}", target.label);

        self.set_stage(InstallStage::MarkComplete);
        let marker_written =
            match marker::mark_consumed(&mut self.storage, &firmware_path, &self.config.done_path) {
                Ok(()) => true,
                Err(e) => {
                    // The new image boots anyway; the staged file will be flashed again
                    log::error!("{}", error_chain(&e));
                    false
                }
            };

        self.set_stage(InstallStage::Restart);
        log::info!("Rebooting...");
        self.restart.restart();

        Ok(InstallReport {
            partition: target,
            bytes_written,
            marker_written,
        })
    }

    fn select_partition(&self) -> Result<FlashPartition, InstallError> {
        let target = self
            .partitions
            .next_update_partition()
            .ok_or(InstallError::NoPartitionAvailable)?;

        if let Some(running) = self.partitions.running_partition() {
            if running == target {
                log::error!("Update partition {} is the running partition", target.label);
                return Err(InstallError::NoPartitionAvailable);
            }
        }
        Ok(target)
    }

    fn stream(
        &mut self,
        image: UpdateImage<S::Reader>,
        target: FlashPartition,
    ) -> Result<u64, InstallError> {
        let UpdateImage {
            len, mut reader, ..
        } = image;
        let chunk_size = self.config.chunk_size;
        let interval = self.config.progress_interval_bytes();

        self.set_stage(InstallStage::BeginWrite);
        let mut session =
            WriteSession::begin(&mut self.partitions, target, len).map_err(InstallError::BeginFailed)?;

        let mut buffer = vec![0u8; chunk_size];
        let mut last_report = 0u64;
        self.stage = InstallStage::Streaming { progress: 0 };

        while session.bytes_written() < len {
            let offset = session.bytes_written();
            let want = (len - offset).min(chunk_size as u64) as usize;

            let read = match read_chunk(&mut reader, &mut buffer[..want]) {
                Ok(0) => {
                    session.abort();
                    return Err(InstallError::ReadError {
                        offset,
                        source: None,
                    });
                }
                Ok(n) => n,
                Err(e) => {
                    session.abort();
                    return Err(InstallError::ReadError {
                        offset,
                        source: Some(e),
                    });
                }
            };

            if let Err(source) = session.write(&buffer[..read]) {
                session.abort();
                return Err(InstallError::WriteError { offset, source });
            }

            let progress = Progress {
                written: session.bytes_written(),
                total: len,
            };
            self.stage = InstallStage::Streaming {
                progress: progress.percent(),
            };
            if progress.written - last_report >= interval || progress.written == len {
                last_report = progress.written;
                log::info!(
                    "Progress: {} / {} bytes ({}%)",
                    progress.written,
                    progress.total,
                    progress.percent()
                );
                if let Some(cb) = self.on_progress.as_mut() {
                    cb(progress);
                }
            }
        }
        drop(reader);

        self.stage = InstallStage::Finalize;
        session.finish().map_err(InstallError::FinalizeError)
    }
}

fn read_chunk<T: Read>(reader: &mut T, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Render an error with its sources, `outer: inner: root`
pub fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::testing::{
        Event, FakePartitionTable, Journal, MemoryStorage, ReadFault, RecordingRestart,
    };
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type TestInstaller = Installer<MemoryStorage, FakePartitionTable, RecordingRestart>;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn build_with(
        config: InstallerConfig,
        image_len: Option<usize>,
        capacity: u32,
        setup: impl FnOnce(&mut MemoryStorage, &mut FakePartitionTable),
    ) -> (TestInstaller, Journal) {
        let journal = Journal::new();
        let mut storage = MemoryStorage::new().with_journal(journal.clone());
        if let Some(len) = image_len {
            storage.insert(&config.firmware_path, image(len));
        }
        let mut table = FakePartitionTable::new(capacity).with_journal(journal.clone());
        setup(&mut storage, &mut table);
        let restart = RecordingRestart::new().with_journal(journal.clone());
        let installer = Installer::new(config, storage, table, restart).unwrap();
        (installer, journal)
    }

    fn build(
        image_len: Option<usize>,
        capacity: u32,
        setup: impl FnOnce(&mut MemoryStorage, &mut FakePartitionTable),
    ) -> (TestInstaller, Journal) {
        build_with(InstallerConfig::default(), image_len, capacity, setup)
    }

    fn assert_untouched(installer: &TestInstaller, len: usize) {
        let storage = installer.storage();
        assert_eq!(storage.contents("/firmware.bin"), Some(image(len).as_slice()));
        assert!(!storage.exists("/firmware.bin.done"));
        assert_eq!(installer.partitions().commits(), 0);
        assert_eq!(installer.restart_handle().requests(), 0);
        assert_eq!(installer.partitions().boot_partition().label, "ota_0");
    }

    #[test]
    fn test_successful_install() {
        let (mut installer, journal) = build(Some(100_000), 200_000, |_, _| {});

        let report = installer.install().unwrap();

        assert_eq!(report.bytes_written, 100_000);
        assert!(report.marker_written);
        assert_eq!(report.partition.label, "ota_1");
        let running = installer.partitions().running_partition().unwrap();
        assert_ne!(installer.partitions().boot_partition(), &running);
        assert!(!installer.storage().exists("/firmware.bin"));
        assert!(installer.storage().exists("/firmware.bin.done"));
        assert_eq!(
            installer.partitions().flash_contents("ota_1"),
            Some(image(100_000).as_slice())
        );
        assert_eq!(installer.stage(), InstallStage::Restart);
        assert_eq!(
            journal.milestones(),
            vec![
                Event::Begin {
                    label: "ota_1".into(),
                    size: 100_000
                },
                Event::Write { offset: 0, len: 4096 },
                Event::Finalize,
                Event::Commit {
                    label: "ota_1".into()
                },
                Event::Rename {
                    from: "/firmware.bin".into(),
                    to: "/firmware.bin.done".into()
                },
                Event::Restart,
            ]
        );
    }

    #[test]
    fn test_second_run_finds_nothing() {
        let (mut installer, journal) = build(Some(10_000), 200_000, |_, _| {});
        assert!(installer.install_update());
        let events_after_first = journal.events().len();

        assert!(!installer.has_update());
        let err = installer.install().unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(installer.stage(), InstallStage::NoUpdate);
        assert_eq!(journal.events().len(), events_after_first);
    }

    #[test]
    fn test_capacity_exceeded_never_begins() {
        let (mut installer, journal) = build(Some(300_000), 200_000, |_, _| {});

        let err = installer.install().unwrap_err();

        assert!(matches!(
            err,
            InstallError::CapacityExceeded {
                image: 300_000,
                capacity: 200_000,
                ..
            }
        ));
        assert!(journal.events().is_empty());
        assert_untouched(&installer, 300_000);
    }

    #[test]
    fn test_read_failure_aborts() {
        let (mut installer, _) = build(Some(100_000), 200_000, |storage, _| {
            storage.fail_reads_at(40_000, ReadFault::ShortRead);
        });

        let err = installer.install().unwrap_err();

        assert!(matches!(err, InstallError::ReadError { offset: 40_000, .. }));
        assert_eq!(installer.partitions().aborts(), 1);
        assert_eq!(installer.partitions().finalizes(), 0);
        assert_eq!(installer.partitions().written_bytes(), 40_000);
        assert_eq!(installer.stage(), InstallStage::Failed);
        assert_untouched(&installer, 100_000);
    }

    #[test]
    fn test_read_io_error_aborts() {
        let (mut installer, _) = build(Some(10_000), 200_000, |storage, _| {
            storage.fail_reads_at(0, ReadFault::Io);
        });

        let err = installer.install().unwrap_err();

        assert!(matches!(
            err,
            InstallError::ReadError {
                offset: 0,
                source: Some(_)
            }
        ));
        assert_eq!(installer.partitions().aborts(), 1);
        assert_untouched(&installer, 10_000);
    }

    #[test]
    fn test_write_failure_aborts() {
        let (mut installer, _) = build(Some(50_000), 200_000, |_, table| {
            table.fail_writes_after(8192);
        });

        let err = installer.install().unwrap_err();

        assert!(matches!(err, InstallError::WriteError { offset: 8192, .. }));
        assert_eq!(installer.partitions().aborts(), 1);
        assert_untouched(&installer, 50_000);
    }

    #[test]
    fn test_missing_image_touches_nothing() {
        let (mut installer, journal) = build(None, 200_000, |_, _| {});

        assert!(!installer.has_update());
        assert!(!installer.install_update());
        assert!(journal.events().is_empty());
        assert_eq!(installer.storage().mutations(), 0);
    }

    #[test]
    fn test_empty_image() {
        let (mut installer, journal) = build(Some(0), 200_000, |_, _| {});

        let err = installer.install().unwrap_err();

        assert!(matches!(err, InstallError::EmptyImage { .. }));
        assert!(journal.events().is_empty());
        assert!(installer.storage().exists("/firmware.bin"));
    }

    #[test]
    fn test_open_failure() {
        let (mut installer, journal) = build(Some(10), 200_000, |storage, _| {
            storage.fail_opens();
        });

        assert!(matches!(installer.install().unwrap_err(), InstallError::OpenFailed { .. }));
        assert!(journal.events().is_empty());
    }

    #[test]
    fn test_no_partition_available() {
        let (mut installer, journal) = build(Some(10), 200_000, |_, table| {
            table.without_update_partition();
        });
        assert!(matches!(
            installer.install().unwrap_err(),
            InstallError::NoPartitionAvailable
        ));
        assert!(journal.events().is_empty());

        let (mut installer, journal) = build(Some(10), 200_000, |_, table| {
            table.select_running();
        });
        assert!(matches!(
            installer.install().unwrap_err(),
            InstallError::NoPartitionAvailable
        ));
        assert!(journal.events().is_empty());
    }

    #[test]
    fn test_begin_failure() {
        let (mut installer, _) = build(Some(10), 200_000, |_, table| table.fail_begin());

        assert!(matches!(installer.install().unwrap_err(), InstallError::BeginFailed(_)));
        assert_eq!(installer.partitions().aborts(), 0);
        assert_untouched(&installer, 10);
    }

    #[test]
    fn test_finalize_failure() {
        let (mut installer, _) = build(Some(10_000), 200_000, |_, table| table.fail_finalize());

        assert!(matches!(installer.install().unwrap_err(), InstallError::FinalizeError(_)));
        assert_untouched(&installer, 10_000);
    }

    #[test]
    fn test_commit_failure_keeps_running_partition() {
        let (mut installer, _) = build(Some(10_000), 200_000, |_, table| table.fail_commit());

        assert!(matches!(installer.install().unwrap_err(), InstallError::CommitError(_)));
        assert_eq!(installer.partitions().boot_partition().label, "ota_0");
        assert!(installer.storage().exists("/firmware.bin"));
        assert_eq!(installer.restart_handle().requests(), 0);
    }

    #[test]
    fn test_rename_failure_still_restarts() {
        let (mut installer, _) = build(Some(10_000), 200_000, |storage, _| {
            storage.fail_renames();
        });

        let report = installer.install().unwrap();

        assert!(!report.marker_written);
        assert_eq!(installer.partitions().boot_partition().label, "ota_1");
        assert!(installer.storage().exists("/firmware.bin"));
        assert_eq!(installer.restart_handle().requests(), 1);
    }

    #[test]
    fn test_stale_marker_remove_failure_still_restarts() {
        let (mut installer, journal) = build(Some(1_000), 200_000, |storage, _| {
            storage.insert("/firmware.bin.done", vec![0xAA; 16]);
            storage.fail_removes();
        });

        let report = installer.install().unwrap();

        assert!(!report.marker_written);
        assert_eq!(installer.partitions().boot_partition().label, "ota_1");
        assert_eq!(installer.storage().contents("/firmware.bin"), Some(image(1_000).as_slice()));
        assert_eq!(
            installer.storage().contents("/firmware.bin.done"),
            Some(&[0xAAu8; 16][..])
        );
        assert_eq!(installer.restart_handle().requests(), 1);
        assert_eq!(journal.count(|e| matches!(e, Event::Restart)), 1);
        assert_eq!(installer.stage(), InstallStage::Restart);
    }

    #[test]
    fn test_image_exactly_filling_partition_installs() {
        let (mut installer, journal) = build(Some(200_000), 200_000, |_, _| {});

        let report = installer.install().unwrap();

        assert_eq!(report.bytes_written, 200_000);
        assert_eq!(installer.partitions().written_bytes(), 200_000);
        assert_eq!(
            installer.partitions().flash_contents("ota_1"),
            Some(image(200_000).as_slice())
        );
        assert_eq!(journal.count(|e| matches!(e, Event::Commit { .. })), 1);
        assert!(installer.storage().exists("/firmware.bin.done"));

        let (mut installer, journal) = build(Some(200_001), 200_000, |_, _| {});
        assert!(matches!(
            installer.install().unwrap_err(),
            InstallError::CapacityExceeded { image: 200_001, .. }
        ));
        assert!(journal.events().is_empty());
    }

    #[test]
    fn test_stale_marker_replaced() {
        let (mut installer, _) = build(Some(1_000), 200_000, |storage, _| {
            storage.insert("/firmware.bin.done", vec![0xAA; 16]);
        });

        installer.install().unwrap();

        assert_eq!(
            installer.storage().contents("/firmware.bin.done"),
            Some(image(1_000).as_slice())
        );
    }

    #[test]
    fn test_progress_reported_periodically_and_at_completion() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let (installer, _) = build(Some(100_000), 200_000, |_, _| {});
        let mut installer = installer.on_progress(move |p| sink.borrow_mut().push(p.percent()));

        installer.install().unwrap();

        let seen = seen.borrow();
        // 40960, 81920, 100000
        assert_eq!(*seen, vec![40, 81, 100]);
    }

    #[test]
    fn test_custom_paths() {
        let config = InstallerConfig {
            firmware_path: "/update/app.bin".into(),
            done_path: "/update/app.bin.applied".into(),
            chunk_size: 1000,
            ..InstallerConfig::default()
        };
        let (mut installer, journal) = build_with(config, Some(2_500), 10_000, |_, _| {});

        installer.install().unwrap();

        assert!(installer.storage().exists("/update/app.bin.applied"));
        assert_eq!(journal.count(|e| matches!(e, Event::Write { .. })), 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = InstallerConfig {
            chunk_size: 0,
            ..InstallerConfig::default()
        };
        let result = Installer::new(
            config,
            MemoryStorage::new(),
            FakePartitionTable::new(16),
            RecordingRestart::new(),
        );
        assert!(matches!(result, Err(InstallError::InvalidConfig(_))));
    }

    #[test]
    fn test_has_update_has_no_side_effects() {
        let (installer, journal) = build(Some(10), 200_000, |_, _| {});
        for _ in 0..5 {
            assert!(installer.has_update());
        }
        assert!(journal.events().is_empty());
        assert_eq!(installer.storage().mutations(), 0);
        assert_eq!(installer.stage(), InstallStage::Idle);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = InstallError::ReadError {
            offset: 7,
            source: Some(io::Error::new(io::ErrorKind::Other, "card gone")),
        };
        assert_eq!(error_chain(&err), "read error at offset 7: card gone");

        let err = InstallError::MarkRenameFailed {
            from: "/firmware.bin".into(),
            to: "/firmware.bin.done".into(),
            source: StorageError::new(
                "rename",
                "/firmware.bin",
                io::Error::new(io::ErrorKind::Other, "read-only"),
            ),
        };
        assert_eq!(
            error_chain(&err),
            "failed to rename /firmware.bin to /firmware.bin.done: \
             rename failed on /firmware.bin: read-only"
        );
    }

    fn small_config() -> InstallerConfig {
        InstallerConfig {
            chunk_size: 256,
            ..InstallerConfig::default()
        }
    }

    proptest! {
        #[test]
        fn prop_fitting_images_install_in_order(size in 1usize..=20_000) {
            let (mut installer, journal) = build_with(small_config(), Some(size), 20_000, |_, _| {});

            let report = installer.install().unwrap();

            prop_assert_eq!(report.bytes_written, size as u64);
            let kinds: Vec<&'static str> = journal
                .milestones()
                .iter()
                .map(|e| match e {
                    Event::Begin { .. } => "begin",
                    Event::Write { .. } => "write",
                    Event::Finalize => "finalize",
                    Event::Commit { .. } => "commit",
                    Event::Rename { .. } => "rename",
                    Event::Restart => "restart",
                    Event::Abort => "abort",
                    Event::Remove { .. } => "remove",
                })
                .collect();
            prop_assert_eq!(kinds, vec!["begin", "write", "finalize", "commit", "rename", "restart"]);
            prop_assert_eq!(installer.partitions().written_bytes(), size as u64);
        }

        #[test]
        fn prop_oversized_images_never_touch_flash(extra in 1usize..10_000) {
            let (mut installer, journal) =
                build_with(small_config(), Some(20_000 + extra), 20_000, |_, _| {});

            let err = installer.install().unwrap_err();

            let is_capacity_exceeded = matches!(err, InstallError::CapacityExceeded { .. });
            prop_assert!(is_capacity_exceeded);
            prop_assert!(journal.events().is_empty());
        }

        #[test]
        fn prop_faults_abort_without_commit(size in 2usize..10_000, cut in 0.0f64..1.0, on_read in any::<bool>()) {
            let k = ((size as f64) * cut) as u64;
            let (mut installer, _) = build_with(small_config(), Some(size), 20_000, |storage, table| {
                if on_read {
                    storage.fail_reads_at(k, ReadFault::ShortRead);
                } else {
                    table.fail_writes_after(k);
                }
            });

            let err = installer.install().unwrap_err();

            let is_stream_error = matches!(
                err,
                InstallError::ReadError { .. } | InstallError::WriteError { .. }
            );
            prop_assert!(is_stream_error);
            prop_assert_eq!(installer.partitions().aborts(), 1);
            prop_assert_eq!(installer.partitions().commits(), 0);
            prop_assert!(installer.partitions().written_bytes() <= k);
            let staged = image(size);
            prop_assert_eq!(installer.storage().contents("/firmware.bin"), Some(staged.as_slice()));
            prop_assert!(!installer.storage().exists("/firmware.bin.done"));
        }
    }
}
