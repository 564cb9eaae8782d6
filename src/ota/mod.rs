// SD card OTA module
//
// Update flow:
// 1. Check the SD card for /firmware.bin
// 2. Stream it into the next OTA partition
// 3. Set boot partition
// 4. Rename to /firmware.bin.done so it is not flashed again
// 5. Restart

pub mod partition;
pub mod sdcard;

pub use partition::EspPartitionTable;
pub use sdcard::mount_sd_card;
