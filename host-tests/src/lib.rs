//! Host-based tests for the SD card updater
//! These tests run on the development machine, not on the ESP32. They drive
//! the installer against a real directory standing in for the SD card.
