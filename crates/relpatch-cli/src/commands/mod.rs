//! CLI command implementations.
//!
//! This module contains the implementation of each CLI command.

pub mod hex_utils;
pub mod hexdump;
pub mod init_config;
pub mod offsets;
pub mod resolve;
pub mod segments;
pub mod verify;
