//! # relpatch
//!
//! Runtime relocation and in-process patching for plugins loaded into a host executable.
//!
//! This crate provides:
//! - Discovery of the host image (base, build version, named segments)
//! - Version-keyed offset tables and typed relocations over them
//! - Byte-pattern verification of patch sites
//! - A bump-allocated trampoline for redirecting `call`/`jmp` sites
//! - Protected writes and vtable slot replacement
//! - `#[repr(C)]` mirrors of the plugin loader's handshake structures
//!
//! A plugin typically attaches once, selects the offset table for the running build, checks
//! each patch site against its expected bytes and then redirects it:
//!
//! ```no_run
//! use relpatch::{Config, Id, OrFail, Pattern, VersionTable, global};
//!
//! let runtime = global::attach(&Config::default(), None, VersionTable::new()).or_fail();
//! let site = runtime.relocation::<u8>(Id(12_345)).or_fail().add(0x1F);
//! let call = Pattern::parse("E8 ?? ?? ?? ??").or_fail();
//! // SAFETY: the site lies in the host's mapped code.
//! unsafe { call.match_or_fail(site.address()) };
//! ```

pub mod config;
pub mod error;
pub mod fatal;
pub mod global;
pub mod host;
pub mod image;
pub mod logging;
pub mod memory;
pub mod offset;
pub mod string_pool;
pub mod trampoline;
pub mod version;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use fatal::{OrFail, report_and_fail};
pub use host::{HostApi, LoadInterface, PluginVersionData, alloc_trampoline};
pub use image::{ProcessImage, Segment, SegmentName};
pub use logging::LogConfig;
pub use memory::{MemoryBackend, Protection, ProtectedWriter, SystemMemory};
pub use offset::{
    CallingConvention, FnSignature, Id, Offset, OffsetTable, Pattern, Relocation,
    SelectedTable, VersionTable, VersionedOffset,
};
pub use string_pool::PoolEntry;
pub use trampoline::{OriginalCall, Trampoline};
pub use version::Version;
