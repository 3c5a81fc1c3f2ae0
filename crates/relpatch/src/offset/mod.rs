//! Resolving logical IDs to addresses and checking what lives there.

pub mod call;
mod pattern;
mod relocation;
mod table;

pub use call::{CallingConvention, FnSignature, ReturnKind, Returnable};
pub use pattern::{Pattern, format_bytes, format_pattern, parse_pattern};
pub use relocation::{Offset, Relocation};
pub use table::{Id, OffsetTable, SelectedTable, VersionTable, VersionedOffset};
