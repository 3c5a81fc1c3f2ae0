//! Boundary with the plugin loader that hosts us.
//!
//! The loader hands the plugin a [`LoadInterface`] at load time. The engine consumes
//! exactly one sub-interface from it, the trampoline pool; everything else stays opaque.

use std::ffi::{CStr, c_char, c_void};
use std::ptr::NonNull;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::trampoline::Trampoline;
use crate::version::Version;

pub type PluginHandle = u32;

pub const INVALID_PLUGIN_HANDLE: PluginHandle = 0xFFFF_FFFF;

/// Sub-interfaces the loader can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InterfaceId {
    Invalid = 0,
    Messaging = 1,
    Trampoline = 2,
}

#[repr(C)]
#[derive(Debug)]
pub struct PluginInfo {
    pub info_version: u32,
    pub name: *const c_char,
    pub version: u32,
}

/// Negotiation table passed to the plugin's load entry point.
#[repr(C)]
#[derive(Debug)]
pub struct LoadInterface {
    pub loader_version: u32,
    pub runtime_version: u32,
    pub interface_version: u32,
    pub query_interface: Option<unsafe extern "C" fn(id: u32) -> *mut c_void>,
    pub get_plugin_handle: Option<unsafe extern "C" fn() -> PluginHandle>,
    pub get_plugin_info: Option<unsafe extern "C" fn(name: *const c_char) -> *const PluginInfo>,
}

impl LoadInterface {
    pub const VERSION: u32 = 1;
}

/// Shared executable-memory pools owned by the loader.
#[repr(C)]
#[derive(Debug)]
pub struct TrampolineInterface {
    pub interface_version: u32,
    pub allocate_from_branch_pool:
        Option<unsafe extern "C" fn(plugin: PluginHandle, size: usize) -> *mut c_void>,
    pub allocate_from_local_pool:
        Option<unsafe extern "C" fn(plugin: PluginHandle, size: usize) -> *mut c_void>,
}

impl TrampolineInterface {
    pub const VERSION: u32 = 1;
}

/// What the plugin keeps from the load handshake.
#[derive(Debug)]
pub struct HostApi {
    plugin_handle: PluginHandle,
    loader_version: Version,
    runtime_version: Version,
    load: NonNull<LoadInterface>,
    trampoline: Option<NonNull<TrampolineInterface>>,
}

// SAFETY: the loader's interface tables are immutable and live for the whole process.
unsafe impl Send for HostApi {}
// SAFETY: see above; nothing here is mutated after `init`.
unsafe impl Sync for HostApi {}

impl HostApi {
    /// Capture the plugin handle and the trampoline interface.
    ///
    /// # Safety
    ///
    /// `intfc` must be the table the loader passed to the plugin's load entry point.
    pub unsafe fn init(intfc: *const LoadInterface) -> Result<Self> {
        let load = NonNull::new(intfc.cast_mut()).ok_or(Error::NullAddress("load interface"))?;
        // SAFETY: forwarded to the caller.
        let table = unsafe { load.as_ref() };

        if table.interface_version > LoadInterface::VERSION {
            warn!(
                "Load interface version {} is newer than {}",
                table.interface_version,
                LoadInterface::VERSION
            );
        }

        let plugin_handle = match table.get_plugin_handle {
            // SAFETY: loader-provided function with no arguments.
            Some(f) => unsafe { f() },
            None => INVALID_PLUGIN_HANDLE,
        };

        // SAFETY: forwarded to the caller.
        let trampoline = unsafe { query::<TrampolineInterface>(table, InterfaceId::Trampoline) };
        if let Some(t) = trampoline {
            // SAFETY: returned by the loader for this ID.
            let version = unsafe { t.as_ref() }.interface_version;
            if version > TrampolineInterface::VERSION {
                warn!(
                    "Trampoline interface version {} is newer than {}",
                    version,
                    TrampolineInterface::VERSION
                );
            }
        }

        let api = Self {
            plugin_handle,
            loader_version: Version::unpack(table.loader_version),
            runtime_version: Version::unpack(table.runtime_version),
            load,
            trampoline,
        };
        info!(
            "Loader {} on runtime {}, plugin handle {:#x}",
            api.loader_version, api.runtime_version, api.plugin_handle
        );
        Ok(api)
    }

    pub fn plugin_handle(&self) -> PluginHandle {
        self.plugin_handle
    }

    pub fn loader_version(&self) -> Version {
        self.loader_version
    }

    pub fn runtime_version(&self) -> Version {
        self.runtime_version
    }

    pub fn has_trampoline_interface(&self) -> bool {
        self.trampoline.is_some()
    }

    /// Information the loader holds about another plugin.
    pub fn plugin_info(&self, name: &CStr) -> Option<&PluginInfo> {
        // SAFETY: `load` outlives `self`.
        let f = unsafe { self.load.as_ref() }.get_plugin_info?;
        // SAFETY: loader-provided function; the returned record is loader-owned.
        unsafe { f(name.as_ptr()).as_ref() }
    }

    /// Take `size` bytes from the loader's branch pool, if it offers one.
    pub fn allocate_from_branch_pool(&self, size: usize) -> Option<usize> {
        // SAFETY: `trampoline` outlives `self`.
        let f = unsafe { self.trampoline?.as_ref() }.allocate_from_branch_pool?;
        // SAFETY: loader-provided allocator.
        let ptr = unsafe { f(self.plugin_handle, size) };
        (!ptr.is_null()).then_some(ptr as usize)
    }

    /// Take `size` bytes from the loader's local pool, if it offers one.
    pub fn allocate_from_local_pool(&self, size: usize) -> Option<usize> {
        // SAFETY: `trampoline` outlives `self`.
        let f = unsafe { self.trampoline?.as_ref() }.allocate_from_local_pool?;
        // SAFETY: loader-provided allocator.
        let ptr = unsafe { f(self.plugin_handle, size) };
        (!ptr.is_null()).then_some(ptr as usize)
    }
}

/// Query a sub-interface by ID.
///
/// # Safety
///
/// `T` must be the table type the loader returns for `id`.
unsafe fn query<T>(table: &LoadInterface, id: InterfaceId) -> Option<NonNull<T>> {
    let f = table.query_interface?;
    // SAFETY: loader-provided function.
    let ptr = unsafe { f(id as u32) };
    debug!("Interface {:?} -> {:p}", id, ptr);
    NonNull::new(ptr.cast::<T>())
}

/// Give `trampoline` `size` bytes, from the loader's branch pool when `try_reserve` is set
/// and the pool has room, otherwise from a fresh allocation within reach of `near`.
pub fn alloc_trampoline(
    host: Option<&HostApi>,
    trampoline: &mut Trampoline,
    size: usize,
    near: usize,
    try_reserve: bool,
) -> Result<()> {
    if try_reserve {
        if let Some(buffer) = host.and_then(|h| h.allocate_from_branch_pool(size)) {
            // SAFETY: the loader reserved this buffer for our plugin for the process lifetime.
            return unsafe { trampoline.set_external(buffer, size) };
        }
        debug!("Branch pool unavailable, allocating trampoline ourselves");
    }

    trampoline.create(size, near)
}

/// Plugin metadata block the loader reads from the plugin's exports.
///
/// Laid out byte for byte as the loader expects; builder methods are `const` so the block
/// can be a `static`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginVersionData {
    pub data_version: u32,
    pub plugin_version: u32,
    pub plugin_name: [u8; 256],
    pub author: [u8; 256],
    /// bit 0: signature scanning, bit 1: address library
    pub address_flags: u8,
    _padding2: u8,
    _padding3: u16,
    /// bit 0: no struct use, bit 1: initial layout
    pub structure_flags: u8,
    _padding5: u8,
    _padding6: u16,
    pub compatible_versions: [u32; 16],
    pub loader_minimum: u32,
    pub reserved_non_breaking: u32,
    pub reserved_breaking: u32,
}

impl PluginVersionData {
    pub const VERSION: u32 = 1;

    const SIG_SCANNING: u8 = 1 << 0;
    const ADDRESS_LIBRARY: u8 = 1 << 1;
    const NO_STRUCT_USE: u8 = 1 << 0;
    const INITIAL_LAYOUT: u8 = 1 << 1;

    pub const fn new() -> Self {
        Self {
            data_version: Self::VERSION,
            plugin_version: 0,
            plugin_name: [0; 256],
            author: [0; 256],
            address_flags: 0,
            _padding2: 0,
            _padding3: 0,
            structure_flags: Self::INITIAL_LAYOUT,
            _padding5: 0,
            _padding6: 0,
            compatible_versions: [0; 16],
            loader_minimum: 0,
            reserved_non_breaking: 0,
            reserved_breaking: 0,
        }
    }

    /// Names longer than 255 bytes are truncated.
    pub const fn plugin_name(mut self, name: &str) -> Self {
        self.plugin_name = c_buffer(name);
        self
    }

    pub const fn author(mut self, name: &str) -> Self {
        self.author = c_buffer(name);
        self
    }

    pub const fn plugin_version(mut self, version: Version) -> Self {
        self.plugin_version = version.pack();
        self
    }

    /// Up to 15 versions are kept; the last slot stays zero as the terminator.
    pub const fn compatible_versions(mut self, versions: &[Version]) -> Self {
        let mut i = 0;
        while i < versions.len() && i < self.compatible_versions.len() - 1 {
            self.compatible_versions[i] = versions[i].pack();
            i += 1;
        }
        self
    }

    pub const fn minimum_loader_version(mut self, version: Version) -> Self {
        self.loader_minimum = version.pack();
        self
    }

    pub const fn uses_sig_scanning(mut self, value: bool) -> Self {
        self.address_flags = set_bit(self.address_flags, Self::SIG_SCANNING, value);
        self
    }

    pub const fn uses_address_library(mut self, value: bool) -> Self {
        self.address_flags = set_bit(self.address_flags, Self::ADDRESS_LIBRARY, value);
        self
    }

    pub const fn has_no_struct_use(mut self, value: bool) -> Self {
        self.structure_flags = set_bit(self.structure_flags, Self::NO_STRUCT_USE, value);
        self
    }

    pub const fn uses_initial_layout(mut self, value: bool) -> Self {
        self.structure_flags = set_bit(self.structure_flags, Self::INITIAL_LAYOUT, value);
        self
    }

    pub fn name(&self) -> &str {
        let end = self.plugin_name.iter().position(|&b| b == 0).unwrap_or(256);
        std::str::from_utf8(&self.plugin_name[..end]).unwrap_or("")
    }
}

impl Default for PluginVersionData {
    fn default() -> Self {
        Self::new()
    }
}

const fn c_buffer(s: &str) -> [u8; 256] {
    let bytes = s.as_bytes();
    let mut out = [0u8; 256];
    let mut i = 0;
    while i < bytes.len() && i < out.len() - 1 {
        out[i] = bytes[i];
        i += 1;
    }
    out
}

const fn set_bit(flags: u8, bit: u8, value: bool) -> u8 {
    if value { flags | bit } else { flags & !bit }
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::{MockMemory, ProtectedWriter};

    static BRANCH_POOL: [u8; 64] = [0; 64];
    static BRANCH_REQUESTS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn branch_pool(plugin: PluginHandle, size: usize) -> *mut c_void {
        assert_eq!(plugin, 7);
        BRANCH_REQUESTS.fetch_add(1, Ordering::SeqCst);
        if size <= BRANCH_POOL.len() {
            BRANCH_POOL.as_ptr() as *mut c_void
        } else {
            std::ptr::null_mut()
        }
    }

    static TRAMPOLINE_INTERFACE: TrampolineInterface = TrampolineInterface {
        interface_version: 2,
        allocate_from_branch_pool: Some(branch_pool),
        allocate_from_local_pool: None,
    };

    unsafe extern "C" fn query_interface(id: u32) -> *mut c_void {
        if id == InterfaceId::Trampoline as u32 {
            &TRAMPOLINE_INTERFACE as *const TrampolineInterface as *mut c_void
        } else {
            std::ptr::null_mut()
        }
    }

    unsafe extern "C" fn plugin_handle() -> PluginHandle {
        7
    }

    fn load_interface() -> LoadInterface {
        LoadInterface {
            loader_version: Version::new(0, 2, 10, 0).pack(),
            runtime_version: Version::new(1, 7, 23, 0).pack(),
            interface_version: 1,
            query_interface: Some(query_interface),
            get_plugin_handle: Some(plugin_handle),
            get_plugin_info: None,
        }
    }

    #[test]
    fn test_init_captures_handle_and_versions() {
        let intfc = load_interface();
        let api = unsafe { HostApi::init(&intfc) }.unwrap();
        assert_eq!(api.plugin_handle(), 7);
        assert_eq!(api.runtime_version(), Version::new(1, 7, 23, 0));
        assert_eq!(api.loader_version(), Version::new(0, 2, 10, 0));
        assert!(api.has_trampoline_interface());
        assert!(api.allocate_from_local_pool(8).is_none());
        assert!(api.plugin_info(c"other").is_none());
    }

    #[test]
    fn test_init_rejects_null() {
        assert!(matches!(
            unsafe { HostApi::init(std::ptr::null()) },
            Err(Error::NullAddress(_))
        ));
    }

    #[test]
    fn test_alloc_trampoline_prefers_branch_pool() {
        let intfc = load_interface();
        let api = unsafe { HostApi::init(&intfc) }.unwrap();
        let writer = ProtectedWriter::new(Arc::new(MockMemory::new()));
        let mut trampoline = Trampoline::new("host", writer);

        alloc_trampoline(Some(&api), &mut trampoline, 28, 0, true).unwrap();
        assert!(!trampoline.is_owned());
        assert_eq!(trampoline.base(), Some(BRANCH_POOL.as_ptr() as usize));
        assert_eq!(trampoline.capacity(), 28);
        assert!(BRANCH_REQUESTS.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_alloc_trampoline_falls_back_to_own_memory() {
        let intfc = load_interface();
        let api = unsafe { HostApi::init(&intfc) }.unwrap();
        let mut own = vec![0u8; 256];
        let mock = Arc::new(MockMemory::new());
        mock.set_pool(own.as_mut_ptr() as usize, own.len());
        let mut trampoline = Trampoline::new("host", ProtectedWriter::new(mock));

        // Larger than the branch pool can serve.
        alloc_trampoline(Some(&api), &mut trampoline, 128, 0, true).unwrap();
        assert!(trampoline.is_owned());
        assert_eq!(trampoline.base(), Some(own.as_ptr() as usize));

        let mut trampoline2 = Trampoline::new("no-host", trampoline_writer());
        assert!(alloc_trampoline(None, &mut trampoline2, 16, 0, false).is_err());
    }

    fn trampoline_writer() -> ProtectedWriter {
        ProtectedWriter::new(Arc::new(MockMemory::new()))
    }

    #[test]
    fn test_plugin_version_data_layout() {
        assert_eq!(size_of::<PluginVersionData>(), 0x25C);
        assert_eq!(offset_of!(PluginVersionData, plugin_version), 0x004);
        assert_eq!(offset_of!(PluginVersionData, plugin_name), 0x008);
        assert_eq!(offset_of!(PluginVersionData, author), 0x108);
        assert_eq!(offset_of!(PluginVersionData, address_flags), 0x208);
        assert_eq!(offset_of!(PluginVersionData, structure_flags), 0x20C);
        assert_eq!(offset_of!(PluginVersionData, compatible_versions), 0x210);
        assert_eq!(offset_of!(PluginVersionData, loader_minimum), 0x250);
        assert_eq!(offset_of!(PluginVersionData, reserved_breaking), 0x258);
    }

    #[test]
    fn test_plugin_version_data_builder() {
        const DATA: PluginVersionData = PluginVersionData::new()
            .plugin_name("MouseFix")
            .author("someone")
            .plugin_version(Version::new(1, 2, 0, 0))
            .uses_address_library(true)
            .has_no_struct_use(true)
            .compatible_versions(&[Version::new(1, 7, 23, 0), Version::new(1, 7, 29, 0)]);

        assert_eq!(DATA.name(), "MouseFix");
        assert_eq!(DATA.plugin_version, Version::new(1, 2, 0, 0).pack());
        assert_eq!(DATA.address_flags, 0b10);
        assert_eq!(DATA.structure_flags, 0b11);
        assert_eq!(DATA.compatible_versions[1], Version::new(1, 7, 29, 0).pack());
        assert_eq!(DATA.compatible_versions[2], 0);
    }

    #[test]
    fn test_long_name_truncated() {
        let long = "x".repeat(300);
        let data = PluginVersionData::new().plugin_name(&long);
        assert_eq!(data.name().len(), 255);
        assert_eq!(data.plugin_name[255], 0);
    }
}
