//! Process-wide engine state for plugins that want it.
//!
//! Everything here is also available as plain values; the holder only adds one-time
//! initialization and `'static` access.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::fatal::report_and_fail;
use crate::host::{HostApi, alloc_trampoline};
use crate::image::ProcessImage;
use crate::memory::ProtectedWriter;
use crate::offset::{Id, Relocation, SelectedTable, VersionTable};
use crate::trampoline::Trampoline;

static RUNTIME: Holder<Runtime> = Holder::new();

/// A once-initialized value whose fallible build runs at most once at a time.
struct Holder<T> {
    value: OnceLock<T>,
    building: Mutex<()>,
}

impl<T> Holder<T> {
    const fn new() -> Self {
        Self {
            value: OnceLock::new(),
            building: Mutex::new(()),
        }
    }

    fn get(&self) -> Option<&T> {
        self.value.get()
    }

    fn get_or_try_init<F>(&self, build: F) -> Result<&T>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }
        let _building = self.building.lock().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have finished while we waited.
        if let Some(value) = self.value.get() {
            return Ok(value);
        }
        let value = build()?;
        Ok(self.value.get_or_init(|| value))
    }
}

/// Image, offsets, trampoline and loader handle of one attached plugin.
pub struct Runtime {
    image: ProcessImage,
    writer: ProtectedWriter,
    offsets: VersionTable,
    trampoline: Mutex<Trampoline>,
    host: Option<HostApi>,
}

impl Runtime {
    /// Assemble the engine state for `image`.
    ///
    /// `builtin` offsets are extended with the JSON table named in the config, if any.
    /// The trampoline is sized and sourced per `[trampoline]`.
    pub fn new(
        image: ProcessImage,
        writer: ProtectedWriter,
        config: &Config,
        host: Option<HostApi>,
        builtin: VersionTable,
    ) -> Result<Self> {
        let mut offsets = builtin;
        if let Some(path) = &config.offsets.table {
            offsets.merge(VersionTable::load(path)?);
        }

        let mut trampoline = Trampoline::new("plugin", writer.clone());
        alloc_trampoline(
            host.as_ref(),
            &mut trampoline,
            config.trampoline.capacity,
            image.base(),
            config.trampoline.prefer_host_pool,
        )?;

        debug!(
            "Runtime ready: {} versions known, trampoline {} bytes",
            offsets.versions().count(),
            trampoline.capacity()
        );

        Ok(Self {
            image,
            writer,
            offsets,
            trampoline: Mutex::new(trampoline),
            host,
        })
    }

    pub fn image(&self) -> &ProcessImage {
        &self.image
    }

    pub fn writer(&self) -> &ProtectedWriter {
        &self.writer
    }

    pub fn host(&self) -> Option<&HostApi> {
        self.host.as_ref()
    }

    pub fn offsets(&self) -> &VersionTable {
        &self.offsets
    }

    /// Offsets for the running build.
    pub fn selected(&self) -> Result<SelectedTable<'_>> {
        self.offsets.select_for(&self.image)
    }

    pub fn relocation<T>(&self, id: Id) -> Result<Relocation<T>> {
        Relocation::from_id(&self.image, &self.selected()?, id)
    }

    /// Exclusive access to the shared trampoline.
    pub fn trampoline(&self) -> MutexGuard<'_, Trampoline> {
        self.trampoline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("image", &self.image)
            .field("host", &self.host.is_some())
            .finish_non_exhaustive()
    }
}

/// Install the runtime built by `build`, unless one is already installed.
///
/// `build` runs only while the holder is empty, and never on two threads at once. Racing
/// callers wait for the first build and get its runtime. A failed build leaves the holder
/// empty for the next caller.
pub fn init<F>(build: F) -> Result<&'static Runtime>
where
    F: FnOnce() -> Result<Runtime>,
{
    RUNTIME.get_or_try_init(build)
}

/// Attach to the host executable and install the runtime.
pub fn attach(
    config: &Config,
    host: Option<HostApi>,
    builtin: VersionTable,
) -> Result<&'static Runtime> {
    init(|| {
        let image = ProcessImage::attach()?;
        Runtime::new(image, ProtectedWriter::system(), config, host, builtin)
    })
}

pub fn get() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// The installed runtime; fatal when nothing has been installed.
#[track_caller]
pub fn runtime() -> &'static Runtime {
    match RUNTIME.get() {
        Some(runtime) => runtime,
        None => report_and_fail("engine runtime used before initialization"),
    }
}
