use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use windows_sys::Win32::Foundation::FARPROC;
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_DIRECTORY_ENTRY_EXPORT;
use windows_sys::Win32::System::SystemInformation::{GetNativeSystemInfo, SYSTEM_INFO};

use crate::arch::native;
use crate::arena::Arena;
use crate::errors::PeError;
use crate::exports::{build_catalog, ExportInfo};
use crate::pe_executor;
use crate::pe_mapper::{self, Dependencies};
use crate::pe_parser::PeImage;

/// A PE image mapped into the current process.
struct LoadedImage {
    arena: Arena,
    /// View of the NT headers inside the arena at `e_lfanew`; the arena
    /// owns the storage.
    headers: NonNull<native::NtHeaders>,
    dependencies: Dependencies,
    entry_rva: u32,
    /// True once `DllMain(DLL_PROCESS_ATTACH)` has returned success, which
    /// is what entitles the image to a detach notification on unload.
    attached: bool,
}

#[derive(Default)]
struct ExportCache {
    built: bool,
    module_name: String,
    entries: Vec<ExportInfo>,
}

/// In-process loader handle for PE images supplied as in-memory buffers.
///
/// `load` maps the image and performs the fix-ups the OS loader would
/// perform for a module loaded from disk, in this fixed order: validate,
/// allocate, copy sections, relocate, resolve imports, apply section
/// protections, run TLS callbacks, dispatch the entry point. `unload`
/// runs the reverse teardown and is also performed on drop.
///
/// Export queries are served from a lazily built catalog and may run
/// concurrently from several threads; `load`/`unload` require `&mut self`
/// and therefore exclusive access.
pub struct MemoryModule {
    image: Option<LoadedImage>,
    exports: Mutex<ExportCache>,
    page_size: usize,
}

// The raw pointers inside `LoadedImage` reference memory owned exclusively
// by this handle. All mutation happens through `&mut self`, so shared
// references can only reach the read-only query paths, and the export
// cache those paths touch is behind a mutex.
unsafe impl Send for MemoryModule {}
unsafe impl Sync for MemoryModule {}

impl MemoryModule {
    /// Creates an empty handle and samples the system page size.
    pub fn new() -> Self {
        let mut info: SYSTEM_INFO = unsafe { mem::zeroed() };
        unsafe { GetNativeSystemInfo(&mut info) };

        Self {
            image: None,
            exports: Mutex::new(ExportCache::default()),
            page_size: info.dwPageSize as usize,
        }
    }

    /// Maps `buffer` into the current process and runs the load pipeline.
    ///
    /// A repeated call unloads the previous image first. On failure the
    /// handle reverts to the empty state with no memory left mapped and no
    /// dependency handles retained.
    pub fn load(&mut self, buffer: &[u8]) -> Result<(), PeError> {
        self.unload();

        let image = PeImage::parse(buffer)?;
        let arena = Arena::allocate(image.preferred_base(), image.size_of_image(), self.page_size)?;
        info!(
            "load: mapping image at {:p} ({:#x} bytes)",
            arena.base(),
            arena.size()
        );

        let headers = pe_mapper::copy_image(&image, &arena)?;
        let delta = arena.base() as isize - image.preferred_base() as isize;
        pe_mapper::apply_relocations(&image, &arena, delta)?;
        let dependencies = pe_mapper::resolve_imports(&image, &arena)?;
        pe_mapper::finalize_sections(&image, &arena, self.page_size)?;
        pe_executor::run_tls_callbacks(&image, &arena)?;
        let attached = pe_executor::attach_entry_point(&image, &arena)?;

        self.image = Some(LoadedImage {
            arena,
            headers,
            dependencies,
            entry_rva: image.entry_point_rva(),
            attached,
        });
        info!("load: image ready");
        Ok(())
    }

    /// Detaches and releases the mapped image.
    ///
    /// Idempotent: an empty handle reports success. On a loaded DLL the
    /// entry point receives its detach notification before the arena is
    /// released.
    pub fn unload(&mut self) -> bool {
        if let Some(image) = self.image.take() {
            if image.attached {
                pe_executor::detach_entry_point(&image.arena, image.entry_rva);
            }
            debug!("unload: releasing image at {:p}", image.arena.base());
            // Dropping `image` releases the arena and the dependency
            // handles, in that order, after the detach above.
        }

        let mut cache = self.lock_exports();
        cache.built = false;
        cache.module_name.clear();
        cache.entries.clear();
        true
    }

    /// Resolves an export by name.
    ///
    /// A name consisting entirely of decimal digits that matches no named
    /// export is re-interpreted as a biased ordinal.
    pub fn get_proc_address(&self, name: &str) -> FARPROC {
        if !self.is_valid() || name.is_empty() {
            return None;
        }

        let direct = self.with_exports(|cache| {
            cache
                .entries
                .iter()
                .find(|export| export.name == name)
                .map(|export| export.address)
        });
        if let Some(address) = direct {
            return address;
        }

        if name.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(ordinal) = name.parse::<u32>() {
                return self.get_proc_address_by_ordinal(ordinal);
            }
        }

        None
    }

    /// Resolves an export by its biased ordinal.
    pub fn get_proc_address_by_ordinal(&self, ordinal: u32) -> FARPROC {
        if !self.is_valid() {
            return None;
        }

        self.with_exports(|cache| {
            cache
                .entries
                .iter()
                .find(|export| export.ordinal == ordinal)
                .and_then(|export| export.address)
        })
    }

    /// Returns the name of the export with the given biased ordinal, or an
    /// empty string.
    pub fn get_function_name(&self, ordinal: u32) -> String {
        if !self.is_valid() {
            return String::new();
        }

        self.with_exports(|cache| {
            cache
                .entries
                .iter()
                .find(|export| export.ordinal == ordinal)
                .map(|export| export.name.clone())
                .unwrap_or_default()
        })
    }

    /// Returns the biased ordinal of the named export.
    pub fn get_function_ordinal(&self, name: &str) -> Option<u32> {
        if !self.is_valid() || name.is_empty() {
            return None;
        }

        self.with_exports(|cache| {
            cache
                .entries
                .iter()
                .find(|export| export.name == name)
                .map(|export| export.ordinal)
        })
    }

    /// Returns a snapshot of the export catalog.
    ///
    /// The returned entries stay valid as data after an unload, though
    /// their addresses must no longer be called.
    pub fn get_export_list(&self) -> Vec<ExportInfo> {
        if !self.is_valid() {
            return Vec::new();
        }

        self.with_exports(|cache| cache.entries.clone())
    }

    /// Returns the number of catalog entries.
    pub fn export_count(&self) -> u32 {
        if !self.is_valid() {
            return 0;
        }

        self.with_exports(|cache| cache.entries.len() as u32)
    }

    /// Returns the module name recorded in the export directory, falling
    /// back to the first named export, then `"Unknown"`.
    pub fn module_name(&self) -> String {
        if !self.is_valid() {
            return String::new();
        }

        self.with_exports(|cache| {
            if !cache.module_name.is_empty() {
                return cache.module_name.clone();
            }
            match cache.entries.iter().find(|export| !export.name.is_empty()) {
                Some(export) => export.name.clone(),
                None => String::from("Unknown"),
            }
        })
    }

    /// Returns `true` while an image is mapped.
    pub fn is_valid(&self) -> bool {
        self.image.is_some()
    }

    /// Returns `true` between a successful load and the start of unload.
    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    /// Returns `true` when the mapped image is a 64-bit (AMD64) image.
    pub fn is_64_bit(&self) -> bool {
        // The machine check in validation pins the image to the host.
        self.image.is_some() && cfg!(target_pointer_width = "64")
    }

    /// Returns the arena base, or null when empty.
    pub fn base_address(&self) -> *const c_void {
        self.image
            .as_ref()
            .map_or(ptr::null(), |image| image.arena.base() as *const c_void)
    }

    /// Returns the page-rounded size of the mapped image, or 0 when empty.
    pub fn image_size(&self) -> usize {
        self.image.as_ref().map_or(0, |image| image.arena.size())
    }

    fn lock_exports(&self) -> MutexGuard<'_, ExportCache> {
        self.exports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the export cache, building it on first use.
    ///
    /// A failed build leaves the catalog empty with the built flag set, so
    /// later queries do not retry a malformed directory.
    fn with_exports<R>(&self, f: impl FnOnce(&ExportCache) -> R) -> R {
        let mut cache = self.lock_exports();

        if !cache.built {
            if let Some(image) = &self.image {
                let nt = unsafe { ptr::read_unaligned(image.headers.as_ptr()) };
                let directory =
                    nt.OptionalHeader.DataDirectory[IMAGE_DIRECTORY_ENTRY_EXPORT as usize];

                match build_catalog(&image.arena, directory.VirtualAddress) {
                    Ok(catalog) => {
                        cache.module_name = catalog.module_name;
                        cache.entries = catalog.entries;
                    }
                    Err(err) => warn!("exports: catalog build failed: {err}"),
                }
                cache.built = true;
            }
        }

        f(&cache)
    }
}

impl Default for MemoryModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryModule {
    fn drop(&mut self) {
        self.unload();
    }
}
