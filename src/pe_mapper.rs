use std::cmp;
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use log::{debug, error, info, trace, warn};
use windows_sys::core::PCSTR;
use windows_sys::Win32::Foundation::{FreeLibrary, HMODULE};
use windows_sys::Win32::System::Diagnostics::Debug::{
    IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
};
use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};
use windows_sys::Win32::System::Memory::{
    VirtualProtect, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemServices::{
    IMAGE_BASE_RELOCATION, IMAGE_IMPORT_DESCRIPTOR, IMAGE_REL_BASED_ABSOLUTE,
    IMAGE_REL_BASED_DIR64, IMAGE_REL_BASED_HIGHLOW,
};

use crate::arch::native;
use crate::arena::{align_down, Arena};
use crate::errors::PeError;
use crate::pe_parser::PeImage;

/// Copies the PE headers and section contents from the input buffer into
/// the arena, emulating the Windows loader layout:
///
/// 1. Copy `SizeOfHeaders` bytes to the arena start
/// 2. Copy each section with raw data to `base + VirtualAddress`
/// 3. Rewrite the in-arena `ImageBase` to the actual base
///
/// Sections without raw data keep the zero fill of the fresh reservation.
/// Returns the NT-header view inside the arena.
pub(crate) fn copy_image(
    image: &PeImage<'_>,
    arena: &Arena,
) -> Result<NonNull<native::NtHeaders>, PeError> {
    let bytes = image.bytes();
    let headers_len = image.size_of_headers();

    if headers_len > bytes.len() || headers_len > arena.size() {
        return Err(PeError::OutOfBounds);
    }
    // The header copy must cover the NT headers for the in-arena view to
    // be meaningful.
    if image.nt_offset() + size_of::<native::NtHeaders>() > headers_len {
        return Err(PeError::OutOfBounds);
    }

    debug!(
        "map: copying {headers_len:#x} header bytes and {} section(s)",
        image.number_of_sections()
    );

    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), arena.base(), headers_len);
    }

    for index in 0..image.number_of_sections() {
        let section = image.section_header(index).ok_or(PeError::OutOfBounds)?;

        if section.SizeOfRawData == 0 {
            trace!("map: section {index} has no raw data, left zero-filled");
            continue;
        }

        let raw_len = section.SizeOfRawData as usize;
        let src_offset = section.PointerToRawData as usize;
        if src_offset
            .checked_add(raw_len)
            .filter(|&end| end <= bytes.len())
            .is_none()
        {
            return Err(PeError::OutOfBounds);
        }

        let dst = arena
            .slice_at(section.VirtualAddress as usize, raw_len)
            .ok_or(PeError::OutOfBounds)?;

        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr().add(src_offset), dst, raw_len);
        }
    }

    // Downstream consumers (and the image itself) must observe the actual
    // base in the optional header.
    let nt_ptr = unsafe { arena.base().add(image.nt_offset()) } as *mut native::NtHeaders;
    unsafe {
        let mut nt = ptr::read_unaligned(nt_ptr);
        nt.OptionalHeader.ImageBase = arena.base() as usize as _;
        ptr::write_unaligned(nt_ptr, nt);
    }

    NonNull::new(nt_ptr).ok_or(PeError::OutOfBounds)
}

/// Applies base relocations to the mapped image.
///
/// `delta` is the difference between the actual and preferred bases. Each
/// block's 16-bit entries carry a 4-bit type and a 12-bit page offset:
/// `HIGHLOW` and `DIR64` patch a pointer-sized word by adding the delta,
/// `ABSOLUTE` entries are alignment padding, and any other type is skipped
/// the way the Windows loader treats types it does not emit.
pub(crate) fn apply_relocations(
    image: &PeImage<'_>,
    arena: &Arena,
    delta: isize,
) -> Result<(), PeError> {
    if delta == 0 {
        debug!("reloc: image loaded at preferred base");
        return Ok(());
    }

    let dir = image.reloc_directory();
    if dir.VirtualAddress == 0 || dir.Size == 0 {
        debug!("reloc: image carries no relocation directory");
        return Ok(());
    }

    let dir_start = dir.VirtualAddress as usize;
    let dir_end = dir_start
        .checked_add(dir.Size as usize)
        .filter(|&end| end <= arena.size())
        .ok_or(PeError::RelocationOutOfBounds)?;

    let mut offset = dir_start;
    while offset < dir_end {
        let block: IMAGE_BASE_RELOCATION = arena
            .read_at(offset)
            .ok_or(PeError::RelocationOutOfBounds)?;
        if block.VirtualAddress == 0 || block.SizeOfBlock == 0 {
            break;
        }

        let block_size = block.SizeOfBlock as usize;
        let block_end = offset
            .checked_add(block_size)
            .ok_or(PeError::RelocationOutOfBounds)?;
        if block_size < size_of::<IMAGE_BASE_RELOCATION>() || block_end > dir_end {
            return Err(PeError::RelocationOutOfBounds);
        }

        let entry_count = (block_size - size_of::<IMAGE_BASE_RELOCATION>()) / size_of::<u16>();
        let entries = offset + size_of::<IMAGE_BASE_RELOCATION>();

        for i in 0..entry_count {
            let raw: u16 = arena
                .read_at(entries + i * size_of::<u16>())
                .ok_or(PeError::RelocationOutOfBounds)?;
            let kind = (raw >> 12) as u32;
            let target = (block.VirtualAddress as usize)
                .checked_add((raw & 0x0FFF) as usize)
                .ok_or(PeError::RelocationOutOfBounds)?;

            match kind {
                IMAGE_REL_BASED_ABSOLUTE => {} // padding entry
                IMAGE_REL_BASED_HIGHLOW | IMAGE_REL_BASED_DIR64 => {
                    let patch = arena
                        .slice_at(target, size_of::<usize>())
                        .ok_or(PeError::RelocationOutOfBounds)?;
                    unsafe {
                        let value = ptr::read_unaligned(patch as *const usize);
                        ptr::write_unaligned(
                            patch as *mut usize,
                            value.wrapping_add(delta as usize),
                        );
                    }
                }
                other => {
                    trace!("reloc: skipping entry type {other} at rva {target:#x}");
                }
            }
        }

        offset += block_size;
    }

    info!("reloc: base relocations applied (delta {delta:#x})");
    Ok(())
}

/// Host-loader handles acquired while resolving imports.
///
/// Handles are released with `FreeLibrary` on drop, so a failed load rolls
/// back the dependencies it pulled in and an unload returns them to the OS
/// loader's reference counting.
#[derive(Default)]
pub(crate) struct Dependencies(Vec<HMODULE>);

impl Dependencies {
    fn push(&mut self, module: HMODULE) {
        self.0.push(module);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Drop for Dependencies {
    fn drop(&mut self) {
        for module in self.0.drain(..) {
            unsafe {
                FreeLibrary(module);
            }
        }
    }
}

/// Resolves the Import Address Table.
///
/// Walks the import descriptor list, loads each referenced module through
/// the host OS loader, resolves every imported symbol by name or ordinal,
/// and writes the resolved addresses into the IAT. Any unresolvable module
/// or symbol fails the load.
pub(crate) fn resolve_imports(
    image: &PeImage<'_>,
    arena: &Arena,
) -> Result<Dependencies, PeError> {
    let mut dependencies = Dependencies::default();

    let dir = image.import_directory();
    if dir.VirtualAddress == 0 || dir.Size == 0 {
        debug!("imports: no import directory present");
        return Ok(dependencies);
    }

    let mut offset = dir.VirtualAddress as usize;
    loop {
        let descriptor: IMAGE_IMPORT_DESCRIPTOR =
            arena.read_at(offset).ok_or(PeError::OutOfBounds)?;
        if descriptor.Name == 0 {
            break;
        }

        let dll_name = arena
            .cstr_at(descriptor.Name as usize)
            .ok_or(PeError::OutOfBounds)?;
        let dll = dll_name.to_string_lossy().into_owned();
        trace!("imports: loading '{dll}'");

        let module = unsafe { LoadLibraryA(dll_name.as_ptr() as PCSTR) };
        if module == 0 {
            error!("imports: host loader could not resolve '{dll}'");
            return Err(PeError::DependencyLoadFailed(dll));
        }
        dependencies.push(module);

        let oft_rva = unsafe { descriptor.Anonymous.OriginalFirstThunk };
        let ft_rva = descriptor.FirstThunk;
        if ft_rva == 0 {
            return Err(PeError::ImportResolveFailed {
                dll,
                symbol: "<empty IAT>".to_string(),
            });
        }

        // The import-name table is the untouched lookup data; fall back to
        // the IAT when the linker omitted it.
        let lookup_rva = if oft_rva != 0 {
            oft_rva
        } else {
            warn!("imports: '{dll}' has no import-name table, using the IAT for lookup");
            ft_rva
        };

        resolve_thunks_for_dll(arena, module, &dll, lookup_rva as usize, ft_rva as usize)?;

        offset += size_of::<IMAGE_IMPORT_DESCRIPTOR>();
    }

    info!(
        "imports: IAT resolved ({} dependencies)",
        dependencies.len()
    );
    Ok(dependencies)
}

/// Walks one descriptor's lookup/IAT thunk pair and patches the IAT.
fn resolve_thunks_for_dll(
    arena: &Arena,
    module: HMODULE,
    dll: &str,
    mut lookup: usize,
    mut iat: usize,
) -> Result<(), PeError> {
    loop {
        let thunk: native::ThunkData = arena.read_at(lookup).ok_or(PeError::OutOfBounds)?;
        let entry = unsafe { thunk.u1.AddressOfData };
        if entry == 0 {
            break;
        }

        let address = if (entry & native::ORDINAL_FLAG) != 0 {
            let ordinal = (entry & 0xFFFF) as u16;
            let resolved = unsafe { GetProcAddress(module, ordinal as usize as PCSTR) };
            resolved.ok_or_else(|| PeError::ImportResolveFailed {
                dll: dll.to_string(),
                symbol: format!("#{ordinal}"),
            })? as usize
        } else {
            // The entry is an RVA to an IMPORT_BY_NAME record; the name
            // starts after the 2-byte hint.
            let name_offset = (entry as usize)
                .checked_add(size_of::<u16>())
                .ok_or(PeError::OutOfBounds)?;
            let name = arena.cstr_at(name_offset).ok_or(PeError::OutOfBounds)?;
            let resolved = unsafe { GetProcAddress(module, name.as_ptr() as PCSTR) };
            resolved.ok_or_else(|| PeError::ImportResolveFailed {
                dll: dll.to_string(),
                symbol: name.to_string_lossy().into_owned(),
            })? as usize
        };

        let slot = arena
            .slice_at(iat, size_of::<native::ThunkData>())
            .ok_or(PeError::OutOfBounds)?;
        unsafe {
            let mut patched = ptr::read_unaligned(slot as *const native::ThunkData);
            patched.u1.Function = address as _;
            ptr::write_unaligned(slot as *mut native::ThunkData, patched);
        }

        lookup += size_of::<native::ThunkData>();
        iat += size_of::<native::ThunkData>();
    }

    Ok(())
}

/// Applies each section's final page protection derived from its
/// characteristics.
///
/// Sections without raw data are skipped and keep the arena's read-write
/// protection.
pub(crate) fn finalize_sections(
    image: &PeImage<'_>,
    arena: &Arena,
    page_size: usize,
) -> Result<(), PeError> {
    for index in 0..image.number_of_sections() {
        let section = image.section_header(index).ok_or(PeError::OutOfBounds)?;

        if section.SizeOfRawData == 0 {
            trace!("protect: section {index} has no raw data, skipping");
            continue;
        }

        let virtual_size = unsafe { section.Misc.VirtualSize } as usize;
        let size = cmp::max(virtual_size, section.SizeOfRawData as usize);

        arena
            .slice_at(section.VirtualAddress as usize, size)
            .ok_or(PeError::OutOfBounds)?;

        let protection = section_protection(section.Characteristics);
        let address = align_down(
            arena.base() as usize + section.VirtualAddress as usize,
            page_size,
        );

        let mut old = 0u32;
        let ok = unsafe { VirtualProtect(address as *const c_void, size, protection, &mut old) };
        if ok == 0 {
            return Err(PeError::SectionProtectionFailed { index });
        }
    }

    info!("protect: section protections applied");
    Ok(())
}

/// Maps a section's R/W/X characteristics to a Win32 page protection.
pub(crate) fn section_protection(characteristics: u32) -> u32 {
    let execute = (characteristics & IMAGE_SCN_MEM_EXECUTE) != 0;
    let write = (characteristics & IMAGE_SCN_MEM_WRITE) != 0;
    let read = (characteristics & IMAGE_SCN_MEM_READ) != 0;

    if execute {
        if write {
            PAGE_EXECUTE_READWRITE
        } else {
            PAGE_EXECUTE_READ
        }
    } else if write {
        PAGE_READWRITE
    } else if read {
        PAGE_READONLY
    } else {
        PAGE_NOACCESS
    }
}
