use std::mem::{self, size_of};

use log::{debug, trace};
use windows_sys::Win32::Foundation::FARPROC;
use windows_sys::Win32::System::SystemServices::IMAGE_EXPORT_DIRECTORY;

use crate::arena::Arena;
use crate::errors::PeError;

/// One callable export of a loaded image.
#[derive(Debug, Clone)]
pub struct ExportInfo {
    /// Ordinal already biased by the export directory's `Base`.
    pub ordinal: u32,
    /// Raw function RVA from the `AddressOfFunctions` table.
    pub rva: u32,
    /// The export directory's ordinal base.
    pub ordinal_base: u32,
    /// Low 32 bits of the absolute virtual address.
    pub va: u32,
    /// Export name; empty for ordinal-only exports.
    pub name: String,
    /// Ready-to-call address inside the mapped image.
    pub address: FARPROC,
}

/// Fully parsed export directory of a mapped image.
pub(crate) struct ExportCatalog {
    /// The module name recorded in the directory's `Name` field.
    pub module_name: String,
    pub entries: Vec<ExportInfo>,
}

/// Walks the export directory at `export_dir_rva` and builds the catalog.
///
/// Every used slot of the `AddressOfFunctions` table yields one entry;
/// names are attached through the parallel `AddressOfNames` /
/// `AddressOfNameOrdinals` tables, and exports without a name table entry
/// surface with an empty name. Zero function RVAs mark unused ordinal
/// slots and are skipped.
pub(crate) fn build_catalog(arena: &Arena, export_dir_rva: u32) -> Result<ExportCatalog, PeError> {
    let mut catalog = ExportCatalog {
        module_name: String::new(),
        entries: Vec::new(),
    };

    if export_dir_rva == 0 {
        debug!("exports: image has no export directory");
        return Ok(catalog);
    }

    let directory: IMAGE_EXPORT_DIRECTORY = arena
        .read_at(export_dir_rva as usize)
        .ok_or(PeError::OutOfBounds)?;

    if directory.Name != 0 {
        if let Some(name) = arena.cstr_at(directory.Name as usize) {
            catalog.module_name = name.to_string_lossy().into_owned();
        }
    }

    let function_count = directory.NumberOfFunctions as usize;
    if function_count == 0 {
        return Ok(catalog);
    }

    let functions = directory.AddressOfFunctions as usize;
    let names = directory.AddressOfNames as usize;
    let ordinals = directory.AddressOfNameOrdinals as usize;
    let name_count = directory.NumberOfNames as usize;

    // Reject absurd table claims before sizing any allocation from them.
    arena
        .slice_at(functions, function_count.checked_mul(size_of::<u32>()).ok_or(PeError::OutOfBounds)?)
        .ok_or(PeError::OutOfBounds)?;
    if name_count != 0 {
        arena
            .slice_at(names, name_count * size_of::<u32>())
            .ok_or(PeError::OutOfBounds)?;
        arena
            .slice_at(ordinals, name_count * size_of::<u16>())
            .ok_or(PeError::OutOfBounds)?;
    }

    // names[i] pairs with ordinals[i], an index into the function table.
    let mut name_of = vec![String::new(); function_count];
    for i in 0..name_count {
        let name_rva: u32 = arena
            .read_at(names + i * size_of::<u32>())
            .ok_or(PeError::OutOfBounds)?;
        let index: u16 = arena
            .read_at(ordinals + i * size_of::<u16>())
            .ok_or(PeError::OutOfBounds)?;
        let name = arena
            .cstr_at(name_rva as usize)
            .ok_or(PeError::OutOfBounds)?;

        match name_of.get_mut(index as usize) {
            Some(slot) => *slot = name.to_string_lossy().into_owned(),
            None => trace!("exports: name table references out-of-range index {index}"),
        }
    }

    for index in 0..function_count {
        let rva: u32 = arena
            .read_at(functions + index * size_of::<u32>())
            .ok_or(PeError::OutOfBounds)?;
        if rva == 0 {
            // Unused ordinal slot.
            continue;
        }

        let address = arena.base() as usize + rva as usize;
        catalog.entries.push(ExportInfo {
            ordinal: index as u32 + directory.Base,
            rva,
            ordinal_base: directory.Base,
            va: address as u32,
            name: mem::take(&mut name_of[index]),
            address: unsafe { mem::transmute::<usize, FARPROC>(address) },
        });
    }

    debug!(
        "exports: catalog built with {} entries for '{}'",
        catalog.entries.len(),
        catalog.module_name
    );
    Ok(catalog)
}
