use std::ffi::c_void;
use std::mem::{self, size_of};
use std::ptr;

use log::{debug, trace};
use windows_sys::Win32::System::SystemServices::{
    DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, PIMAGE_TLS_CALLBACK,
};

use crate::arch::native;
use crate::arena::Arena;
use crate::errors::PeError;
use crate::pe_parser::PeImage;

/// DLL entry point type (`DllMain`).
type DllEntryProc =
    unsafe extern "system" fn(module: *mut c_void, reason: u32, reserved: *mut c_void) -> i32;

/// Invokes the image's TLS callbacks with a process-attach notification.
///
/// TLS callbacks, when present, must run before the entry point. The
/// callback array holds absolute pointers that relocation has already
/// adjusted, terminated by a null entry.
pub(crate) fn run_tls_callbacks(image: &PeImage<'_>, arena: &Arena) -> Result<(), PeError> {
    let dir = image.tls_directory();
    if dir.VirtualAddress == 0 {
        return Ok(());
    }

    let tls: native::TlsDirectory = arena
        .read_at(dir.VirtualAddress as usize)
        .ok_or(PeError::OutOfBounds)?;
    if tls.AddressOfCallBacks == 0 {
        return Ok(());
    }

    // The callback array is addressed by VA; it must land inside the image.
    let mut slot = (tls.AddressOfCallBacks as usize)
        .checked_sub(arena.base() as usize)
        .ok_or(PeError::OutOfBounds)?;

    loop {
        let callback: PIMAGE_TLS_CALLBACK =
            arena.read_at(slot).ok_or(PeError::OutOfBounds)?;
        let Some(callback) = callback else { break };

        trace!("tls: invoking callback at {:#x}", callback as usize);
        unsafe {
            callback(arena.base() as *mut c_void, DLL_PROCESS_ATTACH, ptr::null_mut());
        }

        slot += size_of::<PIMAGE_TLS_CALLBACK>();
    }

    debug!("tls: callbacks executed");
    Ok(())
}

/// Invokes `DllMain(DLL_PROCESS_ATTACH)` on a DLL image.
///
/// Returns `true` when an attach notification was delivered and accepted,
/// `false` when the image has no entry point or is not a DLL (executable
/// entry points are started by the caller, not the loader). A refused
/// attach fails the load.
pub(crate) fn attach_entry_point(image: &PeImage<'_>, arena: &Arena) -> Result<bool, PeError> {
    let rva = image.entry_point_rva();
    if rva == 0 {
        return Ok(false);
    }
    if !image.is_dll() {
        debug!("entry: executable image, entry point left to the caller");
        return Ok(false);
    }

    let entry = arena.slice_at(rva as usize, 1).ok_or(PeError::OutOfBounds)?;
    let dll_main: DllEntryProc = unsafe { mem::transmute(entry) };

    debug!("entry: calling DllMain(DLL_PROCESS_ATTACH)");
    let accepted =
        unsafe { dll_main(arena.base() as *mut c_void, DLL_PROCESS_ATTACH, ptr::null_mut()) };
    if accepted == 0 {
        return Err(PeError::EntryPointFailed);
    }

    Ok(true)
}

/// Invokes `DllMain(DLL_PROCESS_DETACH)` during unload.
///
/// Must run before the arena is released; the entry point's return value
/// is ignored at this stage.
pub(crate) fn detach_entry_point(arena: &Arena, entry_rva: u32) {
    let Some(entry) = arena.slice_at(entry_rva as usize, 1) else {
        return;
    };
    let dll_main: DllEntryProc = unsafe { mem::transmute(entry) };

    debug!("entry: calling DllMain(DLL_PROCESS_DETACH)");
    unsafe {
        dll_main(arena.base() as *mut c_void, DLL_PROCESS_DETACH, ptr::null_mut());
    }
}
