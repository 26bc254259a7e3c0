#![cfg(all(windows, target_arch = "x86_64"))]
//! Load/unload lifecycle tests against synthetic in-memory DLL images.

mod common;

use common::*;
use memmod::{MemoryModule, PeError};

type NoArgFn = unsafe extern "system" fn() -> i32;

fn call_i32(f: Option<unsafe extern "system" fn() -> isize>) -> i32 {
    let f = f.expect("export should resolve");
    let f: NoArgFn = unsafe { std::mem::transmute(f) };
    unsafe { f() }
}

#[test]
fn load_reports_loaded_state() {
    let image = sample_dll();
    let mut module = MemoryModule::new();

    module.load(&image).unwrap();

    assert!(module.is_loaded());
    assert!(module.is_valid());
    assert!(module.is_64_bit());
    assert!(!module.base_address().is_null());
    assert!(module.image_size() >= SIZE_OF_IMAGE);
    assert_eq!(module.image_size() % 0x1000, 0);
}

#[test]
fn exports_resolve_and_execute() {
    let image = sample_dll();
    let mut module = MemoryModule::new();
    module.load(&image).unwrap();

    assert_eq!(call_i32(module.get_proc_address("alpha")), 42);
    assert_eq!(call_i32(module.get_proc_address("beta")), 7);

    // A fully numeric name falls back to ordinal lookup.
    assert_eq!(call_i32(module.get_proc_address("2")), 7);

    assert!(module.get_proc_address("gamma").is_none());
    assert!(module.get_proc_address("").is_none());
}

#[test]
fn unload_clears_state() {
    let image = sample_dll();
    let mut module = MemoryModule::new();
    module.load(&image).unwrap();

    assert!(module.unload());

    assert!(!module.is_loaded());
    assert!(!module.is_valid());
    assert!(!module.is_64_bit());
    assert!(module.base_address().is_null());
    assert_eq!(module.image_size(), 0);
    assert_eq!(module.export_count(), 0);
    assert!(module.get_proc_address("alpha").is_none());
    assert_eq!(module.module_name(), "");

    // Idempotent.
    assert!(module.unload());
}

#[test]
fn repeated_load_replaces_previous_image() {
    let image = sample_dll();
    let mut module = MemoryModule::new();

    module.load(&image).unwrap();
    module.load(&image).unwrap();

    assert!(module.is_loaded());
    assert_eq!(module.export_count(), 2);
    assert_eq!(call_i32(module.get_proc_address("alpha")), 42);

    module.unload();
    module.load(&image).unwrap();
    assert_eq!(module.export_count(), 2);
}

#[test]
fn truncated_buffer_fails_without_side_effects() {
    let image = sample_dll();
    let mut module = MemoryModule::new();

    let err = module.load(&image[..63]).unwrap_err();
    assert!(matches!(err, PeError::BufferTooSmall));
    assert!(!module.is_loaded());
    assert!(module.base_address().is_null());
}

#[test]
fn lfanew_past_buffer_end_fails() {
    let mut image = sample_dll();
    let len = image.len() as u32;
    image[0x3C..0x40].copy_from_slice(&len.to_le_bytes());

    let mut module = MemoryModule::new();
    let err = module.load(&image).unwrap_err();
    assert!(matches!(err, PeError::OutOfBounds));
    assert!(!module.is_loaded());
}

#[test]
fn foreign_machine_fails() {
    let image = build_image(&ImageSpec {
        machine: MACHINE_I386,
        ..ImageSpec::default()
    });

    let mut module = MemoryModule::new();
    let err = module.load(&image).unwrap_err();
    assert!(matches!(err, PeError::MachineMismatch(_)));
    assert!(!module.is_loaded());
}

#[test]
fn missing_dependency_rolls_back() {
    let image = build_image(&ImageSpec {
        import: Some(("memmod_no_such_dependency.dll", "Whatever")),
        ..ImageSpec::default()
    });

    let mut module = MemoryModule::new();
    let err = module.load(&image).unwrap_err();
    assert!(matches!(err, PeError::DependencyLoadFailed(_)));
    assert!(!module.is_loaded());
    assert!(module.base_address().is_null());
    assert_eq!(module.export_count(), 0);
}

#[test]
fn missing_symbol_rolls_back() {
    let image = build_image(&ImageSpec {
        import: Some(("kernel32.dll", "MemmodDefinitelyMissingExport")),
        ..ImageSpec::default()
    });

    let mut module = MemoryModule::new();
    let err = module.load(&image).unwrap_err();
    assert!(matches!(err, PeError::ImportResolveFailed { .. }));
    assert!(!module.is_loaded());
}

#[test]
fn import_resolution_patches_iat() {
    let image = build_image(&ImageSpec {
        import: Some(("kernel32.dll", "GetTickCount")),
        ..ImageSpec::default()
    });

    let mut module = MemoryModule::new();
    module.load(&image).unwrap();

    let slot = read_u64_at(module.base_address(), RVA_IAT);
    assert_ne!(slot, 0);
    assert_ne!(slot, RVA_IMPORT_BY_NAME as u64);
}

#[test]
fn relocations_adjust_absolute_pointers() {
    let image = sample_dll();

    // Two live handles cannot share the preferred base, so at least one of
    // them is rebased; the invariant must hold for both.
    let mut first = MemoryModule::new();
    let mut second = MemoryModule::new();
    first.load(&image).unwrap();
    second.load(&image).unwrap();

    let bases = [first.base_address(), second.base_address()];
    assert_ne!(bases[0], bases[1]);
    assert!(
        bases.iter().any(|&b| b as u64 != PREFERRED_BASE),
        "at least one image must be rebased"
    );

    for base in bases {
        let expected = base as u64 + RVA_ALPHA as u64;
        assert_eq!(read_u64_at(base, RVA_ABS_SLOT), expected);
    }

    assert_eq!(call_i32(first.get_proc_address("alpha")), 42);
    assert_eq!(call_i32(second.get_proc_address("alpha")), 42);
}

#[test]
fn dll_entry_point_runs_on_attach() {
    let image = build_image(&ImageSpec {
        entry_point: ENTRY_OK,
        ..ImageSpec::default()
    });

    let mut module = MemoryModule::new();
    module.load(&image).unwrap();

    assert_eq!(read_u32_at(module.base_address(), RVA_ENTRY_COUNTER), 1);
}

#[test]
fn executable_entry_point_is_not_invoked() {
    let image = build_image(&ImageSpec {
        entry_point: ENTRY_OK,
        dll: false,
        ..ImageSpec::default()
    });

    let mut module = MemoryModule::new();
    module.load(&image).unwrap();

    assert_eq!(read_u32_at(module.base_address(), RVA_ENTRY_COUNTER), 0);
}

#[test]
fn refused_attach_fails_load() {
    let image = build_image(&ImageSpec {
        entry_point: ENTRY_FAIL,
        ..ImageSpec::default()
    });

    let mut module = MemoryModule::new();
    let err = module.load(&image).unwrap_err();
    assert!(matches!(err, PeError::EntryPointFailed));
    assert!(!module.is_loaded());
    assert!(module.base_address().is_null());
}

#[test]
fn tls_callbacks_run_before_entry() {
    let image = build_image(&ImageSpec {
        with_tls: true,
        ..ImageSpec::default()
    });

    let mut module = MemoryModule::new();
    module.load(&image).unwrap();
    assert_eq!(read_u32_at(module.base_address(), RVA_TLS_COUNTER), 1);

    // Without a TLS directory entry the callback never runs.
    let plain = sample_dll();
    module.load(&plain).unwrap();
    assert_eq!(read_u32_at(module.base_address(), RVA_TLS_COUNTER), 0);
}

#[test]
fn moved_handle_keeps_the_image() {
    let image = sample_dll();
    let mut module = MemoryModule::new();
    module.load(&image).unwrap();
    let base = module.base_address();

    let moved = module;
    assert_eq!(moved.base_address(), base);
    assert_eq!(call_i32(moved.get_proc_address("alpha")), 42);
    drop(moved);
}

#[test]
fn concurrent_export_queries() {
    let image = sample_dll();
    let mut module = MemoryModule::new();
    module.load(&image).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    assert!(module.get_proc_address("alpha").is_some());
                    assert_eq!(module.get_export_list().len(), 2);
                    assert_eq!(module.get_function_ordinal("beta"), Some(2));
                }
            });
        }
    });
}
