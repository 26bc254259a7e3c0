use std::error::Error as StdError;
use std::fs;

use env_logger::{Builder, Env};
use log::{info, LevelFilter};

use memmod::{AppError, MemoryModule};

use crate::arg_parser::parse_args;

mod arg_parser;

fn main() {
    init_logging();

    if let Err(err) = run() {
        log::error!("{err}");

        // Print chained causes (useful with #[from]).
        let mut source = err.source();
        while let Some(cause) = source {
            log::error!("  caused by: {cause}");
            source = cause.source();
        }

        std::process::exit(1);
    }
}

/// Initializes logging.
///
/// Behavior:
/// - Respects `RUST_LOG` (e.g. `RUST_LOG=memmod=debug`)
/// - Defaults to `info`
/// - Compact format with timestamp, level and target
fn init_logging() {
    let env = Env::default().filter_or("RUST_LOG", "info");

    Builder::from_env(env)
        .filter_level(LevelFilter::Info)
        .format(|buf, record| {
            use std::io::Write;

            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn run() -> Result<(), AppError> {
    let args = parse_args();

    let image = fs::read(&args.pe)?;
    info!("read '{}' ({} bytes)", args.pe, image.len());

    let mut module = MemoryModule::new();
    module.load(&image)?;

    print_module_info(&module);

    if args.exports {
        print_export_table(&module);
    }

    if let Some(name) = args.proc.as_deref() {
        match module.get_proc_address(name) {
            Some(address) => println!("{name} -> {:#x}", address as usize),
            None => println!("{name} -> not found"),
        }
    }

    if args.wait {
        println!("Press Enter to unload...");
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    }

    module.unload();
    Ok(())
}

fn print_module_info(module: &MemoryModule) {
    println!("=== Module Information ===");
    println!("Base Address: {:p}", module.base_address());
    println!("Image Size:   {} bytes", module.image_size());
    println!("Architecture: {}", if module.is_64_bit() { "x64" } else { "x86" });
    println!("Export Count: {}", module.export_count());
    println!("Module Name:  {}", module.module_name());
}

fn print_export_table(module: &MemoryModule) {
    let exports = module.get_export_list();

    println!("=== Export Table ===");
    println!("{:<5} {:<8} {:<10} {:<32} Address", "#", "Ordinal", "RVA", "Name");
    println!("{}", "-".repeat(72));

    for (i, export) in exports.iter().enumerate() {
        let address = export.address.map_or(0, |f| f as usize);
        let name = if export.name.is_empty() {
            "<ordinal only>"
        } else {
            export.name.as_str()
        };

        println!(
            "{:<5} {:<8} {:#010x} {:<32} {:#x}",
            i + 1,
            export.ordinal,
            export.rva,
            name,
            address
        );
    }
}
