//! Main entry point for the fmmt CLI app

use fmmt::cli::{self, Commands};
use fmmt::decompose::Decomposer;
use fmmt::device::Device;
use fmmt::rebuild::{rebuild_device, Rebuilder};
use fmmt::tools::{SystemRunner, ToolRegistry};
use std::fs;
use tracing_subscriber::EnvFilter;

fn main() -> std::process::ExitCode {
    init_logging();
    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("FMMT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::run()?;

    let mut registry = ToolRegistry::with_builtins();
    if let Some(conf) = cli::tool_conf_from_opt_or_env(args.tool_conf) {
        registry = registry.extend_from_file(&conf)?;
    }
    let runner = SystemRunner;

    match args.command {
        Commands::View { image, json } => {
            let mut device = Device::open(&image)?;
            Decomposer::new(&registry, &runner).decompose_all(&mut device)?;
            if json {
                println!("{}", fmmt::view::render_json(&device)?);
            } else {
                print!("{}", fmmt::view::render_text(&device)?);
            }
        }
        Commands::Extract { image, output } => {
            let mut device = Device::open(&image)?;
            Decomposer::new(&registry, &runner)
                .extract_to(&output)
                .decompose_all(&mut device)?;
            let leaves: u32 = device.volumes.iter().map(|v| v.leaf_count).sum();
            println!("Extracted {} leaf files to {}", leaves, output.display());
        }
        Commands::Rebuild {
            image,
            volume,
            output,
            work_dir,
        } => {
            let mut device = Device::open(&image)?;
            let index = device.volume_index(&volume)?;

            // Dropped (and removed) once the image is written.
            let temp = tempfile::tempdir()?;
            let work = work_dir.unwrap_or_else(|| temp.path().to_path_buf());

            Decomposer::new(&registry, &runner)
                .extract_to(work.join("leaves"))
                .decompose_volume(&mut device, index)?;
            let rebuilder = Rebuilder::new(&registry, &runner);
            let bytes = rebuild_device(&rebuilder, &mut device, index, &work.join("build"))?;
            fs::write(&output, bytes)?;
            println!("Rebuilt {} into {}", volume, output.display());
        }
    }

    Ok(())
}
