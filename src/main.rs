//! Rasterkit CLI
//!
//! A small demonstration front end for the rasterkit library.

use anyhow::{bail, Context, Result};
use rasterkit::prelude::*;
use std::path::Path;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return;
    }

    let result = match args[1].as_str() {
        "info" => {
            if args.len() < 3 {
                eprintln!("Error: Please specify an image");
                return;
            }
            image_info(&args[2])
        }
        "header" => {
            if args.len() < 3 {
                eprintln!("Error: Please specify an image");
                return;
            }
            dump_header(&args[2])
        }
        "copy" => {
            if args.len() < 4 {
                eprintln!("Error: Please specify input and output paths");
                eprintln!(
                    "Usage: {} copy <input> <output> [--progress] [--config <file>]",
                    args[0]
                );
                return;
            }
            copy_image(&args[2..])
        }
        "raw" => {
            if args.len() < 7 {
                eprintln!("Error: Please specify a raw file, its geometry and an output");
                eprintln!(
                    "Usage: {} raw <input> <width> <height> <bands> <output> [--offset <bytes>]",
                    args[0]
                );
                return;
            }
            convert_raw(&args[2..])
        }
        "help" | "--help" | "-h" => {
            print_usage(&args[0]);
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(&args[0]);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage(program: &str) {
    println!("Rasterkit v{}", rasterkit::VERSION);
    println!();
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  info <image>                    Show a one-line summary and any problems");
    println!("  header <image>                  Dump the descriptor as JSON");
    println!("  copy <in> <out> [options]       Copy an image, converting format by suffix");
    println!("  raw <in> <w> <h> <bands> <out>  Wrap a headerless 8-bit file and save it");
    println!("  help                            Show this help message");
    println!();
    println!("Copy options:");
    println!("  --progress        Report evaluation progress");
    println!("  --config <file>   Load settings from a TOML file");
    println!();
    println!("Raw options:");
    println!("  --offset <bytes>  Bytes to skip before the first pixel (default: 0)");
    println!();
    println!("Environment:");
    println!("  RASTERKIT_PROGRESS, IM_PROGRESS   Enable progress reporting");
    println!("  RASTERKIT_DISC_THRESHOLD          Decode larger images via disc, e.g. 100m");
}

fn image_info(path: &str) -> Result<()> {
    let registry = Registry::global();
    let image = Image::new_from_file(&registry, path)
        .with_context(|| format!("unable to open {}", path))?;

    println!("{}", image.summary());
    println!(
        "  {} bytes, demand {:?}, mode \"{}\"",
        image.sizeof_image(),
        image.demand(),
        image.mode_string()
    );

    let problems = image.sanity();
    if problems.is_empty() {
        println!("✅ No problems found");
    } else {
        for problem in &problems {
            println!("⚠️  {}", problem);
        }
    }
    Ok(())
}

fn dump_header(path: &str) -> Result<()> {
    let registry = Registry::global();
    let image = Image::new_from_file(&registry, path)
        .with_context(|| format!("unable to open {}", path))?;
    let dump = serde_json::to_string_pretty(&image.dump())?;
    println!("{}", dump);
    Ok(())
}

fn copy_image(args: &[String]) -> Result<()> {
    let input_path = &args[0];
    let output_path = &args[1];

    let mut config = CoreConfig::from_env();
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--progress" => {
                config = config.with_progress(true);
                i += 1;
            }
            "--config" if i + 1 < args.len() => {
                let loaded = CoreConfig::load(Path::new(&args[i + 1]))
                    .with_context(|| format!("unable to load config {}", args[i + 1]))?;
                let progress = config.progress || loaded.progress;
                config = loaded.with_progress(progress);
                i += 2;
            }
            other => bail!("unknown option: {}", other),
        }
    }

    let registry = Registry::new(config);
    let input = Image::new_from_file(&registry, input_path)
        .with_context(|| format!("unable to open {}", input_path))?;
    println!("⚙️  {} -> {}", input.summary(), output_path);

    let output = Image::new_mode(&registry, output_path, "w")
        .with_context(|| format!("unable to create {}", output_path))?;
    input
        .write(&output)
        .with_context(|| format!("unable to write {}", output_path))?;

    println!("🎉 Image saved to: {}", output_path);
    Ok(())
}

fn convert_raw(args: &[String]) -> Result<()> {
    let input_path = &args[0];
    let width: u32 = args[1].parse().context("bad width")?;
    let height: u32 = args[2].parse().context("bad height")?;
    let bands: u32 = args[3].parse().context("bad bands")?;
    let output_path = &args[4];

    let mut offset = 0u64;
    let mut i = 5;
    while i < args.len() {
        match args[i].as_str() {
            "--offset" if i + 1 < args.len() => {
                offset = args[i + 1].parse().context("bad offset")?;
                i += 2;
            }
            other => bail!("unknown option: {}", other),
        }
    }

    let registry = Registry::global();
    let raw = Image::new_from_file_raw(&registry, input_path, width, height, bands, offset)
        .with_context(|| format!("unable to open raw file {}", input_path))?;

    let problems = raw.sanity();
    if !problems.is_empty() {
        bail!("bad raw geometry: {}", problems.join(", "));
    }

    raw.write_to_file(output_path)
        .with_context(|| format!("unable to write {}", output_path))?;
    println!("🎉 {} saved to: {}", raw.summary(), output_path);
    Ok(())
}
