//! rk-sketch CLI
//!
//! Loads a sketch document, runs area detection, evaluates parameters and
//! prints reports.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glam::DVec3;
use std::path::{Path, PathBuf};

use rk_sketch::{Axis, Document, SketchSettings};

mod config;

use config::{CONFIG_FILE, CliConfig, Format};

#[derive(Parser)]
#[command(name = "rk-sketch")]
#[command(about = "Parametric sketch documents: area detection and parameter evaluation", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Document encoding, overriding the file extension
    #[arg(short, long, global = true, value_enum)]
    format: Option<Format>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the closed areas of every sketch
    Detect {
        /// Document file
        file: PathBuf,
        /// Replace the stored areas with the detected ones and save
        #[arg(short, long)]
        write: bool,
    },
    /// List parameters with their values and formulas
    Params {
        /// Document file
        file: PathBuf,
    },
    /// Set a global parameter to a number or formula and save
    Set {
        /// Document file
        file: PathBuf,
        /// Parameter name
        name: String,
        /// Number or formula text
        value: String,
    },
    /// Display information about a document
    Info {
        /// Document file
        file: PathBuf,
    },
    /// Write a sample document
    Demo {
        /// Output file
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref().unwrap_or(Path::new(CONFIG_FILE)))?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Detect { file, write } => detect(&config, &file, cli.format, write)?,
        Commands::Params { file } => list_params(&config, &file, cli.format)?,
        Commands::Set { file, name, value } => set_param(&config, &file, cli.format, &name, &value)?,
        Commands::Info { file } => show_info(&config, &file, cli.format)?,
        Commands::Demo { out } => demo(&config, &out, cli.format)?,
    }

    Ok(())
}

fn init_logging(config: &CliConfig, verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default = if verbose {
        "rk_sketch=debug,rk_sketch_cli=debug".to_string()
    } else {
        config.log_filter.clone()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// ============== Document I/O ==============

fn open(config: &CliConfig, path: &Path, flag: Option<Format>) -> Result<Document> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let doc = match config.format_for(path, flag) {
        Format::Ron => Document::from_ron(&content),
        Format::Json => Document::from_json(&content),
    }
    .with_context(|| format!("Failed to load {}", path.display()))?;

    for skipped in &doc.load_report().skipped {
        tracing::warn!(
            "Dropped {} reference of {} {}: {} is missing",
            skipped.role,
            skipped.owner.type_name(),
            skipped.owner.id(),
            skipped.target
        );
    }
    Ok(doc)
}

fn write(config: &CliConfig, doc: &Document, path: &Path, flag: Option<Format>) -> Result<()> {
    let content = match config.format_for(path, flag) {
        Format::Ron => doc.to_ron(),
        Format::Json => doc.to_json(),
    }?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("Saved {}", path.display());
    Ok(())
}

// ============== Commands ==============

fn detect(config: &CliConfig, path: &Path, flag: Option<Format>, save: bool) -> Result<()> {
    let mut doc = open(config, path, flag)?;

    let ids = doc.sketch_ids().to_vec();
    for id in ids {
        let created = doc.edit_sketch(id, |s, _| s.create_all_areas())?;
        let Some(sketch) = doc.sketch(id) else { continue };
        println!("Sketch '{}': {} area(s)", sketch.name(), created.len());
        for area in created.iter().filter_map(|a| sketch.area(*a)) {
            let names: Vec<&str> = area
                .edge_ids()
                .iter()
                .filter_map(|e| sketch.edge(*e))
                .map(|e| e.name())
                .collect();
            if names.is_empty() {
                println!("  {}", area.name());
            } else {
                println!("  {}: {}", area.name(), names.join(", "));
            }
        }
    }

    if save {
        write(config, &doc, path, flag)?;
    }
    Ok(())
}

fn list_params(config: &CliConfig, path: &Path, flag: Option<Format>) -> Result<()> {
    let doc = open(config, path, flag)?;
    let params = doc.params();

    let mut scopes = vec![doc.root_scope()];
    scopes.extend(doc.sketches().map(|s| s.scope()));
    for scope_id in scopes {
        let Some(scope) = params.scope(scope_id) else { continue };
        if scope.is_empty() {
            continue;
        }
        println!("[{}]", scope.name());
        for param in scope.parameters().filter(|p| !p.hidden()) {
            match params.formula_text(param.id) {
                Some(formula) => println!("  {} = {} ({})", param.name(), param.value(), formula),
                None => println!("  {} = {}", param.name(), param.value()),
            }
        }
    }
    Ok(())
}

fn set_param(config: &CliConfig, path: &Path, flag: Option<Format>, name: &str, value: &str) -> Result<()> {
    let mut doc = open(config, path, flag)?;
    let Some(id) = doc.find_parameter(name) else {
        anyhow::bail!("No global parameter named '{}'", name);
    };

    match value.trim().parse::<f64>() {
        Ok(number) => doc.set_parameter_value(id, number)?,
        Err(_) => doc.set_parameter_formula(id, value)?,
    }
    let result = doc.params().value(id).unwrap_or(f64::NAN);
    println!("{} = {}", name, result);

    write(config, &doc, path, flag)
}

fn show_info(config: &CliConfig, path: &Path, flag: Option<Format>) -> Result<()> {
    let doc = open(config, path, flag)?;
    let parameters: usize = doc.params().scopes().map(|s| s.len()).sum();

    println!("Document: {}", doc.name);
    println!("  Parameters: {}", parameters);
    println!("  Sketches: {}", doc.sketch_ids().len());
    for sketch in doc.sketches() {
        println!(
            "    {}: {} key point(s), {} edge(s), {} area(s)",
            sketch.name(),
            sketch.key_point_ids().len(),
            sketch.edge_ids().len(),
            sketch.area_ids().len()
        );
        if !sketch.text_ids().is_empty() || !sketch.sketch_instance_ids().is_empty() {
            println!(
                "      {} text(s), {} inserted sketch(es)",
                sketch.text_ids().len(),
                sketch.sketch_instance_ids().len()
            );
        }
        if let Some((min, max)) = sketch.limits() {
            println!("      bounds: ({}, {}) - ({}, {})", min.x, min.y, max.x, max.y);
        }
    }
    let skipped = doc.load_report().skipped.len();
    if skipped > 0 {
        println!("  Unresolved references: {}", skipped);
    }
    Ok(())
}

/// A rectangle driven by `width`/`height` with one rounded corner, and a
/// bow-tie whose two lobes meet at a single vertex
fn demo(config: &CliConfig, path: &Path, flag: Option<Format>) -> Result<()> {
    let mut doc = Document::new("Demo");
    let settings = SketchSettings::default().with_coincidence_threshold(config.default_threshold);

    let width = doc.create_parameter(None, Some("width"), 4.0)?;
    let height = doc.create_parameter(None, Some("height"), 0.0)?;
    doc.set_parameter_formula(height, "width / 2")?;
    let radius = doc.create_parameter(None, Some("radius"), 0.5)?;

    let plate = doc.create_sketch_with_settings("Plate", settings.clone())?;
    doc.edit_sketch(plate, |s, params| {
        let corners = [(0.0, 0.0), (4.0, 0.0), (4.0, 2.0), (0.0, 2.0)];
        let kps: Vec<_> = corners
            .iter()
            .map(|(x, y)| s.create_key_point(DVec3::new(*x, *y, 0.0)))
            .collect();
        s.bind_key_point_axis(params, kps[1], Axis::X, width)?;
        s.bind_key_point_axis(params, kps[2], Axis::X, width)?;
        s.bind_key_point_axis(params, kps[2], Axis::Y, height)?;
        s.bind_key_point_axis(params, kps[3], Axis::Y, height)?;
        for i in 0..kps.len() {
            s.create_line_edge(kps[i], kps[(i + 1) % kps.len()])?;
        }
        s.create_fillet_edge(params, kps[2], radius)?;
        s.create_text(kps[0], "Plate", 0.2)?;
        s.create_all_areas()
    })?;

    let bowtie = doc.create_sketch_with_settings("Bowtie", settings)?;
    doc.edit_sketch(bowtie, |s, _| {
        let points = [(0.0, 0.0), (-1.0, 1.0), (-1.0, -1.0), (1.0, 1.0), (1.0, -1.0)];
        let kps: Vec<_> = points
            .iter()
            .map(|(x, y)| s.create_key_point(DVec3::new(*x, *y, 0.0)))
            .collect();
        for (a, b) in [(0, 1), (1, 2), (2, 0), (0, 3), (3, 4), (4, 0)] {
            s.create_line_edge(kps[a], kps[b])?;
        }
        s.create_all_areas()
    })?;

    write(config, &doc, path, flag)?;
    println!("Wrote demo document to {}", path.display());
    Ok(())
}
