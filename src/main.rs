mod args;
mod config;
mod error;
mod fft;
mod noise;
mod pipeline;
mod plot;
mod reassemble;
mod record;
mod redshift;
mod segment;
mod sensitivity;

use clap::{CommandFactory, Parser};
use log::{error, info, warn};

use args::{resolve_batch, resolve_cpu, resolve_output_path, Args};
use config::RunConfig;
use error::{DynError, MockError};
use pipeline::MockPipeline;
use redshift::load_boundaries;
use sensitivity::SensitivityCatalog;

fn run(args: &Args) -> Result<(), MockError> {
    let cfg = RunConfig::from_args(args)?;

    let available_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let threads = resolve_cpu(args.cpu, available_cores)?;
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .map_err(|e| MockError::Configuration(format!("failed to initialise rayon thread pool: {e}")))?;

    let input = resolve_batch(&cfg.input_dir, args.batch)?;
    let output = resolve_output_path(&cfg.output_dir, &input)?;
    let catalog = SensitivityCatalog::discover(&cfg.catalog, cfg.model, cfg.table_order)?;
    let boundaries = load_boundaries(&cfg.boundaries)?;

    info!("Starting mock creation with the following settings:");
    info!("  model:      {}", cfg.model);
    info!("  catalog:    {} ({} tables)", cfg.catalog.display(), catalog.len());
    info!("  boundaries: {} ({} sub-bands)", cfg.boundaries.display(), boundaries.len());
    match &cfg.redshifts {
        Some(path) => info!("  redshifts:  {} (tabulated)", path.display()),
        None => info!(
            "  redshifts:  flat LCDM, H0 = {}, z_start = {}, z_max = {}",
            cfg.h0, cfg.z_start, cfg.z_max
        ),
    }
    info!("  box:        {} Mpc", cfg.box_length_mpc);
    info!("  threshold:  {}", cfg.mask_threshold);
    match cfg.seed {
        Some(seed) => info!("  seed:       {seed}"),
        None => info!("  seed:       entropy"),
    }
    info!("  cpu:        {threads} of {available_cores}");
    info!("  input:      {}", input.display());
    info!("  output:     {}", output.display());

    let mut pipeline = MockPipeline::from_config(&cfg, &catalog, boundaries)?;
    if let Some(dir) = &cfg.plot_dir {
        match pipeline.plot_sensitivity(dir) {
            Ok(path) => info!("sensitivity curves: {}", path.display()),
            Err(e) => warn!("{e}"),
        }
    }

    pipeline
        .run_batch(&input, &output, cfg.plot_dir.as_deref())
        .map_err(|e| {
            error!("batch {} aborted; completed records kept in {}", input.display(), output.display());
            e
        })?;
    Ok(())
}

fn main() -> Result<(), DynError> {
    if std::env::args_os().len() == 1 {
        Args::command().print_help()?;
        println!();
        return Ok(());
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("{e}");
        return Err(e.into());
    }
    Ok(())
}
