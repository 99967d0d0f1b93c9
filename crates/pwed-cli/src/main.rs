use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use pwed_core::xscale::{XscaleJob, DEFAULT_OUTPUT_NAME, DEFAULT_PROGRAM};
use pwed_core::{
    CancellationToken, EdConfig, ImageCollection, ImportAction, ImportControl, ImportError,
    ImportOptions,
};

#[derive(Parser)]
#[command(name = "pwed", version, about = "Import electron diffraction images and merge their reflections")]
struct Cli {
    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import SMV images matching a pattern into a new collection
    Import(ImportArgs),
    /// Write XSCALE.INP for XDS_ASCII files and run xscale
    Scale(ScaleArgs),
    /// Print a written collection
    Show {
        /// Collection file or the directory holding it
        collection: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Copy,
    AbsLink,
    RelLink,
}

impl From<ActionArg> for ImportAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Copy => ImportAction::Copy,
            ActionArg::AbsLink => ImportAction::AbsoluteLink,
            ActionArg::RelLink => ImportAction::RelativeLink,
        }
    }
}

#[derive(Args)]
struct ImportArgs {
    /// Directory the pattern is resolved against
    files_path: Option<PathBuf>,

    /// Pattern with {TI} (image id) and optionally {TS} (tilt series), e.g. "SMV/data/{TI}.img"
    pattern: Option<String>,

    /// Output directory (relative paths go under $SCIPION_ED_USERDATA)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Load import options from a JSON file; other flags override it
    #[arg(long)]
    options: Option<PathBuf>,

    /// How images are brought into <output>/extra
    #[arg(long, value_enum)]
    import_action: Option<ActionArg>,

    /// Flag every image whose id is a multiple of N as ignored
    #[arg(long)]
    skip_images: Option<u64>,

    /// Replace the rotation axis of every image, e.g. "0,1,0"
    #[arg(long)]
    rotation_axis: Option<String>,

    /// Fail on images whose header cannot be parsed
    #[arg(long)]
    strict_headers: bool,

    #[arg(long)]
    overwrite_size1: Option<String>,
    #[arg(long)]
    overwrite_size2: Option<String>,
    #[arg(long)]
    overwrite_pixel_size: Option<String>,
    #[arg(long)]
    overwrite_exposure_time: Option<String>,
    #[arg(long)]
    overwrite_detector_distance: Option<String>,
    #[arg(long)]
    overwrite_osc_start: Option<String>,
    #[arg(long)]
    overwrite_osc_range: Option<String>,
    #[arg(long)]
    overwrite_wavelength: Option<String>,
    #[arg(long)]
    overwrite_beam_center_x: Option<String>,
    #[arg(long)]
    overwrite_beam_center_y: Option<String>,

    /// Print the import result as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl ImportArgs {
    fn into_options(self) -> anyhow::Result<ImportOptions> {
        let mut options = match self.options {
            Some(ref path) => ImportOptions::from_json_file(path)
                .with_context(|| format!("loading options from {}", path.display()))?,
            None => {
                let (Some(files_path), Some(pattern), Some(output)) =
                    (self.files_path.clone(), self.pattern.clone(), self.output.clone())
                else {
                    bail!("files path, pattern and --output are required without --options");
                };
                ImportOptions::new(files_path, pattern, output)
            }
        };

        if let Some(files_path) = self.files_path {
            options.files_path = files_path;
        }
        if let Some(pattern) = self.pattern {
            options.files_pattern = pattern;
        }
        if let Some(output) = self.output {
            options.output = output;
        }
        if let Some(action) = self.import_action {
            options.import_action = action.into();
        }
        if self.skip_images.is_some() {
            options.skip_images = self.skip_images;
        }
        if self.rotation_axis.is_some() {
            options.replace_rotation_axis = true;
            options.rotation_axis = self.rotation_axis;
        }
        options.strict_headers |= self.strict_headers;

        let o = &mut options.overrides;
        let overwrite = [
            (&mut o.size1, self.overwrite_size1),
            (&mut o.size2, self.overwrite_size2),
            (&mut o.pixel_size, self.overwrite_pixel_size),
            (&mut o.exposure_time, self.overwrite_exposure_time),
            (&mut o.detector_distance, self.overwrite_detector_distance),
            (&mut o.osc_start, self.overwrite_osc_start),
            (&mut o.osc_range, self.overwrite_osc_range),
            (&mut o.wavelength, self.overwrite_wavelength),
            (&mut o.beam_center_x, self.overwrite_beam_center_x),
            (&mut o.beam_center_y, self.overwrite_beam_center_y),
        ];
        for (slot, value) in overwrite {
            if value.is_some() {
                *slot = value;
            }
        }
        Ok(options)
    }
}

#[derive(Args)]
struct ScaleArgs {
    /// XDS_ASCII reflection files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Working directory for XSCALE.INP and the merged output
    #[arg(short = 'd', long)]
    dir: PathBuf,

    #[arg(long, default_value = DEFAULT_OUTPUT_NAME)]
    output_name: String,

    /// Six cell constants, e.g. "10.2 10.2 30.1 90 90 120"
    #[arg(long)]
    unit_cell: Option<String>,

    #[arg(long)]
    space_group: Option<u32>,

    /// High resolution limit (Å)
    #[arg(long)]
    d_min: Option<f64>,

    /// Low resolution limit (Å)
    #[arg(long)]
    d_max: Option<f64>,

    #[arg(long)]
    save_correction_images: bool,

    #[arg(long, default_value = DEFAULT_PROGRAM)]
    program: String,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn run_import(args: ImportArgs) -> anyhow::Result<()> {
    let print_json = args.json;
    let options = args.into_options()?;
    let config = EdConfig::from_env();
    log::debug!("{:?}", options);
    log::debug!("user data directory: {}", config.user_data_dir.display());
    let t_total = std::time::Instant::now();

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling import...");
        handler_token.cancel();
    })
    .context("installing Ctrl-C handler")?;
    let control = ImportControl::new().with_cancel_token(token);

    let pb = ProgressBar::new(0);
    pb.set_style(ProgressStyle::default_bar().template("[{bar:40}] {pos}/{len} {msg}")?);
    let progress = {
        let pb = pb.clone();
        move |_stage: &str, current: u64, total: u64, message: &str| {
            pb.set_length(total);
            pb.set_position(current + 1);
            pb.set_message(message.to_string());
        }
    };

    let result = pwed_core::import_images_with_control(&options, &config, &control, &progress);
    pb.finish_and_clear();

    let result = match result {
        Ok(result) => result,
        Err(e) if matches!(e.downcast_ref::<ImportError>(), Some(ImportError::Cancelled)) => {
            eprintln!("Import cancelled, no collection written");
            std::process::exit(130);
        }
        Err(e) => return Err(e),
    };

    if print_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    eprintln!(
        "Done! {} images, {} ignored, {} partial, collection {} ({:.2}s)",
        result.total_images,
        result.ignored_images,
        result.partial_records,
        result.collection_path.display(),
        t_total.elapsed().as_secs_f64()
    );
    if !result.ignored_ranges.is_empty() {
        eprintln!("Ignored images: {}", format_ranges(&result.ignored_ranges));
    }
    Ok(())
}

fn run_scale(args: ScaleArgs) -> anyhow::Result<()> {
    let job = XscaleJob {
        input_files: args.inputs,
        output_name: args.output_name,
        unit_cell: args.unit_cell,
        space_group_number: args.space_group,
        d_min: args.d_min,
        d_max: args.d_max,
        save_correction_images: args.save_correction_images,
    };
    let exported = job.run(&args.dir, &args.program)?;
    eprintln!("Merged reflections written to {}", exported.path.display());
    Ok(())
}

fn run_show(path: PathBuf) -> anyhow::Result<()> {
    let path = if path.is_dir() {
        path.join(pwed_core::COLLECTION_FILENAME)
    } else {
        path
    };
    let collection = ImageCollection::open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let info = collection.info();

    println!("{}: {} images", path.display(), collection.len());
    println!(
        "  dim {:?}x{:?}  pixel size {:?} mm  wavelength {:?} Å",
        info.dim_x, info.dim_y, info.pixel_size_x, info.wavelength
    );
    let ignored = collection.ignored_ranges();
    if !ignored.is_empty() {
        println!("  ignored: {}", format_ranges(&ignored));
    }
    for record in &collection {
        println!(
            "{:>6} {} osc {:?}/{:?} dist {:?}{}{}",
            record.id,
            record.file_name.display(),
            record.osc_start,
            record.osc_range,
            record.distance,
            if record.ignore { " [ignored]" } else { "" },
            if record.is_partial() { " [partial]" } else { "" },
        );
    }
    Ok(())
}

fn format_ranges(ranges: &[(u64, u64)]) -> String {
    ranges
        .iter()
        .map(|&(first, last)| {
            if first == last {
                first.to_string()
            } else {
                format!("{}-{}", first, last)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Import(args) => run_import(args),
        Command::Scale(args) => run_scale(args),
        Command::Show { collection } => run_show(collection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ranges() {
        assert_eq!(format_ranges(&[(1, 3), (7, 7), (10, 12)]), "1-3, 7, 10-12");
        assert_eq!(format_ranges(&[]), "");
    }

    #[test]
    fn test_flags_build_options() {
        let cli = Cli::parse_from([
            "pwed",
            "import",
            "/data/exp12",
            "SMV/data/{TI}.img",
            "-o",
            "run1",
            "--import-action",
            "copy",
            "--skip-images",
            "10",
            "--rotation-axis",
            "0,1,0",
            "--overwrite-pixel-size",
            "0.028",
        ]);
        let Command::Import(args) = cli.command else {
            panic!("expected import");
        };
        let options = args.into_options().unwrap();
        assert_eq!(options.files_path, PathBuf::from("/data/exp12"));
        assert_eq!(options.import_action, ImportAction::Copy);
        assert_eq!(options.skip_images, Some(10));
        assert!(options.replace_rotation_axis);
        assert_eq!(options.rotation_axis_override(), Some("0,1,0"));
        assert_eq!(options.overrides.pixel_size.as_deref(), Some("0.028"));
        assert_eq!(options.overrides.wavelength, None);
    }

    #[test]
    fn test_missing_positionals_without_options_file() {
        let cli = Cli::parse_from(["pwed", "import", "/data/exp12"]);
        let Command::Import(args) = cli.command else {
            panic!("expected import");
        };
        assert!(args.into_options().is_err());
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
