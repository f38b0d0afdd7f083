use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, WrapErr};
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use warpsim::{Config, ProgramImage, Simulator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ImageFormat {
    /// Flat little-endian instruction words.
    Bin,
    /// Structured image with data and shared segments.
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the program as an address-annotated listing.
    Disasm,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Cycle-level SIMT GPU simulator", long_about = None)]
struct Options {
    /// Program image to simulate.
    program: PathBuf,

    /// Image format; inferred from the extension when omitted.
    #[arg(short, long, value_enum)]
    format: Option<ImageFormat>,

    /// Load address for flat binary images.
    #[arg(long, default_value_t = 0)]
    base: u32,

    /// Configuration file (JSON); defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the event trace as CSV.
    #[arg(short, long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Write the statistics, JSON by default or CSV for a .csv path.
    #[arg(short, long, value_name = "FILE")]
    stats: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

fn open_writable(path: &Path) -> Result<BufWriter<File>, std::io::Error> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(BufWriter::new(file))
}

fn load_image(options: &Options) -> eyre::Result<ProgramImage> {
    let format = options.format.unwrap_or_else(|| {
        match options.program.extension().and_then(|e| e.to_str()) {
            Some("json") => ImageFormat::Json,
            _ => ImageFormat::Bin,
        }
    });
    let image = match format {
        ImageFormat::Bin => ProgramImage::read_binary(&options.program, options.base)?,
        ImageFormat::Json => {
            let file = File::open(&options.program)?;
            ProgramImage::from_json(file)?
        }
    };
    Ok(image)
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();

    let config: Config = match &options.config {
        Some(path) => {
            let file = File::open(path).wrap_err_with(|| format!("open config {path:?}"))?;
            serde_json::from_reader(file).wrap_err_with(|| format!("parse config {path:?}"))?
        }
        None => Config::default(),
    };

    let image = load_image(&options)
        .wrap_err_with(|| format!("load program image {:?}", options.program))?;

    if let Some(Command::Disasm) = options.command {
        print!("{}", warpsim::disasm::listing(&image));
        return Ok(());
    }

    let mut sim = Simulator::new(config, &image)?;
    let result = sim.run();

    if let Some(path) = &options.trace {
        let writer = open_writable(path).wrap_err_with(|| format!("open trace {path:?}"))?;
        sim.trace().write_csv(writer)?;
    }
    if let Some(path) = &options.stats {
        let writer = open_writable(path).wrap_err_with(|| format!("open stats {path:?}"))?;
        if path.extension().and_then(|e| e.to_str()) == Some("csv") {
            sim.statistics().write_csv(writer)?;
        } else {
            serde_json::to_writer_pretty(writer, sim.statistics())?;
        }
    }

    println!("{}", sim.statistics());

    if let Err(err) = result {
        eprintln!("simulation failed: {err}");
    }
    let status = sim.exit_status();
    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}
