use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use sparsepix::degrade::Reduction;
use sparsepix::error::Error;
use sparsepix::healpix;
use sparsepix::io::{self, MapKind};
use sparsepix::map::SparseMap;
use sparsepix::value::Dtype;

#[derive(Parser)]
#[command(name = "sparsepix", about = "Inspect and transform sparse HEALPix map files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print header and coverage information for a map file.
    Info {
        /// Path to a sparse map file.
        file: PathBuf,
    },

    /// Reduce a map to a coarser resolution and write the result.
    Degrade {
        /// Path to the input sparse map file.
        input: PathBuf,

        /// Output path for the degraded map.
        output: PathBuf,

        /// Target sparse nside.
        #[arg(long)]
        nside: u32,

        /// Reduction over each cell group: mean, median, std, max or min.
        #[arg(long, default_value = "mean")]
        reduction: String,

        /// Overwrite the output file if it exists.
        #[arg(long)]
        clobber: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { file } => cmd_info(&file),
        Commands::Degrade {
            input,
            output,
            nside,
            reduction,
            clobber,
        } => cmd_degrade(&input, &output, nside, &reduction, clobber),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn cmd_info(file: &Path) -> Result<(), Error> {
    let info = io::read_info(file)?;

    let kind = match info.kind {
        MapKind::Scalar => "scalar",
        MapKind::MultiField => "multi-field",
    };
    println!("file:            {}", file.display());
    println!("kind:            {kind}");
    println!("nside coverage:  {}", info.nside_coverage);
    println!("nside sparse:    {}", info.nside_sparse);

    let n_cov_cells = healpix::npix(info.nside_coverage);
    println!(
        "covered cells:   {} of {} ({:.4}% of the sky)",
        info.n_covered,
        n_cov_cells,
        100.0 * info.n_covered as f64 / n_cov_cells as f64
    );
    println!("storage rows:    {}", info.n_rows);

    for field in &info.fields {
        let name = if field.name.is_empty() {
            "(value)".to_string()
        } else {
            field.name.clone()
        };
        let primary = if info.kind == MapKind::MultiField && field.name == info.primary {
            "  [primary]"
        } else {
            ""
        };
        println!(
            "field:           {name} ({:?}, fill {}){primary}",
            field.dtype, field.fill
        );
    }
    Ok(())
}

fn cmd_degrade(
    input: &Path,
    output: &Path,
    nside: u32,
    reduction: &str,
    clobber: bool,
) -> Result<(), Error> {
    let reduction: Reduction = reduction.parse()?;

    let info = io::read_info(input)?;
    if info.kind == MapKind::MultiField {
        return Err(Error::Unsupported(
            "degrade of a multi-field file; project a field first".into(),
        ));
    }

    match info.fields[0].dtype {
        Dtype::F64 => SparseMap::<f64>::read(input)?
            .degrade(nside, reduction)?
            .write(output, clobber)?,
        Dtype::F32 => SparseMap::<f32>::read(input)?
            .degrade(nside, reduction)?
            .write(output, clobber)?,
        Dtype::I64 => SparseMap::<i64>::read(input)?
            .degrade(nside, reduction)?
            .write(output, clobber)?,
        Dtype::I32 => SparseMap::<i32>::read(input)?
            .degrade(nside, reduction)?
            .write(output, clobber)?,
    }

    println!(
        "degraded {} -> {} at nside {nside}",
        input.display(),
        output.display()
    );
    Ok(())
}
