use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tinct_core::settings::{ProgramKind, Settings, ShaderCaps};
use tinct_core::Compiler;

#[derive(Parser)]
#[command(name = "tinct")]
#[command(about = "A shading-language compiler targeting GLSL, Metal, SPIR-V and a lane VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Vertex,
    Fragment,
    Geometry,
}

impl From<Kind> for ProgramKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Vertex => ProgramKind::Vertex,
            Kind::Fragment => ProgramKind::Fragment,
            Kind::Geometry => ProgramKind::Geometry,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Target {
    Glsl,
    Metal,
    Spirv,
}

impl Target {
    fn extension(self) -> &'static str {
        match self {
            Target::Glsl => "glsl",
            Target::Metal => "metal",
            Target::Spirv => "spv",
        }
    }
}

/// Flags that map onto compiler `Settings`.
#[derive(clap::Args, Debug)]
struct SettingsArgs {
    /// Run the inliner before code generation
    #[arg(long)]
    optimize: bool,

    /// Render target is bottom-up
    #[arg(long)]
    flip_y: bool,

    /// Target an ES 2 class device with every workaround enabled
    #[arg(long)]
    legacy: bool,

    /// Set an sk_Caps value, e.g. `--cap mustGuard=true`
    #[arg(long = "cap", value_name = "NAME=VALUE")]
    caps: Vec<String>,

    /// Node count above which multiply-called functions are not inlined
    #[arg(long, value_name = "N")]
    inline_threshold: Option<usize>,
}

impl SettingsArgs {
    fn to_settings(&self) -> Result<Settings, DriverError> {
        let mut settings = Settings {
            optimize: self.optimize,
            flip_y: self.flip_y,
            ..Settings::default()
        };
        if self.legacy {
            settings.caps = ShaderCaps::legacy_es2();
        }
        if let Some(threshold) = self.inline_threshold {
            settings.inline_threshold = threshold;
        }
        for cap in &self.caps {
            settings.set_cap_from_str(cap).map_err(DriverError::InvalidArgument)?;
        }
        Ok(settings)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file
    Compile {
        /// Input source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        #[arg(long, value_enum, default_value = "fragment")]
        kind: Kind,

        #[arg(long, value_enum, default_value = "spirv")]
        target: Target,

        /// Output file (defaults to input name with the target's extension)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Validate a source file without generating output
    Check {
        /// Input source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        #[arg(long, value_enum, default_value = "fragment")]
        kind: Kind,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Run a pipeline program's `main(float2 coords)` on the lane VM
    Run {
        /// Input source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Comma-separated `coords.x` value for each lane
        #[arg(long, value_delimiter = ',', default_value = "0")]
        lanes: Vec<f32>,

        /// Comma-separated uniform slot values, in declaration order
        #[arg(long, value_delimiter = ',')]
        uniforms: Vec<f32>,

        /// Print the lane program before running it
        #[arg(long)]
        dump: bool,

        #[command(flatten)]
        settings: SettingsArgs,
    },
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Compilation error: {0}")]
    CompilationError(#[from] tinct_core::error::CompilerError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { input, kind, target, output, settings } => {
            let settings = settings.to_settings()?;
            compile_file(&input, kind, target, output, settings)
                .with_context(|| format!("failed to compile {}", input.display()))?;
        }
        Commands::Check { input, kind, settings } => {
            let settings = settings.to_settings()?;
            check_file(&input, kind, settings).with_context(|| format!("{} is not valid", input.display()))?;
        }
        Commands::Run { input, lanes, uniforms, dump, settings } => {
            let settings = settings.to_settings()?;
            run_file(&input, &lanes, &uniforms, dump, settings)
                .with_context(|| format!("failed to run {}", input.display()))?;
        }
    }

    Ok(())
}

fn compile_file(
    input: &Path,
    kind: Kind,
    target: Target,
    output: Option<PathBuf>,
    settings: Settings,
) -> Result<(), DriverError> {
    info!("Compiling {} as a {:?} shader", input.display(), kind);
    let source = fs::read_to_string(input)?;
    let compiled = Compiler::new(settings).compile(kind.into(), &source)?;

    let output_path = output.unwrap_or_else(|| input.with_extension(target.extension()));
    match target {
        Target::Glsl => fs::write(&output_path, compiled.to_glsl()?)?,
        Target::Metal => fs::write(&output_path, compiled.to_metal()?)?,
        Target::Spirv => {
            let spirv = compiled.to_spirv()?;
            let mut file = fs::File::create(&output_path)?;
            for word in &spirv {
                file.write_all(&word.to_le_bytes())?;
            }
        }
    }

    info!("Successfully compiled to {}", output_path.display());
    Ok(())
}

fn check_file(input: &Path, kind: Kind, settings: Settings) -> Result<(), DriverError> {
    info!("Checking {}...", input.display());
    let source = fs::read_to_string(input)?;
    Compiler::new(settings).convert(kind.into(), &source)?;
    println!("{} is valid", input.display());
    Ok(())
}

fn run_file(
    input: &Path,
    lanes: &[f32],
    uniforms: &[f32],
    dump: bool,
    settings: Settings,
) -> Result<(), DriverError> {
    info!("Running {} over {} lanes", input.display(), lanes.len());
    let source = fs::read_to_string(input)?;
    let program = Compiler::new(settings).compile(ProgramKind::Pipeline, &source)?.to_vm("main")?;
    if dump {
        print!("{}", program);
    }

    let args = match program.argument_count() {
        0 => Vec::new(),
        2 => vec![lanes.to_vec(), vec![0.0; lanes.len()]],
        n => {
            return Err(DriverError::InvalidArgument(format!(
                "main takes {} argument slots; expected none or float2 coordinates",
                n
            )))
        }
    };
    let results = program.eval(lanes.len(), &args, uniforms)?;
    for (slot, values) in results.iter().enumerate() {
        let values: Vec<String> = values.iter().map(f32::to_string).collect();
        println!("result[{}] = {}", slot, values.join(", "));
    }
    Ok(())
}
