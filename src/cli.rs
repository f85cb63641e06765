use anyhow::Result;
use clap::{Parser, Subcommand};
use lambda_build_models::{BuildError, BuildSecret, Config};
use lambda_build_packaging::{BuildService, DockerBackend, ProjectLoader};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "lambda-build")]
#[command(about = "Build container images for serverless Python functions")]
#[command(version)]
pub struct Cli {
    /// Config file (default: lambda-build.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and tag the function image
    Build {
        /// Image reference to tag the result as
        #[arg(short, long)]
        tag: Option<String>,

        /// Read the VCS token from this file instead of the environment
        #[arg(long)]
        secret_file: Option<PathBuf>,

        /// Skip scanning the finished image for the token
        #[arg(long)]
        no_audit: bool,
    },

    /// Print the build as a single Dockerfile
    Render,

    /// Validate the config and manifest and print the stage plan
    Check,

    /// Print the entrypoint recorded on an image
    Inspect {
        /// Image id or reference
        image: String,
    },
}

/// The token comes from a file or the configured environment variable,
/// never from an argument value.
pub fn read_secret(config: &Config, secret_file: Option<&PathBuf>) -> Result<Option<BuildSecret>, BuildError> {
    if !config.vcs.auth {
        return Ok(None);
    }
    if let Some(path) = secret_file {
        return BuildSecret::from_file(path).map(Some);
    }
    match BuildSecret::from_env(&config.vcs.secret_env) {
        Ok(secret) => Ok(Some(secret)),
        Err(BuildError::MissingSecret { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Applies the `build` flags on top of the loaded config and validates the
/// result again.
pub fn apply_build_overrides(config: &mut Config, tag: Option<String>, no_audit: bool) -> Result<(), BuildError> {
    if let Some(tag) = tag {
        config.output.tag = tag;
    }
    if no_audit {
        config.output.audit = false;
    }
    config.validate()
}

fn report(err: &BuildError) -> ExitCode {
    let shape = err.to_error_shape();
    match shape.stage {
        Some(stage) => error!("Build failed at stage {}: {}", stage, shape.error_message),
        None => error!("Build failed: {}", shape.error_message),
    }
    if let Ok(json) = serde_json::to_string(&shape) {
        eprintln!("{json}");
    }
    ExitCode::FAILURE
}

pub async fn run_cli(cli: Cli) -> Result<ExitCode> {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return Ok(report(&e)),
    };

    match cli.command {
        Commands::Build {
            tag,
            secret_file,
            no_audit,
        } => {
            if let Err(e) = apply_build_overrides(&mut config, tag, no_audit) {
                return Ok(report(&e));
            }
            let secret = match read_secret(&config, secret_file.as_ref()) {
                Ok(secret) => secret,
                Err(e) => return Ok(report(&e)),
            };
            let backend = match DockerBackend::new(&config.docker) {
                Ok(backend) => backend,
                Err(e) => return Ok(report(&e)),
            };
            let service = BuildService::new(config, backend);
            match service.build(secret).await {
                Ok(outcome) => {
                    info!("Image {} tagged {}", outcome.image_id, outcome.tag);
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(report(&e)),
            }
        }
        Commands::Render => match ProjectLoader::new(&config).render() {
            Ok(dockerfile) => {
                print!("{dockerfile}");
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => Ok(report(&e)),
        },
        Commands::Check => match ProjectLoader::new(&config).check() {
            Ok(check) => {
                for (i, stage) in check.stages.iter().enumerate() {
                    let note = if stage.commits_layer() { "" } else { " (no layer)" };
                    println!("{:>2}. {stage}{note}", i + 1);
                }
                println!(
                    "packages: {} ({} from VCS), base pinned: {}, digest: {}",
                    check.packages, check.vcs_packages, check.base_pinned, check.digest
                );
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => Ok(report(&e)),
        },
        Commands::Inspect { image } => {
            let backend = match DockerBackend::new(&config.docker) {
                Ok(backend) => backend,
                Err(e) => return Ok(report(&e)),
            };
            match BuildService::new(config, backend).inspect(&image).await {
                Ok(Some(entrypoint)) => {
                    println!("{entrypoint}");
                    Ok(ExitCode::SUCCESS)
                }
                Ok(None) => {
                    println!("<none>");
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => Ok(report(&e)),
            }
        }
    }
}
