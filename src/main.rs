//! nimp command line.
//!
//! # Usage
//!
//! ```bash
//! # Cook, stage and package the game for PS5
//! nimp package -p ps5 -c shipping
//!
//! # Only cook, iteratively, with shader debug info
//! nimp package -p win64 --steps cook --iterate --shader-debug-info
//!
//! # Publish binaries and fetch the latest ones elsewhere
//! nimp upload-fileset binaries --archive --compress -r 1234
//! nimp download-fileset binaries --track binaries
//!
//! # Prune the program symbol store
//! nimp symbol-server clean --identifier program -p win64
//!
//! # Check prerequisites without running anything
//! nimp check -p ps5
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

use nimp::artifact::{self, DownloadOptions, HashMethod, RevisionQuery};
use nimp::config::{LoadOptions, RunDescriptor};
use nimp::fileset::{stash, FileMapper};
use nimp::hooks::{self, Hook};
use nimp::logging::{self, Summary};
use nimp::package::{self, PackageConfiguration, PackageOptions, Step};
use nimp::platform::Platform;
use nimp::preflight::PreflightChecker;
use nimp::process::split_options;
use nimp::status::{TrackKind, WorkspaceStatus};
use nimp::symbols::{self, SymbolKind};
use nimp::{NimpError, Timer};

#[derive(Parser)]
#[command(name = "nimp")]
#[command(author, version, about = "Build, package and artifact orchestration for Unreal Engine projects", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Collect errors and warnings, then write them to a file or `stdout`
    #[arg(long, global = true, value_name = "FILE|stdout")]
    summary: Option<String>,

    /// Extra configuration layered over the project's
    #[arg(long, global = true, value_name = "FILE")]
    user_config: Option<PathBuf>,

    /// Select a project when the workspace has several
    #[arg(long, global = true)]
    uproject: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command that needs a run descriptor.
#[derive(Args, Debug, Clone, Default)]
struct CommonArgs {
    /// Target platform (win64, ps5, xsx, ...)
    #[arg(short, long)]
    platform: Option<String>,

    /// Configuration, `+`-separated (devel+shipping)
    #[arg(short, long)]
    configuration: Option<String>,

    /// Target (game, editor, tools)
    #[arg(short, long)]
    target: Option<String>,

    /// Revision
    #[arg(short, long)]
    revision: Option<String>,

    /// Branch
    #[arg(long)]
    branch: Option<String>,

    /// Log what would be done without doing it
    #[arg(long)]
    dry_run: bool,

    /// Free `key=value` parameters
    #[arg(value_name = "KEY=VALUE")]
    parameters: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Cook, stage, package and verify the project
    Package(PackageArgs),

    /// Publish a fileset to the artifact repository
    UploadFileset {
        /// Fileset name
        fileset: String,
        /// Store the artifact as a single zip
        #[arg(long)]
        archive: bool,
        /// Deflate zip entries
        #[arg(long)]
        compress: bool,
        /// Write a .torrent next to the artifact
        #[arg(long)]
        torrent: bool,
        /// Write a .hash file (sha1, sha256, sha512)
        #[arg(long)]
        hash: Option<HashMethod>,
        /// Replace an existing artifact
        #[arg(long)]
        force: bool,
        /// Index of this job in a sliced upload
        #[arg(long, requires = "slice_job_count")]
        slice_job_index: Option<u32>,
        /// Number of jobs in a sliced upload
        #[arg(long, requires = "slice_job_index")]
        slice_job_count: Option<u32>,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Download and install a published fileset
    DownloadFileset {
        /// Fileset name
        fileset: String,
        /// Oldest acceptable revision
        #[arg(long)]
        min_revision: Option<String>,
        /// Newest acceptable revision
        #[arg(long)]
        max_revision: Option<String>,
        /// Install below this directory instead of the root
        #[arg(long)]
        destination: Option<String>,
        /// Record the installed revision (binaries, symbols, package, staged)
        #[arg(long)]
        track: Option<TrackKind>,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Act on the files a fileset maps
    Fileset {
        #[command(subcommand)]
        action: FilesetAction,
    },

    /// Manage symbol servers
    SymbolServer {
        #[command(subcommand)]
        action: SymbolAction,
    },

    /// Run the packaging preflight checks
    Check {
        /// Steps to check for (cook, stage, package, verify)
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        steps: Option<Vec<Step>>,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show installed revisions
    Status {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Install a built package on a device (`device=<ip>`)
    Deploy {
        /// Package directory, defaults to the platform's package output
        #[arg(long)]
        directory: Option<String>,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Launch an installed package on a device (`device=<ip>`)
    Launch {
        /// Package or title name, defaults to the project's
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct PackageArgs {
    /// Steps to run (cook, stage, package, verify)
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    steps: Option<Vec<Step>>,
    /// Project variant from Config/Variants
    #[arg(long)]
    variant: Option<String>,
    /// Cook iteratively
    #[arg(long)]
    iterate: bool,
    /// Compress paks
    #[arg(long)]
    compress: bool,
    /// Final submission package
    #[arg(long = "final")]
    final_submission: bool,
    /// Package as DLC
    #[arg(long)]
    dlc: bool,
    /// Package as a patch
    #[arg(long)]
    patch: bool,
    /// Distribution build
    #[arg(long)]
    distribution: bool,
    /// PS4 regions to package
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    ps4_regions: Vec<String>,
    /// PS4 title directories to package
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    ps4_titles: Vec<String>,
    /// Extra options for the cooker and AutomationTool
    #[arg(long, allow_hyphen_values = true)]
    extra_options: Option<String>,
    /// Package Win64 as MSIXVC
    #[arg(long)]
    msixvc: bool,
    /// Write shader debug info while cooking
    #[arg(long)]
    shader_debug_info: bool,
    /// Stamp revisions in DefaultGame.ini
    #[arg(long)]
    write_project_revisions: bool,
    /// Track package loading while cooking
    #[arg(long)]
    trackloadpackage: bool,
    /// Layout file to package with
    #[arg(long)]
    layout: Option<String>,
    /// Replace existing packages
    #[arg(long)]
    force: bool,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand)]
enum FilesetAction {
    /// Print the mapping
    List {
        fileset: String,
        /// Line format with `{src}` and `{dst}`
        #[arg(long, default_value = "{src} => {dst}")]
        format: String,
        /// Write to a file instead of the log
        #[arg(long)]
        destination: Option<PathBuf>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Delete the mapped files
    Delete {
        fileset: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Move the mapped files into .nimp/stash
    Stash {
        fileset: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Move stashed files back
    Unstash {
        fileset: String,
        #[command(flatten)]
        common: CommonArgs,
    },
}

/// Flags shared by the symbol server commands.
#[derive(Args)]
struct SymbolArgs {
    /// Symbol server from [symbol_servers] (program, shaders)
    #[arg(long)]
    identifier: SymbolKind,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand)]
enum SymbolAction {
    /// Show the symbol count
    Status(SymbolArgs),
    /// Upload symbols
    Update {
        /// Source directory, defaults to the project's binaries or shader debug info
        #[arg(long)]
        source: Option<PathBuf>,
        /// Compress symbols in the store
        #[arg(long)]
        compress: bool,
        /// Product name recorded by symstore
        #[arg(long)]
        product: Option<String>,
        /// Comment recorded by symstore
        #[arg(long)]
        comment: Option<String>,
        /// Version recorded by symstore
        #[arg(long = "symbol-version")]
        version: Option<String>,
        /// Tag recorded by prospero-symupload
        #[arg(long)]
        tag: Option<String>,
        #[command(flatten)]
        args: SymbolArgs,
    },
    /// Remove expired symbols
    Clean(SymbolArgs),
}

fn main() {
    let cli = Cli::parse();

    let summary = match logging::init(cli.verbose, cli.summary.is_some()) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let ctx = Context {
        cli: &cli,
        summary: &summary,
    };
    let result = match &cli.command {
        Commands::Package(args) => cmd_package(&ctx, args),
        Commands::UploadFileset {
            fileset,
            archive,
            compress,
            torrent,
            hash,
            force,
            slice_job_index,
            slice_job_count,
            common,
        } => {
            let options = artifact::UploadOptions {
                archive: *archive,
                compress: *compress,
                torrent: *torrent,
                hash: *hash,
                force: *force,
                slice: slice_job_index.zip(*slice_job_count),
            };
            cmd_upload_fileset(&ctx, common, fileset, &options)
        }
        Commands::DownloadFileset {
            fileset,
            min_revision,
            max_revision,
            destination,
            track,
            common,
        } => {
            let options = DownloadOptions {
                query: RevisionQuery {
                    exact: common.revision.clone(),
                    min: min_revision.clone(),
                    max: max_revision.clone(),
                },
                destination: destination.clone(),
                track: *track,
            };
            cmd_download_fileset(&ctx, common, fileset, &options)
        }
        Commands::Fileset { action } => cmd_fileset(&ctx, action),
        Commands::SymbolServer { action } => cmd_symbol_server(&ctx, action),
        Commands::Check { steps, common } => cmd_check(&ctx, common, steps.as_deref()),
        Commands::Status { common } => cmd_status(&ctx, common),
        Commands::Deploy { directory, common } => cmd_deploy(&ctx, common, directory.as_deref()),
        Commands::Launch { name, common } => cmd_launch(&ctx, common, name.as_deref()),
    };

    if let Some(destination) = &cli.summary {
        if let Err(e) = summary.write_to(destination) {
            eprintln!("Error: {:#}", e);
        }
    }

    match result {
        Ok(()) => std::process::exit(logging::success_exit_code(&summary, cli.summary.is_some())),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// State shared by every command.
struct Context<'a> {
    cli: &'a Cli,
    summary: &'a Summary,
}

/// Load every configuration layer, export `[environment]` and pick up the
/// project's summary patterns.
fn load(ctx: &Context, common: &CommonArgs, variant: Option<&str>) -> Result<RunDescriptor> {
    let cli = ctx.cli;
    let options = LoadOptions {
        user_config: cli.user_config.clone(),
        uproject: cli.uproject.clone(),
        platform: common.platform.clone(),
        configuration: common.configuration.clone(),
        target: common.target.clone(),
        variant: variant.map(str::to_string),
        revision: common.revision.clone(),
        branch: common.branch.clone(),
        dry_run: common.dry_run,
        parameters: common.parameters.clone(),
    };
    let cwd = std::env::current_dir()?;
    let run = RunDescriptor::load(&cwd, &options)?;
    run.apply_environment();
    ctx.summary.extend_patterns(&run.settings().summary);
    Ok(run)
}

fn cmd_package(ctx: &Context, args: &PackageArgs) -> Result<()> {
    let run = load(ctx, &args.common, args.variant.as_deref())?;
    let extra_options = match &args.extra_options {
        Some(options) => split_options(options)?,
        None => Vec::new(),
    };
    let options = PackageOptions {
        steps: args.steps.clone().unwrap_or_else(|| Step::DEFAULT.to_vec()),
        iterate: args.iterate,
        compress: args.compress,
        final_submission: args.final_submission,
        dlc: args.dlc,
        patch: args.patch,
        distribution: args.distribution,
        msixvc: args.msixvc,
        shader_debug_info: args.shader_debug_info,
        write_project_revisions: args.write_project_revisions,
        trackloadpackage: args.trackloadpackage,
        force: args.force,
        extra_options,
        ps4_regions: args.ps4_regions.clone(),
        ps4_titles: args.ps4_titles.clone(),
        layout: args.layout.clone(),
    };

    let t = Timer::start("Package");
    package::run(&run, &options)?;
    t.finish();
    Ok(())
}

fn cmd_upload_fileset(ctx: &Context, common: &CommonArgs, fileset: &str, options: &artifact::UploadOptions) -> Result<()> {
    let run = load(ctx, common, None)?;
    let path = artifact::upload_fileset(&run, fileset, options)?;
    tracing::info!("Uploaded {}", path);
    Ok(())
}

fn cmd_download_fileset(ctx: &Context, common: &CommonArgs, fileset: &str, options: &DownloadOptions) -> Result<()> {
    let run = load(ctx, common, None)?;
    let artifact = artifact::download_fileset(&run, fileset, options)?;
    tracing::info!("Installed {} revision {}", fileset, artifact.revision);
    Ok(())
}

fn cmd_fileset(ctx: &Context, action: &FilesetAction) -> Result<()> {
    let no_overlay = BTreeMap::new();
    match action {
        FilesetAction::List {
            fileset,
            format,
            destination,
            common,
        } => {
            let run = load(ctx, common, None)?;
            let mapper = FileMapper::load(&run, fileset, &no_overlay)?;
            stash::list(&run, &mapper, format, destination.as_deref())
        }
        FilesetAction::Delete { fileset, common } => {
            let run = load(ctx, common, None)?;
            let mapper = FileMapper::load(&run, fileset, &no_overlay)?;
            stash::delete(&run, &mapper)
        }
        FilesetAction::Stash { fileset, common } => {
            let run = load(ctx, common, None)?;
            let mapper = FileMapper::load(&run, fileset, &no_overlay)?;
            stash::stash(&run, &mapper, fileset)
        }
        FilesetAction::Unstash { fileset, common } => {
            let run = load(ctx, common, None)?;
            stash::unstash(&run, fileset)
        }
    }
}

fn cmd_symbol_server(ctx: &Context, action: &SymbolAction) -> Result<()> {
    match action {
        SymbolAction::Status(args) => {
            let run = load(ctx, &args.common, None)?;
            symbols::status(&run, args.identifier)?;
        }
        SymbolAction::Update {
            source,
            compress,
            product,
            comment,
            version,
            tag,
            args,
        } => {
            let run = load(ctx, &args.common, None)?;
            let options = symbols::UploadOptions {
                product: product.clone(),
                comment: comment.clone(),
                version: version.clone(),
                tag: tag.clone(),
                compress: *compress,
                use_index2: true,
            };
            symbols::update(&run, args.identifier, source.as_deref(), &options)?;
        }
        SymbolAction::Clean(args) => {
            let run = load(ctx, &args.common, None)?;
            symbols::clean(&run, args.identifier)?;
        }
    }
    Ok(())
}

fn cmd_check(ctx: &Context, common: &CommonArgs, steps: Option<&[Step]>) -> Result<()> {
    let run = load(ctx, common, None)?;
    let options = PackageOptions {
        steps: steps.map(<[Step]>::to_vec).unwrap_or_else(|| Step::DEFAULT.to_vec()),
        ..Default::default()
    };
    let configuration = PackageConfiguration::new(&run, &options)?;
    let report = PreflightChecker::new(&run)
        .for_package(&configuration, &options.steps)
        .run()?;
    report.print_summary();

    if !report.is_ok() {
        anyhow::bail!(NimpError::config(format!(
            "{} preflight check(s) failed",
            report.errors().len()
        )));
    }
    Ok(())
}

fn cmd_status(ctx: &Context, common: &CommonArgs) -> Result<()> {
    let run = load(ctx, common, None)?;
    hooks::execute(Hook::Status, &run)?;
    let status = WorkspaceStatus::load(run.root_dir())?;

    println!("nimp workspace status");
    println!("=====================");
    println!("  Root:     {}", run.root_dir().display());
    if let Ok(uproject) = run.uproject() {
        println!("  Project:  {}", uproject);
    }
    if let Some(engine) = run.engine() {
        println!("  Engine:   {}", engine);
    }
    println!("  Platform: {}", run.platform().name());
    println!();

    for kind in [TrackKind::Binaries, TrackKind::Symbols, TrackKind::Package, TrackKind::Staged] {
        let entries = status.kind(kind);
        if entries.is_empty() {
            println!("{:<10} none", kind.name());
            continue;
        }
        println!("{}:", kind.name());
        for (key, value) in entries {
            println!("  {:<10} {}", key, value);
        }
    }
    Ok(())
}

fn cmd_deploy(ctx: &Context, common: &CommonArgs, directory: Option<&str>) -> Result<()> {
    let run = load(ctx, common, None)?;
    let platform = Platform::require(run.platform().name())?;
    let pattern = directory.unwrap_or(platform.package_directory_pattern());
    let directory = PathBuf::from(run.format(pattern)?);

    tracing::info!("Installing package from {}", directory.display());
    if !platform.install_package(&directory, &run)? {
        anyhow::bail!("Failed to install package on {}", platform.name());
    }
    Ok(())
}

fn cmd_launch(ctx: &Context, common: &CommonArgs, name: Option<&str>) -> Result<()> {
    let run = load(ctx, common, None)?;
    let platform = run.platform();
    hooks::execute(Hook::PreRun, &run)?;
    if !platform.launch_package(name, &run)? {
        anyhow::bail!("Failed to launch package on {}", platform.name());
    }
    hooks::execute(Hook::PostRun, &run)
}
