//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use stow_common::{ContainerId, VolumeId};

use crate::bind::{BindResolver, format_binds, parse_binds};
use crate::mount::{MountTable, Scope};
use crate::runtime::{Runtime, RuntimeConfig};
use crate::volume::{VolumeBackend, VolumeSpec};

/// stow - volumes and container mount namespaces
#[derive(Parser)]
#[command(name = "stow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for stow data
    #[arg(
        long,
        global = true,
        env = "STOW_ROOT",
        default_value = "/var/lib/stow"
    )]
    pub root: PathBuf,

    /// Runtime directory (staging point lives here)
    #[arg(long, global = true, env = "STOW_RUNTIME_DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show a mount table
    Mounts {
        /// Read the table of this process instead of our own
        #[arg(long)]
        pid: Option<u32>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve a path inside a root the way bind targets are resolved
    Resolve {
        /// Effective root
        #[arg(long)]
        root: PathBuf,

        /// Path to resolve
        target: PathBuf,

        /// Maximum number of symlinks to follow
        #[arg(long, default_value_t = crate::bind::MAX_SYMLINKS)]
        max_symlinks: usize,
    },

    /// Parse a bind specification and print it normalized
    ParseBind {
        /// `source target [flags]` entries separated by ';'
        spec: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage volumes
    #[command(subcommand)]
    Volume(VolumeCommands),

    /// Run a container through start and stop against the in-memory model
    Scenario {
        /// Print tables as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Volume commands.
#[derive(Subcommand)]
pub enum VolumeCommands {
    /// Create a volume
    Create {
        /// Backend (plain, overlay, bind, rbind)
        #[arg(short, long, default_value = "plain")]
        backend: VolumeBackend,

        /// Storage directory
        #[arg(short, long)]
        storage: Option<PathBuf>,

        /// Overlay layer, lowest first; repeat for more
        #[arg(short, long = "layer")]
        layers: Vec<PathBuf>,

        /// Mount point
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Mount read-only
        #[arg(long)]
        read_only: bool,

        /// Owning container; repeat for more
        #[arg(long = "owner")]
        owners: Vec<ContainerId>,
    },

    /// Destroy a volume
    Destroy {
        /// Volume id
        id: VolumeId,
    },

    /// List volumes
    List {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// The runtime configuration described by the global flags.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        let config = RuntimeConfig::default().with_root(self.root.clone());
        match &self.runtime_dir {
            Some(dir) => config.with_runtime_dir(dir.clone()),
            None => config,
        }
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = self.config();

        match self.command {
            Commands::Mounts { pid, json } => {
                let table = match pid {
                    Some(pid) => MountTable::read_pid(pid),
                    None => MountTable::read_self(),
                }
                .wrap_err("Failed to read mount table")?;
                print_table(&table, json)
            }

            Commands::Resolve {
                root,
                target,
                max_symlinks,
            } => {
                let resolved = BindResolver::new(max_symlinks).resolve(&root, &target)?;
                println!("{}", resolved.display());
                Ok(())
            }

            Commands::ParseBind { spec, json } => {
                let binds = parse_binds(&spec)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&binds)?);
                } else {
                    println!("{}", format_binds(&binds));
                }
                Ok(())
            }

            Commands::Volume(command) => {
                tokio::task::spawn_blocking(move || volume_command(config, command)).await?
            }

            Commands::Scenario { json } => {
                tokio::task::spawn_blocking(move || scenario(json)).await?
            }
        }
    }
}

fn volume_command(config: RuntimeConfig, command: VolumeCommands) -> Result<()> {
    let runtime = Runtime::new(config).wrap_err("Failed to open runtime")?;

    match command {
        VolumeCommands::Create {
            backend,
            storage,
            layers,
            path,
            read_only,
            owners,
        } => {
            let spec = VolumeSpec {
                backend,
                storage,
                layers,
                path,
                owners: owners.into_iter().collect(),
                read_only,
                origin: None,
            };
            let volume = runtime
                .create_volume(spec)
                .wrap_err("Failed to create volume")?;
            println!("{} {}", volume.id, volume.path.display());
            Ok(())
        }

        VolumeCommands::Destroy { id } => {
            runtime
                .destroy_volume(&id)
                .wrap_err_with(|| format!("Failed to destroy volume {id}"))?;
            println!("Volume {id} destroyed");
            Ok(())
        }

        VolumeCommands::List { json } => {
            let volumes = runtime.volumes();
            if json {
                println!("{}", serde_json::to_string_pretty(&volumes)?);
            } else {
                println!("ID\tBACKEND\tRO\tPATH");
                for v in volumes {
                    println!("{}\t{}\t{}\t{}", v.id, v.backend, v.read_only, v.path.display());
                }
            }
            Ok(())
        }
    }
}

/// A chrooted container with a read-only bind and a link, on the graph model.
fn scenario(json: bool) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let config = RuntimeConfig::default()
        .with_root(scratch.path().join("lib"))
        .simulated();
    let mut events = config.event_bus.subscribe();
    let runtime = Runtime::new(config)?;

    let data = runtime.create_volume(VolumeSpec::new(VolumeBackend::Plain))?;
    let rootfs = scratch.path().join("rootfs");
    std::fs::create_dir_all(&rootfs)?;

    let binds = parse_binds(&format!("{} /data ro", data.path.display()))?;
    let id = runtime.run("demo", Some(rootfs), binds)?;
    runtime.link(&data.id, &id, "/linked", false)?;

    let scope = Scope::Container(id.clone());
    println!("# host");
    print_table(&runtime.mounts(&Scope::Host)?, json)?;
    println!("# {scope}");
    print_table(&runtime.mounts(&scope)?, json)?;

    runtime.stop(&id)?;
    runtime.destroy(&id)?;
    runtime.destroy_volume(&data.id)?;

    println!("# events");
    while let Ok(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }
    if runtime.volumes().is_empty() {
        Ok(())
    } else {
        Err(eyre!("volumes left behind by the scenario"))
    }
}

fn print_table(table: &MountTable, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(table)?);
    } else {
        print!("{table}");
    }
    Ok(())
}
