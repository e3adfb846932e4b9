//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};
use imgvol_common::SandboxId;
use imgvol_image::{ImageStore, Platform, import_layout};
use tabled::{Table, Tabled};

use crate::config::RuntimeConfig;
use crate::filesystem::canonicalize;
use crate::sandbox::FileSandboxStore;
use crate::volume::{ImageVolumeManager, MountSpec};

/// imgvol - Mount container images as read-only volumes
#[derive(Parser)]
#[command(name = "imgvol")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for imgvol data
    #[arg(long, global = true, env = "IMGVOL_ROOT")]
    pub root: Option<PathBuf>,

    /// State directory for mount targets
    #[arg(long, global = true, env = "IMGVOL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "IMGVOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Listing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table.
    Table,
    /// JSON.
    Json,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Mount an image volume for a sandbox and print its host path
    Mount {
        /// Sandbox ID
        #[arg(long)]
        sandbox: SandboxId,

        /// Image reference or image ID
        #[arg(long)]
        image: String,

        /// Path inside the container
        #[arg(long)]
        container_path: PathBuf,

        /// Snapshotter (default: the sandbox runtime's snapshotter)
        #[arg(long)]
        snapshotter: Option<String>,

        /// Platform to unpack (default: host)
        #[arg(long)]
        platform: Option<Platform>,
    },

    /// Unmount an image volume
    Unmount {
        /// Image reference the volume was mounted from
        #[arg(long)]
        image: String,

        /// Host path printed by `mount`
        #[arg(long)]
        host_path: PathBuf,

        /// Sandbox the volume belongs to (default: derived from the host path)
        #[arg(long)]
        sandbox: Option<SandboxId>,

        /// Snapshotter the volume was mounted with (default: the sandbox runtime's snapshotter)
        #[arg(long)]
        snapshotter: Option<String>,
    },

    /// Tear down every image volume of a sandbox
    Sweep {
        /// Sandbox ID
        #[arg(long)]
        sandbox: SandboxId,
    },

    /// Manage sandbox registrations
    Sandbox {
        /// Sandbox subcommand.
        #[command(subcommand)]
        command: SandboxCommands,
    },

    /// Manage local images
    Image {
        /// Image subcommand.
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Inspect GC leases
    Lease {
        /// Lease subcommand.
        #[command(subcommand)]
        command: LeaseCommands,
    },
}

/// Sandbox commands.
#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Register a sandbox and its runtime handler
    Register {
        /// Sandbox ID
        id: SandboxId,

        /// Runtime handler
        #[arg(long)]
        runtime_handler: String,
    },

    /// Remove a swept sandbox
    Rm {
        /// Sandbox ID
        id: SandboxId,
    },
}

/// Image commands.
#[derive(Subcommand)]
pub enum ImageCommands {
    /// Import an image from an OCI layout directory
    Import {
        /// OCI layout directory
        layout: PathBuf,

        /// Reference to tag the image with
        #[arg(long)]
        reference: String,

        /// Platform to import (default: host)
        #[arg(long)]
        platform: Option<Platform>,
    },

    /// List images
    Ls {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Remove an image tag
    Rm {
        /// Image reference
        reference: String,
    },
}

/// Lease commands.
#[derive(Subcommand)]
pub enum LeaseCommands {
    /// List leases
    Ls {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "REFERENCE")]
    reference: String,
    #[tabled(rename = "IMAGE ID")]
    id: String,
    #[tabled(rename = "PLATFORM")]
    platform: String,
    #[tabled(rename = "LAYERS")]
    layers: usize,
    #[tabled(rename = "SIZE")]
    size: u64,
}

#[derive(Tabled)]
struct LeaseRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "SNAPSHOTTER")]
    snapshotter: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl Cli {
    /// Build the runtime configuration from flags, environment and config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded.
    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(root) = &self.root {
            config = config.with_root(root);
        }
        if let Some(state) = &self.state_dir {
            config = config.with_state_dir(state);
        }
        Ok(config)
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = self.runtime_config()?;

        match self.command {
            Commands::Mount {
                sandbox,
                image,
                container_path,
                snapshotter,
                platform,
            } => {
                let snapshotter = resolve_snapshotter(&config, snapshotter, Some(&sandbox));
                let manager = ImageVolumeManager::local(config)?;

                let mut spec = MountSpec::image(container_path, image);
                manager
                    .mount_image_volume(
                        &mut spec,
                        &snapshotter,
                        &sandbox,
                        &platform.unwrap_or_default(),
                    )
                    .await
                    .wrap_err("Failed to mount image volume")?;

                println!("{}", spec.host_path.display());
                Ok(())
            }

            Commands::Unmount {
                image,
                host_path,
                sandbox,
                snapshotter,
            } => {
                let sandbox = sandbox.or_else(|| sandbox_of(&config, &host_path));
                let snapshotter = resolve_snapshotter(&config, snapshotter, sandbox.as_ref());
                let manager = ImageVolumeManager::local(config)?;

                let mut spec = MountSpec::image(PathBuf::new(), image);
                spec.host_path = host_path;
                manager
                    .unmount_image_volume(&spec, &snapshotter)
                    .await
                    .wrap_err("Failed to unmount image volume")?;
                Ok(())
            }

            Commands::Sweep { sandbox } => {
                let manager = ImageVolumeManager::local(config)?;
                manager
                    .sweep_pod_image_volumes(&sandbox)
                    .await
                    .wrap_err_with(|| format!("Failed to sweep sandbox {sandbox}"))?;
                Ok(())
            }

            Commands::Sandbox { command } => {
                let sandboxes = FileSandboxStore::new(config.paths.clone());
                match command {
                    SandboxCommands::Register {
                        id,
                        runtime_handler,
                    } => {
                        sandboxes.register(&id, &runtime_handler)?;
                        println!("Sandbox {id} registered");
                    }
                    SandboxCommands::Rm { id } => {
                        sandboxes.remove(&id)?;
                        println!("Sandbox {id} removed");
                    }
                }
                Ok(())
            }

            Commands::Image { command } => {
                let mut store = ImageStore::new(config.paths.images())?;
                match command {
                    ImageCommands::Import {
                        layout,
                        reference,
                        platform,
                    } => {
                        let image = import_layout(
                            &mut store,
                            &layout,
                            &reference,
                            &platform.unwrap_or_default(),
                        )
                        .wrap_err_with(|| format!("Failed to import {}", layout.display()))?;
                        println!("{} {}", image.reference, image.digest);
                    }
                    ImageCommands::Ls { format } => {
                        let images = store.list()?;
                        match format {
                            OutputFormat::Json => {
                                println!("{}", serde_json::to_string_pretty(&images)?);
                            }
                            OutputFormat::Table if images.is_empty() => println!("No images"),
                            OutputFormat::Table => {
                                let rows: Vec<ImageRow> = images
                                    .into_iter()
                                    .map(|i| ImageRow {
                                        reference: i.reference,
                                        id: i.config_digest.hex().chars().take(12).collect(),
                                        platform: i.platform.to_string(),
                                        layers: i.layers.len(),
                                        size: i.size,
                                    })
                                    .collect();
                                println!("{}", Table::new(rows));
                            }
                        }
                    }
                    ImageCommands::Rm { reference } => {
                        if store.delete(&reference)? {
                            println!("Untagged {reference}");
                        } else {
                            return Err(color_eyre::eyre::eyre!("No such image: {reference}"));
                        }
                    }
                }
                Ok(())
            }

            Commands::Lease {
                command: LeaseCommands::Ls { format },
            } => {
                let manager = ImageVolumeManager::local(config)?;
                let leases = manager.leases().list().await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&leases)?),
                    OutputFormat::Table if leases.is_empty() => println!("No leases"),
                    OutputFormat::Table => {
                        let rows: Vec<LeaseRow> = leases
                            .into_iter()
                            .map(|l| LeaseRow {
                                snapshotter: l
                                    .labels
                                    .get(crate::lease::SNAPSHOTTER_LABEL)
                                    .cloned()
                                    .unwrap_or_default(),
                                id: l.id,
                                created: l.created_at.to_rfc3339(),
                            })
                            .collect();
                        println!("{}", Table::new(rows));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Pick the snapshotter for a sandbox's volumes: an explicit choice, else
/// the one mapped to the sandbox's runtime handler, else the default.
fn resolve_snapshotter(
    config: &RuntimeConfig,
    explicit: Option<String>,
    sandbox: Option<&SandboxId>,
) -> String {
    if let Some(name) = explicit {
        return name;
    }
    let Some(id) = sandbox else {
        return config.default_snapshotter.clone();
    };
    match FileSandboxStore::new(config.paths.clone()).load(id) {
        Ok(record) => config.snapshotter_for(&record.runtime_handler).to_string(),
        Err(e) => {
            tracing::debug!(sandbox = %id, error = %e, "No sandbox record, using default snapshotter");
            config.default_snapshotter.clone()
        }
    }
}

/// The sandbox owning an image volume target, if `host_path` is one.
fn sandbox_of(config: &RuntimeConfig, host_path: &Path) -> Option<SandboxId> {
    let host_path = canonicalize(host_path).ok()?;
    let sandboxes = canonicalize(&config.paths.sandboxes()).ok()?;
    let rest = host_path.strip_prefix(&sandboxes).ok()?;

    let mut parts = rest.components();
    let id = parts.next()?.as_os_str().to_str()?;
    let id = SandboxId::new(id).ok()?;
    let target = config
        .paths
        .image_volume_base_dir(&id)
        .join(parts.nth(1)?.as_os_str());
    (canonicalize(&target).ok()? == host_path).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn root_moves_state_unless_overridden() {
        let cli = Cli::parse_from(["imgvol", "--root", "/srv/imgvol", "image", "ls"]);
        let config = cli.runtime_config().unwrap();
        assert_eq!(config.paths.state, PathBuf::from("/srv/imgvol/run"));

        let cli = Cli::parse_from([
            "imgvol",
            "--root",
            "/srv/imgvol",
            "--state-dir",
            "/run/x",
            "sweep",
            "--sandbox",
            "pod-1",
        ]);
        let config = cli.runtime_config().unwrap();
        assert_eq!(config.paths.state, PathBuf::from("/run/x"));
    }

    #[test]
    fn invalid_sandbox_ids_are_rejected_by_the_parser() {
        let result = Cli::try_parse_from(["imgvol", "sweep", "--sandbox", "../etc"]);
        assert!(result.is_err());
    }

    #[test]
    fn unmount_uses_the_snapshotter_the_sandbox_mounted_with() {
        let temp = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::default()
            .with_root(temp.path())
            .with_runtime("kata", Some("native".to_string()));
        let pod = SandboxId::new("pod-kata").unwrap();
        FileSandboxStore::new(config.paths.clone())
            .register(&pod, "kata")
            .unwrap();

        let host_path = config
            .paths
            .image_volume_base_dir(&pod)
            .join("ab".repeat(32));
        let derived = sandbox_of(&config, &host_path);
        assert_eq!(derived.as_ref(), Some(&pod));

        assert_eq!(resolve_snapshotter(&config, None, derived.as_ref()), "native");
        assert_eq!(
            resolve_snapshotter(&config, Some("overlayfs".to_string()), derived.as_ref()),
            "overlayfs"
        );
        assert_eq!(resolve_snapshotter(&config, None, None), "overlayfs");
    }

    #[test]
    fn host_paths_outside_sandboxes_have_no_owner() {
        let config = RuntimeConfig::default().with_root("/srv/imgvol");
        let pod = SandboxId::new("pod-1").unwrap();

        assert!(sandbox_of(&config, Path::new("/tmp/elsewhere")).is_none());
        assert!(sandbox_of(&config, &config.paths.sandbox(&pod)).is_none());
        assert!(
            sandbox_of(&config, &config.paths.sandbox(&pod).join("other/abc")).is_none()
        );
        assert_eq!(
            sandbox_of(
                &config,
                &config.paths.image_volume_base_dir(&pod).join("abc")
            ),
            Some(pod)
        );
    }
}
