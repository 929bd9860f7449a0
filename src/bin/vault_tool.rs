use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use projectvault::core::VaultConfig;
use projectvault::mirror::LocalDirectory;
use projectvault::{ProjectId, ProjectVault, SyncBus};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "vault-tool")]
#[command(about = "Developer tooling for project vault storage")]
struct Cli {
    /// Vault storage directory.
    #[arg(long, default_value = "./vault-data")]
    data: PathBuf,
    /// Optional JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List indexed projects, newest first.
    List,
    /// Print one project document as JSON.
    Show { id: String },
    /// Rebuild index entries for stored documents the index lost.
    Recover,
    /// Move oversized inline media of every project into the blob store.
    Migrate,
    /// Mirror every project into a directory.
    Mirror {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Merge a mirror directory back into the vault.
    Restore {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Import a tar bundle.
    Import { bundle: PathBuf },
    /// Export projects (all when none given) to a tar bundle.
    Export {
        bundle: PathBuf,
        #[arg(long = "project")]
        projects: Vec<String>,
    },
    /// List root state backups, or restore one.
    Backups {
        #[arg(long)]
        restore: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let bus = SyncBus::new(config.broadcast_capacity);
    let vault = ProjectVault::open_dir(config, &cli.data, bus)
        .await
        .with_context(|| format!("Failed to open vault at '{}'", cli.data.display()))?;

    let result = run(&vault, cli.command).await;
    vault.shutdown().await.context("Failed to shut down vault")?;
    result
}

fn load_config(path: Option<&Path>) -> Result<VaultConfig> {
    match path {
        Some(path) => VaultConfig::from_json_file(path)
            .with_context(|| format!("Failed to read config '{}'", path.display())),
        None => Ok(VaultConfig::default()),
    }
}

async fn run(vault: &ProjectVault, command: Command) -> Result<()> {
    match command {
        Command::List => {
            let projects = vault.list_projects().await;
            if projects.is_empty() {
                println!("No projects.");
            }
            for meta in projects {
                println!(
                    "{}\t{}\t{}/{} cuts with images\t{}",
                    meta.id,
                    meta.title,
                    meta.progress.cuts_with_image,
                    meta.progress.total_cuts,
                    meta.last_modified
                );
            }
        }
        Command::Show { id } => {
            let doc = vault.load(&ProjectId::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Command::Recover => {
            let report = vault.recover_orphans().await?;
            println!(
                "Recovered {} orphan(s), dropped {} stale entr(ies), {} unreadable",
                report.recovered.len(),
                report.dropped.len(),
                report.unreadable.len()
            );
        }
        Command::Migrate => {
            for (id, report) in vault.migrate_all().await? {
                if report.changed() {
                    println!(
                        "{}: {} migrated ({} bytes), {} stripped",
                        id, report.migrated, report.bytes_moved, report.stripped
                    );
                }
            }
        }
        Command::Mirror { dir } => {
            vault
                .connect_mirror(Arc::new(LocalDirectory::new(&dir)))
                .await
                .with_context(|| format!("Cannot mirror into '{}'", dir.display()))?;
            let report = vault.mirror_all().await?;
            println!(
                "Mirrored {} project(s), {} asset(s), {} missing",
                report.projects, report.assets_written, report.assets_missing
            );
        }
        Command::Restore { dir } => {
            vault
                .connect_mirror(Arc::new(LocalDirectory::new(&dir)))
                .await
                .with_context(|| format!("Cannot restore from '{}'", dir.display()))?;
            let report = vault.restore_from_mirror().await?;
            println!(
                "Restored {} project(s), merged {}, {} asset(s)",
                report.restored.len(),
                report.merged.len(),
                report.assets_restored
            );
            for path in report.invalid_files {
                println!("  skipped unreadable {}", path.display());
            }
        }
        Command::Import { bundle } => {
            let report = vault
                .import_bundle(&bundle)
                .await
                .with_context(|| format!("Failed to import '{}'", bundle.display()))?;
            println!("Imported {} project(s)", report.imported.len());
            for (from, to) in report.renamed {
                println!("  {} already existed; imported as {}", from, to);
            }
        }
        Command::Export { bundle, projects } => {
            let ids: Vec<ProjectId> = projects.into_iter().map(ProjectId::new).collect();
            let count = vault
                .export_bundle(&ids, &bundle)
                .await
                .with_context(|| format!("Failed to export to '{}'", bundle.display()))?;
            println!("Exported {} project(s) to {}", count, bundle.display());
        }
        Command::Backups { restore } => match restore {
            Some(key) => {
                let backups = vault.list_backups().await?;
                if !backups.contains(&key) {
                    return Err(anyhow!("Unknown backup '{}'", key));
                }
                vault.restore_backup(&key).await?;
                println!("Restored root state from {}", key);
            }
            None => {
                for key in vault.list_backups().await? {
                    println!("{}", key);
                }
            }
        },
    }
    Ok(())
}
