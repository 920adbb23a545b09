use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use cairn::localstore::LocalStore;
use cairn::{
    AggregateState, CoordinatorConfig, FailurePolicy, ObjectPath, ObjectStore, TransferItem,
    UploadCoordinator,
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cairn", version, about = "Upload files as one batch")]
struct Cli {
    /// Directory backing the object store.
    #[arg(long, global = true, default_value = "cairn-store")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload files concurrently, printing the combined progress.
    Upload {
        /// Key prefix the files are stored under.
        #[arg(long, default_value = "uploads")]
        prefix: String,
        /// Delete already uploaded files if any upload fails.
        #[arg(long)]
        rollback: bool,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List stored keys.
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = Arc::new(LocalStore::new(cli.root));

    match cli.command {
        Command::Upload {
            prefix,
            rollback,
            files,
        } => upload(store, &prefix, rollback, files).await,
        Command::Ls { prefix } => {
            for path in store.list_objects(&prefix).await? {
                let object = store.stat(&path).await?;
                println!("{}\t{}\t{}", object.size, object.content_hash, path);
            }
            Ok(())
        }
    }
}

async fn upload(
    store: Arc<LocalStore>,
    prefix: &str,
    rollback: bool,
    files: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let prefix = ObjectPath::new(prefix)?;
    let failure_policy = if rollback {
        FailurePolicy::DeleteUploaded
    } else {
        FailurePolicy::KeepUploaded
    };
    let mut coordinator =
        UploadCoordinator::new(store).with_config(CoordinatorConfig { failure_policy });

    for file in files {
        let name = file
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("`{}` has no usable file name", file.display()))?;
        let destination = prefix.child(name)?;
        coordinator.enqueue(TransferItem::file(file.clone(), destination))?;
    }

    let mut states = coordinator.subscribe();
    coordinator.start()?;

    while let Some(state) = states.next().await {
        match state {
            AggregateState::Idle => {}
            AggregateState::InProgress(count) => {
                println!(
                    "{:>6.1}% {}/{} bytes",
                    count.fraction() * 100.0,
                    count.completed,
                    count.total
                );
            }
            AggregateState::Complete(results) => {
                for object in results {
                    println!("stored {} ({} bytes, {})", object.path, object.size, object.content_hash);
                }
            }
            AggregateState::Failed(err) => {
                // let a rollback finish before exiting
                coordinator.join().await;
                bail!("upload failed: {err}");
            }
        }
    }
    Ok(())
}
