//! FSvn Administration CLI

mod verify;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fsvn_core::{BackendKind, ChecksumKind, NodeKind, Repository, RepositoryConfig, svn_props};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fsvn-admin")]
#[command(author = "FSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "FSvn repository administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Fs,
    Sqlite,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ChecksumArg {
    Sha1,
    Sha256,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new repository
    Create {
        path: PathBuf,
        #[arg(long, value_enum, default_value = "fs")]
        backend: BackendArg,
        #[arg(long, value_enum, default_value = "sha256")]
        checksum: ChecksumArg,
        /// Revisions per revprops pack
        #[arg(long, default_value_t = 16)]
        pack_size: u64,
    },

    /// Print the youngest revision
    Youngest { repo: PathBuf },

    /// Print a file's content
    Cat {
        repo: PathBuf,
        path: String,
        #[arg(short, long)]
        revision: Option<u64>,
    },

    /// List a directory
    Ls {
        repo: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        revision: Option<u64>,
    },

    /// Show revision history, newest first
    Log {
        repo: PathBuf,
        #[arg(short, long)]
        revision: Option<u64>,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Also list changed paths
        #[arg(short, long)]
        verbose: bool,
    },

    /// List properties of a path, or of a revision with --revprop
    Proplist {
        repo: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        revision: Option<u64>,
        #[arg(long)]
        revprop: bool,
    },

    /// Replace the log message of a revision
    Setlog {
        repo: PathBuf,
        #[arg(short, long)]
        revision: u64,
        #[arg(short, long)]
        message: String,
        #[arg(long, default_value = "fsvn-admin")]
        author: String,
    },

    /// Check every node and file text
    Verify {
        repo: PathBuf,
        #[arg(short, long)]
        start: Option<u64>,
        #[arg(short, long)]
        end: Option<u64>,
        #[arg(short, long)]
        quiet: bool,
    },

    /// Pack complete batches of revision properties
    PackRevprops { repo: PathBuf },
}

fn open(path: &Path) -> Result<Repository> {
    Repository::open(path).with_context(|| format!("cannot open repository {}", path.display()))
}

fn resolve_rev(repo: &Repository, revision: Option<u64>) -> Result<u64> {
    Ok(match revision {
        Some(rev) => rev,
        None => repo.youngest()?,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Create {
            path,
            backend,
            checksum,
            pack_size,
        } => {
            let config = RepositoryConfig {
                backend: match backend {
                    BackendArg::Fs => BackendKind::Filesystem,
                    BackendArg::Sqlite => BackendKind::Sqlite,
                },
                checksum: match checksum {
                    ChecksumArg::Sha1 => ChecksumKind::Sha1,
                    ChecksumArg::Sha256 => ChecksumKind::Sha256,
                },
                revprops_pack_size: pack_size,
                ..RepositoryConfig::default()
            };
            let repo = Repository::create(&path, config)?;
            println!(
                "Repository created at {} (UUID: {})",
                path.display(),
                repo.uuid()
            );
        }

        Commands::Youngest { repo } => {
            println!("{}", open(&repo)?.youngest()?);
        }

        Commands::Cat {
            repo,
            path,
            revision,
        } => {
            let repo = open(&repo)?;
            let rev = resolve_rev(&repo, revision)?;
            let data = repo.file_contents(rev, &path)?;
            std::io::stdout().write_all(&data)?;
        }

        Commands::Ls {
            repo,
            path,
            revision,
        } => {
            let repo = open(&repo)?;
            let rev = resolve_rev(&repo, revision)?;
            for (name, entry) in repo.list_dir(rev, &path)? {
                match entry.kind {
                    NodeKind::Dir => println!("{}/", name),
                    NodeKind::File => println!("{}", name),
                }
            }
        }

        Commands::Log {
            repo,
            revision,
            limit,
            verbose,
        } => {
            let repo = open(&repo)?;
            let start = resolve_rev(&repo, revision)?;
            for entry in repo.log(start, limit)? {
                let date = entry
                    .date()
                    .and_then(fsvn_core::properties::parse_date)
                    .map(|d| {
                        d.with_timezone(&chrono::Local)
                            .format("%Y-%m-%d %H:%M:%S %z")
                            .to_string()
                    })
                    .unwrap_or_default();
                println!(
                    "r{} | {} | {}",
                    entry.revision,
                    entry.author().unwrap_or("(no author)"),
                    date
                );
                if verbose && !entry.changes.is_empty() {
                    println!("Changed paths:");
                    for change in &entry.changes {
                        match &change.copy_from {
                            Some(from) => println!(
                                "   {} {} (from {}:{})",
                                change.action.as_char(),
                                change.path,
                                from.path,
                                from.revision
                            ),
                            None => println!("   {} {}", change.action.as_char(), change.path),
                        }
                    }
                }
                println!();
                println!("{}", entry.message().unwrap_or(""));
                println!("{}", "-".repeat(72));
            }
        }

        Commands::Proplist {
            repo,
            path,
            revision,
            revprop,
        } => {
            let repo = open(&repo)?;
            let rev = resolve_rev(&repo, revision)?;
            let props = if revprop {
                repo.revision_props(rev)?
            } else {
                repo.node_props(rev, &path)?
            };
            for (name, value) in props.iter() {
                println!("  {}", name);
                println!("    {}", value);
            }
        }

        Commands::Setlog {
            repo,
            revision,
            message,
            author,
        } => {
            let repo = open(&repo)?;
            if revision == 0 {
                bail!("Revision 0 has no log message");
            }
            repo.set_revision_property(revision, svn_props::LOG, Some(message.as_str()), &author)?;
            println!("Set new log message on r{}", revision);
        }

        Commands::Verify {
            repo,
            start,
            end,
            quiet,
        } => {
            let repo = open(&repo)?;
            verify::verify_repository(&repo, start, end, quiet)?;
        }

        Commands::PackRevprops { repo } => {
            let packs = open(&repo)?.pack_revprops()?;
            println!("Wrote {} revprops pack(s)", packs);
        }
    }

    Ok(())
}
