//! rpatool - command-line tool for Ren'Py RPA archives.
//!
//! Lists, extracts and mounts archives or whole directories of archives.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use rpafs::prelude::*;
use rpafs::vfs::{assign_names, discover_archives};

/// rpatool - Ren'Py archive tool
#[derive(Parser)]
#[command(name = "rpatool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the members of an archive, or of every archive in a directory
    List {
        /// Archive file or directory of archives
        path: PathBuf,

        /// Filter pattern (glob-style, or a plain substring)
        #[arg(short, long)]
        filter: Option<String>,

        /// Show offsets, lengths and prefix sizes
        #[arg(short, long)]
        detailed: bool,
    },

    /// Extract every member of an archive, or of every archive in a directory
    Extract {
        /// Archive file or directory of archives
        path: PathBuf,

        /// Output directory
        #[arg(short, long, env = "RPATOOL_OUTPUT", default_value = ".")]
        output: PathBuf,

        /// Filter pattern (glob-style, or a plain substring)
        #[arg(short, long)]
        filter: Option<String>,

        /// Write only the bytes stored in the archive body, without the index prefix
        #[arg(long)]
        strip_prefix: bool,
    },

    /// Mount an archive, or a directory of archives, read-only
    Mount {
        /// Archive file or directory of archives
        path: PathBuf,

        /// Mount point; `.` mounts at `./<name>_mount`
        #[arg(default_value = ".")]
        mountpoint: PathBuf,

        /// When member contents are loaded
        #[arg(short, long, value_enum, env = "RPATOOL_MOUNT_MODE", default_value_t = Mode::Lazy)]
        mode: Mode,

        /// Serve only the bytes stored in the archive body, without the index prefix
        #[arg(long)]
        strip_prefix: bool,

        /// Let other users access the mount
        #[arg(long)]
        allow_other: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Read members on first access
    Lazy,
    /// Read every member up front
    Eager,
}

impl From<Mode> for Materialization {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Lazy => Materialization::Lazy,
            Mode::Eager => Materialization::Eager,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List { path, filter, detailed } => {
            cmd_list(&path, filter.as_deref(), detailed)?;
        }
        Commands::Extract {
            path,
            output,
            filter,
            strip_prefix,
        } => {
            cmd_extract(&path, &output, filter.as_deref(), strip_prefix)?;
        }
        Commands::Mount {
            path,
            mountpoint,
            mode,
            strip_prefix,
            allow_other,
        } => {
            let options = MountOptions::default()
                .materialization(mode.into())
                .prefix(if strip_prefix {
                    PrefixPolicy::Strip
                } else {
                    PrefixPolicy::Include
                })
                .allow_other(allow_other);
            cmd_mount(&path, &mountpoint, &options)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Archives named by `path`, keyed by display name.
fn archives_at(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    if path.is_dir() {
        let paths = discover_archives(path).context("Failed to scan directory")?;
        if paths.is_empty() {
            anyhow::bail!("No .rpa archives in {}", path.display());
        }
        Ok(assign_names(&paths)?.into_iter().collect())
    } else {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(vec![(name, path.to_path_buf())])
    }
}

fn open_archive(path: &Path) -> Result<Archive> {
    Archive::open(path).with_context(|| format!("Failed to open archive {}", path.display()))
}

fn cmd_list(path: &Path, filter: Option<&str>, detailed: bool) -> Result<()> {
    let filter = filter.map(Filter::new).transpose()?;
    let archives = archives_at(path)?;
    let multiple = archives.len() > 1;

    let mut count = 0;
    for (name, archive_path) in &archives {
        let archive = open_archive(archive_path)?;
        if multiple {
            println!("{} ({}):", name, archive.version()?);
        }

        for (member, entry) in archive.entries()? {
            if filter.as_ref().is_some_and(|f| !f.matches(member)) {
                continue;
            }

            if detailed {
                println!(
                    "{:>12x} {:>12} {:>4} {}",
                    entry.offset(),
                    entry.length(),
                    entry.prefix().map_or(0, <[u8]>::len),
                    member
                );
            } else {
                println!("{}", member);
            }
            count += 1;
        }
    }

    println!("\nTotal: {} entries", count);

    Ok(())
}

fn cmd_extract(path: &Path, output: &Path, filter: Option<&str>, strip_prefix: bool) -> Result<()> {
    let filter = filter.map(Filter::new).transpose()?;
    let archives = archives_at(path)?;
    let multiple = archives.len() > 1;

    fs::create_dir_all(output).context("Failed to create output directory")?;

    let start = Instant::now();
    let mut extracted = 0;
    let mut skipped = 0;

    for (name, archive_path) in &archives {
        println!("Opening archive: {}", archive_path.display());
        let archive = open_archive(archive_path)?;
        let target = if multiple {
            output.join(name)
        } else {
            output.to_path_buf()
        };

        let members: Vec<&str> = archive
            .names()?
            .into_iter()
            .filter(|m| filter.as_ref().map_or(true, |f| f.matches(m)))
            .collect();

        println!("Extracting {} entries...", members.len());

        let pb = ProgressBar::new(members.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );

        for member in members {
            pb.inc(1);

            let Some(relative) = sanitize_member_path(member) else {
                pb.suspend(|| warn!(member, "skipping member with unsafe path"));
                skipped += 1;
                continue;
            };
            let output_path = target.join(relative);

            if let Some(parent) = output_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let data = if strip_prefix {
                archive.read_stored(member)
            } else {
                archive.read(member)
            }
            .with_context(|| format!("Failed to read {member}"))?;

            fs::write(&output_path, data)
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            debug!(member, path = %output_path.display(), "extracted");
            extracted += 1;
        }

        pb.finish_with_message("Done");
    }

    println!(
        "Extracted {} entries in {:?} ({} skipped)",
        extracted,
        start.elapsed(),
        skipped
    );

    Ok(())
}

#[cfg(feature = "fuse")]
fn cmd_mount(path: &Path, mountpoint: &Path, options: &MountOptions) -> Result<()> {
    use crossbeam_channel::select;

    let source = MountSource::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mountpoint = source.mountpoint_for(mountpoint);
    if !mountpoint.exists() {
        fs::create_dir_all(&mountpoint)
            .with_context(|| format!("Failed to create {}", mountpoint.display()))?;
    }

    let mut session = MountSession::new(FuseBridge);
    session
        .mount(&mountpoint, &source, options)
        .context("Failed to mount")?;

    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let Some(done) = session.done().cloned() else {
        anyhow::bail!("Mount session has no completion signal");
    };

    println!(
        "Mounted {} at {} (Ctrl-C to unmount)",
        path.display(),
        session.mount_path().unwrap_or(&mountpoint).display()
    );

    select! {
        recv(interrupt_rx) -> _ => {
            println!("Unmounting...");
            session.unmount().context("Failed to unmount")?;
        }
        recv(done) -> _ => {
            println!("Filesystem was unmounted");
        }
    }

    session.wait()?;
    Ok(())
}

#[cfg(not(feature = "fuse"))]
fn cmd_mount(_path: &Path, _mountpoint: &Path, _options: &MountOptions) -> Result<()> {
    anyhow::bail!("rpatool was built without FUSE support (enable the `fuse` feature)")
}

/// Member name filter: a glob pattern when it has wildcards, otherwise a
/// case-insensitive substring.
enum Filter {
    Glob(glob::Pattern),
    Substring(String),
}

impl Filter {
    fn new(pattern: &str) -> Result<Self> {
        if pattern.contains(['*', '?', '[']) {
            let pattern = glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid filter pattern: {pattern}"))?;
            Ok(Self::Glob(pattern))
        } else {
            Ok(Self::Substring(pattern.to_lowercase()))
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Glob(pattern) => pattern.matches(name),
            Self::Substring(needle) => name.to_lowercase().contains(needle.as_str()),
        }
    }
}

/// Relative output path for a member, or `None` if it would leave the
/// output directory.
fn sanitize_member_path(member: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(member).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_member_path() {
        assert_eq!(
            sanitize_member_path("images/bg/room.png"),
            Some(PathBuf::from("images/bg/room.png"))
        );
        assert_eq!(sanitize_member_path("./a//b"), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize_member_path("../evil"), None);
        assert_eq!(sanitize_member_path("a/../../evil"), None);
        assert_eq!(sanitize_member_path("/etc/passwd"), None);
        assert_eq!(sanitize_member_path(""), None);
    }

    #[test]
    fn test_filter() {
        let f = Filter::new("*.rpy").unwrap();
        assert!(f.matches("script.rpy"));
        assert!(!f.matches("script.rpyc"));

        let f = Filter::new("Script").unwrap();
        assert!(f.matches("game/script.rpy"));
        assert!(!f.matches("images/bg.png"));

        assert!(Filter::new("[").is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["rpatool", "mount", "game.rpa", "--mode", "eager"]).unwrap();
        match cli.command {
            Commands::Mount {
                mountpoint,
                mode,
                strip_prefix,
                ..
            } => {
                assert_eq!(mountpoint, Path::new("."));
                assert!(matches!(mode, Mode::Eager));
                assert!(!strip_prefix);
            }
            _ => panic!("expected mount"),
        }

        let cli = Cli::try_parse_from(["rpatool", "extract", "game.rpa", "--strip-prefix"]).unwrap();
        assert!(matches!(cli.command, Commands::Extract { strip_prefix: true, .. }));
    }
}
