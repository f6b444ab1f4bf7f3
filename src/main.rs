//! # chatvault CLI
//!
//! ## Usage
//!
//! ```bash
//! chatvault --config ./chatvault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chatvault archive [ENTITY...]` | Archive a workspace or selected conversations |
//! | `chatvault resume <PATH>` | Continue an archive from its checkpoints |
//! | `chatvault search <QUERY>` | Archive search results |
//! | `chatvault convert <SRC> <DST>` | Convert an archive to another format |
//! | `chatvault latest <PATH>` | Show the newest archived timestamp per unit |
//! | `chatvault sessions <PATH>` | List the sessions of a database archive |
//! | `chatvault stats <PATH>` | Summarize an archive |
//! | `chatvault completions <SHELL>` | Print shell completions |
//!
//! The API token comes from `api.token` or `SLACK_TOKEN`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chatvault::archive::{self, Remote, RunEnv, StoreKind, StoreSpec};
use chatvault::config::{self, Config};
use chatvault::controller::{ControllerOptions, SearchType, Summary};
use chatvault::convert::{ConvertOptions, Converter, Format, TargetSpec};
use chatvault::progress::{format_number, ProgressMode};
use chatvault::resume::{self, ResumeOptions};
use chatvault::sources::{self, LoadOptions};
use chatvault::sqlite_store::SqliteStore;
use chatvault::stats;
use chatvault_core::entity::{parse_time, EntityList};
use chatvault_core::paths::FileLayout;
use chatvault_core::source::Sourcer;
use chatvault_core::ts;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// chatvault: archive Slack workspaces locally, resume and convert them.
#[derive(Parser)]
#[command(
    name = "chatvault",
    about = "Resumable, local-first archiver for Slack workspaces",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when it is absent.
    #[arg(long, global = true, default_value = "./chatvault.toml")]
    config: PathBuf,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Progress output on stderr. Defaults to `human` on a terminal.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by the commands that talk to the API.
#[derive(clap::Args, Clone)]
struct RunArgs {
    /// Concurrent units.
    #[arg(long)]
    workers: Option<usize>,

    /// Do not download file attachments.
    #[arg(long)]
    no_files: bool,

    /// Download user avatars.
    #[arg(long)]
    avatars: bool,

    /// Oldest message time (YYYY-MM-DD[THH:MM:SS]).
    #[arg(long)]
    oldest: Option<String>,

    /// Latest message time (YYYY-MM-DD[THH:MM:SS]).
    #[arg(long)]
    latest: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive conversations.
    ///
    /// Entities are channel IDs, `C123:thread_ts` links, or `^C123` to
    /// exclude. With no includes every conversation is archived.
    Archive {
        entities: Vec<String>,

        /// Read further entities from a file, one per line.
        #[arg(long)]
        from_file: Option<PathBuf>,

        /// Output directory (defaults to `archive.path`).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Archive storage.
        #[arg(long, value_enum, default_value = "chunk")]
        store: StoreKind,

        /// List channels from the API even if the archive has a list.
        #[arg(long)]
        refresh: bool,

        /// Only conversations the user is a member of.
        #[arg(long)]
        member_only: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Continue an archive from where the last run stopped.
    Resume {
        path: PathBuf,

        /// Also continue individually archived threads.
        #[arg(long)]
        threads: bool,

        /// Pick up channels created since the last run.
        #[arg(long)]
        refresh: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Archive search results.
    Search {
        query: String,

        #[arg(long = "type", value_enum, default_value = "all")]
        kind: SearchType,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "chunk")]
        store: StoreKind,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Convert an archive to another format.
    Convert {
        source: PathBuf,
        target: PathBuf,

        #[arg(short, long, value_enum, default_value = "export")]
        format: Format,

        /// File layout of export targets: standard or mattermost.
        #[arg(long)]
        storage: Option<String>,

        #[arg(long)]
        workers: Option<usize>,

        #[arg(long)]
        no_files: bool,

        #[arg(long)]
        avatars: bool,

        /// Read one session of a database source.
        #[arg(long)]
        session: Option<i64>,
    },

    /// Show the newest archived message per unit.
    Latest {
        path: PathBuf,

        /// Include thread units.
        #[arg(long)]
        threads: bool,
    },

    /// List the sessions of a database archive.
    Sessions { path: PathBuf },

    /// Summarize an archive.
    Stats { path: PathBuf },

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "chatvault=debug" } else { "chatvault=info" };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

fn controller_options(cfg: &Config, run: &RunArgs) -> Result<ControllerOptions> {
    let mut opts = ControllerOptions::from_config(&cfg.archive);
    if let Some(w) = run.workers {
        if w == 0 {
            bail!("--workers must be >= 1");
        }
        opts.workers = w;
    }
    opts.files = opts.files && !run.no_files;
    opts.avatars = opts.avatars || run.avatars;
    if let Some(s) = &run.oldest {
        opts.oldest = parse_time(s)?;
    }
    if let Some(s) = &run.latest {
        opts.latest = parse_time(s)?;
    }
    Ok(opts)
}

fn invocation() -> String {
    std::env::args().skip(1).collect::<Vec<_>>().join(" ")
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing units in flight");
            token.cancel();
        }
    });
}

fn print_summary(summary: &Summary) {
    println!(
        "{:?}: {} units, {} messages, {} threads, {} files, {} users",
        summary.state,
        format_number(summary.channels),
        format_number(summary.messages),
        format_number(summary.threads),
        format_number(summary.files),
        format_number(summary.users),
    );
    let d = &summary.downloads;
    if d.files + d.avatars + d.skipped + d.failed > 0 {
        println!(
            "downloads: {} files, {} avatars, {} skipped, {} failed ({})",
            d.files,
            d.avatars,
            d.skipped,
            d.failed,
            stats::format_bytes(d.bytes)
        );
    }
    for e in &summary.errors {
        eprintln!("error: {}", e);
    }
}

fn finish(summary: Summary) -> Result<()> {
    print_summary(&summary);
    if !summary.is_success() {
        bail!("run finished with {} error(s)", summary.errors.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "chatvault",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let cfg = load_config(&cli.config)?;
    let env = RunEnv {
        progress: cli
            .progress
            .unwrap_or_else(ProgressMode::default_for_tty)
            .reporter(),
        cancel: CancellationToken::new(),
    };
    let db_file = cfg.db.file_name.clone();

    match cli.command {
        Commands::Archive {
            entities,
            from_file,
            output,
            store,
            refresh,
            member_only,
            run,
        } => {
            let mut list = EntityList::parse(&entities)?;
            if let Some(path) = from_file {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("read entity list {}", path.display()))?;
                for item in EntityList::parse_str(&text)?.items() {
                    list.push(item.clone());
                }
            }
            let mut opts = controller_options(&cfg, &run)?;
            opts.refresh = refresh;
            opts.member_only = opts.member_only || member_only;
            let target = StoreSpec {
                kind: store,
                path: output.unwrap_or_else(|| cfg.archive.path.clone()),
                db_file,
                args: invocation(),
            };
            let remote = Remote::slack(&cfg.api)?;
            cancel_on_interrupt(env.cancel.clone());
            finish(archive::archive(&remote, &target, &list, opts, &env).await?)?;
        }
        Commands::Resume {
            path,
            threads,
            refresh,
            run,
        } => {
            let opts = controller_options(&cfg, &run)?;
            let ropts = ResumeOptions {
                include_threads: threads || cfg.archive.include_threads_on_resume,
                refresh,
                latest: opts.latest,
            };
            let remote = Remote::slack(&cfg.api)?;
            cancel_on_interrupt(env.cancel.clone());
            let summary =
                archive::resume(&remote, &path, &db_file, &invocation(), &ropts, opts, &env)
                    .await?;
            finish(summary)?;
        }
        Commands::Search {
            query,
            kind,
            output,
            store,
            run,
        } => {
            let opts = controller_options(&cfg, &run)?;
            let target = StoreSpec {
                kind: store,
                path: output.unwrap_or_else(|| cfg.archive.path.clone()),
                db_file,
                args: invocation(),
            };
            let remote = Remote::slack(&cfg.api)?;
            cancel_on_interrupt(env.cancel.clone());
            finish(archive::search(&remote, &target, &query, kind, opts, &env).await?)?;
        }
        Commands::Convert {
            source,
            target,
            format,
            storage,
            workers,
            no_files,
            avatars,
            session,
        } => {
            let mut opts = ConvertOptions::from_config(&cfg.convert);
            if let Some(w) = workers {
                if w == 0 {
                    bail!("--workers must be >= 1");
                }
                opts.workers = w;
            }
            opts.files = opts.files && !no_files;
            opts.avatars = opts.avatars || avatars;
            let layout = match storage {
                Some(s) => FileLayout::parse(&s)
                    .with_context(|| format!("unknown storage layout {:?}", s))?,
                None => cfg.convert.layout()?,
            };
            let src: Arc<dyn Sourcer> = Arc::from(
                sources::load(
                    &source,
                    &LoadOptions {
                        session,
                        db_file: Some(db_file.clone()),
                    },
                )
                .await?,
            );
            let dst = TargetSpec::new(format, &target)
                .with_layout(layout)
                .with_db_file(db_file)
                .with_args(invocation());
            let summary = Converter::new(opts)
                .with_progress(Arc::clone(&env.progress))
                .run(Some(src), Some(dst))
                .await?;
            println!(
                "converted {} channels, {} messages, {} threads into {}",
                format_number(summary.channels),
                format_number(summary.messages),
                format_number(summary.threads),
                target.display()
            );
            println!(
                "files: {} copied, {} skipped, {} failed ({})",
                summary.files.copied,
                summary.files.skipped,
                summary.files.failed,
                stats::format_bytes(summary.files.bytes)
            );
            if !summary.avatars_supported {
                println!("avatars: not available in this source");
            } else if summary.avatars.copied + summary.avatars.failed > 0 {
                println!(
                    "avatars: {} copied, {} failed",
                    summary.avatars.copied, summary.avatars.failed
                );
            }
        }
        Commands::Latest { path, threads } => {
            let src = sources::load(
                &path,
                &LoadOptions {
                    session: None,
                    db_file: Some(db_file),
                },
            )
            .await?;
            let map = resume::latest_map(src.as_ref(), threads).await?;
            for (link, last) in &map {
                let when = ts::to_datetime(last)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{:<32} {:<20} {}", link.to_string(), last, when);
            }
        }
        Commands::Sessions { path } => {
            let found = sources::detect(&path, &db_file)?;
            if found.kind != chatvault_core::source::SourceKind::Database {
                bail!("{} is a {} archive, not a database", path.display(), found.kind);
            }
            let store = SqliteStore::open(&found.path).await?;
            println!(
                "{:>4}  {:<8}  {:<8}  {:>6}  {:<16}  CREATED",
                "ID", "MODE", "FINISHED", "PARENT", "FILES/AVATARS"
            );
            for s in store.list_sessions().await? {
                println!(
                    "{:>4}  {:<8}  {:<8}  {:>6}  {:<16}  {}",
                    s.id,
                    s.mode,
                    if s.finished { "yes" } else { "no" },
                    s.parent_id.map(|p| p.to_string()).unwrap_or_default(),
                    format!("{}/{}", s.files_enabled, s.avatars_enabled),
                    stats::format_ts_relative(s.created_at)
                );
            }
            store.close().await;
        }
        Commands::Stats { path } => {
            stats::run_stats(&path, &db_file).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
