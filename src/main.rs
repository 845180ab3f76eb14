use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use tokio::sync::mpsc;

mod config;
mod download;
mod env;
mod error;
mod models;
mod networking;
mod resolver;
mod session;
mod tree;
mod updater;
mod util;

use config::{AppConfig, Source};
use download::{AggregateProgress, DownloadEvent, DownloadJob, DownloadManager};
use error::Error;
use models::{FileKey, FileNode};
use networking::NetworkClient;
use resolver::UrlResolver;
use session::Session;
use tree::{DirectoryNode, NodeRef, TreeBuilder};
use updater::UpdateChecker;
use util::{format_size, progress_percent, sanitize_filename};

#[derive(Parser, Debug)]
#[command(
    name = "mirror-fetch",
    author,
    version,
    about = "Browse a mirrored repository and download files with origin fallback"
)]
struct Cli {
    /// Config file to use instead of the one in the app directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Where a tree comes from; listing the host when neither is given.
#[derive(Args, Debug, Default)]
struct TreeOrigin {
    /// Read a published tree snapshot instead of listing the host.
    #[arg(long, value_name = "URL")]
    snapshot: Option<String>,
    /// Read the snapshot of a named download source and download from the
    /// URL it prefers.
    #[arg(long, value_name = "NAME", conflicts_with = "snapshot")]
    source: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the repository tree below PATH.
    Tree {
        #[arg(default_value = "")]
        path: String,
        /// Emit the tree as JSON in the published snapshot format.
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        origin: TreeOrigin,
    },
    /// Find files whose name contains QUERY.
    Search {
        query: String,
        #[arg(default_value = "")]
        path: String,
        #[command(flatten)]
        origin: TreeOrigin,
    },
    /// Download every file below DIR.
    Download {
        dir: String,
        /// Only download files whose name contains this text.
        #[arg(long)]
        filter: Option<String>,
        /// Target folder, defaults to the user's Downloads folder.
        #[arg(long)]
        dest: Option<PathBuf>,
        /// Open the target folder when done.
        #[arg(long)]
        reveal: bool,
        #[command(flatten)]
        origin: TreeOrigin,
    },
    /// List the configured download sources.
    Sources,
    /// Check the update manifest.
    CheckUpdate {
        /// Version to compare against, defaults to this build.
        #[arg(long)]
        current: Option<String>,
        /// Artifact platform such as `windows-amd64`, defaults to this machine.
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Download, verify and install the latest release.
    SelfUpdate {
        #[arg(long)]
        current: Option<String>,
    },
    /// Manage the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a config file with default values.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config.
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cleanup = std::env::current_exe()
        .ok()
        .map(|exe| tokio::spawn(updater::cleanup_old_binary(exe)));

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    };

    if let Some(cleanup) = cleanup {
        let _ = cleanup.await;
    }
    code
}

async fn run(cli: Cli) -> Result<ExitCode, Error> {
    let config_path = cli.config.unwrap_or_else(env::config_path);
    if let Command::Config { action } = &cli.command {
        return manage_config(action, &config_path);
    }

    let config = AppConfig::load(&config_path)?;
    let session = Session::for_config(&config);
    let watcher = session.clone();
    tokio::spawn(async move {
        let mut presses = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            presses += 1;
            if presses > 1 {
                error!("aborted");
                std::process::exit(130);
            }
            warn!("stopping, press Ctrl-C again to abort immediately");
            watcher.cancel();
        }
    });

    let client = NetworkClient::new(&config)?;
    let resolver = UrlResolver::new(
        config.repository.clone(),
        &config.origin_base,
        &config.mirror_base,
    )?;
    let app = App {
        client,
        resolver,
        session: session.clone(),
        config,
    };

    let result = match cli.command {
        Command::Tree { path, json, origin } => app.print_tree(&path, json, &origin).await,
        Command::Search {
            query,
            path,
            origin,
        } => app.search(&query, &path, &origin).await,
        Command::Download {
            dir,
            filter,
            dest,
            reveal,
            origin,
        } => {
            app.download(&dir, filter.as_deref(), dest, reveal, &origin)
                .await
        }
        Command::Sources => app.list_sources().await,
        Command::CheckUpdate {
            current,
            platform,
            json,
        } => {
            app.check_update(current.as_deref(), platform.as_deref(), json)
                .await
        }
        Command::SelfUpdate { current } => app.self_update(current.as_deref()).await,
        Command::Config { .. } => Ok(ExitCode::SUCCESS),
    };

    session.shutdown();
    result
}

fn manage_config(action: &ConfigAction, path: &Path) -> Result<ExitCode, Error> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                return Err(Error::Config(format!(
                    "{} already exists, pass --force to overwrite",
                    path.display()
                )));
            }
            AppConfig::default().save(path)?;
            println!("{}", path.display());
        }
        ConfigAction::Show => {
            let mut config = AppConfig::load(path)?;
            if config.github_token.is_some() {
                config.github_token = Some("<redacted>".into());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

struct App {
    client: NetworkClient,
    resolver: UrlResolver,
    session: Session,
    config: AppConfig,
}

impl App {
    /// Build or fetch the tree below `path`, together with the URL its files
    /// should be fetched from first. A partial tree is returned with its
    /// gaps logged.
    async fn load_tree(&self, path: &str, origin: &TreeOrigin) -> Result<(DirectoryNode, FileKey), Error> {
        let path = path.trim_matches('/');
        let (url, key) = match (&origin.snapshot, &origin.source) {
            (Some(url), _) => (url.clone(), FileKey::Mirror),
            (None, Some(name)) => {
                let source = self.pick_source(name).await?;
                info!("tree: reading source {}", source.name);
                (source.snapshot_url, source.key)
            }
            (None, None) => {
                let builder = TreeBuilder::new(&self.client, &self.resolver, &self.session);
                let tree = match builder.build(path).await {
                    Err(Error::PartialTree(partial)) => {
                        for failure in &partial.failures {
                            warn!("tree: missing {failure}");
                        }
                        partial.tree
                    }
                    other => other?,
                };
                return Ok((tree, FileKey::Mirror));
            }
        };

        let tree = tree::load_snapshot(&self.client, &self.session, &url).await?;
        if path.is_empty() {
            return Ok((tree, key));
        }
        let dir = tree
            .find_dir(path)
            .cloned()
            .ok_or_else(|| Error::invalid_path(path, "no such directory in snapshot"))?;
        Ok((dir, key))
    }

    async fn pick_source(&self, name: &str) -> Result<Source, Error> {
        let mut config = self.config.clone();
        config.refresh_sources(&self.client, &self.session).await;
        config.source(Some(name))
    }

    async fn list_sources(&self) -> Result<ExitCode, Error> {
        let mut config = self.config.clone();
        config.refresh_sources(&self.client, &self.session).await;
        for (name, source) in &config.sources {
            let marker = if name.eq_ignore_ascii_case(config.default_source.trim()) {
                "*"
            } else {
                " "
            };
            let url = source.snapshot_url().unwrap_or("-");
            println!("{marker} {name:<12} {:<16} {url}", source.file_key);
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn print_tree(&self, path: &str, json: bool, origin: &TreeOrigin) -> Result<ExitCode, Error> {
        let (tree, _) = self.load_tree(path, origin).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&FileNode::from(&tree))?);
            return Ok(ExitCode::SUCCESS);
        }

        println!("{}/", tree.name);
        for (depth, node) in tree.walk().into_iter().skip(1) {
            let indent = "  ".repeat(depth);
            match node {
                NodeRef::Directory(_) => println!("{indent}{}/", node.name()),
                NodeRef::File(file) => {
                    println!("{indent}{}  ({})", node.name(), format_size(file.size))
                }
            }
        }
        println!(
            "{} files, {}",
            tree.file_count(),
            format_size(tree.total_size())
        );
        Ok(ExitCode::SUCCESS)
    }

    async fn search(&self, query: &str, path: &str, origin: &TreeOrigin) -> Result<ExitCode, Error> {
        let (tree, _) = self.load_tree(path, origin).await?;
        let hits = tree.search(query);
        if hits.is_empty() {
            println!("no files match {query:?}");
            return Ok(ExitCode::FAILURE);
        }
        for file in hits {
            println!("{}  ({})", file.path, format_size(file.size));
            println!("    mirror: {}", file.mirror_url);
            println!("    origin: {}", file.origin_url);
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn download(
        &self,
        dir: &str,
        filter: Option<&str>,
        dest: Option<PathBuf>,
        reveal: bool,
        origin: &TreeOrigin,
    ) -> Result<ExitCode, Error> {
        let (tree, key) = self.load_tree(dir, origin).await?;
        let files = match filter {
            Some(query) => tree.search(query),
            None => tree.files_recursive(),
        };
        if files.is_empty() {
            println!("nothing to download under {:?}", tree.path);
            return Ok(ExitCode::SUCCESS);
        }

        let target = dest
            .unwrap_or_else(env::default_downloads_dir)
            .join(sanitize_filename(&tree.name));
        let jobs: Vec<DownloadJob> = files
            .iter()
            .map(|leaf| DownloadJob::for_file(leaf, &target, &tree.path, key))
            .collect();
        info!(
            "download: {} file(s) into {}",
            jobs.len(),
            target.display()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let bar = progress_bar(jobs.iter().filter_map(|j| j.expected_size).sum());
        let renderer = tokio::spawn(render_progress(rx, bar.clone()));
        let report = DownloadManager::new(&self.client, &self.session)
            .with_events(tx)
            .download_all(jobs)
            .await;
        let _ = renderer.await;
        bar.finish_and_clear();

        for (item, done) in report.succeeded() {
            let via = if done.used_fallback { " (fallback)" } else { "" };
            println!("ok      {}  {}{}", item.name, format_size(done.bytes), via);
        }
        for (item, err) in report.failed() {
            println!("failed  {}: {}", item.name, err);
        }
        if report.cancelled {
            warn!("download: cancelled before all files finished");
        }

        if reveal && let Err(err) = open::that(&target) {
            warn!("download: cannot open {}: {}", target.display(), err);
        }
        Ok(if report.is_complete() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }

    async fn check_update(
        &self,
        current: Option<&str>,
        platform: Option<&str>,
        json: bool,
    ) -> Result<ExitCode, Error> {
        let current = current.unwrap_or(updater::CURRENT_VERSION);
        let mut checker = UpdateChecker::new(&self.client, &self.session);
        if let Some(platform) = platform {
            checker = checker.with_platform(platform);
        }
        let result = checker.check(current).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(ExitCode::SUCCESS);
        }

        let seen_path = env::seen_notice_path();
        let seen = std::fs::read_to_string(&seen_path).ok();
        if let Some(notice) = updater::pending_notice(&result, seen.as_deref().map(str::trim)) {
            println!("{}\n{}\n", notice.title, notice.content);
            if !notice.id.is_empty() {
                let stored = env::ensure_base_dirs().and_then(|()| std::fs::write(&seen_path, &notice.id));
                if let Err(err) = stored {
                    warn!("update: cannot remember notice {}: {}", notice.id, err);
                }
            }
        }

        if result.has_update {
            let force = if result.is_force { " (required)" } else { "" };
            println!(
                "update available: {} -> {}{}",
                result.current_ver, result.remote_ver, force
            );
            if !result.update_desc.is_empty() {
                println!("{}", result.update_desc);
            }
        } else {
            println!("up to date ({})", result.current_ver);
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn self_update(&self, current: Option<&str>) -> Result<ExitCode, Error> {
        let current = current.unwrap_or(updater::CURRENT_VERSION);
        let result = UpdateChecker::new(&self.client, &self.session)
            .check(current)
            .await?;
        if !result.has_update {
            println!("up to date ({})", result.current_ver);
            return Ok(ExitCode::SUCCESS);
        }

        let exe = std::env::current_exe()?;
        let staged = exe.with_file_name(format!(".mirror-fetch-{}.update", result.remote_ver));
        let job = DownloadJob::for_update(&result, staged)?;
        info!("update: downloading {}", result.remote_ver);
        let done = DownloadManager::new(&self.client, &self.session)
            .download_update(job)
            .await?;
        if let Some(sha256) = &done.sha256 {
            info!("update: artifact verified, sha256 {sha256}");
        }
        updater::install_update(&done.path, &exe)?;
        println!(
            "updated to {}, restart to use the new version",
            result.remote_ver
        );
        Ok(ExitCode::SUCCESS)
    }
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg} {bytes}/{total_bytes} ({percent}%) {bytes_per_sec}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

async fn render_progress(mut events: mpsc::UnboundedReceiver<DownloadEvent>, bar: ProgressBar) {
    let mut names: HashMap<usize, String> = HashMap::new();
    let show = |aggregate: AggregateProgress| {
        bar.set_length(aggregate.total_bytes);
        bar.set_position(aggregate.completed_bytes);
    };
    while let Some(event) = events.recv().await {
        match event {
            DownloadEvent::Started { index, name } => {
                bar.set_message(name.clone());
                names.insert(index, name);
            }
            DownloadEvent::Progress {
                index,
                downloaded,
                total,
                speed,
                aggregate,
            } => {
                let name = names.get(&index).map_or("", String::as_str);
                let percent = progress_percent(downloaded, total);
                bar.set_message(format!("{name} {percent:.0}% {speed}"));
                show(aggregate);
            }
            DownloadEvent::FallingBack { index, url, reason } => {
                let name = names.get(&index).map_or("", String::as_str);
                bar.println(format!("{name}: {reason}, retrying from {url}"));
            }
            DownloadEvent::Finished {
                index,
                ok,
                aggregate,
            } => {
                if let Some(name) = names.remove(&index)
                    && !ok
                {
                    bar.println(format!("{name}: failed"));
                }
                show(aggregate);
            }
        }
    }
}
