use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use git_ipfs_rehost_archive::Archiver;
use git_ipfs_rehost_process::Git;
use git_ipfs_rehost_store::{Archive, JobID, Repository, Store};
use structopt::StructOpt;
use tokio::{sync::watch, task};

use crate::{
    decision::{DecisionEngine, Request},
    locator::{Host, RepoLocator},
    pipeline::Pipeline,
    queue::{Queue, Runner},
    submission::{Submission, Submitter},
};

mod collaborator;
mod decision;
mod job;
mod locator;
mod pipeline;
mod queue;
mod submission;

#[cfg(test)]
mod testing;

#[derive(Debug, StructOpt)]
#[structopt(
    about = "Rehosts git repositories into content-addressed storage, and keeps a catalog of every revision archived."
)]
struct Opt {
    #[structopt(flatten)]
    store: git_ipfs_rehost_store::Opt,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Queues a repository for rehosting, unless the revision is already
    /// archived.
    Submit {
        #[structopt(flatten)]
        repo: RepoArgs,

        #[structopt(long, help = "commit to archive; takes precedence over --tag")]
        rev: Option<String>,

        #[structopt(long, help = "tag to archive; defaults to the default branch's HEAD")]
        tag: Option<String>,

        #[structopt(long, help = "branch to clone")]
        branch: Option<String>,

        #[structopt(long, help = "archive the revision again even if it is already archived")]
        force: bool,

        #[structopt(flatten)]
        git: git_ipfs_rehost_process::Opt,
    },

    /// Shows the state of a job.
    Status { job: JobID },

    /// Runs queued jobs.
    Work {
        #[structopt(long, help = "run until the queue is empty, then exit")]
        once: bool,

        #[structopt(flatten)]
        git: git_ipfs_rehost_process::Opt,

        #[structopt(flatten)]
        archive: git_ipfs_rehost_archive::Opt,

        #[structopt(flatten)]
        pipeline: pipeline::Opt,

        #[structopt(flatten)]
        queue: queue::Opt,
    },

    /// Shows a repository and every archive taken of it.
    Show {
        #[structopt(flatten)]
        repo: RepoArgs,
    },

    /// Shows the most recent archive of a repository.
    Latest {
        #[structopt(flatten)]
        repo: RepoArgs,
    },

    /// Finds the archive with the given content ID.
    Lookup { content_id: String },
}

#[derive(Debug, StructOpt)]
struct RepoArgs {
    #[structopt(help = "github.com or gitlab.com")]
    host: Host,

    owner: String,

    #[structopt(name = "repo")]
    name: String,
}

impl RepoArgs {
    fn locator(&self) -> anyhow::Result<RepoLocator> {
        Ok(RepoLocator::new(self.host, &self.owner, &self.name)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments.
    let opt = Opt::from_args();

    // Set up logging.
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")?
        .format(flexi_logger::colored_detailed_format)
        .start()?;

    let store = Store::from_opt(&opt.store)?;

    match opt.command {
        Command::Submit {
            repo,
            rev,
            tag,
            branch,
            force,
            git,
        } => {
            let request = Request {
                locator: repo.locator()?,
                revision: rev,
                tag,
                branch,
                force_update: force,
            };
            let submitter = Submitter::new(
                DecisionEngine::new(Arc::new(Git::new(git)), store.clone()),
                Queue::new(store),
            );

            match submitter.submit(&request).await? {
                Submission::Skipped { archive } => {
                    println!("already archived");
                    print_archive(&archive);
                }
                Submission::Queued {
                    job_id,
                    action,
                    is_fork,
                } => {
                    println!("queued job {} ({})", job_id, action);
                    if is_fork {
                        println!(
                            "note: {} is a fork; re-archiving it may not reproduce an identical archive",
                            &request.locator
                        );
                    }
                }
            }
        }
        Command::Status { job } => match Queue::new(store).status(job).await? {
            Some(status) => {
                println!("job {}: {}", status.id, status.state);
                if let Some(job) = &status.job {
                    println!("repository: {}", job.locator.canonical_url());
                    println!("revision: {}", &job.revision);
                }
                println!("attempts: {}", status.attempts);
                if let Some(error) = &status.last_error {
                    println!("last error: {}", error);
                }
                if let Some(archive) = &status.result {
                    print_archive(archive);
                }
            }
            None => anyhow::bail!("no such job: {}", job),
        },
        Command::Work {
            once,
            git,
            archive,
            pipeline,
            queue,
        } => {
            git_ipfs_rehost_process::preflight(&git)?;

            let pipeline = Arc::new(Pipeline::new(
                Arc::new(Git::new(git)),
                Arc::new(Archiver::from_opt(&archive)),
                store.clone(),
                pipeline,
            ));
            let runner = Runner::from_opt(pipeline, store, &queue);

            if once {
                while let Some((id, state)) = runner.run_once().await? {
                    log::debug!("job {} left {}", id, state);
                }
                log::info!("queue is empty; exiting");
            } else {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                task::spawn(async move {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("cannot listen for ctrl-c: {:?}", e);
                        return;
                    }
                    log::info!("interrupted; finishing running jobs");
                    let _ = shutdown_tx.send(true);
                });

                Arc::new(runner).run(queue.jobs(), shutdown_rx).await?;
            }
        }
        Command::Show { repo } => {
            let url = repo.locator()?.canonical_url();
            match with_connection(store, move |conn| conn.find_repository_by_url(&url)).await? {
                Some(repository) => print_repository(&repository),
                None => anyhow::bail!("{} has not been archived", repo.locator()?),
            }
        }
        Command::Latest { repo } => {
            let url = repo.locator()?.canonical_url();
            let latest = with_connection(store, move |conn| {
                match conn.find_repository_by_url(&url)? {
                    Some(repository) => conn.latest_archive(repository.id),
                    None => Ok(None),
                }
            })
            .await?;

            match latest {
                Some(archive) => print_archive(&archive),
                None => anyhow::bail!("{} has not been archived", repo.locator()?),
            }
        }
        Command::Lookup { content_id } => {
            let lookup = content_id.clone();
            match with_connection(store, move |conn| conn.find_archive_by_content_id(&lookup))
                .await?
            {
                Some(archive) => print_archive(&archive),
                None => anyhow::bail!("no archive has content ID {}", content_id),
            }
        }
    }

    Ok(())
}

async fn with_connection<F, T>(store: Store, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&mut git_ipfs_rehost_store::Connection) -> Result<T, git_ipfs_rehost_store::Error>
        + Send
        + 'static,
    T: Send + 'static,
{
    Ok(task::spawn_blocking(move || f(&mut store.connection()?)).await??)
}

fn print_repository(repository: &Repository) {
    println!("repository {}: {}", repository.id, &repository.url);
    if repository.is_fork {
        println!("fork: yes");
    }
    for archive in repository.archives.iter() {
        println!();
        print_archive(archive);
    }
}

fn print_archive(archive: &Archive) {
    println!("revision: {}", &archive.revision);
    if let Some(tag) = &archive.tag {
        println!("tag: {}", tag);
    }
    println!("content ID: {}", &archive.content_id);
    println!("URL: {}", &archive.retrieval_url);
    println!("size: {}", archive.size);
    if let Some(date) = &archive.committed_date {
        println!("committed: {}", unix_seconds(date));
    }
    println!("archived: {}", unix_seconds(&archive.archived_at));
}

fn unix_seconds(time: &SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
