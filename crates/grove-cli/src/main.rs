//! grove — supervised AI coding-agent sessions in containers.

mod attach;
mod client;
mod commands;
mod credentials;
mod project;
mod ui;

use clap::{Parser, Subcommand};

/// grove — run AI coding agents in supervised container sessions.
#[derive(Parser, Debug)]
#[command(name = "grove", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage project registrations
    Project {
        #[command(subcommand)]
        action: ProjectCommands,
    },

    /// Start a new instance on a branch (and attach to it)
    Start {
        /// Project name or 1-based index from `grove project list`
        project: String,
        /// Branch for the instance worktree
        branch: String,
        /// Do not attach after starting
        #[arg(short = 'd', long)]
        detach: bool,
    },

    /// List instances
    List {
        /// Show only active instances (exclude FINISHED)
        #[arg(long)]
        active: bool,
    },

    /// Attach the terminal to an instance (detach: Ctrl-])
    Attach { instance: String },

    /// Print recent instance output
    Logs {
        instance: String,
        /// Keep following new output
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Kill an instance's agent process
    Stop { instance: String },

    /// Restart a stopped/crashed/finished instance in place
    Restart {
        instance: String,
        /// Do not attach after restarting
        #[arg(short = 'd', long)]
        detach: bool,
    },

    /// Remove an instance: container, worktree, branch, record
    Drop {
        instance: String,
        /// Skip the confirmation prompt
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// Mark an instance finished and run the configured finish commands
    Finish { instance: String },

    /// Run the configured check commands against a live instance
    Check { instance: String },

    /// Drop all dead instances
    Prune {
        /// Also drop FINISHED instances
        #[arg(long)]
        finished: bool,
    },

    /// Print an instance's worktree directory
    Dir { instance: String },

    /// Open an interactive shell inside an instance's container
    Shell {
        instance: String,
        /// Shell to run (default: sh)
        shell: Option<String>,
    },

    /// Live-updating instance list
    Watch,

    /// Daemon management
    Daemon {
        #[command(subcommand)]
        action: DaemonCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// Register a project
    Create {
        name: String,
        /// Git remote URL (can be added later)
        #[arg(long)]
        repo: Option<String>,
    },
    /// List registered projects
    List,
    /// Delete a project, its instances, and its worktrees
    Delete {
        /// Project name or 1-based index
        name: String,
    },
    /// Print a project's main checkout directory
    Dir {
        /// Project name or 1-based index
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommands {
    /// Show whether groved is running
    Status,
    /// Print the daemon log
    Logs {
        /// Number of trailing lines
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("grove: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Project { action } => match action {
            ProjectCommands::Create { name, repo } => project::create(&name, repo.as_deref()),
            ProjectCommands::List => {
                project::list();
                Ok(())
            }
            ProjectCommands::Delete { name } => project::delete(&name).await,
            ProjectCommands::Dir { name } => project::dir(&name),
        },
        Commands::Start {
            project,
            branch,
            detach,
        } => commands::start(&project, &branch, detach).await,
        Commands::List { active } => commands::list(active).await,
        Commands::Attach { instance } => attach::attach(&instance).await,
        Commands::Logs { instance, follow } => commands::logs(&instance, follow).await,
        Commands::Stop { instance } => commands::stop(&instance).await,
        Commands::Restart { instance, detach } => commands::restart(&instance, detach).await,
        Commands::Drop { instance, force } => commands::drop(&instance, force).await,
        Commands::Finish { instance } => commands::finish(&instance).await,
        Commands::Check { instance } => commands::check(&instance).await,
        Commands::Prune { finished } => commands::prune(finished).await,
        Commands::Dir { instance } => commands::dir(&instance).await,
        Commands::Shell { instance, shell } => commands::shell(&instance, shell.as_deref()).await,
        Commands::Watch => commands::watch().await,
        Commands::Daemon { action } => match action {
            DaemonCommands::Status => commands::daemon_status().await,
            DaemonCommands::Logs { lines } => commands::daemon_logs(lines).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_start_with_detach_anywhere() {
        let cli = Cli::parse_from(["grove", "start", "api", "fix-login", "-d"]);
        match cli.command {
            Commands::Start {
                project,
                branch,
                detach,
            } => {
                assert_eq!(project, "api");
                assert_eq!(branch, "fix-login");
                assert!(detach);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_logs_follow() {
        let cli = Cli::parse_from(["grove", "logs", "3", "-f"]);
        match cli.command {
            Commands::Logs { instance, follow } => {
                assert_eq!(instance, "3");
                assert!(follow);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_project_create_with_repo() {
        let cli = Cli::parse_from([
            "grove",
            "project",
            "create",
            "api",
            "--repo",
            "https://example.com/api.git",
        ]);
        match cli.command {
            Commands::Project {
                action: ProjectCommands::Create { name, repo },
            } => {
                assert_eq!(name, "api");
                assert_eq!(repo.as_deref(), Some("https://example.com/api.git"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
