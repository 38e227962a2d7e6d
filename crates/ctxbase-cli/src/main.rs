mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{config_path, load_config};
use ctxbase_core::paging::PageRequest;
use ctxbase_core::{JsonObject, MessageRole, Part, TaskStatus};
use ctxbase_service::{ContextService, SendMessage};
use ctxbase_storage::{ContextStore, SessionFilter};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ctxbase")]
#[command(about = "Session context store", long_about = None)]
struct Cli {
    /// Config file (defaults to $CTXBASE_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database, overrides the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Project that owns spaces, sessions and disks
    #[arg(long, global = true)]
    project: Option<Uuid>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage spaces
    Space {
        #[command(subcommand)]
        action: SpaceCommands,
    },
    /// Manage sessions
    Session {
        #[command(subcommand)]
        action: SessionCommands,
    },
    /// Send and page through session messages
    Message {
        #[command(subcommand)]
        action: MessageCommands,
    },
    /// Manage session tasks
    Task {
        #[command(subcommand)]
        action: TaskCommands,
    },
    /// Manage disks
    Disk {
        #[command(subcommand)]
        action: DiskCommands,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
struct PageArgs {
    #[arg(long)]
    limit: Option<u32>,
    /// Opaque cursor from a previous page's next_cursor
    #[arg(long)]
    cursor: Option<String>,
    /// Oldest first instead of newest first
    #[arg(long, default_value_t = false)]
    asc: bool,
}

impl PageArgs {
    fn request(&self) -> PageRequest {
        PageRequest {
            limit: self.limit,
            cursor: self.cursor.clone(),
            time_desc: Some(!self.asc),
        }
    }
}

#[derive(Subcommand, Debug)]
enum SpaceCommands {
    Create {
        /// JSON object
        #[arg(long)]
        configs: Option<String>,
    },
    List {
        #[command(flatten)]
        page: PageArgs,
    },
    Configs {
        id: Uuid,
        #[arg(long)]
        set: String,
    },
    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommands {
    Create {
        #[arg(long)]
        space: Option<Uuid>,
        /// JSON object
        #[arg(long)]
        configs: Option<String>,
    },
    List {
        #[arg(long, conflicts_with = "not_connected")]
        space: Option<Uuid>,
        /// Only sessions without a space
        #[arg(long, default_value_t = false)]
        not_connected: bool,
        #[command(flatten)]
        page: PageArgs,
    },
    Show {
        id: Uuid,
    },
    Configs {
        id: Uuid,
        #[arg(long)]
        set: String,
    },
    Connect {
        id: Uuid,
        #[arg(long)]
        space: Uuid,
    },
    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum MessageCommands {
    Send {
        session: Uuid,
        #[arg(long, default_value_t = MessageRole::User)]
        role: MessageRole,
        /// Text part, repeatable
        #[arg(long = "text")]
        texts: Vec<String>,
        /// Part as a JSON object, repeatable
        #[arg(long = "part")]
        parts: Vec<String>,
        /// JSON object
        #[arg(long)]
        meta: Option<String>,
    },
    List {
        session: Uuid,
        #[command(flatten)]
        page: PageArgs,
    },
    Pending {
        session: Uuid,
    },
    /// Set the extraction status of one or more messages
    Status {
        #[arg(required = true)]
        ids: Vec<Uuid>,
        #[arg(long)]
        status: TaskStatus,
    },
}

#[derive(Subcommand, Debug)]
enum TaskCommands {
    Add {
        session: Uuid,
        #[arg(long)]
        order: i64,
        /// JSON object
        #[arg(long)]
        data: Option<String>,
    },
    List {
        session: Uuid,
        #[command(flatten)]
        page: PageArgs,
    },
    Status {
        id: Uuid,
        status: TaskStatus,
    },
    /// Mark a task as folded into its session's space
    Digested {
        id: Uuid,
    },
    LearningStatus {
        session: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum DiskCommands {
    Create,
    List {
        #[command(flatten)]
        page: PageArgs,
    },
    Delete {
        id: Uuid,
    },
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        eprintln!("ctxbase: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&config_path(cli.config.as_deref()))?;
    init_logging(cli.debug, config.log_level.as_deref());

    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create data dir {}", parent.display()))?;
    }
    let store = ContextStore::open(&db_path)
        .with_context(|| format!("open database {}", db_path.display()))?;
    debug!(path = %db_path.display(), "opened context store");

    let service = ContextService::new(store, config.paging);
    let project = Project(cli.project.or(config.project_id));
    dispatch(&service, project, cli.command)
}

#[derive(Debug, Clone, Copy)]
struct Project(Option<Uuid>);

impl Project {
    fn id(self) -> Result<Uuid> {
        self.0
            .context("no project: pass --project or set project_id in the config file")
    }
}

fn dispatch(service: &ContextService, project: Project, command: Commands) -> Result<()> {
    match command {
        Commands::Space { action } => match action {
            SpaceCommands::Create { configs } => {
                print_json(&service.create_space(project.id()?, json_object(configs.as_deref())?)?)
            }
            SpaceCommands::List { page } => {
                print_json(&service.list_spaces(project.id()?, &page.request())?)
            }
            SpaceCommands::Configs { id, set } => {
                service.update_space_configs(id, &json_object(Some(&set))?)?;
                print_json(&service.space(id)?)
            }
            SpaceCommands::Delete { id } => Ok(service.delete_space(id)?),
        },
        Commands::Session { action } => match action {
            SessionCommands::Create { space, configs } => print_json(&service.create_session(
                project.id()?,
                space,
                json_object(configs.as_deref())?,
            )?),
            SessionCommands::List {
                space,
                not_connected,
                page,
            } => {
                let filter = match (space, not_connected) {
                    (Some(space_id), _) => SessionFilter::InSpace(space_id),
                    (None, true) => SessionFilter::NotConnected,
                    (None, false) => SessionFilter::All,
                };
                print_json(&service.list_sessions(project.id()?, filter, &page.request())?)
            }
            SessionCommands::Show { id } => print_json(&service.session(id)?),
            SessionCommands::Configs { id, set } => {
                service.update_session_configs(id, &json_object(Some(&set))?)?;
                print_json(&service.session(id)?)
            }
            SessionCommands::Connect { id, space } => {
                service.connect_to_space(id, space)?;
                print_json(&service.session(id)?)
            }
            SessionCommands::Delete { id } => Ok(service.delete_session(id)?),
        },
        Commands::Message { action } => match action {
            MessageCommands::Send {
                session,
                role,
                texts,
                parts,
                meta,
            } => {
                let mut all = texts.into_iter().map(Part::text).collect::<Vec<_>>();
                for (index, raw) in parts.iter().enumerate() {
                    let part: Part = serde_json::from_str(raw)
                        .with_context(|| format!("--part #{}", index + 1))?;
                    all.push(part);
                }
                let message = service.send_message(SendMessage {
                    project_id: project.id()?,
                    session_id: session,
                    role,
                    parts: all,
                    meta: json_object(meta.as_deref())?,
                })?;
                print_json(&message)
            }
            MessageCommands::List { session, page } => {
                print_json(&service.get_messages(session, &page.request())?)
            }
            MessageCommands::Pending { session } => {
                print_json(&service.pending_message_count(session)?)
            }
            MessageCommands::Status { ids, status } => {
                print_json(&service.set_message_process_status(&ids, status)?)
            }
        },
        Commands::Task { action } => match action {
            TaskCommands::Add {
                session,
                order,
                data,
            } => print_json(&service.add_task(session, order, json_object(data.as_deref())?)?),
            TaskCommands::List { session, page } => {
                print_json(&service.get_tasks(session, &page.request())?)
            }
            TaskCommands::Status { id, status } => Ok(service.update_task_status(id, status)?),
            TaskCommands::Digested { id } => Ok(service.mark_task_space_digested(id)?),
            TaskCommands::LearningStatus { session } => {
                print_json(&service.learning_status(session)?)
            }
        },
        Commands::Disk { action } => match action {
            DiskCommands::Create => print_json(&service.create_disk(project.id()?)?),
            DiskCommands::List { page } => {
                print_json(&service.list_disks(project.id()?, &page.request())?)
            }
            DiskCommands::Delete { id } => Ok(service.delete_disk(id)?),
        },
    }
}

fn json_object(raw: Option<&str>) -> Result<JsonObject> {
    match raw {
        None => Ok(JsonObject::new()),
        Some(raw) => serde_json::from_str(raw).context("expected a JSON object"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(debug: bool, configured: Option<&str>) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CTXBASE_LOG_LEVEL") {
        level
    } else {
        configured.unwrap_or("info").to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("ctxbase: logging already initialized");
    }
}
