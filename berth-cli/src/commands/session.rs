//! `berth session add|list|show|destroy|purge|next-id`

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use berth_core::{NewSession, PortAllocation, SessionId, SessionMode, SessionRow};

use super::{absolute, open_store, print_json};

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Register a new active session.
    Add(AddArgs),

    /// List active sessions.
    List(ListArgs),

    /// Show one active session and its ports.
    Show(ShowArgs),

    /// Mark a session destroyed, releasing its ports.
    Destroy(DestroyArgs),

    /// Permanently delete every destroyed session row.
    Purge,

    /// Print the lowest free session identifier.
    NextId,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Session identifier. Defaults to the next free `001`..`999` id.
    pub session_id: Option<String>,

    /// Project root the session belongs to. Defaults to the current directory.
    #[arg(long, short = 'p')]
    pub project: Option<PathBuf>,

    /// Session working directory. Defaults to the project root.
    #[arg(long, short = 'd')]
    pub dir: Option<PathBuf>,

    /// Git branch the session works on.
    #[arg(long, short = 'b', default_value = "")]
    pub branch: String,

    /// Runtime mode: docker | native.
    #[arg(long, short = 'm', default_value = "docker")]
    pub mode: SessionMode,

    /// The session runs directly in the project checkout.
    #[arg(long)]
    pub in_place: bool,

    /// Emit the created row as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only sessions of this project root.
    #[arg(long, short = 'p')]
    pub project: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub session_id: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DestroyArgs {
    pub session_id: String,

    /// Project root; defaults to the project holding the session
    /// (destroyed rows included with `--purge`).
    #[arg(long, short = 'p')]
    pub project: Option<PathBuf>,

    /// Delete the rows outright instead of marking them destroyed.
    #[arg(long)]
    pub purge: bool,
}

pub fn run(cmd: SessionCommand, store: Option<&Path>) -> Result<()> {
    match cmd {
        SessionCommand::Add(args) => add(args, store),
        SessionCommand::List(args) => list(args, store),
        SessionCommand::Show(args) => show(args, store),
        SessionCommand::Destroy(args) => destroy(args, store),
        SessionCommand::Purge => purge(store),
        SessionCommand::NextId => next_id(store),
    }
}

fn add(args: AddArgs, store: Option<&Path>) -> Result<()> {
    let mut store = open_store(store)?;
    let project = absolute(args.project)?;
    let dir = match args.dir {
        Some(dir) => absolute(Some(dir))?,
        None => project.clone(),
    };
    let session_id = match args.session_id {
        Some(id) => SessionId::from(id),
        None => store
            .next_session_id()
            .context("failed to pick a session id")?,
    };

    let row = store
        .insert(
            NewSession::new(session_id.clone(), project, dir)
                .branch(args.branch)
                .mode(args.mode)
                .in_place(args.in_place),
        )
        .with_context(|| format!("failed to add session '{session_id}'"))?;

    if args.json {
        return print_json(&row);
    }
    println!(
        "{} Added session '{}' ({})",
        "✓".green(),
        row.session_id,
        row.session_dir.display()
    );
    Ok(())
}

#[derive(Tabled)]
struct SessionTableRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "project")]
    project: String,
    #[tabled(rename = "dir")]
    dir: String,
    #[tabled(rename = "branch")]
    branch: String,
    #[tabled(rename = "mode")]
    mode: String,
    #[tabled(rename = "created")]
    created: String,
}

impl From<&SessionRow> for SessionTableRow {
    fn from(row: &SessionRow) -> Self {
        let mode = if row.in_place {
            format!("{} (in place)", row.mode)
        } else {
            row.mode.to_string()
        };
        Self {
            id: row.session_id.to_string(),
            project: row.project_root.display().to_string(),
            dir: row.session_dir.display().to_string(),
            branch: row.branch.clone(),
            mode,
            created: row.created_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

fn list(args: ListArgs, store: Option<&Path>) -> Result<()> {
    let store = open_store(store)?;
    let rows = match args.project {
        Some(project) => store.list_by_project(&absolute(Some(project))?)?,
        None => store.list_all()?,
    };

    if args.json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }
    let mut table = Table::new(rows.iter().map(SessionTableRow::from));
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

#[derive(Serialize)]
struct SessionDetailJson<'a> {
    #[serde(flatten)]
    session: &'a SessionRow,
    ports: &'a [PortAllocation],
}

fn show(args: ShowArgs, store: Option<&Path>) -> Result<()> {
    let store = open_store(store)?;
    let session_id = SessionId::from(args.session_id);
    let row = store
        .find_by_id(&session_id)?
        .ok_or_else(|| anyhow!("no active session '{session_id}'"))?;
    let ports = store.ports_for_session(&session_id)?;

    if args.json {
        return print_json(&SessionDetailJson {
            session: &row,
            ports: &ports,
        });
    }

    println!("{} {}", "Session".bold(), row.session_id.to_string().bold());
    println!("  project  {}", row.project_root.display());
    println!("  dir      {}", row.session_dir.display());
    if !row.branch.is_empty() {
        println!("  branch   {}", row.branch);
    }
    println!(
        "  mode     {}{}",
        row.mode,
        if row.in_place { " (in place)" } else { "" }
    );
    println!("  created  {}", row.created_at.to_rfc3339());
    if ports.is_empty() {
        println!("  ports    {}", "none".bright_black());
    } else {
        println!("  ports");
        for allocation in &ports {
            println!("    {:<16} {}", allocation.service_name, allocation.port);
        }
    }
    Ok(())
}

fn destroy(args: DestroyArgs, store: Option<&Path>) -> Result<()> {
    let mut store = open_store(store)?;
    let session_id = SessionId::from(args.session_id);
    let project = match args.project {
        Some(project) => absolute(Some(project))?,
        None if args.purge => {
            // Destroyed rows are invisible to find_by_id but still purgeable.
            let mut roots = store.project_roots_for(&session_id)?;
            match roots.len() {
                0 => {
                    println!("No session '{session_id}'.");
                    return Ok(());
                }
                1 => roots.remove(0),
                _ => {
                    let listed: Vec<String> =
                        roots.iter().map(|r| r.display().to_string()).collect();
                    return Err(anyhow!(
                        "session '{session_id}' exists in several projects ({}); \
                         pass --project <path>",
                        listed.join(", ")
                    ));
                }
            }
        }
        None => match store.find_by_id(&session_id)? {
            Some(row) => row.project_root,
            None => {
                println!("No active session '{session_id}'.");
                return Ok(());
            }
        },
    };

    let changed = if args.purge {
        store.remove(&project, &session_id)?
    } else {
        store.mark_destroyed(&project, &session_id)?
    };

    if changed {
        let verb = if args.purge { "Removed" } else { "Destroyed" };
        println!("{} {verb} session '{session_id}'", "✓".green());
    } else {
        println!("No active session '{session_id}' in {}.", project.display());
    }
    Ok(())
}

fn purge(store: Option<&Path>) -> Result<()> {
    let mut store = open_store(store)?;
    let purged = store.purge_destroyed()?;
    println!("{} Purged {purged} destroyed session row(s)", "✓".green());
    Ok(())
}

fn next_id(store: Option<&Path>) -> Result<()> {
    let store = open_store(store)?;
    println!("{}", store.next_session_id()?);
    Ok(())
}
