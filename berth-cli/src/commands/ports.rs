//! `berth ports allocate|list`

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use berth_core::SessionId;

use super::{open_store, print_json};

#[derive(Subcommand, Debug)]
pub enum PortsCommand {
    /// Bind one port per service to an active session.
    Allocate(AllocateArgs),

    /// List committed allocations.
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct AllocateArgs {
    pub session_id: String,

    /// Service names, e.g. `postgres app`.
    #[arg(required = true, num_args = 1..)]
    pub services: Vec<String>,

    /// Emit `{ "service": port }` as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only ports of this session.
    #[arg(long, short = 's')]
    pub session: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct AllocationTableRow {
    #[tabled(rename = "port")]
    port: u16,
    #[tabled(rename = "session")]
    session: String,
    #[tabled(rename = "service")]
    service: String,
}

pub fn run(cmd: PortsCommand, store: Option<&Path>) -> Result<()> {
    match cmd {
        PortsCommand::Allocate(args) => allocate(args, store),
        PortsCommand::List(args) => list(args, store),
    }
}

fn allocate(args: AllocateArgs, store: Option<&Path>) -> Result<()> {
    let mut store = open_store(store)?;
    let session_id = SessionId::from(args.session_id);
    let services: Vec<&str> = args.services.iter().map(String::as_str).collect();

    let ports = store
        .allocate(&session_id, &services)
        .with_context(|| format!("failed to allocate ports for session '{session_id}'"))?;

    if args.json {
        let payload: BTreeMap<&str, u16> = ports
            .iter()
            .map(|(service, port)| (service.as_str(), *port))
            .collect();
        return print_json(&payload);
    }
    for (service, port) in &ports {
        println!("{service}={port}");
    }
    Ok(())
}

fn list(args: ListArgs, store: Option<&Path>) -> Result<()> {
    let store = open_store(store)?;
    let allocations = match args.session {
        Some(session) => store.ports_for_session(&SessionId::from(session))?,
        None => store.all_allocations()?,
    };

    if args.json {
        return print_json(&allocations);
    }
    if allocations.is_empty() {
        println!("No ports allocated.");
        return Ok(());
    }
    let rows = allocations.into_iter().map(|a| AllocationTableRow {
        port: a.port,
        session: a.session_id.0,
        service: a.service_name,
    });
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
