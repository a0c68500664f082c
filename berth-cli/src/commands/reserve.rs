//! `berth reserve add|remove|list`

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use super::{open_store, print_json};

#[derive(Subcommand, Debug)]
pub enum ReserveCommand {
    /// Withhold a port from automatic allocation.
    Add(AddArgs),

    /// Release a reservation.
    Remove {
        port: u16,
    },

    /// List reservations.
    List {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    pub port: u16,

    /// Why the port is held, e.g. "local postgres".
    #[arg(long, short = 'r', default_value = "")]
    pub reason: String,
}

#[derive(Tabled)]
struct ReservationTableRow {
    #[tabled(rename = "port")]
    port: u16,
    #[tabled(rename = "reason")]
    reason: String,
    #[tabled(rename = "since")]
    since: String,
}

pub fn run(cmd: ReserveCommand, store: Option<&Path>) -> Result<()> {
    match cmd {
        ReserveCommand::Add(args) => add(args, store),
        ReserveCommand::Remove { port } => remove(port, store),
        ReserveCommand::List { json } => list(json, store),
    }
}

fn add(args: AddArgs, store: Option<&Path>) -> Result<()> {
    let mut store = open_store(store)?;
    store
        .reserve(args.port, &args.reason)
        .with_context(|| format!("failed to reserve port {}", args.port))?;
    println!("{} Reserved port {}", "✓".green(), args.port);
    Ok(())
}

fn remove(port: u16, store: Option<&Path>) -> Result<()> {
    let mut store = open_store(store)?;
    if store.unreserve(port)? {
        println!("{} Released port {port}", "✓".green());
    } else {
        println!("Port {port} was not reserved.");
    }
    Ok(())
}

fn list(json: bool, store: Option<&Path>) -> Result<()> {
    let store = open_store(store)?;
    let reservations = store.reservations()?;

    if json {
        return print_json(&reservations);
    }
    if reservations.is_empty() {
        println!("No reserved ports.");
        return Ok(());
    }
    let rows = reservations.into_iter().map(|r| ReservationTableRow {
        port: r.port,
        reason: r.reason,
        since: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
    });
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
