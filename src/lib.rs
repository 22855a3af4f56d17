//! Cairn: versioned JSON records that replicate through a shared folder
//!
//! **Cairn is a file-backed record store for folders kept in sync by an outside service.**
//!
//! Every machine reads the same canonical JSON file. Exactly one machine, the master, rewrites it;
//! every other machine drops small change files next to it. Whoever reloads next folds those
//! changes back in. No network protocol and no cross-machine locks are involved, only files.
//!
//! # Core Principles
//!
//! - **Whole-record versions**: a record's `Modified` stamp is its version; the newest wins
//! - **Bounded history**: each key keeps its last few versions, oldest first
//! - **Single writer**: only the master rewrites the canonical file
//! - **Tombstones**: deletes are versions too, so they replicate like edits
//!
//! # Layout
//!
//! ```text
//! <dir>/<name>.json            canonical file, one history array per key
//! <dir>/Changes/Master.flag    owner|instant of the last canonical write
//! <dir>/Changes/<machine>.flag process|instant of this machine's last load or store
//! <dir>/Changes/<ticks>_<machine>.json   one-record change files
//! <dir>/Backup/<name>_<ticks>.json       optional copies taken before a store
//! <dir>/cairn.toml             optional store options
//! ```
//!
//! # Examples
//!
//! ```bash
//! cairn --pit ~/Sync/Countries.json set Finland '{"capital": "Helsinki"}'
//! cairn --pit ~/Sync/Countries.json reload
//! cairn --pit ~/Sync/Countries.json status
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: records, histories, flags, change files and the [`core::store::Store`]
//! - [`plugins`]: optional features such as attachments

mod cli;
pub mod core;
pub mod plugins;

use clap::Parser;
use cli::{Cli, Command};
use colored::Colorize;
use crate::core::config;
use crate::core::error::CairnError;
use crate::core::identity::Identity;
use crate::core::record::Record;
use crate::core::store::{SaveOutcome, Store};
use crate::core::sync::SyncContext;
use crate::core::{telemetry, time};
use crate::plugins::attachments;
use serde_json::Value as JsonValue;
use std::path::Path;

fn open_store(cli: &Cli) -> Result<Store, CairnError> {
    let dir = cli.pit.parent().unwrap_or_else(|| Path::new(""));
    let mut options = config::load_options(dir)?;
    if cli.read_only {
        options.read_only = true;
    }
    let identity = match &cli.machine {
        Some(machine) => Identity::for_machine(machine),
        None => Identity::detect(),
    };
    Store::open(&cli.pit, options, identity, SyncContext::global())
}

fn print_json(value: &impl serde::Serialize) -> Result<(), CairnError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_record(record: &Record) {
    let name = if record.deleted() {
        record.name().red().strikethrough()
    } else {
        record.name().bold()
    };
    println!(
        "{}  {}{}",
        name,
        time::format_iso(&record.modified()).dimmed(),
        if record.is_dirty() {
            " (unsaved)".yellow().to_string()
        } else {
            String::new()
        }
    );
    for (key, value) in record.properties() {
        println!("  {}: {}", key.cyan(), value);
    }
    if !record.note().is_empty() {
        for line in record.note().lines() {
            println!("  {} {}", "#".dimmed(), line.dimmed());
        }
    }
}

fn report_save(outcome: SaveOutcome) {
    match outcome {
        SaveOutcome::Stored { written: true } => println!("{}", "stored canonical file".green()),
        SaveOutcome::Stored { written: false } => println!("nothing to store"),
        SaveOutcome::ChangeFiles { written } => {
            println!("{} change file(s) written", written.to_string().green())
        }
    }
}

pub fn run() -> Result<(), CairnError> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);
    let mut store = open_store(&cli)?;

    match &cli.command {
        Command::Show {
            key,
            with_deleted,
            format,
        } => {
            let record = if *with_deleted {
                store.get_with_deleted(key)
            } else {
                store.get(key)
            }
            .ok_or_else(|| CairnError::NotFound(format!("record '{}'", key)))?;
            if format.is_json() {
                print_json(record)?;
            } else {
                print_record(record);
            }
        }
        Command::List {
            with_deleted,
            format,
        } => {
            let records: Vec<&Record> = if *with_deleted {
                store
                    .keys()
                    .iter()
                    .filter_map(|k| store.get_with_deleted(k))
                    .collect()
            } else {
                store.all_undeleted()
            };
            if format.is_json() {
                print_json(&records)?;
            } else if records.is_empty() {
                println!("{}", "no records".dimmed());
            } else {
                for record in records {
                    print_record(record);
                }
            }
        }
        Command::Find { filter, format } => {
            let records = store.find(filter);
            if format.is_json() {
                print_json(&records)?;
            } else if records.is_empty() {
                println!("{}", "no matching records".dimmed());
            } else {
                for record in records {
                    print_record(record);
                }
            }
        }
        Command::History {
            key,
            property,
            list,
            format,
        } => {
            let history = store
                .history(key)
                .ok_or_else(|| CairnError::NotFound(format!("record '{}'", key)))?;
            match property {
                Some(property) if *list => {
                    let lists = store.value_lists_over_time(key, property);
                    if format.is_json() {
                        let rows: Vec<JsonValue> = lists
                            .iter()
                            .map(|(at, items)| {
                                let at = time::format_iso(at);
                                serde_json::json!({"Modified": at, "values": items})
                            })
                            .collect();
                        print_json(&rows)?;
                    } else {
                        for (at, items) in lists {
                            let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                            println!("{}  [{}]", time::format_iso(&at).dimmed(), items.join(", "));
                        }
                    }
                }
                Some(property) => {
                    let values = store.values_over_time(key, property);
                    if format.is_json() {
                        let rows: Vec<JsonValue> = values
                            .iter()
                            .map(|(at, v)| {
                                serde_json::json!({"Modified": time::format_iso(at), "value": v})
                            })
                            .collect();
                        print_json(&rows)?;
                    } else {
                        for (at, value) in values {
                            println!("{}  {}", time::format_iso(&at).dimmed(), value);
                        }
                    }
                }
                None => {
                    let versions: Vec<&Record> = history.iter().collect();
                    if format.is_json() {
                        print_json(&versions)?;
                    } else {
                        for record in versions {
                            print_record(record);
                        }
                    }
                }
            }
        }
        Command::Set { key, json } => {
            let document: JsonValue = serde_json::from_str(json)?;
            store.set_property(key, &document)?;
            report_save(store.save(None, false)?);
        }
        Command::Unset { key, property } => {
            store.delete_property(key, property)?;
            report_save(store.save(None, false)?);
        }
        Command::Delete {
            key,
            by,
            no_backdate,
        } => {
            let by = by.clone().unwrap_or_else(|| store.identity().machine.clone());
            if store.delete(key, Some(&by), !no_backdate) {
                report_save(store.save(None, false)?);
            } else {
                println!("{} is absent or already deleted", key);
            }
        }
        Command::Save { backup, force } => {
            let backup = backup.then_some(true);
            report_save(store.save(backup, *force)?);
        }
        Command::Reload => {
            let outcome = store.reload()?;
            println!("reload: {}", outcome.to_string().green());
        }
        Command::Merge => {
            let merged = store.merge_changes()?;
            println!("{} version(s) merged", merged.to_string().green());
        }
        Command::Status { format } => {
            let status = store.status()?;
            if format.is_json() {
                print_json(&status)?;
            } else {
                println!("{} {}", "store:".bold(), status.path.display());
                println!(
                    "{} {}{}",
                    "machine:".bold(),
                    status.machine,
                    if status.is_master {
                        " (master)".green().to_string()
                    } else {
                        String::new()
                    }
                );
                if let (Some(owner), Some(at)) = (&status.master_owner, &status.master_time) {
                    println!("{} {} at {}", "master:".bold(), owner, at);
                }
                if let Some(at) = &status.process_time {
                    println!("{} {}", "last sync:".bold(), at);
                }
                println!("{} {}", "records:".bold(), status.keys);
                if !status.dirty_keys.is_empty() {
                    println!("{} {}", "unsaved:".yellow().bold(), status.dirty_keys.join(", "));
                }
                println!(
                    "{} {}{}",
                    "change files:".bold(),
                    status.pending_changes,
                    if status.foreign_changes {
                        " (from other machines)".yellow().to_string()
                    } else {
                        String::new()
                    }
                );
            }
        }
        Command::Claim => {
            let previous = store.claim_master()?;
            if previous == store.identity().machine {
                println!("{} already holds mastership", previous);
            } else {
                println!(
                    "{} took over mastership from {}",
                    store.identity().machine.green(),
                    if previous.is_empty() { "nobody" } else { previous.as_str() }
                );
            }
        }
        Command::Attach { file } => {
            let attachment = attachments::attach(&store, file)?;
            println!("attached {}", attachment.name.green());
        }
        Command::Attachments { remove, format } => {
            if let Some(name) = remove {
                if attachments::remove_attachment(&store, name)? {
                    println!("removed {}", name);
                } else {
                    println!("{} not found", name);
                }
            } else {
                let found = attachments::list_attachments(&store)?;
                if format.is_json() {
                    print_json(&found)?;
                } else {
                    for attachment in found {
                        println!("{}  {} bytes", attachment.name, attachment.size);
                    }
                }
            }
        }
    }
    Ok(())
}
