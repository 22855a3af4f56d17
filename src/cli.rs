//! CLI struct definitions for the `cairn` command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "cairn",
    version = env!("CARGO_PKG_VERSION"),
    about = "Versioned JSON records in a folder replicated by any file-sync service."
)]
pub(crate) struct Cli {
    /// Canonical JSON file of the store.
    #[clap(long, global = true, default_value = "pit.json")]
    pub pit: PathBuf,
    /// Machine name to act as (defaults to CAIRN_MACHINE or the host name).
    #[clap(long, global = true)]
    pub machine: Option<String>,
    /// Open the store read-only.
    #[clap(long, global = true)]
    pub read_only: bool,
    /// Log store activity to stderr.
    #[clap(long, short = 'v', global = true)]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct FormatArg {
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

impl FormatArg {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Show the current version of one record
    Show {
        key: String,
        /// Show the record even if it is deleted
        #[clap(long)]
        with_deleted: bool,
        #[clap(flatten)]
        format: FormatArg,
    },
    /// List current records
    List {
        /// Include deleted records
        #[clap(long)]
        with_deleted: bool,
        #[clap(flatten)]
        format: FormatArg,
    },
    /// List live records whose JSON contains every term
    Find {
        /// Terms separated by spaces or '+', e.g. 'Nordic+Helsinki'
        filter: String,
        #[clap(flatten)]
        format: FormatArg,
    },
    /// Show the stored versions of one record
    History {
        key: String,
        /// Only show how this property changed over time
        #[clap(long)]
        property: Option<String>,
        /// Treat the property as a list and show its elements per version
        #[clap(long, requires = "property")]
        list: bool,
        #[clap(flatten)]
        format: FormatArg,
    },
    /// Merge a JSON object into a record, creating it if needed
    Set {
        key: String,
        /// JSON object, e.g. '{"capital": "Helsinki"}'
        json: String,
    },
    /// Remove one property from a record
    Unset { key: String, property: String },
    /// Mark a record as deleted
    Delete {
        key: String,
        /// Who deleted it; recorded in the note
        #[clap(long)]
        by: Option<String>,
        /// Stamp the deletion now instead of slightly in the past
        #[clap(long)]
        no_backdate: bool,
    },
    /// Persist pending edits (store on the master, change files elsewhere)
    Save {
        /// Copy the canonical file to Backup/ first
        #[clap(long)]
        backup: bool,
        /// Rewrite the canonical file even if nothing changed
        #[clap(long)]
        force: bool,
    },
    /// Reconcile with the other replicas
    Reload,
    /// Merge pending change files
    Merge,
    /// Show mastership, flags and pending changes
    Status {
        #[clap(flatten)]
        format: FormatArg,
    },
    /// Make this machine the master
    Claim,
    /// Copy a document into the store folder
    Attach { file: PathBuf },
    /// List or remove attached documents
    Attachments {
        /// Remove this attachment (path relative to the store folder)
        #[clap(long)]
        remove: Option<String>,
        #[clap(flatten)]
        format: FormatArg,
    },
}
