//! Machine and process identity used for mastership and change-file attribution.

use std::env;

pub const MACHINE_ENV: &str = "CAIRN_MACHINE";
pub const PROCESS_ENV: &str = "CAIRN_PROCESS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Host identity; written into the master flag and change-file names.
    pub machine: String,
    /// `<exe>:<pid>`; written into the process flag.
    pub process: String,
}

impl Identity {
    pub fn new(machine: impl AsRef<str>, process: impl Into<String>) -> Self {
        Self {
            machine: sanitize(machine.as_ref()),
            process: process.into(),
        }
    }

    /// Identity for an explicitly named machine, with this process as process identity.
    pub fn for_machine(machine: impl AsRef<str>) -> Self {
        Self::new(machine, current_process_id())
    }

    /// Resolve from `CAIRN_MACHINE`/`CAIRN_PROCESS`, falling back to the host name.
    pub fn detect() -> Self {
        let machine = env::var(MACHINE_ENV)
            .ok()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| whoami::fallible::hostname().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let process = env::var(PROCESS_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(current_process_id);
        Self::new(machine, process)
    }
}

pub fn current_process_id() -> String {
    let name = env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_else(|| "cairn".to_string());
    format!("{}:{}", name, std::process::id())
}

/// Keep machine names usable as file-name components.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
