//! One-line (or static multi-line) reply text. Pure formatting, no I/O.

use crate::backend::InstanceView;
use crate::command::{ArgumentError, Verb};
use crate::orchestrator::OperationOutcome;
use crate::registry::RegistryError;

pub const INTERNAL_ERROR: &str = "An internal error occurred. Please raise a bug on the github repository for further investigation.";

pub const HELP_TEXT: &str = "azure-bot, an open source Discord Bot.

Available Commands:
\t$stopvm <vm_name> Stops (deallocates) a VM
\t$startvm <vm_name> Starts a VM
\t$vmstate <vm_name> Shows state of the VM
\t$ping Checks that the bot is alive
\t$help Shows this message
";

pub fn help() -> &'static str {
    HELP_TEXT
}

/// `Pong!`, annotated with latency when the message carried a timestamp.
pub fn pong(latency_ms: Option<i64>) -> String {
    match latency_ms {
        Some(ms) => format!("Pong! ({ms} ms)"),
        None => "Pong!".to_string(),
    }
}

/// "Failed to {verb} the VM: {reason}"
pub fn user_error(verb: Verb, reason: impl std::fmt::Display) -> String {
    format!("Failed to {} the VM: {reason}", verb.failure_phrase())
}

pub fn argument_error(err: &ArgumentError) -> String {
    user_error(err.verb, err)
}

pub fn registry_error(verb: Verb, err: &RegistryError) -> String {
    user_error(verb, err)
}

pub fn progress(verb: Verb, vm: &str) -> String {
    match verb {
        Verb::Start => format!("Starting VM {vm}..."),
        Verb::Stop => format!("Stopping VM {vm}..."),
        _ => format!("Getting State for VM {vm}..."),
    }
}

pub fn started(vm: &str) -> String {
    format!("VM {vm} started.")
}

pub fn stopped(vm: &str) -> String {
    format!("VM {vm} stopped.")
}

/// Status entries are read by position: 0 is provisioning, 1 is power.
/// The control plane does not promise that order; a missing entry renders
/// as `Unknown`.
pub fn vm_info(view: &InstanceView) -> String {
    let label = |i: usize| {
        view.statuses
            .get(i)
            .map(|s| s.label())
            .unwrap_or("Unknown")
    };
    format!(
        "VM Info: \nProvisioning State: {} | Running State: {}",
        label(0),
        label(1)
    )
}

/// Reply for an orchestrator outcome; internal failures never leak detail.
pub fn outcome(outcome: &OperationOutcome) -> &str {
    match outcome.error_kind {
        Some(kind) if kind.is_internal() => INTERNAL_ERROR,
        _ => &outcome.display_text,
    }
}
