//! Preflight checks for build validation.
//!
//! Validates that the host can actually execute a recipe before the
//! pipeline starts. This prevents cryptic mid-build failures when a step's
//! program is simply not installed.

use anyhow::{bail, Result};
use std::path::Path;

use crate::step::{StepAction, StepSpec};

/// Check if a command exists on the host system (PATH lookup).
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command_name, package_name). Returns an error listing
/// every missing tool and the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check that every command step's program can be resolved on the host.
///
/// Programs given as paths are checked for existence; bare names are
/// resolved through PATH. Copy steps have no external program.
pub fn check_step_commands(steps: &[StepSpec]) -> Result<()> {
    let mut missing = Vec::new();

    for step in steps {
        let StepAction::Command { argv } = &step.action else {
            continue;
        };
        let Some(program) = argv.first() else {
            continue;
        };
        let found = if program.contains('/') {
            Path::new(program).exists()
        } else {
            command_exists(program)
        };
        if !found {
            missing.push((step.name.clone(), program.clone()));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(step, program)| format!("  step '{}': {}", step, program))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Recipe references programs not found on the host:\n{}", msg);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn step_commands_resolved_through_path() {
        let steps = vec![
            StepSpec::command("list", "/", &["ls", "-la"]),
            StepSpec::copy_tree("copy", "/", ".", "app"),
        ];
        assert!(check_step_commands(&steps).is_ok());
    }

    #[test]
    fn missing_step_program_is_reported_with_step_name() {
        let steps = vec![StepSpec::command(
            "install",
            "/",
            &["no_such_program_abcdef", "arg"],
        )];
        let err = check_step_commands(&steps).unwrap_err();
        assert!(err.to_string().contains("install"));
        assert!(err.to_string().contains("no_such_program_abcdef"));
    }
}
