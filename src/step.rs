//! Step and base-image specifications.
//!
//! Steps are defined as data that describes WHAT should happen; the
//! pipeline interprets them. Working directory and environment are part
//! of the specification so steps never rely on ambient process state.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Reference to a base filesystem snapshot, resolved by name + tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImage {
    pub name: String,
    pub tag: String,
}

impl BaseImage {
    pub fn new(name: &str, tag: &str) -> Result<Self> {
        validate_ref_part(name, "base image name")?;
        validate_ref_part(tag, "base image tag")?;
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// `name:tag` form used in logs and manifests.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// The work a step performs.
///
/// `Command` is an opaque subprocess judged only by its exit status.
/// `CopyTree` is the built-in recursive source copy (all files present in
/// the source appear at the destination, permissions preserved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepAction {
    Command { argv: Vec<String> },
    CopyTree { from: PathBuf, to: PathBuf },
}

/// One provisioning step: a named unit of work with an explicit working
/// directory (a path inside the image root) and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub workdir: PathBuf,
    pub action: StepAction,
    pub env: Vec<(String, String)>,
}

impl StepSpec {
    pub fn command(name: &str, workdir: &str, argv: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            workdir: PathBuf::from(workdir),
            action: StepAction::Command {
                argv: argv.iter().map(|s| s.to_string()).collect(),
            },
            env: Vec::new(),
        }
    }

    pub fn copy_tree(name: &str, workdir: &str, from: &str, to: &str) -> Self {
        Self {
            name: name.to_string(),
            workdir: PathBuf::from(workdir),
            action: StepAction::CopyTree {
                from: PathBuf::from(from),
                to: PathBuf::from(to),
            },
            env: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("step name must not be empty");
        }
        validate_image_path(&self.workdir, &self.name, "workdir")?;
        match &self.action {
            StepAction::Command { argv } => {
                if argv.is_empty() {
                    bail!("step '{}' has an empty command", self.name);
                }
            }
            StepAction::CopyTree { from, to } => {
                validate_context_path(from, &self.name)?;
                validate_image_path(to, &self.name, "copy destination")?;
            }
        }
        Ok(())
    }

    /// Workdir relative to the image root. An absolute workdir such as
    /// `/build` addresses the image root, not the host filesystem.
    pub fn image_workdir(&self) -> PathBuf {
        strip_root(&self.workdir)
    }

    /// Stable description of the step used in layer identity and traces.
    pub fn fingerprint(&self) -> String {
        let mut parts = vec![format!("name={}", self.name)];
        parts.push(format!("workdir={}", self.workdir.display()));
        match &self.action {
            StepAction::Command { argv } => {
                parts.push(format!("run={}", argv.join("\u{1f}")));
            }
            StepAction::CopyTree { from, to } => {
                parts.push(format!("copy={}\u{1f}{}", from.display(), to.display()));
            }
        }
        for (key, value) in &self.env {
            parts.push(format!("env={}={}", key, value));
        }
        parts.join("\n")
    }
}

/// Strip a leading root component so the path can be joined under a
/// staging directory.
pub(crate) fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::RootDir | Component::Prefix(_)))
        .collect()
}

fn validate_image_path(path: &Path, step_name: &str, field: &str) -> Result<()> {
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            bail!(
                "step '{}': {} '{}' must not contain '..'",
                step_name,
                field,
                path.display()
            );
        }
    }
    Ok(())
}

/// Copy sources resolve against the build context, so they must stay
/// inside it: relative, with no traversal components.
fn validate_context_path(path: &Path, step_name: &str) -> Result<()> {
    for component in path.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            bail!(
                "step '{}': copy source '{}' must be a relative path inside the build context",
                step_name,
                path.display()
            );
        }
    }
    Ok(())
}

fn validate_ref_part(part: &str, what: &str) -> Result<()> {
    if part.is_empty() {
        bail!("{} must not be empty", what);
    }
    let ok = part
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !ok {
        bail!("{} '{}' contains unsupported characters", what, part);
    }
    Ok(())
}
