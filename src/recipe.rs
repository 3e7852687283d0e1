//! TOML build recipes.
//!
//! A recipe declares the base image and the ordered step list:
//!
//! ```toml
//! [image]
//! base = "rust"
//! tag = "1.88"
//!
//! [[step]]
//! name = "install-deps"
//! workdir = "/build"
//! command = ["apt-get", "install", "-y", "libx11-dev"]
//!
//! [[step]]
//! name = "copy-source"
//! workdir = "/build"
//! copy = { from = ".", to = "." }
//!
//! [[step]]
//! name = "build"
//! workdir = "/build"
//! command = ["cargo", "build", "--release"]
//! ```
//!
//! A step carries either `command` or `copy`, never both. `copy` expands to
//! the pipeline's built-in recursive tree copy from the build context.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::step::{BaseImage, StepAction, StepSpec};

/// Loaded and validated recipe: a base image plus ordered steps.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub base: BaseImage,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeToml {
    image: ImageToml,
    #[serde(default, rename = "step")]
    steps: Vec<StepToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    base: String,
    tag: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepToml {
    name: String,
    workdir: String,
    command: Option<Vec<String>>,
    copy: Option<CopyToml>,
    env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CopyToml {
    from: String,
    to: String,
}

/// Load a recipe file.
pub fn load_recipe(path: &Path) -> Result<Recipe> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading build recipe '{}'", path.display()))?;
    let parsed: RecipeToml = toml::from_str(&raw)
        .with_context(|| format!("parsing build recipe '{}'", path.display()))?;

    let base = BaseImage::new(&parsed.image.base, &parsed.image.tag)
        .with_context(|| format!("invalid build recipe '{}'", path.display()))?;

    let mut steps = Vec::with_capacity(parsed.steps.len());
    for step in parsed.steps {
        let spec = convert_step(step, path)?;
        spec.validate()
            .with_context(|| format!("invalid build recipe '{}'", path.display()))?;
        steps.push(spec);
    }

    Ok(Recipe { base, steps })
}

fn convert_step(step: StepToml, path: &Path) -> Result<StepSpec> {
    let action = match (step.command, step.copy) {
        (Some(argv), None) => StepAction::Command { argv },
        (None, Some(copy)) => StepAction::CopyTree {
            from: PathBuf::from(copy.from),
            to: PathBuf::from(copy.to),
        },
        (Some(_), Some(_)) => bail!(
            "invalid build recipe '{}': step '{}' declares both command and copy",
            path.display(),
            step.name
        ),
        (None, None) => bail!(
            "invalid build recipe '{}': step '{}' declares neither command nor copy",
            path.display(),
            step.name
        ),
    };

    // BTreeMap gives a stable order, so env pairs are deterministic.
    let env = step
        .env
        .unwrap_or_default()
        .into_iter()
        .collect::<Vec<_>>();

    Ok(StepSpec {
        name: step.name,
        workdir: PathBuf::from(step.workdir),
        action,
        env,
    })
}
