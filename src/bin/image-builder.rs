use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image_builder::pipeline::{BuildRequest, Pipeline, StepFailure};
use image_builder::preflight::check_step_commands;
use image_builder::recipe::load_recipe;
use image_builder::runner::HostRunner;
use image_builder::runs::{
    allocate_run_dir, manifest_path, prune_old_runs, write_run_manifest, RunManifest,
    STATUS_FAILED, STATUS_SUCCESS,
};
use image_builder::step::BaseImage;
use image_builder::store::{default_root, LayerStore};

const STORE_ENV: &str = "IMAGE_BUILDER_STORE";

fn usage() -> &'static str {
    "Usage:\n  image-builder build <recipe.toml> [--context <dir>] [--store <dir>]\n  image-builder base add <name> <tag> <rootfs_dir> [--store <dir>]\n  image-builder runs list [--store <dir>]\n  image-builder runs prune <keep> [--store <dir>]\n  image-builder store gc [--store <dir>]"
}

/// Trailing flags shared by the subcommands. `--context` is only
/// meaningful for `build`.
#[derive(Debug, Default, PartialEq)]
struct Flags {
    context: Option<PathBuf>,
    store: Option<PathBuf>,
}

fn parse_flags(rest: &[String], allow_context: bool) -> Result<Flags> {
    let mut flags = Flags::default();
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--context" if allow_context => {
                let value = iter.next().context("--context requires a directory")?;
                flags.context = Some(PathBuf::from(value));
            }
            "--store" => {
                let value = iter.next().context("--store requires a directory")?;
                flags.store = Some(PathBuf::from(value));
            }
            other => bail!("unexpected argument '{other}'\n{}", usage()),
        }
    }
    Ok(flags)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [build, recipe, rest @ ..] if build == "build" => {
            let flags = parse_flags(rest, true)?;
            cmd_build(Path::new(recipe), flags)
        }
        [base, add, name, tag, rootfs, rest @ ..] if base == "base" && add == "add" => {
            let flags = parse_flags(rest, false)?;
            cmd_base_add(name, tag, Path::new(rootfs), flags.store)
        }
        [runs, list, rest @ ..] if runs == "runs" && list == "list" => {
            let flags = parse_flags(rest, false)?;
            cmd_runs_list(flags.store)
        }
        [runs, prune, keep, rest @ ..] if runs == "runs" && prune == "prune" => {
            let keep: usize = keep
                .parse()
                .with_context(|| format!("invalid keep count '{keep}'"))?;
            let flags = parse_flags(rest, false)?;
            cmd_runs_prune(keep, flags.store)
        }
        [store, gc, rest @ ..] if store == "store" && gc == "gc" => {
            let flags = parse_flags(rest, false)?;
            cmd_store_gc(flags.store)
        }
        _ => bail!(usage()),
    }
}

/// Resolve the store root: `--store` flag, then the environment, then
/// the per-user default.
fn open_store(flag: Option<PathBuf>) -> Result<LayerStore> {
    let root = match flag {
        Some(path) => path,
        None => match std::env::var_os(STORE_ENV) {
            Some(value) => PathBuf::from(value),
            None => default_root()?,
        },
    };
    LayerStore::open(&root)
}

fn cmd_build(recipe_path: &Path, flags: Flags) -> Result<()> {
    let recipe = load_recipe(recipe_path)?;
    check_step_commands(&recipe.steps)?;

    let context_dir = match flags.context {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    if !context_dir.is_dir() {
        bail!("build context '{}' is not a directory", context_dir.display());
    }

    let store = open_store(flags.store)?;
    let (run_id, run_dir) = allocate_run_dir(&store.runs_dir())?;
    let created_at = image_builder::runs::now_utc_compact();

    let request = BuildRequest {
        base: recipe.base.clone(),
        steps: recipe.steps,
        context_dir,
    };

    let mut pipeline = Pipeline::new(&store, HostRunner);
    let outcome = pipeline.run(&request);

    let manifest = match &outcome {
        Ok(report) => RunManifest {
            run_id: run_id.clone(),
            status: STATUS_SUCCESS.to_string(),
            image: recipe.base.reference(),
            created_at_utc: created_at,
            finished_at_utc: Some(image_builder::runs::now_utc_compact()),
            failed_step: None,
            layers: report
                .snapshot
                .layers()
                .iter()
                .map(|layer| layer.id.to_string())
                .collect(),
        },
        Err(error) => {
            let failure = error.downcast_ref::<StepFailure>();
            RunManifest {
                run_id: run_id.clone(),
                status: STATUS_FAILED.to_string(),
                image: recipe.base.reference(),
                created_at_utc: created_at,
                finished_at_utc: Some(image_builder::runs::now_utc_compact()),
                failed_step: failure.map(|failure| failure.step_name.clone()),
                // Layers committed before the failing step stay in the
                // store and stay attributed to this run.
                layers: failure
                    .map(|failure| {
                        failure
                            .completed
                            .iter()
                            .map(|layer| layer.id.to_string())
                            .collect()
                    })
                    .unwrap_or_default(),
            }
        }
    };
    write_run_manifest(&manifest_path(&run_dir), &manifest)?;

    let report = outcome?;
    println!("Run {run_id} succeeded");
    if let Some(head) = report.snapshot.head() {
        println!("Final snapshot: {head}");
    } else {
        println!("Final snapshot: {} (base, no layers)", report.snapshot.base());
    }
    Ok(())
}

fn cmd_base_add(name: &str, tag: &str, rootfs: &Path, store_flag: Option<PathBuf>) -> Result<()> {
    let base = BaseImage::new(name, tag)?;
    let store = open_store(store_flag)?;
    let sha = store
        .add_base_image(&base, rootfs)
        .with_context(|| format!("registering base image '{}'", base.reference()))?;
    println!("Registered {} ({})", base.reference(), &sha[..12]);
    Ok(())
}

fn cmd_runs_list(store_flag: Option<PathBuf>) -> Result<()> {
    let store = open_store(store_flag)?;
    let mut runs = image_builder::runs::load_runs(&store.runs_dir())?;
    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    if runs.is_empty() {
        println!("No recorded runs in '{}'", store.runs_dir().display());
        return Ok(());
    }
    for run in runs {
        let failed = run
            .failed_step
            .map(|step| format!(" (failed at '{step}')"))
            .unwrap_or_default();
        println!(
            "{}  {}  {}  {} layer(s){}",
            run.run_id,
            run.status,
            run.image,
            run.layers.len(),
            failed
        );
    }
    Ok(())
}

fn cmd_runs_prune(keep: usize, store_flag: Option<PathBuf>) -> Result<()> {
    let store = open_store(store_flag)?;
    let removed = prune_old_runs(&store.runs_dir(), keep)?;
    println!("Pruned {removed} run(s)");
    Ok(())
}

fn cmd_store_gc(store_flag: Option<PathBuf>) -> Result<()> {
    let store = open_store(store_flag)?;
    let removed = store.gc().context("collecting unreferenced blobs")?;
    println!("Removed {removed} unreferenced blob(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_flags_accepts_context_and_store() {
        let flags = parse_flags(
            &args(&["--context", "/src/app", "--store", "/var/store"]),
            true,
        )
        .unwrap();
        assert_eq!(flags.context, Some(PathBuf::from("/src/app")));
        assert_eq!(flags.store, Some(PathBuf::from("/var/store")));
    }

    #[test]
    fn parse_flags_empty_is_defaults() {
        let flags = parse_flags(&[], true).unwrap();
        assert_eq!(flags, Flags::default());
    }

    #[test]
    fn parse_flags_rejects_context_where_not_allowed() {
        let err = parse_flags(&args(&["--context", "/src"]), false).unwrap_err();
        assert!(err.to_string().contains("--context"));
    }

    #[test]
    fn parse_flags_rejects_missing_value() {
        assert!(parse_flags(&args(&["--store"]), true).is_err());
        assert!(parse_flags(&args(&["--context"]), true).is_err());
    }

    #[test]
    fn parse_flags_rejects_unknown_argument() {
        let err = parse_flags(&args(&["--verbose"]), true).unwrap_err();
        assert!(err.to_string().contains("--verbose"));
    }
}
