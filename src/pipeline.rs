//! The build pipeline: runs a fixed ordered list of steps against a base
//! snapshot, producing a final snapshot or a first-failure error.
//!
//! Steps execute strictly sequentially, in declaration order. The driver
//! blocks on each step's subprocess; the first non-zero exit status aborts
//! the pipeline immediately with no retry, rollback, or compensation.
//! Every completed step contributes exactly one immutable layer.

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::runner::{CommandRunner, RunRequest};
use crate::snapshot::{chain_layer_id, LayerRecord, Snapshot};
use crate::step::{strip_root, BaseImage, StepAction, StepSpec};
use crate::store::LayerStore;
use crate::tree;

/// Everything one build needs: the base snapshot, the ordered step list,
/// and the host directory `copy` steps read from.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub base: BaseImage,
    pub steps: Vec<StepSpec>,
    pub context_dir: PathBuf,
}

/// One entry in the execution trace, recorded in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub step_name: String,
    pub detail: String,
}

/// Successful build: the final snapshot plus the recorded trace.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub snapshot: Snapshot,
    pub trace: Vec<TraceEntry>,
}

/// The single error kind a build surfaces: which step failed and why.
///
/// `completed` lists the layers of the steps that finished before the
/// failure; they remain valid in the store even though no final snapshot
/// exists.
#[derive(Debug)]
pub struct StepFailure {
    pub index: usize,
    pub step_name: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub completed: Vec<LayerRecord>,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} '{}' failed with exit code {}",
            self.index, self.step_name, self.exit_code
        )?;
        let err = self.stderr.trim();
        if !err.is_empty() {
            write!(f, "\n{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for StepFailure {}

/// Sequential fail-fast build driver.
pub struct Pipeline<'a, R: CommandRunner> {
    store: &'a LayerStore,
    runner: R,
}

impl<'a, R: CommandRunner> Pipeline<'a, R> {
    pub fn new(store: &'a LayerStore, runner: R) -> Self {
        Self { store, runner }
    }

    /// Run the pipeline to completion or first failure.
    ///
    /// On success the returned snapshot is the base plus one layer per
    /// step, in step order. On failure the error downcasts to
    /// [`StepFailure`]; already completed layers remain valid in the store
    /// but no final snapshot exists.
    pub fn run(&mut self, request: &BuildRequest) -> Result<BuildReport> {
        for step in &request.steps {
            step.validate()?;
        }

        let image_ref = request.base.reference();
        let _lock = self.store.lock_build(&image_ref)?;

        println!("Building from {}", image_ref);
        let mut snapshot = Snapshot::of_base(request.base.clone());
        let mut trace = Vec::new();

        if request.steps.is_empty() {
            // Nothing to run; the final snapshot is the base snapshot.
            self.store.resolve_base(&request.base)?;
            return Ok(BuildReport { snapshot, trace });
        }

        let staging = self
            .store
            .scratch_dir("staging")?
            .join("rootfs");
        let result = self.run_steps(request, &staging, &mut snapshot, &mut trace);

        if let Some(parent) = staging.parent() {
            let _ = fs::remove_dir_all(parent);
        }

        result?;
        println!(
            "Built {} layer(s) on {}",
            snapshot.layers().len(),
            image_ref
        );
        Ok(BuildReport { snapshot, trace })
    }

    fn run_steps(
        &mut self,
        request: &BuildRequest,
        staging: &Path,
        snapshot: &mut Snapshot,
        trace: &mut Vec<TraceEntry>,
    ) -> Result<()> {
        self.store
            .materialize_base(&request.base, staging)
            .with_context(|| format!("materializing base '{}'", request.base.reference()))?;

        let mut before = tree::index_tree(staging)?;

        for (index, step) in request.steps.iter().enumerate() {
            println!(
                "  [{}/{}] {}",
                index + 1,
                request.steps.len(),
                step.name
            );

            let workdir = staging.join(step.image_workdir());
            fs::create_dir_all(&workdir)
                .with_context(|| format!("creating workdir '{}'", workdir.display()))?;

            trace.push(TraceEntry {
                step_name: step.name.clone(),
                detail: step_detail(step),
            });

            match &step.action {
                StepAction::Command { argv } => {
                    let output = self
                        .runner
                        .run(&RunRequest::new(argv, &workdir, &step.env))
                        .with_context(|| format!("running step '{}'", step.name))?;
                    if !output.success() {
                        return Err(StepFailure {
                            index,
                            step_name: step.name.clone(),
                            exit_code: output.exit_code,
                            stdout: output.stdout,
                            stderr: output.stderr,
                            completed: snapshot.layers().to_vec(),
                        }
                        .into());
                    }
                }
                StepAction::CopyTree { from, to } => {
                    let source = request.context_dir.join(from);
                    let dest = workdir.join(strip_root(to));
                    tree::copy_tree(&source, &dest)
                        .with_context(|| format!("copy step '{}'", step.name))?;
                }
            }

            let after = tree::index_tree(staging)?;
            let diff = tree::diff_trees(&before, &after);
            self.commit_layer(snapshot, step, staging, &diff)?;
            before = after;
        }

        Ok(())
    }

    fn commit_layer(
        &self,
        snapshot: &mut Snapshot,
        step: &StepSpec,
        staging: &Path,
        diff: &tree::TreeDiff,
    ) -> Result<()> {
        let diff_dir = self.store.scratch_dir("diff")?;
        let result = (|| {
            tree::export_paths(staging, &diff.changed, &diff_dir)
                .with_context(|| format!("assembling diff for step '{}'", step.name))?;

            let diff_digest = diff_dir_digest(&diff_dir, &diff.removed)?;
            let id = chain_layer_id(
                snapshot.base(),
                snapshot.head(),
                &step.fingerprint(),
                &diff_digest,
            );
            let manifest = self.store.put_layer(
                &id,
                snapshot.head(),
                snapshot.base(),
                &step.name,
                &step.fingerprint(),
                &diff_dir,
                &diff.removed,
            )?;
            println!(
                "    layer {} ({} changed, {} removed)",
                manifest.id.short(),
                diff.changed.len(),
                diff.removed.len()
            );
            snapshot.push_layer(LayerRecord {
                id,
                step_name: step.name.clone(),
            });
            Ok(())
        })();
        let _ = fs::remove_dir_all(&diff_dir);
        result
    }
}

fn step_detail(step: &StepSpec) -> String {
    match &step.action {
        StepAction::Command { argv } => argv.join(" "),
        StepAction::CopyTree { from, to } => {
            format!("copy {} -> {}", from.display(), to.display())
        }
    }
}

/// Digest over the assembled diff contents plus the removal list, feeding
/// the layer id so identical steps with different effects get distinct ids.
fn diff_dir_digest(diff_dir: &Path, removed: &[PathBuf]) -> Result<String> {
    use sha2::{Digest, Sha256};

    let index = tree::index_tree(diff_dir)?;
    let mut hasher = Sha256::new();
    for (path, stamp) in index.iter() {
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(format!("\u{1f}{:o}\u{1f}{}\n", stamp.mode, stamp.digest).as_bytes());
    }
    for rel in removed {
        hasher.update(b"removed:");
        hasher.update(rel.as_os_str().as_encoded_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::runner::{HostRunner, StepOutput};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: LayerStore,
        context_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(&temp.path().join("store")).unwrap();

        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/os-release"), "ID=test\n").unwrap();
        store.add_base_image(&base(), &rootfs).unwrap();

        let context_dir = temp.path().join("context");
        fs::create_dir_all(context_dir.join("src")).unwrap();
        fs::write(context_dir.join("src/main.rs"), "fn main() {}").unwrap();

        Fixture {
            _temp: temp,
            store,
            context_dir,
        }
    }

    fn base() -> BaseImage {
        BaseImage::new("test", "1").unwrap()
    }

    fn request(steps: Vec<StepSpec>, fx: &Fixture) -> BuildRequest {
        BuildRequest {
            base: base(),
            steps,
            context_dir: fx.context_dir.clone(),
        }
    }

    #[test]
    fn scenario_a_all_steps_succeed_in_order() {
        let fx = fixture();
        let steps = vec![
            StepSpec::command("install", "/build", &["apt-get", "install", "-y", "pkgx"]),
            StepSpec::copy_tree("copy", "/build", ".", "app"),
            StepSpec::command("build", "/build", &["cargo", "build"]),
        ];
        let mut pipeline = Pipeline::new(&fx.store, ScriptedRunner::all_succeed());
        let report = pipeline.run(&request(steps, &fx)).unwrap();

        // One layer per step, in declaration order.
        let names: Vec<&str> = report
            .snapshot
            .layers()
            .iter()
            .map(|l| l.step_name.as_str())
            .collect();
        assert_eq!(names, vec!["install", "copy", "build"]);

        let trace: Vec<&str> = report.trace.iter().map(|t| t.step_name.as_str()).collect();
        assert_eq!(trace, vec!["install", "copy", "build"]);
    }

    #[test]
    fn scenario_b_failure_halts_pipeline() {
        let fx = fixture();
        let steps = vec![
            StepSpec::command("install", "/build", &["apt-get", "install", "-y", "pkgx"]),
            StepSpec::command("copy", "/build", &["cp", "-r", "src", "app"]),
            StepSpec::command("build", "/build", &["cargo", "build"]),
        ];
        let mut pipeline = Pipeline::new(
            &fx.store,
            ScriptedRunner::with_outputs(vec![StepOutput::failed(1, "E: unable to locate pkgx")]),
        );
        let err = pipeline.run(&request(steps, &fx)).unwrap_err();

        let failure = err.downcast_ref::<StepFailure>().unwrap();
        assert_eq!(failure.index, 0);
        assert_eq!(failure.step_name, "install");
        assert_eq!(failure.exit_code, 1);
        assert!(failure.stderr.contains("pkgx"));
        assert!(failure.completed.is_empty());

        // No layers were stored for the steps after (or including) the failure.
        assert!(fx.store.list_layer_manifests().unwrap().is_empty());
    }

    #[test]
    fn scenario_b_later_steps_never_run() {
        let fx = fixture();
        let steps = vec![
            StepSpec::command("first", "/", &["true"]),
            StepSpec::command("second", "/", &["false"]),
            StepSpec::command("third", "/", &["true"]),
        ];
        let runner = ScriptedRunner::with_outputs(vec![
            StepOutput::ok(),
            StepOutput::failed(2, "boom"),
        ]);
        let mut pipeline = Pipeline::new(&fx.store, runner);
        let err = pipeline.run(&request(steps, &fx)).unwrap_err();
        let failure = err.downcast_ref::<StepFailure>().unwrap();
        assert_eq!(failure.index, 1);
        assert_eq!(failure.step_name, "second");

        // The first step's layer survives and the failure reports it.
        let completed: Vec<&str> = failure
            .completed
            .iter()
            .map(|l| l.step_name.as_str())
            .collect();
        assert_eq!(completed, vec!["first"]);

        let manifests = fx.store.list_layer_manifests().unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].step_name, "first");
        assert_eq!(manifests[0].id, failure.completed[0].id);
    }

    #[test]
    fn scenario_c_reordering_is_observed_not_corrected() {
        let fx = fixture();
        let steps = vec![
            StepSpec::copy_tree("copy", "/build", ".", "app"),
            StepSpec::command("install", "/build", &["apt-get", "install", "-y", "pkgx"]),
        ];
        let mut pipeline = Pipeline::new(&fx.store, ScriptedRunner::all_succeed());
        let report = pipeline.run(&request(steps, &fx)).unwrap();

        let trace: Vec<&str> = report.trace.iter().map(|t| t.step_name.as_str()).collect();
        assert_eq!(trace, vec!["copy", "install"]);
    }

    #[test]
    fn empty_step_list_yields_base_snapshot() {
        let fx = fixture();
        let mut pipeline = Pipeline::new(&fx.store, ScriptedRunner::all_succeed());
        let report = pipeline.run(&request(vec![], &fx)).unwrap();

        assert_eq!(report.snapshot, Snapshot::of_base(base()));
        assert!(report.trace.is_empty());
    }

    #[test]
    fn empty_step_list_still_requires_a_known_base() {
        let fx = fixture();
        let mut pipeline = Pipeline::new(&fx.store, ScriptedRunner::all_succeed());
        let missing = BuildRequest {
            base: BaseImage::new("nosuch", "1").unwrap(),
            steps: vec![],
            context_dir: fx.context_dir.clone(),
        };
        assert!(pipeline.run(&missing).is_err());
    }

    #[test]
    fn commands_run_with_explicit_workdir_and_env() {
        let fx = fixture();
        let steps = vec![StepSpec {
            name: "probe".to_string(),
            workdir: PathBuf::from("/opt/app"),
            action: StepAction::Command {
                argv: vec!["make".to_string()],
            },
            env: vec![("PROFILE".to_string(), "release".to_string())],
        }];
        let mut runner = ScriptedRunner::all_succeed();
        let mut pipeline = Pipeline::new(&fx.store, &mut runner);
        let _ = pipeline.run(&request(steps, &fx)).unwrap();

        let call = &runner.calls[0];
        assert!(call.cwd.ends_with("opt/app"));
        assert_eq!(
            call.env,
            vec![("PROFILE".to_string(), "release".to_string())]
        );
    }

    #[test]
    fn scripted_runner_sees_declared_order_and_cwd() {
        let fx = fixture();
        let steps = vec![
            StepSpec::command("a", "/one", &["first-cmd"]),
            StepSpec::command("b", "/two", &["second-cmd"]),
        ];
        let mut runner = ScriptedRunner::all_succeed();
        let mut pipeline = Pipeline::new(&fx.store, &mut runner);
        let _ = pipeline.run(&request(steps, &fx)).unwrap();

        assert_eq!(runner.programs(), vec!["first-cmd", "second-cmd"]);
        assert!(runner.calls[0].cwd.ends_with("one"));
        assert!(runner.calls[1].cwd.ends_with("two"));
    }

    #[test]
    fn host_build_produces_real_layers() {
        let fx = fixture();
        let steps = vec![
            StepSpec::command(
                "write-marker",
                "/build",
                &["sh", "-c", "echo built > marker.txt"],
            ),
            StepSpec::copy_tree("copy-source", "/build", ".", "app"),
        ];
        let mut pipeline = Pipeline::new(&fx.store, HostRunner);
        let report = pipeline.run(&request(steps, &fx)).unwrap();
        assert_eq!(report.snapshot.layers().len(), 2);

        let out = fx.store.scratch_dir("materialized").unwrap().join("image");
        fx.store
            .materialize_snapshot(&report.snapshot, &out)
            .unwrap();
        assert_eq!(
            fs::read_to_string(out.join("build/marker.txt")).unwrap(),
            "built\n"
        );
        assert_eq!(
            fs::read_to_string(out.join("build/app/src/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert!(out.join("etc/os-release").exists());
    }

    #[test]
    fn host_build_failure_reports_failing_step() {
        let fx = fixture();
        let steps = vec![
            StepSpec::command("ok", "/", &["true"]),
            StepSpec::command("bad", "/", &["sh", "-c", "echo nope >&2; exit 7"]),
        ];
        let mut pipeline = Pipeline::new(&fx.store, HostRunner);
        let err = pipeline.run(&request(steps, &fx)).unwrap_err();
        let failure = err.downcast_ref::<StepFailure>().unwrap();
        assert_eq!(failure.index, 1);
        assert_eq!(failure.exit_code, 7);
        assert!(failure.stderr.contains("nope"));
    }
}
