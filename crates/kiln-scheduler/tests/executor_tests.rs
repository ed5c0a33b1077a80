use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{ArtifactRef, BasicArtifact, BuildUnit, CancelToken, RecordingUi, RunUuid, SharedUi};
use kiln_registry::{Bucket, BucketRegistry, MockService, NullRegistry, Registry, RegistryError, RegistryService, TemplateType, Version};
use kiln_scheduler::{ExecutionReport, Executor, ExecutorOptions};

struct Tracker {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: Mutex<Vec<String>>,
    gate: tokio::sync::Semaphore,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            gate: tokio::sync::Semaphore::new(0),
        }
    }
}

impl Tracker {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn ran(&self, name: &str) -> bool {
        self.events().contains(&format!("start {name}"))
    }
}

#[derive(Clone, Copy, Default, PartialEq)]
enum Behavior {
    #[default]
    Succeed,
    Fail,
    CancelRun,
    Gated,
    Panic,
}

struct FakeUnit {
    name: String,
    tracker: Arc<Tracker>,
    behavior: Behavior,
}

#[async_trait]
impl BuildUnit for FakeUnit {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self, cancel: &CancelToken, ui: SharedUi) -> anyhow::Result<Vec<ArtifactRef>> {
        let now = self.tracker.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.tracker.push(format!("start {}", self.name));
        ui.say(&format!("building {}", self.name));

        if self.behavior == Behavior::CancelRun {
            cancel.cancel();
        }
        if self.behavior == Behavior::Panic {
            panic!("plugin bug in {}", self.name);
        }
        if self.behavior == Behavior::Gated {
            self.tracker.gate.acquire().await.unwrap().forget();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.tracker.push(format!("end {}", self.name));
        if self.behavior == Behavior::Fail {
            anyhow::bail!("boom");
        }
        let artifact: ArtifactRef = Arc::new(BasicArtifact::new("kiln.fake", format!("id-{}", self.name)));
        Ok(vec![artifact])
    }
}

struct TrackingRegistry {
    tracker: Arc<Tracker>,
    done: Vec<String>,
    reject_artifacts: bool,
}

impl TrackingRegistry {
    fn new(tracker: Arc<Tracker>) -> Self {
        Self { tracker, done: Vec::new(), reject_artifacts: false }
    }
}

#[async_trait]
impl Registry for TrackingRegistry {
    async fn populate_version(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn start_build(&self, _cancel: &CancelToken, name: &str) -> Result<(), RegistryError> {
        if self.done.iter().any(|d| d == name) {
            return Err(RegistryError::BuildAlreadyDone { name: name.to_string() });
        }
        self.tracker.push(format!("registry start {name}"));
        Ok(())
    }

    async fn complete_build(
        &self,
        _cancel: &CancelToken,
        name: &str,
        artifacts: Vec<ArtifactRef>,
        run_err: Option<&anyhow::Error>,
    ) -> (Vec<ArtifactRef>, Result<(), RegistryError>) {
        self.tracker.push(format!("registry complete {name} failed={}", run_err.is_some()));
        if self.reject_artifacts && run_err.is_none() {
            return (artifacts, Err(RegistryError::NotRegistryArtifact { name: name.to_string() }));
        }
        (artifacts, Ok(()))
    }

    fn version_status_summary(&self, _ui: &SharedUi) {}
}

fn units(tracker: &Arc<Tracker>, specs: &[(&str, Behavior)]) -> Vec<Arc<dyn BuildUnit>> {
    specs
        .iter()
        .map(|(name, behavior)| {
            Arc::new(FakeUnit { name: name.to_string(), tracker: tracker.clone(), behavior: *behavior }) as Arc<dyn BuildUnit>
        })
        .collect()
}

fn names(n: usize) -> Vec<(String, Behavior)> {
    (0..n).map(|i| (format!("build-{i}"), Behavior::Succeed)).collect()
}

async fn execute(
    opts: ExecutorOptions,
    registry: Arc<dyn Registry>,
    builds: Vec<Arc<dyn BuildUnit>>,
    cancel: &CancelToken,
) -> (ExecutionReport, Arc<RecordingUi>) {
    let recording = Arc::new(RecordingUi::new());
    let ui: SharedUi = recording.clone();
    let report = Executor::new(opts, registry, ui).run(builds, cancel).await;
    (report, recording)
}

#[tokio::test(start_paused = true)]
async fn test_parallel_builds_bounds_in_flight_runs() {
    for limit in [1, 2, 3] {
        let tracker = Arc::new(Tracker::default());
        let specs = names(6);
        let specs: Vec<(&str, Behavior)> = specs.iter().map(|(n, b)| (n.as_str(), *b)).collect();
        let opts = ExecutorOptions { parallel_builds: limit, ..Default::default() };
        let (report, _) = execute(opts, Arc::new(NullRegistry), units(&tracker, &specs), &CancelToken::new()).await;

        assert!(report.is_success());
        assert_eq!(report.artifacts.len(), 6);
        let max = tracker.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= limit, "limit {limit} but saw {max} builds at once");
    }
}

#[tokio::test(start_paused = true)]
async fn test_parallel_builds_fills_every_slot() {
    for limit in [2, 3] {
        let tracker = Arc::new(Tracker::default());
        let specs: Vec<(String, Behavior)> = (0..6).map(|i| (format!("build-{i}"), Behavior::Gated)).collect();
        let specs: Vec<(&str, Behavior)> = specs.iter().map(|(n, b)| (n.as_str(), *b)).collect();
        let builds = units(&tracker, &specs);
        let opts = ExecutorOptions { parallel_builds: limit, ..Default::default() };
        let run = tokio::spawn(async move { execute(opts, Arc::new(NullRegistry), builds, &CancelToken::new()).await.0 });

        tokio::time::timeout(Duration::from_secs(10), async {
            while tracker.in_flight.load(Ordering::SeqCst) < limit {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("limit {limit} never reached"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.max_in_flight.load(Ordering::SeqCst), limit);

        tracker.gate.add_permits(6);
        let report = run.await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.artifacts.len(), 6);
        assert_eq!(tracker.max_in_flight.load(Ordering::SeqCst), limit);
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_build_is_completed_as_failed() {
    let tracker = Arc::new(Tracker::default());
    let registry = Arc::new(TrackingRegistry::new(tracker.clone()));
    let specs = [("a", Behavior::Panic), ("b", Behavior::Succeed)];
    let opts = ExecutorOptions { parallel_builds: 2, ..Default::default() };
    let (report, ui) = execute(opts, registry, units(&tracker, &specs), &CancelToken::new()).await;

    assert!(tracker.events().contains(&"registry complete a failed=true".to_string()));
    assert!(report.errors["a"].contains("build panicked"));
    assert!(report.artifacts.contains_key("b"));
    assert!(ui.contains("Build 'a' errored after"));
}

#[tokio::test(start_paused = true)]
async fn test_zero_parallel_builds_runs_everything_at_once() {
    let tracker = Arc::new(Tracker::default());
    let opts = ExecutorOptions { parallel_builds: 0, ..Default::default() };
    let specs = [("a", Behavior::Succeed), ("b", Behavior::Succeed), ("c", Behavior::Succeed)];
    let (report, _) = execute(opts, Arc::new(NullRegistry), units(&tracker, &specs), &CancelToken::new()).await;

    assert!(report.is_success());
    assert_eq!(tracker.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_serial_modes_finish_each_build_before_the_next() {
    let serial = [
        ExecutorOptions { parallel_builds: 1, ..Default::default() },
        ExecutorOptions { parallel_builds: 4, debug: true, ..Default::default() },
    ];
    for opts in serial {
        let tracker = Arc::new(Tracker::default());
        let registry = Arc::new(TrackingRegistry::new(tracker.clone()));
        let specs = [("a", Behavior::Succeed), ("b", Behavior::Fail), ("c", Behavior::Succeed)];
        let (report, ui) = execute(opts.clone(), registry, units(&tracker, &specs), &CancelToken::new()).await;

        let expected: Vec<String> = ["a", "b", "c"]
            .iter()
            .flat_map(|n| {
                let failed = *n == "b";
                [
                    format!("registry start {n}"),
                    format!("start {n}"),
                    format!("end {n}"),
                    format!("registry complete {n} failed={failed}"),
                ]
            })
            .collect();
        assert_eq!(tracker.events(), expected);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(ui.contains("Debug mode enabled. Builds will not be parallelized."), opts.debug);
    }
}

#[tokio::test(start_paused = true)]
async fn test_already_done_build_is_skipped() {
    let tracker = Arc::new(Tracker::default());
    let mut registry = TrackingRegistry::new(tracker.clone());
    registry.done.push("b".into());
    let specs = [("a", Behavior::Succeed), ("b", Behavior::Succeed)];
    let (report, ui) = execute(ExecutorOptions::default(), Arc::new(registry), units(&tracker, &specs), &CancelToken::new()).await;

    assert!(!tracker.ran("b"));
    assert!(tracker.ran("a"));
    assert!(!report.artifacts.contains_key("b"));
    assert!(report.errors.is_empty());
    assert!(report.diagnostics.is_empty());
    assert!(ui.contains("skipping already done build \"b\""));
}

#[tokio::test(start_paused = true)]
async fn test_already_done_build_is_skipped_with_bucket_registry() {
    let mock = Arc::new(MockService::with(|s| {
        s.build_already_done = true;
        s.existing_builds = vec!["web.null.a".into()];
    }));
    let service: Arc<dyn RegistryService> = mock.clone();
    let mut bucket = Bucket::with_service("web", Version::new("fp", RunUuid::new()), service);
    bucket.register_build_for_component("web.null.a").unwrap();
    let ui: SharedUi = Arc::new(RecordingUi::new());
    let registry = Arc::new(BucketRegistry::new(bucket, TemplateType::Block, ui));
    registry.populate_version().await.unwrap();

    let tracker = Arc::new(Tracker::default());
    let (report, _) =
        execute(ExecutorOptions::default(), registry, units(&tracker, &[("web.null.a", Behavior::Succeed)]), &CancelToken::new()).await;

    assert!(!tracker.ran("web.null.a"));
    assert!(report.artifacts.is_empty());
    assert!(mock.state().updates.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_build_does_not_stop_siblings() {
    let tracker = Arc::new(Tracker::default());
    let specs = [("a", Behavior::Succeed), ("b", Behavior::Fail), ("c", Behavior::Succeed)];
    let opts = ExecutorOptions { parallel_builds: 2, ..Default::default() };
    let (report, ui) = execute(opts, Arc::new(NullRegistry), units(&tracker, &specs), &CancelToken::new()).await;

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors.get("b").map(String::as_str), Some("boom"));
    assert_eq!(report.artifacts.keys().cloned().collect::<Vec<_>>(), vec!["a", "c"]);
    assert!(report.diagnostics.is_empty());
    assert!(!report.cancelled);

    let machine = ui.machine_lines();
    assert!(machine.contains(&("error-count".to_string(), vec!["1".to_string()])));
    assert!(machine.contains(&("b,error".to_string(), vec!["boom".to_string()])));
    assert!(machine.contains(&("a,artifact-count".to_string(), vec!["1".to_string()])));
    assert!(machine.contains(&("c,artifact".to_string(), vec!["0".to_string(), "id".to_string(), "id-c".to_string()])));
    assert!(ui.contains("--> b: boom"));
    assert!(ui.contains("Build 'b' errored after"));
    assert!(ui.contains("Build 'a' finished after"));
    assert!(ui.contains("Builds finished. The artifacts of successful builds are:"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_launching_and_reports_once() {
    let tracker = Arc::new(Tracker::default());
    let registry = Arc::new(TrackingRegistry::new(tracker.clone()));
    let specs = [("a", Behavior::CancelRun), ("b", Behavior::Succeed), ("c", Behavior::Succeed)];
    let opts = ExecutorOptions { parallel_builds: 1, ..Default::default() };
    let cancel = CancelToken::new();
    let (report, ui) = execute(opts, registry, units(&tracker, &specs), &cancel).await;

    assert!(tracker.ran("a"));
    assert!(!tracker.ran("b"));
    assert!(!tracker.ran("c"));
    assert!(report.cancelled);
    let summaries: Vec<&str> = report.diagnostics.iter().map(|d| d.summary.as_str()).collect();
    assert_eq!(summaries, vec!["Build cancelled"]);
    assert!(ui.contains("Cleanly cancelled builds after being interrupted."));
    assert!(!ui.contains("Builds finished"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_runs_nothing() {
    let tracker = Arc::new(Tracker::default());
    let cancel = CancelToken::new();
    cancel.cancel();
    let (report, _) = execute(ExecutorOptions::default(), Arc::new(NullRegistry), units(&tracker, &[("a", Behavior::Succeed)]), &cancel).await;

    assert!(!tracker.ran("a"));
    assert!(report.cancelled);
    assert_eq!(report.diagnostics.len(), 1);
}

#[tokio::test]
async fn test_no_builds_is_an_error() {
    let (report, _) = execute(ExecutorOptions::default(), Arc::new(NullRegistry), Vec::new(), &CancelToken::new()).await;
    let errors: Vec<&str> = report.diagnostics.errors().map(|d| d.summary.as_str()).collect();
    assert_eq!(errors, vec!["No builds to run"]);
}

#[tokio::test(start_paused = true)]
async fn test_registry_rejection_becomes_a_diagnostic() {
    let tracker = Arc::new(Tracker::default());
    let mut registry = TrackingRegistry::new(tracker.clone());
    registry.reject_artifacts = true;
    let (report, _) =
        execute(ExecutorOptions::default(), Arc::new(registry), units(&tracker, &[("a", Behavior::Succeed)]), &CancelToken::new()).await;

    let errors: Vec<&str> = report.diagnostics.errors().map(|d| d.summary.as_str()).collect();
    assert_eq!(errors, vec!["The \"a\" builder produced an artifact that cannot be pushed to the kiln registry"]);
    assert!(!report.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_color_preamble_names_each_build() {
    let tracker = Arc::new(Tracker::default());
    let opts = ExecutorOptions { color: true, ..Default::default() };
    let specs = [("a", Behavior::Succeed), ("b", Behavior::Succeed)];
    let (_, ui) = execute(opts, Arc::new(NullRegistry), units(&tracker, &specs), &CancelToken::new()).await;

    assert!(ui.contains("a: output will be in this color."));
    assert!(ui.contains("b: output will be in this color."));
    assert!(ui.contains("building a"));
}
