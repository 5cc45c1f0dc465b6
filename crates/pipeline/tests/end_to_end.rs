//! Full pipeline runs against the in-memory stub engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use assert_matches::assert_matches;
use imagegen_comfyui::messages::parse_message;
use imagegen_comfyui::testing::StubEngine;
use imagegen_core::error::CoreError;
use imagegen_core::store::WorkflowStore;
use imagegen_pipeline::clock::ManualClock;
use imagegen_pipeline::config::GeneratorConfig;
use imagegen_pipeline::error::GenerationError;
use imagegen_pipeline::generator::ImageGenerator;
use imagegen_pipeline::job::JobStatus;
use tokio_util::sync::CancellationToken;

const PAYLOAD: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

const WORKFLOW: &str = r#"{
    "5": {"class_type": "EmptyLatentImage", "inputs": {"width": 512, "height": 512, "batch_size": 1}},
    "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["11", 0]}},
    "11": {"class_type": "DualCLIPLoader", "inputs": {"clip_name1": "t5xxl.safetensors"}},
    "25": {"class_type": "RandomNoise", "inputs": {"noise_seed": 0}},
    "8": {"class_type": "VAEDecode", "inputs": {"samples": ["27", 0]}},
    "27": {"class_type": "EmptySD3LatentImage", "inputs": {"width": 512, "height": 512, "batch_size": 1}},
    "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI", "images": ["8", 0]}}
}"#;

const MANIFEST: &str = r#"
save_image_node: "9"
image_size_nodes: ["5", "27"]
seed_nodes: ["25"]
prompt_nodes: ["6"]
"#;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new(manifest: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join("flux.json"), WORKFLOW).unwrap();
        std::fs::write(workflows.join("flux.yaml"), manifest).unwrap();
        Self { dir }
    }

    fn output_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("output")
    }

    fn config(&self, extra: &[(&str, &str)]) -> GeneratorConfig {
        let mut vars: HashMap<String, String> = [
            ("COMFYUI_HOST", "localhost"),
            ("COMFYUI_PORT", "8188"),
            ("IMAGE_APP_BASE_URL", "https://images.example.com/"),
            ("COMFYUI_WORKFLOW_NAME", "flux"),
            ("GENERATION_TIMEOUT_SECS", "5"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        vars.insert("OUTPUT_DIR".into(), self.output_dir().display().to_string());
        vars.insert("WORKING_DIR".into(), self.dir.path().display().to_string());
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        GeneratorConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    fn generator(&self, engine: StubEngine, extra: &[(&str, &str)]) -> ImageGenerator<StubEngine> {
        let config = self.config(extra);
        let store = WorkflowStore::load(&config.workflows_dir(), &config.workflow_name).unwrap();
        ImageGenerator::with_clock(
            Arc::new(engine),
            store,
            Arc::new(config),
            Arc::new(ManualClock::new()),
        )
    }
}

fn files_in(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn wide_request_is_generated_and_persisted() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(StubEngine::new("9", PAYLOAD), &[]);

    let outcome = generator
        .image_generate(
            "A beautiful sunset over the mountains",
            "Mountain Sunset",
            "wide",
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!((outcome.dimensions.width, outcome.dimensions.height), (1152, 864));

    let submissions = generator.engine().submissions();
    assert_eq!(submissions.len(), 1);
    let (graph, client_id) = &submissions[0];
    for size_node in ["5", "27"] {
        assert_eq!(graph[size_node]["inputs"]["width"], 1152);
        assert_eq!(graph[size_node]["inputs"]["height"], 864);
    }
    assert_eq!(
        graph["6"]["inputs"]["text"],
        "A beautiful sunset over the mountains"
    );
    assert_eq!(graph["25"]["inputs"]["noise_seed"], outcome.seed);
    assert!(uuid::Uuid::parse_str(client_id).is_ok());

    assert!(outcome.image.file_name.contains("mountain-sunset"));
    assert!(outcome.image.file_name.ends_with("_flux.png"));
    assert_eq!(std::fs::read(&outcome.image.path).unwrap(), PAYLOAD);
    assert_eq!(
        outcome.markdown,
        format!(
            "![Mountain Sunset](https://images.example.com/{})",
            outcome.image.file_name
        )
    );
    assert_eq!(outcome.job_id.as_str(), "stub-prompt-1");
    assert_eq!(outcome.transitions.last().map(|t| t.to), Some(JobStatus::Completed));
}

#[tokio::test]
async fn same_seed_gives_identical_graphs() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(StubEngine::new("9", PAYLOAD), &[]);
    let request =
        imagegen_core::request::GenerationRequest::parse("a cat", "Cat", "square").unwrap();

    let cancel = CancellationToken::new();
    generator.generate_with_seed(&request, 42, &cancel).await.unwrap();
    generator.generate_with_seed(&request, 42, &cancel).await.unwrap();

    let submissions = generator.engine().submissions();
    assert_eq!(submissions[0].0, submissions[1].0);
    assert_eq!(submissions[0].0["25"]["inputs"]["noise_seed"], 42);
}

#[tokio::test]
async fn concurrent_requests_with_same_title_do_not_collide() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(StubEngine::new("9", PAYLOAD), &[]);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        generator.image_generate("one", "Twin", "tall", &cancel),
        generator.image_generate("two", "Twin", "tall", &cancel),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.image.path, b.image.path);
    assert!(a.image.path.exists());
    assert!(b.image.path.exists());
}

#[tokio::test]
async fn invalid_binding_fails_at_load() {
    let fixture = Fixture::new("save_image_node: \"9\"\nprompt_nodes: [\"66\"]\n");
    let config = fixture.config(&[]);

    assert_matches!(
        WorkflowStore::load(&config.workflows_dir(), &config.workflow_name),
        Err(CoreError::InvalidBinding { ref node_id, .. }) if node_id.as_str() == "66"
    );
}

#[tokio::test]
async fn unknown_aspect_ratio_is_not_submitted() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(StubEngine::new("9", PAYLOAD), &[]);

    let err = generator
        .image_generate("p", "t", "panorama", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(
        err,
        GenerationError::Core(CoreError::UnknownAspectRatio { .. })
    );
    assert!(generator.engine().submissions().is_empty());
}

#[tokio::test]
async fn timeout_leaves_remote_job_alone_by_default() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(StubEngine::new("9", PAYLOAD).never_completing(), &[]);

    let err = generator
        .image_generate("p", "t", "square", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, GenerationError::TimedOut { ref job_id, .. } if job_id.as_str() == "stub-prompt-1");
    assert!(generator.engine().cancelled().is_empty());
    assert!(files_in(&fixture.output_dir()).is_empty());
}

#[tokio::test]
async fn timeout_cancels_remote_job_when_enabled() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(
        StubEngine::new("9", PAYLOAD).never_completing(),
        &[("CANCEL_ON_TIMEOUT", "true")],
    );

    let err = generator
        .image_generate("p", "t", "square", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "timed_out");
    assert_eq!(generator.engine().cancelled(), vec!["stub-prompt-1".to_string()]);
}

#[tokio::test]
async fn engine_failure_is_reported_with_node() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(
        StubEngine::new("9", PAYLOAD).failing("CUDA out of memory"),
        &[],
    );

    let err = generator
        .image_generate("p", "t", "square", &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(
        err,
        GenerationError::Failed { ref failure, .. }
            if failure.node_id.as_deref() == Some("9") && failure.message.contains("CUDA out of memory")
    );
    assert!(files_in(&fixture.output_dir()).is_empty());
}

#[tokio::test]
async fn missing_save_output_is_artifact_missing() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(StubEngine::new("9", PAYLOAD).without_images(), &[]);

    assert_matches!(
        generator
            .image_generate("p", "t", "square", &CancellationToken::new())
            .await,
        Err(GenerationError::ArtifactMissing { .. })
    );
}

#[tokio::test]
async fn push_tracking_uses_websocket_outputs() {
    let messages = [
        r#"{"type":"execution_start","data":{"prompt_id":"stub-prompt-1"}}"#,
        r#"{"type":"executing","data":{"node":"9","prompt_id":"stub-prompt-1"}}"#,
        r#"{"type":"executed","data":{"node":"9","prompt_id":"stub-prompt-1","output":{"images":[{"filename":"ComfyUI_00042_.png","subfolder":"","type":"output"}]}}}"#,
    ]
    .iter()
    .map(|m| parse_message(m).unwrap())
    .collect();

    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(
        StubEngine::new("9", PAYLOAD).with_push_messages(messages),
        &[("COMFYUI_TRACKING", "push")],
    );

    let outcome = generator
        .image_generate("p", "Pushed", "widest", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(generator.engine().history_calls(), 0);
    let states: Vec<JobStatus> = outcome.transitions.iter().map(|t| t.to).collect();
    assert_eq!(states, vec![JobStatus::Running, JobStatus::Completed]);
    assert_eq!((outcome.dimensions.width, outcome.dimensions.height), (1280, 720));
}

#[tokio::test]
async fn push_falls_back_to_polling_when_unsupported() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(
        StubEngine::new("9", PAYLOAD),
        &[("COMFYUI_TRACKING", "push")],
    );

    let outcome = generator
        .image_generate("p", "t", "square", &CancellationToken::new())
        .await
        .unwrap();

    assert!(generator.engine().history_calls() >= 1);
    assert_eq!(std::fs::read(&outcome.image.path).unwrap(), PAYLOAD);
}

#[tokio::test]
async fn cancelled_request_stops_tracking() {
    let fixture = Fixture::new(MANIFEST);
    let generator = fixture.generator(StubEngine::new("9", PAYLOAD).never_completing(), &[]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert_matches!(
        generator.image_generate("p", "t", "square", &cancel).await,
        Err(GenerationError::Cancelled { .. })
    );
    assert!(generator.engine().cancelled().is_empty());
}
