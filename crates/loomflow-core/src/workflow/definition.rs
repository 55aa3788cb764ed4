//! Pipeline definition parsing, validation, and plan resolution.
//!
//! Converts between YAML files and `PipelineDefinition`, validates structural
//! constraints (unique IDs, rejection targets, policy bounds), discovers
//! pipeline files on disk, and resolves a definition into the immutable
//! `RunPlan` stored on every run.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use loomflow_types::config::EngineConfig;
use loomflow_types::pipeline::{
    PipelineDefinition, PlanSegment, PlannedStep, RetryPolicy, RunPlan, SegmentDefinition,
    StepSpec,
};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating pipelines.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// No pipeline with this name is loaded.
    #[error("pipeline not found: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `PipelineDefinition`.
pub fn parse_pipeline_yaml(yaml: &str) -> Result<PipelineDefinition, DefinitionError> {
    let def: PipelineDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_pipeline(&def)?;
    Ok(def)
}

/// Serialize a `PipelineDefinition` to a YAML string.
pub fn serialize_pipeline_yaml(def: &PipelineDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(msg: impl Into<String>) -> DefinitionError {
    DefinitionError::ValidationError(msg.into())
}

/// Validate structural constraints on a `PipelineDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, `-` and `_`
/// - Version is a semantic version
/// - At least one segment exists, and parallel groups are non-empty
/// - Step and gate IDs are unique across the pipeline
/// - `on_reject` names a plain or parallel step in an earlier segment
/// - Quality thresholds lie in [0, 1]; attempt caps and timeouts are positive
pub fn validate_pipeline(def: &PipelineDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(invalid("pipeline name must not be empty"));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(format!(
            "pipeline name '{}' contains invalid characters (only alphanumerics, '-' and '_' allowed)",
            def.name
        )));
    }

    semver::Version::parse(&def.version).map_err(|e| {
        invalid(format!("pipeline version '{}' is not a semantic version: {e}", def.version))
    })?;

    if def.segments.is_empty() {
        return Err(invalid("pipeline must have at least one segment"));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    // Steps that a later gate may send back for rework.
    let mut reworkable: HashSet<&str> = HashSet::new();

    for segment in &def.segments {
        match segment {
            SegmentDefinition::Step(spec) => {
                validate_step(spec)?;
                claim_id(&mut seen_ids, &spec.id)?;
                reworkable.insert(spec.id.as_str());
            }
            SegmentDefinition::Parallel { id, steps, .. } => {
                if steps.is_empty() {
                    return Err(invalid(format!("parallel group '{id}' has no steps")));
                }
                claim_id(&mut seen_ids, id)?;
                for spec in steps {
                    validate_step(spec)?;
                    claim_id(&mut seen_ids, &spec.id)?;
                    reworkable.insert(spec.id.as_str());
                }
            }
            SegmentDefinition::Approval(spec) => {
                claim_id(&mut seen_ids, &spec.id)?;
                for target in &spec.on_reject {
                    if !reworkable.contains(target.as_str()) {
                        return Err(invalid(format!(
                            "approval gate '{}' rejects to '{}', which is not an earlier step",
                            spec.id, target
                        )));
                    }
                }
            }
            SegmentDefinition::Phased(spec) => {
                check_id_format(&spec.id)?;
                if spec.target.is_empty() {
                    return Err(invalid(format!("step '{}' has an empty target", spec.id)));
                }
                check_timeout(&spec.id, spec.timeout_secs)?;
                check_retry(&spec.id, spec.retry.as_ref())?;
                claim_id(&mut seen_ids, &spec.id)?;
            }
        }
    }

    Ok(())
}

fn claim_id<'a>(seen: &mut HashSet<&'a str>, id: &'a str) -> Result<(), DefinitionError> {
    check_id_format(id)?;
    if !seen.insert(id) {
        return Err(invalid(format!("duplicate step or gate ID: '{id}'")));
    }
    Ok(())
}

fn check_id_format(id: &str) -> Result<(), DefinitionError> {
    if id.is_empty() || id.contains('/') {
        return Err(invalid(format!(
            "ID '{id}' must be non-empty and must not contain '/'"
        )));
    }
    Ok(())
}

fn check_timeout(id: &str, timeout: Option<u64>) -> Result<(), DefinitionError> {
    if timeout == Some(0) {
        return Err(invalid(format!("step '{id}' timeout must be > 0")));
    }
    Ok(())
}

fn check_retry(id: &str, retry: Option<&RetryPolicy>) -> Result<(), DefinitionError> {
    if let Some(retry) = retry {
        if retry.max_attempts < 1 {
            return Err(invalid(format!("step '{id}' retry.max_attempts must be >= 1")));
        }
        if retry.multiplier < 1.0 || !retry.multiplier.is_finite() {
            return Err(invalid(format!("step '{id}' retry.multiplier must be >= 1.0")));
        }
    }
    Ok(())
}

fn validate_step(spec: &StepSpec) -> Result<(), DefinitionError> {
    if spec.target.is_empty() {
        return Err(invalid(format!("step '{}' has an empty target", spec.id)));
    }
    check_timeout(&spec.id, spec.timeout_secs)?;
    check_retry(&spec.id, spec.retry.as_ref())?;

    if let Some(gate) = &spec.quality {
        if !(0.0..=1.0).contains(&gate.threshold) {
            return Err(invalid(format!(
                "step '{}' quality threshold {} is outside [0, 1]",
                spec.id, gate.threshold
            )));
        }
        if gate.max_attempts < 1 {
            return Err(invalid(format!(
                "step '{}' quality.max_attempts must be >= 1",
                spec.id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan resolution
// ---------------------------------------------------------------------------

/// Resolve a validated definition into the run plan snapshot.
///
/// Engine defaults from `config` fill every policy the definition leaves
/// open, so execution never consults the definition or config again.
pub fn build_run_plan(def: &PipelineDefinition, config: &EngineConfig) -> RunPlan {
    let segments = def
        .segments
        .iter()
        .map(|segment| match segment {
            SegmentDefinition::Step(spec) => PlanSegment::Step {
                step: plan_step(spec, config),
            },
            SegmentDefinition::Parallel { id, steps, review } => PlanSegment::Parallel {
                id: id.clone(),
                steps: steps.iter().map(|s| plan_step(s, config)).collect(),
                review: *review,
            },
            SegmentDefinition::Approval(spec) => PlanSegment::Approval {
                gate_id: spec.id.clone(),
                prompt: spec.prompt.clone(),
                on_reject: spec.on_reject.clone(),
            },
            SegmentDefinition::Phased(spec) => PlanSegment::Phased {
                step: PlannedStep {
                    name: spec.id.clone(),
                    display_name: spec.name.clone().unwrap_or_else(|| spec.id.clone()),
                    target: spec.target.clone(),
                    config: spec.config.clone(),
                    timeout_secs: spec.timeout_secs.unwrap_or(config.step_timeout_secs),
                    retry: spec.retry.clone().unwrap_or_else(|| config.retry.clone()),
                    quality: None,
                    expect: Default::default(),
                },
            },
        })
        .collect();

    RunPlan {
        pipeline: def.name.clone(),
        version: def.version.clone(),
        segments,
    }
}

fn plan_step(spec: &StepSpec, config: &EngineConfig) -> PlannedStep {
    PlannedStep {
        name: spec.id.clone(),
        display_name: spec.name.clone().unwrap_or_else(|| spec.id.clone()),
        target: spec.target.clone(),
        config: spec.config.clone(),
        timeout_secs: spec.timeout_secs.unwrap_or(config.step_timeout_secs),
        retry: spec.retry.clone().unwrap_or_else(|| config.retry.clone()),
        quality: spec.quality.clone(),
        expect: spec.expect,
    }
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a pipeline definition from a YAML file.
pub fn load_pipeline_file(path: &Path) -> Result<PipelineDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline_yaml(&content)
}

/// Save a pipeline definition to a YAML file, creating parent directories.
pub fn save_pipeline_file(path: &Path, def: &PipelineDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_pipeline_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all pipeline YAML files directly under `dir`.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_pipelines(
    dir: &Path,
) -> Result<Vec<(PathBuf, PipelineDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    for path in paths {
        match load_pipeline_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => {
                tracing::warn!(?path, error = %e, "skipping invalid pipeline file");
            }
        }
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The set of pipelines a server or CLI invocation can start runs from.
#[derive(Debug, Clone, Default)]
pub struct PipelineCatalog {
    pipelines: BTreeMap<String, PipelineDefinition>,
}

impl PipelineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every valid pipeline under `dir`. Later files win on name clashes.
    pub fn load_dir(dir: &Path) -> Result<Self, DefinitionError> {
        let mut catalog = Self::new();
        for (path, def) in discover_pipelines(dir)? {
            if catalog.pipelines.contains_key(&def.name) {
                tracing::warn!(?path, pipeline = def.name.as_str(), "duplicate pipeline name");
            }
            catalog.insert(def);
        }
        tracing::debug!(dir = %dir.display(), count = catalog.len(), "loaded pipelines");
        Ok(catalog)
    }

    pub fn insert(&mut self, def: PipelineDefinition) {
        self.pipelines.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Result<&PipelineDefinition, DefinitionError> {
        self.pipelines
            .get(name)
            .ok_or_else(|| DefinitionError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &PipelineDefinition> {
        self.pipelines.values()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE_YAML: &str = r#"
name: longform-article
version: "1.0.0"
segments:
  - type: step
    id: outline
    target: outline
    timeout_secs: 30
  - type: parallel
    id: sections
    review: true
    steps:
      - id: intro
        target: write-section
        quality:
          threshold: 0.9
          max_attempts: 3
          accept_on_final: false
      - id: body
        target: write-section
        retry:
          max_attempts: 5
  - type: approval
    id: editor-review
    prompt: "Approve the draft?"
    on_reject: [body]
  - type: phased
    id: images
    target: images
"#;

    fn expect_validation_error(yaml: &str, fragment: &str) {
        match parse_pipeline_yaml(yaml) {
            Err(DefinitionError::ValidationError(msg)) => {
                assert!(msg.contains(fragment), "unexpected message: {msg}")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_valid_pipeline() {
        let def = parse_pipeline_yaml(ARTICLE_YAML).expect("should parse");
        assert_eq!(def.name, "longform-article");
        assert_eq!(def.segments.len(), 4);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let def = parse_pipeline_yaml(ARTICLE_YAML).unwrap();
        let yaml = serialize_pipeline_yaml(&def).unwrap();
        let back = parse_pipeline_yaml(&yaml).unwrap();
        assert_eq!(back.segments.len(), def.segments.len());
    }

    #[test]
    fn test_validation_rejects_duplicate_ids() {
        expect_validation_error(
            r#"
name: dup
version: "1.0.0"
segments:
  - type: step
    id: a
    target: x
  - type: approval
    id: a
    prompt: "?"
"#,
            "duplicate",
        );
    }

    #[test]
    fn test_validation_rejects_forward_reject_target() {
        expect_validation_error(
            r#"
name: forward
version: "1.0.0"
segments:
  - type: approval
    id: gate
    prompt: "?"
    on_reject: [later]
  - type: step
    id: later
    target: x
"#,
            "not an earlier step",
        );
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        expect_validation_error(
            r#"
name: bad-threshold
version: "1.0.0"
segments:
  - type: step
    id: a
    target: x
    quality:
      threshold: 1.5
      max_attempts: 2
      accept_on_final: true
"#,
            "outside [0, 1]",
        );
    }

    #[test]
    fn test_validation_rejects_bad_name_and_version() {
        expect_validation_error(
            "name: \"bad name\"\nversion: \"1.0.0\"\nsegments:\n  - type: step\n    id: a\n    target: x\n",
            "invalid characters",
        );
        expect_validation_error(
            "name: ok\nversion: \"one\"\nsegments:\n  - type: step\n    id: a\n    target: x\n",
            "semantic version",
        );
    }

    #[test]
    fn test_validation_rejects_empty_pipeline_and_zero_timeout() {
        expect_validation_error("name: empty\nversion: \"1.0.0\"\nsegments: []\n", "at least one");
        expect_validation_error(
            "name: t\nversion: \"1.0.0\"\nsegments:\n  - type: step\n    id: a\n    target: x\n    timeout_secs: 0\n",
            "timeout",
        );
    }

    #[test]
    fn test_missing_accept_on_final_is_a_parse_error() {
        let yaml = r#"
name: gated
version: "1.0.0"
segments:
  - type: step
    id: a
    target: x
    quality:
      threshold: 0.5
      max_attempts: 2
"#;
        assert!(matches!(
            parse_pipeline_yaml(yaml),
            Err(DefinitionError::ParseError(_))
        ));
    }

    #[test]
    fn test_build_run_plan_applies_defaults() {
        let def = parse_pipeline_yaml(ARTICLE_YAML).unwrap();
        let mut config = EngineConfig::default();
        config.step_timeout_secs = 120;
        config.retry.max_attempts = 4;

        let plan = build_run_plan(&def, &config);
        assert_eq!(plan.pipeline, "longform-article");

        let outline = plan.step("outline").unwrap();
        assert_eq!(outline.timeout_secs, 30);
        assert_eq!(outline.retry.max_attempts, 4);
        assert_eq!(outline.display_name, "outline");

        let body = plan.step("body").unwrap();
        assert_eq!(body.retry.max_attempts, 5);
        assert_eq!(body.timeout_secs, 120);

        let intro = plan.step("intro").unwrap();
        assert!(intro.quality.is_some());

        assert_eq!(plan.gate_segment("editor-review"), Some(2));
        assert_eq!(plan.segment_of("images"), Some(3));
    }

    #[test]
    fn test_save_and_discover_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let def = parse_pipeline_yaml(ARTICLE_YAML).unwrap();
        save_pipeline_file(&dir.path().join("article.yaml"), &def).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "name: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_pipelines(dir.path()).unwrap();
        assert_eq!(found.len(), 1);

        let catalog = PipelineCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("longform-article").is_ok());
        assert!(matches!(
            catalog.get("missing"),
            Err(DefinitionError::NotFound(_))
        ));
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_pipelines(Path::new("/nonexistent/loomflow/pipelines")).unwrap();
        assert!(found.is_empty());
    }
}
