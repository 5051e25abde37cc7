//! Configuration document and wire-format tests for conduit-core types.

use chrono::Utc;
use conduit_core::ids::*;
use conduit_core::pipeline::PipelineConfig;
use conduit_core::run::*;
use conduit_core::template::*;
use conduit_core::trigger::*;
use pretty_assertions::assert_eq;

const DOCUMENT: &str = r#"
version: "2.1"
commands:
  checkout:
    description: Fetch sources
    steps:
      - run: git checkout $CONDUIT_REF
  cargo:
    parameters:
      subcommand:
        type: enum
        enum: [build, test]
      release:
        type: boolean
        default: false
    steps:
      - checkout
      - run: cargo << parameters.subcommand >> --release=<< parameters.release >>
jobs:
  build:
    resource_class: large
    steps:
      - cargo:
          subcommand: build
          release: true
      - persist_to_workspace:
          root: target
          paths: [release/app]
  test:
    parallelism: 3
    steps:
      - cargo:
          subcommand: test
  deploy:
    parameters:
      environment:
        type: string
    steps:
      - attach_workspace:
          at: /srv/app
      - run: ./deploy.sh << parameters.environment >>
workflows:
  release:
    jobs:
      - build:
          filters:
            tags:
              only: /^v\d+\.\d+\.\d+$/
      - test:
          requires: [build]
          matrix:
            parameters:
              toolchain: [stable, nightly]
            exclude:
              - toolchain: nightly
      - hold:
          type: approval
          requires: [test]
      - deploy:
          requires: [hold]
          environment: production
          filters:
            branches:
              ignore: /.*/
            tags:
              only: /^v.*/
"#;

#[test]
fn test_full_document() {
    let config = PipelineConfig::from_yaml(DOCUMENT).expect("parse");

    let commands: Vec<_> = config.commands().collect();
    assert_eq!(commands.len(), 2);
    let cargo = commands.iter().find(|c| c.id.as_str() == "cargo").unwrap();
    assert_eq!(
        cargo.definition.parameters["subcommand"].kind,
        ParameterType::Enum
    );
    assert!(cargo.definition.parameters["subcommand"].is_required());
    assert!(!cargo.definition.parameters["release"].is_required());
    assert_eq!(
        cargo.references().map(|c| c.as_str()).collect::<Vec<_>>(),
        vec!["checkout"]
    );

    let templates: Vec<_> = config.templates().collect();
    let build = templates.iter().find(|t| t.id.as_str() == "build").unwrap();
    assert_eq!(
        build.definition.resources.resource_class.as_deref(),
        Some("large")
    );

    let workflow = config.workflow("release").expect("workflow");
    assert_eq!(workflow.name, "release");
    let names: Vec<_> = workflow.jobs.iter().map(|j| j.name()).collect();
    assert_eq!(names, vec!["build", "test", "hold", "deploy"]);

    let test = &workflow.jobs[1];
    let matrix = test.body.matrix.as_ref().unwrap();
    assert_eq!(matrix.parameters["toolchain"].len(), 2);
    assert_eq!(matrix.exclude.len(), 1);

    let deploy = &workflow.jobs[3];
    let filter = RefFilter::compile(deploy.body.filters.as_ref().unwrap()).unwrap();
    assert!(filter.allows_tags());
    assert!(!filter.branches.as_ref().unwrap().passes("main"));
}

#[test]
fn test_bad_filter_pattern_is_a_definition_error() {
    let spec = FilterSpec::tags_only(&["/(v/"]);
    let err = RefFilter::compile(&spec).unwrap_err();
    assert!(err.is_definition_error());
}

#[test]
fn test_run_snapshot_json_shape() {
    let mut record = JobRecord::new(JobInstanceId::new("build"), "build", JobKind::Build);
    record.transition(JobState::Running);
    record.transition(JobState::Succeeded);

    let snapshot = RunSnapshot {
        run_id: RunId::new(),
        workflow: "ci".to_string(),
        context: TriggerContext::branch("main"),
        status: RunStatus::Succeeded,
        cancel_reason: None,
        created_at: Utc::now(),
        completed_at: Some(Utc::now()),
        jobs: vec![record],
    };

    let json = serde_json::to_value(&snapshot).expect("serialize");
    assert_eq!(json["status"], "succeeded");
    assert_eq!(json["context"]["ref_kind"], "branch");
    assert_eq!(json["jobs"][0]["state"], "succeeded");
    assert_eq!(json["jobs"][0]["history"].as_array().unwrap().len(), 3);
    assert!(json["run_id"].as_str().unwrap().starts_with("run_"));
}

#[test]
fn test_steps_serialize_back_to_authored_shape() {
    let steps = vec![
        Step::invoke("checkout"),
        Step::run("make"),
        Step::persist("out", &["bin"]),
    ];
    let yaml = serde_yaml::to_string(&steps).expect("serialize");
    let parsed: Vec<Step> = serde_yaml::from_str(&yaml).expect("parse");
    assert_eq!(parsed, steps);
    assert!(yaml.contains("- checkout"));
}
