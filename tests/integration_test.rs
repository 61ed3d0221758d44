use wercker_runner::environment::{build_step_env, EnvSnapshot};
use wercker_runner::manifest::{parse_manifest, StepRef};
use wercker_runner::step::LocalStepResolver;
use wercker_runner::workspace::materialize;

/// End-to-end scenario 3/4 from the spec's seed suite: a registered step
/// package with a property schema, exercised through parse -> materialize
/// -> environment construction without a running container.
#[test]
fn registered_step_property_default_and_override_round_trip() {
    let steps_root = tempfile::tempdir().unwrap();
    let greeter_dir = steps_root.path().join("wercker").join("greeter");
    std::fs::create_dir_all(&greeter_dir).unwrap();
    std::fs::write(
        greeter_dir.join("wercker-step.yml"),
        "name: greeter\nproperties:\n  who:\n    default: world\n",
    )
    .unwrap();
    std::fs::write(greeter_dir.join("run.sh"), "echo $WERCKER_GREETER_WHO").unwrap();
    std::fs::create_dir_all(steps_root.path().join("wercker").join("wercker-init")).unwrap();

    let checkout = tempfile::tempdir().unwrap();
    let builds_root = tempfile::tempdir().unwrap();
    let resolver = LocalStepResolver::new(steps_root.path());

    // Default: manifest doesn't override `who`.
    let yaml = br#"
box: ubuntu
build:
  steps:
    - greeter
"#;
    let mut manifest = parse_manifest(yaml).unwrap();
    let workspace = materialize(
        &mut manifest,
        checkout.path(),
        &resolver,
        builds_root.path(),
        "build-default".to_string(),
    )
    .unwrap();

    let step = &manifest.build.steps[1];
    let def = workspace
        .step_definitions
        .get(step.instance_id())
        .expect("step definition should have been discovered");
    let env = build_step_env(
        &EnvSnapshot::from_map(Default::default()),
        &manifest.global_options,
        step,
        Some(def),
    );
    let who = env
        .iter()
        .find(|(k, _)| k == "WERCKER_GREETER_WHO")
        .map(|(_, v)| v.clone());
    assert_eq!(who, Some("world".to_string()));

    // Override: manifest supplies `who: ci`.
    let yaml_override = br#"
box: ubuntu
build:
  steps:
    - greeter:
        who: ci
"#;
    let mut manifest = parse_manifest(yaml_override).unwrap();
    let workspace = materialize(
        &mut manifest,
        checkout.path(),
        &resolver,
        builds_root.path(),
        "build-override".to_string(),
    )
    .unwrap();
    let step = &manifest.build.steps[1];
    let def = workspace.step_definitions.get(step.instance_id()).unwrap();
    let env = build_step_env(
        &EnvSnapshot::from_map(Default::default()),
        &manifest.global_options,
        step,
        Some(def),
    );
    let who = env
        .iter()
        .find(|(k, _)| k == "WERCKER_GREETER_WHO")
        .map(|(_, v)| v.clone());
    assert_eq!(who, Some("ci".to_string()));
}

/// Scenario 2 from the seed suite at the manifest/workspace layer: two
/// script steps materialize into two distinct, uniquely named directories,
/// and the synthetic `wercker-init` step always leads the pipeline.
#[test]
fn two_script_steps_get_independent_workspace_directories() {
    let checkout = tempfile::tempdir().unwrap();
    let builds_root = tempfile::tempdir().unwrap();
    let steps_root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(steps_root.path().join("wercker").join("wercker-init")).unwrap();
    let resolver = LocalStepResolver::new(steps_root.path());

    let yaml = br#"
box: ubuntu
build:
  steps:
    - script:
        code: "exit 7"
    - script:
        code: "echo unreached"
"#;
    let mut manifest = parse_manifest(yaml).unwrap();
    assert_eq!(manifest.build.steps.len(), 3); // wercker-init + 2 scripts

    let workspace = materialize(
        &mut manifest,
        checkout.path(),
        &resolver,
        builds_root.path(),
        "build-3".to_string(),
    )
    .unwrap();

    let first_script = &manifest.build.steps[1];
    let second_script = &manifest.build.steps[2];
    assert_ne!(first_script.instance_id(), second_script.instance_id());

    let first_run_sh = workspace
        .root
        .join(first_script.instance_id())
        .join("run.sh");
    let second_run_sh = workspace
        .root
        .join(second_script.instance_id())
        .join("run.sh");
    assert_eq!(
        std::fs::read_to_string(first_run_sh).unwrap(),
        "#!/bin/bash -xe\nexit 7"
    );
    assert_eq!(
        std::fs::read_to_string(second_run_sh).unwrap(),
        "#!/bin/bash -xe\necho unreached"
    );

    match &manifest.build.steps[0] {
        StepRef::Registered { owner, name, .. } => {
            assert_eq!(owner, "wercker");
            assert_eq!(name, "wercker-init");
        }
        other => panic!("expected wercker-init, got {:?}", other),
    }
}
