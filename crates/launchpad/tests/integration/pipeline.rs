use launchpad::bundle::{SetupCommand, StoredGeneration};
use launchpad::runner::{STEP_LOAD, STEP_SERVER_START};

use super::{SH_COMMANDS, orchestrator, server_bundle, sh_config};

fn setup(command: &str, order: i64) -> SetupCommand {
    SetupCommand {
        command: command.to_string(),
        description: String::new(),
        category: "setup".to_string(),
        order,
    }
}

#[tokio::test]
async fn test_successful_run_materializes_and_builds() {
    let scratch = tempfile::tempdir().unwrap();
    let config = sh_config(scratch.path(), SH_COMMANDS);
    let (orch, source) = orchestrator(config.clone());
    source.insert("todo", &server_bundle());

    let report = orch.run("todo").await;
    assert!(report.success, "run failed: {report:?}");
    assert_eq!(report.project_id, "todo");

    let port = report.port.unwrap();
    assert!((config.ports.min..=config.ports.max).contains(&port));
    assert_eq!(
        report.health_check_url.as_deref(),
        Some(format!("http://localhost:{port}/api/health").as_str())
    );
    assert!(report.started_at.is_some());
    assert!(report.build_output.unwrap().contains("compiled"));

    // The script server answers no HTTP, so the probe only warns
    let health = report.health.unwrap();
    assert!(!health.success);
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.starts_with("health check failed"))
    );

    let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![config.install_step_name(), config.build_step_name()]);

    let workspace = scratch.path().join("todo");
    assert!(workspace.join("src/app.ts").is_file());
    assert!(workspace.join("node_modules").is_dir());

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(workspace.join("package.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["name"], "todo");
    assert_eq!(manifest["scripts"]["start"], "node dist/app.js");

    // Bundle env and the port variable reach the server
    let env = std::fs::read_to_string(workspace.join("env.txt")).unwrap();
    assert_eq!(env.trim(), format!("{port} todo"));

    assert!(orch.stop("todo").await);
    assert!(!workspace.exists());
}

#[tokio::test]
async fn test_bundle_dependencies_reach_the_manifest() {
    let scratch = tempfile::tempdir().unwrap();
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));

    let mut bundle = server_bundle();
    bundle.files.insert(
        "package.json".to_string(),
        r#"{"name":"todo","version":"0.1.0","scripts":{"lint":"eslint ."},"dependencies":{"express":"^4.0.0"}}"#
            .to_string(),
    );
    bundle.dependencies.main.push(launchpad::bundle::Dependency {
        name: "express".to_string(),
        version: "^5.0.0".to_string(),
    });
    bundle.dependencies.dev.push(launchpad::bundle::Dependency {
        name: "typescript".to_string(),
        version: "^5.3.3".to_string(),
    });
    source.insert("deps", &bundle);

    let report = orch.run("deps").await;
    assert!(report.success, "run failed: {report:?}");

    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(scratch.path().join("deps/package.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["version"], "0.1.0");
    assert_eq!(manifest["scripts"]["lint"], "eslint .");
    assert_eq!(manifest["scripts"]["build"], "tsc");
    assert_eq!(manifest["dependencies"]["express"], "^4.0.0");
    assert_eq!(manifest["devDependencies"]["typescript"], "^5.3.3");

    orch.shutdown().await;
}

#[tokio::test]
async fn test_escaping_files_are_skipped_with_a_warning() {
    let scratch = tempfile::tempdir().unwrap();
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));

    let mut bundle = server_bundle();
    bundle
        .files
        .insert("../outside.txt".to_string(), "escaped".to_string());
    bundle
        .files
        .insert("/etc/launchpad-test".to_string(), "escaped".to_string());
    source.insert("escape", &bundle);

    let report = orch.run("escape").await;
    assert!(report.success, "run failed: {report:?}");
    assert!(!scratch.path().join("outside.txt").exists());
    assert!(!std::path::Path::new("/etc/launchpad-test").exists());

    let skipped: Vec<&String> = report
        .warnings
        .iter()
        .filter(|w| w.starts_with("skipped file"))
        .collect();
    assert_eq!(skipped.len(), 2);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_failed_setup_commands_do_not_abort_the_run() {
    let scratch = tempfile::tempdir().unwrap();
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));

    let mut bundle = server_bundle();
    bundle.setup_commands = vec![
        setup("sh -c 'exit 9'", 1),
        setup("rm -rf /", 2),
        setup("touch seeded.txt", 3),
    ];
    source.insert("setup", &bundle);

    let report = orch.run("setup").await;
    assert!(report.success, "run failed: {report:?}");
    assert!(scratch.path().join("setup/seeded.txt").is_file());

    let failed: Vec<&String> = report
        .warnings
        .iter()
        .filter(|w| w.starts_with("setup command"))
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed[1].contains("rm -rf /"));

    // install, three setup commands, build
    assert_eq!(report.steps.len(), 5);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_install_failure_cleans_up() {
    let scratch = tempfile::tempdir().unwrap();
    let config = sh_config(
        scratch.path(),
        r#"
[commands]
install = ["sh", "-c", "echo 'npm ERR! 404 left-pad not found' >&2; exit 1"]
build = ["sh", "-c", "touch built"]
start = ["sh", "server.sh"]
"#,
    );
    let (orch, source) = orchestrator(config.clone());
    source.insert("install-fail", &server_bundle());

    let report = orch.run("install-fail").await;
    assert!(!report.success);
    assert_eq!(report.step.unwrap(), config.install_step_name());
    assert!(report.error.unwrap().ends_with("failed"));
    assert!(report.details.unwrap().contains("npm ERR! 404"));
    assert!(report.port.is_none());
    assert!(!scratch.path().join("install-fail").exists());
    assert!(!orch.registry().contains("install-fail").await);
}

#[tokio::test]
async fn test_build_failure_cleans_up() {
    let scratch = tempfile::tempdir().unwrap();
    let config = sh_config(
        scratch.path(),
        r#"
[commands]
install = ["true"]
build = ["sh", "-c", "echo 'src/app.ts(3,1): error TS2304' >&2; exit 2"]
start = ["sh", "server.sh"]
"#,
    );
    let (orch, source) = orchestrator(config.clone());
    source.insert("build-fail", &server_bundle());

    let report = orch.run("build-fail").await;
    assert!(!report.success);
    assert_eq!(report.step.unwrap(), config.build_step_name());
    assert!(report.details.unwrap().contains("TS2304"));
    assert_eq!(report.steps.len(), 2);
    assert!(!scratch.path().join("build-fail").exists());
}

#[tokio::test]
async fn test_long_build_output_is_truncated() {
    let scratch = tempfile::tempdir().unwrap();
    let config = sh_config(
        scratch.path(),
        r#"
output_keep_chars = 50

[commands]
install = ["true"]
build = ["sh", "-c", "i=0; while [ $i -lt 500 ]; do echo line $i >&2; i=$((i+1)); done; exit 1"]
start = ["sh", "server.sh"]
"#,
    );
    let (orch, source) = orchestrator(config);
    source.insert("noisy", &server_bundle());

    let report = orch.run("noisy").await;
    let details = report.details.unwrap();
    assert!(details.starts_with("line 0"));
    assert!(details.contains("characters truncated"));
    assert!(details.trim_end().ends_with("line 499"));
}

#[tokio::test]
async fn test_startup_timeout_cleans_up() {
    let scratch = tempfile::tempdir().unwrap();
    let config = sh_config(
        scratch.path(),
        r#"
[timeouts]
startup = 1

[commands]
install = ["true"]
build = ["true"]
start = ["sh", "-c", "echo compiling; sleep 30"]
"#,
    );
    let (orch, source) = orchestrator(config);
    source.insert("silent", &server_bundle());

    let report = orch.run("silent").await;
    assert!(!report.success);
    assert_eq!(report.step.as_deref(), Some(STEP_SERVER_START));
    assert!(report.error.unwrap().contains("startup timeout"));
    assert!(report.details.unwrap().contains("compiling"));
    assert!(!scratch.path().join("silent").exists());
    assert!(orch.registry().is_empty().await);
}

#[tokio::test]
async fn test_early_exit_cleans_up() {
    let scratch = tempfile::tempdir().unwrap();
    let config = sh_config(
        scratch.path(),
        r#"
[commands]
install = ["true"]
build = ["true"]
start = ["sh", "-c", "echo 'Error: Cannot find module dist/app.js' >&2; exit 1"]
"#,
    );
    let (orch, source) = orchestrator(config);
    source.insert("crash", &server_bundle());

    let report = orch.run("crash").await;
    assert!(!report.success);
    assert_eq!(report.step.as_deref(), Some(STEP_SERVER_START));
    assert!(report.error.unwrap().contains("exited before becoming ready"));
    assert!(report.details.unwrap().contains("Cannot find module"));
    assert!(!scratch.path().join("crash").exists());
}

#[tokio::test]
async fn test_unparsable_bundle_aborts_before_workspace() {
    let scratch = tempfile::tempdir().unwrap();
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));
    source.insert_record(
        "broken",
        StoredGeneration {
            generated_files: "{not json".to_string(),
            setup_commands: Vec::new(),
            dependencies: Default::default(),
            env_variables: Default::default(),
        },
    );

    let report = orch.run("broken").await;
    assert!(!report.success);
    assert_eq!(report.step.as_deref(), Some(STEP_LOAD));
    assert!(report.error.unwrap().contains("not valid JSON"));
    assert!(!scratch.path().join("broken").exists());
}

#[tokio::test]
async fn test_stale_workspace_is_replaced() {
    let scratch = tempfile::tempdir().unwrap();
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));
    source.insert("stale", &server_bundle());

    let leftover = scratch.path().join("stale/leftover.txt");
    std::fs::create_dir_all(leftover.parent().unwrap()).unwrap();
    std::fs::write(&leftover, "from an earlier crash").unwrap();

    let report = orch.run("stale").await;
    assert!(report.success, "run failed: {report:?}");
    assert!(!leftover.exists());

    orch.shutdown().await;
}
