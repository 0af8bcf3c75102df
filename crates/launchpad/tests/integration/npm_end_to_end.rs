use std::collections::BTreeMap;

use launchpad::bundle::{Dependencies, Dependency, GeneratedBundle};
use launchpad::config::Config;
use serde_json::json;

use super::orchestrator;

const APP_TS: &str = r#"import express from 'express';

const app = express();
const port = Number(process.env.PORT ?? 3000);

app.get('/api/health', (_req, res) => {
  res.json({ status: 'healthy' });
});

app.listen(port, () => {
  console.log(`Listening on port ${port}`);
});
"#;

const TSCONFIG: &str = r#"{
  "compilerOptions": {
    "target": "ES2020",
    "module": "commonjs",
    "outDir": "dist",
    "rootDir": "src",
    "esModuleInterop": true,
    "strict": true,
    "skipLibCheck": true
  }
}
"#;

fn express_bundle() -> GeneratedBundle {
    let mut files = BTreeMap::new();
    files.insert("src/app.ts".to_string(), APP_TS.to_string());
    files.insert("tsconfig.json".to_string(), TSCONFIG.to_string());

    let dep = |name: &str, version: &str| Dependency {
        name: name.to_string(),
        version: version.to_string(),
    };

    GeneratedBundle {
        files,
        dependencies: Dependencies {
            main: vec![dep("express", "^4.18.2")],
            dev: vec![
                dep("typescript", "^5.3.3"),
                dep("@types/express", "^4.17.21"),
                dep("@types/node", "^20.10.0"),
            ],
        },
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "requires node and npm"]
async fn test_express_project_runs_and_answers_health_checks() {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.scratch_root = Some(scratch.path().to_path_buf());
    let (orch, source) = orchestrator(config);
    source.insert("express-e2e", &express_bundle());

    let report = orch.run("express-e2e").await;
    assert!(report.success, "run failed: {report:?}");
    assert_eq!(report.health.unwrap().body, Some(json!({"status": "healthy"})));

    let status = orch.status("express-e2e").await;
    assert!(status.running);
    let health = status.health.unwrap();
    assert!(health.success, "health check failed: {health:?}");

    assert!(orch.stop("express-e2e").await);
    assert!(!scratch.path().join("express-e2e").exists());
}

#[tokio::test]
#[ignore = "requires node and npm"]
async fn test_type_error_fails_the_build_step() {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.scratch_root = Some(scratch.path().to_path_buf());
    let (orch, source) = orchestrator(config);

    let mut bundle = express_bundle();
    bundle.files.insert(
        "src/app.ts".to_string(),
        format!("{APP_TS}\nconst broken: number = 'not a number';\n"),
    );
    source.insert("express-broken", &bundle);

    let report = orch.run("express-broken").await;
    assert!(!report.success);
    assert_eq!(report.step.as_deref(), Some("npm run build"));
    assert!(report.details.unwrap().contains("TS2322"));
    assert!(!scratch.path().join("express-broken").exists());
}
