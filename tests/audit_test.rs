use audit_worker::audit::lighthouse::parse_devtools_port;
use audit_worker::audit::{AuditEngine, LighthouseConfig, LighthouseEngine, merge_options};
use serde_json::json;
use std::path::PathBuf;

#[test]
fn devtools_port_is_read_from_chrome_banner() {
    assert_eq!(
        parse_devtools_port(
            "DevTools listening on ws://127.0.0.1:38421/devtools/browser/0b1e7c9a-2f"
        ),
        Some(38421)
    );
    assert_eq!(
        parse_devtools_port("DevTools listening on ws://[::1]:9222/devtools/browser/x"),
        Some(9222)
    );
    assert_eq!(parse_devtools_port("[0101/000000.000:ERROR:gpu_init.cc] nope"), None);
    assert_eq!(parse_devtools_port("DevTools listening on ws://localhost/"), None);
}

#[test]
fn merged_options_always_request_json_and_html() {
    let caller = json!({"onlyCategories": ["performance"], "output": "csv"});
    let merged = merge_options(caller.as_object().unwrap());
    assert_eq!(merged["onlyCategories"], json!(["performance"]));
    assert_eq!(merged["output"], json!(["json", "html"]));

    let defaults = merge_options(&serde_json::Map::new());
    assert_eq!(defaults.len(), 1);
}

#[tokio::test]
async fn failed_launch_cleans_up_scratch_directory() {
    let work_dir = std::env::temp_dir().join(format!("audit-worker-test-{}", uuid::Uuid::new_v4()));
    let engine = LighthouseEngine::new(LighthouseConfig {
        chrome_bin: PathBuf::from("/nonexistent/chrome"),
        work_dir: work_dir.clone(),
        ..LighthouseConfig::default()
    });

    let result = engine.run("https://example.com", &merge_options(&Default::default())).await;
    assert!(result.is_err());

    // Removal after a failed launch runs on the blocking pool.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::fs::read_dir(&work_dir).unwrap().count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "scratch directory should be removed"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    std::fs::remove_dir_all(&work_dir).unwrap();
}

#[tokio::test]
#[ignore] // Requires Chrome and the Lighthouse CLI on PATH
async fn lighthouse_produces_both_reports() {
    let engine = LighthouseEngine::new(LighthouseConfig {
        chrome_bin: std::env::var("CHROME_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("google-chrome")),
        ..LighthouseConfig::default()
    });
    let options = merge_options(json!({"onlyCategories": ["seo"]}).as_object().unwrap());

    let session = engine.run("https://example.com", &options).await.unwrap();
    let report: serde_json::Value = serde_json::from_slice(&session.reports.json).unwrap();
    assert!(report["categories"]["seo"].is_object());
    assert!(!session.reports.html.is_empty());
    session.release().await;
}
