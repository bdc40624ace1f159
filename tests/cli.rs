use assert_cmd::Command;
use clap::CommandFactory;
use predicates::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use corejoin::Cli;

fn base_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("corejoin"));
    cmd.current_dir(dir)
        .env_remove("COREJOIN_CONFIG")
        .env_remove("COREJOIN_MAX_JOIN_KEY")
        .env("RUST_LOG", "warn");
    cmd
}

/// Writes an engine config with two on-disk cores and returns its path.
fn write_config(dir: &Path) -> anyhow::Result<PathBuf> {
    let config = format!(
        r#"
[settings]
search_threads = 1

[[core]]
name = "coreA"
path = '{a}'
unqualified_fields = [{{ field = "title" }}]
fields = [
    {{ name = "A", kind = "key" }},
    {{ name = "M", kind = "untokenized" }},
    {{ name = "title", kind = "text", stemmed = true }},
]

[[core]]
name = "coreB"
path = '{b}'
fields = [
    {{ name = "B", kind = "key" }},
    {{ name = "N", kind = "untokenized" }},
    {{ name = "cat_N", kind = "drilldown" }},
]
"#,
        a = dir.join("coreA").display(),
        b = dir.join("coreB").display(),
    );
    let path = dir.join("corejoin.toml");
    fs::write(&path, config)?;
    Ok(path)
}

fn index(dir: &Path, config: &Path, core: &str, lines: &[&str]) -> anyhow::Result<()> {
    let docs = dir.join(format!("{core}.jsonl"));
    fs::write(&docs, lines.join("\n"))?;
    base_cmd(dir)
        .arg("index")
        .arg("--config")
        .arg(config)
        .args(["--core", core, "--documents"])
        .arg(&docs)
        .assert()
        .success()
        .stdout(contains(format!("\"indexed\":{}", lines.len())));
    Ok(())
}

fn seeded() -> anyhow::Result<(TempDir, PathBuf)> {
    let tmp = TempDir::new()?;
    let config = write_config(tmp.path())?;
    index(
        tmp.path(),
        &config,
        "coreA",
        &[
            r#"{"id":"A","fields":[["A",1],["title","first light"]]}"#,
            r#"{"id":"A-M","fields":[["A",2],["M","true"],["title","second light"]]}"#,
        ],
    )?;
    index(
        tmp.path(),
        &config,
        "coreB",
        &[r#"{"id":"B-N","fields":[["B",2],["N","true"],["cat_N","nerd"]]}"#],
    )?;
    Ok((tmp, config))
}

const JOIN_REQUEST: &str = r#"{
    "resultsFrom": "coreA",
    "matches": [{"left": {"core": "coreA", "uniqueKey": "A"}, "right": {"core": "coreB", "key": "B"}}],
    "filterQueries": {"coreB": [{"type": "clause", "index": "N", "relation": "=", "term": "true"}]},
    "facets": [["coreB", {"fieldname": "cat_N"}]]
}"#;

#[test]
fn indexed_cores_answer_joined_queries() -> anyhow::Result<()> {
    let (tmp, config) = seeded()?;
    let request = tmp.path().join("request.json");
    fs::write(&request, JOIN_REQUEST)?;

    let output = base_cmd(tmp.path())
        .arg("query")
        .arg("--config")
        .arg(&config)
        .arg("--request")
        .arg(&request)
        .output()?;
    assert!(output.status.success());
    let response: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(response["total"], 1);
    assert_eq!(response["hits"][0]["identifier"], "A-M");
    assert_eq!(response["drilldownData"][0]["terms"][0]["term"], "nerd");
    assert!(response["queryTime"].as_u64().unwrap_or(0) >= 1);
    Ok(())
}

#[test]
fn query_reads_request_from_stdin() -> anyhow::Result<()> {
    let (tmp, config) = seeded()?;
    base_cmd(tmp.path())
        .arg("query")
        .arg("--config")
        .arg(&config)
        .args(["--request", "-"])
        .write_stdin(r#"{"resultsFrom": "coreA"}"#)
        .assert()
        .success()
        .stdout(contains("\"total\": 2"));
    Ok(())
}

#[test]
fn environment_overrides_config_settings() -> anyhow::Result<()> {
    let (tmp, config) = seeded()?;
    let request = tmp.path().join("request.json");
    fs::write(&request, JOIN_REQUEST)?;
    base_cmd(tmp.path())
        .env("COREJOIN_MAX_JOIN_KEY", "1")
        .arg("query")
        .arg("--config")
        .arg(&config)
        .arg("--request")
        .arg(&request)
        .assert()
        .success()
        .stdout(contains("\"total\": 0"));
    Ok(())
}

#[test]
fn oversized_join_key_ceiling_from_environment_is_refused() -> anyhow::Result<()> {
    let (tmp, config) = seeded()?;
    base_cmd(tmp.path())
        .env("COREJOIN_MAX_JOIN_KEY", u64::MAX.to_string())
        .arg("info")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("Invalid configuration").and(contains("max_join_key")));
    Ok(())
}

#[test]
fn unknown_core_fails_with_detail() -> anyhow::Result<()> {
    let (tmp, config) = seeded()?;
    base_cmd(tmp.path())
        .env("COREJOIN_CONFIG", &config)
        .args(["query", "--request", "-"])
        .write_stdin(r#"{"resultsFrom": "coreZ"}"#)
        .assert()
        .failure()
        .stderr(contains("Unknown core 'coreZ'"));
    Ok(())
}

#[test]
fn terms_and_info_report_index_contents() -> anyhow::Result<()> {
    let (tmp, config) = seeded()?;
    let output = base_cmd(tmp.path())
        .arg("terms")
        .arg("--config")
        .arg(&config)
        .args(["--core", "coreA", "--field", "title", "--prefix", "li"])
        .output()?;
    assert!(output.status.success());
    let terms: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(terms[0]["term"], "light");
    assert_eq!(terms[0]["count"], 2);

    let output = base_cmd(tmp.path())
        .arg("info")
        .arg("--config")
        .arg(&config)
        .output()?;
    assert!(output.status.success());
    let info: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(info[0]["name"], "coreA");
    assert_eq!(info[0]["numDocs"], 2);
    assert_eq!(info[1]["drilldownFieldnames"][0], "cat_N");
    Ok(())
}

#[test]
fn malformed_documents_report_their_line() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let config = write_config(tmp.path())?;
    let docs = tmp.path().join("bad.jsonl");
    fs::write(&docs, "{\"id\":\"A\",\"fields\":[[\"A\",1]]}\nnot json\n")?;
    base_cmd(tmp.path())
        .arg("index")
        .arg("--config")
        .arg(&config)
        .args(["--core", "coreA", "--documents"])
        .arg(&docs)
        .assert()
        .failure()
        .stderr(contains("line 2"));
    Ok(())
}

#[test]
fn missing_config_is_reported() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    base_cmd(tmp.path())
        .args(["info", "--config", "absent.toml"])
        .assert()
        .failure()
        .stderr(contains("load engine config").and(contains("absent.toml")));
    Ok(())
}

#[test]
fn completions_are_generated() {
    let tmp = TempDir::new().expect("tempdir");
    base_cmd(tmp.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(contains("corejoin"));
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}
