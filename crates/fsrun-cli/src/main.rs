use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use fsrun_core::{ContentStore, RunRecord, RECORD_FILENAME};
use fsrun_index::{field_equals, with_status, AggregateOptions, IndexDocument, RunIndex};
use fsrun_recorder::{
    record_command, CommandRun, ExperimentInfo, RecorderOptions, RunRecorder, RunStart,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fsrun", version, about = "Filesystem run recorder and run index")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one run of a child process.
    Exec {
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "source")]
        sources: Vec<PathBuf>,
        #[arg(long = "resource")]
        resources: Vec<PathBuf>,
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
        #[arg(long, conflicts_with = "config_file")]
        config: Option<String>,
        #[arg(long)]
        config_file: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        heartbeat_secs: u64,
        #[arg(long)]
        json: bool,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Sweep a tree of run directories into an index file.
    Aggregate {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        include_incomplete: bool,
        #[arg(long, default_value = RECORD_FILENAME)]
        record_filename: String,
        #[arg(long)]
        json: bool,
    },
    Query {
        #[arg(long)]
        index: PathBuf,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        experiment: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Results {
        #[arg(long)]
        index: PathBuf,
        #[arg(long)]
        doc_id: u64,
        #[arg(long = "key")]
        keys: Vec<String>,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Show {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    VerifyStore {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Exec {
            base,
            run_id,
            name,
            sources,
            resources,
            artifacts,
            config,
            config_file,
            heartbeat_secs,
            json,
            command,
        } => {
            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow!("exec needs a command after `--`"))?;
            let config = load_config(config.as_deref(), config_file.as_deref())?;
            let experiment = ExperimentInfo {
                name: name.unwrap_or_else(|| program_name(program)),
                base_dir: std::env::current_dir().context("resolving working directory")?,
                sources,
                dependencies: Vec::new(),
                mainfile: None,
            };
            let run = CommandRun {
                program: program.clone(),
                args: args.to_vec(),
                start: RunStart {
                    experiment,
                    command: command.join(" "),
                    host: host_info(),
                    start_time: Utc::now(),
                    config,
                    meta: json!({ "argv": command }),
                    run_id,
                },
                resources,
                artifacts: parse_artifact_bindings(&artifacts)?,
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
            };
            let mut recorder = RunRecorder::create(&base, RecorderOptions::default())?;
            let outcome = record_command(&mut recorder, run)?;
            info!(
                run_id = %outcome.run_id,
                status = %outcome.status,
                exit_code = ?outcome.exit_code,
                "exec finished"
            );
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "exec",
                    "run_id": outcome.run_id,
                    "run_dir": outcome.run_dir.display().to_string(),
                    "status": outcome.status.as_str(),
                    "exit_code": outcome.exit_code,
                })));
            }
            println!("run_id: {}", outcome.run_id);
            println!("run_dir: {}", outcome.run_dir.display());
            println!("status: {}", outcome.status);
            if let Some(code) = outcome.exit_code {
                println!("exit_code: {}", code);
            }
        }
        Commands::Aggregate {
            source,
            out,
            overwrite,
            include_incomplete,
            record_filename,
            json,
        } => {
            let options = AggregateOptions {
                overwrite,
                skip_incomplete: !include_incomplete,
                record_filename,
                ..AggregateOptions::default()
            };
            info!(source = %source.display(), out = %out.display(), "aggregating runs");
            let report = fsrun_index::aggregate(&source, &out, &options)?;
            if json {
                let failures: Vec<Value> = report
                    .failures
                    .iter()
                    .map(|f| json!({"path": f.path.display().to_string(), "message": f.message}))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "index": out.display().to_string(),
                    "indexed": report.indexed,
                    "skipped_incomplete": report.skipped_incomplete,
                    "failures": failures,
                })));
            }
            println!("index: {}", out.display());
            println!("indexed: {}", report.indexed);
            println!("skipped_incomplete: {}", report.skipped_incomplete);
            for failure in &report.failures {
                println!("skipped: {} ({})", failure.path.display(), failure.message);
            }
        }
        Commands::Query {
            index,
            status,
            experiment,
            json,
        } => {
            let index = RunIndex::open(&index)?;
            let mut filters: Vec<Box<dyn Fn(&IndexDocument) -> bool>> = Vec::new();
            if let Some(status) = status.as_deref() {
                filters.push(Box::new(with_status(status)));
            }
            if let Some(name) = experiment {
                filters.push(Box::new(field_equals("/experiment/name", json!(name))));
            }
            let hits = index.query(|doc| filters.iter().all(|f| f(doc)));
            if json {
                let documents: Vec<Value> = hits.iter().map(|d| document_summary(d)).collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "query",
                    "documents": documents,
                })));
            }
            for doc in hits {
                println!(
                    "{}\t{}\t{}\t{}",
                    doc.doc_id,
                    doc.status().unwrap_or("-"),
                    doc.experiment_name().unwrap_or("-"),
                    doc.run_dir().unwrap_or("-")
                );
            }
        }
        Commands::Results {
            index,
            doc_id,
            keys,
            root,
            json,
        } => {
            let mut index = RunIndex::open(&index)?;
            if let Some(root) = root {
                index = index.with_root(root);
            }
            let doc = index
                .get(doc_id)
                .ok_or_else(|| anyhow!("no document with id {}", doc_id))?;
            let requested: Vec<&str> = if keys.is_empty() {
                doc.result_keys()
            } else {
                keys.iter().map(String::as_str).collect()
            };
            let values = index.load_result_values(doc, &requested);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results",
                    "doc_id": doc_id,
                    "results": values,
                })));
            }
            for (key, value) in &values {
                println!("{}: {}", key, value);
            }
        }
        Commands::Show { run_dir, json } => {
            let record = RunRecord::load(&run_dir.join(RECORD_FILENAME))?;
            let value = record.to_value()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "record": value,
                })));
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::VerifyStore { dir, json } => {
            let report = ContentStore::new(&dir).verify()?;
            info!(
                dir = %dir.display(),
                verified = report.verified,
                problems = report.problems.len(),
                "store verified"
            );
            let problems: Vec<String> = report.problems.iter().map(|p| p.to_string()).collect();
            if json {
                return Ok(Some(json!({
                    "ok": problems.is_empty(),
                    "command": "verify-store",
                    "verified": report.verified,
                    "problems": problems,
                })));
            }
            println!("verified: {}", report.verified);
            for problem in &problems {
                println!("problem: {}", problem);
            }
            if !problems.is_empty() {
                std::process::exit(1);
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Exec { json, .. }
        | Commands::Aggregate { json, .. }
        | Commands::Query { json, .. }
        | Commands::Results { json, .. }
        | Commands::Show { json, .. }
        | Commands::VerifyStore { json, .. } => *json,
    }
}

fn document_summary(doc: &IndexDocument) -> Value {
    json!({
        "doc_id": doc.doc_id,
        "status": doc.status(),
        "experiment": doc.experiment_name(),
        "run_dir": doc.run_dir(),
        "config": doc.body.get("config"),
        "result_keys": doc.result_keys(),
    })
}

/// Parses `NAME=PATH` artifact flags.
fn parse_artifact_bindings(values: &[String]) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::with_capacity(values.len());
    for raw in values {
        let (name, path) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --artifact '{}': expected NAME=PATH", raw))?;
        if name.trim().is_empty() || path.trim().is_empty() {
            return Err(anyhow!(
                "invalid --artifact '{}': name and path cannot be empty",
                raw
            ));
        }
        out.push((name.to_string(), PathBuf::from(path)));
    }
    Ok(out)
}

fn load_config(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    if let Some(raw) = inline {
        return serde_json::from_str(raw).context("parsing --config as JSON");
    }
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        return serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()));
    }
    Ok(json!({}))
}

fn program_name(program: &str) -> String {
    Path::new(program)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

fn host_info() -> Value {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::fs::read_to_string("/etc/hostname").map(|s| s.trim().to_string()))
        .unwrap_or_else(|_| "unknown".to_string());
    json!({
        "hostname": hostname,
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_bindings_split_on_first_equals() {
        let parsed = parse_artifact_bindings(&[
            "model=out/model.bin".to_string(),
            "log=a=b.txt".to_string(),
        ])
        .expect("parse");
        assert_eq!(
            parsed,
            vec![
                ("model".to_string(), PathBuf::from("out/model.bin")),
                ("log".to_string(), PathBuf::from("a=b.txt")),
            ]
        );
        assert!(parse_artifact_bindings(&["model".to_string()]).is_err());
        assert!(parse_artifact_bindings(&["=x".to_string()]).is_err());
    }

    #[test]
    fn config_comes_from_json_or_yaml() {
        assert_eq!(
            load_config(Some(r#"{"lr": 0.1}"#), None).expect("json"),
            json!({"lr": 0.1})
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "lr: 0.1\nlayers:\n  - 64\n  - 32\n").expect("write");
        assert_eq!(
            load_config(None, Some(&path)).expect("yaml"),
            json!({"lr": 0.1, "layers": [64, 32]})
        );
        assert_eq!(load_config(None, None).expect("default"), json!({}));
        assert!(load_config(Some("{bad"), None).is_err());
    }

    #[test]
    fn program_name_drops_directories_and_extension() {
        assert_eq!(program_name("./scripts/train.py"), "train");
        assert_eq!(program_name("python"), "python");
    }

    #[test]
    fn cli_parses_exec_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "fsrun", "exec", "--base", "runs", "--artifact", "m=model.bin", "--", "python",
            "train.py", "--epochs", "3",
        ])
        .expect("parse");
        match cli.command {
            Commands::Exec {
                base,
                artifacts,
                command,
                heartbeat_secs,
                ..
            } => {
                assert_eq!(base, PathBuf::from("runs"));
                assert_eq!(artifacts, vec!["m=model.bin".to_string()]);
                assert_eq!(command, vec!["python", "train.py", "--epochs", "3"]);
                assert_eq!(heartbeat_secs, 10);
            }
            _ => panic!("expected exec"),
        }
    }
}
