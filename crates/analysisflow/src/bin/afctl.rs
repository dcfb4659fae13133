use analysisflow::config::Config;
use analysisflow::jobs::{JobId, QueueError, QueueManager};
use analysisflow::logging;
use serde::Serialize;
use std::env;

const USAGE: &str = "afctl <command>\n\
     Commands:\n\
     - submit <document_ref> [query]\n\
     - status <job_id>\n\
     - result <job_id>\n\
     - cancel <job_id>\n\
     - stats\n\
     - recover\n\
     \n\
     Reads the same AF_* environment as the worker.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprint!("{USAGE}");
        std::process::exit(2);
    }

    let cfg = Config::from_env()?;
    logging::init(cfg.log_json);
    let manager = QueueManager::connect(&cfg).await?;

    match args[1].as_str() {
        "submit" => {
            let Some(document_ref) = args.get(2) else {
                anyhow::bail!("usage: afctl submit <document_ref> [query]");
            };
            let query = args.get(3).map(String::as_str).unwrap_or_default();
            let job_id = manager.submit(document_ref, query).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "status": "queued" }))?;
        }
        "status" => {
            let job_id = job_id_arg(&args, "status")?;
            print_json(&manager.get_status(&job_id).await?)?;
        }
        "result" => {
            let job_id = job_id_arg(&args, "result")?;
            match manager.get_result(&job_id).await {
                Ok(result) => print_json(&result)?,
                Err(QueueError::NotReady { status, .. }) => {
                    print_json(&serde_json::json!({ "job_id": job_id, "status": status, "ready": false }))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        "cancel" => {
            let job_id = job_id_arg(&args, "cancel")?;
            let cancelled = manager.cancel(&job_id).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "cancelled": cancelled }))?;
        }
        "stats" => print_json(&manager.stats().await?)?,
        "recover" => {
            let report = manager.recover(cfg.stale_after(), cfg.max_retries).await?;
            print_json(&report)?;
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprint!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn job_id_arg(args: &[String], command: &str) -> anyhow::Result<JobId> {
    args.get(2)
        .map(|s| JobId::from(s.as_str()))
        .ok_or_else(|| anyhow::anyhow!("usage: afctl {command} <job_id>"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
