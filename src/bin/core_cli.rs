//! Operator CLI (§6): submit RFPs, inspect and cancel workflows, and
//! resolve approval gates against a running `core-server`.
//!
//! Grounded in the donor's `src/bin/caxton-cli.rs` stub, generalized from a
//! placeholder into real `clap` subcommands issuing `reqwest` calls, the
//! way the donor's own test suite already used `reqwest` against its
//! server — promoted here from a dev-dependency to a CLI runtime one.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rfp_core::domain_types::{RfpId, TemplateId};
use rfp_core::workflow::{ApprovalDecision, RfpDocument};
use serde_json::json;

#[derive(Parser)]
#[command(name = "core-cli", about = "Operator CLI for the RFP coordination core")]
struct Cli {
    /// Base URL of the running `core-server`.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submits an RFP document (read as JSON from `--file`, or `-` for stdin).
    Submit {
        /// Path to a JSON file shaped like [`RfpDocument`], or `-` for stdin.
        #[arg(long)]
        file: String,
        /// Explicit template to use instead of predicate selection.
        #[arg(long)]
        template: Option<String>,
    },
    /// Fetches a single workflow's current state.
    Get {
        /// The workflow id to look up.
        workflow_id: String,
    },
    /// Lists every known workflow.
    List,
    /// Cancels a running workflow.
    Cancel {
        /// The workflow id to cancel.
        workflow_id: String,
        /// Reason recorded in the audit trail.
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Resolves a pending approval gate.
    Approve {
        /// The workflow id waiting on an approval decision.
        workflow_id: String,
        /// `approved` or `rejected`.
        #[arg(long, default_value = "approved")]
        decision: String,
        /// Who made the decision, recorded in the audit trail.
        #[arg(long, default_value = "operator")]
        by: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Command::Submit { file, template } => {
            let body = read_input(&file)?;
            let document: RfpDocument =
                serde_json::from_str(&body).context("parsing RFP document JSON")?;
            let template_id = template
                .map(TemplateId::try_new)
                .transpose()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let response = client
                .post(format!("{}/rfps", cli.server))
                .json(&json!({ "document": document, "template_id": template_id }))
                .send()
                .await?;
            print_response(response).await
        }
        Command::Get { workflow_id } => {
            let response = client
                .get(format!("{}/workflows/{workflow_id}", cli.server))
                .send()
                .await?;
            print_response(response).await
        }
        Command::List => {
            let response = client.get(format!("{}/workflows", cli.server)).send().await?;
            print_response(response).await
        }
        Command::Cancel { workflow_id, reason } => {
            let response = client
                .post(format!("{}/workflows/{workflow_id}/cancel", cli.server))
                .json(&json!({ "reason": reason }))
                .send()
                .await?;
            print_status(response).await
        }
        Command::Approve { workflow_id, decision, by } => {
            let decision = match decision.as_str() {
                "approved" => ApprovalDecision::Approved,
                "rejected" => ApprovalDecision::Rejected,
                other => bail!("unknown decision \"{other}\", expected approved|rejected"),
            };
            let response = client
                .post(format!("{}/workflows/{workflow_id}/approvals", cli.server))
                .json(&json!({ "decision": decision, "decided_by": by }))
                .send()
                .await?;
            print_status(response).await
        }
    }
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        use std::io::Read;
        let mut body = String::new();
        std::io::stdin().read_to_string(&mut body)?;
        Ok(body)
    } else {
        Ok(std::fs::read_to_string(file)?)
    }
}

async fn print_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("request failed: {status}");
    }
    Ok(())
}

async fn print_status(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    println!("{status}");
    if !status.is_success() {
        bail!("request failed: {status}");
    }
    Ok(())
}

