//! Demo resolver plugin for `pet.onion`
//!
//! Resolves a fixed table of pet names. `TOR_NS_PLUGIN_OPTIONS` may name a
//! JSON file of extra `{"name.pet.onion": "address.onion"}` entries.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use torns::{PluginRequest, PluginResponse, ResolveStatus, Result};

const PET_NAMES: &[(&str, &str)] = &[
    ("txtorcon.pet.onion", "timaq4ygg2iegci7.onion"),
    (
        "duckduckgo.pet.onion",
        "duckduckgogg42xjoc72x3sjasowoarfbgcmvfimaftt6twagswzczad.onion",
    ),
    ("torist.pet.onion", "toristinkirir4xj.onion"),
    ("scihub.pet.onion", "scihub22266oqcxt.onion"),
];

fn load_table(options: &str) -> Result<HashMap<String, String>> {
    let mut table: HashMap<String, String> = PET_NAMES
        .iter()
        .map(|(name, address)| (name.to_string(), address.to_string()))
        .collect();
    if !options.trim().is_empty() {
        let content = std::fs::read_to_string(options.trim())?;
        let extra: HashMap<String, String> = serde_json::from_str(&content)?;
        table.extend(extra);
    }
    Ok(table)
}

fn respond(table: &HashMap<String, String>, request: PluginRequest) -> PluginResponse {
    match request {
        PluginRequest::Resolve { query_id, name, .. } => match table.get(&name) {
            Some(address) => PluginResponse::Resolved {
                query_id,
                status: ResolveStatus::Success,
                answer: vec![address.clone()],
            },
            None => PluginResponse::Resolved {
                query_id,
                status: ResolveStatus::NotRegistered,
                answer: vec![name],
            },
        },
        PluginRequest::Cancel { query_id } => PluginResponse::Canceled { query_id },
    }
}

async fn write_response(stdout: &mut tokio::io::Stdout, response: PluginResponse) -> Result<()> {
    stdout.write_all(format!("{}\n", response).as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("[torns-petname] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let options = std::env::var("TOR_NS_PLUGIN_OPTIONS").unwrap_or_default();
    let table = load_table(&options)?;

    let mut stdout = tokio::io::stdout();
    write_response(&mut stdout, PluginResponse::Init { major: 1, minor: 0 }).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<PluginRequest>() {
            Ok(request) => write_response(&mut stdout, respond(&table, request)).await?,
            Err(e) => eprintln!("{e}"),
        }
    }
    Ok(())
}
