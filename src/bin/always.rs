//! Demo resolver plugin that answers every lookup with one address
//!
//! The address defaults to txtorcon's documentation site; a non-empty
//! `TOR_NS_PLUGIN_OPTIONS` replaces it.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use torns::{PluginRequest, PluginResponse, ResolveStatus, Result};

const DEFAULT_ANSWER: &str = "timaq4ygg2iegci7.onion";

fn answer_from(options: &str) -> String {
    match options.trim() {
        "" => DEFAULT_ANSWER.to_string(),
        address => address.to_string(),
    }
}

fn respond(answer: &str, request: PluginRequest) -> PluginResponse {
    match request {
        PluginRequest::Resolve { query_id, .. } => PluginResponse::Resolved {
            query_id,
            status: ResolveStatus::Success,
            answer: vec![answer.to_string()],
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
        eprintln!("[torns-always] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let answer = answer_from(&std::env::var("TOR_NS_PLUGIN_OPTIONS").unwrap_or_default());

    let mut stdout = tokio::io::stdout();
    write_response(&mut stdout, PluginResponse::Init { major: 1, minor: 0 }).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<PluginRequest>() {
            Ok(request) => write_response(&mut stdout, respond(&answer, request)).await?,
            Err(e) => eprintln!("{e}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_name_resolves() {
        let answer = answer_from("");
        for (id, name) in [(1, "anything.demo.onion"), (2, "demo.onion")] {
            let request = PluginRequest::resolve(id, name, "tok-1").unwrap();
            assert_eq!(
                respond(&answer, request).to_string(),
                format!("RESOLVED {id} 0 timaq4ygg2iegci7.onion")
            );
        }
        assert_eq!(
            respond(&answer, PluginRequest::Cancel { query_id: 3 }).to_string(),
            "CANCELED 3"
        );
    }

    #[test]
    fn test_options_override_answer() {
        assert_eq!(answer_from("  abcdefghijklmnop.onion\n"), "abcdefghijklmnop.onion");
        assert_eq!(answer_from("  "), DEFAULT_ANSWER);
    }
}
