//! Control-port reply framing and event decoding

use crate::controller::ControllerEvent;
use crate::error::{BrokerError, Result};
use crate::types::{BootstrapStatus, StreamEvent, StreamPurpose};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

/// One complete reply: status code plus one entry per reply line
///
/// Data blocks (`250+key=` … `.`) are folded into their line as
/// `key=` followed by the newline-joined data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.code == 250
    }

    /// Asynchronous event notification
    pub fn is_event(&self) -> bool {
        self.code == 650
    }

    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    /// Map the reply code to a result
    pub fn into_result(self) -> Result<Reply> {
        match self.code {
            250 => Ok(self),
            // 552: unrecognized entity (stream already gone), 555: unsatisfiable
            552 | 555 => Err(BrokerError::ControllerRejected(self.first_line().to_string())),
            code => Err(BrokerError::Controller {
                code,
                message: self.first_line().to_string(),
            }),
        }
    }

    /// Value of `key=value` among the reply lines
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// Reads framed replies from the control connection
pub struct ReplyReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> ReplyReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        Ok(self
            .lines
            .next_line()
            .await?
            .map(|l| l.trim_end_matches('\r').to_string()))
    }

    /// Next complete reply, `None` at end of stream
    pub async fn next_reply(&mut self) -> Result<Option<Reply>> {
        let mut lines = Vec::new();
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            let (code, sep, body) = split_status_line(&line)?;
            match sep {
                ' ' => {
                    lines.push(body.to_string());
                    return Ok(Some(Reply { code, lines }));
                }
                '-' => lines.push(body.to_string()),
                '+' => {
                    let mut data = Vec::new();
                    loop {
                        let Some(raw) = self.next_line().await? else {
                            return Ok(None);
                        };
                        if raw == "." {
                            break;
                        }
                        // Dot-stuffing
                        data.push(raw.strip_prefix('.').map(str::to_string).unwrap_or(raw));
                    }
                    lines.push(format!("{}{}", body, data.join("\n")));
                }
                other => {
                    return Err(BrokerError::Connection(format!(
                        "malformed reply separator '{}' in '{}'",
                        other, line
                    )))
                }
            }
        }
    }
}

fn split_status_line(line: &str) -> Result<(u16, char, &str)> {
    let malformed = || BrokerError::Connection(format!("malformed reply line '{}'", line));
    let code = line
        .get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(malformed)?;
    let sep = line[3..].chars().next().ok_or_else(malformed)?;
    let body = line.get(4..).unwrap_or("");
    Ok((code, sep, body))
}

/// Split a reply line into arguments, honouring `"quoted \"values\""`
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut started = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if in_quote => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quote = !in_quote;
                started = true;
            }
            ' ' if !in_quote => {
                if started {
                    args.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            _ => {
                current.push(ch);
                started = true;
            }
        }
    }
    if started {
        args.push(current);
    }
    args
}

/// `KEY=value` with an upper-case keyword
fn keyword(arg: &str) -> Option<(&str, &str)> {
    let (key, value) = arg.split_once('=')?;
    let is_keyword = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    is_keyword.then_some((key, value))
}

fn split_host_port(addr: &str) -> (String, Option<u16>) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (addr.to_string(), None),
        },
        None => (addr.to_string(), None),
    }
}

/// Decode `STREAM <id> <status> <circuit> <target> [KEY=value ...]`
pub fn parse_stream_event(body: &str) -> Result<StreamEvent> {
    let args = split_args(body);
    if args.first().map(String::as_str) != Some("STREAM") || args.len() < 5 {
        return Err(BrokerError::Connection(format!("malformed STREAM event '{}'", body)));
    }

    let (target_address, target_port) = split_host_port(&args[4]);
    let mut event = StreamEvent::new(
        args[1].clone(),
        args[2].parse().unwrap_or_else(|e: std::convert::Infallible| match e {}),
        target_address,
        target_port.unwrap_or(0),
    );
    event.circuit_id = args[3].clone();

    let mut keyword_args = BTreeMap::new();
    for arg in &args[5..] {
        if let Some((key, value)) = keyword(arg) {
            keyword_args.insert(key.to_string(), value.to_string());
        }
    }

    if let Some(source) = keyword_args.get("SOURCE_ADDR") {
        let (address, port) = split_host_port(source);
        event.source_address = Some(address);
        event.source_port = port;
    }
    if let Some(purpose) = keyword_args.get("PURPOSE") {
        event.purpose = purpose.parse::<StreamPurpose>().ok();
    }
    event.keyword_args = keyword_args;
    Ok(event)
}

/// Decode a bootstrap status from `... BOOTSTRAP PROGRESS=n TAG=t SUMMARY="s"`
///
/// Accepts both `STATUS_CLIENT NOTICE BOOTSTRAP ...` event bodies and the
/// `status/bootstrap-phase` GETINFO value.
pub fn parse_bootstrap(body: &str) -> Option<BootstrapStatus> {
    let args = split_args(body);
    let start = args.iter().position(|a| a == "BOOTSTRAP")?;
    let mut status = BootstrapStatus {
        progress: 0,
        tag: None,
        summary: None,
    };
    let mut saw_progress = false;
    for arg in &args[start + 1..] {
        match keyword(arg) {
            Some(("PROGRESS", v)) => {
                status.progress = v.parse().ok()?;
                saw_progress = true;
            }
            Some(("TAG", v)) => status.tag = Some(v.to_string()),
            Some(("SUMMARY", v)) => status.summary = Some(v.to_string()),
            _ => {}
        }
    }
    saw_progress.then_some(status)
}

/// Decode the events the broker subscribes to; anything else is skipped
pub fn parse_event(body: &str) -> Option<ControllerEvent> {
    match body.split_whitespace().next()? {
        "STREAM" => match parse_stream_event(body) {
            Ok(event) => Some(ControllerEvent::Stream(event)),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed stream event");
                None
            }
        },
        "STATUS_CLIENT" => parse_bootstrap(body).map(ControllerEvent::Bootstrap),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamStatus;

    #[tokio::test]
    async fn test_reply_reader_framing() {
        let wire: &[u8] = b"250-version=0.4.8.9 (git-1)\r\n250 OK\r\n\
            250+status/bootstrap-phase=\r\nNOTICE BOOTSTRAP PROGRESS=100\r\n..dotted\r\n.\r\n250 OK\r\n\
            650 STREAM 5 NEW 0 a.onion:80\r\n";
        let mut reader = ReplyReader::new(wire);

        let first = reader.next_reply().await.unwrap().unwrap();
        assert!(first.is_ok());
        assert_eq!(first.value("version"), Some("0.4.8.9 (git-1)"));

        let second = reader.next_reply().await.unwrap().unwrap();
        assert_eq!(
            second.value("status/bootstrap-phase"),
            Some("NOTICE BOOTSTRAP PROGRESS=100\n.dotted")
        );

        let third = reader.next_reply().await.unwrap().unwrap();
        assert!(third.is_event());
        assert_eq!(third.first_line(), "STREAM 5 NEW 0 a.onion:80");

        assert!(reader.next_reply().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reply_reader_rejects_garbage() {
        let wire: &[u8] = b"hello\r\n";
        let mut reader = ReplyReader::new(wire);
        assert!(reader.next_reply().await.is_err());
    }

    #[test]
    fn test_into_result_codes() {
        let reply = |code| Reply {
            code,
            lines: vec!["msg".to_string()],
        };
        assert!(reply(250).into_result().is_ok());
        assert!(reply(552).into_result().unwrap_err().is_rejection());
        assert!(reply(555).into_result().unwrap_err().is_rejection());
        assert!(matches!(
            reply(551).into_result(),
            Err(BrokerError::Controller { code: 551, .. })
        ));
    }

    #[test]
    fn test_split_args_quoting() {
        assert_eq!(
            split_args(r#"A B="x y" C="q\"z" D="""#),
            vec!["A", "B=x y", "C=q\"z", "D="]
        );
        assert_eq!(split_args("  spaced   out "), vec!["spaced", "out"]);
    }

    #[test]
    fn test_parse_stream_event() {
        let body = r#"STREAM 21 CONTROLLER_WAIT 0 foo.pet.onion:443 SOURCE_ADDR=127.0.0.1:51234 PURPOSE=USER SOCKS_USERNAME="alice smith" ISO_FIELDS=SOCKS_USERNAME,CLIENTADDR NYM_EPOCH=3"#;
        let event = parse_stream_event(body).unwrap();
        assert_eq!(event.id, "21");
        assert_eq!(event.status, StreamStatus::ControllerWait);
        assert_eq!(event.circuit_id, "0");
        assert_eq!(event.target_address, "foo.pet.onion");
        assert_eq!(event.target_port, 443);
        assert_eq!(event.source_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(event.source_port, Some(51234));
        assert_eq!(event.purpose, Some(StreamPurpose::User));
        assert_eq!(event.keyword_args["SOCKS_USERNAME"], "alice smith");
        assert_eq!(event.nym_epoch(), Some("3"));
    }

    #[test]
    fn test_parse_stream_event_ipv6_and_bad_input() {
        let event = parse_stream_event("STREAM 1 NEW 0 [::1]:80").unwrap();
        assert_eq!(event.target_address, "[::1]");
        assert_eq!(event.target_port, 80);
        assert!(parse_stream_event("STREAM 1 NEW").is_err());
        assert!(parse_stream_event("CIRC 1 BUILT").is_err());
    }

    #[test]
    fn test_parse_bootstrap() {
        let status =
            parse_bootstrap(r#"STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#)
                .unwrap();
        assert_eq!(status.progress, 100);
        assert_eq!(status.tag.as_deref(), Some("done"));
        assert_eq!(status.summary.as_deref(), Some("Done"));
        assert!(status.is_complete());

        let initial = parse_bootstrap("NOTICE BOOTSTRAP PROGRESS=45 TAG=loading_descriptors").unwrap();
        assert_eq!(initial.progress, 45);

        assert!(parse_bootstrap("STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED").is_none());
    }

    #[test]
    fn test_parse_event_dispatch() {
        assert!(matches!(
            parse_event("STREAM 1 NEW 0 a.onion:80"),
            Some(ControllerEvent::Stream(_))
        ));
        assert!(matches!(
            parse_event("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=10"),
            Some(ControllerEvent::Bootstrap(_))
        ));
        assert!(parse_event("CIRC 1 BUILT").is_none());
        assert!(parse_event("STREAM garbage").is_none());
    }
}
