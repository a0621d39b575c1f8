//! Plugin wire protocol
//!
//! Plain UTF-8, one message per line, whitespace-separated fields:
//!
//! ```text
//! plugin → broker   INIT <major> <minor>
//! broker → plugin   RESOLVE <query-id> <name> <isolation-token>
//! plugin → broker   RESOLVED <query-id> <status> <answer...>
//! broker → plugin   CANCEL <query-id>
//! plugin → broker   CANCELED <query-id>
//! ```

use crate::error::BrokerError;
use crate::types::ResolveStatus;
use std::fmt;
use std::str::FromStr;

/// Protocol version advertised to plugins through `TOR_NS_PROTO_VERSION`
pub const PROTOCOL_VERSION: &str = "1";

/// Major version this broker speaks
pub const PROTOCOL_MAJOR: u32 = 1;

/// A message sent from the broker to a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginRequest {
    Resolve {
        query_id: u64,
        name: String,
        isolation_token: String,
    },
    Cancel {
        query_id: u64,
    },
}

/// A message sent from a plugin to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginResponse {
    Init {
        major: u32,
        minor: u32,
    },
    Resolved {
        query_id: u64,
        status: ResolveStatus,
        /// Answer tokens; only the first is meaningful on success
        answer: Vec<String>,
    },
    Canceled {
        query_id: u64,
    },
}

impl PluginRequest {
    /// Build a `RESOLVE` request, refusing fields that would break line framing
    pub fn resolve(
        query_id: u64,
        name: impl Into<String>,
        isolation_token: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let name = name.into();
        let isolation_token = isolation_token.into();
        for (field, value) in [("name", &name), ("isolation token", &isolation_token)] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(BrokerError::PluginProtocol(format!(
                    "{} '{}' is not a single token",
                    field, value
                )));
            }
        }
        Ok(Self::Resolve {
            query_id,
            name,
            isolation_token,
        })
    }
}

impl PluginResponse {
    /// The answer's first token on success
    pub fn resolved_value(&self) -> Option<&str> {
        match self {
            Self::Resolved {
                status: ResolveStatus::Success,
                answer,
                ..
            } => answer.first().map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for PluginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve {
                query_id,
                name,
                isolation_token,
            } => write!(f, "RESOLVE {} {} {}", query_id, name, isolation_token),
            Self::Cancel { query_id } => write!(f, "CANCEL {}", query_id),
        }
    }
}

impl fmt::Display for PluginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init { major, minor } => write!(f, "INIT {} {}", major, minor),
            Self::Resolved {
                query_id,
                status,
                answer,
            } => {
                write!(f, "RESOLVED {} {}", query_id, status.code())?;
                for token in answer {
                    write!(f, " {}", token)?;
                }
                Ok(())
            }
            Self::Canceled { query_id } => write!(f, "CANCELED {}", query_id),
        }
    }
}

fn parse_field<T: FromStr>(fields: &[&str], index: usize, what: &str, line: &str) -> Result<T, BrokerError> {
    fields
        .get(index)
        .ok_or_else(|| BrokerError::PluginProtocol(format!("missing {} in '{}'", what, line)))?
        .parse()
        .map_err(|_| BrokerError::PluginProtocol(format!("invalid {} in '{}'", what, line)))
}

impl FromStr for PluginRequest {
    type Err = BrokerError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.first().copied() {
            Some("RESOLVE") => {
                let query_id = parse_field(&fields, 1, "query id", line)?;
                let name: String = parse_field(&fields, 2, "name", line)?;
                // Older plugins talk to brokers that omit the isolation token
                let isolation_token = fields.get(3).copied().unwrap_or("").to_string();
                Ok(Self::Resolve {
                    query_id,
                    name,
                    isolation_token,
                })
            }
            Some("CANCEL") => Ok(Self::Cancel {
                query_id: parse_field(&fields, 1, "query id", line)?,
            }),
            Some(other) => Err(BrokerError::PluginProtocol(format!(
                "unknown request '{}'",
                other
            ))),
            None => Err(BrokerError::PluginProtocol("empty line".to_string())),
        }
    }
}

impl FromStr for PluginResponse {
    type Err = BrokerError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.first().copied() {
            Some("INIT") => Ok(Self::Init {
                major: parse_field(&fields, 1, "major version", line)?,
                minor: parse_field(&fields, 2, "minor version", line)?,
            }),
            Some("RESOLVED") => {
                let query_id = parse_field(&fields, 1, "query id", line)?;
                let code: u32 = parse_field(&fields, 2, "status", line)?;
                Ok(Self::Resolved {
                    query_id,
                    status: ResolveStatus::from_code(code),
                    answer: fields[3..].iter().map(|s| s.to_string()).collect(),
                })
            }
            Some("CANCELED") => Ok(Self::Canceled {
                query_id: parse_field(&fields, 1, "query id", line)?,
            }),
            Some(other) => Err(BrokerError::PluginProtocol(format!(
                "unknown response '{}'",
                other
            ))),
            None => Err(BrokerError::PluginProtocol("empty line".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_line_format() {
        let req = PluginRequest::resolve(3, "foo.pet.onion", "abc-1").unwrap();
        assert_eq!(req.to_string(), "RESOLVE 3 foo.pet.onion abc-1");
        assert_eq!(PluginRequest::Cancel { query_id: 3 }.to_string(), "CANCEL 3");
    }

    #[test]
    fn test_resolve_rejects_whitespace() {
        assert!(PluginRequest::resolve(1, "foo bar.onion", "t").is_err());
        assert!(PluginRequest::resolve(1, "foo.onion", "").is_err());
        assert!(PluginRequest::resolve(1, "", "t").is_err());
    }

    #[test]
    fn test_parse_resolved_success() {
        let resp: PluginResponse = "RESOLVED 12 0 bar.onion extra info".parse().unwrap();
        assert_eq!(resp.resolved_value(), Some("bar.onion"));
        match resp {
            PluginResponse::Resolved { query_id, status, answer } => {
                assert_eq!(query_id, 12);
                assert_eq!(status, ResolveStatus::Success);
                assert_eq!(answer.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_resolved_failure_without_answer() {
        let resp: PluginResponse = "RESOLVED 5 3".parse().unwrap();
        assert_eq!(resp.resolved_value(), None);
        assert_eq!(
            resp,
            PluginResponse::Resolved {
                query_id: 5,
                status: ResolveStatus::NotRegistered,
                answer: vec![],
            }
        );
    }

    #[test]
    fn test_parse_init_and_canceled() {
        assert_eq!(
            "INIT 1 0".parse::<PluginResponse>().unwrap(),
            PluginResponse::Init { major: 1, minor: 0 }
        );
        assert_eq!(
            "CANCELED 9\n".parse::<PluginResponse>().unwrap(),
            PluginResponse::Canceled { query_id: 9 }
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!("".parse::<PluginResponse>().is_err());
        assert!("HELLO world".parse::<PluginResponse>().is_err());
        assert!("RESOLVED x 0 a.onion".parse::<PluginResponse>().is_err());
        assert!("RESOLVED 1".parse::<PluginResponse>().is_err());
        assert!("INIT one".parse::<PluginResponse>().is_err());
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(
            "RESOLVE 4 a.pet.onion tok".parse::<PluginRequest>().unwrap(),
            PluginRequest::Resolve {
                query_id: 4,
                name: "a.pet.onion".to_string(),
                isolation_token: "tok".to_string(),
            }
        );
        assert_eq!(
            "CANCEL 4".parse::<PluginRequest>().unwrap(),
            PluginRequest::Cancel { query_id: 4 }
        );
        assert!("RESOLVE".parse::<PluginRequest>().is_err());
    }

    #[test]
    fn test_response_display_matches_wire() {
        let resp = PluginResponse::Resolved {
            query_id: 2,
            status: ResolveStatus::NotRegistered,
            answer: vec!["x.pet.onion".to_string()],
        };
        assert_eq!(resp.to_string(), "RESOLVED 2 3 x.pet.onion");
        assert_eq!(PluginResponse::Init { major: 1, minor: 0 }.to_string(), "INIT 1 0");
    }
}
