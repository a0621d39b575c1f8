//! Core types shared by the broker, its plugins and the controller backends

use crate::isolation::IsolationAttributes;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Keyword carrying the controller's session generation
pub const NYM_EPOCH_KEY: &str = "NYM_EPOCH";

/// Status code of a `RESOLVED` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveStatus {
    Success,
    GenericFailure,
    UnrecognizedSuffix,
    NotRegistered,
    Timeout,
    /// A code outside the protocol's table; treated as a terminal failure
    Other(u32),
}

impl ResolveStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::GenericFailure,
            2 => Self::UnrecognizedSuffix,
            3 => Self::NotRegistered,
            4 => Self::Timeout,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::GenericFailure => 1,
            Self::UnrecognizedSuffix => 2,
            Self::NotRegistered => 3,
            Self::Timeout => 4,
            Self::Other(code) => code,
        }
    }

    /// Generic failures and plugin-side timeouts are retried within the query window
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::GenericFailure | Self::Timeout)
    }
}

impl fmt::Display for ResolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "the name resolution was successful"),
            Self::GenericFailure => write!(f, "name resolution generic failure"),
            Self::UnrecognizedSuffix => write!(f, "name tld not recognized"),
            Self::NotRegistered => write!(f, "name not registered"),
            Self::Timeout => write!(f, "name resolution timeout exceeded"),
            Self::Other(code) => write!(f, "unknown resolution status {}", code),
        }
    }
}

/// Reason attached to a `CLOSESTREAM` command (relay end reasons)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Misc,
    ResolveFailed,
}

impl CloseReason {
    pub fn code(self) -> u8 {
        match self {
            Self::Misc => 1,
            Self::ResolveFailed => 2,
        }
    }
}

/// Stream status as reported by `STREAM` events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    New,
    NewResolve,
    Remap,
    SentConnect,
    SentResolve,
    Succeeded,
    Failed,
    Closed,
    Detached,
    ControllerWait,
    Other(String),
}

impl StreamStatus {
    /// The stream is gone and any work done on its behalf can be dropped
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl FromStr for StreamStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => Self::New,
            "NEWRESOLVE" => Self::NewResolve,
            "REMAP" => Self::Remap,
            "SENTCONNECT" => Self::SentConnect,
            "SENTRESOLVE" => Self::SentResolve,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            "DETACHED" => Self::Detached,
            "CONTROLLER_WAIT" => Self::ControllerWait,
            other => Self::Other(other.to_string()),
        })
    }
}

/// Why the client opened the stream (`PURPOSE=` keyword)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPurpose {
    DirFetch,
    DirUpload,
    DnsRequest,
    DirportTest,
    User,
    Other(String),
}

impl FromStr for StreamPurpose {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "DIR_FETCH" => Self::DirFetch,
            "DIR_UPLOAD" => Self::DirUpload,
            "DNS_REQUEST" => Self::DnsRequest,
            "DIRPORT_TEST" => Self::DirportTest,
            "USER" => Self::User,
            other => Self::Other(other.to_string()),
        })
    }
}

/// One stream lifecycle notification from the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Controller-assigned stream id
    pub id: String,

    pub status: StreamStatus,

    /// Circuit the stream is attached to, `0` when unattached
    pub circuit_id: String,

    /// Requested destination host
    pub target_address: String,

    pub target_port: u16,

    pub source_address: Option<String>,

    pub source_port: Option<u16>,

    pub purpose: Option<StreamPurpose>,

    /// All `KEY=value` arguments of the event, verbatim
    pub keyword_args: BTreeMap<String, String>,
}

impl StreamEvent {
    /// Create an event with no source, purpose or keyword arguments
    pub fn new(
        id: impl Into<String>,
        status: StreamStatus,
        target_address: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            status,
            circuit_id: "0".to_string(),
            target_address: target_address.into(),
            target_port,
            source_address: None,
            source_port: None,
            purpose: None,
            keyword_args: BTreeMap::new(),
        }
    }

    pub fn with_source(mut self, address: impl Into<String>, port: u16) -> Self {
        self.source_address = Some(address.into());
        self.source_port = Some(port);
        self
    }

    pub fn with_purpose(mut self, purpose: StreamPurpose) -> Self {
        self.purpose = Some(purpose);
        self
    }

    pub fn with_keyword(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keyword_args.insert(key.into(), value.into());
        self
    }

    /// Session generation reported with the event, if the controller sends one
    pub fn nym_epoch(&self) -> Option<&str> {
        self.keyword_args.get(NYM_EPOCH_KEY).map(String::as_str)
    }

    /// Keyword arguments plus the four derived client/destination fields
    pub fn isolation_attributes(&self) -> IsolationAttributes {
        let mut attrs = self.keyword_args.clone();
        attrs.insert(
            "CLIENTADDR".to_string(),
            self.source_address.clone().unwrap_or_default(),
        );
        attrs.insert(
            "CLIENTPORT".to_string(),
            self.source_port.map(|p| p.to_string()).unwrap_or_default(),
        );
        attrs.insert("DESTADDR".to_string(), self.target_address.clone());
        attrs.insert("DESTPORT".to_string(), self.target_port.to_string());
        attrs
    }
}

/// Controller software version, compared component-wise
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TorVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
    pub patch: u32,
}

impl TorVersion {
    /// First release that reports `CONTROLLER_WAIT` for unattached streams
    pub const CONTROLLER_WAIT: TorVersion = TorVersion::new(0, 4, 5, 1);

    pub const fn new(major: u32, minor: u32, micro: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            micro,
            patch,
        }
    }

    pub fn supports_controller_wait(&self) -> bool {
        *self >= Self::CONTROLLER_WAIT
    }
}

impl FromStr for TorVersion {
    type Err = String;

    /// Parses `0.4.8.9`, `0.4.5.1-alpha` or `0.4.8.9 (git-abcdef)`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let head = s.split_whitespace().next().unwrap_or("");
        let numeric = head.split('-').next().unwrap_or("");
        let mut parts = [0u32; 4];
        let mut count = 0;
        for (slot, piece) in parts.iter_mut().zip(numeric.split('.')) {
            *slot = piece
                .parse()
                .map_err(|_| format!("invalid version component '{}' in '{}'", piece, s))?;
            count += 1;
        }
        if count < 2 {
            return Err(format!("invalid version '{}'", s));
        }
        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl fmt::Display for TorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.micro, self.patch)
    }
}

/// Bootstrap progress reported by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStatus {
    /// Percentage, 0–100
    pub progress: u8,
    pub tag: Option<String>,
    pub summary: Option<String>,
}

impl BootstrapStatus {
    pub fn is_complete(&self) -> bool {
        self.progress >= 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_status_codes() {
        for code in 0..6 {
            assert_eq!(ResolveStatus::from_code(code).code(), code);
        }
        assert_eq!(ResolveStatus::from_code(9), ResolveStatus::Other(9));
    }

    #[test]
    fn test_resolve_status_retryable() {
        assert!(ResolveStatus::GenericFailure.is_retryable());
        assert!(ResolveStatus::Timeout.is_retryable());
        assert!(!ResolveStatus::Success.is_retryable());
        assert!(!ResolveStatus::NotRegistered.is_retryable());
        assert!(!ResolveStatus::UnrecognizedSuffix.is_retryable());
        assert!(!ResolveStatus::Other(7).is_retryable());
    }

    #[test]
    fn test_stream_status_parse() {
        assert_eq!("CONTROLLER_WAIT".parse::<StreamStatus>().unwrap(), StreamStatus::ControllerWait);
        assert_eq!("NEWRESOLVE".parse::<StreamStatus>().unwrap(), StreamStatus::NewResolve);
        assert_eq!(
            "XOFF_SENT".parse::<StreamStatus>().unwrap(),
            StreamStatus::Other("XOFF_SENT".to_string())
        );
        assert!(StreamStatus::Closed.is_terminal());
        assert!(StreamStatus::Failed.is_terminal());
        assert!(!StreamStatus::Detached.is_terminal());
    }

    #[test]
    fn test_isolation_attributes_include_derived_fields() {
        let event = StreamEvent::new("7", StreamStatus::ControllerWait, "foo.pet.onion", 443)
            .with_source("127.0.0.1", 51000)
            .with_keyword("SOCKS_USERNAME", "alice");

        let attrs = event.isolation_attributes();
        assert_eq!(attrs["SOCKS_USERNAME"], "alice");
        assert_eq!(attrs["CLIENTADDR"], "127.0.0.1");
        assert_eq!(attrs["CLIENTPORT"], "51000");
        assert_eq!(attrs["DESTADDR"], "foo.pet.onion");
        assert_eq!(attrs["DESTPORT"], "443");
    }

    #[test]
    fn test_isolation_attributes_without_source() {
        let event = StreamEvent::new("7", StreamStatus::ControllerWait, "a.onion", 80);
        let attrs = event.isolation_attributes();
        assert_eq!(attrs["CLIENTADDR"], "");
        assert_eq!(attrs["CLIENTPORT"], "");
    }

    #[test]
    fn test_tor_version_parse() {
        let v: TorVersion = "0.4.8.9 (git-8a3f2bd1)".parse().unwrap();
        assert_eq!(v, TorVersion::new(0, 4, 8, 9));
        let v: TorVersion = "0.4.5.1-alpha".parse().unwrap();
        assert_eq!(v, TorVersion::CONTROLLER_WAIT);
        assert!("garbage".parse::<TorVersion>().is_err());
    }

    #[test]
    fn test_tor_version_controller_wait() {
        assert!(TorVersion::new(0, 4, 5, 1).supports_controller_wait());
        assert!(TorVersion::new(0, 4, 8, 0).supports_controller_wait());
        assert!(!TorVersion::new(0, 4, 4, 9).supports_controller_wait());
        assert!(!TorVersion::new(0, 3, 5, 17).supports_controller_wait());
    }
}
