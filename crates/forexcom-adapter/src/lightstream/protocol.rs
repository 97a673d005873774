//! Lightstreamer text protocol: control requests and pushed lines
//!
//! # Control requests
//! URL-form-encoded bodies POSTed to the create/bind/control endpoints.
//! Parameters with empty values are never sent.
//!
//! # Push connection
//! ```text
//! OK                      <- or diagnostic text on failure
//! SessionId:S1a2b3c       <- session info, terminated by a blank line
//! ControlAddress:host
//!
//! PROBE                   <- keep-alive
//! 1,1|1.2345|1.2347|...   <- <table>,<item pos>|field|field|...
//! LOOP                    <- rebind required
//! ```

use std::fmt;

use crate::error::{Result, StreamError};

/// Endpoint creating a new session (opens a push connection)
pub const CREATE_SESSION_PATH: &str = "lightstreamer/create_session.txt";

/// Endpoint rebinding a push connection to an existing session
pub const BIND_SESSION_PATH: &str = "lightstreamer/bind_session.txt";

/// Endpoint for control requests (add/delete/destroy)
pub const CONTROL_PATH: &str = "lightstreamer/control.txt";

/// Client identifier sent on session creation
pub const CLIENT_ID: &str = "mgQkwtwdysogQz2BJ4Ji kOj2Bg";

/// Success keyword for create/bind/control responses
pub const OK_CMD: &str = "OK";

const PROBE_CMD: &str = "PROBE";
const END_CMD: &str = "END";
const LOOP_CMD: &str = "LOOP";
const ERROR_CMD: &str = "ERROR";
const SYNC_ERROR_CMD: &str = "SYNC ERROR";
const PREAMBLE: &str = "Preamble";

/// Subscription mode requested from the server
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    Merge,
    Distinct,
    Command,
    Raw,
}

impl SubscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Merge => "MERGE",
            SubscriptionMode::Distinct => "DISTINCT",
            SubscriptionMode::Command => "COMMAND",
            SubscriptionMode::Raw => "RAW",
        }
    }
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control request operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlOp {
    CreateSession,
    BindSession,
    Add,
    Delete,
    Destroy,
}

impl ControlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOp::CreateSession => "create",
            ControlOp::BindSession => "bind",
            ControlOp::Add => "add",
            ControlOp::Delete => "delete",
            ControlOp::Destroy => "destroy",
        }
    }
}

/// A control request body, ready to be form-encoded
#[derive(Clone, PartialEq, Eq)]
pub struct ControlRequest {
    op: ControlOp,
    params: Vec<(&'static str, String)>,
}

impl ControlRequest {
    fn new(op: ControlOp) -> Self {
        Self { op, params: Vec::new() }
    }

    fn param(mut self, key: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.params.retain(|(k, _)| *k != key);
            self.params.push((key, value));
        }
        self
    }

    /// `LS_op2=create` with adapter set and credentials
    pub fn create_session(adapter_set: &str, user: &str, password: &str) -> Self {
        Self::new(ControlOp::CreateSession)
            .param("LS_op2", "create")
            .param("LS_cid", CLIENT_ID)
            .param("LS_adapter_set", adapter_set)
            .param("LS_user", user)
            .param("LS_password", password)
    }

    pub fn bind_session(session_id: &str) -> Self {
        Self::new(ControlOp::BindSession).param("LS_session", session_id)
    }

    /// Add a table. Fields and items are space-joined as the server expects.
    pub fn add_subscription(
        table: u64,
        adapter: &str,
        mode: SubscriptionMode,
        fields: &[String],
        items: &[String],
    ) -> Self {
        Self::new(ControlOp::Add)
            .param("LS_table", table.to_string())
            .param("LS_op", ControlOp::Add.as_str())
            .param("LS_data_adapter", adapter)
            .param("LS_mode", mode.as_str())
            .param("LS_schema", fields.join(" "))
            .param("LS_id", items.join(" "))
    }

    pub fn delete_subscription(table: u64) -> Self {
        Self::new(ControlOp::Delete)
            .param("LS_table", table.to_string())
            .param("LS_op", ControlOp::Delete.as_str())
    }

    pub fn destroy_session() -> Self {
        Self::new(ControlOp::Destroy).param("LS_op", ControlOp::Destroy.as_str())
    }

    /// Attach the session id (control connections only)
    pub fn with_session(self, session_id: &str) -> Self {
        self.param("LS_session", session_id)
    }

    pub fn op(&self) -> ControlOp {
        self.op
    }

    pub fn params(&self) -> &[(&'static str, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    /// application/x-www-form-urlencoded body
    pub fn encode(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.params {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }
}

impl fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| (*k, if *k == "LS_password" { "[REDACTED]" } else { v.as_str() }))
            .collect();
        f.debug_struct("ControlRequest").field("op", &self.op).field("params", &params).finish()
    }
}

/// One line read from a push connection, after session info
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamLine<'a> {
    Blank,
    Ok,
    Probe,
    Loop,
    Preamble,
    Error(&'a str),
    SyncError,
    End(&'a str),
    Data(DataLine<'a>),
    /// Not a command and not `<table>,<rest>`
    Malformed(&'a str),
}

impl<'a> StreamLine<'a> {
    /// Classify a right-trimmed line
    pub fn parse(line: &'a str) -> Self {
        if line.trim().is_empty() {
            return StreamLine::Blank;
        }
        if line == PROBE_CMD {
            return StreamLine::Probe;
        }
        if line == OK_CMD {
            return StreamLine::Ok;
        }
        if line.starts_with(ERROR_CMD) {
            return StreamLine::Error(line[ERROR_CMD.len()..].trim());
        }
        if line.starts_with(LOOP_CMD) {
            return StreamLine::Loop;
        }
        if line.starts_with(SYNC_ERROR_CMD) {
            return StreamLine::SyncError;
        }
        if line.starts_with(END_CMD) {
            return StreamLine::End(line[END_CMD.len()..].trim());
        }
        if line.starts_with(PREAMBLE) {
            return StreamLine::Preamble;
        }

        match line.split_once(',') {
            Some((table, item_line)) => match table.trim().parse::<u64>() {
                Ok(table) => StreamLine::Data(DataLine { table, item_line }),
                Err(_) => StreamLine::Malformed(line),
            },
            None => StreamLine::Malformed(line),
        }
    }
}

/// `<table>,<item line>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataLine<'a> {
    pub table: u64,
    pub item_line: &'a str,
}

/// `<pos>|tok|tok|...` with the 1-based item position split off
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemLine<'a> {
    pub position: usize,
    pub tokens: Vec<&'a str>,
}

impl<'a> ItemLine<'a> {
    pub fn parse(item_line: &'a str) -> Result<Self> {
        let item_line = item_line.trim_end_matches(['\r', '\n']);
        let mut toks = item_line.split('|');
        let position = toks
            .next()
            .and_then(|p| p.trim().parse::<usize>().ok())
            .filter(|p| *p >= 1)
            .ok_or_else(|| StreamError::Malformed(item_line.to_string()))?;

        Ok(Self { position, tokens: toks.collect() })
    }

    /// Token for the field at `index`, empty when the line is short
    pub fn token(&self, index: usize) -> &'a str {
        self.tokens.get(index).copied().unwrap_or("")
    }
}

/// `key:value` session info line
pub fn parse_session_info(line: &str) -> Option<(&str, &str)> {
    line.split_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_session_params() {
        let req = ControlRequest::create_session("STREAMINGALL", "alice", "token");
        assert_eq!(req.get("LS_op2"), Some("create"));
        assert_eq!(req.get("LS_adapter_set"), Some("STREAMINGALL"));
        assert_eq!(req.get("LS_user"), Some("alice"));
        assert_eq!(req.get("LS_password"), Some("token"));
        assert_eq!(req.get("LS_cid"), Some(CLIENT_ID));
    }

    #[test]
    fn test_empty_params_are_skipped() {
        let req = ControlRequest::create_session("", "alice", "");
        assert_eq!(req.get("LS_adapter_set"), None);
        assert_eq!(req.get("LS_password"), None);
        assert!(!req.encode().contains("LS_password"));
    }

    #[test]
    fn test_add_subscription_encoding() {
        let req = ControlRequest::add_subscription(
            3,
            "PRICES",
            SubscriptionMode::Merge,
            &fields(&["Bid", "Offer"]),
            &fields(&["PRICE.400"]),
        )
        .with_session("S1");

        let body = req.encode();
        assert!(body.contains("LS_table=3"));
        assert!(body.contains("LS_op=add"));
        assert!(body.contains("LS_data_adapter=PRICES"));
        assert!(body.contains("LS_mode=MERGE"));
        assert!(body.contains("LS_schema=Bid+Offer"));
        assert!(body.contains("LS_id=PRICE.400"));
        assert!(body.contains("LS_session=S1"));
    }

    #[test]
    fn test_delete_and_destroy() {
        let del = ControlRequest::delete_subscription(7);
        assert_eq!(del.get("LS_table"), Some("7"));
        assert_eq!(del.get("LS_op"), Some("delete"));
        assert_eq!(ControlRequest::destroy_session().get("LS_op"), Some("destroy"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let req = ControlRequest::create_session("A", "alice", "hunter2");
        let debug_str = format!("{:?}", req);
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("alice"));
    }

    #[test]
    fn test_classify_commands() {
        assert_eq!(StreamLine::parse(""), StreamLine::Blank);
        assert_eq!(StreamLine::parse("PROBE"), StreamLine::Probe);
        assert_eq!(StreamLine::parse("OK"), StreamLine::Ok);
        assert_eq!(StreamLine::parse("LOOP 500"), StreamLine::Loop);
        assert_eq!(StreamLine::parse("SYNC ERROR"), StreamLine::SyncError);
        assert_eq!(StreamLine::parse("ERROR 21 bad"), StreamLine::Error("21 bad"));
        assert_eq!(StreamLine::parse("END 31"), StreamLine::End("31"));
        assert_eq!(StreamLine::parse("Preamble: padding"), StreamLine::Preamble);
    }

    #[test]
    fn test_classify_data_line() {
        match StreamLine::parse("12,1|100|0.5") {
            StreamLine::Data(data) => {
                assert_eq!(data.table, 12);
                assert_eq!(data.item_line, "1|100|0.5");
            }
            other => panic!("expected data line, got {:?}", other),
        }
        assert_eq!(StreamLine::parse("abc,1|2"), StreamLine::Malformed("abc,1|2"));
        assert_eq!(StreamLine::parse("garbage"), StreamLine::Malformed("garbage"));
    }

    #[test]
    fn test_item_line_tokens() {
        let item = ItemLine::parse("2|a||#").unwrap();
        assert_eq!(item.position, 2);
        assert_eq!(item.tokens, vec!["a", "", "#"]);
        assert_eq!(item.token(1), "");
        assert_eq!(item.token(10), "");

        assert!(ItemLine::parse("x|1").is_err());
        assert!(ItemLine::parse("0|1").is_err());
    }

    #[test]
    fn test_session_info() {
        assert_eq!(parse_session_info("SessionId:abc123"), Some(("SessionId", "abc123")));
        assert_eq!(
            parse_session_info("ControlAddress:alt.example.com:8080"),
            Some(("ControlAddress", "alt.example.com:8080"))
        );
        assert_eq!(parse_session_info("nocolon"), None);
    }
}
