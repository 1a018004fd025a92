//! Control-protocol reply framing.
//!
//! A reply is a run of lines sharing one status code. `NNN-` continues the
//! reply, `NNN+` opens a data block terminated by a lone `.`, and `NNN `
//! ends it. Status `650` marks an asynchronous event.

use crate::error::{ControlError, ControlResult};

/// Status code of asynchronous event notifications.
pub const EVENT_CODE: u16 = 650;

/// One logical line of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Text after the status code and separator
    pub text: String,
    /// Payload of a `NNN+` data block, lines joined with `\n`
    pub data: Option<String>,
}

/// A complete reply (or event) from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// 2xx replies.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_event(&self) -> bool {
        self.code == EVENT_CODE
    }

    /// Text of the first line, or empty.
    pub fn first_text(&self) -> &str {
        self.lines.first().map(|l| l.text.as_str()).unwrap_or("")
    }

    /// All line texts joined, for error messages.
    pub fn message(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Look up a `key=value` pair in a GETINFO reply.
    ///
    /// Multi-line values come from the data block of a `NNN+key=` line.
    pub fn info(&self, key: &str) -> Option<String> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.text.split_once('=')?;
            if k != key {
                return None;
            }
            Some(match &line.data {
                Some(data) => data.clone(),
                None => v.to_string(),
            })
        })
    }
}

/// Incremental reply assembler, fed one line at a time.
#[derive(Debug, Default)]
pub struct ReplyParser {
    code: Option<u16>,
    lines: Vec<ReplyLine>,
    block: Option<(String, Vec<String>)>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without or with trailing CRLF).
    ///
    /// Returns the reply once its end line has been seen.
    pub fn push_line(&mut self, raw: &str) -> ControlResult<Option<Reply>> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if let Some((text, mut data)) = self.block.take() {
            if line == "." {
                self.lines.push(ReplyLine {
                    text,
                    data: Some(data.join("\n")),
                });
            } else {
                let payload = if line.starts_with("..") {
                    &line[1..]
                } else {
                    line
                };
                data.push(payload.to_string());
                self.block = Some((text, data));
            }
            return Ok(None);
        }

        if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            return Err(ControlError::Protocol(format!("short line: {line:?}")));
        }
        let code: u16 = line[..3]
            .parse()
            .map_err(|_| ControlError::Protocol(format!("bad status code: {line:?}")))?;
        if let Some(expected) = self.code {
            if expected != code {
                return Err(ControlError::Protocol(format!(
                    "status changed mid-reply from {expected} to {code}"
                )));
            }
        }
        self.code = Some(code);

        let text = line[4..].to_string();
        match &line[3..4] {
            "-" => {
                self.lines.push(ReplyLine { text, data: None });
                Ok(None)
            }
            "+" => {
                self.block = Some((text, Vec::new()));
                Ok(None)
            }
            " " => {
                self.lines.push(ReplyLine { text, data: None });
                self.code = None;
                Ok(Some(Reply {
                    code,
                    lines: std::mem::take(&mut self.lines),
                }))
            }
            other => Err(ControlError::Protocol(format!(
                "unknown separator {other:?} in {line:?}"
            ))),
        }
    }

    /// Discard any partially assembled reply.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
