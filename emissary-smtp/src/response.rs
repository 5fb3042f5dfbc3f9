//! SMTP reply parsing.

use crate::error::SessionError;

/// One line of a reply, `250-SIZE 1000` or `250 OK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// A space after the code marks the final line, a dash a continuation.
    pub is_last: bool,
    pub message: String,
}

impl ResponseLine {
    /// Parses a single line with its line terminator already removed.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::MalformedReply` if the line is not an SMTP reply.
    pub fn parse(line: &str) -> Result<Self, SessionError> {
        let code = line
            .get(..3)
            .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| SessionError::MalformedReply(line.to_string()))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(_) => return Err(SessionError::MalformedReply(line.to_string())),
        };

        Ok(Self {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }
}

/// A complete, possibly multi-line reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Assembles a reply from its parsed lines.
    ///
    /// # Errors
    ///
    /// Fails if there are no lines or if the lines disagree on the code.
    pub fn from_lines(lines: Vec<ResponseLine>) -> Result<Self, SessionError> {
        let code = lines
            .first()
            .map(|line| line.code)
            .ok_or_else(|| SessionError::MalformedReply(String::from("empty reply")))?;

        if let Some(stray) = lines.iter().find(|line| line.code != code) {
            return Err(SessionError::MalformedReply(format!(
                "code mismatch in multi-line reply: expected {code}, got {}",
                stray.code
            )));
        }

        Ok(Self::new(
            code,
            lines.into_iter().map(|line| line.message).collect(),
        ))
    }

    /// All lines joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }
}
