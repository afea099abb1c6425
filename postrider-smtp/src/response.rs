//! SMTP response parsing.

use crate::error::{ClientError, Result};

/// A complete, possibly multi-line SMTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The three-digit reply code.
    pub code: u16,
    /// One entry per response line, code and separator stripped.
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All lines joined, the shape faults are recorded in.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    /// 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 354, the go-ahead after `DATA`.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code == 354
    }

    /// Whether an EHLO response advertises the given extension keyword.
    ///
    /// The first line is the server's greeting name, so only the lines after
    /// it are searched; matching is on the first token, case-insensitive.
    #[must_use]
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|token| token.eq_ignore_ascii_case(keyword))
        })
    }

    /// Tries to parse one complete response from the front of `buffer`.
    ///
    /// Returns the response and the bytes consumed, or `None` when the
    /// buffer does not yet hold a full response.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let text = std::str::from_utf8(buffer)?;

        let mut code = None;
        let mut lines = Vec::new();
        let mut consumed = 0;

        for line in text.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // incomplete trailing line
                return Ok(None);
            }
            consumed += line.len();
            let line = line.trim_end_matches(['\r', '\n']);

            let (line_code, last) = Self::parse_head(line)?;
            match code {
                None => code = Some(line_code),
                Some(first) if first != line_code => {
                    return Err(ClientError::Parse(format!(
                        "code changed mid-response: {first} then {line_code}"
                    )));
                }
                Some(_) => {}
            }
            lines.push(line.get(4..).unwrap_or_default().to_string());

            if last {
                let Some(code) = code else {
                    return Err(ClientError::Parse("empty response".to_string()));
                };
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }

    /// Splits `NNN<sep>` off a line, returning the code and whether the
    /// separator marks the final line (space or bare code) rather than a
    /// continuation (dash).
    fn parse_head(line: &str) -> Result<(u16, bool)> {
        let code = line
            .get(..3)
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| ClientError::Parse(format!("bad reply line: {line:?}")))?;

        match line.as_bytes().get(3) {
            None | Some(b' ') => Ok((code, true)),
            Some(b'-') => Ok((code, false)),
            Some(other) => Err(ClientError::Parse(format!(
                "bad separator {:?} in line {line:?}",
                char::from(*other)
            ))),
        }
    }
}
