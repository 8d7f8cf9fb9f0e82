//! NNTP client subset: connection transport and tiered server pool.
//!
//! The wire protocol is the client subset the engine needs: request lines
//! end in CRLF, multi-line responses terminate on a lone `.`, and the
//! commands are `AUTHINFO USER/PASS`, `GROUP`, `BODY`, `QUIT`.

pub mod connection;
pub mod pool;

pub use connection::{Connection, ConnectionState};
pub use pool::ServerPool;

use crate::error::ConnectionError;

/// A parsed single-line NNTP response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Three-digit response code
    pub code: u16,
    /// Remainder of the line after the code
    pub text: String,
}

impl Response {
    /// Parse `"222 0 <id@host> body"` style response lines.
    pub fn parse(line: &str) -> Result<Self, ConnectionError> {
        let code_part = line.get(..3).unwrap_or("");
        let code: u16 = code_part
            .parse()
            .map_err(|_| ConnectionError::Protocol(format!("unparseable response: {line}")))?;
        let text = line.get(3..).unwrap_or("").trim_start().to_string();
        Ok(Self { code, text })
    }

    /// Greeting / generic success (200, 201) or auth accepted (281)
    pub fn is_success(&self) -> bool {
        matches!(self.code, 200 | 201 | 281)
    }

    /// 381: server wants AUTHINFO PASS next
    pub fn wants_password(&self) -> bool {
        self.code == 381
    }

    /// 400/500: server asks for a reconnect (shutting down, unknown command)
    pub fn wants_reconnect(&self) -> bool {
        matches!(self.code, 400 | 500)
    }

    /// 411/412: group missing or not selected
    pub fn is_group_error(&self) -> bool {
        matches!(self.code, 411 | 412)
    }

    /// 430: the server does not carry the requested article
    pub fn is_no_such_article(&self) -> bool {
        self.code == 430
    }

    /// 222: body follows
    pub fn is_body_follows(&self) -> bool {
        self.code == 222
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_and_text() {
        let r = Response::parse("222 0 <abc@def> body follows").unwrap();
        assert_eq!(r.code, 222);
        assert_eq!(r.text, "0 <abc@def> body follows");
        assert!(r.is_body_follows());
    }

    #[test]
    fn parses_bare_code() {
        let r = Response::parse("430").unwrap();
        assert_eq!(r.code, 430);
        assert!(r.is_no_such_article());
        assert!(r.text.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Response::parse("hello").is_err());
        assert!(Response::parse("").is_err());
        assert!(Response::parse("2x2 nope").is_err());
    }

    #[test]
    fn code_classification_matches_the_wire_contract() {
        assert!(Response::parse("200 ok").unwrap().is_success());
        assert!(Response::parse("201 ok no posting").unwrap().is_success());
        assert!(Response::parse("281 auth accepted").unwrap().is_success());
        assert!(Response::parse("381 pass required").unwrap().wants_password());
        assert!(Response::parse("400 going down").unwrap().wants_reconnect());
        assert!(Response::parse("500 what").unwrap().wants_reconnect());
        assert!(Response::parse("411 no such group").unwrap().is_group_error());
        assert!(Response::parse("412 no group selected").unwrap().is_group_error());
    }
}
