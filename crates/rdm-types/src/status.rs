use std::fmt;

use crate::status_code::{self, status_code_t, StatusCode, StatusCodeType};

/// Error value of every fallible operation: a numeric code plus an optional
/// human-readable detail.
///
/// Display renders the code name, the number and the detail, e.g.
/// `CM::HostUnreachable(2101) resolve route: ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: Option<String>,
}

impl Status {
    pub fn new(code: status_code_t) -> Self {
        Self::from(code)
    }

    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        let message = Some(msg.into()).filter(|m| !m.is_empty());
        Self { code, message }
    }

    pub fn code(&self) -> status_code_t {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// Range the code belongs to.
    pub fn code_type(&self) -> StatusCodeType {
        status_code::type_of(self.code)
    }

    /// Prefix the detail with `what`, keeping the code.
    pub fn context(self, what: impl fmt::Display) -> Self {
        let message = match self.message {
            Some(m) => format!("{}: {}", what, m),
            None => what.to_string(),
        };
        Self {
            code: self.code,
            message: Some(message),
        }
    }

    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", status_code::to_string(self.code), self.code)?;
        if let Some(msg) = &self.message {
            write!(f, " {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

impl From<status_code_t> for Status {
    fn from(code: status_code_t) -> Self {
        Self {
            code,
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code::CmCode;

    #[test]
    fn test_ok_status() {
        let s = Status::new(StatusCode::OK);
        assert!(s.is_ok());
        assert!(s.message().is_none());
        assert_eq!(s.describe(), "OK(0)");
        assert_eq!(s.code_type(), StatusCodeType::Common);
    }

    #[test]
    fn test_cm_status_display() {
        let s = Status::with_message(CmCode::LOCAL_IO, "ibv_dereg_mr failed");
        assert!(!s.is_ok());
        assert_eq!(s.code(), 2105);
        assert_eq!(s.code_type(), StatusCodeType::Cm);
        assert_eq!(s.to_string(), "CM::LocalIO(2105) ibv_dereg_mr failed");
        assert_eq!(
            Status::new(CmCode::CONNECTION_ABORTED).to_string(),
            "CM::ConnectionAborted(2104)"
        );
    }

    #[test]
    fn test_empty_message_is_none() {
        let s = Status::with_message(StatusCode::INVALID_ARG, "");
        assert!(s.message().is_none());
        let s: Status = StatusCode::INVALID_ARG.into();
        assert_eq!(s.code(), 3);
    }

    #[test]
    fn test_context_prefixes_detail() {
        let s = Status::with_message(CmCode::HOST_UNREACHABLE, "no route")
            .context("connection to 10.0.0.2:7000");
        assert_eq!(s.code(), CmCode::HOST_UNREACHABLE);
        assert_eq!(s.message(), Some("connection to 10.0.0.2:7000: no route"));
        let bare = Status::new(CmCode::LOCAL_IO).context("close");
        assert_eq!(bare.message(), Some("close"));
    }

    #[test]
    fn test_status_as_error() {
        let e: Box<dyn std::error::Error + Send + Sync> =
            Box::new(Status::new(StatusCode::UNKNOWN));
        assert!(e.to_string().starts_with("Unknown(999)"));
    }
}
