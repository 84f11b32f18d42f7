use crate::status::Status;
use crate::status_code::status_code_t;

/// The standard result type used throughout the workspace, with `Status` as the error.
pub type Result<T> = std::result::Result<T, Status>;

/// Create an error result from a status code.
pub fn make_error<T>(code: status_code_t) -> Result<T> {
    Err(Status::new(code))
}

/// Create an error result from a status code and message.
pub fn make_error_msg<T>(code: status_code_t, msg: impl Into<String>) -> Result<T> {
    Err(Status::with_message(code, msg))
}

/// Collects the outcome of a sequence of best-effort steps.
///
/// Every step is recorded regardless of earlier failures; only the first
/// failure is kept and reported by [`FirstError::finish`].
#[derive(Debug, Default)]
pub struct FirstError {
    first: Option<Status>,
    failures: usize,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one step.
    pub fn record<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.failures += 1;
                if self.first.is_none() {
                    self.first = Some(e);
                }
                None
            }
        }
    }

    /// Number of failed steps recorded so far.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn is_ok(&self) -> bool {
        self.first.is_none()
    }

    /// `Ok(())` when every step succeeded, otherwise the first failure.
    pub fn finish(self) -> Result<()> {
        match self.first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
