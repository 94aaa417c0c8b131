use std::time::Duration;

use thiserror::Error;

use crate::invocation::InvocationScope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("failed to launch worker '{program}': {reason}")]
    LaunchFailure { program: String, reason: String },
    #[error("worker did not finish within {}s and was stopped", .0.as_secs())]
    Timeout(Duration),
    #[error("worker exited unsuccessfully ({}): {detail}", exit_code_label(.code))]
    NonZeroExit { code: Option<i32>, detail: String },
    #[error("an invocation for {0} is already in flight")]
    InFlight(InvocationScope),
    #[error("worker invocation was cancelled")]
    Cancelled,
    #[error("worker i/o error: {0}")]
    Io(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::SupervisorError;

    #[test]
    fn non_zero_exit_message_is_actionable() {
        let error = SupervisorError::NonZeroExit {
            code: Some(2),
            detail: "template file not found".to_owned(),
        };
        assert_eq!(
            error.to_string(),
            "worker exited unsuccessfully (exit code 2): template file not found"
        );
    }
}
