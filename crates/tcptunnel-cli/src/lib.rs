//! Support code for the `tcptunnel` binary

pub mod config;

use tcptunnel_client::SupervisorExit;

/// Process exit code for a finished client
pub fn exit_code(exit: &SupervisorExit) -> i32 {
    match exit {
        SupervisorExit::Shutdown => 0,
        SupervisorExit::VerifyFailed => 1,
        SupervisorExit::NeverConnected { .. } | SupervisorExit::GaveUp { .. } => 2,
        SupervisorExit::Conflict => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&SupervisorExit::Shutdown), 0);
        assert_eq!(exit_code(&SupervisorExit::VerifyFailed), 1);
        assert_eq!(
            exit_code(&SupervisorExit::NeverConnected {
                error: "refused".to_string()
            }),
            2
        );
        assert_eq!(exit_code(&SupervisorExit::GaveUp { attempts: 3 }), 2);
        assert_eq!(exit_code(&SupervisorExit::Conflict), 3);
    }
}
