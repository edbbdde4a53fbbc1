use std::time::{Duration, SystemTime};

use meridian_common::error::{CommandError, MeridianError};

/// Per-request output rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Resp,
    Json,
}

/// A parsed client command: the raw argument vector plus request-scoped
/// output mode and deadline.
#[derive(Debug, Clone)]
pub struct Message {
    pub args: Vec<String>,
    pub output: OutputMode,
    pub deadline: Option<SystemTime>,
}

impl Message {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            output: OutputMode::Resp,
            deadline: None,
        }
    }

    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        Self::new(args.iter().map(|a| a.as_ref().to_string()).collect())
    }

    /// The command name, lowercased. Empty for an empty argument vector.
    pub fn command(&self) -> String {
        self.args.first().map(|a| a.to_lowercase()).unwrap_or_default()
    }

    /// Rewrite a `TIMEOUT seconds cmd args…` prefix in place: strips the
    /// prefix and tightens the message deadline.
    pub fn rewrite_timeout_prefix(&mut self) -> Result<(), MeridianError> {
        if self.command() != "timeout" {
            return Ok(());
        }
        if self.args.len() < 3 {
            return Err(CommandError::InvalidArgCount.into());
        }
        let seconds: f64 = self.args[1]
            .parse()
            .ok()
            .filter(|s: &f64| *s >= 0.0 && s.is_finite())
            .ok_or_else(|| CommandError::InvalidArg(self.args[1].clone()))?;
        let deadline = SystemTime::now() + Duration::from_secs_f64(seconds);
        self.args.drain(0..2);
        self.deadline = Some(match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lowercases() {
        let msg = Message::from_args(&["SET", "fleet", "truck1"]);
        assert_eq!(msg.command(), "set");
    }

    #[test]
    fn test_timeout_prefix_rewrites_args_and_deadline() {
        let mut msg = Message::from_args(&["TIMEOUT", "1.5", "SCAN", "fleet"]);
        msg.rewrite_timeout_prefix().unwrap();
        assert_eq!(msg.command(), "scan");
        assert_eq!(msg.args, vec!["SCAN", "fleet"]);
        let deadline = msg.deadline.expect("deadline set");
        let until = deadline.duration_since(SystemTime::now()).unwrap();
        assert!(until <= Duration::from_secs_f64(1.5));
        assert!(until > Duration::from_millis(500));
    }

    #[test]
    fn test_timeout_prefix_keeps_tighter_existing_deadline() {
        let near = SystemTime::now() + Duration::from_millis(100);
        let mut msg = Message::from_args(&["TIMEOUT", "60", "GET", "k", "i"]);
        msg.deadline = Some(near);
        msg.rewrite_timeout_prefix().unwrap();
        assert_eq!(msg.deadline, Some(near));
    }

    #[test]
    fn test_timeout_prefix_rejects_bad_seconds() {
        let mut msg = Message::from_args(&["TIMEOUT", "-3", "GET", "k", "i"]);
        assert!(msg.rewrite_timeout_prefix().is_err());
        let mut msg = Message::from_args(&["TIMEOUT", "abc", "GET", "k", "i"]);
        assert!(msg.rewrite_timeout_prefix().is_err());
    }

    #[test]
    fn test_non_timeout_message_untouched() {
        let mut msg = Message::from_args(&["GET", "k", "i"]);
        msg.rewrite_timeout_prefix().unwrap();
        assert_eq!(msg.args, vec!["GET", "k", "i"]);
        assert!(msg.deadline.is_none());
    }
}
