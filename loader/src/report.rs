// Account log and exit report
//
// Every externally visible outcome -- a channel operation, a
// validation verdict, a guest fault, a clean exit -- is recorded as one
// line in the account log before the process exits. This is the only
// persisted state the loader produces.

use crate::channel::ChannelDescriptor;
use crate::validator::ValidationVerdict;

#[derive(Debug, Clone)]
pub struct AccountLog {
    lines: Vec<String>,
}

impl AccountLog {
    pub fn new() -> Self {
        AccountLog { lines: Vec::new() }
    }

    pub fn record(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn record_channel(&mut self, channel: &ChannelDescriptor) {
        self.record(format!("channel {} ({}): {:?}", channel.alias, channel.uri, channel.kind));
    }

    pub fn record_validation(&mut self, verdict: ValidationVerdict) {
        self.record(format!("validation_state = {}", verdict as i32));
    }

    pub fn record_ok(&mut self) {
        self.record("OK");
    }

    pub fn record_fault(&mut self, classification: &str) {
        self.record(classification.to_string());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

impl Default for AccountLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;

    #[test]
    fn clean_exit_appends_ok_last() {
        let mut log = AccountLog::new();
        log.record_validation(ValidationVerdict::Pass);
        log.record_ok();
        assert_eq!(log.lines().last().unwrap(), "OK");
        assert!(log.lines()[0].contains("validation_state = 0"));
    }

    #[test]
    fn one_line_per_channel() {
        let mut log = AccountLog::new();
        let d = ChannelDescriptor {
            uri: "file:out".into(),
            alias: "/dev/stdout".into(),
            kind: ChannelType::SequentialWrite,
            tag: None,
            limits: Default::default(),
        };
        log.record_channel(&d);
        log.record_ok();
        assert_eq!(log.lines().len(), 2);
        assert!(log.lines()[0].contains("/dev/stdout"));
    }

    #[test]
    fn render_joins_with_newlines() {
        let mut log = AccountLog::new();
        log.record("a");
        log.record("b");
        assert_eq!(log.render(), "a\nb");
    }
}
