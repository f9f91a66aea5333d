//! Alarm status and severity.

/// Alarm lifecycle status.
///
/// The two axes are independent: an alarm may be cleared before it is
/// acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmStatus {
    /// Raised and not yet acknowledged.
    ActiveUnack,
    /// Raised and acknowledged.
    ActiveAck,
    /// Cleared without acknowledgment.
    ClearedUnack,
    /// Cleared and acknowledged.
    ClearedAck,
}

impl AlarmStatus {
    /// True once the alarm has been acknowledged.
    pub fn is_ack(&self) -> bool {
        matches!(self, AlarmStatus::ActiveAck | AlarmStatus::ClearedAck)
    }

    /// True once the alarm has been cleared.
    pub fn is_cleared(&self) -> bool {
        matches!(self, AlarmStatus::ClearedUnack | AlarmStatus::ClearedAck)
    }

    /// Status after acknowledgment.
    pub fn acknowledged(self) -> Self {
        if self.is_cleared() {
            AlarmStatus::ClearedAck
        } else {
            AlarmStatus::ActiveAck
        }
    }

    /// Status after clearing. Clearing also acknowledges.
    pub fn cleared(self) -> Self {
        AlarmStatus::ClearedAck
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::ActiveUnack => "ACTIVE_UNACK",
            AlarmStatus::ActiveAck => "ACTIVE_ACK",
            AlarmStatus::ClearedUnack => "CLEARED_UNACK",
            AlarmStatus::ClearedAck => "CLEARED_ACK",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE_UNACK" => Some(AlarmStatus::ActiveUnack),
            "ACTIVE_ACK" => Some(AlarmStatus::ActiveAck),
            "CLEARED_UNACK" => Some(AlarmStatus::ClearedUnack),
            "CLEARED_ACK" => Some(AlarmStatus::ClearedAck),
            _ => None,
        }
    }
}

/// Alarm severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmSeverity {
    /// Critical.
    Critical,
    /// Major.
    Major,
    /// Minor.
    Minor,
    /// Warning.
    Warning,
    /// Indeterminate.
    Indeterminate,
}

impl AlarmSeverity {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmSeverity::Critical => "CRITICAL",
            AlarmSeverity::Major => "MAJOR",
            AlarmSeverity::Minor => "MINOR",
            AlarmSeverity::Warning => "WARNING",
            AlarmSeverity::Indeterminate => "INDETERMINATE",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRITICAL" => Some(AlarmSeverity::Critical),
            "MAJOR" => Some(AlarmSeverity::Major),
            "MINOR" => Some(AlarmSeverity::Minor),
            "WARNING" => Some(AlarmSeverity::Warning),
            "INDETERMINATE" => Some(AlarmSeverity::Indeterminate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_keeps_cleared_axis() {
        assert_eq!(AlarmStatus::ActiveUnack.acknowledged(), AlarmStatus::ActiveAck);
        assert_eq!(AlarmStatus::ClearedUnack.acknowledged(), AlarmStatus::ClearedAck);
    }

    #[test]
    fn clear_acknowledges() {
        assert_eq!(AlarmStatus::ActiveUnack.cleared(), AlarmStatus::ClearedAck);
        assert!(AlarmStatus::ClearedAck.is_ack());
    }

    #[test]
    fn names_parse_back() {
        for s in [
            AlarmStatus::ActiveUnack,
            AlarmStatus::ActiveAck,
            AlarmStatus::ClearedUnack,
            AlarmStatus::ClearedAck,
        ] {
            assert_eq!(AlarmStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(AlarmSeverity::parse("CRITICAL"), Some(AlarmSeverity::Critical));
        assert_eq!(AlarmSeverity::parse("critical"), None);
    }
}
