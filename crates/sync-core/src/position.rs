//! Resumable change-stream position.

use serde::{Deserialize, Serialize};

/// Where a change stream instance has read up to.
///
/// `filename` names the log (a binlog file, or the audit table for
/// trigger-based capture) and `offset` the last consumed position inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    pub filename: String,
    pub offset: u64,
}

impl StreamPosition {
    pub fn new(filename: impl Into<String>, offset: u64) -> Self {
        Self {
            filename: filename.into(),
            offset,
        }
    }
}

impl std::fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.filename, self.offset)
    }
}

impl checkpoint::Checkpoint for StreamPosition {
    const DATABASE_TYPE: &'static str = "mysql-audit";

    fn to_cli_string(&self) -> String {
        self.to_string()
    }

    fn from_cli_string(s: &str) -> anyhow::Result<Self> {
        let (filename, offset) = s.rsplit_once(':').ok_or_else(|| {
            anyhow::anyhow!("Invalid stream position: expected 'filename:offset', got '{s}'")
        })?;
        if filename.is_empty() {
            anyhow::bail!("Invalid stream position: empty filename in '{s}'");
        }
        let offset = offset
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid stream position offset in '{s}': {e}"))?;
        Ok(Self::new(filename, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint::Checkpoint;

    #[test]
    fn test_cli_string_roundtrip() {
        let pos = StreamPosition::new("mysql-bin.000003", 1542);
        assert_eq!(pos.to_cli_string(), "mysql-bin.000003:1542");
        assert_eq!(StreamPosition::from_cli_string("mysql-bin.000003:1542").unwrap(), pos);
    }

    #[test]
    fn test_invalid_cli_strings() {
        assert!(StreamPosition::from_cli_string("no-offset").is_err());
        assert!(StreamPosition::from_cli_string(":12").is_err());
        assert!(StreamPosition::from_cli_string("file:-1").is_err());
    }
}
