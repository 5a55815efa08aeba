//! Helpers shared across CLI commands.

use std::str::FromStr;

use crate::error::CliError;

/// A shard given on the command line as `ID=URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardArg {
    pub index: u32,
    pub url: String,
}

impl FromStr for ShardArg {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, url) = s
            .split_once('=')
            .ok_or_else(|| CliError::InvalidShard(format!("expected ID=URL, got '{}'", s)))?;
        let index = index
            .trim()
            .parse()
            .map_err(|e| CliError::InvalidShard(format!("bad shard id '{}': {}", index, e)))?;
        let url = url.trim();
        if url.is_empty() {
            return Err(CliError::InvalidShard(format!("missing URL for shard {}", index)));
        }
        Ok(Self {
            index,
            url: url.to_string(),
        })
    }
}

/// Formats a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shard() {
        let shard: ShardArg = "42=https://example.com/42.tar.lz4".parse().unwrap();
        assert_eq!(shard.index, 42);
        assert_eq!(shard.url, "https://example.com/42.tar.lz4");
    }

    #[test]
    fn test_url_may_contain_equals() {
        let shard: ShardArg = "7=https://example.com/get?id=7".parse().unwrap();
        assert_eq!(shard.index, 7);
        assert_eq!(shard.url, "https://example.com/get?id=7");
    }

    #[test]
    fn test_invalid_shards() {
        assert!("https://example.com/1".parse::<ShardArg>().is_err());
        assert!("x=https://example.com/1".parse::<ShardArg>().is_err());
        assert!("-1=https://example.com/1".parse::<ShardArg>().is_err());
        assert!("3=".parse::<ShardArg>().is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
