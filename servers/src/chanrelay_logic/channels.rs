use std::fs;
use std::path::Path;

use super::config::ConfigError;

const LINK_PREFIX: &str = "https://t.me/";

/// Turns one `https://t.me/<handle>` line into `@<handle>`. Anything else
/// (blank lines, comments, other URLs) is ignored.
pub fn parse_channel_line(line: &str) -> Option<String> {
    let handle = line.trim().strip_prefix(LINK_PREFIX)?.trim_end_matches('/');
    if handle.is_empty() {
        return None;
    }
    Some(format!("@{}", handle))
}

pub fn parse_channels(content: &str) -> Vec<String> {
    content.lines().filter_map(parse_channel_line).collect()
}

pub fn load_channels_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ChannelsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let channels = parse_channels(&content);
    log::info!("Loaded {} channels from {}", channels.len(), path.display());
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_channel_links_are_kept() {
        let content = "https://t.me/CoinDeskGlobal\n\n# comment\n  https://t.me/WatcherGuru/  \nhttps://example.com/x\nhttps://t.me/\n";
        assert_eq!(parse_channels(content), vec!["@CoinDeskGlobal", "@WatcherGuru"]);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_channels_file(&dir.path().join("absent.txt")).unwrap_err();
        assert!(matches!(err, ConfigError::ChannelsFile { .. }));
    }
}
