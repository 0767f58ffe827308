//! Tracing setup for host and plugin processes.
//!
//! Plugins write JSON lines to stderr. The host reads each line back and
//! re-emits it through its own subscriber at the level the plugin used.

use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Compact human-readable output for host binaries. Honors `RUST_LOG`.
pub fn init_host_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().try_init();
}

/// JSON lines on stderr for plugin binaries. stdout is reserved for the handshake.
pub fn init_plugin_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// A plugin log line decoded from the JSON formatter's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginLogLine {
    pub level: tracing::Level,
    pub target: Option<String>,
    pub message: String,
    /// Remaining structured fields, rendered as JSON.
    pub fields: Option<String>,
}

impl PluginLogLine {
    /// `None` when the line is not a JSON log record.
    pub fn parse(line: &str) -> Option<Self> {
        let Value::Object(mut record) = serde_json::from_str::<Value>(line).ok()? else {
            return None;
        };
        let level = match record.get("level")?.as_str()?.to_ascii_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => return None,
        };
        let target = record.remove("target").and_then(|t| t.as_str().map(str::to_string));
        let mut fields = match record.remove("fields") {
            Some(Value::Object(fields)) => fields,
            _ => serde_json::Map::new(),
        };
        let message = match fields.remove("message") {
            Some(Value::String(m)) => m,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let fields = (!fields.is_empty()).then(|| Value::Object(fields).to_string());
        Some(Self {
            level,
            target,
            message,
            fields,
        })
    }
}

/// Re-emit one stderr line from `plugin` through the host subscriber.
pub fn forward_plugin_line(plugin: &str, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }
    let Some(record) = PluginLogLine::parse(line) else {
        debug!(plugin, "{line}");
        return;
    };
    let target = record.target.as_deref().unwrap_or("");
    let fields = record.fields.as_deref().unwrap_or("");
    let message = record.message.as_str();
    match record.level {
        tracing::Level::TRACE => trace!(plugin, plugin_target = target, fields, "{message}"),
        tracing::Level::DEBUG => debug!(plugin, plugin_target = target, fields, "{message}"),
        tracing::Level::INFO => info!(plugin, plugin_target = target, fields, "{message}"),
        tracing::Level::WARN => warn!(plugin, plugin_target = target, fields, "{message}"),
        tracing::Level::ERROR => error!(plugin, plugin_target = target, fields, "{message}"),
    }
}

/// Forward every line of `reader` until it closes.
pub async fn forward_plugin_output<R>(plugin: String, reader: R)
where R: AsyncRead + Unpin {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => forward_plugin_line(&plugin, &line),
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %plugin, error = %e, "plugin log stream failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_record() {
        let line = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"WARN","fields":{"message":"storage slow","key":"kv/foo"},"target":"mock"}"#;
        let record = PluginLogLine::parse(line).unwrap();
        assert_eq!(record.level, tracing::Level::WARN);
        assert_eq!(record.target.as_deref(), Some("mock"));
        assert_eq!(record.message, "storage slow");
        assert_eq!(record.fields.as_deref(), Some(r#"{"key":"kv/foo"}"#));
    }

    #[test]
    fn test_parse_rejects_plain_text() {
        assert!(PluginLogLine::parse("panic: something broke").is_none());
        assert!(PluginLogLine::parse(r#"{"level":"LOUD"}"#).is_none());
        assert!(PluginLogLine::parse("[1,2]").is_none());
    }

    #[tokio::test]
    async fn test_forward_until_eof() {
        let input: &[u8] = b"{\"level\":\"INFO\",\"fields\":{\"message\":\"hi\"}}\nplain line\n";
        forward_plugin_output("mock".to_string(), input).await;
    }
}
