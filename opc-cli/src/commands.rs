//! Commands served through the async [`OpcProvider`] façade.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use opc_da_client::OpcProvider;
use opc_da_client::variant::{Value, VarType};

/// Seconds a provider call may take before the command gives up.
pub const OPC_TIMEOUT_SECS: u64 = 30;

async fn within_timeout<T>(what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(OPC_TIMEOUT_SECS), call)
        .await
        .map_err(|_| {
            tracing::error!("{what} timed out ({OPC_TIMEOUT_SECS}s)");
            anyhow!("{what} timed out ({OPC_TIMEOUT_SECS}s)")
        })?
}

pub async fn servers(provider: &dyn OpcProvider, host: &str, out: &mut impl Write) -> Result<()> {
    let servers = within_timeout("Server listing", provider.list_servers(host)).await?;
    if servers.is_empty() {
        writeln!(out, "No OPC DA servers found on {}", display_host(host))?;
    }
    for server in &servers {
        writeln!(out, "{server}")?;
    }
    tracing::info!(count = servers.len(), host, "servers listed");
    Ok(())
}

pub async fn browse(
    provider: &dyn OpcProvider,
    server: &str,
    max_tags: usize,
    out: &mut impl Write,
) -> Result<()> {
    let progress = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(std::sync::Mutex::new(Vec::new()));
    let tags = within_timeout(
        "Browse",
        provider.browse_tags(server, max_tags, Arc::clone(&progress), sink),
    )
    .await
    .with_context(|| format!("browsing {server}"))?;
    for tag in &tags {
        writeln!(out, "{tag}")?;
    }
    if tags.len() >= max_tags {
        writeln!(out, "(stopped after {max_tags} tags)")?;
    }
    tracing::debug!(found = progress.load(Ordering::Relaxed), "browse finished");
    Ok(())
}

pub async fn read(
    provider: &dyn OpcProvider,
    server: &str,
    tag_ids: Vec<String>,
    out: &mut impl Write,
) -> Result<()> {
    let rows = within_timeout("Read", provider.read_tag_values(server, tag_ids))
        .await
        .with_context(|| format!("reading from {server}"))?;
    let width = rows.iter().map(|r| r.tag_id.len()).max().unwrap_or(0);
    for row in rows {
        writeln!(
            out,
            "{:<width$}  {:<20}  {:<10}  {}",
            row.tag_id, row.value, row.quality, row.timestamp
        )?;
    }
    Ok(())
}

pub async fn write(
    provider: &dyn OpcProvider,
    server: &str,
    tag_id: &str,
    value: Value,
    out: &mut impl Write,
) -> Result<bool> {
    let result = within_timeout("Write", provider.write_tag_value(server, tag_id, value))
        .await
        .with_context(|| format!("writing {tag_id} on {server}"))?;
    match &result.error {
        None => writeln!(out, "{}: written", result.tag_id)?,
        Some(error) => writeln!(out, "{}: write failed: {error}", result.tag_id)?,
    }
    Ok(result.success)
}

/// Parses a value from the command line. With an explicit type the text
/// must convert to it; otherwise the type is guessed.
pub fn parse_value(text: &str, var_type: Option<&str>) -> Result<Value> {
    let Some(name) = var_type else {
        let value = Value::infer(text);
        tracing::debug!(input = %text, parsed = ?value, "parse_value: detected type");
        return Ok(value);
    };
    let vt: VarType = name.parse().map_err(|e: String| anyhow!(e))?;
    Value::parse_as(text, vt).map_err(|e| anyhow!("cannot parse '{text}' as {name}: {e}"))
}

fn display_host(host: &str) -> &str {
    if host.is_empty() { "localhost" } else { host }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;
    use opc_da_client::{MockOpcProvider, TagValue, WriteResult};

    fn text(buffer: Vec<u8>) -> String {
        String::from_utf8(buffer).unwrap()
    }

    #[tokio::test]
    async fn test_servers_lists_each_prog_id() {
        let mut mock = MockOpcProvider::new();
        mock.expect_list_servers()
            .with(eq("plc-host"))
            .returning(|_| Ok(vec!["Vendor.A.1".into(), "Vendor.B.1".into()]));
        let mut out = Vec::new();
        servers(&mock, "plc-host", &mut out).await.unwrap();
        assert_eq!(text(out), "Vendor.A.1\nVendor.B.1\n");
    }

    #[tokio::test]
    async fn test_servers_empty_names_the_host() {
        let mut mock = MockOpcProvider::new();
        mock.expect_list_servers().returning(|_| Ok(vec![]));
        let mut out = Vec::new();
        servers(&mock, "", &mut out).await.unwrap();
        assert!(text(out).contains("localhost"));
    }

    #[tokio::test]
    async fn test_browse_notes_truncation() {
        let mut mock = MockOpcProvider::new();
        mock.expect_browse_tags()
            .with(eq("S1"), eq(2), always(), always())
            .returning(|_, _, _, _| Ok(vec!["T1".into(), "T2".into()]));
        let mut out = Vec::new();
        browse(&mock, "S1", 2, &mut out).await.unwrap();
        let output = text(out);
        assert!(output.starts_with("T1\nT2\n"));
        assert!(output.contains("stopped after 2"));
    }

    #[tokio::test]
    async fn test_read_prints_rows() {
        let mut mock = MockOpcProvider::new();
        mock.expect_read_tag_values().returning(|_, tags| {
            Ok(tags
                .into_iter()
                .map(|tag_id| TagValue {
                    tag_id,
                    value: "42".into(),
                    quality: "Good".into(),
                    timestamp: "N/A".into(),
                })
                .collect())
        });
        let mut out = Vec::new();
        read(&mock, "S1", vec!["X.Y".into()], &mut out).await.unwrap();
        let output = text(out);
        assert!(output.starts_with("X.Y"));
        assert!(output.contains("42"));
        assert!(output.contains("Good"));
    }

    #[tokio::test]
    async fn test_read_error_carries_context() {
        let mut mock = MockOpcProvider::new();
        mock.expect_read_tag_values()
            .returning(|_, _| Err(anyhow!("RPC server unavailable")));
        let mut out = Vec::new();
        let err = read(&mock, "S1", vec!["X.Y".into()], &mut out).await.unwrap_err();
        assert!(format!("{err:#}").contains("reading from S1"));
    }

    #[tokio::test]
    async fn test_write_reports_rejection() {
        let mut mock = MockOpcProvider::new();
        mock.expect_write_tag_value()
            .with(eq("S1"), eq("X.Y"), eq(Value::I32(5)))
            .returning(|_, tag, _| {
                Ok(WriteResult {
                    tag_id: tag.to_string(),
                    success: false,
                    error: Some("0xC0040006".into()),
                })
            });
        let mut out = Vec::new();
        let ok = write(&mock, "S1", "X.Y", Value::I32(5), &mut out).await.unwrap();
        assert!(!ok);
        assert!(text(out).contains("write failed: 0xC0040006"));
    }

    #[test]
    fn test_parse_value_with_and_without_type() {
        assert_eq!(parse_value("42", Some("i2")).unwrap(), Value::I16(42));
        assert_eq!(parse_value("true", Some("bool")).unwrap(), Value::Bool(true));
        assert!(parse_value("abc", Some("i4")).is_err());
        assert!(parse_value("1", Some("nonsense")).is_err());
        assert_eq!(parse_value("hello", None).unwrap(), Value::String("hello".into()));
    }
}
