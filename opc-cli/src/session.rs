//! Commands that hold a server connection on the calling thread: status,
//! subscriptions and asynchronous I/O.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use opc_da_client::variant::Value;
use opc_da_client::{
    DataChangeEvent, ItemHandle, ItemUpdate, OpcGroup, OpcServer, item_error_to_string,
    timestamp_to_string,
};
use tokio::sync::mpsc;

use crate::commands::OPC_TIMEOUT_SECS;

const SUBSCRIBE_GROUP: &str = "opc-cli-subscribe";
const ASYNC_GROUP: &str = "opc-cli-async";
const TRANSACTION_ID: u32 = 1;

/// A group removed from the server when dropped.
pub struct TempGroup<'a> {
    server: &'a OpcServer,
    pub group: OpcGroup,
}

impl<'a> TempGroup<'a> {
    pub fn add(server: &'a OpcServer, name: &str) -> Result<Self> {
        let group = server
            .groups()
            .add(name)
            .with_context(|| format!("adding group '{name}'"))?;
        Ok(Self { server, group })
    }

    /// Adds `tag_ids` and returns the accepted ones with their handles.
    /// Rejected tags are reported to `out`.
    pub fn add_items(&self, tag_ids: &[String], out: &mut impl Write) -> Result<Vec<(String, ItemHandle)>> {
        let mut accepted = Vec::new();
        for (tag_id, outcome) in tag_ids.iter().zip(self.group.items().add_items(tag_ids)?) {
            match outcome {
                Ok(item) => accepted.push((tag_id.clone(), item.server_handle)),
                Err(e) => {
                    tracing::warn!(tag = %tag_id, code = %e.code(), "tag rejected");
                    writeln!(out, "{tag_id}: rejected: {}", item_error_to_string(&e))?;
                }
            }
        }
        Ok(accepted)
    }
}

impl Drop for TempGroup<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.server.groups().remove(self.group.server_handle()) {
            tracing::warn!(group = %self.group.name(), error = ?e, "Failed to remove OPC group during cleanup");
        }
    }
}

pub fn status(server: &OpcServer, out: &mut impl Write) -> Result<()> {
    let status = server.status().context("reading server status")?;
    writeln!(out, "Server:       {}", server.prog_id())?;
    writeln!(out, "Vendor:       {}", status.vendor_info)?;
    writeln!(out, "Version:      {}", status.version())?;
    writeln!(out, "State:        {:?}", status.server_state)?;
    writeln!(out, "Groups:       {}", status.group_count)?;
    writeln!(out, "Started:      {}", timestamp_to_string(status.start_time))?;
    writeln!(out, "Current time: {}", timestamp_to_string(status.current_time))?;
    writeln!(out, "Last update:  {}", timestamp_to_string(status.last_update_time))?;
    Ok(())
}

/// One line per item update: id, value, quality and timestamp, or the
/// failure.
pub fn format_update(update: &ItemUpdate) -> String {
    let item_id = update
        .item_id
        .clone()
        .unwrap_or_else(|| format!("<handle {}>", update.client_handle));
    match &update.result {
        Ok(value) => format!(
            "{item_id}  {}  {}  {}",
            value.value,
            value.quality,
            timestamp_to_string(value.timestamp)
        ),
        Err(e) => format!("{item_id}  error: {}", item_error_to_string(e)),
    }
}

/// When [`print_updates`] stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopAfter {
    pub events: Option<usize>,
    pub duration: Option<Duration>,
}

/// A live data change subscription on a temporary group.
pub struct Subscription<'a> {
    pub temp: TempGroup<'a>,
    pub rx: mpsc::Receiver<DataChangeEvent>,
}

pub fn subscribe<'a>(server: &'a OpcServer, tag_ids: &[String], out: &mut impl Write) -> Result<Subscription<'a>> {
    let temp = TempGroup::add(server, SUBSCRIBE_GROUP)?;
    if temp.add_items(tag_ids, out)?.is_empty() {
        bail!("none of the tags could be added");
    }
    let rx = temp.group.subscribe_data_change()?;
    let rate = temp.group.update_rate()?;
    tracing::info!(tags = tag_ids.len(), rate, "subscribed");
    Ok(Subscription { temp, rx })
}

/// Prints data changes until `stop` is reached, Ctrl-C is pressed or the
/// subscription closes.
///
/// # Returns
/// The number of data change events received
pub async fn print_updates(subscription: &mut Subscription<'_>, stop: StopAfter, out: &mut impl Write) -> Result<usize> {
    let deadline = stop.duration.map(|d| tokio::time::Instant::now() + d);
    let mut received = 0usize;
    loop {
        if stop.events.is_some_and(|limit| received >= limit) {
            break;
        }
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            event = subscription.rx.recv() => {
                let Some(event) = event else { break };
                received += 1;
                for update in &event.items {
                    writeln!(out, "{}", format_update(update))?;
                }
            }
            () = sleep => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    let drops = subscription.temp.group.drop_counters();
    if drops.intake > 0 || drops.subscriber > 0 {
        writeln!(out, "dropped: {} at intake, {} at subscribers", drops.intake, drops.subscriber)?;
    }
    Ok(received)
}

async fn next_matching<T>(
    rx: &mut mpsc::Receiver<T>,
    transaction_id: impl Fn(&T) -> u32,
) -> Result<T> {
    let wait = async {
        while let Some(event) = rx.recv().await {
            if transaction_id(&event) == TRANSACTION_ID {
                return Some(event);
            }
        }
        None
    };
    match tokio::time::timeout(Duration::from_secs(OPC_TIMEOUT_SECS), wait).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("the group closed before the completion arrived"),
        Err(_) => bail!("no completion within {OPC_TIMEOUT_SECS}s"),
    }
}

pub async fn async_read(server: &OpcServer, tag_ids: &[String], out: &mut impl Write) -> Result<()> {
    let temp = TempGroup::add(server, ASYNC_GROUP)?;
    let accepted = temp.add_items(tag_ids, out)?;
    if accepted.is_empty() {
        return Ok(());
    }
    let mut rx = temp.group.subscribe_read_complete()?;
    let handles: Vec<ItemHandle> = accepted.iter().map(|(_, h)| *h).collect();
    let request = temp.group.async_read(&handles, TRANSACTION_ID)?;

    let mut pending = 0usize;
    for ((tag_id, _), outcome) in accepted.iter().zip(&request.items) {
        match outcome {
            Ok(()) => pending += 1,
            Err(e) => writeln!(out, "{tag_id}  error: {}", item_error_to_string(e))?,
        }
    }
    if pending == 0 {
        return Ok(());
    }
    let event = next_matching(&mut rx, |e| e.transaction_id).await?;
    for update in &event.items {
        writeln!(out, "{}", format_update(update))?;
    }
    Ok(())
}

pub async fn async_write(server: &OpcServer, tag_id: &str, value: Value, out: &mut impl Write) -> Result<bool> {
    let temp = TempGroup::add(server, ASYNC_GROUP)?;
    let accepted = temp.add_items(&[tag_id.to_string()], out)?;
    let Some((_, handle)) = accepted.first() else {
        return Ok(false);
    };
    let mut rx = temp.group.subscribe_write_complete()?;
    let request = temp.group.async_write(&[*handle], &[value], TRANSACTION_ID)?;
    if let Some(Err(e)) = request.items.first() {
        writeln!(out, "{tag_id}: write failed: {}", item_error_to_string(e))?;
        return Ok(false);
    }
    let event = next_matching(&mut rx, |e| e.transaction_id).await?;
    let mut success = true;
    for outcome in &event.items {
        match &outcome.result {
            Ok(()) => writeln!(out, "{tag_id}: written")?,
            Err(e) => {
                success = false;
                writeln!(out, "{tag_id}: write failed: {}", item_error_to_string(e))?;
            }
        }
    }
    Ok(success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opc_da_client::ClientConfig;
    use opc_da_client::sim::SimServer;

    fn text(buffer: Vec<u8>) -> String {
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_status_names_the_vendor() {
        let sim = SimServer::new();
        let server = sim.connect(ClientConfig::default()).unwrap();
        let mut out = Vec::new();
        status(&server, &mut out).unwrap();
        assert!(text(out).contains("opc-da-client simulator"));
    }

    #[test]
    fn test_temp_group_is_removed_on_drop() {
        let sim = SimServer::new();
        let server = sim.connect(ClientConfig::default()).unwrap();
        {
            let temp = TempGroup::add(&server, "scratch").unwrap();
            let mut out = Vec::new();
            let accepted = temp
                .add_items(&["X.Y".to_string(), "Missing".to_string()], &mut out)
                .unwrap();
            assert_eq!(accepted.len(), 1);
            assert!(text(out).starts_with("Missing: rejected"));
            assert_eq!(sim.group_count(), 1);
        }
        assert_eq!(sim.group_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_prints_published_values() {
        let sim = SimServer::new();
        let server = sim.connect(ClientConfig::default()).unwrap();
        let mut out = Vec::new();
        let mut subscription = subscribe(&server, &["X.Y".to_string()], &mut out).unwrap();
        sim.set_tag("X.Y", Value::I32(7));
        assert_eq!(sim.publish_updates(), 1);

        let stop = StopAfter {
            events: Some(1),
            duration: Some(Duration::from_secs(5)),
        };
        let received = print_updates(&mut subscription, stop, &mut out).await.unwrap();
        assert_eq!(received, 1);
        assert!(text(out).starts_with("X.Y  7  Good"));
    }

    #[tokio::test]
    async fn test_async_read_and_write() {
        let sim = SimServer::new();
        let server = sim.connect(ClientConfig::default()).unwrap();

        let mut out = Vec::new();
        assert!(async_write(&server, "X.Y", Value::I32(99), &mut out).await.unwrap());
        assert_eq!(sim.tag("X.Y"), Some(Value::I32(99)));

        let mut out = Vec::new();
        async_read(&server, &["X.Y".to_string()], &mut out).await.unwrap();
        assert!(text(out).starts_with("X.Y  99  Good"));
        assert_eq!(sim.group_count(), 0);
    }

    #[tokio::test]
    async fn test_async_write_to_read_only_tag_fails() {
        let sim = SimServer::new();
        let server = sim.connect(ClientConfig::default()).unwrap();
        let mut out = Vec::new();
        let ok = async_write(&server, "Simulation.Ramp", Value::F64(1.0), &mut out)
            .await
            .unwrap();
        assert!(!ok);
        assert!(text(out).contains("write failed"));
    }
}
