use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use opc_da_client::{DataChangeEvent, DropCounters, TagValue, tag_value};
use ratatui::Terminal;
use ratatui::widgets::TableState;
use tokio::sync::mpsc::error::TryRecvError;

use crate::session::Subscription;
use crate::ui;

/// Keeps at most this many status messages.
const MAX_MESSAGES: usize = 50;

/// One monitored tag and how often it changed.
#[derive(Debug, Clone)]
pub struct MonitorRow {
    pub current: TagValue,
    pub changes: u64,
}

/// State of the live subscription view.
///
/// Rows keep the order the tags were given on the command line; updates
/// for tags not in the list are appended.
pub struct Monitor {
    pub server: String,
    pub update_rate: u32,
    pub rows: Vec<MonitorRow>,
    pub table_state: TableState,
    pub messages: Vec<String>,
    pub events: u64,
    pub drops: DropCounters,
    pub exiting: bool,
}

impl Monitor {
    pub fn new(server: &str, update_rate: u32, tag_ids: &[String]) -> Self {
        let rows = tag_ids
            .iter()
            .map(|tag_id| MonitorRow {
                current: TagValue {
                    tag_id: tag_id.clone(),
                    value: "-".to_string(),
                    quality: "-".to_string(),
                    timestamp: String::new(),
                },
                changes: 0,
            })
            .collect();
        let mut table_state = TableState::default();
        table_state.select(Some(0));
        Self {
            server: server.to_string(),
            update_rate,
            rows,
            table_state,
            messages: vec![format!("Subscribed to {} tags", tag_ids.len())],
            events: 0,
            drops: DropCounters::default(),
            exiting: false,
        }
    }

    pub fn apply(&mut self, event: &DataChangeEvent) {
        self.events += 1;
        if let Err(e) = &event.master {
            self.add_message(format!("Callback reported {}", e.code()));
        }
        for update in &event.items {
            let Some(item_id) = update.item_id.as_deref() else {
                self.add_message(format!("Update for unknown handle {}", update.client_handle));
                continue;
            };
            let current = tag_value(item_id, update.result.as_ref());
            match self.rows.iter_mut().find(|r| r.current.tag_id == item_id) {
                Some(row) => {
                    row.current = current;
                    row.changes += 1;
                }
                None => self.rows.push(MonitorRow { current, changes: 1 }),
            }
        }
    }

    pub fn add_message(&mut self, message: String) {
        tracing::debug!(%message, "monitor");
        self.messages.push(message);
        if self.messages.len() > MAX_MESSAGES {
            self.messages.remove(0);
        }
    }

    pub fn select_next(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let next = self
            .table_state
            .selected()
            .map_or(0, |i| (i + 1) % self.rows.len());
        self.table_state.select(Some(next));
    }

    pub fn select_prev(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let prev = self
            .table_state
            .selected()
            .map_or(0, |i| if i == 0 { self.rows.len() - 1 } else { i - 1 });
        self.table_state.select(Some(prev));
    }

    pub fn handle_key_event(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        match key.code {
            KeyCode::Down => self.select_next(),
            KeyCode::Up => self.select_prev(),
            KeyCode::Esc | KeyCode::Char('q' | 'Q') => self.exiting = true,
            _ => {}
        }
    }
}

/// Draws the monitor until the user quits or the subscription closes.
pub fn run<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    monitor: &mut Monitor,
    subscription: &mut Subscription<'_>,
) -> io::Result<()> {
    // Clear any leftover events (like the Enter key used to start the app)
    while event::poll(Duration::from_millis(0))? {
        let _ = event::read()?;
    }

    loop {
        loop {
            match subscription.rx.try_recv() {
                Ok(event) => monitor.apply(&event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    monitor.add_message("Subscription closed".to_string());
                    monitor.exiting = true;
                    break;
                }
            }
        }
        monitor.drops = subscription.temp.group.drop_counters();

        terminal.draw(|f| ui::render(f, monitor))?;

        if event::poll(Duration::from_millis(100))?
            && let Event::Key(key) = event::read()?
        {
            monitor.handle_key_event(key);
        }

        if monitor.exiting {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventState, KeyModifiers};
    use opc_da_client::com::StatusCode;
    use opc_da_client::variant::Value;
    use opc_da_client::{GroupHandle, ItemError, ItemHandle, ItemUpdate, ItemValue, Quality};

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::empty(),
            kind: KeyEventKind::Press,
            state: KeyEventState::empty(),
        }
    }

    fn event(items: Vec<ItemUpdate>) -> DataChangeEvent {
        DataChangeEvent {
            transaction_id: 0,
            group: GroupHandle(1),
            master_quality: StatusCode::S_OK,
            master: Ok(()),
            items,
        }
    }

    fn update(item_id: &str, result: Result<ItemValue, ItemError>) -> ItemUpdate {
        ItemUpdate {
            client_handle: ItemHandle(1),
            item_id: Some(item_id.to_string()),
            result,
        }
    }

    fn good(value: Value) -> Result<ItemValue, ItemError> {
        Ok(ItemValue {
            client_handle: ItemHandle(1),
            value,
            quality: Quality::GOOD,
            timestamp: None,
        })
    }

    #[test]
    fn test_apply_updates_rows_in_place() {
        let mut monitor = Monitor::new("S1", 1000, &["A".into(), "B".into()]);
        monitor.apply(&event(vec![update("B", good(Value::I32(5)))]));
        monitor.apply(&event(vec![update("B", good(Value::I32(6)))]));

        assert_eq!(monitor.events, 2);
        assert_eq!(monitor.rows[0].changes, 0);
        assert_eq!(monitor.rows[1].current.value, "6");
        assert_eq!(monitor.rows[1].current.quality, "Good");
        assert_eq!(monitor.rows[1].changes, 2);
    }

    #[test]
    fn test_apply_appends_unlisted_tags_and_errors() {
        let mut monitor = Monitor::new("S1", 1000, &["A".into()]);
        let failure = ItemError::from_code(StatusCode::from_u32(0xC004_0007));
        monitor.apply(&event(vec![update("C", Err(failure))]));
        assert_eq!(monitor.rows.len(), 2);
        assert_eq!(monitor.rows[1].current.value, "Error");
        assert!(monitor.rows[1].current.quality.starts_with("Bad"));
    }

    #[test]
    fn test_navigation_wraps() {
        let mut monitor = Monitor::new("S1", 1000, &["A".into(), "B".into()]);
        monitor.handle_key_event(press(KeyCode::Up));
        assert_eq!(monitor.table_state.selected(), Some(1));
        monitor.handle_key_event(press(KeyCode::Down));
        assert_eq!(monitor.table_state.selected(), Some(0));
    }

    #[test]
    fn test_quit_keys() {
        let mut monitor = Monitor::new("S1", 1000, &[]);
        monitor.handle_key_event(press(KeyCode::Char('x')));
        assert!(!monitor.exiting);
        monitor.handle_key_event(press(KeyCode::Char('q')));
        assert!(monitor.exiting);

        let mut monitor = Monitor::new("S1", 1000, &[]);
        monitor.handle_key_event(press(KeyCode::Esc));
        assert!(monitor.exiting);
    }

    #[test]
    fn test_messages_are_bounded() {
        let mut monitor = Monitor::new("S1", 1000, &[]);
        for i in 0..(MAX_MESSAGES + 10) {
            monitor.add_message(format!("m{i}"));
        }
        assert_eq!(monitor.messages.len(), MAX_MESSAGES);
        assert_eq!(monitor.messages.last().map(String::as_str), Some("m59"));
    }
}
