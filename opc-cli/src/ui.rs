use crate::monitor::Monitor;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Row, Table, Wrap},
};

pub fn render(f: &mut Frame, monitor: &mut Monitor) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(3),
            Constraint::Length(1),
        ])
        .split(f.area());

    render_values(f, monitor, chunks[0]);
    render_status_bar(f, monitor, chunks[1]);
    render_help(f, chunks[2]);
}

fn render_help(f: &mut Frame, area: Rect) {
    let span = Span::styled(
        "↑/↓: Nav | Esc: Quit | q: Quit",
        Style::default().fg(Color::DarkGray),
    );
    f.render_widget(Paragraph::new(span), area);
}

fn quality_style(quality: &str) -> Style {
    if quality.starts_with("Good") {
        Style::default().fg(Color::Green)
    } else if quality.starts_with("Uncertain") {
        Style::default().fg(Color::Yellow)
    } else if quality.starts_with("Bad") {
        Style::default().fg(Color::Red)
    } else {
        Style::default()
    }
}

fn render_values(f: &mut Frame, monitor: &mut Monitor, area: Rect) {
    let header = Row::new(vec!["Tag ID", "Value", "Quality", "Timestamp", "Changes"]).style(
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    );

    let rows: Vec<Row> = monitor
        .rows
        .iter()
        .map(|row| {
            let tv = &row.current;
            Row::new(vec![
                Line::from(tv.tag_id.clone()),
                Line::from(tv.value.clone()),
                Line::styled(tv.quality.clone(), quality_style(&tv.quality)),
                Line::from(tv.timestamp.clone()),
                Line::from(row.changes.to_string()),
            ])
        })
        .collect();

    let widths = [
        Constraint::Percentage(35),
        Constraint::Percentage(20),
        Constraint::Percentage(15),
        Constraint::Percentage(22),
        Constraint::Percentage(8),
    ];

    let title = format!(
        " {} | {} ms | {} updates ",
        monitor.server, monitor.update_rate, monitor.events
    );
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .row_highlight_style(Style::default().bg(Color::Blue).fg(Color::White))
        .highlight_symbol(">> ");

    f.render_stateful_widget(table, area, &mut monitor.table_state);
}

fn render_status_bar(f: &mut Frame, monitor: &Monitor, area: Rect) {
    let mut spans = vec![Span::styled("- ", Style::default().fg(Color::DarkGray))];
    if let Some(message) = monitor.messages.last() {
        spans.push(Span::raw(message.clone()));
    }
    if monitor.drops.intake > 0 || monitor.drops.subscriber > 0 {
        spans.push(Span::styled(
            format!(
                "  (dropped {} at intake, {} at subscribers)",
                monitor.drops.intake, monitor.drops.subscriber
            ),
            Style::default().fg(Color::Red),
        ));
    }

    let paragraph = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title(" Status Log "))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use opc_da_client::DropCounters;
    use ratatui::{Terminal, backend::TestBackend};

    fn screen(monitor: &mut Monitor) -> String {
        let mut terminal = Terminal::new(TestBackend::new(100, 12)).unwrap();
        terminal.draw(|f| render(f, monitor)).unwrap();
        let buffer = terminal.backend().buffer().clone();
        buffer
            .content()
            .chunks(buffer.area.width as usize)
            .map(|line| line.iter().map(|c| c.symbol()).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_render_shows_rows_and_title() {
        let mut monitor = Monitor::new("OpcDa.Simulator.1", 500, &["X.Y".into()]);
        let text = screen(&mut monitor);
        assert!(text.contains("OpcDa.Simulator.1 | 500 ms | 0 updates"));
        assert!(text.contains("X.Y"));
        assert!(text.contains("Subscribed to 1 tags"));
    }

    #[test]
    fn test_render_shows_drops() {
        let mut monitor = Monitor::new("S1", 1000, &[]);
        monitor.drops = DropCounters {
            intake: 3,
            subscriber: 0,
        };
        assert!(screen(&mut monitor).contains("dropped 3 at intake"));
    }

    #[test]
    fn test_quality_colors() {
        assert_eq!(quality_style("Good").fg, Some(Color::Green));
        assert_eq!(quality_style("Bad: 0xC0040007").fg, Some(Color::Red));
        assert_eq!(quality_style("-").fg, None);
    }
}
