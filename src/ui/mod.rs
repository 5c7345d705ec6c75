use chatline::conversation::PartitionState;
use chatline::{Message, MessageBody};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame,
};

use crate::app::{App, InputMode};

pub fn draw(f: &mut Frame<'_>, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title bar
            Constraint::Min(0),    // Main content
            Constraint::Length(3), // Input area
        ])
        .split(f.size());

    draw_title_bar(f, app, chunks[0]);

    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
        .split(chunks[1]);

    draw_timeline(f, app, main_chunks[0]);
    draw_info_panel(f, app, main_chunks[1]);
    draw_input_area(f, app, chunks[2]);
}

fn draw_title_bar(f: &mut Frame, app: &App, area: Rect) {
    let failed = app.failed_partitions();
    let title_style = if failed > 0 {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default().fg(Color::Green)
    };

    let conversation = app
        .conversation()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "no conversation".to_string());
    let title = format!(
        " {} | {} | {} feed(s), {} failed | {} ",
        app.me(),
        conversation,
        app.partitions.len(),
        failed,
        app.backend_label
    );

    let title_paragraph = Paragraph::new(title)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .style(title_style)
                .title(" chatline "),
        )
        .alignment(Alignment::Center);

    f.render_widget(title_paragraph, area);
}

fn message_line<'a>(message: &'a Message, own: bool) -> Line<'a> {
    // Pending messages never reach the timeline, so there is always a time.
    let timestamp = message
        .timestamp
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_default();
    let sender_color = if own { Color::Green } else { Color::Magenta };
    let body = match &message.body {
        MessageBody::Text { text } => Span::raw(text.as_str()),
        attachment => Span::styled(
            attachment.preview(),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::ITALIC),
        ),
    };

    Line::from(vec![
        Span::styled(format!("[{}] ", timestamp), Style::default().fg(Color::Gray)),
        Span::styled(format!("<{}> ", message.sender), Style::default().fg(sender_color)),
        body,
    ])
}

fn draw_timeline(f: &mut Frame, app: &App, area: Rect) {
    let title = match app.conversation() {
        Some(conversation) => format!(" {} ", conversation),
        None => " chatline ".to_string(),
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let mut lines: Vec<Line> = app
        .get_visible_messages(inner.height as usize)
        .iter()
        .map(|message| message_line(message, &message.sender == app.me()))
        .collect();

    if lines.is_empty() {
        let hint = if app.conversation().is_some() {
            "No messages yet. Press i, type, and Enter to send."
        } else {
            "No conversation open. Use /dm <user> or /group <id>, or /help."
        };
        lines.push(Line::from(Span::styled(
            hint,
            Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
        )));
    }

    f.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), inner);
}

fn draw_info_panel(f: &mut Frame<'_>, app: &App, area: Rect) {
    let feeds_height = (app.partitions.len() as u16 + 2).clamp(3, 10);
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Length(feeds_height),
            Constraint::Min(0),
        ])
        .split(area);

    let identity_text = vec![
        Line::from(vec![
            Span::raw("User: "),
            Span::styled(app.me().to_string(), Style::default().fg(Color::Green)),
        ]),
        Line::from(vec![
            Span::raw("Store: "),
            Span::styled(app.backend_label.as_str(), Style::default().fg(Color::Cyan)),
        ]),
    ];
    f.render_widget(
        Paragraph::new(identity_text).block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Identity ")
                .style(Style::default().fg(Color::Blue)),
        ),
        chunks[0],
    );

    let feeds: Vec<ListItem> = app
        .partitions
        .iter()
        .map(|partition| {
            let (label, color) = match partition.state {
                PartitionState::Waiting => ("waiting", Color::Yellow),
                PartitionState::Live => ("live", Color::Green),
                PartitionState::Failed => ("failed", Color::Red),
            };
            ListItem::new(Line::from(vec![
                Span::raw(format!("{} ", partition.key.author)),
                Span::styled(label, Style::default().fg(color)),
                Span::styled(
                    format!(" ({})", partition.messages),
                    Style::default().fg(Color::Gray),
                ),
            ]))
        })
        .collect();
    let feeds = if feeds.is_empty() {
        vec![ListItem::new("none").style(Style::default().fg(Color::Gray))]
    } else {
        feeds
    };
    f.render_widget(
        List::new(feeds).block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Feeds ")
                .style(Style::default().fg(Color::Blue)),
        ),
        chunks[1],
    );

    let status_block = Block::default()
        .borders(Borders::ALL)
        .title(" Status ")
        .style(Style::default().fg(Color::Blue));
    let status_inner = status_block.inner(chunks[2]);
    f.render_widget(status_block, chunks[2]);

    let status_lines: Vec<Line> = app
        .get_visible_status_messages(status_inner.height as usize)
        .iter()
        .map(|line| {
            let color = if line.contains("warning:") {
                Color::Yellow
            } else {
                Color::Gray
            };
            Line::from(Span::styled(line.as_str(), Style::default().fg(color)))
        })
        .collect();
    f.render_widget(
        Paragraph::new(status_lines).wrap(Wrap { trim: true }),
        status_inner,
    );
}

fn draw_input_area(f: &mut Frame, app: &App, area: Rect) {
    let (input_style, mode_indicator) = match app.input_mode {
        InputMode::Normal => (
            Style::default().fg(Color::White),
            "[NORMAL] i=type, q=quit",
        ),
        InputMode::Editing => (
            Style::default().fg(Color::Green),
            "[INPUT] Enter=send, Esc=normal",
        ),
    };

    let input_text = match app.input_mode {
        InputMode::Editing => app.input.as_str(),
        InputMode::Normal => "",
    };

    let input_paragraph = Paragraph::new(input_text).block(
        Block::default()
            .borders(Borders::ALL)
            .title(mode_indicator)
            .style(input_style),
    );
    f.render_widget(input_paragraph, area);

    if app.input_mode == InputMode::Editing {
        f.set_cursor(area.x + app.cursor_position as u16 + 1, area.y + 1);
    }
}
