//! Timeline pane: the conversation's messages, newest at the bottom.

use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Paragraph, Widget, Wrap},
};

use crate::models::{Message, MessageKind};

/// Scroll position, in messages from the bottom.
#[derive(Debug, Default)]
pub struct TimelineState {
    pub scroll: usize,
}

impl TimelineState {
    pub fn scroll_up(&mut self, total: usize) {
        if self.scroll + 1 < total {
            self.scroll += 1;
        }
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(1);
    }
}

/// Header line for a message: sender and time.
fn header(message: &Message, local_user_id: &str) -> Line<'static> {
    let own = message.sender.id() == local_user_id;
    let name = if own {
        "You".to_string()
    } else {
        message
            .sender
            .display_name()
            .unwrap_or_else(|| message.sender.id())
            .to_string()
    };
    let color = if own { Color::Cyan } else { Color::Magenta };
    Line::from(vec![
        Span::styled(
            name,
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!("  {}", message.created_at.format("%Y-%m-%d %H:%M")),
            Style::default().fg(Color::DarkGray),
        ),
    ])
}

fn body(message: &Message) -> Vec<Line<'static>> {
    let mut lines: Vec<Line> = message
        .body()
        .lines()
        .map(|l| Line::from(format!("  {}", l)))
        .collect();
    if message.kind != MessageKind::Text {
        if let Some(url) = &message.url {
            lines.push(Line::from(Span::styled(
                format!("  {}", url),
                Style::default()
                    .fg(Color::Blue)
                    .add_modifier(Modifier::UNDERLINED),
            )));
        }
    }
    lines
}

pub fn render(
    area: Rect,
    buf: &mut Buffer,
    messages: &[Message],
    state: &TimelineState,
    local_user_id: &str,
    title: &str,
) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Span::styled(
            format!(" {} ", title),
            Style::default().fg(Color::White),
        ));
    let inner = block.inner(area);
    block.render(area, buf);

    if messages.is_empty() {
        Paragraph::new(Span::styled(
            "  No messages yet",
            Style::default().fg(Color::DarkGray),
        ))
        .render(inner, buf);
        return;
    }

    // Newest messages that fit, counted from the scroll position.
    let end = messages.len().saturating_sub(state.scroll);
    let height = inner.height as usize;
    let mut lines: Vec<Line> = Vec::new();
    for message in messages[..end].iter().rev() {
        let mut entry = vec![header(message, local_user_id)];
        entry.extend(body(message));
        entry.push(Line::default());
        if !lines.is_empty() && lines.len() + entry.len() > height {
            break;
        }
        entry.extend(lines);
        lines = entry;
    }
    let skip = lines.len().saturating_sub(height);
    Paragraph::new(lines.split_off(skip))
        .wrap(Wrap { trim: false })
        .render(inner, buf);
}
