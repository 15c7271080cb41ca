//! Toggleable pane showing captured tracing output.

use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Widget},
};

use super::log_capture::LogBuffer;

/// Scrollback kept by the pane (the capture buffer itself holds less).
const MAX_LINES: usize = 1000;

pub struct DebugLogState {
    buffer: LogBuffer,
    lines: Vec<String>,
    pub visible: bool,
    /// Lines scrolled up from the bottom.
    scroll_offset: usize,
}

impl DebugLogState {
    pub fn new(buffer: LogBuffer) -> Self {
        Self {
            buffer,
            lines: Vec::new(),
            visible: false,
            scroll_offset: 0,
        }
    }

    /// Pull newly captured lines. Call once per frame.
    pub fn refresh(&mut self) {
        self.lines.extend(self.buffer.drain());
        if self.lines.len() > MAX_LINES {
            let excess = self.lines.len() - MAX_LINES;
            self.lines.drain(..excess);
            self.scroll_offset = self.scroll_offset.saturating_sub(excess);
        }
    }

    pub fn toggle(&mut self) {
        self.visible = !self.visible;
        if self.visible {
            self.scroll_offset = 0;
        }
    }

    pub fn scroll_up(&mut self, n: usize) {
        let max = self.lines.len().saturating_sub(1);
        self.scroll_offset = (self.scroll_offset + n).min(max);
    }

    pub fn scroll_down(&mut self, n: usize) {
        self.scroll_offset = self.scroll_offset.saturating_sub(n);
    }
}

pub fn render(area: Rect, buf: &mut Buffer, state: &DebugLogState) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Span::styled(
            " Debug Log (F12) ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ));
    let inner = block.inner(area);
    block.render(area, buf);
    if inner.height == 0 {
        return;
    }

    let end = state.lines.len().saturating_sub(state.scroll_offset);
    let start = end.saturating_sub(inner.height as usize);
    let lines: Vec<Line> = state.lines[start..end]
        .iter()
        .map(|line| Line::from(Span::styled(line.clone(), level_style(line))))
        .collect();
    Paragraph::new(lines).render(inner, buf);
}

/// Colour by the level the fmt layer printed.
fn level_style(line: &str) -> Style {
    let color = if line.contains("ERROR") {
        Color::Red
    } else if line.contains(" WARN") {
        Color::Yellow
    } else if line.contains(" INFO") {
        Color::Green
    } else if line.contains("DEBUG") || line.contains("TRACE") {
        Color::DarkGray
    } else {
        Color::White
    };
    Style::default().fg(color)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> DebugLogState {
        let buffer = LogBuffer::new();
        for i in 0..n {
            buffer.push(format!("line {}", i));
        }
        let mut state = DebugLogState::new(buffer);
        state.refresh();
        state
    }

    #[test]
    fn test_scroll_is_clamped() {
        let mut state = filled(5);
        state.scroll_up(100);
        assert_eq!(state.scroll_offset, 4);
        state.scroll_down(10);
        assert_eq!(state.scroll_offset, 0);
    }

    #[test]
    fn test_toggle_resets_to_bottom() {
        let mut state = filled(20);
        state.toggle();
        state.scroll_up(3);
        state.toggle();
        state.toggle();
        assert!(state.visible);
        assert_eq!(state.scroll_offset, 0);
    }

    #[test]
    fn test_level_colours() {
        assert_eq!(level_style("2024 ERROR boom").fg, Some(Color::Red));
        assert_eq!(level_style("2024  WARN dropped").fg, Some(Color::Yellow));
        assert_eq!(level_style("2024 DEBUG emit").fg, Some(Color::DarkGray));
    }
}
