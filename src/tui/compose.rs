//! Compose box: single-line editor for the draft.

use ratatui::{
    layout::Rect,
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Paragraph},
    Frame,
};
use unicode_width::UnicodeWidthStr;

/// Border plus one input line.
pub const COMPOSE_HEIGHT: u16 = 3;

/// Editor state. `cursor` counts characters, not bytes.
#[derive(Debug, Default)]
pub struct ComposeState {
    pub input: String,
    pub cursor: usize,
    /// Text of a send that has not been confirmed yet.
    awaiting: Option<String>,
}

impl ComposeState {
    pub fn insert_char(&mut self, c: char) {
        let at = self.byte_offset(self.cursor);
        self.input.insert(at, c);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let end = self.byte_offset(self.cursor);
        let start = self.byte_offset(self.cursor - 1);
        self.input.replace_range(start..end, "");
        self.cursor -= 1;
    }

    pub fn delete(&mut self) {
        if self.cursor >= self.input.chars().count() {
            return;
        }
        let start = self.byte_offset(self.cursor);
        let end = self.byte_offset(self.cursor + 1);
        self.input.replace_range(start..end, "");
    }

    pub fn move_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn move_right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.input.chars().count());
    }

    pub fn move_home(&mut self) {
        self.cursor = 0;
    }

    pub fn move_end(&mut self) {
        self.cursor = self.input.chars().count();
    }

    pub fn clear(&mut self) {
        self.input.clear();
        self.cursor = 0;
    }

    pub fn mark_sent(&mut self) {
        self.awaiting = Some(self.input.trim().to_string());
    }

    /// The send failed: keep the text for another try.
    pub fn send_failed(&mut self) {
        self.awaiting = None;
    }

    /// Clear the box once the conversation cleared its draft for the send,
    /// unless the user kept typing in the meantime.
    pub fn on_draft(&mut self, draft: &str) {
        if !draft.is_empty() {
            return;
        }
        if let Some(sent) = self.awaiting.take() {
            if self.input.trim() == sent {
                self.clear();
            }
        }
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.input
            .char_indices()
            .nth(chars)
            .map(|(i, _)| i)
            .unwrap_or(self.input.len())
    }
}

pub fn render(area: Rect, frame: &mut Frame, state: &ComposeState, placeholder: &str) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(Color::Yellow));
    let inner = block.inner(area);
    frame.render_widget(block, area);
    if inner.height == 0 || inner.width < 2 {
        return;
    }

    if state.input.is_empty() {
        let line = Line::from(Span::styled(
            format!(" {}", placeholder),
            Style::default().fg(Color::DarkGray),
        ));
        frame.render_widget(Paragraph::new(line), inner);
        frame.set_cursor_position((inner.x + 1, inner.y));
        return;
    }

    let (visible, cursor_col) = visible_window(&state.input, state.cursor, inner.width as usize - 1);
    frame.render_widget(Paragraph::new(format!(" {}", visible)), inner);
    frame.set_cursor_position((inner.x + 1 + cursor_col as u16, inner.y));
}

/// Slice of `input` that fits `width` columns with the cursor inside it,
/// and the cursor's column within that slice.
fn visible_window(input: &str, cursor: usize, width: usize) -> (String, usize) {
    let chars: Vec<char> = input.chars().collect();
    let mut start = 0;
    while start < cursor && column_of(&chars[start..cursor]) >= width.max(1) {
        start += 1;
    }
    let mut visible = String::new();
    for &c in &chars[start..] {
        visible.push(c);
        if visible.width() > width {
            visible.pop();
            break;
        }
    }
    (visible, column_of(&chars[start..cursor]))
}

fn column_of(chars: &[char]) -> usize {
    chars.iter().collect::<String>().width()
}
