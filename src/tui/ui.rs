//! UI rendering for the TUI

use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Paragraph, Widget},
    Frame,
};

use super::app::App;
use super::compose;
use super::debug_log;
use super::timeline;
use crate::calling::{CallRole, CallState};
use crate::models::ChatStatus;

/// Returns status indicator symbol and color based on connection state
fn connection_indicator(connected: bool) -> (&'static str, Color) {
    if connected {
        ("*", Color::Green)
    } else {
        ("o", Color::Red)
    }
}

/// Main render function
pub fn render(frame: &mut Frame, app: &App) {
    let area = frame.area();

    let [header_area, main_area, typing_area, call_area, compose_area, status_area] =
        Layout::vertical([
            Constraint::Length(1),
            Constraint::Fill(1),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(compose::COMPOSE_HEIGHT),
            Constraint::Length(1),
        ])
        .areas(area);

    render_header(header_area, frame.buffer_mut(), app);

    let timeline_area = if app.debug_log.visible {
        let [timeline_area, log_area] =
            Layout::vertical([Constraint::Fill(1), Constraint::Length(12)]).areas(main_area);
        debug_log::render(log_area, frame.buffer_mut(), &app.debug_log);
        timeline_area
    } else {
        main_area
    };

    let title = if app.view.history_loaded {
        format!("Chat {}", app.view.chat_id)
    } else {
        format!("Chat {} (loading history...)", app.view.chat_id)
    };
    timeline::render(
        timeline_area,
        frame.buffer_mut(),
        &app.view.messages,
        &app.timeline,
        &app.identity.id,
        &title,
    );

    if app.view.typing {
        Paragraph::new(Span::styled(
            " Someone is typing...",
            Style::default()
                .fg(Color::Gray)
                .add_modifier(Modifier::ITALIC),
        ))
        .render(typing_area, frame.buffer_mut());
    }

    render_call(call_area, frame.buffer_mut(), app);

    let placeholder = match app.view.status {
        Some(ChatStatus::Resolved) => "Chat resolved",
        _ => "Type a message...",
    };
    compose::render(compose_area, frame, &app.compose, placeholder);

    render_status(status_area, frame.buffer_mut(), app);
}

fn render_header(area: Rect, buf: &mut Buffer, app: &App) {
    let (symbol, color) = connection_indicator(app.connected);
    let chat_status = match app.view.status {
        Some(status) => status.as_str(),
        None => "...",
    };
    let status_color = match app.view.status {
        Some(ChatStatus::Open) => Color::Green,
        Some(ChatStatus::Resolved) => Color::Yellow,
        None => Color::Gray,
    };

    let left = vec![
        Span::styled(
            " Storefront Chat",
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw("  "),
        Span::styled(chat_status, Style::default().fg(status_color)),
    ];
    let right = format!("{} {}  {} ", symbol, connection_label(app.connected), app.identity.name);
    let left_width: usize = left.iter().map(|s| s.width()).sum();
    let padding = (area.width as usize).saturating_sub(left_width + right.len());

    let mut spans = left;
    spans.push(Span::raw(" ".repeat(padding)));
    spans.push(Span::styled(right, Style::default().fg(color)));

    Paragraph::new(Line::from(spans))
        .style(Style::default().bg(Color::DarkGray))
        .render(area, buf);
}

fn connection_label(connected: bool) -> &'static str {
    if connected {
        "connected"
    } else {
        "reconnecting"
    }
}

/// One-line call summary.
pub fn call_line(app: &App) -> String {
    let view = &app.view;
    if view.call_state == CallState::Idle {
        return " No call".to_string();
    }
    let mut line = format!(" Call: {}", view.call_state.label());
    match (view.call_role, &view.remote_party) {
        (CallRole::Callee, Some(from)) => line.push_str(&format!(" (from {})", from)),
        (CallRole::Caller, _) => line.push_str(" (outgoing)"),
        _ => {}
    }
    if view.remote_tracks > 0 {
        let kinds: Vec<String> = app
            .remote
            .attached()
            .iter()
            .map(|(_, kind)| kind.to_string())
            .collect();
        line.push_str(&format!("  remote: {}", kinds.join(", ")));
    }
    line
}

fn render_call(area: Rect, buf: &mut Buffer, app: &App) {
    let color = match app.view.call_state {
        CallState::Active => Color::Green,
        CallState::Outgoing | CallState::Answering => Color::Yellow,
        CallState::Ending | CallState::Ended => Color::Red,
        CallState::Idle => Color::DarkGray,
    };
    Paragraph::new(Span::styled(call_line(app), Style::default().fg(color)))
        .render(area, buf);
}

fn render_status(area: Rect, buf: &mut Buffer, app: &App) {
    if let Some(ref msg) = app.status_message {
        let line = Line::from(Span::styled(
            format!(" {} ", msg),
            Style::default().fg(Color::Red).bg(Color::DarkGray),
        ));
        Paragraph::new(line)
            .style(Style::default().bg(Color::DarkGray))
            .render(area, buf);
        return;
    }

    let hint = Style::default().fg(Color::Gray);
    let sep = Span::styled(" | ", Style::default().fg(Color::Black));
    let line = Line::from(vec![
        Span::styled(" Enter: send", hint),
        sep.clone(),
        Span::styled("F2: call", hint),
        sep.clone(),
        Span::styled("F3: hang up", hint),
        sep.clone(),
        Span::styled("F4: resolve", hint),
        sep.clone(),
        Span::styled("F12: log", hint),
        sep,
        Span::styled("Esc: quit", hint),
    ]);
    Paragraph::new(line)
        .style(Style::default().bg(Color::DarkGray))
        .render(area, buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationView;
    use crate::models::Identity;
    use crate::tui::log_capture::LogBuffer;

    fn app_with(state: CallState, role: CallRole, party: Option<&str>) -> App {
        let view = ConversationView {
            chat_id: "c1".into(),
            messages: Vec::new(),
            typing: true,
            call_state: state,
            call_role: role,
            remote_party: party.map(str::to_string),
            remote_tracks: 0,
            status: Some(ChatStatus::Open),
            draft: String::new(),
            history_loaded: true,
        };
        App::new(Identity::default(), view, LogBuffer::new())
    }

    #[test]
    fn test_call_line() {
        assert_eq!(call_line(&app_with(CallState::Idle, CallRole::None, None)), " No call");
        assert_eq!(
            call_line(&app_with(CallState::Answering, CallRole::Callee, Some("u2"))),
            " Call: answering (from u2)"
        );
        assert_eq!(
            call_line(&app_with(CallState::Active, CallRole::Caller, None)),
            " Call: in call (outgoing)"
        );
    }

    #[test]
    fn test_full_frame_renders() {
        let backend = ratatui::backend::TestBackend::new(80, 24);
        let mut terminal = ratatui::Terminal::new(backend).unwrap();
        let app = app_with(CallState::Outgoing, CallRole::Caller, None);
        terminal.draw(|frame| render(frame, &app)).unwrap();

        let buf = terminal.backend().buffer();
        let screen: String = (0..24u16)
            .map(|y| (0..80u16).map(|x| buf[(x, y)].symbol()).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(screen.contains("Storefront Chat"));
        assert!(screen.contains("Someone is typing"));
        assert!(screen.contains("Call: calling"));
    }
}
