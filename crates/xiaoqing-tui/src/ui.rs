use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
};
use crate::app::{App, ToastLevel};

/// Parse one line of an assistant reply into styled spans.
///
/// Handles `#` headings, `**bold**`, `` `code` `` and `$math$`. Unclosed
/// markers are kept as literal text.
fn parse_markdown_line(text: &str) -> Line<'static> {
    if let Some(heading) = heading_text(text) {
        return Line::from(Span::styled(
            heading.to_string(),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ));
    }

    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut chars = text.chars().peekable();
    let mut current_text = String::new();

    while let Some(c) = chars.next() {
        let (close, style, is_math) = match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                ("**", Style::default().add_modifier(Modifier::BOLD), false)
            }
            '`' => ("`", Style::default().fg(Color::Green), false),
            '$' => ("$", Style::default().fg(Color::Magenta).add_modifier(Modifier::ITALIC), true),
            _ => {
                current_text.push(c);
                continue;
            }
        };

        // Find the closing marker
        let mut inner = String::new();
        let mut found_close = false;
        while let Some(c) = chars.next() {
            if close == "**" && c == '*' && chars.peek() == Some(&'*') {
                chars.next();
                found_close = true;
                break;
            }
            if close != "**" && close.starts_with(c) {
                found_close = true;
                break;
            }
            inner.push(c);
        }

        if found_close && !inner.is_empty() {
            if !current_text.is_empty() {
                spans.push(Span::raw(std::mem::take(&mut current_text)));
            }
            let inner = if is_math { render_math(&inner) } else { inner };
            spans.push(Span::styled(inner, style));
        } else {
            // No closing marker, treat as literal
            current_text.push_str(close);
            current_text.push_str(&inner);
            if found_close {
                current_text.push_str(close);
            }
        }
    }

    // Push any remaining text
    if !current_text.is_empty() {
        spans.push(Span::raw(current_text));
    }

    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

/// `## Title` -> `Title`
fn heading_text(line: &str) -> Option<&str> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    let title = rest.strip_prefix(' ').or_else(|| rest.strip_prefix('\t'))?;
    let title = title.trim();
    (!title.is_empty()).then_some(title)
}

/// Plain-text rendition of a small TeX subset.
fn render_math(tex: &str) -> String {
    let mut out = tex.to_string();
    while let Some(start) = out.find("\\frac{") {
        let Some((num, after_num)) = braced(&out[start + 6..]) else { break };
        let Some((den, rest)) = after_num.strip_prefix('{').and_then(braced) else { break };
        let replaced = format!("({num})/({den})");
        let consumed = out.len() - rest.len();
        out.replace_range(start..consumed, &replaced);
    }
    for (tex, plain) in [
        ("\\times", "×"),
        ("\\cdot", "·"),
        ("\\div", "÷"),
        ("\\pm", "±"),
        ("\\leq", "≤"),
        ("\\geq", "≥"),
        ("\\neq", "≠"),
        ("\\sqrt", "√"),
        ("\\pi", "π"),
    ] {
        out = out.replace(tex, plain);
    }
    out
}

/// Splits `body}rest` at the matching close brace.
fn braced(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some((&s[..i], &s[i + 1..])),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, transcript, input, footer
    let [header_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_transcript(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let phone = app.controller.session().user_phone();
    let account = if phone.is_empty() {
        " not logged in".to_string()
    } else {
        format!(" {}", phone)
    };

    let title = Line::from(vec![
        Span::styled(" Xiaoqing ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(account, Style::default().fg(Color::White)),
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_transcript(app: &mut App, frame: &mut Frame, area: Rect) {
    // Store dimensions for scroll calculations (inner size minus borders)
    let resized = app.chat_area != Some(area);
    app.chat_area = Some(area);
    app.chat_height = area.height.saturating_sub(2);
    app.chat_width = area.width.saturating_sub(2);
    if resized && app.follow_tail {
        app.scroll_to_bottom();
    }

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(" Chat ");

    let mut lines: Vec<Line> = Vec::new();
    for message in app.messages() {
        let (label, color) = if message.is_sent {
            ("You", Color::Cyan)
        } else {
            ("Xiaoqing", Color::Yellow)
        };
        lines.push(Line::from(vec![
            Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
            Span::styled(format!("  {}", message.timestamp), Style::default().fg(Color::DarkGray)),
        ]));

        if message.is_typing_placeholder() {
            // Animated ellipsis: cycles through ".", "..", "..."
            let dots = ".".repeat(app.animation_frame as usize + 1);
            lines.push(Line::from(Span::styled(
                format!("Typing{}", dots),
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
            )));
        } else if message.is_sent {
            for line in message.text.lines() {
                lines.push(Line::from(line.to_string()));
            }
        } else {
            for line in message.text.lines() {
                lines.push(parse_markdown_line(line));
            }
        }
        lines.push(Line::default());
    }

    let chat = Paragraph::new(Text::from(lines))
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((app.scroll, 0));

    frame.render_widget(chat, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let border_color = if app.is_waiting() { Color::DarkGray } else { Color::Yellow };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(" Message ");

    // Horizontal scroll keeps the cursor inside the box
    let inner_width = area.width.saturating_sub(2) as usize;
    let scroll_offset = if inner_width > 0 && app.cursor >= inner_width {
        app.cursor - inner_width + 1
    } else {
        0
    };

    let visible_text: String = app
        .input
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(Color::Cyan))
        .block(block);
    frame.render_widget(input, area);

    let cursor_x = (app.cursor - scroll_offset) as u16;
    frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    if let Some(toast) = &app.toast {
        let style = match toast.level {
            ToastLevel::Info => Style::default().bg(Color::Blue).fg(Color::White),
            ToastLevel::Error => Style::default().bg(Color::Red).fg(Color::White),
        };
        let footer = Paragraph::new(Line::from(Span::styled(format!(" {} ", toast.message), style)));
        frame.render_widget(footer, area);
        return;
    }

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let mut hints = vec![
        Span::styled(" CHAT ", Style::default().bg(Color::Blue).fg(Color::White)),
        Span::raw(" "),
        Span::styled(" Enter ", key_style),
        Span::styled(" send ", label_style),
        Span::styled(" ↑/↓ ", key_style),
        Span::styled(" scroll ", label_style),
        Span::styled(" Ctrl-L ", key_style),
        Span::styled(" clear ", label_style),
        Span::styled(" Esc ", key_style),
        Span::styled(" quit ", label_style),
    ];
    if app.is_waiting() {
        hints.push(Span::styled(" replying… ", Style::default().fg(Color::Yellow)));
    }

    frame.render_widget(Paragraph::new(Line::from(hints)), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plain(line: &Line) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    #[test]
    fn test_bold_span() {
        let line = parse_markdown_line("a **b** c");
        assert_eq!(line.spans.len(), 3);
        assert_eq!(line.spans[1].content, "b");
        assert!(line.spans[1].style.add_modifier.contains(Modifier::BOLD));
    }

    #[test]
    fn test_unclosed_markers_stay_literal() {
        assert_eq!(plain(&parse_markdown_line("2 ** 3")), "2 ** 3");
        assert_eq!(plain(&parse_markdown_line("costs $5")), "costs $5");
        assert_eq!(plain(&parse_markdown_line("``")), "``");
    }

    #[test]
    fn test_code_and_math_spans() {
        let line = parse_markdown_line("run `ls` for $\\frac{1}{2} \\times x$");
        assert_eq!(plain(&line), "run ls for (1)/(2) × x");
        assert_eq!(line.spans[1].style.fg, Some(Color::Green));
        assert_eq!(line.spans[3].style.fg, Some(Color::Magenta));
    }

    #[test]
    fn test_headings() {
        let line = parse_markdown_line("## Summary ");
        assert_eq!(plain(&line), "Summary");
        assert!(line.spans[0].style.add_modifier.contains(Modifier::BOLD));
        assert_eq!(plain(&parse_markdown_line("#hashtag")), "#hashtag");
    }

    #[test]
    fn test_nested_fraction() {
        assert_eq!(render_math("\\frac{a+\\frac{1}{b}}{c}"), "(a+(1)/(b))/(c)");
    }
}
