use crate::attachment::Attachment;
use crate::chat::ChatState;
use crate::client::ChatClient;
use crate::error::ChatError;
use crate::protocol::{ChatMessage, Role};
use crate::stream::{StreamOptions, StreamOutcome, StreamSummary};
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 6;
const PREVIEW_HEIGHT: u16 = 8;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

/// Everything the chat screen needs from the outside.
pub struct ChatScreen {
    pub client: Arc<ChatClient>,
    pub attachment: Arc<Attachment>,
    pub state: ChatState,
    /// Deadline applied to each streamed reply.
    pub reply_timeout: Duration,
}

/// A block of transcript as printed into scrollback.
enum Entry<'a> {
    Message(&'a ChatMessage),
    Info(String),
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

impl Entry<'_> {
    fn line_specs(&self) -> Vec<LineSpec> {
        match self {
            Entry::Message(message) => {
                let color = match message.role {
                    Role::User => Color::Blue,
                    Role::Assistant if message.content.starts_with("Error: ") => Color::Red,
                    Role::Assistant => Color::Yellow,
                };
                let label = match message.role {
                    Role::User => "You:",
                    Role::Assistant => "Assistant:",
                };
                let mut lines = vec![LineSpec::new(
                    label,
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                )];
                for line in message.content.lines() {
                    lines.push(LineSpec::new(format!("  {}", line), Style::default().fg(color)));
                }
                lines
            }
            Entry::Info(msg) => vec![LineSpec::new(
                format!("ℹ {}", msg),
                Style::default()
                    .fg(Color::Gray)
                    .add_modifier(Modifier::ITALIC),
            )],
        }
    }

    fn to_text(&self) -> Text<'static> {
        let lines = self
            .line_specs()
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>();
        Text::from(lines)
    }

    fn rendered_height(&self, width: u16) -> u16 {
        let lines: Vec<String> = self.line_specs().into_iter().map(|spec| spec.text).collect();
        wrapped_height(lines.iter().map(String::as_str), width)
    }
}

fn wrapped_height<'a>(lines: impl Iterator<Item = &'a str>, width: u16) -> u16 {
    let width = width.max(1) as usize;
    let total: usize = lines
        .map(|line| line.chars().count().max(1).div_ceil(width))
        .sum();
    total.min(u16::MAX as usize) as u16
}

#[derive(Debug)]
enum UiEvent {
    Delta { reply_id: String, text: String },
    Finished { reply_id: String, summary: StreamSummary },
    Failed { reply_id: String, error: ChatError },
}

/// Multi-line input; the cursor column counts characters, not bytes.
struct InputBuffer {
    lines: Vec<String>,
    row: usize,
    col: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            row: 0,
            col: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    fn line_len(&self, row: usize) -> usize {
        self.lines[row].chars().count()
    }

    fn byte_index(&self, row: usize, col: usize) -> usize {
        self.lines[row]
            .char_indices()
            .nth(col)
            .map_or(self.lines[row].len(), |(i, _)| i)
    }

    fn insert_char(&mut self, c: char) {
        let at = self.byte_index(self.row, self.col);
        self.lines[self.row].insert(at, c);
        self.col += 1;
    }

    fn backspace(&mut self) {
        if self.col > 0 {
            let at = self.byte_index(self.row, self.col - 1);
            self.lines[self.row].remove(at);
            self.col -= 1;
        } else if self.row > 0 {
            let tail = self.lines.remove(self.row);
            self.row -= 1;
            self.col = self.line_len(self.row);
            self.lines[self.row].push_str(&tail);
        }
    }

    fn split_line(&mut self) {
        let at = self.byte_index(self.row, self.col);
        let tail = self.lines[self.row].split_off(at);
        self.lines.insert(self.row + 1, tail);
        self.row += 1;
        self.col = 0;
    }

    fn move_left(&mut self) {
        if self.col > 0 {
            self.col -= 1;
        } else if self.row > 0 {
            self.row -= 1;
            self.col = self.line_len(self.row);
        }
    }

    fn move_right(&mut self) {
        if self.col < self.line_len(self.row) {
            self.col += 1;
        } else if self.row + 1 < self.lines.len() {
            self.row += 1;
            self.col = 0;
        }
    }

    fn move_vertical(&mut self, down: bool) {
        let target = if down {
            (self.row + 1).min(self.lines.len() - 1)
        } else {
            self.row.saturating_sub(1)
        };
        self.row = target;
        self.col = self.col.min(self.line_len(target));
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.lines.iter().all(String::is_empty) {
            return Text::from(Span::styled(
                "Ask a question about your data...",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

struct App {
    screen: ChatScreen,
    input: InputBuffer,
    should_quit: bool,
    sender: mpsc::UnboundedSender<UiEvent>,
    receiver: mpsc::UnboundedReceiver<UiEvent>,
    active: Option<CancellationToken>,
}

impl App {
    fn new(screen: ChatScreen) -> Self {
        // Unbounded so the stream's sink never blocks or drops a delta.
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            screen,
            input: InputBuffer::new(),
            should_quit: false,
            sender,
            receiver,
            active: None,
        }
    }

    fn streaming_reply(&self) -> Option<&ChatMessage> {
        if !self.screen.state.is_loading() {
            return None;
        }
        self.screen
            .state
            .messages()
            .last()
            .filter(|m| m.role == Role::Assistant)
    }

    fn draw(&mut self, f: &mut Frame) {
        let [preview_area, input_area] =
            Layout::vertical([Constraint::Min(1), Constraint::Length(INPUT_HEIGHT)])
                .areas(f.area());

        if let Some(reply) = self.streaming_reply() {
            let text = if reply.content.is_empty() {
                "…".to_string()
            } else {
                reply.content.clone()
            };
            let height = wrapped_height(text.lines(), preview_area.width);
            let offset = height.saturating_sub(preview_area.height);
            let preview = Paragraph::new(text)
                .style(Style::default().fg(Color::Yellow))
                .wrap(Wrap { trim: false })
                .scroll((offset, 0));
            f.render_widget(preview, preview_area);
        }

        let file_name = &self.screen.attachment.file_name;
        let title = if self.screen.state.is_loading() {
            format!(" {} (Esc to stop) [Streaming...] ", file_name)
        } else {
            format!(" {} (Enter to send, Esc to quit) ", file_name)
        };

        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });

        f.render_widget(input_paragraph, input_area);

        let x = (input_area.x + 1 + self.input.col as u16).min(input_area.right().saturating_sub(2));
        let y = (input_area.y + 1 + self.input.row as u16).min(input_area.bottom().saturating_sub(2));
        f.set_cursor_position((x, y));
    }

    fn print(&self, terminal: &mut TuiTerminal, entry: Entry<'_>) -> UiResult<()> {
        let width = terminal.size()?.width;
        let height = entry.rendered_height(width).saturating_add(1);
        let mut text = entry.to_text();
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        Ok(())
    }

    fn print_message(&self, terminal: &mut TuiTerminal, id: &str) -> UiResult<()> {
        match self.screen.state.message(id) {
            Some(message) => self.print(terminal, Entry::Message(message)),
            None => Ok(()),
        }
    }

    fn submit(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        let turn = match self.screen.state.begin_turn(&self.input.text()) {
            Ok(turn) => turn,
            Err(err) => return self.print(terminal, Entry::Info(err.to_string())),
        };
        self.input.clear();

        let messages = self.screen.state.messages();
        if let Some(user) = messages.iter().rev().find(|m| m.role == Role::User) {
            let id = user.id.clone();
            self.print_message(terminal, &id)?;
        }

        let cancel = CancellationToken::new();
        self.active = Some(cancel.clone());
        let options = StreamOptions::new()
            .with_cancel(cancel)
            .with_deadline(Instant::now() + self.screen.reply_timeout);

        let client = Arc::clone(&self.screen.client);
        let attachment = Arc::clone(&self.screen.attachment);
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let reply_id = turn.reply_id.clone();
            let result = client
                .send_streaming_message(
                    &turn.session_id,
                    &turn.message,
                    &attachment,
                    &options,
                    |text| {
                        let _ = sender.send(UiEvent::Delta {
                            reply_id: reply_id.clone(),
                            text: text.to_string(),
                        });
                    },
                )
                .await;

            let event = match result {
                Ok(summary) => UiEvent::Finished { reply_id, summary },
                Err(error) => UiEvent::Failed { reply_id, error },
            };
            let _ = sender.send(event);
        });

        Ok(())
    }

    fn apply(&mut self, terminal: &mut TuiTerminal, event: UiEvent) -> UiResult<()> {
        match event {
            UiEvent::Delta { reply_id, text } => {
                self.screen.state.apply_delta(&reply_id, &text);
            }
            UiEvent::Finished { reply_id, summary } => {
                self.screen.state.complete(&reply_id);
                self.active = None;
                self.print_message(terminal, &reply_id)?;
                info!(
                    deltas = summary.deltas,
                    dropped_frames = summary.dropped_frames,
                    "reply settled"
                );
                if summary.outcome == StreamOutcome::Cancelled {
                    self.print(terminal, Entry::Info("Reply stopped".to_string()))?;
                }
            }
            UiEvent::Failed { reply_id, error } => {
                warn!(error = %error, "reply failed");
                self.screen.state.fail(&reply_id, &error);
                self.active = None;
                self.print_message(terminal, &reply_id)?;
            }
        }
        Ok(())
    }

    fn stop_reply(&mut self) {
        if let Some(cancel) = self.active.take() {
            cancel.cancel();
        }
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            self.apply(terminal, event)?;
        }

        if !event::poll(Duration::from_millis(50))? {
            return Ok(true);
        }
        let Event::Key(key) = event::read()? else {
            return Ok(true);
        };

        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.stop_reply();
            self.should_quit = true;
            return Ok(false);
        }

        match key.code {
            KeyCode::Esc if self.screen.state.is_loading() => self.stop_reply(),
            KeyCode::Esc => {
                self.should_quit = true;
                return Ok(false);
            }
            KeyCode::Enter if key.modifiers.contains(KeyModifiers::SHIFT) => {
                self.input.split_line();
            }
            KeyCode::Enter if !self.input.is_blank() => self.submit(terminal)?,
            KeyCode::Char(c) => self.input.insert_char(c),
            KeyCode::Backspace => self.input.backspace(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            KeyCode::Up => self.input.move_vertical(false),
            KeyCode::Down => self.input.move_vertical(true),
            KeyCode::Home => self.input.col = 0,
            KeyCode::End => self.input.col = self.input.line_len(self.input.row),
            _ => {}
        }

        Ok(true)
    }
}

/// Runs the chat screen until the user quits.
pub fn run_tui(screen: ChatScreen) -> UiResult<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(PREVIEW_HEIGHT + INPUT_HEIGHT),
        },
    )?;

    let mut app = App::new(screen);

    let _guard = TerminalGuard::new();

    let history: Vec<String> = app
        .screen
        .state
        .messages()
        .iter()
        .map(|m| m.id.clone())
        .collect();
    for id in &history {
        app.print_message(&mut terminal, id)?;
    }

    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    disable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(text: &str) -> InputBuffer {
        let mut buffer = InputBuffer::new();
        for ch in text.chars() {
            buffer.insert_char(ch);
        }
        buffer
    }

    #[test]
    fn shift_enter_splits_at_cursor() {
        let mut buffer = typed("helloworld");
        for _ in 0..5 {
            buffer.move_left();
        }
        buffer.split_line();

        assert_eq!(buffer.text(), "hello\nworld");
        assert_eq!((buffer.row, buffer.col), (1, 0));
    }

    #[test]
    fn editing_counts_characters_not_bytes() {
        let mut buffer = typed("año");
        buffer.move_left();
        buffer.backspace();
        buffer.insert_char('n');

        assert_eq!(buffer.text(), "ano");
        assert_eq!(buffer.col, 2);
    }

    #[test]
    fn backspace_at_line_start_joins_lines() {
        let mut buffer = typed("ab");
        buffer.split_line();
        buffer.insert_char('c');
        buffer.move_left();
        buffer.backspace();

        assert_eq!(buffer.text(), "abc");
        assert_eq!((buffer.row, buffer.col), (0, 2));
    }

    #[test]
    fn whitespace_only_input_is_blank() {
        assert!(typed("  ").is_blank());
        assert!(!typed(" x ").is_blank());
    }

    #[test]
    fn wrapped_height_counts_wide_lines() {
        assert_eq!(wrapped_height(["abcdef", ""].into_iter(), 4), 3);
        assert_eq!(wrapped_height(["ñññ"].into_iter(), 3), 1);
    }
}
